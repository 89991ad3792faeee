//! Per-student staging area for order lines. A cart lives in the key-value
//! store as one JSON document and is rewritten with compare-and-swap, so
//! concurrent requests for the same student never lose each other's lines.

use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::error::OrderError;
use crate::kv::{DynStore, KvError};
use crate::menu::MenuService;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartLine {
    pub menu_item_id: String,
    pub name: String,
    pub quantity: u32,
    pub unit_price_cents: u64,
    pub special_instructions: Option<String>,
    pub customizations: Option<Value>,
}

impl CartLine {
    pub fn total_cents(&self) -> u64 {
        self.unit_price_cents
            .saturating_mul(u64::from(self.quantity))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cart {
    pub student_id: String,
    pub items: Vec<CartLine>,
    pub total_cents: u64,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Cart {
    pub fn empty(student_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            student_id: student_id.to_string(),
            items: Vec::new(),
            total_cents: 0,
            updated_at: now,
            expires_at: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    fn line_mut(&mut self, menu_item_id: &str) -> Option<&mut CartLine> {
        self.items
            .iter_mut()
            .find(|line| line.menu_item_id == menu_item_id)
    }

    /// Adds `line`, merging into an existing line for the same menu item.
    /// A merge keeps the newest instructions and customizations.
    fn merge(&mut self, line: CartLine, max_quantity: u32) -> Result<(), OrderError> {
        let Some(existing) = self.line_mut(&line.menu_item_id) else {
            self.items.push(line);
            return Ok(());
        };

        let merged = existing.quantity.saturating_add(line.quantity);
        if merged > max_quantity {
            return Err(OrderError::QuantityExceeded {
                menu_item_id: line.menu_item_id,
                requested: merged,
                limit: max_quantity,
            });
        }

        existing.quantity = merged;
        existing.name = line.name;
        existing.unit_price_cents = line.unit_price_cents;
        existing.special_instructions = line.special_instructions;
        existing.customizations = line.customizations;
        Ok(())
    }

    fn set_quantity(&mut self, menu_item_id: &str, quantity: u32) -> Result<(), OrderError> {
        if quantity == 0 {
            return self.remove(menu_item_id);
        }

        let line = self
            .line_mut(menu_item_id)
            .ok_or_else(|| OrderError::CartItemNotFound {
                menu_item_id: menu_item_id.to_string(),
            })?;
        line.quantity = quantity;
        Ok(())
    }

    fn remove(&mut self, menu_item_id: &str) -> Result<(), OrderError> {
        let before = self.items.len();
        self.items.retain(|line| line.menu_item_id != menu_item_id);

        if self.items.len() == before {
            return Err(OrderError::CartItemNotFound {
                menu_item_id: menu_item_id.to_string(),
            });
        }
        Ok(())
    }

    fn refresh(&mut self, now: DateTime<Utc>, ttl: Duration) {
        self.total_cents = self
            .items
            .iter()
            .map(CartLine::total_cents)
            .fold(0, u64::saturating_add);
        self.updated_at = now;
        self.expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddToCart {
    pub menu_item_id: String,
    pub quantity: u32,
    #[serde(default)]
    pub special_instructions: Option<String>,
    #[serde(default)]
    pub customizations: Option<Value>,
}

#[derive(Debug, Clone, Copy)]
pub struct CartConfig {
    pub ttl: Duration,
    pub max_quantity_per_item: u32,
    pub max_update_attempts: usize,
}

impl Default for CartConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60 * 60),
            max_quantity_per_item: 10,
            max_update_attempts: 5,
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum CartWriteError {
    #[error(transparent)]
    Rejected(OrderError),
    #[error("Cart was modified concurrently")]
    Conflict,
    #[error("Key-value store error: {0}")]
    Store(#[from] KvError),
    #[error("Failed to encode cart: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct CartService {
    store: DynStore,
    menu: MenuService,
    config: CartConfig,
}

fn cart_key(student_id: &str) -> String {
    format!("cart:{student_id}")
}

impl CartService {
    pub const fn new(store: DynStore, menu: MenuService, config: CartConfig) -> Self {
        Self {
            store,
            menu,
            config,
        }
    }

    /// The live cart, or `None` when the student has none or it expired.
    pub async fn get_cart(&self, student_id: &str) -> Result<Option<Cart>, OrderError> {
        let raw = self
            .store
            .get(&cart_key(student_id))
            .await
            .map_err(|e| Self::store_failure(student_id, &e))?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        let cart = Self::decode(student_id, &raw, Utc::now());
        if cart.is_none() {
            self.discard_stale(student_id).await;
        }

        Ok(cart)
    }

    /// Lazily removes an expired or unreadable cart. A failure only leaves
    /// the entry for the sweeper.
    async fn discard_stale(&self, student_id: &str) {
        match self.store.delete(&cart_key(student_id)).await {
            Ok(_) => debug!(student_id, "Stale cart removed"),
            Err(e) => warn!(student_id, "Failed to remove stale cart: {e}"),
        }
    }

    pub async fn add_to_cart(&self, student_id: &str, request: AddToCart) -> Result<Cart, OrderError> {
        let limit = self.config.max_quantity_per_item;

        if request.quantity == 0 {
            return Err(OrderError::InvalidQuantity {
                menu_item_id: request.menu_item_id,
            });
        }
        if request.quantity > limit {
            return Err(OrderError::QuantityExceeded {
                menu_item_id: request.menu_item_id,
                requested: request.quantity,
                limit,
            });
        }

        let item = self
            .menu
            .get_item(&request.menu_item_id)
            .await
            .map_err(|e| Self::store_failure(student_id, &e))?
            .filter(|item| item.available)
            .ok_or_else(|| OrderError::ItemUnavailable {
                menu_item_id: request.menu_item_id.clone(),
            })?;

        let line = CartLine {
            menu_item_id: item.id,
            name: item.name,
            quantity: request.quantity,
            unit_price_cents: item.price_cents,
            special_instructions: request.special_instructions,
            customizations: request.customizations,
        };

        self.mutate(student_id, |cart| cart.merge(line.clone(), limit))
            .await
    }

    /// Sets a line's quantity; zero removes the line.
    pub async fn update_cart_item(
        &self,
        student_id: &str,
        menu_item_id: &str,
        quantity: u32,
    ) -> Result<Cart, OrderError> {
        let limit = self.config.max_quantity_per_item;
        if quantity > limit {
            return Err(OrderError::QuantityExceeded {
                menu_item_id: menu_item_id.to_string(),
                requested: quantity,
                limit,
            });
        }

        self.mutate(student_id, |cart| cart.set_quantity(menu_item_id, quantity))
            .await
    }

    pub async fn remove_from_cart(
        &self,
        student_id: &str,
        menu_item_id: &str,
    ) -> Result<Cart, OrderError> {
        self.mutate(student_id, |cart| cart.remove(menu_item_id))
            .await
    }

    pub async fn clear_cart(&self, student_id: &str) -> Result<(), OrderError> {
        self.store
            .delete(&cart_key(student_id))
            .await
            .map_err(|e| Self::store_failure(student_id, &e))?;

        debug!(student_id, "Cart cleared");
        Ok(())
    }

    fn decode(student_id: &str, raw: &str, now: DateTime<Utc>) -> Option<Cart> {
        match serde_json::from_str::<Cart>(raw) {
            Ok(cart) if cart.is_expired(now) => None,
            Ok(cart) => Some(cart),
            Err(e) => {
                warn!(student_id, "Discarding unreadable cart: {e}");
                None
            }
        }
    }

    fn store_failure(student_id: &str, err: &dyn std::fmt::Display) -> OrderError {
        error!(student_id, "Cart storage failed: {err}");
        OrderError::CartUpdateFailed(err.to_string())
    }

    /// Read-modify-write of the student's cart, retried with backoff when
    /// another writer swapped the value in between.
    async fn mutate<F>(&self, student_id: &str, apply: F) -> Result<Cart, OrderError>
    where
        F: Fn(&mut Cart) -> Result<(), OrderError> + Send + Sync,
    {
        let key = cart_key(student_id);

        let attempt = || async {
            let now = Utc::now();
            let current = self.store.get(&key).await?;

            let mut cart = current
                .as_deref()
                .and_then(|raw| Self::decode(student_id, raw, now))
                .unwrap_or_else(|| Cart::empty(student_id, now));

            apply(&mut cart).map_err(CartWriteError::Rejected)?;
            cart.refresh(now, self.config.ttl);

            let encoded = serde_json::to_string(&cart)?;
            let swapped = self
                .store
                .compare_and_swap(&key, current.as_deref(), &encoded, Some(self.config.ttl))
                .await?;

            if swapped {
                Ok(cart)
            } else {
                Err(CartWriteError::Conflict)
            }
        };

        attempt
            .retry(
                ExponentialBuilder::default()
                    .with_min_delay(Duration::from_millis(5))
                    .with_max_delay(Duration::from_millis(200))
                    .with_max_times(self.config.max_update_attempts)
                    .with_jitter(),
            )
            .when(|e| matches!(e, CartWriteError::Conflict))
            .notify(|_, delay| debug!(student_id, ?delay, "Cart write conflict, retrying"))
            .await
            .map_err(|e| match e {
                CartWriteError::Rejected(rejection) => rejection,
                CartWriteError::Conflict => {
                    warn!(student_id, "Giving up on cart update after repeated conflicts");
                    OrderError::CartUpdateFailed(e.to_string())
                }
                other => Self::store_failure(student_id, &other),
            })
    }
}
