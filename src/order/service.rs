use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use itertools::Itertools;
use lunchbox_payments::{DynGateway, MinorUnits};
use serde::Deserialize;
use serde_json::{Value, json};
use sqlx::SqlitePool;
use std::collections::HashMap;
use tracing::{error, info, warn};

use super::{Order, OrderDetails, OrderFilter, OrderItem, OrderStatus, StatusHistoryEntry};
use crate::cart::CartService;
use crate::dietary::find_conflicts;
use crate::error::{OrderError, PersistenceError};
use crate::menu::MenuItem;
use crate::notification::{DynNotifier, Notification, NotificationEvent, dispatch};
use crate::payment::{PaymentOrder, PaymentStatus, PaymentUpdate};
use crate::student::Student;

#[derive(Debug, Clone)]
pub struct OrderPolicy {
    /// Delivery dates and times are wall-clock values in the school's zone.
    pub timezone: Tz,
    /// Orders close this long before the delivery instant.
    pub cutoff: chrono::Duration,
    pub currency: String,
}

impl Default for OrderPolicy {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::Asia::Kolkata,
            cutoff: chrono::Duration::hours(2),
            currency: "INR".to_string(),
        }
    }
}

impl OrderPolicy {
    pub fn delivery_instant(&self, date: NaiveDate, time: NaiveTime) -> Option<DateTime<Utc>> {
        self.timezone
            .from_local_datetime(&date.and_time(time))
            .earliest()
            .map(|local| local.with_timezone(&Utc))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderLineRequest {
    pub menu_item_id: String,
    pub quantity: u32,
    #[serde(default)]
    pub special_instructions: Option<String>,
    #[serde(default)]
    pub customizations: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrder {
    pub student_id: String,
    pub school_id: String,
    pub delivery_date: NaiveDate,
    pub delivery_time: NaiveTime,
    pub items: Vec<OrderLineRequest>,
    #[serde(default)]
    pub special_instructions: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct OrderService {
    pub(super) pool: SqlitePool,
    pub(super) carts: CartService,
    pub(super) gateway: DynGateway,
    pub(super) notifier: DynNotifier,
    pub(super) policy: OrderPolicy,
    pub(super) webhook_secret: String,
}

impl OrderService {
    pub fn new(
        pool: SqlitePool,
        carts: CartService,
        gateway: DynGateway,
        notifier: DynNotifier,
        policy: OrderPolicy,
    ) -> Self {
        Self {
            pool,
            carts,
            gateway,
            notifier,
            policy,
            webhook_secret: String::new(),
        }
    }

    #[must_use]
    pub fn with_webhook_secret(mut self, secret: impl Into<String>) -> Self {
        self.webhook_secret = secret.into();
        self
    }

    pub async fn create_order(&self, request: CreateOrder) -> Result<OrderDetails, OrderError> {
        self.create_order_at(request, Utc::now()).await
    }

    pub(crate) async fn create_order_at(
        &self,
        request: CreateOrder,
        now: DateTime<Utc>,
    ) -> Result<OrderDetails, OrderError> {
        self.check_delivery_window(request.delivery_date, request.delivery_time, now)?;

        if request.items.is_empty() {
            return Err(OrderError::EmptyOrder);
        }
        if let Some(line) = request.items.iter().find(|line| line.quantity == 0) {
            return Err(OrderError::InvalidQuantity {
                menu_item_id: line.menu_item_id.clone(),
            });
        }

        let student = Student::find_by_id(&self.pool, &request.student_id)
            .await
            .map_err(|e| creation_failed("Failed to load student", &e))?
            .filter(|student| student.school_id == request.school_id)
            .ok_or_else(|| OrderError::StudentNotFound {
                student_id: request.student_id.clone(),
            })?;

        let requested_ids = request
            .items
            .iter()
            .map(|line| line.menu_item_id.clone())
            .unique()
            .collect::<Vec<_>>();

        let menu: HashMap<String, MenuItem> =
            MenuItem::find_available_for_school(&self.pool, &request.school_id, &requested_ids)
                .await
                .map_err(|e| creation_failed("Failed to load menu items", &e))?
                .into_iter()
                .map(|item| (item.id.clone(), item))
                .collect();

        let missing = requested_ids
            .iter()
            .filter(|id| !menu.contains_key(*id))
            .cloned()
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(OrderError::ItemsUnavailable { missing });
        }

        let conflicts = find_conflicts(
            &student,
            requested_ids.iter().filter_map(|id| menu.get(id)),
        );
        if !conflicts.is_empty() {
            warn!(
                student_id = %student.id,
                conflicts = ?conflicts,
                "Order rejected for dietary conflicts"
            );
            return Err(OrderError::DietaryRestrictionConflict { conflicts });
        }

        let order_uuid = uuid::Uuid::new_v4();
        let order_id = order_uuid.to_string();

        let items = request
            .items
            .into_iter()
            .filter_map(|line| {
                let item = menu.get(&line.menu_item_id)?;
                Some(OrderItem {
                    id: uuid::Uuid::new_v4().to_string(),
                    order_id: order_id.clone(),
                    menu_item_id: line.menu_item_id,
                    name: item.name.clone(),
                    quantity: line.quantity,
                    unit_price_cents: item.price_cents,
                    total_price_cents: item.price_cents.saturating_mul(u64::from(line.quantity)),
                    special_instructions: line.special_instructions,
                    customizations: line.customizations,
                })
            })
            .collect::<Vec<_>>();

        let order = Order {
            id: order_id,
            order_number: super::order_number(&order_uuid, now),
            student_id: student.id.clone(),
            parent_id: student.parent_id.clone(),
            school_id: request.school_id,
            total_cents: items
                .iter()
                .map(|item| item.total_price_cents)
                .fold(0, u64::saturating_add),
            currency: self.policy.currency.clone(),
            status: OrderStatus::Pending,
            delivery_date: request.delivery_date,
            delivery_time: request.delivery_time,
            special_instructions: request.special_instructions,
            metadata: request.metadata.unwrap_or_else(|| json!({})),
            created_at: now,
            updated_at: now,
        };

        let initial = StatusHistoryEntry {
            status: OrderStatus::Pending,
            message: Some("Order placed".to_string()),
            recorded_at: now,
        };

        self.persist_new_order(&order, &items, &initial)
            .await
            .map_err(|e| creation_failed("Failed to persist order", &e))?;

        info!(
            order_id = %order.id,
            order_number = %order.order_number,
            student_id = %order.student_id,
            total_cents = order.total_cents,
            "Order created"
        );

        if let Err(e) = self.carts.clear_cart(&order.student_id).await {
            warn!(order_id = %order.id, "Order created but cart was not cleared: {e}");
        }

        dispatch(&self.notifier, Notification::order_confirmed(&order));

        Ok(OrderDetails {
            order,
            items,
            status_history: vec![initial],
        })
    }

    fn check_delivery_window(
        &self,
        date: NaiveDate,
        time: NaiveTime,
        now: DateTime<Utc>,
    ) -> Result<(), OrderError> {
        let delivery = self
            .policy
            .delivery_instant(date, time)
            .ok_or(OrderError::InvalidDeliveryDate { delivery: None })?;

        if delivery <= now {
            return Err(OrderError::InvalidDeliveryDate {
                delivery: Some(delivery),
            });
        }

        let cutoff = delivery - self.policy.cutoff;
        if now > cutoff {
            return Err(OrderError::OrderCutoffPassed { delivery, cutoff });
        }

        Ok(())
    }

    async fn persist_new_order(
        &self,
        order: &Order,
        items: &[OrderItem],
        initial: &StatusHistoryEntry,
    ) -> Result<(), PersistenceError> {
        let mut sql_tx = self.pool.begin().await?;

        order.insert_within_transaction(&mut sql_tx).await?;
        for item in items {
            item.insert_within_transaction(&mut sql_tx).await?;
        }
        StatusHistoryEntry::append_within_transaction(
            &mut sql_tx,
            &order.id,
            initial.status,
            initial.message.as_deref(),
            initial.recorded_at,
        )
        .await?;

        sql_tx.commit().await?;
        Ok(())
    }

    pub async fn get_order(&self, order_id: &str) -> Result<OrderDetails, OrderError> {
        let order = self.load(order_id).await?;

        let items = OrderItem::find_by_order_id(&self.pool, order_id)
            .await
            .map_err(|e| update_failed(order_id, "Failed to load order items", &e))?;
        let status_history = StatusHistoryEntry::find_by_order_id(&self.pool, order_id)
            .await
            .map_err(|e| update_failed(order_id, "Failed to load status history", &e))?;

        Ok(OrderDetails {
            order,
            items,
            status_history,
        })
    }

    pub async fn list_orders(&self, filter: &OrderFilter) -> Result<Vec<Order>, OrderError> {
        Order::list(&self.pool, filter).await.map_err(|e| {
            error!(?filter, "Failed to list orders: {e}");
            OrderError::OrderUpdateFailed(e.to_string())
        })
    }

    pub(super) async fn load(&self, order_id: &str) -> Result<Order, OrderError> {
        Order::find_by_id(&self.pool, order_id)
            .await
            .map_err(|e| update_failed(order_id, "Failed to load order", &e))?
            .ok_or_else(|| OrderError::OrderNotFound {
                order_id: order_id.to_string(),
            })
    }

    /// The only way an order's status changes. The write is conditional on
    /// the status read here, so a concurrent transition makes this call fail
    /// instead of being overwritten.
    pub async fn update_order_status(
        &self,
        order_id: &str,
        next: OrderStatus,
        message: Option<&str>,
    ) -> Result<Order, OrderError> {
        let order = self.load(order_id).await?;

        if !order.status.can_transition_to(next) {
            return Err(OrderError::InvalidStatusTransition {
                from: order.status,
                to: next,
            });
        }

        let now = Utc::now();
        let applied = self
            .apply_transition(&order, next, message, now)
            .await
            .map_err(|e| update_failed(order_id, "Failed to update order status", &e))?;

        if !applied {
            let current = self.load(order_id).await?.status;
            warn!(
                order_id,
                expected = %order.status,
                current = %current,
                "Order status changed concurrently"
            );
            return Err(OrderError::InvalidStatusTransition {
                from: current,
                to: next,
            });
        }

        info!(order_id, from = %order.status, to = %next, "Order status updated");

        dispatch(
            &self.notifier,
            Notification::for_order(
                &order,
                NotificationEvent::StatusChanged {
                    from: order.status,
                    to: next,
                    message: message.map(str::to_string),
                },
            ),
        );

        Ok(Order {
            status: next,
            updated_at: now,
            ..order
        })
    }

    async fn apply_transition(
        &self,
        order: &Order,
        next: OrderStatus,
        message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, PersistenceError> {
        let mut sql_tx = self.pool.begin().await?;

        let applied =
            Order::update_status_within_transaction(&mut sql_tx, &order.id, order.status, next, now)
                .await?;
        if !applied {
            return Ok(false);
        }

        StatusHistoryEntry::append_within_transaction(&mut sql_tx, &order.id, next, message, now)
            .await?;

        sql_tx.commit().await?;
        Ok(true)
    }

    /// Cancels an order the kitchen has not finished, then refunds any
    /// captured payment. Refund problems are logged and never block the
    /// cancellation.
    pub async fn cancel_order(&self, order_id: &str, reason: &str) -> Result<Order, OrderError> {
        let order = self.load(order_id).await?;

        if !order.status.is_cancellable() {
            return Err(OrderError::CancellationNotAllowed {
                status: order.status,
            });
        }

        let cancelled = self
            .update_order_status(order_id, OrderStatus::Cancelled, Some(reason))
            .await?;

        self.refund_captured_payments(&cancelled).await;

        Ok(cancelled)
    }

    async fn refund_captured_payments(&self, order: &Order) {
        let payments = match PaymentOrder::find_by_order_id(&self.pool, &order.id).await {
            Ok(payments) => payments,
            Err(e) => {
                warn!(order_id = %order.id, "Could not look up payments to refund: {e}");
                return;
            }
        };

        for payment in payments
            .into_iter()
            .filter(|payment| payment.status == PaymentStatus::Captured)
        {
            if payment.method.bypasses_gateway() {
                warn!(
                    order_id = %order.id,
                    payment_id = %payment.id,
                    amount_cents = payment.amount_cents,
                    "Cash payment must be refunded at the counter"
                );
                continue;
            }

            let Some(gateway_payment_id) = payment.gateway_payment_id.as_deref() else {
                warn!(
                    order_id = %order.id,
                    payment_id = %payment.id,
                    "Captured payment has no gateway payment id, cannot refund"
                );
                continue;
            };

            match self
                .gateway
                .refund_payment(gateway_payment_id, MinorUnits(payment.amount_cents))
                .await
            {
                Ok(refund) => {
                    let update = PaymentUpdate::status(PaymentStatus::Refunded)
                        .with_metadata(json!({ "refundId": refund.refund_id }));

                    match PaymentOrder::record(
                        &self.pool,
                        &payment.id,
                        PaymentStatus::Captured,
                        &update,
                    )
                    .await
                    {
                        Ok(_) => info!(
                            order_id = %order.id,
                            payment_id = %payment.id,
                            refund_id = %refund.refund_id,
                            "Payment refunded"
                        ),
                        Err(e) => warn!(
                            order_id = %order.id,
                            payment_id = %payment.id,
                            "Refund issued but not recorded: {e}"
                        ),
                    }
                }
                Err(e) => warn!(
                    order_id = %order.id,
                    payment_id = %payment.id,
                    "Refund failed, cancellation proceeds: {e}"
                ),
            }
        }
    }
}

fn creation_failed(context: &str, err: &PersistenceError) -> OrderError {
    if err.is_unique_violation() {
        return OrderError::DuplicateOrder;
    }
    error!("{context}: {err}");
    OrderError::OrderCreationFailed(err.to_string())
}

pub(super) fn update_failed(order_id: &str, context: &str, err: &PersistenceError) -> OrderError {
    error!(order_id, "{context}: {err}");
    OrderError::OrderUpdateFailed(err.to_string())
}
