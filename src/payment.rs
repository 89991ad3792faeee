use chrono::{DateTime, Duration, Utc};
use lunchbox_payments::PaymentMethod;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::db_utils::{cents_from_db_i64, cents_to_db_i64, json_from_db};
use crate::error::PersistenceError;

/// How long a gateway order stays payable before the sweeper expires it.
pub const PAYMENT_ORDER_TTL: Duration = Duration::minutes(15);

/// Tracked independently of the order status: a cancelled order can still
/// hold a captured (or refunded) payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Created,
    Captured,
    Failed,
    Refunded,
    Expired,
}

impl PaymentStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Captured => "CAPTURED",
            Self::Failed => "FAILED",
            Self::Refunded => "REFUNDED",
            Self::Expired => "EXPIRED",
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PaymentStatus {
    type Err = PersistenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(Self::Created),
            "CAPTURED" => Ok(Self::Captured),
            "FAILED" => Ok(Self::Failed),
            "REFUNDED" => Ok(Self::Refunded),
            "EXPIRED" => Ok(Self::Expired),
            _ => Err(PersistenceError::InvalidPaymentStatus(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentOrder {
    pub id: String,
    pub order_id: String,
    pub method: PaymentMethod,
    pub amount_cents: u64,
    pub currency: String,
    pub gateway_order_id: Option<String>,
    pub gateway_payment_id: Option<String>,
    pub status: PaymentStatus,
    pub failure_reason: Option<String>,
    pub metadata: Value,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Status change applied by [`PaymentOrder::record`]. Fields left `None`
/// keep their stored value.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentUpdate {
    pub status: PaymentStatus,
    pub gateway_payment_id: Option<String>,
    pub failure_reason: Option<String>,
    pub metadata: Option<Value>,
}

impl PaymentUpdate {
    pub const fn status(status: PaymentStatus) -> Self {
        Self {
            status,
            gateway_payment_id: None,
            failure_reason: None,
            metadata: None,
        }
    }

    #[must_use]
    pub fn with_payment_id(mut self, gateway_payment_id: impl Into<String>) -> Self {
        self.gateway_payment_id = Some(gateway_payment_id.into());
        self
    }

    #[must_use]
    pub fn with_failure_reason(mut self, reason: impl Into<String>) -> Self {
        self.failure_reason = Some(reason.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

const PAYMENT_COLUMNS: &str = "id, order_id, method, amount_cents, currency, gateway_order_id, gateway_payment_id, status, failure_reason, metadata, expires_at, created_at, updated_at";

impl PaymentOrder {
    pub fn new(
        order_id: &str,
        method: PaymentMethod,
        amount_cents: u64,
        currency: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            order_id: order_id.to_string(),
            method,
            amount_cents,
            currency: currency.to_string(),
            gateway_order_id: None,
            gateway_payment_id: None,
            status: PaymentStatus::Created,
            failure_reason: None,
            metadata: Value::Object(serde_json::Map::new()),
            expires_at: now + PAYMENT_ORDER_TTL,
            created_at: now,
            updated_at: now,
        }
    }

    fn from_row(row: &SqliteRow) -> Result<Self, PersistenceError> {
        let method: String = row.try_get("method")?;
        let status: String = row.try_get("status")?;
        let metadata: String = row.try_get("metadata")?;

        Ok(Self {
            id: row.try_get("id")?,
            order_id: row.try_get("order_id")?,
            method: method
                .parse()
                .map_err(|_| PersistenceError::InvalidPaymentMethod(method.clone()))?,
            amount_cents: cents_from_db_i64(row.try_get("amount_cents")?)?,
            currency: row.try_get("currency")?,
            gateway_order_id: row.try_get("gateway_order_id")?,
            gateway_payment_id: row.try_get("gateway_payment_id")?,
            status: status.parse()?,
            failure_reason: row.try_get("failure_reason")?,
            metadata: json_from_db("metadata", &metadata)?,
            expires_at: row.try_get("expires_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    pub async fn insert(&self, pool: &SqlitePool) -> Result<(), PersistenceError> {
        let metadata = serde_json::to_string(&self.metadata).map_err(|source| {
            PersistenceError::JsonEncode {
                column: "metadata",
                source,
            }
        })?;

        sqlx::query(
            r"
            INSERT INTO payment_orders (
                id, order_id, method, amount_cents, currency, gateway_order_id, gateway_payment_id,
                status, failure_reason, metadata, expires_at, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ",
        )
        .bind(&self.id)
        .bind(&self.order_id)
        .bind(self.method.as_str())
        .bind(cents_to_db_i64(self.amount_cents)?)
        .bind(&self.currency)
        .bind(&self.gateway_order_id)
        .bind(&self.gateway_payment_id)
        .bind(self.status.as_str())
        .bind(&self.failure_reason)
        .bind(metadata)
        .bind(self.expires_at)
        .bind(self.created_at)
        .bind(self.updated_at)
        .execute(pool)
        .await?;

        Ok(())
    }

    pub async fn attach_gateway_order(
        pool: &SqlitePool,
        id: &str,
        gateway_order_id: &str,
    ) -> Result<(), PersistenceError> {
        sqlx::query("UPDATE payment_orders SET gateway_order_id = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(gateway_order_id)
            .bind(Utc::now())
            .bind(id)
            .execute(pool)
            .await?;

        Ok(())
    }

    /// Applies `update` only while the payment is still in `expected`, so
    /// concurrent webhook deliveries settle a payment once. Returns whether
    /// the row changed.
    pub async fn record(
        pool: &SqlitePool,
        id: &str,
        expected: PaymentStatus,
        update: &PaymentUpdate,
    ) -> Result<bool, PersistenceError> {
        let metadata = update
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|source| PersistenceError::JsonEncode {
                column: "metadata",
                source,
            })?;

        let result = sqlx::query(
            r"
            UPDATE payment_orders SET
                status = ?1,
                gateway_payment_id = COALESCE(?2, gateway_payment_id),
                failure_reason = COALESCE(?3, failure_reason),
                metadata = COALESCE(?4, metadata),
                updated_at = ?5
            WHERE id = ?6 AND status = ?7
            ",
        )
        .bind(update.status.as_str())
        .bind(&update.gateway_payment_id)
        .bind(&update.failure_reason)
        .bind(metadata)
        .bind(Utc::now())
        .bind(id)
        .bind(expected.as_str())
        .execute(pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> Result<Option<Self>, PersistenceError> {
        let sql = format!("SELECT {PAYMENT_COLUMNS} FROM payment_orders WHERE id = ?1");
        sqlx::query(&sql)
            .bind(id)
            .fetch_optional(pool)
            .await?
            .as_ref()
            .map(Self::from_row)
            .transpose()
    }

    pub async fn find_by_gateway_order_id(
        pool: &SqlitePool,
        gateway_order_id: &str,
    ) -> Result<Option<Self>, PersistenceError> {
        let sql = format!("SELECT {PAYMENT_COLUMNS} FROM payment_orders WHERE gateway_order_id = ?1");
        sqlx::query(&sql)
            .bind(gateway_order_id)
            .fetch_optional(pool)
            .await?
            .as_ref()
            .map(Self::from_row)
            .transpose()
    }

    pub async fn find_by_order_id(
        pool: &SqlitePool,
        order_id: &str,
    ) -> Result<Vec<Self>, PersistenceError> {
        let sql = format!(
            "SELECT {PAYMENT_COLUMNS} FROM payment_orders WHERE order_id = ?1 ORDER BY created_at"
        );
        let rows = sqlx::query(&sql).bind(order_id).fetch_all(pool).await?;
        rows.iter().map(Self::from_row).collect()
    }

    /// Marks CREATED payments whose window has closed as EXPIRED.
    pub async fn expire_stale(pool: &SqlitePool, now: DateTime<Utc>) -> Result<u64, PersistenceError> {
        let result = sqlx::query(
            "UPDATE payment_orders SET status = ?1, updated_at = ?2 WHERE status = ?3 AND expires_at <= ?2",
        )
        .bind(PaymentStatus::Expired.as_str())
        .bind(now)
        .bind(PaymentStatus::Created.as_str())
        .execute(pool)
        .await?;

        Ok(result.rows_affected())
    }
}
