use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Sqlite, SqlitePool, Transaction};

use super::OrderStatus;
use crate::error::PersistenceError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusHistoryEntry {
    pub status: OrderStatus,
    pub message: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl StatusHistoryEntry {
    pub(crate) async fn append_within_transaction(
        sql_tx: &mut Transaction<'_, Sqlite>,
        order_id: &str,
        status: OrderStatus,
        message: Option<&str>,
        recorded_at: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        sqlx::query(
            "INSERT INTO order_status_history (order_id, status, message, recorded_at) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(order_id)
        .bind(status.as_str())
        .bind(message)
        .bind(recorded_at)
        .execute(sql_tx.as_mut())
        .await?;

        Ok(())
    }

    /// Oldest first.
    pub async fn find_by_order_id(
        pool: &SqlitePool,
        order_id: &str,
    ) -> Result<Vec<Self>, PersistenceError> {
        let rows = sqlx::query_as::<_, (String, Option<String>, DateTime<Utc>)>(
            "SELECT status, message, recorded_at FROM order_status_history WHERE order_id = ?1 ORDER BY id",
        )
        .bind(order_id)
        .fetch_all(pool)
        .await?;

        rows.into_iter()
            .map(|(status, message, recorded_at)| {
                Ok(Self {
                    status: status
                        .parse()
                        .map_err(|_| PersistenceError::InvalidOrderStatus(status.clone()))?,
                    message,
                    recorded_at,
                })
            })
            .collect()
    }
}
