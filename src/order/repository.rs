use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use super::{Order, OrderFilter, OrderItem, OrderStatus};
use crate::db_utils::{cents_from_db_i64, cents_to_db_i64, json_from_db, quantity_from_db_i64};
use crate::error::PersistenceError;

const ORDER_COLUMNS: &str = "id, order_number, student_id, parent_id, school_id, total_cents, currency, status, delivery_date, delivery_time, special_instructions, metadata, created_at, updated_at";

fn encode_json(column: &'static str, value: &serde_json::Value) -> Result<String, PersistenceError> {
    serde_json::to_string(value).map_err(|source| PersistenceError::JsonEncode { column, source })
}

impl Order {
    fn from_row(row: &SqliteRow) -> Result<Self, PersistenceError> {
        let status: String = row.try_get("status")?;
        let metadata: String = row.try_get("metadata")?;

        Ok(Self {
            id: row.try_get("id")?,
            order_number: row.try_get("order_number")?,
            student_id: row.try_get("student_id")?,
            parent_id: row.try_get("parent_id")?,
            school_id: row.try_get("school_id")?,
            total_cents: cents_from_db_i64(row.try_get("total_cents")?)?,
            currency: row.try_get("currency")?,
            status: status
                .parse()
                .map_err(|_| PersistenceError::InvalidOrderStatus(status))?,
            delivery_date: row.try_get("delivery_date")?,
            delivery_time: row.try_get("delivery_time")?,
            special_instructions: row.try_get("special_instructions")?,
            metadata: json_from_db("metadata", &metadata)?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    pub(crate) async fn insert_within_transaction(
        &self,
        sql_tx: &mut Transaction<'_, Sqlite>,
    ) -> Result<(), PersistenceError> {
        sqlx::query(
            r"
            INSERT INTO orders (
                id, order_number, student_id, parent_id, school_id, total_cents, currency, status,
                delivery_date, delivery_time, special_instructions, metadata, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            ",
        )
        .bind(&self.id)
        .bind(&self.order_number)
        .bind(&self.student_id)
        .bind(&self.parent_id)
        .bind(&self.school_id)
        .bind(cents_to_db_i64(self.total_cents)?)
        .bind(&self.currency)
        .bind(self.status.as_str())
        .bind(self.delivery_date)
        .bind(self.delivery_time)
        .bind(&self.special_instructions)
        .bind(encode_json("metadata", &self.metadata)?)
        .bind(self.created_at)
        .bind(self.updated_at)
        .execute(sql_tx.as_mut())
        .await?;

        Ok(())
    }

    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> Result<Option<Self>, PersistenceError> {
        let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = ?1");
        sqlx::query(&sql)
            .bind(id)
            .fetch_optional(pool)
            .await?
            .as_ref()
            .map(Self::from_row)
            .transpose()
    }

    /// Newest first, paged by the filter's clamped limit.
    pub async fn list(pool: &SqlitePool, filter: &OrderFilter) -> Result<Vec<Self>, PersistenceError> {
        let sql = format!(
            r"
            SELECT {ORDER_COLUMNS} FROM orders
            WHERE (?1 IS NULL OR student_id = ?1)
              AND (?2 IS NULL OR school_id = ?2)
              AND (?3 IS NULL OR status = ?3)
              AND (?4 IS NULL OR delivery_date = ?4)
            ORDER BY created_at DESC, id
            LIMIT ?5 OFFSET ?6
            "
        );

        let rows = sqlx::query(&sql)
            .bind(&filter.student_id)
            .bind(&filter.school_id)
            .bind(filter.status.map(OrderStatus::as_str))
            .bind(filter.delivery_date)
            .bind(i64::from(filter.effective_limit()))
            .bind(i64::from(filter.offset.unwrap_or(0)))
            .fetch_all(pool)
            .await?;

        rows.iter().map(Self::from_row).collect()
    }

    /// Moves the order to `next` only if it is still in `expected`. Returns
    /// false when another writer got there first.
    pub(crate) async fn update_status_within_transaction(
        sql_tx: &mut Transaction<'_, Sqlite>,
        id: &str,
        expected: OrderStatus,
        next: OrderStatus,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, PersistenceError> {
        let result =
            sqlx::query("UPDATE orders SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4")
                .bind(next.as_str())
                .bind(updated_at)
                .bind(id)
                .bind(expected.as_str())
                .execute(sql_tx.as_mut())
                .await?;

        Ok(result.rows_affected() > 0)
    }
}

impl OrderItem {
    fn from_row(row: &SqliteRow) -> Result<Self, PersistenceError> {
        let customizations: Option<String> = row.try_get("customizations")?;

        Ok(Self {
            id: row.try_get("id")?,
            order_id: row.try_get("order_id")?,
            menu_item_id: row.try_get("menu_item_id")?,
            name: row.try_get("name")?,
            quantity: quantity_from_db_i64(row.try_get("quantity")?)?,
            unit_price_cents: cents_from_db_i64(row.try_get("unit_price_cents")?)?,
            total_price_cents: cents_from_db_i64(row.try_get("total_price_cents")?)?,
            special_instructions: row.try_get("special_instructions")?,
            customizations: customizations
                .as_deref()
                .map(|raw| json_from_db("customizations", raw))
                .transpose()?,
        })
    }

    pub(crate) async fn insert_within_transaction(
        &self,
        sql_tx: &mut Transaction<'_, Sqlite>,
    ) -> Result<(), PersistenceError> {
        let customizations = self
            .customizations
            .as_ref()
            .map(|value| encode_json("customizations", value))
            .transpose()?;

        sqlx::query(
            r"
            INSERT INTO order_items (
                id, order_id, menu_item_id, name, quantity, unit_price_cents, total_price_cents,
                special_instructions, customizations
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ",
        )
        .bind(&self.id)
        .bind(&self.order_id)
        .bind(&self.menu_item_id)
        .bind(&self.name)
        .bind(i64::from(self.quantity))
        .bind(cents_to_db_i64(self.unit_price_cents)?)
        .bind(cents_to_db_i64(self.total_price_cents)?)
        .bind(&self.special_instructions)
        .bind(customizations)
        .execute(sql_tx.as_mut())
        .await?;

        Ok(())
    }

    pub async fn find_by_order_id(
        pool: &SqlitePool,
        order_id: &str,
    ) -> Result<Vec<Self>, PersistenceError> {
        let rows = sqlx::query(
            r"
            SELECT id, order_id, menu_item_id, name, quantity, unit_price_cents, total_price_cents,
                   special_instructions, customizations
            FROM order_items WHERE order_id = ?1 ORDER BY rowid
            ",
        )
        .bind(order_id)
        .fetch_all(pool)
        .await?;

        rows.iter().map(Self::from_row).collect()
    }
}
