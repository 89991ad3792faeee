use chrono::Utc;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::cache::{CacheManager, CacheStats};
use crate::db_utils::{cents_from_db_i64, cents_to_db_i64};
use crate::dietary::normalize_tags;
use crate::error::PersistenceError;

const fn default_available() -> bool {
    true
}

fn default_category() -> String {
    "MAIN".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MenuItem {
    pub id: String,
    pub school_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_category")]
    pub category: String,
    pub price_cents: u64,
    #[serde(default = "default_available")]
    pub available: bool,
    #[serde(default)]
    pub allergens: Vec<String>,
}

const MENU_COLUMNS: &str = "id, school_id, name, description, category, price_cents, available";

fn numbered_placeholders(count: usize, first: usize) -> String {
    (first..first + count).map(|n| format!("?{n}")).join(", ")
}

impl MenuItem {
    fn from_row(row: &SqliteRow, allergens: Vec<String>) -> Result<Self, PersistenceError> {
        Ok(Self {
            id: row.try_get("id")?,
            school_id: row.try_get("school_id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            category: row.try_get("category")?,
            price_cents: cents_from_db_i64(row.try_get("price_cents")?)?,
            available: row.try_get("available")?,
            allergens,
        })
    }

    async fn load_allergens(
        pool: &SqlitePool,
        item_ids: &[String],
    ) -> Result<HashMap<String, Vec<String>>, PersistenceError> {
        if item_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let sql = format!(
            "SELECT menu_item_id, allergen FROM menu_item_allergens WHERE menu_item_id IN ({}) ORDER BY allergen",
            numbered_placeholders(item_ids.len(), 1)
        );
        let rows = item_ids
            .iter()
            .fold(sqlx::query_as::<_, (String, String)>(&sql), |query, id| {
                query.bind(id)
            })
            .fetch_all(pool)
            .await?;

        Ok(rows.into_iter().into_group_map())
    }

    async fn hydrate(pool: &SqlitePool, rows: Vec<SqliteRow>) -> Result<Vec<Self>, PersistenceError> {
        let ids = rows
            .iter()
            .map(|row| row.try_get::<String, _>("id"))
            .collect::<Result<Vec<_>, _>>()?;
        let mut allergens = Self::load_allergens(pool, &ids).await?;

        rows.iter()
            .zip(ids)
            .map(|(row, id)| Self::from_row(row, allergens.remove(&id).unwrap_or_default()))
            .collect()
    }

    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> Result<Option<Self>, PersistenceError> {
        let sql = format!("SELECT {MENU_COLUMNS} FROM menu_items WHERE id = ?1");
        let Some(row) = sqlx::query(&sql).bind(id).fetch_optional(pool).await? else {
            return Ok(None);
        };

        Ok(Self::hydrate(pool, vec![row]).await?.pop())
    }

    /// Available items of `school_id` among `ids`. Ids that are unknown,
    /// belong to another school or are switched off are simply absent.
    pub async fn find_available_for_school(
        pool: &SqlitePool,
        school_id: &str,
        ids: &[String],
    ) -> Result<Vec<Self>, PersistenceError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT {MENU_COLUMNS} FROM menu_items WHERE school_id = ?1 AND available = 1 AND id IN ({})",
            numbered_placeholders(ids.len(), 2)
        );
        let rows = ids
            .iter()
            .fold(sqlx::query(&sql).bind(school_id), |query, id| query.bind(id))
            .fetch_all(pool)
            .await?;

        Self::hydrate(pool, rows).await
    }

    pub async fn list_for_school(
        pool: &SqlitePool,
        school_id: &str,
        available_only: bool,
    ) -> Result<Vec<Self>, PersistenceError> {
        let sql = format!(
            "SELECT {MENU_COLUMNS} FROM menu_items WHERE school_id = ?1 AND (?2 = 0 OR available = 1) ORDER BY category, name"
        );
        let rows = sqlx::query(&sql)
            .bind(school_id)
            .bind(available_only)
            .fetch_all(pool)
            .await?;

        Self::hydrate(pool, rows).await
    }

    pub async fn upsert(&self, pool: &SqlitePool) -> Result<(), PersistenceError> {
        let mut sql_tx = pool.begin().await?;

        sqlx::query(
            r"
            INSERT INTO menu_items (id, school_id, name, description, category, price_cents, available, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(id) DO UPDATE SET
                school_id = excluded.school_id,
                name = excluded.name,
                description = excluded.description,
                category = excluded.category,
                price_cents = excluded.price_cents,
                available = excluded.available,
                updated_at = excluded.updated_at
            ",
        )
        .bind(&self.id)
        .bind(&self.school_id)
        .bind(&self.name)
        .bind(&self.description)
        .bind(&self.category)
        .bind(cents_to_db_i64(self.price_cents)?)
        .bind(self.available)
        .bind(Utc::now())
        .execute(sql_tx.as_mut())
        .await?;

        sqlx::query("DELETE FROM menu_item_allergens WHERE menu_item_id = ?1")
            .bind(&self.id)
            .execute(sql_tx.as_mut())
            .await?;

        for allergen in normalize_tags(&self.allergens) {
            sqlx::query("INSERT INTO menu_item_allergens (menu_item_id, allergen) VALUES (?1, ?2)")
                .bind(&self.id)
                .bind(allergen)
                .execute(sql_tx.as_mut())
                .await?;
        }

        sql_tx.commit().await?;
        Ok(())
    }

    pub async fn set_availability(
        pool: &SqlitePool,
        id: &str,
        available: bool,
    ) -> Result<bool, PersistenceError> {
        let result =
            sqlx::query("UPDATE menu_items SET available = ?1, updated_at = ?2 WHERE id = ?3")
                .bind(available)
                .bind(Utc::now())
                .bind(id)
                .execute(pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }
}

/// Menu reads for the cart go through the cache; writes invalidate it.
/// Cache trouble is logged and never fails the caller, the database stays
/// authoritative.
#[derive(Debug, Clone)]
pub struct MenuService {
    pool: SqlitePool,
    cache: Arc<CacheManager<MenuItem>>,
}

impl MenuService {
    pub fn new(pool: SqlitePool, cache: CacheManager<MenuItem>) -> Self {
        Self {
            pool,
            cache: Arc::new(cache),
        }
    }

    pub async fn get_item(&self, id: &str) -> Result<Option<MenuItem>, PersistenceError> {
        match self.cache.get(id).await {
            Ok(Some(item)) => return Ok(Some(item)),
            Ok(None) => {}
            Err(e) => warn!(menu_item_id = id, "Menu cache read failed: {e}"),
        }

        let item = MenuItem::find_by_id(&self.pool, id).await?;

        if let Some(item) = &item {
            if let Err(e) = self.cache.set(id, item.clone()).await {
                warn!(menu_item_id = id, "Menu cache write failed: {e}");
            }
        }

        Ok(item)
    }

    pub async fn list_for_school(
        &self,
        school_id: &str,
        available_only: bool,
    ) -> Result<Vec<MenuItem>, PersistenceError> {
        MenuItem::list_for_school(&self.pool, school_id, available_only).await
    }

    pub async fn upsert(&self, item: &MenuItem) -> Result<(), PersistenceError> {
        item.upsert(&self.pool).await?;
        self.invalidate(&item.id).await;
        info!(menu_item_id = %item.id, school_id = %item.school_id, "Menu item saved");
        Ok(())
    }

    pub async fn set_availability(&self, id: &str, available: bool) -> Result<bool, PersistenceError> {
        let updated = MenuItem::set_availability(&self.pool, id, available).await?;
        if updated {
            self.invalidate(id).await;
            info!(menu_item_id = id, available, "Menu item availability changed");
        }
        Ok(updated)
    }

    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache
            .stats()
            .inspect_err(|e| warn!("Menu cache stats unavailable: {e}"))
            .ok()
    }

    async fn invalidate(&self, id: &str) {
        if let Err(e) = self.cache.invalidate(id).await {
            warn!(menu_item_id = id, "Menu cache invalidation failed: {e}");
        }
    }
}
