use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

mod history;
mod payment_flow;
mod repository;
mod service;
mod status;

pub use history::StatusHistoryEntry;
pub use payment_flow::{PaymentOutcome, ProcessPayment, WebhookOutcome};
pub use service::{CreateOrder, OrderLineRequest, OrderPolicy, OrderService};
pub use status::{OrderStatus, ParseOrderStatusError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: String,
    pub order_number: String,
    pub student_id: String,
    pub parent_id: Option<String>,
    pub school_id: String,
    pub total_cents: u64,
    pub currency: String,
    pub status: OrderStatus,
    pub delivery_date: NaiveDate,
    pub delivery_time: NaiveTime,
    pub special_instructions: Option<String>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A placed order line. Name and price are copied from the menu at order
/// time so later menu edits never change what was bought.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    pub id: String,
    pub order_id: String,
    pub menu_item_id: String,
    pub name: String,
    pub quantity: u32,
    pub unit_price_cents: u64,
    pub total_price_cents: u64,
    pub special_instructions: Option<String>,
    pub customizations: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderDetails {
    #[serde(flatten)]
    pub order: Order,
    pub items: Vec<OrderItem>,
    pub status_history: Vec<StatusHistoryEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderFilter {
    pub student_id: Option<String>,
    pub school_id: Option<String>,
    pub status: Option<OrderStatus>,
    pub delivery_date: Option<NaiveDate>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl OrderFilter {
    pub const DEFAULT_LIMIT: u32 = 20;
    pub const MAX_LIMIT: u32 = 100;

    pub fn effective_limit(&self) -> u32 {
        self.limit
            .unwrap_or(Self::DEFAULT_LIMIT)
            .clamp(1, Self::MAX_LIMIT)
    }
}

/// `ORD-YYYYMMDD-XXXXXXXX`: creation date plus the first eight hex digits of
/// the order id, upper-cased.
pub(crate) fn order_number(order_id: &uuid::Uuid, created_at: DateTime<Utc>) -> String {
    let suffix = order_id.simple().to_string()[..8].to_uppercase();
    format!("ORD-{}-{suffix}", created_at.format("%Y%m%d"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_order_number_format() {
        let id = uuid::Uuid::parse_str("3f2a9c1e-1111-4222-8333-444455556666").unwrap();
        let created_at = Utc.with_ymd_and_hms(2026, 10, 19, 8, 30, 0).unwrap();

        assert_eq!(order_number(&id, created_at), "ORD-20261019-3F2A9C1E");
    }

    #[test]
    fn test_filter_limit_is_clamped() {
        let mut filter = OrderFilter::default();
        assert_eq!(filter.effective_limit(), 20);

        filter.limit = Some(0);
        assert_eq!(filter.effective_limit(), 1);

        filter.limit = Some(500);
        assert_eq!(filter.effective_limit(), 100);

        filter.limit = Some(35);
        assert_eq!(filter.effective_limit(), 35);
    }
}
