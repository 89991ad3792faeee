//! Error types per layer. Repositories and stores report their own failures;
//! services translate them into [`OrderError`], whose stable codes are what
//! API clients match on.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};

use crate::order::OrderStatus;

/// Database persistence and data corruption errors.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Invalid order status in database: {0}")]
    InvalidOrderStatus(String),
    #[error("Invalid payment status in database: {0}")]
    InvalidPaymentStatus(String),
    #[error("Invalid payment method in database: {0}")]
    InvalidPaymentMethod(String),
    #[error("Invalid dietary tag kind in database: {0}")]
    InvalidTagKind(String),
    #[error("Invalid amount in database: {0}")]
    InvalidAmount(i64),
    #[error("Amount {0} does not fit in a database integer")]
    AmountOverflow(u64),
    #[error("Invalid quantity in database: {0}")]
    InvalidQuantity(i64),
    #[error("Corrupt JSON in column {column}: {source}")]
    CorruptJson {
        column: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("Failed to serialize JSON column {column}: {source}")]
    JsonEncode {
        column: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl PersistenceError {
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Self::Database(sqlx::Error::Database(db_err)) => db_err.is_unique_violation(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DietaryConflict {
    pub menu_item_id: String,
    pub menu_item_name: String,
    pub tags: Vec<String>,
}

/// Errors surfaced by the ordering services. Every variant has a stable
/// machine-readable [`code`](OrderError::code).
#[derive(Debug, thiserror::Error)]
pub enum OrderError {
    #[error("Order {order_id} not found")]
    OrderNotFound { order_id: String },
    #[error("Cannot transition order from {from} to {to}")]
    InvalidStatusTransition { from: OrderStatus, to: OrderStatus },
    #[error("Some menu items are not available")]
    ItemsUnavailable { missing: Vec<String> },
    #[error("Menu item {menu_item_id} is not available")]
    ItemUnavailable { menu_item_id: String },
    #[error("Quantity {requested} for {menu_item_id} exceeds the limit of {limit}")]
    QuantityExceeded {
        menu_item_id: String,
        requested: u32,
        limit: u32,
    },
    #[error("Quantity for {menu_item_id} must be at least 1")]
    InvalidQuantity { menu_item_id: String },
    #[error("Order must contain at least one item")]
    EmptyOrder,
    #[error("Delivery date is in the past or not a valid local time")]
    InvalidDeliveryDate { delivery: Option<DateTime<Utc>> },
    #[error("Orders for delivery at {delivery} closed at {cutoff}")]
    OrderCutoffPassed {
        delivery: DateTime<Utc>,
        cutoff: DateTime<Utc>,
    },
    #[error("Student {student_id} not found")]
    StudentNotFound { student_id: String },
    #[error("Order contains items that conflict with dietary restrictions")]
    DietaryRestrictionConflict { conflicts: Vec<DietaryConflict> },
    #[error("An active order already exists for this delivery slot")]
    DuplicateOrder,
    #[error("Payment failed: {reason}")]
    PaymentFailed { reason: String },
    #[error("No payment order for gateway order {gateway_order_id}")]
    PaymentOrderNotFound { gateway_order_id: String },
    #[error("Invalid webhook signature")]
    InvalidWebhookSignature,
    #[error("Invalid webhook payload: {0}")]
    InvalidWebhookPayload(String),
    #[error("Order in status {status} can no longer be cancelled")]
    CancellationNotAllowed { status: OrderStatus },
    #[error("Menu item {menu_item_id} is not in the cart")]
    CartItemNotFound { menu_item_id: String },
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),
    #[error("Failed to create order: {0}")]
    OrderCreationFailed(String),
    #[error("Failed to update cart: {0}")]
    CartUpdateFailed(String),
    #[error("Failed to update order: {0}")]
    OrderUpdateFailed(String),
}

impl OrderError {
    pub const fn code(&self) -> &'static str {
        match self {
            Self::OrderNotFound { .. } => "ORDER_NOT_FOUND",
            Self::InvalidStatusTransition { .. } => "INVALID_STATUS_TRANSITION",
            Self::ItemsUnavailable { .. } => "ITEMS_UNAVAILABLE",
            Self::ItemUnavailable { .. } => "ITEM_UNAVAILABLE",
            Self::QuantityExceeded { .. } => "QUANTITY_EXCEEDED",
            Self::InvalidQuantity { .. } => "INVALID_QUANTITY",
            Self::EmptyOrder => "EMPTY_ORDER",
            Self::InvalidDeliveryDate { .. } => "INVALID_DELIVERY_DATE",
            Self::OrderCutoffPassed { .. } => "ORDER_CUTOFF_PASSED",
            Self::StudentNotFound { .. } => "STUDENT_NOT_FOUND",
            Self::DietaryRestrictionConflict { .. } => "DIETARY_RESTRICTION_CONFLICT",
            Self::DuplicateOrder => "DUPLICATE_ORDER",
            Self::PaymentFailed { .. } => "PAYMENT_FAILED",
            Self::PaymentOrderNotFound { .. } => "PAYMENT_ORDER_NOT_FOUND",
            Self::InvalidWebhookSignature => "INVALID_WEBHOOK_SIGNATURE",
            Self::InvalidWebhookPayload(_) => "INVALID_WEBHOOK_PAYLOAD",
            Self::CancellationNotAllowed { .. } => "CANCELLATION_NOT_ALLOWED",
            Self::CartItemNotFound { .. } => "CART_ITEM_NOT_FOUND",
            Self::InvalidFilter(_) => "INVALID_FILTER",
            Self::OrderCreationFailed(_) => "ORDER_CREATION_FAILED",
            Self::CartUpdateFailed(_) => "CART_UPDATE_FAILED",
            Self::OrderUpdateFailed(_) => "ORDER_UPDATE_FAILED",
        }
    }

    /// Structured context for API clients, when the variant carries any.
    pub fn details(&self) -> Option<Value> {
        match self {
            Self::OrderNotFound { order_id } => Some(json!({ "orderId": order_id })),
            Self::InvalidStatusTransition { from, to } => Some(json!({
                "from": from,
                "to": to,
                "allowed": from.allowed_transitions(),
            })),
            Self::ItemsUnavailable { missing } => Some(json!({ "missingItemIds": missing })),
            Self::ItemUnavailable { menu_item_id }
            | Self::InvalidQuantity { menu_item_id }
            | Self::CartItemNotFound { menu_item_id } => {
                Some(json!({ "menuItemId": menu_item_id }))
            }
            Self::QuantityExceeded {
                menu_item_id,
                requested,
                limit,
            } => Some(json!({
                "menuItemId": menu_item_id,
                "requested": requested,
                "limit": limit,
            })),
            Self::InvalidDeliveryDate { delivery } => {
                delivery.map(|delivery| json!({ "deliveryAt": delivery }))
            }
            Self::OrderCutoffPassed { delivery, cutoff } => Some(json!({
                "deliveryAt": delivery,
                "cutoffAt": cutoff,
            })),
            Self::StudentNotFound { student_id } => Some(json!({ "studentId": student_id })),
            Self::DietaryRestrictionConflict { conflicts } => {
                Some(json!({ "conflicts": conflicts }))
            }
            Self::PaymentFailed { reason } => Some(json!({ "reason": reason })),
            Self::PaymentOrderNotFound { gateway_order_id } => {
                Some(json!({ "gatewayOrderId": gateway_order_id }))
            }
            Self::CancellationNotAllowed { status } => Some(json!({ "status": status })),
            Self::InvalidWebhookPayload(cause)
            | Self::InvalidFilter(cause)
            | Self::OrderCreationFailed(cause)
            | Self::CartUpdateFailed(cause)
            | Self::OrderUpdateFailed(cause) => Some(json!({ "cause": cause })),
            Self::EmptyOrder | Self::DuplicateOrder | Self::InvalidWebhookSignature => None,
        }
    }
}
