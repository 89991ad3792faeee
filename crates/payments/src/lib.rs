use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display};
use std::sync::Arc;

pub mod dry_run;
pub mod error;
pub mod http;
pub mod status;
pub mod webhook;

pub use dry_run::DryRunGateway;
pub use error::PaymentError;
pub use http::{HttpGateway, PaymentGatewayEnv};
pub use status::GatewayStatus;
pub use webhook::{WebhookEvent, sign_webhook_payload, verify_webhook_signature};

/// Type alias for a dynamic gateway trait object wrapped in Arc
pub type DynGateway = Arc<dyn PaymentGateway>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Card,
    Upi,
    Netbanking,
    Wallet,
    Cash,
}

impl PaymentMethod {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Card => "card",
            Self::Upi => "upi",
            Self::Netbanking => "netbanking",
            Self::Wallet => "wallet",
            Self::Cash => "cash",
        }
    }

    /// Cash is settled at the counter and never reaches the gateway.
    pub const fn bypasses_gateway(self) -> bool {
        matches!(self, Self::Cash)
    }
}

impl Display for PaymentMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid payment method: {0}")]
pub struct InvalidPaymentMethodError(String);

impl std::str::FromStr for PaymentMethod {
    type Err = InvalidPaymentMethodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "card" => Ok(Self::Card),
            "upi" => Ok(Self::Upi),
            "netbanking" => Ok(Self::Netbanking),
            "wallet" => Ok(Self::Wallet),
            "cash" => Ok(Self::Cash),
            _ => Err(InvalidPaymentMethodError(s.to_string())),
        }
    }
}

/// Amount in the currency's minor unit (paise for INR).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MinorUnits(pub u64);

impl Display for MinorUnits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateGatewayOrder {
    pub amount: MinorUnits,
    pub currency: String,
    pub receipt: String,
    pub notes: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayOrder {
    pub gateway_order_id: String,
    pub amount: MinorUnits,
    pub currency: String,
    pub status: GatewayStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayPayment {
    pub gateway_payment_id: String,
    pub gateway_order_id: Option<String>,
    pub amount: MinorUnits,
    pub status: GatewayStatus,
    pub method: Option<String>,
    pub error_description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayRefund {
    pub refund_id: String,
    pub gateway_payment_id: String,
    pub amount: MinorUnits,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync + Debug + 'static {
    async fn create_order(&self, request: CreateGatewayOrder) -> Result<GatewayOrder, PaymentError>;

    async fn capture_payment(
        &self,
        gateway_payment_id: &str,
        amount: MinorUnits,
        currency: &str,
    ) -> Result<GatewayPayment, PaymentError>;

    async fn refund_payment(
        &self,
        gateway_payment_id: &str,
        amount: MinorUnits,
    ) -> Result<GatewayRefund, PaymentError>;

    async fn fetch_payment(&self, gateway_payment_id: &str)
    -> Result<GatewayPayment, PaymentError>;
}
