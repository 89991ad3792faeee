use async_trait::async_trait;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use tracing::warn;

use crate::{
    CreateGatewayOrder, GatewayOrder, GatewayPayment, GatewayRefund, GatewayStatus, MinorUnits,
    PaymentError, PaymentGateway,
};

/// Gateway for dry-run mode that logs operations without moving money
#[derive(Debug, Clone)]
pub struct DryRunGateway {
    counter: Arc<AtomicU64>,
}

impl DryRunGateway {
    pub fn new() -> Self {
        Self {
            counter: Arc::new(AtomicU64::new(1)),
        }
    }

    fn generate_id(&self, prefix: &str) -> String {
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        format!("{prefix}_DRY_RUN_{id}")
    }
}

impl Default for DryRunGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PaymentGateway for DryRunGateway {
    async fn create_order(&self, request: CreateGatewayOrder) -> Result<GatewayOrder, PaymentError> {
        let gateway_order_id = self.generate_id("order");

        warn!(
            "[DRY-RUN] Would create gateway order for {} {} (receipt: {}, id: {gateway_order_id})",
            request.amount, request.currency, request.receipt
        );

        Ok(GatewayOrder {
            gateway_order_id,
            amount: request.amount,
            currency: request.currency,
            status: GatewayStatus::Created,
        })
    }

    async fn capture_payment(
        &self,
        gateway_payment_id: &str,
        amount: MinorUnits,
        currency: &str,
    ) -> Result<GatewayPayment, PaymentError> {
        warn!("[DRY-RUN] Would capture {amount} {currency} for payment {gateway_payment_id}");

        Ok(GatewayPayment {
            gateway_payment_id: gateway_payment_id.to_string(),
            gateway_order_id: None,
            amount,
            status: GatewayStatus::Captured,
            method: None,
            error_description: None,
        })
    }

    async fn refund_payment(
        &self,
        gateway_payment_id: &str,
        amount: MinorUnits,
    ) -> Result<GatewayRefund, PaymentError> {
        let refund_id = self.generate_id("rfnd");
        warn!("[DRY-RUN] Would refund {amount} for payment {gateway_payment_id} ({refund_id})");

        Ok(GatewayRefund {
            refund_id,
            gateway_payment_id: gateway_payment_id.to_string(),
            amount,
        })
    }

    async fn fetch_payment(
        &self,
        gateway_payment_id: &str,
    ) -> Result<GatewayPayment, PaymentError> {
        warn!("[DRY-RUN] Returning mock captured status for payment {gateway_payment_id}");

        Ok(GatewayPayment {
            gateway_payment_id: gateway_payment_id.to_string(),
            gateway_order_id: None,
            amount: MinorUnits(0),
            status: GatewayStatus::Captured,
            method: None,
            error_description: None,
        })
    }
}
