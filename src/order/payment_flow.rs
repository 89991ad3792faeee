use chrono::Utc;
use lunchbox_payments::{
    CreateGatewayOrder, GatewayPayment, MinorUnits, PaymentError, PaymentMethod, WebhookEvent,
    verify_webhook_signature,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, warn};

use super::service::update_failed;
use super::{Order, OrderService, OrderStatus};
use crate::error::OrderError;
use crate::notification::{Notification, NotificationEvent, dispatch};
use crate::payment::{PaymentOrder, PaymentStatus, PaymentUpdate};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessPayment {
    pub method: PaymentMethod,
    /// Present when the client has already completed checkout and wants the
    /// payment captured synchronously.
    #[serde(default)]
    pub gateway_payment_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentOutcome {
    pub payment: PaymentOrder,
    pub order_status: OrderStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WebhookOutcome {
    #[serde(rename_all = "camelCase")]
    OrderConfirmed { order_id: String },
    #[serde(rename_all = "camelCase")]
    AlreadyProcessed { order_id: String },
    #[serde(rename_all = "camelCase")]
    PaymentFailed { order_id: String },
    Ignored { event: String },
}

const PAYMENT_CAPTURED_MESSAGE: &str = "Payment captured";

impl OrderService {
    pub async fn process_order_payment(
        &self,
        order_id: &str,
        request: ProcessPayment,
    ) -> Result<PaymentOutcome, OrderError> {
        let order = self.load(order_id).await?;

        if order.status != OrderStatus::Pending {
            return Err(OrderError::InvalidStatusTransition {
                from: order.status,
                to: OrderStatus::Confirmed,
            });
        }

        let mut payment = PaymentOrder::new(
            &order.id,
            request.method,
            order.total_cents,
            &order.currency,
            Utc::now(),
        );
        payment
            .insert(&self.pool)
            .await
            .map_err(|e| update_failed(order_id, "Failed to create payment order", &e))?;

        if request.method.bypasses_gateway() {
            let update = PaymentUpdate::status(PaymentStatus::Captured)
                .with_metadata(json!({ "settlement": "counter" }));
            return self.settle_capture(&order, payment, &update).await;
        }

        let gateway_order = match self
            .gateway
            .create_order(CreateGatewayOrder {
                amount: MinorUnits(order.total_cents),
                currency: order.currency.clone(),
                receipt: order.order_number.clone(),
                notes: json!({
                    "orderId": order.id,
                    "studentId": order.student_id,
                }),
            })
            .await
        {
            Ok(gateway_order) => gateway_order,
            Err(e) => return Err(self.fail_payment(&order, &payment, &e.to_string()).await),
        };

        PaymentOrder::attach_gateway_order(&self.pool, &payment.id, &gateway_order.gateway_order_id)
            .await
            .map_err(|e| update_failed(order_id, "Failed to attach gateway order", &e))?;
        payment.gateway_order_id = Some(gateway_order.gateway_order_id);

        let Some(gateway_payment_id) = request.gateway_payment_id else {
            info!(
                order_id,
                payment_id = %payment.id,
                gateway_order_id = ?payment.gateway_order_id,
                "Awaiting checkout for payment"
            );
            return Ok(PaymentOutcome {
                payment,
                order_status: order.status,
            });
        };

        match self
            .gateway
            .capture_payment(
                &gateway_payment_id,
                MinorUnits(order.total_cents),
                &order.currency,
            )
            .await
        {
            Ok(captured) if captured.status.is_captured() => {
                let update = captured_update(&captured);
                self.settle_capture(&order, payment, &update).await
            }
            Ok(declined) if declined.status.is_failed() => {
                let reason = declined
                    .error_description
                    .unwrap_or_else(|| "Payment declined by gateway".to_string());
                Err(self.fail_payment(&order, &payment, &reason).await)
            }
            Ok(in_flight) => {
                let update = PaymentUpdate::status(PaymentStatus::Created)
                    .with_payment_id(&in_flight.gateway_payment_id);
                PaymentOrder::record(&self.pool, &payment.id, PaymentStatus::Created, &update)
                    .await
                    .map_err(|e| update_failed(order_id, "Failed to record payment id", &e))?;

                info!(
                    order_id,
                    gateway_status = %in_flight.status,
                    "Payment not yet captured, waiting for webhook"
                );
                payment.gateway_payment_id = Some(in_flight.gateway_payment_id);
                Ok(PaymentOutcome {
                    payment,
                    order_status: order.status,
                })
            }
            Err(e) => Err(self.fail_payment(&order, &payment, &e.to_string()).await),
        }
    }

    async fn settle_capture(
        &self,
        order: &Order,
        mut payment: PaymentOrder,
        update: &PaymentUpdate,
    ) -> Result<PaymentOutcome, OrderError> {
        PaymentOrder::record(&self.pool, &payment.id, PaymentStatus::Created, update)
            .await
            .map_err(|e| update_failed(&order.id, "Failed to record captured payment", &e))?;

        payment.status = PaymentStatus::Captured;
        if let Some(gateway_payment_id) = &update.gateway_payment_id {
            payment.gateway_payment_id = Some(gateway_payment_id.clone());
        }

        let confirmed = self
            .update_order_status(
                &order.id,
                OrderStatus::Confirmed,
                Some(PAYMENT_CAPTURED_MESSAGE),
            )
            .await?;

        info!(
            order_id = %order.id,
            payment_id = %payment.id,
            method = %payment.method,
            "Payment captured"
        );

        Ok(PaymentOutcome {
            payment,
            order_status: confirmed.status,
        })
    }

    async fn fail_payment(&self, order: &Order, payment: &PaymentOrder, reason: &str) -> OrderError {
        let update = PaymentUpdate::status(PaymentStatus::Failed).with_failure_reason(reason);

        if let Err(e) =
            PaymentOrder::record(&self.pool, &payment.id, PaymentStatus::Created, &update).await
        {
            error!(
                order_id = %order.id,
                payment_id = %payment.id,
                "Failed to record payment failure: {e}"
            );
        }

        warn!(order_id = %order.id, payment_id = %payment.id, reason, "Payment failed");

        dispatch(
            &self.notifier,
            Notification::for_order(
                order,
                NotificationEvent::PaymentFailed {
                    reason: reason.to_string(),
                },
            ),
        );

        OrderError::PaymentFailed {
            reason: reason.to_string(),
        }
    }

    /// Entry point for gateway callbacks. `body` must be the exact bytes
    /// received; the signature is computed over them.
    pub async fn handle_payment_webhook(
        &self,
        body: &[u8],
        signature: &str,
    ) -> Result<WebhookOutcome, OrderError> {
        verify_webhook_signature(&self.webhook_secret, body, signature).map_err(|e| {
            match e {
                PaymentError::InvalidConfiguration(_) => error!("Webhook rejected: {e}"),
                _ => warn!("Webhook rejected: {e}"),
            }
            OrderError::InvalidWebhookSignature
        })?;

        let event = WebhookEvent::parse(body).map_err(|e| {
            warn!("Unparseable webhook payload: {e}");
            OrderError::InvalidWebhookPayload(e.to_string())
        })?;

        match event {
            WebhookEvent::PaymentCaptured(captured) => {
                let gateway_order_id = captured.gateway_order_id.clone().ok_or_else(|| {
                    OrderError::InvalidWebhookPayload(
                        "captured payment carries no order id".to_string(),
                    )
                })?;
                self.confirm_from_webhook(&gateway_order_id, Some(&captured))
                    .await
            }
            WebhookEvent::OrderPaid {
                gateway_order_id,
                payment,
            } => {
                self.confirm_from_webhook(&gateway_order_id, payment.as_ref())
                    .await
            }
            WebhookEvent::PaymentFailed(failed) => self.fail_from_webhook(&failed).await,
            WebhookEvent::Other(event) => {
                debug!(%event, "Ignoring webhook event");
                Ok(WebhookOutcome::Ignored { event })
            }
        }
    }

    async fn find_payment(&self, gateway_order_id: &str) -> Result<PaymentOrder, OrderError> {
        PaymentOrder::find_by_gateway_order_id(&self.pool, gateway_order_id)
            .await
            .map_err(|e| update_failed(gateway_order_id, "Failed to load payment order", &e))?
            .ok_or_else(|| {
                warn!(gateway_order_id, "Webhook for unknown payment order");
                OrderError::PaymentOrderNotFound {
                    gateway_order_id: gateway_order_id.to_string(),
                }
            })
    }

    /// Deliveries are at-least-once. The payment row is moved to CAPTURED
    /// with a guarded write, so only the first delivery confirms the order.
    async fn confirm_from_webhook(
        &self,
        gateway_order_id: &str,
        captured: Option<&GatewayPayment>,
    ) -> Result<WebhookOutcome, OrderError> {
        let payment = self.find_payment(gateway_order_id).await?;
        let order_id = payment.order_id.clone();

        let settled = match payment.status {
            // Money arriving after a failure or expiry still settles the order.
            PaymentStatus::Created | PaymentStatus::Failed | PaymentStatus::Expired => {
                let update = captured.map_or_else(
                    || {
                        PaymentUpdate::status(PaymentStatus::Captured)
                            .with_metadata(json!({ "source": "webhook" }))
                    },
                    captured_update,
                );
                PaymentOrder::record(&self.pool, &payment.id, payment.status, &update)
                    .await
                    .map_err(|e| update_failed(&order_id, "Failed to record captured payment", &e))?
            }
            PaymentStatus::Captured | PaymentStatus::Refunded => false,
        };

        if !settled {
            info!(%order_id, gateway_order_id, "Duplicate capture webhook");
            return Ok(WebhookOutcome::AlreadyProcessed { order_id });
        }

        let order = self.load(&order_id).await?;
        if order.status != OrderStatus::Pending {
            warn!(
                %order_id,
                status = %order.status,
                "Payment captured for an order that is no longer pending"
            );
            return Ok(WebhookOutcome::AlreadyProcessed { order_id });
        }

        match self
            .update_order_status(
                &order_id,
                OrderStatus::Confirmed,
                Some(PAYMENT_CAPTURED_MESSAGE),
            )
            .await
        {
            Ok(_) => {
                info!(%order_id, gateway_order_id, "Order confirmed by webhook");
                Ok(WebhookOutcome::OrderConfirmed { order_id })
            }
            Err(OrderError::InvalidStatusTransition { from, .. }) => {
                warn!(%order_id, status = %from, "Order moved on before webhook confirmation");
                Ok(WebhookOutcome::AlreadyProcessed { order_id })
            }
            Err(e) => Err(e),
        }
    }

    async fn fail_from_webhook(
        &self,
        failed: &GatewayPayment,
    ) -> Result<WebhookOutcome, OrderError> {
        let gateway_order_id = failed.gateway_order_id.as_deref().ok_or_else(|| {
            OrderError::InvalidWebhookPayload("failed payment carries no order id".to_string())
        })?;

        let payment = self.find_payment(gateway_order_id).await?;
        let order_id = payment.order_id.clone();

        if payment.status != PaymentStatus::Created {
            return Ok(WebhookOutcome::AlreadyProcessed { order_id });
        }

        let reason = failed
            .error_description
            .clone()
            .unwrap_or_else(|| "Payment failed at gateway".to_string());
        let update = PaymentUpdate::status(PaymentStatus::Failed)
            .with_payment_id(&failed.gateway_payment_id)
            .with_failure_reason(&reason);

        let recorded =
            PaymentOrder::record(&self.pool, &payment.id, PaymentStatus::Created, &update)
                .await
                .map_err(|e| update_failed(&order_id, "Failed to record payment failure", &e))?;
        if !recorded {
            return Ok(WebhookOutcome::AlreadyProcessed { order_id });
        }

        warn!(%order_id, gateway_order_id, %reason, "Payment failed at gateway");

        let order = self.load(&order_id).await?;
        dispatch(
            &self.notifier,
            Notification::for_order(&order, NotificationEvent::PaymentFailed { reason }),
        );

        Ok(WebhookOutcome::PaymentFailed { order_id })
    }
}

fn captured_update(captured: &GatewayPayment) -> PaymentUpdate {
    PaymentUpdate::status(PaymentStatus::Captured)
        .with_payment_id(&captured.gateway_payment_id)
        .with_metadata(json!({
            "gatewayStatus": captured.status,
            "gatewayMethod": captured.method,
        }))
}
