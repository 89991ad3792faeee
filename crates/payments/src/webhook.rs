use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use crate::{GatewayPayment, GatewayStatus, MinorUnits, PaymentError};

type HmacSha256 = Hmac<Sha256>;

/// Verifies the hex-encoded HMAC-SHA256 signature the gateway sends with
/// every webhook delivery. The MAC must be computed over the raw body bytes.
pub fn verify_webhook_signature(
    secret: &str,
    body: &[u8],
    signature: &str,
) -> Result<(), PaymentError> {
    if secret.is_empty() {
        return Err(PaymentError::InvalidConfiguration(
            "webhook secret is not configured".to_string(),
        ));
    }

    let expected = hex::decode(signature.trim()).map_err(|_| PaymentError::InvalidSignature)?;

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| PaymentError::InvalidSignature)?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| PaymentError::InvalidSignature)
}

/// Produces the signature header value for a body. Used by the dry-run
/// gateway and by tests that need to forge valid deliveries.
pub fn sign_webhook_payload(secret: &str, body: &[u8]) -> Result<String, PaymentError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| PaymentError::InvalidConfiguration(e.to_string()))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEvent {
    PaymentCaptured(GatewayPayment),
    PaymentFailed(GatewayPayment),
    OrderPaid {
        gateway_order_id: String,
        payment: Option<GatewayPayment>,
    },
    Other(String),
}

#[derive(Debug, Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    payload: Payload,
}

#[derive(Debug, Default, Deserialize)]
struct Payload {
    payment: Option<Wrapped<PaymentEntity>>,
    order: Option<Wrapped<OrderEntity>>,
}

#[derive(Debug, Deserialize)]
struct Wrapped<T> {
    entity: T,
}

#[derive(Debug, Deserialize)]
struct PaymentEntity {
    id: String,
    order_id: Option<String>,
    amount: u64,
    status: String,
    method: Option<String>,
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OrderEntity {
    id: String,
}

impl PaymentEntity {
    fn into_payment(self) -> Result<GatewayPayment, PaymentError> {
        let status = self
            .status
            .parse::<GatewayStatus>()
            .map_err(|e| PaymentError::ApiResponseParse {
                action: "webhook payment status".to_string(),
                response_text: self.status.clone(),
                parse_error: e.to_string(),
            })?;

        Ok(GatewayPayment {
            gateway_payment_id: self.id,
            gateway_order_id: self.order_id,
            amount: MinorUnits(self.amount),
            status,
            method: self.method,
            error_description: self.error_description,
        })
    }
}

impl WebhookEvent {
    pub fn parse(body: &[u8]) -> Result<Self, PaymentError> {
        let envelope: Envelope = serde_json::from_slice(body)?;
        let missing = |what: &str| PaymentError::ApiResponseParse {
            action: format!("webhook {}", envelope.event),
            response_text: String::from_utf8_lossy(body).into_owned(),
            parse_error: format!("missing {what} entity"),
        };

        match envelope.event.as_str() {
            "payment.captured" => {
                let payment = envelope.payload.payment.ok_or_else(|| missing("payment"))?;
                Ok(Self::PaymentCaptured(payment.entity.into_payment()?))
            }
            "payment.failed" => {
                let payment = envelope.payload.payment.ok_or_else(|| missing("payment"))?;
                Ok(Self::PaymentFailed(payment.entity.into_payment()?))
            }
            "order.paid" => {
                let order = envelope.payload.order.ok_or_else(|| missing("order"))?;
                let payment = envelope
                    .payload
                    .payment
                    .map(|p| p.entity.into_payment())
                    .transpose()?;
                Ok(Self::OrderPaid {
                    gateway_order_id: order.entity.id,
                    payment,
                })
            }
            _ => Ok(Self::Other(envelope.event)),
        }
    }
}
