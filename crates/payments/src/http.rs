use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use base64::prelude::*;
use clap::Parser;
use reqwest::header::{self, HeaderMap, HeaderValue};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::{
    CreateGatewayOrder, GatewayOrder, GatewayPayment, GatewayRefund, GatewayStatus, MinorUnits,
    PaymentError, PaymentGateway,
};

#[derive(Parser, Debug, Clone)]
pub struct PaymentGatewayEnv {
    #[clap(long = "gateway-key-id", env = "GATEWAY_KEY_ID", default_value = "")]
    pub key_id: String,
    #[clap(long = "gateway-key-secret", env = "GATEWAY_KEY_SECRET", default_value = "")]
    pub key_secret: String,
    #[clap(
        long = "gateway-base-url",
        env = "GATEWAY_BASE_URL",
        default_value = "https://api.razorpay.com"
    )]
    pub base_url: String,
    #[clap(
        long = "gateway-webhook-secret",
        env = "GATEWAY_WEBHOOK_SECRET",
        default_value = ""
    )]
    pub webhook_secret: String,
    #[clap(long = "gateway-currency", env = "GATEWAY_CURRENCY", default_value = "INR")]
    pub currency: String,
    /// Log gateway calls and report every payment as captured
    #[clap(long = "payments-dry-run", env = "PAYMENTS_DRY_RUN", default_value = "false")]
    pub dry_run: bool,
}

impl PaymentGatewayEnv {
    fn basic_auth(&self) -> String {
        let credentials = format!("{}:{}", self.key_id, self.key_secret);
        format!("Basic {}", BASE64_STANDARD.encode(credentials))
    }
}

const MAX_TRANSPORT_RETRIES: usize = 3;
const RETRY_MIN_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Deserialize)]
struct OrderResponse {
    id: String,
    amount: u64,
    currency: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct PaymentResponse {
    id: String,
    order_id: Option<String>,
    amount: u64,
    status: String,
    method: Option<String>,
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RefundResponse {
    id: String,
    payment_id: String,
    amount: u64,
}

impl TryFrom<PaymentResponse> for GatewayPayment {
    type Error = PaymentError;

    fn try_from(response: PaymentResponse) -> Result<Self, Self::Error> {
        let status = response
            .status
            .parse::<GatewayStatus>()
            .map_err(|e| PaymentError::ApiResponseParse {
                action: "payment status".to_string(),
                response_text: response.status.clone(),
                parse_error: e.to_string(),
            })?;

        Ok(Self {
            gateway_payment_id: response.id,
            gateway_order_id: response.order_id,
            amount: MinorUnits(response.amount),
            status,
            method: response.method,
            error_description: response.error_description,
        })
    }
}

/// REST client for a Razorpay-style gateway.
#[derive(Debug, Clone)]
pub struct HttpGateway {
    env: PaymentGatewayEnv,
    client: reqwest::Client,
}

impl HttpGateway {
    pub fn try_from_env(env: PaymentGatewayEnv) -> Result<Self, PaymentError> {
        if env.key_id.is_empty() || env.key_secret.is_empty() {
            return Err(PaymentError::InvalidConfiguration(
                "gateway key id and secret are required unless payments run in dry-run mode"
                    .to_string(),
            ));
        }

        Ok(Self {
            env,
            client: reqwest::Client::new(),
        })
    }

    fn headers(&self) -> Result<HeaderMap, PaymentError> {
        Ok([
            (
                header::AUTHORIZATION,
                HeaderValue::from_str(&self.env.basic_auth())?,
            ),
            (header::CONTENT_TYPE, HeaderValue::from_str("application/json")?),
            (header::ACCEPT, HeaderValue::from_str("application/json")?),
        ]
        .into_iter()
        .collect::<HeaderMap>())
    }

    async fn send<T: DeserializeOwned>(
        &self,
        action: &str,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<T, PaymentError> {
        let headers = self.headers()?;
        let url = format!("{}{path}", self.env.base_url);
        let retry_server_errors = method == reqwest::Method::GET;

        let attempt = || async {
            let mut request = self
                .client
                .request(method.clone(), &url)
                .headers(headers.clone());
            if let Some(ref body) = body {
                request = request.json(body);
            }

            let response = request.send().await?;
            let status = response.status();
            let response_text = response.text().await?;

            if !status.is_success() {
                return Err(PaymentError::RequestFailed {
                    action: action.to_string(),
                    status,
                    body: response_text,
                });
            }

            Ok::<String, PaymentError>(response_text)
        };

        let response_text = attempt
            .retry(
                ExponentialBuilder::default()
                    .with_min_delay(RETRY_MIN_DELAY)
                    .with_max_times(MAX_TRANSPORT_RETRIES),
            )
            // Reads are safe to repeat after a 5xx; writes may already have
            // been applied on the gateway side.
            .when(|err| err.is_transient() || (retry_server_errors && err.is_server_error()))
            .notify(|err, dur| debug!("Retrying {action} after {dur:?}: {err}"))
            .await?;

        serde_json::from_str::<T>(&response_text).map_err(|parse_error| {
            error!(
                action = %action,
                response_text = %response_text,
                parse_error = %parse_error,
                "Failed to parse gateway response"
            );
            PaymentError::ApiResponseParse {
                action: action.to_string(),
                response_text,
                parse_error: parse_error.to_string(),
            }
        })
    }
}

#[async_trait]
impl PaymentGateway for HttpGateway {
    async fn create_order(&self, request: CreateGatewayOrder) -> Result<GatewayOrder, PaymentError> {
        let body = json!({
            "amount": request.amount.0,
            "currency": request.currency,
            "receipt": request.receipt,
            "notes": request.notes,
        });

        let response: OrderResponse = self
            .send("create order", reqwest::Method::POST, "/v1/orders", Some(body))
            .await?;

        let status = response
            .status
            .parse::<GatewayStatus>()
            .map_err(|e| PaymentError::ApiResponseParse {
                action: "create order".to_string(),
                response_text: response.status.clone(),
                parse_error: e.to_string(),
            })?;

        info!(
            gateway_order_id = %response.id,
            receipt = %request.receipt,
            "Created gateway order"
        );

        Ok(GatewayOrder {
            gateway_order_id: response.id,
            amount: MinorUnits(response.amount),
            currency: response.currency,
            status,
        })
    }

    async fn capture_payment(
        &self,
        gateway_payment_id: &str,
        amount: MinorUnits,
        currency: &str,
    ) -> Result<GatewayPayment, PaymentError> {
        let body = json!({ "amount": amount.0, "currency": currency });

        let response: PaymentResponse = self
            .send(
                "capture payment",
                reqwest::Method::POST,
                &format!("/v1/payments/{gateway_payment_id}/capture"),
                Some(body),
            )
            .await?;

        response.try_into()
    }

    async fn refund_payment(
        &self,
        gateway_payment_id: &str,
        amount: MinorUnits,
    ) -> Result<GatewayRefund, PaymentError> {
        let body = json!({ "amount": amount.0 });

        let response: RefundResponse = self
            .send(
                "refund payment",
                reqwest::Method::POST,
                &format!("/v1/payments/{gateway_payment_id}/refund"),
                Some(body),
            )
            .await?;

        info!(
            refund_id = %response.id,
            gateway_payment_id = %response.payment_id,
            "Refund issued"
        );

        Ok(GatewayRefund {
            refund_id: response.id,
            gateway_payment_id: response.payment_id,
            amount: MinorUnits(response.amount),
        })
    }

    async fn fetch_payment(
        &self,
        gateway_payment_id: &str,
    ) -> Result<GatewayPayment, PaymentError> {
        let response: PaymentResponse = self
            .send(
                "fetch payment",
                reqwest::Method::GET,
                &format!("/v1/payments/{gateway_payment_id}"),
                None,
            )
            .await?;

        response.try_into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn create_test_env_with_mock_server(mock_server: &MockServer) -> PaymentGatewayEnv {
        PaymentGatewayEnv {
            key_id: "rzp_test_key".to_string(),
            key_secret: "rzp_test_secret".to_string(),
            base_url: mock_server.base_url(),
            webhook_secret: "whsec".to_string(),
            currency: "INR".to_string(),
            dry_run: false,
        }
    }

    #[test]
    fn test_try_from_env_requires_credentials() {
        let env = PaymentGatewayEnv {
            key_id: String::new(),
            key_secret: String::new(),
            base_url: "https://api.razorpay.com".to_string(),
            webhook_secret: String::new(),
            currency: "INR".to_string(),
            dry_run: false,
        };

        assert!(matches!(
            HttpGateway::try_from_env(env).unwrap_err(),
            PaymentError::InvalidConfiguration(_)
        ));
    }

    #[test]
    fn test_basic_auth_header() {
        let server = MockServer::start();
        let env = create_test_env_with_mock_server(&server);
        // base64("rzp_test_key:rzp_test_secret")
        assert_eq!(
            env.basic_auth(),
            "Basic cnpwX3Rlc3Rfa2V5OnJ6cF90ZXN0X3NlY3JldA=="
        );
    }

    #[tokio::test]
    async fn test_create_order_success() {
        let server = MockServer::start();
        let gateway = HttpGateway::try_from_env(create_test_env_with_mock_server(&server)).unwrap();

        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/orders")
                .header(
                    "authorization",
                    "Basic cnpwX3Rlc3Rfa2V5OnJ6cF90ZXN0X3NlY3JldA==",
                )
                .json_body(json!({
                    "amount": 12500,
                    "currency": "INR",
                    "receipt": "ORD-20261020-ABCDEF12",
                    "notes": {"order_id": "abc"}
                }));
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({
                    "id": "order_Gw123",
                    "entity": "order",
                    "amount": 12500,
                    "currency": "INR",
                    "receipt": "ORD-20261020-ABCDEF12",
                    "status": "created"
                }));
        });

        let order = gateway
            .create_order(CreateGatewayOrder {
                amount: MinorUnits(12500),
                currency: "INR".to_string(),
                receipt: "ORD-20261020-ABCDEF12".to_string(),
                notes: json!({"order_id": "abc"}),
            })
            .await
            .unwrap();

        mock.assert();
        assert_eq!(order.gateway_order_id, "order_Gw123");
        assert_eq!(order.amount, MinorUnits(12500));
        assert_eq!(order.status, GatewayStatus::Created);
    }

    #[tokio::test]
    async fn test_capture_payment_success() {
        let server = MockServer::start();
        let gateway = HttpGateway::try_from_env(create_test_env_with_mock_server(&server)).unwrap();

        let mock = server.mock(|when, then| {
            when.method(POST).path("/v1/payments/pay_123/capture");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({
                    "id": "pay_123",
                    "order_id": "order_Gw123",
                    "amount": 12500,
                    "status": "captured",
                    "method": "upi",
                    "error_description": null
                }));
        });

        let payment = gateway
            .capture_payment("pay_123", MinorUnits(12500), "INR")
            .await
            .unwrap();

        mock.assert();
        assert_eq!(payment.status, GatewayStatus::Captured);
        assert_eq!(payment.gateway_order_id.as_deref(), Some("order_Gw123"));
        assert_eq!(payment.method.as_deref(), Some("upi"));
    }

    #[tokio::test]
    async fn test_capture_payment_client_error_is_not_retried() {
        let server = MockServer::start();
        let gateway = HttpGateway::try_from_env(create_test_env_with_mock_server(&server)).unwrap();

        let mock = server.mock(|when, then| {
            when.method(POST).path("/v1/payments/pay_bad/capture");
            then.status(400)
                .header("content-type", "application/json")
                .json_body(json!({
                    "error": {"code": "BAD_REQUEST_ERROR", "description": "Payment already captured"}
                }));
        });

        let err = gateway
            .capture_payment("pay_bad", MinorUnits(100), "INR")
            .await
            .unwrap_err();

        mock.assert_hits(1);
        assert!(matches!(
            err,
            PaymentError::RequestFailed { status, .. } if status == reqwest::StatusCode::BAD_REQUEST
        ));
    }

    #[tokio::test]
    async fn test_server_error_on_read_is_retried() {
        let server = MockServer::start();
        let gateway = HttpGateway::try_from_env(create_test_env_with_mock_server(&server)).unwrap();

        let mock = server.mock(|when, then| {
            when.method(GET).path("/v1/payments/pay_503");
            then.status(503).body("unavailable");
        });

        let err = gateway.fetch_payment("pay_503").await.unwrap_err();

        mock.assert_hits(MAX_TRANSPORT_RETRIES + 1);
        assert!(matches!(err, PaymentError::RequestFailed { .. }));
    }

    #[tokio::test]
    async fn test_server_error_on_write_is_not_retried() {
        let server = MockServer::start();
        let gateway = HttpGateway::try_from_env(create_test_env_with_mock_server(&server)).unwrap();

        let refund_mock = server.mock(|when, then| {
            when.method(POST).path("/v1/payments/pay_1/refund");
            then.status(503).body("unavailable");
        });
        let capture_mock = server.mock(|when, then| {
            when.method(POST).path("/v1/payments/pay_1/capture");
            then.status(502).body("bad gateway");
        });
        let order_mock = server.mock(|when, then| {
            when.method(POST).path("/v1/orders");
            then.status(500).body("oops");
        });

        let err = gateway
            .refund_payment("pay_1", MinorUnits(100))
            .await
            .unwrap_err();
        assert!(err.is_server_error());
        refund_mock.assert_hits(1);

        gateway
            .capture_payment("pay_1", MinorUnits(100), "INR")
            .await
            .unwrap_err();
        capture_mock.assert_hits(1);

        gateway
            .create_order(CreateGatewayOrder {
                amount: MinorUnits(100),
                currency: "INR".to_string(),
                receipt: "LB-1".to_string(),
                notes: json!({}),
            })
            .await
            .unwrap_err();
        order_mock.assert_hits(1);
    }

    #[tokio::test]
    async fn test_refund_payment_success() {
        let server = MockServer::start();
        let gateway = HttpGateway::try_from_env(create_test_env_with_mock_server(&server)).unwrap();

        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/payments/pay_123/refund")
                .json_body(json!({"amount": 12500}));
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({
                    "id": "rfnd_1",
                    "payment_id": "pay_123",
                    "amount": 12500
                }));
        });

        let refund = gateway
            .refund_payment("pay_123", MinorUnits(12500))
            .await
            .unwrap();

        mock.assert();
        assert_eq!(refund.refund_id, "rfnd_1");
        assert_eq!(refund.amount, MinorUnits(12500));
    }

    #[tokio::test]
    async fn test_unparseable_response() {
        let server = MockServer::start();
        let gateway = HttpGateway::try_from_env(create_test_env_with_mock_server(&server)).unwrap();

        server.mock(|when, then| {
            when.method(GET).path("/v1/payments/pay_weird");
            then.status(200)
                .header("content-type", "application/json")
                .body("{\"unexpected\": true}");
        });

        let err = gateway.fetch_payment("pay_weird").await.unwrap_err();
        assert!(matches!(err, PaymentError::ApiResponseParse { .. }));
    }
}
