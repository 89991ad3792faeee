//! Outbound notifications to students and parents. Delivery is best effort:
//! callers hand a [`Notification`] to [`dispatch`] and move on.

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use clap::Parser;
use serde::Serialize;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use url::Url;

use crate::order::{Order, OrderStatus};

pub type DynNotifier = Arc<dyn Notifier>;

#[derive(Parser, Debug, Clone)]
pub struct NotificationEnv {
    /// Endpoint receiving a JSON POST per notification. Notifications are
    /// only logged when unset.
    #[clap(long, env)]
    pub notification_webhook_url: Option<Url>,
    #[clap(long, env, default_value = "5")]
    pub notification_timeout_secs: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("Notification request failed: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("Notification endpoint returned {status}: {body}")]
    Rejected {
        status: reqwest::StatusCode,
        body: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationEvent {
    #[serde(rename_all = "camelCase")]
    OrderConfirmed {
        total_cents: u64,
        currency: String,
        delivery_date: NaiveDate,
        delivery_time: NaiveTime,
    },
    #[serde(rename_all = "camelCase")]
    StatusChanged {
        from: OrderStatus,
        to: OrderStatus,
        message: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    PaymentFailed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub student_id: String,
    pub parent_id: Option<String>,
    pub order_id: String,
    pub order_number: String,
    pub event: NotificationEvent,
}

impl Notification {
    pub fn for_order(order: &Order, event: NotificationEvent) -> Self {
        Self {
            student_id: order.student_id.clone(),
            parent_id: order.parent_id.clone(),
            order_id: order.id.clone(),
            order_number: order.order_number.clone(),
            event,
        }
    }

    pub fn order_confirmed(order: &Order) -> Self {
        Self::for_order(
            order,
            NotificationEvent::OrderConfirmed {
                total_cents: order.total_cents,
                currency: order.currency.clone(),
                delivery_date: order.delivery_date,
                delivery_time: order.delivery_time,
            },
        )
    }
}

#[async_trait]
pub trait Notifier: Send + Sync + Debug + 'static {
    async fn notify(&self, notification: &Notification) -> Result<(), NotificationError>;
}

/// Writes notifications to the log only.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotificationError> {
        info!(
            student_id = %notification.student_id,
            parent_id = ?notification.parent_id,
            order_number = %notification.order_number,
            event = ?notification.event,
            "Notification"
        );
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: Url,
}

impl WebhookNotifier {
    pub fn new(url: Url, timeout: Duration) -> Result<Self, NotificationError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotificationError> {
        let response = self
            .client
            .post(self.url.clone())
            .json(notification)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotificationError::Rejected { status, body });
        }

        Ok(())
    }
}

impl NotificationEnv {
    pub fn build_notifier(&self) -> Result<DynNotifier, NotificationError> {
        match &self.notification_webhook_url {
            Some(url) => Ok(Arc::new(WebhookNotifier::new(
                url.clone(),
                Duration::from_secs(self.notification_timeout_secs),
            )?)),
            None => Ok(Arc::new(LogNotifier)),
        }
    }
}

/// Sends on a background task. Failures are logged and never reach the
/// caller.
pub fn dispatch(notifier: &DynNotifier, notification: Notification) -> JoinHandle<()> {
    let notifier = Arc::clone(notifier);

    tokio::spawn(async move {
        if let Err(e) = notifier.notify(&notification).await {
            warn!(
                order_id = %notification.order_id,
                student_id = %notification.student_id,
                "Failed to deliver notification: {e}"
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FailingNotifier, OrderBuilder, RecordingNotifier};
    use httpmock::prelude::*;
    use serde_json::json;

    #[test]
    fn test_notification_json_shape() {
        let order = OrderBuilder::new().build();
        let notification = Notification::for_order(
            &order,
            NotificationEvent::StatusChanged {
                from: OrderStatus::Pending,
                to: OrderStatus::Confirmed,
                message: Some("Payment captured".to_string()),
            },
        );

        let value = serde_json::to_value(&notification).unwrap();
        assert_eq!(value["studentId"], json!(order.student_id));
        assert_eq!(value["event"]["type"], "STATUS_CHANGED");
        assert_eq!(value["event"]["from"], "PENDING");
        assert_eq!(value["event"]["to"], "CONFIRMED");
    }

    #[tokio::test]
    async fn test_webhook_notifier_posts_json() {
        let server = MockServer::start();
        let order = OrderBuilder::new().build();

        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/notify")
                .json_body_partial(r#"{"event": {"type": "ORDER_CONFIRMED"}}"#);
            then.status(204);
        });

        let notifier = WebhookNotifier::new(
            Url::parse(&server.url("/notify")).unwrap(),
            Duration::from_secs(5),
        )
        .unwrap();

        notifier
            .notify(&Notification::order_confirmed(&order))
            .await
            .unwrap();
        mock.assert();
    }

    #[tokio::test]
    async fn test_webhook_notifier_reports_rejection() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/notify");
            then.status(500).body("down");
        });

        let notifier = WebhookNotifier::new(
            Url::parse(&server.url("/notify")).unwrap(),
            Duration::from_secs(5),
        )
        .unwrap();

        let err = notifier
            .notify(&Notification::order_confirmed(&OrderBuilder::new().build()))
            .await
            .unwrap_err();
        assert!(matches!(err, NotificationError::Rejected { body, .. } if body == "down"));
    }

    #[tokio::test]
    async fn test_dispatch_delivers_in_background() {
        let recorder = Arc::new(RecordingNotifier::default());
        let notifier: DynNotifier = recorder.clone();

        dispatch(&notifier, Notification::order_confirmed(&OrderBuilder::new().build()))
            .await
            .unwrap();

        assert_eq!(recorder.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_swallows_failures() {
        let notifier: DynNotifier = Arc::new(FailingNotifier);

        let handle = dispatch(
            &notifier,
            Notification::order_confirmed(&OrderBuilder::new().build()),
        );

        assert!(handle.await.is_ok());
    }

    #[test]
    fn test_build_notifier_defaults_to_log() {
        let env = NotificationEnv {
            notification_webhook_url: None,
            notification_timeout_secs: 5,
        };
        let notifier = env.build_notifier().unwrap();
        assert!(format!("{notifier:?}").contains("LogNotifier"));
    }
}
