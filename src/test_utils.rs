use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use lunchbox_payments::{
    CreateGatewayOrder, GatewayOrder, GatewayPayment, GatewayRefund, GatewayStatus, MinorUnits,
    PaymentError, PaymentGateway, PaymentMethod,
};
use serde_json::{Value, json};
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::cache::{CacheConfig, CacheManager};
use crate::cart::{CartConfig, CartService};
use crate::context::AppContext;
use crate::kv::MemoryStore;
use crate::menu::{MenuItem, MenuService};
use crate::notification::{Notification, NotificationError, Notifier};
use crate::order::{CreateOrder, Order, OrderLineRequest, OrderPolicy, OrderService, OrderStatus};
use crate::payment::{PaymentOrder, PaymentStatus, PaymentUpdate};
use crate::student::Student;

pub const TEST_WEBHOOK_SECRET: &str = "whsec_test";

/// Centralized test database setup to eliminate duplication across test files.
/// Creates an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> SqlitePool {
    let pool = SqlitePool::connect(":memory:").await.unwrap();
    sqlx::migrate!().run(&pool).await.unwrap();
    pool
}

pub fn test_menu_service(pool: &SqlitePool) -> MenuService {
    MenuService::new(
        pool.clone(),
        CacheManager::new(
            "menu",
            CacheConfig {
                capacity: 64,
                ttl: std::time::Duration::from_secs(60),
            },
        ),
    )
}

/// One week out in the school's zone, comfortably past any cutoff.
pub fn next_week() -> NaiveDate {
    (Utc::now() + Duration::days(7))
        .with_timezone(&OrderPolicy::default().timezone)
        .date_naive()
}

pub fn lunch_time() -> NaiveTime {
    NaiveTime::from_hms_opt(12, 30, 0).unwrap()
}

pub fn create_request(student_id: &str, lines: &[(&str, u32)]) -> CreateOrder {
    CreateOrder {
        student_id: student_id.to_string(),
        school_id: "school-1".to_string(),
        delivery_date: next_week(),
        delivery_time: lunch_time(),
        items: lines
            .iter()
            .map(|(menu_item_id, quantity)| OrderLineRequest {
                menu_item_id: (*menu_item_id).to_string(),
                quantity: *quantity,
                special_instructions: None,
                customizations: None,
            })
            .collect(),
        special_instructions: None,
        metadata: None,
    }
}

#[derive(Debug, Clone)]
pub struct MenuItemBuilder {
    item: MenuItem,
}

impl MenuItemBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            item: MenuItem {
                id: id.to_string(),
                school_id: "school-1".to_string(),
                name: format!("Item {id}"),
                description: None,
                category: "MAIN".to_string(),
                price_cents: 4_500,
                available: true,
                allergens: Vec::new(),
            },
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: &str) -> Self {
        self.item.name = name.to_string();
        self
    }

    #[must_use]
    pub fn with_price_cents(mut self, price_cents: u64) -> Self {
        self.item.price_cents = price_cents;
        self
    }

    #[must_use]
    pub fn with_school(mut self, school_id: &str) -> Self {
        self.item.school_id = school_id.to_string();
        self
    }

    #[must_use]
    pub fn with_allergens(mut self, allergens: &[&str]) -> Self {
        self.item.allergens = allergens.iter().map(|a| (*a).to_string()).collect();
        self
    }

    #[must_use]
    pub fn unavailable(mut self) -> Self {
        self.item.available = false;
        self
    }

    pub fn build(self) -> MenuItem {
        self.item
    }
}

#[derive(Debug, Clone)]
pub struct StudentBuilder {
    student: Student,
}

impl StudentBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            student: Student {
                id: id.to_string(),
                school_id: "school-1".to_string(),
                parent_id: Some("parent-1".to_string()),
                name: format!("Student {id}"),
                phone: None,
                allergies: Vec::new(),
                dietary_restrictions: Vec::new(),
            },
        }
    }

    #[must_use]
    pub fn with_school(mut self, school_id: &str) -> Self {
        self.student.school_id = school_id.to_string();
        self
    }

    #[must_use]
    pub fn with_allergies(mut self, allergies: &[&str]) -> Self {
        self.student.allergies = allergies.iter().map(|a| (*a).to_string()).collect();
        self
    }

    #[must_use]
    pub fn with_dietary_restrictions(mut self, restrictions: &[&str]) -> Self {
        self.student.dietary_restrictions =
            restrictions.iter().map(|r| (*r).to_string()).collect();
        self
    }

    pub fn build(self) -> Student {
        self.student
    }
}

pub async fn seed_student(pool: &SqlitePool, id: &str) {
    StudentBuilder::new(id).build().upsert(pool).await.unwrap();
}

/// Orders for repository-level tests. The default belongs to `s-1` at
/// `school-1`, for lunch on 2030-01-10.
#[derive(Debug, Clone)]
pub struct OrderBuilder {
    order: Order,
}

impl OrderBuilder {
    pub fn new() -> Self {
        let id = uuid::Uuid::new_v4();
        let now = Utc::now();

        Self {
            order: Order {
                id: id.to_string(),
                order_number: crate::order::order_number(&id, now),
                student_id: "s-1".to_string(),
                parent_id: Some("parent-1".to_string()),
                school_id: "school-1".to_string(),
                total_cents: 9_000,
                currency: "INR".to_string(),
                status: OrderStatus::Pending,
                delivery_date: NaiveDate::from_ymd_opt(2030, 1, 10).unwrap(),
                delivery_time: lunch_time(),
                special_instructions: None,
                metadata: json!({}),
                created_at: now,
                updated_at: now,
            },
        }
    }

    #[must_use]
    pub fn with_student(mut self, student_id: &str) -> Self {
        self.order.student_id = student_id.to_string();
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: OrderStatus) -> Self {
        self.order.status = status;
        self
    }

    #[must_use]
    pub fn with_delivery_date(mut self, delivery_date: NaiveDate) -> Self {
        self.order.delivery_date = delivery_date;
        self
    }

    #[must_use]
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.order.created_at = created_at;
        self.order.updated_at = created_at;
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.order.metadata = metadata;
        self
    }

    pub fn build(self) -> Order {
        self.order
    }
}

impl Default for OrderBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn insert_order(pool: &SqlitePool, order: &Order) {
    let mut sql_tx = pool.begin().await.unwrap();
    order.insert_within_transaction(&mut sql_tx).await.unwrap();
    sql_tx.commit().await.unwrap();
}

#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }

    /// Notifications go out on background tasks, so tests poll briefly.
    pub async fn wait_for(&self, count: usize) -> Vec<Notification> {
        for _ in 0..200 {
            let sent = self.sent();
            if sent.len() >= count {
                return sent;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!(
            "Expected {count} notifications, got {:?}",
            self.sent()
        );
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotificationError> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

#[derive(Debug)]
pub struct FailingNotifier;

#[async_trait]
impl Notifier for FailingNotifier {
    async fn notify(&self, _notification: &Notification) -> Result<(), NotificationError> {
        Err(NotificationError::Rejected {
            status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
            body: "unavailable".to_string(),
        })
    }
}

/// In-process gateway whose answers are fixed per test.
#[derive(Debug)]
pub struct ScriptedGateway {
    capture_status: GatewayStatus,
    fail_orders: bool,
    fail_refunds: bool,
    counter: AtomicU64,
    created: Mutex<Vec<CreateGatewayOrder>>,
    refunds: Mutex<Vec<String>>,
}

impl Default for ScriptedGateway {
    fn default() -> Self {
        Self {
            capture_status: GatewayStatus::Captured,
            fail_orders: false,
            fail_refunds: false,
            counter: AtomicU64::new(0),
            created: Mutex::new(Vec::new()),
            refunds: Mutex::new(Vec::new()),
        }
    }
}

impl ScriptedGateway {
    #[must_use]
    pub fn capturing_as(mut self, status: GatewayStatus) -> Self {
        self.capture_status = status;
        self
    }

    #[must_use]
    pub fn failing_orders(mut self) -> Self {
        self.fail_orders = true;
        self
    }

    #[must_use]
    pub fn failing_refunds(mut self) -> Self {
        self.fail_refunds = true;
        self
    }

    pub fn created_orders(&self) -> Vec<CreateGatewayOrder> {
        self.created.lock().unwrap().clone()
    }

    pub fn refund_attempts(&self) -> Vec<String> {
        self.refunds.lock().unwrap().clone()
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{prefix}_{}", self.counter.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn unavailable(action: &str) -> PaymentError {
        PaymentError::RequestFailed {
            action: action.to_string(),
            status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
            body: "gateway down".to_string(),
        }
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn create_order(&self, request: CreateGatewayOrder) -> Result<GatewayOrder, PaymentError> {
        if self.fail_orders {
            return Err(Self::unavailable("create order"));
        }

        self.created.lock().unwrap().push(request.clone());
        Ok(GatewayOrder {
            gateway_order_id: self.next_id("order"),
            amount: request.amount,
            currency: request.currency,
            status: GatewayStatus::Created,
        })
    }

    async fn capture_payment(
        &self,
        gateway_payment_id: &str,
        amount: MinorUnits,
        _currency: &str,
    ) -> Result<GatewayPayment, PaymentError> {
        Ok(GatewayPayment {
            gateway_payment_id: gateway_payment_id.to_string(),
            gateway_order_id: None,
            amount,
            status: self.capture_status,
            method: Some("card".to_string()),
            error_description: (self.capture_status == GatewayStatus::Failed)
                .then(|| "Card declined".to_string()),
        })
    }

    async fn refund_payment(
        &self,
        gateway_payment_id: &str,
        amount: MinorUnits,
    ) -> Result<GatewayRefund, PaymentError> {
        self.refunds
            .lock()
            .unwrap()
            .push(gateway_payment_id.to_string());

        if self.fail_refunds {
            return Err(Self::unavailable("refund"));
        }

        Ok(GatewayRefund {
            refund_id: self.next_id("rfnd"),
            gateway_payment_id: gateway_payment_id.to_string(),
            amount,
        })
    }

    async fn fetch_payment(
        &self,
        gateway_payment_id: &str,
    ) -> Result<GatewayPayment, PaymentError> {
        Ok(GatewayPayment {
            gateway_payment_id: gateway_payment_id.to_string(),
            gateway_order_id: None,
            amount: MinorUnits(0),
            status: self.capture_status,
            method: None,
            error_description: None,
        })
    }
}

pub fn captured_webhook(gateway_order_id: &str, gateway_payment_id: &str, amount: u64) -> Vec<u8> {
    json!({
        "event": "payment.captured",
        "payload": {
            "payment": {
                "entity": {
                    "id": gateway_payment_id,
                    "order_id": gateway_order_id,
                    "amount": amount,
                    "status": "captured",
                    "method": "upi"
                }
            }
        }
    })
    .to_string()
    .into_bytes()
}

pub fn failed_webhook(gateway_order_id: &str, gateway_payment_id: &str, reason: &str) -> Vec<u8> {
    json!({
        "event": "payment.failed",
        "payload": {
            "payment": {
                "entity": {
                    "id": gateway_payment_id,
                    "order_id": gateway_order_id,
                    "amount": 0,
                    "status": "failed",
                    "error_description": reason
                }
            }
        }
    })
    .to_string()
    .into_bytes()
}

/// Fully wired services over an in-memory database and store.
pub struct TestHarness {
    pub pool: SqlitePool,
    pub store: Arc<MemoryStore>,
    pub notifier: Arc<RecordingNotifier>,
    pub gateway: Arc<ScriptedGateway>,
    pub menu: MenuService,
    pub carts: CartService,
    pub orders: OrderService,
}

impl TestHarness {
    pub async fn new() -> Self {
        Self::with_gateway(Arc::new(ScriptedGateway::default())).await
    }

    pub async fn with_gateway(gateway: Arc<ScriptedGateway>) -> Self {
        let pool = setup_test_db().await;
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let menu = test_menu_service(&pool);
        let carts = CartService::new(store.clone(), menu.clone(), CartConfig::default());
        let orders = OrderService::new(
            pool.clone(),
            carts.clone(),
            gateway.clone(),
            notifier.clone(),
            OrderPolicy::default(),
        )
        .with_webhook_secret(TEST_WEBHOOK_SECRET);

        Self {
            pool,
            store,
            notifier,
            gateway,
            menu,
            carts,
            orders,
        }
    }

    pub fn context(&self) -> AppContext {
        AppContext {
            pool: self.pool.clone(),
            store: self.store.clone(),
            menu: self.menu.clone(),
            carts: self.carts.clone(),
            orders: self.orders.clone(),
        }
    }

    pub async fn seed_menu(&self, items: &[MenuItemBuilder]) {
        for builder in items {
            self.menu.upsert(&builder.clone().build()).await.unwrap();
        }
    }

    pub async fn seed_student(&self, builder: StudentBuilder) {
        builder.build().upsert(&self.pool).await.unwrap();
    }

    /// A pending order for one unit of `m-1`.
    pub async fn place_order(&self, student_id: &str) -> Order {
        self.orders
            .create_order(create_request(student_id, &[("m-1", 1)]))
            .await
            .unwrap()
            .order
    }

    pub async fn captured_payment(&self, order: &Order, gateway_payment_id: &str) -> PaymentOrder {
        let payment = PaymentOrder::new(
            &order.id,
            PaymentMethod::Card,
            order.total_cents,
            &order.currency,
            Utc::now(),
        );
        payment.insert(&self.pool).await.unwrap();

        let update =
            PaymentUpdate::status(PaymentStatus::Captured).with_payment_id(gateway_payment_id);
        assert!(
            PaymentOrder::record(&self.pool, &payment.id, PaymentStatus::Created, &update)
                .await
                .unwrap()
        );

        PaymentOrder::find_by_id(&self.pool, &payment.id)
            .await
            .unwrap()
            .unwrap()
    }
}
