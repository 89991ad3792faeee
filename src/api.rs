use chrono::{DateTime, NaiveDate, Utc};
use rocket::http::Status;
use rocket::request::{self, FromRequest, Request};
use rocket::response::status::Custom;
use rocket::response::{self, Responder};
use rocket::serde::json::Json;
use rocket::{Catcher, Route, State, catch, catchers, delete, get, post, put, routes};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::error;

use crate::cart::{AddToCart, Cart};
use crate::context::AppContext;
use crate::error::{OrderError, PersistenceError};
use crate::menu::MenuItem;
use crate::order::{
    CreateOrder, Order, OrderDetails, OrderFilter, OrderStatus, PaymentOutcome, ProcessPayment,
    WebhookOutcome,
};

pub const WEBHOOK_SIGNATURE_HEADER: &str = "X-Razorpay-Signature";

#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub success: bool,
    pub data: T,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug)]
pub struct ApiError {
    status: Status,
    body: ErrorBody,
}

impl ApiError {
    fn new(status: Status, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                message: message.into(),
                code: code.to_string(),
                details: None,
            },
        }
    }
}

const fn status_for(err: &OrderError) -> Status {
    match err {
        OrderError::OrderNotFound { .. }
        | OrderError::StudentNotFound { .. }
        | OrderError::PaymentOrderNotFound { .. }
        | OrderError::CartItemNotFound { .. } => Status::NotFound,
        OrderError::InvalidStatusTransition { .. }
        | OrderError::DuplicateOrder
        | OrderError::CancellationNotAllowed { .. } => Status::Conflict,
        OrderError::ItemsUnavailable { .. }
        | OrderError::ItemUnavailable { .. }
        | OrderError::QuantityExceeded { .. }
        | OrderError::InvalidQuantity { .. }
        | OrderError::EmptyOrder
        | OrderError::InvalidDeliveryDate { .. }
        | OrderError::OrderCutoffPassed { .. }
        | OrderError::DietaryRestrictionConflict { .. }
        | OrderError::InvalidWebhookPayload(_)
        | OrderError::InvalidFilter(_) => Status::BadRequest,
        OrderError::PaymentFailed { .. } => Status::PaymentRequired,
        OrderError::InvalidWebhookSignature => Status::Unauthorized,
        OrderError::OrderCreationFailed(_)
        | OrderError::CartUpdateFailed(_)
        | OrderError::OrderUpdateFailed(_) => Status::InternalServerError,
    }
}

impl From<OrderError> for ApiError {
    fn from(err: OrderError) -> Self {
        Self {
            status: status_for(&err),
            body: ErrorBody {
                message: err.to_string(),
                code: err.code().to_string(),
                details: err.details(),
            },
        }
    }
}

impl From<PersistenceError> for ApiError {
    fn from(err: PersistenceError) -> Self {
        error!("Request failed on persistence: {err}");
        OrderError::OrderUpdateFailed(err.to_string()).into()
    }
}

impl<'r> Responder<'r, 'static> for ApiError {
    fn respond_to(self, request: &'r Request<'_>) -> response::Result<'static> {
        Custom(
            self.status,
            Json(json!({ "success": false, "error": self.body })),
        )
        .respond_to(request)
    }
}

type ApiResult<T> = Result<Json<Envelope<T>>, ApiError>;

#[allow(clippy::unnecessary_wraps)]
fn ok<T>(data: T) -> ApiResult<T> {
    Ok(Json(Envelope {
        success: true,
        data,
    }))
}

/// Raw value of the gateway's signature header. A missing header reads as
/// empty and fails verification like any other bad signature.
pub struct WebhookSignature(String);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for WebhookSignature {
    type Error = ();

    async fn from_request(request: &'r Request<'_>) -> request::Outcome<Self, Self::Error> {
        request::Outcome::Success(Self(
            request
                .headers()
                .get_one(WEBHOOK_SIGNATURE_HEADER)
                .unwrap_or_default()
                .to_string(),
        ))
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

#[get("/health")]
pub fn health() -> ApiResult<HealthResponse> {
    ok(HealthResponse {
        status: "healthy".to_string(),
        timestamp: Utc::now(),
    })
}

#[get("/schools/<school_id>/menu?<available_only>")]
pub async fn school_menu(
    school_id: &str,
    available_only: Option<bool>,
    ctx: &State<AppContext>,
) -> ApiResult<Vec<MenuItem>> {
    let items = ctx
        .menu
        .list_for_school(school_id, available_only.unwrap_or(true))
        .await?;
    ok(items)
}

#[get("/students/<student_id>/cart")]
pub async fn get_cart(student_id: &str, ctx: &State<AppContext>) -> ApiResult<Option<Cart>> {
    ok(ctx.carts.get_cart(student_id).await?)
}

#[post("/students/<student_id>/cart/items", format = "json", data = "<request>")]
pub async fn add_cart_item(
    student_id: &str,
    request: Json<AddToCart>,
    ctx: &State<AppContext>,
) -> ApiResult<Cart> {
    ok(ctx.carts.add_to_cart(student_id, request.into_inner()).await?)
}

#[derive(Debug, Deserialize)]
pub struct UpdateQuantity {
    pub quantity: u32,
}

#[put(
    "/students/<student_id>/cart/items/<menu_item_id>",
    format = "json",
    data = "<request>"
)]
pub async fn update_cart_item(
    student_id: &str,
    menu_item_id: &str,
    request: Json<UpdateQuantity>,
    ctx: &State<AppContext>,
) -> ApiResult<Cart> {
    ok(ctx
        .carts
        .update_cart_item(student_id, menu_item_id, request.quantity)
        .await?)
}

#[delete("/students/<student_id>/cart/items/<menu_item_id>")]
pub async fn remove_cart_item(
    student_id: &str,
    menu_item_id: &str,
    ctx: &State<AppContext>,
) -> ApiResult<Cart> {
    ok(ctx.carts.remove_from_cart(student_id, menu_item_id).await?)
}

#[delete("/students/<student_id>/cart")]
pub async fn clear_cart(student_id: &str, ctx: &State<AppContext>) -> ApiResult<Value> {
    ctx.carts.clear_cart(student_id).await?;
    ok(json!({ "cleared": true }))
}

#[post("/orders", format = "json", data = "<request>")]
pub async fn create_order(
    request: Json<CreateOrder>,
    ctx: &State<AppContext>,
) -> Result<Custom<Json<Envelope<OrderDetails>>>, ApiError> {
    let details = ctx.orders.create_order(request.into_inner()).await?;
    Ok(Custom(
        Status::Created,
        Json(Envelope {
            success: true,
            data: details,
        }),
    ))
}

#[get("/orders/<order_id>")]
pub async fn get_order(order_id: &str, ctx: &State<AppContext>) -> ApiResult<OrderDetails> {
    ok(ctx.orders.get_order(order_id).await?)
}

#[allow(clippy::too_many_arguments)]
#[get("/orders?<student_id>&<school_id>&<status>&<delivery_date>&<limit>&<offset>")]
pub async fn list_orders(
    student_id: Option<String>,
    school_id: Option<String>,
    status: Option<&str>,
    delivery_date: Option<&str>,
    limit: Option<u32>,
    offset: Option<u32>,
    ctx: &State<AppContext>,
) -> ApiResult<Vec<Order>> {
    let status = status
        .map(str::parse::<OrderStatus>)
        .transpose()
        .map_err(|e| OrderError::InvalidFilter(e.to_string()))?;
    let delivery_date = delivery_date
        .map(str::parse::<NaiveDate>)
        .transpose()
        .map_err(|e| OrderError::InvalidFilter(format!("delivery_date: {e}")))?;

    let filter = OrderFilter {
        student_id,
        school_id,
        status,
        delivery_date,
        limit,
        offset,
    };

    ok(ctx.orders.list_orders(&filter).await?)
}

#[derive(Debug, Deserialize)]
pub struct StatusUpdate {
    pub status: OrderStatus,
    #[serde(default)]
    pub message: Option<String>,
}

#[put("/orders/<order_id>/status", format = "json", data = "<request>")]
pub async fn update_order_status(
    order_id: &str,
    request: Json<StatusUpdate>,
    ctx: &State<AppContext>,
) -> ApiResult<Order> {
    ok(ctx
        .orders
        .update_order_status(order_id, request.status, request.message.as_deref())
        .await?)
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub reason: String,
}

#[post("/orders/<order_id>/cancel", format = "json", data = "<request>")]
pub async fn cancel_order(
    order_id: &str,
    request: Json<CancelRequest>,
    ctx: &State<AppContext>,
) -> ApiResult<Order> {
    ok(ctx.orders.cancel_order(order_id, &request.reason).await?)
}

#[post("/orders/<order_id>/payment", format = "json", data = "<request>")]
pub async fn process_payment(
    order_id: &str,
    request: Json<ProcessPayment>,
    ctx: &State<AppContext>,
) -> ApiResult<PaymentOutcome> {
    ok(ctx
        .orders
        .process_order_payment(order_id, request.into_inner())
        .await?)
}

#[post("/payments/webhook", data = "<body>")]
pub async fn payment_webhook(
    body: Vec<u8>,
    signature: WebhookSignature,
    ctx: &State<AppContext>,
) -> ApiResult<WebhookOutcome> {
    ok(ctx
        .orders
        .handle_payment_webhook(&body, &signature.0)
        .await?)
}

#[catch(400)]
pub fn bad_request(_request: &Request<'_>) -> ApiError {
    ApiError::new(Status::BadRequest, "BAD_REQUEST", "Malformed request")
}

#[catch(404)]
pub fn not_found(request: &Request<'_>) -> ApiError {
    ApiError::new(
        Status::NotFound,
        "NOT_FOUND",
        format!("No route for {} {}", request.method(), request.uri()),
    )
}

#[catch(422)]
pub fn unprocessable(_request: &Request<'_>) -> ApiError {
    ApiError::new(
        Status::UnprocessableEntity,
        "UNPROCESSABLE_ENTITY",
        "Request body does not match the expected shape",
    )
}

#[catch(500)]
pub fn internal_error(_request: &Request<'_>) -> ApiError {
    ApiError::new(
        Status::InternalServerError,
        "INTERNAL_ERROR",
        "Internal server error",
    )
}

pub fn routes() -> Vec<Route> {
    routes![
        health,
        school_menu,
        get_cart,
        add_cart_item,
        update_cart_item,
        remove_cart_item,
        clear_cart,
        create_order,
        get_order,
        list_orders,
        update_order_status,
        cancel_order,
        process_payment,
        payment_webhook,
    ]
}

pub fn catchers() -> Vec<Catcher> {
    catchers![bad_request, not_found, unprocessable, internal_error]
}

#[cfg(test)]
mod tests {
    use rocket::http::{ContentType, Header};
    use rocket::local::asynchronous::Client;

    use super::*;
    use crate::test_utils::{
        MenuItemBuilder, StudentBuilder, TEST_WEBHOOK_SECRET, TestHarness, captured_webhook,
        next_week,
    };
    use lunchbox_payments::sign_webhook_payload;

    async fn client() -> (Client, TestHarness) {
        let harness = TestHarness::new().await;
        harness
            .seed_menu(&[
                MenuItemBuilder::new("m-1")
                    .with_name("Paneer Wrap")
                    .with_price_cents(4_500),
                MenuItemBuilder::new("m-nuts").with_allergens(&["PEANUTS"]),
                MenuItemBuilder::new("m-off").unavailable(),
            ])
            .await;
        harness
            .seed_student(StudentBuilder::new("s-1").with_allergies(&["peanuts"]))
            .await;

        let rocket = rocket::build()
            .mount("/", routes())
            .register("/", catchers())
            .manage(harness.context());
        let client = Client::tracked(rocket)
            .await
            .expect("valid rocket instance");

        (client, harness)
    }

    async fn body(response: rocket::local::asynchronous::LocalResponse<'_>) -> Value {
        let text = response.into_string().await.expect("response body");
        serde_json::from_str(&text).expect("valid JSON response")
    }

    fn order_body(items: Value) -> String {
        json!({
            "studentId": "s-1",
            "schoolId": "school-1",
            "deliveryDate": next_week(),
            "deliveryTime": "12:30:00",
            "items": items,
        })
        .to_string()
    }

    #[test]
    fn test_num_of_routes() {
        assert_eq!(routes().len(), 14);
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (client, _) = client().await;

        let response = client.get("/health").dispatch().await;
        assert_eq!(response.status(), Status::Ok);

        let value = body(response).await;
        assert_eq!(value["success"], true);
        assert_eq!(value["data"]["status"], "healthy");
    }

    #[tokio::test]
    async fn test_menu_hides_unavailable_by_default() {
        let (client, _) = client().await;

        let value = body(client.get("/schools/school-1/menu").dispatch().await).await;
        let ids = value["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|item| item["id"].as_str().unwrap().to_string())
            .collect::<Vec<_>>();
        assert!(ids.contains(&"m-1".to_string()));
        assert!(!ids.contains(&"m-off".to_string()));

        let value = body(
            client
                .get("/schools/school-1/menu?available_only=false")
                .dispatch()
                .await,
        )
        .await;
        assert_eq!(value["data"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_cart_flow() {
        let (client, _) = client().await;

        let value = body(client.get("/students/s-1/cart").dispatch().await).await;
        assert_eq!(value["data"], Value::Null);

        for _ in 0..2 {
            let response = client
                .post("/students/s-1/cart/items")
                .header(ContentType::JSON)
                .body(json!({ "menuItemId": "m-1", "quantity": 3 }).to_string())
                .dispatch()
                .await;
            assert_eq!(response.status(), Status::Ok);
        }

        let value = body(client.get("/students/s-1/cart").dispatch().await).await;
        assert_eq!(value["data"]["items"][0]["quantity"], 6);
        assert_eq!(value["data"]["totalCents"], 27_000);

        let response = client
            .put("/students/s-1/cart/items/m-1")
            .header(ContentType::JSON)
            .body(json!({ "quantity": 2 }).to_string())
            .dispatch()
            .await;
        assert_eq!(body(response).await["data"]["totalCents"], 9_000);

        let response = client
            .delete("/students/s-1/cart/items/m-404")
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::NotFound);
        assert_eq!(body(response).await["error"]["code"], "CART_ITEM_NOT_FOUND");

        let response = client.delete("/students/s-1/cart").dispatch().await;
        assert_eq!(response.status(), Status::Ok);
    }

    #[tokio::test]
    async fn test_cart_quantity_limit() {
        let (client, _) = client().await;

        let response = client
            .post("/students/s-1/cart/items")
            .header(ContentType::JSON)
            .body(json!({ "menuItemId": "m-1", "quantity": 11 }).to_string())
            .dispatch()
            .await;

        assert_eq!(response.status(), Status::BadRequest);
        let value = body(response).await;
        assert_eq!(value["success"], false);
        assert_eq!(value["error"]["code"], "QUANTITY_EXCEEDED");
        assert_eq!(value["error"]["details"]["limit"], 10);
    }

    #[tokio::test]
    async fn test_create_and_fetch_order() {
        let (client, _) = client().await;

        let response = client
            .post("/orders")
            .header(ContentType::JSON)
            .body(order_body(json!([{ "menuItemId": "m-1", "quantity": 2 }])))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Created);

        let value = body(response).await;
        assert_eq!(value["data"]["status"], "PENDING");
        assert_eq!(value["data"]["totalCents"], 9_000);
        let order_id = value["data"]["id"].as_str().unwrap().to_string();

        let value = body(client.get(format!("/orders/{order_id}")).dispatch().await).await;
        assert_eq!(value["data"]["items"][0]["name"], "Paneer Wrap");
        assert_eq!(value["data"]["statusHistory"][0]["status"], "PENDING");

        let value = body(
            client
                .get("/orders?student_id=s-1&status=PENDING")
                .dispatch()
                .await,
        )
        .await;
        assert_eq!(value["data"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dietary_conflict_response() {
        let (client, _) = client().await;

        let response = client
            .post("/orders")
            .header(ContentType::JSON)
            .body(order_body(json!([{ "menuItemId": "m-nuts", "quantity": 1 }])))
            .dispatch()
            .await;

        assert_eq!(response.status(), Status::BadRequest);
        let value = body(response).await;
        assert_eq!(value["error"]["code"], "DIETARY_RESTRICTION_CONFLICT");
        assert_eq!(
            value["error"]["details"]["conflicts"][0]["menuItemId"],
            "m-nuts"
        );
    }

    #[tokio::test]
    async fn test_status_and_cancel_endpoints() {
        let (client, harness) = client().await;
        let order = harness.place_order("s-1").await;

        let response = client
            .put(format!("/orders/{}/status", order.id))
            .header(ContentType::JSON)
            .body(json!({ "status": "READY" }).to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Conflict);
        let value = body(response).await;
        assert_eq!(value["error"]["code"], "INVALID_STATUS_TRANSITION");
        assert_eq!(value["error"]["details"]["allowed"], json!(["CONFIRMED", "CANCELLED"]));

        let response = client
            .post(format!("/orders/{}/cancel", order.id))
            .header(ContentType::JSON)
            .body(json!({ "reason": "Sick day" }).to_string())
            .dispatch()
            .await;
        assert_eq!(body(response).await["data"]["status"], "CANCELLED");

        let response = client
            .post(format!("/orders/{}/cancel", order.id))
            .header(ContentType::JSON)
            .body(json!({ "reason": "again" }).to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Conflict);
    }

    #[tokio::test]
    async fn test_payment_and_webhook_endpoints() {
        let (client, harness) = client().await;
        let order = harness.place_order("s-1").await;

        let response = client
            .post(format!("/orders/{}/payment", order.id))
            .header(ContentType::JSON)
            .body(json!({ "method": "upi" }).to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        let value = body(response).await;
        assert_eq!(value["data"]["orderStatus"], "PENDING");
        let gateway_order_id = value["data"]["payment"]["gatewayOrderId"]
            .as_str()
            .unwrap()
            .to_string();

        let webhook = captured_webhook(&gateway_order_id, "pay_api", 4_500);

        let response = client
            .post("/payments/webhook")
            .body(webhook.clone())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Unauthorized);

        let signature = sign_webhook_payload(TEST_WEBHOOK_SECRET, &webhook).unwrap();
        let response = client
            .post("/payments/webhook")
            .header(Header::new(WEBHOOK_SIGNATURE_HEADER, signature))
            .body(webhook)
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        assert_eq!(body(response).await["data"]["outcome"], "ORDER_CONFIRMED");

        let value = body(client.get(format!("/orders/{}", order.id)).dispatch().await).await;
        assert_eq!(value["data"]["status"], "CONFIRMED");
    }

    #[tokio::test]
    async fn test_invalid_filter() {
        let (client, _) = client().await;

        let response = client.get("/orders?status=LOST").dispatch().await;
        assert_eq!(response.status(), Status::BadRequest);
        assert_eq!(body(response).await["error"]["code"], "INVALID_FILTER");
    }

    #[tokio::test]
    async fn test_unknown_order_and_route() {
        let (client, _) = client().await;

        let response = client.get("/orders/missing").dispatch().await;
        assert_eq!(response.status(), Status::NotFound);
        assert_eq!(body(response).await["error"]["code"], "ORDER_NOT_FOUND");

        let response = client.get("/nowhere").dispatch().await;
        assert_eq!(response.status(), Status::NotFound);
        assert_eq!(body(response).await["error"]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_malformed_json_uses_envelope() {
        let (client, _) = client().await;

        let response = client
            .post("/orders")
            .header(ContentType::JSON)
            .body("invalid json")
            .dispatch()
            .await;

        assert_eq!(response.status(), Status::BadRequest);
        assert_eq!(body(response).await["success"], false);
    }
}
