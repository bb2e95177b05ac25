#![allow(dead_code)]

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    Router,
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, ActiveValue::Set, EntityTrait, PaginatorTrait};
use serde_json::{json, Value};
use storefront_api::{
    auth::{AuthConfig, AuthService, ADMIN_ROLE},
    config::AppConfig,
    db,
    entities::{
        commerce::{coupon, product_variant, DiscountType},
        order, product,
    },
    errors::ServiceError,
    events::{self, EventSender},
    handlers::AppServices,
    notifications::{Notification, NotificationDispatcher},
    services::{
        orders::{CustomerInfo, NewOrder},
        payment_gateway::{self, GatewayCharge, PaymentGateway},
        pricing::LineRequest,
    },
    AppState,
};
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

pub const WEBHOOK_SECRET: &str = "whsec_test_callback_signing_secret";

/// Gateway double: hands out sequential charge ids and echoes the amount.
#[derive(Default)]
pub struct FakeGateway {
    calls: AtomicUsize,
    fail: AtomicBool,
    /// Added to the echoed amount to simulate a gateway that disagrees
    skew: AtomicI64,
}

impl FakeGateway {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn fail_next_charges(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn skew_amount(&self, by: i64) {
        self.skew.store(by, Ordering::SeqCst);
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_charge(
        &self,
        amount_minor: i64,
        currency: &str,
        _idempotency_key: &str,
    ) -> Result<GatewayCharge, ServiceError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail.load(Ordering::SeqCst) {
            return Err(ServiceError::PaymentInitializationFailed(
                "gateway unavailable".to_string(),
            ));
        }
        Ok(GatewayCharge {
            gateway_order_id: format!("order_test_{n:04}"),
            amount: amount_minor + self.skew.load(Ordering::SeqCst),
            currency: currency.to_string(),
        })
    }
}

/// Dispatcher double that keeps every message it is handed.
#[derive(Default)]
pub struct RecordingDispatcher {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingDispatcher {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

impl NotificationDispatcher for RecordingDispatcher {
    fn send(&self, to: &str, subject: &str, body_html: &str) {
        self.sent.lock().unwrap().push(Notification {
            to: to.to_string(),
            subject: subject.to_string(),
            body_html: body_html.to_string(),
        });
    }
}

/// Helper harness for spinning up an application state backed by an in-memory SQLite database.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub gateway: Arc<FakeGateway>,
    pub mailer: Arc<RecordingDispatcher>,
    auth_service: Arc<AuthService>,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        let mut cfg = AppConfig::new(
            "sqlite::memory:".to_string(),
            "test_secret_key_for_testing_purposes_only_32chars".to_string(),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        // In-memory SQLite lives on a single connection
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        cfg.gateway_webhook_secret = Some(WEBHOOK_SECRET.to_string());

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let db_arc = Arc::new(pool);
        let (event_tx, event_rx) = mpsc::channel(256);
        let event_sender = Arc::new(EventSender::new(event_tx));
        let event_task = tokio::spawn(events::process_events(event_rx));

        let gateway = Arc::new(FakeGateway::default());
        let mailer = Arc::new(RecordingDispatcher::default());
        let auth_service = Arc::new(AuthService::new(AuthConfig::from(&cfg)));

        let services = AppServices::new(
            db_arc.clone(),
            event_sender,
            gateway.clone(),
            mailer.clone(),
            &cfg,
        );

        let state = AppState {
            db: db_arc,
            config: Arc::new(cfg),
            auth: auth_service.clone(),
            services,
        };

        Self {
            router: storefront_api::app_router(state.clone()),
            state,
            gateway,
            mailer,
            auth_service,
            _event_task: event_task,
        }
    }

    pub fn token_for(&self, user_id: Uuid) -> String {
        self.auth_service
            .issue_token(
                user_id,
                Some("customer@example.com".to_string()),
                vec!["customer".to_string()],
                chrono::Duration::minutes(15),
            )
            .expect("issue customer token")
    }

    pub fn admin_token(&self) -> String {
        self.auth_service
            .issue_token(
                Uuid::new_v4(),
                Some("ops@example.com".to_string()),
                vec![ADMIN_ROLE.to_string()],
                chrono::Duration::minutes(15),
            )
            .expect("issue admin token")
    }

    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> axum::response::Response {
        let mut builder = Request::builder().method(method).uri(uri);

        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }

        let request = if let Some(json_body) = body {
            builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json_body.to_string()))
                .expect("request body")
        } else {
            builder.body(Body::empty()).expect("request")
        };

        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router response")
    }

    pub async fn seed_product(&self, name: &str, price: Decimal, stock: i32) -> product::Model {
        product::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            sku: Set(format!("SKU-{}", Uuid::new_v4().simple())),
            price: Set(price),
            stock_quantity: Set(stock),
            ..Default::default()
        }
        .insert(&*self.state.db)
        .await
        .expect("seed product")
    }

    pub async fn seed_variant(
        &self,
        product_id: Uuid,
        name: &str,
        price: Decimal,
        stock: i32,
    ) -> product_variant::Model {
        let now = Utc::now();
        product_variant::ActiveModel {
            id: Set(Uuid::new_v4()),
            product_id: Set(product_id),
            sku: Set(format!("VAR-{}", Uuid::new_v4().simple())),
            name: Set(name.to_string()),
            price: Set(price),
            stock_quantity: Set(stock),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed variant")
    }

    pub async fn seed_coupon(
        &self,
        code: &str,
        discount_type: DiscountType,
        value: Decimal,
        min_order_amount: Option<Decimal>,
        usage_limit: Option<i32>,
    ) -> coupon::Model {
        let now = Utc::now();
        coupon::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(coupon::normalize_code(code)),
            discount_type: Set(discount_type),
            discount_value: Set(value),
            min_order_amount: Set(min_order_amount),
            usage_limit: Set(usage_limit),
            usage_count: Set(0),
            expires_at: Set(None),
            is_active: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed coupon")
    }

    pub async fn product(&self, id: Uuid) -> product::Model {
        product::Entity::find_by_id(id)
            .one(&*self.state.db)
            .await
            .expect("load product")
            .expect("product exists")
    }

    pub async fn variant(&self, id: Uuid) -> product_variant::Model {
        product_variant::Entity::find_by_id(id)
            .one(&*self.state.db)
            .await
            .expect("load variant")
            .expect("variant exists")
    }

    pub async fn coupon(&self, code: &str) -> coupon::Model {
        self.state
            .services
            .coupons
            .find_by_code(code)
            .await
            .expect("load coupon")
            .expect("coupon exists")
    }

    pub async fn order(&self, id: Uuid) -> order::Model {
        order::Entity::find_by_id(id)
            .one(&*self.state.db)
            .await
            .expect("load order")
            .expect("order exists")
    }

    pub async fn order_count(&self) -> u64 {
        order::Entity::find()
            .count(&*self.state.db)
            .await
            .expect("count orders")
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self._event_task.abort();
    }
}

/// Signature the gateway would attach to a successful payment.
pub fn sign(gateway_order_id: &str, gateway_payment_id: &str) -> String {
    payment_gateway::sign(gateway_order_id, gateway_payment_id, WEBHOOK_SECRET)
}

pub fn new_order(items: Vec<LineRequest>, coupon_code: Option<&str>) -> NewOrder {
    NewOrder {
        customer: CustomerInfo {
            name: "Asha Rao".to_string(),
            email: "Asha@Example.com".to_string(),
            phone: Some("+919800000000".to_string()),
        },
        shipping_address: order::ShippingAddress {
            line1: "12 MG Road".to_string(),
            line2: None,
            city: "Bengaluru".to_string(),
            state: "KA".to_string(),
            postal_code: "560001".to_string(),
            country: "IN".to_string(),
        },
        shipping_method: order::ShippingMethod::Standard,
        items,
        coupon_code: coupon_code.map(str::to_string),
    }
}

pub fn line(product_id: Uuid, quantity: i32) -> LineRequest {
    LineRequest {
        product_id,
        variant_id: None,
        quantity,
        client_unit_price: None,
    }
}

pub fn order_request_json(product_id: Uuid, quantity: i32, coupon_code: Option<&str>) -> Value {
    json!({
        "customer": { "name": "Asha Rao", "email": "asha@example.com" },
        "shipping_address": {
            "line1": "12 MG Road",
            "city": "Bengaluru",
            "state": "KA",
            "postal_code": "560001",
            "country": "IN"
        },
        "items": [{ "id": product_id, "quantity": quantity }],
        "coupon_code": coupon_code,
    })
}

pub async fn response_json(response: axum::response::Response) -> (StatusCode, Value) {
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    let value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).expect("json body")
    };
    (status, value)
}

/// Decimal fields serialize as strings.
pub fn decimal_field(value: &Value) -> Decimal {
    match value {
        Value::String(s) => Decimal::from_str(s).expect("decimal string"),
        Value::Number(n) => Decimal::from_str(&n.to_string()).expect("decimal number"),
        other => panic!("expected decimal, got {other}"),
    }
}
