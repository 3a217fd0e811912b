#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::{self, Body},
    http::{HeaderMap, Method, Request},
    response::Response,
    Router,
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

use anime_store_api::{
    auth::Claims,
    config::AppConfig,
    db::{self, DbConfig, DbPool},
    entities::{cart_item, order, pending_payment, product},
    events::{self, Event, EventSender},
    gateway::{
        sign_payload, verify_signature, CheckoutSessionRequest, GatewayError, GatewaySession,
        GatewaySessionStatus, PaymentGateway, EVENT_SESSION_COMPLETED, SIGNATURE_HEADER,
    },
    AppState,
};

pub const JWT_SECRET: &str = "test_secret_key_for_testing_purposes_only_32chars";
pub const WEBHOOK_SECRET: &str = "whsec_test_secret";

/// In-process stand-in for the hosted checkout provider.
///
/// Sessions are numbered `cs_test_1`, `cs_test_2`, ... and webhooks are
/// checked with the real signature scheme.
#[derive(Default)]
pub struct FakeGateway {
    pub requests: Mutex<Vec<CheckoutSessionRequest>>,
    pub fail_creation: Mutex<bool>,
    pub session_status: Mutex<Option<GatewaySessionStatus>>,
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest,
    ) -> Result<GatewaySession, GatewayError> {
        if *self.fail_creation.lock().unwrap() {
            return Err(GatewayError::Http("connection refused".into()));
        }
        let mut requests = self.requests.lock().unwrap();
        requests.push(request.clone());
        let id = format!("cs_test_{}", requests.len());
        Ok(GatewaySession {
            url: Some(format!("https://checkout.example.com/pay/{id}")),
            id,
            status: GatewaySessionStatus::Open,
            payment_status: Some("unpaid".into()),
        })
    }

    fn verify_webhook_signature(
        &self,
        payload: &[u8],
        headers: &HeaderMap,
    ) -> Result<(), GatewayError> {
        let header = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
        verify_signature(payload, header, WEBHOOK_SECRET, 300, Utc::now().timestamp())
    }

    async fn retrieve_session(&self, session_id: &str) -> Result<GatewaySession, GatewayError> {
        let status = self
            .session_status
            .lock()
            .unwrap()
            .unwrap_or(GatewaySessionStatus::Open);
        Ok(GatewaySession {
            id: session_id.to_string(),
            url: None,
            status,
            payment_status: None,
        })
    }
}

/// Application over a SQLite database and a [`FakeGateway`].
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub db: Arc<DbPool>,
    pub gateway: Arc<FakeGateway>,
    events: Arc<Mutex<Vec<Event>>>,
    _event_task: tokio::task::JoinHandle<()>,
    _db_dir: Option<TempDir>,
}

impl TestApp {
    /// In-memory database behind a single connection
    pub async fn new() -> Self {
        // a single connection keeps every query on the same in-memory database
        Self::build("sqlite::memory:".to_string(), 1, None).await
    }

    /// File-backed database with a real connection pool, so concurrent
    /// requests run on separate connections and contend for SQLite's write lock.
    pub async fn file_backed() -> Self {
        let dir = TempDir::new().expect("create database directory");
        let url = format!(
            "sqlite://{}?mode=rwc",
            dir.path().join("checkout.db").display()
        );
        Self::build(url, 4, Some(dir)).await
    }

    async fn build(database_url: String, max_connections: u32, db_dir: Option<TempDir>) -> Self {
        let mut cfg = AppConfig::new(
            database_url,
            JWT_SECRET.to_string(),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
        );
        cfg.payment_gateway_api_key = "sk_test_key".into();
        cfg.payment_webhook_secret = WEBHOOK_SECRET.into();
        cfg.max_line_quantity = 10;

        let pool = db::establish_connection_with_config(&DbConfig {
            url: cfg.database_url.clone(),
            max_connections,
            min_connections: 1,
            ..Default::default()
        })
        .await
        .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");
        let db = Arc::new(pool);

        let (event_tx, mut event_rx) = mpsc::channel::<Event>(256);
        let (log_tx, log_rx) = mpsc::channel(256);
        let events = Arc::new(Mutex::new(Vec::new()));
        let recorded = events.clone();
        // records every event, then hands it to the regular logging consumer
        let event_task = tokio::spawn(async move {
            let logger = tokio::spawn(events::process_events(log_rx));
            while let Some(event) = event_rx.recv().await {
                recorded.lock().unwrap().push(event.clone());
                let _ = log_tx.send(event).await;
            }
            drop(log_tx);
            let _ = logger.await;
        });
        let gateway = Arc::new(FakeGateway::default());

        let state = AppState::new(
            db.clone(),
            cfg,
            gateway.clone(),
            EventSender::new(event_tx),
        );
        let router = anime_store_api::build_router(state.clone());

        Self {
            router,
            state,
            db,
            gateway,
            events,
            _event_task: event_task,
            _db_dir: db_dir,
        }
    }

    /// Domain events raised so far
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Waits up to two seconds for an event matching `pred`
    pub async fn wait_for_event(&self, pred: impl Fn(&Event) -> bool) -> Event {
        let found = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(event) = self.events().into_iter().find(|e| pred(e)) {
                    return event;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        match found {
            Ok(event) => event,
            Err(_) => panic!("expected event not raised; saw {:?}", self.events()),
        }
    }

    /// Bearer token for `user_id` with the given roles
    pub fn token_for(&self, user_id: Uuid, roles: &[&str]) -> String {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: user_id.to_string(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
            jti: Some(Uuid::new_v4().to_string()),
            iat: now,
            exp: now + 3600,
            iss: self.state.config.auth_issuer.clone(),
            aud: self.state.config.auth_audience.clone(),
        };
        jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
            &claims,
            &jsonwebtoken::EncodingKey::from_secret(JWT_SECRET.as_bytes()),
        )
        .expect("encode access token")
    }

    /// Send a request against the router with an optional bearer token.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);

        if let Some(tok) = token {
            builder = builder.header("authorization", format!("Bearer {}", tok));
        }

        let body = if let Some(json) = body {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("failed to serialize json request body"))
        } else {
            Body::empty()
        };

        let request = builder.body(body).expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    /// Posts a raw webhook body with an optional `Stripe-Signature` header
    pub async fn post_webhook_raw(&self, body: Vec<u8>, signature: Option<String>) -> Response {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri("/api/v1/checkout/webhook")
            .header("content-type", "application/json");
        if let Some(sig) = signature {
            builder = builder.header(SIGNATURE_HEADER, sig);
        }
        let request = builder.body(Body::from(body)).expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during webhook request")
    }

    /// Posts `event` signed with the test webhook secret
    pub async fn post_webhook(&self, event: &Value) -> Response {
        let body = serde_json::to_vec(event).expect("serialize event");
        let signature = sign_payload(WEBHOOK_SECRET, Utc::now().timestamp(), &body);
        self.post_webhook_raw(body, Some(signature)).await
    }

    pub async fn seed_product(&self, name: &str, price: Decimal, stock: i32) -> Uuid {
        let id = Uuid::new_v4();
        product::ActiveModel {
            id: Set(id),
            name: Set(name.to_string()),
            price: Set(price),
            currency: Set("USD".into()),
            is_active: Set(true),
            stock: Set(stock),
            sold: Set(0),
            created_at: Set(Utc::now()),
            updated_at: Set(Utc::now()),
        }
        .insert(&*self.db)
        .await
        .expect("insert product");
        id
    }

    pub async fn seed_cart_item(&self, user_id: Uuid, product_id: Uuid, quantity: i32) {
        cart_item::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            product_id: Set(product_id),
            quantity: Set(quantity),
            created_at: Set(Utc::now()),
        }
        .insert(&*self.db)
        .await
        .expect("insert cart item");
    }

    /// (stock, sold) of a product
    pub async fn stock_of(&self, product_id: Uuid) -> (i32, i32) {
        let p = product::Entity::find_by_id(product_id)
            .one(&*self.db)
            .await
            .expect("query product")
            .expect("product exists");
        (p.stock, p.sold)
    }

    pub async fn orders(&self) -> Vec<order::Model> {
        order::Entity::find()
            .all(&*self.db)
            .await
            .expect("query orders")
    }

    pub async fn cart_of(&self, user_id: Uuid) -> Vec<cart_item::Model> {
        cart_item::Entity::find()
            .filter(cart_item::Column::UserId.eq(user_id))
            .all(&*self.db)
            .await
            .expect("query cart")
    }

    pub async fn pending_payment(&self, id: Uuid) -> pending_payment::Model {
        pending_payment::Entity::find_by_id(id)
            .one(&*self.db)
            .await
            .expect("query pending payment")
            .expect("pending payment exists")
    }

    /// Starts a checkout for `user_id` through the HTTP API and returns the response body
    pub async fn start_checkout(&self, user_id: Uuid, items: Value) -> (u16, Value) {
        let token = self.token_for(user_id, &[]);
        let response = self
            .request(
                Method::POST,
                "/api/v1/checkout/session",
                Some(json!({ "items": items })),
                Some(&token),
            )
            .await;
        let status = response.status().as_u16();
        (status, response_json(response).await)
    }
}

/// `checkout.session.completed` event for a paid session
pub fn paid_session_event(session_id: &str, pending_payment_id: &str) -> Value {
    json!({
        "id": format!("evt_{}", Uuid::new_v4().simple()),
        "type": EVENT_SESSION_COMPLETED,
        "data": {"object": {
            "id": session_id,
            "object": "checkout.session",
            "payment_status": "paid",
            "client_reference_id": pending_payment_id,
            "metadata": {"correlation_id": pending_payment_id}
        }}
    })
}

pub async fn response_json(response: Response) -> Value {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(&bytes).expect("json response")
}
