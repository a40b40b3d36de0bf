#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::{self, Body},
    http::{Method, Request},
    response::Response,
    Router,
};
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::{ActiveModelTrait, DatabaseConnection, Set};
use serde_json::Value;
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

use retail_fulfillment::{
    config::AppConfig,
    db::{self, DbConfig},
    entities::{combo_component, coupon, customer, product},
    events::{Event, EventSender},
    handlers,
    services::carriers::{
        CarrierClient, CarrierError, CarrierOrder, CarrierStatus, District, Province,
        QuoteRequest, ShipmentRequest, Ward,
    },
    services::orders::{Destination, OrderDraft},
    AppState,
};

pub async fn response_json(response: Response) -> Value {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    serde_json::from_slice(&bytes).expect("json response")
}

/// In-process carrier: books every order unless its number was marked for rejection.
#[derive(Default)]
pub struct FakeCarrier {
    booked: Mutex<Vec<ShipmentRequest>>,
    rejected: Mutex<HashSet<String>>,
    statuses: Mutex<HashMap<String, String>>,
}

impl FakeCarrier {
    pub fn reject(&self, order_number: &str) {
        self.rejected.lock().unwrap().insert(order_number.to_string());
    }

    pub fn accept(&self, order_number: &str) {
        self.rejected.lock().unwrap().remove(order_number);
    }

    pub fn set_status(&self, tracking_number: &str, code: &str) {
        self.statuses
            .lock()
            .unwrap()
            .insert(tracking_number.to_string(), code.to_string());
    }

    pub fn bookings(&self) -> Vec<ShipmentRequest> {
        self.booked.lock().unwrap().clone()
    }

    pub fn tracking_for(order_number: &str) -> String {
        format!("TRK-{}", order_number)
    }
}

#[async_trait]
impl CarrierClient for FakeCarrier {
    async fn quote(&self, _request: &QuoteRequest) -> Result<Decimal, CarrierError> {
        Ok(dec!(30000))
    }

    async fn create_order(&self, request: &ShipmentRequest) -> Result<CarrierOrder, CarrierError> {
        if self.rejected.lock().unwrap().contains(&request.client_order_code) {
            return Err(CarrierError::Rejected("Ward code is not served".into()));
        }
        self.booked.lock().unwrap().push(request.clone());
        Ok(CarrierOrder {
            tracking_number: Self::tracking_for(&request.client_order_code),
            fee: Some(dec!(30000)),
            expected_delivery: None,
        })
    }

    async fn get_tracking(&self, tracking_number: &str) -> Result<CarrierStatus, CarrierError> {
        let code = self
            .statuses
            .lock()
            .unwrap()
            .get(tracking_number)
            .cloned()
            .ok_or_else(|| CarrierError::Rejected("order not found".into()))?;
        Ok(CarrierStatus {
            tracking_number: tracking_number.to_string(),
            status_code: code,
            status_text: None,
            updated_at: None,
        })
    }

    async fn provinces(&self) -> Result<Vec<Province>, CarrierError> {
        Ok(vec![Province {
            id: 202,
            name: "Ho Chi Minh".into(),
        }])
    }

    async fn districts(&self, province_id: i32) -> Result<Vec<District>, CarrierError> {
        Ok(vec![District {
            id: 1442,
            province_id,
            name: "District 1".into(),
        }])
    }

    async fn wards(&self, district_id: i32) -> Result<Vec<Ward>, CarrierError> {
        Ok(vec![Ward {
            code: "20109".into(),
            district_id,
            name: "Ben Nghe".into(),
        }])
    }
}

/// Application state over a fresh in-memory SQLite database.
pub struct TestApp {
    pub db: Arc<DatabaseConnection>,
    pub state: AppState,
    pub carrier: Arc<FakeCarrier>,
    pub tenant_id: Uuid,
    pub warehouse_id: Uuid,
    events: Mutex<mpsc::Receiver<Event>>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(adjust: impl FnOnce(&mut AppConfig)) -> Self {
        let mut cfg = AppConfig::new("sqlite::memory:".to_string(), "test".to_string());
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        cfg.dispatch_concurrency = 3;
        adjust(&mut cfg);

        // One connection keeps the in-memory database alive for the whole test.
        let pool = db::establish_connection_with_config(&DbConfig {
            url: cfg.database_url.clone(),
            max_connections: 1,
            min_connections: 1,
            idle_timeout: Duration::from_secs(3600),
            ..DbConfig::default()
        })
        .await
        .expect("connect to sqlite");
        db::run_migrations(&pool).await.expect("run migrations");

        let db = Arc::new(pool);
        let (tx, rx) = mpsc::channel(10_000);
        let carrier = Arc::new(FakeCarrier::default());
        let state = AppState::new(db.clone(), cfg, EventSender::new(tx), carrier.clone());

        Self {
            db,
            state,
            carrier,
            tenant_id: Uuid::new_v4(),
            warehouse_id: Uuid::new_v4(),
            events: Mutex::new(rx),
        }
    }

    pub fn services(&self) -> &handlers::AppServices {
        &self.state.services
    }

    pub fn router(&self) -> Router {
        handlers::router(self.state.clone())
    }

    /// Sends one request through the full router.
    pub async fn request(&self, method: Method, path: &str, body: Option<Value>) -> Response {
        let body = body.map(|v| serde_json::to_vec(&v).expect("serialize body"));
        self.send(method, path, body.unwrap_or_default(), &[]).await
    }

    pub async fn send(
        &self,
        method: Method,
        path: &str,
        body: Vec<u8>,
        headers: &[(&str, &str)],
    ) -> Response {
        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header("content-type", "application/json");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        self.router()
            .oneshot(builder.body(Body::from(body)).expect("build request"))
            .await
            .expect("router is infallible")
    }

    /// Events published so far, oldest first.
    pub fn drain_events(&self) -> Vec<Event> {
        let mut rx = self.events.lock().unwrap();
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    pub async fn product(&self, sku: &str, price: Decimal) -> Uuid {
        self.insert_product(sku, price, false).await
    }

    async fn insert_product(&self, sku: &str, price: Decimal, is_combo: bool) -> Uuid {
        product::ActiveModel {
            id: Set(Uuid::new_v4()),
            tenant_id: Set(self.tenant_id),
            sku: Set(sku.to_string()),
            name: Set(format!("Product {}", sku)),
            price: Set(price),
            is_combo: Set(is_combo),
            created_at: Set(Utc::now()),
        }
        .insert(&*self.db)
        .await
        .expect("insert product")
        .id
    }

    /// A combo made of `(child, units_per_combo)` components.
    pub async fn combo(&self, sku: &str, price: Decimal, components: &[(Uuid, i32)]) -> Uuid {
        let combo_id = self.insert_product(sku, price, true).await;
        for (child, units) in components {
            combo_component::ActiveModel {
                id: Set(Uuid::new_v4()),
                combo_id: Set(combo_id),
                child_product_id: Set(*child),
                units_per_combo: Set(*units),
            }
            .insert(&*self.db)
            .await
            .expect("insert combo component");
        }
        combo_id
    }

    pub async fn stock(&self, product_id: Uuid, quantity: i32) {
        self.services()
            .inventory
            .set_stock(self.warehouse_id, product_id, quantity)
            .await
            .expect("set stock");
    }

    pub async fn available(&self, product_id: Uuid) -> i32 {
        self.services()
            .inventory
            .available(self.warehouse_id, product_id)
            .await
            .expect("read stock")
    }

    pub async fn customer(&self, phone: &str, points: i32) -> Uuid {
        let id = customer::ActiveModel {
            id: Set(Uuid::new_v4()),
            tenant_id: Set(self.tenant_id),
            phone: Set(phone.to_string()),
            name: Set("Lan".to_string()),
            available_points: Set(0),
            created_at: Set(Utc::now()),
        }
        .insert(&*self.db)
        .await
        .expect("insert customer")
        .id;
        if points != 0 {
            self.services()
                .loyalty
                .adjust(id, points)
                .await
                .expect("seed points");
        }
        id
    }

    /// `SAVE10`: 10% off, capped at 50,000, on orders from 100,000.
    pub async fn save10(&self) -> coupon::Model {
        coupon::ActiveModel {
            id: Set(Uuid::new_v4()),
            tenant_id: Set(self.tenant_id),
            code: Set("SAVE10".to_string()),
            coupon_type: Set(coupon::CouponType::Percentage),
            value: Set(dec!(10)),
            max_discount: Set(Some(dec!(50000))),
            min_order_value: Set(dec!(100000)),
            usage_limit: Set(Some(100)),
            per_customer_limit: Set(None),
            usage_count: Set(0),
            starts_at: Set(None),
            ends_at: Set(None),
            is_active: Set(true),
            applicable_products: Set(None),
            created_at: Set(Utc::now()),
        }
        .insert(&*self.db)
        .await
        .expect("insert coupon")
    }

    /// A guest draft with a complete destination.
    pub fn draft(&self) -> OrderDraft {
        let mut draft = OrderDraft::new(self.tenant_id, self.warehouse_id);
        draft.customer_phone = Some("0901234567".to_string());
        draft.recipient_name = Some("Lan".to_string());
        draft.destination = Destination {
            province_id: Some(202),
            district_id: Some(1442),
            ward_code: Some("20109".to_string()),
            street: Some("12 Le Loi".to_string()),
        };
        draft
    }
}
