#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{body::Body, http::Request, Router};
use chrono::Utc;
use sea_orm::{ActiveModelTrait, Set};
use serde_json::Value;
use storefront_fulfillment::{
    config::AppConfig,
    db,
    entities::{address, offer, product, AddressModel, OfferModel, ProductModel},
    events::{self, EventSender},
    handlers::AppServices,
    notifications::{Notification, NotificationDispatcher, NotificationError, Notifier},
    payments::{GatewayOrder, GatewayOrderRequest, PaymentGateway, PaymentGatewayError},
    services::{cart::CartOwner, orders::OrderCollaborators},
    shipping::{
        CarrierClient, CarrierError, CarrierShipment, ShipmentRequest, TrackingInfo, TrackingQuery,
    },
    AppState,
};
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

pub const TEST_PAYMENT_SECRET: &str = "test_payment_secret";
pub const OPERATOR_EMAIL: &str = "ops@example.com";

/// Carrier double: records every create call and hands out sequential waybills.
/// Scripted failures are consumed front to back before successes resume.
#[derive(Default)]
pub struct FakeCarrier {
    pub requests: Mutex<Vec<ShipmentRequest>>,
    failures: Mutex<VecDeque<CarrierError>>,
    issued: AtomicUsize,
    latency: Mutex<Option<Duration>>,
}

impl FakeCarrier {
    /// Every create call waits this long before answering.
    pub fn respond_after(&self, latency: Duration) {
        *self.latency.lock().unwrap() = Some(latency);
    }

    pub fn fail_next(&self, err: CarrierError) {
        self.failures.lock().unwrap().push_back(err);
    }

    pub fn fail_times(&self, times: usize) {
        for _ in 0..times {
            self.fail_next(CarrierError::Status {
                status: 503,
                body: "carrier unavailable".into(),
            });
        }
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn last_request(&self) -> Option<ShipmentRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl CarrierClient for FakeCarrier {
    async fn create_shipment(
        &self,
        request: &ShipmentRequest,
    ) -> Result<CarrierShipment, CarrierError> {
        self.requests.lock().unwrap().push(request.clone());
        let latency = *self.latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(CarrierShipment {
            waybill: format!("WB{:06}", n),
            order_ref: request.order_ref.clone(),
            status: "Manifested".into(),
            sort_code: Some("BLR/NOR".into()),
        })
    }

    async fn track(&self, query: &TrackingQuery) -> Result<TrackingInfo, CarrierError> {
        let location = match query {
            TrackingQuery::Waybill(w) => format!("hub for {}", w),
            TrackingQuery::OrderRef(r) => format!("hub for {}", r),
        };
        Ok(TrackingInfo {
            status: "In Transit".into(),
            location: Some(location),
            expected_delivery: Some("2026-10-25".into()),
        })
    }
}

#[derive(Default)]
pub struct FakeGateway {
    pub requests: Mutex<Vec<GatewayOrderRequest>>,
}

impl FakeGateway {
    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_order(
        &self,
        request: GatewayOrderRequest,
    ) -> Result<GatewayOrder, PaymentGatewayError> {
        let mut requests = self.requests.lock().unwrap();
        requests.push(request.clone());
        Ok(GatewayOrder {
            id: format!("order_gw_{}", requests.len()),
            amount: request.amount,
            currency: request.currency,
            status: Some("created".into()),
        })
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotificationError> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

/// Application wiring over an in-memory SQLite database with fake collaborators.
pub struct TestContext {
    pub state: AppState,
    pub carrier: Arc<FakeCarrier>,
    pub gateway: Arc<FakeGateway>,
    pub notifier: Arc<RecordingNotifier>,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestContext {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(customize: impl FnOnce(&mut AppConfig)) -> Self {
        let mut cfg = AppConfig::new("sqlite::memory:".to_string(), "test".to_string());
        // one connection: every pooled connection would otherwise get its own database
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        cfg.payment.key_id = "key_test".to_string();
        cfg.payment.key_secret = TEST_PAYMENT_SECRET.to_string();
        cfg.carrier.timeout_secs = 5;
        cfg.payment.timeout_secs = 5;
        cfg.notifications.operator_address = Some(OPERATOR_EMAIL.to_string());
        customize(&mut cfg);

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let db_arc = Arc::new(pool);
        let cfg = Arc::new(cfg);
        let (event_tx, event_rx) = mpsc::channel(256);
        let event_sender = Arc::new(EventSender::new(event_tx));
        let event_task = tokio::spawn(events::process_events(event_rx));

        let carrier = Arc::new(FakeCarrier::default());
        let gateway = Arc::new(FakeGateway::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let collaborators = OrderCollaborators {
            carrier: carrier.clone(),
            gateway: gateway.clone(),
            notifications: NotificationDispatcher::new(
                notifier.clone(),
                cfg.notifications.operator_address.clone(),
            ),
        };

        let services = AppServices::new(
            db_arc.clone(),
            event_sender.clone(),
            cfg.clone(),
            collaborators,
        );

        Self {
            state: AppState {
                db: db_arc,
                config: cfg,
                event_sender,
                services,
            },
            carrier,
            gateway,
            notifier,
            _event_task: event_task,
        }
    }

    pub fn services(&self) -> &AppServices {
        &self.state.services
    }

    pub fn router(&self) -> Router {
        storefront_fulfillment::app_router(self.state.clone())
    }

    pub fn guest() -> CartOwner {
        CartOwner::Session(format!("sess-{}", Uuid::new_v4()))
    }

    pub async fn seed_product(&self, name: &str, base_price: i64) -> ProductModel {
        product::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            base_price: Set(base_price),
            active: Set(true),
            created_at: Set(Utc::now()),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed product")
    }

    pub async fn seed_offer(
        &self,
        product_id: Uuid,
        discount_percent: i32,
        min_quantity: i32,
    ) -> OfferModel {
        offer::ActiveModel {
            id: Set(Uuid::new_v4()),
            product_id: Set(product_id),
            discount_percent: Set(discount_percent),
            min_quantity: Set(min_quantity),
            active: Set(true),
            created_at: Set(Utc::now()),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed offer")
    }

    pub async fn seed_default_address(
        &self,
        owner: &CartOwner,
        email: Option<&str>,
    ) -> AddressModel {
        address::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(owner.user_id()),
            session_id: Set(owner.session_id()),
            name: Set("Asha Rao".to_string()),
            phone: Set("+91 98765-43210".to_string()),
            email: Set(email.map(str::to_string)),
            line1: Set("12 MG Road".to_string()),
            line2: Set(Some("Flat 4".to_string())),
            city: Set("Bengaluru".to_string()),
            state: Set("Karnataka".to_string()),
            pincode: Set("560001".to_string()),
            country: Set("India".to_string()),
            is_default: Set(true),
            created_at: Set(Utc::now()),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed address")
    }

    /// Waits for fire-and-forget notifications to land.
    pub async fn settle(&self) {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    pub async fn request(&self, request: Request<Body>) -> (axum::http::StatusCode, Value) {
        let response = self
            .router()
            .oneshot(request)
            .await
            .expect("router call");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body");
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("json body")
        };
        (status, body)
    }
}
