//! Storefront fulfillment backend
//!
//! Prices carts, turns them into orders, confirms payment and creates exactly
//! one carrier shipment per order, with a durable retry queue behind every
//! failed carrier call.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod migrator;
pub mod notifications;
pub mod payments;
pub mod pricing;
pub mod retry_queue;
pub mod services;
pub mod shipping;
pub mod tracing;

use axum::Router;
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer};


// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: Arc<config::AppConfig>,
    pub event_sender: Arc<events::EventSender>,
    pub services: handlers::AppServices,
}

/// Versioned API routes
pub fn api_v1_routes() -> Router<AppState> {
    Router::new()
        .merge(handlers::cart::cart_routes())
        .merge(handlers::orders::orders_routes())
        .merge(handlers::shipments::shipments_routes())
        .merge(handlers::retry_jobs::retry_jobs_routes())
}

/// Full application router with request ids, HTTP tracing, CORS and a request timeout.
pub fn app_router(state: AppState) -> Router {
    let cors = if state.config.is_production() {
        CorsLayer::new()
    } else {
        CorsLayer::permissive()
    };

    Router::new()
        .merge(handlers::health::health_routes())
        .nest("/api/v1", api_v1_routes())
        .layer(TimeoutLayer::new(Duration::from_secs(
            config::REQUEST_TIMEOUT_SECS,
        )))
        .layer(crate::tracing::configure_http_tracing())
        .layer(cors)
        // Ensure every request carries a request id for traceability
        .layer(axum::middleware::from_fn(
            crate::tracing::request_id_middleware,
        ))
        .with_state(state)
}
