//! Roadside assistance dispatch service
//!
//! Drivers post emergencies, nearby shops answer with priced offers, and the
//! driver accepts exactly one. Acceptance, payment materialization and the
//! notification fan-out live behind a single server-side entry point.

pub mod config;
pub mod db;
pub mod error;
pub mod feed;
pub mod geo;
pub mod handlers;
pub mod models;
pub mod services;
pub mod sync;

#[cfg(test)]
pub(crate) mod testutil;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;
use crate::db::DbPool;
use crate::feed::ChangeFeed;

/// ハンドラ・サービス共通の状態
pub struct AppState {
    pub db: DbPool,
    pub feed: ChangeFeed,
    pub config: AppConfig,
}

impl AppState {
    pub fn new(db: DbPool, config: AppConfig) -> Self {
        let feed = ChangeFeed::new(config.feed_capacity);
        Self { db, feed, config }
    }
}

/// ルーター構築
pub fn build_router(state: Arc<AppState>) -> Router {
    use handlers::{emergencies, notifications, payments, service_requests, shops};

    Router::new()
        .route("/api/health", get(handlers::health_check))
        // Shops
        .route("/api/shops", post(shops::register_shop))
        .route("/api/shops/me/service-requests", get(shops::list_my_service_requests))
        .route("/api/shops/:shop_id", get(shops::get_shop))
        // Emergencies
        .route(
            "/api/emergencies",
            get(emergencies::list_my_emergencies).post(emergencies::create_emergency),
        )
        .route("/api/emergencies/:emergency_id", get(emergencies::get_emergency))
        .route("/api/emergencies/:emergency_id/cancel", post(emergencies::cancel_emergency))
        .route("/api/emergencies/:emergency_id/hide", post(emergencies::hide_emergency))
        .route(
            "/api/emergencies/:emergency_id/offers",
            get(service_requests::list_offers).post(service_requests::submit_offer),
        )
        .route(
            "/api/emergencies/:emergency_id/offers/stream",
            get(service_requests::stream_offers),
        )
        .route(
            "/api/emergencies/:emergency_id/service-requests",
            post(service_requests::submit_service_request),
        )
        .route(
            "/api/emergencies/:emergency_id/service-requests/:service_id/accept",
            post(service_requests::accept_offer),
        )
        .route(
            "/api/emergencies/:emergency_id/service-requests/:service_id/reject",
            post(service_requests::reject_offer),
        )
        .route(
            "/api/emergencies/:emergency_id/payment",
            get(payments::get_payment_for_emergency),
        )
        // Payments
        .route("/api/payments/:transaction_id", get(payments::get_payment))
        .route("/api/payments/:transaction_id/bill", post(payments::update_bill))
        .route("/api/payments/:transaction_id/pay", post(payments::mark_paid))
        // Notifications
        .route(
            "/api/notifications",
            get(notifications::list_notifications).post(notifications::send_notification),
        )
        .route("/api/notifications/unread_count", get(notifications::unread_count))
        .route("/api/notifications/:notification_id/read", post(notifications::mark_read))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
