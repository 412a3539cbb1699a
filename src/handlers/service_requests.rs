//! Offers / ServiceRequests API Handlers
//! 店舗からの応答・見積もり、運転手による accept / reject

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
    response::Json,
};
use futures::stream::{self, Stream};
use serde::Serialize;
use std::sync::Arc;

use crate::error::Result;
use crate::handlers::Caller;
use crate::models::{AcceptResult, OfferInput, OfferView, ServiceRequest, ShopOffer, SubmitOfferRequest};
use crate::services::{self, acceptance, offers};
use crate::sync;
use crate::AppState;

// ========================================
// Response Types
// ========================================

#[derive(Serialize)]
pub struct OfferListResponse {
    pub success: bool,
    pub offers: Vec<OfferView>,
    pub total: usize,
}

#[derive(Serialize)]
pub struct OfferResponse {
    pub success: bool,
    pub offer: ShopOffer,
}

#[derive(Serialize)]
pub struct ServiceRequestResponse {
    pub success: bool,
    pub service_request: ServiceRequest,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offer: Option<ShopOffer>,
}

// ========================================
// Driver side
// ========================================

/// GET /api/emergencies/:emergency_id/offers - pending の応答と最新見積もり
pub async fn list_offers(
    State(state): State<Arc<AppState>>,
    Caller(user): Caller,
    Path(emergency_id): Path<String>,
) -> Result<Json<OfferListResponse>> {
    let offers = offers::list_outstanding_offers(&state, &emergency_id, &user).await?;
    let total = offers.len();
    Ok(Json(OfferListResponse {
        success: true,
        offers,
        total,
    }))
}

/// GET /api/emergencies/:emergency_id/offers/stream - 一覧が変わるたびに `offers` イベント
pub async fn stream_offers(
    State(state): State<Arc<AppState>>,
    Caller(user): Caller,
    Path(emergency_id): Path<String>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, axum::Error>>>> {
    let rx = sync::watch_offers(state.clone(), &emergency_id, &user).await?;

    // 初回は現在の一覧、その後は変化のたびに1件
    let events = stream::unfold((rx, true), |(mut rx, first)| async move {
        if !first && rx.changed().await.is_err() {
            return None;
        }
        let offers = rx.borrow_and_update().clone();
        let event = Event::default().event("offers").json_data(&offers);
        Some((event, (rx, false)))
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// POST /api/emergencies/:emergency_id/service-requests/:service_id/accept
pub async fn accept_offer(
    State(state): State<Arc<AppState>>,
    Caller(user): Caller,
    Path((emergency_id, service_id)): Path<(String, String)>,
) -> Result<Json<AcceptResult>> {
    let result =
        acceptance::accept_offer(&state, &emergency_id, &service_id, &user, services::now())
            .await?;
    Ok(Json(result))
}

/// POST /api/emergencies/:emergency_id/service-requests/:service_id/reject
pub async fn reject_offer(
    State(state): State<Arc<AppState>>,
    Caller(user): Caller,
    Path((emergency_id, service_id)): Path<(String, String)>,
) -> Result<Json<ServiceRequestResponse>> {
    let service_request =
        acceptance::reject_offer(&state, &service_id, &emergency_id, &user, services::now())
            .await?;
    Ok(Json(ServiceRequestResponse {
        success: true,
        service_request,
        offer: None,
    }))
}

// ========================================
// Shop side
// ========================================

/// POST /api/emergencies/:emergency_id/service-requests - 応答と最初の見積もり
pub async fn submit_service_request(
    State(state): State<Arc<AppState>>,
    Caller(user): Caller,
    Path(emergency_id): Path<String>,
    Json(input): Json<OfferInput>,
) -> Result<Json<ServiceRequestResponse>> {
    let (service_request, offer) =
        offers::submit_service_request(&state, &emergency_id, &user, input, services::now())
            .await?;
    Ok(Json(ServiceRequestResponse {
        success: true,
        service_request,
        offer: Some(offer),
    }))
}

/// POST /api/emergencies/:emergency_id/offers - 見積もりの修正
pub async fn submit_offer(
    State(state): State<Arc<AppState>>,
    Caller(user): Caller,
    Path(emergency_id): Path<String>,
    Json(req): Json<SubmitOfferRequest>,
) -> Result<Json<OfferResponse>> {
    let offer = offers::submit_offer(
        &state,
        &emergency_id,
        &user,
        req.service_id,
        req.offer,
        services::now(),
    )
    .await?;
    Ok(Json(OfferResponse {
        success: true,
        offer,
    }))
}
