//! Emergencies API Handlers
//! /api/emergencies エンドポイント - 依頼の作成・取得・キャンセル

use axum::{
    extract::{Path, State},
    response::Json,
};
use serde::Serialize;
use std::sync::Arc;

use crate::error::Result;
use crate::handlers::Caller;
use crate::models::{CreateEmergencyRequest, Emergency};
use crate::services::{self, lifecycle};
use crate::AppState;

// ========================================
// Response Types
// ========================================

#[derive(Serialize)]
pub struct EmergencyResponse {
    pub success: bool,
    pub emergency: Emergency,
}

#[derive(Serialize)]
pub struct EmergencyListResponse {
    pub success: bool,
    pub emergencies: Vec<Emergency>,
    pub total: usize,
}

// ========================================
// Handlers
// ========================================

/// GET /api/emergencies - 自分の依頼一覧
pub async fn list_my_emergencies(
    State(state): State<Arc<AppState>>,
    Caller(user): Caller,
) -> Result<Json<EmergencyListResponse>> {
    let emergencies = lifecycle::list_my_emergencies(&state, &user).await?;
    let total = emergencies.len();
    Ok(Json(EmergencyListResponse {
        success: true,
        emergencies,
        total,
    }))
}

/// POST /api/emergencies - 依頼を作成し、近くの店舗へ知らせる
pub async fn create_emergency(
    State(state): State<Arc<AppState>>,
    Caller(user): Caller,
    Json(req): Json<CreateEmergencyRequest>,
) -> Result<Json<EmergencyResponse>> {
    let emergency = lifecycle::create_emergency(&state, &user, req, services::now()).await?;
    Ok(Json(EmergencyResponse {
        success: true,
        emergency,
    }))
}

/// GET /api/emergencies/:emergency_id
pub async fn get_emergency(
    State(state): State<Arc<AppState>>,
    Caller(user): Caller,
    Path(emergency_id): Path<String>,
) -> Result<Json<EmergencyResponse>> {
    let emergency = lifecycle::get_emergency_for(&state, &emergency_id, &user).await?;
    Ok(Json(EmergencyResponse {
        success: true,
        emergency,
    }))
}

/// POST /api/emergencies/:emergency_id/cancel
pub async fn cancel_emergency(
    State(state): State<Arc<AppState>>,
    Caller(user): Caller,
    Path(emergency_id): Path<String>,
) -> Result<Json<EmergencyResponse>> {
    let emergency =
        lifecycle::cancel_emergency(&state, &emergency_id, &user, services::now()).await?;
    Ok(Json(EmergencyResponse {
        success: true,
        emergency,
    }))
}

/// POST /api/emergencies/:emergency_id/hide - 終了済みの依頼を一覧から隠す
pub async fn hide_emergency(
    State(state): State<Arc<AppState>>,
    Caller(user): Caller,
    Path(emergency_id): Path<String>,
) -> Result<Json<EmergencyResponse>> {
    let emergency = lifecycle::hide_emergency(&state, &emergency_id, &user).await?;
    Ok(Json(EmergencyResponse {
        success: true,
        emergency,
    }))
}
