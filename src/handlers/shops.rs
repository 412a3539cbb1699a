//! Shops API Handlers
//! /api/shops エンドポイント

use axum::{
    extract::{Path, State},
    response::Json,
};
use serde::Serialize;
use std::sync::Arc;

use crate::error::Result;
use crate::handlers::Caller;
use crate::models::{RegisterShopRequest, ServiceRequest, Shop};
use crate::services::{self, offers, shops};
use crate::AppState;

#[derive(Serialize)]
pub struct ShopResponse {
    pub success: bool,
    pub shop: Shop,
}

#[derive(Serialize)]
pub struct ShopRequestsResponse {
    pub success: bool,
    pub service_requests: Vec<ServiceRequest>,
    pub total: usize,
}

/// POST /api/shops - 呼び出しユーザーの店舗を登録
pub async fn register_shop(
    State(state): State<Arc<AppState>>,
    Caller(user): Caller,
    Json(req): Json<RegisterShopRequest>,
) -> Result<Json<ShopResponse>> {
    let shop = shops::register_shop(&state, &user, req, services::now()).await?;
    Ok(Json(ShopResponse { success: true, shop }))
}

/// GET /api/shops/:shop_id
pub async fn get_shop(
    State(state): State<Arc<AppState>>,
    Caller(_user): Caller,
    Path(shop_id): Path<String>,
) -> Result<Json<ShopResponse>> {
    let shop = shops::get_shop(&state, &shop_id).await?;
    Ok(Json(ShopResponse { success: true, shop }))
}

/// GET /api/shops/me/service-requests - 自店舗が出した ServiceRequest
pub async fn list_my_service_requests(
    State(state): State<Arc<AppState>>,
    Caller(user): Caller,
) -> Result<Json<ShopRequestsResponse>> {
    let service_requests = offers::list_shop_service_requests(&state, &user).await?;
    let total = service_requests.len();
    Ok(Json(ShopRequestsResponse {
        success: true,
        service_requests,
        total,
    }))
}
