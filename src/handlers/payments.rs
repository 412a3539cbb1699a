//! Payments API Handlers
//! /api/payments エンドポイント

use axum::{
    extract::{Path, State},
    response::Json,
};
use serde::Serialize;
use std::sync::Arc;

use crate::error::Result;
use crate::handlers::Caller;
use crate::models::{MarkPaidRequest, PaymentTransaction, UpdateBillRequest};
use crate::services::{self, payments};
use crate::AppState;

#[derive(Serialize)]
pub struct PaymentResponse {
    pub success: bool,
    pub payment: PaymentTransaction,
}

fn ok(payment: PaymentTransaction) -> Json<PaymentResponse> {
    Json(PaymentResponse {
        success: true,
        payment,
    })
}

/// GET /api/payments/:transaction_id
pub async fn get_payment(
    State(state): State<Arc<AppState>>,
    Caller(user): Caller,
    Path(transaction_id): Path<String>,
) -> Result<Json<PaymentResponse>> {
    let payment = payments::get_payment(&state, &transaction_id, &user).await?;
    Ok(ok(payment))
}

/// GET /api/emergencies/:emergency_id/payment
pub async fn get_payment_for_emergency(
    State(state): State<Arc<AppState>>,
    Caller(user): Caller,
    Path(emergency_id): Path<String>,
) -> Result<Json<PaymentResponse>> {
    let payment = payments::get_payment_for_emergency(&state, &emergency_id, &user).await?;
    Ok(ok(payment))
}

/// POST /api/payments/:transaction_id/bill - 部品代・追加項目（店舗）
pub async fn update_bill(
    State(state): State<Arc<AppState>>,
    Caller(user): Caller,
    Path(transaction_id): Path<String>,
    Json(req): Json<UpdateBillRequest>,
) -> Result<Json<PaymentResponse>> {
    let payment = payments::update_bill(&state, &transaction_id, &user, req).await?;
    Ok(ok(payment))
}

/// POST /api/payments/:transaction_id/pay - 支払い完了（運転手）
pub async fn mark_paid(
    State(state): State<Arc<AppState>>,
    Caller(user): Caller,
    Path(transaction_id): Path<String>,
    Json(req): Json<MarkPaidRequest>,
) -> Result<Json<PaymentResponse>> {
    let payment =
        payments::mark_paid(&state, &transaction_id, &user, req, services::now()).await?;
    Ok(ok(payment))
}
