//! Notifications API Handlers
//! /api/notifications エンドポイント

use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::Result;
use crate::handlers::Caller;
use crate::models::{NewNotification, Notification};
use crate::services::{self, notifier, notifier::DeliveryResult};
use crate::AppState;

#[derive(Serialize)]
pub struct NotificationListResponse {
    pub success: bool,
    pub notifications: Vec<Notification>,
    pub total: usize,
}

#[derive(Serialize)]
pub struct NotificationResponse {
    pub success: bool,
    pub notification: Notification,
}

#[derive(Serialize)]
pub struct UnreadCountResponse {
    pub success: bool,
    pub unread: i64,
}

#[derive(Serialize)]
pub struct SendResponse {
    pub success: bool,
    pub delivery: DeliveryResult,
}

#[derive(Debug, Deserialize)]
pub struct ListNotificationsQuery {
    #[serde(default)]
    pub unread_only: bool,
}

/// GET /api/notifications?unread_only=true
pub async fn list_notifications(
    State(state): State<Arc<AppState>>,
    Caller(user): Caller,
    Query(query): Query<ListNotificationsQuery>,
) -> Result<Json<NotificationListResponse>> {
    let notifications = notifier::list_for_user(&state, &user, query.unread_only).await?;
    let total = notifications.len();
    Ok(Json(NotificationListResponse {
        success: true,
        notifications,
        total,
    }))
}

/// POST /api/notifications - 送信者は呼び出しユーザーに固定
pub async fn send_notification(
    State(state): State<Arc<AppState>>,
    Caller(user): Caller,
    Json(mut req): Json<NewNotification>,
) -> Result<Json<SendResponse>> {
    req.from_user_id = Some(user);
    let delivery = notifier::notify(&state, req, services::now()).await;
    Ok(Json(SendResponse {
        success: delivery.is_delivered(),
        delivery,
    }))
}

/// GET /api/notifications/unread_count
pub async fn unread_count(
    State(state): State<Arc<AppState>>,
    Caller(user): Caller,
) -> Result<Json<UnreadCountResponse>> {
    let unread = notifier::unread_count(&state, &user).await?;
    Ok(Json(UnreadCountResponse {
        success: true,
        unread,
    }))
}

/// POST /api/notifications/:notification_id/read
pub async fn mark_read(
    State(state): State<Arc<AppState>>,
    Caller(user): Caller,
    Path(notification_id): Path<String>,
) -> Result<Json<NotificationResponse>> {
    let notification =
        notifier::mark_read(&state, &notification_id, &user, services::now()).await?;
    Ok(Json(NotificationResponse {
        success: true,
        notification,
    }))
}
