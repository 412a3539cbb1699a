//! Lifecycle Manager
//! Emergency の状態遷移: waiting → in_process → completed / waiting → canceled
//!
//! completed_at / canceled_at を書くのはこのモジュールだけ。
//! waiting → in_process は acceptance 側の条件付き更新で行う。

use serde_json::json;
use sqlx::SqliteConnection;
use tracing::{debug, info, warn};

use crate::error::{DispatchError, Result};
use crate::feed::{ChangeEvent, Operation, Table};
use crate::geo::{haversine_km, valid_coordinates};
use crate::models::{
    CreateEmergencyRequest, Emergency, EmergencyStatus, NewNotification, NotificationType,
    PaymentStatus, RequestStatus, ServiceType,
};
use crate::services::{new_id, notifier, shops};
use crate::AppState;

/// POST /api/emergencies
pub async fn create_emergency(
    state: &AppState,
    requester_id: &str,
    req: CreateEmergencyRequest,
    now: i64,
) -> Result<Emergency> {
    if !valid_coordinates(req.latitude, req.longitude) {
        return Err(DispatchError::Validation("invalid emergency location".to_string()));
    }
    if req.vehicle_type.trim().is_empty() {
        return Err(DispatchError::Validation("vehicle_type is required".to_string()));
    }

    // fuel_type は gas のときだけ
    let fuel_type = req
        .fuel_type
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    match (req.service_type, &fuel_type) {
        (ServiceType::Gas, None) => {
            return Err(DispatchError::Validation(
                "fuel_type is required for gas emergencies".to_string(),
            ))
        }
        (ServiceType::Vulcanize | ServiceType::Repair, Some(_)) => {
            return Err(DispatchError::Validation(
                "fuel_type is only allowed for gas emergencies".to_string(),
            ))
        }
        _ => {}
    }

    let id = new_id();
    sqlx::query(
        "INSERT INTO emergency (id, requester_id, latitude, longitude, vehicle_type, service_type, \
         fuel_type, description, status, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(requester_id)
    .bind(req.latitude)
    .bind(req.longitude)
    .bind(req.vehicle_type.trim())
    .bind(req.service_type)
    .bind(&fuel_type)
    .bind(&req.description)
    .bind(EmergencyStatus::Waiting)
    .bind(now)
    .execute(&state.db)
    .await?;

    info!(
        "Emergency created: id={}, requester={}, service={:?}",
        id, requester_id, req.service_type
    );
    state
        .feed
        .publish(ChangeEvent::new(Table::Emergency, Operation::Insert, Some(&id), &id));

    let emergency = {
        let mut conn = state.db.acquire().await?;
        load_emergency(&mut conn, &id).await?
    };

    broadcast_to_nearby_shops(state, &emergency, now).await;

    Ok(emergency)
}

/// 近くの該当種別の店舗へ emergency_posted を送る（ベストエフォート）
async fn broadcast_to_nearby_shops(state: &AppState, emergency: &Emergency, now: i64) {
    let candidates = match state.db.acquire().await {
        Ok(mut conn) => shops::shops_of_type(&mut conn, emergency.service_type.shop_type()).await,
        Err(e) => Err(e.into()),
    };
    let candidates = match candidates {
        Ok(shops) => shops,
        Err(e) => {
            warn!("Failed to load shops for broadcast: emergency={}, error={}", emergency.id, e);
            return;
        }
    };

    let radius = state.config.broadcast_radius_km;
    let messages: Vec<NewNotification> = candidates
        .iter()
        .filter(|shop| {
            haversine_km(emergency.latitude, emergency.longitude, shop.latitude, shop.longitude)
                <= radius
        })
        .map(|shop| NewNotification {
            from_user_id: Some(emergency.requester_id.clone()),
            to_user_id: shop.owner_user_id.clone(),
            kind: NotificationType::EmergencyPosted,
            title: "New emergency nearby".to_string(),
            body: format!("A driver needs {:?} assistance near you.", emergency.service_type),
            data: json!({
                "emergency_id": emergency.id,
                "service_type": emergency.service_type,
            }),
        })
        .collect();

    if messages.is_empty() {
        return;
    }

    let total = messages.len();
    let results = notifier::fan_out(state, messages, now).await;
    let failed = results.iter().filter(|r| !r.is_delivered()).count();
    if failed > 0 {
        warn!(
            "emergency_posted partially delivered: emergency={}, failed={}/{}",
            emergency.id, failed, total
        );
    } else {
        info!("emergency_posted delivered: emergency={}, shops={}", emergency.id, total);
    }
}

pub async fn load_emergency(conn: &mut SqliteConnection, emergency_id: &str) -> Result<Emergency> {
    let emergency: Option<Emergency> = sqlx::query_as("SELECT * FROM emergency WHERE id = ?")
        .bind(emergency_id)
        .fetch_optional(&mut *conn)
        .await?;
    emergency.ok_or_else(|| DispatchError::NotFound(format!("emergency {}", emergency_id)))
}

pub async fn pending_count(conn: &mut SqliteConnection, emergency_id: &str) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM service_requests WHERE emergency_id = ? AND status = ?",
    )
    .bind(emergency_id)
    .bind(RequestStatus::Pending)
    .fetch_one(&mut *conn)
    .await?;
    Ok(count)
}

/// 依頼者本人、または ServiceRequest を出した店舗だけが見られる
pub async fn get_emergency_for(
    state: &AppState,
    emergency_id: &str,
    caller: &str,
) -> Result<Emergency> {
    let mut conn = state.db.acquire().await?;
    let emergency = load_emergency(&mut conn, emergency_id).await?;
    if emergency.requester_id == caller {
        return Ok(emergency);
    }

    let involved: Option<(i64,)> = sqlx::query_as(
        "SELECT 1 FROM service_requests sr JOIN shops s ON s.id = sr.shop_id \
         WHERE sr.emergency_id = ? AND s.owner_user_id = ? LIMIT 1",
    )
    .bind(emergency_id)
    .bind(caller)
    .fetch_optional(&mut *conn)
    .await?;

    if involved.is_some() {
        Ok(emergency)
    } else {
        Err(DispatchError::Forbidden("not a participant of this emergency".to_string()))
    }
}

/// GET /api/emergencies（非表示は除く）
pub async fn list_my_emergencies(state: &AppState, requester_id: &str) -> Result<Vec<Emergency>> {
    let rows = sqlx::query_as(
        "SELECT * FROM emergency WHERE requester_id = ? AND hidden_by_requester = 0 \
         ORDER BY created_at DESC, rowid DESC",
    )
    .bind(requester_id)
    .fetch_all(&state.db)
    .await?;
    Ok(rows)
}

/// Cancel: waiting → canceled
///
/// pending が 0 件、かつ作成から猶予期間が過ぎていること。
/// 条件は1回の UPDATE に入れているので、並行する accept とはどちらか一方しか通らない。
pub async fn cancel_emergency(
    state: &AppState,
    emergency_id: &str,
    caller: &str,
    now: i64,
) -> Result<Emergency> {
    let grace = state.config.cancel_grace_secs;

    let result = sqlx::query(
        "UPDATE emergency SET status = ?, canceled_at = ? \
         WHERE id = ? AND requester_id = ? AND status = ? AND created_at <= ? \
         AND NOT EXISTS (SELECT 1 FROM service_requests sr WHERE sr.emergency_id = emergency.id AND sr.status = ?)",
    )
    .bind(EmergencyStatus::Canceled)
    .bind(now)
    .bind(emergency_id)
    .bind(caller)
    .bind(EmergencyStatus::Waiting)
    .bind(now - grace)
    .bind(RequestStatus::Pending)
    .execute(&state.db)
    .await?;

    let mut conn = state.db.acquire().await?;

    if result.rows_affected() == 0 {
        let err = explain_cancel_refusal(&mut conn, emergency_id, caller, now, grace).await?;
        debug!("Cancel refused: emergency={}, reason={}", emergency_id, err);
        return Err(err);
    }

    info!("Emergency canceled: id={}, requester={}", emergency_id, caller);
    state
        .feed
        .publish(ChangeEvent::new(Table::Emergency, Operation::Update, Some(emergency_id), emergency_id));

    load_emergency(&mut conn, emergency_id).await
}

async fn explain_cancel_refusal(
    conn: &mut SqliteConnection,
    emergency_id: &str,
    caller: &str,
    now: i64,
    grace: i64,
) -> Result<DispatchError> {
    let emergency = load_emergency(conn, emergency_id).await?;
    if emergency.requester_id != caller {
        return Ok(DispatchError::Forbidden("only the requester can cancel".to_string()));
    }
    if emergency.status != EmergencyStatus::Waiting {
        return Ok(DispatchError::Conflict(format!(
            "emergency is already {:?}",
            emergency.status
        )));
    }

    let pending = pending_count(conn, emergency_id).await?;
    if pending > 0 {
        return Ok(DispatchError::Validation(format!(
            "cannot cancel while {} offer(s) are pending; reject them first",
            pending
        )));
    }

    let age = now - emergency.created_at;
    if age < grace {
        return Ok(DispatchError::Validation(format!(
            "cancel is available {} second(s) after posting ({} remaining)",
            grace,
            grace - age
        )));
    }

    // 条件は満たしているのに更新できなかった = 直前に状態が変わった
    Ok(DispatchError::Conflict("emergency changed concurrently; reload".to_string()))
}

/// in_process → completed。支払い済みの取引があるときだけ
pub async fn complete_emergency(
    conn: &mut SqliteConnection,
    emergency_id: &str,
    now: i64,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE emergency SET status = ?, completed_at = ? \
         WHERE id = ? AND status = ? \
         AND EXISTS (SELECT 1 FROM payment_transaction pt WHERE pt.emergency_id = emergency.id AND pt.status = ?)",
    )
    .bind(EmergencyStatus::Completed)
    .bind(now)
    .bind(emergency_id)
    .bind(EmergencyStatus::InProcess)
    .bind(PaymentStatus::Paid)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DispatchError::Conflict(format!(
            "emergency {} is not in process with a paid transaction",
            emergency_id
        )));
    }

    info!("Emergency completed: id={}", emergency_id);
    Ok(())
}

/// 終了済み（completed / canceled）の emergency を依頼者の一覧から隠す
pub async fn hide_emergency(state: &AppState, emergency_id: &str, caller: &str) -> Result<Emergency> {
    let result = sqlx::query(
        "UPDATE emergency SET hidden_by_requester = 1 \
         WHERE id = ? AND requester_id = ? AND status IN (?, ?)",
    )
    .bind(emergency_id)
    .bind(caller)
    .bind(EmergencyStatus::Completed)
    .bind(EmergencyStatus::Canceled)
    .execute(&state.db)
    .await?;

    let mut conn = state.db.acquire().await?;
    let emergency = load_emergency(&mut conn, emergency_id).await?;

    if result.rows_affected() == 0 {
        if emergency.requester_id != caller {
            return Err(DispatchError::Forbidden("only the requester can hide".to_string()));
        }
        if !emergency.status.is_terminal() {
            return Err(DispatchError::Validation(
                "only completed or canceled emergencies can be hidden".to_string(),
            ));
        }
        return Err(DispatchError::Conflict("emergency changed concurrently; reload".to_string()));
    }

    info!("Emergency hidden: id={}, requester={}", emergency_id, caller);
    Ok(emergency)
}
