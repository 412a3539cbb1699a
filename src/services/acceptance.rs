//! Acceptance Coordinator
//! 運転手が1件のオファーを accept する
//!
//! 手順 2〜5 は1つの SQLite トランザクションで確定する:
//! 1. 競合する pending の ServiceRequest を取得
//! 2. 対象を pending → accepted（status = pending の条件付き）
//! 3. Emergency を waiting → in_process（status = waiting の条件付き）
//! 4. PaymentTransaction を作成（既にあれば作らない）
//! 5. 残りの pending を rejected に
//!
//! 6. 通知はコミット後に並行送信。失敗しても 1〜5 は戻さない

use serde_json::json;
use sqlx::SqliteConnection;
use std::collections::BTreeMap;
use tracing::{debug, error, info, warn};

use crate::error::{DispatchError, Result};
use crate::feed::{ChangeEvent, Operation, Table};
use crate::models::{
    AcceptResult, DeliveryStatus, EmergencyStatus, NewNotification, NotificationType,
    PartialFailure, RequestStatus, ServiceRequest, WarningSeverity,
};
use crate::services::lifecycle::load_emergency;
use crate::services::notifier::{self, DeliveryResult};
use crate::services::offers::{load_service_request, resolve_authoritative_offer};
use crate::services::payments::materialize_payment;
use crate::AppState;

/// 通知の宛先（店舗とそのオーナー）
#[derive(Debug, Clone)]
struct ShopRecipient {
    service_id: String,
    shop_id: String,
    owner_user_id: String,
}

/// トランザクション内で確定した内容
#[derive(Debug)]
struct Committed {
    transaction_id: String,
    payment_created: bool,
    accepted: ShopRecipient,
    rejected: Vec<ShopRecipient>,
}

/// POST /api/emergencies/:emergency_id/service-requests/:service_id/accept
pub async fn accept_offer(
    state: &AppState,
    emergency_id: &str,
    service_id: &str,
    driver: &str,
    now: i64,
) -> Result<AcceptResult> {
    let outcome = commit_acceptance(state, emergency_id, service_id, driver, now).await;

    let committed = match outcome {
        Ok(Some(committed)) => committed,
        Ok(None) => {
            // 条件付き更新が 0 件: 理由を調べる（再実行なら replay）
            return explain_or_replay(state, emergency_id, service_id, driver, now).await;
        }
        Err(e) => {
            log_failure(&e, emergency_id, service_id, driver);
            return Err(e);
        }
    };

    info!(
        "Offer accepted: emergency={}, service={}, shop={}, txn={}, rejected={}",
        emergency_id,
        service_id,
        committed.accepted.shop_id,
        committed.transaction_id,
        committed.rejected.len()
    );
    publish_commit(state, emergency_id, &committed);

    // 6. 通知 fan-out
    let (notifications, warnings) = notify_outcome(state, emergency_id, driver, &committed, now).await;

    Ok(AcceptResult {
        success: true,
        emergency_id: emergency_id.to_string(),
        service_id: service_id.to_string(),
        transaction_id: committed.transaction_id,
        rejected_service_ids: committed
            .rejected
            .iter()
            .map(|r| r.service_id.clone())
            .collect(),
        replayed: false,
        notifications,
        warnings,
    })
}

/// 手順 2〜5。前提条件が崩れていれば Ok(None)
async fn commit_acceptance(
    state: &AppState,
    emergency_id: &str,
    service_id: &str,
    driver: &str,
    now: i64,
) -> Result<Option<Committed>> {
    let mut tx = state.db.begin().await?;

    // 2. 最初の文を条件付き書き込みにして、書き込みロックを先に取る
    let accepted = sqlx::query(
        "UPDATE service_requests SET status = ?, accepted_at = ? \
         WHERE id = ? AND emergency_id = ? AND status = ? \
         AND EXISTS (SELECT 1 FROM emergency e WHERE e.id = service_requests.emergency_id \
                     AND e.requester_id = ? AND e.status = ?)",
    )
    .bind(RequestStatus::Accepted)
    .bind(now)
    .bind(service_id)
    .bind(emergency_id)
    .bind(RequestStatus::Pending)
    .bind(driver)
    .bind(EmergencyStatus::Waiting)
    .execute(&mut *tx)
    .await?;

    if accepted.rows_affected() == 0 {
        tx.rollback().await?;
        return Ok(None);
    }

    // 1. 競合セット（ロック取得後なので 2 の直前と同じ集合から対象を除いたもの）
    let competitors = pending_recipients(&mut tx, emergency_id).await?;

    // 3. emergency を進める
    let advanced = sqlx::query(
        "UPDATE emergency SET status = ?, accepted_at = ?, \
         accepted_shop_user_id = (SELECT s.owner_user_id FROM service_requests sr \
                                  JOIN shops s ON s.id = sr.shop_id WHERE sr.id = ?) \
         WHERE id = ? AND status = ?",
    )
    .bind(EmergencyStatus::InProcess)
    .bind(now)
    .bind(service_id)
    .bind(emergency_id)
    .bind(EmergencyStatus::Waiting)
    .execute(&mut *tx)
    .await?;

    if advanced.rows_affected() == 0 {
        tx.rollback().await?;
        return Err(DispatchError::Conflict(
            "emergency advanced before the acceptance landed".to_string(),
        ));
    }

    // 4. 支払い記録
    let (transaction_id, payment_created) =
        materialize_for(&mut tx, emergency_id, service_id, now).await?;

    // 5. 競合を rejected に
    let rejected = reject_all(&mut tx, &competitors, now).await?;

    let accepted = recipient_of(&mut tx, service_id).await?;

    tx.commit().await?;

    Ok(Some(Committed {
        transaction_id,
        payment_created,
        accepted,
        rejected,
    }))
}

async fn materialize_for(
    conn: &mut SqliteConnection,
    emergency_id: &str,
    service_id: &str,
    now: i64,
) -> Result<(String, bool)> {
    let emergency = load_emergency(conn, emergency_id).await?;
    let request = load_service_request(conn, service_id).await?;
    let offer = resolve_authoritative_offer(conn, &request).await?.ok_or_else(|| {
        DispatchError::Validation("this shop has not sent a price yet".to_string())
    })?;

    let (payment, created) = materialize_payment(conn, &emergency, &request, &offer, now).await?;
    Ok((payment.transaction_id, created))
}

async fn pending_recipients(
    conn: &mut SqliteConnection,
    emergency_id: &str,
) -> Result<Vec<ShopRecipient>> {
    let rows: Vec<(String, String, String)> = sqlx::query_as(
        "SELECT sr.id, sr.shop_id, s.owner_user_id FROM service_requests sr \
         JOIN shops s ON s.id = sr.shop_id \
         WHERE sr.emergency_id = ? AND sr.status = ? ORDER BY sr.requested_at, sr.rowid",
    )
    .bind(emergency_id)
    .bind(RequestStatus::Pending)
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(service_id, shop_id, owner_user_id)| ShopRecipient {
            service_id,
            shop_id,
            owner_user_id,
        })
        .collect())
}

async fn recipient_of(conn: &mut SqliteConnection, service_id: &str) -> Result<ShopRecipient> {
    let row: (String, String, String) = sqlx::query_as(
        "SELECT sr.id, sr.shop_id, s.owner_user_id FROM service_requests sr \
         JOIN shops s ON s.id = sr.shop_id WHERE sr.id = ?",
    )
    .bind(service_id)
    .fetch_one(&mut *conn)
    .await?;

    Ok(ShopRecipient {
        service_id: row.0,
        shop_id: row.1,
        owner_user_id: row.2,
    })
}

/// pending → rejected。既に動いていたものは飛ばす
async fn reject_all(
    conn: &mut SqliteConnection,
    competitors: &[ShopRecipient],
    now: i64,
) -> Result<Vec<ShopRecipient>> {
    let mut rejected = Vec::with_capacity(competitors.len());
    for competitor in competitors {
        let result = sqlx::query(
            "UPDATE service_requests SET status = ?, rejected_at = ? WHERE id = ? AND status = ?",
        )
        .bind(RequestStatus::Rejected)
        .bind(now)
        .bind(&competitor.service_id)
        .bind(RequestStatus::Pending)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() > 0 {
            rejected.push(competitor.clone());
        }
    }
    Ok(rejected)
}

fn publish_commit(state: &AppState, emergency_id: &str, committed: &Committed) {
    state.feed.publish(ChangeEvent::new(
        Table::ServiceRequests,
        Operation::Update,
        Some(emergency_id),
        &committed.accepted.service_id,
    ));
    state.feed.publish(ChangeEvent::new(
        Table::Emergency,
        Operation::Update,
        Some(emergency_id),
        emergency_id,
    ));
    if committed.payment_created {
        state.feed.publish(ChangeEvent::new(
            Table::PaymentTransaction,
            Operation::Insert,
            Some(emergency_id),
            &committed.transaction_id,
        ));
    }
    for rejected in &committed.rejected {
        state.feed.publish(ChangeEvent::new(
            Table::ServiceRequests,
            Operation::Update,
            Some(emergency_id),
            &rejected.service_id,
        ));
    }
}

async fn notify_outcome(
    state: &AppState,
    emergency_id: &str,
    driver: &str,
    committed: &Committed,
    now: i64,
) -> (BTreeMap<String, DeliveryStatus>, Vec<PartialFailure>) {
    let mut recipients = Vec::with_capacity(committed.rejected.len() + 1);
    let mut messages = Vec::with_capacity(committed.rejected.len() + 1);

    recipients.push((&committed.accepted, WarningSeverity::Critical));
    messages.push(NewNotification {
        from_user_id: Some(driver.to_string()),
        to_user_id: committed.accepted.owner_user_id.clone(),
        kind: NotificationType::ServiceRequestAccepted,
        title: "Your offer was accepted".to_string(),
        body: "The driver accepted your offer. Please head to the location.".to_string(),
        data: json!({
            "emergency_id": emergency_id,
            "service_id": committed.accepted.service_id,
            "transaction_id": committed.transaction_id,
        }),
    });

    for rejected in &committed.rejected {
        recipients.push((rejected, WarningSeverity::NonCritical));
        messages.push(NewNotification {
            from_user_id: Some(driver.to_string()),
            to_user_id: rejected.owner_user_id.clone(),
            kind: NotificationType::ServiceRequestRejected,
            title: "Offer not selected".to_string(),
            body: "The driver chose another shop for this emergency.".to_string(),
            data: json!({
                "emergency_id": emergency_id,
                "service_id": rejected.service_id,
            }),
        });
    }

    let results = notifier::fan_out(state, messages, now).await;

    let mut ledger = BTreeMap::new();
    let mut warnings = Vec::new();
    for ((recipient, severity), result) in recipients.into_iter().zip(results) {
        match result {
            DeliveryResult::Delivered { .. } => {
                ledger.insert(recipient.shop_id.clone(), DeliveryStatus::Delivered);
            }
            DeliveryResult::Failed {
                recipient: user,
                error_class,
                detail,
            } => {
                warn!(
                    "Acceptance notification failed: emergency={}, shop={}, recipient={}, severity={:?}, class={}",
                    emergency_id,
                    recipient.shop_id,
                    user,
                    severity,
                    error_class.as_str()
                );
                ledger.insert(recipient.shop_id.clone(), DeliveryStatus::Failed);
                warnings.push(PartialFailure {
                    shop_id: recipient.shop_id.clone(),
                    recipient: user,
                    severity,
                    error_class: error_class.as_str().to_string(),
                    detail,
                });
            }
        }
    }

    (ledger, warnings)
}

/// 前提条件が崩れていた理由を返す。既に同じペアで accept 済みなら手順 4〜5 を冪等に再実行する
async fn explain_or_replay(
    state: &AppState,
    emergency_id: &str,
    service_id: &str,
    driver: &str,
    now: i64,
) -> Result<AcceptResult> {
    let mut conn = state.db.acquire().await?;
    let emergency = load_emergency(&mut conn, emergency_id).await?;
    if emergency.requester_id != driver {
        return Err(DispatchError::Forbidden(
            "only the requester can accept offers".to_string(),
        ));
    }

    let request = load_service_request(&mut conn, service_id).await?;
    if request.emergency_id != emergency_id {
        return Err(DispatchError::NotFound(format!(
            "service request {} on emergency {}",
            service_id, emergency_id
        )));
    }
    drop(conn);

    let conflict = match request.status {
        RequestStatus::Accepted => {
            return replay(state, emergency_id, &request, now).await;
        }
        RequestStatus::Rejected => "service request is no longer pending".to_string(),
        RequestStatus::Pending if emergency.status != EmergencyStatus::Waiting => {
            format!("emergency is already {:?}", emergency.status)
        }
        RequestStatus::Pending => "emergency changed concurrently; reload".to_string(),
    };

    debug!(
        "Accept refused: emergency={}, service={}, reason={}",
        emergency_id, service_id, conflict
    );
    Err(DispatchError::Conflict(conflict))
}

/// 同じ (emergency_id, service_id) での再実行
async fn replay(
    state: &AppState,
    emergency_id: &str,
    request: &ServiceRequest,
    now: i64,
) -> Result<AcceptResult> {
    let mut tx = state.db.begin().await?;

    // 先に書き込みロックを取る
    sqlx::query("UPDATE service_requests SET accepted_at = accepted_at WHERE id = ?")
        .bind(&request.id)
        .execute(&mut *tx)
        .await?;

    let competitors = pending_recipients(&mut tx, emergency_id).await?;
    let (transaction_id, payment_created) =
        match materialize_for(&mut tx, emergency_id, &request.id, now).await {
            Ok(v) => v,
            Err(e) => {
                log_failure(&e, emergency_id, &request.id, "replay");
                return Err(e);
            }
        };
    let rejected = reject_all(&mut tx, &competitors, now).await?;
    let accepted = recipient_of(&mut tx, &request.id).await?;

    tx.commit().await?;

    info!(
        "Accept replayed: emergency={}, service={}, txn={}, payment_created={}, rejected={}",
        emergency_id,
        request.id,
        transaction_id,
        payment_created,
        rejected.len()
    );

    let committed = Committed {
        transaction_id,
        payment_created,
        accepted,
        rejected,
    };
    if committed.payment_created || !committed.rejected.is_empty() {
        publish_commit(state, emergency_id, &committed);
    }

    Ok(AcceptResult {
        success: true,
        emergency_id: emergency_id.to_string(),
        service_id: request.id.clone(),
        transaction_id: committed.transaction_id,
        rejected_service_ids: committed
            .rejected
            .into_iter()
            .map(|r| r.service_id)
            .collect(),
        replayed: true,
        notifications: BTreeMap::new(),
        warnings: Vec::new(),
    })
}

/// Conflict / Validation は想定内。データ層の失敗だけ error で残す
fn log_failure(err: &DispatchError, emergency_id: &str, service_id: &str, caller: &str) {
    match err {
        DispatchError::Database(e) => error!(
            "Accept failed: emergency={}, service={}, caller={}, error={:?}",
            emergency_id, service_id, caller, e
        ),
        other => debug!(
            "Accept refused: emergency={}, service={}, caller={}, reason={}",
            emergency_id, service_id, caller, other
        ),
    }
}

// ========================================
// Reject / withdrawal
// ========================================

/// POST /api/emergencies/:emergency_id/service-requests/:service_id/reject
///
/// 1件だけ pending → rejected。既に rejected なら何もしない
pub async fn reject_offer(
    state: &AppState,
    service_id: &str,
    emergency_id: &str,
    caller: &str,
    now: i64,
) -> Result<ServiceRequest> {
    let mut conn = state.db.acquire().await?;
    let emergency = load_emergency(&mut conn, emergency_id).await?;
    let request = load_service_request(&mut conn, service_id).await?;
    if request.emergency_id != emergency_id {
        return Err(DispatchError::NotFound(format!(
            "service request {} on emergency {}",
            service_id, emergency_id
        )));
    }

    // 依頼者（断る）か、その店舗（取り下げ）
    let shop_owner = recipient_of(&mut conn, service_id).await?.owner_user_id;
    if emergency.requester_id != caller && shop_owner != caller {
        return Err(DispatchError::Forbidden(
            "only the requester or the shop can reject this request".to_string(),
        ));
    }

    let result = sqlx::query(
        "UPDATE service_requests SET status = ?, rejected_at = ? WHERE id = ? AND status = ?",
    )
    .bind(RequestStatus::Rejected)
    .bind(now)
    .bind(service_id)
    .bind(RequestStatus::Pending)
    .execute(&mut *conn)
    .await?;

    let current = load_service_request(&mut conn, service_id).await?;

    if result.rows_affected() == 0 {
        return match current.status {
            RequestStatus::Rejected => Ok(current),
            _ => Err(DispatchError::Conflict(
                "service request was already accepted".to_string(),
            )),
        };
    }

    info!(
        "Service request rejected: id={}, emergency={}, by={}",
        service_id, emergency_id, caller
    );
    state.feed.publish(ChangeEvent::new(
        Table::ServiceRequests,
        Operation::Update,
        Some(emergency_id),
        service_id,
    ));
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PaymentStatus, ServiceType, ShopType};
    use crate::services::{lifecycle, payments};
    use crate::testutil::{
        deny_notifications_to, seed_emergency, seed_request, seed_shop, test_state, two_offer_scenario,
        T0,
    };

    async fn request_status(state: &AppState, service_id: &str) -> RequestStatus {
        let mut conn = state.db.acquire().await.unwrap();
        load_service_request(&mut conn, service_id).await.unwrap().status
    }

    async fn payment_count(state: &AppState, emergency_id: &str) -> i64 {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM payment_transaction WHERE emergency_id = ?")
                .bind(emergency_id)
                .fetch_one(&state.db)
                .await
                .unwrap();
        count
    }

    #[tokio::test]
    async fn accepting_one_offer_rejects_the_other() {
        let (state, _dir) = test_state().await;
        let s = two_offer_scenario(&state, ServiceType::Vulcanize).await;

        let result = accept_offer(&state, &s.emergency.id, &s.s1.id, "driver", T0 + 60)
            .await
            .unwrap();

        assert!(result.success);
        assert!(!result.replayed);
        assert!(result.warnings.is_empty());
        assert_eq!(result.rejected_service_ids, vec![s.s2.id.clone()]);
        assert_eq!(result.notifications.get(&s.shop_a.id), Some(&DeliveryStatus::Delivered));
        assert_eq!(result.notifications.get(&s.shop_b.id), Some(&DeliveryStatus::Delivered));

        assert_eq!(request_status(&state, &s.s1.id).await, RequestStatus::Accepted);
        assert_eq!(request_status(&state, &s.s2.id).await, RequestStatus::Rejected);

        let mut conn = state.db.acquire().await.unwrap();
        let emergency = load_emergency(&mut conn, &s.emergency.id).await.unwrap();
        drop(conn);
        assert_eq!(emergency.status, EmergencyStatus::InProcess);
        assert_eq!(emergency.accepted_shop_user_id.as_deref(), Some("shop-a"));
        assert_eq!(emergency.accepted_at, Some(T0 + 60));

        let payment = payments::get_payment(&state, &result.transaction_id, "driver")
            .await
            .unwrap();
        assert_eq!(payment.total_amount, 450.0);
        assert_eq!(payment.status, PaymentStatus::ToPay);
        assert_eq!(payment.service_id, s.s1.id);
        assert_eq!(payment_count(&state, &s.emergency.id).await, 1);

        let a_inbox = notifier::list_for_user(&state, "shop-a", true).await.unwrap();
        assert!(a_inbox
            .iter()
            .any(|n| n.kind == NotificationType::ServiceRequestAccepted));
        let b_inbox = notifier::list_for_user(&state, "shop-b", true).await.unwrap();
        assert!(b_inbox
            .iter()
            .any(|n| n.kind == NotificationType::ServiceRequestRejected));
    }

    #[tokio::test]
    async fn failed_rejection_notice_is_a_non_critical_warning() {
        let (state, _dir) = test_state().await;
        let s = two_offer_scenario(&state, ServiceType::Vulcanize).await;
        deny_notifications_to(&state, "shop-b").await;

        let result = accept_offer(&state, &s.emergency.id, &s.s1.id, "driver", T0 + 60)
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.notifications.get(&s.shop_a.id), Some(&DeliveryStatus::Delivered));
        assert_eq!(result.notifications.get(&s.shop_b.id), Some(&DeliveryStatus::Failed));
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.warnings[0].shop_id, s.shop_b.id);
        assert_eq!(result.warnings[0].recipient, "shop-b");
        assert_eq!(result.warnings[0].severity, WarningSeverity::NonCritical);

        // 通知以外は確定している
        assert_eq!(request_status(&state, &s.s1.id).await, RequestStatus::Accepted);
        assert_eq!(request_status(&state, &s.s2.id).await, RequestStatus::Rejected);
        assert_eq!(payment_count(&state, &s.emergency.id).await, 1);
    }

    #[tokio::test]
    async fn failed_acceptance_notice_is_critical() {
        let (state, _dir) = test_state().await;
        let s = two_offer_scenario(&state, ServiceType::Vulcanize).await;
        deny_notifications_to(&state, "shop-a").await;

        let result = accept_offer(&state, &s.emergency.id, &s.s1.id, "driver", T0 + 60)
            .await
            .unwrap();

        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.warnings[0].severity, WarningSeverity::Critical);
        assert_eq!(result.warnings[0].error_class, "rejected");
    }

    #[tokio::test]
    async fn retry_after_success_is_a_replay_with_one_payment() {
        let (state, _dir) = test_state().await;
        let s = two_offer_scenario(&state, ServiceType::Repair).await;
        deny_notifications_to(&state, "shop-b").await;

        let first = accept_offer(&state, &s.emergency.id, &s.s1.id, "driver", T0 + 60)
            .await
            .unwrap();
        let second = accept_offer(&state, &s.emergency.id, &s.s1.id, "driver", T0 + 90)
            .await
            .unwrap();

        assert!(second.replayed);
        assert_eq!(second.transaction_id, first.transaction_id);
        assert!(second.notifications.is_empty());
        assert_eq!(payment_count(&state, &s.emergency.id).await, 1);
    }

    #[tokio::test]
    async fn accepting_a_competitor_after_the_fact_is_conflict() {
        let (state, _dir) = test_state().await;
        let s = two_offer_scenario(&state, ServiceType::Repair).await;

        accept_offer(&state, &s.emergency.id, &s.s1.id, "driver", T0 + 60)
            .await
            .unwrap();
        let err = accept_offer(&state, &s.emergency.id, &s.s2.id, "driver", T0 + 61)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(payment_count(&state, &s.emergency.id).await, 1);
    }

    #[tokio::test]
    async fn only_the_requester_can_accept() {
        let (state, _dir) = test_state().await;
        let s = two_offer_scenario(&state, ServiceType::Repair).await;

        let err = accept_offer(&state, &s.emergency.id, &s.s1.id, "shop-b", T0 + 60)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Forbidden(_)));
        assert_eq!(request_status(&state, &s.s1.id).await, RequestStatus::Pending);
    }

    #[tokio::test]
    async fn unknown_service_request_is_not_found() {
        let (state, _dir) = test_state().await;
        let s = two_offer_scenario(&state, ServiceType::Repair).await;

        let err = accept_offer(&state, &s.emergency.id, "missing", "driver", T0 + 60)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NotFound(_)));
    }

    #[tokio::test]
    async fn gas_payment_has_no_labor_cost() {
        let (state, _dir) = test_state().await;
        let shop = seed_shop(&state, "gas-shop", ShopType::GasStation, 9.88, 123.60).await;
        let emergency = seed_emergency(&state, "driver", ServiceType::Gas, T0).await;
        // 店舗が labor 側に入れてきても fuel に寄せる
        let request = seed_request(&state, &emergency, &shop, 80.0, 300.0, T0 + 5).await;

        let result = accept_offer(&state, &emergency.id, &request.id, "driver", T0 + 60)
            .await
            .unwrap();
        let payment = payments::get_payment(&state, &result.transaction_id, "driver")
            .await
            .unwrap();
        assert_eq!(payment.labor_cost, 0.0);
        assert_eq!(payment.fuel_cost, 380.0);
    }

    #[tokio::test]
    async fn repair_payment_has_no_fuel_cost() {
        let (state, _dir) = test_state().await;
        let shop = seed_shop(&state, "mech", ShopType::Mechanic, 9.88, 123.60).await;
        let emergency = seed_emergency(&state, "driver", ServiceType::Repair, T0).await;
        let request = seed_request(&state, &emergency, &shop, 250.0, 40.0, T0 + 5).await;

        let result = accept_offer(&state, &emergency.id, &request.id, "driver", T0 + 60)
            .await
            .unwrap();
        let payment = payments::get_payment(&state, &result.transaction_id, "driver")
            .await
            .unwrap();
        assert_eq!(payment.fuel_cost, 0.0);
        assert_eq!(payment.labor_cost, 290.0);
    }

    #[tokio::test]
    async fn concurrent_accepts_have_exactly_one_winner() {
        let (state, _dir) = test_state().await;
        let emergency = seed_emergency(&state, "driver", ServiceType::Repair, T0).await;

        let mut service_ids = Vec::new();
        for i in 0..5 {
            let owner = format!("mech-{}", i);
            let shop = seed_shop(&state, &owner, ShopType::Mechanic, 9.88, 123.60).await;
            let request = seed_request(&state, &emergency, &shop, 300.0 + i as f64, 0.0, T0 + i).await;
            service_ids.push(request.id);
        }

        let mut handles = Vec::new();
        for service_id in service_ids.clone() {
            let state = state.clone();
            let emergency_id = emergency.id.clone();
            handles.push(tokio::spawn(async move {
                accept_offer(&state, &emergency_id, &service_id, "driver", T0 + 60).await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(result) => {
                    assert!(!result.replayed);
                    winners += 1;
                }
                Err(e) => assert!(e.is_conflict(), "unexpected error: {:?}", e),
            }
        }
        assert_eq!(winners, 1);

        let (accepted,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM service_requests WHERE emergency_id = ? AND status = 'accepted'",
        )
        .bind(&emergency.id)
        .fetch_one(&state.db)
        .await
        .unwrap();
        assert_eq!(accepted, 1);
        assert_eq!(payment_count(&state, &emergency.id).await, 1);
    }

    #[tokio::test]
    async fn cancel_loses_to_a_pending_offer() {
        let (state, _dir) = test_state().await;
        let s = two_offer_scenario(&state, ServiceType::Repair).await;

        let err = lifecycle::cancel_emergency(&state, &s.emergency.id, "driver", T0 + 3600)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Validation(_)));

        accept_offer(&state, &s.emergency.id, &s.s1.id, "driver", T0 + 3600)
            .await
            .unwrap();
        let err = lifecycle::cancel_emergency(&state, &s.emergency.id, "driver", T0 + 3601)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn racing_accept_withdraw_and_cancel_leave_one_consistent_outcome() {
        for round in 0..8 {
            let (state, _dir) = test_state().await;
            let shop = seed_shop(&state, "mech", ShopType::Mechanic, 9.88, 123.60).await;
            let emergency = seed_emergency(&state, "driver", ServiceType::Repair, T0).await;
            let request = seed_request(&state, &emergency, &shop, 300.0, 0.0, T0 + 5).await;
            let now = T0 + 3600;

            let accept = {
                let (state, e, s) = (state.clone(), emergency.id.clone(), request.id.clone());
                tokio::spawn(async move { accept_offer(&state, &e, &s, "driver", now).await })
            };
            let withdraw = {
                let (state, e, s) = (state.clone(), emergency.id.clone(), request.id.clone());
                tokio::spawn(async move { reject_offer(&state, &s, &e, "mech", now).await })
            };
            let cancel = {
                let (state, e) = (state.clone(), emergency.id.clone());
                tokio::spawn(async move { lifecycle::cancel_emergency(&state, &e, "driver", now).await })
            };

            let accepted = accept.await.unwrap();
            let withdrawn = withdraw.await.unwrap();
            let canceled = cancel.await.unwrap();

            // accept と取り下げはどちらか一方だけ
            assert_ne!(accepted.is_ok(), withdrawn.is_ok(), "round {}", round);
            for err in [accepted.as_ref().err(), canceled.as_ref().err()].into_iter().flatten() {
                assert!(
                    matches!(err, DispatchError::Conflict(_) | DispatchError::Validation(_)),
                    "round {}: {:?}",
                    round,
                    err
                );
            }
            if let Err(err) = &withdrawn {
                assert!(err.is_conflict(), "round {}: {:?}", round, err);
            }

            let mut conn = state.db.acquire().await.unwrap();
            let current = load_emergency(&mut conn, &emergency.id).await.unwrap();
            let status = load_service_request(&mut conn, &request.id).await.unwrap().status;
            drop(conn);

            if accepted.is_ok() {
                assert!(canceled.is_err(), "round {}", round);
                assert_eq!(current.status, EmergencyStatus::InProcess);
                assert_eq!(status, RequestStatus::Accepted);
            }
            if canceled.is_ok() {
                assert_eq!(current.status, EmergencyStatus::Canceled);
                assert_eq!(status, RequestStatus::Rejected);
            }
            // canceled と accepted が同時に成り立つことはない
            assert!(!(current.status == EmergencyStatus::Canceled && status == RequestStatus::Accepted));
        }
    }

    #[tokio::test]
    async fn reject_is_idempotent() {
        let (state, _dir) = test_state().await;
        let s = two_offer_scenario(&state, ServiceType::Repair).await;

        let first = reject_offer(&state, &s.s2.id, &s.emergency.id, "driver", T0 + 30)
            .await
            .unwrap();
        assert_eq!(first.status, RequestStatus::Rejected);
        assert_eq!(first.rejected_at, Some(T0 + 30));

        let again = reject_offer(&state, &s.s2.id, &s.emergency.id, "driver", T0 + 40)
            .await
            .unwrap();
        assert_eq!(again.rejected_at, Some(T0 + 30));
        // 他の request には影響しない
        assert_eq!(request_status(&state, &s.s1.id).await, RequestStatus::Pending);
    }

    #[tokio::test]
    async fn shop_can_withdraw_but_strangers_cannot() {
        let (state, _dir) = test_state().await;
        let s = two_offer_scenario(&state, ServiceType::Repair).await;

        let err = reject_offer(&state, &s.s1.id, &s.emergency.id, "shop-b", T0 + 30)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Forbidden(_)));

        let withdrawn = reject_offer(&state, &s.s1.id, &s.emergency.id, "shop-a", T0 + 30)
            .await
            .unwrap();
        assert_eq!(withdrawn.status, RequestStatus::Rejected);
    }

    #[tokio::test]
    async fn rejecting_the_accepted_request_is_conflict() {
        let (state, _dir) = test_state().await;
        let s = two_offer_scenario(&state, ServiceType::Repair).await;
        accept_offer(&state, &s.emergency.id, &s.s1.id, "driver", T0 + 60)
            .await
            .unwrap();

        let err = reject_offer(&state, &s.s1.id, &s.emergency.id, "driver", T0 + 61)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }
}
