//! Payment Transactions
//! accept されたオファーから支払い記録を1件だけ作る。支払い完了で emergency を completed に進める

use rand::Rng;
use serde_json::json;
use sqlx::types::Json;
use sqlx::SqliteConnection;
use tracing::{info, warn};

use crate::error::{DispatchError, Result};
use crate::feed::{ChangeEvent, Operation, Table};
use crate::geo::round2;
use crate::models::{
    Emergency, ExtraItem, MarkPaidRequest, NewNotification, NotificationType, PaymentStatus,
    PaymentTransaction, ServiceRequest, ServiceType, ShopOffer, UpdateBillRequest,
};
use crate::services::lifecycle::complete_emergency;
use crate::services::notifier::{self, DeliveryResult};
use crate::services::shops::is_unique_violation;
use crate::AppState;

// ========================================
// Cost exclusivity
// ========================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Charges {
    pub distance_fee: f64,
    pub labor_cost: f64,
    pub fuel_cost: f64,
}

impl Charges {
    pub fn subtotal(&self) -> f64 {
        round2(self.distance_fee + self.labor_cost + self.fuel_cost)
    }
}

/// gas は fuel_cost のみ、それ以外は labor_cost のみにサービス料を載せる。
/// オファー側の labor / fuel の振り分けは信用しない
pub fn exclusive_charges(service_type: ServiceType, offer: &ShopOffer) -> Charges {
    let service_charge = round2(offer.labor_cost + offer.fuel_cost);
    match service_type {
        ServiceType::Gas => Charges {
            distance_fee: offer.distance_fee,
            labor_cost: 0.0,
            fuel_cost: service_charge,
        },
        ServiceType::Vulcanize | ServiceType::Repair => Charges {
            distance_fee: offer.distance_fee,
            labor_cost: service_charge,
            fuel_cost: 0.0,
        },
    }
}

// ========================================
// Materialization
// ========================================

/// (emergency_id, service_id) の取引を作る。既にあればそれを返す（created = false）
///
/// 呼び出し側のトランザクション内で使う
pub async fn materialize_payment(
    conn: &mut SqliteConnection,
    emergency: &Emergency,
    request: &ServiceRequest,
    offer: &ShopOffer,
    now: i64,
) -> Result<(PaymentTransaction, bool)> {
    if let Some(existing) = active_payment_for_pair(conn, &emergency.id, &request.id).await? {
        return Ok((existing, false));
    }
    insert_or_adopt(conn, emergency, request, offer, now).await
}

/// INSERT して、一意制約で負けたら既存の行を返す
async fn insert_or_adopt(
    conn: &mut SqliteConnection,
    emergency: &Emergency,
    request: &ServiceRequest,
    offer: &ShopOffer,
    now: i64,
) -> Result<(PaymentTransaction, bool)> {
    let charges = exclusive_charges(emergency.service_type, offer);
    let transaction_id = generate_transaction_id();

    let inserted = sqlx::query(
        "INSERT INTO payment_transaction (transaction_id, emergency_id, service_id, shop_id, driver_user_id, \
         distance_fee, labor_cost, fuel_cost, parts_cost, extra_items, extra_total, total_amount, status, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, '[]', 0, ?, ?, ?)",
    )
    .bind(&transaction_id)
    .bind(&emergency.id)
    .bind(&request.id)
    .bind(&request.shop_id)
    .bind(&emergency.requester_id)
    .bind(charges.distance_fee)
    .bind(charges.labor_cost)
    .bind(charges.fuel_cost)
    .bind(charges.subtotal())
    .bind(PaymentStatus::ToPay)
    .bind(now)
    .execute(&mut *conn)
    .await;

    match inserted {
        Ok(_) => {}
        // ストア側の一意制約で負けた = 既に誰かが作った
        Err(e) if is_unique_violation(&e) => {
            if let Some(existing) = active_payment_for_pair(conn, &emergency.id, &request.id).await? {
                return Ok((existing, false));
            }
            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    }

    let created = load_payment(conn, &transaction_id).await?;
    info!(
        "Payment transaction created: id={}, emergency={}, service={}, total={}",
        created.transaction_id, created.emergency_id, created.service_id, created.total_amount
    );
    Ok((created, true))
}

async fn active_payment_for_pair(
    conn: &mut SqliteConnection,
    emergency_id: &str,
    service_id: &str,
) -> Result<Option<PaymentTransaction>> {
    let payment = sqlx::query_as(
        "SELECT * FROM payment_transaction WHERE emergency_id = ? AND service_id = ? AND status != ?",
    )
    .bind(emergency_id)
    .bind(service_id)
    .bind(PaymentStatus::Canceled)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(payment)
}

async fn load_payment(conn: &mut SqliteConnection, transaction_id: &str) -> Result<PaymentTransaction> {
    let payment: Option<PaymentTransaction> =
        sqlx::query_as("SELECT * FROM payment_transaction WHERE transaction_id = ?")
            .bind(transaction_id)
            .fetch_optional(&mut *conn)
            .await?;
    payment.ok_or_else(|| DispatchError::NotFound(format!("payment {}", transaction_id)))
}

// ========================================
// Reads
// ========================================

/// 運転手、または担当店舗のオーナーのみ
async fn ensure_participant(
    conn: &mut SqliteConnection,
    payment: &PaymentTransaction,
    caller: &str,
) -> Result<()> {
    if payment.driver_user_id == caller {
        return Ok(());
    }
    if shop_owner_of(conn, &payment.shop_id).await?.as_deref() == Some(caller) {
        return Ok(());
    }
    Err(DispatchError::Forbidden("not a party to this payment".to_string()))
}

async fn shop_owner_of(conn: &mut SqliteConnection, shop_id: &str) -> Result<Option<String>> {
    let owner: Option<(String,)> = sqlx::query_as("SELECT owner_user_id FROM shops WHERE id = ?")
        .bind(shop_id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(owner.map(|(o,)| o))
}

pub async fn get_payment(
    state: &AppState,
    transaction_id: &str,
    caller: &str,
) -> Result<PaymentTransaction> {
    let mut conn = state.db.acquire().await?;
    let payment = load_payment(&mut conn, transaction_id).await?;
    ensure_participant(&mut conn, &payment, caller).await?;
    Ok(payment)
}

pub async fn get_payment_for_emergency(
    state: &AppState,
    emergency_id: &str,
    caller: &str,
) -> Result<PaymentTransaction> {
    let mut conn = state.db.acquire().await?;
    let payment: Option<PaymentTransaction> = sqlx::query_as(
        "SELECT * FROM payment_transaction WHERE emergency_id = ? AND status != ? \
         ORDER BY created_at DESC LIMIT 1",
    )
    .bind(emergency_id)
    .bind(PaymentStatus::Canceled)
    .fetch_optional(&mut *conn)
    .await?;
    let payment = payment
        .ok_or_else(|| DispatchError::NotFound(format!("payment for emergency {}", emergency_id)))?;
    ensure_participant(&mut conn, &payment, caller).await?;
    Ok(payment)
}

// ========================================
// Mutations
// ========================================

/// POST /api/payments/:transaction_id/bill（担当店舗のみ、to_pay の間だけ）
pub async fn update_bill(
    state: &AppState,
    transaction_id: &str,
    shop_owner: &str,
    req: UpdateBillRequest,
) -> Result<PaymentTransaction> {
    if !req.parts_cost.is_finite() || req.parts_cost < 0.0 {
        return Err(DispatchError::Validation("parts_cost must be non-negative".to_string()));
    }
    let extra_total = extra_total(&req.extra_items)?;

    let result = sqlx::query(
        "UPDATE payment_transaction SET parts_cost = ?, extra_items = ?, extra_total = ?, \
         total_amount = round(distance_fee + labor_cost + fuel_cost + ? + ?, 2) \
         WHERE transaction_id = ? AND status = ? \
         AND shop_id = (SELECT id FROM shops WHERE owner_user_id = ?)",
    )
    .bind(round2(req.parts_cost))
    .bind(Json(&req.extra_items))
    .bind(extra_total)
    .bind(round2(req.parts_cost))
    .bind(extra_total)
    .bind(transaction_id)
    .bind(PaymentStatus::ToPay)
    .bind(shop_owner)
    .execute(&state.db)
    .await?;

    let mut conn = state.db.acquire().await?;
    let payment = load_payment(&mut conn, transaction_id).await?;

    if result.rows_affected() == 0 {
        if shop_owner_of(&mut conn, &payment.shop_id).await?.as_deref() != Some(shop_owner) {
            return Err(DispatchError::Forbidden(
                "only the accepted shop can update the bill".to_string(),
            ));
        }
        return Err(DispatchError::Conflict(format!(
            "payment is {:?}, bill can no longer change",
            payment.status
        )));
    }

    info!(
        "Bill updated: txn={}, parts={}, extras={}, total={}",
        transaction_id, payment.parts_cost, payment.extra_total, payment.total_amount
    );
    state.feed.publish(ChangeEvent::new(
        Table::PaymentTransaction,
        Operation::Update,
        Some(&payment.emergency_id),
        transaction_id,
    ));
    Ok(payment)
}

fn extra_total(items: &[ExtraItem]) -> Result<f64> {
    let mut total = 0.0;
    for item in items {
        if item.name.trim().is_empty() {
            return Err(DispatchError::Validation("extra item name is required".to_string()));
        }
        if !item.unit_cost.is_finite() || item.unit_cost < 0.0 {
            return Err(DispatchError::Validation(format!(
                "unit_cost of {} must be non-negative",
                item.name
            )));
        }
        total += f64::from(item.qty) * item.unit_cost;
    }
    Ok(round2(total))
}

/// POST /api/payments/:transaction_id/pay
///
/// to_pay → paid と emergency の in_process → completed を同じトランザクションで行う
pub async fn mark_paid(
    state: &AppState,
    transaction_id: &str,
    driver: &str,
    req: MarkPaidRequest,
    now: i64,
) -> Result<PaymentTransaction> {
    let method = req.payment_method.trim();
    if method.is_empty() {
        return Err(DispatchError::Validation("payment_method is required".to_string()));
    }

    let mut tx = state.db.begin().await?;

    let result = sqlx::query(
        "UPDATE payment_transaction SET status = ?, paid_at = ?, payment_method = ?, proof_image_url = ? \
         WHERE transaction_id = ? AND driver_user_id = ? AND status = ?",
    )
    .bind(PaymentStatus::Paid)
    .bind(now)
    .bind(method)
    .bind(&req.proof_image_url)
    .bind(transaction_id)
    .bind(driver)
    .bind(PaymentStatus::ToPay)
    .execute(&mut *tx)
    .await?;

    if result.rows_affected() == 0 {
        tx.rollback().await?;
        let mut conn = state.db.acquire().await?;
        let payment = load_payment(&mut conn, transaction_id).await?;
        if payment.driver_user_id != driver {
            return Err(DispatchError::Forbidden("only the driver can pay".to_string()));
        }
        return Err(DispatchError::Conflict(format!(
            "payment is already {:?}",
            payment.status
        )));
    }

    let payment = load_payment(&mut tx, transaction_id).await?;
    complete_emergency(&mut tx, &payment.emergency_id, now).await?;
    let shop_owner = shop_owner_of(&mut tx, &payment.shop_id).await?;

    tx.commit().await?;

    info!(
        "Payment received: txn={}, emergency={}, method={}, total={}",
        transaction_id, payment.emergency_id, method, payment.total_amount
    );
    state.feed.publish(ChangeEvent::new(
        Table::PaymentTransaction,
        Operation::Update,
        Some(&payment.emergency_id),
        transaction_id,
    ));
    state.feed.publish(ChangeEvent::new(
        Table::Emergency,
        Operation::Update,
        Some(&payment.emergency_id),
        &payment.emergency_id,
    ));

    let data = json!({
        "emergency_id": payment.emergency_id,
        "service_id": payment.service_id,
        "transaction_id": payment.transaction_id,
    });
    let mut messages = vec![NewNotification {
        from_user_id: None,
        to_user_id: driver.to_string(),
        kind: NotificationType::EmergencyCompleted,
        title: "Service completed".to_string(),
        body: format!("Your payment of ₱{:.2} was recorded. Drive safe!", payment.total_amount),
        data: data.clone(),
    }];
    if let Some(owner) = shop_owner {
        messages.push(NewNotification {
            from_user_id: Some(driver.to_string()),
            to_user_id: owner,
            kind: NotificationType::PaymentReceived,
            title: "Payment received".to_string(),
            body: format!("The driver paid ₱{:.2} via {}.", payment.total_amount, method),
            data,
        });
    }

    for delivery in notifier::fan_out(state, messages, now).await {
        if let DeliveryResult::Failed { recipient, error_class, .. } = delivery {
            warn!(
                "Completion notice not delivered: txn={}, recipient={}, class={}",
                transaction_id,
                recipient,
                error_class.as_str()
            );
        }
    }

    Ok(payment)
}

// ========================================
// Helper Functions
// ========================================

fn generate_transaction_id() -> String {
    let random_bytes: [u8; 5] = rand::thread_rng().gen();
    let encoded = base32::encode(base32::Alphabet::Crockford, &random_bytes);
    format!("TXN_{}", &encoded[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer(labor: f64, fuel: f64, distance_fee: f64) -> ShopOffer {
        ShopOffer {
            offer_id: "o".to_string(),
            service_id: Some("s".to_string()),
            emergency_id: "e".to_string(),
            shop_id: "shop".to_string(),
            distance_km: 1.0,
            rate_per_km: distance_fee,
            distance_fee,
            labor_cost: labor,
            fuel_cost: fuel,
            total_amount: labor + fuel + distance_fee,
            note: None,
            created_at: 0,
        }
    }

    #[test]
    fn gas_moves_everything_to_fuel() {
        let c = exclusive_charges(ServiceType::Gas, &offer(120.0, 300.0, 30.0));
        assert_eq!(c.labor_cost, 0.0);
        assert_eq!(c.fuel_cost, 420.0);
        assert_eq!(c.subtotal(), 450.0);
    }

    #[test]
    fn non_gas_moves_everything_to_labor() {
        for service in [ServiceType::Repair, ServiceType::Vulcanize] {
            let c = exclusive_charges(service, &offer(200.0, 50.0, 0.0));
            assert_eq!(c.fuel_cost, 0.0);
            assert_eq!(c.labor_cost, 250.0);
        }
    }

    #[test]
    fn extra_total_multiplies_quantities() {
        let items = vec![
            ExtraItem { name: "Valve".into(), qty: 2, unit_cost: 35.5 },
            ExtraItem { name: "Patch".into(), qty: 1, unit_cost: 40.0 },
        ];
        assert_eq!(extra_total(&items).unwrap(), 111.0);
    }

    #[test]
    fn extra_total_rejects_unnamed_items() {
        let items = vec![ExtraItem { name: " ".into(), qty: 1, unit_cost: 1.0 }];
        assert!(extra_total(&items).is_err());
    }

    #[test]
    fn transaction_ids_are_prefixed() {
        let id = generate_transaction_id();
        assert!(id.starts_with("TXN_"));
        assert_eq!(id.len(), 12);
    }

    // ----------------------------------------
    // accept 後の請求・支払い
    // ----------------------------------------

    use crate::models::EmergencyStatus;
    use crate::services::acceptance::accept_offer;
    use crate::services::lifecycle::load_emergency;
    use crate::testutil::{test_state, two_offer_scenario, T0};

    async fn accepted_payment(state: &AppState) -> PaymentTransaction {
        let s = two_offer_scenario(state, ServiceType::Vulcanize).await;
        let result = accept_offer(state, &s.emergency.id, &s.s1.id, "driver", T0 + 60)
            .await
            .unwrap();
        get_payment(state, &result.transaction_id, "driver").await.unwrap()
    }

    #[tokio::test]
    async fn shop_updates_bill_with_parts_and_extras() {
        let (state, _dir) = test_state().await;
        let payment = accepted_payment(&state).await;

        let updated = update_bill(
            &state,
            &payment.transaction_id,
            "shop-a",
            UpdateBillRequest {
                parts_cost: 120.0,
                extra_items: vec![ExtraItem { name: "Valve".into(), qty: 2, unit_cost: 15.0 }],
            },
        )
        .await
        .unwrap();
        assert_eq!(updated.parts_cost, 120.0);
        assert_eq!(updated.extra_total, 30.0);
        assert_eq!(updated.total_amount, 600.0);
        assert_eq!(updated.extra_items.0.len(), 1);

        let err = update_bill(
            &state,
            &payment.transaction_id,
            "shop-b",
            UpdateBillRequest { parts_cost: 1.0, extra_items: vec![] },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DispatchError::Forbidden(_)));
    }

    #[tokio::test]
    async fn paying_completes_the_emergency() {
        let (state, _dir) = test_state().await;
        let payment = accepted_payment(&state).await;

        let paid = mark_paid(
            &state,
            &payment.transaction_id,
            "driver",
            MarkPaidRequest { payment_method: "cash".into(), proof_image_url: None },
            T0 + 600,
        )
        .await
        .unwrap();
        assert_eq!(paid.status, PaymentStatus::Paid);
        assert_eq!(paid.paid_at, Some(T0 + 600));

        let mut conn = state.db.acquire().await.unwrap();
        let emergency = load_emergency(&mut conn, &payment.emergency_id).await.unwrap();
        drop(conn);
        assert_eq!(emergency.status, EmergencyStatus::Completed);
        assert_eq!(emergency.completed_at, Some(T0 + 600));

        let driver_inbox = notifier::list_for_user(&state, "driver", true).await.unwrap();
        assert!(driver_inbox
            .iter()
            .any(|n| n.kind == NotificationType::EmergencyCompleted));
        let shop_inbox = notifier::list_for_user(&state, "shop-a", true).await.unwrap();
        assert!(shop_inbox
            .iter()
            .any(|n| n.kind == NotificationType::PaymentReceived));

        // 支払い後は請求を変えられない
        let err = update_bill(
            &state,
            &payment.transaction_id,
            "shop-a",
            UpdateBillRequest { parts_cost: 10.0, extra_items: vec![] },
        )
        .await
        .unwrap_err();
        assert!(err.is_conflict());

        let err = mark_paid(
            &state,
            &payment.transaction_id,
            "driver",
            MarkPaidRequest { payment_method: "cash".into(), proof_image_url: None },
            T0 + 601,
        )
        .await
        .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn existing_active_payment_is_reused() {
        use crate::services::offers::{load_service_request, resolve_authoritative_offer};

        let (state, _dir) = test_state().await;
        let s = two_offer_scenario(&state, ServiceType::Repair).await;

        sqlx::query(
            "INSERT INTO payment_transaction (transaction_id, emergency_id, service_id, shop_id, driver_user_id, total_amount, created_at) \
             VALUES ('TXN_SEEDED01', ?, ?, ?, 'driver', 450, ?)",
        )
        .bind(&s.emergency.id)
        .bind(&s.s1.id)
        .bind(&s.shop_a.id)
        .bind(T0 + 30)
        .execute(&state.db)
        .await
        .unwrap();

        let mut conn = state.db.acquire().await.unwrap();
        let emergency = load_emergency(&mut conn, &s.emergency.id).await.unwrap();
        let request = load_service_request(&mut conn, &s.s1.id).await.unwrap();
        let offer = resolve_authoritative_offer(&mut conn, &request).await.unwrap().unwrap();

        let (payment, created) = materialize_payment(&mut conn, &emergency, &request, &offer, T0 + 60)
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(payment.transaction_id, "TXN_SEEDED01");

        // 事前確認をすり抜けても一意制約で既存行に寄せる
        let (payment, created) = insert_or_adopt(&mut conn, &emergency, &request, &offer, T0 + 61)
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(payment.transaction_id, "TXN_SEEDED01");

        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM payment_transaction WHERE emergency_id = ?",
        )
        .bind(&s.emergency.id)
        .fetch_one(&mut *conn)
        .await
        .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn only_the_driver_can_pay() {
        let (state, _dir) = test_state().await;
        let payment = accepted_payment(&state).await;

        let err = mark_paid(
            &state,
            &payment.transaction_id,
            "shop-a",
            MarkPaidRequest { payment_method: "cash".into(), proof_image_url: None },
            T0 + 600,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DispatchError::Forbidden(_)));
    }
}
