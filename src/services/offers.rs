//! Offer Aggregator
//! pending の ServiceRequest と、それぞれの最新 ShopOffer をまとめて運転手に見せる
//!
//! 最新オファーの解決は2段階:
//! 1. service_id に紐付くオファー
//! 2. 無ければ (emergency_id, shop_id) に紐付き service_id が NULL のオファー

use serde_json::json;
use sqlx::SqliteConnection;
use tracing::{info, warn};

use crate::error::{DispatchError, Result};
use crate::feed::{ChangeEvent, Operation, Table};
use crate::geo::{haversine_km, round2};
use crate::models::{
    Emergency, EmergencyStatus, NewNotification, NotificationType, OfferInput, OfferLink,
    OfferQuote, OfferView, RequestStatus, ServiceRequest, Shop, ShopOffer, ShopType,
};
use crate::services::lifecycle::load_emergency;
use crate::services::shops::{is_unique_violation, shop_of_owner};
use crate::services::{new_id, notifier};
use crate::AppState;

// ========================================
// Pricing
// ========================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pricing {
    pub distance_km: f64,
    pub distance_fee: f64,
    pub total_amount: f64,
}

/// distance_fee = distance × rate, total = distance_fee + labor + fuel
pub fn price_offer(distance_km: f64, input: &OfferInput) -> Result<Pricing> {
    for (name, value) in [
        ("rate_per_km", input.rate_per_km),
        ("labor_cost", input.labor_cost),
        ("fuel_cost", input.fuel_cost),
    ] {
        if !value.is_finite() || value < 0.0 {
            return Err(DispatchError::Validation(format!(
                "{} must be a non-negative amount",
                name
            )));
        }
    }

    let distance_km = round2(distance_km);
    let distance_fee = round2(distance_km * input.rate_per_km);
    let total_amount = round2(distance_fee + input.labor_cost + input.fuel_cost);

    Ok(Pricing {
        distance_km,
        distance_fee,
        total_amount,
    })
}

// ========================================
// Authoritative offer resolution
// ========================================

/// リンク先ごとの最新オファー（created_at、同秒なら挿入順）
pub async fn latest_offer(conn: &mut SqliteConnection, link: &OfferLink) -> Result<Option<ShopOffer>> {
    let offer: Option<ShopOffer> = match link {
        OfferLink::LinkedToRequest { service_id } => {
            sqlx::query_as(
                "SELECT * FROM shop_offers WHERE service_id = ? \
                 ORDER BY created_at DESC, rowid DESC LIMIT 1",
            )
            .bind(service_id)
            .fetch_optional(&mut *conn)
            .await?
        }
        OfferLink::LinkedToEmergencyShop { emergency_id, shop_id } => {
            sqlx::query_as(
                "SELECT * FROM shop_offers WHERE emergency_id = ? AND shop_id = ? AND service_id IS NULL \
                 ORDER BY created_at DESC, rowid DESC LIMIT 1",
            )
            .bind(emergency_id)
            .bind(shop_id)
            .fetch_optional(&mut *conn)
            .await?
        }
    };
    Ok(offer)
}

/// ServiceRequest に対する正とするオファー
pub async fn resolve_authoritative_offer(
    conn: &mut SqliteConnection,
    request: &ServiceRequest,
) -> Result<Option<ShopOffer>> {
    let by_request = OfferLink::LinkedToRequest {
        service_id: request.id.clone(),
    };
    if let Some(offer) = latest_offer(conn, &by_request).await? {
        return Ok(Some(offer));
    }

    let by_emergency_shop = OfferLink::LinkedToEmergencyShop {
        emergency_id: request.emergency_id.clone(),
        shop_id: request.shop_id.clone(),
    };
    latest_offer(conn, &by_emergency_shop).await
}

// ========================================
// Aggregation
// ========================================

#[derive(Debug, sqlx::FromRow)]
struct PendingRow {
    id: String,
    emergency_id: String,
    shop_id: String,
    shop_latitude: f64,
    shop_longitude: f64,
    status: RequestStatus,
    requested_at: i64,
    accepted_at: Option<i64>,
    rejected_at: Option<i64>,
    owner_user_id: String,
    shop_name: String,
    shop_type: ShopType,
    shop_phone: Option<String>,
}

/// GET /api/emergencies/:id/offers（依頼者本人のみ）
pub async fn list_outstanding_offers(
    state: &AppState,
    emergency_id: &str,
    caller: &str,
) -> Result<Vec<OfferView>> {
    let mut conn = state.db.acquire().await?;
    let emergency = load_emergency(&mut conn, emergency_id).await?;
    if emergency.requester_id != caller {
        return Err(DispatchError::Forbidden(
            "only the requester can list offers".to_string(),
        ));
    }
    outstanding_offers(&mut conn, &emergency).await
}

/// 読み取りのみ。何度呼んでも、並行に呼んでもよい
pub async fn outstanding_offers(
    conn: &mut SqliteConnection,
    emergency: &Emergency,
) -> Result<Vec<OfferView>> {
    let rows: Vec<PendingRow> = sqlx::query_as(
        "SELECT sr.id, sr.emergency_id, sr.shop_id, sr.shop_latitude, sr.shop_longitude, sr.status, \
                sr.requested_at, sr.accepted_at, sr.rejected_at, \
                s.owner_user_id, s.name AS shop_name, s.shop_type, s.phone AS shop_phone \
         FROM service_requests sr JOIN shops s ON s.id = sr.shop_id \
         WHERE sr.emergency_id = ? AND sr.status = ? \
         ORDER BY sr.requested_at ASC, sr.rowid ASC",
    )
    .bind(&emergency.id)
    .bind(RequestStatus::Pending)
    .fetch_all(&mut *conn)
    .await?;

    let mut views = Vec::with_capacity(rows.len());
    for row in rows {
        let request = ServiceRequest {
            id: row.id,
            emergency_id: row.emergency_id,
            shop_id: row.shop_id,
            shop_latitude: row.shop_latitude,
            shop_longitude: row.shop_longitude,
            status: row.status,
            requested_at: row.requested_at,
            accepted_at: row.accepted_at,
            rejected_at: row.rejected_at,
        };

        // オファーが無くても一覧から落とさない
        let quote = match resolve_authoritative_offer(conn, &request).await? {
            Some(offer) => OfferQuote::from(&offer),
            None => OfferQuote::NoOfferYet,
        };

        let distance_km = round2(haversine_km(
            emergency.latitude,
            emergency.longitude,
            request.shop_latitude,
            request.shop_longitude,
        ));

        views.push(OfferView {
            service_id: request.id,
            shop_id: request.shop_id,
            shop_user_id: row.owner_user_id,
            shop_name: row.shop_name,
            shop_type: row.shop_type,
            shop_phone: row.shop_phone,
            distance_km,
            requested_at: request.requested_at,
            quote,
        });
    }

    Ok(views)
}

// ========================================
// Shop side
// ========================================

/// POST /api/emergencies/:id/service-requests
///
/// pending の ServiceRequest と最初のオファーを同時に作る
pub async fn submit_service_request(
    state: &AppState,
    emergency_id: &str,
    shop_owner: &str,
    input: OfferInput,
    now: i64,
) -> Result<(ServiceRequest, ShopOffer)> {
    let (shop, emergency) = {
        let mut conn = state.db.acquire().await?;
        let shop = shop_of_owner(&mut conn, shop_owner).await?;
        let emergency = load_emergency(&mut conn, emergency_id).await?;
        (shop, emergency)
    };

    if emergency.requester_id == shop_owner {
        return Err(DispatchError::Forbidden(
            "cannot respond to your own emergency".to_string(),
        ));
    }
    if emergency.status != EmergencyStatus::Waiting {
        return Err(DispatchError::Conflict(format!(
            "emergency is {:?}, no longer accepting offers",
            emergency.status
        )));
    }

    let pricing = price_offer(
        haversine_km(emergency.latitude, emergency.longitude, shop.latitude, shop.longitude),
        &input,
    )?;

    let service_id = new_id();
    let offer_id = new_id();

    let mut tx = state.db.begin().await?;

    // emergency がまだ waiting のときだけ挿入
    let inserted = sqlx::query(
        "INSERT INTO service_requests (id, emergency_id, shop_id, shop_latitude, shop_longitude, status, requested_at) \
         SELECT ?, ?, ?, ?, ?, ?, ? WHERE EXISTS (SELECT 1 FROM emergency WHERE id = ? AND status = ?)",
    )
    .bind(&service_id)
    .bind(emergency_id)
    .bind(&shop.id)
    .bind(shop.latitude)
    .bind(shop.longitude)
    .bind(RequestStatus::Pending)
    .bind(now)
    .bind(emergency_id)
    .bind(EmergencyStatus::Waiting)
    .execute(&mut *tx)
    .await;

    match inserted {
        Ok(r) if r.rows_affected() == 0 => {
            return Err(DispatchError::Conflict(
                "emergency is no longer accepting offers".to_string(),
            ));
        }
        Ok(_) => {}
        Err(e) if is_unique_violation(&e) => {
            return Err(DispatchError::Conflict(
                "this shop already has a pending request for the emergency".to_string(),
            ));
        }
        Err(e) => return Err(e.into()),
    }

    insert_offer(
        &mut tx,
        &offer_id,
        Some(&service_id),
        emergency_id,
        &shop.id,
        &pricing,
        &input,
        now,
    )
    .await?;

    tx.commit().await?;

    info!(
        "Service request submitted: id={}, emergency={}, shop={}, total={}",
        service_id, emergency_id, shop.id, pricing.total_amount
    );
    state.feed.publish(ChangeEvent::new(
        Table::ServiceRequests,
        Operation::Insert,
        Some(emergency_id),
        &service_id,
    ));
    state.feed.publish(ChangeEvent::new(
        Table::ShopOffers,
        Operation::Insert,
        Some(emergency_id),
        &offer_id,
    ));

    let (request, offer) = {
        let mut conn = state.db.acquire().await?;
        let request = load_service_request(&mut conn, &service_id).await?;
        let offer = latest_offer(
            &mut conn,
            &OfferLink::LinkedToRequest {
                service_id: service_id.clone(),
            },
        )
        .await?
        .ok_or_else(|| DispatchError::Internal(format!("offer {} vanished", offer_id)))?;
        (request, offer)
    };

    notify_driver_of_offer(state, &emergency, &shop, &offer, now).await;

    Ok((request, offer))
}

/// POST /api/emergencies/:id/offers
///
/// 見積もりの修正。service_id 指定時はその ServiceRequest に、未指定なら (emergency, shop) に紐付く
pub async fn submit_offer(
    state: &AppState,
    emergency_id: &str,
    shop_owner: &str,
    service_id: Option<String>,
    input: OfferInput,
    now: i64,
) -> Result<ShopOffer> {
    let mut conn = state.db.acquire().await?;
    let shop = shop_of_owner(&mut conn, shop_owner).await?;
    let emergency = load_emergency(&mut conn, emergency_id).await?;

    let offer_id = new_id();

    let result = match &service_id {
        Some(service_id) => {
            let request = load_service_request(&mut conn, service_id).await?;
            if request.emergency_id != emergency_id {
                return Err(DispatchError::NotFound(format!(
                    "service request {} on emergency {}",
                    service_id, emergency_id
                )));
            }
            if request.shop_id != shop.id {
                return Err(DispatchError::Forbidden(
                    "service request belongs to another shop".to_string(),
                ));
            }

            // 距離は ServiceRequest 作成時の店舗位置で計算
            let pricing = price_offer(
                haversine_km(
                    emergency.latitude,
                    emergency.longitude,
                    request.shop_latitude,
                    request.shop_longitude,
                ),
                &input,
            )?;

            sqlx::query(
                "INSERT INTO shop_offers (offer_id, service_id, emergency_id, shop_id, distance_km, rate_per_km, \
                 distance_fee, labor_cost, fuel_cost, total_amount, note, created_at) \
                 SELECT ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ? \
                 WHERE EXISTS (SELECT 1 FROM service_requests WHERE id = ? AND status = ?)",
            )
            .bind(&offer_id)
            .bind(service_id)
            .bind(emergency_id)
            .bind(&shop.id)
            .bind(pricing.distance_km)
            .bind(input.rate_per_km)
            .bind(pricing.distance_fee)
            .bind(input.labor_cost)
            .bind(input.fuel_cost)
            .bind(pricing.total_amount)
            .bind(&input.note)
            .bind(now)
            .bind(service_id)
            .bind(RequestStatus::Pending)
            .execute(&mut *conn)
            .await?
        }
        None => {
            let pricing = price_offer(
                haversine_km(emergency.latitude, emergency.longitude, shop.latitude, shop.longitude),
                &input,
            )?;

            sqlx::query(
                "INSERT INTO shop_offers (offer_id, service_id, emergency_id, shop_id, distance_km, rate_per_km, \
                 distance_fee, labor_cost, fuel_cost, total_amount, note, created_at) \
                 SELECT ?, NULL, ?, ?, ?, ?, ?, ?, ?, ?, ?, ? \
                 WHERE EXISTS (SELECT 1 FROM emergency WHERE id = ? AND status = ?)",
            )
            .bind(&offer_id)
            .bind(emergency_id)
            .bind(&shop.id)
            .bind(pricing.distance_km)
            .bind(input.rate_per_km)
            .bind(pricing.distance_fee)
            .bind(input.labor_cost)
            .bind(input.fuel_cost)
            .bind(pricing.total_amount)
            .bind(&input.note)
            .bind(now)
            .bind(emergency_id)
            .bind(EmergencyStatus::Waiting)
            .execute(&mut *conn)
            .await?
        }
    };

    if result.rows_affected() == 0 {
        return Err(DispatchError::Conflict(
            "offer can no longer be revised".to_string(),
        ));
    }

    let offer: ShopOffer = sqlx::query_as("SELECT * FROM shop_offers WHERE offer_id = ?")
        .bind(&offer_id)
        .fetch_one(&mut *conn)
        .await?;
    drop(conn);

    info!(
        "Offer submitted: id={}, emergency={}, shop={}, link={:?}, total={}",
        offer.offer_id,
        emergency_id,
        shop.id,
        offer.link(),
        offer.total_amount
    );
    state.feed.publish(ChangeEvent::new(
        Table::ShopOffers,
        Operation::Insert,
        Some(emergency_id),
        &offer.offer_id,
    ));

    notify_driver_of_offer(state, &emergency, &shop, &offer, now).await;

    Ok(offer)
}

#[allow(clippy::too_many_arguments)]
async fn insert_offer(
    conn: &mut SqliteConnection,
    offer_id: &str,
    service_id: Option<&str>,
    emergency_id: &str,
    shop_id: &str,
    pricing: &Pricing,
    input: &OfferInput,
    now: i64,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO shop_offers (offer_id, service_id, emergency_id, shop_id, distance_km, rate_per_km, \
         distance_fee, labor_cost, fuel_cost, total_amount, note, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(offer_id)
    .bind(service_id)
    .bind(emergency_id)
    .bind(shop_id)
    .bind(pricing.distance_km)
    .bind(input.rate_per_km)
    .bind(pricing.distance_fee)
    .bind(input.labor_cost)
    .bind(input.fuel_cost)
    .bind(pricing.total_amount)
    .bind(&input.note)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn notify_driver_of_offer(
    state: &AppState,
    emergency: &Emergency,
    shop: &Shop,
    offer: &ShopOffer,
    now: i64,
) {
    let delivery = notifier::notify(
        state,
        NewNotification {
            from_user_id: Some(shop.owner_user_id.clone()),
            to_user_id: emergency.requester_id.clone(),
            kind: NotificationType::NewOfferReceived,
            title: "New offer received".to_string(),
            body: format!("{} offered to help for ₱{:.2}.", shop.name, offer.total_amount),
            data: json!({
                "emergency_id": emergency.id,
                "service_id": offer.service_id,
                "offer_id": offer.offer_id,
                "shop_id": shop.id,
                "total_amount": offer.total_amount,
            }),
        },
        now,
    )
    .await;

    if !delivery.is_delivered() {
        warn!(
            "Driver not notified of offer: emergency={}, offer={}",
            emergency.id, offer.offer_id
        );
    }
}

pub async fn load_service_request(
    conn: &mut SqliteConnection,
    service_id: &str,
) -> Result<ServiceRequest> {
    let request: Option<ServiceRequest> =
        sqlx::query_as("SELECT * FROM service_requests WHERE id = ?")
            .bind(service_id)
            .fetch_optional(&mut *conn)
            .await?;
    request.ok_or_else(|| DispatchError::NotFound(format!("service request {}", service_id)))
}

/// GET /api/shops/me/service-requests
pub async fn list_shop_service_requests(
    state: &AppState,
    shop_owner: &str,
) -> Result<Vec<ServiceRequest>> {
    let mut conn = state.db.acquire().await?;
    let shop = shop_of_owner(&mut conn, shop_owner).await?;
    let rows = sqlx::query_as(
        "SELECT * FROM service_requests WHERE shop_id = ? ORDER BY requested_at DESC, rowid DESC",
    )
    .bind(&shop.id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows)
}
