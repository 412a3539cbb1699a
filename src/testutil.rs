//! テスト用のフィクスチャ

use std::sync::Arc;
use tempfile::TempDir;

use crate::config::AppConfig;
use crate::db::init_db;
use crate::models::{
    CreateEmergencyRequest, Emergency, OfferInput, RegisterShopRequest, ServiceRequest,
    ServiceType, Shop, ShopType,
};
use crate::services::{lifecycle, offers, shops};
use crate::AppState;

/// テスト内の基準時刻
pub const T0: i64 = 1_700_000_000;

/// 一時ファイル上の SQLite。TempDir を持っている間だけ有効
pub async fn test_state() -> (Arc<AppState>, TempDir) {
    test_state_with(AppConfig::default()).await
}

pub async fn test_state_with(config: AppConfig) -> (Arc<AppState>, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dispatch-test.db");
    let db = init_db(path.to_str().unwrap()).await.unwrap();
    (Arc::new(AppState::new(db, config)), dir)
}

pub async fn seed_shop(
    state: &AppState,
    owner: &str,
    shop_type: ShopType,
    latitude: f64,
    longitude: f64,
) -> Shop {
    shops::register_shop(
        state,
        owner,
        RegisterShopRequest {
            name: format!("{} shop", owner),
            shop_type,
            latitude,
            longitude,
            phone: Some("09170000000".to_string()),
        },
        T0 - 3600,
    )
    .await
    .unwrap()
}

pub fn emergency_request(service_type: ServiceType) -> CreateEmergencyRequest {
    CreateEmergencyRequest {
        latitude: 9.8777,
        longitude: 123.5958,
        vehicle_type: "motorcycle".to_string(),
        service_type,
        fuel_type: match service_type {
            ServiceType::Gas => Some("unleaded".to_string()),
            _ => None,
        },
        description: Some("flat tire near the plaza".to_string()),
    }
}

pub async fn seed_emergency(
    state: &AppState,
    requester: &str,
    service_type: ServiceType,
    created_at: i64,
) -> Emergency {
    lifecycle::create_emergency(state, requester, emergency_request(service_type), created_at)
        .await
        .unwrap()
}

/// km 単価なしの見積もり
pub fn offer(labor_cost: f64, fuel_cost: f64) -> OfferInput {
    OfferInput {
        rate_per_km: 0.0,
        labor_cost,
        fuel_cost,
        note: None,
    }
}

pub async fn seed_request(
    state: &AppState,
    emergency: &Emergency,
    shop: &Shop,
    labor_cost: f64,
    fuel_cost: f64,
    now: i64,
) -> ServiceRequest {
    let (request, _) = offers::submit_service_request(
        state,
        &emergency.id,
        &shop.owner_user_id,
        offer(labor_cost, fuel_cost),
        now,
    )
    .await
    .unwrap();
    request
}

/// 指定ユーザー宛ての通知 INSERT をデータ層で拒否させる
pub async fn deny_notifications_to(state: &AppState, user_id: &str) {
    let trigger: String = user_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let sql = format!(
        "CREATE TRIGGER deny_notifications_{} BEFORE INSERT ON notifications \
         WHEN NEW.to_user_id = '{}' BEGIN SELECT RAISE(ABORT, 'recipient rejected'); END",
        trigger,
        user_id.replace('\'', "''")
    );
    sqlx::query(&sql).execute(&state.db).await.unwrap();
}

/// 運転手 "driver" の emergency に shop-a (₱450) と shop-b (₱500) が応答済み
pub struct TwoOffers {
    pub emergency: Emergency,
    pub shop_a: Shop,
    pub shop_b: Shop,
    pub s1: ServiceRequest,
    pub s2: ServiceRequest,
}

pub async fn two_offer_scenario(state: &AppState, service_type: ServiceType) -> TwoOffers {
    let shop_type = service_type.shop_type();
    let shop_a = seed_shop(state, "shop-a", shop_type, 9.8810, 123.6010).await;
    let shop_b = seed_shop(state, "shop-b", shop_type, 9.8700, 123.5900).await;
    let emergency = seed_emergency(state, "driver", service_type, T0).await;

    let (labor_a, fuel_a, labor_b, fuel_b) = match service_type {
        ServiceType::Gas => (0.0, 450.0, 0.0, 500.0),
        _ => (450.0, 0.0, 500.0, 0.0),
    };
    let s1 = seed_request(state, &emergency, &shop_a, labor_a, fuel_a, T0 + 10).await;
    let s2 = seed_request(state, &emergency, &shop_b, labor_b, fuel_b, T0 + 20).await;

    TwoOffers {
        emergency,
        shop_a,
        shop_b,
        s1,
        s2,
    }
}
