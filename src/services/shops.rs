//! Shops
//! 店舗プロフィール（1ユーザー1店舗）

use sqlx::SqliteConnection;
use tracing::info;

use crate::error::{DispatchError, Result};
use crate::geo::valid_coordinates;
use crate::models::{RegisterShopRequest, Shop, ShopType};
use crate::services::new_id;
use crate::AppState;

pub async fn register_shop(
    state: &AppState,
    owner_user_id: &str,
    req: RegisterShopRequest,
    now: i64,
) -> Result<Shop> {
    if req.name.trim().is_empty() {
        return Err(DispatchError::Validation("shop name is required".to_string()));
    }
    if !valid_coordinates(req.latitude, req.longitude) {
        return Err(DispatchError::Validation("invalid shop location".to_string()));
    }

    let id = new_id();
    let result = sqlx::query(
        "INSERT INTO shops (id, owner_user_id, name, shop_type, latitude, longitude, phone, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(owner_user_id)
    .bind(req.name.trim())
    .bind(req.shop_type)
    .bind(req.latitude)
    .bind(req.longitude)
    .bind(&req.phone)
    .bind(now)
    .execute(&state.db)
    .await;

    if let Err(e) = result {
        if is_unique_violation(&e) {
            return Err(DispatchError::Conflict(format!(
                "user {} already owns a shop",
                owner_user_id
            )));
        }
        return Err(e.into());
    }

    info!("Shop registered: id={}, owner={}, type={:?}", id, owner_user_id, req.shop_type);

    get_shop(state, &id).await
}

pub async fn get_shop(state: &AppState, shop_id: &str) -> Result<Shop> {
    let shop: Option<Shop> = sqlx::query_as("SELECT * FROM shops WHERE id = ?")
        .bind(shop_id)
        .fetch_optional(&state.db)
        .await?;
    shop.ok_or_else(|| DispatchError::NotFound(format!("shop {}", shop_id)))
}

/// 呼び出しユーザーの店舗。無ければ Forbidden
pub async fn shop_of_owner(conn: &mut SqliteConnection, owner_user_id: &str) -> Result<Shop> {
    let shop: Option<Shop> = sqlx::query_as("SELECT * FROM shops WHERE owner_user_id = ?")
        .bind(owner_user_id)
        .fetch_optional(&mut *conn)
        .await?;
    shop.ok_or_else(|| DispatchError::Forbidden("caller does not own a shop".to_string()))
}

pub async fn shops_of_type(conn: &mut SqliteConnection, shop_type: ShopType) -> Result<Vec<Shop>> {
    let shops = sqlx::query_as("SELECT * FROM shops WHERE shop_type = ?")
        .bind(shop_type)
        .fetch_all(&mut *conn)
        .await?;
    Ok(shops)
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false)
}
