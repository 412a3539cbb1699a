//! Database Module
//! SQLite を使用した emergency / service_requests / shop_offers / payment_transaction / notifications の管理

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// データベース接続プール
pub type DbPool = Pool<Sqlite>;

/// データベースを初期化
pub async fn init_db(db_path: &str) -> Result<DbPool> {
    info!("Initializing database: {}", db_path);

    // 書き込みは単一ライター。待ちは busy_timeout に任せる
    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(10))
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    // スキーマ作成
    create_schema(&pool).await?;

    info!("Database initialized successfully");
    Ok(pool)
}

/// スキーマ作成
async fn create_schema(pool: &DbPool) -> Result<()> {
    // shops テーブル（1ユーザー1店舗）
    sqlx::query(r#"
        CREATE TABLE IF NOT EXISTS shops (
            id TEXT PRIMARY KEY,
            owner_user_id TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            shop_type TEXT NOT NULL,
            latitude REAL NOT NULL,
            longitude REAL NOT NULL,
            phone TEXT,
            created_at INTEGER NOT NULL
        )
    "#)
    .execute(pool)
    .await?;

    // emergency テーブル（物理削除しない。hidden_by_requester で非表示）
    sqlx::query(r#"
        CREATE TABLE IF NOT EXISTS emergency (
            id TEXT PRIMARY KEY,
            requester_id TEXT NOT NULL,
            latitude REAL NOT NULL,
            longitude REAL NOT NULL,
            vehicle_type TEXT NOT NULL,
            service_type TEXT NOT NULL,
            fuel_type TEXT,
            description TEXT,
            status TEXT NOT NULL DEFAULT 'waiting',
            accepted_shop_user_id TEXT,
            created_at INTEGER NOT NULL,
            accepted_at INTEGER,
            completed_at INTEGER,
            canceled_at INTEGER,
            hidden_by_requester INTEGER NOT NULL DEFAULT 0,
            CHECK ((accepted_shop_user_id IS NOT NULL) = (status IN ('in_process', 'completed')))
        )
    "#)
    .execute(pool)
    .await?;

    // service_requests テーブル
    sqlx::query(r#"
        CREATE TABLE IF NOT EXISTS service_requests (
            id TEXT PRIMARY KEY,
            emergency_id TEXT NOT NULL,
            shop_id TEXT NOT NULL,
            shop_latitude REAL NOT NULL,
            shop_longitude REAL NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            requested_at INTEGER NOT NULL,
            accepted_at INTEGER,
            rejected_at INTEGER,
            FOREIGN KEY (emergency_id) REFERENCES emergency(id),
            FOREIGN KEY (shop_id) REFERENCES shops(id)
        )
    "#)
    .execute(pool)
    .await?;

    // 1 emergency につき accepted は最大1件
    sqlx::query(r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_service_requests_one_accepted
        ON service_requests(emergency_id) WHERE status = 'accepted'
    "#)
    .execute(pool)
    .await?;

    // 同じ店舗の pending は1件まで
    sqlx::query(r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_service_requests_one_pending_per_shop
        ON service_requests(emergency_id, shop_id) WHERE status = 'pending'
    "#)
    .execute(pool)
    .await?;

    // shop_offers テーブル（追記のみ）
    sqlx::query(r#"
        CREATE TABLE IF NOT EXISTS shop_offers (
            offer_id TEXT PRIMARY KEY,
            service_id TEXT,
            emergency_id TEXT NOT NULL,
            shop_id TEXT NOT NULL,
            distance_km REAL NOT NULL DEFAULT 0,
            rate_per_km REAL NOT NULL DEFAULT 0,
            distance_fee REAL NOT NULL DEFAULT 0,
            labor_cost REAL NOT NULL DEFAULT 0,
            fuel_cost REAL NOT NULL DEFAULT 0,
            total_amount REAL NOT NULL DEFAULT 0,
            note TEXT,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (service_id) REFERENCES service_requests(id),
            FOREIGN KEY (emergency_id) REFERENCES emergency(id)
        )
    "#)
    .execute(pool)
    .await?;

    // payment_transaction テーブル
    sqlx::query(r#"
        CREATE TABLE IF NOT EXISTS payment_transaction (
            transaction_id TEXT PRIMARY KEY,
            emergency_id TEXT NOT NULL,
            service_id TEXT NOT NULL,
            shop_id TEXT NOT NULL,
            driver_user_id TEXT NOT NULL,
            distance_fee REAL NOT NULL DEFAULT 0,
            labor_cost REAL NOT NULL DEFAULT 0,
            fuel_cost REAL NOT NULL DEFAULT 0,
            parts_cost REAL NOT NULL DEFAULT 0,
            extra_items TEXT NOT NULL DEFAULT '[]',
            extra_total REAL NOT NULL DEFAULT 0,
            total_amount REAL NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'to_pay',
            payment_method TEXT,
            proof_image_url TEXT,
            created_at INTEGER NOT NULL,
            paid_at INTEGER,
            FOREIGN KEY (emergency_id) REFERENCES emergency(id),
            FOREIGN KEY (service_id) REFERENCES service_requests(id)
        )
    "#)
    .execute(pool)
    .await?;

    // (emergency_id, service_id) ごとに有効な取引は1件
    sqlx::query(r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_payment_one_active_per_pair
        ON payment_transaction(emergency_id, service_id) WHERE status != 'canceled'
    "#)
    .execute(pool)
    .await?;

    // notifications テーブル
    sqlx::query(r#"
        CREATE TABLE IF NOT EXISTS notifications (
            id TEXT PRIMARY KEY,
            from_user_id TEXT,
            to_user_id TEXT NOT NULL,
            type TEXT NOT NULL,
            title TEXT NOT NULL,
            body TEXT NOT NULL,
            data TEXT NOT NULL DEFAULT '{}',
            read_at INTEGER,
            created_at INTEGER NOT NULL
        )
    "#)
    .execute(pool)
    .await?;

    // インデックス作成
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_shops_type ON shops(shop_type)")
        .execute(pool).await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_emergency_requester ON emergency(requester_id)")
        .execute(pool).await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_emergency_status ON emergency(status)")
        .execute(pool).await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_service_requests_emergency ON service_requests(emergency_id, status)")
        .execute(pool).await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_service_requests_shop ON service_requests(shop_id)")
        .execute(pool).await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_shop_offers_service ON shop_offers(service_id, created_at)")
        .execute(pool).await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_shop_offers_emergency_shop ON shop_offers(emergency_id, shop_id, created_at)")
        .execute(pool).await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_notifications_to_user ON notifications(to_user_id, created_at)")
        .execute(pool).await?;

    Ok(())
}
