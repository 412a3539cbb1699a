use anyhow::Context;
use std::sync::Arc;
use tracing::info;

use roadside_dispatch::config::AppConfig;
use roadside_dispatch::db::init_db;
use roadside_dispatch::{build_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ログ初期化
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = AppConfig::from_env()?;

    // DB初期化
    let db = init_db(&config.db_path)
        .await
        .with_context(|| format!("failed to open database at {}", config.db_path))?;
    info!("🗄️  Database ready: {}", config.db_path);

    let addr = config.bind_addr.clone();
    info!(
        "⏱️  Offer poll interval: {}s, cancel grace: {}s, broadcast radius: {}km",
        config.poll_interval_secs, config.cancel_grace_secs, config.broadcast_radius_km
    );

    let state = Arc::new(AppState::new(db, config));
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("🚀 Roadside Dispatch API listening on {}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}
