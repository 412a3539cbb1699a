//! Configuration
//! 環境変数 DISPATCH_* で上書き可能なサーバー設定

use anyhow::{Context, Result};
use std::str::FromStr;
use std::time::Duration;

/// サーバー設定
///
/// | 環境変数 | デフォルト | 説明 |
/// |----------|-----------|------|
/// | DISPATCH_BIND_ADDR | 0.0.0.0:3000 | 待ち受けアドレス |
/// | DISPATCH_DB_PATH | ./dispatch.db | SQLite ファイル |
/// | DISPATCH_POLL_INTERVAL_SECS | 15 | オファー再取得の間隔 |
/// | DISPATCH_CANCEL_GRACE_SECS | 300 | キャンセル可能になるまでの猶予 |
/// | DISPATCH_BROADCAST_RADIUS_KM | 15 | emergency_posted 通知の半径 |
/// | DISPATCH_FEED_CAPACITY | 256 | change feed のバッファ |
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub db_path: String,
    pub poll_interval_secs: u64,
    pub cancel_grace_secs: i64,
    pub broadcast_radius_km: f64,
    pub feed_capacity: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".to_string(),
            db_path: "./dispatch.db".to_string(),
            poll_interval_secs: 15,
            cancel_grace_secs: 5 * 60,
            broadcast_radius_km: 15.0,
            feed_capacity: 256,
        }
    }
}

impl AppConfig {
    /// デフォルト値に環境変数を重ねて読み込む
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("DISPATCH_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Ok(path) = std::env::var("DISPATCH_DB_PATH") {
            config.db_path = path;
        }
        if let Some(v) = parse_var("DISPATCH_POLL_INTERVAL_SECS")? {
            config.poll_interval_secs = v;
        }
        if let Some(v) = parse_var("DISPATCH_CANCEL_GRACE_SECS")? {
            config.cancel_grace_secs = v;
        }
        if let Some(v) = parse_var("DISPATCH_BROADCAST_RADIUS_KM")? {
            config.broadcast_radius_km = v;
        }
        if let Some(v) = parse_var("DISPATCH_FEED_CAPACITY")? {
            config.feed_capacity = v;
        }

        if config.poll_interval_secs == 0 {
            anyhow::bail!("DISPATCH_POLL_INTERVAL_SECS must be greater than 0");
        }
        if config.feed_capacity == 0 {
            anyhow::bail!("DISPATCH_FEED_CAPACITY must be greater than 0");
        }

        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

fn parse_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => {
            let value = raw
                .trim()
                .parse::<T>()
                .with_context(|| format!("invalid value for {}: {:?}", name, raw))?;
            Ok(Some(value))
        }
        Err(_) => Ok(None),
    }
}
