//! Dispatch services
//! ハンドラから呼ばれるドメインロジック

pub mod acceptance;
pub mod lifecycle;
pub mod notifier;
pub mod offers;
pub mod payments;
pub mod shops;

/// 現在時刻 (Unix秒)
pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// 新しい行ID (UUID v4)
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
