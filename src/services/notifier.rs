//! Notification Dispatcher
//! notifications テーブルへの追記のみ。他のエンティティは触らない

use futures::future::join_all;
use serde::Serialize;
use sqlx::types::Json;
use tracing::{info, warn};

use crate::error::{DispatchError, Result};
use crate::feed::{ChangeEvent, Operation, Table};
use crate::models::{NewNotification, Notification};
use crate::services::new_id;
use crate::AppState;

/// 失敗の分類（呼び出し側のトリアージ用）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// 入力不正（宛先なし等）
    Invalid,
    /// データ層が拒否した（権限・制約・トリガー）
    Rejected,
    /// 接続・タイムアウト等。再送で通る可能性あり
    Transient,
    Unknown,
}

impl ErrorClass {
    fn of(err: &sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db) => Self::of_sqlite_code(db.code().as_deref()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                ErrorClass::Transient
            }
            _ => ErrorClass::Unknown,
        }
    }

    /// SQLITE_BUSY (5) / SQLITE_LOCKED (6) は拡張コード込みで再送対象
    fn of_sqlite_code(code: Option<&str>) -> Self {
        const SQLITE_BUSY: i32 = 5;
        const SQLITE_LOCKED: i32 = 6;

        match code.and_then(|c| c.parse::<i32>().ok()).map(|c| c & 0xff) {
            Some(SQLITE_BUSY) | Some(SQLITE_LOCKED) => ErrorClass::Transient,
            _ => ErrorClass::Rejected,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::Invalid => "invalid",
            ErrorClass::Rejected => "rejected",
            ErrorClass::Transient => "transient",
            ErrorClass::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeliveryResult {
    Delivered {
        notification_id: String,
        recipient: String,
    },
    Failed {
        recipient: String,
        error_class: ErrorClass,
        detail: String,
    },
}

impl DeliveryResult {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryResult::Delivered { .. })
    }
}

/// 1件の通知を保存する。失敗は DeliveryResult::Failed として返す
pub async fn notify(state: &AppState, notification: NewNotification, now: i64) -> DeliveryResult {
    let recipient = notification.to_user_id.clone();

    if recipient.trim().is_empty() {
        return DeliveryResult::Failed {
            recipient,
            error_class: ErrorClass::Invalid,
            detail: "to_user_id is empty".to_string(),
        };
    }

    let id = new_id();
    let data = if notification.data.is_null() {
        serde_json::json!({})
    } else {
        notification.data
    };
    let emergency_id = data
        .get("emergency_id")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    let result = sqlx::query(
        "INSERT INTO notifications (id, from_user_id, to_user_id, type, title, body, data, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(&notification.from_user_id)
    .bind(&recipient)
    .bind(notification.kind)
    .bind(&notification.title)
    .bind(&notification.body)
    .bind(Json(&data))
    .bind(now)
    .execute(&state.db)
    .await;

    match result {
        Ok(_) => {
            state.feed.publish(ChangeEvent::new(
                Table::Notifications,
                Operation::Insert,
                emergency_id.as_deref(),
                &id,
            ));
            DeliveryResult::Delivered {
                notification_id: id,
                recipient,
            }
        }
        Err(e) => {
            let error_class = ErrorClass::of(&e);
            warn!(
                "Notification insert failed: to={}, type={:?}, class={}, error={}",
                recipient,
                notification.kind,
                error_class.as_str(),
                e
            );
            DeliveryResult::Failed {
                recipient,
                error_class,
                detail: e.to_string(),
            }
        }
    }
}

/// 複数の宛先へ並行送信。結果は入力と同じ順序
pub async fn fan_out(
    state: &AppState,
    notifications: Vec<NewNotification>,
    now: i64,
) -> Vec<DeliveryResult> {
    join_all(notifications.into_iter().map(|n| notify(state, n, now))).await
}

/// GET /api/notifications 用
pub async fn list_for_user(
    state: &AppState,
    user_id: &str,
    unread_only: bool,
) -> Result<Vec<Notification>> {
    let rows: Vec<Notification> = if unread_only {
        sqlx::query_as(
            "SELECT * FROM notifications WHERE to_user_id = ? AND read_at IS NULL \
             ORDER BY created_at DESC, rowid DESC",
        )
        .bind(user_id)
        .fetch_all(&state.db)
        .await?
    } else {
        sqlx::query_as(
            "SELECT * FROM notifications WHERE to_user_id = ? ORDER BY created_at DESC, rowid DESC",
        )
        .bind(user_id)
        .fetch_all(&state.db)
        .await?
    };
    Ok(rows)
}

pub async fn unread_count(state: &AppState, user_id: &str) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM notifications WHERE to_user_id = ? AND read_at IS NULL",
    )
    .bind(user_id)
    .fetch_one(&state.db)
    .await?;
    Ok(count)
}

/// read_at は最初の1回だけ設定する
pub async fn mark_read(
    state: &AppState,
    notification_id: &str,
    user_id: &str,
    now: i64,
) -> Result<Notification> {
    let result = sqlx::query(
        "UPDATE notifications SET read_at = ? WHERE id = ? AND to_user_id = ? AND read_at IS NULL",
    )
    .bind(now)
    .bind(notification_id)
    .bind(user_id)
    .execute(&state.db)
    .await?;

    let notification: Option<Notification> =
        sqlx::query_as("SELECT * FROM notifications WHERE id = ? AND to_user_id = ?")
            .bind(notification_id)
            .bind(user_id)
            .fetch_optional(&state.db)
            .await?;

    let notification = notification
        .ok_or_else(|| DispatchError::NotFound(format!("notification {}", notification_id)))?;

    if result.rows_affected() > 0 {
        info!("Notification read: id={}, user={}", notification_id, user_id);
    }
    Ok(notification)
}
