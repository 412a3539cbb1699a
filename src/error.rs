//! Error Types
//! ドメインエラーと HTTP レスポンスへの変換

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use tracing::{debug, error};

pub type Result<T, E = DispatchError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("not found: {0}")]
    NotFound(String),

    /// X-User-Id が無い
    #[error("caller identity is required")]
    Unauthorized,

    #[error("forbidden: {0}")]
    Forbidden(String),

    /// 楽観的前提条件の失敗（他の誰かが先に accept / cancel した）
    #[error("conflict: {0}")]
    Conflict(String),

    /// ガード違反（pending が残っている、猶予期間中など）
    #[error("validation failed: {0}")]
    Validation(String),

    /// データ層の失敗。呼び出し側は同じ引数で再実行する
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::NotFound(_) => "not_found",
            DispatchError::Unauthorized => "unauthorized",
            DispatchError::Forbidden(_) => "forbidden",
            DispatchError::Conflict(_) => "conflict",
            DispatchError::Validation(_) => "validation",
            DispatchError::Database(_) => "fatal",
            DispatchError::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            DispatchError::NotFound(_) => StatusCode::NOT_FOUND,
            DispatchError::Unauthorized => StatusCode::UNAUTHORIZED,
            DispatchError::Forbidden(_) => StatusCode::FORBIDDEN,
            DispatchError::Conflict(_) => StatusCode::CONFLICT,
            DispatchError::Validation(_) => StatusCode::BAD_REQUEST,
            DispatchError::Database(_) | DispatchError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, DispatchError::Conflict(_))
    }
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub code: &'static str,
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            // 内部の詳細はログにのみ残す
            DispatchError::Database(e) => {
                error!("Fatal data-layer failure: {:?}", e);
                "Something went wrong, please try again".to_string()
            }
            DispatchError::Internal(msg) => {
                error!("Internal error: {}", msg);
                "Something went wrong, please try again".to_string()
            }
            other => {
                debug!("Request rejected: {}", other);
                other.to_string()
            }
        };

        (
            status,
            Json(ErrorResponse {
                success: false,
                error: message,
                code: self.code(),
            }),
        )
            .into_response()
    }
}
