//! HTTP Handlers
//! 認証は上流ゲートウェイが済ませ、ユーザーIDを X-User-Id ヘッダで渡してくる

pub mod emergencies;
pub mod notifications;
pub mod payments;
pub mod service_requests;
pub mod shops;

use axum::{extract::FromRequestParts, http::request::Parts, response::Json};
use serde::Serialize;

use crate::error::DispatchError;

pub const USER_HEADER: &str = "x-user-id";

/// 呼び出しユーザー
#[derive(Debug, Clone)]
pub struct Caller(pub String);

#[axum::async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = DispatchError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user = parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or(DispatchError::Unauthorized)?;
        Ok(Caller(user.to_string()))
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    service: String,
    version: String,
}

/// ヘルスチェック
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "roadside-dispatch".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}


#[cfg(test)]
mod tests {
    use super::test_support::call;
    use crate::build_router;
    use crate::testutil::test_state;
    use axum::http::{Method, StatusCode};

    #[tokio::test]
    async fn health_needs_no_caller() {
        let (state, _dir) = test_state().await;
        let app = build_router(state);

        let (status, body) = call(&app, Method::GET, "/api/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn missing_user_header_is_unauthorized() {
        let (state, _dir) = test_state().await;
        let app = build_router(state);

        let (status, body) = call(&app, Method::GET, "/api/emergencies", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], false);
        assert_eq!(body["code"], "unauthorized");
    }
}
