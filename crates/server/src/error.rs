use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// The hub's single error taxonomy. Every fallible operation in the hub returns one of
/// these variants; REST handlers convert them to a response via [`IntoResponse`], WS and
/// stream handlers match on the same enum to decide between a JSON error frame and a raw
/// close code, so the mapping from taxonomy to wire behavior lives in exactly one place.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("missing or invalid token")]
    Unauthenticated,
    #[error("tenant access forbidden")]
    TenantForbidden,
    #[error("not found")]
    NotFound,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("persistence failure: {0}")]
    Persistence(String),
}

impl IntoResponse for HubError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            HubError::InvalidCredentials => (StatusCode::UNAUTHORIZED, self.to_string()),
            HubError::Unauthenticated => (StatusCode::UNAUTHORIZED, self.to_string()),
            HubError::TenantForbidden => (StatusCode::FORBIDDEN, self.to_string()),
            HubError::NotFound => (StatusCode::NOT_FOUND, self.to_string()),
            HubError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            HubError::Persistence(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[tokio::test]
    async fn tenant_forbidden_maps_to_403() {
        let resp = HubError::TenantForbidden.into_response();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn not_found_maps_to_404_json() {
        let resp = HubError::NotFound.into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"], "not found");
    }
}
