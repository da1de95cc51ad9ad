use axum::Json;
use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use super::AppState;

/// Shared-key gate over the operator surface. Disabled when no key is
/// configured (local development). Webhook routes never pass through here;
/// they authenticate with the HMAC signature and the verify-token handshake.
pub async fn require_api_key(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if state.cfg.api_key.is_empty() {
        return next.run(req).await;
    }
    let provided = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok());
    if provided == Some(state.cfg.api_key.as_str()) {
        next.run(req).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "missing or invalid X-Api-Key" })),
        )
            .into_response()
    }
}
