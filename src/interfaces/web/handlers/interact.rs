use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{Value, json};
use sha2::Sha256;
use tracing::warn;

use super::super::AppState;
use super::error_reply;
use crate::core::error::{CoreResult, OrchestratorError};

type HmacSha256 = Hmac<Sha256>;

#[derive(Deserialize)]
pub struct HubQuery {
    #[serde(rename = "hub.mode")]
    pub hub_mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub hub_verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub hub_challenge: Option<String>,
}

/// Subscription handshake: echo the challenge only on an exact verify-token
/// match.
pub async fn webhook_verify(
    State(state): State<AppState>,
    Query(q): Query<HubQuery>,
) -> Response {
    if q.hub_mode.as_deref() == Some("subscribe")
        && q.hub_verify_token.as_deref() == Some(state.cfg.webhook_verify_token.as_str())
    {
        q.hub_challenge.unwrap_or_default().into_response()
    } else {
        (
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "webhook verification failed" })),
        )
            .into_response()
    }
}

/// Signed event delivery. The signature is checked over the raw body before
/// anything is parsed or any store is touched.
pub async fn webhook_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    if let Err(e) = verify_signature(&state.cfg.app_secret, &headers, body.as_bytes()) {
        return error_reply(&e).into_response();
    }
    let payload: Value = match serde_json::from_str(&body) {
        Ok(v) => v,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "invalid JSON payload" })),
            )
                .into_response();
        }
    };
    state.interact.process_payload(&payload).await;
    Json(json!({ "status": "ok" })).into_response()
}

fn verify_signature(app_secret: &str, headers: &HeaderMap, body: &[u8]) -> CoreResult<()> {
    if app_secret.is_empty() {
        // No shared secret provisioned; nothing to verify against.
        warn!("webhook signature check skipped: PRISM_APP_SECRET is not set");
        return Ok(());
    }
    let provided = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("sha256="))
        .ok_or_else(|| {
            OrchestratorError::Signature("missing X-Hub-Signature-256 header".into())
        })?;

    let mut mac = <HmacSha256 as Mac>::new_from_slice(app_secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(body);
    let expected = hex::encode(mac.finalize().into_bytes());

    if constant_time_eq(provided.as_bytes(), expected.as_bytes()) {
        Ok(())
    } else {
        Err(OrchestratorError::Signature(
            "body signature mismatch".into(),
        ))
    }
}

/// Constant-time comparison to prevent timing attacks.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b.iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

pub async fn pending_replies(
    State(state): State<AppState>,
    Path(persona_id): Path<String>,
) -> Response {
    match state.interact.pending(&persona_id).await {
        Ok(replies) => Json(json!({
            "persona_id": persona_id,
            "replies": replies,
            "count": replies.len(),
        }))
        .into_response(),
        Err(e) => error_reply(&OrchestratorError::Other(e)).into_response(),
    }
}

#[derive(Deserialize)]
pub struct SendReplyBody {
    pub persona_id: String,
}

pub async fn send_reply(
    State(state): State<AppState>,
    Path(reply_id): Path<String>,
    Json(body): Json<SendReplyBody>,
) -> Response {
    match state.interact.send(&reply_id, &body.persona_id).await {
        Ok(reply) => Json(json!({ "status": "sent", "reply": reply })).into_response(),
        Err(e) => error_reply(&e).into_response(),
    }
}

pub async fn dismiss_reply(
    State(state): State<AppState>,
    Path(reply_id): Path<String>,
) -> Response {
    match state.interact.dismiss(&reply_id).await {
        Ok(reply) => Json(json!({ "status": "dismissed", "reply": reply })).into_response(),
        Err(e) => error_reply(&e).into_response(),
    }
}

pub async fn get_settings(
    State(state): State<AppState>,
    Path(persona_id): Path<String>,
) -> Json<Value> {
    let mode = state.interact.auto_reply_mode(&persona_id).await;
    Json(json!({ "persona_id": persona_id, "mode": mode }))
}

#[derive(Deserialize)]
pub struct SettingsBody {
    pub mode: String,
}

pub async fn update_settings(
    State(state): State<AppState>,
    Path(persona_id): Path<String>,
    Json(body): Json<SettingsBody>,
) -> Response {
    match state
        .interact
        .set_auto_reply_mode(&persona_id, &body.mode)
        .await
    {
        Ok(mode) => Json(json!({
            "persona_id": persona_id,
            "mode": mode,
            "status": "updated",
        }))
        .into_response(),
        Err(e) => error_reply(&e).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn valid_signature_passes() {
        let body = br#"{"entry":[]}"#;
        let mut headers = HeaderMap::new();
        headers.insert("x-hub-signature-256", sign("secret", body).parse().unwrap());
        assert!(verify_signature("secret", &headers, body).is_ok());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let body = br#"{"entry":[]}"#;
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-hub-signature-256",
            sign("other-secret", body).parse().unwrap(),
        );
        assert!(matches!(
            verify_signature("secret", &headers, body),
            Err(OrchestratorError::Signature(_))
        ));
    }

    #[test]
    fn tampered_body_is_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-hub-signature-256",
            sign("secret", br#"{"entry":[]}"#).parse().unwrap(),
        );
        assert!(verify_signature("secret", &headers, br#"{"entry":[{}]}"#).is_err());
    }

    #[test]
    fn missing_header_is_rejected() {
        let headers = HeaderMap::new();
        assert!(matches!(
            verify_signature("secret", &headers, b"{}"),
            Err(OrchestratorError::Signature(_))
        ));
    }

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }
}
