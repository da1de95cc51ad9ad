use axum::Json;
use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Redirect, Response};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, warn};

use super::super::AppState;
use super::error_reply;
use crate::core::credentials::DirectConnect;

#[derive(Deserialize)]
pub struct PersonaQuery {
    pub persona_id: String,
}

pub async fn authorize(
    State(state): State<AppState>,
    Query(q): Query<PersonaQuery>,
) -> Response {
    match state.lifecycle.authorize_url(&q.persona_id) {
        Ok(url) => Json(json!({ "auth_url": url, "persona_id": q.persona_id })).into_response(),
        Err(e) => error_reply(&e).into_response(),
    }
}

#[derive(Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// The platform redirects the user's browser here after the consent
/// dialog. Success and failure both land on the application frontend; the
/// outcome rides in the query string.
pub async fn callback(
    State(state): State<AppState>,
    Query(q): Query<CallbackQuery>,
) -> Redirect {
    let base = format!("{}/auth/callback", state.cfg.frontend_url);

    if let Some(error) = q.error {
        let description = q.error_description.unwrap_or_default();
        warn!("authorization denied: {} ({})", error, description);
        return Redirect::to(&format!(
            "{base}?error={}&error_description={}",
            urlencoding::encode(&error),
            urlencoding::encode(&description),
        ));
    }

    let (Some(code), Some(oauth_state)) = (q.code, q.state) else {
        return Redirect::to(&format!("{base}?error=missing_code"));
    };

    match state.lifecycle.exchange(&code, &oauth_state).await {
        Ok(conn) => Redirect::to(&format!(
            "{base}?account_id={}&account_handle={}",
            urlencoding::encode(&conn.account_id),
            urlencoding::encode(&conn.account_handle),
        )),
        Err(e) => {
            error!("token exchange failed for state '{}': {}", oauth_state, e);
            let description: String = e.to_string().chars().take(200).collect();
            Redirect::to(&format!(
                "{base}?error=token_exchange_failed&error_description={}",
                urlencoding::encode(&description),
            ))
        }
    }
}

#[derive(Deserialize)]
pub struct DirectConnectBody {
    pub persona_id: Option<String>,
    pub access_token: String,
    pub account_id: Option<String>,
    pub account_handle: Option<String>,
}

pub async fn direct_connect(
    State(state): State<AppState>,
    Json(body): Json<DirectConnectBody>,
) -> Response {
    let req = DirectConnect {
        persona_id: body.persona_id,
        access_token: body.access_token,
        account_id: body.account_id,
        account_handle: body.account_handle,
    };
    match state.lifecycle.direct_connect(req).await {
        Ok(conn) => Json(json!({
            "connected": true,
            "persona_id": conn.persona_id,
            "account_id": conn.account_id,
            "account_handle": conn.account_handle,
        }))
        .into_response(),
        Err(e) => error_reply(&e).into_response(),
    }
}

pub async fn status(
    State(state): State<AppState>,
    Query(q): Query<PersonaQuery>,
) -> Json<serde_json::Value> {
    match state.store.get(&q.persona_id).await {
        Some(conn) => Json(json!({
            "connected": true,
            "account_id": conn.account_id,
            "account_handle": conn.account_handle,
            "connected_at": conn.connected_at.to_rfc3339(),
        })),
        None => Json(json!({ "connected": false })),
    }
}

pub async fn disconnect(
    State(state): State<AppState>,
    Path(persona_id): Path<String>,
) -> Json<serde_json::Value> {
    let disconnected = state.lifecycle.disconnect(&persona_id).await;
    Json(json!({ "disconnected": disconnected, "persona_id": persona_id }))
}
