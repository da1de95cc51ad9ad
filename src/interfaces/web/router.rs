use axum::extract::State;
use axum::http::{HeaderValue, Method};
use axum::routing::{delete, get, post};
use axum::{Json, Router, middleware};
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;

use super::auth;
use super::handlers::{connect, interact, publishing};
use super::AppState;

fn build_cors(frontend_url: &str) -> CorsLayer {
    let origins: Vec<HeaderValue> = [frontend_url]
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(tower_http::cors::Any)
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "prism",
        "version": env!("CARGO_PKG_VERSION"),
        "scheduler_running": state
            .scheduler_running
            .load(std::sync::atomic::Ordering::SeqCst),
    }))
}

pub fn build_router(state: AppState) -> Router {
    let cors = build_cors(&state.cfg.frontend_url);

    // Webhook deliveries authenticate via HMAC (POST) or the verify-token
    // handshake (GET); the OAuth callback arrives from the user's browser.
    // None of these can carry the operator API key.
    let public_routes = Router::new()
        .route("/health", get(health))
        .route(
            "/webhook",
            get(interact::webhook_verify).post(interact::webhook_events),
        )
        .route("/connect/callback", get(connect::callback))
        .with_state(state.clone());

    let authed_routes = Router::new()
        .route("/connect/authorize", get(connect::authorize))
        .route("/connect/token", post(connect::direct_connect))
        .route("/connect/status", get(connect::status))
        .route("/connect/{persona_id}", delete(connect::disconnect))
        .route(
            "/schedule",
            post(publishing::create_schedule).get(publishing::list_schedule),
        )
        .route("/schedule/{job_id}", delete(publishing::cancel_schedule))
        .route("/publish-now", post(publishing::publish_now))
        .route(
            "/replies/pending/{persona_id}",
            get(interact::pending_replies),
        )
        .route("/replies/{reply_id}/send", post(interact::send_reply))
        .route("/replies/{reply_id}/dismiss", post(interact::dismiss_reply))
        .route(
            "/settings/{persona_id}",
            get(interact::get_settings).post(interact::update_settings),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_key,
        ))
        .with_state(state);

    public_routes.merge(authed_routes).layer(cors)
}
