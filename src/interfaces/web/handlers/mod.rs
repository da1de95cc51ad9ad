pub mod connect;
pub mod interact;
pub mod publishing;

use axum::Json;
use axum::http::StatusCode;
use serde_json::{Value, json};

use crate::core::error::OrchestratorError;

/// Translate a core error into an HTTP reply. The mapping is by variant
/// only; handlers never inspect message text.
pub(crate) fn error_reply(err: &OrchestratorError) -> (StatusCode, Json<Value>) {
    use OrchestratorError::*;
    let status = match err {
        Config(_) | Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        AccountResolution(_) | Container(_) | NotReady(_) => StatusCode::BAD_GATEWAY,
        Credential(_) | Validation(_) => StatusCode::BAD_REQUEST,
        UnsupportedFormat(_) => StatusCode::UNPROCESSABLE_ENTITY,
        RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
        NotFound(_) => StatusCode::NOT_FOUND,
        Signature(_) => StatusCode::FORBIDDEN,
    };
    (status, Json(json!({ "error": err.to_string() })))
}
