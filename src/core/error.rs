use thiserror::Error;

/// Failure classes surfaced by the orchestration core. Each variant maps to
/// one operator-meaningful situation; the web layer translates them to HTTP
/// statuses without inspecting message text.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Required setup (app id, mirror keys, …) is missing. Fatal to the
    /// operation, never to the process.
    #[error("configuration error: {0}")]
    Config(String),

    /// The platform account could not be resolved to a usable identity.
    /// Message carries remediation guidance for the operator.
    #[error("account resolution failed: {0}")]
    AccountResolution(String),

    /// No stored (or no valid) connection for the persona.
    #[error("credential error: {0}")]
    Credential(String),

    /// The media format cannot be accepted by the platform and could not be
    /// reprojected. Message carries a remediation hint.
    #[error("unsupported media format: {0}")]
    UnsupportedFormat(String),

    /// Platform-side container processing reported failure.
    #[error("media container error: {0}")]
    Container(String),

    /// The container never became ready within the polling budget.
    #[error("media container not ready: {0}")]
    NotReady(String),

    /// The platform is rate-limiting us; retried with bounded backoff
    /// before this surfaces.
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),

    /// Webhook authenticity check failed; the payload was never trusted.
    #[error("signature verification failed: {0}")]
    Signature(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    /// Rebuild the error with extra context in front of the original
    /// message, keeping the variant (and therefore the HTTP mapping).
    pub fn prefixed(self, prefix: &str) -> Self {
        use OrchestratorError::*;
        match self {
            Config(m) => Config(format!("{prefix}: {m}")),
            AccountResolution(m) => AccountResolution(format!("{prefix}: {m}")),
            Credential(m) => Credential(format!("{prefix}: {m}")),
            UnsupportedFormat(m) => UnsupportedFormat(format!("{prefix}: {m}")),
            Container(m) => Container(format!("{prefix}: {m}")),
            NotReady(m) => NotReady(format!("{prefix}: {m}")),
            RateLimited(m) => RateLimited(format!("{prefix}: {m}")),
            NotFound(m) => NotFound(format!("{prefix}: {m}")),
            Validation(m) => Validation(format!("{prefix}: {m}")),
            Signature(m) => Signature(format!("{prefix}: {m}")),
            Other(e) => Other(e.context(prefix.to_string())),
        }
    }
}

pub type CoreResult<T> = Result<T, OrchestratorError>;
