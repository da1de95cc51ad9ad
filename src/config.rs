use std::env;
use std::path::PathBuf;

fn var(key: &str) -> String {
    env::var(key).unwrap_or_default()
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Process configuration, read once at startup. Values that are only
/// required for specific operations (app id, mirror keys, notifier token)
/// may be empty; the owning component raises a `Config` error at call time
/// instead of refusing to boot.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind: String,
    pub data_dir: PathBuf,

    /// OAuth application identity on the external platform.
    pub app_id: String,
    pub app_secret: String,
    pub redirect_uri: String,

    /// Where browser flows land after the OAuth callback.
    pub frontend_url: String,

    /// Shared secret echoed during the webhook GET handshake.
    pub webhook_verify_token: String,

    /// When set, every non-public route requires this key in `X-Api-Key`.
    pub api_key: String,

    /// Persona that receives webhook events whose account id matches no
    /// stored connection.
    pub default_persona: String,

    /// Operator-provisioned fallback credential used to seed a connection
    /// at startup and to retry publishes when the stored token fails.
    pub fallback_access_token: String,
    pub fallback_account_id: String,
    pub fallback_account_handle: String,

    /// Telegram notification channel for renewal outcomes.
    pub telegram_bot_token: String,
    pub telegram_chat_id: String,

    /// Signed-upload mirror used to reproject unsupported image formats.
    pub mirror_cloud_name: String,
    pub mirror_api_key: String,
    pub mirror_api_secret: String,

    /// Chat-completion backend for reply drafting.
    pub llm_api_key: String,
    pub llm_model: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            bind: var_or("PRISM_BIND", "127.0.0.1:8000"),
            data_dir: PathBuf::from(var_or("PRISM_DATA_DIR", "data")),
            app_id: var("PRISM_APP_ID"),
            app_secret: var("PRISM_APP_SECRET"),
            redirect_uri: var_or(
                "PRISM_REDIRECT_URI",
                "http://localhost:8000/connect/callback",
            ),
            frontend_url: var_or("PRISM_FRONTEND_URL", "http://localhost:3000"),
            webhook_verify_token: var_or("PRISM_VERIFY_TOKEN", "prism_webhook_token"),
            api_key: var("PRISM_API_KEY"),
            default_persona: var_or("PRISM_DEFAULT_PERSONA", "default"),
            fallback_access_token: var("PRISM_FALLBACK_ACCESS_TOKEN"),
            fallback_account_id: var("PRISM_FALLBACK_ACCOUNT_ID"),
            fallback_account_handle: var("PRISM_FALLBACK_ACCOUNT_HANDLE"),
            telegram_bot_token: var("PRISM_TELEGRAM_BOT_TOKEN"),
            telegram_chat_id: var("PRISM_TELEGRAM_CHAT_ID"),
            mirror_cloud_name: var("PRISM_MIRROR_CLOUD_NAME"),
            mirror_api_key: var("PRISM_MIRROR_API_KEY"),
            mirror_api_secret: var("PRISM_MIRROR_API_SECRET"),
            llm_api_key: var("PRISM_LLM_API_KEY"),
            llm_model: var_or("PRISM_LLM_MODEL", "gpt-4o-mini"),
        }
    }
}
