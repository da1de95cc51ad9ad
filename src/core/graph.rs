use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::config::AppConfig;
use crate::core::error::{CoreResult, OrchestratorError};
use crate::core::store::CredentialKind;

const BUSINESS_GRAPH: &str = "https://graph.facebook.com/v19.0";
const CREATOR_GRAPH: &str = "https://graph.instagram.com/v19.0";
const CREATOR_OAUTH_TOKEN_URL: &str = "https://api.instagram.com/oauth/access_token";
const CREATOR_LONG_LIVED_URL: &str = "https://graph.instagram.com/access_token";
const CREATOR_REFRESH_URL: &str = "https://graph.instagram.com/refresh_access_token";

impl CredentialKind {
    /// Which graph host a credential talks to. Pure function of the kind;
    /// callers never inspect the token.
    pub fn api_base(&self) -> &'static str {
        match self {
            CredentialKind::Business => BUSINESS_GRAPH,
            CredentialKind::Creator => CREATOR_GRAPH,
        }
    }
}

/// Resolved external account identity.
#[derive(Debug, Clone)]
pub struct AccountIdentity {
    pub account_id: String,
    pub handle: String,
}

/// Platform-side state of a pending media container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerState {
    Finished,
    InProgress,
    Failed(String),
}

/// The narrow surface the orchestrator needs from the external platform.
/// Production uses the reqwest-backed [`GraphClient`]; tests script a double
/// against the same contract.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Authorization code → short-lived token.
    async fn exchange_code(&self, code: &str) -> CoreResult<String>;

    /// Short-lived token → long-lived (~60 day) token.
    async fn upgrade_token(&self, short_token: &str) -> CoreResult<String>;

    /// Refresh-grant exchange of a long-lived token for a fresh one.
    async fn refresh_token(&self, token: &str, kind: CredentialKind) -> CoreResult<String>;

    /// Resolve the owning account id + handle for a token, trying the
    /// strategies the platform variant supports.
    async fn resolve_identity(
        &self,
        token: &str,
        kind: CredentialKind,
    ) -> CoreResult<AccountIdentity>;

    async fn create_container(
        &self,
        account_id: &str,
        image_url: &str,
        caption: &str,
        token: &str,
        kind: CredentialKind,
    ) -> CoreResult<String>;

    async fn container_status(
        &self,
        container_id: &str,
        token: &str,
        kind: CredentialKind,
    ) -> CoreResult<ContainerState>;

    async fn publish_container(
        &self,
        account_id: &str,
        container_id: &str,
        token: &str,
        kind: CredentialKind,
    ) -> CoreResult<String>;

    async fn send_comment_reply(
        &self,
        comment_id: &str,
        message: &str,
        token: &str,
        kind: CredentialKind,
    ) -> CoreResult<()>;

    /// Best-effort HEAD probe for the content type of a public resource.
    /// `None` means the probe failed; callers pass the URL through.
    async fn probe_content_type(&self, url: &str) -> Option<String>;
}

/// Bounded linear backoff around an operation that may hit the platform's
/// rate limiter: 2s, 4s, then give up and surface the error.
pub async fn retry_rate_limited<T, F, Fut>(op: &str, mut call: F) -> CoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CoreResult<T>>,
{
    const MAX_ATTEMPTS: u64 = 3;
    let mut attempt = 1;
    loop {
        match call().await {
            Err(OrchestratorError::RateLimited(msg)) if attempt < MAX_ATTEMPTS => {
                let wait = Duration::from_secs(2 * attempt);
                warn!("{op} rate limited (attempt {attempt}), backing off {wait:?}: {msg}");
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// reqwest-backed graph client. Every call carries an explicit timeout.
pub struct GraphClient {
    http: reqwest::Client,
    app_id: String,
    app_secret: String,
    redirect_uri: String,
}

impl GraphClient {
    pub fn new(cfg: &AppConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            app_id: cfg.app_id.clone(),
            app_secret: cfg.app_secret.clone(),
            redirect_uri: cfg.redirect_uri.clone(),
        })
    }

    /// Pull the platform's own error message out of a failure body so the
    /// caller sees what the platform said, not a generic HTTP status.
    fn platform_message(status: reqwest::StatusCode, body: &str) -> String {
        let parsed: Option<Value> = serde_json::from_str(body).ok();
        let message = parsed
            .as_ref()
            .and_then(|v| v.pointer("/error/message"))
            .and_then(Value::as_str)
            .map(str::to_string);
        match message {
            Some(m) => m,
            None if body.is_empty() => format!("HTTP {status}"),
            None => format!("HTTP {status}: {body}"),
        }
    }

    /// Read a response into JSON, mapping 429 to `RateLimited` and other
    /// failures through `to_err` with the platform's message.
    async fn read_json(
        resp: reqwest::Response,
        to_err: fn(String) -> OrchestratorError,
    ) -> CoreResult<Value> {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(OrchestratorError::RateLimited(Self::platform_message(
                status, &body,
            )));
        }
        if !status.is_success() {
            return Err(to_err(Self::platform_message(status, &body)));
        }
        serde_json::from_str(&body)
            .map_err(|e| to_err(format!("unparseable platform response: {e}")))
    }

    fn require_str(value: &Value, key: &str, to_err: fn(String) -> OrchestratorError) -> CoreResult<String> {
        value
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| to_err(format!("missing `{key}` in platform response: {value}")))
    }

    /// Linked-business-page traversal: the account is reachable through a
    /// page the user manages.
    async fn resolve_via_pages(&self, token: &str) -> CoreResult<AccountIdentity> {
        let resp = self
            .http
            .get(format!("{BUSINESS_GRAPH}/me/accounts"))
            .query(&[
                ("access_token", token),
                ("fields", "id,name,instagram_business_account{id,username}"),
            ])
            .send()
            .await
            .map_err(|e| OrchestratorError::AccountResolution(e.to_string()))?;
        let data = Self::read_json(resp, OrchestratorError::AccountResolution).await?;

        let pages = data
            .get("data")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if pages.is_empty() {
            return Err(OrchestratorError::AccountResolution(
                "no linked pages found for this account".into(),
            ));
        }
        for page in &pages {
            if let Some(linked) = page.get("instagram_business_account") {
                if let Some(id) = linked.get("id").and_then(Value::as_str) {
                    let handle = linked
                        .get("username")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    return Ok(AccountIdentity {
                        account_id: id.to_string(),
                        handle,
                    });
                }
            }
        }
        Err(OrchestratorError::AccountResolution(
            "no professional account linked to any managed page".into(),
        ))
    }

    /// Direct account metadata: `/me` on the variant's own graph.
    async fn resolve_via_me(&self, token: &str, kind: CredentialKind) -> CoreResult<AccountIdentity> {
        let resp = self
            .http
            .get(format!("{}/me", kind.api_base()))
            .query(&[("access_token", token), ("fields", "user_id,id,username")])
            .send()
            .await
            .map_err(|e| OrchestratorError::AccountResolution(e.to_string()))?;
        let data = Self::read_json(resp, OrchestratorError::AccountResolution).await?;

        let account_id = data
            .get("user_id")
            .and_then(Value::as_str)
            .or_else(|| data.get("id").and_then(Value::as_str))
            .map(str::to_string)
            .ok_or_else(|| {
                OrchestratorError::AccountResolution(format!(
                    "no account id in profile response: {data}"
                ))
            })?;
        let handle = data
            .get("username")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(AccountIdentity { account_id, handle })
    }
}

#[async_trait]
impl PlatformClient for GraphClient {
    async fn exchange_code(&self, code: &str) -> CoreResult<String> {
        let resp = self
            .http
            .post(CREATOR_OAUTH_TOKEN_URL)
            .form(&[
                ("client_id", self.app_id.as_str()),
                ("client_secret", self.app_secret.as_str()),
                ("grant_type", "authorization_code"),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("code", code),
            ])
            .send()
            .await
            .map_err(|e| OrchestratorError::Credential(e.to_string()))?;
        let data = Self::read_json(resp, OrchestratorError::Credential).await?;
        Self::require_str(&data, "access_token", OrchestratorError::Credential)
    }

    async fn upgrade_token(&self, short_token: &str) -> CoreResult<String> {
        let resp = self
            .http
            .get(CREATOR_LONG_LIVED_URL)
            .query(&[
                ("grant_type", "ig_exchange_token"),
                ("client_secret", self.app_secret.as_str()),
                ("access_token", short_token),
            ])
            .send()
            .await
            .map_err(|e| OrchestratorError::Credential(e.to_string()))?;
        let data = Self::read_json(resp, OrchestratorError::Credential).await?;
        Self::require_str(&data, "access_token", OrchestratorError::Credential)
    }

    async fn refresh_token(&self, token: &str, kind: CredentialKind) -> CoreResult<String> {
        let resp = match kind {
            CredentialKind::Creator => self
                .http
                .get(CREATOR_REFRESH_URL)
                .query(&[("grant_type", "ig_refresh_token"), ("access_token", token)])
                .send()
                .await,
            CredentialKind::Business => self
                .http
                .get(format!("{BUSINESS_GRAPH}/oauth/access_token"))
                .query(&[
                    ("grant_type", "fb_exchange_token"),
                    ("client_id", self.app_id.as_str()),
                    ("client_secret", self.app_secret.as_str()),
                    ("fb_exchange_token", token),
                ])
                .send()
                .await,
        }
        .map_err(|e| OrchestratorError::Credential(e.to_string()))?;
        let data = Self::read_json(resp, OrchestratorError::Credential).await?;
        Self::require_str(&data, "access_token", OrchestratorError::Credential)
    }

    async fn resolve_identity(
        &self,
        token: &str,
        kind: CredentialKind,
    ) -> CoreResult<AccountIdentity> {
        match kind {
            CredentialKind::Creator => self.resolve_via_me(token, kind).await,
            CredentialKind::Business => {
                // Linked page first, direct profile second.
                match self.resolve_via_pages(token).await {
                    Ok(identity) => Ok(identity),
                    Err(page_err) => self.resolve_via_me(token, kind).await.map_err(|me_err| {
                        OrchestratorError::AccountResolution(format!(
                            "{page_err}; direct profile lookup also failed: {me_err}"
                        ))
                    }),
                }
            }
        }
    }

    async fn create_container(
        &self,
        account_id: &str,
        image_url: &str,
        caption: &str,
        token: &str,
        kind: CredentialKind,
    ) -> CoreResult<String> {
        let resp = self
            .http
            .post(format!("{}/{}/media", kind.api_base(), account_id))
            .query(&[
                ("image_url", image_url),
                ("caption", caption),
                ("access_token", token),
            ])
            .send()
            .await
            .map_err(|e| OrchestratorError::Container(e.to_string()))?;
        let data = Self::read_json(resp, OrchestratorError::Container).await?;
        Self::require_str(&data, "id", OrchestratorError::Container)
    }

    async fn container_status(
        &self,
        container_id: &str,
        token: &str,
        kind: CredentialKind,
    ) -> CoreResult<ContainerState> {
        let resp = self
            .http
            .get(format!("{}/{}", kind.api_base(), container_id))
            .query(&[("fields", "status_code"), ("access_token", token)])
            .send()
            .await
            .map_err(|e| OrchestratorError::Container(e.to_string()))?;
        let data = Self::read_json(resp, OrchestratorError::Container).await?;
        let code = data
            .get("status_code")
            .and_then(Value::as_str)
            .unwrap_or("IN_PROGRESS");
        Ok(match code {
            "FINISHED" => ContainerState::Finished,
            "ERROR" | "EXPIRED" => ContainerState::Failed(format!("container status {code}")),
            _ => ContainerState::InProgress,
        })
    }

    async fn publish_container(
        &self,
        account_id: &str,
        container_id: &str,
        token: &str,
        kind: CredentialKind,
    ) -> CoreResult<String> {
        let resp = self
            .http
            .post(format!("{}/{}/media_publish", kind.api_base(), account_id))
            .query(&[("creation_id", container_id), ("access_token", token)])
            .send()
            .await
            .map_err(|e| OrchestratorError::Container(e.to_string()))?;
        let data = Self::read_json(resp, OrchestratorError::Container).await?;
        Self::require_str(&data, "id", OrchestratorError::Container)
    }

    async fn send_comment_reply(
        &self,
        comment_id: &str,
        message: &str,
        token: &str,
        kind: CredentialKind,
    ) -> CoreResult<()> {
        let resp = self
            .http
            .post(format!("{}/{}/replies", kind.api_base(), comment_id))
            .query(&[("message", message), ("access_token", token)])
            .send()
            .await
            .map_err(|e| OrchestratorError::Container(e.to_string()))?;
        Self::read_json(resp, OrchestratorError::Container).await?;
        Ok(())
    }

    async fn probe_content_type(&self, url: &str) -> Option<String> {
        let resp = self.http.head(url).send().await.ok()?;
        resp.headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_lowercase())
    }
}
