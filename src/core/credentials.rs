use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::core::error::{CoreResult, OrchestratorError};
use crate::core::graph::{AccountIdentity, PlatformClient, retry_rate_limited};
use crate::core::notify::Notifier;
use crate::core::store::{ConnectionStore, CredentialKind, PersonaConnection};

const CREATOR_AUTHORIZE_URL: &str = "https://api.instagram.com/oauth/authorize";

/// Permission set requested during authorization: publish + comment
/// management on a professional account.
const OAUTH_SCOPES: &str =
    "instagram_business_basic,instagram_business_content_publish,instagram_business_manage_comments";

/// Long-lived tokens are valid for ~60 days; renewing every 50 keeps a
/// comfortable margin.
const RENEWAL_INTERVAL: Duration = Duration::from_secs(50 * 24 * 60 * 60);

/// Per-persona credential lifecycle: authorization, code exchange, direct
/// token connect, scheduled renewal, disconnect. One renewal timer per
/// persona; re-registration replaces instead of duplicating.
#[derive(Clone)]
pub struct CredentialLifecycle {
    cfg: Arc<AppConfig>,
    client: Arc<dyn PlatformClient>,
    store: Arc<ConnectionStore>,
    notifier: Arc<Notifier>,
    sched: Arc<Mutex<JobScheduler>>,
    renewal_jobs: Arc<Mutex<HashMap<String, Uuid>>>,
}

/// Direct-connect request: a pre-obtained token, optionally with the
/// identity already known.
#[derive(Debug, Default)]
pub struct DirectConnect {
    pub persona_id: Option<String>,
    pub access_token: String,
    pub account_id: Option<String>,
    pub account_handle: Option<String>,
}

impl CredentialLifecycle {
    pub fn new(
        cfg: Arc<AppConfig>,
        client: Arc<dyn PlatformClient>,
        store: Arc<ConnectionStore>,
        notifier: Arc<Notifier>,
        sched: Arc<Mutex<JobScheduler>>,
    ) -> Self {
        Self {
            cfg,
            client,
            store,
            notifier,
            sched,
            renewal_jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Authorization-request URL for the persona. The persona id rides in
    /// `state` as the anti-forgery token and comes back on the callback.
    pub fn authorize_url(&self, persona_id: &str) -> CoreResult<String> {
        if self.cfg.app_id.is_empty() {
            return Err(OrchestratorError::Config(
                "PRISM_APP_ID is not configured".into(),
            ));
        }
        Ok(format!(
            "{CREATOR_AUTHORIZE_URL}?client_id={}&redirect_uri={}&scope={}&response_type=code&state={}",
            urlencoding::encode(&self.cfg.app_id),
            urlencoding::encode(&self.cfg.redirect_uri),
            urlencoding::encode(OAUTH_SCOPES),
            urlencoding::encode(persona_id),
        ))
    }

    /// Exchange the callback code: short-lived token, long-lived upgrade,
    /// identity resolution, store, renewal registration.
    pub async fn exchange(&self, code: &str, state: &str) -> CoreResult<PersonaConnection> {
        if self.cfg.app_id.is_empty() || self.cfg.app_secret.is_empty() {
            return Err(OrchestratorError::Config(
                "PRISM_APP_ID / PRISM_APP_SECRET are not configured".into(),
            ));
        }
        let persona_id = state.trim();
        if persona_id.is_empty() {
            return Err(OrchestratorError::Validation(
                "callback state (persona id) is empty".into(),
            ));
        }

        let short = self.client.exchange_code(code).await?;
        let long = self.client.upgrade_token(&short).await?;
        let kind = CredentialKind::from_token(&long);
        let identity = self.resolve_or_fallback(&long, kind).await?;

        let conn = PersonaConnection {
            persona_id: persona_id.to_string(),
            access_token: long,
            account_id: identity.account_id,
            account_handle: identity.handle,
            kind,
            connected_at: Utc::now(),
            refreshed_at: None,
        };
        self.store.upsert(conn.clone()).await;
        self.register_renewal(persona_id).await;
        info!(
            "connected persona '{}' to account {} (@{})",
            persona_id, conn.account_id, conn.account_handle
        );
        Ok(conn)
    }

    /// Connect with a pre-obtained token, bypassing the OAuth dialog.
    /// When no persona id is given, the resolved account id becomes the
    /// persona (one external account, one persona).
    pub async fn direct_connect(&self, req: DirectConnect) -> CoreResult<PersonaConnection> {
        if req.access_token.is_empty() {
            return Err(OrchestratorError::Validation("access_token is required".into()));
        }
        let kind = CredentialKind::from_token(&req.access_token);
        let identity = match req.account_id {
            Some(account_id) if !account_id.is_empty() => AccountIdentity {
                account_id,
                handle: req.account_handle.unwrap_or_default(),
            },
            _ => self.resolve_or_fallback(&req.access_token, kind).await?,
        };
        let persona_id = req
            .persona_id
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| identity.account_id.clone());

        let conn = PersonaConnection {
            persona_id: persona_id.clone(),
            access_token: req.access_token,
            account_id: identity.account_id,
            account_handle: identity.handle,
            kind,
            connected_at: Utc::now(),
            refreshed_at: None,
        };
        self.store.upsert(conn.clone()).await;
        self.register_renewal(&persona_id).await;
        info!(
            "connected persona '{}' to account {} via direct token",
            persona_id, conn.account_id
        );
        Ok(conn)
    }

    /// Refresh-grant renewal. Success updates the stored connection and
    /// notifies; failure keeps the existing token and notifies demanding
    /// re-authorization. A persona without a connection is a silent no-op
    /// (it may simply have disconnected since the timer was registered).
    pub async fn renew(&self, persona_id: &str) {
        let Some(conn) = self.store.get(persona_id).await else {
            debug!("renewal skipped for '{}': no stored connection", persona_id);
            return;
        };

        let refreshed = retry_rate_limited("credential refresh", || {
            self.client.refresh_token(&conn.access_token, conn.kind)
        })
        .await;

        match refreshed {
            Ok(new_token) => {
                let kind = CredentialKind::from_token(&new_token);
                let updated = PersonaConnection {
                    access_token: new_token,
                    kind,
                    refreshed_at: Some(Utc::now()),
                    ..conn
                };
                self.store.upsert(updated).await;
                info!("renewed credential for persona '{}'", persona_id);
                self.notifier
                    .send(format!("✅ {persona_id} 平台憑證更新成功，效期已延長 60 天"));
            }
            Err(e) => {
                warn!("credential renewal failed for '{}': {}", persona_id, e);
                self.notifier.send(format!(
                    "❌ {persona_id} 平台憑證更新失敗：{e}。舊憑證即將到期，請重新授權連結帳號"
                ));
            }
        }
    }

    /// Arm (or re-arm) the repeated renewal timer for a persona. Re-adding
    /// replaces the previous timer instead of stacking a duplicate.
    pub async fn register_renewal(&self, persona_id: &str) {
        if let Err(e) = self.try_register_renewal(persona_id).await {
            warn!("could not register renewal for '{}': {}", persona_id, e);
        }
    }

    async fn try_register_renewal(&self, persona_id: &str) -> anyhow::Result<()> {
        let this = self.clone();
        let persona = persona_id.to_string();
        let job = Job::new_repeated_async(RENEWAL_INTERVAL, move |_uuid, _lock| {
            let this = this.clone();
            let persona = persona.clone();
            Box::pin(async move {
                this.renew(&persona).await;
            })
        })
        .map_err(|e| anyhow!("{e}"))?;

        let new_id = self
            .sched
            .lock()
            .await
            .add(job)
            .await
            .map_err(|e| anyhow!("{e}"))?;

        let previous = self
            .renewal_jobs
            .lock()
            .await
            .insert(persona_id.to_string(), new_id);
        if let Some(old_id) = previous
            && old_id != new_id
            && let Err(e) = self.sched.lock().await.remove(&old_id).await
        {
            warn!(
                "replaced renewal timer for '{}' but failed to drop the old one: {}",
                persona_id, e
            );
        }
        Ok(())
    }

    /// Re-arm renewal for every stored persona (called once at startup so
    /// connections made before a restart keep renewing).
    pub async fn register_stored_renewals(&self) {
        for persona_id in self.store.personas().await {
            self.register_renewal(&persona_id).await;
        }
    }

    /// Remove the connection and its renewal timer. Idempotent.
    pub async fn disconnect(&self, persona_id: &str) -> bool {
        let removed = self.store.remove(persona_id).await;
        if let Some(job_id) = self.renewal_jobs.lock().await.remove(persona_id)
            && let Err(e) = self.sched.lock().await.remove(&job_id).await
        {
            warn!(
                "disconnected '{}' but failed to drop its renewal timer: {}",
                persona_id, e
            );
        }
        if removed {
            info!("disconnected persona '{}'", persona_id);
        }
        removed
    }

    async fn resolve_or_fallback(
        &self,
        token: &str,
        kind: CredentialKind,
    ) -> CoreResult<AccountIdentity> {
        match self.client.resolve_identity(token, kind).await {
            Ok(identity) => Ok(identity),
            Err(e) if !self.cfg.fallback_account_id.is_empty() => {
                warn!(
                    "identity resolution failed ({}); using pre-provisioned account {}",
                    e, self.cfg.fallback_account_id
                );
                Ok(AccountIdentity {
                    account_id: self.cfg.fallback_account_id.clone(),
                    handle: self.cfg.fallback_account_handle.clone(),
                })
            }
            Err(e) => Err(e.prefixed(
                "the account must be a professional/creator account linked to a managed page",
            )),
        }
    }

    #[cfg(test)]
    pub async fn renewal_job_count(&self, persona_id: &str) -> usize {
        self.renewal_jobs
            .lock()
            .await
            .contains_key(persona_id)
            .then_some(1)
            .unwrap_or(0)
    }
}
