//! Scripted [`PlatformClient`] double shared by the core and web tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::core::error::{CoreResult, OrchestratorError};
use crate::core::graph::{AccountIdentity, ContainerState, PlatformClient};
use crate::core::store::CredentialKind;

#[derive(Default)]
pub struct MockPlatform {
    identity: Mutex<Option<AccountIdentity>>,
    refresh_fails: AtomicBool,
    reply_fails: AtomicBool,
    /// Tokens the container protocol rejects (simulates a dead primary
    /// credential so the fallback path runs).
    rejected_tokens: Mutex<Vec<String>>,
    /// Scripted container status sequence; empty means instantly finished.
    statuses: Mutex<VecDeque<ContainerState>>,
    /// url → content type answered by the HEAD probe.
    content_types: Mutex<HashMap<String, String>>,

    /// (account_id, image_url, caption) for every container create.
    pub containers: Mutex<Vec<(String, String, String)>>,
    pub published: Mutex<Vec<(String, String, String)>>,
    pub replies: Mutex<Vec<(String, String)>>,
}

impl MockPlatform {
    pub async fn set_identity(&self, account_id: &str, handle: &str) {
        *self.identity.lock().await = Some(AccountIdentity {
            account_id: account_id.to_string(),
            handle: handle.to_string(),
        });
    }

    pub fn fail_refresh(&self) {
        self.refresh_fails.store(true, Ordering::SeqCst);
    }

    pub fn fail_replies(&self) {
        self.reply_fails.store(true, Ordering::SeqCst);
    }

    pub async fn reject_token(&self, token: &str) {
        self.rejected_tokens.lock().await.push(token.to_string());
    }

    pub async fn script_statuses(&self, states: Vec<ContainerState>) {
        *self.statuses.lock().await = states.into();
    }

    pub async fn set_content_type(&self, url: &str, content_type: &str) {
        self.content_types
            .lock()
            .await
            .insert(url.to_string(), content_type.to_string());
    }
}

#[async_trait]
impl PlatformClient for MockPlatform {
    async fn exchange_code(&self, code: &str) -> CoreResult<String> {
        Ok(format!("SHORT-{code}"))
    }

    async fn upgrade_token(&self, short_token: &str) -> CoreResult<String> {
        Ok(format!("IGAA-long-{short_token}"))
    }

    async fn refresh_token(&self, _token: &str, _kind: CredentialKind) -> CoreResult<String> {
        if self.refresh_fails.load(Ordering::SeqCst) {
            return Err(OrchestratorError::Credential(
                "token expired and cannot be refreshed".into(),
            ));
        }
        Ok("IGAA-refreshed".to_string())
    }

    async fn resolve_identity(
        &self,
        _token: &str,
        _kind: CredentialKind,
    ) -> CoreResult<AccountIdentity> {
        self.identity.lock().await.clone().ok_or_else(|| {
            OrchestratorError::AccountResolution("no professional account found".into())
        })
    }

    async fn create_container(
        &self,
        account_id: &str,
        image_url: &str,
        caption: &str,
        token: &str,
        _kind: CredentialKind,
    ) -> CoreResult<String> {
        if self.rejected_tokens.lock().await.iter().any(|t| t == token) {
            return Err(OrchestratorError::Container(
                "Error validating access token".into(),
            ));
        }
        self.containers.lock().await.push((
            account_id.to_string(),
            image_url.to_string(),
            caption.to_string(),
        ));
        Ok("container-1".to_string())
    }

    async fn container_status(
        &self,
        _container_id: &str,
        _token: &str,
        _kind: CredentialKind,
    ) -> CoreResult<ContainerState> {
        Ok(self
            .statuses
            .lock()
            .await
            .pop_front()
            .unwrap_or(ContainerState::Finished))
    }

    async fn publish_container(
        &self,
        account_id: &str,
        container_id: &str,
        _token: &str,
        _kind: CredentialKind,
    ) -> CoreResult<String> {
        let mut published = self.published.lock().await;
        published.push((
            account_id.to_string(),
            container_id.to_string(),
            String::new(),
        ));
        Ok(format!("media-{}", published.len()))
    }

    async fn send_comment_reply(
        &self,
        comment_id: &str,
        message: &str,
        _token: &str,
        _kind: CredentialKind,
    ) -> CoreResult<()> {
        if self.reply_fails.load(Ordering::SeqCst) {
            return Err(OrchestratorError::Container("reply rejected".into()));
        }
        self.replies
            .lock()
            .await
            .push((comment_id.to_string(), message.to_string()));
        Ok(())
    }

    async fn probe_content_type(&self, url: &str) -> Option<String> {
        self.content_types.lock().await.get(url).cloned()
    }
}
