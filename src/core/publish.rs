use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::core::error::{CoreResult, OrchestratorError};
use crate::core::graph::{ContainerState, PlatformClient, retry_rate_limited};
use crate::core::media::{MediaMirror, guess_content_type, is_supported_content_type};
use crate::core::store::{ConnectionStore, CredentialKind, PersonaConnection};

const POLL_INTERVAL: Duration = Duration::from_secs(3);
const MAX_CONTAINER_WAIT: Duration = Duration::from_secs(30);

/// Operator-provisioned credential used when a persona's stored token
/// stops working mid-publish.
#[derive(Clone)]
pub struct FallbackCredential {
    pub access_token: String,
    pub account_id: String,
    pub account_handle: String,
}

impl FallbackCredential {
    pub fn from_config(cfg: &AppConfig) -> Option<Self> {
        if cfg.fallback_access_token.is_empty() {
            return None;
        }
        Some(Self {
            access_token: cfg.fallback_access_token.clone(),
            account_id: cfg.fallback_account_id.clone(),
            account_handle: cfg.fallback_account_handle.clone(),
        })
    }
}

/// The create → poll-ready → commit media publish protocol, with a format
/// gate in front and a credential fallback behind it.
pub struct PublishPipeline {
    client: Arc<dyn PlatformClient>,
    store: Arc<ConnectionStore>,
    mirror: Option<Arc<dyn MediaMirror>>,
    fallback: Option<FallbackCredential>,
    poll_interval: Duration,
    max_wait: Duration,
}

impl PublishPipeline {
    pub fn new(
        client: Arc<dyn PlatformClient>,
        store: Arc<ConnectionStore>,
        mirror: Option<Arc<dyn MediaMirror>>,
        fallback: Option<FallbackCredential>,
    ) -> Self {
        Self {
            client,
            store,
            mirror,
            fallback,
            poll_interval: POLL_INTERVAL,
            max_wait: MAX_CONTAINER_WAIT,
        }
    }

    #[cfg(test)]
    pub fn with_timing(mut self, poll_interval: Duration, max_wait: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.max_wait = max_wait;
        self
    }

    /// Publish an image for a persona and return the resulting media id.
    /// Fails with a `Credential` error when the persona has no connection.
    pub async fn publish(
        &self,
        persona_id: &str,
        image_url: &str,
        caption: &str,
    ) -> CoreResult<String> {
        let conn = self.store.get(persona_id).await.ok_or_else(|| {
            OrchestratorError::Credential(format!(
                "no connected account for persona '{persona_id}'; connect it before publishing"
            ))
        })?;

        let image_url = self.ensure_supported(image_url).await?;

        let primary_err = match self
            .run_protocol(&conn.account_id, &image_url, caption, &conn.access_token, conn.kind)
            .await
        {
            Ok(media_id) => {
                info!("published media {} for persona '{}'", media_id, persona_id);
                return Ok(media_id);
            }
            Err(e) => e,
        };

        let Some(fb) = self
            .fallback
            .as_ref()
            .filter(|f| f.access_token != conn.access_token)
        else {
            return Err(primary_err);
        };

        warn!(
            "publish failed under stored credential for '{}' ({}); retrying with operator fallback",
            persona_id, primary_err
        );
        let fb_kind = CredentialKind::from_token(&fb.access_token);
        let fb_account = if fb.account_id.is_empty() {
            conn.account_id.clone()
        } else {
            fb.account_id.clone()
        };

        match self
            .run_protocol(&fb_account, &image_url, caption, &fb.access_token, fb_kind)
            .await
        {
            Ok(media_id) => {
                // The fallback works and the stored token does not: promote
                // it so the next publish skips the failing credential.
                self.store
                    .upsert(PersonaConnection {
                        persona_id: conn.persona_id.clone(),
                        access_token: fb.access_token.clone(),
                        account_id: fb_account,
                        account_handle: if fb.account_handle.is_empty() {
                            conn.account_handle.clone()
                        } else {
                            fb.account_handle.clone()
                        },
                        kind: fb_kind,
                        connected_at: conn.connected_at,
                        refreshed_at: Some(Utc::now()),
                    })
                    .await;
                info!(
                    "fallback credential promoted to stored connection for '{}'",
                    persona_id
                );
                Ok(media_id)
            }
            Err(fb_err) => {
                Err(primary_err.prefixed(&format!("fallback credential also failed ({fb_err})")))
            }
        }
    }

    async fn run_protocol(
        &self,
        account_id: &str,
        image_url: &str,
        caption: &str,
        token: &str,
        kind: CredentialKind,
    ) -> CoreResult<String> {
        let container_id = retry_rate_limited("container create", || {
            self.client
                .create_container(account_id, image_url, caption, token, kind)
        })
        .await?;

        self.wait_until_ready(&container_id, token, kind).await?;

        retry_rate_limited("container publish", || {
            self.client
                .publish_container(account_id, &container_id, token, kind)
        })
        .await
    }

    async fn wait_until_ready(
        &self,
        container_id: &str,
        token: &str,
        kind: CredentialKind,
    ) -> CoreResult<()> {
        let started = tokio::time::Instant::now();
        loop {
            let state = retry_rate_limited("container status", || {
                self.client.container_status(container_id, token, kind)
            })
            .await?;
            match state {
                ContainerState::Finished => return Ok(()),
                ContainerState::Failed(msg) => return Err(OrchestratorError::Container(msg)),
                ContainerState::InProgress => {
                    if started.elapsed() >= self.max_wait {
                        return Err(OrchestratorError::NotReady(format!(
                            "container {container_id} not ready after {:?}",
                            self.max_wait
                        )));
                    }
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }

    /// Format gate: probe the resource's content type (falling back to the
    /// URL extension) and reproject unsupported formats through the mirror.
    /// Unknown types pass through untouched; the platform is the final judge.
    async fn ensure_supported(&self, image_url: &str) -> CoreResult<String> {
        let content_type = match self.client.probe_content_type(image_url).await {
            Some(ct) => ct,
            None => match guess_content_type(image_url) {
                Some(ct) => ct,
                None => return Ok(image_url.to_string()),
            },
        };
        if is_supported_content_type(&content_type) {
            return Ok(image_url.to_string());
        }
        match &self.mirror {
            Some(mirror) => {
                info!("reprojecting {content_type} media before publish");
                mirror.reproject(image_url).await
            }
            None => Err(OrchestratorError::UnsupportedFormat(format!(
                "media is {content_type}, which the platform rejects; re-export it as JPEG at a \
                 public URL or configure the media mirror (PRISM_MIRROR_* settings)"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::Db;
    use crate::core::testutil::MockPlatform;
    use async_trait::async_trait;

    struct StaticMirror(&'static str);

    #[async_trait]
    impl MediaMirror for StaticMirror {
        async fn reproject(&self, _image_url: &str) -> CoreResult<String> {
            Ok(self.0.to_string())
        }
    }

    async fn store_with(persona: &str, token: &str) -> Arc<ConnectionStore> {
        let store = Arc::new(
            ConnectionStore::open(Db::open_in_memory().unwrap())
                .await
                .unwrap(),
        );
        store
            .upsert(PersonaConnection {
                persona_id: persona.to_string(),
                access_token: token.to_string(),
                account_id: "acct-1".into(),
                account_handle: "handle".into(),
                kind: CredentialKind::from_token(token),
                connected_at: Utc::now(),
                refreshed_at: None,
            })
            .await;
        store
    }

    fn fast(p: PublishPipeline) -> PublishPipeline {
        p.with_timing(Duration::from_millis(1), Duration::from_millis(50))
    }

    #[tokio::test]
    async fn publish_without_connection_is_credential_error() {
        let mock = Arc::new(MockPlatform::default());
        let store = Arc::new(
            ConnectionStore::open(Db::open_in_memory().unwrap())
                .await
                .unwrap(),
        );
        let pipeline = fast(PublishPipeline::new(mock, store, None, None));
        let err = pipeline
            .publish("ghost", "https://cdn.example.com/a.jpg", "hi")
            .await
            .unwrap_err();
        match err {
            OrchestratorError::Credential(msg) => assert!(msg.contains("ghost")),
            other => panic!("expected Credential, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn happy_path_returns_media_id() {
        let mock = Arc::new(MockPlatform::default());
        let store = store_with("p1", "IGAAtok").await;
        let pipeline = fast(PublishPipeline::new(mock.clone(), store, None, None));
        let media_id = pipeline
            .publish("p1", "https://cdn.example.com/a.jpg", "caption")
            .await
            .unwrap();
        assert_eq!(media_id, "media-1");
        let containers = mock.containers.lock().await;
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].0, "acct-1");
        assert_eq!(containers[0].2, "caption");
    }

    #[tokio::test]
    async fn waits_through_in_progress_states() {
        let mock = Arc::new(MockPlatform::default());
        mock.script_statuses(vec![
            ContainerState::InProgress,
            ContainerState::InProgress,
            ContainerState::Finished,
        ])
        .await;
        let store = store_with("p1", "IGAAtok").await;
        let pipeline = fast(PublishPipeline::new(mock, store, None, None));
        assert!(
            pipeline
                .publish("p1", "https://cdn.example.com/a.jpg", "c")
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn container_error_state_fails_with_platform_message() {
        let mock = Arc::new(MockPlatform::default());
        mock.script_statuses(vec![ContainerState::Failed("container status ERROR".into())])
            .await;
        let store = store_with("p1", "IGAAtok").await;
        let pipeline = fast(PublishPipeline::new(mock, store, None, None));
        let err = pipeline
            .publish("p1", "https://cdn.example.com/a.jpg", "c")
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Container(_)));
    }

    #[tokio::test]
    async fn never_ready_container_times_out() {
        let mock = Arc::new(MockPlatform::default());
        mock.script_statuses(vec![ContainerState::InProgress; 200]).await;
        let store = store_with("p1", "IGAAtok").await;
        let pipeline = fast(PublishPipeline::new(mock, store, None, None));
        let err = pipeline
            .publish("p1", "https://cdn.example.com/a.jpg", "c")
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::NotReady(_)));
    }

    #[tokio::test]
    async fn unsupported_format_without_mirror_carries_hint() {
        let mock = Arc::new(MockPlatform::default());
        mock.set_content_type("https://cdn.example.com/a.webp", "image/webp")
            .await;
        let store = store_with("p1", "IGAAtok").await;
        let pipeline = fast(PublishPipeline::new(mock, store, None, None));
        let err = pipeline
            .publish("p1", "https://cdn.example.com/a.webp", "c")
            .await
            .unwrap_err();
        match err {
            OrchestratorError::UnsupportedFormat(msg) => {
                assert!(msg.contains("image/webp"));
                assert!(msg.contains("JPEG"));
            }
            other => panic!("expected UnsupportedFormat, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unsupported_format_is_reprojected_through_mirror() {
        let mock = Arc::new(MockPlatform::default());
        mock.set_content_type("https://cdn.example.com/a.webp", "image/webp")
            .await;
        let store = store_with("p1", "IGAAtok").await;
        let mirror: Arc<dyn MediaMirror> = Arc::new(StaticMirror("https://mirror.example.com/a.jpg"));
        let pipeline = fast(PublishPipeline::new(mock.clone(), store, Some(mirror), None));
        pipeline
            .publish("p1", "https://cdn.example.com/a.webp", "c")
            .await
            .unwrap();
        let containers = mock.containers.lock().await;
        assert_eq!(containers[0].1, "https://mirror.example.com/a.jpg");
    }

    #[tokio::test]
    async fn extension_guess_covers_missing_head_probe() {
        let mock = Arc::new(MockPlatform::default()); // no scripted content types
        let store = store_with("p1", "IGAAtok").await;
        let pipeline = fast(PublishPipeline::new(mock, store, None, None));
        let err = pipeline
            .publish("p1", "https://cdn.example.com/photo.heic", "c")
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::UnsupportedFormat(_)));
    }

    #[tokio::test]
    async fn fallback_publishes_and_promotes() {
        let mock = Arc::new(MockPlatform::default());
        mock.reject_token("IGAAdead").await;
        let store = store_with("p1", "IGAAdead").await;
        let fallback = FallbackCredential {
            access_token: "EAAfallback".into(),
            account_id: "acct-fb".into(),
            account_handle: "fb".into(),
        };
        let pipeline = fast(PublishPipeline::new(
            mock.clone(),
            store.clone(),
            None,
            Some(fallback),
        ));

        let media_id = pipeline
            .publish("p1", "https://cdn.example.com/a.jpg", "c")
            .await
            .unwrap();
        assert!(media_id.starts_with("media-"));

        let promoted = store.get("p1").await.unwrap();
        assert_eq!(promoted.access_token, "EAAfallback");
        assert_eq!(promoted.account_id, "acct-fb");
        assert_eq!(promoted.kind, CredentialKind::Business);
        assert!(promoted.refreshed_at.is_some());
    }

    #[tokio::test]
    async fn both_credentials_failing_preserves_original_error() {
        let mock = Arc::new(MockPlatform::default());
        mock.reject_token("IGAAdead").await;
        mock.reject_token("EAAdead").await;
        let store = store_with("p1", "IGAAdead").await;
        let fallback = FallbackCredential {
            access_token: "EAAdead".into(),
            account_id: "acct-fb".into(),
            account_handle: String::new(),
        };
        let pipeline = fast(PublishPipeline::new(mock, store, None, Some(fallback)));
        let err = pipeline
            .publish("p1", "https://cdn.example.com/a.jpg", "c")
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Error validating access token"));
        assert!(msg.contains("fallback"));
    }

    #[tokio::test]
    async fn identical_fallback_token_is_not_retried() {
        let mock = Arc::new(MockPlatform::default());
        mock.reject_token("IGAAdead").await;
        let store = store_with("p1", "IGAAdead").await;
        let fallback = FallbackCredential {
            access_token: "IGAAdead".into(),
            account_id: String::new(),
            account_handle: String::new(),
        };
        let pipeline = fast(PublishPipeline::new(mock, store, None, Some(fallback)));
        let err = pipeline
            .publish("p1", "https://cdn.example.com/a.jpg", "c")
            .await
            .unwrap_err();
        assert!(!err.to_string().contains("fallback"));
    }
}
