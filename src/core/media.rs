use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sha1::{Digest, Sha1};
use tracing::info;

use crate::config::AppConfig;
use crate::core::error::{CoreResult, OrchestratorError};

/// Content types the destination platform accepts for image publishes.
const SUPPORTED_TYPES: &[&str] = &["image/jpeg", "image/jpg", "image/png"];

pub fn is_supported_content_type(content_type: &str) -> bool {
    SUPPORTED_TYPES.contains(&content_type)
}

/// Guess a content type from the URL path extension, for resources whose
/// server does not answer HEAD probes.
pub fn guess_content_type(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    mime_guess::from_path(path)
        .first()
        .map(|m| m.essence_str().to_string())
}

/// Reprojects an image at a public URL into a platform-supported format at
/// another public URL.
#[async_trait]
pub trait MediaMirror: Send + Sync {
    async fn reproject(&self, image_url: &str) -> CoreResult<String>;
}

/// Signed-upload mirror: hands the source URL to the hosting service, which
/// fetches, transcodes to JPEG, and serves the result from its own CDN.
pub struct SignedUploadMirror {
    http: reqwest::Client,
    cloud_name: String,
    api_key: String,
    api_secret: String,
}

impl SignedUploadMirror {
    /// Returns `None` when the mirror is not configured; the format gate
    /// then fails with a remediation hint instead of attempting repair.
    pub fn from_config(cfg: &AppConfig) -> anyhow::Result<Option<Self>> {
        if cfg.mirror_cloud_name.is_empty()
            || cfg.mirror_api_key.is_empty()
            || cfg.mirror_api_secret.is_empty()
        {
            return Ok(None);
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Some(Self {
            http,
            cloud_name: cfg.mirror_cloud_name.clone(),
            api_key: cfg.mirror_api_key.clone(),
            api_secret: cfg.mirror_api_secret.clone(),
        }))
    }

    /// SHA-1 over the sorted `key=value` pairs plus the secret, per the
    /// hosting service's signed-upload contract.
    fn sign(params: &[(&str, &str)], api_secret: &str) -> String {
        let mut sorted: Vec<&(&str, &str)> = params.iter().collect();
        sorted.sort_by_key(|(k, _)| *k);
        let joined = sorted
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        let mut hasher = Sha1::new();
        hasher.update(joined.as_bytes());
        hasher.update(api_secret.as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[async_trait]
impl MediaMirror for SignedUploadMirror {
    async fn reproject(&self, image_url: &str) -> CoreResult<String> {
        let timestamp = Utc::now().timestamp().to_string();
        let signed_params = [
            ("format", "jpg"),
            ("folder", "prism"),
            ("timestamp", timestamp.as_str()),
        ];
        let signature = Self::sign(&signed_params, &self.api_secret);

        let upload_url = format!(
            "https://api.cloudinary.com/v1_1/{}/image/upload",
            self.cloud_name
        );
        let resp = self
            .http
            .post(&upload_url)
            .form(&[
                ("api_key", self.api_key.as_str()),
                ("timestamp", timestamp.as_str()),
                ("signature", signature.as_str()),
                ("format", "jpg"),
                ("folder", "prism"),
                ("file", image_url),
            ])
            .send()
            .await
            .map_err(|e| OrchestratorError::UnsupportedFormat(format!("mirror upload failed: {e}")))?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(OrchestratorError::UnsupportedFormat(format!(
                "mirror upload failed: HTTP {status}: {body}"
            )));
        }
        let data: Value = serde_json::from_str(&body).map_err(|e| {
            OrchestratorError::UnsupportedFormat(format!("mirror returned unparseable body: {e}"))
        })?;
        let secure_url = data
            .get("secure_url")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                OrchestratorError::UnsupportedFormat(format!(
                    "mirror response missing secure_url: {data}"
                ))
            })?;
        info!("reprojected media to supported format at mirror");
        Ok(secure_url.to_string())
    }
}
