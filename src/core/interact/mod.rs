pub mod compose;
pub mod drafts;

use std::sync::Arc;

use anyhow::Result;
use rusqlite::params;
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::core::error::{CoreResult, OrchestratorError};
use crate::core::graph::PlatformClient;
use crate::core::risk::{RiskLevel, classify};
use crate::core::store::{ConnectionStore, Db};
use compose::{DraftComposer, FanMemory, canned_reply};
use drafts::{DraftStatus, DraftStore, NewDraft, ReplyDraft};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoReplyMode {
    Draft,
    Auto,
}

impl AutoReplyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AutoReplyMode::Draft => "draft",
            AutoReplyMode::Auto => "auto",
        }
    }

    pub fn parse(s: &str) -> Option<AutoReplyMode> {
        match s {
            "draft" => Some(AutoReplyMode::Draft),
            "auto" => Some(AutoReplyMode::Auto),
            _ => None,
        }
    }
}

/// Webhook-driven comment handling: resolve the persona, draft a reply,
/// classify risk, and either auto-send or queue for human review.
pub struct InteractionEngine {
    db: Db,
    drafts: DraftStore,
    store: Arc<ConnectionStore>,
    client: Arc<dyn PlatformClient>,
    composer: Arc<dyn DraftComposer>,
    fan_memory: Arc<dyn FanMemory>,
    default_persona: String,
}

impl InteractionEngine {
    pub fn new(
        db: Db,
        store: Arc<ConnectionStore>,
        client: Arc<dyn PlatformClient>,
        composer: Arc<dyn DraftComposer>,
        fan_memory: Arc<dyn FanMemory>,
        default_persona: String,
    ) -> Self {
        Self {
            drafts: DraftStore::new(db.clone()),
            db,
            store,
            client,
            composer,
            fan_memory,
            default_persona,
        }
    }

    /// Walk a verified webhook delivery. Entries are handled in order; one
    /// malformed entry never aborts its siblings.
    pub async fn process_payload(&self, payload: &Value) {
        let entries = payload
            .get("entry")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        for entry in entries {
            let owner_account_id = entry.get("id").and_then(Value::as_str).unwrap_or("");
            let changes = entry
                .get("changes")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            for change in changes {
                if let Err(e) = self.process_change(owner_account_id, change).await {
                    error!("webhook change processing failed: {e}");
                }
            }
        }
    }

    async fn process_change(&self, owner_account_id: &str, change: &Value) -> Result<()> {
        if change.get("field").and_then(Value::as_str) != Some("comments") {
            return Ok(());
        }
        let value = change.get("value").cloned().unwrap_or(Value::Null);
        let comment_id = value.get("id").and_then(Value::as_str).unwrap_or("");
        let media_id = value
            .pointer("/media/id")
            .and_then(Value::as_str)
            .or_else(|| value.get("media_id").and_then(Value::as_str))
            .unwrap_or("");
        let commenter_name = value
            .pointer("/from/name")
            .and_then(Value::as_str)
            .unwrap_or("匿名用戶");
        let fan_id = value.pointer("/from/id").and_then(Value::as_str).unwrap_or("");
        let comment_text = value.get("text").and_then(Value::as_str).unwrap_or("");

        if comment_text.is_empty() {
            warn!("comment event with empty text; skipping");
            return Ok(());
        }

        let persona_id = self.resolve_persona(owner_account_id).await;
        let fan_context = if fan_id.is_empty() {
            None
        } else {
            self.fan_memory.context(&persona_id, fan_id).await
        };

        let draft_text = match self
            .composer
            .compose(&persona_id, commenter_name, comment_text, fan_context.as_deref())
            .await
        {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => canned_reply(commenter_name),
            Err(e) => {
                warn!("draft generation failed, using canned acknowledgement: {e}");
                canned_reply(commenter_name)
            }
        };

        let risk = classify(comment_text);
        let mode = self.auto_reply_mode(&persona_id).await;
        let draft = self
            .drafts
            .add(NewDraft {
                persona_id: persona_id.clone(),
                comment_id: comment_id.to_string(),
                media_id: media_id.to_string(),
                commenter_name: commenter_name.to_string(),
                comment_text: comment_text.to_string(),
                draft_text,
                risk_level: risk,
            })
            .await?;

        // Autonomous dispatch only when every gate is open: auto mode, low
        // risk, and a live connection. High risk always waits for a human.
        if mode == AutoReplyMode::Auto && risk == RiskLevel::Low {
            if self.store.get(&persona_id).await.is_some() {
                match self.send(&draft.reply_id, &persona_id).await {
                    Ok(_) => info!("auto-sent reply {} for '{}'", draft.reply_id, persona_id),
                    Err(e) => warn!(
                        "auto-send failed, draft {} left pending: {}",
                        draft.reply_id, e
                    ),
                }
            } else {
                warn!(
                    "auto mode for '{}' but no stored connection; queuing draft",
                    persona_id
                );
            }
        }
        Ok(())
    }

    /// Reverse lookup of the owning account; unknown accounts fall back to
    /// the designated default persona rather than dropping the event.
    async fn resolve_persona(&self, owner_account_id: &str) -> String {
        match self.store.find_by_account_id(owner_account_id).await {
            Some(conn) => conn.persona_id,
            None => {
                warn!(
                    "no persona matches account '{}'; attributing to '{}'",
                    owner_account_id, self.default_persona
                );
                self.default_persona.clone()
            }
        }
    }

    pub async fn pending(&self, persona_id: &str) -> Result<Vec<ReplyDraft>> {
        self.drafts.pending_for(persona_id).await
    }

    /// Post a pending draft against its external comment, then mark it
    /// sent. A dispatch failure leaves the draft pending and propagates.
    pub async fn send(&self, reply_id: &str, persona_id: &str) -> CoreResult<ReplyDraft> {
        let conn = self.store.get(persona_id).await.ok_or_else(|| {
            OrchestratorError::Credential(format!(
                "no access token stored for persona '{persona_id}'"
            ))
        })?;
        let mut draft = self
            .drafts
            .get(reply_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("reply {reply_id}")))?;
        if draft.status != DraftStatus::Pending {
            return Err(OrchestratorError::Validation(format!(
                "reply {reply_id} is {}, only pending drafts can be sent",
                draft.status.as_str()
            )));
        }

        self.client
            .send_comment_reply(
                &draft.comment_id,
                &draft.draft_text,
                &conn.access_token,
                conn.kind,
            )
            .await
            .map_err(|e| e.prefixed("reply dispatch failed"))?;

        if !self.drafts.mark_sent(reply_id).await? {
            return Err(OrchestratorError::Validation(format!(
                "reply {reply_id} was concurrently resolved"
            )));
        }
        draft.status = DraftStatus::Sent;
        info!("sent reply {} for persona '{}'", reply_id, persona_id);
        Ok(draft)
    }

    /// Mark a pending draft dismissed. Purely local.
    pub async fn dismiss(&self, reply_id: &str) -> CoreResult<ReplyDraft> {
        let mut draft = self
            .drafts
            .get(reply_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("reply {reply_id}")))?;
        if !self.drafts.mark_dismissed(reply_id).await? {
            return Err(OrchestratorError::Validation(format!(
                "reply {reply_id} is {}, only pending drafts can be dismissed",
                draft.status.as_str()
            )));
        }
        draft.status = DraftStatus::Dismissed;
        Ok(draft)
    }

    pub async fn auto_reply_mode(&self, persona_id: &str) -> AutoReplyMode {
        let db = self.db.lock().await;
        let mode: Option<String> = db
            .query_row(
                "SELECT mode FROM auto_reply_settings WHERE persona_id = ?1",
                params![persona_id],
                |row| row.get(0),
            )
            .ok();
        mode.as_deref()
            .and_then(AutoReplyMode::parse)
            .unwrap_or(AutoReplyMode::Draft)
    }

    pub async fn set_auto_reply_mode(
        &self,
        persona_id: &str,
        mode: &str,
    ) -> CoreResult<AutoReplyMode> {
        let parsed = AutoReplyMode::parse(mode).ok_or_else(|| {
            OrchestratorError::Validation(format!(
                "invalid mode '{mode}': must be 'draft' or 'auto'"
            ))
        })?;
        let db = self.db.lock().await;
        db.execute(
            "INSERT OR REPLACE INTO auto_reply_settings (persona_id, mode) VALUES (?1, ?2)",
            params![persona_id, parsed.as_str()],
        )
        .map_err(|e| OrchestratorError::Other(e.into()))?;
        info!("auto-reply mode for '{}' set to {}", persona_id, parsed.as_str());
        Ok(parsed)
    }
}
