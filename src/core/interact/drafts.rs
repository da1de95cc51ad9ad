use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::core::risk::RiskLevel;
use crate::core::store::Db;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DraftStatus {
    Pending,
    Sent,
    Dismissed,
}

impl DraftStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DraftStatus::Pending => "pending",
            DraftStatus::Sent => "sent",
            DraftStatus::Dismissed => "dismissed",
        }
    }

    fn from_str(s: &str) -> DraftStatus {
        match s {
            "sent" => DraftStatus::Sent,
            "dismissed" => DraftStatus::Dismissed,
            _ => DraftStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplyDraft {
    pub reply_id: String,
    pub persona_id: String,
    pub comment_id: String,
    pub media_id: String,
    pub commenter_name: String,
    pub comment_text: String,
    pub draft_text: String,
    pub risk_level: RiskLevel,
    pub status: DraftStatus,
    pub created_at: DateTime<Utc>,
}

pub struct NewDraft {
    pub persona_id: String,
    pub comment_id: String,
    pub media_id: String,
    pub commenter_name: String,
    pub comment_text: String,
    pub draft_text: String,
    pub risk_level: RiskLevel,
}

/// Durable reply drafts. A draft is born `pending` and moves to exactly one
/// of `sent` or `dismissed`; both transitions are guarded UPDATEs so a
/// concurrent second transition loses cleanly.
pub struct DraftStore {
    db: Db,
}

impl DraftStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn add(&self, new: NewDraft) -> Result<ReplyDraft> {
        let draft = ReplyDraft {
            reply_id: Uuid::new_v4().to_string(),
            persona_id: new.persona_id,
            comment_id: new.comment_id,
            media_id: new.media_id,
            commenter_name: new.commenter_name,
            comment_text: new.comment_text,
            draft_text: new.draft_text,
            risk_level: new.risk_level,
            status: DraftStatus::Pending,
            created_at: Utc::now(),
        };
        {
            let db = self.db.lock().await;
            db.execute(
                "INSERT INTO reply_drafts
                    (reply_id, persona_id, comment_id, media_id, commenter_name,
                     comment_text, draft_text, risk_level, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'pending', ?9)",
                params![
                    draft.reply_id,
                    draft.persona_id,
                    draft.comment_id,
                    draft.media_id,
                    draft.commenter_name,
                    draft.comment_text,
                    draft.draft_text,
                    draft.risk_level.as_str(),
                    draft.created_at.to_rfc3339(),
                ],
            )?;
        }
        info!(
            "queued reply draft {} for persona '{}' (risk {})",
            draft.reply_id,
            draft.persona_id,
            draft.risk_level.as_str()
        );
        Ok(draft)
    }

    pub async fn get(&self, reply_id: &str) -> Result<Option<ReplyDraft>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT reply_id, persona_id, comment_id, media_id, commenter_name,
                    comment_text, draft_text, risk_level, status, created_at
             FROM reply_drafts WHERE reply_id = ?1",
        )?;
        let mut rows = stmt.query_map(params![reply_id], map_draft)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub async fn pending_for(&self, persona_id: &str) -> Result<Vec<ReplyDraft>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT reply_id, persona_id, comment_id, media_id, commenter_name,
                    comment_text, draft_text, risk_level, status, created_at
             FROM reply_drafts
             WHERE persona_id = ?1 AND status = 'pending'
             ORDER BY created_at",
        )?;
        let rows = stmt.query_map(params![persona_id], map_draft)?;
        let mut drafts = Vec::new();
        for row in rows {
            drafts.push(row?);
        }
        Ok(drafts)
    }

    /// pending → sent. Returns false when the draft was not pending.
    pub async fn mark_sent(&self, reply_id: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let updated = db.execute(
            "UPDATE reply_drafts SET status = 'sent'
             WHERE reply_id = ?1 AND status = 'pending'",
            params![reply_id],
        )?;
        Ok(updated > 0)
    }

    /// pending → dismissed. Returns false when the draft was not pending.
    pub async fn mark_dismissed(&self, reply_id: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let updated = db.execute(
            "UPDATE reply_drafts SET status = 'dismissed'
             WHERE reply_id = ?1 AND status = 'pending'",
            params![reply_id],
        )?;
        Ok(updated > 0)
    }
}

fn map_draft(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReplyDraft> {
    let risk: String = row.get(7)?;
    let status: String = row.get(8)?;
    let created: String = row.get(9)?;
    Ok(ReplyDraft {
        reply_id: row.get(0)?,
        persona_id: row.get(1)?,
        comment_id: row.get(2)?,
        media_id: row.get(3)?,
        commenter_name: row.get(4)?,
        comment_text: row.get(5)?,
        draft_text: row.get(6)?,
        risk_level: RiskLevel::from_str(&risk),
        status: DraftStatus::from_str(&status),
        created_at: DateTime::parse_from_rfc3339(&created)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_draft(persona: &str) -> NewDraft {
        NewDraft {
            persona_id: persona.to_string(),
            comment_id: "cmt-1".into(),
            media_id: "media-1".into(),
            commenter_name: "小美".into(),
            comment_text: "好漂亮".into(),
            draft_text: "謝謝你！".into(),
            risk_level: RiskLevel::Low,
        }
    }

    async fn test_store() -> DraftStore {
        DraftStore::new(Db::open_in_memory().unwrap())
    }

    #[tokio::test]
    async fn add_then_get_roundtrip() {
        let store = test_store().await;
        let draft = store.add(new_draft("p1")).await.unwrap();
        let got = store.get(&draft.reply_id).await.unwrap().unwrap();
        assert_eq!(got.status, DraftStatus::Pending);
        assert_eq!(got.comment_text, "好漂亮");
        assert_eq!(got.risk_level, RiskLevel::Low);
    }

    #[tokio::test]
    async fn pending_listing_is_persona_scoped() {
        let store = test_store().await;
        store.add(new_draft("p1")).await.unwrap();
        store.add(new_draft("p1")).await.unwrap();
        store.add(new_draft("p2")).await.unwrap();
        assert_eq!(store.pending_for("p1").await.unwrap().len(), 2);
        assert_eq!(store.pending_for("p2").await.unwrap().len(), 1);
        assert!(store.pending_for("p3").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sent_is_terminal() {
        let store = test_store().await;
        let draft = store.add(new_draft("p1")).await.unwrap();
        assert!(store.mark_sent(&draft.reply_id).await.unwrap());
        assert!(!store.mark_sent(&draft.reply_id).await.unwrap());
        assert!(!store.mark_dismissed(&draft.reply_id).await.unwrap());
        assert_eq!(
            store.get(&draft.reply_id).await.unwrap().unwrap().status,
            DraftStatus::Sent
        );
    }

    #[tokio::test]
    async fn dismissed_is_terminal() {
        let store = test_store().await;
        let draft = store.add(new_draft("p1")).await.unwrap();
        assert!(store.mark_dismissed(&draft.reply_id).await.unwrap());
        assert!(!store.mark_sent(&draft.reply_id).await.unwrap());
        let got = store.get(&draft.reply_id).await.unwrap().unwrap();
        assert_eq!(got.status, DraftStatus::Dismissed);
    }

    #[tokio::test]
    async fn resolved_drafts_leave_pending_listing() {
        let store = test_store().await;
        let a = store.add(new_draft("p1")).await.unwrap();
        let b = store.add(new_draft("p1")).await.unwrap();
        store.mark_sent(&a.reply_id).await.unwrap();
        let pending = store.pending_for("p1").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].reply_id, b.reply_id);
    }
}
