use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection as SqliteConnection, params};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::config::AppConfig;

/// Tokens issued through the creator-platform login carry this prefix;
/// everything else is treated as a business-graph token.
const CREATOR_TOKEN_PREFIX: &str = "IGAA";

/// Which platform variant a credential belongs to. Decided once when the
/// connection is stored, never re-derived from the token on the hot path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialKind {
    Business,
    Creator,
}

impl CredentialKind {
    pub fn from_token(token: &str) -> CredentialKind {
        if token.starts_with(CREATOR_TOKEN_PREFIX) {
            CredentialKind::Creator
        } else {
            CredentialKind::Business
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialKind::Business => "business",
            CredentialKind::Creator => "creator",
        }
    }

    pub fn from_str(s: &str) -> CredentialKind {
        match s {
            "creator" => CredentialKind::Creator,
            _ => CredentialKind::Business,
        }
    }
}

/// Stored platform connection for one persona. The token is a secret: it is
/// skipped by serde and must never appear in logs or HTTP responses.
#[derive(Debug, Clone, Serialize)]
pub struct PersonaConnection {
    pub persona_id: String,
    #[serde(skip_serializing)]
    pub access_token: String,
    pub account_id: String,
    pub account_handle: String,
    pub kind: CredentialKind,
    pub connected_at: DateTime<Utc>,
    pub refreshed_at: Option<DateTime<Utc>>,
}

/// Shared handle to the embedded database. All component stores go through
/// this one connection; tables are created idempotently on open.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<SqliteConnection>>,
}

impl Db {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = SqliteConnection::open(path)?;
        Self::create_tables(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = SqliteConnection::open_in_memory()?;
        Self::create_tables(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, SqliteConnection> {
        self.conn.lock().await
    }

    fn create_tables(conn: &SqliteConnection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS connections (
                persona_id TEXT PRIMARY KEY,
                access_token TEXT NOT NULL,
                account_id TEXT NOT NULL,
                account_handle TEXT NOT NULL,
                kind TEXT NOT NULL,
                connected_at TEXT NOT NULL,
                refreshed_at TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS publish_jobs (
                job_id TEXT PRIMARY KEY,
                persona_id TEXT NOT NULL,
                name TEXT NOT NULL,
                image_url TEXT NOT NULL,
                caption TEXT NOT NULL,
                run_at TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'scheduled',
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS reply_drafts (
                reply_id TEXT PRIMARY KEY,
                persona_id TEXT NOT NULL,
                comment_id TEXT NOT NULL,
                media_id TEXT NOT NULL,
                commenter_name TEXT NOT NULL,
                comment_text TEXT NOT NULL,
                draft_text TEXT NOT NULL,
                risk_level TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS auto_reply_settings (
                persona_id TEXT PRIMARY KEY,
                mode TEXT NOT NULL
            )",
            [],
        )?;

        Ok(())
    }
}

/// Per-persona credential store: an in-memory map mirrored write-through to
/// the `connections` table. Reads never touch the database; a failed flush
/// is logged and the in-memory state kept (durability is best-effort, not
/// transactional).
pub struct ConnectionStore {
    db: Db,
    cache: RwLock<HashMap<String, PersonaConnection>>,
}

impl ConnectionStore {
    /// Load the durable copy and repopulate the in-memory map.
    pub async fn open(db: Db) -> Result<Self> {
        let mut cache = HashMap::new();
        {
            let conn = db.lock().await;
            let mut stmt = conn.prepare(
                "SELECT persona_id, access_token, account_id, account_handle, kind,
                        connected_at, refreshed_at
                 FROM connections",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                ))
            })?;
            for row in rows {
                let (persona_id, access_token, account_id, account_handle, kind, connected, refreshed) =
                    row?;
                let connected_at = DateTime::parse_from_rfc3339(&connected)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now());
                let refreshed_at = refreshed
                    .as_deref()
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|t| t.with_timezone(&Utc));
                cache.insert(
                    persona_id.clone(),
                    PersonaConnection {
                        persona_id,
                        access_token,
                        account_id,
                        account_handle,
                        kind: CredentialKind::from_str(&kind),
                        connected_at,
                        refreshed_at,
                    },
                );
            }
        }
        if !cache.is_empty() {
            info!("loaded {} stored connection(s)", cache.len());
        }
        Ok(Self {
            db,
            cache: RwLock::new(cache),
        })
    }

    pub async fn upsert(&self, record: PersonaConnection) {
        let persona_id = record.persona_id.clone();
        self.cache
            .write()
            .await
            .insert(persona_id.clone(), record.clone());
        if let Err(e) = self.flush(&record).await {
            warn!("failed to persist connection for {}: {}", persona_id, e);
        }
    }

    pub async fn get(&self, persona_id: &str) -> Option<PersonaConnection> {
        self.cache.read().await.get(persona_id).cloned()
    }

    pub async fn remove(&self, persona_id: &str) -> bool {
        let removed = self.cache.write().await.remove(persona_id).is_some();
        if removed {
            let db = self.db.lock().await;
            if let Err(e) = db.execute(
                "DELETE FROM connections WHERE persona_id = ?1",
                params![persona_id],
            ) {
                warn!("failed to delete stored connection for {}: {}", persona_id, e);
            }
        }
        removed
    }

    /// Reverse lookup used to attribute webhook events to a persona.
    pub async fn find_by_account_id(&self, account_id: &str) -> Option<PersonaConnection> {
        if account_id.is_empty() {
            return None;
        }
        self.cache
            .read()
            .await
            .values()
            .find(|c| c.account_id == account_id)
            .cloned()
    }

    pub async fn personas(&self) -> Vec<String> {
        self.cache.read().await.keys().cloned().collect()
    }

    /// Seed the default persona from the operator-provisioned credential.
    /// Never overwrites an existing record, so a token refreshed at runtime
    /// survives a restart with a stale env value.
    pub async fn seed_from_config(&self, cfg: &AppConfig) {
        if cfg.fallback_access_token.is_empty() {
            return;
        }
        if self.get(&cfg.default_persona).await.is_some() {
            return;
        }
        let token = cfg.fallback_access_token.clone();
        let kind = CredentialKind::from_token(&token);
        info!(
            "seeding connection for persona '{}' from operator credential",
            cfg.default_persona
        );
        self.upsert(PersonaConnection {
            persona_id: cfg.default_persona.clone(),
            access_token: token,
            account_id: cfg.fallback_account_id.clone(),
            account_handle: cfg.fallback_account_handle.clone(),
            kind,
            connected_at: Utc::now(),
            refreshed_at: None,
        })
        .await;
    }

    async fn flush(&self, record: &PersonaConnection) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT OR REPLACE INTO connections
                (persona_id, access_token, account_id, account_handle, kind,
                 connected_at, refreshed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.persona_id,
                record.access_token,
                record.account_id,
                record.account_handle,
                record.kind.as_str(),
                record.connected_at.to_rfc3339(),
                record.refreshed_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(persona: &str, token: &str, account: &str) -> PersonaConnection {
        PersonaConnection {
            persona_id: persona.to_string(),
            access_token: token.to_string(),
            account_id: account.to_string(),
            account_handle: format!("{persona}_handle"),
            kind: CredentialKind::from_token(token),
            connected_at: Utc::now(),
            refreshed_at: None,
        }
    }

    async fn test_store() -> ConnectionStore {
        ConnectionStore::open(Db::open_in_memory().unwrap())
            .await
            .unwrap()
    }

    #[test]
    fn kind_from_token_prefix() {
        assert_eq!(
            CredentialKind::from_token("IGAAabc123"),
            CredentialKind::Creator
        );
        assert_eq!(
            CredentialKind::from_token("EAAabc123"),
            CredentialKind::Business
        );
        assert_eq!(
            CredentialKind::from_token("anything-else"),
            CredentialKind::Business
        );
    }

    #[tokio::test]
    async fn upsert_then_get_roundtrip() {
        let store = test_store().await;
        store.upsert(sample("p1", "IGAAtok", "acct1")).await;
        let got = store.get("p1").await.expect("stored record");
        assert_eq!(got.access_token, "IGAAtok");
        assert_eq!(got.account_id, "acct1");
        assert_eq!(got.kind, CredentialKind::Creator);
    }

    #[tokio::test]
    async fn remove_then_get_is_absent() {
        let store = test_store().await;
        store.upsert(sample("p1", "EAAtok", "acct1")).await;
        assert!(store.remove("p1").await);
        assert!(store.get("p1").await.is_none());
        assert!(!store.remove("p1").await, "second remove reports false");
    }

    #[tokio::test]
    async fn survives_reopen_from_same_db() {
        let db = Db::open_in_memory().unwrap();
        let store = ConnectionStore::open(db.clone()).await.unwrap();
        store.upsert(sample("p1", "EAAtok", "acct1")).await;
        drop(store);

        let reopened = ConnectionStore::open(db).await.unwrap();
        let got = reopened.get("p1").await.expect("durable record");
        assert_eq!(got.account_id, "acct1");
        assert_eq!(got.kind, CredentialKind::Business);
    }

    #[tokio::test]
    async fn survives_process_restart_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("prism.db");

        {
            let db = Db::open(&db_path).unwrap();
            let store = ConnectionStore::open(db).await.unwrap();
            store.upsert(sample("p1", "IGAAtok", "acct1")).await;
        }

        let db = Db::open(&db_path).unwrap();
        let store = ConnectionStore::open(db).await.unwrap();
        let got = store.get("p1").await.expect("record reloaded from disk");
        assert_eq!(got.access_token, "IGAAtok");
        assert_eq!(got.kind, CredentialKind::Creator);
    }

    #[tokio::test]
    async fn reverse_lookup_by_account_id() {
        let store = test_store().await;
        store.upsert(sample("p1", "EAAa", "acct1")).await;
        store.upsert(sample("p2", "EAAb", "acct2")).await;
        let found = store.find_by_account_id("acct2").await.unwrap();
        assert_eq!(found.persona_id, "p2");
        assert!(store.find_by_account_id("acct3").await.is_none());
        assert!(store.find_by_account_id("").await.is_none());
    }

    #[tokio::test]
    async fn seed_does_not_overwrite_existing() {
        let store = test_store().await;
        store.upsert(sample("default", "IGAAlive", "acct9")).await;

        let mut cfg = crate::config::AppConfig::from_env();
        cfg.default_persona = "default".to_string();
        cfg.fallback_access_token = "EAAstale".to_string();
        cfg.fallback_account_id = "acct0".to_string();
        store.seed_from_config(&cfg).await;

        let got = store.get("default").await.unwrap();
        assert_eq!(got.access_token, "IGAAlive");
    }

    #[tokio::test]
    async fn token_is_not_serialized() {
        let store = test_store().await;
        store.upsert(sample("p1", "EAAsecret", "acct1")).await;
        let json = serde_json::to_string(&store.get("p1").await.unwrap()).unwrap();
        assert!(!json.contains("EAAsecret"));
    }
}
