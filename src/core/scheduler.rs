use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::core::error::{CoreResult, OrchestratorError};
use crate::core::publish::PublishPipeline;
use crate::core::store::Db;

/// A schedule request must point at least this far into the future;
/// anything closer is treated as clock skew and rejected.
const MIN_LEAD_SECS: i64 = 60;

/// A job whose fire time passed while the process was down still fires on
/// recovery if it is at most this late.
const MISFIRE_GRACE_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Scheduled,
    Fired,
    Cancelled,
}

impl JobStatus {
    fn from_str(s: &str) -> JobStatus {
        match s {
            "fired" => JobStatus::Fired,
            "cancelled" => JobStatus::Cancelled,
            _ => JobStatus::Scheduled,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduledPost {
    pub job_id: String,
    pub persona_id: String,
    pub name: String,
    pub image_url: String,
    pub caption: String,
    pub run_at: DateTime<Utc>,
    pub status: JobStatus,
}

/// Durable one-shot publish jobs. Rows in `publish_jobs` survive restarts;
/// the runtime timer is re-armed (or the job fired, inside the misfire
/// grace window) on recovery. Firing marks the row `fired` regardless of
/// the publish outcome: the status tracks timer execution, and a pipeline
/// failure is logged rather than re-queued.
#[derive(Clone)]
pub struct PostScheduler {
    db: Db,
    sched: Arc<Mutex<JobScheduler>>,
    pipeline: Arc<PublishPipeline>,
    runtime_jobs: Arc<Mutex<HashMap<String, Uuid>>>,
}

impl PostScheduler {
    pub fn new(db: Db, sched: Arc<Mutex<JobScheduler>>, pipeline: Arc<PublishPipeline>) -> Self {
        Self {
            db,
            sched,
            pipeline,
            runtime_jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// A request must target an instant strictly in the future, beyond the
    /// clock-skew grace.
    pub fn validate_run_at(run_at: DateTime<Utc>) -> CoreResult<()> {
        if run_at <= Utc::now() + chrono::Duration::seconds(MIN_LEAD_SECS) {
            return Err(OrchestratorError::Validation(format!(
                "publish_at must be at least {MIN_LEAD_SECS}s in the future (got {})",
                run_at.to_rfc3339()
            )));
        }
        Ok(())
    }

    pub async fn schedule(
        &self,
        persona_id: &str,
        image_url: &str,
        caption: &str,
        run_at: DateTime<Utc>,
    ) -> CoreResult<String> {
        Self::validate_run_at(run_at)?;
        let now = Utc::now();

        let job_id = Uuid::new_v4().to_string();
        let name = display_name(persona_id, caption);
        let delay = (run_at - now).to_std().unwrap_or(Duration::ZERO);

        // Runtime timer first, row second; a row without a timer would sit
        // inert until the next restart, the other way round only leaks a
        // timer we can remove.
        let runtime_id = self
            .arm(&job_id, delay)
            .await
            .map_err(OrchestratorError::Other)?;

        let inserted = {
            let db = self.db.lock().await;
            db.execute(
                "INSERT INTO publish_jobs
                    (job_id, persona_id, name, image_url, caption, run_at, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'scheduled', ?7)",
                params![
                    job_id,
                    persona_id,
                    name,
                    image_url,
                    caption,
                    run_at.to_rfc3339(),
                    now.to_rfc3339(),
                ],
            )
        };
        if let Err(e) = inserted {
            if let Err(re) = self.sched.lock().await.remove(&runtime_id).await {
                warn!("failed to roll back runtime timer for {}: {}", job_id, re);
            }
            return Err(OrchestratorError::Other(anyhow!(
                "failed to persist job: {e}"
            )));
        }
        self.runtime_jobs
            .lock()
            .await
            .insert(job_id.clone(), runtime_id);
        info!(
            "scheduled job {} for persona '{}' at {}",
            job_id,
            persona_id,
            run_at.to_rfc3339()
        );
        Ok(job_id)
    }

    /// Execute a due job. The guarded UPDATE is the claim: a job that was
    /// cancelled (or already fired) loses here atomically and nothing runs.
    pub async fn fire(&self, job_id: &str) {
        let claimed = {
            let db = self.db.lock().await;
            db.execute(
                "UPDATE publish_jobs SET status = 'fired'
                 WHERE job_id = ?1 AND status = 'scheduled'",
                params![job_id],
            )
        };
        match claimed {
            Ok(0) => {
                debug!("job {} no longer scheduled at fire time; skipping", job_id);
                return;
            }
            Ok(_) => {}
            Err(e) => {
                error!("could not claim job {} for firing: {}", job_id, e);
                return;
            }
        }
        self.runtime_jobs.lock().await.remove(job_id);

        let Some(job) = self.get(job_id).await else {
            error!("fired job {} has no stored row", job_id);
            return;
        };
        match self
            .pipeline
            .publish(&job.persona_id, &job.image_url, &job.caption)
            .await
        {
            Ok(media_id) => info!(
                "scheduled publish {} completed for '{}': media {}",
                job_id, job.persona_id, media_id
            ),
            // Deliberately not re-queued; see the scheduler notes in DESIGN.md.
            Err(e) => error!(
                "scheduled publish {} failed for '{}' (not retried): {}",
                job_id, job.persona_id, e
            ),
        }
    }

    pub async fn list(&self, persona_id: &str) -> anyhow::Result<Vec<ScheduledPost>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT job_id, persona_id, name, image_url, caption, run_at, status
             FROM publish_jobs
             WHERE persona_id = ?1 AND status = 'scheduled'
             ORDER BY run_at",
        )?;
        let rows = stmt.query_map(params![persona_id], map_job)?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row?);
        }
        Ok(jobs)
    }

    pub async fn get(&self, job_id: &str) -> Option<ScheduledPost> {
        let db = self.db.lock().await;
        let mut stmt = db
            .prepare(
                "SELECT job_id, persona_id, name, image_url, caption, run_at, status
                 FROM publish_jobs WHERE job_id = ?1",
            )
            .ok()?;
        stmt.query_row(params![job_id], map_job).ok()
    }

    /// Cancel a still-scheduled job. Returns false for fired, cancelled, or
    /// unknown ids; a cancel racing the timer is settled by the same
    /// guarded UPDATE the claim uses.
    pub async fn cancel(&self, job_id: &str) -> bool {
        let updated = {
            let db = self.db.lock().await;
            db.execute(
                "UPDATE publish_jobs SET status = 'cancelled'
                 WHERE job_id = ?1 AND status = 'scheduled'",
                params![job_id],
            )
        };
        let cancelled = match updated {
            Ok(n) => n > 0,
            Err(e) => {
                warn!("cancel of job {} failed: {}", job_id, e);
                false
            }
        };
        if cancelled {
            if let Some(runtime_id) = self.runtime_jobs.lock().await.remove(job_id)
                && let Err(e) = self.sched.lock().await.remove(&runtime_id).await
            {
                warn!("cancelled job {} but timer removal failed: {}", job_id, e);
            }
            info!("cancelled job {}", job_id);
        }
        cancelled
    }

    /// Re-arm timers for rows that survived a restart. Jobs that came due
    /// while the process was down fire immediately when at most
    /// `MISFIRE_GRACE_SECS` late; older misfires are cancelled loudly.
    pub async fn recover(&self) -> anyhow::Result<()> {
        let pending = {
            let db = self.db.lock().await;
            let mut stmt = db.prepare(
                "SELECT job_id, persona_id, name, image_url, caption, run_at, status
                 FROM publish_jobs WHERE status = 'scheduled'",
            )?;
            let rows = stmt.query_map([], map_job)?;
            let mut jobs = Vec::new();
            for row in rows {
                jobs.push(row?);
            }
            jobs
        };

        let now = Utc::now();
        for job in pending {
            if job.run_at > now {
                let delay = (job.run_at - now).to_std().unwrap_or(Duration::ZERO);
                match self.arm(&job.job_id, delay).await {
                    Ok(runtime_id) => {
                        self.runtime_jobs
                            .lock()
                            .await
                            .insert(job.job_id.clone(), runtime_id);
                    }
                    Err(e) => warn!("could not re-arm job {}: {}", job.job_id, e),
                }
            } else if now - job.run_at <= chrono::Duration::seconds(MISFIRE_GRACE_SECS) {
                info!(
                    "job {} misfired within grace window (due {}); firing now",
                    job.job_id,
                    job.run_at.to_rfc3339()
                );
                let this = self.clone();
                let job_id = job.job_id.clone();
                tokio::spawn(async move {
                    this.fire(&job_id).await;
                });
            } else {
                warn!(
                    "job {} missed its fire time by more than {}s (due {}); cancelling",
                    job.job_id,
                    MISFIRE_GRACE_SECS,
                    job.run_at.to_rfc3339()
                );
                let db = self.db.lock().await;
                if let Err(e) = db.execute(
                    "UPDATE publish_jobs SET status = 'cancelled'
                     WHERE job_id = ?1 AND status = 'scheduled'",
                    params![job.job_id],
                ) {
                    warn!("could not mark job {} cancelled: {}", job.job_id, e);
                }
            }
        }
        Ok(())
    }

    async fn arm(&self, job_id: &str, delay: Duration) -> anyhow::Result<Uuid> {
        let this = self.clone();
        let key = job_id.to_string();
        let job = Job::new_one_shot_async(delay, move |_uuid, _lock| {
            let this = this.clone();
            let key = key.clone();
            Box::pin(async move {
                this.fire(&key).await;
            })
        })
        .map_err(|e| anyhow!("{e}"))?;
        self.sched
            .lock()
            .await
            .add(job)
            .await
            .map_err(|e| anyhow!("{e}"))
    }
}

/// Display name embedding the persona and a caption prefix, so listing can
/// stay persona-scoped without a secondary index.
fn display_name(persona_id: &str, caption: &str) -> String {
    let prefix: String = caption.chars().take(30).collect();
    format!("{persona_id}:{prefix}")
}

fn map_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduledPost> {
    let run_at: String = row.get(5)?;
    let status: String = row.get(6)?;
    Ok(ScheduledPost {
        job_id: row.get(0)?,
        persona_id: row.get(1)?,
        name: row.get(2)?,
        image_url: row.get(3)?,
        caption: row.get(4)?,
        run_at: DateTime::parse_from_rfc3339(&run_at)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        status: JobStatus::from_str(&status),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::{ConnectionStore, CredentialKind, PersonaConnection};
    use crate::core::testutil::MockPlatform;

    async fn setup() -> (PostScheduler, Arc<MockPlatform>, Db) {
        let db = Db::open_in_memory().unwrap();
        let store = Arc::new(ConnectionStore::open(db.clone()).await.unwrap());
        store
            .upsert(PersonaConnection {
                persona_id: "p1".into(),
                access_token: "IGAAtok".into(),
                account_id: "acct-1".into(),
                account_handle: "h".into(),
                kind: CredentialKind::Creator,
                connected_at: Utc::now(),
                refreshed_at: None,
            })
            .await;
        let mock = Arc::new(MockPlatform::default());
        let pipeline = Arc::new(PublishPipeline::new(mock.clone(), store, None, None));
        let sched = Arc::new(Mutex::new(JobScheduler::new().await.unwrap()));
        (PostScheduler::new(db.clone(), sched, pipeline), mock, db)
    }

    fn future() -> DateTime<Utc> {
        Utc::now() + chrono::Duration::minutes(10)
    }

    #[tokio::test]
    async fn schedule_in_the_past_is_rejected() {
        let (scheduler, _, _) = setup().await;
        let err = scheduler
            .schedule("p1", "https://x/a.jpg", "c", Utc::now() - chrono::Duration::minutes(1))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
    }

    #[tokio::test]
    async fn schedule_inside_skew_grace_is_rejected() {
        let (scheduler, _, _) = setup().await;
        let err = scheduler
            .schedule("p1", "https://x/a.jpg", "c", Utc::now() + chrono::Duration::seconds(30))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
    }

    #[tokio::test]
    async fn scheduled_job_appears_in_persona_listing() {
        let (scheduler, _, _) = setup().await;
        let run_at = future();
        let job_id = scheduler
            .schedule("p1", "https://x/a.jpg", "a long caption for the listing", run_at)
            .await
            .unwrap();

        let jobs = scheduler.list("p1").await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_id, job_id);
        assert!(jobs[0].name.starts_with("p1:"));
        assert_eq!(jobs[0].run_at.timestamp(), run_at.timestamp());

        assert!(scheduler.list("p2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancel_succeeds_exactly_once() {
        let (scheduler, _, _) = setup().await;
        let job_id = scheduler
            .schedule("p1", "https://x/a.jpg", "c", future())
            .await
            .unwrap();
        assert!(scheduler.cancel(&job_id).await);
        assert!(!scheduler.cancel(&job_id).await);
        assert!(!scheduler.cancel("no-such-job").await);
    }

    #[tokio::test]
    async fn fire_publishes_and_marks_fired() {
        let (scheduler, mock, _) = setup().await;
        let job_id = scheduler
            .schedule("p1", "https://x/a.jpg", "c", future())
            .await
            .unwrap();

        scheduler.fire(&job_id).await;
        assert_eq!(mock.published.lock().await.len(), 1);
        assert_eq!(scheduler.get(&job_id).await.unwrap().status, JobStatus::Fired);
        assert!(scheduler.list("p1").await.unwrap().is_empty());

        // A second fire of the same job is a no-op.
        scheduler.fire(&job_id).await;
        assert_eq!(mock.published.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn cancelled_job_does_not_publish_when_fired() {
        let (scheduler, mock, _) = setup().await;
        let job_id = scheduler
            .schedule("p1", "https://x/a.jpg", "c", future())
            .await
            .unwrap();
        assert!(scheduler.cancel(&job_id).await);
        scheduler.fire(&job_id).await;
        assert!(mock.published.lock().await.is_empty());
    }

    #[tokio::test]
    async fn fire_marks_fired_even_when_pipeline_fails() {
        let (scheduler, mock, _) = setup().await;
        mock.reject_token("IGAAtok").await;
        let job_id = scheduler
            .schedule("p1", "https://x/a.jpg", "c", future())
            .await
            .unwrap();
        scheduler.fire(&job_id).await;
        assert_eq!(scheduler.get(&job_id).await.unwrap().status, JobStatus::Fired);
        assert!(mock.published.lock().await.is_empty());
    }

    async fn insert_row(db: &Db, job_id: &str, run_at: DateTime<Utc>) {
        let conn = db.lock().await;
        conn.execute(
            "INSERT INTO publish_jobs
                (job_id, persona_id, name, image_url, caption, run_at, status, created_at)
             VALUES (?1, 'p1', 'p1:c', 'https://x/a.jpg', 'c', ?2, 'scheduled', ?3)",
            params![job_id, run_at.to_rfc3339(), Utc::now().to_rfc3339()],
        )
        .unwrap();
    }

    #[tokio::test]
    async fn recovery_fires_recent_misfires() {
        let (scheduler, mock, db) = setup().await;
        insert_row(&db, "missed-1", Utc::now() - chrono::Duration::seconds(90)).await;

        scheduler.recover().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(mock.published.lock().await.len(), 1);
        assert_eq!(
            scheduler.get("missed-1").await.unwrap().status,
            JobStatus::Fired
        );
    }

    #[tokio::test]
    async fn recovery_cancels_misfires_beyond_grace() {
        let (scheduler, mock, db) = setup().await;
        insert_row(&db, "stale-1", Utc::now() - chrono::Duration::minutes(30)).await;

        scheduler.recover().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(mock.published.lock().await.is_empty());
        assert_eq!(
            scheduler.get("stale-1").await.unwrap().status,
            JobStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn recovery_rearms_future_jobs() {
        let (scheduler, mock, db) = setup().await;
        insert_row(&db, "future-1", future()).await;

        scheduler.recover().await.unwrap();
        assert!(mock.published.lock().await.is_empty());
        assert_eq!(scheduler.list("p1").await.unwrap().len(), 1);
    }

    #[test]
    fn display_name_truncates_long_captions() {
        let name = display_name("p1", &"字".repeat(50));
        assert_eq!(name.chars().count(), 3 + 30);
        assert!(name.starts_with("p1:"));
    }

    #[tokio::test]
    async fn jobs_survive_a_process_restart() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("prism.db");
        let run_at = future();

        {
            let db = Db::open(&db_path).unwrap();
            let store = Arc::new(ConnectionStore::open(db.clone()).await.unwrap());
            store
                .upsert(PersonaConnection {
                    persona_id: "p1".into(),
                    access_token: "IGAAtok".into(),
                    account_id: "acct-1".into(),
                    account_handle: "h".into(),
                    kind: CredentialKind::Creator,
                    connected_at: Utc::now(),
                    refreshed_at: None,
                })
                .await;
            let pipeline = Arc::new(PublishPipeline::new(
                Arc::new(MockPlatform::default()),
                store,
                None,
                None,
            ));
            let sched = Arc::new(Mutex::new(JobScheduler::new().await.unwrap()));
            let scheduler = PostScheduler::new(db, sched, pipeline);
            scheduler
                .schedule("p1", "https://x/a.jpg", "c", run_at)
                .await
                .unwrap();
        }

        // Fresh handles over the same file, as after a redeploy.
        let db = Db::open(&db_path).unwrap();
        let store = Arc::new(ConnectionStore::open(db.clone()).await.unwrap());
        let mock = Arc::new(MockPlatform::default());
        let pipeline = Arc::new(PublishPipeline::new(mock.clone(), store, None, None));
        let sched = Arc::new(Mutex::new(JobScheduler::new().await.unwrap()));
        let scheduler = PostScheduler::new(db, sched, pipeline);
        scheduler.recover().await.unwrap();

        let jobs = scheduler.list("p1").await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].run_at.timestamp(), run_at.timestamp());
    }
}
