//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. A single connection is
//! shared by every caller, so each statement below is atomic with respect
//! to the others (claims in particular are one `UPDATE ... RETURNING`).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::notification::{Notification, Severity};
use crate::progress::TaskProgress;
use crate::queue::model::{Job, JobStatus, ScheduleHandle};
use crate::store::migrations;
use crate::store::traits::Database;

const JOB_COLUMNS: &str = "id, queue, name, payload, status, attempts, max_attempts, backoff_ms, run_at, created_at, finished_at, last_error";

const SCHEDULE_COLUMNS: &str = "id, queue, scheduler_name, pattern, next_fire_at, created_at";

const NOTIFICATION_COLUMNS: &str =
    "id, icon, title, body, link, link_label, variant, created_at";

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_jobs(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut jobs = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => jobs.push(row_to_job(&row)?),
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("{op}: {e}"))),
            }
        }
        Ok(jobs)
    }

    async fn query_schedules(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<ScheduleHandle>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut schedules = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_schedule(&row) {
                Ok(s) => schedules.push(s),
                Err(e) => tracing::warn!("Skipping schedule row: {e}"),
            }
        }
        Ok(schedules)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format. Fixed precision keeps text comparison ordered.
pub(crate) fn to_db_time(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn optional_text(value: Option<&str>) -> libsql::Value {
    match value {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    s.parse()
        .map_err(|e| DatabaseError::Serialization(format!("invalid uuid '{s}': {e}")))
}

fn row_to_job(row: &libsql::Row) -> Result<Job, DatabaseError> {
    let id: String = row
        .get(0)
        .map_err(|e| DatabaseError::Serialization(format!("job id: {e}")))?;
    let payload_str: String = row.get(3).unwrap_or_else(|_| "null".to_string());
    let payload: serde_json::Value = serde_json::from_str(&payload_str)
        .map_err(|e| DatabaseError::Serialization(format!("job {id} payload: {e}")))?;
    let status_str: String = row.get(4).unwrap_or_else(|_| "waiting".to_string());
    let status: JobStatus = status_str.parse().map_err(DatabaseError::Serialization)?;
    let run_at: String = row.get(8).unwrap_or_default();
    let created_at: String = row.get(9).unwrap_or_default();

    Ok(Job {
        id: parse_uuid(&id)?,
        queue: row.get(1).unwrap_or_default(),
        name: row.get(2).unwrap_or_default(),
        payload,
        status,
        attempts: row.get::<i64>(5).unwrap_or(0) as u32,
        max_attempts: row.get::<i64>(6).unwrap_or(1) as u32,
        backoff: Duration::from_millis(row.get::<i64>(7).unwrap_or(0).max(0) as u64),
        run_at: parse_datetime(&run_at),
        created_at: parse_datetime(&created_at),
        finished_at: row.get::<String>(10).ok().map(|s| parse_datetime(&s)),
        last_error: row.get::<String>(11).ok(),
    })
}

fn row_to_schedule(row: &libsql::Row) -> Result<ScheduleHandle, DatabaseError> {
    let id: String = row
        .get(0)
        .map_err(|e| DatabaseError::Serialization(format!("schedule id: {e}")))?;
    let next_fire: String = row.get(4).unwrap_or_default();
    let created: String = row.get(5).unwrap_or_default();

    Ok(ScheduleHandle {
        id: parse_uuid(&id)?,
        queue: row.get(1).unwrap_or_default(),
        scheduler_name: row.get(2).unwrap_or_default(),
        pattern: row.get(3).unwrap_or_default(),
        next_fire_at: parse_datetime(&next_fire),
        created_at: parse_datetime(&created),
    })
}

fn row_to_notification(row: &libsql::Row) -> Result<Notification, DatabaseError> {
    let id: String = row
        .get(0)
        .map_err(|e| DatabaseError::Serialization(format!("notification id: {e}")))?;
    let variant: String = row.get(6).unwrap_or_else(|_| "info".to_string());
    let created: String = row.get(7).unwrap_or_default();

    Ok(Notification {
        id: parse_uuid(&id)?,
        icon: row.get(1).unwrap_or_default(),
        title: row.get(2).unwrap_or_default(),
        body: row.get(3).unwrap_or_default(),
        link: row.get::<String>(4).ok(),
        link_label: row.get::<String>(5).ok(),
        variant: variant
            .parse::<Severity>()
            .map_err(DatabaseError::Serialization)?,
        created_at: parse_datetime(&created),
    })
}

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Jobs ────────────────────────────────────────────────────────

    async fn insert_job(&self, job: &Job) -> Result<(), DatabaseError> {
        let payload = serde_json::to_string(&job.payload)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        self.conn()
            .execute(
                &format!(
                    "INSERT INTO jobs ({JOB_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                ),
                params![
                    job.id.to_string(),
                    job.queue.clone(),
                    job.name.clone(),
                    payload,
                    job.status.as_str(),
                    job.attempts as i64,
                    job.max_attempts as i64,
                    job.backoff.as_millis() as i64,
                    to_db_time(job.run_at),
                    to_db_time(job.created_at),
                    optional_text(job.finished_at.map(to_db_time).as_deref()),
                    optional_text(job.last_error.as_deref()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_job: {e}")))?;

        debug!(job_id = %job.id, queue = %job.queue, "Job persisted");
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError> {
        let jobs = self
            .query_jobs(
                "get_job",
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await?;
        Ok(jobs.into_iter().next())
    }

    async fn claim_next_job(
        &self,
        queue: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, DatabaseError> {
        let jobs = self
            .query_jobs(
                "claim_next_job",
                &format!(
                    "UPDATE jobs SET status = 'active', attempts = attempts + 1
                     WHERE id = (
                         SELECT id FROM jobs
                         WHERE queue = ?1 AND status = 'waiting' AND run_at <= ?2
                         ORDER BY run_at, created_at
                         LIMIT 1
                     )
                     RETURNING {JOB_COLUMNS}"
                ),
                params![queue, to_db_time(now)],
            )
            .await?;
        Ok(jobs.into_iter().next())
    }

    async fn complete_job(&self, id: Uuid) -> Result<(), DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE jobs SET status = 'completed', finished_at = ?2, last_error = NULL
                 WHERE id = ?1 AND status = 'active'",
                params![id.to_string(), to_db_time(Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("complete_job: {e}")))?;

        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "active job".into(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn fail_job(
        &self,
        id: Uuid,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError> {
        let changed = match retry_at {
            Some(at) => self
                .conn()
                .execute(
                    "UPDATE jobs SET status = 'waiting', run_at = ?2, last_error = ?3
                     WHERE id = ?1 AND status = 'active'",
                    params![id.to_string(), to_db_time(at), error],
                )
                .await,
            None => self
                .conn()
                .execute(
                    "UPDATE jobs SET status = 'failed', finished_at = ?2, last_error = ?3
                     WHERE id = ?1 AND status = 'active'",
                    params![id.to_string(), to_db_time(Utc::now()), error],
                )
                .await,
        }
        .map_err(|e| DatabaseError::Query(format!("fail_job: {e}")))?;

        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "active job".into(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn count_jobs(&self, queue: &str, status: JobStatus) -> Result<u64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM jobs WHERE queue = ?1 AND status = ?2",
                params![queue, status.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_jobs: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0) as u64),
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count_jobs: {e}"))),
        }
    }

    async fn requeue_active_jobs(&self) -> Result<usize, DatabaseError> {
        let changed = self
            .conn()
            .execute("UPDATE jobs SET status = 'waiting' WHERE status = 'active'", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("requeue_active_jobs: {e}")))?;
        Ok(changed as usize)
    }

    async fn prune_finished_jobs(&self, before: DateTime<Utc>) -> Result<usize, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "DELETE FROM jobs WHERE status IN ('completed', 'failed') AND finished_at < ?1",
                params![to_db_time(before)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("prune_finished_jobs: {e}")))?;
        Ok(changed as usize)
    }

    // ── Schedules ───────────────────────────────────────────────────

    async fn list_schedules(&self, queue: &str) -> Result<Vec<ScheduleHandle>, DatabaseError> {
        self.query_schedules(
            "list_schedules",
            &format!(
                "SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE queue = ?1 ORDER BY created_at"
            ),
            params![queue],
        )
        .await
    }

    async fn remove_schedule(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute("DELETE FROM schedules WHERE id = ?1", params![id.to_string()])
            .await
            .map_err(|e| DatabaseError::Query(format!("remove_schedule: {e}")))?;
        Ok(changed > 0)
    }

    async fn upsert_schedule(
        &self,
        schedule: &ScheduleHandle,
    ) -> Result<ScheduleHandle, DatabaseError> {
        self.query_schedules(
            "upsert_schedule",
            &format!(
                "INSERT INTO schedules ({SCHEDULE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (queue, scheduler_name)
                 DO UPDATE SET pattern = excluded.pattern,
                               next_fire_at = excluded.next_fire_at
                 RETURNING {SCHEDULE_COLUMNS}"
            ),
            params![
                schedule.id.to_string(),
                schedule.queue.clone(),
                schedule.scheduler_name.clone(),
                schedule.pattern.clone(),
                to_db_time(schedule.next_fire_at),
                to_db_time(schedule.created_at),
            ],
        )
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| DatabaseError::Query("upsert_schedule: no row returned".into()))
    }

    async fn list_due_schedules(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduleHandle>, DatabaseError> {
        self.query_schedules(
            "list_due_schedules",
            &format!(
                "SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE next_fire_at <= ?1 ORDER BY next_fire_at"
            ),
            params![to_db_time(now)],
        )
        .await
    }

    async fn advance_schedule(
        &self,
        id: Uuid,
        expected: DateTime<Utc>,
        next: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE schedules SET next_fire_at = ?3 WHERE id = ?1 AND next_fire_at = ?2",
                params![id.to_string(), to_db_time(expected), to_db_time(next)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("advance_schedule: {e}")))?;
        Ok(changed == 1)
    }

    // ── Progress ────────────────────────────────────────────────────

    async fn put_progress(
        &self,
        user_id: &str,
        task_id: &str,
        progress: &TaskProgress,
    ) -> Result<bool, DatabaseError> {
        let record = serde_json::to_string(progress)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        let changed = self
            .conn()
            .execute(
                "INSERT INTO task_progress (user_id, task_id, status, done, record, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (user_id, task_id) DO UPDATE SET
                     status = excluded.status,
                     done = excluded.done,
                     record = excluded.record,
                     updated_at = excluded.updated_at
                 WHERE task_progress.done = 0",
                params![
                    user_id,
                    task_id,
                    progress.status.as_str(),
                    progress.done as i64,
                    record,
                    to_db_time(progress.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("put_progress: {e}")))?;
        Ok(changed > 0)
    }

    async fn get_progress(
        &self,
        user_id: &str,
        task_id: &str,
    ) -> Result<Option<TaskProgress>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT record FROM task_progress WHERE user_id = ?1 AND task_id = ?2",
                params![user_id, task_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_progress: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let record: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Serialization(format!("progress record: {e}")))?;
                serde_json::from_str(&record)
                    .map(Some)
                    .map_err(|e| DatabaseError::Serialization(format!("progress record: {e}")))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_progress: {e}"))),
        }
    }

    // ── Notifications ───────────────────────────────────────────────

    async fn append_notification(
        &self,
        user_id: &str,
        notification: &Notification,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO notifications (user_id, {NOTIFICATION_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                ),
                params![
                    user_id,
                    notification.id.to_string(),
                    notification.icon.clone(),
                    notification.title.clone(),
                    notification.body.clone(),
                    optional_text(notification.link.as_deref()),
                    optional_text(notification.link_label.as_deref()),
                    notification.variant.as_str(),
                    to_db_time(notification.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append_notification: {e}")))?;
        Ok(())
    }

    async fn list_notifications(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<Notification>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {NOTIFICATION_COLUMNS} FROM notifications
                     WHERE user_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT ?2"
                ),
                params![user_id, limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_notifications: {e}")))?;

        let mut notifications = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_notification(&row) {
                Ok(n) => notifications.push(n),
                Err(e) => tracing::warn!("Skipping notification row: {e}"),
            }
        }
        Ok(notifications)
    }

    async fn prune_notifications(&self, keep_per_user: usize) -> Result<usize, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "DELETE FROM notifications WHERE id IN (
                     SELECT id FROM (
                         SELECT id, ROW_NUMBER() OVER (
                             PARTITION BY user_id ORDER BY created_at DESC, rowid DESC
                         ) AS rn
                         FROM notifications
                     ) WHERE rn > ?1
                 )",
                params![keep_per_user as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("prune_notifications: {e}")))?;
        Ok(changed as usize)
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::{ProgressStatus, ProgressValue};
    use crate::queue::model::JobOptions;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn make_job(queue: &str) -> Job {
        Job::new(
            queue,
            "monitor-issue",
            serde_json::json!({ "issue_number": 7 }),
            JobOptions::default().with_attempts(2),
        )
    }

    fn make_schedule(name: &str, pattern: &str) -> ScheduleHandle {
        ScheduleHandle {
            id: Uuid::new_v4(),
            queue: "refresh".into(),
            scheduler_name: name.into(),
            pattern: pattern.into(),
            next_fire_at: Utc::now(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn claim_is_exclusive_and_counts_attempts() {
        let db = test_db().await;
        let job = make_job("github-monitor");
        db.insert_job(&job).await.unwrap();

        let claimed = db
            .claim_next_job("github-monitor", Utc::now())
            .await
            .unwrap()
            .expect("job should be claimable");
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.status, JobStatus::Active);
        assert_eq!(claimed.attempts, 1);
        assert_eq!(claimed.payload["issue_number"], 7);

        assert!(
            db.claim_next_job("github-monitor", Utc::now())
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn claim_ignores_other_queues_and_future_jobs() {
        let db = test_db().await;
        db.insert_job(&make_job("other")).await.unwrap();
        let delayed = Job::new(
            "github-monitor",
            "monitor-issue",
            serde_json::json!({}),
            JobOptions::default().with_delay(Duration::from_secs(3600)),
        );
        db.insert_job(&delayed).await.unwrap();

        assert!(
            db.claim_next_job("github-monitor", Utc::now())
                .await
                .unwrap()
                .is_none()
        );

        let later = Utc::now() + chrono::Duration::hours(2);
        let claimed = db.claim_next_job("github-monitor", later).await.unwrap();
        assert_eq!(claimed.map(|j| j.id), Some(delayed.id));
    }

    #[tokio::test]
    async fn fail_with_retry_requeues_then_fails_terminally() {
        let db = test_db().await;
        let job = make_job("q");
        db.insert_job(&job).await.unwrap();

        db.claim_next_job("q", Utc::now()).await.unwrap().unwrap();
        db.fail_job(job.id, "boom", Some(Utc::now())).await.unwrap();
        let stored = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Waiting);
        assert_eq!(stored.last_error.as_deref(), Some("boom"));

        db.claim_next_job("q", Utc::now()).await.unwrap().unwrap();
        db.fail_job(job.id, "boom again", None).await.unwrap();
        let stored = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.attempts, 2);
        assert!(stored.finished_at.is_some());
    }

    #[tokio::test]
    async fn complete_requires_active_job() {
        let db = test_db().await;
        let job = make_job("q");
        db.insert_job(&job).await.unwrap();

        assert!(matches!(
            db.complete_job(job.id).await,
            Err(DatabaseError::NotFound { .. })
        ));

        db.claim_next_job("q", Utc::now()).await.unwrap();
        db.complete_job(job.id).await.unwrap();
        assert_eq!(db.count_jobs("q", JobStatus::Completed).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn requeue_and_prune() {
        let db = test_db().await;
        let a = make_job("q");
        let b = make_job("q");
        db.insert_job(&a).await.unwrap();
        db.insert_job(&b).await.unwrap();

        db.claim_next_job("q", Utc::now()).await.unwrap();
        db.claim_next_job("q", Utc::now()).await.unwrap();
        db.complete_job(a.id).await.unwrap();

        assert_eq!(db.requeue_active_jobs().await.unwrap(), 1);
        assert_eq!(db.count_jobs("q", JobStatus::Waiting).await.unwrap(), 1);

        let future = Utc::now() + chrono::Duration::seconds(5);
        assert_eq!(db.prune_finished_jobs(future).await.unwrap(), 1);
        assert!(db.get_job(a.id).await.unwrap().is_none());
        assert!(db.get_job(b.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn schedule_upsert_is_keyed_by_name() {
        let db = test_db().await;
        let first = db
            .upsert_schedule(&make_schedule("refresh-data", "0 0 * * * *"))
            .await
            .unwrap();
        db.upsert_schedule(&make_schedule("refresh-data", "0 0 * * * *"))
            .await
            .unwrap();
        assert_eq!(db.list_schedules("refresh").await.unwrap().len(), 1);

        let replaced = db
            .upsert_schedule(&make_schedule("refresh-data", "0 30 * * * *"))
            .await
            .unwrap();
        assert_eq!(replaced.id, first.id);
        assert_eq!(replaced.pattern, "0 30 * * * *");
        let all = db.list_schedules("refresh").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].pattern, "0 30 * * * *");

        db.upsert_schedule(&make_schedule("hourly-other", "0 0 * * * *"))
            .await
            .unwrap();
        assert_eq!(db.list_schedules("refresh").await.unwrap().len(), 2);

        assert!(db.remove_schedule(first.id).await.unwrap());
        assert!(!db.remove_schedule(first.id).await.unwrap());
    }

    #[tokio::test]
    async fn advance_schedule_is_compare_and_set() {
        let db = test_db().await;
        let schedule = make_schedule("rebuild-index", "0 0 3 * * *");
        db.upsert_schedule(&schedule).await.unwrap();

        let stored = db.list_schedules("refresh").await.unwrap().remove(0);
        let next = stored.next_fire_at + chrono::Duration::days(1);

        assert!(
            db.advance_schedule(stored.id, stored.next_fire_at, next)
                .await
                .unwrap()
        );
        assert!(
            !db.advance_schedule(stored.id, stored.next_fire_at, next)
                .await
                .unwrap()
        );
        assert!(db.list_due_schedules(Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn progress_round_trips_and_missing_is_none() {
        let db = test_db().await;
        assert!(db.get_progress("u", "t").await.unwrap().is_none());

        let record = TaskProgress::new(ProgressStatus::Queued, "schedule", "Queued", "hi")
            .with_progress(ProgressValue::Indeterminate);
        assert!(db.put_progress("u", "t", &record).await.unwrap());
        let stored = db.get_progress("u", "t").await.unwrap().unwrap();
        assert_eq!(stored.progress, ProgressValue::Indeterminate);
        assert!(db.get_progress("other-user", "t").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn notifications_newest_first_and_pruned_per_user() {
        let db = test_db().await;
        for i in 0..5 {
            let n = Notification::new(Severity::Info, "info", format!("n{i}"), "body");
            db.append_notification("u1", &n).await.unwrap();
        }
        let n = Notification::new(Severity::Info, "info", "solo", "body");
        db.append_notification("u2", &n).await.unwrap();

        let listed = db.list_notifications("u1", 3).await.unwrap();
        assert_eq!(listed.len(), 3);
        assert_eq!(listed[0].title, "n4");

        assert_eq!(db.prune_notifications(2).await.unwrap(), 3);
        assert_eq!(db.list_notifications("u1", 10).await.unwrap().len(), 2);
        assert_eq!(db.list_notifications("u2", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        let job = make_job("durable");

        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.insert_job(&job).await.unwrap();
        }

        let db = LibSqlBackend::new_local(&path).await.unwrap();
        let claimed = db.claim_next_job("durable", Utc::now()).await.unwrap();
        assert_eq!(claimed.map(|j| j.id), Some(job.id));
    }
}
