//! Unified `Database` trait: single async interface for all persistence.
//!
//! Covers the job queue, recurring schedules, task progress records and
//! the per-user notification store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::notification::Notification;
use crate::progress::TaskProgress;
use crate::queue::model::{Job, JobStatus, ScheduleHandle};

/// Backend-agnostic database trait.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Jobs ────────────────────────────────────────────────────────

    /// Persist a new job.
    async fn insert_job(&self, job: &Job) -> Result<(), DatabaseError>;

    /// Get a job by ID.
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError>;

    /// Atomically claim the oldest claimable waiting job of `queue`.
    ///
    /// The claimed job is `active` and its attempt counter incremented.
    async fn claim_next_job(
        &self,
        queue: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, DatabaseError>;

    /// Mark an active job completed.
    async fn complete_job(&self, id: Uuid) -> Result<(), DatabaseError>;

    /// Record a failed attempt. With `retry_at` the job goes back to
    /// `waiting`; without it the job is terminally `failed`.
    async fn fail_job(
        &self,
        id: Uuid,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError>;

    /// Count jobs of `queue` in `status`.
    async fn count_jobs(&self, queue: &str, status: JobStatus) -> Result<u64, DatabaseError>;

    /// Return every `active` job to `waiting` (crash recovery).
    /// Returns the number of jobs requeued.
    async fn requeue_active_jobs(&self) -> Result<usize, DatabaseError>;

    /// Delete terminal jobs finished before `before`.
    /// Returns the number of jobs deleted.
    async fn prune_finished_jobs(&self, before: DateTime<Utc>) -> Result<usize, DatabaseError>;

    // ── Schedules ───────────────────────────────────────────────────

    /// List every schedule registered on `queue`.
    async fn list_schedules(&self, queue: &str) -> Result<Vec<ScheduleHandle>, DatabaseError>;

    /// Remove a schedule. Returns whether a row was removed.
    async fn remove_schedule(&self, id: Uuid) -> Result<bool, DatabaseError>;

    /// Insert a schedule, or replace the pattern and `next_fire_at` of the one
    /// already registered under `(queue, scheduler_name)`. Returns the stored row.
    async fn upsert_schedule(
        &self,
        schedule: &ScheduleHandle,
    ) -> Result<ScheduleHandle, DatabaseError>;

    /// Schedules whose `next_fire_at` is at or before `now`.
    async fn list_due_schedules(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduleHandle>, DatabaseError>;

    /// Compare-and-set `next_fire_at`: only moves from `expected` to `next`.
    /// Returns `false` if another ticker already advanced it.
    async fn advance_schedule(
        &self,
        id: Uuid,
        expected: DateTime<Utc>,
        next: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    // ── Progress ────────────────────────────────────────────────────

    /// Write a progress record unless the stored one is already done.
    /// Returns whether the write landed.
    async fn put_progress(
        &self,
        user_id: &str,
        task_id: &str,
        progress: &TaskProgress,
    ) -> Result<bool, DatabaseError>;

    /// Read a progress record; `None` means the task has not started.
    async fn get_progress(
        &self,
        user_id: &str,
        task_id: &str,
    ) -> Result<Option<TaskProgress>, DatabaseError>;

    // ── Notifications ───────────────────────────────────────────────

    /// Append a notification for a user.
    async fn append_notification(
        &self,
        user_id: &str,
        notification: &Notification,
    ) -> Result<(), DatabaseError>;

    /// Most recent notifications for a user, newest first.
    async fn list_notifications(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<Notification>, DatabaseError>;

    /// Keep only the newest `keep_per_user` notifications of each user.
    /// Returns the number of notifications deleted.
    async fn prune_notifications(&self, keep_per_user: usize) -> Result<usize, DatabaseError>;
}
