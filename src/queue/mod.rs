//! Job queue: named durable queues with immediate and recurring submission.
//!
//! Jobs are persisted through the [`Database`] trait and pulled by the
//! worker pool. Recurring schedules are registered idempotently: all prior
//! schedules under a scheduler name are removed before the new one is
//! written, so redeploys never accumulate duplicate triggers.

pub mod model;
pub mod schedule;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::QueueError;
use crate::store::Database;

pub use model::{Job, JobOptions, JobStatus, ScheduleHandle};
pub use schedule::{fire_due_schedules, next_fire_after, spawn_schedule_ticker, validate_pattern};

/// Facade over the store for producers and the scheduler.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn Database>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn Database>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn Database> {
        &self.store
    }

    /// Persist a job on `queue` and return its id. Never waits on execution.
    pub async fn submit(
        &self,
        queue: &str,
        name: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Result<Uuid, QueueError> {
        let job = Job::new(queue, name, payload, options);
        self.store.insert_job(&job).await?;

        info!(
            job_id = %job.id,
            queue = %queue,
            name = %name,
            max_attempts = job.max_attempts,
            "Job submitted"
        );
        Ok(job.id)
    }

    /// Fetch a job by id.
    pub async fn get(&self, id: Uuid) -> Result<Option<Job>, QueueError> {
        Ok(self.store.get_job(id).await?)
    }

    /// Register a recurring schedule, replacing every existing schedule
    /// with the same `scheduler_name` on `queue`.
    ///
    /// Best-effort: failures are logged and `None` is returned. A listing
    /// failure only downgrades to a plain upsert; individual removal
    /// failures do not abort the batch.
    pub async fn schedule_recurring(
        &self,
        queue: &str,
        scheduler_name: &str,
        pattern: &str,
        run_immediately: bool,
    ) -> Option<ScheduleHandle> {
        let now = Utc::now();
        let next_fire_at = match schedule::next_fire_after(pattern, now) {
            Ok(_) if run_immediately => now,
            Ok(next) => next,
            Err(e) => {
                error!(scheduler = %scheduler_name, "Cannot register schedule: {}", e);
                return None;
            }
        };

        match self.store.list_schedules(queue).await {
            Ok(existing) => {
                let mut removed = 0usize;
                let mut failed = 0usize;
                for stale in existing
                    .iter()
                    .filter(|s| s.scheduler_name == scheduler_name)
                {
                    match self.store.remove_schedule(stale.id).await {
                        Ok(true) => removed += 1,
                        Ok(false) => {}
                        Err(e) => {
                            failed += 1;
                            warn!(
                                scheduler = %scheduler_name,
                                schedule_id = %stale.id,
                                "Failed to remove existing schedule: {}",
                                e
                            );
                        }
                    }
                }
                info!(
                    scheduler = %scheduler_name,
                    queue = %queue,
                    removed,
                    failed,
                    "Cleared existing schedules"
                );
            }
            Err(e) => {
                warn!(
                    scheduler = %scheduler_name,
                    queue = %queue,
                    "Could not list existing schedules, upserting anyway: {}",
                    e
                );
            }
        }

        let handle = ScheduleHandle {
            id: Uuid::new_v4(),
            queue: queue.to_string(),
            scheduler_name: scheduler_name.to_string(),
            pattern: pattern.to_string(),
            next_fire_at,
            created_at: now,
        };

        match self.store.upsert_schedule(&handle).await {
            Ok(stored) => {
                info!(
                    scheduler = %scheduler_name,
                    queue = %queue,
                    pattern = %pattern,
                    next_fire_at = %next_fire_at,
                    "Recurring schedule registered"
                );
                Some(stored)
            }
            Err(e) => {
                error!(
                    scheduler = %scheduler_name,
                    queue = %queue,
                    "Failed to register recurring schedule: {}",
                    e
                );
                None
            }
        }
    }

    /// Every schedule registered on `queue`.
    pub async fn list_schedules(&self, queue: &str) -> Result<Vec<ScheduleHandle>, QueueError> {
        Ok(self.store.list_schedules(queue).await?)
    }

    /// Remove one schedule. Returns whether it existed.
    pub async fn remove_schedule(&self, handle: &ScheduleHandle) -> Result<bool, QueueError> {
        Ok(self.store.remove_schedule(handle.id).await?)
    }

    /// Return jobs stranded in `active` by a previous process to `waiting`.
    pub async fn requeue_active(&self) -> Result<usize, QueueError> {
        let count = self.store.requeue_active_jobs().await?;
        if count > 0 {
            info!(count, "Requeued jobs left active by a previous run");
        }
        Ok(count)
    }

    /// Delete completed and failed jobs that finished before `before`.
    pub async fn prune(&self, before: DateTime<Utc>) -> Result<usize, QueueError> {
        Ok(self.store.prune_finished_jobs(before).await?)
    }
}
