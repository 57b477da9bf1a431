//! Recurring task scheduler.
//!
//! At boot the process registers two schedules through the job queue's
//! idempotent upsert: an hourly data refresh and a daily maintenance run
//! (index rebuild plus garbage collection). Both are safe to re-register on
//! every deploy.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use crate::collab::ReportCache;
use crate::config::SchedulerConfig;
use crate::error::Error;
use crate::queue::{Job, JobQueue, ScheduleHandle};
use crate::worker::JobProcessor;

/// Queue of the data refresh job.
pub const REFRESH_QUEUE: &str = "refresh-data";
pub const REFRESH_SCHEDULER: &str = "hourly-refresh";

/// Queue of the maintenance job. Runs with concurrency 1.
pub const MAINTENANCE_QUEUE: &str = "rebuild-index";
pub const MAINTENANCE_SCHEDULER: &str = "daily-maintenance";

/// Handles of the schedules registered at boot; `None` where registration failed.
#[derive(Debug, Default)]
pub struct RegisteredSchedules {
    pub refresh: Option<ScheduleHandle>,
    pub maintenance: Option<ScheduleHandle>,
}

pub struct RecurringTaskScheduler {
    queue: Arc<JobQueue>,
    config: SchedulerConfig,
}

impl RecurringTaskScheduler {
    pub fn new(queue: Arc<JobQueue>, config: SchedulerConfig) -> Self {
        Self { queue, config }
    }

    /// Register (or re-register) both recurring schedules. Never fails;
    /// registration problems are logged by the queue.
    pub async fn register_all(&self) -> RegisteredSchedules {
        let refresh = self
            .queue
            .schedule_recurring(
                REFRESH_QUEUE,
                REFRESH_SCHEDULER,
                &self.config.refresh_pattern,
                self.config.refresh_on_start,
            )
            .await;

        let maintenance = self
            .queue
            .schedule_recurring(
                MAINTENANCE_QUEUE,
                MAINTENANCE_SCHEDULER,
                &self.config.maintenance_pattern,
                false,
            )
            .await;

        if refresh.is_none() || maintenance.is_none() {
            warn!(
                refresh = refresh.is_some(),
                maintenance = maintenance.is_some(),
                "Some recurring schedules were not registered"
            );
        }
        RegisteredSchedules {
            refresh,
            maintenance,
        }
    }
}

/// Refreshes every cached game.
pub struct RefreshProcessor {
    cache: Arc<dyn ReportCache>,
}

impl RefreshProcessor {
    pub fn new(cache: Arc<dyn ReportCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl JobProcessor for RefreshProcessor {
    async fn process(&self, job: &Job) -> Result<(), Error> {
        info!(job_id = %job.id, scheduled_for = %job.payload["scheduled_for"], "Refreshing report data");
        self.cache.refresh_all().await.map_err(Error::Cache)
    }
}

/// Daily maintenance: prune old jobs and notifications, then rebuild the
/// search index.
pub struct MaintenanceProcessor {
    queue: Arc<JobQueue>,
    cache: Arc<dyn ReportCache>,
    config: SchedulerConfig,
}

impl MaintenanceProcessor {
    pub fn new(queue: Arc<JobQueue>, cache: Arc<dyn ReportCache>, config: SchedulerConfig) -> Self {
        Self {
            queue,
            cache,
            config,
        }
    }
}

#[async_trait]
impl JobProcessor for MaintenanceProcessor {
    async fn process(&self, job: &Job) -> Result<(), Error> {
        let retention = chrono::Duration::from_std(self.config.job_retention).unwrap_or_default();
        let cutoff = Utc::now() - retention;

        // GC is best-effort; the index rebuild decides the job's outcome.
        match self.queue.prune(cutoff).await {
            Ok(pruned) => info!(job_id = %job.id, pruned, "Pruned finished jobs"),
            Err(e) => warn!(job_id = %job.id, "Job pruning failed: {}", e),
        }
        match self
            .queue
            .store()
            .prune_notifications(self.config.notifications_per_user)
            .await
        {
            Ok(pruned) => info!(job_id = %job.id, pruned, "Pruned notifications"),
            Err(e) => warn!(job_id = %job.id, "Notification pruning failed: {}", e),
        }

        self.cache.rebuild_index().await.map_err(Error::Cache)?;
        info!(job_id = %job.id, "Search index rebuilt");
        Ok(())
    }
}
