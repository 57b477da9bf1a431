//! Cron patterns and the schedule ticker that turns due schedules into jobs.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::error::QueueError;
use crate::queue::JobQueue;
use crate::queue::model::JobOptions;

fn parse(pattern: &str) -> Result<cron::Schedule, QueueError> {
    cron::Schedule::from_str(pattern).map_err(|e| QueueError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

/// Check that `pattern` is a valid 6-field cron expression with at least
/// one future occurrence.
pub fn validate_pattern(pattern: &str) -> Result<(), QueueError> {
    next_fire_after(pattern, Utc::now()).map(|_| ())
}

/// First occurrence of `pattern` strictly after `after`.
pub fn next_fire_after(pattern: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>, QueueError> {
    parse(pattern)?
        .after(&after)
        .next()
        .ok_or_else(|| QueueError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: "pattern has no future occurrence".into(),
        })
}

/// Fire every schedule due at `now`. Returns the number of jobs submitted.
///
/// Each occurrence is claimed by moving `next_fire_at` forward with a
/// compare-and-set before the job is submitted, so a second ticker racing
/// on the same store skips it. Missed occurrences collapse into one job.
pub async fn fire_due_schedules(queue: &JobQueue, now: DateTime<Utc>) -> usize {
    let due = match queue.store().list_due_schedules(now).await {
        Ok(due) => due,
        Err(e) => {
            error!("Failed to load due schedules: {}", e);
            return 0;
        }
    };

    let mut fired = 0;
    for schedule in due {
        let next = match next_fire_after(&schedule.pattern, now) {
            Ok(next) => next,
            Err(e) => {
                warn!(scheduler = %schedule.scheduler_name, "Skipping schedule: {}", e);
                continue;
            }
        };

        match queue
            .store()
            .advance_schedule(schedule.id, schedule.next_fire_at, next)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(scheduler = %schedule.scheduler_name, "Occurrence already claimed");
                continue;
            }
            Err(e) => {
                error!(scheduler = %schedule.scheduler_name, "Failed to advance schedule: {}", e);
                continue;
            }
        }

        let payload = serde_json::json!({
            "scheduler_name": schedule.scheduler_name,
            "scheduled_for": schedule.next_fire_at,
        });
        match queue
            .submit(
                &schedule.queue,
                &schedule.scheduler_name,
                payload,
                JobOptions::default(),
            )
            .await
        {
            Ok(job_id) => {
                info!(
                    scheduler = %schedule.scheduler_name,
                    queue = %schedule.queue,
                    job_id = %job_id,
                    next_fire_at = %next,
                    "Recurring job fired"
                );
                fired += 1;
            }
            Err(e) => {
                error!(scheduler = %schedule.scheduler_name, "Failed to submit recurring job: {}", e);
            }
        }
    }
    fired
}

/// Spawn the schedule ticker background task.
pub fn spawn_schedule_ticker(
    queue: Arc<JobQueue>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            fire_due_schedules(&queue, Utc::now()).await;
        }
    })
}
