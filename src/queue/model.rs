//! Job and recurring-schedule data model.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::QueueError;

/// Payload keys whose values are credentials and must never be logged.
const SENSITIVE_KEYS: &[&str] = &["github_token", "token", "authorization", "credential"];

const REDACTED: &str = "[redacted]";

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Persisted and waiting for a worker (possibly delayed until `run_at`).
    Waiting,
    /// Claimed by exactly one worker.
    Active,
    /// Processor returned normally.
    Completed,
    /// Processor failed and no attempts remain.
    Failed,
}

impl JobStatus {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            (Waiting, Active)
                | (Active, Completed)
                | (Active, Failed)
                // retry or crash redelivery
                | (Active, Waiting)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Per-job submission options. Retry policy lives here, not in processors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobOptions {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Base delay for exponential backoff between attempts.
    pub backoff: Duration,
    /// Delay before the first attempt becomes claimable.
    pub delay: Duration,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::from_secs(5),
            delay: Duration::ZERO,
        }
    }
}

impl JobOptions {
    pub fn with_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// A unit of work persisted in a named queue.
///
/// `Debug` prints a redacted payload; use [`Job::redacted_payload`] for logs.
#[derive(Clone)]
pub struct Job {
    pub id: Uuid,
    pub queue: String,
    /// Job type name, e.g. `monitor-issue` or the scheduler name for recurring jobs.
    pub name: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    /// Attempts started so far (incremented on claim).
    pub attempts: u32,
    pub max_attempts: u32,
    pub backoff: Duration,
    /// Earliest time the job may be claimed.
    pub run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Job {
    /// Build a fresh waiting job.
    pub fn new(
        queue: impl Into<String>,
        name: impl Into<String>,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Self {
        let now = Utc::now();
        let delay = chrono::Duration::from_std(options.delay).unwrap_or_default();
        Self {
            id: Uuid::new_v4(),
            queue: queue.into(),
            name: name.into(),
            payload,
            status: JobStatus::Waiting,
            attempts: 0,
            max_attempts: options.max_attempts.max(1),
            backoff: options.backoff,
            run_at: now + delay,
            created_at: now,
            finished_at: None,
            last_error: None,
        }
    }

    /// Deserialize the payload into a typed job description.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, QueueError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| QueueError::InvalidPayload {
            id: self.id,
            reason: e.to_string(),
        })
    }

    /// Payload with every credential-bearing value masked.
    pub fn redacted_payload(&self) -> serde_json::Value {
        redact(&self.payload)
    }

    /// Delay before the next attempt, or `None` when attempts are exhausted.
    ///
    /// Exponential: `backoff * 2^(attempts - 1)`.
    pub fn retry_delay(&self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        let exponent = self.attempts.saturating_sub(1).min(16);
        Some(self.backoff.saturating_mul(1u32 << exponent))
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("queue", &self.queue)
            .field("name", &self.name)
            .field("payload", &self.redacted_payload())
            .field("status", &self.status)
            .field("attempts", &self.attempts)
            .field("max_attempts", &self.max_attempts)
            .field("run_at", &self.run_at)
            .finish()
    }
}

fn redact(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => map
            .iter()
            .map(|(k, v)| {
                let masked = if SENSITIVE_KEYS.contains(&k.to_ascii_lowercase().as_str()) {
                    serde_json::Value::String(REDACTED.to_string())
                } else {
                    redact(v)
                };
                (k.clone(), masked)
            })
            .collect::<serde_json::Map<_, _>>()
            .into(),
        serde_json::Value::Array(items) => items.iter().map(redact).collect(),
        other => other.clone(),
    }
}

/// A persisted recurring schedule: one queue, one scheduler name, one cron pattern.
///
/// The store keys schedules by `(queue, scheduler_name)`; registering a new
/// pattern under an existing name replaces the old one in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleHandle {
    pub id: Uuid,
    pub queue: String,
    pub scheduler_name: String,
    pub pattern: String,
    pub next_fire_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_with(payload: serde_json::Value, options: JobOptions) -> Job {
        Job::new("github-monitor", "monitor-issue", payload, options)
    }

    #[test]
    fn status_transitions() {
        assert!(JobStatus::Waiting.can_transition_to(JobStatus::Active));
        assert!(JobStatus::Active.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Active.can_transition_to(JobStatus::Waiting));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Active));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Waiting));
        assert!(!JobStatus::Waiting.can_transition_to(JobStatus::Completed));
    }

    #[test]
    fn status_display_parse() {
        for status in [
            JobStatus::Waiting,
            JobStatus::Active,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            let parsed: JobStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("paused".parse::<JobStatus>().is_err());
    }

    #[test]
    fn redaction_masks_nested_credentials() {
        let job = job_with(
            serde_json::json!({
                "task_id": "t-1",
                "github_token": "ghp_secret",
                "nested": { "Authorization": "Bearer x", "keep": 1 },
            }),
            JobOptions::default(),
        );
        let redacted = job.redacted_payload();
        assert_eq!(redacted["github_token"], REDACTED);
        assert_eq!(redacted["nested"]["Authorization"], REDACTED);
        assert_eq!(redacted["nested"]["keep"], 1);
        assert_eq!(redacted["task_id"], "t-1");

        let debug = format!("{job:?}");
        assert!(!debug.contains("ghp_secret"));
        assert!(!debug.contains("Bearer x"));
    }

    #[test]
    fn retry_delay_is_exponential_and_bounded() {
        let mut job = job_with(
            serde_json::json!({}),
            JobOptions::default()
                .with_attempts(3)
                .with_backoff(Duration::from_secs(10)),
        );
        job.attempts = 1;
        assert_eq!(job.retry_delay(), Some(Duration::from_secs(10)));
        job.attempts = 2;
        assert_eq!(job.retry_delay(), Some(Duration::from_secs(20)));
        job.attempts = 3;
        assert_eq!(job.retry_delay(), None);
    }

    #[test]
    fn delayed_job_runs_later() {
        let job = job_with(
            serde_json::json!({}),
            JobOptions::default().with_delay(Duration::from_secs(60)),
        );
        assert!(job.run_at > job.created_at);
        assert_eq!(job.max_attempts, 1);
    }

    #[test]
    fn payload_as_reports_job_id() {
        #[derive(Debug, Deserialize)]
        struct Needs {
            #[allow(dead_code)]
            issue_number: u64,
        }
        let job = job_with(serde_json::json!({ "other": true }), JobOptions::default());
        let err = job.payload_as::<Needs>().unwrap_err();
        assert!(matches!(err, QueueError::InvalidPayload { id, .. } if id == job.id));
    }
}
