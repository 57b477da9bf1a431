//! Task progress records: the externally polled state of an in-flight task.
//!
//! Records are keyed by `(user_id, task_id)`, written only by the worker that
//! owns the task, and frozen once `done` is set. Readers must treat a missing
//! record as "not started yet", never as failure.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::DatabaseError;
use crate::notification::Severity;
use crate::store::Database;

/// Status tag of a progress record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Warning,
}

impl ProgressStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Warning => "warning",
        }
    }
}

impl std::fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress value: `null`, `"indeterminate"`, or an integer percentage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProgressValue {
    #[default]
    Unknown,
    Indeterminate,
    Percent(u8),
}

impl ProgressValue {
    /// Clamp to 0..=100.
    pub fn percent(value: u8) -> Self {
        Self::Percent(value.min(100))
    }
}

impl Serialize for ProgressValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Unknown => serializer.serialize_none(),
            Self::Indeterminate => serializer.serialize_str("indeterminate"),
            Self::Percent(p) => serializer.serialize_u8(*p),
        }
    }
}

impl<'de> Deserialize<'de> for ProgressValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ProgressVisitor;

        impl<'de> Visitor<'de> for ProgressVisitor {
            type Value = ProgressValue;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("null, \"indeterminate\" or an integer 0-100")
            }

            fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(ProgressValue::Unknown)
            }

            fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(ProgressValue::Unknown)
            }

            fn visit_some<D: Deserializer<'de>>(self, d: D) -> Result<Self::Value, D::Error> {
                d.deserialize_any(self)
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                match v {
                    "indeterminate" => Ok(ProgressValue::Indeterminate),
                    other => Err(E::invalid_value(de::Unexpected::Str(other), &self)),
                }
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                if v <= 100 {
                    Ok(ProgressValue::Percent(v as u8))
                } else {
                    Err(E::invalid_value(de::Unexpected::Unsigned(v), &self))
                }
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                if (0..=100).contains(&v) {
                    Ok(ProgressValue::Percent(v as u8))
                } else {
                    Err(E::invalid_value(de::Unexpected::Signed(v), &self))
                }
            }
        }

        deserializer.deserialize_any(ProgressVisitor)
    }
}

/// The externally observable state of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub status: ProgressStatus,
    pub icon: String,
    pub title: String,
    pub message: String,
    pub progress: ProgressValue,
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<Severity>,
    pub updated_at: DateTime<Utc>,
}

impl TaskProgress {
    pub fn new(
        status: ProgressStatus,
        icon: impl Into<String>,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            status,
            icon: icon.into(),
            title: title.into(),
            message: message.into(),
            progress: ProgressValue::Unknown,
            done: false,
            variant: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_progress(mut self, progress: ProgressValue) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_variant(mut self, variant: Severity) -> Self {
        self.variant = Some(variant);
        self
    }

    /// Mark terminal: `done = true` and progress pinned at 100.
    pub fn finished(mut self) -> Self {
        self.done = true;
        self.progress = ProgressValue::Percent(100);
        self
    }
}

/// Write handle for one task's progress record.
///
/// Held by the worker executing the task; no other writer exists for the
/// same `(user_id, task_id)`.
pub struct ProgressReporter {
    store: Arc<dyn Database>,
    user_id: String,
    task_id: String,
}

impl ProgressReporter {
    pub fn new(
        store: Arc<dyn Database>,
        user_id: impl Into<String>,
        task_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            user_id: user_id.into(),
            task_id: task_id.into(),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Write a new state. Returns `false` if the record was already done.
    pub async fn update(&self, progress: TaskProgress) -> Result<bool, DatabaseError> {
        let done = progress.done;
        let status = progress.status;
        let written = self
            .store
            .put_progress(&self.user_id, &self.task_id, &progress)
            .await?;

        debug!(
            user_id = %self.user_id,
            task_id = %self.task_id,
            status = status.as_str(),
            done,
            written,
            "Progress updated"
        );
        Ok(written)
    }

    /// Current record as stored.
    pub async fn current(&self) -> Result<Option<TaskProgress>, DatabaseError> {
        self.store.get_progress(&self.user_id, &self.task_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;

    #[test]
    fn progress_value_json_shapes() {
        assert_eq!(serde_json::to_string(&ProgressValue::Unknown).unwrap(), "null");
        assert_eq!(
            serde_json::to_string(&ProgressValue::Indeterminate).unwrap(),
            "\"indeterminate\""
        );
        assert_eq!(serde_json::to_string(&ProgressValue::Percent(42)).unwrap(), "42");

        let parsed: ProgressValue = serde_json::from_str("null").unwrap();
        assert_eq!(parsed, ProgressValue::Unknown);
        let parsed: ProgressValue = serde_json::from_str("\"indeterminate\"").unwrap();
        assert_eq!(parsed, ProgressValue::Indeterminate);
        let parsed: ProgressValue = serde_json::from_str("100").unwrap();
        assert_eq!(parsed, ProgressValue::Percent(100));

        assert!(serde_json::from_str::<ProgressValue>("101").is_err());
        assert!(serde_json::from_str::<ProgressValue>("\"halfway\"").is_err());
    }

    #[test]
    fn percent_is_clamped() {
        assert_eq!(ProgressValue::percent(250), ProgressValue::Percent(100));
    }

    #[test]
    fn record_json_omits_missing_variant() {
        let record = TaskProgress::new(ProgressStatus::Queued, "schedule", "Queued", "waiting")
            .with_progress(ProgressValue::Indeterminate);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], "queued");
        assert_eq!(json["progress"], "indeterminate");
        assert_eq!(json["done"], false);
        assert!(json.get("variant").is_none());
    }

    #[tokio::test]
    async fn record_is_frozen_once_done() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let reporter = ProgressReporter::new(Arc::clone(&db), "user-1", "task-1");

        assert!(reporter.current().await.unwrap().is_none());

        let running = TaskProgress::new(ProgressStatus::Running, "sync", "Running", "CI")
            .with_progress(ProgressValue::Indeterminate);
        assert!(reporter.update(running).await.unwrap());

        let done = TaskProgress::new(ProgressStatus::Completed, "check", "Done", "ok").finished();
        assert!(reporter.update(done).await.unwrap());

        let late = TaskProgress::new(ProgressStatus::Failed, "error", "Late", "ignored").finished();
        assert!(!reporter.update(late).await.unwrap());

        let stored = reporter.current().await.unwrap().unwrap();
        assert_eq!(stored.status, ProgressStatus::Completed);
        assert_eq!(stored.progress, ProgressValue::Percent(100));
    }
}
