//! Typed payload of a monitor job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::github::{Credential, RepoRef, WorkflowRun};

/// Queue that carries monitor jobs.
pub const MONITOR_QUEUE: &str = "github-monitor";
/// Job name of monitor jobs.
pub const MONITOR_JOB_NAME: &str = "monitor-issue";

/// Events that may have triggered a report workflow.
pub const ALLOWED_EVENTS: &[&str] = &["issues", "issue_comment"];

/// Correlation key carried in workflow run names.
pub const TRIGGER_KEY: &str = "trigger_issue_number";

/// Operation requested by an `operations` workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Delete,
    #[serde(untagged)]
    Other(String),
}

impl Default for Operation {
    fn default() -> Self {
        Self::Other(String::new())
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Delete => f.write_str("delete"),
            Self::Other(op) if op.is_empty() => f.write_str("<none>"),
            Self::Other(op) => f.write_str(op),
        }
    }
}

/// Which workflow the issue triggered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "workflow_type", rename_all = "snake_case")]
pub enum Workflow {
    /// Report validation: label evaluation decides the outcome.
    Validation,
    /// Maintenance operation on an existing report.
    Operations {
        #[serde(default)]
        operation: Operation,
    },
}

/// Everything a worker needs to monitor one issue's workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorJob {
    pub task_id: String,
    pub user_id: String,
    pub issue_number: u64,
    pub issue_url: String,
    pub created_at: DateTime<Utc>,
    /// Repository override; the configured default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<RepoRef>,
    #[serde(flatten)]
    pub workflow: Workflow,
    pub github_token: Credential,
}

impl MonitorJob {
    pub fn repo_or<'a>(&'a self, default: &'a RepoRef) -> &'a RepoRef {
        self.repository.as_ref().unwrap_or(default)
    }

    pub fn is_delete(&self) -> bool {
        matches!(
            self.workflow,
            Workflow::Operations {
                operation: Operation::Delete
            }
        )
    }
}

/// Whether `run` is the workflow run triggered by `issue_number`.
pub fn run_matches(run: &WorkflowRun, issue_number: u64) -> bool {
    if !ALLOWED_EVENTS.contains(&run.event.as_str()) {
        return false;
    }
    run.correlation_keys()
        .get(TRIGGER_KEY)
        .and_then(|v| v.trim().parse::<u64>().ok())
        == Some(issue_number)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(event: &str, name: &str) -> WorkflowRun {
        WorkflowRun {
            id: 1,
            name: Some(name.into()),
            display_title: None,
            status: Some("queued".into()),
            conclusion: None,
            event: event.into(),
            html_url: None,
        }
    }

    #[test]
    fn matches_allowed_event_and_issue_number() {
        let name = r#"name="Validate" trigger_issue_number="42""#;
        assert!(run_matches(&run("issues", name), 42));
        assert!(run_matches(&run("issue_comment", name), 42));
        assert!(!run_matches(&run("issues", name), 43));
    }

    #[test]
    fn rejects_matching_number_with_disallowed_event() {
        let name = r#"name="Validate" trigger_issue_number="42""#;
        assert!(!run_matches(&run("push", name), 42));
        assert!(!run_matches(&run("workflow_dispatch", name), 42));
    }

    #[test]
    fn rejects_runs_without_correlation_key() {
        assert!(!run_matches(&run("issues", "CI"), 42));
        assert!(!run_matches(&run("issues", r#"trigger_issue_number="42"#), 42));
    }

    #[test]
    fn payload_variants_deserialize() {
        let validation: MonitorJob = serde_json::from_value(serde_json::json!({
            "task_id": "t-1",
            "user_id": "u-1",
            "issue_number": 42,
            "issue_url": "https://github.com/o/r/issues/42",
            "created_at": "2026-01-01T00:00:00Z",
            "workflow_type": "validation",
            "github_token": "ghp_x",
        }))
        .unwrap();
        assert_eq!(validation.workflow, Workflow::Validation);
        assert!(validation.repository.is_none());
        assert!(!validation.is_delete());

        let delete: MonitorJob = serde_json::from_value(serde_json::json!({
            "task_id": "t-2",
            "user_id": "u-1",
            "issue_number": 7,
            "issue_url": "https://github.com/o/r/issues/7",
            "created_at": "2026-01-01T00:00:00Z",
            "repository": "other/repo",
            "workflow_type": "operations",
            "operation": "delete",
            "github_token": "ghp_x",
        }))
        .unwrap();
        assert!(delete.is_delete());
        assert_eq!(delete.repository, Some(RepoRef::new("other", "repo")));

        let other: MonitorJob = serde_json::from_value(serde_json::json!({
            "task_id": "t-3",
            "user_id": "u-1",
            "issue_number": 8,
            "issue_url": "https://github.com/o/r/issues/8",
            "created_at": "2026-01-01T00:00:00Z",
            "workflow_type": "operations",
            "operation": "merge",
            "github_token": "ghp_x",
        }))
        .unwrap();
        assert_eq!(
            other.workflow,
            Workflow::Operations {
                operation: Operation::Other("merge".into())
            }
        );
    }

    #[test]
    fn payload_serializes_flat_and_debug_hides_token() {
        let job = MonitorJob {
            task_id: "t".into(),
            user_id: "u".into(),
            issue_number: 1,
            issue_url: "https://github.com/o/r/issues/1".into(),
            created_at: Utc::now(),
            repository: None,
            workflow: Workflow::Operations {
                operation: Operation::Delete,
            },
            github_token: Credential::new("ghp_secret"),
        };
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["workflow_type"], "operations");
        assert_eq!(json["operation"], "delete");
        assert!(json.get("repository").is_none());
        assert!(!format!("{job:?}").contains("ghp_secret"));
    }
}
