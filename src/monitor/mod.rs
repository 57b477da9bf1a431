//! GitHub workflow monitor, the processor for "monitor this issue's CI" jobs.
//!
//! One job walks a strictly sequential path:
//!
//! ```text
//! Queued ─▶ (initial delay) ─▶ Searching ─┬─▶ RunNotFound            (warning)
//!                                         └─▶ Running ─▶ Fetching ─┬─▶ Deleted          (completed)
//!                                                                  ├─▶ Unknown          (warning)
//!                                                                  └─▶ label evaluation
//!                                                                        ├─▶ Validated        (completed)
//!                                                                        ├─▶ InvalidLabels    (warning)
//!                                                                        ├─▶ DeleteIncomplete (warning)
//!                                                                        └─▶ unknown operation (policy)
//! any API / store error ─▶ Failed (on the last queue attempt) and the error is returned
//! ```
//!
//! Every terminal branch writes exactly one `done` progress record and one
//! notification linking back to the issue. A record that is already `done`
//! makes a redelivered job a no-op.

pub mod job;
pub mod labels;
pub mod poll;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::collab::{ParsedReport, ReportCache, ReportParser};
use crate::config::{MonitorConfig, UnknownOperationPolicy};
use crate::error::{Error, MonitorError};
use crate::github::{GithubApi, Issue, RepoRef, WorkflowRun};
use crate::notification::{Notification, Notifier, Severity};
use crate::progress::{ProgressReporter, ProgressStatus, ProgressValue, TaskProgress};
use crate::queue::Job;
use crate::store::Database;
use crate::worker::JobProcessor;

pub use job::{
    MONITOR_JOB_NAME, MONITOR_QUEUE, MonitorJob, Operation, Workflow, run_matches,
};
pub use labels::LabelDescriptions;
pub use poll::poll_until;

const INVALID_PREFIX: &str = "invalid:";
const NOTE_PREFIX: &str = "note:";
const ISSUE_LINK_LABEL: &str = "View issue";

/// How a monitor job ended (when it did not fail).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorOutcome {
    /// No matching run appeared within the search attempts.
    RunNotFound,
    /// Issue is gone after a delete operation.
    Deleted,
    /// Issue is gone without a delete operation.
    Unknown,
    /// Validation passed.
    Validated,
    /// Validation flagged `invalid:` labels.
    InvalidLabels { labels: Vec<String> },
    /// Delete operation ran but the issue still exists.
    DeleteIncomplete,
    /// Operation not recognised; handled per policy.
    UnrecognizedOperation { operation: String },
    /// Progress record was already terminal; nothing was done.
    AlreadyFinished,
}

/// Collaborators of the monitor, injected at construction.
#[derive(Clone)]
pub struct MonitorDeps {
    pub github: Arc<dyn GithubApi>,
    pub store: Arc<dyn Database>,
    pub parser: Arc<dyn ReportParser>,
    pub cache: Arc<dyn ReportCache>,
    pub labels: Arc<LabelDescriptions>,
    pub clock: Arc<dyn Clock>,
}

pub struct GithubWorkflowMonitor {
    deps: MonitorDeps,
    notifier: Notifier,
    config: MonitorConfig,
    default_repo: RepoRef,
}

/// Per-run context threaded through the states.
struct Run<'a> {
    job: &'a MonitorJob,
    repo: &'a RepoRef,
    progress: ProgressReporter,
}

impl GithubWorkflowMonitor {
    pub fn new(deps: MonitorDeps, config: MonitorConfig, default_repo: RepoRef) -> Self {
        let notifier = Notifier::new(Arc::clone(&deps.store));
        Self {
            deps,
            notifier,
            config,
            default_repo,
        }
    }

    /// Monitor one issue. `final_attempt` decides whether a failure is
    /// terminal for the progress record or left open for the retry.
    pub async fn run(&self, job: &MonitorJob, final_attempt: bool) -> Result<MonitorOutcome, Error> {
        let run = Run {
            job,
            repo: job.repo_or(&self.default_repo),
            progress: ProgressReporter::new(
                Arc::clone(&self.deps.store),
                job.user_id.clone(),
                job.task_id.clone(),
            ),
        };

        if let Some(existing) = run.progress.current().await? {
            if existing.done {
                info!(task_id = %job.task_id, "Task already finished, skipping redelivered job");
                return Ok(MonitorOutcome::AlreadyFinished);
            }
        }

        match self.execute(&run).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.fail(&run, &e, final_attempt).await;
                Err(e)
            }
        }
    }

    async fn execute(&self, run: &Run<'_>) -> Result<MonitorOutcome, Error> {
        let job = run.job;

        run.progress
            .update(
                TaskProgress::new(
                    ProgressStatus::Queued,
                    "schedule",
                    "Queued",
                    format!("Waiting for the workflow for issue #{} to start", job.issue_number),
                )
                .with_progress(ProgressValue::Indeterminate),
            )
            .await?;

        self.deps.clock.sleep(self.config.initial_delay).await;

        let Some(found) = self.search_run(run).await? else {
            return self.run_not_found(run).await;
        };

        info!(
            task_id = %job.task_id,
            issue = job.issue_number,
            run_id = found.id,
            "Workflow run found"
        );
        run.progress
            .update(
                TaskProgress::new(
                    ProgressStatus::Running,
                    "sync",
                    "Workflow running",
                    found.display_name(),
                )
                .with_progress(ProgressValue::Indeterminate)
                .with_variant(Severity::Ongoing),
            )
            .await?;

        self.wait_for_completion(run, &found).await?;

        let issue = self
            .deps
            .github
            .get_issue(&job.github_token, run.repo, job.issue_number)
            .await?;

        let Some(issue) = issue else {
            return if job.is_delete() {
                self.deleted(run).await
            } else {
                self.unknown(run).await
            };
        };

        let parsed = self.parse_issue(run, &issue);

        match &job.workflow {
            Workflow::Validation => self.evaluate_labels(run, &issue, parsed).await,
            Workflow::Operations {
                operation: Operation::Delete,
            } => self.delete_incomplete(run).await,
            Workflow::Operations {
                operation: Operation::Other(op),
            } => self.unrecognized_operation(run, op).await,
        }
    }

    async fn search_run(&self, run: &Run<'_>) -> Result<Option<WorkflowRun>, Error> {
        let job = run.job;
        let github = &self.deps.github;
        poll_until(
            self.deps.clock.as_ref(),
            self.config.search_attempts,
            self.config.poll_interval,
            |attempt| async move {
                let runs = github
                    .list_workflow_runs(&job.github_token, run.repo, self.config.runs_per_page)
                    .await?;
                let found = runs.into_iter().find(|r| run_matches(r, job.issue_number));
                if found.is_none() {
                    debug!(issue = job.issue_number, attempt, "No matching workflow run yet");
                }
                Ok::<_, Error>(found)
            },
        )
        .await
    }

    async fn wait_for_completion(&self, run: &Run<'_>, found: &WorkflowRun) -> Result<(), Error> {
        if found.is_completed() {
            return Ok(());
        }
        let job = run.job;
        let github = &self.deps.github;
        let completed = poll_until(
            self.deps.clock.as_ref(),
            self.config.status_attempts,
            self.config.poll_interval,
            |_| async move {
                let current = github
                    .get_workflow_run(&job.github_token, run.repo, found.id)
                    .await?;
                Ok::<_, Error>(current.is_completed().then_some(current))
            },
        )
        .await?;

        match completed {
            Some(done) => debug!(
                run_id = done.id,
                conclusion = ?done.conclusion,
                "Workflow run completed"
            ),
            None => warn!(
                run_id = found.id,
                issue = job.issue_number,
                "Workflow run still not completed, fetching results anyway"
            ),
        }
        Ok(())
    }

    fn parse_issue(&self, run: &Run<'_>, issue: &Issue) -> Option<ParsedReport> {
        let body = issue.body.as_deref().filter(|b| !b.trim().is_empty())?;
        match self.deps.parser.parse(body) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                warn!(issue = run.job.issue_number, "Could not parse issue body: {:#}", e);
                None
            }
        }
    }

    async fn evaluate_labels(
        &self,
        run: &Run<'_>,
        issue: &Issue,
        parsed: Option<ParsedReport>,
    ) -> Result<MonitorOutcome, Error> {
        let job = run.job;
        let github = self.deps.github.as_ref();

        let mut invalid = Vec::new();
        for label in issue.labels_with_prefix(INVALID_PREFIX) {
            let description = self
                .deps
                .labels
                .describe_or_fallback(github, &job.github_token, run.repo, label)
                .await;
            self.notify(
                run,
                Notification::new(
                    Severity::Warning,
                    "report_problem",
                    format!("Issue #{} needs changes", job.issue_number),
                    description.clone(),
                ),
            )
            .await;
            invalid.push((label.name.clone(), description));
        }

        for label in issue.labels_with_prefix(NOTE_PREFIX) {
            let description = self
                .deps
                .labels
                .describe_or_fallback(github, &job.github_token, run.repo, label)
                .await;
            self.notify(
                run,
                Notification::new(
                    Severity::Info,
                    "info",
                    format!("Note on issue #{}", job.issue_number),
                    description,
                ),
            )
            .await;
        }

        if !invalid.is_empty() {
            let summary = invalid
                .iter()
                .map(|(_, d)| d.as_str())
                .collect::<Vec<_>>()
                .join("\n");
            run.progress
                .update(
                    TaskProgress::new(
                        ProgressStatus::Warning,
                        "report_problem",
                        "Report needs changes",
                        summary,
                    )
                    .with_variant(Severity::Warning)
                    .finished(),
                )
                .await?;
            info!(
                task_id = %job.task_id,
                invalid = invalid.len(),
                "Validation flagged invalid labels"
            );
            return Ok(MonitorOutcome::InvalidLabels {
                labels: invalid.into_iter().map(|(name, _)| name).collect(),
            });
        }

        run.progress
            .update(
                TaskProgress::new(
                    ProgressStatus::Completed,
                    "check_circle",
                    "Report validated",
                    format!("Issue #{} passed validation", job.issue_number),
                )
                .with_variant(Severity::Positive)
                .finished(),
            )
            .await?;
        self.notify(
            run,
            Notification::new(
                Severity::Positive,
                "check_circle",
                "Report validated",
                format!("Thanks! Issue #{} passed validation.", job.issue_number),
            ),
        )
        .await;

        self.refresh_cache(run, parsed.as_ref()).await;
        Ok(MonitorOutcome::Validated)
    }

    async fn refresh_cache(&self, run: &Run<'_>, parsed: Option<&ParsedReport>) {
        let Some(report) = parsed.filter(|p| p.has_game()) else {
            debug!(issue = run.job.issue_number, "No game identified, skipping cache refresh");
            return;
        };
        let result = self
            .deps
            .cache
            .refresh_game(report.app_id.as_deref(), report.game_name.as_deref())
            .await;
        match result {
            Ok(()) => debug!(app_id = ?report.app_id, "Report cache refreshed"),
            Err(e) => warn!(
                app_id = ?report.app_id,
                game_name = ?report.game_name,
                "Report cache refresh failed: {:#}",
                e
            ),
        }
    }

    async fn run_not_found(&self, run: &Run<'_>) -> Result<MonitorOutcome, Error> {
        let job = run.job;
        warn!(
            task_id = %job.task_id,
            issue = job.issue_number,
            attempts = self.config.search_attempts,
            "No workflow run found for issue"
        );
        self.terminal(
            run,
            ProgressStatus::Warning,
            Severity::Warning,
            "pending",
            "Workflow pending",
            format!(
                "The workflow for issue #{} has not started yet. It may still be queued on GitHub.",
                job.issue_number
            ),
        )
        .await?;
        Ok(MonitorOutcome::RunNotFound)
    }

    async fn deleted(&self, run: &Run<'_>) -> Result<MonitorOutcome, Error> {
        self.terminal(
            run,
            ProgressStatus::Completed,
            Severity::Positive,
            "delete",
            "Delete complete",
            format!("Issue #{} was deleted.", run.job.issue_number),
        )
        .await?;
        Ok(MonitorOutcome::Deleted)
    }

    async fn unknown(&self, run: &Run<'_>) -> Result<MonitorOutcome, Error> {
        warn!(issue = run.job.issue_number, "Issue not found after workflow run");
        self.terminal(
            run,
            ProgressStatus::Warning,
            Severity::Warning,
            "help",
            "Issue not found",
            format!(
                "Issue #{} no longer exists, so its result is unknown.",
                run.job.issue_number
            ),
        )
        .await?;
        Ok(MonitorOutcome::Unknown)
    }

    async fn delete_incomplete(&self, run: &Run<'_>) -> Result<MonitorOutcome, Error> {
        self.terminal(
            run,
            ProgressStatus::Warning,
            Severity::Warning,
            "warning",
            "Delete incomplete",
            format!(
                "The delete workflow finished but issue #{} still exists.",
                run.job.issue_number
            ),
        )
        .await?;
        Ok(MonitorOutcome::DeleteIncomplete)
    }

    async fn unrecognized_operation(
        &self,
        run: &Run<'_>,
        operation: &str,
    ) -> Result<MonitorOutcome, Error> {
        let job = run.job;
        let outcome = MonitorOutcome::UnrecognizedOperation {
            operation: operation.to_string(),
        };
        match self.config.unknown_operation {
            UnknownOperationPolicy::Complete => {
                self.terminal(
                    run,
                    ProgressStatus::Completed,
                    Severity::Info,
                    "info",
                    "Operation finished",
                    format!(
                        "The '{}' workflow for issue #{} finished.",
                        if operation.is_empty() { "<none>" } else { operation },
                        job.issue_number
                    ),
                )
                .await?;
                Ok(outcome)
            }
            UnknownOperationPolicy::Fail => Err(MonitorError::UnknownOperation {
                operation: operation.to_string(),
                issue_number: job.issue_number,
            }
            .into()),
            UnknownOperationPolicy::Ignore => {
                warn!(
                    task_id = %job.task_id,
                    operation = %operation,
                    "Unrecognized operation, leaving progress open"
                );
                Ok(outcome)
            }
        }
    }

    /// Terminal progress write plus the matching notification.
    async fn terminal(
        &self,
        run: &Run<'_>,
        status: ProgressStatus,
        variant: Severity,
        icon: &str,
        title: &str,
        message: String,
    ) -> Result<(), Error> {
        run.progress
            .update(
                TaskProgress::new(status, icon, title, message.clone())
                    .with_variant(variant)
                    .finished(),
            )
            .await?;
        self.notify(run, Notification::new(variant, icon, title, message))
            .await;
        Ok(())
    }

    async fn notify(&self, run: &Run<'_>, notification: Notification) {
        let notification = notification.with_link(run.job.issue_url.clone(), ISSUE_LINK_LABEL);
        self.notifier.send(&run.job.user_id, notification).await;
    }

    async fn fail(&self, run: &Run<'_>, err: &Error, final_attempt: bool) {
        let job = run.job;
        let permanent = matches!(err, Error::Monitor(MonitorError::UnknownOperation { .. }));

        if !final_attempt && !permanent {
            warn!(task_id = %job.task_id, error = %err, "Monitor attempt failed, will retry");
            let retrying = TaskProgress::new(
                ProgressStatus::Running,
                "sync_problem",
                "Retrying",
                format!("Checking issue #{} failed, retrying shortly", job.issue_number),
            )
            .with_progress(ProgressValue::Indeterminate)
            .with_variant(Severity::Warning);
            if let Err(e) = run.progress.update(retrying).await {
                error!(task_id = %job.task_id, "Failed to write retry progress: {}", e);
            }
            return;
        }

        error!(task_id = %job.task_id, issue = job.issue_number, error = %err, "Monitor job failed");
        let failed = TaskProgress::new(
            ProgressStatus::Failed,
            "error",
            "Check failed",
            format!("Something went wrong while checking issue #{}: {err}", job.issue_number),
        )
        .with_variant(Severity::Negative)
        .finished();
        if let Err(e) = run.progress.update(failed).await {
            error!(task_id = %job.task_id, "Failed to write failure progress: {}", e);
        }
        self.notify(
            run,
            Notification::new(
                Severity::Negative,
                "error",
                "Check failed",
                format!("Something went wrong while checking issue #{}.", job.issue_number),
            ),
        )
        .await;
    }
}

#[async_trait]
impl JobProcessor for GithubWorkflowMonitor {
    async fn process(&self, job: &Job) -> Result<(), Error> {
        let payload: MonitorJob = job.payload_as()?;
        let final_attempt = job.attempts >= job.max_attempts;
        info!(
            task_id = %payload.task_id,
            user_id = %payload.user_id,
            issue = payload.issue_number,
            workflow = ?payload.workflow,
            "Monitoring issue workflow"
        );

        let outcome = self.run(&payload, final_attempt).await?;
        info!(task_id = %payload.task_id, outcome = ?outcome, "Monitor job finished");
        Ok(())
    }
}
