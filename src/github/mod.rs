//! Outbound GitHub-like REST API used by the workflow monitor.

pub mod client;
pub mod logfmt;
pub mod model;

use async_trait::async_trait;

use crate::error::GithubError;

pub use client::GithubClient;
pub use model::{Credential, Issue, Label, RepoRef, WorkflowRun};

/// Read-only GitHub operations, each authorised with the caller's credential.
#[async_trait]
pub trait GithubApi: Send + Sync {
    /// Most recent workflow runs of the repository.
    async fn list_workflow_runs(
        &self,
        credential: &Credential,
        repo: &RepoRef,
        per_page: u32,
    ) -> Result<Vec<WorkflowRun>, GithubError>;

    async fn get_workflow_run(
        &self,
        credential: &Credential,
        repo: &RepoRef,
        run_id: u64,
    ) -> Result<WorkflowRun, GithubError>;

    /// `Ok(None)` when the issue no longer exists.
    async fn get_issue(
        &self,
        credential: &Credential,
        repo: &RepoRef,
        number: u64,
    ) -> Result<Option<Issue>, GithubError>;

    async fn list_labels(
        &self,
        credential: &Credential,
        repo: &RepoRef,
    ) -> Result<Vec<Label>, GithubError>;
}
