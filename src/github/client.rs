//! reqwest-backed GitHub REST client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, HeaderMap, RETRY_AFTER};
use serde::de::DeserializeOwned;

use crate::error::GithubError;
use crate::github::GithubApi;
use crate::github::model::{Credential, Issue, Label, RepoRef, WorkflowRun, WorkflowRunList};

pub const DEFAULT_API_URL: &str = "https://api.github.com";

const USER_AGENT: &str = concat!("report-jobs/", env!("CARGO_PKG_VERSION"));
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// GitHub REST API over HTTPS.
pub struct GithubClient {
    base_url: String,
    client: reqwest::Client,
}

impl GithubClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, GithubError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| GithubError::RequestFailed {
                endpoint: base_url.clone(),
                reason: e.to_string(),
            })?;
        Ok(Self { base_url, client })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// GET `path` and decode JSON. `Ok(None)` for 404 / 410.
    async fn get_json<T: DeserializeOwned>(
        &self,
        credential: &Credential,
        path: &str,
    ) -> Result<Option<T>, GithubError> {
        let url = format!("{}{path}", self.base_url);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(credential.expose())
            .header(ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .send()
            .await
            .map_err(|e| GithubError::RequestFailed {
                endpoint: path.to_string(),
                reason: e.without_url().to_string(),
            })?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Ok(None);
        }
        if is_rate_limited(status, resp.headers()) {
            return Err(GithubError::RateLimited {
                retry_after: retry_after(resp.headers()),
            });
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GithubError::Status {
                endpoint: path.to_string(),
                status: status.as_u16(),
                body: truncate(&body, 512),
            });
        }

        resp.json::<T>()
            .await
            .map(Some)
            .map_err(|e| GithubError::InvalidResponse {
                endpoint: path.to_string(),
                reason: e.without_url().to_string(),
            })
    }

    /// Like `get_json`, but a missing resource is an error.
    async fn get_required<T: DeserializeOwned>(
        &self,
        credential: &Credential,
        path: &str,
    ) -> Result<T, GithubError> {
        self.get_json(credential, path)
            .await?
            .ok_or_else(|| GithubError::Status {
                endpoint: path.to_string(),
                status: StatusCode::NOT_FOUND.as_u16(),
                body: String::new(),
            })
    }
}

#[async_trait]
impl GithubApi for GithubClient {
    async fn list_workflow_runs(
        &self,
        credential: &Credential,
        repo: &RepoRef,
        per_page: u32,
    ) -> Result<Vec<WorkflowRun>, GithubError> {
        let path = format!(
            "/repos/{}/{}/actions/runs?per_page={per_page}",
            repo.owner, repo.name
        );
        let list: WorkflowRunList = self.get_required(credential, &path).await?;
        Ok(list.workflow_runs)
    }

    async fn get_workflow_run(
        &self,
        credential: &Credential,
        repo: &RepoRef,
        run_id: u64,
    ) -> Result<WorkflowRun, GithubError> {
        let path = format!("/repos/{}/{}/actions/runs/{run_id}", repo.owner, repo.name);
        self.get_required(credential, &path).await
    }

    async fn get_issue(
        &self,
        credential: &Credential,
        repo: &RepoRef,
        number: u64,
    ) -> Result<Option<Issue>, GithubError> {
        let path = format!("/repos/{}/{}/issues/{number}", repo.owner, repo.name);
        self.get_json(credential, &path).await
    }

    async fn list_labels(
        &self,
        credential: &Credential,
        repo: &RepoRef,
    ) -> Result<Vec<Label>, GithubError> {
        let path = format!("/repos/{}/{}/labels?per_page=100", repo.owner, repo.name);
        self.get_required(credential, &path).await
    }
}

fn is_rate_limited(status: StatusCode, headers: &HeaderMap) -> bool {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return true;
    }
    status == StatusCode::FORBIDDEN
        && (headers.contains_key(RETRY_AFTER)
            || headers
                .get("x-ratelimit-remaining")
                .and_then(|v| v.to_str().ok())
                == Some("0"))
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}
