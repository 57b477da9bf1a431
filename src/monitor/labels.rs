//! Per-repository cache of label descriptions with a time-to-live.
//!
//! Owned by whoever builds the monitor and passed in explicitly; there is
//! no process-wide instance.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::github::{Credential, GithubApi, Label, RepoRef};

/// Shown when a label has no description anywhere.
pub const FALLBACK_DESCRIPTION: &str =
    "This report needs attention. Check the labels on the issue for details.";

struct Entry {
    fetched_at: Instant,
    descriptions: HashMap<String, String>,
}

pub struct LabelDescriptions {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<RepoRef, Entry>>,
}

impl LabelDescriptions {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Description for `label`, or `None` if nothing is known about it.
    ///
    /// Looks in the repository's cached label list first (refetching it once
    /// stale), then at the description embedded in the issue's label.
    /// Lookup failures are logged and treated as misses.
    pub async fn describe(
        &self,
        api: &dyn GithubApi,
        credential: &Credential,
        repo: &RepoRef,
        label: &Label,
    ) -> Option<String> {
        let now = self.clock.now();
        let fresh = self
            .entries
            .lock()
            .await
            .get(repo)
            .is_some_and(|e| now.saturating_duration_since(e.fetched_at) < self.ttl);

        // Fetch without holding the lock so other repositories are not stalled.
        if !fresh {
            match api.list_labels(credential, repo).await {
                Ok(labels) => {
                    debug!(repo = %repo, count = labels.len(), "Label descriptions refreshed");
                    let descriptions = labels
                        .into_iter()
                        .filter_map(|l| {
                            let desc = l.description?.trim().to_string();
                            (!desc.is_empty()).then_some((l.name, desc))
                        })
                        .collect();
                    self.entries.lock().await.insert(
                        repo.clone(),
                        Entry {
                            fetched_at: now,
                            descriptions,
                        },
                    );
                }
                Err(e) => {
                    warn!(repo = %repo, label = %label.name, "Label lookup failed: {}", e);
                }
            }
        }

        self.entries
            .lock()
            .await
            .get(repo)
            .and_then(|e| e.descriptions.get(&label.name).cloned())
            .or_else(|| {
                label
                    .description
                    .as_deref()
                    .map(str::trim)
                    .filter(|d| !d.is_empty())
                    .map(str::to_string)
            })
    }

    /// `describe`, falling back to [`FALLBACK_DESCRIPTION`].
    pub async fn describe_or_fallback(
        &self,
        api: &dyn GithubApi,
        credential: &Credential,
        repo: &RepoRef,
        label: &Label,
    ) -> String {
        self.describe(api, credential, repo, label)
            .await
            .unwrap_or_else(|| FALLBACK_DESCRIPTION.to_string())
    }

    pub async fn invalidate(&self, repo: &RepoRef) {
        self.entries.lock().await.remove(repo);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::clock::ManualClock;
    use crate::error::GithubError;
    use crate::github::{Issue, WorkflowRun};

    struct LabelsOnly {
        calls: AtomicUsize,
        fail: AtomicBool,
        /// Holds label listings for the repository named `slow`.
        gate: tokio::sync::Notify,
    }

    #[async_trait]
    impl GithubApi for LabelsOnly {
        async fn list_workflow_runs(
            &self,
            _: &Credential,
            _: &RepoRef,
            _: u32,
        ) -> Result<Vec<WorkflowRun>, GithubError> {
            Ok(Vec::new())
        }

        async fn get_workflow_run(
            &self,
            _: &Credential,
            _: &RepoRef,
            run_id: u64,
        ) -> Result<WorkflowRun, GithubError> {
            Err(GithubError::InvalidResponse {
                endpoint: format!("runs/{run_id}"),
                reason: "unused".into(),
            })
        }

        async fn get_issue(
            &self,
            _: &Credential,
            _: &RepoRef,
            _: u64,
        ) -> Result<Option<Issue>, GithubError> {
            Ok(None)
        }

        async fn list_labels(
            &self,
            _: &Credential,
            repo: &RepoRef,
        ) -> Result<Vec<Label>, GithubError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if repo.name == "slow" {
                self.gate.notified().await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(GithubError::RateLimited { retry_after: None });
            }
            Ok(vec![
                Label {
                    name: "invalid:missing-appid".into(),
                    description: Some("The report is missing a Steam app id.".into()),
                },
                Label {
                    name: "note:blank".into(),
                    description: Some("  ".into()),
                },
            ])
        }
    }

    fn api() -> LabelsOnly {
        LabelsOnly {
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            gate: tokio::sync::Notify::new(),
        }
    }

    fn label(name: &str) -> Label {
        Label {
            name: name.into(),
            description: None,
        }
    }

    #[tokio::test]
    async fn cached_until_ttl_expires() {
        let clock = Arc::new(ManualClock::new());
        let cache = LabelDescriptions::new(Duration::from_secs(60), clock.clone());
        let api = api();
        let cred = Credential::new("t");
        let repo = RepoRef::new("o", "r");

        let desc = cache
            .describe(&api, &cred, &repo, &label("invalid:missing-appid"))
            .await;
        assert_eq!(desc.as_deref(), Some("The report is missing a Steam app id."));
        cache
            .describe(&api, &cred, &repo, &label("invalid:missing-appid"))
            .await;
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);

        clock.advance(Duration::from_secs(61));
        cache.describe(&api, &cred, &repo, &label("note:x")).await;
        assert_eq!(api.calls.load(Ordering::SeqCst), 2);

        cache.invalidate(&repo).await;
        cache.describe(&api, &cred, &repo, &label("note:x")).await;
        assert_eq!(api.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn misses_fall_back() {
        let clock = Arc::new(ManualClock::new());
        let cache = LabelDescriptions::new(Duration::from_secs(60), clock);
        let api = api();
        let cred = Credential::new("t");
        let repo = RepoRef::new("o", "r");

        assert!(cache.describe(&api, &cred, &repo, &label("note:blank")).await.is_none());
        assert_eq!(
            cache
                .describe_or_fallback(&api, &cred, &repo, &label("invalid:unknown"))
                .await,
            FALLBACK_DESCRIPTION
        );

        let embedded = Label {
            name: "invalid:unlisted".into(),
            description: Some("From the issue payload".into()),
        };
        assert_eq!(
            cache.describe(&api, &cred, &repo, &embedded).await.as_deref(),
            Some("From the issue payload")
        );
    }

    #[tokio::test]
    async fn lookup_failure_is_a_miss() {
        let clock = Arc::new(ManualClock::new());
        let cache = LabelDescriptions::new(Duration::from_secs(60), clock);
        let api = api();
        api.fail.store(true, Ordering::SeqCst);

        let desc = cache
            .describe(
                &api,
                &Credential::new("t"),
                &RepoRef::new("o", "r"),
                &label("invalid:missing-appid"),
            )
            .await;
        assert!(desc.is_none());
    }

    #[tokio::test]
    async fn slow_fetch_does_not_block_other_repositories() {
        let clock = Arc::new(ManualClock::new());
        let cache = Arc::new(LabelDescriptions::new(Duration::from_secs(60), clock));
        let api = Arc::new(api());

        let slow = tokio::spawn({
            let cache = Arc::clone(&cache);
            let api = Arc::clone(&api);
            async move {
                cache
                    .describe(
                        api.as_ref(),
                        &Credential::new("t"),
                        &RepoRef::new("o", "slow"),
                        &label("invalid:missing-appid"),
                    )
                    .await
            }
        });
        while api.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        let fast = tokio::time::timeout(
            Duration::from_secs(5),
            cache.describe(
                api.as_ref(),
                &Credential::new("t"),
                &RepoRef::new("o", "fast"),
                &label("invalid:missing-appid"),
            ),
        )
        .await
        .expect("lookup for another repository was blocked");
        assert_eq!(fast.as_deref(), Some("The report is missing a Steam app id."));

        api.gate.notify_one();
        let slow = slow.await.unwrap();
        assert_eq!(slow.as_deref(), Some("The report is missing a Steam app id."));
    }
}
