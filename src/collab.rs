//! Outbound collaborators of the monitor and scheduler: issue-body parsing
//! and the report cache that serves aggregated game data.
//!
//! Both are best-effort from the caller's point of view, so they return
//! `anyhow::Result` and callers log failures instead of escalating them.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Structured fields extracted from a report issue body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedReport {
    pub app_id: Option<String>,
    pub game_name: Option<String>,
    /// Every other non-empty field, keyed by normalised heading.
    pub fields: BTreeMap<String, String>,
}

impl ParsedReport {
    pub fn has_game(&self) -> bool {
        self.app_id.is_some() || self.game_name.is_some()
    }
}

/// Turns a raw issue body into structured report fields.
pub trait ReportParser: Send + Sync {
    fn parse(&self, body: &str) -> anyhow::Result<ParsedReport>;
}

/// Parser for GitHub issue-form bodies: `### Heading` lines, each followed
/// by its value. `_No response_` counts as empty.
#[derive(Debug, Clone, Default)]
pub struct IssueFormParser {
    required: Vec<String>,
}

const NO_RESPONSE: &str = "_No response_";

impl IssueFormParser {
    /// Fail parsing unless every field in `required` has a value.
    pub fn with_required(mut self, fields: &[&str]) -> Self {
        self.required = fields.iter().map(|f| f.to_string()).collect();
        self
    }
}

fn field_key(heading: &str) -> String {
    let mut key = String::with_capacity(heading.len());
    for c in heading.trim().chars() {
        if c.is_ascii_alphanumeric() {
            key.push(c.to_ascii_lowercase());
        } else if !key.ends_with('_') {
            key.push('_');
        }
    }
    key.trim_matches('_').to_string()
}

impl ReportParser for IssueFormParser {
    fn parse(&self, body: &str) -> anyhow::Result<ParsedReport> {
        let mut sections: Vec<(String, Vec<&str>)> = Vec::new();
        for line in body.lines() {
            if let Some(heading) = line.strip_prefix("### ") {
                sections.push((field_key(heading), Vec::new()));
            } else if let Some((_, lines)) = sections.last_mut() {
                lines.push(line);
            }
        }
        if sections.is_empty() {
            bail!("issue body has no form sections");
        }

        let mut report = ParsedReport::default();
        for (key, lines) in sections {
            let value = lines.join("\n").trim().to_string();
            if key.is_empty() || value.is_empty() || value == NO_RESPONSE {
                continue;
            }
            match key.as_str() {
                "app_id" => report.app_id = Some(value),
                "game_name" => report.game_name = Some(value),
                _ => {
                    report.fields.insert(key, value);
                }
            }
        }

        for field in &self.required {
            let present = match field.as_str() {
                "app_id" => report.app_id.is_some(),
                "game_name" => report.game_name.is_some(),
                other => report.fields.contains_key(other),
            };
            if !present {
                bail!("required field '{field}' is missing");
            }
        }
        Ok(report)
    }
}

/// The cache of aggregated report data served to the website.
#[async_trait]
pub trait ReportCache: Send + Sync {
    /// Force a re-fetch of one game's reports.
    async fn refresh_game(&self, app_id: Option<&str>, game_name: Option<&str>)
    -> anyhow::Result<()>;

    /// Refresh every cached game.
    async fn refresh_all(&self) -> anyhow::Result<()>;

    /// Rebuild the search index.
    async fn rebuild_index(&self) -> anyhow::Result<()>;
}

/// Cache driven over HTTP: `POST {base}/refresh/game`, `/refresh/all`,
/// `/rebuild-index`.
pub struct WebhookReportCache {
    base_url: String,
    client: reqwest::Client,
}

impl WebhookReportCache {
    pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("building cache webhook client")?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> anyhow::Result<()> {
        let url = format!("{}{path}", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {path}"))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("POST {path} returned {status}: {text}");
        }
        Ok(())
    }
}

#[async_trait]
impl ReportCache for WebhookReportCache {
    async fn refresh_game(
        &self,
        app_id: Option<&str>,
        game_name: Option<&str>,
    ) -> anyhow::Result<()> {
        if app_id.is_none() && game_name.is_none() {
            bail!("refresh_game needs an app id or a game name");
        }
        self.post(
            "/refresh/game",
            serde_json::json!({ "app_id": app_id, "game_name": game_name }),
        )
        .await
    }

    async fn refresh_all(&self) -> anyhow::Result<()> {
        self.post("/refresh/all", serde_json::json!({})).await
    }

    async fn rebuild_index(&self) -> anyhow::Result<()> {
        self.post("/rebuild-index", serde_json::json!({})).await
    }
}

/// Stand-in used when no cache endpoint is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingReportCache;

#[async_trait]
impl ReportCache for LoggingReportCache {
    async fn refresh_game(
        &self,
        app_id: Option<&str>,
        game_name: Option<&str>,
    ) -> anyhow::Result<()> {
        tracing::info!(app_id = ?app_id, game_name = ?game_name, "Cache refresh requested (no cache configured)");
        Ok(())
    }

    async fn refresh_all(&self) -> anyhow::Result<()> {
        tracing::info!("Full cache refresh requested (no cache configured)");
        Ok(())
    }

    async fn rebuild_index(&self) -> anyhow::Result<()> {
        tracing::info!("Index rebuild requested (no cache configured)");
        Ok(())
    }
}
