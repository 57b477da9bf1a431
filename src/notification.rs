//! User-facing notifications emitted by background tasks.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::store::Database;

/// Visual severity shared by notifications and progress records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Positive,
    Negative,
    Warning,
    Info,
    Ongoing,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Positive => "positive",
            Self::Negative => "negative",
            Self::Warning => "warning",
            Self::Info => "info",
            Self::Ongoing => "ongoing",
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "positive" => Ok(Self::Positive),
            "negative" => Ok(Self::Negative),
            "warning" => Ok(Self::Warning),
            "info" => Ok(Self::Info),
            "ongoing" => Ok(Self::Ongoing),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

/// A persisted message for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub icon: String,
    pub title: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_label: Option<String>,
    pub variant: Severity,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        variant: Severity,
        icon: impl Into<String>,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            icon: icon.into(),
            title: title.into(),
            body: body.into(),
            link: None,
            link_label: None,
            variant,
            created_at: Utc::now(),
        }
    }

    /// Attach a deep link, e.g. back to the source issue.
    pub fn with_link(mut self, link: impl Into<String>, label: impl Into<String>) -> Self {
        self.link = Some(link.into());
        self.link_label = Some(label.into());
        self
    }
}

/// Best-effort delivery of notifications into the store.
///
/// Delivery failures are logged and swallowed; they never fail a job.
#[derive(Clone)]
pub struct Notifier {
    store: Arc<dyn Database>,
}

impl Notifier {
    pub fn new(store: Arc<dyn Database>) -> Self {
        Self { store }
    }

    /// Append a notification for `user_id`. Returns whether it was stored.
    pub async fn send(&self, user_id: &str, notification: Notification) -> bool {
        match self.store.append_notification(user_id, &notification).await {
            Ok(()) => {
                debug!(
                    user_id = %user_id,
                    notification_id = %notification.id,
                    variant = notification.variant.as_str(),
                    title = %notification.title,
                    "Notification stored"
                );
                true
            }
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Failed to store notification");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;

    #[test]
    fn link_is_optional_in_json() {
        let plain = Notification::new(Severity::Info, "info", "Note", "body");
        let json = serde_json::to_value(&plain).unwrap();
        assert!(json.get("link").is_none());
        assert_eq!(json["variant"], "info");

        let linked = plain.with_link("https://github.com/o/r/issues/1", "View issue");
        let json = serde_json::to_value(&linked).unwrap();
        assert_eq!(json["link_label"], "View issue");
    }

    #[tokio::test]
    async fn notifier_persists_per_user() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let notifier = Notifier::new(Arc::clone(&db));

        assert!(
            notifier
                .send("u1", Notification::new(Severity::Positive, "check", "Done", "ok"))
                .await
        );
        assert!(
            notifier
                .send("u2", Notification::new(Severity::Negative, "error", "Oops", "no"))
                .await
        );

        let for_u1 = db.list_notifications("u1", 10).await.unwrap();
        assert_eq!(for_u1.len(), 1);
        assert_eq!(for_u1[0].title, "Done");
    }
}
