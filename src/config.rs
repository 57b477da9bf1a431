//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::github::RepoRef;
use crate::github::client::DEFAULT_API_URL;
use crate::queue::validate_pattern;

/// What the monitor does with an `operations` job whose operation it does
/// not recognise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownOperationPolicy {
    /// Terminal `completed` record plus an informational notification.
    #[default]
    Complete,
    /// Terminal `failed` record, negative notification, error returned.
    Fail,
    /// No terminal write; the record stays where it was.
    Ignore,
}

impl FromStr for UnknownOperationPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "complete" => Ok(Self::Complete),
            "fail" => Ok(Self::Fail),
            "ignore" => Ok(Self::Ignore),
            other => Err(format!("expected complete|fail|ignore, got '{other}'")),
        }
    }
}

/// GitHub workflow monitor configuration.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Wait before the first run search, so CI can register the run.
    pub initial_delay: Duration,
    /// Sleep between consecutive searches and status polls.
    pub poll_interval: Duration,
    /// Attempts to locate the triggered run.
    pub search_attempts: u32,
    /// Attempts to observe the run completing.
    pub status_attempts: u32,
    /// Page size of the recent-runs listing.
    pub runs_per_page: u32,
    pub unknown_operation: UnknownOperationPolicy,
    /// How long fetched label descriptions stay fresh.
    pub label_cache_ttl: Duration,
    /// Queue attempts per monitor job.
    pub job_attempts: u32,
    /// Base backoff between monitor job attempts.
    pub job_backoff: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(10),
            poll_interval: Duration::from_secs(5),
            search_attempts: 6, // ~30s
            status_attempts: 24, // ~120s
            runs_per_page: 20,
            unknown_operation: UnknownOperationPolicy::default(),
            label_cache_ttl: Duration::from_secs(3600), // 1 hour
            job_attempts: 3,
            job_backoff: Duration::from_secs(10),
        }
    }
}

/// Recurring task scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Cron pattern (6 fields, with seconds) of the data refresh.
    pub refresh_pattern: String,
    /// Fire the refresh once right after registration.
    pub refresh_on_start: bool,
    /// Cron pattern of the daily maintenance job.
    pub maintenance_pattern: String,
    /// How often the ticker looks for due schedules.
    pub tick_interval: Duration,
    /// Finished jobs older than this are pruned by maintenance.
    pub job_retention: Duration,
    /// Notifications kept per user by maintenance.
    pub notifications_per_user: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            refresh_pattern: "0 0 * * * *".to_string(),
            refresh_on_start: false,
            maintenance_pattern: "0 0 3 * * *".to_string(),
            tick_interval: Duration::from_secs(15),
            job_retention: Duration::from_secs(7 * 24 * 3600), // 7 days
            notifications_per_user: 100,
        }
    }
}

/// Process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub http_port: u16,
    /// Default repository for monitor jobs without an override.
    pub repository: RepoRef,
    pub github_api_url: String,
    /// Base URL of the report cache webhooks; logging-only when unset.
    pub cache_url: Option<String>,
    pub monitor: MonitorConfig,
    pub scheduler: SchedulerConfig,
}

impl Config {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup`. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let repository = get("GITHUB_REPOSITORY")
            .ok_or_else(|| ConfigError::MissingEnvVar("GITHUB_REPOSITORY".into()))?
            .parse::<RepoRef>()
            .map_err(|message| ConfigError::InvalidValue {
                key: "GITHUB_REPOSITORY".into(),
                message,
            })?;

        let monitor_defaults = MonitorConfig::default();
        let monitor = MonitorConfig {
            search_attempts: parse_or(
                &get,
                "MONITOR_RUN_SEARCH_ATTEMPTS",
                monitor_defaults.search_attempts,
            )?,
            status_attempts: parse_or(
                &get,
                "MONITOR_RUN_POLL_ATTEMPTS",
                monitor_defaults.status_attempts,
            )?,
            unknown_operation: parse_or(
                &get,
                "MONITOR_UNKNOWN_OPERATION",
                monitor_defaults.unknown_operation,
            )?,
            label_cache_ttl: Duration::from_secs(parse_or(
                &get,
                "MONITOR_LABEL_CACHE_TTL_SECS",
                monitor_defaults.label_cache_ttl.as_secs(),
            )?),
            ..monitor_defaults
        };
        if monitor.search_attempts == 0 || monitor.status_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MONITOR_RUN_*_ATTEMPTS".into(),
                message: "attempt counts must be at least 1".into(),
            });
        }

        let scheduler_defaults = SchedulerConfig::default();
        let scheduler = SchedulerConfig {
            refresh_pattern: get("REPORT_JOBS_REFRESH_CRON")
                .unwrap_or(scheduler_defaults.refresh_pattern.clone()),
            refresh_on_start: parse_or(
                &get,
                "REPORT_JOBS_REFRESH_ON_START",
                scheduler_defaults.refresh_on_start,
            )?,
            maintenance_pattern: get("REPORT_JOBS_MAINTENANCE_CRON")
                .unwrap_or(scheduler_defaults.maintenance_pattern.clone()),
            tick_interval: Duration::from_secs(parse_or(
                &get,
                "REPORT_JOBS_SCHEDULE_TICK_SECS",
                scheduler_defaults.tick_interval.as_secs(),
            )?),
            ..scheduler_defaults
        };
        for (key, pattern) in [
            ("REPORT_JOBS_REFRESH_CRON", &scheduler.refresh_pattern),
            ("REPORT_JOBS_MAINTENANCE_CRON", &scheduler.maintenance_pattern),
        ] {
            validate_pattern(pattern).map_err(|e| ConfigError::InvalidValue {
                key: key.into(),
                message: e.to_string(),
            })?;
        }

        Ok(Self {
            db_path: PathBuf::from(
                get("REPORT_JOBS_DB_PATH").unwrap_or_else(|| "./data/report-jobs.db".to_string()),
            ),
            http_port: parse_or(&get, "REPORT_JOBS_HTTP_PORT", 8080)?,
            repository,
            github_api_url: get("GITHUB_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            cache_url: get("REPORT_JOBS_CACHE_URL"),
            monitor,
            scheduler,
        })
    }
}

fn parse_or<T>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn monitor_defaults_match_fixed_parameters() {
        let m = MonitorConfig::default();
        assert_eq!(m.initial_delay, Duration::from_secs(10));
        assert_eq!(m.poll_interval, Duration::from_secs(5));
        assert_eq!(m.search_attempts, 6);
        assert_eq!(m.status_attempts, 24);
        assert_eq!(m.runs_per_page, 20);
        assert_eq!(m.unknown_operation, UnknownOperationPolicy::Complete);
    }

    #[test]
    fn repository_is_required() {
        assert!(matches!(
            config_from(&[]),
            Err(ConfigError::MissingEnvVar(key)) if key == "GITHUB_REPOSITORY"
        ));
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = config_from(&[("GITHUB_REPOSITORY", "owner/reports")]).unwrap();
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.db_path, PathBuf::from("./data/report-jobs.db"));
        assert_eq!(config.github_api_url, "https://api.github.com");
        assert!(config.cache_url.is_none());
        assert_eq!(config.scheduler.refresh_pattern, "0 0 * * * *");
        assert!(!config.scheduler.refresh_on_start);
    }

    #[test]
    fn overrides_are_parsed() {
        let config = config_from(&[
            ("GITHUB_REPOSITORY", "owner/reports"),
            ("REPORT_JOBS_HTTP_PORT", "9090"),
            ("REPORT_JOBS_REFRESH_ON_START", "true"),
            ("MONITOR_RUN_SEARCH_ATTEMPTS", "12"),
            ("MONITOR_UNKNOWN_OPERATION", "Fail"),
            ("REPORT_JOBS_CACHE_URL", "http://cache:3000"),
        ])
        .unwrap();
        assert_eq!(config.http_port, 9090);
        assert!(config.scheduler.refresh_on_start);
        assert_eq!(config.monitor.search_attempts, 12);
        assert_eq!(config.monitor.status_attempts, 24);
        assert_eq!(config.monitor.unknown_operation, UnknownOperationPolicy::Fail);
        assert_eq!(config.cache_url.as_deref(), Some("http://cache:3000"));
    }

    #[test]
    fn malformed_values_are_rejected() {
        let err = config_from(&[
            ("GITHUB_REPOSITORY", "owner/reports"),
            ("REPORT_JOBS_HTTP_PORT", "eighty"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == "REPORT_JOBS_HTTP_PORT"));

        assert!(config_from(&[("GITHUB_REPOSITORY", "not-a-repo")]).is_err());
        assert!(
            config_from(&[
                ("GITHUB_REPOSITORY", "owner/reports"),
                ("REPORT_JOBS_REFRESH_CRON", "hourly"),
            ])
            .is_err()
        );
        assert!(
            config_from(&[
                ("GITHUB_REPOSITORY", "owner/reports"),
                ("MONITOR_RUN_POLL_ATTEMPTS", "0"),
            ])
            .is_err()
        );
    }
}
