//! Runtime configuration, assembled from environment variables.
//!
//! Everything has a default so a bare `callpulse run` against a local source
//! works. Values are read once at startup and carried explicitly; no module
//! reads the environment at query time.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::error::ReportError;

/// Default migration point between the legacy broker-node identifier scheme
/// and find-by-reference identifiers. Report windows before this instant use
/// the legacy identifier field; windows at or after it use the new one.
pub const DEFAULT_IDENTIFIER_CUTOVER: &str = "2025-11-07T00:00:00";

/// Connection details for the analytics source (ClickHouse-compatible HTTP).
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub url: String,
    pub user: String,
    pub password: String,
    pub database: String,
    pub secure: bool,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8123".to_string(),
            user: "default".to_string(),
            password: String::new(),
            database: "default".to_string(),
            secure: false,
        }
    }
}

/// Execution ceilings attached to every source request.
///
/// A breach is a fatal, non-retried-within-pass failure for that metric.
#[derive(Debug, Clone, Copy)]
pub struct QueryLimits {
    pub max_execution_time_secs: u64,
    pub max_memory_bytes: u64,
    pub max_threads: u32,
}

impl Default for QueryLimits {
    fn default() -> Self {
        Self {
            max_execution_time_secs: 180,
            max_memory_bytes: 10_000_000_000,
            max_threads: 16,
        }
    }
}

/// Scheduler cadence and retry policy.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub enabled: bool,
    /// Hour/minute of the daily trigger, in `timezone`.
    pub hour: u32,
    pub minute: u32,
    pub timezone: String,
    /// Days scanned for missing reports during catch-up.
    pub catchup_days: u32,
    /// Attempts per (org, date) before recording a terminal failure.
    pub max_attempts: u32,
    /// Fixed delay between attempts, never an immediate re-issue.
    pub retry_delay: Duration,
    /// Concurrent per-org generation tasks in one pass.
    pub org_concurrency: usize,
    /// Concurrent metric fetches within one org's generation.
    pub metric_fan_out: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hour: 6,
            minute: 0,
            timezone: "America/Los_Angeles".to_string(),
            catchup_days: 7,
            max_attempts: 3,
            retry_delay: Duration::from_secs(60),
            org_concurrency: 4,
            metric_fan_out: 4,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub source: SourceConfig,
    pub limits: QueryLimits,
    pub scheduler: SchedulerConfig,
    /// Session identifiers (test numbers) excluded from every query.
    pub excluded_sessions: Vec<String>,
    /// Override for the sqlite path; `None` resolves to `~/.callpulse/`.
    pub db_path: Option<PathBuf>,
    /// Identifier-scheme migration point, as a UTC instant.
    pub identifier_cutover: Option<DateTime<Utc>>,
}

fn env_str(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    match env_str(key) {
        Some(v) => matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"),
        None => default,
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env_str(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Assemble configuration from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let source = SourceConfig {
            url: env_str("CLICKHOUSE_URL")
                .or_else(|| env_str("CLICKHOUSE_HOST"))
                .unwrap_or_else(|| SourceConfig::default().url),
            user: env_str("CLICKHOUSE_USERNAME")
                .or_else(|| env_str("CLICKHOUSE_USER"))
                .unwrap_or_else(|| "default".to_string()),
            password: env_str("CLICKHOUSE_PASSWORD").unwrap_or_default(),
            database: env_str("CLICKHOUSE_DATABASE").unwrap_or_else(|| "default".to_string()),
            secure: env_bool("CLICKHOUSE_SECURE", false),
        };

        let limits = QueryLimits {
            max_execution_time_secs: env_parse("QUERY_MAX_EXECUTION_TIME", 180),
            max_memory_bytes: env_parse("QUERY_MAX_MEMORY_BYTES", 10_000_000_000),
            max_threads: env_parse("QUERY_MAX_THREADS", 16),
        };

        let scheduler = SchedulerConfig {
            enabled: env_bool("SCHEDULER_ENABLED", true),
            hour: env_parse("SCHEDULER_HOUR", 6).min(23),
            minute: env_parse("SCHEDULER_MINUTE", 0).min(59),
            timezone: env_str("SCHEDULER_TIMEZONE")
                .unwrap_or_else(|| "America/Los_Angeles".to_string()),
            catchup_days: env_parse("SCHEDULER_CATCHUP_DAYS", 7),
            ..SchedulerConfig::default()
        };

        let excluded_sessions = env_str("EXCLUDED_USER_NUMBERS")
            .map(|raw| {
                raw.split(',')
                    .map(|n| n.trim().to_string())
                    .filter(|n| !n.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let identifier_cutover = env_str("IDENTIFIER_CUTOVER_DATE")
            .as_deref()
            .or(Some(DEFAULT_IDENTIFIER_CUTOVER))
            .and_then(|s| parse_cutover(s).ok());

        Config {
            source,
            limits,
            scheduler,
            excluded_sessions,
            db_path: env_str("CALLPULSE_DB").map(PathBuf::from),
            identifier_cutover,
        }
    }
}

/// Parse a cutover instant. Accepts a bare local-naive ISO datetime (treated
/// as UTC, matching the historical constant) or a full RFC 3339 timestamp.
pub fn parse_cutover(raw: &str) -> Result<DateTime<Utc>, ReportError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
        .map(|naive| naive.and_utc())
        .map_err(|e| ReportError::InvalidDate(format!("cutover '{raw}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployment_contract() {
        let cfg = Config::default();
        assert_eq!(cfg.limits.max_execution_time_secs, 180);
        assert_eq!(cfg.limits.max_memory_bytes, 10_000_000_000);
        assert_eq!(cfg.scheduler.max_attempts, 3);
        assert_eq!(cfg.scheduler.retry_delay, Duration::from_secs(60));
        assert_eq!(cfg.scheduler.catchup_days, 7);
    }

    #[test]
    fn cutover_parses_naive_and_rfc3339() {
        let naive = parse_cutover(DEFAULT_IDENTIFIER_CUTOVER).unwrap();
        assert_eq!(naive.to_rfc3339(), "2025-11-07T00:00:00+00:00");

        let offset = parse_cutover("2025-11-07T00:00:00-06:00").unwrap();
        assert_eq!(offset.to_rfc3339(), "2025-11-07T06:00:00+00:00");

        assert!(parse_cutover("not a date").is_err());
    }
}
