//! callpulse: per-organization daily KPI snapshots over call-outcome
//! analytics.
//!
//! The pipeline: the scheduler picks an (org, date), the aggregator fans out
//! metric queries through `AnalyticsSource`, the reconciler merges entity
//! identifiers across the identifier-scheme migration, and the composed
//! payload is upserted into the report store exactly once per org and date.
//!
//! Surface layers build on `Scheduler` (generate_now, backfill, status) and
//! `ReportDb` (get_report, get_latest_report, list_recent_reports).

pub mod config;
pub mod db;
pub mod error;
pub mod migrations;
pub mod query;
pub mod reconcile;
pub mod report;
pub mod scheduler;
pub mod source;
pub mod types;

pub use config::Config;
pub use db::ReportDb;
pub use error::ReportError;
pub use report::{MetricsAggregator, Mode};
pub use scheduler::{Scheduler, SchedulerStatus};
pub use source::{AnalyticsSource, ClickHouseSource};
