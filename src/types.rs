//! Domain types shared across the crate.
//!
//! `ReportPayload` is the persisted contract: the JSON stored per (org, date)
//! and read back by downstream surfaces. Field names here are load-bearing.

use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

/// An organization scoped into every query. Read-only to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub org_id: String,
    pub name: String,
    /// Legacy broker node scoping events before the identifier cutover.
    pub broker_node_id: String,
    /// Find-by-reference node scoping events after the cutover, when present.
    pub fbr_node_id: Option<String>,
    /// IANA timezone name; defines the org's report day boundary.
    pub timezone: String,
    pub is_active: bool,
    pub created_at: Option<DateTime<Utc>>,
}

/// Half-open instant range [start, end).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
}

impl TimeWindow {
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

/// One identifier-scheme era. Ranges are half-open; `valid_until == None`
/// means the epoch is still current.
#[derive(Debug, Clone)]
pub struct IdentifierEpoch {
    pub valid_from: DateTime<Utc>,
    pub valid_until: Option<DateTime<Utc>>,
    /// Payload field holding the entity identifier during this epoch.
    pub identifier_field: String,
    /// Node id scoping events during this epoch.
    pub source_node: String,
}

/// One row of a breakdown dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub label: String,
    pub count: u64,
    pub percentage: f64,
}

/// A counted-over-total KPI, stored with its inputs so consumers can
/// re-derive or re-bucket without another query.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RatioKpi {
    pub count: u64,
    pub total: u64,
    pub percentage: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DateRangeMeta {
    pub tz: String,
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadMetadata {
    pub org_id: String,
    pub org_name: String,
    pub generated_at: DateTime<Utc>,
}

/// The stored daily snapshot. Serialized as-is into `daily_reports.payload`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportPayload {
    pub date_range: DateRangeMeta,
    /// Scalar and ratio KPIs keyed by stable metric name.
    pub kpis: BTreeMap<String, serde_json::Value>,
    /// Per-dimension label distributions.
    pub breakdowns: BTreeMap<String, Vec<MetricRecord>>,
    pub metadata: PayloadMetadata,
    /// Per-metric failure categories, present only for degraded generations.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub errors: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyReport {
    pub id: i64,
    pub org_id: String,
    pub report_date: String,
    pub payload: ReportPayload,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    Daily,
    Catchup,
    Manual,
    Backfill,
}

impl RunType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunType::Daily => "daily",
            RunType::Catchup => "catchup",
            RunType::Manual => "manual",
            RunType::Backfill => "backfill",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    Failed,
    Partial,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Succeeded => "succeeded",
            RunOutcome::Failed => "failed",
            RunOutcome::Partial => "partial",
        }
    }
}

/// One recorded scheduler pass for one org. Append-only history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerRun {
    pub id: i64,
    pub run_type: RunType,
    pub org_id: Option<String>,
    pub report_date: Option<String>,
    pub outcome: RunOutcome,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub reports_generated: u32,
    pub retry_count: u32,
    pub error: Option<String>,
}
