//! Report generation: fan out metric queries, compose one payload.
//!
//! The aggregator owns the day-boundary math, the bounded fan-out, and the
//! composition rules. Every derived KPI is computed from counts already
//! fetched in the same pass so related figures can never disagree.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::{Config, QueryLimits};
use crate::error::ReportError;
use crate::query::fields::CLASSIFICATION_SUCCESS;
use crate::query::{AggregateRequest, FieldCatalog, MetricKind, QueryScope, RequestShape};
use crate::reconcile::{epochs_for, UniqueEntities, UniqueEntityReconciler};
use crate::source::{get_str, get_u64, AnalyticsSource, Row};
use crate::types::{
    DateRangeMeta, MetricRecord, Organization, PayloadMetadata, RatioKpi, ReportPayload,
    TimeWindow,
};

/// How per-metric failures are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Collect failures into the payload's errors map, keep partial results.
    BestEffort,
    /// Abort the whole generation on the first metric failure.
    Strict,
}

/// Round half away from zero to two decimals, matching stored history.
fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Safe percentage: zero denominator yields 0.0, never NaN; result is
/// clamped to [0, 100].
pub fn pct(count: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    round2((count as f64 * 100.0) / total as f64).clamp(0.0, 100.0)
}

/// The org-local report day as a half-open instant range.
///
/// 23- and 25-hour DST days come out right because both endpoints are
/// resolved through the zone. A midnight skipped by a DST jump resolves to
/// the earliest valid local instant.
pub fn day_window(date: NaiveDate, tz: Tz) -> Result<TimeWindow, ReportError> {
    let local_midnight = |d: NaiveDate| {
        tz.from_local_datetime(&d.and_time(NaiveTime::MIN))
            .earliest()
            .ok_or_else(|| ReportError::InvalidDate(format!("no valid instant for {d} in {tz}")))
    };
    let next = date
        .succ_opt()
        .ok_or_else(|| ReportError::InvalidDate(format!("no day after {date}")))?;
    Ok(TimeWindow {
        start: local_midnight(date)?.fixed_offset(),
        end: local_midnight(next)?.fixed_offset(),
    })
}

#[derive(Debug, Clone)]
enum MetricOutcome {
    Breakdown(Vec<(String, u64)>),
    Ratio { numerator: u64, denominator: u64 },
    Totals { total_calls: u64, duration_secs: u64 },
    Unique(UniqueEntities),
}

fn parse_rows(shape: &RequestShape, rows: Vec<Row>) -> MetricOutcome {
    match shape {
        RequestShape::Breakdown { .. } => MetricOutcome::Breakdown(
            rows.iter()
                .filter_map(|r| {
                    get_str(r, "label").map(|label| (label.to_string(), get_u64(r, "count")))
                })
                .collect(),
        ),
        RequestShape::Ratio { .. } => {
            let row = rows.first();
            MetricOutcome::Ratio {
                numerator: row.map(|r| get_u64(r, "numerator")).unwrap_or(0),
                denominator: row.map(|r| get_u64(r, "denominator")).unwrap_or(0),
            }
        }
        RequestShape::Totals => {
            let row = rows.first();
            MetricOutcome::Totals {
                total_calls: row.map(|r| get_u64(r, "total_calls")).unwrap_or(0),
                duration_secs: row.map(|r| get_u64(r, "total_duration")).unwrap_or(0),
            }
        }
        // Distinct values are only issued through the reconciler.
        RequestShape::DistinctValues { .. } => MetricOutcome::Unique(UniqueEntities::default()),
    }
}

pub struct MetricsAggregator {
    source: Arc<dyn AnalyticsSource>,
    catalog: FieldCatalog,
    limits: QueryLimits,
    excluded_sessions: Vec<String>,
    fan_out: usize,
    identifier_cutover: Option<DateTime<Utc>>,
}

impl MetricsAggregator {
    pub fn new(source: Arc<dyn AnalyticsSource>, config: &Config) -> Result<Self, ReportError> {
        let catalog = FieldCatalog::standard();
        catalog.validate()?;
        Ok(Self {
            source,
            catalog,
            limits: config.limits,
            excluded_sessions: config.excluded_sessions.clone(),
            fan_out: config.scheduler.metric_fan_out.max(1),
            identifier_cutover: config.identifier_cutover,
        })
    }

    /// Generate one org's payload for one report date.
    pub async fn generate(
        &self,
        org: &Organization,
        date: NaiveDate,
        mode: Mode,
    ) -> Result<ReportPayload, ReportError> {
        let tz: Tz = org
            .timezone
            .parse()
            .map_err(|_| ReportError::Configuration(format!("unknown timezone {}", org.timezone)))?;
        let window = day_window(date, tz)?;

        let mut outcomes = self.fetch_all(org, window).await?;

        if mode == Mode::Strict {
            // Propagate the first failure unchanged so retry classification
            // still sees the source error.
            for kind in MetricKind::ALL {
                if matches!(outcomes.get(&kind), Some(Err(_))) {
                    if let Some(Err(e)) = outcomes.remove(&kind) {
                        log::warn!(
                            "aborting generation for org {}: metric {} failed: {e}",
                            org.org_id,
                            kind.name()
                        );
                        return Err(e);
                    }
                }
            }
        }

        Ok(self.compose(org, &window, outcomes))
    }

    /// Run every metric request with bounded concurrency. All tasks are
    /// joined before anything is composed.
    async fn fetch_all(
        &self,
        org: &Organization,
        window: TimeWindow,
    ) -> Result<BTreeMap<MetricKind, Result<MetricOutcome, ReportError>>, ReportError> {
        let semaphore = Arc::new(Semaphore::new(self.fan_out));
        let mut tasks: JoinSet<(MetricKind, Result<MetricOutcome, ReportError>)> = JoinSet::new();
        let mut outcomes = BTreeMap::new();

        for kind in MetricKind::ALL {
            if kind == MetricKind::UniqueLoads {
                continue;
            }
            let shape = match self.catalog.shape_for(kind) {
                Ok(shape) => shape,
                Err(e) => {
                    outcomes.insert(kind, Err(e));
                    continue;
                }
            };
            let request = AggregateRequest {
                kind,
                scope: QueryScope {
                    org_id: org.org_id.clone(),
                    source_node: org.broker_node_id.clone(),
                    window,
                    excluded_sessions: self.excluded_sessions.clone(),
                },
                shape: shape.clone(),
                limits: self.limits,
            };
            let source = Arc::clone(&self.source);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let result = source
                    .execute(&request)
                    .await
                    .map(|rows| parse_rows(&shape, rows));
                (kind, result)
            });
        }

        {
            let reconciler = UniqueEntityReconciler::new(Arc::clone(&self.source));
            let org = org.clone();
            let excluded = self.excluded_sessions.clone();
            let limits = self.limits;
            let cutover = self.identifier_cutover;
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let epochs = epochs_for(&org, cutover);
                let result = reconciler
                    .unique_entities(&org.org_id, &excluded, limits, window, &epochs)
                    .await
                    .map(MetricOutcome::Unique);
                (MetricKind::UniqueLoads, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (kind, result) =
                joined.map_err(|e| ReportError::Configuration(format!("metric task: {e}")))?;
            outcomes.insert(kind, result);
        }
        Ok(outcomes)
    }

    fn compose(
        &self,
        org: &Organization,
        window: &TimeWindow,
        outcomes: BTreeMap<MetricKind, Result<MetricOutcome, ReportError>>,
    ) -> ReportPayload {
        let mut kpis: BTreeMap<String, serde_json::Value> = BTreeMap::new();
        let mut breakdowns: BTreeMap<String, Vec<MetricRecord>> = BTreeMap::new();
        let mut errors: BTreeMap<String, String> = BTreeMap::new();

        let mut total_calls: Option<u64> = None;
        let mut classification: Option<Vec<(String, u64)>> = None;
        let mut unique: Option<UniqueEntities> = None;

        for (kind, outcome) in outcomes {
            match outcome {
                Err(e) => {
                    log::warn!("metric {} failed for org {}: {e}", kind.name(), org.org_id);
                    errors.insert(kind.name().to_string(), e.category().to_string());
                }
                Ok(MetricOutcome::Breakdown(entries)) => {
                    if kind == MetricKind::CallClassification {
                        classification = Some(entries.clone());
                    }
                    let total: u64 = entries.iter().map(|(_, c)| *c).sum();
                    let mut records: Vec<MetricRecord> = entries
                        .into_iter()
                        .map(|(label, count)| MetricRecord {
                            label,
                            count,
                            percentage: pct(count, total),
                        })
                        .collect();
                    records.sort_by(|a, b| b.count.cmp(&a.count).then(a.label.cmp(&b.label)));
                    breakdowns.insert(kind.name().to_string(), records);
                }
                Ok(MetricOutcome::Ratio {
                    numerator,
                    denominator,
                }) => {
                    let ratio = RatioKpi {
                        count: numerator,
                        total: denominator,
                        percentage: pct(numerator, denominator),
                    };
                    if let Ok(value) = serde_json::to_value(ratio) {
                        kpis.insert(kind.name().to_string(), value);
                    }
                }
                Ok(MetricOutcome::Totals {
                    total_calls: calls,
                    duration_secs,
                }) => {
                    total_calls = Some(calls);
                    kpis.insert("total_calls".into(), calls.into());
                    kpis.insert(
                        "total_duration_hours".into(),
                        round2(duration_secs as f64 / 3600.0).into(),
                    );
                    let avg_minutes = if calls == 0 {
                        0.0
                    } else {
                        round2(duration_secs as f64 / calls as f64 / 60.0)
                    };
                    kpis.insert("avg_minutes_per_call".into(), avg_minutes.into());
                }
                Ok(MetricOutcome::Unique(entities)) => {
                    kpis.insert("unique_loads".into(), entities.unique_count.into());
                    kpis.insert("unique_loads_listing".into(), entities.listing.clone().into());
                    unique = Some(entities);
                }
            }
        }

        // Derived figures reuse counts fetched above; no second query.
        if let Some(entries) = classification {
            let total: u64 = entries.iter().map(|(_, c)| *c).sum();
            let success: u64 = entries
                .iter()
                .filter(|(label, _)| label == CLASSIFICATION_SUCCESS)
                .map(|(_, c)| *c)
                .sum();
            kpis.insert("classified_calls".into(), total.into());
            kpis.insert("success_rate_percent".into(), pct(success, total).into());
        }
        if let (Some(calls), Some(entities)) = (total_calls, &unique) {
            let per_load = if entities.unique_count == 0 {
                0.0
            } else {
                round2(calls as f64 / entities.unique_count as f64)
            };
            kpis.insert("calls_per_unique_load".into(), per_load.into());
        }

        ReportPayload {
            date_range: DateRangeMeta {
                tz: org.timezone.clone(),
                start: window.start.to_rfc3339(),
                end: window.end.to_rfc3339(),
            },
            kpis,
            breakdowns,
            metadata: PayloadMetadata {
                org_id: org.org_id.clone(),
                org_name: org.name.clone(),
                generated_at: Utc::now(),
            },
            errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::mock::{breakdown_rows, ratio_row, totals_row, value_rows, MockSource};

    fn org() -> Organization {
        Organization {
            org_id: "org-a".into(),
            name: "Acme Freight".into(),
            broker_node_id: "node-legacy".into(),
            fbr_node_id: Some("node-fbr".into()),
            timezone: "America/Chicago".into(),
            is_active: true,
            created_at: None,
        }
    }

    fn aggregator(source: MockSource) -> MetricsAggregator {
        MetricsAggregator::new(Arc::new(source), &Config::default()).unwrap()
    }

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn pct_handles_zero_denominator_and_bounds() {
        assert_eq!(pct(0, 0), 0.0);
        assert_eq!(pct(40, 100), 40.0);
        assert_eq!(pct(1, 3), 33.33);
        assert_eq!(pct(100, 100), 100.0);
    }

    #[test]
    fn chicago_day_is_24_hours_with_local_offset() {
        let w = day_window(date("2025-12-15"), chrono_tz::America::Chicago).unwrap();
        assert_eq!(w.start.to_rfc3339(), "2025-12-15T00:00:00-06:00");
        assert_eq!(w.end.to_rfc3339(), "2025-12-16T00:00:00-06:00");
        assert_eq!((w.end - w.start).num_hours(), 24);
    }

    #[test]
    fn dst_days_are_23_and_25_hours() {
        let spring = day_window(date("2025-03-09"), chrono_tz::America::Chicago).unwrap();
        assert_eq!((spring.end - spring.start).num_hours(), 23);

        let fall = day_window(date("2025-11-02"), chrono_tz::America::Chicago).unwrap();
        assert_eq!((fall.end - fall.start).num_hours(), 25);
    }

    #[tokio::test]
    async fn composes_classification_breakdown_and_totals() {
        let source = MockSource::new(|req| {
            Ok(match req.kind {
                MetricKind::CallClassification => {
                    breakdown_rows(&[("success", 40), ("failure", 60)])
                }
                MetricKind::TotalCalls => totals_row(100, 360_000),
                MetricKind::UniqueLoads => value_rows(&["L-1", "L-2"]),
                MetricKind::CarrierTransferOverTransferAttempts => ratio_row(5, 20),
                _ => Vec::new(),
            })
        });
        let payload = aggregator(source)
            .generate(&org(), date("2024-01-01"), Mode::BestEffort)
            .await
            .unwrap();

        let classification = &payload.breakdowns["call_classification"];
        assert_eq!(
            classification,
            &vec![
                MetricRecord {
                    label: "failure".into(),
                    count: 60,
                    percentage: 60.0
                },
                MetricRecord {
                    label: "success".into(),
                    count: 40,
                    percentage: 40.0
                },
            ]
        );
        assert_eq!(payload.kpis["total_calls"], 100);
        assert_eq!(payload.kpis["success_rate_percent"], 40.0);
        assert_eq!(payload.kpis["total_duration_hours"], 100.0);
        assert_eq!(payload.kpis["avg_minutes_per_call"], 60.0);
        assert_eq!(payload.kpis["unique_loads"], 2);
        assert_eq!(payload.kpis["calls_per_unique_load"], 50.0);
        assert_eq!(
            payload.kpis["carrier_transfer_over_transfer_attempts"]["percentage"],
            25.0
        );
        assert!(payload.errors.is_empty());
    }

    #[tokio::test]
    async fn best_effort_keeps_partial_results_and_annotates_failures() {
        let source = MockSource::new(|req| match req.kind {
            MetricKind::LoadStatus => Err(ReportError::SourceTimeout(180)),
            MetricKind::CallClassification => Ok(breakdown_rows(&[("success", 10)])),
            _ => Ok(Vec::new()),
        });
        let payload = aggregator(source)
            .generate(&org(), date("2025-12-15"), Mode::BestEffort)
            .await
            .unwrap();
        assert_eq!(payload.errors["load_status"], "source_timeout");
        assert!(payload.breakdowns.contains_key("call_classification"));
        assert!(!payload.breakdowns.contains_key("load_status"));
    }

    #[tokio::test]
    async fn strict_mode_aborts_on_any_metric_failure() {
        let source = MockSource::new(|req| match req.kind {
            MetricKind::LoadStatus => Err(ReportError::SourceTimeout(180)),
            _ => Ok(Vec::new()),
        });
        let result = aggregator(source)
            .generate(&org(), date("2025-12-15"), Mode::Strict)
            .await;
        // The source failure must come back unchanged so retry
        // classification still applies.
        assert!(result.unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn unknown_timezone_is_configuration_error() {
        let source = MockSource::new(|_| Ok(Vec::new()));
        let mut bad = org();
        bad.timezone = "Mars/Olympus".into();
        let err = aggregator(source)
            .generate(&bad, date("2025-12-15"), Mode::Strict)
            .await
            .unwrap_err();
        assert!(matches!(err, ReportError::Configuration(_)));
    }
}
