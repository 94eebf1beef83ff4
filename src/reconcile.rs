//! Unique-entity reconciliation across identifier-scheme migrations.
//!
//! A load referenced before the identifier cutover and again after it is one
//! load. Counting per epoch and summing would double-count, so the window is
//! split per epoch and the identifier sets are unioned.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::QueryLimits;
use crate::error::ReportError;
use crate::query::{AggregateRequest, MetricKind, QueryScope, RequestShape};
use crate::source::{get_str, AnalyticsSource};
use crate::types::{IdentifierEpoch, Organization, TimeWindow};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UniqueEntities {
    pub unique_count: u64,
    /// Sorted union of identifiers across all epochs.
    pub listing: Vec<String>,
}

/// Intersect a window with each epoch's validity range, in epoch order.
/// Returns (epoch index, sub-window) pairs; zero-width intersections are
/// dropped. Works for any number of epochs.
pub fn split_window(window: TimeWindow, epochs: &[IdentifierEpoch]) -> Vec<(usize, TimeWindow)> {
    let offset = window.start.timezone();
    let mut parts = Vec::new();
    for (idx, epoch) in epochs.iter().enumerate() {
        let epoch_start = epoch.valid_from.with_timezone(&offset);
        let start = window.start.max(epoch_start);
        let end = match epoch.valid_until {
            Some(until) => window.end.min(until.with_timezone(&offset)),
            None => window.end,
        };
        if start < end {
            parts.push((idx, TimeWindow { start, end }));
        }
    }
    parts
}

/// Production epoch list for one org: the legacy broker-node scheme up to
/// the cutover, then find-by-reference. Orgs without an FBR node, or with no
/// configured cutover, stay on a single open-ended legacy epoch.
pub fn epochs_for(org: &Organization, cutover: Option<DateTime<Utc>>) -> Vec<IdentifierEpoch> {
    const IDENTIFIER_FIELD: &str = crate::query::fields::FIELD_LOAD_ID;

    match (&org.fbr_node_id, cutover) {
        (Some(fbr_node), Some(cutover)) => vec![
            IdentifierEpoch {
                valid_from: DateTime::<Utc>::MIN_UTC,
                valid_until: Some(cutover),
                identifier_field: IDENTIFIER_FIELD.to_string(),
                source_node: org.broker_node_id.clone(),
            },
            IdentifierEpoch {
                valid_from: cutover,
                valid_until: None,
                identifier_field: IDENTIFIER_FIELD.to_string(),
                source_node: fbr_node.clone(),
            },
        ],
        _ => vec![IdentifierEpoch {
            valid_from: DateTime::<Utc>::MIN_UTC,
            valid_until: None,
            identifier_field: IDENTIFIER_FIELD.to_string(),
            source_node: org.broker_node_id.clone(),
        }],
    }
}

pub struct UniqueEntityReconciler {
    source: Arc<dyn AnalyticsSource>,
}

impl UniqueEntityReconciler {
    pub fn new(source: Arc<dyn AnalyticsSource>) -> Self {
        Self { source }
    }

    /// Distinct entity identifiers seen in `window`, reconciled across
    /// `epochs`. Sub-range queries run sequentially; an empty window yields
    /// an empty result without touching the source.
    pub async fn unique_entities(
        &self,
        org_id: &str,
        excluded_sessions: &[String],
        limits: QueryLimits,
        window: TimeWindow,
        epochs: &[IdentifierEpoch],
    ) -> Result<UniqueEntities, ReportError> {
        if window.is_empty() {
            return Ok(UniqueEntities::default());
        }

        let mut union: BTreeSet<String> = BTreeSet::new();
        for (idx, sub) in split_window(window, epochs) {
            let epoch = &epochs[idx];
            let request = AggregateRequest {
                kind: MetricKind::UniqueLoads,
                scope: QueryScope {
                    org_id: org_id.to_string(),
                    source_node: epoch.source_node.clone(),
                    window: sub,
                    excluded_sessions: excluded_sessions.to_vec(),
                },
                shape: RequestShape::DistinctValues {
                    field: epoch.identifier_field.clone(),
                },
                limits,
            };
            let rows = self.source.execute(&request).await?;
            union.extend(
                rows.iter()
                    .filter_map(|row| get_str(row, "value"))
                    .filter(|v| !v.is_empty())
                    .map(str::to_string),
            );
        }

        Ok(UniqueEntities {
            unique_count: union.len() as u64,
            listing: union.into_iter().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::mock::{value_rows, MockSource};
    use chrono::TimeZone;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn window(start: &str, end: &str) -> TimeWindow {
        TimeWindow {
            start: DateTime::parse_from_rfc3339(start).unwrap(),
            end: DateTime::parse_from_rfc3339(end).unwrap(),
        }
    }

    fn epoch(from: &str, until: Option<&str>, node: &str) -> IdentifierEpoch {
        IdentifierEpoch {
            valid_from: if from.is_empty() {
                DateTime::<Utc>::MIN_UTC
            } else {
                utc(from)
            },
            valid_until: until.map(utc),
            identifier_field: "result.load.custom_load_id".into(),
            source_node: node.into(),
        }
    }

    #[test]
    fn window_inside_one_epoch_yields_one_part() {
        let epochs = vec![
            epoch("", Some("2025-11-07T00:00:00Z"), "legacy"),
            epoch("2025-11-07T00:00:00Z", None, "fbr"),
        ];
        let parts = split_window(
            window("2025-12-01T00:00:00+00:00", "2025-12-02T00:00:00+00:00"),
            &epochs,
        );
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].0, 1);
    }

    #[test]
    fn window_straddling_the_cutover_splits_exactly() {
        let epochs = vec![
            epoch("", Some("2025-11-07T00:00:00Z"), "legacy"),
            epoch("2025-11-07T00:00:00Z", None, "fbr"),
        ];
        let parts = split_window(
            window("2025-11-06T00:00:00+00:00", "2025-11-08T00:00:00+00:00"),
            &epochs,
        );
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].1.end, parts[1].1.start);
        assert_eq!(
            parts[0].1.end,
            Utc.with_ymd_and_hms(2025, 11, 7, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn boundary_touching_window_produces_no_zero_width_part() {
        let epochs = vec![
            epoch("", Some("2025-11-07T00:00:00Z"), "legacy"),
            epoch("2025-11-07T00:00:00Z", None, "fbr"),
        ];
        let parts = split_window(
            window("2025-11-05T00:00:00+00:00", "2025-11-07T00:00:00+00:00"),
            &epochs,
        );
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].0, 0);
    }

    #[test]
    fn three_epochs_split_generically() {
        let epochs = vec![
            epoch("", Some("2025-06-01T00:00:00Z"), "a"),
            epoch("2025-06-01T00:00:00Z", Some("2025-11-07T00:00:00Z"), "b"),
            epoch("2025-11-07T00:00:00Z", None, "c"),
        ];
        let parts = split_window(
            window("2025-05-31T00:00:00+00:00", "2025-11-08T00:00:00+00:00"),
            &epochs,
        );
        assert_eq!(parts.iter().map(|(i, _)| *i).collect::<Vec<_>>(), [0, 1, 2]);
    }

    #[tokio::test]
    async fn identifiers_union_never_sum() {
        // L-2 appears in both epochs; it must count once.
        let source = Arc::new(MockSource::new(|req| {
            Ok(match req.scope.source_node.as_str() {
                "legacy" => value_rows(&["L-1", "L-2"]),
                _ => value_rows(&["L-2", "L-3"]),
            })
        }));
        let reconciler = UniqueEntityReconciler::new(source);
        let epochs = vec![
            epoch("", Some("2025-11-07T00:00:00Z"), "legacy"),
            epoch("2025-11-07T00:00:00Z", None, "fbr"),
        ];
        let result = reconciler
            .unique_entities(
                "org-1",
                &[],
                QueryLimits::default(),
                window("2025-11-06T00:00:00+00:00", "2025-11-08T00:00:00+00:00"),
                &epochs,
            )
            .await
            .unwrap();
        assert_eq!(result.unique_count, 3);
        assert_eq!(result.listing, ["L-1", "L-2", "L-3"]);
    }

    #[tokio::test]
    async fn empty_window_is_empty_result_not_error() {
        let source = Arc::new(MockSource::new(|_| {
            Err(ReportError::Network("must not be called".into()))
        }));
        let reconciler = UniqueEntityReconciler::new(source.clone());
        let t = "2025-11-06T00:00:00+00:00";
        let result = reconciler
            .unique_entities(
                "org-1",
                &[],
                QueryLimits::default(),
                window(t, t),
                &epochs_for(&sample_org(), Some(utc("2025-11-07T00:00:00Z"))),
            )
            .await
            .unwrap();
        assert_eq!(result, UniqueEntities::default());
        assert!(source.seen.lock().unwrap().is_empty());
    }

    fn sample_org() -> Organization {
        Organization {
            org_id: "org-1".into(),
            name: "Acme Freight".into(),
            broker_node_id: "legacy".into(),
            fbr_node_id: Some("fbr".into()),
            timezone: "America/Chicago".into(),
            is_active: true,
            created_at: None,
        }
    }

    #[test]
    fn org_without_fbr_node_stays_on_one_epoch() {
        let mut org = sample_org();
        org.fbr_node_id = None;
        let epochs = epochs_for(&org, Some(utc("2025-11-07T00:00:00Z")));
        assert_eq!(epochs.len(), 1);
        assert!(epochs[0].valid_until.is_none());
    }
}
