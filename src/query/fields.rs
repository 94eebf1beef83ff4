//! Metric catalog: which field each metric reads and what shape its query
//! takes. Declarative so a payload rename is a one-line change here, and so
//! the whole mapping can be validated once at startup instead of failing
//! mid-generation.

use std::collections::BTreeMap;

use crate::error::ReportError;
use crate::query::{FilterClause, FilterOp, RequestShape};

pub const FIELD_CALL_STAGE: &str = "result.call.call_stage";
pub const FIELD_CALL_CLASSIFICATION: &str = "result.call.call_classification";
pub const FIELD_LOAD_STATUS: &str = "result.load.load_status";
pub const FIELD_PRICING_NOTES: &str = "result.pricing.pricing_notes";
pub const FIELD_AGREED_RATE: &str = "result.pricing.agreed_upon_rate";
pub const FIELD_CARRIER_END_STATE: &str = "result.carrier.carrier_end_state";
pub const FIELD_TRANSFER_REASON: &str = "result.transfer.transfer_reason";
pub const FIELD_TRANSFER_ATTEMPT: &str = "result.transfer.transfer_attempt";
pub const FIELD_TRANSFER_SUCCESS: &str = "result.transfer.transfer_success";
pub const FIELD_LOAD_ID: &str = "result.load.custom_load_id";

/// Classifications treated as non-convertible: the call could not have
/// produced a booking regardless of handling.
pub const NON_CONVERTIBLE_CLASSIFICATIONS: [&str; 3] =
    ["rate_too_high", "load_not_found", "carrier_not_qualified"];

pub const CLASSIFICATION_SUCCESS: &str = "success";
pub const CLASSIFICATION_DISQUALIFIED: &str = "carrier_not_qualified";

/// Pricing notes that mean a rate agreement was actually reached. Only these
/// count as a booking; any other note is a transfer without an agreement.
pub const PRICING_AGREEMENT_LABELS: [&str; 2] = [
    "AGREEMENT_REACHED_WITH_NEGOTIATION",
    "AGREEMENT_REACHED_WITHOUT_NEGOTIATION",
];

/// Every metric a daily report carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MetricKind {
    // Breakdown dimensions
    CallStage,
    CallClassification,
    LoadStatus,
    PricingNotes,
    CarrierEndState,
    // Scalar totals
    TotalCalls,
    // Ratio KPIs
    CarrierTransferOverTransferAttempts,
    CarrierTransferOverCallAttempts,
    SuccessfullyTransferredForBooking,
    NonConvertibleWithDisqualified,
    NonConvertibleWithoutDisqualified,
    CarrierNotQualified,
    // Identifier reconciliation
    UniqueLoads,
}

impl MetricKind {
    pub const ALL: [MetricKind; 13] = [
        MetricKind::CallStage,
        MetricKind::CallClassification,
        MetricKind::LoadStatus,
        MetricKind::PricingNotes,
        MetricKind::CarrierEndState,
        MetricKind::TotalCalls,
        MetricKind::CarrierTransferOverTransferAttempts,
        MetricKind::CarrierTransferOverCallAttempts,
        MetricKind::SuccessfullyTransferredForBooking,
        MetricKind::NonConvertibleWithDisqualified,
        MetricKind::NonConvertibleWithoutDisqualified,
        MetricKind::CarrierNotQualified,
        MetricKind::UniqueLoads,
    ];

    /// Stable name used as the payload map key and in error annotations.
    pub fn name(&self) -> &'static str {
        match self {
            MetricKind::CallStage => "call_stage",
            MetricKind::CallClassification => "call_classification",
            MetricKind::LoadStatus => "load_status",
            MetricKind::PricingNotes => "pricing_notes",
            MetricKind::CarrierEndState => "carrier_end_state",
            MetricKind::TotalCalls => "total_calls",
            MetricKind::CarrierTransferOverTransferAttempts => {
                "carrier_transfer_over_transfer_attempts"
            }
            MetricKind::CarrierTransferOverCallAttempts => "carrier_transfer_over_call_attempts",
            MetricKind::SuccessfullyTransferredForBooking => "successfully_transferred_for_booking",
            MetricKind::NonConvertibleWithDisqualified => "non_convertible_with_disqualified",
            MetricKind::NonConvertibleWithoutDisqualified => "non_convertible_without_disqualified",
            MetricKind::CarrierNotQualified => "carrier_not_qualified",
            MetricKind::UniqueLoads => "unique_loads",
        }
    }
}

fn string_vec(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

fn non_convertible_clauses(include_disqualified: bool) -> Vec<FilterClause> {
    let mut labels = string_vec(&NON_CONVERTIBLE_CLASSIFICATIONS);
    if !include_disqualified {
        labels.retain(|l| l != CLASSIFICATION_DISQUALIFIED);
    }
    vec![
        FilterClause::new(FIELD_CALL_CLASSIFICATION, FilterOp::Present),
        FilterClause::new(FIELD_CALL_CLASSIFICATION, FilterOp::In(labels)),
    ]
}

/// Metric kind → query shape. Built once, validated at startup.
#[derive(Debug, Clone)]
pub struct FieldCatalog {
    shapes: BTreeMap<MetricKind, RequestShape>,
}

impl FieldCatalog {
    /// The production mapping.
    pub fn standard() -> Self {
        let mut shapes = BTreeMap::new();

        for (kind, field) in [
            (MetricKind::CallStage, FIELD_CALL_STAGE),
            (MetricKind::CallClassification, FIELD_CALL_CLASSIFICATION),
            (MetricKind::LoadStatus, FIELD_LOAD_STATUS),
            (MetricKind::PricingNotes, FIELD_PRICING_NOTES),
            (MetricKind::CarrierEndState, FIELD_CARRIER_END_STATE),
        ] {
            shapes.insert(
                kind,
                RequestShape::Breakdown {
                    field: field.to_string(),
                },
            );
        }

        shapes.insert(MetricKind::TotalCalls, RequestShape::Totals);

        // Transfer attempts only: the reason must be a real transfer and the
        // attempt confirmed.
        let transfer_attempt_base = vec![
            FilterClause::new(FIELD_TRANSFER_REASON, FilterOp::Present),
            FilterClause::new(
                FIELD_TRANSFER_REASON,
                FilterOp::NotEqFold("NO_TRANSFER_INVOLVED".into()),
            ),
            FilterClause::new(FIELD_TRANSFER_ATTEMPT, FilterOp::EqFold("YES".into())),
        ];
        let mut carrier_asked_of_attempts = transfer_attempt_base.clone();
        carrier_asked_of_attempts.push(FilterClause::new(
            FIELD_TRANSFER_REASON,
            FilterOp::Eq("CARRIER_ASKED_FOR_TRANSFER".into()),
        ));
        shapes.insert(
            MetricKind::CarrierTransferOverTransferAttempts,
            RequestShape::Ratio {
                numerator: carrier_asked_of_attempts,
                denominator: transfer_attempt_base,
            },
        );

        shapes.insert(
            MetricKind::CarrierTransferOverCallAttempts,
            RequestShape::Ratio {
                numerator: vec![
                    FilterClause::new(FIELD_TRANSFER_REASON, FilterOp::Present),
                    FilterClause::new(
                        FIELD_TRANSFER_REASON,
                        FilterOp::Eq("CARRIER_ASKED_FOR_TRANSFER".into()),
                    ),
                ],
                // Every call that recorded any transfer reason at all.
                denominator: vec![FilterClause::new(FIELD_TRANSFER_REASON, FilterOp::Present)],
            },
        );

        // Booking rate: of the calls that carry the full transfer/pricing
        // quartet, how many reached a rate agreement over a confirmed
        // transfer.
        let booking_base = vec![
            FilterClause::new(FIELD_TRANSFER_ATTEMPT, FilterOp::Present),
            FilterClause::new(FIELD_TRANSFER_SUCCESS, FilterOp::Present),
            FilterClause::new(FIELD_AGREED_RATE, FilterOp::Present),
            FilterClause::new(FIELD_PRICING_NOTES, FilterOp::Present),
        ];
        let mut booked = booking_base.clone();
        booked.push(FilterClause::new(FIELD_TRANSFER_ATTEMPT, FilterOp::Eq("YES".into())));
        booked.push(FilterClause::new(FIELD_TRANSFER_SUCCESS, FilterOp::Eq("YES".into())));
        booked.push(FilterClause::new(
            FIELD_PRICING_NOTES,
            FilterOp::In(string_vec(&PRICING_AGREEMENT_LABELS)),
        ));
        shapes.insert(
            MetricKind::SuccessfullyTransferredForBooking,
            RequestShape::Ratio {
                numerator: booked,
                denominator: booking_base,
            },
        );

        shapes.insert(
            MetricKind::NonConvertibleWithDisqualified,
            RequestShape::Ratio {
                numerator: non_convertible_clauses(true),
                denominator: vec![],
            },
        );
        shapes.insert(
            MetricKind::NonConvertibleWithoutDisqualified,
            RequestShape::Ratio {
                numerator: non_convertible_clauses(false),
                denominator: vec![],
            },
        );
        shapes.insert(
            MetricKind::CarrierNotQualified,
            RequestShape::Ratio {
                numerator: vec![
                    FilterClause::new(FIELD_CALL_CLASSIFICATION, FilterOp::Present),
                    FilterClause::new(
                        FIELD_CALL_CLASSIFICATION,
                        FilterOp::Eq(CLASSIFICATION_DISQUALIFIED.into()),
                    ),
                ],
                denominator: vec![],
            },
        );

        // Default identifier field; the reconciler substitutes the epoch's
        // own field per sub-range.
        shapes.insert(
            MetricKind::UniqueLoads,
            RequestShape::DistinctValues {
                field: FIELD_LOAD_ID.to_string(),
            },
        );

        Self { shapes }
    }

    /// Shape for a metric kind. A kind the catalog does not know is a schema
    /// mismatch, surfaced per metric instead of failing the whole pass.
    pub fn shape_for(&self, kind: MetricKind) -> Result<RequestShape, ReportError> {
        self.shapes
            .get(&kind)
            .cloned()
            .ok_or_else(|| ReportError::SchemaMismatch(kind.name().to_string()))
    }

    /// Confirm every known metric kind has a mapping. Run once at startup.
    pub fn validate(&self) -> Result<(), ReportError> {
        for kind in MetricKind::ALL {
            if !self.shapes.contains_key(&kind) {
                return Err(ReportError::Configuration(format!(
                    "field catalog has no mapping for metric '{}'",
                    kind.name()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_catalog_is_complete() {
        FieldCatalog::standard().validate().unwrap();
    }

    #[test]
    fn breakdown_kinds_map_to_their_fields() {
        let catalog = FieldCatalog::standard();
        match catalog.shape_for(MetricKind::CallClassification).unwrap() {
            RequestShape::Breakdown { field } => assert_eq!(field, FIELD_CALL_CLASSIFICATION),
            other => panic!("unexpected shape: {other:?}"),
        }
    }

    #[test]
    fn missing_mapping_is_schema_mismatch() {
        let catalog = FieldCatalog {
            shapes: BTreeMap::new(),
        };
        let err = catalog.shape_for(MetricKind::LoadStatus).unwrap_err();
        assert!(matches!(err, ReportError::SchemaMismatch(k) if k == "load_status"));
        assert!(catalog.validate().is_err());
    }

    #[test]
    fn booking_rate_requires_an_agreement_over_present_pricing_fields() {
        let catalog = FieldCatalog::standard();
        let (numerator, denominator) = match catalog
            .shape_for(MetricKind::SuccessfullyTransferredForBooking)
            .unwrap()
        {
            RequestShape::Ratio {
                numerator,
                denominator,
            } => (numerator, denominator),
            other => panic!("unexpected shape: {other:?}"),
        };

        // Numerator: only the two agreement notes count as a booking.
        let agreement = numerator
            .iter()
            .find_map(|c| match &c.op {
                FilterOp::In(vs) if c.field == FIELD_PRICING_NOTES => Some(vs.clone()),
                _ => None,
            })
            .expect("numerator must restrict pricing notes to agreement labels");
        assert_eq!(agreement, string_vec(&PRICING_AGREEMENT_LABELS));
        assert!(numerator.contains(&FilterClause::new(
            FIELD_TRANSFER_SUCCESS,
            FilterOp::Eq("YES".into())
        )));

        // Denominator: calls carrying the full transfer/pricing quartet, not
        // every scoped call.
        let present_fields: Vec<&str> = denominator
            .iter()
            .filter(|c| c.op == FilterOp::Present)
            .map(|c| c.field.as_str())
            .collect();
        assert_eq!(
            present_fields,
            vec![
                FIELD_TRANSFER_ATTEMPT,
                FIELD_TRANSFER_SUCCESS,
                FIELD_AGREED_RATE,
                FIELD_PRICING_NOTES
            ]
        );
    }

    #[test]
    fn call_attempts_ratio_is_scoped_to_calls_with_a_transfer_reason() {
        let catalog = FieldCatalog::standard();
        match catalog
            .shape_for(MetricKind::CarrierTransferOverCallAttempts)
            .unwrap()
        {
            RequestShape::Ratio { denominator, .. } => {
                assert_eq!(
                    denominator,
                    vec![FilterClause::new(FIELD_TRANSFER_REASON, FilterOp::Present)]
                );
            }
            other => panic!("unexpected shape: {other:?}"),
        }
    }

    #[test]
    fn non_convertible_variants_differ_only_by_disqualified() {
        let with = non_convertible_clauses(true);
        let without = non_convertible_clauses(false);
        let labels = |clauses: &[FilterClause]| -> Vec<String> {
            clauses
                .iter()
                .find_map(|c| match &c.op {
                    FilterOp::In(vs) => Some(vs.clone()),
                    _ => None,
                })
                .unwrap()
        };
        assert!(labels(&with).contains(&CLASSIFICATION_DISQUALIFIED.to_string()));
        assert!(!labels(&without).contains(&CLASSIFICATION_DISQUALIFIED.to_string()));
    }
}
