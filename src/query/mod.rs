//! Aggregation request construction and SQL rendering.
//!
//! Builders are pure: (window, scope, field mapping) in, `AggregateRequest`
//! out. Rendering escapes every literal; caller input never reaches the SQL
//! text unescaped. Counts are over distinct logical sessions (run ids), and
//! queries return raw counts only. Percentage math happens in Rust.

pub mod fields;

use std::fmt;

use crate::config::QueryLimits;
use crate::types::TimeWindow;

pub use fields::{FieldCatalog, MetricKind};

/// Scoping applied to every request: window, org, source node, exclusions.
#[derive(Debug, Clone)]
pub struct QueryScope {
    pub org_id: String,
    pub source_node: String,
    pub window: TimeWindow,
    pub excluded_sessions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterOp {
    /// Field exists and is neither empty nor the literal string "null".
    Present,
    Eq(String),
    NotEq(String),
    /// Case-insensitive equality (compared uppercased).
    EqFold(String),
    NotEqFold(String),
    In(Vec<String>),
    NotIn(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterClause {
    pub field: String,
    pub op: FilterOp,
}

impl FilterClause {
    pub fn new(field: impl Into<String>, op: FilterOp) -> Self {
        Self {
            field: field.into(),
            op,
        }
    }
}

/// The shape of the aggregation the source must run.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestShape {
    /// Distinct-session count per value of `field`.
    Breakdown { field: String },
    /// Distinct-session count under two predicates, reported side by side.
    Ratio {
        numerator: Vec<FilterClause>,
        denominator: Vec<FilterClause>,
    },
    /// Distinct-session count plus summed session duration.
    Totals,
    /// Distinct non-empty values of `field`.
    DistinctValues { field: String },
}

#[derive(Debug, Clone)]
pub struct AggregateRequest {
    pub kind: MetricKind,
    pub scope: QueryScope,
    pub shape: RequestShape,
    pub limits: QueryLimits,
}

/// Escape a string literal for inclusion in single quotes.
fn escape(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('\'', "\\'")
}

fn quoted_list(values: &[String]) -> String {
    values
        .iter()
        .map(|v| format!("'{}'", escape(v)))
        .collect::<Vec<_>>()
        .join(", ")
}

fn extract(field: &str) -> String {
    format!("JSONExtractString(flat_data, '{}')", escape(field))
}

fn render_clause(clause: &FilterClause) -> String {
    let ex = extract(&clause.field);
    match &clause.op {
        FilterOp::Present => format!(
            "JSONHas(flat_data, '{f}') = 1 AND {ex} != '' AND {ex} != 'null'",
            f = escape(&clause.field)
        ),
        FilterOp::Eq(v) => format!("{ex} = '{}'", escape(v)),
        FilterOp::NotEq(v) => format!("{ex} != '{}'", escape(v)),
        FilterOp::EqFold(v) => format!("upper({ex}) = '{}'", escape(&v.to_uppercase())),
        FilterOp::NotEqFold(v) => format!("upper({ex}) != '{}'", escape(&v.to_uppercase())),
        FilterOp::In(vs) => format!("{ex} IN ({})", quoted_list(vs)),
        FilterOp::NotIn(vs) => format!("{ex} NOT IN ({})", quoted_list(vs)),
    }
}

fn render_predicate(clauses: &[FilterClause]) -> String {
    if clauses.is_empty() {
        return "1".to_string();
    }
    clauses
        .iter()
        .map(render_clause)
        .collect::<Vec<_>>()
        .join(" AND ")
}

impl AggregateRequest {
    /// Render the request as one self-contained SQL statement.
    ///
    /// Shared scoping lives in two CTEs: `recent_runs` restricts to the
    /// half-open window and org, `scoped` joins node outputs for the source
    /// node and drops excluded session numbers.
    pub fn to_sql(&self) -> String {
        let scope = &self.scope;
        let start = escape(&scope.window.start.to_rfc3339());
        let end = escape(&scope.window.end.to_rfc3339());
        let org = escape(&scope.org_id);
        let node = escape(&scope.source_node);

        let exclusion = if scope.excluded_sessions.is_empty() {
            String::new()
        } else {
            format!(
                "\n      AND no.run_id NOT IN (\n          SELECT run_id FROM public_sessions\n          WHERE org_id = '{org}' AND user_number IN ({})\n      )",
                quoted_list(&scope.excluded_sessions)
            )
        };

        let base = format!(
            "WITH recent_runs AS (\n    SELECT id AS run_id\n    FROM public_runs\n    WHERE timestamp >= parseDateTime64BestEffort('{start}')\n      AND timestamp < parseDateTime64BestEffort('{end}')\n      AND org_id = '{org}'\n),\nscoped AS (\n    SELECT no.run_id AS run_id, no.flat_data AS flat_data\n    FROM public_node_outputs no\n    INNER JOIN recent_runs rr ON no.run_id = rr.run_id\n    INNER JOIN public_nodes n ON no.node_id = n.id\n    WHERE n.org_id = '{org}'\n      AND no.node_persistent_id = '{node}'{exclusion}\n)"
        );

        match &self.shape {
            RequestShape::Breakdown { field } => {
                let present = render_clause(&FilterClause::new(field.clone(), FilterOp::Present));
                format!(
                    "{base}\nSELECT\n    {ex} AS label,\n    COUNT(DISTINCT run_id) AS count\nFROM scoped\nWHERE {present}\nGROUP BY label\nORDER BY count DESC",
                    ex = extract(field)
                )
            }
            RequestShape::Ratio {
                numerator,
                denominator,
            } => {
                format!(
                    "{base}\nSELECT\n    uniqExactIf(run_id, {num}) AS numerator,\n    uniqExactIf(run_id, {den}) AS denominator\nFROM scoped",
                    num = render_predicate(numerator),
                    den = render_predicate(denominator)
                )
            }
            RequestShape::Totals => {
                format!(
                    "{base},\nper_run AS (\n    SELECT sc.run_id AS run_id, any(s.duration) AS duration\n    FROM scoped sc\n    LEFT JOIN public_sessions s\n        ON s.run_id = sc.run_id AND s.org_id = '{org}'\n    GROUP BY sc.run_id\n)\nSELECT\n    ifNull(sum(duration), 0) AS total_duration,\n    count() AS total_calls\nFROM per_run"
                )
            }
            RequestShape::DistinctValues { field } => {
                let present = render_clause(&FilterClause::new(field.clone(), FilterOp::Present));
                format!(
                    "{base}\nSELECT DISTINCT {ex} AS value\nFROM scoped\nWHERE {present}\nORDER BY value",
                    ex = extract(field)
                )
            }
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
