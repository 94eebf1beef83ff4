//! Scheduler run history. Append-only; every pass is recorded whether it
//! succeeded or not.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::{parse_ts, DbError, ReportDb};
use crate::types::{RunOutcome, RunType, SchedulerRun};

/// A run record ready to be appended.
#[derive(Debug, Clone)]
pub struct NewRun {
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

fn parse_run_type(raw: &str) -> RunType {
    match raw {
        "catchup" => RunType::Catchup,
        "manual" => RunType::Manual,
        "backfill" => RunType::Backfill,
        _ => RunType::Daily,
    }
}

fn parse_outcome(raw: &str) -> RunOutcome {
    match raw {
        "succeeded" => RunOutcome::Succeeded,
        "partial" => RunOutcome::Partial,
        _ => RunOutcome::Failed,
    }
}

fn map_run(row: &Row<'_>) -> rusqlite::Result<SchedulerRun> {
    let run_type: String = row.get(1)?;
    let status: String = row.get(4)?;
    let started: String = row.get(5)?;
    let completed: Option<String> = row.get(6)?;
    Ok(SchedulerRun {
        id: row.get(0)?,
        run_type: parse_run_type(&run_type),
        org_id: row.get(2)?,
        report_date: row.get(3)?,
        outcome: parse_outcome(&status),
        started_at: parse_ts(&started).unwrap_or_else(Utc::now),
        completed_at: completed.as_deref().and_then(parse_ts),
        reports_generated: row.get(7)?,
        retry_count: row.get(8)?,
        error: row.get(9)?,
    })
}

const RUN_COLS: &str = "id, run_type, org_id, report_date, status, started_at, completed_at, \
                        reports_generated, retry_count, error_message";

impl ReportDb {
    pub fn log_run(&self, run: &NewRun) -> Result<i64, DbError> {
        self.conn.execute(
            "INSERT INTO scheduler_runs
                 (run_type, org_id, report_date, status, started_at, completed_at,
                  reports_generated, retry_count, error_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                run.run_type.as_str(),
                run.org_id,
                run.report_date,
                run.outcome.as_str(),
                run.started_at.to_rfc3339(),
                run.completed_at.map(|t| t.to_rfc3339()),
                run.reports_generated,
                run.retry_count,
                run.error,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn recent_runs(&self, limit: u32) -> Result<Vec<SchedulerRun>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RUN_COLS} FROM scheduler_runs ORDER BY id DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit], map_run)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(DbError::from)
    }

    pub fn last_successful_run(&self) -> Result<Option<SchedulerRun>, DbError> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {RUN_COLS} FROM scheduler_runs
                     WHERE status = 'succeeded' ORDER BY id DESC LIMIT 1"
                ),
                [],
                map_run,
            )
            .optional()
            .map_err(DbError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_util::open_temp;

    fn run(outcome: RunOutcome, retry_count: u32) -> NewRun {
        NewRun {
            run_type: RunType::Daily,
            org_id: Some("org-1".into()),
            report_date: Some("2025-12-15".into()),
            outcome,
            started_at: Utc::now(),
            completed_at: Some(Utc::now()),
            reports_generated: u32::from(outcome == RunOutcome::Succeeded),
            retry_count,
            error: match outcome {
                RunOutcome::Failed => Some("source_timeout".into()),
                _ => None,
            },
        }
    }

    #[test]
    fn runs_append_and_list_newest_first() {
        let (_dir, db) = open_temp();
        db.log_run(&run(RunOutcome::Failed, 2)).unwrap();
        db.log_run(&run(RunOutcome::Succeeded, 0)).unwrap();

        let runs = db.recent_runs(10).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].outcome, RunOutcome::Succeeded);
        assert_eq!(runs[1].retry_count, 2);
        assert_eq!(runs[1].error.as_deref(), Some("source_timeout"));
    }

    #[test]
    fn last_successful_run_skips_failures() {
        let (_dir, db) = open_temp();
        assert!(db.last_successful_run().unwrap().is_none());

        db.log_run(&run(RunOutcome::Succeeded, 1)).unwrap();
        db.log_run(&run(RunOutcome::Failed, 3)).unwrap();

        let last = db.last_successful_run().unwrap().unwrap();
        assert_eq!(last.outcome, RunOutcome::Succeeded);
        assert_eq!(last.retry_count, 1);
    }
}
