//! Daily report persistence. One row per (org, date), enforced by the
//! UNIQUE constraint; writes go through a single atomic upsert so retries
//! and catch-up races can never produce duplicates.

use chrono::{Duration, NaiveDate, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::{parse_ts, DbError, ReportDb};
use crate::types::{DailyReport, ReportPayload};

fn map_report(row: &Row<'_>) -> rusqlite::Result<(i64, String, String, String, String)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
    ))
}

fn decode(
    (id, org_id, report_date, data, created_at): (i64, String, String, String, String),
) -> Result<DailyReport, DbError> {
    let payload: ReportPayload = serde_json::from_str(&data)?;
    Ok(DailyReport {
        id,
        org_id,
        report_date,
        payload,
        created_at: parse_ts(&created_at).unwrap_or_else(Utc::now),
    })
}

const SELECT_COLS: &str = "id, org_id, report_date, report_data, created_at";

impl ReportDb {
    /// Store a report, replacing any existing row for the same org and date.
    pub fn upsert_report(
        &self,
        org_id: &str,
        date: NaiveDate,
        payload: &ReportPayload,
    ) -> Result<(), DbError> {
        let data = serde_json::to_string(payload)?;
        self.conn.execute(
            "INSERT INTO daily_reports (org_id, report_date, report_data, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(org_id, report_date) DO UPDATE SET
                 report_data = excluded.report_data,
                 created_at = excluded.created_at",
            params![
                org_id,
                date.format("%Y-%m-%d").to_string(),
                data,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn has_report(&self, org_id: &str, date: NaiveDate) -> Result<bool, DbError> {
        let exists = self
            .conn
            .prepare("SELECT 1 FROM daily_reports WHERE org_id = ?1 AND report_date = ?2")?
            .exists(params![org_id, date.format("%Y-%m-%d").to_string()])?;
        Ok(exists)
    }

    pub fn get_report(
        &self,
        org_id: &str,
        date: NaiveDate,
    ) -> Result<Option<DailyReport>, DbError> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {SELECT_COLS} FROM daily_reports
                     WHERE org_id = ?1 AND report_date = ?2"
                ),
                params![org_id, date.format("%Y-%m-%d").to_string()],
                map_report,
            )
            .optional()?;
        row.map(decode).transpose()
    }

    pub fn get_latest_report(&self, org_id: &str) -> Result<Option<DailyReport>, DbError> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {SELECT_COLS} FROM daily_reports
                     WHERE org_id = ?1 ORDER BY report_date DESC LIMIT 1"
                ),
                params![org_id],
                map_report,
            )
            .optional()?;
        row.map(decode).transpose()
    }

    /// Most recent reports for an org, newest first.
    pub fn list_recent_reports(
        &self,
        org_id: &str,
        limit: u32,
    ) -> Result<Vec<DailyReport>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SELECT_COLS} FROM daily_reports
             WHERE org_id = ?1 ORDER BY report_date DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![org_id, limit], map_report)?;
        let mut reports = Vec::new();
        for row in rows {
            reports.push(decode(row?)?);
        }
        Ok(reports)
    }

    pub fn report_dates(&self, org_id: &str) -> Result<Vec<String>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT report_date FROM daily_reports WHERE org_id = ?1 ORDER BY report_date",
        )?;
        let rows = stmt.query_map(params![org_id], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<Vec<String>>>()
            .map_err(DbError::from)
    }

    /// Completed days in the last `days_back` days with no stored report.
    /// `today` is the current date in the org's timezone; the scan covers
    /// [today - days_back, today), never today itself.
    pub fn missing_report_dates(
        &self,
        org_id: &str,
        days_back: u32,
        today: NaiveDate,
    ) -> Result<Vec<NaiveDate>, DbError> {
        let mut missing = Vec::new();
        for offset in (1..=days_back as i64).rev() {
            let day = today - Duration::days(offset);
            if !self.has_report(org_id, day)? {
                missing.push(day);
            }
        }
        Ok(missing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_util::open_temp;
    use crate::types::{DateRangeMeta, PayloadMetadata};
    use std::collections::BTreeMap;

    fn payload(marker: &str) -> ReportPayload {
        ReportPayload {
            date_range: DateRangeMeta {
                tz: "UTC".into(),
                start: "2025-12-15T00:00:00+00:00".into(),
                end: "2025-12-16T00:00:00+00:00".into(),
            },
            kpis: BTreeMap::from([("total_calls".to_string(), serde_json::Value::from(7u64))]),
            breakdowns: BTreeMap::new(),
            metadata: PayloadMetadata {
                org_id: "org-1".into(),
                org_name: marker.into(),
                generated_at: Utc::now(),
            },
            errors: BTreeMap::new(),
        }
    }

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn upsert_is_idempotent_one_row_per_org_date() {
        let (_dir, db) = open_temp();
        db.upsert_report("org-1", date("2025-12-15"), &payload("first"))
            .unwrap();
        db.upsert_report("org-1", date("2025-12-15"), &payload("second"))
            .unwrap();

        let count: i64 = db
            .conn_ref()
            .query_row("SELECT COUNT(*) FROM daily_reports", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);

        // The second write wins.
        let stored = db.get_report("org-1", date("2025-12-15")).unwrap().unwrap();
        assert_eq!(stored.payload.metadata.org_name, "second");
    }

    #[test]
    fn payload_round_trips_through_storage() {
        let (_dir, db) = open_temp();
        let original = payload("acme");
        db.upsert_report("org-1", date("2025-12-15"), &original)
            .unwrap();
        let stored = db.get_report("org-1", date("2025-12-15")).unwrap().unwrap();
        assert_eq!(stored.payload.kpis["total_calls"], 7);
        assert_eq!(stored.report_date, "2025-12-15");
    }

    #[test]
    fn latest_and_recent_are_date_ordered() {
        let (_dir, db) = open_temp();
        for d in ["2025-12-13", "2025-12-15", "2025-12-14"] {
            db.upsert_report("org-1", date(d), &payload(d)).unwrap();
        }
        let latest = db.get_latest_report("org-1").unwrap().unwrap();
        assert_eq!(latest.report_date, "2025-12-15");

        let recent = db.list_recent_reports("org-1", 2).unwrap();
        assert_eq!(
            recent.iter().map(|r| r.report_date.as_str()).collect::<Vec<_>>(),
            ["2025-12-15", "2025-12-14"]
        );
    }

    #[test]
    fn missing_dates_cover_only_completed_days() {
        let (_dir, db) = open_temp();
        let today = date("2025-12-15");
        db.upsert_report("org-1", date("2025-12-13"), &payload("x"))
            .unwrap();

        let missing = db.missing_report_dates("org-1", 3, today).unwrap();
        assert_eq!(missing, vec![date("2025-12-12"), date("2025-12-14")]);
        // Today is never scanned; an empty scan window yields nothing.
        assert!(!missing.contains(&today));
        assert!(db.missing_report_dates("org-1", 0, today).unwrap().is_empty());
    }

    #[test]
    fn absent_report_reads_as_none() {
        let (_dir, db) = open_temp();
        assert!(db.get_report("org-1", date("2025-12-15")).unwrap().is_none());
        assert!(db.get_latest_report("org-1").unwrap().is_none());
    }
}
