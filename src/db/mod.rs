//! SQLite-backed report store.
//!
//! One database holds three concerns: generated daily reports (idempotent
//! per org and date), the organization registry (read-only to the engine),
//! and scheduler run history. The database lives at
//! `~/.callpulse/callpulse.db` unless a path is configured.

use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::Connection;

use crate::migrations;

pub mod orgs;
pub mod reports;
pub mod runs;
pub mod types;

pub use types::*;

pub struct ReportDb {
    conn: Connection,
}

impl ReportDb {
    /// Open (or create) the database at the default path and apply the
    /// schema.
    pub fn open() -> Result<Self, DbError> {
        let path = Self::db_path()?;
        Self::open_at(path)
    }

    /// Open (or create) the database at an explicit path. Tests point this
    /// at a temp directory.
    pub fn open_at(path: PathBuf) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(DbError::CreateDir)?;
        }
        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        migrations::run_migrations(&conn).map_err(DbError::Migration)?;
        Ok(Self { conn })
    }

    /// Resolve a configured override, falling back to the default path.
    pub fn open_with(configured: Option<&Path>) -> Result<Self, DbError> {
        match configured {
            Some(path) => Self::open_at(path.to_path_buf()),
            None => Self::open(),
        }
    }

    fn db_path() -> Result<PathBuf, DbError> {
        let home = dirs::home_dir().ok_or(DbError::HomeDirNotFound)?;
        Ok(home.join(".callpulse").join("callpulse.db"))
    }

    /// Borrow the underlying connection for ad-hoc queries.
    pub fn conn_ref(&self) -> &Connection {
        &self.conn
    }
}

/// Parse a stored timestamp, accepting both RFC 3339 (our inserts) and
/// sqlite's `datetime('now')` format (column defaults).
pub(crate) fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
                .map(|naive| naive.and_utc())
                .ok()
        })
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use tempfile::TempDir;

    pub fn open_temp() -> (TempDir, ReportDb) {
        let dir = TempDir::new().unwrap();
        let db = ReportDb::open_at(dir.path().join("test.db")).unwrap();
        (dir, db)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_at_creates_parent_and_schema() {
        let (_dir, db) = test_util::open_temp();
        let count: i64 = db
            .conn_ref()
            .query_row("SELECT COUNT(*) FROM organizations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn parse_ts_accepts_both_formats() {
        assert!(parse_ts("2025-12-15T06:00:00+00:00").is_some());
        assert!(parse_ts("2025-12-15 06:00:00").is_some());
        assert!(parse_ts("garbage").is_none());
    }
}
