//! Organization registry reads, plus the dev-bootstrap seed.
//!
//! Organizations are maintained by an external admin surface; the engine
//! only reads them. `seed_default_organization` exists so a fresh install
//! with env-based single-org config has something to schedule against.

use rusqlite::{params, OptionalExtension, Row};

use super::{parse_ts, DbError, ReportDb};
use crate::types::Organization;

fn map_org(row: &Row<'_>) -> rusqlite::Result<Organization> {
    let created_at: Option<String> = row.get(6)?;
    Ok(Organization {
        org_id: row.get(0)?,
        name: row.get(1)?,
        broker_node_id: row.get(2)?,
        fbr_node_id: row.get(3)?,
        timezone: row.get(4)?,
        is_active: row.get::<_, i64>(5)? != 0,
        created_at: created_at.as_deref().and_then(parse_ts),
    })
}

const ORG_COLS: &str =
    "org_id, name, broker_node_id, fbr_node_id, timezone, is_active, created_at";

impl ReportDb {
    pub fn get_organization(&self, org_id: &str) -> Result<Option<Organization>, DbError> {
        self.conn
            .query_row(
                &format!("SELECT {ORG_COLS} FROM organizations WHERE org_id = ?1"),
                params![org_id],
                map_org,
            )
            .optional()
            .map_err(DbError::from)
    }

    pub fn active_organizations(&self) -> Result<Vec<Organization>, DbError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ORG_COLS} FROM organizations WHERE is_active = 1 ORDER BY org_id"
        ))?;
        let rows = stmt.query_map([], map_org)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(DbError::from)
    }

    pub fn upsert_organization(&self, org: &Organization) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO organizations (org_id, name, broker_node_id, fbr_node_id, timezone, is_active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(org_id) DO UPDATE SET
                 name = excluded.name,
                 broker_node_id = excluded.broker_node_id,
                 fbr_node_id = excluded.fbr_node_id,
                 timezone = excluded.timezone,
                 is_active = excluded.is_active",
            params![
                org.org_id,
                org.name,
                org.broker_node_id,
                org.fbr_node_id,
                org.timezone,
                org.is_active as i64
            ],
        )?;
        Ok(())
    }

    /// Register the org described by ORG_ID / BROKER_NODE_PERSISTENT_ID env
    /// vars if the registry does not know it yet. Returns the seeded org id,
    /// or None when the env carries no org.
    pub fn seed_default_organization(&self) -> Result<Option<String>, DbError> {
        let env = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        let (Some(org_id), Some(node_id)) = (env("ORG_ID"), env("BROKER_NODE_PERSISTENT_ID"))
        else {
            return Ok(None);
        };
        if self.get_organization(&org_id)?.is_some() {
            return Ok(Some(org_id));
        }
        let org = Organization {
            org_id: org_id.clone(),
            name: env("ORG_NAME").unwrap_or_else(|| org_id.clone()),
            broker_node_id: node_id,
            fbr_node_id: env("FBR_NODE_PERSISTENT_ID"),
            timezone: env("DEFAULT_TIMEZONE").unwrap_or_else(|| "UTC".to_string()),
            is_active: true,
            created_at: None,
        };
        self.upsert_organization(&org)?;
        log::info!("seeded default organization {org_id}");
        Ok(Some(org_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_util::open_temp;

    fn org(id: &str, active: bool) -> Organization {
        Organization {
            org_id: id.into(),
            name: format!("Org {id}"),
            broker_node_id: "node-1".into(),
            fbr_node_id: Some("node-2".into()),
            timezone: "America/Chicago".into(),
            is_active: active,
            created_at: None,
        }
    }

    #[test]
    fn upsert_and_read_back() {
        let (_dir, db) = open_temp();
        db.upsert_organization(&org("a", true)).unwrap();

        let stored = db.get_organization("a").unwrap().unwrap();
        assert_eq!(stored.name, "Org a");
        assert_eq!(stored.fbr_node_id.as_deref(), Some("node-2"));
        assert!(stored.is_active);
    }

    #[test]
    fn active_listing_excludes_inactive() {
        let (_dir, db) = open_temp();
        db.upsert_organization(&org("a", true)).unwrap();
        db.upsert_organization(&org("b", false)).unwrap();
        db.upsert_organization(&org("c", true)).unwrap();

        let active = db.active_organizations().unwrap();
        assert_eq!(
            active.iter().map(|o| o.org_id.as_str()).collect::<Vec<_>>(),
            ["a", "c"]
        );
    }

    #[test]
    fn upsert_updates_in_place() {
        let (_dir, db) = open_temp();
        db.upsert_organization(&org("a", true)).unwrap();
        let mut changed = org("a", false);
        changed.timezone = "UTC".into();
        db.upsert_organization(&changed).unwrap();

        let stored = db.get_organization("a").unwrap().unwrap();
        assert_eq!(stored.timezone, "UTC");
        assert!(!stored.is_active);
        let count: i64 = db
            .conn_ref()
            .query_row("SELECT COUNT(*) FROM organizations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
