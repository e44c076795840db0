//! Audit log: every observation, and every outcome fanned out to four
//! query-oriented views.
//!
//! The views are plain append-only tables, each carrying full context, so
//! reporting queries never need joins:
//!
//! | table                 | keyed for lookups by          |
//! |-----------------------|-------------------------------|
//! | `alog_namespace_kind` | namespace, entity kind        |
//! | `alog_kind`           | entity kind                   |
//! | `alog_violation_kind` | violation kind                |
//! | `alog_outcome`        | outcome kind                  |
//!
//! One outcome lands in all four or in none.

#![allow(missing_docs)]

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags, params};

use crate::core::errors::{Result, WardenError};
use crate::model::fingerprint::Fingerprint;
use crate::store::escalation::stamp;

/// Audit contract the engine depends on.
pub trait AuditLog: Send {
    fn record_observation(&self, fingerprint: &Fingerprint, at: DateTime<Utc>) -> Result<()>;

    fn record_action(&self, fingerprint: &Fingerprint, outcome: &str, at: DateTime<Utc>)
    -> Result<()>;
}

/// The four action views.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditView {
    ByNamespaceKind,
    ByKind,
    ByViolationKind,
    ByOutcome,
}

impl AuditView {
    pub const ALL: [Self; 4] = [
        Self::ByNamespaceKind,
        Self::ByKind,
        Self::ByViolationKind,
        Self::ByOutcome,
    ];

    #[must_use]
    pub const fn table(self) -> &'static str {
        match self {
            Self::ByNamespaceKind => "alog_namespace_kind",
            Self::ByKind => "alog_kind",
            Self::ByViolationKind => "alog_violation_kind",
            Self::ByOutcome => "alog_outcome",
        }
    }
}

/// SQLite-backed audit log.
pub struct SqliteAuditLog {
    conn: Connection,
}

impl SqliteAuditLog {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|source| WardenError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        crate::store::apply_pragmas(&conn)?;
        apply_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        apply_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn observation_count(&self) -> Result<i64> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM vlog", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Rows in one view, optionally restricted to one outcome kind.
    pub fn action_count(&self, view: AuditView, outcome: Option<&str>) -> Result<i64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE (?1 IS NULL OR outcome = ?1)",
            view.table()
        );
        let count = self.conn.query_row(&sql, params![outcome], |row| row.get(0))?;
        Ok(count)
    }
}

impl AuditLog for SqliteAuditLog {
    fn record_observation(&self, fingerprint: &Fingerprint, at: DateTime<Utc>) -> Result<()> {
        self.conn
            .prepare_cached(
                "INSERT INTO vlog (
                    observed_at, namespace, cluster, entity_kind, entity_name,
                    violation_kind, violation_source
                ) VALUES (?1,?2,?3,?4,?5,?6,?7)",
            )?
            .execute(params![
                stamp(at),
                fingerprint.namespace,
                fingerprint.cluster,
                fingerprint.entity_kind.as_str(),
                fingerprint.entity_name,
                fingerprint.violation_kind.as_str(),
                fingerprint.violation_source,
            ])?;
        Ok(())
    }

    fn record_action(
        &self,
        fingerprint: &Fingerprint,
        outcome: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let acted_at = stamp(at);
        let tx = self.conn.unchecked_transaction()?;
        for view in AuditView::ALL {
            let sql = format!(
                "INSERT INTO {} (
                    acted_at, outcome, namespace, cluster, entity_kind, entity_name,
                    violation_kind, violation_source
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
                view.table()
            );
            tx.prepare_cached(&sql)?.execute(params![
                acted_at,
                outcome,
                fingerprint.namespace,
                fingerprint.cluster,
                fingerprint.entity_kind.as_str(),
                fingerprint.entity_name,
                fingerprint.violation_kind.as_str(),
                fingerprint.violation_source,
            ])?;
        }
        tx.commit()?;
        Ok(())
    }
}

fn apply_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS vlog (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            observed_at TEXT NOT NULL,
            namespace TEXT NOT NULL,
            cluster TEXT NOT NULL,
            entity_kind TEXT NOT NULL,
            entity_name TEXT NOT NULL,
            violation_kind TEXT NOT NULL,
            violation_source TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_vlog_observed ON vlog(observed_at);",
    )?;
    for view in AuditView::ALL {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                acted_at TEXT NOT NULL,
                outcome TEXT NOT NULL,
                namespace TEXT NOT NULL,
                cluster TEXT NOT NULL,
                entity_kind TEXT NOT NULL,
                entity_name TEXT NOT NULL,
                violation_kind TEXT NOT NULL,
                violation_source TEXT NOT NULL
            );",
            table = view.table()
        ))?;
    }
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_alog_ns_kind ON alog_namespace_kind(namespace, entity_kind);
         CREATE INDEX IF NOT EXISTS idx_alog_kind ON alog_kind(entity_kind);
         CREATE INDEX IF NOT EXISTS idx_alog_violation ON alog_violation_kind(violation_kind);
         CREATE INDEX IF NOT EXISTS idx_alog_outcome ON alog_outcome(outcome);",
    )?;
    Ok(())
}
