//! Escalation state store: one live row per fingerprint, with expiry.
//!
//! Rows are never partially expired. A row whose `expire_at` has passed reads
//! back as a fresh empty history and is superseded by the next write, so the
//! warning ladder restarts from zero. `prune_expired` only reclaims space.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use serde::Serialize;

use crate::core::errors::{Result, WardenError};
use crate::model::fingerprint::Fingerprint;
use crate::model::history::ActionHistory;

/// A fingerprint's persisted escalation state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EscalationRow {
    pub fingerprint: Fingerprint,
    pub history: ActionHistory,
    pub created_at: DateTime<Utc>,
    pub expire_at: DateTime<Utc>,
}

/// Persistence contract the engine depends on.
pub trait EscalationStore: Send {
    /// Live row for `fingerprint`, or an empty one when absent or expired.
    fn read(&self, fingerprint: &Fingerprint, now: DateTime<Utc>) -> Result<EscalationRow>;

    /// Replace the row with `history`, restarting its expiry window at `now`.
    fn write(
        &self,
        fingerprint: &Fingerprint,
        history: &ActionHistory,
        now: DateTime<Utc>,
    ) -> Result<EscalationRow>;

    /// Delete rows that have already expired. Returns the number removed.
    fn prune_expired(&self, _now: DateTime<Utc>) -> Result<usize> {
        Ok(0)
    }
}

/// SQLite-backed escalation store (WAL mode).
pub struct SqliteEscalationStore {
    conn: Connection,
    path: Option<PathBuf>,
    expiry: TimeDelta,
}

impl SqliteEscalationStore {
    /// Open (or create) the database at `path`, applying schema and PRAGMAs.
    pub fn open(path: &Path, expiry: Duration) -> Result<Self> {
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

        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
            expiry: to_delta(expiry)?,
        })
    }

    /// Private in-memory database, for replays and tests.
    pub fn open_in_memory(expiry: Duration) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        apply_schema(&conn)?;
        Ok(Self {
            conn,
            path: None,
            expiry: to_delta(expiry)?,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Live rows, optionally limited to one namespace, oldest first.
    pub fn live_rows(&self, namespace: Option<&str>, now: DateTime<Utc>) -> Result<Vec<EscalationRow>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT namespace, cluster, entity_kind, entity_name, violation_kind,
                    violation_source, actions, created_at, expire_at
             FROM escalation_state
             WHERE expire_at > ?1 AND (?2 IS NULL OR namespace = ?2)
             ORDER BY created_at ASC",
        )?;
        let raw = stmt
            .query_map(params![stamp(now), namespace], |row| {
                Ok(RawRow {
                    namespace: row.get(0)?,
                    cluster: row.get(1)?,
                    entity_kind: row.get(2)?,
                    entity_name: row.get(3)?,
                    violation_kind: row.get(4)?,
                    violation_source: row.get(5)?,
                    actions: row.get(6)?,
                    created_at: row.get(7)?,
                    expire_at: row.get(8)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        raw.into_iter().map(RawRow::into_row).collect()
    }

    fn fresh(&self, fingerprint: &Fingerprint, now: DateTime<Utc>) -> EscalationRow {
        EscalationRow {
            fingerprint: fingerprint.clone(),
            history: ActionHistory::new(),
            created_at: now,
            expire_at: now + self.expiry,
        }
    }
}

impl EscalationStore for SqliteEscalationStore {
    fn read(&self, fingerprint: &Fingerprint, now: DateTime<Utc>) -> Result<EscalationRow> {
        let found: Option<(String, String, String)> = self
            .conn
            .prepare_cached(
                "SELECT actions, created_at, expire_at FROM escalation_state
                 WHERE namespace = ?1 AND cluster = ?2 AND entity_kind = ?3
                   AND entity_name = ?4 AND violation_kind = ?5 AND violation_source = ?6",
            )?
            .query_row(key_params(fingerprint), |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })
            .optional()?;

        let Some((actions, created_at, expire_at)) = found else {
            return Ok(self.fresh(fingerprint, now));
        };
        let expire_at = parse_stamp(&expire_at)?;
        if expire_at <= now {
            return Ok(self.fresh(fingerprint, now));
        }
        Ok(EscalationRow {
            fingerprint: fingerprint.clone(),
            history: serde_json::from_str(&actions)?,
            created_at: parse_stamp(&created_at)?,
            expire_at,
        })
    }

    fn write(
        &self,
        fingerprint: &Fingerprint,
        history: &ActionHistory,
        now: DateTime<Utc>,
    ) -> Result<EscalationRow> {
        let row = EscalationRow {
            fingerprint: fingerprint.clone(),
            history: history.clone(),
            created_at: now,
            expire_at: now + self.expiry,
        };
        let actions = serde_json::to_string(history)?;
        let [namespace, cluster, entity_kind, entity_name, violation_kind, violation_source] =
            key_params(fingerprint);
        self.conn
            .prepare_cached(
                "INSERT OR REPLACE INTO escalation_state (
                    namespace, cluster, entity_kind, entity_name, violation_kind,
                    violation_source, actions, created_at, expire_at
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
            )?
            .execute(params![
                namespace,
                cluster,
                entity_kind,
                entity_name,
                violation_kind,
                violation_source,
                actions,
                stamp(row.created_at),
                stamp(row.expire_at),
            ])?;
        Ok(row)
    }

    fn prune_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let deleted = self.conn.execute(
            "DELETE FROM escalation_state WHERE expire_at <= ?1",
            params![stamp(now)],
        )?;
        Ok(deleted)
    }
}

// ──────────────────── row decoding ────────────────────

struct RawRow {
    namespace: String,
    cluster: String,
    entity_kind: String,
    entity_name: String,
    violation_kind: String,
    violation_source: String,
    actions: String,
    created_at: String,
    expire_at: String,
}

impl RawRow {
    fn into_row(self) -> Result<EscalationRow> {
        Ok(EscalationRow {
            fingerprint: Fingerprint {
                namespace: self.namespace,
                cluster: self.cluster,
                entity_kind: self.entity_kind.parse()?,
                entity_name: self.entity_name,
                violation_kind: self.violation_kind.parse()?,
                violation_source: self.violation_source,
            },
            history: serde_json::from_str(&self.actions)?,
            created_at: parse_stamp(&self.created_at)?,
            expire_at: parse_stamp(&self.expire_at)?,
        })
    }
}

fn key_params(fingerprint: &Fingerprint) -> [&str; 6] {
    [
        fingerprint.namespace.as_str(),
        fingerprint.cluster.as_str(),
        fingerprint.entity_kind.as_str(),
        fingerprint.entity_name.as_str(),
        fingerprint.violation_kind.as_str(),
        fingerprint.violation_source.as_str(),
    ]
}

/// Fixed-width RFC 3339 so SQL string comparison orders by time.
pub(crate) fn stamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_stamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|error| WardenError::Serialization {
            context: "escalation timestamp",
            details: format!("{raw:?}: {error}"),
        })
}

fn to_delta(expiry: Duration) -> Result<TimeDelta> {
    TimeDelta::from_std(expiry).map_err(|error| WardenError::InvalidConfig {
        details: format!("violation expiry out of range: {error}"),
    })
}

fn apply_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS escalation_state (
            namespace TEXT NOT NULL,
            cluster TEXT NOT NULL,
            entity_kind TEXT NOT NULL,
            entity_name TEXT NOT NULL,
            violation_kind TEXT NOT NULL,
            violation_source TEXT NOT NULL,
            actions TEXT NOT NULL,
            created_at TEXT NOT NULL,
            expire_at TEXT NOT NULL,
            PRIMARY KEY (namespace, cluster, entity_kind, entity_name,
                         violation_kind, violation_source)
        );

        CREATE INDEX IF NOT EXISTS idx_escalation_expire ON escalation_state(expire_at);
        CREATE INDEX IF NOT EXISTS idx_escalation_namespace ON escalation_state(namespace);",
    )?;
    Ok(())
}

// ──────────────────── tests ────────────────────
