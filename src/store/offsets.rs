//! Committed read offsets per observation partition.
//!
//! An offset is the number of lines of a partition that have been fully
//! processed. Readers resume after it on restart; an observation whose
//! processing failed is never committed and is read again.

#![allow(missing_docs)]

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};

use crate::core::errors::{Result, WardenError};
use crate::store::escalation::stamp;

pub struct SqliteOffsetStore {
    conn: Connection,
}

impl SqliteOffsetStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|source| WardenError::io(parent, source))?;
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

    /// Committed offset, zero for a partition never seen.
    pub fn committed(&self, partition: &str) -> Result<u64> {
        let offset: Option<i64> = self
            .conn
            .prepare_cached("SELECT committed FROM partition_offsets WHERE partition = ?1")?
            .query_row(params![partition], |row| row.get(0))
            .optional()?;
        Ok(offset.map_or(0, |o| u64::try_from(o).unwrap_or(0)))
    }

    /// Record that `offset` lines of `partition` are done. Offsets only move
    /// forward.
    pub fn commit(&self, partition: &str, offset: u64, now: DateTime<Utc>) -> Result<()> {
        let offset = i64::try_from(offset).map_err(|_| WardenError::StoreUnavailable {
            context: "offsets",
            details: format!("offset {offset} out of range"),
        })?;
        self.conn
            .prepare_cached(
                "INSERT INTO partition_offsets (partition, committed, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(partition) DO UPDATE SET
                    committed = MAX(committed, excluded.committed),
                    updated_at = excluded.updated_at",
            )?
            .execute(params![partition, offset, stamp(now)])?;
        Ok(())
    }
}

fn apply_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS partition_offsets (
            partition  TEXT PRIMARY KEY,
            committed  INTEGER NOT NULL,
            updated_at TEXT NOT NULL
        );",
    )?;
    Ok(())
}
