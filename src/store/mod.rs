//! Persistent state (SQLite, WAL): escalation rows and partition offsets.

pub mod escalation;
pub mod offsets;

use rusqlite::Connection;

use crate::core::errors::Result;

pub(crate) fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA temp_store = MEMORY;
         PRAGMA busy_timeout = 5000;",
    )?;
    let mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        tracing::warn!(%mode, "requested WAL journal mode but sqlite refused");
    }
    Ok(())
}
