//! Audit trail (SQLite) and activity stream (JSONL, dedicated writer thread).

pub mod activity;
pub mod audit;
pub mod jsonl;
