//! Daemon subsystem: partition ingestion, the decision loop, signal handling,
//! and the cluster-facing adapters (kubectl executor, notifications).

pub mod executor;
#[cfg(feature = "daemon")]
pub mod ingest;
#[cfg(feature = "daemon")]
pub mod loop_main;
pub mod notifications;
#[cfg(feature = "daemon")]
pub mod signals;
