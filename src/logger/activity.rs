//! Activity logger thread.
//!
//! The thread owns the `JsonlWriter`; everyone else holds an
//! `ActivityLoggerHandle` and sends `ActivityEvent`s with `try_send`. When the
//! bounded channel is full the event is counted instead of queued, and the
//! count surfaces as one `backpressure` line before the next event written.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

use crate::core::errors::{Result, WardenError};
use crate::logger::jsonl::{EventType, JsonlConfig, JsonlWriter, LogEntry, Severity};
use crate::model::fingerprint::Fingerprint;

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum ActivityEvent {
    DaemonStarted {
        version: String,
        config_hash: String,
        partitions: usize,
    },
    DaemonStopped {
        reason: String,
        uptime_secs: u64,
        observations: u64,
    },
    DecisionTaken {
        fingerprint: Fingerprint,
        verdict: String,
        recorded: Vec<String>,
        dry_run: bool,
    },
    ObservationRejected {
        partition: String,
        code: String,
        message: String,
    },
    ObservationFailed {
        partition: String,
        offset: u64,
        code: String,
        message: String,
    },
    ExecutorFailed {
        fingerprint: Fingerprint,
        code: String,
        message: String,
    },
    NotificationFailed {
        fingerprint: Fingerprint,
        channel: String,
        message: String,
    },
    RowsPruned {
        count: usize,
    },
    /// Stops the logger thread after everything queued before it is written.
    Shutdown,
}

impl ActivityEvent {
    /// The line written for this event; `None` for `Shutdown`.
    fn into_entry(self) -> Option<LogEntry> {
        let entry = match self {
            Self::DaemonStarted {
                version,
                config_hash,
                partitions,
            } => LogEntry::new(EventType::DaemonStart, Severity::Info).details(format!(
                "version={version} config_hash={config_hash} partitions={partitions}"
            )),
            Self::DaemonStopped {
                reason,
                uptime_secs,
                observations,
            } => LogEntry::new(EventType::DaemonStop, Severity::Info).details(format!(
                "reason={reason} uptime={uptime_secs}s observations={observations}"
            )),
            Self::DecisionTaken {
                fingerprint,
                verdict,
                recorded,
                dry_run,
            } => {
                let mut entry = LogEntry::new(EventType::Decision, Severity::Info).about(&fingerprint);
                entry.verdict = Some(verdict);
                entry.outcomes = recorded;
                if dry_run { entry.details("dry_run") } else { entry }
            }
            Self::ObservationRejected {
                partition,
                code,
                message,
            } => LogEntry::new(EventType::ObservationRejected, Severity::Warning)
                .in_partition(partition)
                .failed(Some(code), message),
            Self::ObservationFailed {
                partition,
                offset,
                code,
                message,
            } => LogEntry::new(EventType::ObservationFailed, Severity::Error)
                .in_partition(partition)
                .details(format!("offset={offset}"))
                .failed(Some(code), message),
            Self::ExecutorFailed {
                fingerprint,
                code,
                message,
            } => LogEntry::new(EventType::ExecutorFailure, Severity::Error)
                .about(&fingerprint)
                .failed(Some(code), message),
            Self::NotificationFailed {
                fingerprint,
                channel,
                message,
            } => LogEntry::new(EventType::NotificationFailure, Severity::Warning)
                .about(&fingerprint)
                .details(format!("channel={channel}"))
                .failed(None, message),
            Self::RowsPruned { count } => {
                LogEntry::new(EventType::Prune, Severity::Info).details(format!("rows={count}"))
            }
            Self::Shutdown => return None,
        };
        Some(entry)
    }
}

/// Sending side of the activity logger. Clones share the channel and the
/// dropped-event counter.
#[derive(Clone)]
pub struct ActivityLoggerHandle {
    tx: Sender<ActivityEvent>,
    dropped: Arc<AtomicU64>,
}

impl ActivityLoggerHandle {
    /// Never blocks. A full channel drops the event and bumps the counter.
    pub fn send(&self, event: ActivityEvent) {
        if let Err(TrySendError::Full(_)) = self.tx.try_send(event) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Events dropped since the logger last reported backpressure.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Queue the shutdown sentinel, waiting for room if necessary.
    pub fn shutdown(&self) {
        let _ = self.tx.send(ActivityEvent::Shutdown);
    }
}

/// Start the `cw-activity` thread. It exits on `shutdown()` or once every
/// handle is dropped, flushing and syncing the log either way.
pub fn spawn_logger(
    jsonl: JsonlConfig,
    capacity: Option<usize>,
) -> Result<(ActivityLoggerHandle, JoinHandle<()>)> {
    let (tx, rx) = bounded(capacity.unwrap_or(DEFAULT_CAPACITY));
    let dropped = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&dropped);

    let join = thread::Builder::new()
        .name("cw-activity".to_string())
        .spawn(move || drain_events(&rx, JsonlWriter::open(jsonl), &counter))
        .map_err(|e| WardenError::Runtime {
            details: format!("failed to spawn activity logger thread: {e}"),
        })?;

    Ok((ActivityLoggerHandle { tx, dropped }, join))
}

fn drain_events(rx: &Receiver<ActivityEvent>, mut writer: JsonlWriter, dropped: &AtomicU64) {
    for event in rx {
        let lost = dropped.swap(0, Ordering::Relaxed);
        if lost > 0 {
            writer.write_entry(
                &LogEntry::new(EventType::Backpressure, Severity::Warning)
                    .details(format!("{lost} activity events dropped")),
            );
        }
        match event.into_entry() {
            Some(entry) => writer.write_entry(&entry),
            None => break,
        }
    }
    writer.flush();
    writer.fsync();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::time::Duration;

    use crate::model::entity::EntityKind;
    use crate::model::violation::ViolationKind;

    fn log_in(dir: &Path) -> JsonlConfig {
        JsonlConfig {
            path: dir.join("activity.jsonl"),
            fallback_path: None,
            max_size_bytes: 1 << 20,
            keep_rotated: 1,
            fsync_every: Duration::from_secs(60),
        }
    }

    fn read_entries(dir: &Path) -> Vec<LogEntry> {
        std::fs::read_to_string(dir.join("activity.jsonl"))
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    fn fingerprint() -> Fingerprint {
        Fingerprint {
            namespace: "payments".to_string(),
            cluster: "prod".to_string(),
            entity_kind: EntityKind::Pod,
            entity_name: "api-0".to_string(),
            violation_kind: ViolationKind::Privileged,
            violation_source: "app".to_string(),
        }
    }

    #[test]
    fn shutdown_flushes_queued_events() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, join) = spawn_logger(log_in(dir.path()), Some(8)).unwrap();
        handle.send(ActivityEvent::DaemonStarted {
            version: "0.1.0".to_string(),
            config_hash: "abc".to_string(),
            partitions: 2,
        });
        handle.shutdown();
        join.join().unwrap();

        let entries = read_entries(dir.path());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event, EventType::DaemonStart);
        assert!(entries[0].details.as_deref().unwrap().contains("partitions=2"));
    }

    #[test]
    fn events_map_to_structured_lines() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, join) = spawn_logger(log_in(dir.path()), Some(8)).unwrap();
        let other = handle.clone();

        handle.send(ActivityEvent::DecisionTaken {
            fingerprint: fingerprint(),
            verdict: "notify".to_string(),
            recorded: vec!["notify".to_string()],
            dry_run: true,
        });
        other.send(ActivityEvent::ExecutorFailed {
            fingerprint: fingerprint(),
            code: "CW-2201".to_string(),
            message: "kubectl exited 1".to_string(),
        });
        other.send(ActivityEvent::ObservationRejected {
            partition: "p0".to_string(),
            code: "CW-2001".to_string(),
            message: "unknown entity kind: StatefulSet".to_string(),
        });
        handle.shutdown();
        join.join().unwrap();

        let entries = read_entries(dir.path());
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].outcomes, vec!["notify".to_string()]);
        assert_eq!(entries[0].details.as_deref(), Some("dry_run"));
        assert_eq!(
            entries[1].error.as_ref().and_then(|e| e.code.as_deref()),
            Some("CW-2201")
        );
        assert_eq!(entries[1].subject.as_ref().unwrap().entity_name, "api-0");
        assert_eq!(entries[2].partition.as_deref(), Some("p0"));
    }

    #[test]
    fn dropping_every_handle_stops_the_thread() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, join) = spawn_logger(log_in(dir.path()), Some(2)).unwrap();
        assert_eq!(handle.dropped_events(), 0);
        handle.send(ActivityEvent::RowsPruned { count: 4 });
        drop(handle);
        join.join().unwrap();

        let entries = read_entries(dir.path());
        assert_eq!(entries[0].event, EventType::Prune);
    }

    #[test]
    fn shutdown_sentinel_has_no_line() {
        assert!(ActivityEvent::Shutdown.into_entry().is_none());
    }
}
