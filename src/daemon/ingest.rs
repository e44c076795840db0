//! Observation ingestion: partition reader threads and the per-payload
//! disposition shared by the daemon loop and one-shot replays.
//!
//! Readers do no decoding. Each forwards raw lines, tagged with partition and
//! line number, into one bounded queue; ordering within a partition is kept.

#![allow(missing_docs)]

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{SendTimeoutError, Sender};
use serde::Serialize;

use crate::core::errors::{Result, WardenError};
use crate::engine::{Interrupted, ObservationReport, Progress, RemediationEngine};
use crate::model::observation::Observation;

/// Partition path that means standard input.
pub const STDIN_PARTITION: &str = "-";

const SEND_TICK: Duration = Duration::from_millis(200);

/// One raw observation line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionRecord {
    pub partition: Arc<str>,
    /// 1-based line number; committing it marks every earlier line done.
    pub offset: u64,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
pub struct ReaderOptions {
    pub follow: bool,
    pub poll_interval: Duration,
    /// Lines up to and including this one were committed by an earlier run.
    pub start_after: u64,
}

#[must_use]
pub fn is_stdin(path: &Path) -> bool {
    path.as_os_str() == STDIN_PARTITION
}

/// Stable partition name used for offsets and logs.
#[must_use]
pub fn partition_name(path: &Path) -> String {
    if is_stdin(path) {
        "stdin".to_string()
    } else {
        path.display().to_string()
    }
}

/// Open `path` and forward its lines to `tx` on a dedicated thread.
///
/// The thread exits at end of input (unless following), when `stop` is set,
/// or when the queue's receiver is gone.
pub fn spawn_reader(
    path: &Path,
    options: ReaderOptions,
    tx: Sender<PartitionRecord>,
    stop: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    let source: Box<dyn BufRead + Send> = if is_stdin(path) {
        Box::new(BufReader::new(io::stdin()))
    } else {
        let file = File::open(path).map_err(|source| WardenError::io(path, source))?;
        Box::new(BufReader::new(file))
    };
    let name: Arc<str> = Arc::from(partition_name(path));
    let thread_name = format!("cw-read-{}", short_name(path));

    thread::Builder::new()
        .name(thread_name)
        .spawn(move || reader_main(&name, source, options, &tx, &stop))
        .map_err(|e| WardenError::Runtime {
            details: format!("failed to spawn partition reader: {e}"),
        })
}

fn short_name(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| "stdin".to_string(), |n| n.to_string_lossy().into_owned())
}

fn reader_main(
    name: &Arc<str>,
    mut source: Box<dyn BufRead + Send>,
    options: ReaderOptions,
    tx: &Sender<PartitionRecord>,
    stop: &AtomicBool,
) {
    let mut line = Vec::new();
    let mut line_no: u64 = 0;

    while !stop.load(Ordering::Relaxed) {
        let read = match source.read_until(b'\n', &mut line) {
            Ok(read) => read,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) => {
                tracing::error!(partition = %name, %error, "partition read failed");
                return;
            }
        };

        let complete = line.last() == Some(&b'\n');
        if (read == 0 && line.is_empty()) || (!complete && options.follow) {
            if !options.follow {
                return;
            }
            thread::sleep(options.poll_interval);
            continue;
        }

        line_no += 1;
        let payload = trim_ascii(&line);
        if line_no > options.start_after && !payload.is_empty() {
            let record = PartitionRecord {
                partition: Arc::clone(name),
                offset: line_no,
                payload: payload.to_vec(),
            };
            if !forward(tx, record, stop) {
                return;
            }
        }
        line.clear();
    }
}

/// Blocking send that still notices shutdown. Returns false when the reader
/// should exit.
fn forward(tx: &Sender<PartitionRecord>, mut record: PartitionRecord, stop: &AtomicBool) -> bool {
    loop {
        match tx.send_timeout(record, SEND_TICK) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(back)) => {
                if stop.load(Ordering::Relaxed) {
                    return false;
                }
                record = back;
            }
            Err(SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}

fn trim_ascii(raw: &[u8]) -> &[u8] {
    let start = raw.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(raw.len());
    let end = raw.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |i| i + 1);
    &raw[start..end]
}

// ──────────────────── disposition ────────────────────

/// What became of one payload.
#[derive(Debug)]
pub enum Disposition {
    Processed(ObservationReport),
    /// Could not be decoded; committed and skipped.
    Rejected(WardenError),
    /// Processing failed permanently; committed and skipped.
    Failed(WardenError),
    /// Processing failed transiently; must not be committed. The progress
    /// goes back into the next attempt on the same payload.
    Retry(Box<Interrupted>),
}

/// Decode and process one payload, continuing from `progress` when an
/// earlier attempt was interrupted.
pub fn handle_payload(
    engine: &RemediationEngine,
    payload: &[u8],
    default_cluster: &str,
    progress: Progress,
    now: DateTime<Utc>,
) -> Disposition {
    let observation = match Observation::decode(payload, default_cluster) {
        Ok(observation) => observation,
        Err(error) => return Disposition::Rejected(error),
    };
    match engine.resume(&observation, progress, now) {
        Ok(report) => Disposition::Processed(report),
        Err(interrupted) if interrupted.error.is_retryable() => {
            Disposition::Retry(Box::new(interrupted))
        }
        Err(interrupted) => Disposition::Failed(interrupted.error),
    }
}

// ──────────────────── replay ────────────────────

/// One rejected or failed line of a replay.
#[derive(Debug, Clone, Serialize)]
pub struct ReplayError {
    pub line: u64,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplayedObservation {
    pub line: u64,
    #[serde(flatten)]
    pub report: ObservationReport,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplaySummary {
    pub file: PathBuf,
    pub lines: u64,
    pub observations: Vec<ReplayedObservation>,
    pub errors: Vec<ReplayError>,
}

/// Process every line of `path` once, in order.
///
/// A transient failure stops the replay with that error; everything before it
/// has been applied.
pub fn replay_file(
    engine: &RemediationEngine,
    path: &Path,
    default_cluster: &str,
) -> Result<ReplaySummary> {
    let file = File::open(path).map_err(|source| WardenError::io(path, source))?;
    let mut summary = ReplaySummary {
        file: path.to_path_buf(),
        ..ReplaySummary::default()
    };

    for (index, line) in BufReader::new(file).split(b'\n').enumerate() {
        let line = line.map_err(|source| WardenError::io(path, source))?;
        let line_no = index as u64 + 1;
        summary.lines = line_no;
        let payload = trim_ascii(&line);
        if payload.is_empty() {
            continue;
        }
        match handle_payload(engine, payload, default_cluster, Progress::default(), Utc::now()) {
            Disposition::Processed(report) => summary.observations.push(ReplayedObservation {
                line: line_no,
                report,
            }),
            Disposition::Rejected(error) | Disposition::Failed(error) => {
                tracing::warn!(line = line_no, code = error.code(), %error, "observation skipped");
                summary.errors.push(ReplayError {
                    line: line_no,
                    code: error.code().to_string(),
                    message: error.to_string(),
                });
            }
            Disposition::Retry(interrupted) => return Err(interrupted.error),
        }
    }
    engine.drain();
    Ok(summary)
}
