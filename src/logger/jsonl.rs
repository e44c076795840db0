//! JSONL activity stream: one self-contained JSON object per decision-level
//! event, appended so other tools can tail it.
//!
//! Each line is built in memory and written with a single `write_all`, so a
//! tailing reader never sees an interleaved partial line.
//!
//! When the disk misbehaves the sink steps down, and never back up:
//! primary file, fallback file, stderr (`[CW-JSONL]` prefix), discard.

#![allow(missing_docs)]

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::core::errors::{Result, WardenError};
use crate::model::fingerprint::Fingerprint;

// ──────────────────── entries ────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    DaemonStart,
    DaemonStop,
    Decision,
    ObservationRejected,
    ObservationFailed,
    ExecutorFailure,
    NotificationFailure,
    Prune,
    Backpressure,
}

/// The violation a line is about: the six fingerprint fields plus a short
/// digest for grepping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub digest: String,
    pub namespace: String,
    pub cluster: String,
    pub entity_kind: String,
    pub entity_name: String,
    pub violation_kind: String,
    pub violation_source: String,
}

impl From<&Fingerprint> for Subject {
    fn from(fp: &Fingerprint) -> Self {
        Self {
            digest: fp.digest(),
            namespace: fp.namespace.clone(),
            cluster: fp.cluster.clone(),
            entity_kind: fp.entity_kind.to_string(),
            entity_name: fp.entity_name.clone(),
            violation_kind: fp.violation_kind.to_string(),
            violation_source: fp.violation_source.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// `CW-xxxx`, absent when the failure has no code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
}

/// One activity line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub ts: String,
    pub event: EventType,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Subject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outcomes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl LogEntry {
    /// Entry stamped with the current UTC time (millisecond precision).
    pub fn new(event: EventType, severity: Severity) -> Self {
        Self {
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            event,
            severity,
            subject: None,
            verdict: None,
            outcomes: Vec::new(),
            partition: None,
            error: None,
            details: None,
        }
    }

    #[must_use]
    pub fn about(mut self, fingerprint: &Fingerprint) -> Self {
        self.subject = Some(Subject::from(fingerprint));
        self
    }

    #[must_use]
    pub fn in_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = Some(partition.into());
        self
    }

    #[must_use]
    pub fn failed(mut self, code: Option<String>, message: impl Into<String>) -> Self {
        self.error = Some(ErrorInfo {
            code,
            message: message.into(),
        });
        self
    }

    #[must_use]
    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }
}

// ──────────────────── writer ────────────────────

#[derive(Debug, Clone)]
pub struct JsonlConfig {
    pub path: PathBuf,
    pub fallback_path: Option<PathBuf>,
    /// Rotate once the current file would exceed this many bytes.
    pub max_size_bytes: u64,
    /// Rotated generations kept next to the live file (`.1` is newest).
    pub keep_rotated: u32,
    pub fsync_every: Duration,
}

impl JsonlConfig {
    /// Defaults for a given primary path; the fallback lives in the temp dir.
    #[must_use]
    pub fn for_path(path: PathBuf) -> Self {
        Self {
            path,
            fallback_path: Some(std::env::temp_dir().join("cwarden-activity.jsonl")),
            max_size_bytes: 32 * 1024 * 1024,
            keep_rotated: 4,
            fsync_every: Duration::from_secs(5),
        }
    }
}

/// An open log file and how much of it is already used.
struct LogFile {
    path: PathBuf,
    out: BufWriter<File>,
    len: u64,
    fallback: bool,
}

impl LogFile {
    fn open(path: &Path, fallback: bool) -> Result<Self> {
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            fs::create_dir_all(dir).map_err(|source| WardenError::io(dir, source))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| WardenError::io(path, source))?;
        let len = file.metadata().map_or(0, |meta| meta.len());
        Ok(Self {
            path: path.to_path_buf(),
            out: BufWriter::new(file),
            len,
            fallback,
        })
    }

    fn append(&mut self, line: &[u8]) -> io::Result<()> {
        self.out.write_all(line)?;
        self.len += line.len() as u64;
        Ok(())
    }

    fn sync(&mut self) {
        if self.out.flush().is_ok() {
            let _ = self.out.get_ref().sync_data();
        }
    }
}

enum Sink {
    File(LogFile),
    Stderr,
    Discard,
}

/// Append-only JSONL writer with size rotation and the step-down chain above.
pub struct JsonlWriter {
    config: JsonlConfig,
    sink: Sink,
    last_sync: Instant,
}

impl JsonlWriter {
    pub fn open(config: JsonlConfig) -> Self {
        let sink = match LogFile::open(&config.path, false) {
            Ok(file) => Sink::File(file),
            Err(error) => {
                let _ = writeln!(io::stderr(), "[CW-JSONL] {error}");
                fallback_sink(config.fallback_path.as_deref())
            }
        };
        Self {
            config,
            sink,
            last_sync: Instant::now(),
        }
    }

    pub fn write_entry(&mut self, entry: &LogEntry) {
        match serde_json::to_vec(entry) {
            Ok(mut line) => {
                line.push(b'\n');
                self.write_line(&line);
            }
            Err(error) => {
                let _ = writeln!(io::stderr(), "[CW-JSONL] serialize error: {error}");
            }
        }
    }

    pub fn flush(&mut self) {
        if let Sink::File(file) = &mut self.sink {
            let _ = file.out.flush();
        }
    }

    pub fn fsync(&mut self) {
        if let Sink::File(file) = &mut self.sink {
            file.sync();
        }
        self.last_sync = Instant::now();
    }

    /// Where lines currently go: `primary`, `fallback`, `stderr` or `discard`.
    pub fn state(&self) -> &'static str {
        match &self.sink {
            Sink::File(file) if file.fallback => "fallback",
            Sink::File(_) => "primary",
            Sink::Stderr => "stderr",
            Sink::Discard => "discard",
        }
    }

    fn write_line(&mut self, line: &[u8]) {
        let mut rotated = false;
        loop {
            match &mut self.sink {
                Sink::File(file) => {
                    let full = file.len > 0 && file.len + line.len() as u64 > self.config.max_size_bytes;
                    if full && !rotated {
                        rotated = true;
                        self.rotate();
                        continue;
                    }
                    if file.append(line).is_ok() {
                        if self.last_sync.elapsed() >= self.config.fsync_every {
                            self.fsync();
                        }
                        return;
                    }
                    self.step_down();
                }
                Sink::Stderr => {
                    let mut err = io::stderr().lock();
                    if err.write_all(b"[CW-JSONL] ").is_err() || err.write_all(line).is_err() {
                        drop(err);
                        self.sink = Sink::Discard;
                    }
                    return;
                }
                Sink::Discard => return,
            }
        }
    }

    fn step_down(&mut self) {
        self.sink = match std::mem::replace(&mut self.sink, Sink::Discard) {
            Sink::File(file) if !file.fallback => fallback_sink(self.config.fallback_path.as_deref()),
            Sink::File(_) => Sink::Stderr,
            Sink::Stderr | Sink::Discard => Sink::Discard,
        };
    }

    /// `log` → `log.1` → `log.2` …; the oldest generation is dropped.
    fn rotate(&mut self) {
        let current = match std::mem::replace(&mut self.sink, Sink::Discard) {
            Sink::File(file) => file,
            other => {
                self.sink = other;
                return;
            }
        };
        let LogFile {
            path,
            mut out,
            fallback,
            ..
        } = current;
        let _ = out.flush();
        drop(out);

        let keep = self.config.keep_rotated;
        if keep == 0 {
            let _ = fs::remove_file(&path);
        } else {
            for generation in (1..keep).rev() {
                let _ = fs::rename(generation_path(&path, generation), generation_path(&path, generation + 1));
            }
            let _ = fs::rename(&path, generation_path(&path, 1));
        }

        self.sink = match LogFile::open(&path, fallback) {
            Ok(file) => Sink::File(file),
            Err(_) if fallback => Sink::Stderr,
            Err(_) => fallback_sink(self.config.fallback_path.as_deref()),
        };
    }
}

fn fallback_sink(fallback: Option<&Path>) -> Sink {
    match fallback.map(|path| LogFile::open(path, true)) {
        Some(Ok(file)) => {
            let _ = writeln!(
                io::stderr(),
                "[CW-JSONL] activity log moved to fallback {}",
                file.path.display()
            );
            Sink::File(file)
        }
        _ => {
            let _ = writeln!(io::stderr(), "[CW-JSONL] no writable activity log, using stderr");
            Sink::Stderr
        }
    }
}

fn generation_path(base: &Path, generation: u32) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{generation}"));
    PathBuf::from(name)
}
