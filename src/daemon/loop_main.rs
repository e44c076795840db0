//! Main decision loop.
//!
//! Architecture: one process, several threads, bounded crossbeam channels:
//! - **Reader threads** (one per partition): forward raw lines into the queue
//! - **Decision loop** (main): decode, decide, act and persist, one
//!   observation at a time, so at most one decision per fingerprint is in
//!   flight
//! - **Chat worker**: delivers chat alerts in order, spaced by the chat throttle
//! - **Logger thread**: writes the JSONL activity log
//!
//! A transient failure leaves the observation uncommitted; the loop retries it
//! with capped backoff before taking anything else off the queue, resuming at
//! the violation that failed. Committed
//! offsets are persisted, so a restart resumes after the last committed line.

#![allow(missing_docs)]

use std::path::PathBuf;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;
use crossbeam_channel::{RecvTimeoutError, bounded};
use serde::Serialize;

use crate::core::config::Config;
use crate::core::errors::{Result, WardenError};
use crate::daemon::ingest::{
    Disposition, PartitionRecord, ReaderOptions, handle_payload, is_stdin, partition_name,
    spawn_reader,
};
use crate::daemon::signals::SignalHandler;
use crate::engine::{Progress, RemediationEngine};
use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle, spawn_logger};
use crate::logger::jsonl::JsonlConfig;
use crate::store::offsets::SqliteOffsetStore;

// ──────────────────── timing ────────────────────

/// How long the loop waits on the queue before re-checking signals.
const LOOP_TICK: Duration = Duration::from_millis(250);
const RETRY_INITIAL: Duration = Duration::from_millis(500);
const RETRY_MAX: Duration = Duration::from_secs(30);
const ACTIVITY_CHANNEL_CAP: usize = 1024;

// ──────────────────── stats ────────────────────

/// Counters reported at shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DaemonStats {
    /// Records taken off the queue.
    pub observations: u64,
    pub processed: u64,
    pub rejected: u64,
    pub failed: u64,
    /// Transient failures; each one is retried.
    pub retries: u64,
    pub pruned: u64,
}

struct Reader {
    partition: String,
    stdin: bool,
    join: JoinHandle<()>,
}

// ──────────────────── daemon ────────────────────

pub struct RemediationDaemon {
    config: Config,
    engine: RemediationEngine,
    offsets: SqliteOffsetStore,
    signals: SignalHandler,
    logger_handle: Option<ActivityLoggerHandle>,
    logger_join: Option<JoinHandle<()>>,
    stats: DaemonStats,
    start_time: Instant,
}

impl RemediationDaemon {
    /// Build the daemon with production collaborators and OS signal hooks.
    pub fn init(config: Config) -> Result<Self> {
        let (logger_handle, logger_join) = spawn_logger(
            JsonlConfig::for_path(config.paths.activity_log.clone()),
            Some(ACTIVITY_CHANNEL_CAP),
        )?;
        let engine = RemediationEngine::from_config(&config)?.with_activity(logger_handle.clone());
        let offsets = SqliteOffsetStore::open(&config.paths.state_db)?;

        let mut daemon = Self::from_parts(config, engine, offsets, SignalHandler::new());
        daemon.logger_handle = Some(logger_handle);
        daemon.logger_join = Some(logger_join);
        Ok(daemon)
    }

    /// Build from explicit parts, without an activity log.
    pub fn from_parts(
        config: Config,
        engine: RemediationEngine,
        offsets: SqliteOffsetStore,
        signals: SignalHandler,
    ) -> Self {
        Self {
            config,
            engine,
            offsets,
            signals,
            logger_handle: None,
            logger_join: None,
            stats: DaemonStats::default(),
            start_time: Instant::now(),
        }
    }

    pub fn signals(&self) -> &SignalHandler {
        &self.signals
    }

    pub fn offsets(&self) -> &SqliteOffsetStore {
        &self.offsets
    }

    /// Run until shutdown is signalled or every partition is exhausted.
    pub fn run(&mut self) -> Result<DaemonStats> {
        let config_hash = self.config.stable_hash().unwrap_or_default();
        let partitions = self.config.ingest.partitions.clone();
        tracing::info!(
            version = env!("CARGO_PKG_VERSION"),
            %config_hash,
            partitions = partitions.len(),
            safe_mode = self.config.engine.safe_mode,
            dry_run = self.config.engine.dry_run,
            "daemon starting"
        );
        self.emit(ActivityEvent::DaemonStarted {
            version: env!("CARGO_PKG_VERSION").to_string(),
            config_hash,
            partitions: partitions.len(),
        });

        let (tx, rx) = bounded::<PartitionRecord>(self.config.ingest.queue_capacity);
        let readers = match self.spawn_readers(&partitions, &tx) {
            Ok(readers) => readers,
            Err(error) => {
                self.signals.request_shutdown();
                self.stop_logger();
                return Err(error);
            }
        };
        drop(tx);

        let mut pending: Option<(PartitionRecord, Progress)> = None;
        let mut backoff = RETRY_INITIAL;

        // ──────── main decision loop ────────
        let reason = loop {
            if self.signals.should_shutdown() {
                break "signal";
            }
            if self.signals.should_prune() {
                self.prune();
            }

            let (record, progress) = match pending.take() {
                Some(pending) => pending,
                None => match rx.recv_timeout(LOOP_TICK) {
                    Ok(record) => {
                        self.stats.observations += 1;
                        (record, Progress::default())
                    }
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break "partitions exhausted",
                },
            };

            let disposition = handle_payload(
                &self.engine,
                &record.payload,
                &self.config.engine.cluster_name,
                progress,
                Utc::now(),
            );
            self.account(&record, &disposition);
            if let Disposition::Retry(interrupted) = disposition {
                pending = Some((record, interrupted.progress));
                self.sleep_unless_shutdown(backoff);
                backoff = (backoff * 2).min(RETRY_MAX);
            } else {
                backoff = RETRY_INITIAL;
                self.commit(&record);
            }
        };

        if let Some((record, _)) = pending {
            tracing::warn!(
                partition = %record.partition,
                offset = record.offset,
                "shutting down with an uncommitted observation"
            );
        }
        drop(rx);
        self.shutdown(readers, reason);
        Ok(self.stats.clone())
    }

    fn spawn_readers(
        &self,
        partitions: &[PathBuf],
        tx: &crossbeam_channel::Sender<PartitionRecord>,
    ) -> Result<Vec<Reader>> {
        let mut readers = Vec::with_capacity(partitions.len());
        for path in partitions {
            let partition = partition_name(path);
            let stdin = is_stdin(path);
            let start_after = if stdin {
                0
            } else {
                self.offsets.committed(&partition)?
            };
            let options = ReaderOptions {
                follow: self.config.ingest.follow,
                poll_interval: Duration::from_millis(self.config.ingest.poll_interval_ms),
                start_after,
            };
            tracing::debug!(%partition, start_after, "starting partition reader");
            let join = spawn_reader(path, options, tx.clone(), self.signals.shutdown_flag())?;
            readers.push(Reader {
                partition,
                stdin,
                join,
            });
        }
        Ok(readers)
    }

    fn account(&mut self, record: &PartitionRecord, disposition: &Disposition) {
        match disposition {
            Disposition::Processed(report) => {
                self.stats.processed += 1;
                tracing::debug!(
                    partition = %record.partition,
                    offset = record.offset,
                    violations = report.violations.len(),
                    recorded = report.recorded_count(),
                    "observation processed"
                );
            }
            Disposition::Rejected(error) => {
                self.stats.rejected += 1;
                tracing::warn!(
                    partition = %record.partition,
                    offset = record.offset,
                    code = error.code(),
                    %error,
                    "observation rejected"
                );
                self.emit(ActivityEvent::ObservationRejected {
                    partition: record.partition.to_string(),
                    code: error.code().to_string(),
                    message: error.to_string(),
                });
            }
            Disposition::Failed(error) => {
                self.stats.failed += 1;
                self.observation_failed(record, error);
            }
            Disposition::Retry(interrupted) => {
                self.stats.retries += 1;
                tracing::debug!(
                    partition = %record.partition,
                    offset = record.offset,
                    completed = interrupted.progress.completed(),
                    unsaved = interrupted.progress.has_unsaved(),
                    "observation will be resumed"
                );
                self.observation_failed(record, &interrupted.error);
            }
        }
    }

    fn observation_failed(&self, record: &PartitionRecord, error: &WardenError) {
        self.emit(ActivityEvent::ObservationFailed {
            partition: record.partition.to_string(),
            offset: record.offset,
            code: error.code().to_string(),
            message: error.to_string(),
        });
    }

    fn commit(&self, record: &PartitionRecord) {
        if let Err(error) = self
            .offsets
            .commit(&record.partition, record.offset, Utc::now())
        {
            tracing::warn!(
                partition = %record.partition,
                offset = record.offset,
                %error,
                "offset commit failed; observation will be read again after restart"
            );
        }
    }

    fn prune(&mut self) {
        match self.engine.prune(Utc::now()) {
            Ok(count) => self.stats.pruned += count as u64,
            Err(error) => tracing::warn!(%error, "prune failed"),
        }
    }

    fn sleep_unless_shutdown(&self, total: Duration) {
        let deadline = Instant::now() + total;
        while !self.signals.should_shutdown() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(LOOP_TICK));
        }
    }

    fn emit(&self, event: ActivityEvent) {
        if let Some(handle) = &self.logger_handle {
            handle.send(event);
        }
    }

    // ──────────────────── shutdown ────────────────────

    fn shutdown(&mut self, readers: Vec<Reader>, reason: &str) {
        let uptime_secs = self.start_time.elapsed().as_secs();

        // 1. Stop readers; stdin cannot be interrupted, so it is left behind.
        self.signals.request_shutdown();
        for reader in readers {
            if reader.stdin {
                continue;
            }
            if reader.join.join().is_err() {
                tracing::error!(partition = %reader.partition, "partition reader panicked");
            }
        }

        // 2. Let in-flight chat deliveries finish.
        self.engine.drain();

        // 3. Log shutdown.
        tracing::info!(
            reason,
            uptime_secs,
            observations = self.stats.observations,
            processed = self.stats.processed,
            rejected = self.stats.rejected,
            failed = self.stats.failed,
            "daemon stopped"
        );
        self.emit(ActivityEvent::DaemonStopped {
            reason: reason.to_string(),
            uptime_secs,
            observations: self.stats.observations,
        });

        // 4. Shutdown logger thread.
        self.stop_logger();
    }

    fn stop_logger(&mut self) {
        if let Some(handle) = self.logger_handle.take() {
            let dropped = handle.dropped_events();
            if dropped > 0 {
                tracing::warn!(dropped, "activity events dropped under back-pressure");
            }
            handle.shutdown();
        }
        if let Some(join) = self.logger_join.take() {
            let _ = join.join();
        }
    }
}
