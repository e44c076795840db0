#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use parking_lot::Mutex;

use cluster_warden::core::errors::{Result, WardenError};
use cluster_warden::daemon::executor::ActionExecutor;
use cluster_warden::daemon::notifications::{NotificationMessage, Notifier};
use cluster_warden::engine::RemediationEngine;
use cluster_warden::engine::policy::PolicySettings;
use cluster_warden::logger::audit::{AuditLog, SqliteAuditLog};
use cluster_warden::model::entity::{CorrectiveAction, Entity};
use cluster_warden::model::fingerprint::Fingerprint;
use cluster_warden::model::history::ActionHistory;
use cluster_warden::model::observation::Observation;
use cluster_warden::store::escalation::{EscalationRow, EscalationStore, SqliteEscalationStore};

// ──────────────────── CLI runner ────────────────────

pub struct CmdResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub log_path: PathBuf,
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn resolve_bin_path() -> PathBuf {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_cwarden") {
        return PathBuf::from(path);
    }

    let exe_name = if cfg!(windows) { "cwarden.exe" } else { "cwarden" };
    let fallback = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(PathBuf::from))
        .and_then(|deps| deps.parent().map(PathBuf::from))
        .map(|debug_dir| debug_dir.join(exe_name));

    match fallback {
        Some(path) if path.exists() => path,
        _ => panic!("unable to resolve cwarden binary path for integration test"),
    }
}

/// Run the binary with `home` as `$HOME`, so default paths stay inside it.
pub fn run_cli_case(case_name: &str, home: &Path, args: &[&str]) -> CmdResult {
    let root = std::env::temp_dir().join("cwarden-test-logs");
    fs::create_dir_all(&root).expect("create temp test log dir");

    let log_path = root.join(format!("{}-{}.log", sanitize(case_name), now_millis()));
    let bin_path = resolve_bin_path();

    let output = Command::new(&bin_path)
        .args(args)
        .env("HOME", home)
        .env("RUST_LOG", "warn")
        .env("RUST_BACKTRACE", "1")
        .env_remove("CWARDEN_OUTPUT_FORMAT")
        .env_remove("CWARDEN_STATE_DB")
        .env_remove("CWARDEN_SAFE_MODE")
        .env_remove("CWARDEN_DRY_RUN")
        .output()
        .expect("execute cwarden command");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    let mut log_content = String::new();
    log_content.push_str(&format!("case={case_name}\n"));
    log_content.push_str(&format!("bin={}\n", bin_path.display()));
    log_content.push_str(&format!("args={args:?}\n"));
    log_content.push_str(&format!("status={}\n", output.status));
    log_content.push_str("----- stdout -----\n");
    log_content.push_str(&stdout);
    log_content.push('\n');
    log_content.push_str("----- stderr -----\n");
    log_content.push_str(&stderr);
    log_content.push('\n');
    fs::write(&log_path, log_content).expect("write test log");

    CmdResult {
        status: output.status,
        stdout,
        stderr,
        log_path,
    }
}

// ──────────────────── time / payloads ────────────────────

pub const BASE_EPOCH: i64 = 1_700_000_000;

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(BASE_EPOCH + secs, 0).unwrap()
}

/// One-line observation payload.
pub fn payload(kind: &str, name: &str, namespace: &str, violations: &[(&str, &str)]) -> String {
    let violations: Vec<serde_json::Value> = violations
        .iter()
        .map(|(kind, source)| serde_json::json!({"type": kind, "source": source}))
        .collect();
    serde_json::json!({
        "kind": kind,
        "data": {
            "name": name,
            "namespace": namespace,
            "cluster": "prod",
            "violations": violations,
        }
    })
    .to_string()
}

pub fn observation(kind: &str, name: &str, namespace: &str, violations: &[(&str, &str)]) -> Observation {
    Observation::decode(payload(kind, name, namespace, violations).as_bytes(), "prod")
        .expect("valid observation")
}

// ──────────────────── recording collaborators ────────────────────

#[derive(Clone, Default)]
pub struct RecordingNotifier {
    pub sent: Arc<Mutex<Vec<NotificationMessage>>>,
    pub fail: bool,
}

impl Notifier for RecordingNotifier {
    fn dispatch(&self, message: &NotificationMessage) -> Vec<WardenError> {
        self.sent.lock().push(message.clone());
        if self.fail {
            vec![WardenError::NotificationChannel {
                channel: "email",
                details: "smtp down".to_string(),
            }]
        } else {
            Vec::new()
        }
    }
}

#[derive(Clone, Default)]
pub struct RecordingExecutor {
    pub acted: Arc<Mutex<Vec<String>>>,
    pub fail: bool,
}

impl ActionExecutor for RecordingExecutor {
    fn execute(&self, entity: &Entity) -> Result<CorrectiveAction> {
        self.acted.lock().push(entity.object().name.clone());
        let action = entity
            .corrective_action()
            .ok_or_else(|| WardenError::ExecutorFailure {
                target: entity.object().name.clone(),
                details: "no corrective action".to_string(),
            })?;
        if self.fail {
            return Err(WardenError::ExecutorFailure {
                target: entity.object().name.clone(),
                details: "kubectl exited with 1".to_string(),
            });
        }
        Ok(action)
    }
}

/// Escalation store shared between the engine and the test body.
#[derive(Clone)]
pub struct SharedStore(pub Arc<Mutex<SqliteEscalationStore>>);

impl EscalationStore for SharedStore {
    fn read(&self, fingerprint: &Fingerprint, now: DateTime<Utc>) -> Result<EscalationRow> {
        self.0.lock().read(fingerprint, now)
    }

    fn write(
        &self,
        fingerprint: &Fingerprint,
        history: &ActionHistory,
        now: DateTime<Utc>,
    ) -> Result<EscalationRow> {
        self.0.lock().write(fingerprint, history, now)
    }

    fn prune_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        self.0.lock().prune_expired(now)
    }
}

#[derive(Clone)]
pub struct SharedAudit(pub Arc<Mutex<SqliteAuditLog>>);

impl AuditLog for SharedAudit {
    fn record_observation(&self, fingerprint: &Fingerprint, at: DateTime<Utc>) -> Result<()> {
        self.0.lock().record_observation(fingerprint, at)
    }

    fn record_action(&self, fingerprint: &Fingerprint, outcome: &str, at: DateTime<Utc>) -> Result<()> {
        self.0.lock().record_action(fingerprint, outcome, at)
    }
}

/// Fails its `fail_on`-th write (1-based) once; every other call goes
/// through to the shared store.
pub struct FlakyStore {
    inner: SharedStore,
    writes: AtomicUsize,
    fail_on: usize,
}

impl FlakyStore {
    pub fn new(inner: SharedStore, fail_on: usize) -> Self {
        Self {
            inner,
            writes: AtomicUsize::new(0),
            fail_on,
        }
    }
}

impl EscalationStore for FlakyStore {
    fn read(&self, fingerprint: &Fingerprint, now: DateTime<Utc>) -> Result<EscalationRow> {
        self.inner.read(fingerprint, now)
    }

    fn write(
        &self,
        fingerprint: &Fingerprint,
        history: &ActionHistory,
        now: DateTime<Utc>,
    ) -> Result<EscalationRow> {
        if self.writes.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_on {
            return Err(WardenError::StoreUnavailable {
                context: "test",
                details: "disk I/O error".to_string(),
            });
        }
        self.inner.write(fingerprint, history, now)
    }

    fn prune_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        self.inner.prune_expired(now)
    }
}

/// A store whose database is gone.
pub struct UnavailableStore;

impl EscalationStore for UnavailableStore {
    fn read(&self, _fingerprint: &Fingerprint, _now: DateTime<Utc>) -> Result<EscalationRow> {
        Err(WardenError::StoreUnavailable {
            context: "test",
            details: "database is locked".to_string(),
        })
    }

    fn write(
        &self,
        _fingerprint: &Fingerprint,
        _history: &ActionHistory,
        _now: DateTime<Utc>,
    ) -> Result<EscalationRow> {
        Err(WardenError::StoreUnavailable {
            context: "test",
            details: "database is locked".to_string(),
        })
    }
}

// ──────────────────── harness ────────────────────

pub const RENOTIFY_SECS: i64 = 3_600;
pub const EXPIRY_SECS: u64 = 7 * 24 * 3_600;

pub struct Harness {
    pub engine: RemediationEngine,
    pub store: Arc<Mutex<SqliteEscalationStore>>,
    pub audit: Arc<Mutex<SqliteAuditLog>>,
    pub notifier: RecordingNotifier,
    pub executor: RecordingExecutor,
}

pub struct HarnessOptions {
    pub warning_count_before_action: u32,
    pub safe_mode: bool,
    pub dry_run: bool,
    pub notifier_fails: bool,
    pub executor_fails: bool,
    pub expiry: Duration,
    /// Fail this write (1-based) once with a retryable store error.
    pub fail_write: Option<usize>,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            warning_count_before_action: 3,
            safe_mode: false,
            dry_run: false,
            notifier_fails: false,
            executor_fails: false,
            expiry: Duration::from_secs(EXPIRY_SECS),
            fail_write: None,
        }
    }
}

impl Harness {
    pub fn new(options: HarnessOptions) -> Self {
        let store = Arc::new(Mutex::new(
            SqliteEscalationStore::open_in_memory(options.expiry).unwrap(),
        ));
        let audit = Arc::new(Mutex::new(SqliteAuditLog::open_in_memory().unwrap()));
        let notifier = RecordingNotifier {
            fail: options.notifier_fails,
            ..RecordingNotifier::default()
        };
        let executor = RecordingExecutor {
            fail: options.executor_fails,
            ..RecordingExecutor::default()
        };
        let policy = PolicySettings {
            warning_count_before_action: options.warning_count_before_action,
            renotify_interval: TimeDelta::seconds(RENOTIFY_SECS),
            safe_mode: options.safe_mode,
        };
        let shared = SharedStore(Arc::clone(&store));
        let engine_store: Box<dyn EscalationStore> = match options.fail_write {
            Some(fail_on) => Box::new(FlakyStore::new(shared, fail_on)),
            None => Box::new(shared),
        };
        let engine = RemediationEngine::new(
            engine_store,
            Box::new(SharedAudit(Arc::clone(&audit))),
            Box::new(notifier.clone()),
            Box::new(executor.clone()),
            policy,
        )
        .with_dry_run(options.dry_run);
        Self {
            engine,
            store,
            audit,
            notifier,
            executor,
        }
    }

    pub fn notifications(&self) -> Vec<NotificationMessage> {
        self.notifier.sent.lock().clone()
    }

    pub fn actions(&self) -> Vec<String> {
        self.executor.acted.lock().clone()
    }

    pub fn history(&self, fingerprint: &Fingerprint, now: DateTime<Utc>) -> ActionHistory {
        self.store.lock().read(fingerprint, now).unwrap().history
    }
}
