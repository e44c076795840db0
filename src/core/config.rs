//! Configuration system: TOML file + env var overrides + smart defaults.

#![allow(missing_docs)]

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::errors::{Result, WardenError};
use crate::daemon::notifications::NotificationConfig;

/// Full cluster_warden configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub notifications: NotificationConfig,
    pub executor: ExecutorConfig,
    pub ingest: IngestConfig,
    pub paths: PathsConfig,
}

/// Escalation thresholds and global mode switches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Cluster name used when an observation does not carry one.
    pub cluster_name: String,
    /// Never invoke corrective actions; warnings keep accumulating.
    pub safe_mode: bool,
    /// Compute and log decisions without any side effect or state change.
    pub dry_run: bool,
    /// Notifications sent before an escalating violation is acted on.
    pub warning_count_before_action: u32,
    /// Minimum spacing between two notifications for one fingerprint.
    pub renotify_interval_secs: u64,
    /// Lifetime of an escalation row after its last write.
    pub violation_expiry_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cluster_name: "default".to_string(),
            safe_mode: true,
            dry_run: false,
            warning_count_before_action: 3,
            renotify_interval_secs: 60 * 60,
            violation_expiry_secs: 7 * 24 * 60 * 60,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub const fn renotify_interval(&self) -> Duration {
        Duration::from_secs(self.renotify_interval_secs)
    }

    #[must_use]
    pub const fn violation_expiry(&self) -> Duration {
        Duration::from_secs(self.violation_expiry_secs)
    }
}

/// How corrective actions reach the cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutorConfig {
    pub kubectl_path: PathBuf,
    pub kubeconfig: Option<PathBuf>,
    pub context: Option<String>,
    /// Passed as `--request-timeout`; 0 leaves kubectl's default (none).
    pub request_timeout_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            kubectl_path: PathBuf::from("kubectl"),
            kubeconfig: None,
            context: None,
            request_timeout_secs: 30,
        }
    }
}

/// Observation partitions and the queue feeding the decision loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IngestConfig {
    /// One reader thread per entry; `-` reads stdin.
    pub partitions: Vec<PathBuf>,
    /// Keep polling partition files for appended observations.
    pub follow: bool,
    pub poll_interval_ms: u64,
    pub queue_capacity: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            partitions: vec![PathBuf::from("-")],
            follow: false,
            poll_interval_ms: 500,
            queue_capacity: 256,
        }
    }
}

/// Filesystem locations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub config_file: PathBuf,
    pub state_db: PathBuf,
    pub activity_log: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let home_dir = env::var_os("HOME").map_or_else(
            || {
                eprintln!("[CW-CONFIG] WARNING: HOME not set, falling back to /tmp for data paths");
                PathBuf::from("/tmp")
            },
            PathBuf::from,
        );
        let cfg = home_dir.join(".config").join("cwarden").join("config.toml");
        let data = home_dir.join(".local").join("share").join("cwarden");
        Self {
            config_file: cfg,
            state_db: data.join("escalation.sqlite3"),
            activity_log: data.join("activity.jsonl"),
        }
    }
}

impl Config {
    /// Default configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathsConfig::default().config_file
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// Missing config file is not an error when loading from default path; defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);
        let is_explicit_path = path.is_some();

        let mut cfg = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf).map_err(|source| WardenError::Io {
                path: path_buf.clone(),
                source,
            })?;
            let parsed: Self = toml::from_str(&raw)?;
            parsed
        } else if is_explicit_path {
            return Err(WardenError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.paths.config_file = path_buf;
        cfg.apply_env_overrides_from(env_var)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Deterministic hash of the effective config for startup logging.
    ///
    /// FNV-1a over canonical JSON, stable across processes and toolchains.
    pub fn stable_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        // engine
        if let Some(raw) = lookup("CWARDEN_CLUSTER_NAME") {
            self.engine.cluster_name = raw;
        }
        set_bool(&mut lookup, "CWARDEN_SAFE_MODE", &mut self.engine.safe_mode)?;
        set_bool(&mut lookup, "CWARDEN_DRY_RUN", &mut self.engine.dry_run)?;
        if let Some(raw) = lookup("CWARDEN_WARNING_COUNT_BEFORE_ACTION") {
            self.engine.warning_count_before_action = raw.parse::<u32>().map_err(|error| {
                WardenError::ConfigParse {
                    context: "env",
                    details: format!("CWARDEN_WARNING_COUNT_BEFORE_ACTION={raw:?}: {error}"),
                }
            })?;
        }
        set_u64(
            &mut lookup,
            "CWARDEN_RENOTIFY_INTERVAL_SECS",
            &mut self.engine.renotify_interval_secs,
        )?;
        set_u64(
            &mut lookup,
            "CWARDEN_VIOLATION_EXPIRY_SECS",
            &mut self.engine.violation_expiry_secs,
        )?;

        // notifications
        if let Some(raw) = lookup("CWARDEN_CHAT_WEBHOOK_URL") {
            self.notifications.chat.webhook_url = raw;
        }
        set_u64(
            &mut lookup,
            "CWARDEN_CHAT_MIN_INTERVAL_MS",
            &mut self.notifications.chat.min_interval_ms,
        )?;
        if let Some(raw) = lookup("CWARDEN_EMAIL_FALLBACK_RECIPIENTS") {
            self.notifications.email.fallback_recipients = raw
                .split(',')
                .map(str::trim)
                .filter(|addr| !addr.is_empty())
                .map(str::to_string)
                .collect();
        }

        // paths
        if let Some(raw) = lookup("CWARDEN_STATE_DB") {
            self.paths.state_db = PathBuf::from(raw);
        }

        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.engine.warning_count_before_action == 0 {
            return Err(WardenError::InvalidConfig {
                details: "engine.warning_count_before_action must be >= 1".to_string(),
            });
        }
        if self.engine.violation_expiry_secs == 0 {
            return Err(WardenError::InvalidConfig {
                details: "engine.violation_expiry_secs must be > 0".to_string(),
            });
        }
        if self.engine.cluster_name.trim().is_empty() {
            return Err(WardenError::InvalidConfig {
                details: "engine.cluster_name must not be empty".to_string(),
            });
        }
        if self.ingest.queue_capacity == 0 {
            return Err(WardenError::InvalidConfig {
                details: "ingest.queue_capacity must be >= 1".to_string(),
            });
        }
        if self.ingest.follow && self.ingest.poll_interval_ms == 0 {
            return Err(WardenError::InvalidConfig {
                details: "ingest.poll_interval_ms must be > 0 when follow is enabled".to_string(),
            });
        }
        let chat = &self.notifications.chat;
        if self.notifications.enabled && chat.enabled && chat.webhook_url.trim().is_empty() {
            return Err(WardenError::InvalidConfig {
                details: "notifications.chat.webhook_url is required when chat is enabled"
                    .to_string(),
            });
        }
        if self.notifications.enabled && chat.enabled && chat.queue_capacity == 0 {
            return Err(WardenError::InvalidConfig {
                details: "notifications.chat.queue_capacity must be >= 1".to_string(),
            });
        }
        let email = &self.notifications.email;
        if self.notifications.enabled && email.enabled && email.from.trim().is_empty() {
            return Err(WardenError::InvalidConfig {
                details: "notifications.email.from is required when email is enabled".to_string(),
            });
        }
        Ok(())
    }

    /// Validate an already-built config (used by `config validate`).
    pub fn check(&self) -> Result<()> {
        self.validate()
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|raw| !raw.trim().is_empty())
}

fn set_u64<F>(lookup: &mut F, name: &str, slot: &mut u64) -> Result<()>
where
    F: FnMut(&str) -> Option<String>,
{
    if let Some(raw) = lookup(name) {
        *slot = raw.parse::<u64>().map_err(|error| WardenError::ConfigParse {
            context: "env",
            details: format!("{name}={raw:?}: {error}"),
        })?;
    }
    Ok(())
}

fn set_bool<F>(lookup: &mut F, name: &str, slot: &mut bool) -> Result<()>
where
    F: FnMut(&str) -> Option<String>,
{
    if let Some(raw) = lookup(name) {
        *slot = raw.parse::<bool>().map_err(|error| WardenError::ConfigParse {
            context: "env",
            details: format!("{name}={raw:?}: {error}"),
        })?;
    }
    Ok(())
}
