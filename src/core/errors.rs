//! CW-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, WardenError>;

/// Top-level error type for cluster_warden.
#[derive(Debug, Error)]
pub enum WardenError {
    #[error("[CW-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[CW-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[CW-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[CW-2001] unknown entity kind: {kind}")]
    UnknownEntityKind { kind: String },

    #[error("[CW-2002] unknown violation kind: {kind}")]
    UnknownViolationKind { kind: String },

    #[error("[CW-2003] malformed observation: {details}")]
    MalformedObservation { details: String },

    #[error("[CW-2101] escalation store unavailable in {context}: {details}")]
    StoreUnavailable {
        context: &'static str,
        details: String,
    },

    #[error("[CW-2102] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[CW-2201] corrective action failed for {target}: {details}")]
    ExecutorFailure { target: String, details: String },

    #[error("[CW-2202] notification channel {channel} failed: {details}")]
    NotificationChannel {
        channel: &'static str,
        details: String,
    },

    #[error("[CW-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[CW-3003] channel closed in component {component}")]
    ChannelClosed { component: &'static str },

    #[error("[CW-3900] runtime failure: {details}")]
    Runtime { details: String },
}

impl WardenError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "CW-1001",
            Self::MissingConfig { .. } => "CW-1002",
            Self::ConfigParse { .. } => "CW-1003",
            Self::UnknownEntityKind { .. } => "CW-2001",
            Self::UnknownViolationKind { .. } => "CW-2002",
            Self::MalformedObservation { .. } => "CW-2003",
            Self::StoreUnavailable { .. } => "CW-2101",
            Self::Serialization { .. } => "CW-2102",
            Self::ExecutorFailure { .. } => "CW-2201",
            Self::NotificationChannel { .. } => "CW-2202",
            Self::Io { .. } => "CW-3002",
            Self::ChannelClosed { .. } => "CW-3003",
            Self::Runtime { .. } => "CW-3900",
        }
    }

    /// Whether the observation that produced this error must be left
    /// uncommitted so it can be seen again.
    ///
    /// Decode failures are permanent: replaying the same payload fails the
    /// same way, so those observations are committed and skipped.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable { .. }
                | Self::Io { .. }
                | Self::ChannelClosed { .. }
                | Self::Runtime { .. }
        )
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

impl From<rusqlite::Error> for WardenError {
    fn from(value: rusqlite::Error) -> Self {
        Self::StoreUnavailable {
            context: "rusqlite",
            details: value.to_string(),
        }
    }
}

impl From<serde_json::Error> for WardenError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for WardenError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}
