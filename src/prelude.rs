//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use cluster_warden::prelude::*;
//! ```

// Core
pub use crate::core::config::Config;
pub use crate::core::errors::{Result, WardenError};

// Model
pub use crate::model::entity::{CorrectiveAction, Entity, EntityKind, ViolatableEntity};
pub use crate::model::fingerprint::Fingerprint;
pub use crate::model::history::{ActionHistory, Outcome};
pub use crate::model::observation::Observation;
pub use crate::model::violation::{PolicyClass, Violation, ViolationKind};

// Engine
pub use crate::engine::policy::{PolicySettings, Verdict, decide};
pub use crate::engine::{
    Interrupted, ObservationReport, Progress, RemediationEngine, ViolationReport,
};

// Collaborators
pub use crate::daemon::executor::{ActionExecutor, KubectlExecutor};
pub use crate::daemon::notifications::{ChatThrottle, Dispatcher, NotificationMessage, Notifier};
pub use crate::logger::audit::{AuditLog, SqliteAuditLog};
pub use crate::store::escalation::{EscalationStore, SqliteEscalationStore};
