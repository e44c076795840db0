//! Escalation policy: a pure function from (policy class, history, settings,
//! now) to a verdict.
//!
//! ```text
//! Escalating                 SuppressedFromEscalation     Immediate
//! ──────────                 ────────────────────────     ─────────
//! notify ≥ N && !safe → Act  (never acts)                 !safe → NotifyAndAct
//! notified < D ago → Supp.   notified < D ago → Supp.     safe  → Notify
//! else Notify(last =         else Notify(last = false)
//!   !safe && notify ≥ N-1)
//! ```

#![allow(missing_docs)]

use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use crate::core::config::EngineConfig;
use crate::core::errors::{Result, WardenError};
use crate::model::history::{ActionHistory, Outcome};
use crate::model::violation::PolicyClass;

/// Thresholds the policy is evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicySettings {
    /// N: notifications before an escalating violation is acted on.
    pub warning_count_before_action: u32,
    /// D: minimum spacing between notifications for one fingerprint.
    pub renotify_interval: TimeDelta,
    pub safe_mode: bool,
}

impl PolicySettings {
    pub fn from_config(engine: &EngineConfig) -> Result<Self> {
        let renotify_interval =
            TimeDelta::from_std(engine.renotify_interval()).map_err(|error| {
                WardenError::InvalidConfig {
                    details: format!("renotify interval out of range: {error}"),
                }
            })?;
        Ok(Self {
            warning_count_before_action: engine.warning_count_before_action,
            renotify_interval,
            safe_mode: engine.safe_mode,
        })
    }
}

/// What the engine should do for one violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    /// Send a notification; `last_warning` marks the final one before action.
    Notify { last_warning: bool },
    /// Invoke the corrective action, no notification.
    Act,
    /// Notify (as a last warning) and act in the same cycle.
    NotifyAndAct,
    /// Too soon since the last notification; nothing happens.
    Suppressed,
}

impl Verdict {
    /// `Some(is_last_warning)` when a notification goes out.
    #[must_use]
    pub const fn notification(self) -> Option<bool> {
        match self {
            Self::Notify { last_warning } => Some(last_warning),
            Self::NotifyAndAct => Some(true),
            Self::Act | Self::Suppressed => None,
        }
    }

    #[must_use]
    pub const fn acts(self) -> bool {
        matches!(self, Self::Act | Self::NotifyAndAct)
    }

    /// Outcomes this verdict records when carried out.
    #[must_use]
    pub fn outcomes(self) -> Vec<Outcome> {
        let mut outcomes = Vec::with_capacity(2);
        if self.notification().is_some() {
            outcomes.push(Outcome::Notify);
        }
        if self.acts() {
            outcomes.push(Outcome::EntityAction);
        }
        outcomes
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Notify {
                last_warning: false,
            } => f.write_str("notify"),
            Self::Notify { last_warning: true } => f.write_str("notify_last_warning"),
            Self::Act => f.write_str("act"),
            Self::NotifyAndAct => f.write_str("notify_and_act"),
            Self::Suppressed => f.write_str("suppressed"),
        }
    }
}

/// Decide the verdict for one violation.
#[must_use]
pub fn decide(
    class: PolicyClass,
    history: &ActionHistory,
    settings: &PolicySettings,
    now: DateTime<Utc>,
) -> Verdict {
    let notify_count = history.notify_count();
    let threshold = settings.warning_count_before_action as usize;

    match class {
        PolicyClass::Immediate => {
            if settings.safe_mode {
                Verdict::Notify {
                    last_warning: false,
                }
            } else {
                Verdict::NotifyAndAct
            }
        }
        PolicyClass::Escalating if !settings.safe_mode && notify_count >= threshold => {
            Verdict::Act
        }
        PolicyClass::Escalating | PolicyClass::SuppressedFromEscalation => {
            let recently_notified = history
                .last(Outcome::Notify)
                .is_some_and(|last| now - last < settings.renotify_interval);
            if recently_notified {
                Verdict::Suppressed
            } else {
                let last_warning = class == PolicyClass::Escalating
                    && !settings.safe_mode
                    && notify_count + 1 >= threshold;
                Verdict::Notify { last_warning }
            }
        }
    }
}
