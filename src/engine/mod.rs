//! Remediation engine: one decision cycle per violation.
//!
//! For each violation of an observation: resolve the fingerprint, read its
//! live escalation row, decide, carry out the verdict, then persist the
//! outcomes (audit first, escalation state last). A failure reading or
//! writing state aborts the observation; notification and executor failures
//! are logged and never abort. An aborted observation can be resumed without
//! repeating the notifications and actions it already carried out.

#![allow(missing_docs)]

pub mod policy;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::config::Config;
use crate::core::errors::{Result, WardenError};
use crate::daemon::executor::{ActionExecutor, Kubectl, KubectlExecutor};
use crate::daemon::notifications::{
    ChatThrottle, Dispatcher, KubectlNamespaceDirectory, NotificationMessage, Notifier,
};
use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle};
use crate::logger::audit::{AuditLog, SqliteAuditLog};
use crate::model::entity::{Entity, ViolatableEntity};
use crate::model::fingerprint::Fingerprint;
use crate::model::history::{ActionHistory, Outcome};
use crate::model::observation::Observation;
use crate::store::escalation::{EscalationStore, SqliteEscalationStore};

use self::policy::{PolicySettings, Verdict, decide};

// ──────────────────── reports ────────────────────

/// What happened to one violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ViolationReport {
    pub fingerprint: Fingerprint,
    #[serde(flatten)]
    pub verdict: Verdict,
    /// Outcomes written to state; empty in dry run and when suppressed.
    pub recorded: Vec<Outcome>,
}

/// What happened to one observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObservationReport {
    pub entity: ViolatableEntity,
    pub violations: Vec<ViolationReport>,
}

impl ObservationReport {
    /// Total outcomes recorded across all violations.
    #[must_use]
    pub fn recorded_count(&self) -> usize {
        self.violations.iter().map(|v| v.recorded.len()).sum()
    }
}

// ──────────────────── progress ────────────────────

/// How far an interrupted observation got. Only meaningful for the
/// observation it came from.
#[derive(Debug, Default)]
pub struct Progress {
    done: Vec<ViolationReport>,
    unsaved: Option<Unsaved>,
}

impl Progress {
    /// Violations fully handled, state included.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.done.len()
    }

    /// A violation was notified or acted on but its state is not yet stored.
    #[must_use]
    pub const fn has_unsaved(&self) -> bool {
        self.unsaved.is_some()
    }
}

/// Side effects carried out, state still to be written.
#[derive(Debug)]
struct Unsaved {
    report: ViolationReport,
    history: ActionHistory,
    at: DateTime<Utc>,
    audited: usize,
}

enum Applied {
    Complete(ViolationReport),
    Unsaved(Unsaved),
}

/// A state failure part way through an observation.
#[derive(Debug)]
pub struct Interrupted {
    pub error: WardenError,
    pub progress: Progress,
}

impl Interrupted {
    fn new(fingerprint: &Fingerprint, error: WardenError, progress: Progress) -> Self {
        tracing::error!(
            fingerprint = %fingerprint.digest(),
            namespace = %fingerprint.namespace,
            cluster = %fingerprint.cluster,
            kind = %fingerprint.entity_kind,
            name = %fingerprint.entity_name,
            violation = %fingerprint.violation_kind,
            source = %fingerprint.violation_source,
            code = error.code(),
            %error,
            completed = progress.completed(),
            "decision cycle failed"
        );
        Self { error, progress }
    }
}

// ──────────────────── engine ────────────────────

pub struct RemediationEngine {
    store: Box<dyn EscalationStore>,
    audit: Box<dyn AuditLog>,
    notifier: Box<dyn Notifier>,
    executor: Box<dyn ActionExecutor>,
    policy: PolicySettings,
    dry_run: bool,
    activity: Option<ActivityLoggerHandle>,
}

impl RemediationEngine {
    pub fn new(
        store: Box<dyn EscalationStore>,
        audit: Box<dyn AuditLog>,
        notifier: Box<dyn Notifier>,
        executor: Box<dyn ActionExecutor>,
        policy: PolicySettings,
    ) -> Self {
        Self {
            store,
            audit,
            notifier,
            executor,
            policy,
            dry_run: false,
            activity: None,
        }
    }

    /// Wire the SQLite store and audit log, kubectl and the notification
    /// dispatcher described by `config`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let state_db = &config.paths.state_db;
        let store = SqliteEscalationStore::open(state_db, config.engine.violation_expiry())?;
        let audit = SqliteAuditLog::open(state_db)?;

        let kubectl = Kubectl::from_config(&config.executor);
        let throttle = Arc::new(ChatThrottle::new(Duration::from_millis(
            config.notifications.chat.min_interval_ms,
        )));
        let directory = Arc::new(KubectlNamespaceDirectory::new(kubectl.clone()));
        let notifier = Dispatcher::from_config(&config.notifications, directory, throttle)?;
        tracing::debug!(channels = ?notifier.channel_names(), "notification channels");

        Ok(Self::new(
            Box::new(store),
            Box::new(audit),
            Box::new(notifier),
            Box::new(KubectlExecutor::new(kubectl)),
            PolicySettings::from_config(&config.engine)?,
        )
        .with_dry_run(config.engine.dry_run))
    }

    #[must_use]
    pub const fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    #[must_use]
    pub fn with_activity(mut self, activity: ActivityLoggerHandle) -> Self {
        self.activity = Some(activity);
        self
    }

    pub const fn policy(&self) -> &PolicySettings {
        &self.policy
    }

    pub const fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Run every violation of `observation` through a decision cycle.
    ///
    /// Violations are handled in order; a state failure on one aborts the
    /// rest and is returned.
    pub fn process(&self, observation: &Observation, now: DateTime<Utc>) -> Result<ObservationReport> {
        self.resume(observation, Progress::default(), now)
            .map_err(|interrupted| interrupted.error)
    }

    /// Like [`process`](Self::process), continuing from where an earlier
    /// interrupted attempt on the same observation stopped.
    ///
    /// Violations already completed are not decided again, and a violation
    /// whose notification or action already happened only has its state
    /// written. The error carries the progress to pass to the next attempt.
    pub fn resume(
        &self,
        observation: &Observation,
        mut progress: Progress,
        now: DateTime<Utc>,
    ) -> std::result::Result<ObservationReport, Interrupted> {
        let identity = observation.identity();
        loop {
            if let Some(mut unsaved) = progress.unsaved.take() {
                if let Err(error) = self.persist(&mut unsaved) {
                    let fingerprint = unsaved.report.fingerprint.clone();
                    progress.unsaved = Some(unsaved);
                    return Err(Interrupted::new(&fingerprint, error, progress));
                }
                progress.done.push(unsaved.report);
            }

            let Some(violation) = observation.violations.get(progress.done.len()) else {
                break;
            };
            let fingerprint = Fingerprint::resolve(&identity, violation);
            match self.decide_and_apply(&observation.entity, fingerprint.clone(), now) {
                Ok(Applied::Complete(report)) => progress.done.push(report),
                Ok(Applied::Unsaved(unsaved)) => progress.unsaved = Some(unsaved),
                Err(error) => return Err(Interrupted::new(&fingerprint, error, progress)),
            }
        }
        Ok(ObservationReport {
            entity: identity,
            violations: progress.done,
        })
    }

    /// Delete expired escalation rows.
    pub fn prune(&self, now: DateTime<Utc>) -> Result<usize> {
        let count = self.store.prune_expired(now)?;
        tracing::info!(rows = count, "pruned expired escalation rows");
        self.emit(ActivityEvent::RowsPruned { count });
        Ok(count)
    }

    /// Wait for queued notification deliveries; the notifier is finished
    /// afterwards.
    pub fn drain(&self) {
        self.notifier.drain();
    }

    fn decide_and_apply(
        &self,
        entity: &Entity,
        fingerprint: Fingerprint,
        now: DateTime<Utc>,
    ) -> Result<Applied> {
        let row = self.store.read(&fingerprint, now)?;
        let class = fingerprint.violation_kind.policy_class();
        let verdict = decide(class, &row.history, &self.policy, now);

        let span = tracing::debug_span!(
            "decision",
            fingerprint = %fingerprint.digest(),
            %verdict,
        );
        let _enter = span.enter();

        if self.dry_run {
            tracing::info!(%fingerprint, %verdict, "dry run, no side effects");
            self.emit_decision(&fingerprint, verdict, &[]);
            return Ok(Applied::Complete(ViolationReport {
                fingerprint,
                verdict,
                recorded: Vec::new(),
            }));
        }

        self.audit.record_observation(&fingerprint, now)?;

        let mut recorded = Vec::with_capacity(2);
        if let Some(last_warning) = verdict.notification() {
            let message =
                NotificationMessage::new(&fingerprint, row.history.notify_count(), last_warning);
            for failure in self.notifier.dispatch(&message) {
                self.notification_failed(&fingerprint, &failure);
            }
            recorded.push(Outcome::Notify);
        }
        if verdict.acts() {
            if let Err(error) = self.executor.execute(entity) {
                self.executor_failed(&fingerprint, &error);
            }
            recorded.push(Outcome::EntityAction);
        }

        tracing::info!(%fingerprint, %verdict, "decision taken");
        self.emit_decision(&fingerprint, verdict, &recorded);

        let report = ViolationReport {
            fingerprint,
            verdict,
            recorded,
        };
        if report.recorded.is_empty() {
            return Ok(Applied::Complete(report));
        }

        let mut update = ActionHistory::new();
        for outcome in &report.recorded {
            update.record(*outcome, now);
        }
        let mut history = row.history;
        history.merge(&update);
        Ok(Applied::Unsaved(Unsaved {
            report,
            history,
            at: now,
            audited: 0,
        }))
    }

    /// Audit the outcomes not yet audited, then write the escalation row.
    fn persist(&self, unsaved: &mut Unsaved) -> Result<()> {
        let fingerprint = &unsaved.report.fingerprint;
        while let Some(outcome) = unsaved.report.recorded.get(unsaved.audited) {
            self.audit.record_action(fingerprint, outcome.as_str(), unsaved.at)?;
            unsaved.audited += 1;
        }
        self.store.write(fingerprint, &unsaved.history, unsaved.at)?;
        Ok(())
    }

    fn notification_failed(&self, fingerprint: &Fingerprint, error: &WardenError) {
        let channel = match error {
            WardenError::NotificationChannel { channel, .. } => *channel,
            _ => "unknown",
        };
        tracing::warn!(%fingerprint, channel, %error, "notification failed");
        self.emit(ActivityEvent::NotificationFailed {
            fingerprint: fingerprint.clone(),
            channel: channel.to_string(),
            message: error.to_string(),
        });
    }

    fn executor_failed(&self, fingerprint: &Fingerprint, error: &WardenError) {
        tracing::error!(%fingerprint, code = error.code(), %error, "corrective action failed");
        self.emit(ActivityEvent::ExecutorFailed {
            fingerprint: fingerprint.clone(),
            code: error.code().to_string(),
            message: error.to_string(),
        });
    }

    fn emit_decision(&self, fingerprint: &Fingerprint, verdict: Verdict, recorded: &[Outcome]) {
        self.emit(ActivityEvent::DecisionTaken {
            fingerprint: fingerprint.clone(),
            verdict: verdict.to_string(),
            recorded: recorded.iter().map(|o| o.as_str().to_string()).collect(),
            dry_run: self.dry_run,
        });
    }

    fn emit(&self, event: ActivityEvent) {
        if let Some(activity) = &self.activity {
            activity.send(event);
        }
    }
}
