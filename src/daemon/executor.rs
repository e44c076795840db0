//! Corrective actions against the cluster, carried out through `kubectl`.
//!
//! | Entity     | Action                         |
//! |------------|--------------------------------|
//! | Pod        | delete                         |
//! | Deployment | scale to 0 replicas            |
//! | Ingress    | delete                         |
//! | Job        | delete                         |
//! | CronJob    | suspend                        |
//! | DaemonSet  | none (reported as a failure)   |
//! | Namespace  | none (reported as a failure)   |

#![allow(missing_docs)]

use std::path::PathBuf;
use std::process::Command;

use crate::core::config::ExecutorConfig;
use crate::core::errors::{Result, WardenError};
use crate::model::entity::{CorrectiveAction, Entity};

/// What the engine needs to act on an entity.
pub trait ActionExecutor: Send {
    /// Carry out the kind-specific action. Returns which action ran.
    fn execute(&self, entity: &Entity) -> Result<CorrectiveAction>;
}

// ──────────────────── kubectl ────────────────────

/// A `kubectl` invocation template: binary plus cluster selection flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Kubectl {
    binary: PathBuf,
    kubeconfig: Option<PathBuf>,
    context: Option<String>,
    request_timeout_secs: u64,
}

impl Kubectl {
    #[must_use]
    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self {
            binary: config.kubectl_path.clone(),
            kubeconfig: config.kubeconfig.clone(),
            context: config.context.clone(),
            request_timeout_secs: config.request_timeout_secs,
        }
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.binary);
        if let Some(kubeconfig) = &self.kubeconfig {
            cmd.arg("--kubeconfig").arg(kubeconfig);
        }
        if let Some(context) = &self.context {
            cmd.arg("--context").arg(context);
        }
        if self.request_timeout_secs > 0 {
            cmd.arg(format!("--request-timeout={}s", self.request_timeout_secs));
        }
        cmd.args(args);
        cmd
    }

    /// Run and return stdout; a non-zero exit is an error carrying stderr.
    pub fn run(&self, args: &[&str]) -> Result<Vec<u8>> {
        let target = args.join(" ");
        let output = self
            .command(args)
            .output()
            .map_err(|e| WardenError::ExecutorFailure {
                target: target.clone(),
                details: format!("failed to run {}: {e}", self.binary.display()),
            })?;
        if output.status.success() {
            Ok(output.stdout)
        } else {
            Err(WardenError::ExecutorFailure {
                target,
                details: format!(
                    "{} exited with {}: {}",
                    self.binary.display(),
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            })
        }
    }
}

// ──────────────────── executor ────────────────────

pub struct KubectlExecutor {
    kubectl: Kubectl,
}

impl KubectlExecutor {
    #[must_use]
    pub const fn new(kubectl: Kubectl) -> Self {
        Self { kubectl }
    }

    /// The kubectl arguments that carry out `entity`'s corrective action.
    pub fn arguments(entity: &Entity) -> Result<(CorrectiveAction, Vec<String>)> {
        let object = entity.object();
        let kind = entity.kind();
        let action = entity
            .corrective_action()
            .ok_or_else(|| WardenError::ExecutorFailure {
                target: format!("{kind} {}/{}", object.namespace, object.name),
                details: format!("no corrective action defined for {kind}"),
            })?;
        let resource = kind.resource().to_string();
        let mut args = match action {
            CorrectiveAction::Delete => vec!["delete".to_string(), resource, object.name.clone()],
            CorrectiveAction::ScaleToZero => vec![
                "scale".to_string(),
                resource,
                object.name.clone(),
                "--replicas=0".to_string(),
            ],
            CorrectiveAction::Suspend => vec![
                "patch".to_string(),
                resource,
                object.name.clone(),
                "--type=merge".to_string(),
                "-p".to_string(),
                r#"{"spec":{"suspend":true}}"#.to_string(),
            ],
        };
        args.push("--namespace".to_string());
        args.push(object.namespace.clone());
        Ok((action, args))
    }
}

impl ActionExecutor for KubectlExecutor {
    fn execute(&self, entity: &Entity) -> Result<CorrectiveAction> {
        let (action, args) = Self::arguments(entity)?;
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.kubectl.run(&args)?;
        tracing::info!(
            kind = %entity.kind(),
            namespace = %entity.object().namespace,
            name = %entity.object().name,
            %action,
            "corrective action applied"
        );
        Ok(action)
    }
}
