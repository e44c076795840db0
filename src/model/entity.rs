//! Cluster entities that can violate policy, and what can be done about them.

#![allow(missing_docs)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::errors::{Result, WardenError};

// ──────────────────── entity kind ────────────────────

/// Closed set of resource kinds an observation can describe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    Pod,
    Deployment,
    DaemonSet,
    Ingress,
    Job,
    CronJob,
    Namespace,
}

impl EntityKind {
    pub const ALL: [Self; 7] = [
        Self::Pod,
        Self::Deployment,
        Self::DaemonSet,
        Self::Ingress,
        Self::Job,
        Self::CronJob,
        Self::Namespace,
    ];

    /// Wire name, also used as the persisted column value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pod => "Pod",
            Self::Deployment => "Deployment",
            Self::DaemonSet => "DaemonSet",
            Self::Ingress => "Ingress",
            Self::Job => "Job",
            Self::CronJob => "CronJob",
            Self::Namespace => "Namespace",
        }
    }

    /// Resource name as understood by `kubectl`.
    #[must_use]
    pub const fn resource(self) -> &'static str {
        match self {
            Self::Pod => "pod",
            Self::Deployment => "deployment",
            Self::DaemonSet => "daemonset",
            Self::Ingress => "ingress",
            Self::Job => "job",
            Self::CronJob => "cronjob",
            Self::Namespace => "namespace",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = WardenError;

    fn from_str(raw: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == raw)
            .ok_or_else(|| WardenError::UnknownEntityKind {
                kind: raw.to_string(),
            })
    }
}

// ──────────────────── identity ────────────────────

/// Immutable identity of the resource an observation is about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ViolatableEntity {
    pub namespace: String,
    pub cluster: String,
    pub kind: EntityKind,
    pub name: String,
}

/// Name/namespace/cluster shared by every entity payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
    #[serde(default, alias = "Name")]
    pub name: String,
    #[serde(default, alias = "Namespace")]
    pub namespace: String,
    #[serde(default, alias = "Cluster")]
    pub cluster: String,
}

/// Deployment payload; the replica count is informational only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRef {
    #[serde(flatten)]
    pub object: ObjectRef,
    #[serde(default, alias = "Replicas")]
    pub replicas: Option<i32>,
}

/// CronJob payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronJobRef {
    #[serde(flatten)]
    pub object: ObjectRef,
    #[serde(default, alias = "Schedule")]
    pub schedule: Option<String>,
}

/// Ingress payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressRef {
    #[serde(flatten)]
    pub object: ObjectRef,
    #[serde(default, alias = "Hosts")]
    pub hosts: Vec<String>,
}

// ──────────────────── entity ────────────────────

/// A decoded entity with its kind-specific payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entity {
    Pod(ObjectRef),
    Deployment(DeploymentRef),
    DaemonSet(ObjectRef),
    Ingress(IngressRef),
    Job(ObjectRef),
    CronJob(CronJobRef),
    Namespace(ObjectRef),
}

/// Corrective operations the executor knows how to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectiveAction {
    Delete,
    ScaleToZero,
    Suspend,
}

impl fmt::Display for CorrectiveAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Delete => f.write_str("delete"),
            Self::ScaleToZero => f.write_str("scale to zero"),
            Self::Suspend => f.write_str("suspend"),
        }
    }
}

impl Entity {
    #[must_use]
    pub const fn kind(&self) -> EntityKind {
        match self {
            Self::Pod(_) => EntityKind::Pod,
            Self::Deployment(_) => EntityKind::Deployment,
            Self::DaemonSet(_) => EntityKind::DaemonSet,
            Self::Ingress(_) => EntityKind::Ingress,
            Self::Job(_) => EntityKind::Job,
            Self::CronJob(_) => EntityKind::CronJob,
            Self::Namespace(_) => EntityKind::Namespace,
        }
    }

    #[must_use]
    pub const fn object(&self) -> &ObjectRef {
        match self {
            Self::Pod(o) | Self::DaemonSet(o) | Self::Job(o) | Self::Namespace(o) => o,
            Self::Deployment(d) => &d.object,
            Self::Ingress(i) => &i.object,
            Self::CronJob(c) => &c.object,
        }
    }

    fn object_mut(&mut self) -> &mut ObjectRef {
        match self {
            Self::Pod(o) | Self::DaemonSet(o) | Self::Job(o) | Self::Namespace(o) => o,
            Self::Deployment(d) => &mut d.object,
            Self::Ingress(i) => &mut i.object,
            Self::CronJob(c) => &mut c.object,
        }
    }

    /// Identity used for fingerprinting and auditing.
    ///
    /// A namespace is its own namespace when the producer left that field blank.
    #[must_use]
    pub fn identity(&self) -> ViolatableEntity {
        let object = self.object();
        let namespace = if object.namespace.is_empty() && self.kind() == EntityKind::Namespace {
            object.name.clone()
        } else {
            object.namespace.clone()
        };
        ViolatableEntity {
            namespace,
            cluster: object.cluster.clone(),
            kind: self.kind(),
            name: object.name.clone(),
        }
    }

    /// What the executor does when this entity is acted on, if anything.
    #[must_use]
    pub const fn corrective_action(&self) -> Option<CorrectiveAction> {
        match self {
            Self::Pod(_) | Self::Ingress(_) | Self::Job(_) => Some(CorrectiveAction::Delete),
            Self::Deployment(_) => Some(CorrectiveAction::ScaleToZero),
            Self::CronJob(_) => Some(CorrectiveAction::Suspend),
            Self::DaemonSet(_) | Self::Namespace(_) => None,
        }
    }

    /// Fill the cluster from configuration when the producer omitted it.
    pub fn default_cluster(&mut self, cluster: &str) {
        let object = self.object_mut();
        if object.cluster.trim().is_empty() {
            object.cluster = cluster.to_string();
        }
    }
}
