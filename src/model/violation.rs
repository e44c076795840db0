//! Violation kinds and the static policy-class table that drives escalation.

#![allow(missing_docs)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::core::errors::{Result, WardenError};

/// How the engine treats a violation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyClass {
    /// Warn up to the configured threshold, then act.
    Escalating,
    /// Warn on the renotify cadence but never act.
    SuppressedFromEscalation,
    /// Warn and act on every observation.
    Immediate,
}

/// Every governance rule the engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ViolationKind {
    SingleReplica,
    ImageSize,
    ImageRepo,
    IngressHostInvalid,
    Capabilities,
    Privileged,
    HostVolumes,
    RequiredNamespaces,
    RequiredNamespaceAnnotations,
    RequiredNamespaceLabels,
    RequiredDeployments,
    RequiredDeploymentAnnotations,
    RequiredDeploymentLabels,
    RequiredPods,
    RequiredPodAnnotations,
    RequiredPodLabels,
    RequiredDaemonSets,
    RequiredDaemonSetAnnotations,
    RequiredDaemonSetLabels,
    RequiredResourceQuota,
    NoOwner,
}

struct KindEntry {
    kind: ViolationKind,
    wire: &'static str,
    label: &'static str,
    class: PolicyClass,
}

const fn entry(
    kind: ViolationKind,
    wire: &'static str,
    label: &'static str,
    class: PolicyClass,
) -> KindEntry {
    KindEntry {
        kind,
        wire,
        label,
        class,
    }
}

// Indexed by discriminant; order must match the enum.
static VIOLATION_TABLE: [KindEntry; 21] = {
    use PolicyClass::{Escalating, Immediate, SuppressedFromEscalation};
    use ViolationKind as K;
    [
        entry(K::SingleReplica, "SINGLE_REPLICA", "Single Replica", SuppressedFromEscalation),
        entry(K::ImageSize, "IMAGE_SIZE", "Invalid Image Size", SuppressedFromEscalation),
        entry(K::ImageRepo, "IMAGE_REPO", "Invalid Image Repo", Escalating),
        entry(K::IngressHostInvalid, "INGRESS_HOST_INVALID", "Invalid Ingress", Immediate),
        entry(K::Capabilities, "CAPABILITIES", "Extra Capabilities", Escalating),
        entry(K::Privileged, "PRIVILEGED", "Privileged Mode", Escalating),
        entry(K::HostVolumes, "HOST_VOLUMES", "Host Volumes Mounted", Escalating),
        entry(K::RequiredNamespaces, "REQUIRED_NAMESPACES", "Missing required namespace", Escalating),
        entry(
            K::RequiredNamespaceAnnotations,
            "REQUIRED_NAMESPACE_ANNOTATIONS",
            "Missing namespace annotation",
            Escalating,
        ),
        entry(
            K::RequiredNamespaceLabels,
            "REQUIRED_NAMESPACE_LABELS",
            "Missing namespace label",
            Escalating,
        ),
        entry(
            K::RequiredDeployments,
            "REQUIRED_DEPLOYMENTS",
            "Missing required deployment",
            Escalating,
        ),
        entry(
            K::RequiredDeploymentAnnotations,
            "REQUIRED_DEPLOYMENT_ANNOTATIONS",
            "Missing deployment annotation",
            Escalating,
        ),
        entry(
            K::RequiredDeploymentLabels,
            "REQUIRED_DEPLOYMENT_LABELS",
            "Missing deployment label",
            Escalating,
        ),
        entry(K::RequiredPods, "REQUIRED_PODS", "Missing required pod", Escalating),
        entry(
            K::RequiredPodAnnotations,
            "REQUIRED_POD_ANNOTATIONS",
            "Missing pod annotation",
            Escalating,
        ),
        entry(K::RequiredPodLabels, "REQUIRED_POD_LABELS", "Missing pod label", Escalating),
        entry(
            K::RequiredDaemonSets,
            "REQUIRED_DAEMONSETS",
            "Missing required daemonset",
            Escalating,
        ),
        entry(
            K::RequiredDaemonSetAnnotations,
            "REQUIRED_DAEMONSET_ANNOTATIONS",
            "Missing daemonset annotation",
            Escalating,
        ),
        entry(
            K::RequiredDaemonSetLabels,
            "REQUIRED_DAEMONSET_LABELS",
            "Missing daemonset label",
            Escalating,
        ),
        entry(
            K::RequiredResourceQuota,
            "REQUIRED_RESOURCEQUOTA",
            "Missing required resourcequota",
            Escalating,
        ),
        entry(K::NoOwner, "NO_OWNER", "No owner", Escalating),
    ]
};

impl ViolationKind {
    fn entry(self) -> &'static KindEntry {
        &VIOLATION_TABLE[self as usize]
    }

    /// Every kind, in table order.
    pub fn all() -> impl Iterator<Item = Self> {
        VIOLATION_TABLE.iter().map(|entry| entry.kind)
    }

    /// Wire and persisted name, e.g. `PRIVILEGED`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        self.entry().wire
    }

    /// Human label used in notifications.
    #[must_use]
    pub fn label(self) -> &'static str {
        self.entry().label
    }

    #[must_use]
    pub fn policy_class(self) -> PolicyClass {
        self.entry().class
    }
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ViolationKind {
    type Err = WardenError;

    fn from_str(raw: &str) -> Result<Self> {
        VIOLATION_TABLE
            .iter()
            .find(|entry| entry.wire == raw)
            .map(|entry| entry.kind)
            .ok_or_else(|| WardenError::UnknownViolationKind {
                kind: raw.to_string(),
            })
    }
}

impl Serialize for ViolationKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ViolationKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// One rule violation reported against an entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Violation {
    pub kind: ViolationKind,
    /// What inside the entity triggered the rule (container, image, host...).
    pub source: String,
}
