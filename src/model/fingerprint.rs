//! Stable identity of one violation on one resource.

#![allow(missing_docs)]

use std::fmt::{self, Write as _};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::model::entity::{EntityKind, ViolatableEntity};
use crate::model::violation::{Violation, ViolationKind};

/// Key under which escalation state is stored. Identical fingerprints share
/// one history.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint {
    pub namespace: String,
    pub cluster: String,
    pub entity_kind: EntityKind,
    pub entity_name: String,
    pub violation_kind: ViolationKind,
    pub violation_source: String,
}

impl Fingerprint {
    /// Combine an entity identity with one of its violations.
    #[must_use]
    pub fn resolve(entity: &ViolatableEntity, violation: &Violation) -> Self {
        Self {
            namespace: entity.namespace.clone(),
            cluster: entity.cluster.clone(),
            entity_kind: entity.kind,
            entity_name: entity.name.clone(),
            violation_kind: violation.kind,
            violation_source: violation.source.clone(),
        }
    }

    /// Short hex digest used to correlate log lines for one fingerprint.
    #[must_use]
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for field in [
            self.namespace.as_str(),
            self.cluster.as_str(),
            self.entity_kind.as_str(),
            self.entity_name.as_str(),
            self.violation_kind.as_str(),
            self.violation_source.as_str(),
        ] {
            hasher.update(field.as_bytes());
            // Unit separator keeps ("ab","c") and ("a","bc") apart.
            hasher.update([0x1f]);
        }
        let hash = hasher.finalize();
        let mut out = String::with_capacity(16);
        for byte in &hash[..8] {
            let _ = write!(out, "{byte:02x}");
        }
        out
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{} {}({})",
            self.cluster,
            self.namespace,
            self.entity_kind,
            self.entity_name,
            self.violation_kind,
            self.violation_source
        )
    }
}
