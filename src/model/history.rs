//! Per-fingerprint record of what has already been done, keyed by outcome.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcomes the engine records. Stored under their string key so the
/// history map stays open to new outcome kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Notify,
    EntityAction,
}

impl Outcome {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Notify => "notify",
            Self::EntityAction => "entity_action",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome kind -> timestamps in insertion (chronological) order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionHistory(BTreeMap<String, Vec<DateTime<Utc>>>);

impl ActionHistory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn count(&self, outcome: Outcome) -> usize {
        self.0.get(outcome.as_str()).map_or(0, Vec::len)
    }

    /// Number of notifications already sent; this is the escalation stage.
    #[must_use]
    pub fn notify_count(&self) -> usize {
        self.count(Outcome::Notify)
    }

    #[must_use]
    pub fn last(&self, outcome: Outcome) -> Option<DateTime<Utc>> {
        self.0
            .get(outcome.as_str())
            .and_then(|stamps| stamps.last().copied())
    }

    pub fn record(&mut self, outcome: Outcome, at: DateTime<Utc>) {
        self.0
            .entry(outcome.as_str().to_string())
            .or_default()
            .push(at);
    }

    /// Append every timestamp of `newer` after the existing ones.
    pub fn merge(&mut self, newer: &Self) {
        for (outcome, stamps) in &newer.0 {
            self.0
                .entry(outcome.clone())
                .or_default()
                .extend(stamps.iter().copied());
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.values().all(Vec::is_empty)
    }

    /// Outcome keys with their timestamps, ordered by key.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[DateTime<Utc>])> {
        self.0
            .iter()
            .map(|(outcome, stamps)| (outcome.as_str(), stamps.as_slice()))
    }
}
