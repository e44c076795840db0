//! Decoding raw observation payloads into typed entities and violations.
//!
//! Wire shape: `{"kind": "Pod", "data": {"name": .., "namespace": ..,
//! "cluster": .., "violations": [{"type": .., "source": ..}]}}`. Field names
//! are also accepted in the producer's capitalized form.

#![allow(missing_docs)]

use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::core::errors::{Result, WardenError};
use crate::model::entity::{Entity, EntityKind, ViolatableEntity};
use crate::model::violation::{Violation, ViolationKind};

/// A fully decoded observation: one entity and its ordered violations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub entity: Entity,
    pub violations: Vec<Violation>,
}

impl Observation {
    #[must_use]
    pub fn identity(&self) -> ViolatableEntity {
        self.entity.identity()
    }

    /// Decode one payload. Unknown entity or violation kinds fail the whole
    /// observation before anything is acted on.
    pub fn decode(payload: &[u8], default_cluster: &str) -> Result<Self> {
        let envelope: Envelope =
            serde_json::from_slice(payload).map_err(|error| WardenError::MalformedObservation {
                details: error.to_string(),
            })?;
        let kind: EntityKind = envelope.kind.parse()?;
        let data = envelope.data;

        let raw_violations: RawViolations = decode_data(&data)?;
        let mut entity = match kind {
            EntityKind::Pod => Entity::Pod(decode_data(&data)?),
            EntityKind::Deployment => Entity::Deployment(decode_data(&data)?),
            EntityKind::DaemonSet => Entity::DaemonSet(decode_data(&data)?),
            EntityKind::Ingress => Entity::Ingress(decode_data(&data)?),
            EntityKind::Job => Entity::Job(decode_data(&data)?),
            EntityKind::CronJob => Entity::CronJob(decode_data(&data)?),
            EntityKind::Namespace => Entity::Namespace(decode_data(&data)?),
        };
        entity.default_cluster(default_cluster);

        if entity.object().name.is_empty() {
            return Err(WardenError::MalformedObservation {
                details: format!("{kind} payload has no name"),
            });
        }

        let violations = raw_violations
            .violations
            .into_iter()
            .map(|raw| {
                Ok(Violation {
                    kind: raw.kind.parse::<ViolationKind>()?,
                    source: raw.source,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { entity, violations })
    }
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(alias = "Kind")]
    kind: String,
    #[serde(alias = "Data")]
    data: serde_json::Value,
}

#[derive(Deserialize)]
struct RawViolations {
    #[serde(default, alias = "Violations")]
    violations: Vec<RawViolation>,
}

#[derive(Deserialize)]
struct RawViolation {
    #[serde(rename = "type", alias = "Type")]
    kind: String,
    #[serde(default, alias = "Source")]
    source: String,
}

fn decode_data<T: DeserializeOwned>(data: &serde_json::Value) -> Result<T> {
    T::deserialize(data).map_err(|error| WardenError::MalformedObservation {
        details: error.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::entity::CorrectiveAction;

    #[test]
    fn decodes_lowercase_payload() {
        let raw = br#"{"kind":"Pod","data":{"name":"api-0","namespace":"payments","cluster":"prod",
            "violations":[{"type":"PRIVILEGED","source":"app"},{"type":"HOST_VOLUMES","source":"/var/run"}]}}"#;
        let obs = Observation::decode(raw, "fallback").unwrap();
        assert_eq!(obs.entity.kind(), EntityKind::Pod);
        let identity = obs.identity();
        assert_eq!(identity.name, "api-0");
        assert_eq!(identity.cluster, "prod");
        assert_eq!(obs.violations.len(), 2);
        assert_eq!(obs.violations[0].kind, ViolationKind::Privileged);
        assert_eq!(obs.violations[1].source, "/var/run");
    }

    #[test]
    fn decodes_capitalized_payload_and_defaults_cluster() {
        let raw = br#"{"kind":"Deployment","data":{"Name":"web","Namespace":"shop","Replicas":1,
            "Violations":[{"Type":"SINGLE_REPLICA","Source":"web"}]}}"#;
        let obs = Observation::decode(raw, "prod-east").unwrap();
        assert_eq!(obs.identity().cluster, "prod-east");
        assert_eq!(obs.entity.corrective_action(), Some(CorrectiveAction::ScaleToZero));
        match &obs.entity {
            Entity::Deployment(d) => assert_eq!(d.replicas, Some(1)),
            other => panic!("unexpected entity: {other:?}"),
        }
    }

    #[test]
    fn unknown_entity_kind_fails() {
        let raw = br#"{"kind":"StatefulSet","data":{"name":"db"}}"#;
        let err = Observation::decode(raw, "prod").unwrap_err();
        assert!(matches!(err, WardenError::UnknownEntityKind { .. }));
    }

    #[test]
    fn unknown_violation_kind_fails_whole_observation() {
        let raw = br#"{"kind":"Job","data":{"name":"etl","namespace":"data",
            "violations":[{"type":"PRIVILEGED","source":"a"},{"type":"WHATEVER","source":"b"}]}}"#;
        let err = Observation::decode(raw, "prod").unwrap_err();
        assert!(matches!(err, WardenError::UnknownViolationKind { ref kind } if kind == "WHATEVER"));
    }

    #[test]
    fn garbage_is_malformed() {
        let err = Observation::decode(b"not json", "prod").unwrap_err();
        assert_eq!(err.code(), "CW-2003");
        let err = Observation::decode(br#"{"kind":"Pod","data":{}}"#, "prod").unwrap_err();
        assert_eq!(err.code(), "CW-2003");
    }

    #[test]
    fn missing_violations_is_empty_list() {
        let raw = br#"{"kind":"Namespace","data":{"name":"payments"}}"#;
        let obs = Observation::decode(raw, "prod").unwrap();
        assert!(obs.violations.is_empty());
        assert_eq!(obs.identity().namespace, "payments");
    }
}
