//! Domain model: entities, violations, fingerprints, action history, and
//! observation decoding.

pub mod entity;
pub mod fingerprint;
pub mod history;
pub mod observation;
pub mod violation;
