#![forbid(unsafe_code)]

//! Cluster Warden (cwarden): policy-violation remediation for Kubernetes
//! clusters.
//!
//! Observations of violating resources arrive on partitioned streams. Each
//! violation is fingerprinted and walked up an escalation ladder:
//! 1. **Notify**: warn the namespace owners by chat and email
//! 2. **Last warning**: the final notification before action
//! 3. **Act**: delete, scale to zero or suspend the offending resource
//!
//! Escalation state lives in SQLite with an expiry window, so a violation
//! that stops recurring eventually starts over from the first warning.
//!
//! # Library usage
//!
//! Use the [`prelude`] for convenient access to the most common types:
//!
//! ```rust,no_run
//! use cluster_warden::prelude::*;
//! ```
//!
//! Individual modules can also be imported directly:
//!
//! ```rust,no_run
//! use cluster_warden::core::config::Config;
//! use cluster_warden::engine::policy::{PolicySettings, decide};
//! ```

pub mod prelude;

pub mod core;
pub mod daemon;
pub mod engine;
pub mod logger;
pub mod model;
pub mod store;
