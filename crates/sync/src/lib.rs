//! Spec propagation between a consumer cluster and its provider clusters.
//!
//! Events from every cache are folded into downstream keys on one queue; a worker pool runs
//! an idempotent reconcile pass per key.
#![forbid(unsafe_code)]

pub mod config;
pub mod controller;
pub mod mapper;
pub mod provider;
pub mod reconciler;
pub mod resolver;
pub mod router;
pub mod scope;

pub use config::ControllerConfig;
pub use controller::Controller;
pub use mapper::ensure_mapping;
pub use provider::{ProviderTarget, Transport};
pub use reconciler::{Outcome, Reconciler};
pub use resolver::{ProviderResolver, Resolution};
pub use router::{KeyStrategy, SourceAdapter};
pub use scope::ClusterScope;
