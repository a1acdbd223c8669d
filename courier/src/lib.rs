//! Store-and-forward batching of location fixes.
//!
//! Fixes are queued locally, then delivered in batches to every configured
//! collection endpoint once the oldest queued fix is older than the
//! transmission interval. Each endpoint tracks its own progress, and queued
//! fixes are pruned once every endpoint has acknowledged them or they exceed
//! the retention age.
pub mod background;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod metrics_defs;
pub mod retention;
pub mod scheduler;
pub mod service;
pub mod sources;
pub mod state;
pub mod store;
pub mod transport;
pub mod types;
pub mod watermarks;

#[cfg(test)]
mod testutils;

pub use config::Config;
pub use service::{Collaborators, ServiceError, ServiceStatus, TrackingService};
