//! Core types for the Stratum data-access layer.
//!
//! This crate holds the pieces everything else depends on: the error type
//! shared across the workspace and the process-wide metrics registry.

pub mod error;
pub mod metrics;

pub use error::{Error, Result};
pub use metrics::MetricsRegistry;
