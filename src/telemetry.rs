//! Logging, metrics and health endpoints.

pub mod health;
pub mod logging;
pub mod metrics;
