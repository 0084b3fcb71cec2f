//! Infrastructure layer: protocol implementations, logging and metrics

pub mod logging;
pub mod metrics;
pub mod protocols;
