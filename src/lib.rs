//! Turnkey - a TURN relay server and client session manager
//!
//! Domain-driven layout: relay state (allocations, permissions, channel
//! bindings, credentials) lives in `domain`, sockets and wire formats in
//! `infrastructure`.

pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use domain::shared::{RelayError, Result};
