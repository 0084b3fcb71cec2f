//! Domain layer - relay state without sockets
//!
//! This layer contains:
//! - Shared errors and value objects
//! - The long-term credential store
//! - Allocations and the allocation table
//! - Permission and channel binding registries

pub mod allocation;
pub mod channel;
pub mod credential;
pub mod permission;
pub mod shared;

// Re-export commonly used types
pub use shared::{RelayError, Result};
