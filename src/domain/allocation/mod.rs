//! Allocations and their registry

pub mod entity;
pub mod table;

pub use entity::Allocation;
pub use table::{AllocationTable, LifetimePolicy, Refreshed};
