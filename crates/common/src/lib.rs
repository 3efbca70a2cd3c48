//! Shared identifier types used across the event bus and saga crates.

pub mod types;

pub use types::CorrelationId;
