//! Test infrastructure for the entity layer.
//!
//! Declarations and contexts shared by the integration tests, plus test
//! doubles for the pool, the adapters and the change notifier.

#![allow(dead_code)]

pub mod fixtures;
pub mod harness;

// Re-export commonly used items
pub use fixtures::*;
pub use harness::*;
