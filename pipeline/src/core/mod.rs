//! Deterministic, pure logic shared by the pipeline.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod cancel;
pub mod capability;
pub mod changes;
pub mod classifier;
pub mod state;
pub mod transition;
pub mod types;
