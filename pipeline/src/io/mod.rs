//! I/O helpers for pipeline runs.

pub mod claude;
pub mod config;
pub mod gateway;
pub mod git;
pub mod probe;
pub mod process;
pub mod prompt;
pub mod run_log;
