//! Autonomous multi-stage LLM pipeline for code changes.
//!
//! A task runs through a fixed set of stages (planner, implementer, verifier,
//! fixer, or a single `simple` pass), each one a call to a coding agent behind
//! the [`io::gateway::Gateway`] seam. The crate keeps a strict split:
//!
//! - **[`core`]**: Pure, deterministic logic (stage contracts, change-set
//!   upserts, phase transitions, mode classification). No I/O.
//! - **[`io`]**: Side-effecting operations (agent CLI processes, git, config,
//!   prompts, run artifacts). Isolated to enable mocking in tests.
//!
//! [`agents`] lifts each stage onto the gateway, and [`orchestrator`] drives
//! a whole run from task to [`orchestrator::RunOutcome`].

pub mod agents;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrator;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
