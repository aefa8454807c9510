//! Stable exit codes for pipeline CLI commands.

/// Command succeeded, or the run reached `done`.
pub const OK: i32 = 0;
/// Invalid arguments, task, or config, or a failure writing artifacts.
pub const INVALID: i32 = 1;
/// The run finished in `failed`.
pub const FAILED: i32 = 2;
