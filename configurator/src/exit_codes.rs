//! Stable exit codes for configurator CLI commands.

/// Command succeeded, including runs where no role matched or the condition was false.
pub const OK: i32 = 0;
/// Configuration, evaluation or logic execution failed.
pub const FAILED: i32 = 1;
