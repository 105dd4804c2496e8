//! Host-side automation engine for role/stack/logic project trees.
//!
//! A project root holds `roles/`, `stacks/` and `logic/`. The engine picks the
//! first role whose matcher accepts this host, gates it on a condition
//! expression, then walks its ordered steps: `stacks/*` recurse, `logic/*` run
//! an external unit with the current data context on stdin.
//!
//! - **[`core`]**: Pure, deterministic logic (step parsing, host matching,
//!   condition evaluation, data context merging). No I/O.
//! - **[`io`]**: Side-effecting operations (project files, configuration,
//!   child processes). Isolated behind traits so tests can script them.
//!
//! [`engine`] coordinates the two to implement `run`, `role`, `stack` and
//! `logic` commands.

pub mod core;
pub mod engine;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
