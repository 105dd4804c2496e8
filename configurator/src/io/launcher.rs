//! Launcher abstraction for child process invocation.
//!
//! The [`ProcessLauncher`] trait decouples logic invocation from actually
//! spawning interpreters. Tests use scripted launchers that record requests
//! and return predetermined outputs without spawning processes.

use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

use crate::io::process::run_command_with_timeout;

/// Parameters for one child process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub program: String,
    pub args: Vec<String>,
    /// Bytes written to the child's stdin, if any.
    pub stdin: Option<Vec<u8>>,
    /// Maximum time to wait for the child to exit.
    pub timeout: Duration,
    /// Truncate captured output beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl LaunchRequest {
    /// Shell-like rendering used in logs, errors and dry-run previews.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Result of a completed (or killed) child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchOutput {
    pub exit_code: Option<i32>,
    pub success: bool,
    /// Combined stdout and stderr.
    pub output: String,
    pub timed_out: bool,
}

/// Abstraction over process spawning backends.
pub trait ProcessLauncher {
    /// Run the request to completion. `Err` means the process could not be run at all.
    fn launch(&self, request: &LaunchRequest) -> Result<LaunchOutput>;
}

/// Launcher that spawns real child processes.
pub struct SystemLauncher;

impl ProcessLauncher for SystemLauncher {
    #[instrument(skip_all, fields(program = %request.program, timeout_secs = request.timeout.as_secs()))]
    fn launch(&self, request: &LaunchRequest) -> Result<LaunchOutput> {
        let mut cmd = Command::new(&request.program);
        cmd.args(&request.args);

        let output = run_command_with_timeout(
            cmd,
            request.stdin.as_deref(),
            request.timeout,
            request.output_limit_bytes,
        )
        .with_context(|| format!("run {}", request.command_line()))?;

        if output.timed_out {
            warn!(
                timeout_secs = request.timeout.as_secs(),
                "child process timed out"
            );
        } else if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "child process failed");
        } else {
            debug!("child process completed successfully");
        }

        Ok(LaunchOutput {
            exit_code: output.status.code(),
            success: output.status.success() && !output.timed_out,
            output: output.text(),
            timed_out: output.timed_out,
        })
    }
}
