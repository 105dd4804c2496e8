//! Engine error kinds.
//!
//! Every error aborts the enclosing stack and role and is handed back to the
//! caller as-is. Variants that carry child output expose it via
//! [`EngineError::output`] so the CLI can log it.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::core::condition::ConditionError;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unable to load {kind} {name} from {}", .path.display())]
    ConfigLoad {
        kind: &'static str,
        name: String,
        path: PathBuf,
        #[source]
        source: BoxError,
    },

    #[error("condition {expression:?} failed to evaluate")]
    Evaluation {
        expression: String,
        #[source]
        source: ConditionError,
    },

    #[error("logic {name} has no supported entry point (expected one of: {})", display_paths(.expected))]
    UnsupportedLogicKind { name: String, expected: Vec<PathBuf> },

    #[error("installing dependencies for logic {name} failed: {command}")]
    DependencyInstall {
        name: String,
        command: String,
        output: String,
    },

    #[error("logic {name} failed (exit code {}): {command}", display_code(.exit_code))]
    LogicExecution {
        name: String,
        command: String,
        exit_code: Option<i32>,
        output: String,
    },

    #[error("unable to merge data file {} into stack {stack}", .path.display())]
    DataMerge {
        stack: String,
        path: PathBuf,
        #[source]
        source: BoxError,
    },

    #[error("cyclic stack reference: {}", .chain.join(" -> "))]
    CyclicReference { chain: Vec<String> },

    #[error("{name} timed out after {}s: {command}", .timeout.as_secs())]
    Timeout {
        name: String,
        command: String,
        timeout: Duration,
        output: String,
    },
}

impl EngineError {
    pub fn config_load(
        kind: &'static str,
        name: &str,
        path: impl Into<PathBuf>,
        source: impl Into<BoxError>,
    ) -> Self {
        EngineError::ConfigLoad {
            kind,
            name: name.to_string(),
            path: path.into(),
            source: source.into(),
        }
    }

    pub fn data_merge(stack: &str, path: impl Into<PathBuf>, source: impl Into<BoxError>) -> Self {
        EngineError::DataMerge {
            stack: stack.to_string(),
            path: path.into(),
            source: source.into(),
        }
    }

    /// Output captured from a child process before the failure, if any.
    pub fn output(&self) -> Option<&str> {
        match self {
            EngineError::DependencyInstall { output, .. }
            | EngineError::LogicExecution { output, .. }
            | EngineError::Timeout { output, .. } => Some(output),
            _ => None,
        }
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|path| path.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn display_code(code: &Option<i32>) -> String {
    code.map_or_else(|| "none".to_string(), |code| code.to_string())
}
