//! Execution configuration stored at `<root>/configurator.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::condition::{Condition, DEFAULT_CONDITION};

/// File name of the optional configuration file under the project root.
pub const CONFIG_FILE_NAME: &str = "configurator.toml";

/// Process-wide execution settings (TOML).
///
/// Built once at startup, overridden by CLI flags, then passed by reference
/// into every engine call. Missing fields default to safe values: dry run on,
/// interpreters looked up on `PATH`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Preview logic invocations instead of running them.
    pub dry_run: bool,

    /// Interpreter for Python logic units (`__init__.py`).
    pub python_path: String,

    /// Installer for Python `requirements.txt`.
    pub pip_path: String,

    /// Interpreter for Ruby logic units (`<name>.rb`).
    pub ruby_path: String,

    /// Installer for Ruby `Gemfile`.
    pub bundle_path: String,

    /// Condition expression gating each invocation.
    pub conditions: String,

    /// Wall-clock limit for a single child process.
    pub logic_timeout_secs: u64,

    /// Truncate captured child output beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            dry_run: true,
            python_path: "python".to_string(),
            pip_path: "pip".to_string(),
            ruby_path: "ruby".to_string(),
            bundle_path: "bundle".to_string(),
            conditions: DEFAULT_CONDITION.to_string(),
            logic_timeout_secs: 30 * 60,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl ExecutionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.logic_timeout_secs == 0 {
            return Err(anyhow!("logic_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        for (field, value) in [
            ("python_path", &self.python_path),
            ("pip_path", &self.pip_path),
            ("ruby_path", &self.ruby_path),
            ("bundle_path", &self.bundle_path),
        ] {
            if value.trim().is_empty() {
                return Err(anyhow!("{field} must be non-empty"));
            }
        }
        Condition::parse(&self.conditions)
            .with_context(|| format!("conditions {:?} do not parse", self.conditions))?;
        Ok(())
    }

    /// Replace the condition expression; blank input falls back to `true`.
    pub fn set_conditions(&mut self, conditions: &str) {
        let trimmed = conditions.trim();
        self.conditions = if trimmed.is_empty() {
            DEFAULT_CONDITION.to_string()
        } else {
            trimmed.to_string()
        };
    }

    pub fn logic_timeout(&self) -> Duration {
        Duration::from_secs(self.logic_timeout_secs)
    }

    /// Trailing flag passed to logic units.
    pub fn mode_flag(&self) -> &'static str {
        if self.dry_run { "--dryrun" } else { "--no-dryrun" }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ExecutionConfig::default()`.
pub fn load_config(path: &Path) -> Result<ExecutionConfig> {
    if !path.exists() {
        let cfg = ExecutionConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let mut cfg: ExecutionConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    let conditions = cfg.conditions.clone();
    cfg.set_conditions(&conditions);
    cfg.validate()?;
    Ok(cfg)
}
