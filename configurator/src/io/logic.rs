//! Logic unit invocation.
//!
//! A logic unit is a directory under `logic/` with one conventional entry
//! point per supported interpreter. Invocation installs the unit's
//! dependencies, then runs the entry point with the data context as JSON on
//! stdin. In dry-run mode nothing is spawned; the command that would have run
//! is returned instead.

use std::path::{Path, PathBuf};

use tracing::{debug, info, instrument, warn};

use crate::core::data::DataContext;
use crate::error::EngineError;
use crate::io::config::ExecutionConfig;
use crate::io::launcher::{LaunchOutput, LaunchRequest, ProcessLauncher};
use crate::io::project::ProjectPaths;

/// Supported logic implementations, probed in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicKind {
    /// `__init__.py`, dependencies from `requirements.txt` via pip.
    Python,
    /// `<name>.rb`, dependencies from `Gemfile` via bundler.
    Ruby,
}

impl LogicKind {
    pub const ALL: [LogicKind; 2] = [LogicKind::Python, LogicKind::Ruby];

    pub fn entry_point(self, unit_dir: &Path, name: &str) -> PathBuf {
        match self {
            LogicKind::Python => unit_dir.join("__init__.py"),
            LogicKind::Ruby => unit_dir.join(format!("{}.rb", base_name(name))),
        }
    }

    pub fn manifest(self, unit_dir: &Path) -> PathBuf {
        match self {
            LogicKind::Python => unit_dir.join("requirements.txt"),
            LogicKind::Ruby => unit_dir.join("Gemfile"),
        }
    }

    fn interpreter(self, config: &ExecutionConfig) -> &str {
        match self {
            LogicKind::Python => &config.python_path,
            LogicKind::Ruby => &config.ruby_path,
        }
    }

    fn install_args(self, config: &ExecutionConfig, manifest: &Path) -> (String, Vec<String>) {
        let manifest = manifest.display().to_string();
        match self {
            LogicKind::Python => (
                config.pip_path.clone(),
                vec!["install".to_string(), "-r".to_string(), manifest],
            ),
            LogicKind::Ruby => (
                config.bundle_path.clone(),
                vec!["install".to_string(), "--gemfile".to_string(), manifest],
            ),
        }
    }
}

/// A resolved logic unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicUnit {
    pub name: String,
    pub kind: LogicKind,
    pub dir: PathBuf,
    pub entry_point: PathBuf,
}

impl LogicUnit {
    pub fn manifest(&self) -> PathBuf {
        self.kind.manifest(&self.dir)
    }
}

/// Probe `logic/<name>/` for a supported entry point.
pub fn resolve_logic(paths: &ProjectPaths, name: &str) -> Result<LogicUnit, EngineError> {
    let dir = paths.logic_unit_dir(name);
    for kind in LogicKind::ALL {
        let entry_point = kind.entry_point(&dir, name);
        if entry_point.is_file() {
            return Ok(LogicUnit {
                name: name.to_string(),
                kind,
                dir,
                entry_point,
            });
        }
    }
    Err(EngineError::UnsupportedLogicKind {
        name: name.to_string(),
        expected: LogicKind::ALL
            .iter()
            .map(|kind| kind.entry_point(&dir, name))
            .collect(),
    })
}

/// Runs logic units with one configuration and launcher.
pub struct LogicInvoker<'a, L: ProcessLauncher> {
    paths: &'a ProjectPaths,
    config: &'a ExecutionConfig,
    launcher: &'a L,
}

impl<'a, L: ProcessLauncher> LogicInvoker<'a, L> {
    pub fn new(paths: &'a ProjectPaths, config: &'a ExecutionConfig, launcher: &'a L) -> Self {
        Self {
            paths,
            config,
            launcher,
        }
    }

    /// Resolve, install dependencies for, and run logic unit `name`.
    ///
    /// Returns the unit's combined output, or the dry-run preview.
    #[instrument(skip_all, fields(logic = name, dry_run = self.config.dry_run))]
    pub fn run_logic(&self, name: &str, context: &DataContext) -> Result<String, EngineError> {
        info!("starting logic: {name}");
        let unit = resolve_logic(self.paths, name)?;
        self.install_dependencies(&unit)?;

        let stdin = context.to_json().map_err(|err| EngineError::LogicExecution {
            name: unit.name.clone(),
            command: unit.entry_point.display().to_string(),
            exit_code: None,
            output: format!("serialize data context: {err}"),
        })?;
        let request = self.invocation_request(&unit, stdin);

        if self.config.dry_run {
            let preview = dry_run_preview(
                unit.kind.interpreter(self.config),
                &[unit.entry_point.display().to_string()],
            );
            info!("{preview}");
            return Ok(preview);
        }

        let output = self.launch(&unit.name, &request)?;
        if !output.success {
            warn!(exit_code = ?output.exit_code, "unable to run logic: {name}");
            return Err(EngineError::LogicExecution {
                name: unit.name,
                command: request.command_line(),
                exit_code: output.exit_code,
                output: output.output,
            });
        }
        info!("executed: {}", request.command_line());
        Ok(output.output)
    }

    /// Install the unit's dependencies if it declares a manifest.
    ///
    /// Returns the installer output, the dry-run preview, or `None` when there
    /// is nothing to install.
    pub fn install_dependencies(&self, unit: &LogicUnit) -> Result<Option<String>, EngineError> {
        let manifest = unit.manifest();
        if !manifest.is_file() {
            debug!(manifest = %manifest.display(), "no dependency manifest");
            return Ok(None);
        }

        let (program, args) = unit.kind.install_args(self.config, &manifest);
        if self.config.dry_run {
            let preview = dry_run_preview(&program, &args);
            info!("{preview}");
            return Ok(Some(preview));
        }

        let request = LaunchRequest {
            program,
            args,
            stdin: None,
            timeout: self.config.logic_timeout(),
            output_limit_bytes: self.config.output_limit_bytes,
        };
        let command = request.command_line();
        let output = self.launch(&unit.name, &request).map_err(|err| match err {
            EngineError::LogicExecution { output, .. } => EngineError::DependencyInstall {
                name: unit.name.clone(),
                command: command.clone(),
                output,
            },
            other => other,
        })?;
        if !output.success {
            warn!(exit_code = ?output.exit_code, "failed executing: {command}");
            return Err(EngineError::DependencyInstall {
                name: unit.name.clone(),
                command,
                output: output.output,
            });
        }
        info!("executed: {command}");
        Ok(Some(output.output))
    }

    fn invocation_request(&self, unit: &LogicUnit, stdin: Vec<u8>) -> LaunchRequest {
        LaunchRequest {
            program: unit.kind.interpreter(self.config).to_string(),
            args: vec![
                unit.entry_point.display().to_string(),
                self.config.mode_flag().to_string(),
            ],
            stdin: Some(stdin),
            timeout: self.config.logic_timeout(),
            output_limit_bytes: self.config.output_limit_bytes,
        }
    }

    /// Launch `request`, mapping spawn failures and timeouts to engine errors.
    fn launch(&self, name: &str, request: &LaunchRequest) -> Result<LaunchOutput, EngineError> {
        let output = self
            .launcher
            .launch(request)
            .map_err(|err| EngineError::LogicExecution {
                name: name.to_string(),
                command: request.command_line(),
                exit_code: None,
                output: format!("{err:#}"),
            })?;
        if output.timed_out {
            return Err(EngineError::Timeout {
                name: name.to_string(),
                command: request.command_line(),
                timeout: request.timeout,
                output: output.output,
            });
        }
        Ok(output)
    }
}

/// `[--dryrun] <program> <args...>`: the flag leads so the preview ends with
/// the path being run.
fn dry_run_preview(program: &str, args: &[String]) -> String {
    let mut preview = format!("[--dryrun] {program}");
    for arg in args {
        preview.push(' ');
        preview.push_str(arg);
    }
    preview
}

/// Last path component of a unit name (`web/nginx` -> `nginx`).
fn base_name(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}
