//! Host-side automation CLI.
//!
//! Picks the role matching this host from a project tree and runs its stacks
//! and logic units. Dry run is the default; pass `--no-dry-run` to execute.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::error;

use configurator::core::data::DataContext;
use configurator::engine::{Engine, RunOutcome};
use configurator::error::EngineError;
use configurator::exit_codes;
use configurator::io::config::{CONFIG_FILE_NAME, ExecutionConfig, load_config};
use configurator::io::host::{host_identity, resolve_hostname};
use configurator::io::launcher::SystemLauncher;
use configurator::io::project::ProjectPaths;
use configurator::logging;

#[derive(Parser)]
#[command(
    name = "configurator",
    version,
    about = "Run the roles, stacks and logic units of a project tree on this host"
)]
struct Cli {
    /// Project root containing `roles/`, `stacks/` and `logic/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    /// Configuration file (defaults to `<root>/configurator.toml`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Python interpreter for `__init__.py` logic units.
    #[arg(long, global = true)]
    python: Option<String>,

    /// pip executable used for `requirements.txt`.
    #[arg(long, global = true)]
    pip: Option<String>,

    /// Ruby interpreter for `<name>.rb` logic units.
    #[arg(long, global = true)]
    ruby: Option<String>,

    /// bundler executable used for `Gemfile`.
    #[arg(long, global = true)]
    bundle: Option<String>,

    /// Preview logic invocations without running them.
    #[arg(long, global = true, conflicts_with = "no_dry_run")]
    dry_run: bool,

    /// Actually run logic units and install their dependencies.
    #[arg(long, global = true)]
    no_dry_run: bool,

    /// Condition expression gating the run (e.g. `tags.env == 'prod'`).
    #[arg(long, global = true)]
    conditions: Option<String>,

    /// Override the detected host name.
    #[arg(long, global = true)]
    hostname: Option<String>,

    /// Host tag as `key:value`. Repeatable.
    #[arg(long = "tag", global = true, value_name = "KEY:VALUE")]
    tags: Vec<String>,

    /// Wall-clock limit per child process, in seconds.
    #[arg(long, global = true)]
    timeout_secs: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the first role (by name) that matches this host.
    Run,
    /// Run one role, if it matches this host.
    Role { name: String },
    /// Run one stack.
    Stack { name: String },
    /// Run one logic unit with an empty data context.
    Logic { name: String },
}

fn main() {
    logging::init();
    match run() {
        Ok(outcome) => {
            let output = outcome.output();
            if !output.is_empty() {
                println!("{output}");
            }
            std::process::exit(exit_codes::OK);
        }
        Err(err) => {
            if let Some(output) = err.downcast_ref::<EngineError>().and_then(EngineError::output) {
                for line in output.lines().filter(|line| !line.trim().is_empty()) {
                    error!("{line}");
                }
            }
            error!("{err:#}");
            std::process::exit(exit_codes::FAILED);
        }
    }
}

fn run() -> Result<RunOutcome> {
    let cli = Cli::parse();
    let config = resolve_config(&cli)?;
    let hostname = match &cli.hostname {
        Some(name) => name.clone(),
        None => resolve_hostname()?,
    };
    let host = host_identity(hostname, &cli.tags)?;
    let paths = ProjectPaths::new(&cli.root);
    let launcher = SystemLauncher;
    let engine = Engine::new(&paths, &config, &host, &launcher);

    let mut context = DataContext::new();
    let outcome = match &cli.command {
        Command::Run => engine.run_roles()?,
        Command::Role { name } => engine.run_role(name, &mut context)?,
        Command::Stack { name } => engine.run_stack(name, &mut context)?,
        Command::Logic { name } => engine.run_logic(name, &mut context)?,
    };
    Ok(outcome)
}

/// Load the config file, then apply CLI overrides before anything runs.
fn resolve_config(cli: &Cli) -> Result<ExecutionConfig> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(|| cli.root.join(CONFIG_FILE_NAME));
    let mut config =
        load_config(&path).with_context(|| format!("load config {}", path.display()))?;

    if let Some(python) = &cli.python {
        config.python_path = python.clone();
    }
    if let Some(pip) = &cli.pip {
        config.pip_path = pip.clone();
    }
    if let Some(ruby) = &cli.ruby {
        config.ruby_path = ruby.clone();
    }
    if let Some(bundle) = &cli.bundle {
        config.bundle_path = bundle.clone();
    }
    if cli.dry_run {
        config.dry_run = true;
    }
    if cli.no_dry_run {
        config.dry_run = false;
    }
    if let Some(conditions) = &cli.conditions {
        config.set_conditions(conditions);
    }
    if let Some(secs) = cli.timeout_secs {
        config.logic_timeout_secs = secs;
    }
    config.validate()?;
    Ok(config)
}
