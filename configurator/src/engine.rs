//! Role and stack interpreter.
//!
//! Walks a role or stack's steps in order, recursing into nested stacks and
//! running logic units as leaves. One [`DataContext`] is threaded by mutable
//! reference through the whole descent, so every step sees data merged by its
//! ancestors and the `previous_step` value written by the step before it.
//!
//! Execution is sequential and fail-fast: the first failing step aborts the
//! enclosing stack, role and run.

use tracing::{debug, info, instrument, warn};

use crate::core::condition;
use crate::core::data::DataContext;
use crate::core::matcher;
use crate::core::types::{HostIdentity, Role, Step};
use crate::error::EngineError;
use crate::io::config::ExecutionConfig;
use crate::io::launcher::ProcessLauncher;
use crate::io::logic::LogicInvoker;
use crate::io::project::{self, ProjectPaths};

/// Why an invocation did nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The role's matcher rejected this host (or no role matched at all).
    NoMatch,
    /// The configured condition evaluated to false.
    ConditionFalse,
}

/// Result of a successful entry-point invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Steps ran; `output` is every step's output joined by newlines.
    Completed { output: String },
    Skipped { reason: SkipReason },
}

impl RunOutcome {
    /// Output of the run; empty when skipped.
    pub fn output(&self) -> &str {
        match self {
            RunOutcome::Completed { output } => output,
            RunOutcome::Skipped { .. } => "",
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, RunOutcome::Skipped { .. })
    }
}

/// Entry points over one project tree, configuration and host.
pub struct Engine<'a, L: ProcessLauncher> {
    paths: &'a ProjectPaths,
    config: &'a ExecutionConfig,
    host: &'a HostIdentity,
    invoker: LogicInvoker<'a, L>,
}

impl<'a, L: ProcessLauncher> Engine<'a, L> {
    pub fn new(
        paths: &'a ProjectPaths,
        config: &'a ExecutionConfig,
        host: &'a HostIdentity,
        launcher: &'a L,
    ) -> Self {
        Self {
            paths,
            config,
            host,
            invoker: LogicInvoker::new(paths, config, launcher),
        }
    }

    /// Run the first role, in name order, whose matcher accepts this host.
    ///
    /// Later roles are never loaded once one matches, even if its condition
    /// then skips it.
    #[instrument(skip_all)]
    pub fn run_roles(&self) -> Result<RunOutcome, EngineError> {
        for name in project::list_roles(self.paths)? {
            let role = project::load_role(self.paths, &name)?;
            if !matcher::matches(&role.matchers, self.host) {
                debug!(role = %name, "role does not match host");
                continue;
            }
            info!(role = %name, "selected role");
            let mut context = DataContext::new();
            return self.run_matched_role(&role, &mut context);
        }
        info!(hostname = %self.host.hostname, "no role matches this host");
        Ok(RunOutcome::Skipped {
            reason: SkipReason::NoMatch,
        })
    }

    /// Run role `name` if it matches this host and the condition holds.
    #[instrument(skip_all, fields(role = name))]
    pub fn run_role(
        &self,
        name: &str,
        context: &mut DataContext,
    ) -> Result<RunOutcome, EngineError> {
        let role = project::load_role(self.paths, name)?;
        if !matcher::matches(&role.matchers, self.host) {
            info!("skipping role {name}: host {} does not match", self.host.hostname);
            return Ok(RunOutcome::Skipped {
                reason: SkipReason::NoMatch,
            });
        }
        self.run_matched_role(&role, context)
    }

    /// Run stack `name` if the condition holds.
    #[instrument(skip_all, fields(stack = name))]
    pub fn run_stack(
        &self,
        name: &str,
        context: &mut DataContext,
    ) -> Result<RunOutcome, EngineError> {
        if !self.condition_holds()? {
            return Ok(condition_false());
        }
        let output = self.run_stack_in(name, context, &mut Vec::new())?;
        info!("completed stack {name}");
        Ok(RunOutcome::Completed { output })
    }

    /// Run logic unit `name` if the condition holds.
    #[instrument(skip_all, fields(logic = name))]
    pub fn run_logic(
        &self,
        name: &str,
        context: &mut DataContext,
    ) -> Result<RunOutcome, EngineError> {
        if !self.condition_holds()? {
            return Ok(condition_false());
        }
        let output = self.invoker.run_logic(name, context)?;
        context.record_step_output(&output);
        Ok(RunOutcome::Completed { output })
    }

    fn run_matched_role(
        &self,
        role: &Role,
        context: &mut DataContext,
    ) -> Result<RunOutcome, EngineError> {
        if !self.condition_holds()? {
            return Ok(condition_false());
        }
        info!("starting role {}", role.name);
        let output = self.run_steps(&role.steps, context, &mut Vec::new())?;
        info!("completed role {}", role.name);
        Ok(RunOutcome::Completed { output })
    }

    fn condition_holds(&self) -> Result<bool, EngineError> {
        let expression = &self.config.conditions;
        let holds = condition::evaluate(expression, self.host).map_err(|source| {
            EngineError::Evaluation {
                expression: expression.clone(),
                source,
            }
        })?;
        if !holds {
            info!(condition = %expression, "condition not met, skipping");
        }
        Ok(holds)
    }

    /// Load stack `name`, merge its data, and run its steps.
    ///
    /// `chain` holds the stacks currently being executed, outermost first.
    fn run_stack_in(
        &self,
        name: &str,
        context: &mut DataContext,
        chain: &mut Vec<String>,
    ) -> Result<String, EngineError> {
        if chain.iter().any(|active| active == name) {
            let mut cycle = chain.clone();
            cycle.push(name.to_string());
            return Err(EngineError::CyclicReference { chain: cycle });
        }

        info!("starting stack {name}");
        let stack = project::load_stack(self.paths, name)?;
        let data = project::load_stack_data(self.paths, name)?;
        let added = context.merge_missing(data);
        if !added.is_empty() {
            debug!(stack = name, keys = ?added, "merged stack data");
        }

        chain.push(name.to_string());
        let result = self.run_steps(&stack.steps, context, chain);
        chain.pop();
        result
    }

    fn run_steps(
        &self,
        steps: &[Step],
        context: &mut DataContext,
        chain: &mut Vec<String>,
    ) -> Result<String, EngineError> {
        let mut outputs = Vec::with_capacity(steps.len());
        for (index, step) in steps.iter().enumerate() {
            debug!(index, %step, "executing step");
            let output = match step {
                Step::Stack(name) => self.run_stack_in(name, context, chain),
                Step::Logic(name) => self.invoker.run_logic(name, context),
            }
            .inspect_err(|err| warn!(index, %step, "step failed: {err}"))?;

            // Nested stacks have already recorded their own steps.
            if matches!(step, Step::Logic(_)) && context.record_step_output(&output) {
                debug!(index, %step, "recorded previous_step");
            }
            outputs.push(output);
        }
        Ok(outputs.join("\n"))
    }
}

fn condition_false() -> RunOutcome {
    RunOutcome::Skipped {
        reason: SkipReason::ConditionFalse,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ProjectTree, ScriptedLauncher};
    use serde_json::json;

    fn live() -> ExecutionConfig {
        ExecutionConfig {
            dry_run: false,
            ..ExecutionConfig::default()
        }
    }

    #[test]
    fn outcome_output_is_empty_when_skipped() {
        let skipped = RunOutcome::Skipped {
            reason: SkipReason::NoMatch,
        };
        assert_eq!(skipped.output(), "");
        assert!(skipped.is_skipped());

        let done = RunOutcome::Completed {
            output: "ok".to_string(),
        };
        assert_eq!(done.output(), "ok");
        assert!(!done.is_skipped());
    }

    #[test]
    fn self_referencing_stack_is_cyclic() {
        let tree = ProjectTree::new();
        tree.stack("a", &["stacks/b"]).stack("b", &["stacks/a"]);
        let config = live();
        let host = HostIdentity::new("h");
        let launcher = ScriptedLauncher::new(Vec::new());
        let engine = Engine::new(tree.paths(), &config, &host, &launcher);

        let err = engine.run_stack("a", &mut DataContext::new()).unwrap_err();
        match err {
            EngineError::CyclicReference { chain } => assert_eq!(chain, ["a", "b", "a"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn repeated_sibling_stack_is_not_a_cycle() {
        let tree = ProjectTree::new();
        tree.stack("top", &["stacks/leaf", "stacks/leaf"])
            .stack("leaf", &["logic/one"])
            .python_logic("one", "");
        let config = live();
        let host = HostIdentity::new("h");
        let launcher = ScriptedLauncher::new(vec![
            ScriptedLauncher::ok("1"),
            ScriptedLauncher::ok("2"),
        ]);
        let engine = Engine::new(tree.paths(), &config, &host, &launcher);

        let outcome = engine.run_stack("top", &mut DataContext::new()).expect("run");
        assert_eq!(outcome.output(), "1\n2");
    }

    #[test]
    fn direct_logic_run_records_previous_step() {
        let tree = ProjectTree::new();
        tree.python_logic("probe", "");
        let config = live();
        let host = HostIdentity::new("h");
        let launcher = ScriptedLauncher::new(vec![ScriptedLauncher::ok(r#"{"up":true}"#)]);
        let engine = Engine::new(tree.paths(), &config, &host, &launcher);

        let mut ctx = DataContext::new();
        engine.run_logic("probe", &mut ctx).expect("run");
        assert_eq!(ctx.get("previous_step"), Some(&json!({"up": true})));
    }
}
