//! Test-only helpers for building project trees and scripting child processes.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::Path;

use anyhow::{Result, anyhow};
use tempfile::TempDir;

use crate::io::launcher::{LaunchOutput, LaunchRequest, ProcessLauncher};
use crate::io::project::ProjectPaths;

/// A project root in a temporary directory, removed on drop.
pub struct ProjectTree {
    _temp: TempDir,
    paths: ProjectPaths,
}

impl Default for ProjectTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ProjectTree {
    /// Create an empty project with an (empty) `roles/` directory.
    pub fn new() -> Self {
        let temp = tempfile::tempdir().expect("create tempdir");
        let paths = ProjectPaths::new(temp.path());
        fs::create_dir_all(&paths.roles_dir).expect("create roles dir");
        Self { _temp: temp, paths }
    }

    pub fn paths(&self) -> &ProjectPaths {
        &self.paths
    }

    pub fn root(&self) -> &Path {
        &self.paths.root
    }

    /// Write `stacks/<name>/<name>.toml` with the given step references.
    pub fn stack(&self, name: &str, steps: &[&str]) -> &Self {
        write(&self.paths.stack_path(name), &steps_toml(steps));
        self
    }

    /// Write `roles/<name>.toml`. `matchers` is raw TOML for the `[matchers]` table.
    pub fn role(&self, name: &str, steps: &[&str], matchers: &str) -> &Self {
        let mut contents = steps_toml(steps);
        if !matchers.is_empty() {
            contents.push_str("\n[matchers]\n");
            contents.push_str(matchers);
            contents.push('\n');
        }
        write(&self.paths.role_path(name), &contents);
        self
    }

    /// Write `stacks/<stack>/data/<key>.json`.
    pub fn data(&self, stack: &str, key: &str, json: &str) -> &Self {
        write(
            &self.paths.stack_data_dir(stack).join(format!("{key}.json")),
            json,
        );
        self
    }

    /// Write a Python logic unit entry point.
    pub fn python_logic(&self, name: &str, body: &str) -> &Self {
        self.logic_file(name, "__init__.py", body)
    }

    /// Write a Ruby logic unit entry point (`<name>.rb`).
    pub fn ruby_logic(&self, name: &str, body: &str) -> &Self {
        self.logic_file(name, &format!("{name}.rb"), body)
    }

    /// Write an arbitrary file inside `logic/<name>/`.
    pub fn logic_file(&self, name: &str, file: &str, body: &str) -> &Self {
        write(&self.paths.logic_unit_dir(name).join(file), body);
        self
    }

    /// Write `configurator.toml` at the project root.
    pub fn config(&self, contents: &str) -> &Self {
        write(
            &self.paths.root.join(crate::io::config::CONFIG_FILE_NAME),
            contents,
        );
        self
    }
}

fn steps_toml(steps: &[&str]) -> String {
    let quoted = steps
        .iter()
        .map(|step| format!("{step:?}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!("steps = [{quoted}]\n")
}

fn write(path: &Path, contents: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create parent dir");
    }
    fs::write(path, contents).expect("write file");
}

/// Launcher that replays predetermined outputs and records every request.
///
/// Running out of scripted outputs is a launch error.
pub struct ScriptedLauncher {
    outputs: RefCell<VecDeque<LaunchOutput>>,
    requests: RefCell<Vec<LaunchRequest>>,
}

impl ScriptedLauncher {
    pub fn new(outputs: Vec<LaunchOutput>) -> Self {
        Self {
            outputs: RefCell::new(outputs.into()),
            requests: RefCell::new(Vec::new()),
        }
    }

    /// A successful run printing `output`.
    pub fn ok(output: &str) -> LaunchOutput {
        LaunchOutput {
            exit_code: Some(0),
            success: true,
            output: output.to_string(),
            timed_out: false,
        }
    }

    /// A run exiting with `code`.
    pub fn failed(code: i32, output: &str) -> LaunchOutput {
        LaunchOutput {
            exit_code: Some(code),
            success: false,
            output: output.to_string(),
            timed_out: false,
        }
    }

    /// A run killed at its deadline.
    pub fn timed_out(output: &str) -> LaunchOutput {
        LaunchOutput {
            exit_code: None,
            success: false,
            output: output.to_string(),
            timed_out: true,
        }
    }

    /// Requests received so far, in order.
    pub fn requests(&self) -> Vec<LaunchRequest> {
        self.requests.borrow().clone()
    }

    /// Decoded stdin of the `index`-th request.
    pub fn stdin_json(&self, index: usize) -> serde_json::Value {
        let requests = self.requests.borrow();
        let stdin = requests[index].stdin.as_deref().expect("request has stdin");
        serde_json::from_slice(stdin).expect("stdin is JSON")
    }
}

impl ProcessLauncher for ScriptedLauncher {
    fn launch(&self, request: &LaunchRequest) -> Result<LaunchOutput> {
        self.requests.borrow_mut().push(request.clone());
        self.outputs
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted output left for {}", request.command_line()))
    }
}
