//! Project tree loading: roles, stacks and stack data.
//!
//! Layout under the project root:
//!
//! ```text
//! roles/<role>.toml
//! stacks/<stack>/<stack>.toml
//! stacks/<stack>/data/*.json
//! logic/<unit>/...
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::types::{Role, RoleFile, Stack, StackFile, parse_steps};
use crate::error::EngineError;

const TOML_EXTENSION: &str = "toml";
const JSON_EXTENSION: &str = "json";

/// All canonical directories within a project root.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    pub root: PathBuf,
    pub roles_dir: PathBuf,
    pub stacks_dir: PathBuf,
    pub logic_dir: PathBuf,
}

impl ProjectPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            roles_dir: root.join("roles"),
            stacks_dir: root.join("stacks"),
            logic_dir: root.join("logic"),
            root,
        }
    }

    pub fn role_path(&self, name: &str) -> PathBuf {
        self.roles_dir.join(format!("{name}.{TOML_EXTENSION}"))
    }

    pub fn stack_path(&self, name: &str) -> PathBuf {
        self.stacks_dir
            .join(name)
            .join(format!("{name}.{TOML_EXTENSION}"))
    }

    pub fn stack_data_dir(&self, name: &str) -> PathBuf {
        self.stacks_dir.join(name).join("data")
    }

    pub fn logic_unit_dir(&self, name: &str) -> PathBuf {
        self.logic_dir.join(name)
    }
}

/// Load `stacks/<name>/<name>.toml`.
pub fn load_stack(paths: &ProjectPaths, name: &str) -> Result<Stack, EngineError> {
    let path = paths.stack_path(name);
    let file: StackFile = read_toml(&path, "stack", name)?;
    let parsed = parse_steps(&file.steps);
    for raw in &parsed.skipped {
        warn!(stack = name, step = %raw, "skipping step with unknown prefix");
    }
    Ok(Stack {
        name: name.to_string(),
        steps: parsed.steps,
    })
}

/// Load `roles/<name>.toml`.
pub fn load_role(paths: &ProjectPaths, name: &str) -> Result<Role, EngineError> {
    let path = paths.role_path(name);
    let file: RoleFile = read_toml(&path, "role", name)?;
    let parsed = parse_steps(&file.steps);
    for raw in &parsed.skipped {
        warn!(role = name, step = %raw, "skipping step with unknown prefix");
    }
    Ok(Role {
        name: name.to_string(),
        steps: parsed.steps,
        matchers: file.matchers,
    })
}

/// List role names (`*.toml` under `roles/`) in lexicographic order.
///
/// Subdirectories are skipped with a warning; other files are ignored.
pub fn list_roles(paths: &ProjectPaths) -> Result<Vec<String>, EngineError> {
    let dir = &paths.roles_dir;
    let entries =
        fs::read_dir(dir).map_err(|err| EngineError::config_load("roles", "*", dir, err))?;

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| EngineError::config_load("roles", "*", dir, err))?;
        let path = entry.path();
        if path.is_dir() {
            warn!(path = %path.display(), "skipping directory in roles");
            continue;
        }
        if path.extension().and_then(|ext| ext.to_str()) != Some(TOML_EXTENSION) {
            debug!(path = %path.display(), "ignoring non-role file");
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
            names.push(stem.to_string());
        }
    }
    names.sort();
    Ok(names)
}

/// Read every `*.json` file in the stack's data directory, in file-name order.
///
/// Keys are file names without the extension. A missing data directory yields
/// no entries.
pub fn load_stack_data(
    paths: &ProjectPaths,
    stack: &str,
) -> Result<Vec<(String, Value)>, EngineError> {
    let dir = paths.stack_data_dir(stack);
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    for entry in fs::read_dir(&dir).map_err(|err| EngineError::data_merge(stack, &dir, err))? {
        let path = entry
            .map_err(|err| EngineError::data_merge(stack, &dir, err))?
            .path();
        if path.is_file() && path.extension().and_then(|ext| ext.to_str()) == Some(JSON_EXTENSION)
        {
            files.push(path);
        }
    }
    files.sort();

    let mut data = Vec::with_capacity(files.len());
    for path in files {
        let Some(key) = path.file_stem().and_then(|stem| stem.to_str()) else {
            continue;
        };
        let contents =
            fs::read_to_string(&path).map_err(|err| EngineError::data_merge(stack, &path, err))?;
        let value: Value = serde_json::from_str(&contents)
            .map_err(|err| EngineError::data_merge(stack, &path, err))?;
        data.push((key.to_string(), value));
    }
    debug!(stack, files = data.len(), "loaded stack data");
    Ok(data)
}

fn read_toml<T: DeserializeOwned>(
    path: &Path,
    kind: &'static str,
    name: &str,
) -> Result<T, EngineError> {
    let contents =
        fs::read_to_string(path).map_err(|err| EngineError::config_load(kind, name, path, err))?;
    toml::from_str(&contents).map_err(|err| EngineError::config_load(kind, name, path, err))
}
