//! Project model: stacks, roles, steps and host identity.
//!
//! Step strings are parsed into [`Step`] once at load time so the interpreter
//! dispatches on a closed set instead of re-reading prefixes while recursing.

use std::collections::BTreeMap;

use serde::Deserialize;

const STACK_PREFIX: &str = "stacks/";
const LOGIC_PREFIX: &str = "logic/";

/// One entry of a stack or role step list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// `stacks/<name>`: run another stack with the same data context.
    Stack(String),
    /// `logic/<name>`: invoke a logic unit.
    Logic(String),
}

impl Step {
    /// Parse a declared step value. Unknown prefixes and empty names yield `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        if let Some(name) = raw.strip_prefix(STACK_PREFIX) {
            return (!name.is_empty()).then(|| Step::Stack(name.to_string()));
        }
        if let Some(name) = raw.strip_prefix(LOGIC_PREFIX) {
            return (!name.is_empty()).then(|| Step::Logic(name.to_string()));
        }
        None
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Step::Stack(name) => write!(f, "{STACK_PREFIX}{name}"),
            Step::Logic(name) => write!(f, "{LOGIC_PREFIX}{name}"),
        }
    }
}

/// Parsed step list plus the raw values that were dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedSteps {
    pub steps: Vec<Step>,
    pub skipped: Vec<String>,
}

/// Parse declared step values in order, collecting unrecognized entries separately.
pub fn parse_steps(declared: &[String]) -> ParsedSteps {
    let mut parsed = ParsedSteps::default();
    for raw in declared {
        match Step::parse(raw) {
            Some(step) => parsed.steps.push(step),
            None => parsed.skipped.push(raw.clone()),
        }
    }
    parsed
}

/// A named, ordered list of steps. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stack {
    pub name: String,
    pub steps: Vec<Step>,
}

/// Host-matching predicate declared under `[matchers]` in a role file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Matchers {
    /// `[operator, value]`, e.g. `["~", "^web-\\d+$"]`.
    pub hostname: Vec<String>,
    /// `key:value` entries that must all be present on the host.
    pub tags: Vec<String>,
}

/// A stack plus the matcher that decides whether it applies to this host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Role {
    pub name: String,
    pub steps: Vec<Step>,
    pub matchers: Matchers,
}

/// On-disk shape of `stacks/<name>/<name>.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StackFile {
    pub steps: Vec<String>,
}

/// On-disk shape of `roles/<name>.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RoleFile {
    pub steps: Vec<String>,
    pub matchers: Matchers,
}

/// Identity facts about the current host.
///
/// `tags` holds one map per tag source; nothing in the engine populates them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostIdentity {
    pub hostname: String,
    pub tags: Vec<BTreeMap<String, String>>,
}

impl HostIdentity {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            tags: Vec::new(),
        }
    }

    pub fn with_tags(mut self, tags: BTreeMap<String, String>) -> Self {
        self.tags.push(tags);
        self
    }

    /// Union of all tag sources. Earlier sources win on key collisions.
    pub fn merged_tags(&self) -> BTreeMap<String, String> {
        let mut merged = BTreeMap::new();
        for source in &self.tags {
            for (key, value) in source {
                merged
                    .entry(key.clone())
                    .or_insert_with(|| value.clone());
            }
        }
        merged
    }
}
