//! Data context threaded through a run.
//!
//! Keys keep insertion order. Stack data files only fill keys that are still
//! missing, so values set by an ancestor stack or an earlier step win. Step
//! output that decodes as JSON always replaces [`PREVIOUS_STEP_KEY`].

use serde::Serialize;
use serde_json::{Map, Value};

/// Key holding the most recent step's decoded JSON output.
pub const PREVIOUS_STEP_KEY: &str = "previous_step";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct DataContext {
    values: Map<String, Value>,
}

impl DataContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Set `key` unconditionally.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    /// Merge `entries` with first-definition-wins. Returns the keys actually added.
    pub fn merge_missing<I>(&mut self, entries: I) -> Vec<String>
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let mut added = Vec::new();
        for (key, value) in entries {
            if self.values.contains_key(&key) {
                continue;
            }
            added.push(key.clone());
            self.values.insert(key, value);
        }
        added
    }

    /// Store `output` under [`PREVIOUS_STEP_KEY`] if it decodes as JSON.
    ///
    /// Empty or non-JSON output leaves the context untouched. Returns whether
    /// the key was written.
    pub fn record_step_output(&mut self, output: &str) -> bool {
        let trimmed = output.trim();
        if trimmed.is_empty() {
            return false;
        }
        match serde_json::from_str::<Value>(trimmed) {
            Ok(value) => {
                self.values.insert(PREVIOUS_STEP_KEY.to_string(), value);
                true
            }
            Err(_) => false,
        }
    }

    /// Serialize the context as the JSON document handed to logic units.
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&self.values)
    }
}
