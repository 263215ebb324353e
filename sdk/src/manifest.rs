//! Manifest of the workflows visible through an environment

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Where a workflow definition was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowOrigin {
    /// Project-local layer
    Local,
    /// Installed system defaults
    Global,
    /// A standalone environment with no layering
    Standalone,
}

/// Set of workflow names visible through one environment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentManifest {
    workflows: BTreeMap<String, WorkflowOrigin>,
}

impl EnvironmentManifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a manifest from names that all share one origin
    pub fn from_names<I, S>(names: I, origin: WorkflowOrigin) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            workflows: names.into_iter().map(|n| (n.into(), origin)).collect(),
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, origin: WorkflowOrigin) {
        self.workflows.insert(name.into(), origin);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.workflows.contains_key(name)
    }

    /// Origin of a workflow, if visible
    pub fn get(&self, name: &str) -> Option<WorkflowOrigin> {
        self.workflows.get(name).copied()
    }

    /// Workflow names in sorted order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.workflows.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }

    /// Union with a lower-precedence manifest; entries already present win
    pub fn shadow_over(mut self, lower: &EnvironmentManifest) -> Self {
        for (name, origin) in &lower.workflows {
            self.workflows.entry(name.clone()).or_insert(*origin);
        }
        self
    }
}
