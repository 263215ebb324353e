//! Workflow definition types
//!
//! A workflow is declared in `workflow.yml` inside its own directory:
//!
//! ```yaml
//! name: job
//! description: Job applications
//! stages:
//!   - name: active
//!   - name: submitted
//!   - name: interview
//! identity_fields: [company, role]
//! templates:
//!   - name: resume
//!     file: templates/resume/default.md
//!     output: resume_{{user.preferred_name}}.md
//! processors: []
//! converter:
//!   kind: pandoc
//!   formats: [docx, html, pdf]
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::errors::{EngineError, Result};

/// Workflow definition file name
pub const WORKFLOW_FILE: &str = "workflow.yml";

/// One lifecycle stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Template seeded into new collections
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateRef {
    pub name: String,

    /// Path relative to the workflow directory
    pub file: String,

    /// Output file name inside the collection (may contain placeholders)
    pub output: String,

    /// Alternative template files keyed by variant name
    #[serde(default)]
    pub variants: BTreeMap<String, String>,
}

impl TemplateRef {
    /// Template file for a variant, falling back to the default file
    pub fn file_for(&self, variant: Option<&str>) -> &str {
        variant
            .and_then(|v| self.variants.get(v))
            .map(String::as_str)
            .unwrap_or(&self.file)
    }
}

/// Which converter flavour a workflow uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConverterKind {
    #[default]
    Pandoc,
    Presentation,
}

/// Converter declaration of a workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConverterDecl {
    #[serde(default)]
    pub kind: ConverterKind,

    /// Output formats this workflow can produce
    #[serde(default = "default_formats")]
    pub formats: Vec<String>,

    /// Reference document relative to the workflow directory
    #[serde(default)]
    pub reference_doc: Option<String>,
}

impl Default for ConverterDecl {
    fn default() -> Self {
        Self {
            kind: ConverterKind::default(),
            formats: default_formats(),
            reference_doc: None,
        }
    }
}

fn default_formats() -> Vec<String> {
    vec!["docx".to_string(), "html".to_string(), "pdf".to_string()]
}

/// A named, configured lifecycle process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Ordered lifecycle stages; first is initial, last is terminal
    pub stages: Vec<Stage>,

    /// Names of the fields that identify a collection, in id order
    pub identity_fields: Vec<String>,

    #[serde(default)]
    pub templates: Vec<TemplateRef>,

    /// Processors enabled when the caller does not choose
    #[serde(default)]
    pub processors: Vec<String>,

    #[serde(default)]
    pub converter: ConverterDecl,
}

impl WorkflowDefinition {
    /// Parse and validate a definition from YAML text
    pub fn from_yaml(text: &str) -> Result<Self> {
        let def: WorkflowDefinition = serde_yaml::from_str(text)
            .map_err(|e| EngineError::Validation(format!("invalid workflow definition: {}", e)))?;
        def.validate()?;
        Ok(def)
    }

    /// Check structural rules of the definition
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(EngineError::Validation(
                "workflow name must not be empty".to_string(),
            ));
        }
        if self.stages.is_empty() {
            return Err(EngineError::Validation(format!(
                "workflow '{}' declares no stages",
                self.name
            )));
        }
        let mut seen = HashSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.name.as_str()) {
                return Err(EngineError::Validation(format!(
                    "workflow '{}' declares stage '{}' twice",
                    self.name, stage.name
                )));
            }
        }
        if self.identity_fields.is_empty() {
            return Err(EngineError::Validation(format!(
                "workflow '{}' declares no identity fields",
                self.name
            )));
        }
        Ok(())
    }

    /// Position of a stage in declared order
    pub fn stage_index(&self, stage: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name == stage)
    }

    pub fn initial_stage(&self) -> &str {
        &self.stages[0].name
    }

    pub fn terminal_stage(&self) -> &str {
        &self.stages[self.stages.len() - 1].name
    }

    pub fn stage_names(&self) -> impl Iterator<Item = &str> {
        self.stages.iter().map(|s| s.name.as_str())
    }

    /// The document converted by default: first template's output
    pub fn main_template(&self) -> Option<&TemplateRef> {
        self.templates.first()
    }
}
