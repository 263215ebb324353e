//! Docflow SDK
//!
//! Shared library providing the data model and error types for docflow.
//! This crate is used by the engine and by collaborators (HTTP layers,
//! tooling) that need to read collection metadata or map engine errors.

/// Error types and handling
pub mod errors;

/// Collection metadata types
pub mod types;

/// Workflow definition types
pub mod workflow;

/// Environment manifest types
pub mod manifest;

// Re-export commonly used types
pub use errors::{public_message, DocflowErrorExt, EngineError, ErrorKind, Result};
pub use manifest::{EnvironmentManifest, WorkflowOrigin};
pub use types::{CollectionMetadata, StatusEntry, METADATA_FILE, REQUIRED_FIELDS};
pub use workflow::{
    ConverterDecl, ConverterKind, Stage, TemplateRef, WorkflowDefinition, WORKFLOW_FILE,
};
