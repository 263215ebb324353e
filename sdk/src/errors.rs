//! Error types and handling
//!
//! This module provides the error types used throughout docflow.
//! All errors implement the `DocflowErrorExt` trait which provides user-friendly
//! hints and indicates whether errors are recoverable.
//!
//! # Security
//!
//! Error text may contain filesystem paths, command lines and tool output.
//! Anything crossing a user-facing boundary (CLI output for remote callers,
//! HTTP responses) must go through [`public_message`], which only lets the
//! text of allow-listed kinds through and replaces everything else with a hint.

use std::path::PathBuf;
use thiserror::Error;

/// Result type used across docflow crates
pub type Result<T> = std::result::Result<T, EngineError>;

/// Trait for docflow error extensions
pub trait DocflowErrorExt {
    /// Returns a user-friendly hint for the error
    ///
    /// The hint is safe to display to end users and does not contain
    /// file paths, command lines or tool output.
    fn user_hint(&self) -> &str;

    /// Returns whether the error is recoverable
    ///
    /// Recoverable errors can be retried or worked around by the caller.
    fn is_recoverable(&self) -> bool;
}

/// Coarse error classification used at component boundaries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Validation,
    Config,
    ExternalTool,
    Timeout,
    ResourceLimit,
    Consistency,
    Internal,
}

impl ErrorKind {
    /// Kinds whose own message may be shown to end users verbatim
    pub fn is_user_visible(self) -> bool {
        matches!(
            self,
            ErrorKind::Validation | ErrorKind::Timeout | ErrorKind::ResourceLimit
        )
    }
}

/// Main engine error type
///
/// # Error Categories
///
/// - **Discovery**: project or system root could not be located
/// - **Lookup**: workflow, collection or storage path missing
/// - **Validation**: malformed input, unknown workflow or stage
/// - **External tools**: detection failure, nonzero exit, malformed command
/// - **Limits**: deadlines and concurrency ceilings
/// - **Consistency**: on-disk state that contradicts the data model
///
/// # Examples
///
/// ```
/// use sdk::errors::{DocflowErrorExt, EngineError, ErrorKind};
///
/// let error = EngineError::WorkflowNotFound("podcast".to_string());
/// assert_eq!(error.kind(), ErrorKind::NotFound);
/// assert!(error.is_recoverable());
///
/// let error = EngineError::Consistency("duplicate id".to_string());
/// assert!(!error.is_recoverable());
/// ```
#[derive(Debug, Error)]
pub enum EngineError {
    // Discovery errors
    #[error("No docflow project found above {0:?}")]
    ProjectNotFound(PathBuf),

    #[error("System installation not found: {0}")]
    SystemNotFound(String),

    // Lookup errors
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Collection not found: {workflow}/{id}")]
    CollectionNotFound { workflow: String, id: String },

    #[error("Path not found: {0:?}")]
    NotFound(PathBuf),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Malformed metadata in {path:?}: {reason}")]
    MalformedMetadata { path: PathBuf, reason: String },

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // External tool errors
    #[error("External tool error: {0}")]
    ExternalTool(String),

    // Limit errors
    #[error("Operation '{operation}' timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    #[error("Too many concurrent operations: {running}/{limit}")]
    ResourceLimit { running: usize, limit: usize },

    // Consistency errors
    #[error("Consistency violation: {0}")]
    Consistency(String),

    // Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Classify this error for boundary mapping
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ProjectNotFound(_)
            | Self::SystemNotFound(_)
            | Self::WorkflowNotFound(_)
            | Self::CollectionNotFound { .. }
            | Self::NotFound(_) => ErrorKind::NotFound,
            Self::Validation(_) | Self::MalformedMetadata { .. } => ErrorKind::Validation,
            Self::Config(_) => ErrorKind::Config,
            Self::ExternalTool(_) => ErrorKind::ExternalTool,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::ResourceLimit { .. } => ErrorKind::ResourceLimit,
            Self::Consistency(_) => ErrorKind::Consistency,
            Self::Io(e) if e.kind() == std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            Self::Io(_) => ErrorKind::Internal,
        }
    }

    /// Convert an IO error into `NotFound` when it refers to a missing path
    pub fn from_io(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound(path.into())
        } else {
            Self::Io(err)
        }
    }
}

impl DocflowErrorExt for EngineError {
    fn user_hint(&self) -> &str {
        match self {
            Self::ProjectNotFound(_) => "Not inside a docflow project. Run 'docflow init' first",
            Self::SystemNotFound(_) => "docflow installation is incomplete. Set DOCFLOW_SYSTEM_ROOT",
            Self::WorkflowNotFound(_) => "Unknown workflow. Run 'docflow workflows' to list them",
            Self::CollectionNotFound { .. } => "No collection with that id exists",
            Self::NotFound(_) => "A required file is missing",
            Self::Validation(_) => "The request was invalid",
            Self::MalformedMetadata { .. } => "A collection's metadata file could not be read",
            Self::Config(_) => "Check your config.toml files for errors",
            Self::ExternalTool(_) => "An external tool failed. Check that it is installed",
            Self::Timeout { .. } => "The operation took too long. Try again",
            Self::ResourceLimit { .. } => "Too many operations are running. Try again shortly",
            Self::Consistency(_) => "Project data is inconsistent and needs manual repair",
            Self::Io(_) => "File system operation failed",
        }
    }

    fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Self::SystemNotFound(_) | Self::Consistency(_) | Self::Config(_)
        )
    }
}

/// Render an error for display to an end user
///
/// Only validation, timeout and resource-limit errors are shown verbatim.
/// All other kinds collapse to their hint so internal details never leak.
pub fn public_message(error: &EngineError) -> String {
    if error.kind().is_user_visible() && !matches!(error, EngineError::MalformedMetadata { .. }) {
        error.to_string()
    } else {
        error.user_hint().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            EngineError::ProjectNotFound(PathBuf::from("/tmp")).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            EngineError::Validation("bad".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            EngineError::ResourceLimit {
                running: 4,
                limit: 4
            }
            .kind(),
            ErrorKind::ResourceLimit
        );
        assert_eq!(
            EngineError::Consistency("dup".into()).kind(),
            ErrorKind::Consistency
        );
        assert_eq!(EngineError::Config("bad".into()).kind(), ErrorKind::Config);
        assert!(!ErrorKind::Config.is_user_visible());
    }

    #[test]
    fn test_io_not_found_maps_to_not_found() {
        let err = EngineError::from_io(
            "/missing",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(matches!(err, EngineError::NotFound(_)));

        let err = EngineError::from_io(
            "/denied",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "no"),
        );
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_public_message_hides_internal_text() {
        let err = EngineError::ExternalTool("pandoc exited 1: /home/me/secret.md".into());
        let msg = public_message(&err);
        assert!(!msg.contains("/home/me"));
        assert_eq!(msg, err.user_hint());
    }

    #[test]
    fn test_public_message_shows_allow_listed_kinds() {
        let err = EngineError::Validation("unknown stage 'done'".into());
        assert!(public_message(&err).contains("unknown stage 'done'"));

        let err = EngineError::Timeout {
            operation: "pandoc".into(),
            seconds: 30,
        };
        assert!(public_message(&err).contains("30s"));
    }

    #[test]
    fn test_malformed_metadata_path_not_exposed() {
        let err = EngineError::MalformedMetadata {
            path: PathBuf::from("/srv/project/job/active/x/collection.yml"),
            reason: "bad yaml".into(),
        };
        assert!(!public_message(&err).contains("/srv"));
    }

    #[test]
    fn test_config_error_shows_hint_only() {
        let err = EngineError::Config(
            "Failed to parse /home/ada/.config/docflow/config.toml: expected '='".into(),
        );
        let msg = public_message(&err);
        assert!(!msg.contains("/home/ada"));
        assert_eq!(msg, err.user_hint());
    }
}
