//! Environment abstraction
//!
//! An environment is a queryable source of workflows, configuration and
//! collection files. Three variants exist:
//!
//! - [`FilesystemEnvironment`]: a storage adapter rooted at a directory
//! - [`MemoryEnvironment`]: the same layout over an in-process map, for tests
//! - [`MergedEnvironment`]: a project-local layer over the installed defaults
//!
//! All collection paths handed to an environment are relative to its
//! collections directory and must stay inside it: absolute paths and `..`
//! components are rejected before any I/O.

use async_trait::async_trait;
use sdk::errors::{EngineError, Result};
use sdk::manifest::EnvironmentManifest;
use sdk::workflow::WorkflowDefinition;
use std::path::{Component, Path, PathBuf};

use crate::storage::DirEntry;

pub mod filesystem;
pub mod memory;
pub mod merged;

pub use filesystem::FilesystemEnvironment;
pub use memory::MemoryEnvironment;
pub use merged::MergedEnvironment;

/// Name of the project marker directory
pub const PROJECT_MARKER: &str = ".docflow";

/// Where an environment keeps each kind of entity, relative to its root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentLayout {
    pub workflows_dir: PathBuf,
    pub config_file: PathBuf,
    pub collections_dir: PathBuf,
}

impl EnvironmentLayout {
    /// Layout of an installed system root
    pub fn system() -> Self {
        Self {
            workflows_dir: PathBuf::from("workflows"),
            config_file: PathBuf::from("config.toml"),
            collections_dir: PathBuf::from("collections"),
        }
    }

    /// Layout of a project root
    pub fn project() -> Self {
        Self {
            workflows_dir: Path::new(PROJECT_MARKER).join("workflows"),
            config_file: Path::new(PROJECT_MARKER).join("config.toml"),
            collections_dir: PathBuf::new(),
        }
    }
}

/// Capabilities shared by every environment variant
#[async_trait]
pub trait Environment: Send + Sync + std::fmt::Debug {
    /// Short description for logs
    fn describe(&self) -> String;

    /// Workflows visible through this environment
    async fn manifest(&self) -> Result<EnvironmentManifest>;

    async fn has_workflow(&self, name: &str) -> Result<bool> {
        Ok(self.manifest().await?.contains(name))
    }

    /// Load a workflow definition; `WorkflowNotFound` when absent
    async fn get_workflow(&self, name: &str) -> Result<WorkflowDefinition>;

    /// Read a file relative to a workflow's directory (templates, assets)
    async fn read_workflow_file(&self, workflow: &str, rel: &Path) -> Result<Vec<u8>>;

    /// Real on-disk path of a workflow file, if this layer has it on disk
    async fn locate_workflow_file(&self, workflow: &str, rel: &Path) -> Result<Option<PathBuf>>;

    /// This environment's own configuration layer, if it has one
    async fn get_config(&self) -> Result<Option<toml::Value>>;

    async fn read_file(&self, rel: &Path) -> Result<Vec<u8>>;

    async fn write_file(&self, rel: &Path, content: &[u8]) -> Result<()>;

    async fn exists(&self, rel: &Path) -> Result<bool>;

    async fn list(&self, rel: &Path) -> Result<Vec<DirEntry>>;

    /// Create a directory and its ancestors
    async fn mkdir(&self, rel: &Path) -> Result<()>;

    async fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    async fn remove(&self, rel: &Path) -> Result<()>;

    /// Real on-disk path of a collection path, if backed by real storage
    fn resolve_path(&self, rel: &Path) -> Option<PathBuf>;
}

/// Reject paths that could escape the environment root
pub fn checked_relative(rel: &Path) -> Result<&Path> {
    let escapes = rel.components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });
    if escapes {
        return Err(EngineError::Validation(format!(
            "path '{}' must be relative and stay inside the environment",
            rel.display()
        )));
    }
    Ok(rel)
}

/// Reject workflow names that are not a single plain path segment
pub fn checked_workflow_name(name: &str) -> Result<&str> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        return Err(EngineError::Validation(format!(
            "invalid workflow name '{}'",
            name
        )));
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checked_relative() {
        assert!(checked_relative(Path::new("job/active/x")).is_ok());
        assert!(checked_relative(Path::new("")).is_ok());
        assert!(checked_relative(Path::new("../etc/passwd")).is_err());
        assert!(checked_relative(Path::new("job/../../x")).is_err());
        assert!(checked_relative(Path::new("/etc/passwd")).is_err());
    }

    #[test]
    fn test_checked_workflow_name() {
        assert!(checked_workflow_name("job").is_ok());
        assert!(checked_workflow_name("blog-post_2").is_ok());
        assert!(checked_workflow_name("").is_err());
        assert!(checked_workflow_name("../job").is_err());
        assert!(checked_workflow_name("a/b").is_err());
    }

    #[test]
    fn test_project_layout_keeps_collections_at_root() {
        let layout = EnvironmentLayout::project();
        assert_eq!(layout.collections_dir, PathBuf::new());
        assert_eq!(layout.config_file, PathBuf::from(".docflow/config.toml"));
    }
}
