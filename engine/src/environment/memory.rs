//! In-memory environment for isolated tests

use async_trait::async_trait;
use sdk::errors::Result;
use sdk::manifest::{EnvironmentManifest, WorkflowOrigin};
use sdk::workflow::{WorkflowDefinition, WORKFLOW_FILE};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{Environment, EnvironmentLayout, FilesystemEnvironment};
use crate::storage::{DirEntry, MemoryStorage};

const MEMORY_ROOT: &str = "/memory";

/// Environment whose files live in a [`MemoryStorage`]
#[derive(Debug, Clone)]
pub struct MemoryEnvironment {
    inner: FilesystemEnvironment,
    storage: Arc<MemoryStorage>,
}

impl MemoryEnvironment {
    pub fn new(layout: EnvironmentLayout) -> Self {
        let storage = Arc::new(MemoryStorage::new());
        let inner = FilesystemEnvironment::with_storage(
            Arc::clone(&storage) as Arc<dyn crate::storage::StorageAdapter>,
            MEMORY_ROOT,
            layout,
        );
        Self { inner, storage }
    }

    pub fn with_origin(mut self, origin: WorkflowOrigin) -> Self {
        self.inner = self.inner.with_origin(origin);
        self
    }

    /// Seed a workflow definition
    pub fn with_workflow(self, name: &str, yaml: &str) -> Self {
        let path = self.workflow_path(name).join(WORKFLOW_FILE);
        self.storage.insert_file(path, yaml);
        self
    }

    /// Seed a file inside a workflow directory
    pub fn with_workflow_file(self, name: &str, rel: &str, content: &str) -> Self {
        let path = self.workflow_path(name).join(rel);
        self.storage.insert_file(path, content);
        self
    }

    /// Seed this environment's configuration file
    pub fn with_config(self, toml_text: &str) -> Self {
        let path = Path::new(MEMORY_ROOT).join(&self.inner.layout().config_file);
        self.storage.insert_file(path, toml_text);
        self
    }

    /// Backing storage, for assertions
    pub fn storage(&self) -> &MemoryStorage {
        &self.storage
    }

    fn workflow_path(&self, name: &str) -> PathBuf {
        Path::new(MEMORY_ROOT)
            .join(&self.inner.layout().workflows_dir)
            .join(name)
    }
}

#[async_trait]
impl Environment for MemoryEnvironment {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn manifest(&self) -> Result<EnvironmentManifest> {
        self.inner.manifest().await
    }

    async fn get_workflow(&self, name: &str) -> Result<WorkflowDefinition> {
        self.inner.get_workflow(name).await
    }

    async fn read_workflow_file(&self, workflow: &str, rel: &Path) -> Result<Vec<u8>> {
        self.inner.read_workflow_file(workflow, rel).await
    }

    async fn locate_workflow_file(&self, _workflow: &str, _rel: &Path) -> Result<Option<PathBuf>> {
        // Nothing here exists on disk for external tools to open
        Ok(None)
    }

    async fn get_config(&self) -> Result<Option<toml::Value>> {
        self.inner.get_config().await
    }

    async fn read_file(&self, rel: &Path) -> Result<Vec<u8>> {
        self.inner.read_file(rel).await
    }

    async fn write_file(&self, rel: &Path, content: &[u8]) -> Result<()> {
        self.inner.write_file(rel, content).await
    }

    async fn exists(&self, rel: &Path) -> Result<bool> {
        self.inner.exists(rel).await
    }

    async fn list(&self, rel: &Path) -> Result<Vec<DirEntry>> {
        self.inner.list(rel).await
    }

    async fn mkdir(&self, rel: &Path) -> Result<()> {
        self.inner.mkdir(rel).await
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        self.inner.rename(from, to).await
    }

    async fn remove(&self, rel: &Path) -> Result<()> {
        self.inner.remove(rel).await
    }

    fn resolve_path(&self, _rel: &Path) -> Option<PathBuf> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_seeded_workflow_is_visible() {
        let env = MemoryEnvironment::new(EnvironmentLayout::system()).with_workflow(
            "blog",
            "name: blog\nstages: [{name: draft}]\nidentity_fields: [title]\n",
        );

        assert!(env.has_workflow("blog").await.unwrap());
        assert_eq!(env.get_workflow("blog").await.unwrap().name, "blog");
        assert_eq!(env.storage().file_count(), 1);
    }

    #[tokio::test]
    async fn test_config_is_parsed() {
        let env = MemoryEnvironment::new(EnvironmentLayout::project())
            .with_config("[user]\nname = \"Ada\"\n");
        let config = env.get_config().await.unwrap().unwrap();
        assert_eq!(config["user"]["name"].as_str(), Some("Ada"));
    }

    #[tokio::test]
    async fn test_no_real_paths() {
        let env = MemoryEnvironment::new(EnvironmentLayout::project());
        env.write_file(Path::new("a.md"), b"a").await.unwrap();
        assert!(env.resolve_path(Path::new("a.md")).is_none());
    }
}
