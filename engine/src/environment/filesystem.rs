//! Environment backed by a storage adapter rooted at a directory

use async_trait::async_trait;
use sdk::errors::{EngineError, Result};
use sdk::manifest::{EnvironmentManifest, WorkflowOrigin};
use sdk::workflow::{WorkflowDefinition, WORKFLOW_FILE};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use super::{checked_relative, checked_workflow_name, Environment, EnvironmentLayout};
use crate::storage::{DirEntry, FsStorage, StorageAdapter};

#[derive(Debug, Clone)]
pub struct FilesystemEnvironment {
    storage: Arc<dyn StorageAdapter>,
    root: PathBuf,
    layout: EnvironmentLayout,
    origin: WorkflowOrigin,
}

impl FilesystemEnvironment {
    /// Environment over the real filesystem
    pub fn new(root: impl Into<PathBuf>, layout: EnvironmentLayout) -> Self {
        Self::with_storage(Arc::new(FsStorage::new()), root, layout)
    }

    /// Environment over an arbitrary storage adapter
    pub fn with_storage(
        storage: Arc<dyn StorageAdapter>,
        root: impl Into<PathBuf>,
        layout: EnvironmentLayout,
    ) -> Self {
        Self {
            storage,
            root: root.into(),
            layout,
            origin: WorkflowOrigin::Standalone,
        }
    }

    /// Tag the workflows this environment reports in its manifest
    pub fn with_origin(mut self, origin: WorkflowOrigin) -> Self {
        self.origin = origin;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn layout(&self) -> &EnvironmentLayout {
        &self.layout
    }

    pub fn storage(&self) -> Arc<dyn StorageAdapter> {
        Arc::clone(&self.storage)
    }

    fn workflows_root(&self) -> PathBuf {
        self.root.join(&self.layout.workflows_dir)
    }

    fn workflow_dir(&self, name: &str) -> Result<PathBuf> {
        Ok(self.workflows_root().join(checked_workflow_name(name)?))
    }

    fn collection_path(&self, rel: &Path) -> Result<PathBuf> {
        let rel = checked_relative(rel)?;
        Ok(self.root.join(&self.layout.collections_dir).join(rel))
    }
}

#[async_trait]
impl Environment for FilesystemEnvironment {
    fn describe(&self) -> String {
        format!("filesystem:{}", self.root.display())
    }

    async fn manifest(&self) -> Result<EnvironmentManifest> {
        let root = self.workflows_root();
        let entries = match self.storage.list(&root).await {
            Ok(entries) => entries,
            Err(EngineError::NotFound(_)) => return Ok(EnvironmentManifest::new()),
            Err(e) => return Err(e),
        };

        let mut manifest = EnvironmentManifest::new();
        for entry in entries.into_iter().filter(|e| e.is_directory) {
            if self
                .storage
                .exists(&root.join(&entry.name).join(WORKFLOW_FILE))
                .await
            {
                manifest.insert(entry.name, self.origin);
            }
        }
        debug!(
            "{} exposes {} workflow(s)",
            self.describe(),
            manifest.len()
        );
        Ok(manifest)
    }

    async fn get_workflow(&self, name: &str) -> Result<WorkflowDefinition> {
        let path = self.workflow_dir(name)?.join(WORKFLOW_FILE);
        let text = match self.storage.read_to_string(&path).await {
            Ok(text) => text,
            Err(EngineError::NotFound(_)) => {
                return Err(EngineError::WorkflowNotFound(name.to_string()))
            }
            Err(e) => return Err(e),
        };

        let def = WorkflowDefinition::from_yaml(&text)?;
        if def.name != name {
            return Err(EngineError::Validation(format!(
                "workflow directory '{}' declares name '{}'",
                name, def.name
            )));
        }
        Ok(def)
    }

    async fn read_workflow_file(&self, workflow: &str, rel: &Path) -> Result<Vec<u8>> {
        let path = self.workflow_dir(workflow)?.join(checked_relative(rel)?);
        self.storage.read(&path).await
    }

    async fn locate_workflow_file(&self, workflow: &str, rel: &Path) -> Result<Option<PathBuf>> {
        let path = self.workflow_dir(workflow)?.join(checked_relative(rel)?);
        Ok(self.storage.exists(&path).await.then_some(path))
    }

    async fn get_config(&self) -> Result<Option<toml::Value>> {
        let path = self.root.join(&self.layout.config_file);
        let text = match self.storage.read_to_string(&path).await {
            Ok(text) => text,
            Err(EngineError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let value: toml::Value = toml::from_str(&text).map_err(|e| {
            EngineError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        Ok(Some(value))
    }

    async fn read_file(&self, rel: &Path) -> Result<Vec<u8>> {
        self.storage.read(&self.collection_path(rel)?).await
    }

    async fn write_file(&self, rel: &Path, content: &[u8]) -> Result<()> {
        self.storage
            .write(&self.collection_path(rel)?, content)
            .await
    }

    async fn exists(&self, rel: &Path) -> Result<bool> {
        Ok(self.storage.exists(&self.collection_path(rel)?).await)
    }

    async fn list(&self, rel: &Path) -> Result<Vec<DirEntry>> {
        self.storage.list(&self.collection_path(rel)?).await
    }

    async fn mkdir(&self, rel: &Path) -> Result<()> {
        self.storage.mkdir(&self.collection_path(rel)?, true).await
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let from = self.collection_path(from)?;
        let to = self.collection_path(to)?;
        if let Some(parent) = to.parent() {
            self.storage.mkdir(parent, true).await?;
        }
        self.storage.rename(&from, &to).await
    }

    async fn remove(&self, rel: &Path) -> Result<()> {
        self.storage.remove(&self.collection_path(rel)?).await
    }

    fn resolve_path(&self, rel: &Path) -> Option<PathBuf> {
        self.collection_path(rel).ok()
    }
}
