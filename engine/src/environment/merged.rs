//! Local-over-global environment composition
//!
//! Reads consult the local layer first and fall through to the global layer
//! only when the local layer reports the entity absent. Writes always target
//! the local layer; the global layer is never mutated, so a project can be
//! reset by deleting its local layer.

use async_trait::async_trait;
use sdk::errors::{EngineError, ErrorKind, Result};
use sdk::manifest::EnvironmentManifest;
use sdk::workflow::WorkflowDefinition;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use super::Environment;
use crate::storage::DirEntry;

#[derive(Debug, Clone)]
pub struct MergedEnvironment {
    local: Arc<dyn Environment>,
    global: Arc<dyn Environment>,
}

/// True when an error only says the entity is missing from this layer
fn is_absent(err: &EngineError) -> bool {
    err.kind() == ErrorKind::NotFound
}

impl MergedEnvironment {
    pub fn new(local: Arc<dyn Environment>, global: Arc<dyn Environment>) -> Self {
        Self { local, global }
    }

    pub fn local(&self) -> &Arc<dyn Environment> {
        &self.local
    }

    pub fn global(&self) -> &Arc<dyn Environment> {
        &self.global
    }
}

#[async_trait]
impl Environment for MergedEnvironment {
    fn describe(&self) -> String {
        format!(
            "merged({} over {})",
            self.local.describe(),
            self.global.describe()
        )
    }

    async fn manifest(&self) -> Result<EnvironmentManifest> {
        let local = self.local.manifest().await?;
        let global = self.global.manifest().await?;
        Ok(local.shadow_over(&global))
    }

    async fn has_workflow(&self, name: &str) -> Result<bool> {
        Ok(self.local.has_workflow(name).await? || self.global.has_workflow(name).await?)
    }

    async fn get_workflow(&self, name: &str) -> Result<WorkflowDefinition> {
        match self.local.get_workflow(name).await {
            Err(e) if is_absent(&e) => {
                debug!("Workflow '{}' not overridden locally", name);
                self.global.get_workflow(name).await
            }
            other => other,
        }
    }

    async fn read_workflow_file(&self, workflow: &str, rel: &Path) -> Result<Vec<u8>> {
        match self.local.read_workflow_file(workflow, rel).await {
            Err(e) if is_absent(&e) => self.global.read_workflow_file(workflow, rel).await,
            other => other,
        }
    }

    async fn locate_workflow_file(&self, workflow: &str, rel: &Path) -> Result<Option<PathBuf>> {
        match self.local.locate_workflow_file(workflow, rel).await? {
            Some(path) => Ok(Some(path)),
            None => self.global.locate_workflow_file(workflow, rel).await,
        }
    }

    async fn get_config(&self) -> Result<Option<toml::Value>> {
        match self.local.get_config().await? {
            Some(config) => Ok(Some(config)),
            None => self.global.get_config().await,
        }
    }

    async fn read_file(&self, rel: &Path) -> Result<Vec<u8>> {
        match self.local.read_file(rel).await {
            Err(e) if is_absent(&e) => self.global.read_file(rel).await,
            other => other,
        }
    }

    async fn write_file(&self, rel: &Path, content: &[u8]) -> Result<()> {
        self.local.write_file(rel, content).await
    }

    async fn exists(&self, rel: &Path) -> Result<bool> {
        Ok(self.local.exists(rel).await? || self.global.exists(rel).await?)
    }

    async fn list(&self, rel: &Path) -> Result<Vec<DirEntry>> {
        let local = self.local.list(rel).await;
        let global = self.global.list(rel).await;

        let mut merged = BTreeMap::new();
        let mut found = false;
        // Global first so local entries overwrite on name clashes
        for layer in [global, local] {
            match layer {
                Ok(entries) => {
                    found = true;
                    for entry in entries {
                        merged.insert(entry.name.clone(), entry);
                    }
                }
                Err(e) if is_absent(&e) => {}
                Err(e) => return Err(e),
            }
        }

        if !found {
            return Err(EngineError::NotFound(rel.to_path_buf()));
        }
        Ok(merged.into_values().collect())
    }

    async fn mkdir(&self, rel: &Path) -> Result<()> {
        self.local.mkdir(rel).await
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        self.local.rename(from, to).await
    }

    async fn remove(&self, rel: &Path) -> Result<()> {
        self.local.remove(rel).await
    }

    fn resolve_path(&self, rel: &Path) -> Option<PathBuf> {
        self.local.resolve_path(rel)
    }
}
