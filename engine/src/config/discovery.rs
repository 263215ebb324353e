//! Root discovery
//!
//! Both the project root and the system installation root are found with the
//! same "nearest marker" walk: starting at a directory, inspect it and each
//! ancestor up to the filesystem root, and stop at the first one carrying the
//! marker. Discovery failures are reported immediately and never retried.

use sdk::errors::{EngineError, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::environment::PROJECT_MARKER;
use crate::storage::StorageAdapter;

/// Environment variable pointing at the system installation root
pub const SYSTEM_ROOT_ENV: &str = "DOCFLOW_SYSTEM_ROOT";

/// Package descriptor identifying a system installation root
pub const SYSTEM_DESCRIPTOR: &str = "docflow-package.toml";

/// What makes a directory a root
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    /// Contains the `.docflow` project directory
    Project,
    /// Contains `workflows/` and the package descriptor
    System,
}

impl Marker {
    async fn matches(self, storage: &dyn StorageAdapter, dir: &Path) -> bool {
        match self {
            Marker::Project => is_dir(storage, &dir.join(PROJECT_MARKER)).await,
            Marker::System => {
                is_dir(storage, &dir.join("workflows")).await
                    && storage.exists(&dir.join(SYSTEM_DESCRIPTOR)).await
            }
        }
    }
}

async fn is_dir(storage: &dyn StorageAdapter, path: &Path) -> bool {
    storage
        .stat(path)
        .await
        .map(|s| s.is_directory)
        .unwrap_or(false)
}

/// Nearest ancestor of `start` (inclusive) carrying `marker`
pub async fn find_upwards(
    storage: &dyn StorageAdapter,
    start: &Path,
    marker: Marker,
) -> Option<PathBuf> {
    for dir in start.ancestors() {
        if marker.matches(storage, dir).await {
            debug!("Found {:?} root at {}", marker, dir.display());
            return Some(dir.to_path_buf());
        }
    }
    None
}

/// Locate the project root above `start`
pub async fn find_project_root(storage: &dyn StorageAdapter, start: &Path) -> Result<PathBuf> {
    find_upwards(storage, start, Marker::Project)
        .await
        .ok_or_else(|| EngineError::ProjectNotFound(start.to_path_buf()))
}

/// Where to look for the system installation
#[derive(Debug, Clone, Default)]
pub struct SystemSearch {
    /// Fixed location; when set, nothing else is consulted
    pub explicit: Option<PathBuf>,
    /// Starting points for upward searches, tried in order
    pub search_from: Vec<PathBuf>,
    /// Fixed fallback checked last, without walking upwards
    pub fallback: Option<PathBuf>,
}

impl SystemSearch {
    /// Search order for a normal command-line invocation
    ///
    /// `--system-root` or `DOCFLOW_SYSTEM_ROOT` pin the location. Otherwise
    /// the executable's directory and the working directory are walked
    /// upwards, then the per-user data directory is checked.
    pub fn for_invocation(explicit: Option<PathBuf>, cwd: &Path) -> Self {
        let explicit = explicit.or_else(|| std::env::var_os(SYSTEM_ROOT_ENV).map(PathBuf::from));

        let mut search_from = Vec::new();
        if let Some(exe_dir) = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
        {
            search_from.push(exe_dir);
        }
        search_from.push(cwd.to_path_buf());

        Self {
            explicit,
            search_from,
            fallback: dirs::data_dir().map(|d| d.join("docflow")),
        }
    }

    /// Pin the search to one directory
    pub fn fixed(root: impl Into<PathBuf>) -> Self {
        Self {
            explicit: Some(root.into()),
            ..Default::default()
        }
    }
}

/// Locate the system installation root
pub async fn find_system_root(
    storage: &dyn StorageAdapter,
    search: &SystemSearch,
) -> Result<PathBuf> {
    if let Some(explicit) = &search.explicit {
        if Marker::System.matches(storage, explicit).await {
            return Ok(explicit.clone());
        }
        return Err(EngineError::SystemNotFound(format!(
            "{} has no workflows/ directory or {}",
            explicit.display(),
            SYSTEM_DESCRIPTOR
        )));
    }

    for start in &search.search_from {
        if let Some(root) = find_upwards(storage, start, Marker::System).await {
            return Ok(root);
        }
    }

    if let Some(fallback) = &search.fallback {
        if Marker::System.matches(storage, fallback).await {
            return Ok(fallback.clone());
        }
    }

    Err(EngineError::SystemNotFound(format!(
        "searched upwards from {} location(s); set {}",
        search.search_from.len(),
        SYSTEM_ROOT_ENV
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FsStorage, MemoryStorage};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_project_root_found_from_nested_dir() {
        let temp = TempDir::new().unwrap();
        let project = temp.path().join("project");
        let nested = project.join("job/active/acme_dev_20250730");
        std::fs::create_dir_all(project.join(".docflow")).unwrap();
        std::fs::create_dir_all(&nested).unwrap();

        let storage = FsStorage::new();
        let found = find_project_root(&storage, &nested).await.unwrap();
        assert_eq!(found, project);

        // Inclusive: the marker's own parent is the root
        let found = find_project_root(&storage, &project).await.unwrap();
        assert_eq!(found, project);
    }

    #[tokio::test]
    async fn test_nearest_project_wins() {
        let storage = MemoryStorage::new();
        storage.insert_file("/outer/.docflow/config.toml", "");
        storage.insert_file("/outer/inner/.docflow/config.toml", "");
        storage
            .mkdir(Path::new("/outer/inner/deep"), true)
            .await
            .unwrap();

        let found = find_project_root(&storage, Path::new("/outer/inner/deep"))
            .await
            .unwrap();
        assert_eq!(found, PathBuf::from("/outer/inner"));
    }

    #[tokio::test]
    async fn test_marker_file_is_not_a_project() {
        let storage = MemoryStorage::new();
        storage.insert_file("/work/.docflow", "not a directory");
        assert!(matches!(
            find_project_root(&storage, Path::new("/work")).await,
            Err(EngineError::ProjectNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_system_root_requires_descriptor() {
        let storage = MemoryStorage::new();
        storage.insert_file("/opt/docflow/workflows/job/workflow.yml", "");
        let search = SystemSearch {
            search_from: vec![PathBuf::from("/opt/docflow/bin")],
            ..Default::default()
        };
        assert!(matches!(
            find_system_root(&storage, &search).await,
            Err(EngineError::SystemNotFound(_))
        ));

        storage.insert_file("/opt/docflow/docflow-package.toml", "");
        assert_eq!(
            find_system_root(&storage, &search).await.unwrap(),
            PathBuf::from("/opt/docflow")
        );
    }

    #[tokio::test]
    async fn test_explicit_system_root_is_not_searched_around() {
        let storage = MemoryStorage::new();
        storage.insert_file("/opt/docflow/workflows/job/workflow.yml", "");
        storage.insert_file("/opt/docflow/docflow-package.toml", "");

        let search = SystemSearch::fixed("/opt/docflow/workflows");
        assert!(find_system_root(&storage, &search).await.is_err());

        let search = SystemSearch::fixed("/opt/docflow");
        assert!(find_system_root(&storage, &search).await.is_ok());
    }

    #[tokio::test]
    async fn test_fallback_location() {
        let storage = MemoryStorage::new();
        storage.insert_file("/home/u/.local/share/docflow/workflows/x/workflow.yml", "");
        storage.insert_file("/home/u/.local/share/docflow/docflow-package.toml", "");
        let search = SystemSearch {
            explicit: None,
            search_from: vec![PathBuf::from("/tmp")],
            fallback: Some(PathBuf::from("/home/u/.local/share/docflow")),
        };
        assert_eq!(
            find_system_root(&storage, &search).await.unwrap(),
            PathBuf::from("/home/u/.local/share/docflow")
        );
    }
}
