//! Storage adapter
//!
//! Thin interface over primitive filesystem operations. It holds no policy and
//! exists purely as a substitution point between real storage ([`FsStorage`])
//! and the in-process map used for isolated tests ([`MemoryStorage`]).
//! No other component touches persistent state without going through it.
//!
//! `read`, `stat` and `list` on a missing path fail with
//! `EngineError::NotFound`. `write` creates missing parent directories.

use async_trait::async_trait;
use sdk::errors::{EngineError, Result};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

pub mod memory;

pub use memory::MemoryStorage;

/// Kind of a storage entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub is_file: bool,
    pub is_directory: bool,
}

/// One entry of a directory listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_directory: bool,
}

/// Primitive storage operations
#[async_trait]
pub trait StorageAdapter: Send + Sync + std::fmt::Debug {
    async fn exists(&self, path: &Path) -> bool;

    async fn read(&self, path: &Path) -> Result<Vec<u8>>;

    async fn read_to_string(&self, path: &Path) -> Result<String> {
        let bytes = self.read(path).await?;
        String::from_utf8(bytes)
            .map_err(|_| EngineError::Validation(format!("{} is not valid UTF-8", path.display())))
    }

    async fn write(&self, path: &Path, content: &[u8]) -> Result<()>;

    async fn mkdir(&self, path: &Path, recursive: bool) -> Result<()>;

    async fn stat(&self, path: &Path) -> Result<FileStat>;

    /// Entries of a directory, sorted by name
    async fn list(&self, path: &Path) -> Result<Vec<DirEntry>>;

    async fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    async fn copy(&self, src: &Path, dest: &Path) -> Result<()>;

    /// Remove a file or a whole directory tree
    async fn remove(&self, path: &Path) -> Result<()>;
}

/// Storage backed by the real filesystem
#[derive(Debug, Clone, Default)]
pub struct FsStorage;

impl FsStorage {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StorageAdapter for FsStorage {
    async fn exists(&self, path: &Path) -> bool {
        fs::try_exists(path).await.unwrap_or(false)
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        fs::read(path)
            .await
            .map_err(|e| EngineError::from_io(path, e))
    }

    async fn write(&self, path: &Path, content: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        debug!("Writing {} bytes to {}", content.len(), path.display());
        fs::write(path, content).await?;
        Ok(())
    }

    async fn mkdir(&self, path: &Path, recursive: bool) -> Result<()> {
        let result = if recursive {
            fs::create_dir_all(path).await
        } else {
            fs::create_dir(path).await
        };
        result.map_err(|e| EngineError::from_io(path, e))
    }

    async fn stat(&self, path: &Path) -> Result<FileStat> {
        let meta = fs::metadata(path)
            .await
            .map_err(|e| EngineError::from_io(path, e))?;
        Ok(FileStat {
            is_file: meta.is_file(),
            is_directory: meta.is_dir(),
        })
    }

    async fn list(&self, path: &Path) -> Result<Vec<DirEntry>> {
        let mut entries = fs::read_dir(path)
            .await
            .map_err(|e| EngineError::from_io(path, e))?;

        let mut listing = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            listing.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_directory: file_type.is_dir(),
            });
        }
        listing.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(listing)
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        debug!("Renaming {} -> {}", from.display(), to.display());
        if self.exists(to).await {
            return Err(EngineError::Validation(format!(
                "rename target {} already exists",
                to.display()
            )));
        }
        fs::rename(from, to)
            .await
            .map_err(|e| EngineError::from_io(from, e))
    }

    async fn copy(&self, src: &Path, dest: &Path) -> Result<()> {
        let stat = self.stat(src).await?;
        if stat.is_directory {
            copy_dir_recursive(src.to_path_buf(), dest.to_path_buf()).await
        } else {
            if let Some(parent) = dest.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent).await?;
                }
            }
            fs::copy(src, dest)
                .await
                .map_err(|e| EngineError::from_io(src, e))?;
            Ok(())
        }
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        let stat = self.stat(path).await?;
        let result = if stat.is_directory {
            fs::remove_dir_all(path).await
        } else {
            fs::remove_file(path).await
        };
        result.map_err(|e| EngineError::from_io(path, e))
    }
}

fn copy_dir_recursive(
    src: PathBuf,
    dest: PathBuf,
) -> futures::future::BoxFuture<'static, Result<()>> {
    Box::pin(async move {
        fs::create_dir_all(&dest).await?;
        let mut entries = fs::read_dir(&src)
            .await
            .map_err(|e| EngineError::from_io(&src, e))?;
        while let Some(entry) = entries.next_entry().await? {
            let target = dest.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                copy_dir_recursive(entry.path(), target).await?;
            } else {
                fs::copy(entry.path(), &target).await?;
            }
        }
        Ok(())
    })
}
