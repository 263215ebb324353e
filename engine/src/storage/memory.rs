//! In-memory storage backend
//!
//! Virtual paths map to file contents or directory markers. The filesystem
//! root and any parentless path are always treated as existing directories.

use async_trait::async_trait;
use sdk::errors::{EngineError, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{DirEntry, FileStat, StorageAdapter};

#[derive(Debug, Clone)]
enum MemoryEntry {
    File(Vec<u8>),
    Dir,
}

/// Storage held entirely in process memory
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<BTreeMap<PathBuf, MemoryEntry>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a file, creating its ancestors
    pub fn insert_file(&self, path: impl AsRef<Path>, content: impl Into<Vec<u8>>) {
        let mut entries = self.lock();
        let path = path.as_ref();
        create_ancestors(&mut entries, path);
        entries.insert(path.to_path_buf(), MemoryEntry::File(content.into()));
    }

    /// Number of stored files, for assertions in tests
    pub fn file_count(&self) -> usize {
        self.lock()
            .values()
            .filter(|e| matches!(e, MemoryEntry::File(_)))
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<PathBuf, MemoryEntry>> {
        // A panic while holding the lock cannot leave the map half-updated
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn is_implicit_dir(path: &Path) -> bool {
    path.parent().is_none() || path.as_os_str().is_empty()
}

fn is_dir(entries: &BTreeMap<PathBuf, MemoryEntry>, path: &Path) -> bool {
    is_implicit_dir(path) || matches!(entries.get(path), Some(MemoryEntry::Dir))
}

fn create_ancestors(entries: &mut BTreeMap<PathBuf, MemoryEntry>, path: &Path) {
    let mut current = path.parent();
    while let Some(dir) = current {
        if is_implicit_dir(dir) {
            break;
        }
        entries.entry(dir.to_path_buf()).or_insert(MemoryEntry::Dir);
        current = dir.parent();
    }
}

fn subtree(entries: &BTreeMap<PathBuf, MemoryEntry>, root: &Path) -> Vec<PathBuf> {
    entries
        .keys()
        .filter(|p| p.starts_with(root))
        .cloned()
        .collect()
}

#[async_trait]
impl StorageAdapter for MemoryStorage {
    async fn exists(&self, path: &Path) -> bool {
        is_implicit_dir(path) || self.lock().contains_key(path)
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        match self.lock().get(path) {
            Some(MemoryEntry::File(bytes)) => Ok(bytes.clone()),
            Some(MemoryEntry::Dir) => Err(EngineError::Validation(format!(
                "{} is a directory",
                path.display()
            ))),
            None => Err(EngineError::NotFound(path.to_path_buf())),
        }
    }

    async fn write(&self, path: &Path, content: &[u8]) -> Result<()> {
        let mut entries = self.lock();
        if is_dir(&entries, path) {
            return Err(EngineError::Validation(format!(
                "{} is a directory",
                path.display()
            )));
        }
        create_ancestors(&mut entries, path);
        entries.insert(path.to_path_buf(), MemoryEntry::File(content.to_vec()));
        Ok(())
    }

    async fn mkdir(&self, path: &Path, recursive: bool) -> Result<()> {
        let mut entries = self.lock();
        if let Some(MemoryEntry::File(_)) = entries.get(path) {
            return Err(EngineError::Validation(format!(
                "{} is a file",
                path.display()
            )));
        }
        if recursive {
            create_ancestors(&mut entries, path);
        } else if let Some(parent) = path.parent() {
            if !is_dir(&entries, parent) {
                return Err(EngineError::NotFound(parent.to_path_buf()));
            }
        }
        if !is_implicit_dir(path) {
            entries.insert(path.to_path_buf(), MemoryEntry::Dir);
        }
        Ok(())
    }

    async fn stat(&self, path: &Path) -> Result<FileStat> {
        let entries = self.lock();
        if is_dir(&entries, path) {
            return Ok(FileStat {
                is_file: false,
                is_directory: true,
            });
        }
        match entries.get(path) {
            Some(MemoryEntry::File(_)) => Ok(FileStat {
                is_file: true,
                is_directory: false,
            }),
            _ => Err(EngineError::NotFound(path.to_path_buf())),
        }
    }

    async fn list(&self, path: &Path) -> Result<Vec<DirEntry>> {
        let entries = self.lock();
        if !is_dir(&entries, path) {
            return Err(EngineError::NotFound(path.to_path_buf()));
        }
        // BTreeMap iteration keeps the listing sorted
        Ok(entries
            .iter()
            .filter(|(p, _)| p.parent() == Some(path))
            .filter_map(|(p, entry)| {
                p.file_name().map(|name| DirEntry {
                    name: name.to_string_lossy().into_owned(),
                    is_directory: matches!(entry, MemoryEntry::Dir),
                })
            })
            .collect())
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let mut entries = self.lock();
        if !entries.contains_key(from) {
            return Err(EngineError::NotFound(from.to_path_buf()));
        }
        if let Some(parent) = to.parent() {
            if !is_dir(&entries, parent) {
                return Err(EngineError::NotFound(parent.to_path_buf()));
            }
        }
        if entries.contains_key(to) {
            return Err(EngineError::Validation(format!(
                "{} already exists",
                to.display()
            )));
        }
        for old in subtree(&entries, from) {
            if let Some(entry) = entries.remove(&old) {
                let suffix = old.strip_prefix(from).unwrap_or(Path::new(""));
                let new = if suffix.as_os_str().is_empty() {
                    to.to_path_buf()
                } else {
                    to.join(suffix)
                };
                entries.insert(new, entry);
            }
        }
        Ok(())
    }

    async fn copy(&self, src: &Path, dest: &Path) -> Result<()> {
        let mut entries = self.lock();
        if !entries.contains_key(src) {
            return Err(EngineError::NotFound(src.to_path_buf()));
        }
        create_ancestors(&mut entries, dest);
        for old in subtree(&entries, src) {
            if let Some(entry) = entries.get(&old).cloned() {
                let suffix = old.strip_prefix(src).unwrap_or(Path::new(""));
                let new = if suffix.as_os_str().is_empty() {
                    dest.to_path_buf()
                } else {
                    dest.join(suffix)
                };
                entries.insert(new, entry);
            }
        }
        Ok(())
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        let mut entries = self.lock();
        if !entries.contains_key(path) {
            return Err(EngineError::NotFound(path.to_path_buf()));
        }
        for old in subtree(&entries, path) {
            entries.remove(&old);
        }
        Ok(())
    }
}
