//! Storage collaborator used to persist configuration and key aliases.
//!
//! The engine only needs single-key atomicity: `get`, `put`, `delete` and a
//! one-level `list` by prefix. [`InMemoryStorage`] backs tests and
//! [`FileStorage`] keeps one file per path on local disk.

use crate::{KmsError, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

/// Key-value storage handed to every operation.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; concurrent operations share one
/// storage handle.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Returns the value at `path`, or `None` if absent.
    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>>;

    /// Writes `value` at `path`, replacing any previous value.
    async fn put(&self, path: &str, value: &[u8]) -> Result<()>;

    /// Deletes `path`. Deleting an absent path is not an error.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Lists entry names directly below `prefix`, sorted.
    ///
    /// Names are relative to the prefix; nested entries appear once with a
    /// trailing `/`.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Reads and decodes a JSON entry.
///
/// An empty entry is corrupt, not absent.
pub async fn get_json<T: DeserializeOwned>(storage: &dyn Storage, path: &str) -> Result<Option<T>> {
    match storage.get(path).await? {
        Some(data) if data.is_empty() => Err(KmsError::Storage(format!(
            "empty record at {:?}",
            path
        ))),
        Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
        None => Ok(None),
    }
}

/// Encodes and writes a JSON entry.
pub async fn put_json<T: Serialize>(storage: &dyn Storage, path: &str, value: &T) -> Result<()> {
    let data = serde_json::to_vec(value)?;
    storage.put(path, &data).await
}

fn list_children<'a>(prefix: &str, paths: impl Iterator<Item = &'a String>) -> Vec<String> {
    let mut names: Vec<String> = paths
        .filter_map(|path| path.strip_prefix(prefix))
        .filter(|rest| !rest.is_empty())
        .map(|rest| match rest.find('/') {
            Some(idx) => rest[..=idx].to_string(),
            None => rest.to_string(),
        })
        .collect();
    names.sort();
    names.dedup();
    names
}

/// In-memory storage.
///
/// Cloning shares the underlying map.
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    entries: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl InMemoryStorage {
    /// Creates empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Returns true when nothing is stored.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().await.get(path).cloned())
    }

    async fn put(&self, path: &str, value: &[u8]) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(path.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.entries.write().await.remove(path);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let entries = self.entries.read().await;
        Ok(list_children(prefix, entries.keys()))
    }
}

/// Prefix of in-flight writes. Such files never show up in listings.
const TEMP_PREFIX: &str = ".tmp-";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// File-backed storage.
///
/// Each path maps to a file below the root directory. Files are created
/// with mode 0600 and directories with mode 0700 on Unix. Writes go to a
/// temporary file that is renamed over the target, so readers see either
/// the old or the new record.
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    /// Opens (creating if needed) storage rooted at `root`.
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        create_private_dir(&root).await?;
        Ok(Self { root })
    }

    fn file_path(&self, path: &str) -> Result<PathBuf> {
        if path.is_empty()
            || path.starts_with('/')
            || path.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..")
        {
            return Err(KmsError::Storage(format!("invalid storage path: {:?}", path)));
        }
        Ok(self.root.join(path))
    }

    async fn collect_paths(&self) -> Result<Vec<String>> {
        let mut paths = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(io_error(e)),
            };

            while let Some(entry) = entries.next_entry().await.map_err(io_error)? {
                let file_type = entry.file_type().await.map_err(io_error)?;
                if file_type.is_dir() {
                    pending.push(entry.path());
                } else if entry.file_name().to_string_lossy().starts_with(TEMP_PREFIX) {
                    continue;
                } else if let Ok(rel) = entry.path().strip_prefix(&self.root) {
                    let rel = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect::<Vec<_>>()
                        .join("/");
                    paths.push(rel);
                }
            }
        }

        Ok(paths)
    }
}

fn io_error(e: std::io::Error) -> KmsError {
    KmsError::Storage(e.to_string())
}

async fn create_private_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).await.map_err(io_error)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(dir).await.map_err(io_error)?.permissions();
        perms.set_mode(0o700);
        fs::set_permissions(dir, perms).await.map_err(io_error)?;
    }

    Ok(())
}

fn temp_path_for(target: &Path) -> Result<PathBuf> {
    let name = target
        .file_name()
        .ok_or_else(|| KmsError::Storage(format!("invalid storage path: {:?}", target)))?;
    let seq = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    Ok(target.with_file_name(format!(
        "{}{}-{}-{}",
        TEMP_PREFIX,
        name.to_string_lossy(),
        std::process::id(),
        seq
    )))
}

async fn write_new_private(path: &Path, value: &[u8]) -> Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await.map_err(io_error)?;
    file.write_all(value).await.map_err(io_error)?;
    file.sync_all().await.map_err(io_error)?;
    Ok(())
}

#[async_trait]
impl Storage for FileStorage {
    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let file = self.file_path(path)?;
        match fs::read(&file).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(e)),
        }
    }

    async fn put(&self, path: &str, value: &[u8]) -> Result<()> {
        let file_path = self.file_path(path)?;
        if let Some(parent) = file_path.parent() {
            create_private_dir(parent).await?;
        }

        let temp_path = temp_path_for(&file_path)?;
        if let Err(e) = write_new_private(&temp_path, value).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e);
        }

        if let Err(e) = fs::rename(&temp_path, &file_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_error(e));
        }
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let file = self.file_path(path)?;
        match fs::remove_file(&file).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let paths = self.collect_paths().await?;
        Ok(list_children(prefix, paths.iter()))
    }
}
