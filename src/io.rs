//! I/O managers for different storage backends

use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Storage backend types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// Local file system
    FileSystem,
    /// Process-local memory
    Memory,
    /// AWS S3
    S3,
    /// Google Cloud Storage
    GCS,
}

impl StorageBackend {
    /// Parse storage backend from URL scheme
    pub fn from_url(url: &str) -> Result<Self> {
        if let Some(scheme_end) = url.find("://") {
            let scheme = &url[..scheme_end];
            match scheme {
                "file" => Ok(StorageBackend::FileSystem),
                "mem" => Ok(StorageBackend::Memory),
                "s3" => Ok(StorageBackend::S3),
                "gs" => Ok(StorageBackend::GCS),
                _ => Err(PipelineError::InvalidUrl(format!("Unknown scheme: {}", scheme))),
            }
        } else {
            // Assume file system if no scheme
            Ok(StorageBackend::FileSystem)
        }
    }
}

/// Byte-level object storage consumed by the chunk store and tasks
#[async_trait]
pub trait IOManager: Send + Sync {
    /// Read an object; `None` when it does not exist
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Write an object, replacing any previous content. A failed put must
    /// not leave a partially written object visible.
    async fn put(&self, key: &str, data: &[u8]) -> Result<()>;

    /// Check if an object exists
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Delete an object; deleting a missing object is not an error
    async fn delete(&self, key: &str) -> Result<()>;

    /// Keys directly under the directory part of `prefix` whose remaining
    /// name starts with the rest of `prefix`, sorted
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Flush buffered writes before a dependent read
    async fn wait(&self) -> Result<()> {
        Ok(())
    }

    /// Get the backend type
    fn backend(&self) -> StorageBackend;
}

/// Split `"a/b/c"` into `("a/b/", "c")`
fn split_prefix(prefix: &str) -> (&str, &str) {
    match prefix.rfind('/') {
        Some(idx) => (&prefix[..=idx], &prefix[idx + 1..]),
        None => ("", prefix),
    }
}

/// File system I/O manager
pub struct FileSystemIOManager {
    base_path: PathBuf,
}

impl FileSystemIOManager {
    /// Create a new file system I/O manager
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    /// Get the full path for a key
    fn full_path(&self, key: &str) -> PathBuf {
        self.base_path.join(key)
    }
}

#[async_trait]
impl IOManager for FileSystemIOManager {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        match fs::read(self.full_path(key)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PipelineError::Io(e)),
        }
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let full_path = self.full_path(key);

        // Create parent directories if they don't exist
        let parent = full_path
            .parent()
            .ok_or_else(|| PipelineError::InvalidUrl(format!("Invalid object key: {}", key)))?;
        fs::create_dir_all(parent).await?;

        let file_name = full_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| PipelineError::InvalidUrl(format!("Invalid object key: {}", key)))?;
        let tmp_path = parent.join(format!(".{}.tmp-{}", file_name, uuid::Uuid::new_v4()));

        let result = async {
            let mut file = fs::File::create(&tmp_path).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            fs::rename(&tmp_path, &full_path).await
        }
        .await;

        if let Err(e) = result {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(PipelineError::Io(e));
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(fs::try_exists(self.full_path(key)).await?)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.full_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PipelineError::Io(e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let (dir, name_prefix) = split_prefix(prefix);
        let full_path = self.full_path(dir);
        let mut entries = Vec::new();

        if fs::try_exists(&full_path).await? && full_path.is_dir() {
            let mut read_dir = fs::read_dir(&full_path).await?;

            while let Some(entry) = read_dir.next_entry().await? {
                if !entry.file_type().await?.is_file() {
                    continue;
                }
                if let Some(name) = entry.file_name().to_str() {
                    // Hidden names are in-flight temp files
                    if !name.starts_with('.') && name.starts_with(name_prefix) {
                        entries.push(format!("{}{}", dir, name));
                    }
                }
            }
        }

        entries.sort();
        Ok(entries)
    }

    fn backend(&self) -> StorageBackend {
        StorageBackend::FileSystem
    }
}

/// In-memory I/O manager; objects live as long as the manager
#[derive(Debug, Default)]
pub struct InMemoryIOManager {
    objects: RwLock<BTreeMap<String, Bytes>>,
}

impl InMemoryIOManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

#[async_trait]
impl IOManager for InMemoryIOManager {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.objects.read().get(key).cloned())
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        self.objects
            .write()
            .insert(key.to_string(), Bytes::copy_from_slice(data));
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.objects.read().contains_key(key))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.write().remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let (dir, _) = split_prefix(prefix);
        let objects = self.objects.read();
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .filter(|(key, _)| !key[dir.len()..].contains('/'))
            .map(|(key, _)| key.clone())
            .collect())
    }

    fn backend(&self) -> StorageBackend {
        StorageBackend::Memory
    }
}

/// Resolves layer URLs to storage handles.
///
/// Tasks carry only URLs; the executing worker supplies the provider.
pub trait StorageProvider: Send + Sync {
    fn open(&self, url: &str) -> Result<Arc<dyn IOManager>>;
}

/// Provider backed by the URL scheme (local filesystem only)
#[derive(Debug, Default, Clone)]
pub struct UrlStorageProvider;

impl StorageProvider for UrlStorageProvider {
    fn open(&self, url: &str) -> Result<Arc<dyn IOManager>> {
        Ok(Arc::from(create_io_manager(url)?))
    }
}

/// Provider handing out one shared in-memory backend per URL
#[derive(Default)]
pub struct MemoryStorageProvider {
    stores: Mutex<HashMap<String, Arc<InMemoryIOManager>>>,
}

impl MemoryStorageProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Concrete handle for a URL, created on first use
    pub fn memory(&self, url: &str) -> Arc<InMemoryIOManager> {
        let key = url.trim_end_matches('/').to_string();
        self.stores
            .lock()
            .entry(key)
            .or_insert_with(|| Arc::new(InMemoryIOManager::new()))
            .clone()
    }
}

impl StorageProvider for MemoryStorageProvider {
    fn open(&self, url: &str) -> Result<Arc<dyn IOManager>> {
        Ok(self.memory(url))
    }
}

/// Parse URL and create appropriate I/O manager
///
/// Only filesystem URLs are supported directly. For object stores,
/// implement the `IOManager` trait and a matching `StorageProvider`.
pub fn create_io_manager(url: &str) -> Result<Box<dyn IOManager>> {
    let backend = StorageBackend::from_url(url)?;

    match backend {
        StorageBackend::FileSystem => {
            // Extract path from file:// URL or use as-is
            let path = url.strip_prefix("file://").unwrap_or(url);
            Ok(Box::new(FileSystemIOManager::new(path)))
        }
        StorageBackend::Memory | StorageBackend::S3 | StorageBackend::GCS => {
            Err(PipelineError::Configuration(format!(
                "Backend {:?} for {} needs a dedicated StorageProvider",
                backend, url
            )))
        }
    }
}
