//! Blob Store
//!
//! Append-at-offset byte storage with local filesystem and in-memory
//! backends.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::StorageError;

// ============================================================================
// Blob Storage Trait
// ============================================================================

/// Trait for blob storage backends
#[async_trait::async_trait]
pub trait BlobStorage: Send + Sync {
    /// Write `data` at `offset`, discarding anything stored past `offset`
    /// first. Returns once the bytes are durable.
    async fn write_at(&self, id: &str, offset: u64, data: &[u8]) -> Result<(), StorageError>;

    /// Read exactly `len` bytes starting at `offset`
    async fn read_at(&self, id: &str, offset: u64, len: usize) -> Result<Vec<u8>, StorageError>;

    /// Physical size of the blob, `None` if it does not exist
    async fn size(&self, id: &str) -> Result<Option<u64>, StorageError>;

    /// Remove the blob; returns whether it existed
    async fn delete(&self, id: &str) -> Result<bool, StorageError>;
}

// ============================================================================
// Blob Store (Main Implementation)
// ============================================================================

/// Blob store with a pluggable backend
#[derive(Clone)]
pub struct BlobStore {
    inner: Arc<dyn BlobStorage>,
}

impl BlobStore {
    /// Create with local filesystem storage under `base_path/blobs`
    pub fn with_local_storage(base_path: impl Into<PathBuf>) -> Self {
        Self::with_backend(LocalBlobStorage::new(base_path.into().join("blobs")))
    }

    /// Create with in-memory storage
    pub fn in_memory() -> Self {
        Self::with_backend(MemoryBlobStorage::default())
    }

    pub fn with_backend(backend: impl BlobStorage + 'static) -> Self {
        Self {
            inner: Arc::new(backend),
        }
    }

    pub async fn write_at(&self, id: &str, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        validate_id(id)?;
        self.inner.write_at(id, offset, data).await?;

        tracing::trace!(blob = %id, offset = offset, bytes = data.len(), "Blob write");
        Ok(())
    }

    pub async fn read_at(&self, id: &str, offset: u64, len: usize) -> Result<Vec<u8>, StorageError> {
        validate_id(id)?;
        if len == 0 {
            return Ok(Vec::new());
        }
        self.inner.read_at(id, offset, len).await
    }

    pub async fn size(&self, id: &str) -> Result<Option<u64>, StorageError> {
        validate_id(id)?;
        self.inner.size(id).await
    }

    pub async fn delete(&self, id: &str) -> Result<bool, StorageError> {
        validate_id(id)?;
        let existed = self.inner.delete(id).await?;

        if existed {
            tracing::debug!(blob = %id, "Blob deleted");
        }
        Ok(existed)
    }
}

/// Blob ids become file names; only plain alphanumerics are accepted
fn validate_id(id: &str) -> Result<(), StorageError> {
    if id.is_empty() || id.len() > 64 || !id.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return Err(StorageError::InvalidId(id.to_string()));
    }
    Ok(())
}

// ============================================================================
// Local Filesystem Storage
// ============================================================================

/// One file per blob
pub struct LocalBlobStorage {
    base_path: PathBuf,
}

impl LocalBlobStorage {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn blob_path(&self, id: &str) -> PathBuf {
        self.base_path.join(format!("{}.bin", id))
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}

#[async_trait::async_trait]
impl BlobStorage for LocalBlobStorage {
    async fn write_at(&self, id: &str, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.base_path).await?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(self.blob_path(id))
            .await?;

        // Drop stray bytes from an interrupted write past the committed offset
        file.set_len(offset).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.sync_data().await?;

        Ok(())
    }

    async fn read_at(&self, id: &str, offset: u64, len: usize) -> Result<Vec<u8>, StorageError> {
        let mut file = match tokio::fs::File::open(self.blob_path(id)).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        file.seek(SeekFrom::Start(offset)).await?;

        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                StorageError::ShortRead {
                    id: id.to_string(),
                    offset,
                    wanted: len,
                }
            } else {
                StorageError::Io(e)
            }
        })?;

        Ok(buf)
    }

    async fn size(&self, id: &str) -> Result<Option<u64>, StorageError> {
        match tokio::fs::metadata(self.blob_path(id)).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, id: &str) -> Result<bool, StorageError> {
        match tokio::fs::remove_file(self.blob_path(id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

// ============================================================================
// In-Memory Storage
// ============================================================================

/// Ephemeral storage for tests and the memory state backend
#[derive(Default)]
pub struct MemoryBlobStorage {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

#[async_trait::async_trait]
impl BlobStorage for MemoryBlobStorage {
    async fn write_at(&self, id: &str, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        let mut blobs = self.blobs.lock();
        let blob = blobs.entry(id.to_string()).or_default();

        blob.resize(offset as usize, 0);
        blob.extend_from_slice(data);
        Ok(())
    }

    async fn read_at(&self, id: &str, offset: u64, len: usize) -> Result<Vec<u8>, StorageError> {
        let blobs = self.blobs.lock();
        let blob = blobs
            .get(id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;

        let start = offset as usize;
        blob.get(start..start + len)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| StorageError::ShortRead {
                id: id.to_string(),
                offset,
                wanted: len,
            })
    }

    async fn size(&self, id: &str) -> Result<Option<u64>, StorageError> {
        Ok(self.blobs.lock().get(id).map(|b| b.len() as u64))
    }

    async fn delete(&self, id: &str) -> Result<bool, StorageError> {
        Ok(self.blobs.lock().remove(id).is_some())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_local_write_read() {
        let temp_dir = TempDir::new().unwrap();
        let store = BlobStore::with_local_storage(temp_dir.path());

        store.write_at("abc123", 0, b"Hello, ").await.unwrap();
        store.write_at("abc123", 7, b"World!").await.unwrap();

        assert_eq!(store.size("abc123").await.unwrap(), Some(13));
        assert_eq!(store.read_at("abc123", 0, 13).await.unwrap(), b"Hello, World!");
        assert_eq!(store.read_at("abc123", 7, 5).await.unwrap(), b"World");

        assert!(store.delete("abc123").await.unwrap());
        assert!(!store.delete("abc123").await.unwrap());
        assert_eq!(store.size("abc123").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_write_truncates_stray_tail() {
        let temp_dir = TempDir::new().unwrap();
        let store = BlobStore::with_local_storage(temp_dir.path());

        // An interrupted append left 4 bytes past the committed offset of 3
        store.write_at("blob", 0, b"abcWXYZ").await.unwrap();
        store.write_at("blob", 3, b"de").await.unwrap();

        assert_eq!(store.size("blob").await.unwrap(), Some(5));
        assert_eq!(store.read_at("blob", 0, 5).await.unwrap(), b"abcde");
    }

    #[tokio::test]
    async fn test_short_read_and_missing() {
        let store = BlobStore::in_memory();
        store.write_at("m", 0, b"1234").await.unwrap();

        assert!(matches!(
            store.read_at("m", 2, 10).await,
            Err(StorageError::ShortRead { .. })
        ));
        assert!(matches!(
            store.read_at("missing", 0, 1).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_path_like_ids() {
        let store = BlobStore::in_memory();
        assert!(matches!(
            store.write_at("../etc", 0, b"x").await,
            Err(StorageError::InvalidId(_))
        ));
    }
}
