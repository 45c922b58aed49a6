use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;

use crate::cancel::CancelFlag;
use crate::error::StoreResult;
use crate::files;

/// One object found by [`BlobStore::list`].
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ObjectInfo {
    /// Path relative to the store's sub-path prefix, `/`-separated.
    pub path: String,
    /// Size in bytes as reported by the backend.
    pub size: u64,
}

impl ObjectInfo {
    pub fn new(path: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
        }
    }
}

/// A remote blob store addressed by `/`-separated paths.
///
/// All implementations must satisfy these invariants:
/// - Paths are relative to the configured sub-path prefix; the store applies
///   the prefix on every request and strips it from listings.
/// - An object becomes visible only once it has been written completely.
///   A failed or cancelled upload never leaves readable partial content.
/// - Stores hold no per-transfer state, so one instance can be shared by
///   many concurrent workers.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// List every object whose path starts with `prefix`.
    async fn list(&self, prefix: &str) -> StoreResult<Vec<ObjectInfo>>;

    /// Read a whole object. Returns `Ok(None)` if it does not exist.
    async fn get(&self, path: &str) -> StoreResult<Option<Bytes>>;

    /// Write a small object from memory.
    async fn put_bytes(&self, path: &str, data: Bytes) -> StoreResult<()>;

    /// Upload a local file, polling `cancel` between chunks.
    async fn put_file(&self, path: &str, src: &Path, cancel: &CancelFlag) -> StoreResult<()>;

    /// Download an object into `dst`, creating parent directories and
    /// polling `cancel` between chunks. `dst` is replaced only once the whole
    /// object has arrived.
    ///
    /// The default reads the object into memory; backends with streaming
    /// bodies override it.
    async fn download(&self, path: &str, dst: &Path, cancel: &CancelFlag) -> StoreResult<()> {
        cancel.check()?;
        let data = self
            .get(path)
            .await?
            .ok_or_else(|| crate::StoreError::NotFound(path.to_string()))?;
        cancel.check()?;
        files::write_atomic(dst, &data).await
    }

    /// Lightweight connectivity and credential check.
    async fn validate(&self) -> StoreResult<()>;

    /// Human-readable identity for logs.
    fn describe(&self) -> String;
}
