use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

use crate::blocks::{upload_in_blocks, BlockService, BlockToken, DEFAULT_BLOCK_SIZE};
use crate::cancel::CancelFlag;
use crate::error::{StoreError, StoreResult};
use crate::traits::{BlobStore, ObjectInfo};

/// In-memory blob store.
///
/// Intended for tests and embedding. Uploads go through the staged block
/// protocol exactly as they would against a block-blob backend, and a few
/// failure-injection hooks let tests exercise abort paths.
pub struct InMemoryBlobStore {
    objects: RwLock<BTreeMap<String, Bytes>>,
    staged: RwLock<HashMap<String, HashMap<BlockToken, Bytes>>>,
    commits: RwLock<HashMap<String, Vec<BlockToken>>>,
    failing_paths: RwLock<BTreeSet<String>>,
    block_size: u64,
    stage_calls: AtomicUsize,
    fail_stage_after: AtomicUsize,
}

impl InMemoryBlobStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            staged: RwLock::new(HashMap::new()),
            commits: RwLock::new(HashMap::new()),
            failing_paths: RwLock::new(BTreeSet::new()),
            block_size: DEFAULT_BLOCK_SIZE,
            stage_calls: AtomicUsize::new(0),
            fail_stage_after: AtomicUsize::new(usize::MAX),
        }
    }

    /// Use a smaller block size so tests can produce multi-block uploads.
    pub fn with_block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size;
        self
    }

    /// Number of objects currently visible.
    pub fn len(&self) -> usize {
        self.objects.read().expect("lock poisoned").len()
    }

    /// Returns `true` if no object is visible.
    pub fn is_empty(&self) -> bool {
        self.objects.read().expect("lock poisoned").is_empty()
    }

    /// Sorted list of all visible paths.
    pub fn paths(&self) -> Vec<String> {
        self.objects
            .read()
            .expect("lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Insert an object directly, bypassing the block protocol.
    pub fn insert(&self, path: impl Into<String>, data: impl Into<Bytes>) {
        self.objects
            .write()
            .expect("lock poisoned")
            .insert(path.into(), data.into());
    }

    /// Remove an object. Returns `true` if it existed.
    pub fn remove(&self, path: &str) -> bool {
        self.objects
            .write()
            .expect("lock poisoned")
            .remove(path)
            .is_some()
    }

    /// Make every write to `path` fail.
    pub fn fail_path(&self, path: impl Into<String>) {
        self.failing_paths
            .write()
            .expect("lock poisoned")
            .insert(path.into());
    }

    /// Let the first `n` stage calls succeed and fail every later one.
    pub fn fail_stage_after(&self, n: usize) {
        self.fail_stage_after.store(n, Ordering::SeqCst);
    }

    /// Tokens named by the last commit of `path`.
    pub fn committed_tokens(&self, path: &str) -> Vec<BlockToken> {
        self.commits
            .read()
            .expect("lock poisoned")
            .get(path)
            .cloned()
            .unwrap_or_default()
    }

    /// Uncommitted blocks currently staged for `path`.
    pub fn staged_count(&self, path: &str) -> usize {
        self.staged
            .read()
            .expect("lock poisoned")
            .get(path)
            .map_or(0, HashMap::len)
    }

    fn check_writable(&self, op: &'static str, path: &str) -> StoreResult<()> {
        if self.failing_paths.read().expect("lock poisoned").contains(path) {
            return Err(StoreError::request(op, path, "injected failure"));
        }
        Ok(())
    }
}

impl Default for InMemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn list(&self, prefix: &str) -> StoreResult<Vec<ObjectInfo>> {
        let map = self.objects.read().expect("lock poisoned");
        Ok(map
            .range(prefix.to_string()..)
            .take_while(|(path, _)| path.starts_with(prefix))
            .map(|(path, data)| ObjectInfo::new(path.clone(), data.len() as u64))
            .collect())
    }

    async fn get(&self, path: &str) -> StoreResult<Option<Bytes>> {
        let map = self.objects.read().expect("lock poisoned");
        Ok(map.get(path).cloned())
    }

    async fn put_bytes(&self, path: &str, data: Bytes) -> StoreResult<()> {
        self.check_writable("put", path)?;
        self.insert(path, data);
        Ok(())
    }

    async fn put_file(&self, path: &str, src: &Path, cancel: &CancelFlag) -> StoreResult<()> {
        self.check_writable("put", path)?;
        upload_in_blocks(self, path, src, self.block_size, cancel).await?;
        Ok(())
    }

    async fn validate(&self) -> StoreResult<()> {
        Ok(())
    }

    fn describe(&self) -> String {
        format!("in-memory store ({} objects)", self.len())
    }
}

#[async_trait]
impl BlockService for InMemoryBlobStore {
    async fn stage_block(&self, path: &str, token: &BlockToken, data: Bytes) -> StoreResult<()> {
        let call = self.stage_calls.fetch_add(1, Ordering::SeqCst);
        if call >= self.fail_stage_after.load(Ordering::SeqCst) {
            return Err(StoreError::request("stage block", path, "injected failure"));
        }
        self.staged
            .write()
            .expect("lock poisoned")
            .entry(path.to_string())
            .or_default()
            .insert(token.clone(), data);
        Ok(())
    }

    async fn commit_block_list(&self, path: &str, tokens: &[BlockToken]) -> StoreResult<()> {
        let mut staged = self.staged.write().expect("lock poisoned");
        let blocks = staged.remove(path).unwrap_or_default();
        let mut content = BytesMut::new();
        for token in tokens {
            let block = blocks.get(token).ok_or_else(|| {
                StoreError::request("commit block list", path, format!("unknown block {token}"))
            })?;
            content.extend_from_slice(block);
        }
        drop(staged);

        self.insert(path, content.freeze());
        self.commits
            .write()
            .expect("lock poisoned")
            .insert(path.to_string(), tokens.to_vec());
        Ok(())
    }

    async fn create_empty(&self, path: &str) -> StoreResult<()> {
        self.insert(path, Bytes::new());
        Ok(())
    }
}

impl std::fmt::Debug for InMemoryBlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBlobStore")
            .field("object_count", &self.len())
            .field("block_size", &self.block_size)
            .finish()
    }
}
