//! Snapshots of a local directory or a remote prefix.
//!
//! A [`KeySet`] maps each `/`-separated key, relative to the snapshot root,
//! to what is known about it. Local checksums are computed exactly once while
//! the set is built; remote checksums come from `.sum` sidecars and are never
//! derived from the content itself. Sets are built before any transfer starts
//! and only read afterwards.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use dray_crypto::{Checksum, ContentHasher};
use dray_store::{is_temp_file, BlobStore, ObjectInfo, StoreError};
use dray_types::layout;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, instrument, warn};
use walkdir::WalkDir;

use crate::error::{SyncError, SyncResult};

/// One file in a snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyEntry {
    /// Path relative to the snapshot root, `/`-separated.
    pub key: String,
    /// SHA-1 of the content. Remote entries without a readable sidecar have
    /// none.
    pub content_sum: Option<Checksum>,
    pub size: u64,
    /// Where the file lives on disk (local snapshots only).
    pub local_path: Option<PathBuf>,
    /// Full store path of the content object (remote snapshots only).
    pub remote_location: Option<String>,
    /// Full store path of the `.sum` sidecar (remote snapshots only).
    pub sidecar_location: Option<String>,
}

impl KeyEntry {
    pub fn local(key: impl Into<String>, path: impl Into<PathBuf>, sum: Checksum, size: u64) -> Self {
        Self {
            key: key.into(),
            content_sum: Some(sum),
            size,
            local_path: Some(path.into()),
            remote_location: None,
            sidecar_location: None,
        }
    }

    pub fn remote(key: impl Into<String>, location: impl Into<String>, size: u64) -> Self {
        Self {
            key: key.into(),
            content_sum: None,
            size,
            local_path: None,
            remote_location: Some(location.into()),
            sidecar_location: None,
        }
    }

    fn sidecar_only(key: impl Into<String>, sidecar: String) -> Self {
        Self {
            key: key.into(),
            content_sum: None,
            size: 0,
            local_path: None,
            remote_location: None,
            sidecar_location: Some(sidecar),
        }
    }

    pub fn with_sum(mut self, sum: Checksum) -> Self {
        self.content_sum = Some(sum);
        self
    }

    /// Whether the content object itself exists (a sidecar may outlive it).
    pub fn has_content(&self) -> bool {
        self.local_path.is_some() || self.remote_location.is_some()
    }
}

/// Key to entry map for one snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeySet {
    entries: BTreeMap<String, KeyEntry>,
}

impl KeySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&KeyEntry> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = &KeyEntry> {
        self.entries.values()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Insert or replace the entry for `entry.key`.
    pub fn insert(&mut self, entry: KeyEntry) {
        self.entries.insert(entry.key.clone(), entry);
    }
}

impl FromIterator<KeyEntry> for KeySet {
    fn from_iter<I: IntoIterator<Item = KeyEntry>>(iter: I) -> Self {
        let mut set = Self::new();
        for entry in iter {
            set.insert(entry);
        }
        set
    }
}

impl IntoIterator for KeySet {
    type Item = KeyEntry;
    type IntoIter = std::collections::btree_map::IntoValues<String, KeyEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_values()
    }
}

/// Map a `/`-separated key under `root`, refusing keys that would escape it.
pub fn local_path_for(root: &Path, key: &str) -> SyncResult<PathBuf> {
    let relative = Path::new(key);
    if key.is_empty()
        || relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(SyncError::fs(
            root.join(key),
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "key escapes the work directory"),
        ));
    }
    Ok(root.join(relative))
}

/// Snapshot every regular file under `root`.
///
/// Directories are traversed but not recorded. Temp files left by an
/// interrupted download are ignored. The first read or stat failure aborts the
/// whole build.
#[instrument(skip_all, fields(root = %root.display()))]
pub async fn build_local_key_set(root: &Path) -> SyncResult<KeySet> {
    let root = root.to_path_buf();
    let set = tokio::task::spawn_blocking(move || -> SyncResult<KeySet> {
        let mut set = KeySet::new();
        for entry in WalkDir::new(&root).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(root.as_path()).to_path_buf();
                SyncError::fs(path, e.into())
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if is_temp_file(path) {
                continue;
            }
            let Ok(relative) = path.strip_prefix(&root) else {
                continue;
            };
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let size = entry
                .metadata()
                .map_err(|e| SyncError::fs(path, e.into()))?
                .len();
            let sum = ContentHasher::hash_file(path).map_err(|e| SyncError::fs(path, e))?;
            set.insert(KeyEntry::local(key, path, sum, size));
        }
        Ok(set)
    })
    .await
    .map_err(|e| SyncError::Worker(e.to_string()))??;

    debug!(files = set.len(), "built local key set");
    Ok(set)
}

/// Like [`build_local_key_set`], but a missing `root` is an empty snapshot.
pub async fn build_local_key_set_if_exists(root: &Path) -> SyncResult<KeySet> {
    match tokio::fs::metadata(root).await {
        Ok(_) => build_local_key_set(root).await,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(KeySet::new()),
        Err(e) => Err(SyncError::fs(root, e)),
    }
}

/// Snapshot every remote object under `prefix`.
///
/// Keys are relative to `prefix`. A `{key}.sum` object is folded into the
/// entry for `{key}` and its content becomes that entry's checksum; sidecars
/// are fetched with up to `parallelism` requests in flight.
#[instrument(skip(store), fields(remote = %store.describe()))]
pub async fn build_remote_key_set(
    store: &Arc<dyn BlobStore>,
    prefix: &str,
    parallelism: usize,
) -> SyncResult<KeySet> {
    let objects = store.list(prefix).await?;
    assemble_remote(store, prefix, objects, parallelism).await
}

/// Snapshot only the remote objects that could collide with `keys`.
///
/// Each key is widened to its image directory (`images/{id}/`) or, outside
/// `images/`, to its parent directory, and only those prefixes are listed.
/// Keys in the result are full store paths.
#[instrument(skip_all, fields(remote = %store.describe()))]
pub async fn build_remote_key_set_for<'a>(
    store: &Arc<dyn BlobStore>,
    keys: impl IntoIterator<Item = &'a str>,
    parallelism: usize,
) -> SyncResult<KeySet> {
    let mut scopes: Vec<&str> = Vec::new();
    for scope in keys.into_iter().map(listing_scope).collect::<BTreeSet<_>>() {
        // Sorted, so a scope covered by an earlier one directly follows it.
        if scopes.last().is_some_and(|kept| scope.starts_with(kept)) {
            continue;
        }
        scopes.push(scope);
    }

    let mut objects = BTreeMap::new();
    for scope in &scopes {
        for object in store.list(scope).await? {
            objects.insert(object.path.clone(), object);
        }
    }
    debug!(scopes = scopes.len(), objects = objects.len(), "listed remote scopes");
    assemble_remote(store, "", objects.into_values().collect(), parallelism).await
}

fn listing_scope(key: &str) -> &str {
    if let Some(id) = layout::image_id_of(key) {
        let dir_len = layout::IMAGES_DIR.len() + 1 + id.len() + 1;
        if key.len() > dir_len {
            return &key[..dir_len];
        }
    }
    match key.rfind('/') {
        Some(slash) => &key[..=slash],
        None => key,
    }
}

async fn assemble_remote(
    store: &Arc<dyn BlobStore>,
    prefix: &str,
    objects: Vec<ObjectInfo>,
    parallelism: usize,
) -> SyncResult<KeySet> {
    let mut entries: BTreeMap<String, KeyEntry> = BTreeMap::new();
    for object in objects {
        let Some(relative) = object.path.strip_prefix(prefix) else {
            continue;
        };
        if relative.is_empty() {
            continue;
        }
        match layout::sum_base(relative) {
            Some(base) => match entries.entry(base.to_string()) {
                Entry::Occupied(mut e) => e.get_mut().sidecar_location = Some(object.path.clone()),
                Entry::Vacant(e) => {
                    e.insert(KeyEntry::sidecar_only(base, object.path.clone()));
                }
            },
            None => match entries.entry(relative.to_string()) {
                Entry::Occupied(mut e) => {
                    let entry = e.get_mut();
                    entry.remote_location = Some(object.path.clone());
                    entry.size = object.size;
                }
                Entry::Vacant(e) => {
                    e.insert(KeyEntry::remote(relative, object.path.clone(), object.size));
                }
            },
        }
    }

    let limit = Arc::new(Semaphore::new(parallelism.max(1)));
    let mut fetches = JoinSet::new();
    for entry in entries.values() {
        let Some(sidecar) = entry.sidecar_location.clone() else {
            continue;
        };
        let key = entry.key.clone();
        let store = Arc::clone(store);
        let limit = Arc::clone(&limit);
        fetches.spawn(async move {
            let _permit = limit
                .acquire_owned()
                .await
                .map_err(|e| StoreError::Io(std::io::Error::other(e)))?;
            let content = store.get(&sidecar).await?;
            Ok::<_, StoreError>((key, sidecar, content))
        });
    }

    while let Some(joined) = fetches.join_next().await {
        let (key, sidecar, content) = joined.map_err(|e| SyncError::Worker(e.to_string()))??;
        let Some(content) = content else {
            continue;
        };
        match Checksum::from_sidecar(&content) {
            Ok(sum) => {
                if let Some(entry) = entries.get_mut(&key) {
                    entry.content_sum = Some(sum);
                }
            }
            Err(e) => warn!(sidecar = %sidecar, error = %e, "ignoring unreadable checksum sidecar"),
        }
    }

    let set = KeySet { entries };
    debug!(keys = set.len(), "built remote key set");
    Ok(set)
}
