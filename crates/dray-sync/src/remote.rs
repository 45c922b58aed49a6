//! The capability interface every remote offers, and its blob-store
//! implementation.

use std::collections::BTreeSet;
use std::path::{Component, Path};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dray_store::{
    open_store, BlobStore, CancelFlag, RemoteAddress, StoreError, StoreOptions, StoreResult,
};
use dray_types::{layout, ImageId, ImageMetadata, ImageRef, RepoTag};
use tracing::{debug, info, instrument, warn};

use crate::config::SyncConfig;
use crate::diff::{pull_diff, push_diff};
use crate::error::{SyncError, SyncResult};
use crate::executor::TransferExecutor;
use crate::keyset::{
    build_local_key_set, build_local_key_set_if_exists, build_remote_key_set,
    build_remote_key_set_for, local_path_for, KeyEntry,
};
use crate::types::{ImagePull, PushReport, TransferReport, WalkControl};
use crate::walker::ImageWalker;

/// Visitor called by [`Remote::walk_images`] for each record, child first.
pub type WalkVisitor<'a> = dyn FnMut(&ImageId, &ImageMetadata) -> WalkControl + Send + 'a;

/// Everything the sync engine needs from a remote.
///
/// Implementations must satisfy these invariants:
/// - Paths follow the shared layout (`repositories/{repo}/{tag}`,
///   `images/{id}/...`, `{key}.sum`) under any configured sub-path.
/// - A sidecar is written only after the content it describes.
/// - No operation retries internally; failures surface as [`SyncError`].
#[async_trait]
pub trait Remote: Send + Sync {
    /// Read the tag pointer for `image`, if one exists.
    async fn parse_tag(&self, image: &ImageRef) -> SyncResult<Option<ImageId>>;

    /// Expand an ID prefix to the one image ID it names.
    async fn image_full_id(&self, prefix: &str) -> SyncResult<ImageId>;

    /// Fetch and decode `images/{id}/json`.
    async fn image_metadata(&self, id: &ImageId) -> SyncResult<ImageMetadata>;

    /// Every `(repository, tag)` pair that has a pointer on the remote.
    async fn list_images(&self) -> SyncResult<Vec<RepoTag>>;

    /// Upload the tree at `local_root`, skipping files already current.
    async fn push(&self, image: &ImageRef, local_root: &Path) -> SyncResult<PushReport>;

    /// Download `images/{id}/` into `dst`, skipping files already present.
    async fn pull_image(&self, id: &ImageId, dst: &Path) -> SyncResult<ImagePull>;

    async fn validate(&self) -> SyncResult<()>;

    fn describe(&self) -> String;

    /// A tag pointer wins; otherwise the raw reference is an ID prefix.
    async fn resolve_image_name_to_id(&self, image: &ImageRef) -> SyncResult<ImageId> {
        if let Some(id) = self.parse_tag(image).await? {
            return Ok(id);
        }
        self.image_full_id(image.raw()).await
    }

    /// Visit `start` and its ancestors until the root or until `visit`
    /// stops the walk. Returns how many records were visited.
    async fn walk_images(&self, start: &ImageId, visit: &mut WalkVisitor<'_>) -> SyncResult<usize> {
        let mut walker = ImageWalker::new(self, start.clone());
        let mut visited = 0;
        while let Some((id, metadata)) = walker.next().await? {
            visited += 1;
            if visit(&id, &metadata) == WalkControl::Stop {
                break;
            }
        }
        Ok(visited)
    }
}

/// A [`Remote`] over any [`BlobStore`].
pub struct BlobRemote {
    store: Arc<dyn BlobStore>,
    config: SyncConfig,
}

impl BlobRemote {
    pub fn new(store: Arc<dyn BlobStore>, config: SyncConfig) -> Self {
        Self { store, config }
    }

    /// Wrap `store` once it has answered [`BlobStore::validate`], so bad
    /// credentials or a missing bucket fail before any transfer.
    pub async fn connect(store: Arc<dyn BlobStore>, config: SyncConfig) -> SyncResult<Self> {
        store.validate().await?;
        debug!(remote = %store.describe(), "remote reachable");
        Ok(Self::new(store, config))
    }

    fn executor(&self) -> TransferExecutor {
        TransferExecutor::new(self.config.parallelism)
    }

    async fn upload(&self, batch: Vec<KeyEntry>) -> SyncResult<TransferReport> {
        let store = Arc::clone(&self.store);
        self.executor()
            .run(batch, move |entry, cancel| {
                let store = Arc::clone(&store);
                async move { upload_entry(store.as_ref(), entry, &cancel).await }
            })
            .await
    }
}

fn missing_field(op: &'static str, key: &str, what: &str) -> StoreError {
    StoreError::Request {
        op,
        path: key.to_string(),
        reason: format!("entry has no {what}"),
    }
}

/// Content first, then its sidecar.
async fn upload_entry(store: &dyn BlobStore, entry: KeyEntry, cancel: &CancelFlag) -> StoreResult<u64> {
    let src = entry
        .local_path
        .as_deref()
        .ok_or_else(|| missing_field("upload", &entry.key, "local file"))?;
    let sum = entry
        .content_sum
        .ok_or_else(|| missing_field("upload", &entry.key, "checksum"))?;

    store.put_file(&entry.key, src, cancel).await?;
    store
        .put_bytes(&layout::sum_path(&entry.key), Bytes::from(sum.to_hex()))
        .await?;
    debug!(key = %entry.key, bytes = entry.size, "uploaded");
    Ok(entry.size)
}

async fn download_entry(store: &dyn BlobStore, entry: KeyEntry, cancel: &CancelFlag) -> StoreResult<u64> {
    cancel.check()?;
    let src = entry
        .remote_location
        .as_deref()
        .ok_or_else(|| missing_field("download", &entry.key, "remote object"))?;
    let dst = entry
        .local_path
        .as_deref()
        .ok_or_else(|| missing_field("download", &entry.key, "destination"))?;
    store.download(src, dst, cancel).await?;
    debug!(key = %entry.key, bytes = entry.size, "downloaded");
    Ok(entry.size)
}

#[async_trait]
impl Remote for BlobRemote {
    async fn parse_tag(&self, image: &ImageRef) -> SyncResult<Option<ImageId>> {
        let path = layout::tag_path(&image.repo_tag());
        // A `..` in a reference cannot name a tag pointer.
        if Path::new(&path)
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Ok(None);
        }
        let Some(content) = self.store.get(&path).await? else {
            return Ok(None);
        };
        ImageId::from_pointer(&content)
            .map(Some)
            .map_err(|e| SyncError::MetadataDecode {
                path,
                reason: e.to_string(),
            })
    }

    async fn image_full_id(&self, prefix: &str) -> SyncResult<ImageId> {
        if prefix.is_empty() || !prefix.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(SyncError::NoSuchImage(prefix.to_string()));
        }

        let objects = self
            .store
            .list(&format!("{}{prefix}", layout::images_prefix()))
            .await?;
        let ids: BTreeSet<ImageId> = objects
            .iter()
            .filter_map(|o| layout::image_id_of(&o.path))
            .filter_map(|id| ImageId::new(id).ok())
            .filter(|id| id.matches_prefix(prefix))
            .collect();

        let mut ids = ids.into_iter();
        match (ids.next(), ids.next()) {
            (None, _) => Err(SyncError::NoSuchImage(prefix.to_string())),
            (Some(id), None) => Ok(id),
            (Some(first), Some(second)) => Err(SyncError::AmbiguousReference {
                reference: prefix.to_string(),
                candidates: [first, second]
                    .into_iter()
                    .chain(ids)
                    .map(|id| id.to_string())
                    .collect(),
            }),
        }
    }

    async fn image_metadata(&self, id: &ImageId) -> SyncResult<ImageMetadata> {
        let path = layout::metadata_path(id);
        let content = self
            .store
            .get(&path)
            .await?
            .ok_or_else(|| SyncError::NoSuchImage(id.to_string()))?;
        ImageMetadata::from_json(&content).map_err(|e| SyncError::MetadataDecode {
            path,
            reason: e.to_string(),
        })
    }

    async fn list_images(&self) -> SyncResult<Vec<RepoTag>> {
        let prefix = layout::repositories_prefix();
        let objects = self.store.list(&prefix).await?;
        let tags: BTreeSet<RepoTag> = objects
            .iter()
            .filter(|o| layout::sum_base(&o.path).is_none())
            .filter_map(|o| RepoTag::from_path(&o.path, &prefix))
            .collect();
        Ok(tags.into_iter().collect())
    }

    #[instrument(skip(self), fields(remote = %self.store.describe()))]
    async fn push(&self, image: &ImageRef, local_root: &Path) -> SyncResult<PushReport> {
        let local = build_local_key_set(local_root).await?;
        if !local.contains(&layout::tag_path(&image.repo_tag())) {
            warn!(image = %image, "local tree has no tag pointer for this image");
        }
        let remote =
            build_remote_key_set_for(&self.store, local.keys(), self.config.parallelism).await?;

        let diff = push_diff(&local, &remote);
        let skipped = diff.skipped;
        info!(upload = diff.len(), skipped, bytes = diff.bytes(), "computed push set");

        // Tag pointers go last so they never name an image that is not there.
        let pointer_prefix = layout::repositories_prefix();
        let (content, pointers) = diff.partition(|e| !e.key.starts_with(&pointer_prefix));
        let mut total = TransferReport::default();
        for batch in [content, pointers] {
            total.absorb(&self.upload(batch).await?);
        }

        Ok(PushReport {
            uploaded: total.completed,
            skipped,
            bytes: total.bytes,
        })
    }

    #[instrument(skip(self), fields(remote = %self.store.describe()))]
    async fn pull_image(&self, id: &ImageId, dst: &Path) -> SyncResult<ImagePull> {
        let prefix = layout::image_prefix(id);
        let remote = build_remote_key_set(&self.store, &prefix, self.config.parallelism).await?;
        if !remote.iter().any(KeyEntry::has_content) {
            return Err(SyncError::NoSuchImage(id.to_string()));
        }
        let local = build_local_key_set_if_exists(dst).await?;

        let diff = pull_diff(&remote, &local);
        let skipped = diff.skipped;
        let mut jobs = Vec::with_capacity(diff.len());
        for mut entry in diff.entries {
            entry.local_path = Some(local_path_for(dst, &entry.key)?);
            jobs.push(entry);
        }
        info!(download = jobs.len(), skipped, "computed pull set");

        let store = Arc::clone(&self.store);
        let report = self
            .executor()
            .run(jobs, move |entry, cancel| {
                let store = Arc::clone(&store);
                async move { download_entry(store.as_ref(), entry, &cancel).await }
            })
            .await?;

        Ok(ImagePull {
            downloaded: report.completed,
            skipped,
            bytes: report.bytes,
        })
    }

    async fn validate(&self) -> SyncResult<()> {
        self.store.validate().await?;
        Ok(())
    }

    fn describe(&self) -> String {
        self.store.describe()
    }
}

/// Parse `address`, connect the backend it names, check that it answers, and
/// wrap it as a remote.
pub async fn open_remote(
    address: &str,
    options: &StoreOptions,
    config: SyncConfig,
) -> SyncResult<BlobRemote> {
    config.validate()?;
    let address = RemoteAddress::parse(address)?;
    let options = StoreOptions {
        block_size: config.block_size,
        ..options.clone()
    };
    let store = open_store(&address, &options).await?;
    BlobRemote::connect(store, config).await
}
