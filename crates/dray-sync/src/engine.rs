//! Push and pull of whole images between a work directory and a remote.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use dray_types::{layout, ImageId, ImageRef, RepoTag};
use tracing::{info, instrument};

use crate::catalog::ImageCatalog;
use crate::error::{SyncError, SyncResult};
use crate::keyset::local_path_for;
use crate::remote::Remote;
use crate::types::{PullReport, PushReport, WalkControl};

/// The loader index written at `{work_dir}/repositories` after a pull:
/// repository, then tag, then image ID.
pub type RepositoriesIndex = BTreeMap<String, BTreeMap<String, String>>;

/// Orchestrates image-level operations against one remote.
pub struct SyncEngine {
    remote: Arc<dyn Remote>,
}

impl SyncEngine {
    pub fn new(remote: Arc<dyn Remote>) -> Self {
        Self { remote }
    }

    pub fn remote(&self) -> &dyn Remote {
        self.remote.as_ref()
    }

    /// Resolve a reference through its tag pointer, falling back to treating
    /// the raw reference as an ID prefix. The flag is true for a tag hit.
    pub async fn resolve(&self, image: &ImageRef) -> SyncResult<(ImageId, bool)> {
        match self.remote.parse_tag(image).await? {
            Some(id) => Ok((id, true)),
            None => Ok((self.remote.image_full_id(image.raw()).await?, false)),
        }
    }

    /// Fetch `image` and every ancestor the catalog lacks into
    /// `work_dir/images/{id}`.
    ///
    /// When the reference resolved through a tag, `work_dir/repositories`
    /// is updated so the runtime can load the result under that name.
    #[instrument(skip(self, catalog), fields(remote = %self.remote.describe()))]
    pub async fn pull(
        &self,
        image: &ImageRef,
        work_dir: &Path,
        catalog: &dyn ImageCatalog,
    ) -> SyncResult<PullReport> {
        let (id, tagged) = self.resolve(image).await?;
        info!(id = %id.short(), "resolved image");

        let mut missing: Vec<ImageId> = Vec::new();
        self.remote
            .walk_images(&id, &mut |image_id, _| {
                if catalog.has_image(image_id) {
                    WalkControl::Stop
                } else {
                    missing.push(image_id.clone());
                    WalkControl::Continue
                }
            })
            .await?;
        info!(images = missing.len(), "images to fetch");

        let mut report = PullReport {
            id: Some(id.clone()),
            ..PullReport::default()
        };
        for image_id in missing {
            let dst = work_dir.join(layout::IMAGES_DIR).join(image_id.as_str());
            let pulled = self.remote.pull_image(&image_id, &dst).await?;
            info!(
                id = %image_id.short(),
                downloaded = pulled.downloaded,
                skipped = pulled.skipped,
                "pulled image"
            );
            report.record(image_id, &pulled);
        }

        if tagged {
            update_repositories_index(work_dir, &image.repo_tag(), &id).await?;
        }
        Ok(report)
    }

    /// Upload the exported tree at `work_dir`.
    ///
    /// With `id`, the tag pointer `repositories/{repo}/{tag}` is written into
    /// the tree first so the push publishes the tag as well.
    #[instrument(skip(self), fields(remote = %self.remote.describe()))]
    pub async fn push(
        &self,
        image: &ImageRef,
        id: Option<&ImageId>,
        work_dir: &Path,
    ) -> SyncResult<PushReport> {
        if let Some(id) = id {
            write_tag_pointer(work_dir, &image.repo_tag(), id).await?;
        }
        let report = self.remote.push(image, work_dir).await?;
        info!(
            uploaded = report.uploaded,
            skipped = report.skipped,
            bytes = report.bytes,
            "push complete"
        );
        Ok(report)
    }
}

async fn write_tag_pointer(work_dir: &Path, repo_tag: &RepoTag, id: &ImageId) -> SyncResult<()> {
    let path = local_path_for(work_dir, &layout::tag_path(repo_tag))?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| SyncError::fs(parent, e))?;
    }
    tokio::fs::write(&path, id.as_str())
        .await
        .map_err(|e| SyncError::fs(&path, e))
}

/// Record `repo_tag -> id` in `work_dir/repositories`, keeping other entries.
///
/// An existing index that does not decode is left alone and reported as
/// [`SyncError::MetadataDecode`].
pub async fn update_repositories_index(
    work_dir: &Path,
    repo_tag: &RepoTag,
    id: &ImageId,
) -> SyncResult<()> {
    let path = work_dir.join(layout::REPOSITORIES_DIR);
    let mut index: RepositoriesIndex = match tokio::fs::read(&path).await {
        Ok(data) => serde_json::from_slice(&data).map_err(|e| SyncError::MetadataDecode {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => RepositoriesIndex::new(),
        Err(e) => return Err(SyncError::fs(&path, e)),
    };

    index
        .entry(repo_tag.repository.clone())
        .or_default()
        .insert(repo_tag.tag.clone(), id.to_string());

    let data = serde_json::to_vec(&index).map_err(|e| {
        SyncError::fs(&path, std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    })?;
    tokio::fs::create_dir_all(work_dir)
        .await
        .map_err(|e| SyncError::fs(work_dir, e))?;
    tokio::fs::write(&path, data)
        .await
        .map_err(|e| SyncError::fs(&path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{DirectoryCatalog, NoLocalImages};
    use crate::config::SyncConfig;
    use crate::remote::BlobRemote;
    use dray_store::{BlobStore, InMemoryBlobStore, LocalBlobStore};
    use std::collections::HashSet;

    fn id(s: &str) -> ImageId {
        ImageId::new(s).unwrap()
    }

    fn image(s: &str) -> ImageRef {
        ImageRef::parse(s).unwrap()
    }

    fn write(root: &Path, rel: &str, data: &[u8]) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, data).unwrap();
    }

    /// base <- mid <- top, each with its own layer.
    fn export_chain(root: &Path) {
        write(root, "images/base/json", br#"{"id":"base"}"#);
        write(root, "images/base/layer.tar", b"base layer");
        write(root, "images/mid/json", br#"{"id":"mid","parent":"base"}"#);
        write(root, "images/mid/layer.tar", b"mid layer");
        write(root, "images/top/json", br#"{"id":"top","parent":"mid"}"#);
        write(root, "images/top/layer.tar", b"top layer");
    }

    fn engine_over(store: Arc<dyn BlobStore>) -> SyncEngine {
        SyncEngine::new(Arc::new(BlobRemote::new(store, SyncConfig::default())))
    }

    #[tokio::test]
    async fn push_writes_tag_pointer_then_uploads() {
        let work = tempfile::tempdir().unwrap();
        export_chain(work.path());
        let mem = Arc::new(InMemoryBlobStore::new());
        let engine = engine_over(mem.clone());

        let report = engine
            .push(&image("app:v1"), Some(&id("top")), work.path())
            .await
            .unwrap();
        assert_eq!(report.uploaded, 7);
        assert_eq!(
            std::fs::read_to_string(work.path().join("repositories/app/v1")).unwrap(),
            "top"
        );
        assert_eq!(
            engine.remote().resolve_image_name_to_id(&image("app:v1")).await.unwrap(),
            id("top")
        );
        assert_eq!(
            engine.remote().list_images().await.unwrap(),
            vec![RepoTag::new("app", "v1")]
        );
    }

    #[tokio::test]
    async fn push_then_pull_round_trips_bytes() {
        let export = tempfile::tempdir().unwrap();
        export_chain(export.path());
        let remote_dir = tempfile::tempdir().unwrap();
        let engine = engine_over(Arc::new(LocalBlobStore::new(remote_dir.path())));
        engine
            .push(&image("app"), Some(&id("top")), export.path())
            .await
            .unwrap();

        let load = tempfile::tempdir().unwrap();
        let report = engine
            .pull(&image("app"), load.path(), &NoLocalImages)
            .await
            .unwrap();
        assert_eq!(report.id, Some(id("top")));
        assert_eq!(report.images, vec![id("top"), id("mid"), id("base")]);
        assert_eq!(report.downloaded, 6);

        for img in ["base", "mid", "top"] {
            for file in ["json", "layer.tar"] {
                let rel = format!("images/{img}/{file}");
                assert_eq!(
                    std::fs::read(load.path().join(&rel)).unwrap(),
                    std::fs::read(export.path().join(&rel)).unwrap(),
                    "{rel} differs"
                );
            }
        }

        let index: RepositoriesIndex =
            serde_json::from_slice(&std::fs::read(load.path().join("repositories")).unwrap())
                .unwrap();
        assert_eq!(index["app"]["latest"], "top");
    }

    #[tokio::test]
    async fn pull_stops_at_images_the_catalog_has() {
        let export = tempfile::tempdir().unwrap();
        export_chain(export.path());
        let engine = engine_over(Arc::new(InMemoryBlobStore::new()));
        engine
            .push(&image("app"), Some(&id("top")), export.path())
            .await
            .unwrap();

        let load = tempfile::tempdir().unwrap();
        let have: HashSet<ImageId> = [id("mid")].into_iter().collect();
        let report = engine.pull(&image("app"), load.path(), &have).await.unwrap();
        assert_eq!(report.images, vec![id("top")]);
        assert!(!load.path().join("images/base").exists());
    }

    #[tokio::test]
    async fn directory_catalog_makes_second_pull_cheap() {
        let export = tempfile::tempdir().unwrap();
        export_chain(export.path());
        let engine = engine_over(Arc::new(InMemoryBlobStore::new()));
        engine
            .push(&image("app"), Some(&id("top")), export.path())
            .await
            .unwrap();

        let load = tempfile::tempdir().unwrap();
        let catalog = DirectoryCatalog::new(load.path());
        engine.pull(&image("app"), load.path(), &catalog).await.unwrap();
        let again = engine.pull(&image("app"), load.path(), &catalog).await.unwrap();
        assert!(again.images.is_empty());
        assert_eq!(again.downloaded, 0);
    }

    #[tokio::test]
    async fn pull_by_id_prefix_skips_index() {
        let export = tempfile::tempdir().unwrap();
        export_chain(export.path());
        let engine = engine_over(Arc::new(InMemoryBlobStore::new()));
        engine.push(&image("app"), None, export.path()).await.unwrap();

        let load = tempfile::tempdir().unwrap();
        let report = engine
            .pull(&image("mi"), load.path(), &NoLocalImages)
            .await
            .unwrap();
        assert_eq!(report.images, vec![id("mid"), id("base")]);
        assert!(!load.path().join("repositories").exists());
    }

    #[tokio::test]
    async fn resolve_prefers_tags_over_prefixes() {
        let export = tempfile::tempdir().unwrap();
        export_chain(export.path());
        let engine = engine_over(Arc::new(InMemoryBlobStore::new()));
        engine
            .push(&image("base"), Some(&id("top")), export.path())
            .await
            .unwrap();

        assert_eq!(engine.resolve(&image("base")).await.unwrap(), (id("top"), true));
        assert_eq!(engine.resolve(&image("ba")).await.unwrap(), (id("base"), false));
    }

    #[tokio::test]
    async fn pull_of_unknown_reference_fails() {
        let engine = engine_over(Arc::new(InMemoryBlobStore::new()));
        let load = tempfile::tempdir().unwrap();
        let err = engine
            .pull(&image("rubyx"), load.path(), &NoLocalImages)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NoSuchImage(_)));
    }

    #[tokio::test]
    async fn index_keeps_existing_entries() {
        let dir = tempfile::tempdir().unwrap();
        update_repositories_index(dir.path(), &RepoTag::new("a", "1"), &id("x"))
            .await
            .unwrap();
        update_repositories_index(dir.path(), &RepoTag::new("a", "2"), &id("y"))
            .await
            .unwrap();
        update_repositories_index(dir.path(), &RepoTag::new("b", "1"), &id("z"))
            .await
            .unwrap();

        let index: RepositoriesIndex =
            serde_json::from_slice(&std::fs::read(dir.path().join("repositories")).unwrap())
                .unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index["a"].len(), 2);
        assert_eq!(index["b"]["1"], "z");
    }

    #[tokio::test]
    async fn unreadable_index_is_reported_not_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("repositories");
        std::fs::write(&path, b"{\"a\": {\"1\": ").unwrap();

        let err = update_repositories_index(dir.path(), &RepoTag::new("b", "1"), &id("z"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::MetadataDecode { .. }));
        assert_eq!(std::fs::read(&path).unwrap(), b"{\"a\": {\"1\": ");
    }
}
