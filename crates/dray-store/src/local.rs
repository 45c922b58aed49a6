use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, instrument};
use walkdir::WalkDir;

use crate::cancel::CancelFlag;
use crate::error::{StoreError, StoreResult};
use crate::files;
use crate::traits::{BlobStore, ObjectInfo};

/// A remote that is just a directory tree.
///
/// Useful for NFS mounts, removable media, and tests. Writes land in a
/// sibling `.dray-partial` file first and are renamed into place, so readers
/// never observe half-written objects.
#[derive(Clone, Debug)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a store path onto the filesystem, refusing anything that could
    /// escape the root.
    fn resolve(&self, path: &str) -> StoreResult<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(StoreError::request("resolve", path, "path escapes store root"));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    #[instrument(skip(self), fields(root = %self.root.display()))]
    async fn list(&self, prefix: &str) -> StoreResult<Vec<ObjectInfo>> {
        let root = self.root.clone();
        let prefix = prefix.to_string();

        let listed = tokio::task::spawn_blocking(move || -> StoreResult<Vec<ObjectInfo>> {
            if !root.exists() {
                return Ok(Vec::new());
            }
            let mut objects = Vec::new();
            for entry in WalkDir::new(&root).follow_links(true) {
                let entry = entry.map_err(|e| StoreError::List {
                    prefix: prefix.clone(),
                    reason: e.to_string(),
                })?;
                if !entry.file_type().is_file() || files::is_temp_file(entry.path()) {
                    continue;
                }
                let Ok(relative) = entry.path().strip_prefix(&root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(&prefix) {
                    let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                    objects.push(ObjectInfo::new(key, size));
                }
            }
            objects.sort();
            Ok(objects)
        })
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))??;

        debug!(count = listed.len(), "listed local objects");
        Ok(listed)
    }

    async fn get(&self, path: &str) -> StoreResult<Option<Bytes>> {
        let full = self.resolve(path)?;
        // A directory is a key prefix here, not an object.
        if tokio::fs::metadata(&full).await.is_ok_and(|m| m.is_dir()) {
            return Ok(None);
        }
        match tokio::fs::read(full).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put_bytes(&self, path: &str, data: Bytes) -> StoreResult<()> {
        files::write_atomic(&self.resolve(path)?, &data).await
    }

    async fn put_file(&self, path: &str, src: &Path, cancel: &CancelFlag) -> StoreResult<()> {
        cancel.check()?;
        let dst = self.resolve(path)?;
        let mut reader = tokio::fs::File::open(src).await?;
        files::copy_atomic(&mut reader, &dst, cancel).await?;
        Ok(())
    }

    async fn download(&self, path: &str, dst: &Path, cancel: &CancelFlag) -> StoreResult<()> {
        let src = self.resolve(path)?;
        let mut reader = match tokio::fs::File::open(&src).await {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound(path.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        files::copy_atomic(&mut reader, dst, cancel).await?;
        Ok(())
    }

    /// A root that does not exist yet is fine as long as its parent does;
    /// the first push creates it.
    async fn validate(&self) -> StoreResult<()> {
        let unreachable = |reason: String| StoreError::Connectivity {
            backend: self.describe(),
            reason,
        };
        match tokio::fs::metadata(&self.root).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(unreachable("not a directory".into())),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                let parent = self.root.parent().filter(|p| !p.as_os_str().is_empty());
                let parent_is_dir = match parent {
                    Some(p) => tokio::fs::metadata(p).await.is_ok_and(|m| m.is_dir()),
                    None => true,
                };
                if parent_is_dir {
                    Ok(())
                } else {
                    Err(unreachable(e.to_string()))
                }
            }
            Err(e) => Err(unreachable(e.to_string())),
        }
    }

    fn describe(&self) -> String {
        format!("local directory({})", self.root.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_list_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path());
        store
            .put_bytes("repositories/ruby/latest", Bytes::from_static(b"123"))
            .await
            .unwrap();
        store
            .put_bytes("images/123/json", Bytes::from_static(b"{}"))
            .await
            .unwrap();

        let repos = store.list("repositories/").await.unwrap();
        assert_eq!(repos, vec![ObjectInfo::new("repositories/ruby/latest", 3)]);
        assert_eq!(store.list("").await.unwrap().len(), 2);
        assert_eq!(
            store.get("images/123/json").await.unwrap().unwrap().as_ref(),
            b"{}"
        );
        assert!(store.get("images/999/json").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn put_file_and_download() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        std::fs::write(&src, b"layer bytes").unwrap();
        let store = LocalBlobStore::new(dir.path().join("remote"));

        store
            .put_file("images/a/layer.tar", &src, &CancelFlag::new())
            .await
            .unwrap();
        let dst = dir.path().join("out/layer.tar");
        store
            .download("images/a/layer.tar", &dst, &CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(std::fs::read(dst).unwrap(), b"layer bytes");
    }

    #[tokio::test]
    async fn only_interrupted_writes_are_hidden_from_list() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("images/a")).unwrap();
        std::fs::write(dir.path().join("images/a/layer.tar.dray-partial"), b"x").unwrap();
        std::fs::write(dir.path().join("images/a/data.partial"), b"yz").unwrap();
        let store = LocalBlobStore::new(dir.path());
        assert_eq!(
            store.list("images/").await.unwrap(),
            vec![ObjectInfo::new("images/a/data.partial", 2)]
        );
    }

    #[tokio::test]
    async fn directory_is_not_an_object() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("repositories/ruby/latest")).unwrap();
        let store = LocalBlobStore::new(dir.path());
        assert!(store.get("repositories/ruby/latest").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancelled_download_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path().join("remote"));
        store
            .put_bytes("images/a/layer.tar", Bytes::from_static(b"layer"))
            .await
            .unwrap();
        let cancel = CancelFlag::new();
        cancel.cancel();
        let dst = dir.path().join("out/layer.tar");
        let err = store
            .download("images/a/layer.tar", &dst, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Cancelled));
        assert!(!dst.exists());
        assert!(!files::partial_path(&dst).exists());
    }

    #[tokio::test]
    async fn rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path());
        assert!(store.get("../etc/passwd").await.is_err());
    }

    #[tokio::test]
    async fn validate_requires_reachable_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(LocalBlobStore::new(dir.path()).validate().await.is_ok());
        // Created on first push.
        assert!(LocalBlobStore::new(dir.path().join("fresh"))
            .validate()
            .await
            .is_ok());

        let orphan = LocalBlobStore::new(dir.path().join("no/such/root"));
        assert!(matches!(
            orphan.validate().await,
            Err(StoreError::Connectivity { .. })
        ));

        std::fs::write(dir.path().join("file"), b"").unwrap();
        let not_dir = LocalBlobStore::new(dir.path().join("file"));
        assert!(matches!(
            not_dir.validate().await,
            Err(StoreError::Connectivity { .. })
        ));
    }

    #[tokio::test]
    async fn list_of_missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path().join("nothing"));
        assert!(store.list("").await.unwrap().is_empty());
    }
}
