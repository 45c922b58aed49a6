//! Parent-chain traversal over remote image metadata.
//!
//! Images form a forest through the `parent` field of `images/{id}/json`.
//! [`ImageWalker`] follows that chain from a starting image toward its root,
//! one record per step.

use std::collections::HashSet;

use dray_types::{ImageId, ImageMetadata};
use tracing::debug;

use crate::error::{SyncError, SyncResult};
use crate::remote::Remote;

/// Lazy walk up an image's parent chain.
///
/// Each call to [`next`](Self::next) fetches one metadata record. The chain
/// comes from remote data and may loop, so every ID is remembered and a
/// repeat ends the walk with [`SyncError::CyclicImageGraph`]. A walker that
/// has returned `None` or an error stays exhausted.
pub struct ImageWalker<'a, R: ?Sized> {
    remote: &'a R,
    next: Option<ImageId>,
    visited: HashSet<ImageId>,
}

impl<'a, R: Remote + ?Sized> ImageWalker<'a, R> {
    pub fn new(remote: &'a R, start: ImageId) -> Self {
        Self {
            remote,
            next: Some(start),
            visited: HashSet::new(),
        }
    }

    /// The next `(id, metadata)` pair, child first, or `None` past the root.
    pub async fn next(&mut self) -> SyncResult<Option<(ImageId, ImageMetadata)>> {
        let Some(id) = self.next.take() else {
            return Ok(None);
        };
        if !self.visited.insert(id.clone()) {
            return Err(SyncError::CyclicImageGraph { id: id.to_string() });
        }
        let metadata = self.remote.image_metadata(&id).await?;
        debug!(id = %id.short(), parent = ?metadata.parent, "walked image");
        self.next = metadata.parent.clone();
        Ok(Some((id, metadata)))
    }

    /// Number of records returned so far.
    pub fn visited(&self) -> usize {
        self.visited.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::remote::BlobRemote;
    use crate::types::WalkControl;
    use dray_store::InMemoryBlobStore;
    use std::sync::Arc;

    fn id(s: &str) -> ImageId {
        ImageId::new(s).unwrap()
    }

    fn remote_with(chain: &[(&str, Option<&str>)]) -> BlobRemote {
        let mem = InMemoryBlobStore::new();
        for (image, parent) in chain {
            let body = match parent {
                Some(p) => format!(r#"{{"id":"{image}","parent":"{p}"}}"#),
                None => format!(r#"{{"id":"{image}","parent":""}}"#),
            };
            mem.insert(format!("images/{image}/json"), body);
        }
        BlobRemote::new(Arc::new(mem), SyncConfig::default())
    }

    #[tokio::test]
    async fn walks_child_to_root() {
        let remote = remote_with(&[("c", Some("b")), ("b", Some("a")), ("a", None)]);
        let mut walker = ImageWalker::new(&remote, id("c"));
        let mut seen = Vec::new();
        while let Some((image, _)) = walker.next().await.unwrap() {
            seen.push(image.to_string());
        }
        assert_eq!(seen, vec!["c", "b", "a"]);
        assert_eq!(walker.visited(), 3);
        assert!(walker.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn detects_cycles() {
        let remote = remote_with(&[("a", Some("b")), ("b", Some("a"))]);
        let mut walker = ImageWalker::new(&remote, id("a"));
        assert!(walker.next().await.unwrap().is_some());
        assert!(walker.next().await.unwrap().is_some());
        let err = walker.next().await.unwrap_err();
        assert!(matches!(err, SyncError::CyclicImageGraph { ref id } if id == "a"));
        assert!(walker.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn self_parent_is_a_cycle() {
        let remote = remote_with(&[("a", Some("a"))]);
        let err = remote
            .walk_images(&id("a"), &mut |_, _| WalkControl::Continue)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::CyclicImageGraph { .. }));
    }

    #[tokio::test]
    async fn missing_parent_is_no_such_image() {
        let remote = remote_with(&[("b", Some("a"))]);
        let err = remote
            .walk_images(&id("b"), &mut |_, _| WalkControl::Continue)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NoSuchImage(ref i) if i == "a"));
    }

    #[tokio::test]
    async fn visitor_can_stop_early() {
        let remote = remote_with(&[("c", Some("b")), ("b", Some("a")), ("a", None)]);
        let mut seen = Vec::new();
        let visited = remote
            .walk_images(&id("c"), &mut |image, _| {
                seen.push(image.to_string());
                if image.as_str() == "b" {
                    WalkControl::Stop
                } else {
                    WalkControl::Continue
                }
            })
            .await
            .unwrap();
        assert_eq!(visited, 2);
        assert_eq!(seen, vec!["c", "b"]);
    }
}
