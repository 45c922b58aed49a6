//! The remote storage layout.
//!
//! Every backend stores images in the same shape so that remotes written by
//! one client are readable by another:
//!
//! ```text
//! repositories/{repo}/{tag}   content is the image ID the tag points at
//! images/{id}/...             files of one image layer
//! images/{id}/json            the image metadata record
//! {key}.sum                   hex SHA-1 of the object at {key}
//! ```
//!
//! Paths here are relative; a configured sub-path prefix is applied by the
//! store, never by callers.

use crate::image::{ImageId, RepoTag};

pub const REPOSITORIES_DIR: &str = "repositories";
pub const IMAGES_DIR: &str = "images";
pub const METADATA_FILE: &str = "json";

/// Suffix of checksum sidecar objects.
pub const SUM_SUFFIX: &str = ".sum";

/// `repositories/{repo}/{tag}`
pub fn tag_path(repo_tag: &RepoTag) -> String {
    format!("{REPOSITORIES_DIR}/{}/{}", repo_tag.repository, repo_tag.tag)
}

/// `repositories/`
pub fn repositories_prefix() -> String {
    format!("{REPOSITORIES_DIR}/")
}

/// `images/`
pub fn images_prefix() -> String {
    format!("{IMAGES_DIR}/")
}

/// `images/{id}/`
pub fn image_prefix(id: &ImageId) -> String {
    format!("{IMAGES_DIR}/{id}/")
}

/// `images/{id}/json`
pub fn metadata_path(id: &ImageId) -> String {
    format!("{IMAGES_DIR}/{id}/{METADATA_FILE}")
}

/// `{key}.sum`
pub fn sum_path(key: &str) -> String {
    format!("{key}{SUM_SUFFIX}")
}

/// If `path` is a sidecar, the key it describes.
pub fn sum_base(path: &str) -> Option<&str> {
    path.strip_suffix(SUM_SUFFIX).filter(|base| !base.is_empty())
}

/// The image ID component of a path under `images/`, if any.
pub fn image_id_of(path: &str) -> Option<&str> {
    let rest = path.strip_prefix(IMAGES_DIR)?.strip_prefix('/')?;
    let id = rest.split('/').next()?;
    (!id.is_empty()).then_some(id)
}
