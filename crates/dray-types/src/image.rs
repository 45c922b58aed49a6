use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Tag assumed when a reference names only a repository.
pub const DEFAULT_TAG: &str = "latest";

/// Number of characters shown by [`ImageId::short`].
const SHORT_LEN: usize = 12;

/// Content identifier assigned by the container runtime to one image layer.
///
/// IDs are opaque: the only structure dray relies on is that they are
/// non-empty ASCII alphanumeric strings, so they can be used verbatim as a
/// path component under `images/`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageId(String);

impl ImageId {
    /// Validate and wrap an ID string.
    pub fn new(id: impl Into<String>) -> Result<Self, TypeError> {
        let id = id.into();
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(TypeError::InvalidImageId(id));
        }
        Ok(Self(id))
    }

    /// Parse the content of a tag pointer object.
    ///
    /// Pointer objects may carry a trailing newline or a NUL terminator
    /// written by older clients; both are stripped.
    pub fn from_pointer(content: &[u8]) -> Result<Self, TypeError> {
        let end = content.iter().position(|b| *b == 0).unwrap_or(content.len());
        let text = String::from_utf8_lossy(&content[..end]);
        Self::new(text.trim())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short display form (first 12 characters).
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(SHORT_LEN) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }

    /// Whether this ID begins with `prefix`.
    pub fn matches_prefix(&self, prefix: &str) -> bool {
        !prefix.is_empty() && self.0.starts_with(prefix)
    }
}

impl fmt::Debug for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ImageId({})", self.short())
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ImageId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ImageId {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ImageId> for String {
    fn from(id: ImageId) -> Self {
        id.0
    }
}

/// A human-given image reference.
///
/// The same string may name a tag (`ubuntu`, `ubuntu:14.04`,
/// `library/ubuntu:14.04`), a full ID, or an unambiguous ID prefix; which
/// one it is can only be decided against a remote. `ImageRef` keeps the raw
/// string alongside the repository/tag interpretation.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ImageRef {
    raw: String,
    repository: String,
    tag: String,
}

impl ImageRef {
    /// Parse `repo[:tag]`. The tag separator is the last `:` after the last
    /// `/`, so registry ports (`host:5000/app`) stay in the repository.
    pub fn parse(raw: &str) -> Result<Self, TypeError> {
        let raw = raw.trim();
        if raw.is_empty() || raw.chars().any(char::is_whitespace) {
            return Err(TypeError::InvalidReference(raw.to_string()));
        }

        let last_slash = raw.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (repository, tag) = match raw[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                (&raw[..split], &raw[split + 1..])
            }
            None => (raw, ""),
        };

        if repository.is_empty() || repository.ends_with('/') {
            return Err(TypeError::InvalidReference(raw.to_string()));
        }
        let tag = if tag.is_empty() { DEFAULT_TAG } else { tag };

        Ok(Self {
            raw: raw.to_string(),
            repository: repository.to_string(),
            tag: tag.to_string(),
        })
    }

    /// The reference exactly as given.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// The repository/tag interpretation of this reference.
    pub fn repo_tag(&self) -> RepoTag {
        RepoTag::new(self.repository.clone(), self.tag.clone())
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl std::str::FromStr for ImageRef {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// A `(repository, tag)` pair, as stored under `repositories/`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepoTag {
    pub repository: String,
    pub tag: String,
}

impl RepoTag {
    pub fn new(repository: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            tag: tag.into(),
        }
    }

    /// Split a pointer path such as `repositories/library/ubuntu/14.04`.
    ///
    /// `prefix` is stripped first; the last component is the tag and
    /// everything before it is the repository. Returns `None` for paths
    /// outside `prefix` or with no repository component.
    pub fn from_path(path: &str, prefix: &str) -> Option<Self> {
        let rest = path.strip_prefix(prefix)?.trim_matches('/');
        let (repository, tag) = rest.rsplit_once('/')?;
        if repository.is_empty() || tag.is_empty() {
            return None;
        }
        Some(Self::new(repository, tag))
    }
}

impl fmt::Display for RepoTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}
