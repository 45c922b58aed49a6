use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// A backend container (bucket) plus an optional sub-path prefix.
///
/// All remote keys are namespaced under the prefix when it is present.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobLocation {
    pub container: String,
    pub path: Option<String>,
}

impl BlobLocation {
    pub fn new(container: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            path: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        let trimmed = path.trim_matches('/');
        self.path = (!trimmed.is_empty()).then(|| trimmed.to_string());
        self
    }

    /// Parse `container[/path]`.
    pub fn parse(raw: &str) -> Result<Self, TypeError> {
        let raw = raw.trim_start_matches('/');
        let (container, path) = match raw.split_once('/') {
            Some((container, path)) => (container, path),
            None => (raw, ""),
        };
        if container.is_empty() {
            return Err(TypeError::InvalidBlobLocation(raw.to_string()));
        }
        Ok(Self::new(container).with_path(path))
    }

    /// Prepend the sub-path to a relative key.
    pub fn key(&self, relative: &str) -> String {
        let relative = relative.trim_start_matches('/');
        match &self.path {
            Some(path) if relative.is_empty() => path.clone(),
            Some(path) => format!("{path}/{relative}"),
            None => relative.to_string(),
        }
    }

    /// Strip the sub-path from a full key. Keys outside it yield `None`.
    pub fn relative<'a>(&self, full: &'a str) -> Option<&'a str> {
        let full = full.trim_start_matches('/');
        match &self.path {
            Some(path) => full.strip_prefix(path.as_str())?.strip_prefix('/'),
            None => Some(full),
        }
    }
}

impl fmt::Display for BlobLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(path) => write!(f, "{}/{}", self.container, path),
            None => f.write_str(&self.container),
        }
    }
}
