use thiserror::Error;

/// Errors produced by type operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid image id {0:?}: must be non-empty and alphanumeric")]
    InvalidImageId(String),

    #[error("invalid image reference {0:?}")]
    InvalidReference(String),

    #[error("invalid blob location {0:?}: container must not be empty")]
    InvalidBlobLocation(String),

    #[error("malformed image metadata: {0}")]
    Metadata(String),
}
