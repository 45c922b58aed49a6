use std::path::PathBuf;

use dray_store::StoreError;
use dray_types::TypeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("cannot reach {backend}: {reason}")]
    BackendConnectivity { backend: String, reason: String },

    #[error("no such image: {0}")]
    NoSuchImage(String),

    #[error("reference {reference} is ambiguous, it matches {}", candidates.join(", "))]
    AmbiguousReference {
        reference: String,
        candidates: Vec<String>,
    },

    #[error("image graph revisits {id}; parent chain is cyclic")]
    CyclicImageGraph { id: String },

    #[error("{}: {source}", path.display())]
    FileSystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("listing remote prefix '{prefix}': {reason}")]
    BackendList { prefix: String, reason: String },

    #[error("malformed metadata at {path}: {reason}")]
    MetadataDecode { path: String, reason: String },

    #[error("transfer of {key} failed: {source}")]
    TransferFailed {
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("transfer worker stopped unexpectedly: {0}")]
    Worker(String),

    #[error("invalid input: {0}")]
    Type(#[from] TypeError),

    #[error("store error: {0}")]
    Store(StoreError),
}

impl SyncError {
    pub(crate) fn fs(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileSystem {
            path: path.into(),
            source,
        }
    }
}

/// Backend failures keep their place in the sync taxonomy.
impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Connectivity { backend, reason } => {
                Self::BackendConnectivity { backend, reason }
            }
            StoreError::List { prefix, reason } => Self::BackendList { prefix, reason },
            StoreError::Config(reason) => Self::Config(reason),
            StoreError::InvalidAddress { address, reason } => {
                Self::Config(format!("invalid remote address {address:?}: {reason}"))
            }
            other => Self::Store(other),
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_onto_taxonomy() {
        let err: SyncError = StoreError::List {
            prefix: "images/".into(),
            reason: "denied".into(),
        }
        .into();
        assert!(matches!(err, SyncError::BackendList { .. }));

        let err: SyncError = StoreError::Connectivity {
            backend: "S3(s3://b)".into(),
            reason: "dns".into(),
        }
        .into();
        assert!(matches!(err, SyncError::BackendConnectivity { .. }));

        let err: SyncError = StoreError::NotFound("k".into()).into();
        assert!(matches!(err, SyncError::Store(StoreError::NotFound(_))));
    }

    #[test]
    fn ambiguous_lists_candidates() {
        let err = SyncError::AmbiguousReference {
            reference: "ab".into(),
            candidates: vec!["abc".into(), "abd".into()],
        };
        assert_eq!(err.to_string(), "reference ab is ambiguous, it matches abc, abd");
    }
}
