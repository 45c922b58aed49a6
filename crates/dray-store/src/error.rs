/// Errors from blob store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested object does not exist.
    #[error("object not found: {0}")]
    NotFound(String),

    /// Network, DNS, TLS, or credential failure talking to the backend.
    #[error("cannot reach {backend}: {reason}")]
    Connectivity { backend: String, reason: String },

    /// Listing a prefix failed.
    #[error("listing contents at prefix '{prefix}': {reason}")]
    List { prefix: String, reason: String },

    /// A single request was rejected or failed mid-flight.
    #[error("{op} {path}: {reason}")]
    Request {
        op: &'static str,
        path: String,
        reason: String,
    },

    /// The backend is misconfigured (missing credentials, bad key encoding).
    #[error("configuration error: {0}")]
    Config(String),

    /// A remote address string could not be understood.
    #[error("invalid remote address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },

    /// A transfer observed the cancellation flag and stopped between chunks.
    #[error("transfer cancelled")]
    Cancelled,

    /// I/O error on the local side of a transfer.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub(crate) fn request(op: &'static str, path: &str, reason: impl ToString) -> Self {
        Self::Request {
            op,
            path: path.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
