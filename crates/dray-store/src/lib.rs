//! Blob storage backends for dray.
//!
//! A remote is a flat namespace of `/`-separated object paths inside one
//! container or bucket, optionally under a sub-path prefix. This crate hides
//! the transfer protocol of each backend behind the [`BlobStore`] trait.
//!
//! # Backends
//!
//! - [`InMemoryBlobStore`] -- map-backed store for tests and embedding
//! - [`LocalBlobStore`] -- a directory tree (NFS mounts, removable media)
//! - [`S3BlobStore`] -- Amazon S3 and compatible services, multipart uploads
//! - [`AzureBlobStore`] -- Azure block blobs, staged through [`blocks`]
//!
//! # Rules
//!
//! 1. An object is visible only after it has been completely written.
//! 2. Stores are stateless per transfer and safe to share across workers.
//! 3. Cancellation is cooperative and observed between chunks.
//! 4. No store retries; every failure is returned to the caller.

pub mod address;
pub mod azure;
pub mod blocks;
pub mod cancel;
pub mod error;
mod files;
pub mod local;
pub mod memory;
pub mod s3;
pub mod traits;

pub use address::{open_store, RemoteAddress, StoreOptions};
pub use azure::{AzureBlobStore, AzureCredentials};
pub use blocks::{upload_in_blocks, BlockPlan, BlockService, BlockToken, BlockUpload, DEFAULT_BLOCK_SIZE};
pub use cancel::CancelFlag;
pub use error::{StoreError, StoreResult};
pub use files::{is_temp_file, TEMP_SUFFIX};
pub use local::LocalBlobStore;
pub use memory::InMemoryBlobStore;
pub use s3::{S3BlobStore, S3Options};
pub use traits::{BlobStore, ObjectInfo};
