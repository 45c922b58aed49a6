//! Sync engine for dray.
//!
//! Moves container image layers between a local work directory and a remote
//! blob store. Every operation follows the same shape: snapshot both sides as
//! key sets, diff them by SHA-1 checksum, then hand the difference to a
//! bounded worker pool that stops at the first failure. Re-running an
//! operation after a failure transfers only what is still missing.
//!
//! Image references resolve through tag pointers or ID prefixes, and pulls
//! walk the parent chain of image metadata until they reach an image the
//! local side already has.

pub mod catalog;
pub mod config;
pub mod diff;
pub mod engine;
pub mod error;
pub mod executor;
pub mod keyset;
pub mod remote;
pub mod types;
pub mod walker;

pub use catalog::{DirectoryCatalog, ImageCatalog, NoLocalImages};
pub use config::{SyncConfig, DEFAULT_PARALLELISM};
pub use diff::{pull_diff, push_diff, TransferSet};
pub use engine::{update_repositories_index, RepositoriesIndex, SyncEngine};
pub use error::{SyncError, SyncResult};
pub use executor::TransferExecutor;
pub use keyset::{
    build_local_key_set, build_remote_key_set, build_remote_key_set_for, KeyEntry, KeySet,
};
pub use remote::{open_remote, BlobRemote, Remote, WalkVisitor};
pub use types::{ImagePull, PullReport, PushReport, TransferReport, WalkControl};
pub use walker::ImageWalker;
