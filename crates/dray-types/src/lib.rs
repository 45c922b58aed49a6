//! Foundation types for dray.
//!
//! This crate provides the identifier, reference, and metadata types shared
//! by every other dray crate, together with the storage layout convention
//! that all remotes reproduce.
//!
//! # Key Types
//!
//! - [`ImageId`] -- opaque content identifier naming one image layer
//! - [`ImageRef`] -- human-given `repo[:tag]`, full ID, or ID prefix
//! - [`RepoTag`] -- a `(repository, tag)` pair found on a remote
//! - [`ImageMetadata`] -- the parent-linked `images/{id}/json` record
//! - [`BlobLocation`] -- backend container plus optional sub-path prefix

pub mod error;
pub mod image;
pub mod layout;
pub mod location;
pub mod metadata;

pub use error::TypeError;
pub use image::{ImageId, ImageRef, RepoTag, DEFAULT_TAG};
pub use location::BlobLocation;
pub use metadata::ImageMetadata;
