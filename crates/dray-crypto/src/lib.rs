//! Content checksums for dray.
//!
//! Every file synchronised by dray is identified, for diffing purposes, by the
//! SHA-1 of its exact bytes. The hex form of that digest is what remotes store
//! in `.sum` sidecar objects, so it must stay bit-for-bit compatible with
//! other clients of the same layout.
//!
//! All hashing wraps the RustCrypto `sha1` implementation.

pub mod hasher;

pub use hasher::{Checksum, ContentHasher, HasherError};
