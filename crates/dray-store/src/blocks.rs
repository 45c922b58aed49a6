//! Staged block uploads.
//!
//! Backends such as Azure block blobs cap the size of a single write, so a
//! large object is uploaded as a sequence of uncommitted blocks followed by
//! one commit naming every block in order. Nothing is readable until the
//! commit succeeds, which makes an aborted upload invisible.
//!
//! The backend orders block IDs by their encoded token, so every ID used for
//! one object must have the same number of decimal digits. [`BlockPlan`]
//! picks a starting ID of the form `10..0` that is wide enough for the whole
//! object:
//!
//! ```text
//! size = 9_000_000, block = 4_000_000
//! num_blocks = 9_000_000 / 4_000_000 + 1 = 3
//! first_id   = 10              (digits(3 * 10) = 2)
//! ids        = 10, 11, 12
//! ```

use std::fmt;
use std::ops::Range;
use std::path::Path;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use tracing::debug;

use crate::cancel::CancelFlag;
use crate::error::{StoreError, StoreResult};
use crate::files::read_chunk;

/// Largest block accepted by block-blob backends.
pub const DEFAULT_BLOCK_SIZE: u64 = 4_000_000;

/// Numbering for one object's blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockPlan {
    /// Upper bound on blocks needed: `size / block_size + 1`.
    pub num_blocks: u64,
    /// First block ID; every ID in `ids()` has the same width.
    pub first_id: u64,
}

impl BlockPlan {
    pub fn for_size(size: u64, block_size: u64) -> Self {
        let num_blocks = size / block_size.max(1) + 1;
        let width = decimal_width(num_blocks * 10);
        Self {
            num_blocks,
            first_id: 10u64.pow(width - 1),
        }
    }

    /// The ID range reserved for this object.
    pub fn ids(&self) -> Range<u64> {
        self.first_id..self.first_id + self.num_blocks
    }
}

fn decimal_width(n: u64) -> u32 {
    n.checked_ilog10().unwrap_or(0) + 1
}

/// Backend-opaque block identifier: base64 of the decimal block ID.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockToken(String);

impl BlockToken {
    pub fn for_id(id: u64) -> Self {
        Self(STANDARD.encode(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for BlockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockToken({})", self.0)
    }
}

impl fmt::Display for BlockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The two-phase stage/commit API of a block-blob backend.
#[async_trait]
pub trait BlockService: Send + Sync {
    /// Stage one uncommitted block for `path`.
    async fn stage_block(&self, path: &str, token: &BlockToken, data: Bytes) -> StoreResult<()>;

    /// Make `path` readable as the concatenation of `tokens`, in order.
    async fn commit_block_list(&self, path: &str, tokens: &[BlockToken]) -> StoreResult<()>;

    /// Create `path` as an empty object without staging anything.
    async fn create_empty(&self, path: &str) -> StoreResult<()>;
}

/// What [`upload_in_blocks`] did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockUpload {
    pub blocks: usize,
    pub bytes: u64,
}

/// Upload `src` to `path` as staged blocks followed by one commit.
///
/// Blocks are staged strictly in file order by the calling task. If any
/// stage fails, or `cancel` is raised between blocks, the function returns
/// without committing, so no partial object becomes visible. Empty files
/// skip the block protocol and are created directly.
pub async fn upload_in_blocks(
    service: &dyn BlockService,
    path: &str,
    src: &Path,
    block_size: u64,
    cancel: &CancelFlag,
) -> StoreResult<BlockUpload> {
    let mut file = tokio::fs::File::open(src).await?;
    let size = file.metadata().await?.len();

    if size == 0 {
        cancel.check()?;
        service.create_empty(path).await?;
        return Ok(BlockUpload::default());
    }

    let plan = BlockPlan::for_size(size, block_size);
    let mut ids = plan.ids();
    let mut tokens = Vec::with_capacity(plan.num_blocks as usize);
    let mut buf = vec![0u8; block_size as usize];
    let mut total = 0u64;

    loop {
        cancel.check()?;
        let n = read_chunk(&mut file, &mut buf).await?;
        if n == 0 {
            break;
        }
        let id = ids.next().ok_or_else(|| {
            StoreError::request("stage block", path, "file grew while it was being uploaded")
        })?;
        let token = BlockToken::for_id(id);
        service
            .stage_block(path, &token, Bytes::copy_from_slice(&buf[..n]))
            .await?;
        debug!(path, block = id, bytes = n, "staged block");
        tokens.push(token);
        total += n as u64;
    }

    if tokens.is_empty() {
        service.create_empty(path).await?;
        return Ok(BlockUpload::default());
    }

    service.commit_block_list(path, &tokens).await?;
    Ok(BlockUpload {
        blocks: tokens.len(),
        bytes: total,
    })
}
