//! Local file helpers shared by the backends.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use crate::cancel::CancelFlag;
use crate::error::StoreResult;

/// Suffix of the sibling temp file a write goes through before it is renamed
/// into place. Nothing else in a tree may use it.
pub const TEMP_SUFFIX: &str = ".dray-partial";

const COPY_CHUNK: usize = 64 * 1024;

/// Whether `path` is a temp file left behind by an interrupted write.
pub fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.len() > TEMP_SUFFIX.len() && n.ends_with(TEMP_SUFFIX))
}

/// Sibling temp path used while a write is in progress.
pub(crate) fn partial_path(dst: &Path) -> PathBuf {
    let mut name = dst
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(TEMP_SUFFIX);
    dst.with_file_name(name)
}

/// A file being written under its temp name. Dropping it without
/// [`commit`](Self::commit) leaves `dst` untouched.
pub(crate) struct PartialFile {
    tmp: PathBuf,
    dst: PathBuf,
    file: fs::File,
}

impl PartialFile {
    pub(crate) async fn create(dst: &Path) -> StoreResult<Self> {
        ensure_parent(dst).await?;
        let tmp = partial_path(dst);
        let file = fs::File::create(&tmp).await?;
        Ok(Self {
            tmp,
            dst: dst.to_path_buf(),
            file,
        })
    }

    pub(crate) async fn write(&mut self, data: &[u8]) -> StoreResult<()> {
        self.file.write_all(data).await?;
        Ok(())
    }

    /// Flush and rename into place.
    pub(crate) async fn commit(mut self) -> StoreResult<()> {
        self.file.flush().await?;
        fs::rename(&self.tmp, &self.dst).await?;
        Ok(())
    }

    /// Remove the temp file.
    pub(crate) async fn discard(self) {
        let Self { tmp, file, .. } = self;
        drop(file);
        let _ = fs::remove_file(&tmp).await;
    }
}

/// Write `data` to `dst` via a temp file and rename, so readers never see a
/// half-written file.
pub(crate) async fn write_atomic(dst: &Path, data: &[u8]) -> StoreResult<()> {
    ensure_parent(dst).await?;
    let tmp = partial_path(dst);
    fs::write(&tmp, data).await?;
    fs::rename(&tmp, dst).await?;
    Ok(())
}

/// Stream `reader` into `dst` via a temp file and rename, polling `cancel`
/// between chunks. On error or cancellation the temp file is removed.
pub(crate) async fn copy_atomic<R>(
    reader: &mut R,
    dst: &Path,
    cancel: &CancelFlag,
) -> StoreResult<u64>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut out = PartialFile::create(dst).await?;
    match copy_chunks(reader, &mut out, cancel).await {
        Ok(written) => {
            out.commit().await?;
            Ok(written)
        }
        Err(e) => {
            out.discard().await;
            Err(e)
        }
    }
}

async fn copy_chunks<R>(
    reader: &mut R,
    out: &mut PartialFile,
    cancel: &CancelFlag,
) -> StoreResult<u64>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut written = 0u64;
    loop {
        cancel.check()?;
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(written);
        }
        out.write(&buf[..n]).await?;
        written += n as u64;
    }
}

pub(crate) async fn ensure_parent(path: &Path) -> StoreResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    Ok(())
}

/// Fill `buf` from `reader` until it is full or the reader is exhausted.
///
/// Returns the number of bytes read; fewer than `buf.len()` means EOF.
pub(crate) async fn read_chunk<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
