//! File backings: where a file's bytes actually live.
//!
//! A node has at most one backing at a time. Committed files get a
//! read-only [`ChunkView`] over their repository blobs; files being written
//! get a scratch file. Copy-on-write promotion swaps one for the other at
//! the node level.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::cache::BlobCache;
use crate::error::{VfsError, VfsResult};
use crate::id::BlobId;
use crate::node::NodeMeta;
use crate::repo::{BlobKind, RepoError, Repository};
use crate::scratch::ScratchFile;

/// A node's byte store.
pub(crate) enum Backing {
    /// Read-only view over the committed chunk list.
    Chunks(ChunkView),
    /// Writable local scratch file.
    Scratch(Box<dyn ScratchFile>),
}

impl Backing {
    /// Read up to `buf.len()` bytes at `offset`; 0 means end of file.
    pub async fn read_at(&self, buf: &mut [u8], offset: u64) -> VfsResult<usize> {
        match self {
            Backing::Chunks(view) => view.read_at(buf, offset).await,
            Backing::Scratch(file) => Ok(file.read_at(buf, offset)?),
        }
    }

    /// Write `data` at `offset`.
    pub fn write_at(&self, data: &[u8], offset: u64) -> VfsResult<usize> {
        match self {
            Backing::Chunks(_) => Err(VfsError::ReadOnly),
            Backing::Scratch(file) => Ok(file.write_at(data, offset)?),
        }
    }

    /// Truncate to `size` bytes.
    pub fn truncate(&self, size: u64) -> VfsResult<()> {
        match self {
            Backing::Chunks(_) => Err(VfsError::ReadOnly),
            Backing::Scratch(file) => Ok(file.truncate(size)?),
        }
    }
}

/// Read-only random-access view over an ordered list of data blobs.
///
/// `cumsize[i]` is the total size of blobs `0..i`, so `cumsize[n]` is the
/// file size and a binary search locates the blob covering any offset.
pub(crate) struct ChunkView {
    repo: Arc<dyn Repository>,
    cache: Arc<BlobCache>,
    cancel: CancellationToken,
    content: Vec<BlobId>,
    cumsize: Vec<u64>,
}

impl std::fmt::Debug for ChunkView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkView")
            .field("content", &self.content)
            .field("cumsize", &self.cumsize)
            .finish()
    }
}

impl ChunkView {
    /// Build a view from a committed node's content list, verifying the
    /// declared size against the repository index.
    pub fn new(
        repo: Arc<dyn Repository>,
        cache: Arc<BlobCache>,
        cancel: CancellationToken,
        meta: &NodeMeta,
    ) -> VfsResult<Self> {
        let content = meta
            .content
            .clone()
            .expect("chunk view over a dirty file");
        let mut cumsize = Vec::with_capacity(content.len() + 1);
        cumsize.push(0);
        let mut total = 0u64;
        for &id in &content {
            let size = repo
                .lookup_blob_size(id, BlobKind::Data)
                .ok_or(RepoError::BlobNotFound {
                    id,
                    kind: BlobKind::Data,
                })?;
            total += size as u64;
            cumsize.push(total);
        }
        if total != meta.size {
            return Err(VfsError::SizeMismatch {
                name: meta.name.clone(),
                indexed: total,
                declared: meta.size,
            });
        }
        Ok(Self {
            repo,
            cache,
            cancel,
            content,
            cumsize,
        })
    }

    /// Total size of the viewed file.
    pub fn total_size(&self) -> u64 {
        *self.cumsize.last().expect("cumsize is never empty")
    }

    /// Read up to `buf.len()` bytes at `offset`, walking blobs from the one
    /// covering `offset`. A short count means end of file.
    pub async fn read_at(&self, buf: &mut [u8], offset: u64) -> VfsResult<usize> {
        if offset >= self.total_size() {
            return Ok(0);
        }
        // Last index i with cumsize[i] <= offset; its blob covers the offset.
        let start = self.cumsize.partition_point(|&c| c <= offset) - 1;
        let mut skip = (offset - self.cumsize[start]) as usize;

        let mut read = 0;
        for i in start..self.content.len() {
            if read == buf.len() {
                break;
            }
            let blob = self.fetch(i).await?;
            let slice = &blob[skip..];
            skip = 0;
            let n = slice.len().min(buf.len() - read);
            buf[read..read + n].copy_from_slice(&slice[..n]);
            read += n;
        }
        Ok(read)
    }

    /// Load one content blob through the cache.
    async fn fetch(&self, i: usize) -> VfsResult<Arc<Vec<u8>>> {
        let id = self.content[i];
        if let Some(blob) = self.cache.get(id) {
            return Ok(blob);
        }
        let hint = (self.cumsize[i + 1] - self.cumsize[i]) as u32;
        let data = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(VfsError::Cancelled),
            res = self.repo.load_blob(BlobKind::Data, id, Some(hint)) => res?,
        };
        Ok(self.cache.insert(id, data))
    }
}
