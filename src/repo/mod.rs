//! The repository capability consumed by the filesystem.
//!
//! The VFS treats the snapshot repository as an opaque content-addressed
//! store: blobs in, blobs out, plus an index for existence and size lookups.
//! Encryption, packing, transport, retries, and locking all live behind this
//! trait.

mod memory;
mod snapshot;

pub use memory::MemoryRepository;
pub use snapshot::Snapshot;

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::id::BlobId;
use crate::tree::TreeBlob;

/// Blob kinds stored by the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlobKind {
    /// File content chunk.
    Data,
    /// Serialized directory.
    Tree,
}

impl fmt::Display for BlobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlobKind::Data => f.write_str("data"),
            BlobKind::Tree => f.write_str("tree"),
        }
    }
}

/// Repository-level configuration the filesystem needs.
#[derive(Debug, Clone)]
pub struct RepoConfig {
    /// Polynomial driving content-defined chunking. Must be kept stable for
    /// the lifetime of a repository or deduplication breaks.
    pub chunker_polynomial: u64,
}

/// Errors surfaced by repository implementations.
#[derive(Debug, Error)]
pub enum RepoError {
    /// A blob id was not present in the repository.
    #[error("{kind} blob {} not found", .id.short())]
    BlobNotFound { id: BlobId, kind: BlobKind },

    /// A snapshot id was not present in the repository.
    #[error("snapshot {} not found", .0.short())]
    SnapshotNotFound(BlobId),

    /// Backend/transport failure.
    #[error("backend: {0}")]
    Backend(String),

    /// Stored bytes failed to decode.
    #[error("decode: {0}")]
    Decode(#[from] serde_json::Error),

    /// I/O failure in a local backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The snapshot repository, as seen by the filesystem.
///
/// Identifiers are 32-byte content hashes ([`BlobId`]). `lookup_blob_size`
/// and `index_has` consult the in-memory index and never touch the network;
/// everything else may block on transport and must honor cancellation by
/// the caller racing the returned future against a token.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Load and decode a tree blob.
    async fn load_tree(&self, id: BlobId) -> Result<TreeBlob, RepoError>;

    /// Load a blob's plaintext bytes. `hint` is the expected size when the
    /// caller knows it, letting implementations pre-size buffers.
    async fn load_blob(
        &self,
        kind: BlobKind,
        id: BlobId,
        hint: Option<u32>,
    ) -> Result<Vec<u8>, RepoError>;

    /// Store a blob under a precomputed id. `uncached` hints that the local
    /// blob cache layer should not retain the bytes (bulk data uploads).
    /// Saving an id that already exists is a no-op.
    async fn save_blob(
        &self,
        kind: BlobKind,
        data: &[u8],
        id: BlobId,
        uncached: bool,
    ) -> Result<(), RepoError>;

    /// Plaintext size of an indexed blob, if present.
    fn lookup_blob_size(&self, id: BlobId, kind: BlobKind) -> Option<u32>;

    /// Whether the index already holds the blob.
    fn index_has(&self, id: BlobId, kind: BlobKind) -> bool;

    /// Store a snapshot record as an unpacked JSON blob; returns its id.
    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<BlobId, RepoError>;

    /// Load a snapshot record by id.
    async fn load_snapshot(&self, id: BlobId) -> Result<Snapshot, RepoError>;

    /// The most recent snapshot by record time, if any.
    async fn latest_snapshot(&self) -> Result<Option<(BlobId, Snapshot)>, RepoError>;

    /// Persist all pending writes. A snapshot is only visible to other
    /// readers after a successful flush.
    async fn flush(&self) -> Result<(), RepoError>;

    /// Repository configuration.
    fn config(&self) -> &RepoConfig;
}
