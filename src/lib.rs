//! # snapfs
//!
//! A copy-on-write snapshot filesystem over a content-addressed blob store.
//!
//! `snapfs` exposes a deduplicated snapshot repository as a read/write
//! hierarchical filesystem, so a version-control remote helper can use it
//! as the backing store for a bare object database: every push commits a
//! new snapshot containing the full database.
//!
//! Key components:
//!
//! - [`SnapshotFs`]: the filesystem façade; path operations, single-writer
//!   discipline, snapshot commit
//! - [`Repository`]: the opaque content-addressed store the filesystem
//!   runs over (storage backends, encryption, and packing live behind it)
//! - [`FileHandle`]: a cursor over an open file; reads go through a
//!   bounded blob cache, writes through a scratch file
//! - [`Chunker`]: content-defined chunking, so unchanged data re-chunks to
//!   the same blob ids and deduplicates across snapshots
//! - [`ScratchFs`]: injectable scratch sub-filesystem backing in-flight
//!   writes (OS temp files by default, in-memory for tests)
//!
//! ## Design decisions
//!
//! - **Read-only by default**: writing starts with
//!   [`SnapshotFs::start_new_snapshot`] and only becomes durable at
//!   [`SnapshotFs::commit_snapshot`].
//! - **Copy-on-write at the node**: the first write to a committed file
//!   copies it into scratch; readers keep consistent reads through the
//!   swap.
//! - **One writer per file**: a second concurrent writer fails `InUse`.
//! - **Coarse locking**: one mutex over the public surface; I/O on open
//!   handles bypasses it.

mod backing;
mod cache;
mod chunker;
mod error;
mod fs;
mod handle;
mod id;
mod node;
pub mod repo;
mod scratch;
mod tree;
mod types;

pub use cache::{BlobCache, DEFAULT_CACHE_BYTES};
pub use chunker::{Chunker, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};
pub use error::{VfsError, VfsResult};
pub use fs::{Identity, SnapshotFs};
pub use handle::FileHandle;
pub use id::BlobId;
pub use node::NodeMeta;
pub use repo::{BlobKind, MemoryRepository, RepoConfig, RepoError, Repository, Snapshot};
pub use scratch::{MemScratch, OsScratch, ScratchFile, ScratchFs};
pub use tree::TreeBlob;
pub use types::{NodeKind, OpenFlags, Stat};
