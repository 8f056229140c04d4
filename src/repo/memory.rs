//! In-memory repository, for tests and embedded use.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::id::BlobId;
use crate::repo::{BlobKind, RepoConfig, RepoError, Repository, Snapshot};
use crate::tree::TreeBlob;

/// Reference chunker polynomial (degree 53, irreducible over GF(2)).
pub(crate) const DEFAULT_POLYNOMIAL: u64 = 0x3DA3358B4DC173;

#[derive(Default)]
struct Store {
    blobs: HashMap<(BlobKind, BlobId), Arc<Vec<u8>>>,
    snapshots: Vec<(BlobId, Snapshot)>,
    saves: HashMap<BlobKind, u64>,
    flushes: u64,
}

/// A [`Repository`] held entirely in memory.
///
/// Tracks `save_blob` calls per kind so tests can assert deduplication, and
/// exposes `insert_*` helpers for building fixture snapshots directly.
pub struct MemoryRepository {
    config: RepoConfig,
    store: Mutex<Store>,
}

impl MemoryRepository {
    /// Empty repository with the reference polynomial.
    pub fn new() -> Self {
        Self::with_polynomial(DEFAULT_POLYNOMIAL)
    }

    /// Empty repository with a specific chunker polynomial.
    pub fn with_polynomial(chunker_polynomial: u64) -> Self {
        Self {
            config: RepoConfig {
                chunker_polynomial,
            },
            store: Mutex::new(Store::default()),
        }
    }

    /// Store a data blob directly; returns its id.
    pub fn insert_data(&self, data: &[u8]) -> BlobId {
        let id = BlobId::hash(data);
        self.store
            .lock()
            .blobs
            .insert((BlobKind::Data, id), Arc::new(data.to_vec()));
        id
    }

    /// Store a tree blob directly; returns its id.
    pub fn insert_tree(&self, tree: &TreeBlob) -> BlobId {
        let wire = tree.to_wire().expect("tree serialization");
        let id = BlobId::hash(&wire);
        self.store
            .lock()
            .blobs
            .insert((BlobKind::Tree, id), Arc::new(wire));
        id
    }

    /// Store a snapshot record directly; returns its id.
    pub fn insert_snapshot(&self, snapshot: Snapshot) -> BlobId {
        let wire = serde_json::to_vec(&snapshot).expect("snapshot serialization");
        let id = BlobId::hash(&wire);
        self.store.lock().snapshots.push((id, snapshot));
        id
    }

    /// Number of `save_blob` calls seen for a kind.
    pub fn saves(&self, kind: BlobKind) -> u64 {
        self.store.lock().saves.get(&kind).copied().unwrap_or(0)
    }

    /// Number of stored blobs of a kind.
    pub fn blob_count(&self, kind: BlobKind) -> usize {
        self.store
            .lock()
            .blobs
            .keys()
            .filter(|(k, _)| *k == kind)
            .count()
    }

    /// Number of `flush` calls seen.
    pub fn flushes(&self) -> u64 {
        self.store.lock().flushes
    }
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn load_tree(&self, id: BlobId) -> Result<TreeBlob, RepoError> {
        let data = self.load_blob(BlobKind::Tree, id, None).await?;
        Ok(serde_json::from_slice(&data)?)
    }

    async fn load_blob(
        &self,
        kind: BlobKind,
        id: BlobId,
        _hint: Option<u32>,
    ) -> Result<Vec<u8>, RepoError> {
        self.store
            .lock()
            .blobs
            .get(&(kind, id))
            .map(|data| data.as_ref().clone())
            .ok_or(RepoError::BlobNotFound { id, kind })
    }

    async fn save_blob(
        &self,
        kind: BlobKind,
        data: &[u8],
        id: BlobId,
        _uncached: bool,
    ) -> Result<(), RepoError> {
        let mut store = self.store.lock();
        *store.saves.entry(kind).or_insert(0) += 1;
        store
            .blobs
            .entry((kind, id))
            .or_insert_with(|| Arc::new(data.to_vec()));
        Ok(())
    }

    fn lookup_blob_size(&self, id: BlobId, kind: BlobKind) -> Option<u32> {
        self.store
            .lock()
            .blobs
            .get(&(kind, id))
            .map(|data| data.len() as u32)
    }

    fn index_has(&self, id: BlobId, kind: BlobKind) -> bool {
        self.store.lock().blobs.contains_key(&(kind, id))
    }

    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<BlobId, RepoError> {
        let wire = serde_json::to_vec(snapshot)?;
        let id = BlobId::hash(&wire);
        self.store.lock().snapshots.push((id, snapshot.clone()));
        Ok(id)
    }

    async fn load_snapshot(&self, id: BlobId) -> Result<Snapshot, RepoError> {
        self.store
            .lock()
            .snapshots
            .iter()
            .find(|(sid, _)| *sid == id)
            .map(|(_, snapshot)| snapshot.clone())
            .ok_or(RepoError::SnapshotNotFound(id))
    }

    async fn latest_snapshot(&self) -> Result<Option<(BlobId, Snapshot)>, RepoError> {
        Ok(self
            .store
            .lock()
            .snapshots
            .iter()
            .max_by_key(|(_, snapshot)| snapshot.time)
            .map(|(id, snapshot)| (*id, snapshot.clone())))
    }

    async fn flush(&self) -> Result<(), RepoError> {
        self.store.lock().flushes += 1;
        Ok(())
    }

    fn config(&self) -> &RepoConfig {
        &self.config
    }
}
