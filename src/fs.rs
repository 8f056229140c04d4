//! The filesystem façade.
//!
//! [`SnapshotFs`] presents a snapshot's tree-of-directories as a POSIX-like
//! path API and turns the mutated tree back into a snapshot on commit. One
//! coarse mutex guards the public surface; I/O on handles that are already
//! open bypasses it entirely (see [`FileHandle`]).

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::backing::Backing;
use crate::cache::{BlobCache, DEFAULT_CACHE_BYTES};
use crate::chunker::Chunker;
use crate::error::{VfsError, VfsResult};
use crate::handle::FileHandle;
use crate::id::BlobId;
use crate::node::{Node, NodeMeta};
use crate::repo::{BlobKind, RepoError, Repository, Snapshot};
use crate::scratch::{OsScratch, ScratchFs};
use crate::tree::{TreeArena, TreeIx, TreeBlob, ROOT};
use crate::types::{NodeKind, OpenFlags, Stat};

/// Who is writing: stamped onto created nodes and snapshot records.
#[derive(Debug, Clone)]
pub struct Identity {
    /// Host name recorded in snapshots.
    pub hostname: String,
    /// User name recorded on nodes and snapshots.
    pub username: String,
    /// Group name recorded on nodes.
    pub group: String,
    /// Numeric user id.
    pub uid: u32,
    /// Numeric group id.
    pub gid: u32,
}

impl Identity {
    /// Detect the current process identity.
    pub fn detect() -> Self {
        Self {
            hostname: hostname(),
            username: std::env::var("USER").unwrap_or_default(),
            group: String::new(),
            uid: unsafe { libc::getuid() } as u32,
            gid: unsafe { libc::getgid() } as u32,
        }
    }

    /// A fixed identity, for deterministic tests.
    pub fn fixed(hostname: &str, username: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            username: username.to_string(),
            group: String::new(),
            uid: 1000,
            gid: 1000,
        }
    }
}

fn hostname() -> String {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return String::new();
    }
    std::ffi::CStr::from_bytes_until_nul(&buf)
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Resources shared with nodes and handles, outside the filesystem mutex.
pub(crate) struct Shared {
    pub repo: Arc<dyn Repository>,
    pub cache: Arc<BlobCache>,
    pub scratch: Arc<dyn ScratchFs>,
    pub cancel: CancellationToken,
    pub identity: Identity,
    temp_seq: AtomicU64,
}

/// State under the filesystem mutex.
struct FsInner {
    writable: bool,
    arena: TreeArena,
    chunker: Chunker,
}

/// A read/write filesystem over one snapshot chain.
///
/// Created read-only; [`SnapshotFs::start_new_snapshot`] enables writing.
/// Written data lives in the scratch sub-filesystem until
/// [`SnapshotFs::commit_snapshot`] chunks it into the repository and stores
/// a new snapshot record. Only a committed snapshot is durable.
pub struct SnapshotFs {
    shared: Shared,
    inner: AsyncMutex<FsInner>,
}

impl SnapshotFs {
    /// Open a filesystem over `repo`. With a parent snapshot id the root
    /// tree is materialized from it; without one the filesystem starts
    /// empty (and the first commit stores an initial root).
    pub async fn new(repo: Arc<dyn Repository>, parent: Option<BlobId>) -> VfsResult<Self> {
        let chunker = Chunker::new(repo.config().chunker_polynomial)?;
        let shared = Shared {
            repo,
            cache: Arc::new(BlobCache::new(DEFAULT_CACHE_BYTES)),
            scratch: Arc::new(OsScratch::new()),
            cancel: CancellationToken::new(),
            identity: Identity::detect(),
            temp_seq: AtomicU64::new(0),
        };
        let arena = match parent {
            Some(snapshot_id) => {
                let snapshot = shared.repo.load_snapshot(snapshot_id).await?;
                trace!(snapshot = %snapshot_id.short(), tree = %snapshot.tree.short(), "loading root tree");
                let root = shared.repo.load_tree(snapshot.tree).await?;
                TreeArena::with_root(snapshot.tree, root)
            }
            None => TreeArena::empty_root(),
        };
        Ok(Self {
            shared,
            inner: AsyncMutex::new(FsInner {
                writable: false,
                arena,
                chunker,
            }),
        })
    }

    /// Open a filesystem over the repository's most recent snapshot, or an
    /// empty one if the repository has no snapshots yet.
    pub async fn open_latest(repo: Arc<dyn Repository>) -> VfsResult<Self> {
        let parent = repo.latest_snapshot().await?.map(|(id, _)| id);
        Self::new(repo, parent).await
    }

    /// Replace the scratch sub-filesystem (tests pass an in-memory one).
    pub fn with_scratch(mut self, scratch: Arc<dyn ScratchFs>) -> Self {
        self.shared.scratch = scratch;
        self
    }

    /// Attach a cancellation token; when it fires, in-flight repository
    /// calls fail with `Cancelled`.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.shared.cancel = cancel;
        self
    }

    /// Override the detected identity.
    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.shared.identity = identity;
        self
    }

    /// Override the blob cache byte budget.
    pub fn with_cache_size(mut self, max_bytes: usize) -> Self {
        self.shared.cache = Arc::new(BlobCache::new(max_bytes));
        self
    }

    /// Enable writing. Idempotent.
    pub async fn start_new_snapshot(&self) {
        let mut inner = self.inner.lock().await;
        inner.writable = true;
        debug!("start_new_snapshot");
    }

    /// Whether writing has been enabled.
    pub async fn is_writable(&self) -> bool {
        self.inner.lock().await.writable
    }

    /// Create the named file with mode `0o666` (before umask), truncating
    /// it if it already exists.
    pub async fn create(&self, path: &str) -> VfsResult<FileHandle> {
        self.open_file(path, OpenFlags::create_truncate(), 0o666).await
    }

    /// Open the named file read-only.
    pub async fn open(&self, path: &str) -> VfsResult<FileHandle> {
        self.open_file(path, OpenFlags::read(), 0).await
    }

    /// The generalized open call.
    pub async fn open_file(
        &self,
        path: &str,
        flags: OpenFlags,
        perm: u32,
    ) -> VfsResult<FileHandle> {
        let mut inner = self.inner.lock().await;
        let result = self.open_file_locked(&mut inner, path, flags, perm).await;
        match &result {
            Ok(_) => debug!(path, ?flags, "open_file"),
            Err(err) => debug!(path, ?flags, error = %err, "open_file"),
        }
        result
    }

    /// Stat the named entry.
    pub async fn stat(&self, path: &str) -> VfsResult<Stat> {
        let mut inner = self.inner.lock().await;
        let result = self.stat_locked(&mut inner, path).await;
        match &result {
            Ok(stat) => debug!(path, size = stat.size, "stat"),
            Err(err) => debug!(path, error = %err, "stat"),
        }
        result
    }

    /// Move `from` to `to`. The destination must not exist.
    pub async fn rename(&self, from: &str, to: &str) -> VfsResult<()> {
        let mut inner = self.inner.lock().await;
        let result = self.rename_locked(&mut inner, from, to).await;
        match &result {
            Ok(()) => debug!(from, to, "rename"),
            Err(err) => debug!(from, to, error = %err, "rename"),
        }
        result
    }

    /// Remove the named file or directory (with its subtree).
    pub async fn remove(&self, path: &str) -> VfsResult<()> {
        let mut inner = self.inner.lock().await;
        let result = self.remove_locked(&mut inner, path).await;
        match &result {
            Ok(()) => debug!(path, "remove"),
            Err(err) => debug!(path, error = %err, "remove"),
        }
        result
    }

    /// List a directory, in stored order. Callers that need sorted output
    /// sort it themselves.
    pub async fn readdir(&self, path: &str) -> VfsResult<Vec<Stat>> {
        let mut inner = self.inner.lock().await;
        let result = self.readdir_locked(&mut inner, path).await;
        match &result {
            Ok(entries) => debug!(path, entries = entries.len(), "readdir"),
            Err(err) => debug!(path, error = %err, "readdir"),
        }
        result
    }

    /// Create a directory and any missing parents. `perm` (masked by the
    /// umask) applies to every directory created.
    pub async fn mkdir_all(&self, path: &str, perm: u32) -> VfsResult<()> {
        let mut inner = self.inner.lock().await;
        let result = self.mkdir_all_locked(&mut inner, path, perm).await;
        match &result {
            Ok(()) => debug!(path, perm, "mkdir_all"),
            Err(err) => debug!(path, error = %err, "mkdir_all"),
        }
        result
    }

    /// Create a uniquely named writable file under `dir`, its name starting
    /// with `prefix`. The caller removes or renames it when done.
    pub async fn tempfile(&self, dir: &str, prefix: &str) -> VfsResult<FileHandle> {
        let mut inner = self.inner.lock().await;
        if !inner.writable {
            debug!(dir, prefix, "tempfile on read-only filesystem");
            return Err(VfsError::permission_denied(
                "tempfile: filesystem is read-only",
            ));
        }
        loop {
            let seq = self.shared.temp_seq.fetch_add(1, Ordering::SeqCst);
            let name = format!("{prefix}{seq:08}");
            let path = if dir.is_empty() {
                name
            } else {
                format!("{dir}/{name}")
            };
            match self
                .open_file_locked(&mut inner, &path, OpenFlags::create_exclusive(), 0o600)
                .await
            {
                Err(VfsError::AlreadyExists(_)) => continue,
                Ok(handle) => {
                    debug!(path = handle.name(), "tempfile");
                    return Ok(handle);
                }
                Err(err) => {
                    debug!(dir, prefix, error = %err, "tempfile");
                    return Err(err);
                }
            }
        }
    }

    /// Commit all pending changes: chunk dirty files into data blobs,
    /// serialize dirty trees, flush the repository, and store a snapshot
    /// record naming the new root. Fails with `NoChanges` when the root is
    /// clean; on any failure the in-memory state is untouched and retrying
    /// is safe.
    pub async fn commit_snapshot(&self, source_path: &str, tags: &[String]) -> VfsResult<BlobId> {
        let mut inner = self.inner.lock().await;
        if !inner.arena.is_dirty(ROOT) {
            debug!("commit_snapshot: no changes");
            return Err(VfsError::NoChanges);
        }
        let tree = self.commit_tree(&mut inner, ROOT).await?;
        self.guard(self.shared.repo.flush()).await?;
        let snapshot = Snapshot {
            time: Utc::now(),
            tree,
            paths: vec![source_path.to_string()],
            hostname: self.shared.identity.hostname.clone(),
            username: self.shared.identity.username.clone(),
            tags: tags.to_vec(),
        };
        let id = self.guard(self.shared.repo.save_snapshot(&snapshot)).await?;
        info!(snapshot = %id.short(), tree = %tree.short(), "commit_snapshot");
        Ok(id)
    }

    // ── Path resolution ─────────────────────────────────────────────────────

    async fn open_file_locked(
        &self,
        inner: &mut FsInner,
        path: &str,
        flags: OpenFlags,
        perm: u32,
    ) -> VfsResult<FileHandle> {
        if flags.writes() && !inner.writable {
            return Err(VfsError::permission_denied(format!(
                "{path}: filesystem is read-only"
            )));
        }
        let mut parts: Vec<&str> = components(path).collect();
        let Some(name) = parts.pop() else {
            return Err(VfsError::not_found(path));
        };
        let tree = self.resolve_tree(inner, &parts, flags.create, perm).await?;

        match inner.arena.find(tree, name) {
            Some(node) => {
                if flags.exclusive {
                    return Err(VfsError::already_exists(path));
                }
                if !node.meta.read().kind.is_file() {
                    return Err(VfsError::not_a_file(path));
                }
                let (handle, dirtied) = node.open(&self.shared, path, flags).await?;
                if dirtied {
                    inner.arena.mark_dirty(node.parent_tree());
                }
                Ok(handle)
            }
            None => {
                if !flags.create {
                    return Err(VfsError::not_found(path));
                }
                // Attach the node only once the open succeeded, so a failed
                // open leaves the filesystem unchanged.
                let node = Node::from_meta(
                    NodeMeta::file(name, perm, &self.shared.identity),
                    tree,
                );
                let (handle, _) = node.open(&self.shared, path, flags).await?;
                inner.arena.add_node(tree, node);
                Ok(handle)
            }
        }
    }

    async fn readdir_locked(&self, inner: &mut FsInner, path: &str) -> VfsResult<Vec<Stat>> {
        let parts: Vec<&str> = components(path).collect();
        let tree = self.resolve_tree(inner, &parts, false, 0).await?;
        Ok(inner
            .arena
            .slot(tree)
            .nodes
            .iter()
            .map(|node| node.meta.read().stat())
            .collect())
    }

    async fn mkdir_all_locked(&self, inner: &mut FsInner, path: &str, perm: u32) -> VfsResult<()> {
        if !inner.writable {
            return Err(VfsError::permission_denied(format!(
                "{path}: filesystem is read-only"
            )));
        }
        let mut tree = ROOT;
        for part in components(path) {
            tree = self
                .open_subtree(inner, tree, part, true, false, perm)
                .await?;
        }
        Ok(())
    }

    async fn stat_locked(&self, inner: &mut FsInner, path: &str) -> VfsResult<Stat> {
        let mut parts: Vec<&str> = components(path).collect();
        let Some(name) = parts.pop() else {
            return Err(VfsError::not_found(path));
        };
        let tree = self.resolve_tree(inner, &parts, false, 0).await?;
        inner
            .arena
            .find(tree, name)
            .map(|node| node.meta.read().stat())
            .ok_or_else(|| VfsError::not_found(path))
    }

    async fn rename_locked(&self, inner: &mut FsInner, from: &str, to: &str) -> VfsResult<()> {
        if !inner.writable {
            return Err(VfsError::permission_denied(format!(
                "{from}: filesystem is read-only"
            )));
        }
        let mut from_parts: Vec<&str> = components(from).collect();
        let Some(from_name) = from_parts.pop() else {
            return Err(VfsError::not_found(from));
        };
        let mut to_parts: Vec<&str> = components(to).collect();
        let Some(to_name) = to_parts.pop() else {
            return Err(VfsError::not_found(to));
        };

        let from_tree = self.resolve_tree(inner, &from_parts, false, 0).await?;
        let node = inner
            .arena
            .find(from_tree, from_name)
            .ok_or_else(|| VfsError::not_found(from))?;
        let to_tree = self.resolve_tree(inner, &to_parts, false, 0).await?;
        if inner.arena.find(to_tree, to_name).is_some() {
            return Err(VfsError::already_exists(to));
        }

        if from_tree != to_tree {
            inner.arena.remove(from_tree, from_name);
        }
        node.meta.write().name = to_name.to_string();
        if from_tree != to_tree {
            inner.arena.add_node(to_tree, node);
        } else {
            inner.arena.mark_dirty(from_tree);
        }
        Ok(())
    }

    async fn remove_locked(&self, inner: &mut FsInner, path: &str) -> VfsResult<()> {
        if !inner.writable {
            return Err(VfsError::permission_denied(format!(
                "{path}: filesystem is read-only"
            )));
        }
        let mut parts: Vec<&str> = components(path).collect();
        let Some(name) = parts.pop() else {
            return Err(VfsError::not_found(path));
        };
        let tree = self.resolve_tree(inner, &parts, false, 0).await?;
        inner
            .arena
            .remove(tree, name)
            .map(|_| ())
            .ok_or_else(|| VfsError::not_found(path))
    }

    /// Walk directory components from the root, optionally creating missing
    /// ones.
    async fn resolve_tree(
        &self,
        inner: &mut FsInner,
        parts: &[&str],
        create: bool,
        perm: u32,
    ) -> VfsResult<TreeIx> {
        let mut tree = ROOT;
        for &part in parts {
            tree = self
                .open_subtree(inner, tree, part, create, false, perm)
                .await?;
        }
        Ok(tree)
    }

    /// Directory analog of `open_file`. Only create/exclusive apply; other
    /// write-implying flags are ignored.
    async fn open_subtree(
        &self,
        inner: &mut FsInner,
        parent: TreeIx,
        name: &str,
        create: bool,
        exclusive: bool,
        perm: u32,
    ) -> VfsResult<TreeIx> {
        match inner.arena.find(parent, name) {
            None => {
                if !create {
                    return Err(VfsError::not_found(name));
                }
                if !inner.writable {
                    return Err(VfsError::permission_denied(format!(
                        "{name}: filesystem is read-only"
                    )));
                }
                let child = inner.arena.new_subtree(parent);
                let node = Node::from_meta(
                    NodeMeta::dir(name, perm, &self.shared.identity),
                    parent,
                );
                *node.subtree_ix.lock() = Some(child);
                inner.arena.add_node(parent, node);
                Ok(child)
            }
            Some(node) => {
                if exclusive {
                    return Err(VfsError::already_exists(name));
                }
                if !node.meta.read().kind.is_dir() {
                    return Err(VfsError::not_a_directory(name));
                }
                if let Some(ix) = *node.subtree_ix.lock() {
                    return Ok(ix);
                }
                let id = match node.meta.read().subtree {
                    Some(id) => id,
                    None => panic!("no data for subtree {name:?}"),
                };
                trace!(name, tree = %id.short(), "materializing subtree");
                let blob = self.guard(self.shared.repo.load_tree(id)).await?;
                let ix = inner.arena.materialize(parent, id, blob);
                *node.subtree_ix.lock() = Some(ix);
                Ok(ix)
            }
        }
    }

    // ── Commit ──────────────────────────────────────────────────────────────

    /// Commit a tree: children first, then the serialized node list as a
    /// tree blob. Returns immediately when already committed.
    fn commit_tree<'a>(
        &'a self,
        inner: &'a mut FsInner,
        ix: TreeIx,
    ) -> Pin<Box<dyn Future<Output = VfsResult<BlobId>> + Send + 'a>> {
        Box::pin(async move {
            if let Some(id) = inner.arena.slot(ix).id {
                return Ok(id);
            }
            let nodes: Vec<Arc<Node>> = inner.arena.slot(ix).nodes.clone();
            for node in &nodes {
                let kind = node.meta.read().kind;
                match kind {
                    NodeKind::File => self.commit_file(&mut inner.chunker, node).await?,
                    NodeKind::Dir => {
                        let child = *node.subtree_ix.lock();
                        match child {
                            // Never materialized: the stored subtree id is
                            // authoritative.
                            None => {
                                if node.meta.read().subtree.is_none() {
                                    panic!("no data for subtree");
                                }
                            }
                            Some(child_ix) => {
                                let id = self.commit_tree(&mut *inner, child_ix).await?;
                                node.meta.write().subtree = Some(id);
                            }
                        }
                    }
                    // Other node types are stored as-is from the parent
                    // snapshot; nothing to commit.
                    _ => {}
                }
            }

            let wire = TreeBlob {
                nodes: nodes.iter().map(|node| node.meta.read().clone()).collect(),
            };
            let data = wire.to_wire()?;
            let id = BlobId::hash(&data);
            if !self.shared.repo.index_has(id, BlobKind::Tree) {
                self.guard(self.shared.repo.save_blob(BlobKind::Tree, &data, id, false))
                    .await?;
            }
            trace!(tree = %id.short(), nodes = wire.nodes.len(), "committed tree");
            inner.arena.slot_mut(ix).id = Some(id);
            Ok(id)
        })
    }

    /// Commit one file: run the chunker over its scratch backing, store
    /// missing data blobs, install the content list, drop the backing.
    async fn commit_file(&self, chunker: &mut Chunker, node: &Arc<Node>) -> VfsResult<()> {
        if node.meta.read().content.is_some() {
            // Already committed.
            return Ok(());
        }
        if node.open_handles() > 0 {
            return Err(VfsError::in_use(node.meta.read().name.clone()));
        }
        let backing = node.backing().expect("dirty file has no backing");
        let file = match backing.as_ref() {
            Backing::Scratch(file) => file,
            Backing::Chunks(_) => panic!("dirty file has a read-only backing"),
        };

        chunker.reset();
        let mut size = 0u64;
        let mut blobs = Vec::new();
        loop {
            let Some(chunk) = chunker.next_chunk(file.as_ref())? else {
                break;
            };
            size += chunk.len() as u64;
            let id = BlobId::hash(chunk);
            if !self.shared.repo.index_has(id, BlobKind::Data) {
                self.guard(self.shared.repo.save_blob(BlobKind::Data, chunk, id, true))
                    .await?;
            }
            blobs.push(id);
        }

        trace!(
            name = %node.meta.read().name,
            size,
            chunks = blobs.len(),
            "committed file"
        );
        {
            let mut meta = node.meta.write();
            meta.size = size;
            meta.content = Some(blobs);
        }
        // The backing is gone; the next open builds a fresh chunk view over
        // the repository.
        node.set_backing(None);
        Ok(())
    }

    /// Race a repository call against the cancellation token.
    async fn guard<T>(
        &self,
        fut: impl Future<Output = Result<T, RepoError>>,
    ) -> VfsResult<T> {
        tokio::select! {
            biased;
            _ = self.shared.cancel.cancelled() => Err(VfsError::Cancelled),
            res = fut => res.map_err(VfsError::from),
        }
    }
}

/// Path components: forward-slash separated, empty and `.` segments
/// ignored.
fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty() && *c != ".")
}
