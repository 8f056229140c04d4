//! A single directory entry: metadata plus mutation state.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;

use crate::backing::{Backing, ChunkView};
use crate::error::{VfsError, VfsResult};
use crate::fs::{Identity, Shared};
use crate::handle::FileHandle;
use crate::id::BlobId;
use crate::tree::TreeIx;
use crate::types::{NodeKind, OpenFlags, Stat};

/// Permission bits masked off newly created entries.
pub(crate) const UMASK: u32 = 0o002;

/// Serializable node metadata, wire-compatible with non-VFS readers of the
/// repository. Everything the tree blob stores about an entry lives here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeMeta {
    /// Entry name, unique within its tree.
    pub name: String,
    /// Entry type.
    #[serde(rename = "type")]
    pub kind: NodeKind,
    /// Unix permissions.
    pub mode: u32,
    /// Last modification time.
    pub mtime: DateTime<Utc>,
    /// Last access time.
    pub atime: DateTime<Utc>,
    /// Last status change time.
    pub ctime: DateTime<Utc>,
    /// Owner user id.
    #[serde(default)]
    pub uid: u32,
    /// Owner group id.
    #[serde(default)]
    pub gid: u32,
    /// Owner user name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    /// Owner group name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,
    /// File size in bytes. For a committed file this equals the sum of the
    /// content blob sizes.
    #[serde(default)]
    pub size: u64,
    /// Ordered data-blob ids making up the file. `None` iff the file has
    /// uncommitted changes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<BlobId>>,
    /// Tree blob id for directories.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtree: Option<BlobId>,
    /// Symlink target, carried as metadata only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linktarget: Option<String>,
}

impl NodeMeta {
    /// Metadata for a brand-new empty file.
    pub fn file(name: impl Into<String>, perm: u32, identity: &Identity) -> Self {
        Self::fresh(name.into(), NodeKind::File, perm, identity)
    }

    /// Metadata for a brand-new directory.
    pub fn dir(name: impl Into<String>, perm: u32, identity: &Identity) -> Self {
        Self::fresh(name.into(), NodeKind::Dir, perm, identity)
    }

    fn fresh(name: String, kind: NodeKind, perm: u32, identity: &Identity) -> Self {
        let now = Utc::now();
        Self {
            name,
            kind,
            mode: perm & !UMASK,
            mtime: now,
            atime: now,
            ctime: now,
            uid: identity.uid,
            gid: identity.gid,
            user: identity.username.clone(),
            group: identity.group.clone(),
            size: 0,
            content: None,
            subtree: None,
            linktarget: None,
        }
    }

    /// Stat view of this metadata.
    pub fn stat(&self) -> Stat {
        Stat {
            name: self.name.clone(),
            size: self.size,
            mode: self.mode,
            mtime: self.mtime,
            kind: self.kind,
        }
    }
}

/// Runtime node state. Owns the current backing and tracks open handles;
/// the backing accessors are the only methods safe to call without the
/// filesystem mutex.
pub(crate) struct Node {
    pub(crate) meta: RwLock<NodeMeta>,
    /// Index of the containing tree, for dirty propagation. Updated on
    /// rename, always under the filesystem mutex.
    pub(crate) parent: AtomicUsize,
    /// Materialized child tree for directories.
    pub(crate) subtree_ix: Mutex<Option<TreeIx>>,
    backing: Mutex<Option<Arc<Backing>>>,
    /// Advisory whole-file lock for `FileHandle::lock`.
    flock: Arc<AsyncMutex<()>>,
    open_writers: AtomicU32,
    open_handles: AtomicU32,
}

impl Node {
    pub(crate) fn from_meta(meta: NodeMeta, parent: TreeIx) -> Arc<Self> {
        Arc::new(Self {
            meta: RwLock::new(meta),
            parent: AtomicUsize::new(parent),
            subtree_ix: Mutex::new(None),
            backing: Mutex::new(None),
            flock: Arc::new(AsyncMutex::new(())),
            open_writers: AtomicU32::new(0),
            open_handles: AtomicU32::new(0),
        })
    }

    /// The current backing, captured atomically. Handle I/O captures a
    /// reference per call; a copy-on-write promotion after the capture is
    /// invisible to that call and visible to the next one.
    pub(crate) fn backing(&self) -> Option<Arc<Backing>> {
        self.backing.lock().clone()
    }

    pub(crate) fn set_backing(&self, backing: Option<Arc<Backing>>) {
        *self.backing.lock() = backing;
    }

    pub(crate) fn open_writers(&self) -> u32 {
        self.open_writers.load(Ordering::SeqCst)
    }

    pub(crate) fn open_handles(&self) -> u32 {
        self.open_handles.load(Ordering::SeqCst)
    }

    pub(crate) fn release_handle(&self, wrote: bool) {
        self.open_handles.fetch_sub(1, Ordering::SeqCst);
        if wrote {
            self.open_writers.fetch_sub(1, Ordering::SeqCst);
        }
    }

    pub(crate) fn flock(&self) -> Arc<AsyncMutex<()>> {
        self.flock.clone()
    }

    pub(crate) fn parent_tree(&self) -> TreeIx {
        self.parent.load(Ordering::SeqCst)
    }

    pub(crate) fn set_parent_tree(&self, ix: TreeIx) {
        self.parent.store(ix, Ordering::SeqCst);
    }

    /// Open a handle on this file node, setting up or promoting the backing
    /// as the flags demand. Returns the handle and whether the node became
    /// dirty (the caller propagates dirtiness up the tree).
    pub(crate) async fn open(
        self: &Arc<Self>,
        shared: &Shared,
        opened_name: &str,
        flags: OpenFlags,
    ) -> VfsResult<(FileHandle, bool)> {
        if flags.writes_data() && self.open_writers() > 0 {
            return Err(VfsError::in_use(opened_name));
        }

        let mut dirtied = false;
        if self.backing().is_none() {
            let (has_content, node_name) = {
                let meta = self.meta.read();
                (meta.content.is_some(), meta.name.clone())
            };
            if !has_content {
                // New, empty file: writable scratch backing from the start.
                let file = shared.scratch.tempfile(&node_name).await?;
                self.set_backing(Some(Arc::new(Backing::Scratch(file))));
                dirtied = true;
            } else {
                let view = ChunkView::new(
                    shared.repo.clone(),
                    shared.cache.clone(),
                    shared.cancel.clone(),
                    &self.meta.read(),
                )?;
                self.set_backing(Some(Arc::new(Backing::Chunks(view))));
                if flags.writes_data() {
                    self.promote(shared).await?;
                    dirtied = true;
                }
            }
        } else if flags.writes_data() && self.meta.read().content.is_some() {
            // Committed file with readers attached: copy-on-write.
            self.promote(shared).await?;
            dirtied = true;
        }

        self.open_handles.fetch_add(1, Ordering::SeqCst);
        if flags.writes_data() {
            self.open_writers.fetch_add(1, Ordering::SeqCst);
        }
        let mut handle = FileHandle::new(self.clone(), opened_name.to_string(), flags);
        if flags.truncate {
            if let Err(err) = handle.truncate(0) {
                let _ = handle.close();
                return Err(err);
            }
        }
        Ok((handle, dirtied))
    }

    /// Copy the committed bytes into a fresh scratch file and swap the
    /// backing. Readers holding the old chunk view keep consistent reads;
    /// their next call sees the scratch copy.
    async fn promote(&self, shared: &Shared) -> VfsResult<()> {
        let source = self.backing().expect("promoting a file with no backing");
        let view = match source.as_ref() {
            Backing::Chunks(view) => view,
            // Already writable.
            Backing::Scratch(_) => return Ok(()),
        };
        let name = self.meta.read().name.clone();
        let dest = shared.scratch.tempfile(&name).await?;
        let mut buf = vec![0u8; 64 * 1024];
        let mut offset = 0u64;
        loop {
            let n = view.read_at(&mut buf, offset).await?;
            if n == 0 {
                break;
            }
            dest.write_at(&buf[..n], offset)?;
            offset += n as u64;
        }
        self.set_backing(Some(Arc::new(Backing::Scratch(dest))));
        self.meta.write().content = None;
        Ok(())
    }
}
