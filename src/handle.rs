//! File handles: thin cursors over nodes.
//!
//! A handle holds no blob data of its own. Every I/O call captures the
//! node's current backing, so a copy-on-write promotion between two calls
//! is picked up by the later one.

use std::io::SeekFrom;
use std::sync::Arc;

use tokio::sync::OwnedMutexGuard;

use crate::error::{VfsError, VfsResult};
use crate::node::Node;
use crate::types::OpenFlags;

/// A user-visible cursor over an open file.
pub struct FileHandle {
    node: Arc<Node>,
    name: String,
    flags: OpenFlags,
    position: u64,
    closed: bool,
    lock: Option<OwnedMutexGuard<()>>,
}

impl FileHandle {
    pub(crate) fn new(node: Arc<Node>, name: String, flags: OpenFlags) -> Self {
        Self {
            node,
            name,
            flags,
            position: 0,
            closed: false,
            lock: None,
        }
    }

    /// The path this handle was opened with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquire the node's advisory whole-file lock. Idempotent per handle.
    /// Two handles on the same node locking from one task will deadlock;
    /// the lock is for coordinating independent writer tasks.
    pub async fn lock(&mut self) -> VfsResult<()> {
        if self.closed {
            return Err(VfsError::Closed);
        }
        if self.lock.is_none() {
            self.lock = Some(self.node.flock().lock_owned().await);
        }
        Ok(())
    }

    /// Release the advisory lock if this handle holds it.
    pub fn unlock(&mut self) -> VfsResult<()> {
        if self.closed {
            return Err(VfsError::Closed);
        }
        self.lock = None;
        Ok(())
    }

    /// Truncate the file through its current backing.
    pub fn truncate(&mut self, size: u64) -> VfsResult<()> {
        if self.closed {
            return Err(VfsError::Closed);
        }
        self.backing()?.truncate(size)
    }

    /// Read at the cursor, advancing it. Returns `Ok(0)` at end of file.
    pub async fn read(&mut self, buf: &mut [u8]) -> VfsResult<usize> {
        let n = self.read_at(buf, self.position).await?;
        self.position += n as u64;
        Ok(n)
    }

    /// Read at an absolute offset without touching the cursor.
    pub async fn read_at(&self, buf: &mut [u8], offset: u64) -> VfsResult<usize> {
        if self.closed {
            return Err(VfsError::Closed);
        }
        self.backing()?.read_at(buf, offset).await
    }

    /// Read from the cursor to end of file.
    pub async fn read_to_end(&mut self) -> VfsResult<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        Ok(out)
    }

    /// Write at the cursor, advancing it.
    pub fn write(&mut self, data: &[u8]) -> VfsResult<usize> {
        if self.closed {
            return Err(VfsError::Closed);
        }
        if !self.flags.writes_data() {
            return Err(VfsError::permission_denied(format!(
                "{}: handle is read-only",
                self.name
            )));
        }
        if self.flags.append {
            return Err(VfsError::Unsupported("append-mode writes"));
        }
        let n = self.backing()?.write_at(data, self.position)?;
        self.position += n as u64;
        Ok(n)
    }

    /// Move the cursor. `SeekFrom::End` is relative to the node's declared
    /// size, not the backing's current length.
    pub fn seek(&mut self, pos: SeekFrom) -> VfsResult<u64> {
        if self.closed {
            return Err(VfsError::Closed);
        }
        let target = match pos {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::Current(delta) => self.position as i128 + delta as i128,
            SeekFrom::End(delta) => self.node.meta.read().size as i128 + delta as i128,
        };
        if target < 0 {
            return Err(VfsError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before start of file",
            )));
        }
        self.position = target as u64;
        Ok(self.position)
    }

    /// Close the handle, releasing the advisory lock and the node's open
    /// counters. Further calls fail with `Closed`.
    pub fn close(&mut self) -> VfsResult<()> {
        if self.closed {
            return Err(VfsError::Closed);
        }
        self.lock = None;
        self.closed = true;
        self.node.release_handle(self.flags.writes_data());
        Ok(())
    }

    fn backing(&self) -> VfsResult<Arc<crate::backing::Backing>> {
        // A node only sheds its backing at file commit, and commit refuses
        // while handles are open; seeing None here means the handle was
        // kept across a commit anyway.
        self.node.backing().ok_or(VfsError::Closed)
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        if !self.closed {
            self.node.release_handle(self.flags.writes_data());
        }
    }
}
