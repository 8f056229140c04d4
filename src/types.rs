//! Core VFS types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Node type enumeration, matching the repository's `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// Regular file.
    File,
    /// Directory.
    Dir,
    /// Symbolic link (target carried as metadata only).
    Symlink,
    /// Block device.
    Dev,
    /// Character device.
    Chardev,
    /// Named pipe.
    Fifo,
    /// Unix socket.
    Socket,
}

impl NodeKind {
    /// Returns true if this is a regular file.
    pub fn is_file(&self) -> bool {
        matches!(self, NodeKind::File)
    }

    /// Returns true if this is a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self, NodeKind::Dir)
    }
}

/// Open file flags.
///
/// Append mode is accepted here but rejected at write time; the backing
/// store has no atomic seek-and-write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags {
    /// Read access requested.
    pub read: bool,
    /// Write access requested.
    pub write: bool,
    /// Append mode.
    pub append: bool,
    /// Create if not exists.
    pub create: bool,
    /// Truncate on open.
    pub truncate: bool,
    /// Exclusive create (fail if exists).
    pub exclusive: bool,
}

impl Default for OpenFlags {
    fn default() -> Self {
        Self {
            read: true,
            write: false,
            append: false,
            create: false,
            truncate: false,
            exclusive: false,
        }
    }
}

impl OpenFlags {
    /// Read-only access.
    pub fn read() -> Self {
        Self::default()
    }

    /// Write access (also enables read).
    pub fn write() -> Self {
        Self {
            read: true,
            write: true,
            ..Default::default()
        }
    }

    /// Create with write access.
    pub fn create() -> Self {
        Self {
            read: true,
            write: true,
            create: true,
            ..Default::default()
        }
    }

    /// Create exclusively (fail if exists).
    pub fn create_exclusive() -> Self {
        Self {
            read: true,
            write: true,
            create: true,
            exclusive: true,
            ..Default::default()
        }
    }

    /// Create and truncate, as the `create()` façade call does.
    pub fn create_truncate() -> Self {
        Self {
            read: true,
            write: true,
            create: true,
            truncate: true,
            ..Default::default()
        }
    }

    /// True when the handle will mutate file bytes. Gates the single-writer
    /// discipline and copy-on-write promotion.
    pub(crate) fn writes_data(&self) -> bool {
        self.write || self.append
    }

    /// True when any write-implying flag is set. Gates the read-only
    /// filesystem check.
    pub(crate) fn writes(&self) -> bool {
        self.write || self.append || self.truncate || self.create
    }
}

/// Metadata returned by `stat` and `readdir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    /// Entry name (not full path).
    pub name: String,
    /// Size in bytes (committed size for files, 0 for directories).
    pub size: u64,
    /// Unix permissions (e.g. 0o644).
    pub mode: u32,
    /// Last modification time.
    pub mtime: DateTime<Utc>,
    /// Entry type.
    pub kind: NodeKind,
}

impl Stat {
    /// Returns true if this entry is a directory.
    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }

    /// Returns true if this entry is a regular file.
    pub fn is_file(&self) -> bool {
        self.kind.is_file()
    }
}
