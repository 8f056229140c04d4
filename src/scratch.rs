//! Scratch sub-filesystem: backing store for in-flight writes.
//!
//! Writable files are not written to the repository until commit; their
//! bytes live in scratch files obtained from a [`ScratchFs`]. The default
//! implementation hands out anonymous OS temp files; tests inject
//! [`MemScratch`]. Scratch files are positionless (every caller owns its
//! own cursor) and must tolerate concurrent use by independent handles.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::Mutex;

/// A single scratch file. Interior-mutable so `Arc`-shared backings can
/// serve concurrent readers.
pub trait ScratchFile: Send + Sync {
    /// Read up to `buf.len()` bytes at `offset`. Returns the number of bytes
    /// read; 0 means end of file.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Write all of `data` at `offset`, extending the file as needed.
    /// Returns the number of bytes written.
    fn write_at(&self, data: &[u8], offset: u64) -> io::Result<usize>;

    /// Truncate or extend to exactly `size` bytes.
    fn truncate(&self, size: u64) -> io::Result<()>;

    /// Current file size.
    fn len(&self) -> io::Result<u64>;

    /// True when the file holds no bytes.
    fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// Factory for scratch files.
#[async_trait]
pub trait ScratchFs: Send + Sync {
    /// Create a fresh, empty scratch file. `prefix` is a naming hint for
    /// implementations that keep visible names; it need not be unique.
    async fn tempfile(&self, prefix: &str) -> io::Result<Box<dyn ScratchFile>>;
}

// ── OS-backed scratch ───────────────────────────────────────────────────────

/// OS-backed scratch filesystem: anonymous temp files under a directory
/// (the process temp dir by default). Files disappear with their handles.
pub struct OsScratch {
    dir: Option<PathBuf>,
}

impl OsScratch {
    /// Scratch files in the process temp dir.
    pub fn new() -> Self {
        Self { dir: None }
    }

    /// Scratch files under a specific directory.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
        }
    }
}

impl Default for OsScratch {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScratchFs for OsScratch {
    async fn tempfile(&self, _prefix: &str) -> io::Result<Box<dyn ScratchFile>> {
        let file = match &self.dir {
            Some(dir) => tempfile::tempfile_in(dir)?,
            None => tempfile::tempfile()?,
        };
        Ok(Box::new(OsScratchFile {
            file: Mutex::new(file),
        }))
    }
}

struct OsScratchFile {
    file: Mutex<std::fs::File>,
}

impl ScratchFile for OsScratchFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        let mut read = 0;
        while read < buf.len() {
            let n = file.read(&mut buf[read..])?;
            if n == 0 {
                break;
            }
            read += n;
        }
        Ok(read)
    }

    fn write_at(&self, data: &[u8], offset: u64) -> io::Result<usize> {
        let mut file = self.file.lock();
        let end = file.seek(SeekFrom::End(0))?;
        if offset > end {
            // Writes past the end zero-fill the gap.
            file.set_len(offset)?;
        }
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(data.len())
    }

    fn truncate(&self, size: u64) -> io::Result<()> {
        self.file.lock().set_len(size)
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.file.lock().metadata()?.len())
    }
}

// ── In-memory scratch ───────────────────────────────────────────────────────

/// In-memory scratch filesystem for tests and embedded use.
pub struct MemScratch {
    created: AtomicU64,
}

impl MemScratch {
    /// Create an empty in-memory scratch filesystem.
    pub fn new() -> Self {
        Self {
            created: AtomicU64::new(0),
        }
    }

    /// Number of scratch files handed out so far.
    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }
}

impl Default for MemScratch {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ScratchFs for MemScratch {
    async fn tempfile(&self, _prefix: &str) -> io::Result<Box<dyn ScratchFile>> {
        self.created.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MemScratchFile {
            data: Mutex::new(Vec::new()),
        }))
    }
}

struct MemScratchFile {
    data: Mutex<Vec<u8>>,
}

impl ScratchFile for MemScratchFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let data = self.data.lock();
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn write_at(&self, src: &[u8], offset: u64) -> io::Result<usize> {
        let mut data = self.data.lock();
        let offset = offset as usize;
        if offset + src.len() > data.len() {
            data.resize(offset + src.len(), 0);
        }
        data[offset..offset + src.len()].copy_from_slice(src);
        Ok(src.len())
    }

    fn truncate(&self, size: u64) -> io::Result<()> {
        self.data.lock().resize(size as usize, 0);
        Ok(())
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.data.lock().len() as u64)
    }
}
