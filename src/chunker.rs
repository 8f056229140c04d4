//! Content-defined chunking.
//!
//! Splits a byte stream into variable-size chunks whose boundaries are
//! chosen by a rolling Rabin fingerprint over GF(2), so that a local edit
//! only disturbs nearby boundaries and unchanged regions keep producing the
//! same chunk ids across snapshots. The polynomial comes from the repository
//! config and must stay fixed for the repository's lifetime.
//!
//! Tuning: 64-byte window, 512 KiB minimum, 8 MiB maximum, 1 MiB average
//! (20 split bits). A chunk boundary falls on the byte where the fingerprint
//! has its low 20 bits zero, once the minimum size has been consumed; a cut
//! is forced at the maximum.

use std::io;

use crate::error::{VfsError, VfsResult};
use crate::scratch::ScratchFile;

/// Sliding window width in bytes.
const WINDOW_SIZE: usize = 64;

/// Minimum chunk size.
pub const MIN_CHUNK_SIZE: usize = 512 * 1024;

/// Maximum chunk size.
pub const MAX_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Low bits of the fingerprint that must be zero at a boundary (average
/// chunk size 1 MiB).
const SPLITMASK: u64 = (1 << 20) - 1;

/// Bytes pulled from the backing per read while scanning.
const READ_BLOCK: usize = 256 * 1024;

/// Degree of the polynomial in x over GF(2), or -1 for the zero polynomial.
fn deg(x: u64) -> i32 {
    63 - x.leading_zeros() as i32
}

/// Remainder of polynomial division over GF(2).
fn pmod(mut x: u64, d: u64) -> u64 {
    let dd = deg(d);
    while deg(x) >= dd {
        x ^= d << (deg(x) - dd);
    }
    x
}

/// Append one byte to the fingerprint, reducing mod `pol`.
fn append_byte(hash: u64, b: u8, pol: u64) -> u64 {
    pmod((hash << 8) | b as u64, pol)
}

/// Content-defined chunker.
///
/// One instance per filesystem; `reset` between files. The working buffer
/// is owned here and reused across files, and chunk data is returned as a
/// borrow into it, so it is single-consumer by construction.
pub struct Chunker {
    pol: u64,
    /// `deg(pol) - 8`: the fingerprint bits that select the reduction table.
    shift: u32,
    out_table: [u64; 256],
    mod_table: [u64; 256],

    window: [u8; WINDOW_SIZE],
    wpos: usize,
    digest: u64,
    /// Read offset into the current file.
    pos: u64,
    buf: Vec<u8>,
}

impl Chunker {
    /// Create a chunker for the given polynomial. The polynomial must have
    /// degree 53, the repository tuning all stored chunks assume.
    pub fn new(pol: u64) -> VfsResult<Self> {
        if deg(pol) != 53 {
            return Err(VfsError::InvalidPolynomial(pol));
        }

        let mut out_table = [0u64; 256];
        for (b, slot) in out_table.iter_mut().enumerate() {
            // Fingerprint of byte b followed by window-1 zero bytes: the
            // contribution a byte still makes when it is about to slide out.
            let mut h = append_byte(0, b as u8, pol);
            for _ in 0..WINDOW_SIZE - 1 {
                h = append_byte(h, 0, pol);
            }
            *slot = h;
        }

        let k = deg(pol);
        let mut mod_table = [0u64; 256];
        for (b, slot) in mod_table.iter_mut().enumerate() {
            // Low part reduces (b << k) mod pol; high part cancels the top
            // byte so a single xor keeps the digest below degree k.
            let shifted = (b as u64) << k;
            *slot = pmod(shifted, pol) | shifted;
        }

        Ok(Self {
            pol,
            shift: (k - 8) as u32,
            out_table,
            mod_table,
            window: [0; WINDOW_SIZE],
            wpos: 0,
            digest: 0,
            pos: 0,
            buf: Vec::new(),
        })
    }

    /// The polynomial this chunker was built for.
    pub fn polynomial(&self) -> u64 {
        self.pol
    }

    /// Rewind to the start of a new file.
    pub fn reset(&mut self) {
        self.pos = 0;
    }

    /// Zero the window and seed the fingerprint for a fresh chunk.
    fn start_chunk(&mut self) {
        self.window = [0; WINDOW_SIZE];
        self.wpos = 0;
        self.digest = 0;
        // Seed with a non-zero byte so runs of zeros still roll.
        self.slide(1);
    }

    fn slide(&mut self, b: u8) {
        let out = self.window[self.wpos];
        self.window[self.wpos] = b;
        self.digest ^= self.out_table[out as usize];
        self.wpos = (self.wpos + 1) % WINDOW_SIZE;

        let index = (self.digest >> self.shift) as usize & 0xff;
        self.digest = ((self.digest << 8) | b as u64) ^ self.mod_table[index];
    }

    /// Produce the next chunk of the file, reading from `file` at the
    /// chunker's own offset. Returns `None` at end of file. The returned
    /// slice aliases the internal buffer and is valid until the next call.
    pub fn next_chunk(&mut self, file: &dyn ScratchFile) -> io::Result<Option<&[u8]>> {
        self.start_chunk();
        let mut len = 0usize;

        'fill: while len < MAX_CHUNK_SIZE {
            let want = (MAX_CHUNK_SIZE - len).min(READ_BLOCK);
            if self.buf.len() < len + want {
                self.buf.resize(len + want, 0);
            }
            let n = file.read_at(&mut self.buf[len..len + want], self.pos + len as u64)?;
            if n == 0 {
                break 'fill;
            }

            for i in 0..n {
                let b = self.buf[len + i];
                self.slide(b);
                if len + i + 1 >= MIN_CHUNK_SIZE && self.digest & SPLITMASK == 0 {
                    len += i + 1;
                    self.pos += len as u64;
                    return Ok(Some(&self.buf[..len]));
                }
            }
            len += n;
        }

        if len == 0 {
            return Ok(None);
        }
        self.pos += len as u64;
        Ok(Some(&self.buf[..len]))
    }
}
