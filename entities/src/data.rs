//! Core data abstraction for byte-oriented, read-only sources.
//!
//! This module defines the `Data` trait, which models a thread-safe,
//! sequential source of bytes that is consumed in chunks. The sender side of
//! a transfer only ever holds a `Data` cursor over the source; it never
//! copies a whole file into memory.
//!
//! Concurrency notes:
//! - All methods take `&self`, and the trait is `Send + Sync`, so implementors
//!   must synchronize their read cursor internally.
//! - Reads are consuming: each call advances the cursor.

use std::{
    fs,
    io::{self, Read},
    path::Path,
    sync::Mutex,
};

/// A thread-safe, sequential source of bytes.
///
/// Contract:
/// - `len()` returns the total length of the underlying data in bytes. It
///   must not change over the lifetime of the object.
/// - `read_chunk(size)` reads up to `size` bytes from the current position.
///   It may return fewer bytes than requested and returns an empty `Vec` at
///   end-of-stream. I/O failures surface as `io::Error`.
pub trait Data: Send + Sync {
    /// Total length of the data in bytes.
    ///
    /// This is the full size of the content, not the number of unread bytes.
    fn len(&self) -> u64;

    /// Checks if the data is empty (length is 0).
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads up to `size` bytes from the current position and advances the
    /// cursor by the number of bytes returned.
    fn read_chunk(&self, size: u64) -> io::Result<Vec<u8>>;
}

fn poisoned() -> io::Error {
    io::Error::other("read cursor lock poisoned")
}

/// In-memory byte source with a protected cursor.
pub struct MemoryData {
    buf: Vec<u8>,
    pos: Mutex<usize>,
}

impl MemoryData {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            buf: bytes.into(),
            pos: Mutex::new(0),
        }
    }
}

impl Data for MemoryData {
    fn len(&self) -> u64 {
        self.buf.len() as u64
    }

    fn read_chunk(&self, size: u64) -> io::Result<Vec<u8>> {
        let mut pos = self.pos.lock().map_err(|_| poisoned())?;
        if *pos >= self.buf.len() {
            return Ok(Vec::new());
        }
        let end = (*pos).saturating_add(size as usize).min(self.buf.len());
        let out = self.buf[*pos..end].to_vec();
        *pos = end;
        Ok(out)
    }
}

/// File-backed byte source.
///
/// The length is captured when the file is opened; reads go straight to the
/// file handle, so only one chunk is resident at a time.
pub struct FileData {
    len: u64,
    file: Mutex<fs::File>,
}

impl FileData {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = fs::File::open(path.as_ref())?;
        let metadata = file.metadata()?;
        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Path is not a file: {}", path.as_ref().display()),
            ));
        }
        Ok(Self {
            len: metadata.len(),
            file: Mutex::new(file),
        })
    }
}

impl Data for FileData {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_chunk(&self, size: u64) -> io::Result<Vec<u8>> {
        let mut file = self.file.lock().map_err(|_| poisoned())?;
        let mut buffer = Vec::with_capacity(size.min(self.len) as usize);
        (&mut *file).take(size).read_to_end(&mut buffer)?;
        Ok(buffer)
    }
}
