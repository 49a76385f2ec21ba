//! The slice of the file system the VM engine relies on: positioned reads for lazy loading and
//! positioned writes for memory-mapped write-back.

use crate::sync::mutex::Mutex;
use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FileError {
    #[error("error reading from the file")]
    ReadError,
    #[error("error writing to the file")]
    WriteError,
}

/// An open file as seen by the VM engine.
///
/// Implementations use interior mutability: one handle is shared by every page reserved from it.
pub trait VmFile: Send + Sync {
    /// Moves the read position to `offset` bytes from the start of the file.
    fn seek(&self, offset: usize);
    /// Reads up to `buf.len()` bytes at the current position and advances it. Returns the number
    /// of bytes read, which is short only at end of file.
    fn read(&self, buf: &mut [u8]) -> Result<usize, FileError>;
    /// Writes `buf` at `offset` without touching the read position. Never extends the file.
    fn write_at(&self, buf: &[u8], offset: usize) -> Result<usize, FileError>;
    /// Length of the file in bytes.
    fn len(&self) -> usize;
    /// Opens the same file again with an independent position.
    fn reopen(&self) -> FileHandle;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub type FileHandle = Arc<dyn VmFile>;

#[derive(Default)]
struct FileStats {
    reads: AtomicUsize,
    writes: AtomicUsize,
}

/// A file whose contents live in kernel memory.
pub struct MemFile {
    data: Arc<Mutex<Vec<u8>>>,
    stats: Arc<FileStats>,
    pos: Mutex<usize>,
}

impl MemFile {
    pub fn new(contents: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            data: Arc::new(Mutex::new(contents)),
            stats: Arc::default(),
            pos: Mutex::new(0),
        })
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    /// Number of `read` calls made through this file or any reopened handle.
    pub fn reads(&self) -> usize {
        self.stats.reads.load(Ordering::Relaxed)
    }

    /// Number of `write_at` calls made through this file or any reopened handle.
    pub fn writes(&self) -> usize {
        self.stats.writes.load(Ordering::Relaxed)
    }
}

impl VmFile for MemFile {
    fn seek(&self, offset: usize) {
        *self.pos.lock() = offset;
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize, FileError> {
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        let data = self.data.lock();
        let mut pos = self.pos.lock();
        let start = (*pos).min(data.len());
        let count = buf.len().min(data.len() - start);
        buf[..count].copy_from_slice(&data[start..start + count]);
        *pos = start + count;
        Ok(count)
    }

    fn write_at(&self, buf: &[u8], offset: usize) -> Result<usize, FileError> {
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        let mut data = self.data.lock();
        let start = offset.min(data.len());
        let count = buf.len().min(data.len() - start);
        data[start..start + count].copy_from_slice(&buf[..count]);
        Ok(count)
    }

    fn len(&self) -> usize {
        self.data.lock().len()
    }

    fn reopen(&self) -> FileHandle {
        Arc::new(Self {
            data: Arc::clone(&self.data),
            stats: Arc::clone(&self.stats),
            pos: Mutex::new(0),
        })
    }
}
