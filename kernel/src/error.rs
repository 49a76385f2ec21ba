use crate::block::BlockError;
use crate::file::FileError;
use crate::vm::address_space::Pid;
use crate::vm::mmap::MapId;
use thiserror::Error;

/// Why a VM operation failed.
///
/// Every variant is fatal to the request that produced it: the fault handler terminates the
/// offending process. Corrupted bookkeeping is never reported here; it panics instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VmError {
    /// No free frame, and eviction could not produce one.
    #[error("out of memory: no frame could be evicted")]
    OutOfMemory,
    /// Every swap slot holds an evicted page.
    #[error("swap space exhausted")]
    SwapFull,
    #[error("swap device: {0}")]
    Block(#[from] BlockError),
    #[error("file: {0}")]
    File(#[from] FileError),
    /// A lazy load read fewer bytes than the page was reserved with.
    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },
    #[error("a page is already reserved at {0:#010x}")]
    AlreadyReserved(usize),
    #[error("no page is reserved at {0:#010x}")]
    NotReserved(usize),
    #[error("{0:#010x} is not a valid user address")]
    BadAddress(usize),
    #[error("write to read-only page at {0:#010x}")]
    ReadOnly(usize),
    #[error("invalid page range")]
    InvalidRange,
    #[error("no mapping with id {0}")]
    UnknownMapping(MapId),
    #[error("stack growth to {0:#010x} rejected")]
    StackRejected(usize),
    /// The process's pages were already freed.
    #[error("address space of pid {0} has been torn down")]
    TornDown(Pid),
}
