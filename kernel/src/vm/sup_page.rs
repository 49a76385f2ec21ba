//! The supplemental page table: per-process metadata for every virtual page the hardware table
//! alone cannot describe.

use super::swap::SwapSlot;
use crate::error::VmError;
use crate::file::FileHandle;
use crate::mem::FrameId;
use crate::paging::VirtPage;
use alloc::collections::BTreeMap;
use core::fmt;

/// Where a page's initial contents come from, kept after the first load so memory-mapped pages
/// can be written back.
#[derive(Clone)]
pub struct FileBacking {
    pub file: FileHandle,
    pub offset: usize,
    pub read_bytes: usize,
}

impl fmt::Debug for FileBacking {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FileBacking")
            .field("offset", &self.offset)
            .field("read_bytes", &self.read_bytes)
            .finish_non_exhaustive()
    }
}

/// A page that has been reserved but never backed by a frame.
#[derive(Clone)]
pub struct LazyPage {
    pub file: FileHandle,
    pub offset: usize,
    pub read_bytes: usize,
    pub zero_bytes: usize,
    pub writable: bool,
}

impl fmt::Debug for LazyPage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("LazyPage")
            .field("offset", &self.offset)
            .field("read_bytes", &self.read_bytes)
            .field("zero_bytes", &self.zero_bytes)
            .field("writable", &self.writable)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub enum PageEntry {
    /// Reserved; no frame, no hardware mapping.
    LazyLoad(LazyPage),
    /// Backed by `frame` and mapped in the page directory.
    Resident {
        frame: FrameId,
        writable: bool,
        backing: Option<FileBacking>,
    },
    /// Contents live in `slot`; no frame, no hardware mapping.
    Evicted {
        slot: SwapSlot,
        writable: bool,
        /// The hardware dirty bit at the time of eviction.
        dirty: bool,
        backing: Option<FileBacking>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    LazyLoad,
    Resident,
    Evicted,
}

impl PageEntry {
    pub fn state(&self) -> PageState {
        match self {
            PageEntry::LazyLoad(_) => PageState::LazyLoad,
            PageEntry::Resident { .. } => PageState::Resident,
            PageEntry::Evicted { .. } => PageState::Evicted,
        }
    }

    pub fn writable(&self) -> bool {
        match self {
            PageEntry::LazyLoad(lazy) => lazy.writable,
            PageEntry::Resident { writable, .. } | PageEntry::Evicted { writable, .. } => *writable,
        }
    }

    pub fn backing(&self) -> Option<FileBacking> {
        match self {
            PageEntry::LazyLoad(lazy) => Some(FileBacking {
                file: lazy.file.clone(),
                offset: lazy.offset,
                read_bytes: lazy.read_bytes,
            }),
            PageEntry::Resident { backing, .. } | PageEntry::Evicted { backing, .. } => {
                backing.clone()
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct SupplementalPageTable {
    entries: BTreeMap<VirtPage, PageEntry>,
}

impl SupplementalPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entry for `page`. Overlapping reservations are refused.
    pub fn reserve(&mut self, page: VirtPage, entry: PageEntry) -> Result<(), VmError> {
        if self.entries.contains_key(&page) {
            return Err(VmError::AlreadyReserved(page.addr()));
        }
        self.entries.insert(page, entry);
        Ok(())
    }

    pub fn get(&self, page: VirtPage) -> Option<&PageEntry> {
        self.entries.get(&page)
    }

    pub fn contains(&self, page: VirtPage) -> bool {
        self.entries.contains_key(&page)
    }

    pub fn state(&self, page: VirtPage) -> Option<PageState> {
        self.get(page).map(PageEntry::state)
    }

    pub fn remove(&mut self, page: VirtPage) -> Option<PageEntry> {
        self.entries.remove(&page)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (VirtPage, &PageEntry)> {
        self.entries.iter().map(|(page, entry)| (*page, entry))
    }

    /// Empties the table, yielding entries in address order.
    pub fn drain(&mut self) -> impl Iterator<Item = (VirtPage, PageEntry)> {
        core::mem::take(&mut self.entries).into_iter()
    }

    /// Records that `page` is now backed by `frame`.
    ///
    /// # Panics
    ///
    /// Panics if `page` has no entry or is already resident.
    pub fn mark_resident(&mut self, page: VirtPage, frame: FrameId) {
        let entry = self
            .entries
            .get_mut(&page)
            .unwrap_or_else(|| panic!("no supplemental entry for {page}"));
        assert!(
            entry.state() != PageState::Resident,
            "{page} is already resident"
        );
        *entry = PageEntry::Resident {
            frame,
            writable: entry.writable(),
            backing: entry.backing(),
        };
    }

    /// Records that resident `page` was written to `slot`. A page mapped without an entry gets a
    /// fresh writable one.
    ///
    /// # Panics
    ///
    /// Panics if the entry for `page` is not resident.
    pub fn mark_evicted(&mut self, page: VirtPage, slot: SwapSlot, dirty: bool) {
        let Some(entry) = self.entries.get_mut(&page) else {
            self.entries.insert(
                page,
                PageEntry::Evicted {
                    slot,
                    writable: true,
                    dirty,
                    backing: None,
                },
            );
            return;
        };
        let PageEntry::Resident {
            writable, backing, ..
        } = entry
        else {
            panic!("evicting {page} whose entry is {:?}", entry.state());
        };
        *entry = PageEntry::Evicted {
            slot,
            writable: *writable,
            dirty,
            backing: backing.take(),
        };
    }
}
