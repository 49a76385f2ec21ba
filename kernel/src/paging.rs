//! A per-process model of the two-level x86 page table.
//!
//! Entries use the hardware layout from `vmkern_shared::paging`; the frame address field holds the
//! [`FrameId`] of the user pool frame instead of a physical address.

// Frame ids are bounded by the pool size, which is far below 2^20.
#![allow(clippy::cast_possible_truncation)]

use crate::mem::FrameId;
use alloc::{boxed::Box, vec::Vec};
use arbitrary_int::u20;
use core::fmt;
use vmkern_shared::mem::{is_user_vaddr, page_round_down, PAGE_FRAME_SIZE};
use vmkern_shared::paging::{
    PageDirectoryEntry, PageTableEntry, PteLocation, PAGE_DIRECTORY_LEN, PAGE_TABLE_LEN,
};

/// A page-aligned user virtual address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VirtPage(usize);

impl VirtPage {
    /// The page that contains `addr`.
    pub const fn containing(addr: usize) -> Self {
        Self(page_round_down(addr))
    }

    /// Returns `None` unless `addr` is page-aligned.
    pub const fn from_aligned(addr: usize) -> Option<Self> {
        if addr % PAGE_FRAME_SIZE == 0 {
            Some(Self(addr))
        } else {
            None
        }
    }

    pub const fn addr(self) -> usize {
        self.0
    }

    /// The page `count` pages above this one.
    pub const fn add(self, count: usize) -> Self {
        Self(self.0 + count * PAGE_FRAME_SIZE)
    }

    pub fn location(self) -> PteLocation {
        PteLocation::of(self.0)
    }
}

impl fmt::Display for VirtPage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

type PageTable = [PageTableEntry; PAGE_TABLE_LEN];

pub struct PageDir {
    directory: Box<[PageDirectoryEntry]>,
    tables: Vec<Option<Box<PageTable>>>,
}

impl Default for PageDir {
    fn default() -> Self {
        Self::new()
    }
}

impl PageDir {
    pub fn new() -> Self {
        let mut tables = Vec::with_capacity(PAGE_DIRECTORY_LEN);
        tables.resize_with(PAGE_DIRECTORY_LEN, || None);
        Self {
            directory: alloc::vec![PageDirectoryEntry::DEFAULT; PAGE_DIRECTORY_LEN]
                .into_boxed_slice(),
            tables,
        }
    }

    fn pte(&self, page: VirtPage) -> Option<&PageTableEntry> {
        let location = page.location();
        let table = self.tables[location.directory as usize].as_ref()?;
        Some(&table[location.table as usize])
    }

    /// Returns the entry for `page`, creating its page table if `create` is set.
    fn pte_mut(&mut self, page: VirtPage, create: bool) -> Option<&mut PageTableEntry> {
        let location = page.location();
        let directory = location.directory as usize;
        if self.tables[directory].is_none() {
            if !create {
                return None;
            }
            self.tables[directory] = Some(Box::new([PageTableEntry::DEFAULT; PAGE_TABLE_LEN]));
            self.directory[directory] = PageDirectoryEntry::DEFAULT
                .with_present(true)
                .with_read_write(true)
                .with_user_supervisor(true)
                .with_page_table_address(u20::new(location.directory.into()));
        }
        let table = self.tables[directory].as_mut()?;
        Some(&mut table[location.table as usize])
    }

    /// Looks up the frame `addr` is mapped to, if any.
    pub fn get_mapping(&self, addr: usize) -> Option<FrameId> {
        let pte = self.pte(VirtPage::containing(addr))?;
        if !pte.present() {
            return None;
        }
        Some(FrameId(pte.page_frame_address().value() as usize))
    }

    /// Maps the page containing `addr` to `frame`. Fails if `addr` is not a user address or is
    /// already mapped. The new entry starts out clean and unaccessed.
    #[must_use]
    pub fn set_mapping(&mut self, addr: usize, frame: FrameId, writable: bool) -> bool {
        if !is_user_vaddr(addr) {
            return false;
        }
        let Some(pte) = self.pte_mut(VirtPage::containing(addr), true) else {
            return false;
        };
        if pte.present() {
            return false;
        }
        *pte = PageTableEntry::DEFAULT
            .with_present(true)
            .with_read_write(writable)
            .with_user_supervisor(true)
            .with_page_frame_address(u20::new(frame.0 as u32));
        true
    }

    /// Marks the page containing `addr` not present. The accessed and dirty bits are left as the
    /// hardware last wrote them.
    pub fn clear_mapping(&mut self, addr: usize) {
        if let Some(pte) = self.pte_mut(VirtPage::containing(addr), false) {
            *pte = pte.with_present(false);
        }
    }

    pub fn is_dirty(&self, addr: usize) -> bool {
        self.pte(VirtPage::containing(addr))
            .is_some_and(|pte| pte.dirty())
    }

    pub fn set_dirty(&mut self, addr: usize, dirty: bool) {
        if let Some(pte) = self.pte_mut(VirtPage::containing(addr), false) {
            *pte = pte.with_dirty(dirty);
        }
    }

    pub fn is_accessed(&self, addr: usize) -> bool {
        self.pte(VirtPage::containing(addr))
            .is_some_and(|pte| pte.accessed())
    }

    pub fn set_accessed(&mut self, addr: usize, accessed: bool) {
        if let Some(pte) = self.pte_mut(VirtPage::containing(addr), false) {
            *pte = pte.with_accessed(accessed);
        }
    }

    /// Whether the page containing `addr` is mapped writable.
    pub fn is_writable(&self, addr: usize) -> bool {
        self.pte(VirtPage::containing(addr))
            .is_some_and(|pte| pte.present() && pte.read_write())
    }

    /// Where the hardware entry for `addr` lives.
    pub fn locate(&self, addr: usize) -> PteLocation {
        PteLocation::of(addr)
    }

    /// Every page currently mapped, in address order.
    pub fn mapped_pages(&self) -> impl Iterator<Item = (VirtPage, FrameId)> + '_ {
        self.tables
            .iter()
            .enumerate()
            .filter_map(|(directory, table)| Some((directory, table.as_ref()?)))
            .flat_map(|(directory, table)| {
                table.iter().enumerate().filter_map(move |(index, pte)| {
                    if !pte.present() {
                        return None;
                    }
                    let page = VirtPage((directory << 22) | (index << 12));
                    Some((page, FrameId(pte.page_frame_address().value() as usize)))
                })
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmkern_shared::mem::OFFSET;

    const ADDR: usize = 0x0804_8000;

    #[test]
    fn test_virt_page_rounding() {
        assert_eq!(VirtPage::containing(ADDR + 0x123).addr(), ADDR);
        assert_eq!(VirtPage::from_aligned(ADDR + 1), None);
        assert_eq!(VirtPage::containing(ADDR).add(2).addr(), ADDR + 2 * PAGE_FRAME_SIZE);
        assert_eq!(VirtPage::containing(ADDR).to_string(), "0x08048000");
    }

    #[test]
    fn test_map_and_unmap() {
        let mut pagedir = PageDir::new();
        assert_eq!(pagedir.get_mapping(ADDR), None);
        assert!(pagedir.set_mapping(ADDR + 5, FrameId(3), true));
        assert_eq!(pagedir.get_mapping(ADDR + 0xfff), Some(FrameId(3)));
        assert!(pagedir.is_writable(ADDR));

        // Double mapping is refused.
        assert!(!pagedir.set_mapping(ADDR, FrameId(4), true));

        pagedir.clear_mapping(ADDR);
        assert_eq!(pagedir.get_mapping(ADDR), None);
        assert!(!pagedir.is_writable(ADDR));
    }

    #[test]
    fn test_dirty_bit_survives_clear_but_not_remap() {
        let mut pagedir = PageDir::new();
        assert!(pagedir.set_mapping(ADDR, FrameId(0), true));
        pagedir.set_dirty(ADDR, true);
        pagedir.clear_mapping(ADDR);
        assert!(pagedir.is_dirty(ADDR));

        assert!(pagedir.set_mapping(ADDR, FrameId(1), false));
        assert!(!pagedir.is_dirty(ADDR));
        assert!(!pagedir.is_writable(ADDR));
    }

    #[test]
    fn test_rejects_kernel_addresses() {
        let mut pagedir = PageDir::new();
        assert!(!pagedir.set_mapping(OFFSET, FrameId(0), true));
    }

    #[test]
    fn test_mapped_pages() {
        let mut pagedir = PageDir::new();
        assert!(pagedir.set_mapping(0x1000_0000, FrameId(2), true));
        assert!(pagedir.set_mapping(ADDR, FrameId(1), true));
        let pages: Vec<_> = pagedir.mapped_pages().collect();
        assert_eq!(
            pages,
            [
                (VirtPage(ADDR), FrameId(1)),
                (VirtPage(0x1000_0000), FrameId(2)),
            ]
        );
    }
}
