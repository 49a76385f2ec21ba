// https://wiki.osdev.org/Paging

// Avoids lots of warnings about casting usize to u32 which cannot result in
// truncation for user addresses, which all sit below OFFSET.
#![allow(clippy::cast_possible_truncation)]

use crate::mem::PAGE_FRAME_SIZE;
use arbitrary_int::{u10, u12, u20};
use bitbybit::bitfield;
use core::mem::size_of;

pub const PAGE_DIRECTORY_LEN: usize = PAGE_FRAME_SIZE / size_of::<PageDirectoryEntry>();
pub const PAGE_TABLE_LEN: usize = PAGE_FRAME_SIZE / size_of::<PageTableEntry>();

#[bitfield(u32, default = 0)]
pub struct PageDirectoryEntry {
    #[bit(0, rw)]
    present: bool,
    #[bit(1, rw)]
    read_write: bool,
    #[bit(2, rw)]
    user_supervisor: bool,
    #[bit(5, rw)]
    accessed: bool,
    #[bit(7, rw)]
    page_size: bool,
    #[bits(12..=31, rw)]
    page_table_address: u20,
}

#[bitfield(u32, default = 0)]
pub struct PageTableEntry {
    #[bit(0, rw)]
    present: bool,
    #[bit(1, rw)]
    read_write: bool,
    #[bit(2, rw)]
    user_supervisor: bool,
    #[bit(3, rw)]
    write_through: bool,
    #[bit(4, rw)]
    cache_disable: bool,
    #[bit(5, rw)]
    accessed: bool,
    #[bit(6, rw)]
    dirty: bool,
    #[bit(8, rw)]
    global: bool,
    #[bits(12..=31, rw)]
    page_frame_address: u20,
}

#[bitfield(u32)]
pub struct VirtualAddress {
    #[bits(22..=31, r)]
    page_directory_index: u10,
    #[bits(12..=21, r)]
    page_table_index: u10,
    #[bits(0..=11, r)]
    offset: u12,
}

impl VirtualAddress {
    pub fn from_usize(addr: usize) -> Self {
        Self::new_with_raw_value(addr as u32)
    }
}

/// Where the hardware keeps the entry for one page: the page directory slot
/// and the slot inside the page table it points to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PteLocation {
    pub directory: u16,
    pub table: u16,
}

impl PteLocation {
    pub fn of(addr: usize) -> Self {
        let addr = VirtualAddress::from_usize(addr);
        Self {
            directory: addr.page_directory_index().value(),
            table: addr.page_table_index().value(),
        }
    }

    /// The page-aligned virtual address this entry translates.
    pub fn page_address(self) -> usize {
        ((self.directory as usize) << 22) | ((self.table as usize) << 12)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_lengths() {
        assert_eq!(PAGE_DIRECTORY_LEN, 1024);
        assert_eq!(PAGE_TABLE_LEN, 1024);
    }

    #[test]
    fn test_pte_bits() {
        let pte = PageTableEntry::DEFAULT
            .with_present(true)
            .with_read_write(true)
            .with_dirty(true)
            .with_page_frame_address(u20::new(0x123));
        assert!(pte.present());
        assert!(pte.read_write());
        assert!(pte.dirty());
        assert!(!pte.accessed());
        assert_eq!(pte.page_frame_address().value(), 0x123);
        assert_eq!(pte.raw_value(), 0x123 << 12 | 1 << 6 | 0b11);

        let cleared = pte.with_present(false);
        assert!(!cleared.present());
        assert!(cleared.dirty());
    }

    #[test]
    fn test_pte_location() {
        let location = PteLocation::of(0x0804_8abc);
        assert_eq!(location.directory, 0x20);
        assert_eq!(location.table, 0x48);
        assert_eq!(location.page_address(), 0x0804_8000);
    }
}
