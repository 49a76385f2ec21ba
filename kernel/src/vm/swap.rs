//! The swap partition, carved into page-sized slots.
//!
//! Slot `i` occupies sectors `[i * SECTORS_PER_PAGE, (i + 1) * SECTORS_PER_PAGE)` of the swap
//! device. Which slots hold live data is tracked only in memory; nothing on disk survives a
//! reboot.

// Slot indices are bounded by the device size in sectors, which is a `BlockSector`.
#![allow(clippy::cast_possible_truncation)]

use crate::block::{Block, BlockSector, BLOCK_SECTOR_SIZE};
use crate::error::VmError;
use crate::mem::Page;
use alloc::{vec, vec::Vec};
use core::fmt;
use log::{debug, info};
use vmkern_shared::mem::PAGE_FRAME_SIZE;
use zerocopy::AsBytes;

pub const SECTORS_PER_PAGE: usize = PAGE_FRAME_SIZE / BLOCK_SECTOR_SIZE;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SwapSlot(pub usize);

impl SwapSlot {
    fn first_sector(self) -> BlockSector {
        (self.0 * SECTORS_PER_PAGE) as BlockSector
    }
}

impl fmt::Display for SwapSlot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "swap slot {}", self.0)
    }
}

/// One bit per slot, set while the slot holds an evicted page.
#[derive(Debug, Clone)]
struct SlotMap {
    bitmap: Vec<u64>,
    count: usize,
    used: usize,
}

impl SlotMap {
    fn new(count: usize) -> Self {
        Self {
            bitmap: vec![0; count.div_ceil(64)],
            count,
            used: 0,
        }
    }

    /// Marks the lowest free slot used.
    fn claim_first(&mut self) -> Option<usize> {
        let (group_index, group) = self
            .bitmap
            .iter_mut()
            .enumerate()
            .find(|(_, group)| **group != u64::MAX)?;
        let index = group_index * 64 + group.trailing_ones() as usize;
        if index >= self.count {
            return None;
        }
        *group |= 1 << (index % 64);
        self.used += 1;
        Some(index)
    }

    fn is_set(&self, index: usize) -> bool {
        index < self.count && self.bitmap[index / 64] & (1 << (index % 64)) != 0
    }

    fn release(&mut self, index: usize) {
        assert!(self.is_set(index), "freeing unused swap slot {index}");
        self.bitmap[index / 64] &= !(1 << (index % 64));
        self.used -= 1;
    }
}

pub struct SwapStore {
    device: Block,
    slots: SlotMap,
}

impl SwapStore {
    pub fn new(device: Block) -> Self {
        let slot_count = device.get_size() as usize / SECTORS_PER_PAGE;
        info!("swap: {} slots on {}", slot_count, device.get_name());
        Self {
            device,
            slots: SlotMap::new(slot_count),
        }
    }

    /// Writes `page` to the lowest free slot and returns it.
    ///
    /// The slot is released again if the device fails.
    pub fn write_page(&mut self, page: &Page) -> Result<SwapSlot, VmError> {
        let slot = SwapSlot(self.slots.claim_first().ok_or(VmError::SwapFull)?);
        let first = slot.first_sector();
        let sectors = page.as_bytes().chunks_exact(BLOCK_SECTOR_SIZE);
        for (sector, chunk) in (first..).zip(sectors) {
            if let Err(err) = self.device.write(sector, chunk) {
                self.slots.release(slot.0);
                return Err(err.into());
            }
        }
        debug!("swap: wrote {slot}");
        Ok(slot)
    }

    /// Reads `slot` into `page` and frees the slot. On failure the slot keeps its data.
    ///
    /// # Panics
    ///
    /// Panics if `slot` is not in use.
    pub fn read_page(&mut self, slot: SwapSlot, page: &mut Page) -> Result<(), VmError> {
        assert!(self.slots.is_set(slot.0), "reading unused {slot}");
        let first = slot.first_sector();
        let sectors = page.as_bytes_mut().chunks_exact_mut(BLOCK_SECTOR_SIZE);
        for (sector, chunk) in (first..).zip(sectors) {
            self.device.read(sector, chunk)?;
        }
        self.slots.release(slot.0);
        debug!("swap: read {slot}");
        Ok(())
    }

    /// Discards the contents of `slot`.
    ///
    /// # Panics
    ///
    /// Panics if `slot` is not in use.
    pub fn free_slot(&mut self, slot: SwapSlot) {
        self.slots.release(slot.0);
    }

    pub fn is_used(&self, slot: SwapSlot) -> bool {
        self.slots.is_set(slot.0)
    }

    pub fn slot_count(&self) -> usize {
        self.slots.count
    }

    pub fn used_slots(&self) -> usize {
        self.slots.used
    }

    pub fn device(&self) -> &Block {
        &self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockError, BlockOp, BlockType, MemDisk};
    use alloc::boxed::Box;
    use zerocopy::FromZeroes;

    fn store(slots: usize) -> SwapStore {
        let sectors = (slots * SECTORS_PER_PAGE) as BlockSector;
        SwapStore::new(Block::new(
            "swap",
            BlockType::Swap,
            sectors,
            Box::new(MemDisk::new(sectors)),
        ))
    }

    fn page_of(byte: u8) -> Box<Page> {
        let mut page = Page::new_box_zeroed();
        page.0.fill(byte);
        page.0[PAGE_FRAME_SIZE - 1] = !byte;
        page
    }

    struct BrokenDisk;

    impl BlockOp for BrokenDisk {
        fn read(&mut self, _: BlockSector, _: &mut [u8]) -> Result<(), BlockError> {
            Err(BlockError::ReadError)
        }

        fn write(&mut self, _: BlockSector, _: &[u8]) -> Result<(), BlockError> {
            Err(BlockError::WriteError)
        }
    }

    #[test]
    fn test_round_trip() {
        let mut swap = store(4);
        let original = page_of(0x5A);
        let slot = swap.write_page(&original).unwrap();
        assert!(swap.is_used(slot));
        assert_eq!(swap.device().write_count() as usize, SECTORS_PER_PAGE);

        let mut back = Page::new_box_zeroed();
        swap.read_page(slot, &mut back).unwrap();
        assert_eq!(back.0, original.0);
        assert!(!swap.is_used(slot));
        assert_eq!(swap.used_slots(), 0);
    }

    #[test]
    fn test_slots_fill_lowest_first() {
        let mut swap = store(3);
        let slots: Vec<_> = (0..3)
            .map(|i| swap.write_page(&page_of(i)).unwrap())
            .collect();
        assert_eq!(slots, [SwapSlot(0), SwapSlot(1), SwapSlot(2)]);
        assert_eq!(swap.write_page(&page_of(9)), Err(VmError::SwapFull));

        swap.free_slot(SwapSlot(1));
        assert_eq!(swap.write_page(&page_of(7)), Ok(SwapSlot(1)));
    }

    #[test]
    fn test_slots_do_not_overlap() {
        let mut swap = store(2);
        let a = swap.write_page(&page_of(1)).unwrap();
        let b = swap.write_page(&page_of(2)).unwrap();

        let mut back = Page::new_box_zeroed();
        swap.read_page(b, &mut back).unwrap();
        assert_eq!(back.0, page_of(2).0);
        swap.read_page(a, &mut back).unwrap();
        assert_eq!(back.0, page_of(1).0);
    }

    #[test]
    fn test_many_slots_cross_bitmap_groups() {
        let mut swap = store(70);
        for _ in 0..70 {
            swap.write_page(&page_of(0)).unwrap();
        }
        assert_eq!(swap.used_slots(), 70);
        swap.free_slot(SwapSlot(65));
        assert_eq!(swap.write_page(&page_of(0)), Ok(SwapSlot(65)));
    }

    #[test]
    fn test_failed_write_releases_slot() {
        let mut swap = SwapStore::new(Block::new(
            "swap",
            BlockType::Swap,
            SECTORS_PER_PAGE as BlockSector,
            Box::new(BrokenDisk),
        ));
        assert_eq!(
            swap.write_page(&page_of(1)),
            Err(VmError::Block(BlockError::WriteError))
        );
        assert_eq!(swap.used_slots(), 0);
    }

    #[test]
    #[should_panic(expected = "freeing unused")]
    fn test_double_free_panics() {
        let mut swap = store(1);
        let slot = swap.write_page(&page_of(1)).unwrap();
        swap.free_slot(slot);
        swap.free_slot(slot);
    }

    #[test]
    #[should_panic(expected = "reading unused")]
    fn test_read_of_unused_slot_panics() {
        let mut swap = store(1);
        let mut page = Page::new_box_zeroed();
        let _ = swap.read_page(SwapSlot(0), &mut page);
    }
}
