use super::block_core::{BlockOp, BlockSector, BLOCK_SECTOR_SIZE};
use super::block_error::BlockError;
use alloc::{vec, vec::Vec};

/// A block driver backed by kernel memory.
///
/// Used for the swap partition when no disk is attached, and by tests.
pub struct MemDisk {
    data: Vec<u8>,
}

impl MemDisk {
    pub fn new(sectors: BlockSector) -> Self {
        Self {
            data: vec![0; sectors as usize * BLOCK_SECTOR_SIZE],
        }
    }

    fn range(&self, sector: BlockSector) -> Result<core::ops::Range<usize>, BlockError> {
        let start = sector as usize * BLOCK_SECTOR_SIZE;
        let end = start + BLOCK_SECTOR_SIZE;
        if end > self.data.len() {
            return Err(BlockError::SectorOutOfBounds);
        }
        Ok(start..end)
    }
}

impl BlockOp for MemDisk {
    fn read(&mut self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        let range = self.range(sector)?;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write(&mut self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        let range = self.range(sector)?;
        self.data[range].copy_from_slice(buf);
        Ok(())
    }
}
