use crate::file::FileHandle;
use crate::paging::VirtPage;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::fmt;
use vmkern_shared::mem::PAGE_FRAME_SIZE;

/// Identifies a memory-mapped file within one process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MapId(pub u32);

impl fmt::Display for MapId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A file mapped at `base`, covering `length` bytes rounded up to whole pages.
#[derive(Clone)]
pub struct Mapping {
    pub file: FileHandle,
    pub base: VirtPage,
    pub length: usize,
}

impl Mapping {
    pub fn page_count(&self) -> usize {
        self.length.div_ceil(PAGE_FRAME_SIZE)
    }

    /// Each page of the mapping with its file offset and the number of file bytes it holds.
    pub fn pages(&self) -> impl Iterator<Item = (VirtPage, usize, usize)> + '_ {
        (0..self.page_count()).map(|index| {
            let advance = index * PAGE_FRAME_SIZE;
            let bytes = PAGE_FRAME_SIZE.min(self.length - advance);
            (self.base.add(index), advance, bytes)
        })
    }
}

impl fmt::Debug for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Mapping")
            .field("base", &self.base)
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct MappingTable {
    mappings: BTreeMap<MapId, Mapping>,
    next_id: u32,
}

impl MappingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `mapping` under a fresh id. Ids are never reused within a process.
    pub fn insert(&mut self, mapping: Mapping) -> MapId {
        let id = MapId(self.next_id);
        self.next_id += 1;
        self.mappings.insert(id, mapping);
        id
    }

    pub fn get(&self, id: MapId) -> Option<&Mapping> {
        self.mappings.get(&id)
    }

    pub fn remove(&mut self, id: MapId) -> Option<Mapping> {
        self.mappings.remove(&id)
    }

    pub fn ids(&self) -> Vec<MapId> {
        self.mappings.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}
