pub mod placement_algorithms;

use alloc::boxed::Box;
use alloc::vec;
use bitbybit::bitfield;
use core::fmt;
use placement_algorithms::{NextFit, PlacementAlgorithm};
use vmkern_shared::mem::PAGE_FRAME_SIZE;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// The contents of one physical frame.
#[derive(FromZeroes, FromBytes, AsBytes)]
#[repr(transparent)]
pub struct Page(pub [u8; PAGE_FRAME_SIZE]);

/// Index of a frame in the user pool. Stable for as long as the frame stays allocated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(pub usize);

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "frame {}", self.0)
    }
}

#[bitfield(u8, default = 0)]
pub struct CoreMapEntry {
    #[bit(0, rw)]
    allocated: bool,
    #[bit(1, rw)]
    zeroed: bool,
}

/// The pool of physical frames available to user processes.
pub struct FrameAllocator<P: PlacementAlgorithm = NextFit> {
    frames: Box<[Page]>,
    core_map: Box<[CoreMapEntry]>,
    placement: P,
    frames_allocated: usize,
}

impl FrameAllocator {
    pub fn new(num_frames: usize) -> Self {
        Self {
            frames: Page::new_box_slice_zeroed(num_frames),
            // Fresh frames are already zero, so the first zero-filled request for each one can
            // skip the memset.
            core_map: vec![CoreMapEntry::DEFAULT.with_zeroed(true); num_frames].into_boxed_slice(),
            placement: NextFit::default(),
            frames_allocated: 0,
        }
    }
}

impl<P: PlacementAlgorithm> FrameAllocator<P> {
    /// Allocates one frame, filling it with zeroes if `zero_fill` is set.
    ///
    /// Returns `None` when every frame is in use.
    pub fn alloc(&mut self, zero_fill: bool) -> Option<FrameId> {
        let index = self.placement.place(&self.core_map)?;
        let entry = self.core_map[index];
        assert!(!entry.allocated());

        if zero_fill && !entry.zeroed() {
            self.frames[index].zero();
        }
        self.core_map[index] = entry.with_allocated(true).with_zeroed(false);
        self.frames_allocated += 1;

        Some(FrameId(index))
    }

    /// Returns a frame to the pool.
    pub fn dealloc(&mut self, frame: FrameId) {
        let entry = self.core_map[frame.0];
        assert!(entry.allocated(), "double free of {frame}");
        self.core_map[frame.0] = entry.with_allocated(false);
        self.frames_allocated -= 1;
    }

    pub fn is_allocated(&self, frame: FrameId) -> bool {
        self.core_map
            .get(frame.0)
            .is_some_and(|entry| entry.allocated())
    }

    pub fn page(&self, frame: FrameId) -> &Page {
        debug_assert!(self.is_allocated(frame));
        &self.frames[frame.0]
    }

    pub fn page_mut(&mut self, frame: FrameId) -> &mut Page {
        debug_assert!(self.is_allocated(frame));
        &mut self.frames[frame.0]
    }

    pub fn capacity(&self) -> usize {
        self.core_map.len()
    }

    pub fn allocated(&self) -> usize {
        self.frames_allocated
    }
}
