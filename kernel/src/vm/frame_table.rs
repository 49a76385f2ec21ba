//! The frame table: which user frames are in use, who owns them, and which one to give up when
//! the pool runs dry.

use super::address_space::{Pid, ProcessRegistry, ProcessVm};
use super::page_replacement::{PageReplacementPolicy, VictimCandidate};
use super::swap::SwapStore;
use crate::error::VmError;
use crate::mem::{FrameAllocator, FrameId, Page};
use crate::paging::VirtPage;
use crate::sync::mutex::Mutex;
use alloc::{boxed::Box, vec, vec::Vec};
use log::{debug, info, warn};
use vmkern_shared::paging::PteLocation;

/// The virtual page a frame backs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameOwner {
    pub pid: Pid,
    pub upage: VirtPage,
    pub pte: PteLocation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    owner: Option<FrameOwner>,
    created: u64,
    locked: bool,
}

impl Frame {
    /// `None` until the frame has been bound to a page.
    pub fn owner(&self) -> Option<FrameOwner> {
        self.owner
    }

    pub fn created(&self) -> u64 {
        self.created
    }

    /// Locked frames are never chosen for eviction.
    pub fn is_locked(&self) -> bool {
        self.locked
    }
}

/// What eviction needs from the caller: the faulting process, lent because its lock is already
/// held, and a way to reach every other process.
///
/// The caller holds the frame table, so no other thread can be waiting on it while holding a
/// process lock. Eviction may therefore block on the owner of a victim.
pub struct EvictionContext<'a> {
    pub current: &'a mut ProcessVm,
    pub processes: &'a ProcessRegistry,
    pub swap: &'a Mutex<SwapStore>,
}

pub struct FrameTable {
    pool: FrameAllocator,
    frames: Vec<Option<Frame>>,
    policy: Box<dyn PageReplacementPolicy>,
    ticks: u64,
    evictions: u64,
}

impl FrameTable {
    pub fn new(frame_count: usize, policy: Box<dyn PageReplacementPolicy>) -> Self {
        info!("frame table: {frame_count} user frames");
        Self {
            pool: FrameAllocator::new(frame_count),
            frames: vec![None; frame_count],
            policy,
            ticks: 0,
            evictions: 0,
        }
    }

    /// Hands out a frame, evicting one other frame if the pool is empty.
    ///
    /// The frame comes back locked and unbound; the caller must [`bind`](Self::bind) and
    /// [`unlock`](Self::unlock) it once the page is installed. Eviction is attempted at most once.
    pub fn allocate(
        &mut self,
        zero_fill: bool,
        ctx: &mut EvictionContext,
    ) -> Result<FrameId, VmError> {
        if let Some(frame) = self.pool.alloc(zero_fill) {
            return Ok(self.track(frame));
        }
        self.evict_one(ctx)?;
        let frame = self.pool.alloc(zero_fill).ok_or(VmError::OutOfMemory)?;
        Ok(self.track(frame))
    }

    fn track(&mut self, frame: FrameId) -> FrameId {
        self.ticks += 1;
        self.frames[frame.0] = Some(Frame {
            owner: None,
            created: self.ticks,
            locked: true,
        });
        frame
    }

    fn record_mut(&mut self, frame: FrameId) -> &mut Frame {
        self.frames[frame.0]
            .as_mut()
            .unwrap_or_else(|| panic!("{frame} is not in the frame table"))
    }

    /// Records that `frame` backs `upage` of process `pid` through the entry at `pte`.
    pub fn bind(&mut self, frame: FrameId, pid: Pid, upage: VirtPage, pte: PteLocation) {
        self.record_mut(frame).owner = Some(FrameOwner { pid, upage, pte });
    }

    pub fn lock(&mut self, frame: FrameId) {
        self.record_mut(frame).locked = true;
    }

    pub fn unlock(&mut self, frame: FrameId) {
        self.record_mut(frame).locked = false;
    }

    /// Returns `frame` to the pool and forgets its record.
    ///
    /// # Panics
    ///
    /// Panics if `frame` is not in use.
    pub fn release(&mut self, frame: FrameId) {
        assert!(
            self.frames[frame.0].take().is_some(),
            "releasing {frame}, which is not in use"
        );
        self.pool.dealloc(frame);
    }

    /// Releases every frame bound to a page of `pid`. Returns how many there were.
    pub fn release_owned_by(&mut self, pid: Pid) -> usize {
        let owned: Vec<_> = self
            .frames
            .iter()
            .enumerate()
            .filter(|(_, record)| {
                record
                    .and_then(|record| record.owner)
                    .is_some_and(|owner| owner.pid == pid)
            })
            .map(|(index, _)| FrameId(index))
            .collect();
        for &frame in &owned {
            self.release(frame);
        }
        owned.len()
    }

    pub fn frame(&self, frame: FrameId) -> Option<&Frame> {
        self.frames.get(frame.0)?.as_ref()
    }

    pub fn page(&self, frame: FrameId) -> &Page {
        self.pool.page(frame)
    }

    pub fn page_mut(&mut self, frame: FrameId) -> &mut Page {
        self.pool.page_mut(frame)
    }

    pub fn in_use(&self) -> usize {
        self.pool.allocated()
    }

    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    /// Frees one frame by pushing its page out to swap.
    ///
    /// The victim is the first bound, unlocked frame in policy order. If its owner is still being
    /// used elsewhere, this waits for the owner's lock. If the owner has been dropped, every frame
    /// it left behind is reclaimed without a swap write.
    fn evict_one(&mut self, ctx: &mut EvictionContext) -> Result<(), VmError> {
        let mut candidates: Vec<_> = self
            .frames
            .iter()
            .enumerate()
            .filter_map(|(index, record)| {
                let record = record.as_ref()?;
                (record.owner.is_some() && !record.locked).then_some(VictimCandidate {
                    frame: FrameId(index),
                    created: record.created,
                })
            })
            .collect();
        self.policy.rank(&mut candidates);

        let victim = candidates.first().and_then(|candidate| {
            let owner = self.frames[candidate.frame.0].as_ref()?.owner?;
            Some((candidate.frame, owner))
        });
        let Some((frame, owner)) = victim else {
            warn!("no frame can be evicted");
            return Err(VmError::OutOfMemory);
        };

        if owner.pid == ctx.current.pid() {
            return self.evict(frame, owner, ctx.current, ctx.swap);
        }
        let Some(space) = ctx.processes.get(owner.pid) else {
            let released = self.release_owned_by(owner.pid);
            ctx.processes.unregister(owner.pid);
            debug!("reclaimed {released} frames left behind by pid {}", owner.pid);
            return Ok(());
        };
        let mut vm = space.lock();
        self.evict(frame, owner, &mut vm, ctx.swap)
    }

    fn evict(
        &mut self,
        frame: FrameId,
        owner: FrameOwner,
        vm: &mut ProcessVm,
        swap: &Mutex<SwapStore>,
    ) -> Result<(), VmError> {
        let addr = owner.upage.addr();
        assert_eq!(
            vm.page_dir.get_mapping(addr),
            Some(frame),
            "{} is not mapped to {frame}",
            owner.upage
        );

        self.lock(frame);
        let written = swap.lock().write_page(self.pool.page(frame));
        let slot = match written {
            Ok(slot) => slot,
            Err(err) => {
                self.unlock(frame);
                warn!("evicting {frame} failed: {err}");
                return Err(err);
            }
        };

        let dirty = vm.page_dir.is_dirty(addr);
        vm.spt.mark_evicted(owner.upage, slot, dirty);
        vm.page_dir.clear_mapping(addr);
        self.release(frame);
        self.evictions += 1;
        debug!(
            "evicted {} of pid {} from {frame} to {slot}",
            owner.upage, owner.pid
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{Block, BlockSector, BlockType, MemDisk};
    use crate::vm::address_space::AddressSpace;
    use crate::vm::page_replacement::OldestFirst;
    use crate::vm::sup_page::{PageEntry, PageState};
    use crate::vm::swap::{SwapSlot, SECTORS_PER_PAGE};
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicBool, Ordering};
    use core::time::Duration;
    use std::thread;
    use zerocopy::FromZeroes;

    const BASE: VirtPage = VirtPage::containing(0x0804_8000);

    struct Fixture {
        frames: FrameTable,
        processes: ProcessRegistry,
        swap: Mutex<SwapStore>,
    }

    impl Fixture {
        fn new(frame_count: usize, swap_slots: usize) -> Self {
            let sectors = (swap_slots * SECTORS_PER_PAGE) as BlockSector;
            Self {
                frames: FrameTable::new(frame_count, Box::new(OldestFirst)),
                processes: ProcessRegistry::new(),
                swap: Mutex::new(SwapStore::new(Block::new(
                    "swap",
                    BlockType::Swap,
                    sectors,
                    Box::new(MemDisk::new(sectors)),
                ))),
            }
        }

        fn space(&self) -> Arc<AddressSpace> {
            self.processes.create()
        }

        /// Backs `upage` of `vm` with a fresh frame filled with `fill`.
        fn map(
            &mut self,
            vm: &mut ProcessVm,
            upage: VirtPage,
            fill: u8,
        ) -> Result<FrameId, VmError> {
            let mut ctx = EvictionContext {
                current: &mut *vm,
                processes: &self.processes,
                swap: &self.swap,
            };
            let frame = self.frames.allocate(false, &mut ctx)?;
            assert!(vm.page_dir.set_mapping(upage.addr(), frame, true));
            self.frames.page_mut(frame).0.fill(fill);
            let pte = vm.page_dir.locate(upage.addr());
            self.frames.bind(frame, vm.pid(), upage, pte);
            self.frames.unlock(frame);
            Ok(frame)
        }
    }

    #[test]
    fn test_allocate_returns_locked_unbound_frame() {
        let mut fixture = Fixture::new(2, 2);
        let space = fixture.space();
        let mut vm = space.lock();
        let mut ctx = EvictionContext {
            current: &mut vm,
            processes: &fixture.processes,
            swap: &fixture.swap,
        };
        let frame = fixture.frames.allocate(true, &mut ctx).unwrap();
        let record = fixture.frames.frame(frame).unwrap();
        assert!(record.is_locked());
        assert_eq!(record.owner(), None);
        assert_eq!(fixture.frames.in_use(), 1);

        fixture.frames.bind(frame, 1, BASE, BASE.location());
        assert_eq!(
            fixture.frames.frame(frame).unwrap().owner(),
            Some(FrameOwner {
                pid: 1,
                upage: BASE,
                pte: BASE.location(),
            })
        );
    }

    #[test]
    fn test_exhausted_pool_evicts_oldest() {
        let mut fixture = Fixture::new(2, 4);
        let space = fixture.space();
        let mut vm = space.lock();
        let first = fixture.map(&mut vm, BASE, 0x11).unwrap();
        fixture.map(&mut vm, BASE.add(1), 0x22).unwrap();
        vm.page_dir.set_dirty(BASE.addr(), true);

        let third = fixture.map(&mut vm, BASE.add(2), 0x33).unwrap();
        assert_eq!(third, first);
        assert_eq!(fixture.frames.evictions(), 1);
        assert_eq!(vm.page_dir.get_mapping(BASE.addr()), None);

        // The page had no supplemental entry, so eviction created one.
        let Some(PageEntry::Evicted {
            slot,
            writable,
            dirty,
            ..
        }) = vm.spt.get(BASE)
        else {
            panic!("expected {BASE} to be evicted");
        };
        assert_eq!(*slot, SwapSlot(0));
        assert!(*writable);
        assert!(*dirty);

        let mut page = Page::new_box_zeroed();
        fixture.swap.lock().read_page(*slot, &mut page).unwrap();
        assert!(page.0.iter().all(|&b| b == 0x11));
    }

    #[test]
    fn test_evicting_resident_entry_keeps_metadata() {
        let mut fixture = Fixture::new(1, 1);
        let space = fixture.space();
        let mut vm = space.lock();
        let frame = fixture.map(&mut vm, BASE, 0).unwrap();
        vm.spt
            .reserve(
                BASE,
                PageEntry::Resident {
                    frame,
                    writable: false,
                    backing: None,
                },
            )
            .unwrap();

        fixture.map(&mut vm, BASE.add(1), 0).unwrap();
        let entry = vm.spt.get(BASE).unwrap();
        assert_eq!(entry.state(), PageState::Evicted);
        assert!(!entry.writable());
    }

    #[test]
    fn test_locked_frames_are_never_victims() {
        let mut fixture = Fixture::new(1, 1);
        let space = fixture.space();
        let mut vm = space.lock();
        let frame = fixture.map(&mut vm, BASE, 0).unwrap();
        fixture.frames.lock(frame);

        assert_eq!(
            fixture.map(&mut vm, BASE.add(1), 0),
            Err(VmError::OutOfMemory)
        );
        assert_eq!(fixture.frames.evictions(), 0);
        assert_eq!(vm.page_dir.get_mapping(BASE.addr()), Some(frame));
    }

    #[test]
    fn test_eviction_waits_for_busy_owner() {
        let mut fixture = Fixture::new(1, 1);
        let busy = fixture.space();
        fixture.map(&mut busy.lock(), BASE, 1).unwrap();
        let current = fixture.space();

        let held = AtomicBool::new(false);
        thread::scope(|scope| {
            scope.spawn(|| {
                let guard = busy.lock();
                held.store(true, Ordering::Release);
                thread::sleep(Duration::from_millis(50));
                drop(guard);
            });
            while !held.load(Ordering::Acquire) {
                thread::yield_now();
            }

            let frame = fixture.map(&mut current.lock(), BASE, 2).unwrap();
            assert_eq!(fixture.frames.page(frame).0[0], 2);
        });
        assert_eq!(fixture.frames.evictions(), 1);
        assert_eq!(busy.lock().spt.state(BASE), Some(PageState::Evicted));
    }

    #[test]
    fn test_frames_of_dropped_space_are_reclaimed_without_swap() {
        let mut fixture = Fixture::new(2, 1);
        let gone = fixture.space();
        fixture.map(&mut gone.lock(), BASE, 1).unwrap();
        fixture.map(&mut gone.lock(), BASE.add(1), 1).unwrap();
        let gone_pid = gone.pid();
        drop(gone);

        let current = fixture.space();
        fixture.map(&mut current.lock(), BASE, 2).unwrap();
        assert_eq!(fixture.swap.lock().used_slots(), 0);
        assert_eq!(fixture.frames.evictions(), 0);
        assert_eq!(fixture.frames.in_use(), 1);
        assert!(fixture.processes.get(gone_pid).is_none());
        assert_eq!(fixture.processes.len(), 1);
    }

    #[test]
    fn test_swap_full_fails_eviction() {
        let mut fixture = Fixture::new(1, 0);
        let space = fixture.space();
        let mut vm = space.lock();
        let frame = fixture.map(&mut vm, BASE, 1).unwrap();
        assert_eq!(
            fixture.map(&mut vm, BASE.add(1), 2),
            Err(VmError::SwapFull)
        );
        assert_eq!(vm.page_dir.get_mapping(BASE.addr()), Some(frame));
        assert!(!fixture.frames.frame(frame).unwrap().is_locked());
    }

    #[test]
    fn test_release_owned_by() {
        let mut fixture = Fixture::new(3, 1);
        let first = fixture.space();
        let second = fixture.space();
        fixture.map(&mut first.lock(), BASE, 0).unwrap();
        fixture.map(&mut first.lock(), BASE.add(1), 0).unwrap();
        fixture.map(&mut second.lock(), BASE, 0).unwrap();

        assert_eq!(fixture.frames.release_owned_by(1), 2);
        assert_eq!(fixture.frames.in_use(), 1);
        assert_eq!(fixture.frames.capacity(), 3);
    }

    #[test]
    #[should_panic(expected = "not in use")]
    fn test_double_release_panics() {
        let mut fixture = Fixture::new(1, 1);
        let space = fixture.space();
        let frame = fixture.map(&mut space.lock(), BASE, 0).unwrap();
        fixture.frames.release(frame);
        fixture.frames.release(frame);
    }
}
