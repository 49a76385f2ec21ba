//! The virtual-memory engine.
//!
//! [`Vm`] resolves page faults for user processes: it loads pages lazily from files, grows the
//! user stack, pushes pages out to swap when the frame pool runs dry and brings them back on the
//! next access. The fault handler and system-call layer call into it with a faulting address;
//! they decide what to do with a process once an operation comes back fatal.
//!
//! Lock order is the frame table, then the faulting process, then the owner of an eviction victim,
//! then the swap store. Operations that never touch a frame take only the process lock. Nobody
//! waits for the frame table while holding a process lock, so eviction can always wait for the
//! owner of its victim.

pub mod address_space;
pub mod frame_table;
pub mod mmap;
pub mod page_replacement;
pub mod sup_page;
pub mod swap;

pub use address_space::{AddressSpace, Pid, ProcessVm};
pub use mmap::MapId;
pub use page_replacement::{OldestFirst, PageReplacementPolicy};
pub use sup_page::{LazyPage, PageState};
pub use swap::SwapSlot;

use crate::block::Block;
use crate::config::VmConfig;
use crate::error::VmError;
use crate::file::FileHandle;
use crate::mem::{FrameId, Page};
use crate::paging::VirtPage;
use crate::sync::mutex::{Mutex, MutexGuard};
use address_space::ProcessRegistry;
use alloc::collections::BTreeSet;
use alloc::{boxed::Box, sync::Arc};
use frame_table::{EvictionContext, FrameTable};
use log::{debug, info, trace, warn};
use mmap::{Mapping, MappingTable};
use sup_page::{FileBacking, PageEntry};
use swap::SwapStore;
use vmkern_shared::mem::{page_offset, PAGE_FRAME_SIZE};

/// What became of a page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The page is mapped; the faulting instruction can be restarted.
    Resolved,
    /// No page is reserved at the address.
    NotManaged,
    /// The process cannot continue.
    Fatal(VmError),
}

/// A program segment to be loaded on demand.
#[derive(Clone)]
pub struct Segment {
    pub file: FileHandle,
    /// Page-aligned offset of the segment in `file`.
    pub offset: usize,
    /// Page-aligned user address the segment starts at.
    pub vaddr: usize,
    pub read_bytes: usize,
    pub zero_bytes: usize,
    pub writable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmStats {
    pub frames_in_use: usize,
    pub frames_total: usize,
    pub swap_slots_in_use: usize,
    pub swap_slots_total: usize,
    pub evictions: u64,
}

pub struct Vm {
    config: VmConfig,
    frames: Mutex<FrameTable>,
    swap: Mutex<SwapStore>,
    processes: ProcessRegistry,
}

/// The frame table and one address space, locked in that order.
type FaultLocks<'a> = (MutexGuard<'a, FrameTable>, MutexGuard<'a, ProcessVm>);

impl Vm {
    /// Builds an engine that evicts the oldest frame first.
    pub fn new(config: VmConfig, swap_device: Block) -> Self {
        Self::with_policy(config, swap_device, OldestFirst)
    }

    pub fn with_policy<P: PageReplacementPolicy + 'static>(
        config: VmConfig,
        swap_device: Block,
        policy: P,
    ) -> Self {
        info!(
            "vm: {} user frames, stack floor {:#010x}",
            config.frame_count, config.stack_floor
        );
        Self {
            config,
            frames: Mutex::new(FrameTable::new(config.frame_count, Box::new(policy))),
            swap: Mutex::new(SwapStore::new(swap_device)),
            processes: ProcessRegistry::new(),
        }
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    fn eviction_context<'a>(&'a self, vm: &'a mut ProcessVm) -> EvictionContext<'a> {
        EvictionContext {
            current: vm,
            processes: &self.processes,
            swap: &self.swap,
        }
    }

    /// Locks `space` for an operation that never touches a frame.
    fn lock_live<'a>(
        &self,
        space: &'a AddressSpace,
    ) -> Result<MutexGuard<'a, ProcessVm>, VmError> {
        let vm = space.lock();
        if vm.is_torn_down() {
            return Err(VmError::TornDown(vm.pid()));
        }
        Ok(vm)
    }

    /// Locks the frame table, then `space`. Every path that may allocate or free a frame goes
    /// through here, so no thread ever waits for the frame table while holding a process lock.
    fn lock_for_frames<'a>(&'a self, space: &'a AddressSpace) -> Result<FaultLocks<'a>, VmError> {
        let frames = self.frames.lock();
        let vm = self.lock_live(space)?;
        Ok((frames, vm))
    }

    fn check_user_addr(&self, addr: usize) -> Result<VirtPage, VmError> {
        if addr >= self.config.user_limit {
            return Err(VmError::BadAddress(addr));
        }
        Ok(VirtPage::containing(addr))
    }

    fn check_user_page(&self, addr: usize) -> Result<VirtPage, VmError> {
        VirtPage::from_aligned(addr).ok_or(VmError::BadAddress(addr))?;
        self.check_user_addr(addr)
    }

    /// Creates and registers an empty address space.
    pub fn create_process(&self) -> Arc<AddressSpace> {
        let space = self.processes.create();
        debug!("pid {}: address space created", space.pid());
        space
    }

    /// Records the user stack pointer saved on kernel entry, for stack growth decisions.
    pub fn set_stack_pointer(&self, space: &AddressSpace, sp: usize) {
        space.lock().stack_pointer = sp;
    }

    /// Reserves the page at `vaddr`, to be filled from `page.file` on first access.
    pub fn reserve_lazy(
        &self,
        space: &AddressSpace,
        vaddr: usize,
        page: LazyPage,
    ) -> Result<(), VmError> {
        let upage = self.check_user_page(vaddr)?;
        if page.read_bytes + page.zero_bytes != PAGE_FRAME_SIZE {
            return Err(VmError::InvalidRange);
        }
        self.lock_live(space)?
            .spt
            .reserve(upage, PageEntry::LazyLoad(page))
    }

    /// Reserves every page of `segment`. Nothing is read until the pages are touched.
    ///
    /// If any page is already reserved, the pages reserved by this call are dropped again.
    pub fn load_segment(&self, space: &AddressSpace, segment: &Segment) -> Result<(), VmError> {
        let total = segment.read_bytes + segment.zero_bytes;
        if total % PAGE_FRAME_SIZE != 0 || segment.offset % PAGE_FRAME_SIZE != 0 {
            return Err(VmError::InvalidRange);
        }
        let base = self.check_user_page(segment.vaddr)?;
        let pages = total / PAGE_FRAME_SIZE;
        let end = segment
            .vaddr
            .checked_add(total)
            .ok_or(VmError::InvalidRange)?;
        if end > self.config.user_limit {
            return Err(VmError::InvalidRange);
        }

        let mut vm = self.lock_live(space)?;
        let mut read_left = segment.read_bytes;
        for index in 0..pages {
            let read_bytes = read_left.min(PAGE_FRAME_SIZE);
            let reserved = vm.spt.reserve(
                base.add(index),
                PageEntry::LazyLoad(LazyPage {
                    file: segment.file.clone(),
                    offset: segment.offset + index * PAGE_FRAME_SIZE,
                    read_bytes,
                    zero_bytes: PAGE_FRAME_SIZE - read_bytes,
                    writable: segment.writable,
                }),
            );
            if let Err(err) = reserved {
                for earlier in 0..index {
                    vm.spt.remove(base.add(earlier));
                }
                return Err(err);
            }
            read_left -= read_bytes;
        }
        debug!(
            "pid {}: segment of {pages} pages reserved at {base}",
            vm.pid()
        );
        Ok(())
    }

    /// Maps the page containing `vaddr` if a page is reserved there.
    pub fn resolve_fault(&self, space: &AddressSpace, vaddr: usize) -> FaultOutcome {
        let loaded = self.lock_for_frames(space).and_then(|(mut frames, mut vm)| {
            self.load_page(&mut frames, &mut vm, VirtPage::containing(vaddr))
        });
        match loaded {
            Ok(true) => FaultOutcome::Resolved,
            Ok(false) => FaultOutcome::NotManaged,
            Err(err) => {
                warn!("pid {}: fault at {vaddr:#010x}: {err}", space.pid());
                FaultOutcome::Fatal(err)
            }
        }
    }

    /// Brings the reserved page containing `vaddr` into memory.
    pub fn fault_in(&self, space: &AddressSpace, vaddr: usize) -> Result<(), VmError> {
        let upage = VirtPage::containing(vaddr);
        let (mut frames, mut vm) = self.lock_for_frames(space)?;
        if self.load_page(&mut frames, &mut vm, upage)? {
            Ok(())
        } else {
            Err(VmError::NotReserved(upage.addr()))
        }
    }

    /// The full fault path: resolve a reserved page, else grow the stack if the address looks
    /// like a push, else give up on the process.
    pub fn handle_page_fault(&self, space: &AddressSpace, vaddr: usize) -> FaultOutcome {
        let handled = self
            .lock_for_frames(space)
            .and_then(|(mut frames, mut vm)| self.fault_or_grow(&mut frames, &mut vm, vaddr));
        match handled {
            Ok(()) => FaultOutcome::Resolved,
            Err(err) => {
                warn!("pid {}: fault at {vaddr:#010x}: {err}", space.pid());
                FaultOutcome::Fatal(err)
            }
        }
    }

    fn fault_or_grow(
        &self,
        frames: &mut FrameTable,
        vm: &mut ProcessVm,
        vaddr: usize,
    ) -> Result<(), VmError> {
        let upage = VirtPage::containing(vaddr);
        if self.load_page(frames, vm, upage)? {
            return Ok(());
        }
        if !self.is_plausible_stack_growth(vaddr, vm.stack_pointer) {
            return Err(VmError::BadAddress(vaddr));
        }
        self.grow_stack_page(frames, vm, upage)
    }

    /// Returns `Ok(false)` if nothing is reserved at `upage`.
    fn load_page(
        &self,
        frames: &mut FrameTable,
        vm: &mut ProcessVm,
        upage: VirtPage,
    ) -> Result<bool, VmError> {
        let Some(entry) = vm.spt.get(upage) else {
            return Ok(false);
        };
        match entry.clone() {
            PageEntry::Resident { frame, .. } => {
                assert_eq!(
                    vm.page_dir.get_mapping(upage.addr()),
                    Some(frame),
                    "resident {upage} is not mapped to {frame}"
                );
            }
            PageEntry::LazyLoad(lazy) => self.load_lazy(frames, vm, upage, &lazy)?,
            PageEntry::Evicted {
                slot,
                writable,
                dirty,
                ..
            } => self.reclaim(frames, vm, upage, slot, writable, dirty)?,
        }
        trace!("pid {}: {upage} resident", vm.pid());
        Ok(true)
    }

    fn load_lazy(
        &self,
        frames: &mut FrameTable,
        vm: &mut ProcessVm,
        upage: VirtPage,
        lazy: &LazyPage,
    ) -> Result<(), VmError> {
        let addr = upage.addr();
        let frame = frames.allocate(false, &mut self.eviction_context(vm))?;

        if let Err(err) = fill_from_file(frames.page_mut(frame), lazy) {
            frames.release(frame);
            return Err(err);
        }
        assert!(
            vm.page_dir.set_mapping(addr, frame, lazy.writable),
            "{upage} is mapped without being resident"
        );
        frames.bind(frame, vm.pid(), upage, vm.page_dir.locate(addr));
        vm.spt.mark_resident(upage, frame);
        frames.unlock(frame);
        Ok(())
    }

    /// Reads an evicted page back from `slot`.
    fn reclaim(
        &self,
        frames: &mut FrameTable,
        vm: &mut ProcessVm,
        upage: VirtPage,
        slot: SwapSlot,
        writable: bool,
        dirty: bool,
    ) -> Result<(), VmError> {
        let addr = upage.addr();
        let frame = frames.allocate(false, &mut self.eviction_context(vm))?;
        assert!(
            vm.page_dir.set_mapping(addr, frame, writable),
            "{upage} is mapped while evicted"
        );
        frames.bind(frame, vm.pid(), upage, vm.page_dir.locate(addr));

        let read = self.swap.lock().read_page(slot, frames.page_mut(frame));
        if let Err(err) = read {
            vm.page_dir.clear_mapping(addr);
            frames.release(frame);
            return Err(err);
        }
        vm.page_dir.set_dirty(addr, dirty);
        vm.spt.mark_resident(upage, frame);
        frames.unlock(frame);
        debug!("pid {}: reclaimed {upage} from {slot}", vm.pid());
        Ok(())
    }

    /// Whether a fault at `vaddr` with the stack pointer at `sp` should grow the stack.
    pub fn is_plausible_stack_growth(&self, vaddr: usize, sp: usize) -> bool {
        vaddr >= self.config.stack_floor
            && vaddr < self.config.user_limit
            && vaddr.saturating_add(self.config.stack_slack) >= sp
    }

    /// Backs the page containing `vaddr` with a fresh zeroed stack page.
    pub fn grow_stack(&self, space: &AddressSpace, vaddr: usize) -> Result<(), VmError> {
        let (mut frames, mut vm) = self.lock_for_frames(space)?;
        if !self.is_plausible_stack_growth(vaddr, vm.stack_pointer) {
            return Err(VmError::StackRejected(vaddr));
        }
        self.grow_stack_page(&mut frames, &mut vm, VirtPage::containing(vaddr))
    }

    fn grow_stack_page(
        &self,
        frames: &mut FrameTable,
        vm: &mut ProcessVm,
        upage: VirtPage,
    ) -> Result<(), VmError> {
        let addr = upage.addr();
        if vm.spt.contains(upage) {
            return Err(VmError::AlreadyReserved(addr));
        }
        let frame = frames.allocate(true, &mut self.eviction_context(vm))?;
        assert!(
            vm.page_dir.set_mapping(addr, frame, true),
            "{upage} is mapped without a supplemental entry"
        );
        frames.bind(frame, vm.pid(), upage, vm.page_dir.locate(addr));
        let reserved = vm.spt.reserve(
            upage,
            PageEntry::Resident {
                frame,
                writable: true,
                backing: None,
            },
        );
        if let Err(err) = reserved {
            vm.page_dir.clear_mapping(addr);
            frames.release(frame);
            return Err(err);
        }
        frames.unlock(frame);
        debug!("pid {}: stack grown to {upage}", vm.pid());
        Ok(())
    }

    /// Drops the page at `vaddr`. A dirty file-backed page first has `byte_count` bytes written
    /// back to its file at `file_offset`.
    ///
    /// On failure the page stays reserved.
    pub fn unmap(
        &self,
        space: &AddressSpace,
        vaddr: usize,
        file_offset: usize,
        byte_count: usize,
    ) -> Result<(), VmError> {
        let upage = self.check_user_addr(vaddr)?;
        if byte_count > PAGE_FRAME_SIZE {
            return Err(VmError::InvalidRange);
        }
        let (mut frames, mut vm) = self.lock_for_frames(space)?;
        self.unmap_page(&mut frames, &mut vm, upage, file_offset, byte_count)
    }

    fn unmap_page(
        &self,
        frames: &mut FrameTable,
        vm: &mut ProcessVm,
        upage: VirtPage,
        file_offset: usize,
        byte_count: usize,
    ) -> Result<(), VmError> {
        let addr = upage.addr();
        let entry = vm
            .spt
            .get(upage)
            .cloned()
            .ok_or(VmError::NotReserved(addr))?;

        match entry {
            PageEntry::LazyLoad(_) => {}
            PageEntry::Resident { frame, backing, .. } => {
                assert_eq!(
                    vm.page_dir.get_mapping(addr),
                    Some(frame),
                    "resident {upage} is not mapped to {frame}"
                );
                if let Some(backing) = backing.filter(|_| vm.page_dir.is_dirty(addr)) {
                    write_back(frames.page(frame), &backing, file_offset, byte_count)?;
                }
                frames.release(frame);
                vm.page_dir.clear_mapping(addr);
            }
            PageEntry::Evicted {
                slot,
                writable,
                dirty,
                backing,
            } => {
                if backing.is_some() && (dirty || vm.page_dir.is_dirty(addr)) {
                    // The dirty contents only exist in swap; bring them back and write them out
                    // as a resident page.
                    self.reclaim(frames, vm, upage, slot, writable, true)?;
                    return self.unmap_page(frames, vm, upage, file_offset, byte_count);
                }
                self.swap.lock().free_slot(slot);
            }
        }

        vm.spt.remove(upage);
        debug!("pid {}: unmapped {upage}", vm.pid());
        Ok(())
    }

    /// Maps all of `file` at `addr`, one writable lazy page per file page.
    pub fn mmap(
        &self,
        space: &AddressSpace,
        file: &FileHandle,
        addr: usize,
    ) -> Result<MapId, VmError> {
        if addr == 0 {
            return Err(VmError::BadAddress(addr));
        }
        let base = self.check_user_page(addr)?;
        let length = file.len();
        if length == 0 {
            return Err(VmError::InvalidRange);
        }
        let mapping = Mapping {
            file: file.reopen(),
            base,
            length,
        };
        let end = addr
            .checked_add(mapping.page_count() * PAGE_FRAME_SIZE)
            .ok_or(VmError::InvalidRange)?;
        if end > self.config.user_limit {
            return Err(VmError::InvalidRange);
        }

        let mut vm = self.lock_live(space)?;
        if let Some((page, _, _)) = mapping.pages().find(|(page, _, _)| vm.spt.contains(*page)) {
            return Err(VmError::AlreadyReserved(page.addr()));
        }
        for (page, advance, bytes) in mapping.pages() {
            vm.spt.reserve(
                page,
                PageEntry::LazyLoad(LazyPage {
                    file: mapping.file.clone(),
                    offset: advance,
                    read_bytes: bytes,
                    zero_bytes: PAGE_FRAME_SIZE - bytes,
                    writable: true,
                }),
            )?;
        }
        let id = vm.mappings.insert(mapping);
        debug!(
            "pid {}: mapping {id} covers {length} bytes at {base}",
            vm.pid()
        );
        Ok(id)
    }

    /// Unmaps every page of mapping `id`, writing dirty pages back to the file.
    pub fn munmap(&self, space: &AddressSpace, id: MapId) -> Result<(), VmError> {
        let (mut frames, mut vm) = self.lock_for_frames(space)?;
        self.munmap_locked(&mut frames, &mut vm, id)
    }

    fn munmap_locked(
        &self,
        frames: &mut FrameTable,
        vm: &mut ProcessVm,
        id: MapId,
    ) -> Result<(), VmError> {
        let mapping = vm
            .mappings
            .get(id)
            .cloned()
            .ok_or(VmError::UnknownMapping(id))?;
        for (page, advance, bytes) in mapping.pages() {
            // Pages unmapped by an earlier, interrupted call are already gone.
            if vm.spt.contains(page) {
                self.unmap_page(frames, vm, page, advance, bytes)?;
            }
        }
        vm.mappings.remove(id);
        Ok(())
    }

    /// Frees every page, frame and swap slot of an exiting process without writing anything
    /// back. Later operations on the address space fail with [`VmError::TornDown`].
    pub fn teardown(&self, space: Arc<AddressSpace>) {
        let mut frames = self.frames.lock();
        let mut guard = space.lock();
        let vm = &mut *guard;
        let pid = vm.pid();
        if vm.is_torn_down() {
            return;
        }
        let mut swap = self.swap.lock();

        for (upage, entry) in vm.spt.drain() {
            match entry {
                PageEntry::LazyLoad(_) => {}
                PageEntry::Resident { frame, .. } => {
                    vm.page_dir.clear_mapping(upage.addr());
                    frames.release(frame);
                }
                PageEntry::Evicted { slot, .. } => swap.free_slot(slot),
            }
        }
        let stray = frames.release_owned_by(pid);
        if stray != 0 {
            warn!("pid {pid}: released {stray} frames with no supplemental entry");
        }
        drop(swap);

        vm.mappings = MappingTable::new();
        vm.mark_torn_down();
        self.processes.unregister(pid);
        debug!("pid {pid}: address space torn down");
    }

    /// Unmaps every mapping with write-back, then tears the process down. The first write-back
    /// failure is reported after teardown completes.
    pub fn exit_process(&self, space: Arc<AddressSpace>) -> Result<(), VmError> {
        let mut result = Ok(());
        {
            let (mut frames, mut vm) = self.lock_for_frames(&space)?;
            for id in vm.mappings.ids() {
                if let Err(err) = self.munmap_locked(&mut frames, &mut vm, id) {
                    warn!("pid {}: write-back of mapping {id} failed: {err}", vm.pid());
                    result = result.and(Err(err));
                }
            }
        }
        self.teardown(space);
        result
    }

    /// Copies user memory at `vaddr` into `buf`, faulting pages in as the MMU would.
    pub fn read_user(
        &self,
        space: &AddressSpace,
        vaddr: usize,
        buf: &mut [u8],
    ) -> Result<(), VmError> {
        self.access_user(space, vaddr, buf.len(), false, |page, range, done| {
            let len = range.len();
            buf[done..done + len].copy_from_slice(&page.0[range]);
        })
    }

    /// Copies `data` into user memory at `vaddr`. Read-only pages are refused.
    pub fn write_user(
        &self,
        space: &AddressSpace,
        vaddr: usize,
        data: &[u8],
    ) -> Result<(), VmError> {
        self.access_user(space, vaddr, data.len(), true, |page, range, done| {
            let len = range.len();
            page.0[range].copy_from_slice(&data[done..done + len]);
        })
    }

    fn access_user(
        &self,
        space: &AddressSpace,
        vaddr: usize,
        len: usize,
        write: bool,
        mut copy: impl FnMut(&mut Page, core::ops::Range<usize>, usize),
    ) -> Result<(), VmError> {
        let end = vaddr.checked_add(len).ok_or(VmError::BadAddress(vaddr))?;
        if end > self.config.user_limit {
            return Err(VmError::BadAddress(vaddr));
        }

        let (mut frames, mut guard) = self.lock_for_frames(space)?;
        let vm = &mut *guard;
        let mut cursor = vaddr;
        while cursor < end {
            let offset = page_offset(cursor);
            let chunk = (PAGE_FRAME_SIZE - offset).min(end - cursor);

            if vm.page_dir.get_mapping(cursor).is_none() {
                self.fault_or_grow(&mut frames, vm, cursor)?;
            }
            let frame = resident_frame(vm, cursor);
            if write && !vm.page_dir.is_writable(cursor) {
                return Err(VmError::ReadOnly(cursor));
            }

            copy(
                frames.page_mut(frame),
                offset..offset + chunk,
                cursor - vaddr,
            );
            vm.page_dir.set_accessed(cursor, true);
            if write {
                vm.page_dir.set_dirty(cursor, true);
            }
            cursor += chunk;
        }
        Ok(())
    }

    pub fn page_state(&self, space: &AddressSpace, vaddr: usize) -> Option<PageState> {
        space.lock().spt.state(VirtPage::containing(vaddr))
    }

    pub fn stats(&self) -> VmStats {
        let frames = self.frames.lock();
        let swap = self.swap.lock();
        VmStats {
            frames_in_use: frames.in_use(),
            frames_total: frames.capacity(),
            swap_slots_in_use: swap.used_slots(),
            swap_slots_total: swap.slot_count(),
            evictions: frames.evictions(),
        }
    }

    /// Checks the bookkeeping of `space` against the frame table and swap store.
    ///
    /// # Panics
    ///
    /// Panics if a page is in more than one place at once, or two pages share a frame or slot.
    pub fn audit(&self, space: &AddressSpace) {
        let frames = self.frames.lock();
        let vm = space.lock();
        let swap = self.swap.lock();
        let mut seen_frames = BTreeSet::new();
        let mut seen_slots = BTreeSet::new();

        for (upage, entry) in vm.spt.iter() {
            let mapping = vm.page_dir.get_mapping(upage.addr());
            match entry {
                PageEntry::LazyLoad(_) => {
                    assert_eq!(mapping, None, "lazy {upage} is mapped");
                }
                PageEntry::Resident { frame, .. } => {
                    assert_eq!(mapping, Some(*frame), "resident {upage} is not mapped");
                    let owner = frames
                        .frame(*frame)
                        .and_then(|record| record.owner())
                        .unwrap_or_else(|| panic!("{frame} of {upage} is not bound"));
                    assert_eq!((owner.pid, owner.upage), (vm.pid(), upage));
                    assert_eq!(owner.pte, vm.page_dir.locate(upage.addr()));
                    assert!(seen_frames.insert(*frame), "{frame} backs two pages");
                }
                PageEntry::Evicted { slot, .. } => {
                    assert_eq!(mapping, None, "evicted {upage} is mapped");
                    assert!(swap.is_used(*slot), "{upage} points at free {slot}");
                    assert!(seen_slots.insert(*slot), "{slot} holds two pages");
                }
            }
        }
        for (upage, _) in vm.page_dir.mapped_pages() {
            assert_eq!(
                vm.spt.state(upage),
                Some(PageState::Resident),
                "{upage} is mapped but not resident"
            );
        }
    }
}

fn resident_frame(vm: &ProcessVm, addr: usize) -> FrameId {
    vm.page_dir
        .get_mapping(addr)
        .unwrap_or_else(|| panic!("{addr:#010x} is not mapped after a fault"))
}

fn fill_from_file(page: &mut Page, lazy: &LazyPage) -> Result<(), VmError> {
    if lazy.read_bytes > PAGE_FRAME_SIZE {
        return Err(VmError::InvalidRange);
    }
    lazy.file.seek(lazy.offset);
    let read = lazy.file.read(&mut page.0[..lazy.read_bytes])?;
    if read != lazy.read_bytes {
        return Err(VmError::ShortRead {
            expected: lazy.read_bytes,
            actual: read,
        });
    }
    page.0[lazy.read_bytes..].fill(0);
    Ok(())
}

fn write_back(
    page: &Page,
    backing: &FileBacking,
    file_offset: usize,
    byte_count: usize,
) -> Result<(), VmError> {
    let written = backing.file.write_at(&page.0[..byte_count], file_offset)?;
    if written != byte_count {
        trace!("write-back at offset {file_offset} stopped at end of file after {written} bytes");
    }
    Ok(())
}
