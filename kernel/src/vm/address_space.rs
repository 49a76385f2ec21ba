use super::mmap::MappingTable;
use super::sup_page::SupplementalPageTable;
use crate::paging::PageDir;
use crate::sync::mutex::{Mutex, MutexGuard};
use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};

pub type Pid = u32;

/// Everything the VM engine knows about one process. Guarded as a unit by its [`AddressSpace`].
pub struct ProcessVm {
    pid: Pid,
    pub page_dir: PageDir,
    pub spt: SupplementalPageTable,
    pub mappings: MappingTable,
    /// The user stack pointer saved on the last kernel entry.
    pub stack_pointer: usize,
    torn_down: bool,
}

impl ProcessVm {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Set once the process's pages have been freed. Nothing may be mapped afterwards.
    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    pub(crate) fn mark_torn_down(&mut self) {
        self.torn_down = true;
    }
}

pub struct AddressSpace {
    pid: Pid,
    vm: Mutex<ProcessVm>,
}

impl AddressSpace {
    fn new(pid: Pid) -> Self {
        Self {
            pid,
            vm: Mutex::new(ProcessVm {
                pid,
                page_dir: PageDir::new(),
                spt: SupplementalPageTable::new(),
                mappings: MappingTable::new(),
                stack_pointer: 0,
                torn_down: false,
            }),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Locks the process's page tables. Paths that may allocate a frame must take the frame
    /// table first.
    pub fn lock(&self) -> MutexGuard<ProcessVm> {
        self.vm.lock()
    }
}

struct Spaces {
    by_pid: BTreeMap<Pid, Weak<AddressSpace>>,
    next_pid: Pid,
}

/// Every live address space, by pid, so eviction can reach the owner of a frame.
pub struct ProcessRegistry {
    spaces: Mutex<Spaces>,
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self {
            spaces: Mutex::new(Spaces {
                by_pid: BTreeMap::new(),
                next_pid: 1,
            }),
        }
    }

    /// Creates and registers an address space under the next unused pid.
    ///
    /// Pids count up from 1 and wrap around, skipping 0 and every registered pid. The pid of an
    /// address space dropped without teardown stays taken until its frames have been reclaimed
    /// and it is unregistered.
    pub fn create(&self) -> Arc<AddressSpace> {
        let mut spaces = self.spaces.lock();
        loop {
            let pid = spaces.next_pid;
            spaces.next_pid = pid.checked_add(1).unwrap_or(1);
            if !spaces.by_pid.contains_key(&pid) {
                let space = Arc::new(AddressSpace::new(pid));
                spaces.by_pid.insert(pid, Arc::downgrade(&space));
                return space;
            }
        }
    }

    pub fn unregister(&self, pid: Pid) {
        self.spaces.lock().by_pid.remove(&pid);
    }

    /// The address space for `pid`, unless it has exited or been dropped.
    pub fn get(&self, pid: Pid) -> Option<Arc<AddressSpace>> {
        self.spaces.lock().by_pid.get(&pid)?.upgrade()
    }

    pub fn len(&self) -> usize {
        self.spaces.lock().by_pid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookup() {
        let registry = ProcessRegistry::new();
        let space = registry.create();
        assert_eq!(space.pid(), 1);
        assert_eq!(registry.get(1).map(|space| space.pid()), Some(1));
        assert!(registry.get(2).is_none());

        registry.unregister(1);
        assert!(registry.get(1).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_dropped_space_is_unreachable() {
        let registry = ProcessRegistry::new();
        let space = registry.create();
        drop(space);
        assert!(registry.get(1).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_pids_wrap_past_live_processes() {
        let registry = ProcessRegistry::new();
        let first = registry.create();
        let second = registry.create();
        assert_eq!((first.pid(), second.pid()), (1, 2));

        registry.spaces.lock().next_pid = Pid::MAX;
        let last = registry.create();
        assert_eq!(last.pid(), Pid::MAX);

        // 0 is never used, and 1 and 2 are still alive.
        let wrapped = registry.create();
        assert_eq!(wrapped.pid(), 3);
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn test_pid_of_dropped_space_is_reused_once_unregistered() {
        let registry = ProcessRegistry::new();
        let kept = registry.create();
        drop(registry.create());

        registry.spaces.lock().next_pid = 1;
        assert_eq!(registry.create().pid(), 3);

        registry.unregister(2);
        registry.spaces.lock().next_pid = 1;
        let reused = registry.create();
        assert_eq!(reused.pid(), 2);
        assert_eq!(registry.get(2).map(|space| space.pid()), Some(2));
        assert_eq!(registry.get(kept.pid()).map(|space| space.pid()), Some(1));
    }
}
