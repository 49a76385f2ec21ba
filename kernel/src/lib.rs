#![cfg_attr(target_os = "none", no_std)]

//! Demand-paged virtual memory for user processes: lazy loading from files, stack growth,
//! eviction to a swap partition, and memory-mapped files.

extern crate alloc;

pub mod block;
pub mod config;
pub mod error;
pub mod file;
pub mod logging;
pub mod mem;
pub mod paging;
pub mod sync;
pub mod vm;

pub use config::VmConfig;
pub use error::VmError;
pub use vm::{AddressSpace, FaultOutcome, MapId, PageState, Segment, Vm, VmStats};

use alloc::boxed::Box;
use block::Block;
use once_cell::race::OnceBox;

static VM: OnceBox<Vm> = OnceBox::new();

/// Sets up the kernel's VM engine. Called once at boot, after the swap partition is registered.
///
/// # Panics
///
/// Panics if called twice.
pub fn init(config: VmConfig, swap_device: Block) -> &'static Vm {
    assert!(
        VM.set(Box::new(Vm::new(config, swap_device))).is_ok(),
        "VM initialized twice."
    );
    vm()
}

/// The kernel's VM engine.
///
/// # Panics
///
/// Panics if [`init`] has not run yet.
pub fn vm() -> &'static Vm {
    VM.get().expect("VM not initialized.")
}
