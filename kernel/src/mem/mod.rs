//! Physical memory handed out to user processes.

pub mod frame_allocator;

pub use frame_allocator::{FrameAllocator, FrameId, Page};
