use vmkern_shared::mem::{OFFSET, STACK_SLACK, USER_POOL_FRAMES, USER_STACK_FLOOR};

/// Tunables for one VM engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Number of frames in the user pool.
    pub frame_count: usize,
    /// How far below the stack pointer an access still counts as stack growth.
    pub stack_slack: usize,
    /// The stack never grows below this address.
    pub stack_floor: usize,
    /// First address that does not belong to user space.
    pub user_limit: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            frame_count: USER_POOL_FRAMES,
            stack_slack: STACK_SLACK,
            stack_floor: USER_STACK_FLOOR,
            user_limit: OFFSET,
        }
    }
}

impl VmConfig {
    pub fn with_frames(frame_count: usize) -> Self {
        Self {
            frame_count,
            ..Self::default()
        }
    }
}
