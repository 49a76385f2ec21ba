use crate::sizes::{KB, MB};

// Page size is 4KB. This is a property of x86 processors.
pub const PAGE_FRAME_SIZE: usize = 4 * KB;

// Any virtual address at or above OFFSET is a kernel address.
pub const OFFSET: usize = 0x80000000;

// The stack may never grow below the start of the program image.
pub const USER_STACK_FLOOR: usize = 0x08048000;

// PUSHA can fault up to 32 bytes below the stack pointer.
pub const STACK_SLACK_WORDS: usize = 8;
pub const STACK_SLACK: usize = STACK_SLACK_WORDS * core::mem::size_of::<u32>();

// Default number of frames handed to user processes.
pub const USER_POOL_SIZE: usize = 4 * MB;
pub const USER_POOL_FRAMES: usize = USER_POOL_SIZE / PAGE_FRAME_SIZE;

#[inline]
pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn page_offset(addr: usize) -> usize {
    addr & (PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn is_user_vaddr(addr: usize) -> bool {
    addr < OFFSET
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_rounding() {
        assert_eq!(page_round_down(0x0804_8123), 0x0804_8000);
        assert_eq!(page_offset(0x0804_8123), 0x123);
        assert_eq!(page_round_down(PAGE_FRAME_SIZE), PAGE_FRAME_SIZE);
    }

    #[test]
    fn test_stack_slack_is_eight_words() {
        assert_eq!(STACK_SLACK, 32);
    }

    #[test]
    fn test_user_split() {
        assert!(is_user_vaddr(OFFSET - 1));
        assert!(!is_user_vaddr(OFFSET));
    }
}
