//! Memory management: physical frames, kernel heap, per-process address
//! spaces, and the page-fault path.

use core::fmt;

pub mod address_space;
pub mod frame_allocator;
pub mod heap;
pub mod page_fault;

/// Size of a physical page frame.
pub const FRAME_SIZE: usize = 4096;

/// Base of the user image mapping.
pub const USER_BASE: usize = 0x0800_0000;

/// Exclusive upper bound of user-addressable memory.
pub const USER_TOP: usize = 0xC000_0000;

/// Top of the initial user stack (one guard page below `USER_TOP`).
pub const USER_STACK_TOP: usize = 0xBFFF_F000;

/// Pages mapped for a fresh user stack (16 KiB).
pub const USER_STACK_PAGES: usize = 4;

/// A physical address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysicalAddress(pub usize);

impl PhysicalAddress {
    pub fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// A 4 KiB physical frame, identified by its index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FrameNumber(pub usize);

impl FrameNumber {
    pub fn containing(addr: usize) -> Self {
        Self(addr / FRAME_SIZE)
    }

    pub fn start_address(self) -> PhysicalAddress {
        PhysicalAddress(self.0 * FRAME_SIZE)
    }
}

bitflags::bitflags! {
    /// Page-table entry flags (i686 two-level paging).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE      = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
    }
}

/// Combined memory statistics for the `meminfo` syscall and diagnostics.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct MemInfo {
    pub total_frames: usize,
    pub used_frames: usize,
    pub free_frames: usize,
    pub heap_total: usize,
    pub heap_used: usize,
    pub heap_free: usize,
    pub heap_peak: usize,
}

/// Snapshot frame-allocator and heap statistics together.
pub fn meminfo() -> MemInfo {
    let frames = frame_allocator::stats();
    let heap = heap::stats();
    MemInfo {
        total_frames: frames.total,
        used_frames: frames.used,
        free_frames: frames.free(),
        heap_total: heap.total,
        heap_used: heap.used,
        heap_free: heap.free,
        heap_peak: heap.peak,
    }
}

#[cfg(test)]
extern crate std;

/// Serializes tests that exercise the global frame allocator, which is a
/// single shared bitmap even in the unit-test binary.
#[cfg(test)]
pub(crate) fn test_lock() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Align an address down to a frame boundary.
pub fn align_down(addr: usize) -> usize {
    addr & !(FRAME_SIZE - 1)
}

/// Align an address up to a frame boundary.
pub fn align_up(addr: usize) -> usize {
    (addr + FRAME_SIZE - 1) & !(FRAME_SIZE - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_address_round_trip() {
        let f = FrameNumber::containing(0x1234);
        assert_eq!(f, FrameNumber(1));
        assert_eq!(f.start_address(), PhysicalAddress(0x1000));
    }

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_down(0x1fff), 0x1000);
        assert_eq!(align_up(0x1001), 0x2000);
        assert_eq!(align_up(0x2000), 0x2000);
    }
}
