//! CinderOS kernel library.
//!
//! The kernel core: protected-mode CPU setup, physical and heap memory
//! management, a preemptive round-robin scheduler, fork/exec/wait process
//! management, the syscall layer, a VFS with RAM and ext2 filesystems,
//! pipes, and signals. The library also builds on a hosted target so the
//! portable subsystems run under the standard test harness.

#![no_std]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]

extern crate alloc;

// Host builds (unit tests, coverage) use the system allocator so test code
// can allocate before any kernel init runs.
#[cfg(not(target_os = "none"))]
extern crate std;

#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

// On bare metal the boundary-tagged kernel heap is the global allocator.
#[cfg(target_os = "none")]
#[global_allocator]
static ALLOCATOR: mm::heap::GlobalHeap = mm::heap::GlobalHeap;

#[macro_use]
pub mod print;

pub mod arch;
pub mod boot;
pub mod error;
pub mod fs;
pub mod logger;
pub mod mm;
pub mod process;
pub mod sched;
pub mod syscall;
pub mod timer;

/// Heap allocation failure is unrecoverable in a no_std kernel.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("kernel heap exhausted: {:?}", layout);
}
