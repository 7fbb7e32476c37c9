//! Two-level i686 paging.
//!
//! The kernel identity-maps physical RAM with 4 MiB pages in every
//! directory, so physical frames are always reachable through their own
//! addresses in ring 0. User mappings use 4 KiB pages in per-process page
//! tables; each process directory shares the kernel entries and owns the
//! user ones.

use x86::controlregs::{self, Cr0, Cr4};

use crate::error::{KernelError, KernelResult};
use crate::mm::{frame_allocator, FrameNumber, PageFlags, PhysicalAddress, FRAME_SIZE, USER_TOP};

const ENTRIES: usize = 1024;
const PAGE_SIZE_4M: u32 = 1 << 7; // PS bit in a directory entry

/// How much physical memory the kernel identity-maps (512 MiB).
const IDENTITY_LIMIT: usize = 512 * 1024 * 1024;

#[repr(C, align(4096))]
struct PageTable([u32; ENTRIES]);

static mut KERNEL_DIRECTORY: PageTable = PageTable([0; ENTRIES]);

fn dir_index(va: usize) -> usize {
    va >> 22
}

fn table_index(va: usize) -> usize {
    (va >> 12) & 0x3FF
}

unsafe fn table_at(phys: u32) -> *mut [u32; ENTRIES] {
    phys as usize as *mut [u32; ENTRIES]
}

/// Build the kernel identity mapping and turn paging on.
pub fn init() {
    unsafe {
        let dir = core::ptr::addr_of_mut!(KERNEL_DIRECTORY);
        let mut addr = 0usize;
        let mut slot = 0usize;
        while addr < IDENTITY_LIMIT {
            (*dir).0[slot] = addr as u32
                | PAGE_SIZE_4M
                | PageFlags::PRESENT.bits()
                | PageFlags::WRITABLE.bits();
            addr += 4 * 1024 * 1024;
            slot += 1;
        }

        // 4 MiB kernel pages need CR4.PSE.
        controlregs::cr4_write(controlregs::cr4() | Cr4::CR4_ENABLE_PSE);
        let dir_phys = dir as usize as u64;
        controlregs::cr3_write(dir_phys);
        controlregs::cr0_write(controlregs::cr0() | Cr0::CR0_ENABLE_PAGING);
    }
    log::info!(
        "paging: identity-mapped {} MiB, kernel directory active",
        IDENTITY_LIMIT / (1024 * 1024)
    );
}

/// Physical address of the boot-time kernel directory.
pub fn kernel_directory() -> PhysicalAddress {
    PhysicalAddress(unsafe { core::ptr::addr_of!(KERNEL_DIRECTORY) as usize })
}

/// Allocate a fresh directory carrying the kernel's identity entries and
/// no user mappings.
pub fn clone_kernel_directory() -> KernelResult<PhysicalAddress> {
    let frame = frame_allocator::alloc_frame().ok_or(KernelError::OutOfMemory {
        requested: FRAME_SIZE,
    })?;
    let dir_phys = frame.start_address().as_usize() as u32;
    unsafe {
        let src = core::ptr::addr_of!(KERNEL_DIRECTORY);
        let dst = table_at(dir_phys);
        for i in 0..ENTRIES {
            // Kernel identity entries copy through; user slots start empty.
            let entry = (*src).0[i];
            (*dst)[i] = if entry & PAGE_SIZE_4M != 0 { entry } else { 0 };
        }
    }
    Ok(PhysicalAddress(dir_phys as usize))
}

/// Map one user page in `directory`, allocating the page table on demand.
pub fn map_page(
    directory: PhysicalAddress,
    va: usize,
    frame: FrameNumber,
    flags: PageFlags,
) -> KernelResult<()> {
    unsafe {
        let dir = table_at(directory.as_usize() as u32);
        let de = &mut (*dir)[dir_index(va)];
        if *de & PageFlags::PRESENT.bits() == 0 {
            let table_frame = frame_allocator::alloc_frame().ok_or(KernelError::OutOfMemory {
                requested: FRAME_SIZE,
            })?;
            zero_frame(table_frame);
            *de = table_frame.start_address().as_usize() as u32
                | (PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER).bits();
        }
        let table = table_at(*de & !0xFFF);
        (*table)[table_index(va)] = frame.start_address().as_usize() as u32 | flags.bits();
        invlpg(va);
    }
    Ok(())
}

/// Remove one user mapping. Missing mappings are ignored.
pub fn unmap_page(directory: PhysicalAddress, va: usize) {
    unsafe {
        let dir = table_at(directory.as_usize() as u32);
        let de = (*dir)[dir_index(va)];
        if de & PageFlags::PRESENT.bits() == 0 || de & PAGE_SIZE_4M != 0 {
            return;
        }
        let table = table_at(de & !0xFFF);
        (*table)[table_index(va)] = 0;
        invlpg(va);
    }
}

/// Free a process directory and any user page tables it owns. User frames
/// themselves are freed by the address-space bookkeeping.
pub fn free_directory(directory: PhysicalAddress) {
    unsafe {
        let dir = table_at(directory.as_usize() as u32);
        for slot in 0..dir_index(USER_TOP) {
            let de = (*dir)[slot];
            if de & PageFlags::PRESENT.bits() != 0 && de & PAGE_SIZE_4M == 0 {
                frame_allocator::free_frame(FrameNumber::containing((de & !0xFFF) as usize));
            }
        }
    }
    frame_allocator::free_frame(FrameNumber::containing(directory.as_usize()));
}

/// Switch to a process's directory.
pub fn activate(directory: PhysicalAddress) {
    unsafe { controlregs::cr3_write(directory.as_usize() as u64) };
}

/// Zero a frame through the identity window.
pub fn zero_frame(frame: FrameNumber) {
    unsafe {
        core::ptr::write_bytes(frame.start_address().as_usize() as *mut u8, 0, FRAME_SIZE);
    }
}

/// Copy a frame's contents through the identity window (fork's eager copy).
pub fn copy_frame(dst: FrameNumber, src: FrameNumber) {
    unsafe {
        core::ptr::copy_nonoverlapping(
            src.start_address().as_usize() as *const u8,
            dst.start_address().as_usize() as *mut u8,
            FRAME_SIZE,
        );
    }
}

fn invlpg(va: usize) {
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va, options(nostack, preserves_flags));
    }
}
