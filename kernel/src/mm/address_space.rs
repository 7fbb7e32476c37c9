//! Per-process user address spaces.
//!
//! The kernel tracks every user mapping in a page -> frame map owned by the
//! process; the hardware page tables mirror this map on bare metal. Keeping
//! the authoritative bookkeeping in normal kernel data structures means
//! fork's eager copy, `sbrk`, teardown, and user-pointer validation are all
//! ordinary map operations.

use alloc::collections::BTreeMap;

use super::{frame_allocator, FrameNumber, PageFlags, PhysicalAddress, FRAME_SIZE};
use super::{USER_BASE, USER_STACK_PAGES, USER_STACK_TOP, USER_TOP};
use crate::error::{KernelError, KernelResult};

/// A process's view of memory below the kernel boundary.
pub struct AddressSpace {
    /// Physical address of the page directory (0 until paging is active,
    /// e.g. in unit tests).
    page_directory: PhysicalAddress,
    /// Every mapped user page and the frame backing it. The process owns
    /// these frames exclusively (fork copies, never shares).
    mappings: BTreeMap<usize, FrameNumber>,
    /// User heap: fixed base, moving break, hard ceiling.
    heap_start: usize,
    heap_end: usize,
    heap_max: usize,
    /// Host-test spaces describe caller-owned buffers; their "frames" are
    /// not the allocator's to free.
    #[cfg(not(target_os = "none"))]
    external: bool,
}

impl AddressSpace {
    /// An empty address space sharing only the kernel mappings.
    pub fn new() -> KernelResult<Self> {
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        let page_directory = crate::arch::x86::paging::clone_kernel_directory()?;
        #[cfg(not(all(target_arch = "x86", target_os = "none")))]
        let page_directory = PhysicalAddress(0);

        Ok(Self {
            page_directory,
            mappings: BTreeMap::new(),
            heap_start: 0,
            heap_end: 0,
            heap_max: 0,
            #[cfg(not(target_os = "none"))]
            external: false,
        })
    }

    /// A placeholder space with no directory and no mappings; used when
    /// detaching a dying process's real space for teardown.
    pub fn empty() -> Self {
        Self {
            page_directory: PhysicalAddress(0),
            mappings: BTreeMap::new(),
            heap_start: 0,
            heap_end: 0,
            heap_max: 0,
            #[cfg(not(target_os = "none"))]
            external: false,
        }
    }

    pub fn page_directory(&self) -> PhysicalAddress {
        self.page_directory
    }

    /// Current break, for diagnostics.
    pub fn brk(&self) -> usize {
        self.heap_end
    }

    /// Number of mapped user pages.
    pub fn mapped_pages(&self) -> usize {
        self.mappings.len()
    }

    /// Map one user page to a freshly allocated frame, zeroed.
    pub fn map_user_page(&mut self, va: usize, flags: PageFlags) -> KernelResult<FrameNumber> {
        debug_assert_eq!(va % FRAME_SIZE, 0);
        if !(USER_BASE..USER_TOP).contains(&va) {
            return Err(KernelError::BadUserAddress { addr: va });
        }
        if self.mappings.contains_key(&va) {
            return Err(KernelError::InvalidArgument {
                name: "va",
                value: "page already mapped",
            });
        }
        let frame = frame_allocator::alloc_frame().ok_or(KernelError::OutOfMemory {
            requested: FRAME_SIZE,
        })?;
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        {
            crate::arch::x86::paging::zero_frame(frame);
            crate::arch::x86::paging::map_page(
                self.page_directory,
                va,
                frame,
                flags | PageFlags::PRESENT | PageFlags::USER,
            )?;
        }
        #[cfg(not(all(target_arch = "x86", target_os = "none")))]
        let _ = flags;
        self.mappings.insert(va, frame);
        Ok(frame)
    }

    /// Unmap one user page and release its frame.
    pub fn unmap_user_page(&mut self, va: usize) -> KernelResult<()> {
        let frame = self
            .mappings
            .remove(&va)
            .ok_or(KernelError::BadUserAddress { addr: va })?;
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        crate::arch::x86::paging::unmap_page(self.page_directory, va);
        frame_allocator::free_frame(frame);
        Ok(())
    }

    /// Map the default user regions for a fresh image: `pages` code/data
    /// pages at `USER_BASE`, a stack under `USER_STACK_TOP`, and a
    /// zero-length heap starting just past the image.
    pub fn map_initial_layout(&mut self, image_pages: usize) -> KernelResult<()> {
        for i in 0..image_pages {
            self.map_user_page(USER_BASE + i * FRAME_SIZE, PageFlags::WRITABLE)?;
        }
        for i in 0..USER_STACK_PAGES {
            let va = USER_STACK_TOP - (i + 1) * FRAME_SIZE;
            self.map_user_page(va, PageFlags::WRITABLE)?;
        }
        self.heap_start = USER_BASE + image_pages * FRAME_SIZE;
        self.heap_end = self.heap_start;
        self.heap_max = USER_STACK_TOP - (USER_STACK_PAGES + 1) * FRAME_SIZE;
        Ok(())
    }

    /// Move the break by `delta` bytes, mapping or releasing whole pages.
    /// Returns the previous break (the classic `sbrk` contract).
    pub fn sbrk(&mut self, delta: isize) -> KernelResult<usize> {
        let old = self.heap_end;
        let new = if delta >= 0 {
            old.checked_add(delta as usize)
        } else {
            old.checked_sub(delta.unsigned_abs())
        }
        .ok_or(KernelError::InvalidArgument {
            name: "delta",
            value: "break out of range",
        })?;

        if new < self.heap_start || new > self.heap_max {
            return Err(KernelError::InvalidArgument {
                name: "delta",
                value: "break out of range",
            });
        }

        let old_top = super::align_up(old);
        let new_top = super::align_up(new);
        if new_top > old_top {
            let mut va = old_top;
            while va < new_top {
                if let Err(e) = self.map_user_page(va, PageFlags::WRITABLE) {
                    // Roll back partially mapped growth.
                    let mut undo = old_top;
                    while undo < va {
                        let _ = self.unmap_user_page(undo);
                        undo += FRAME_SIZE;
                    }
                    return Err(e);
                }
                va += FRAME_SIZE;
            }
        } else {
            let mut va = new_top;
            while va < old_top {
                let _ = self.unmap_user_page(va);
                va += FRAME_SIZE;
            }
        }
        self.heap_end = new;
        Ok(old)
    }

    /// Eagerly duplicate this address space for `fork`: every mapped page
    /// gets a fresh frame with the contents copied.
    pub fn clone_for_fork(&self) -> KernelResult<Self> {
        let mut child = Self::new()?;
        child.heap_start = self.heap_start;
        child.heap_end = self.heap_end;
        child.heap_max = self.heap_max;
        for (&va, &_frame) in self.mappings.iter() {
            let new_frame = frame_allocator::alloc_frame().ok_or(KernelError::OutOfMemory {
                requested: FRAME_SIZE,
            })?;
            #[cfg(all(target_arch = "x86", target_os = "none"))]
            {
                crate::arch::x86::paging::copy_frame(new_frame, _frame);
                crate::arch::x86::paging::map_page(
                    child.page_directory,
                    va,
                    new_frame,
                    PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER,
                )?;
            }
            child.mappings.insert(va, new_frame);
        }
        Ok(child)
    }

    /// Release every user frame and page-table page. The kernel half of the
    /// directory is shared and untouched.
    pub fn destroy(&mut self) {
        #[cfg(not(target_os = "none"))]
        if self.external {
            self.mappings.clear();
            return;
        }
        let pages: alloc::vec::Vec<usize> = self.mappings.keys().copied().collect();
        for va in pages {
            let _ = self.unmap_user_page(va);
        }
        self.heap_end = self.heap_start;
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        if self.page_directory.as_usize() != 0 {
            crate::arch::x86::paging::free_directory(self.page_directory);
        }
    }

    /// Copy bytes into mapped user pages through the kernel's identity
    /// window (image loading, argv setup). The range must already be
    /// mapped.
    pub fn write_user(&self, va: usize, data: &[u8]) -> KernelResult<()> {
        if !self.covers_range(va, data.len()) {
            return Err(KernelError::BadUserAddress { addr: va });
        }
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        {
            let mut offset = 0;
            while offset < data.len() {
                let addr = va + offset;
                let page = super::align_down(addr);
                let frame = self.mappings[&page];
                let page_off = addr - page;
                let chunk = (FRAME_SIZE - page_off).min(data.len() - offset);
                // SAFETY: frame belongs to this space and physical memory
                // is identity-mapped in ring 0.
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        data.as_ptr().add(offset),
                        (frame.start_address().as_usize() + page_off) as *mut u8,
                        chunk,
                    );
                }
                offset += chunk;
            }
        }
        Ok(())
    }

    /// Whether `[addr, addr + len)` lies entirely inside mapped user pages.
    /// This is the validation gate for every user pointer a syscall touches.
    pub fn covers_range(&self, addr: usize, len: usize) -> bool {
        if len == 0 {
            return true;
        }
        let end = match addr.checked_add(len) {
            Some(e) => e,
            None => return false,
        };
        let mut page = super::align_down(addr);
        while page < end {
            if !self.mappings.contains_key(&page) {
                return false;
            }
            page += FRAME_SIZE;
        }
        true
    }

    /// Register an externally prepared mapping (used by the host test
    /// harness to describe buffers the tests own).
    #[cfg(not(target_os = "none"))]
    pub fn map_external(&mut self, va: usize, frame: FrameNumber) {
        self.external = true;
        self.mappings.insert(super::align_down(va), frame);
    }

    /// Describe a caller-owned byte buffer as mapped user memory (host test
    /// harness only).
    #[cfg(not(target_os = "none"))]
    pub fn map_external_buffer(&mut self, addr: usize, len: usize) {
        let first = super::align_down(addr);
        let last = super::align_down(addr + len.max(1) - 1);
        let mut page = first;
        while page <= last {
            self.map_external(page, FrameNumber(page / FRAME_SIZE));
            page += FRAME_SIZE;
        }
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        if !self.mappings.is_empty() {
            self.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use std::{boxed::Box, vec};

    use super::*;
    use crate::boot::MemoryRegion;

    // The global frame allocator starts fully reserved in the test binary,
    // so tests that need frames seed it with a private high region while
    // holding the allocator test lock.
    fn seed_frames(start: usize, frames: usize) {
        let regions = vec![MemoryRegion::usable(
            start as u64,
            (start + frames * FRAME_SIZE) as u64,
        )];
        frame_allocator::init(&regions, 0);
    }

    #[test]
    fn initial_layout_maps_code_stack_and_empty_heap() {
        let _guard = crate::mm::test_lock();
        seed_frames(0x1000_0000, 64);
        let mut space = AddressSpace::new().unwrap();
        space.map_initial_layout(2).unwrap();
        assert!(space.covers_range(USER_BASE, 2 * FRAME_SIZE));
        assert!(space.covers_range(USER_STACK_TOP - FRAME_SIZE, FRAME_SIZE));
        assert_eq!(space.brk(), USER_BASE + 2 * FRAME_SIZE);
        // The heap has no pages yet.
        assert!(!space.covers_range(space.brk(), 1));
    }

    #[test]
    fn sbrk_grows_and_shrinks_page_granular() {
        let _guard = crate::mm::test_lock();
        seed_frames(0x1100_0000, 64);
        let mut space = AddressSpace::new().unwrap();
        space.map_initial_layout(1).unwrap();
        let base = space.brk();

        let old = space.sbrk(100).unwrap();
        assert_eq!(old, base);
        assert_eq!(space.brk(), base + 100);
        assert!(space.covers_range(base, 100));

        let old = space.sbrk(-100).unwrap();
        assert_eq!(old, base + 100);
        assert_eq!(space.brk(), base);
        assert!(!space.covers_range(base, 1));
    }

    #[test]
    fn sbrk_below_base_is_rejected() {
        let _guard = crate::mm::test_lock();
        seed_frames(0x1200_0000, 64);
        let mut space = AddressSpace::new().unwrap();
        space.map_initial_layout(1).unwrap();
        assert!(space.sbrk(-1).is_err());
        assert_eq!(space.brk(), USER_BASE + FRAME_SIZE);
    }

    #[test]
    fn fork_clone_is_deep_bookkeeping() {
        let _guard = crate::mm::test_lock();
        seed_frames(0x1300_0000, 64);
        let mut parent = AddressSpace::new().unwrap();
        parent.map_initial_layout(1).unwrap();
        parent.sbrk(FRAME_SIZE as isize).unwrap();

        let child = parent.clone_for_fork().unwrap();
        assert_eq!(child.mapped_pages(), parent.mapped_pages());
        assert_eq!(child.brk(), parent.brk());
        // Frames must be distinct: the child owns fresh copies.
        for (va, frame) in parent.mappings.iter() {
            assert_ne!(child.mappings[va], *frame);
        }
    }

    #[test]
    fn destroy_returns_frames() {
        let _guard = crate::mm::test_lock();
        seed_frames(0x1400_0000, 64);
        let before = frame_allocator::stats().used;
        let mut space = AddressSpace::new().unwrap();
        space.map_initial_layout(2).unwrap();
        assert!(frame_allocator::stats().used > before);
        space.destroy();
        assert_eq!(frame_allocator::stats().used, before);
        assert_eq!(space.mapped_pages(), 0);
    }

    #[test]
    fn covers_range_is_exact_at_boundaries() {
        let _guard = crate::mm::test_lock();
        seed_frames(0x1500_0000, 64);
        let mut space = AddressSpace::new().unwrap();
        space.map_initial_layout(1).unwrap();
        assert!(space.covers_range(USER_BASE, FRAME_SIZE));
        assert!(!space.covers_range(USER_BASE, FRAME_SIZE + 1));
        assert!(!space.covers_range(USER_BASE - 1, 2));
        assert!(!space.covers_range(0, 4));
        assert!(!space.covers_range(usize::MAX - 2, 8));
    }

    #[test]
    fn external_mappings_validate_host_buffers() {
        let buf: Box<[u8; 8192]> = Box::new([0u8; 8192]);
        let addr = buf.as_ptr() as usize;
        let mut space = AddressSpace::new().unwrap();
        space.map_external_buffer(addr, 8192);
        assert!(space.covers_range(addr, 8192));
    }
}
