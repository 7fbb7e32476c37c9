//! Physical frame allocator.
//!
//! One bit per 4 KiB frame over the full 32-bit physical address space.
//! The bitmap lives in the kernel image (.bss), so reserving the kernel
//! image at init also reserves the bitmap itself.

use spin::Mutex;

use super::{align_down, align_up, FrameNumber, FRAME_SIZE};
use crate::boot::{MemoryRegion, MemoryRegionKind};

/// Frames addressable with 32-bit physical addresses (4 GiB).
const MAX_FRAMES: usize = (u32::MAX as usize + 1) / FRAME_SIZE;

const WORD_BITS: usize = 64;
const BITMAP_WORDS: usize = MAX_FRAMES / WORD_BITS;

/// Frame-allocator counters reported by `meminfo`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameStats {
    /// Frames covered by usable RAM.
    pub total: usize,
    /// Frames currently allocated or reserved.
    pub used: usize,
}

impl FrameStats {
    pub fn free(&self) -> usize {
        self.total.saturating_sub(self.used)
    }
}

/// Bitmap over physical frames. Set bit = frame in use.
pub struct FrameBitmap {
    bits: [u64; BITMAP_WORDS],
    /// One past the highest usable frame.
    limit: usize,
    /// Frames belonging to usable RAM (denominator for statistics).
    total: usize,
    used: usize,
    /// Rolling scan start, advanced on allocation.
    hint: usize,
}

impl FrameBitmap {
    pub const fn new() -> Self {
        Self {
            // Everything starts reserved; init() frees usable RAM.
            bits: [u64::MAX; BITMAP_WORDS],
            limit: 0,
            total: 0,
            used: 0,
            hint: 0,
        }
    }

    /// Build the bitmap from the boot memory map.
    ///
    /// Usable regions are freed (shrunk inward to whole frames), then the
    /// reserved regions, the low frame 0, and the kernel image up to
    /// `kernel_end` are re-reserved.
    pub fn init(&mut self, regions: &[MemoryRegion], kernel_end: usize) {
        for region in regions {
            if region.kind != MemoryRegionKind::Usable {
                continue;
            }
            let first = align_up(region.start as usize) / FRAME_SIZE;
            let last = align_down(region.end as usize) / FRAME_SIZE;
            for frame in first..last.min(MAX_FRAMES) {
                if self.test(FrameNumber(frame)) {
                    self.clear(FrameNumber(frame));
                    self.total += 1;
                }
            }
            if last > self.limit {
                self.limit = last.min(MAX_FRAMES);
            }
        }

        // Reserved regions may overlap usable ones; punch them back out.
        for region in regions {
            if region.kind == MemoryRegionKind::Reserved {
                self.mark_region_used(region.start as usize, region.end as usize);
            }
        }

        // Frame 0 stays reserved so a returned frame number is never zero,
        // and the kernel image (text, data, bss, this bitmap) is off limits.
        self.mark_region_used(0, align_up(kernel_end));
    }

    fn word_and_bit(frame: FrameNumber) -> (usize, u64) {
        (frame.0 / WORD_BITS, 1u64 << (frame.0 % WORD_BITS))
    }

    /// Whether a frame is currently allocated or reserved.
    pub fn test(&self, frame: FrameNumber) -> bool {
        let (word, bit) = Self::word_and_bit(frame);
        self.bits[word] & bit != 0
    }

    fn set(&mut self, frame: FrameNumber) {
        let (word, bit) = Self::word_and_bit(frame);
        self.bits[word] |= bit;
    }

    fn clear(&mut self, frame: FrameNumber) {
        let (word, bit) = Self::word_and_bit(frame);
        self.bits[word] &= !bit;
    }

    /// Allocate a single frame, or `None` when physical memory is exhausted.
    pub fn alloc(&mut self) -> Option<FrameNumber> {
        self.alloc_contiguous(1)
    }

    /// Allocate `count` physically contiguous frames.
    ///
    /// First-fit scan starting at the rolling hint, wrapping once.
    pub fn alloc_contiguous(&mut self, count: usize) -> Option<FrameNumber> {
        if count == 0 || count > self.limit {
            return None;
        }
        let start = self.scan_from(self.hint, count).or_else(|| {
            // Wrap around and retry from the bottom.
            self.scan_from(0, count)
        })?;
        for i in 0..count {
            self.set(FrameNumber(start + i));
        }
        self.used += count;
        self.hint = start + count;
        Some(FrameNumber(start))
    }

    fn scan_from(&self, from: usize, count: usize) -> Option<usize> {
        let mut run = 0usize;
        let mut run_start = 0usize;
        for frame in from..self.limit {
            if self.test(FrameNumber(frame)) {
                run = 0;
            } else {
                if run == 0 {
                    run_start = frame;
                }
                run += 1;
                if run == count {
                    return Some(run_start);
                }
            }
        }
        None
    }

    /// Release a single frame.
    ///
    /// Freeing a frame that is not allocated is a programming error: it
    /// trips a `debug_assert!` and is ignored in release builds.
    pub fn free(&mut self, frame: FrameNumber) {
        debug_assert!(
            self.test(frame),
            "double free of physical frame {:#x}",
            frame.0
        );
        if self.test(frame) {
            self.clear(frame);
            self.used -= 1;
        }
    }

    /// Release `count` contiguous frames starting at `frame`.
    pub fn free_contiguous(&mut self, frame: FrameNumber, count: usize) {
        for i in 0..count {
            self.free(FrameNumber(frame.0 + i));
        }
    }

    /// Reserve every frame touching `[start, end)`.
    pub fn mark_region_used(&mut self, start: usize, end: usize) {
        let first = align_down(start) / FRAME_SIZE;
        let last = align_up(end) / FRAME_SIZE;
        for frame in first..last.min(MAX_FRAMES) {
            if !self.test(FrameNumber(frame)) {
                self.set(FrameNumber(frame));
                self.used += 1;
            }
        }
    }

    pub fn stats(&self) -> FrameStats {
        FrameStats {
            total: self.total,
            used: self.used.min(self.total),
        }
    }
}

static FRAME_ALLOCATOR: Mutex<FrameBitmap> = Mutex::new(FrameBitmap::new());

/// Initialize the global allocator from the boot memory map.
pub fn init(regions: &[MemoryRegion], kernel_end: usize) {
    let mut frames = FRAME_ALLOCATOR.lock();
    frames.init(regions, kernel_end);
    let stats = frames.stats();
    log::info!(
        "frames: {} usable ({} MiB), {} reserved",
        stats.total,
        stats.total * FRAME_SIZE / (1024 * 1024),
        stats.used
    );
}

/// Allocate one frame from the global allocator.
pub fn alloc_frame() -> Option<FrameNumber> {
    FRAME_ALLOCATOR.lock().alloc()
}

/// Allocate `count` contiguous frames from the global allocator.
pub fn alloc_contiguous(count: usize) -> Option<FrameNumber> {
    FRAME_ALLOCATOR.lock().alloc_contiguous(count)
}

/// Free one frame back to the global allocator.
pub fn free_frame(frame: FrameNumber) {
    FRAME_ALLOCATOR.lock().free(frame);
}

/// Free `count` contiguous frames back to the global allocator.
pub fn free_contiguous(frame: FrameNumber, count: usize) {
    FRAME_ALLOCATOR.lock().free_contiguous(frame, count);
}

/// Global allocator statistics.
pub fn stats() -> FrameStats {
    FRAME_ALLOCATOR.lock().stats()
}

#[cfg(test)]
mod tests {
    extern crate std;
    use std::{boxed::Box, vec};

    use super::*;
    use crate::boot::MemoryRegion;

    fn bitmap_with(regions: &[MemoryRegion], kernel_end: usize) -> Box<FrameBitmap> {
        let mut bm = Box::new(FrameBitmap::new());
        bm.init(regions, kernel_end);
        bm
    }

    fn simple_map() -> vec::Vec<MemoryRegion> {
        vec![
            MemoryRegion::usable(0, 0x0009_F000),
            MemoryRegion::reserved(0x0009_F000, 0x0010_0000),
            MemoryRegion::usable(0x0010_0000, 0x0100_0000), // 16 MiB
        ]
    }

    #[test]
    fn kernel_image_is_reserved() {
        let bm = bitmap_with(&simple_map(), 0x0030_0000);
        assert!(bm.test(FrameNumber::containing(0x0020_0000)));
        assert!(!bm.test(FrameNumber::containing(0x0030_0000)));
    }

    #[test]
    fn alloc_returns_unreserved_frames() {
        let mut bm = bitmap_with(&simple_map(), 0x0030_0000);
        let f = bm.alloc().unwrap();
        assert!(f.start_address().as_usize() >= 0x0030_0000);
        assert!(bm.test(f));
    }

    #[test]
    fn allocated_frame_has_exactly_one_bit() {
        let mut bm = bitmap_with(&simple_map(), 0x0030_0000);
        let before = bm.stats().used;
        let f = bm.alloc().unwrap();
        assert_eq!(bm.stats().used, before + 1);
        bm.free(f);
        assert_eq!(bm.stats().used, before);
        assert!(!bm.test(f));
    }

    #[test]
    fn contiguous_allocation_is_contiguous() {
        let mut bm = bitmap_with(&simple_map(), 0x0030_0000);
        let f = bm.alloc_contiguous(8).unwrap();
        for i in 0..8 {
            assert!(bm.test(FrameNumber(f.0 + i)));
        }
        bm.free_contiguous(f, 8);
        for i in 0..8 {
            assert!(!bm.test(FrameNumber(f.0 + i)));
        }
    }

    #[test]
    fn exhaustion_returns_none() {
        // A map with a single usable frame beyond the kernel.
        let regions = vec![MemoryRegion::usable(0x0010_0000, 0x0010_2000)];
        let mut bm = bitmap_with(&regions, 0x0010_1000);
        assert!(bm.alloc().is_some());
        assert!(bm.alloc().is_none());
    }

    #[test]
    fn contiguous_respects_holes() {
        let mut bm = bitmap_with(&simple_map(), 0x0030_0000);
        // Carve a hole so no run of 4 exists below it at the hint.
        let a = bm.alloc_contiguous(4).unwrap();
        bm.free(FrameNumber(a.0 + 1));
        let b = bm.alloc_contiguous(4).unwrap();
        assert!(b.0 >= a.0 + 4);
    }

    #[test]
    fn frame_zero_is_never_returned() {
        let regions = vec![MemoryRegion::usable(0, 0x0100_0000)];
        let mut bm = bitmap_with(&regions, 0x1000);
        let f = bm.alloc().unwrap();
        assert_ne!(f.0, 0);
    }

    #[test]
    fn reserved_regions_stay_reserved() {
        let bm = bitmap_with(&simple_map(), 0x0030_0000);
        assert!(bm.test(FrameNumber::containing(0x0009_F000)));
        assert!(bm.test(FrameNumber::containing(0x000F_0000)));
    }
}
