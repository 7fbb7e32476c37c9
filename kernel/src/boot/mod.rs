//! Bootloader handoff.
//!
//! The kernel is entered in protected mode with paging disabled and a
//! multiboot2 information structure describing physical memory, the kernel
//! image, and the command line. This module translates that structure into
//! the kernel's own [`BootInfo`] so nothing downstream depends on the
//! bootloader's layout.

use alloc::{string::String, vec::Vec};

use spin::Once;

/// Classification of a physical memory range reported by the bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryRegionKind {
    /// Free RAM the kernel may hand to the frame allocator.
    Usable,
    /// Firmware, MMIO holes, or otherwise untouchable ranges.
    Reserved,
}

/// One physical memory range from the boot memory map.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub start: u64,
    pub end: u64,
    pub kind: MemoryRegionKind,
}

impl MemoryRegion {
    pub fn usable(start: u64, end: u64) -> Self {
        Self {
            start,
            end,
            kind: MemoryRegionKind::Usable,
        }
    }

    pub fn reserved(start: u64, end: u64) -> Self {
        Self {
            start,
            end,
            kind: MemoryRegionKind::Reserved,
        }
    }
}

/// Everything the kernel keeps from the bootloader handoff.
#[derive(Debug)]
pub struct BootInfo {
    /// Physical memory map, usable and reserved ranges.
    pub memory_regions: Vec<MemoryRegion>,
    /// First byte past the loaded kernel image (including .bss).
    pub kernel_end: usize,
    /// Kernel command line, empty if the bootloader passed none.
    pub cmdline: String,
}

static BOOT_INFO: Once<BootInfo> = Once::new();

/// Record the handoff. Called exactly once during early boot (or from a
/// test harness); later calls are ignored.
pub fn record(info: BootInfo) -> &'static BootInfo {
    BOOT_INFO.call_once(|| info)
}

/// The recorded handoff, if boot has progressed far enough.
pub fn get() -> Option<&'static BootInfo> {
    BOOT_INFO.get()
}

/// The kernel command line.
pub fn cmdline() -> &'static str {
    BOOT_INFO.get().map(|b| b.cmdline.as_str()).unwrap_or("")
}

/// Parse the multiboot2 information structure the bootloader left in memory.
///
/// # Safety
///
/// `mbi_addr` must be the physical address of a valid multiboot2 boot
/// information structure, identity-mapped and unmodified since handoff.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub unsafe fn from_multiboot(mbi_addr: usize) -> BootInfo {
    use multiboot2::{BootInformation, BootInformationHeader, MemoryAreaType};

    extern "C" {
        // Provided by the linker script; first byte past .bss.
        static __kernel_end: u8;
    }

    let mbi = unsafe { BootInformation::load(mbi_addr as *const BootInformationHeader) }
        .expect("multiboot2: invalid boot information");

    let mut memory_regions = Vec::new();
    if let Some(map) = mbi.memory_map_tag() {
        for area in map.memory_areas() {
            let kind = if area.typ() == MemoryAreaType::Available {
                MemoryRegionKind::Usable
            } else {
                MemoryRegionKind::Reserved
            };
            memory_regions.push(MemoryRegion {
                start: area.start_address(),
                end: area.end_address(),
                kind,
            });
        }
    }

    // The multiboot structure itself must survive until we are done with it,
    // but nothing references it after this function returns.
    memory_regions.push(MemoryRegion::reserved(
        mbi_addr as u64,
        mbi_addr as u64 + mbi.total_size() as u64,
    ));

    let cmdline = mbi
        .command_line_tag()
        .and_then(|tag| tag.cmdline().ok())
        .unwrap_or("");

    let kernel_end = unsafe { &__kernel_end as *const u8 as usize };

    BootInfo {
        memory_regions,
        kernel_end,
        cmdline: String::from(cmdline),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regions_carry_their_kind() {
        let r = MemoryRegion::usable(0x10_0000, 0x80_0000);
        assert_eq!(r.kind, MemoryRegionKind::Usable);
        let r = MemoryRegion::reserved(0, 0x1000);
        assert_eq!(r.kind, MemoryRegionKind::Reserved);
    }

    #[test]
    fn cmdline_defaults_to_empty_before_boot() {
        // The unit-test binary never records a handoff, so the accessor
        // must degrade to an empty command line.
        assert_eq!(cmdline(), "");
    }
}
