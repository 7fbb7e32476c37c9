//! CinderOS kernel entry point.
//!
//! GRUB (multiboot2) drops us here in protected mode with paging off.
//! Boot order matters: the heap lives in the image so it comes up first,
//! then the frame allocator learns the memory map, paging turns on, the
//! CPU tables and devices come up, and finally init is spawned and the
//! boot flow becomes the idle loop.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

use cinder_kernel::{boot, logger, println};

#[cfg(target_arch = "x86")]
core::arch::global_asm!(
    r#"
.section .multiboot2, "a"
.align 8
mb2_header_start:
    .long 0xE85250D6                  // multiboot2 magic
    .long 0                           // architecture: i386 protected mode
    .long mb2_header_end - mb2_header_start
    .long -(0xE85250D6 + 0 + (mb2_header_end - mb2_header_start))
    // end tag
    .word 0
    .word 0
    .long 8
mb2_header_end:

.section .bss
.align 16
boot_stack_bottom:
    .skip 64 * 1024
boot_stack_top:

.section .text
.global _start
_start:
    mov esp, offset boot_stack_top
    push 0                            // terminate stack traces
    push ebx                          // multiboot2 information pointer
    call kernel_main
1:  hlt
    jmp 1b
"#
);

/// Rust-side entry; `mbi_addr` is the multiboot2 info structure.
#[cfg(all(target_arch = "x86", target_os = "none"))]
#[no_mangle]
pub extern "C" fn kernel_main(mbi_addr: usize) -> ! {
    use cinder_kernel::{arch, fs, mm, process, timer};

    // Heap first: everything else allocates.
    mm::heap::init();

    // SAFETY: GRUB hands a valid multiboot2 structure in EBX.
    let info = unsafe { boot::from_multiboot(mbi_addr) };
    let info = boot::record(info);

    logger::init(logger::level_from_cmdline(&info.cmdline));
    log::info!("CinderOS {} booting", env!("CARGO_PKG_VERSION"));
    log::info!("cmdline: '{}'", info.cmdline);

    mm::frame_allocator::init(&info.memory_regions, info.kernel_end);
    arch::x86::paging::init();
    arch::x86::serial::init();
    arch::x86::vga::clear();
    arch::x86::init();

    timer::set_boot_time(arch::x86::rtc::read_epoch_secs());
    fs::init();

    process::init_idle().expect("idle process slot");
    spawn_init();

    log::info!("entering idle loop");
    // SAFETY: everything is initialized; preemption may begin.
    unsafe { arch::x86::enable_interrupts() };
    loop {
        // SAFETY: wait for the next interrupt; the scheduler takes over
        // whenever something is runnable.
        unsafe { arch::x86::halt() };
    }
}

/// Load `/bin/init` if the boot filesystem carries one; otherwise leave a
/// note and keep idling (the system still serves interrupts).
#[cfg(all(target_arch = "x86", target_os = "none"))]
fn spawn_init() {
    use cinder_kernel::{fs, process};

    let image = match fs::vfs().resolve("/", "/bin/init") {
        Ok(node) => {
            let size = node.metadata().map(|m| m.size).unwrap_or(0);
            let mut data = alloc::vec![0u8; size];
            match node.read(0, &mut data) {
                Ok(n) => {
                    data.truncate(n);
                    Some(data)
                }
                Err(_) => None,
            }
        }
        Err(_) => None,
    };

    match image {
        Some(image) if !image.is_empty() => {
            match process::spawn_user("init", &image, &["init"], process::IDLE_PID, 0, 0) {
                Ok(pid) => log::info!("init spawned as pid {}", pid),
                Err(err) => log::error!("failed to spawn init: {}", err),
            }
        }
        _ => log::warn!("no /bin/init image; staying in idle"),
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
extern crate alloc;

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    println!("KERNEL PANIC: {}", info);
    cinder_kernel::arch::halt_loop()
}

// Host builds of the binary only exist so `cargo build` succeeds on the
// development machine; the kernel proper is the i686 image.
#[cfg(not(target_os = "none"))]
fn main() {
    println!("cinder-kernel is a bare-metal image; run the test suite or build for i686.");
    let _ = logger::level_from_cmdline("");
    let _ = boot::get();
}
