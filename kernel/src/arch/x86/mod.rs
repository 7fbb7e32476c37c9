//! i686 protected-mode support: descriptor tables, the interrupt
//! trampoline, paging, and the handful of devices the kernel core talks to
//! directly (PIT, PIC, CMOS RTC, VGA text, 16550 serial, PS/2 keyboard).

pub mod context;
pub mod gdt;
pub mod idt;
pub mod keyboard;
pub mod paging;
pub mod pic;
pub mod pit;
pub mod rtc;
pub mod serial;
pub mod vga;

/// Whether maskable interrupts are currently enabled.
///
/// # Safety
///
/// Reads EFLAGS; always safe in ring 0, marked unsafe for symmetry with the
/// enable/disable pair.
pub unsafe fn interrupts_enabled() -> bool {
    let flags: u32;
    unsafe {
        core::arch::asm!("pushfd; pop {}", out(reg) flags, options(nomem, preserves_flags));
    }
    flags & crate::arch::frame::EFLAGS_IF != 0
}

/// Mask maskable interrupts (`cli`).
///
/// # Safety
///
/// Caller must re-enable interrupts or the machine stops preempting.
pub unsafe fn disable_interrupts() {
    unsafe { x86::irq::disable() };
}

/// Unmask maskable interrupts (`sti`).
///
/// # Safety
///
/// Must not be called inside a critical section that assumes exclusion.
pub unsafe fn enable_interrupts() {
    unsafe { x86::irq::enable() };
}

/// Wait for the next interrupt (`hlt`).
///
/// # Safety
///
/// With interrupts masked this never returns.
pub unsafe fn halt() {
    unsafe { x86::halt() };
}

/// Faulting linear address of the most recent page fault (CR2).
pub fn read_cr2() -> usize {
    unsafe { x86::controlregs::cr2() }
}

/// Full CPU setup: GDT + TSS, IDT, PIC remap, PIT at the scheduler tick
/// rate. Interrupts stay disabled; the caller enables them when the
/// scheduler is ready.
pub fn init() {
    gdt::init();
    idt::init();
    pic::init();
    pit::init();
    log::info!("cpu: gdt/idt/pic/pit initialized");
}
