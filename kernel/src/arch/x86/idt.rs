//! Interrupt Descriptor Table and the shared trap trampoline.
//!
//! All 256 vectors funnel through `trap_common`, which spills the CPU state
//! into a [`TrapFrame`](crate::arch::frame::TrapFrame), switches to kernel
//! data segments, and calls [`trap_dispatch`]. Handlers registered per
//! vector receive the mutable frame; whatever they leave there is what the
//! CPU restores on `iretd`.

use spin::Mutex;
use x86::dtables::{self, DescriptorTablePointer};

use crate::arch::frame::{KERNEL_CODE_SELECTOR, TrapFrame};

/// Vector used by `int $0x80` system calls.
pub const SYSCALL_VECTOR: usize = 0x80;
/// PIC-remapped IRQ base: IRQ0 = vector 32.
pub const IRQ_BASE: usize = 0x20;

/// One handler per vector, installed at init time.
type TrapHandler = fn(&mut TrapFrame);

static HANDLERS: Mutex<[Option<TrapHandler>; 256]> = Mutex::new([None; 256]);

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct IdtEntry {
    offset_low: u16,
    selector: u16,
    zero: u8,
    type_attr: u8,
    offset_high: u16,
}

impl IdtEntry {
    const MISSING: Self = Self {
        offset_low: 0,
        selector: 0,
        zero: 0,
        type_attr: 0,
        offset_high: 0,
    };

    /// A 32-bit interrupt gate (interrupts auto-masked on entry).
    fn interrupt_gate(handler: u32, dpl: u8) -> Self {
        Self {
            offset_low: handler as u16,
            selector: KERNEL_CODE_SELECTOR,
            zero: 0,
            type_attr: 0x8E | (dpl << 5), // present, 32-bit interrupt gate
            offset_high: (handler >> 16) as u16,
        }
    }
}

static mut IDT: [IdtEntry; 256] = [IdtEntry::MISSING; 256];

// The per-vector stubs. Vectors 8, 10-14, and 17 get a CPU-pushed error
// code; the rest push a zero so the frame layout is uniform. `trap_return`
// is also the resume path for freshly built process stacks.
core::arch::global_asm!(
    r#"
.altmacro
.macro vector num
    .align 4
vector\num:
    .if !((\num == 8) || ((\num >= 10) && (\num <= 14)) || (\num == 17))
    push 0
    .endif
    push \num
    jmp trap_common
.endm

.section .text
trap_common:
    pushad
    push ds
    push es
    push fs
    push gs
    mov ax, 0x10
    mov ds, ax
    mov es, ax
    mov fs, ax
    mov gs, ax
    push esp
    call trap_dispatch
    add esp, 4
.global trap_return
trap_return:
    pop gs
    pop fs
    pop es
    pop ds
    popad
    add esp, 8
    iretd

.set i, 0
.rept 256
    vector %i
    .set i, i+1
.endr

.macro vec_entry num
    .long vector\num
.endm

.section .rodata
.global vector_table
.align 4
vector_table:
.set i, 0
.rept 256
    vec_entry %i
    .set i, i+1
.endr
.section .text
"#
);

extern "C" {
    static vector_table: [u32; 256];
    /// Restore path of the trampoline; initial process stacks `ret` here.
    pub fn trap_return() -> !;
}

/// Install a handler for one vector. Later registrations replace earlier
/// ones.
pub fn register_handler(vector: usize, handler: TrapHandler) {
    HANDLERS.lock()[vector] = Some(handler);
}

/// Build the IDT and load it. The syscall gate is the only one reachable
/// from ring 3.
pub fn init() {
    unsafe {
        let idt = core::ptr::addr_of_mut!(IDT);
        for vector in 0..256 {
            let dpl = if vector == SYSCALL_VECTOR { 3 } else { 0 };
            (*idt)[vector] = IdtEntry::interrupt_gate(vector_table[vector], dpl);
        }
        let idtp = DescriptorTablePointer::new_from_slice(&*core::ptr::addr_of!(IDT));
        dtables::lidt(&idtp);
    }

    register_handler(14, crate::mm::page_fault::handle);
    register_handler(IRQ_BASE, timer_interrupt);
    register_handler(IRQ_BASE + 1, super::keyboard::interrupt);
    register_handler(SYSCALL_VECTOR, crate::syscall::dispatch);
}

fn timer_interrupt(frame: &mut TrapFrame) {
    super::pic::end_of_interrupt(0);
    crate::timer::on_tick(frame);
}

/// Exception mnemonics for the fault diagnostic line.
const EXCEPTION_NAMES: [&str; 20] = [
    "divide error",
    "debug",
    "nmi",
    "breakpoint",
    "overflow",
    "bound range",
    "invalid opcode",
    "device not available",
    "double fault",
    "coprocessor overrun",
    "invalid tss",
    "segment not present",
    "stack fault",
    "general protection fault",
    "page fault",
    "reserved",
    "x87 fpu error",
    "alignment check",
    "machine check",
    "simd error",
];

/// C-ABI entry from `trap_common`.
///
/// After the vectored handler runs, pending signals are delivered and the
/// saved IF bit is forced on for any frame returning to ring 3.
#[no_mangle]
extern "C" fn trap_dispatch(frame: &mut TrapFrame) {
    let vector = frame.vector as usize;

    let handler = HANDLERS.lock()[vector];
    match handler {
        Some(h) => h(frame),
        None => unhandled(frame, vector),
    }

    if frame.from_user() {
        crate::process::signals::deliver_pending(frame);
        frame.force_interrupts_enabled();
    }
}

fn unhandled(frame: &mut TrapFrame, vector: usize) {
    if (IRQ_BASE..IRQ_BASE + 16).contains(&vector) {
        // Spurious or unclaimed hardware interrupt; acknowledge and go on.
        super::pic::end_of_interrupt((vector - IRQ_BASE) as u8);
        return;
    }
    let name = EXCEPTION_NAMES.get(vector).copied().unwrap_or("unknown");
    if frame.from_user() {
        let pid = crate::process::current_pid();
        log::error!(
            "exception: pid {} {} (vector {}) eip={:#010x} err={:#x}",
            pid,
            name,
            vector,
            frame.eip,
            frame.error_code
        );
        crate::process::exit_current(crate::process::FAULT_EXIT_STATUS, frame);
    } else {
        panic!(
            "kernel exception: {} (vector {}) eip={:#010x} err={:#x}",
            name, vector, frame.eip, frame.error_code
        );
    }
}
