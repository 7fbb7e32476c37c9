//! Kernel-to-kernel context switch.
//!
//! Only the callee-saved registers and ESP need saving: everything else is
//! already in the outgoing process's trap frame or is caller-saved around
//! the `switch_context` call. The incoming process resumes wherever its
//! kernel ESP says -- either inside the scheduler (preempted earlier) or at
//! a hand-built initial stack that `ret`s into `trap_return`.

core::arch::global_asm!(
    r#"
.section .text
.global switch_context
// switch_context(old_esp_slot: *mut u32, new_esp: u32)
switch_context:
    push ebp
    push ebx
    push esi
    push edi
    mov eax, [esp + 20]     // old_esp_slot
    mov [eax], esp
    mov eax, [esp + 24]     // new_esp
    mov esp, eax
    pop edi
    pop esi
    pop ebx
    pop ebp
    ret
"#
);

extern "C" {
    /// Swap kernel stacks: store the current ESP through `old_esp_slot`,
    /// then adopt `new_esp` and return into the incoming context.
    pub fn switch_context(old_esp_slot: *mut u32, new_esp: u32);
}

/// Address new process stacks use as their `ret` target (the trampoline's
/// restore path).
pub fn trap_return_address() -> u32 {
    super::idt::trap_return as usize as u32
}
