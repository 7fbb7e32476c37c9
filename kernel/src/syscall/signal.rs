//! Signal syscalls.

use super::userspace;
use crate::arch::frame::TrapFrame;
use crate::error::{KernelError, KernelResult};
use crate::process::signals::{
    self, parse_signal_context, SignalAction, NSIG, SIGNAL_CONTEXT_SIZE,
};
use crate::process::{with_current, Pid};

/// kill(pid, signum)
///
/// Permitted for root or a sender owning the target; on success the
/// signal's bit is set in the target's pending mask.
pub fn sys_kill(pid: usize, signum: usize) -> KernelResult<i32> {
    let sender_uid = with_current(|p| p.uid)
        .ok_or(KernelError::NotInitialized { subsystem: "process" })?;
    signals::kill(sender_uid, Pid(pid as u32), signum)?;
    Ok(0)
}

/// signal(signum, handler) -> previous handler value
///
/// `handler` is a user function address, or the SIG_DFL/SIG_IGN
/// sentinels.
pub fn sys_signal(signum: usize, handler: usize) -> KernelResult<i32> {
    if !(1..=NSIG).contains(&signum) {
        return Err(KernelError::InvalidSignal { signum });
    }
    let old = with_current(|p| p.signals.set(signum, SignalAction::from_user(handler)))
        .ok_or(KernelError::NotInitialized { subsystem: "process" })??;
    Ok(old.to_user() as i32)
}

/// sigreturn(context_ptr): restore the context interrupted by a signal
/// handler, exactly as the delivery trampoline saved it.
///
/// The "return value" is the restored EAX, so the dispatcher's write-back
/// is a no-op.
pub fn sys_sigreturn(context_ptr: usize, frame: &mut TrapFrame) -> KernelResult<i32> {
    let mut raw = [0u8; SIGNAL_CONTEXT_SIZE];
    with_current(|p| userspace::copy_in_bytes(&p.address_space, &mut raw, context_ptr))
        .ok_or(KernelError::NotInitialized { subsystem: "process" })??;
    let context = parse_signal_context(&raw);

    frame.eax = context.eax;
    frame.ebx = context.ebx;
    frame.ecx = context.ecx;
    frame.edx = context.edx;
    frame.esi = context.esi;
    frame.edi = context.edi;
    frame.ebp = context.ebp;
    frame.eip = context.eip;
    frame.user_esp = context.user_esp;
    // The flags come back from the frame, with IF forced by the
    // dispatcher like any other return to ring 3.
    frame.eflags = context.eflags | crate::arch::frame::EFLAGS_RESERVED;

    Ok(context.eax as i32)
}
