//! Signals: per-process action tables, permission-checked posting, and
//! delivery on return to user mode.
//!
//! Delivery never interrupts kernel execution: the trap dispatcher calls
//! [`deliver_pending`] only on frames that are about to `iret` to ring 3.
//! A caught signal gets a hand-built frame on the user stack whose return
//! path runs a tiny trampoline invoking the `sigreturn` syscall, restoring
//! the interrupted context verbatim.

use crate::error::{KernelError, KernelResult};
use crate::process::{table, Pid};

/// Number of signal numbers (1..=NSIG).
pub const NSIG: usize = 32;

pub const SIGHUP: usize = 1;
pub const SIGINT: usize = 2;
pub const SIGILL: usize = 4;
pub const SIGKILL: usize = 9;
pub const SIGSEGV: usize = 11;
pub const SIGPIPE: usize = 13;
pub const SIGTERM: usize = 15;
pub const SIGWINCH: usize = 28;

/// Sentinel handler values in the user ABI.
pub const SIG_DFL: usize = 0;
pub const SIG_IGN: usize = 1;

/// Exit status for a default-terminated signal.
pub fn termination_status(signum: usize) -> i32 {
    128 + signum as i32
}

/// Disposition of one signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    Default,
    Ignore,
    /// User handler entry point.
    Handler(usize),
}

impl SignalAction {
    /// Encode for the `signal` syscall's return value.
    pub fn to_user(self) -> usize {
        match self {
            Self::Default => SIG_DFL,
            Self::Ignore => SIG_IGN,
            Self::Handler(addr) => addr,
        }
    }

    /// Decode a handler argument from the `signal` syscall.
    pub fn from_user(value: usize) -> Self {
        match value {
            SIG_DFL => Self::Default,
            SIG_IGN => Self::Ignore,
            addr => Self::Handler(addr),
        }
    }
}

/// Whether a signal's default action is to ignore rather than terminate.
pub fn default_ignores(signum: usize) -> bool {
    matches!(signum, SIGWINCH)
}

/// Per-process signal dispositions.
#[derive(Clone)]
pub struct SignalTable {
    actions: [SignalAction; NSIG],
}

impl SignalTable {
    pub fn new() -> Self {
        Self {
            actions: [SignalAction::Default; NSIG],
        }
    }

    pub fn get(&self, signum: usize) -> SignalAction {
        self.actions[signum - 1]
    }

    /// Install a new action, returning the previous one. SIGKILL cannot be
    /// caught or ignored.
    pub fn set(&mut self, signum: usize, action: SignalAction) -> KernelResult<SignalAction> {
        if !(1..=NSIG).contains(&signum) {
            return Err(KernelError::InvalidSignal { signum });
        }
        if signum == SIGKILL && action != SignalAction::Default {
            return Err(KernelError::InvalidSignal { signum });
        }
        let old = self.actions[signum - 1];
        self.actions[signum - 1] = action;
        Ok(old)
    }

    /// Exec resets caught signals to default; ignored ones stay ignored.
    pub fn reset_for_exec(&mut self) {
        for action in self.actions.iter_mut() {
            if matches!(action, SignalAction::Handler(_)) {
                *action = SignalAction::Default;
            }
        }
    }
}

impl Default for SignalTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Post signal `signum` to `pid` on behalf of a sender with `sender_uid`.
///
/// Allowed when the sender is root or owns the target. The bit lands in the
/// target's pending mask; delivery happens at its next return to user mode.
/// Blocked or sleeping targets are woken if the signal would kill them, so
/// fatal signals cancel blocking syscalls.
pub fn kill(sender_uid: u32, pid: Pid, signum: usize) -> KernelResult<()> {
    if !(1..=NSIG).contains(&signum) {
        return Err(KernelError::InvalidSignal { signum });
    }
    let posted = table::with_process(pid, |p| {
        if sender_uid != 0 && sender_uid != p.uid {
            return Err(KernelError::PermissionDenied { operation: "kill" });
        }
        p.post_signal(signum);
        let fatal = match p.signals.get(signum) {
            SignalAction::Default => !default_ignores(signum),
            SignalAction::Ignore => false,
            SignalAction::Handler(_) => false,
        };
        Ok(fatal)
    })
    .ok_or(KernelError::ProcessNotFound { pid: pid.0 })??;

    if posted {
        crate::sched::cancel_blocking(pid);
    }
    Ok(())
}

// ============================================================================
// Delivery frame
// ============================================================================

/// User-mode context saved across a handler invocation.
///
/// Written to the user stack at delivery and read back by `sigreturn`; the
/// layout is ABI between kernel versions and the trampoline below.
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(C)]
pub struct SignalContext {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub eip: u32,
    pub eflags: u32,
    pub user_esp: u32,
}

pub const SIGNAL_CONTEXT_SIZE: usize = core::mem::size_of::<SignalContext>();

/// Trampoline executed when the user handler returns.
///
/// ```text
///   pop eax          ; drop the signum argument
///   mov ebx, esp     ; ebx = &SignalContext
///   mov eax, 24      ; SYS_SIGRETURN
///   int 0x80
///   ud2              ; sigreturn does not return here
/// ```
pub const SIGRETURN_TRAMPOLINE: [u8; 12] = [
    0x58, // pop eax
    0x89, 0xE3, // mov ebx, esp
    0xB8, 0x18, 0x00, 0x00, 0x00, // mov eax, 24
    0xCD, 0x80, // int 0x80
    0x0F, 0x0B, // ud2
];

/// The byte image pushed onto the user stack for one handler invocation,
/// plus the register values that start the handler.
pub struct DeliveryFrame {
    /// Bytes to copy to `user_esp` (ascending addresses).
    pub bytes: alloc::vec::Vec<u8>,
    /// New user stack pointer (address of the trampoline return slot).
    pub user_esp: u32,
    /// Handler entry point.
    pub user_eip: u32,
}

/// Lay out the delivery frame for `handler`/`signum` over an interrupted
/// context. Stack layout at handler entry, ascending:
///
/// ```text
/// esp  -> trampoline address   (handler's return address)
///         signum               (handler's argument)
///         SignalContext        (read back by sigreturn)
///         trampoline code      (12 bytes, 4-aligned)
/// ```
pub fn build_delivery_frame(context: &SignalContext, signum: usize, handler: usize) -> DeliveryFrame {
    let old_esp = context.user_esp;

    // Trampoline code sits highest, just below the interrupted stack top.
    let code_size = (SIGRETURN_TRAMPOLINE.len() + 3) & !3;
    let code_addr = (old_esp as usize - code_size) & !3;
    let context_addr = code_addr - SIGNAL_CONTEXT_SIZE;
    let signum_addr = context_addr - 4;
    let retaddr_addr = signum_addr - 4;

    let total = old_esp as usize - retaddr_addr;
    let mut bytes = alloc::vec![0u8; total];
    let base = retaddr_addr;

    bytes[0..4].copy_from_slice(&(code_addr as u32).to_le_bytes());
    bytes[4..8].copy_from_slice(&(signum as u32).to_le_bytes());

    let ctx_off = context_addr - base;
    let ctx_words = [
        context.eax,
        context.ebx,
        context.ecx,
        context.edx,
        context.esi,
        context.edi,
        context.ebp,
        context.eip,
        context.eflags,
        context.user_esp,
    ];
    for (i, word) in ctx_words.iter().enumerate() {
        bytes[ctx_off + i * 4..ctx_off + i * 4 + 4].copy_from_slice(&word.to_le_bytes());
    }

    let code_off = code_addr - base;
    bytes[code_off..code_off + SIGRETURN_TRAMPOLINE.len()].copy_from_slice(&SIGRETURN_TRAMPOLINE);

    DeliveryFrame {
        bytes,
        user_esp: retaddr_addr as u32,
        user_eip: handler as u32,
    }
}

/// Decode a `SignalContext` from the bytes `sigreturn` copied back in.
pub fn parse_signal_context(bytes: &[u8; SIGNAL_CONTEXT_SIZE]) -> SignalContext {
    let word = |i: usize| u32::from_le_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap());
    SignalContext {
        eax: word(0),
        ebx: word(1),
        ecx: word(2),
        edx: word(3),
        esi: word(4),
        edi: word(5),
        ebp: word(6),
        eip: word(7),
        eflags: word(8),
        user_esp: word(9),
    }
}

/// Deliver pending signals to the frame about to return to ring 3.
///
/// Ignored signals are consumed silently; a default-terminate signal kills
/// the process; at most one handler is invoked per return so nested
/// deliveries stay bounded by user-stack depth.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn deliver_pending(frame: &mut crate::arch::frame::TrapFrame) {
    use crate::arch::frame::TrapFrame;

    loop {
        let taken = table::with_current(|p| {
            let signum = p.take_pending_signal()?;
            Some((signum, p.signals.get(signum)))
        })
        .flatten();

        let (signum, action) = match taken {
            Some(pair) => pair,
            None => return,
        };

        match action {
            SignalAction::Ignore => continue,
            SignalAction::Default if default_ignores(signum) => continue,
            SignalAction::Default => {
                let pid = table::current_pid();
                log::info!("signal {} terminates pid {}", signum, pid);
                crate::process::exit_current(termination_status(signum), frame);
            }
            SignalAction::Handler(handler) => {
                invoke_handler(frame, signum, handler);
                return;
            }
        }
    }

    fn invoke_handler(frame: &mut TrapFrame, signum: usize, handler: usize) {
        let context = SignalContext {
            eax: frame.eax,
            ebx: frame.ebx,
            ecx: frame.ecx,
            edx: frame.edx,
            esi: frame.esi,
            edi: frame.edi,
            ebp: frame.ebp,
            eip: frame.eip,
            eflags: frame.eflags,
            user_esp: frame.user_esp,
        };
        let delivery = build_delivery_frame(&context, signum, handler);

        let copied = table::with_current(|p| {
            crate::syscall::userspace::copy_out_bytes(
                &p.address_space,
                delivery.user_esp as usize,
                &delivery.bytes,
            )
        });

        match copied {
            Some(Ok(())) => {
                frame.user_esp = delivery.user_esp;
                frame.eip = delivery.user_eip;
            }
            _ => {
                // No room on the user stack for the frame: the process
                // cannot take the signal, treat it as fatal.
                crate::process::exit_current(termination_status(signum), frame);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::string::String;

    use super::*;
    use crate::error::KernelError;
    use crate::mm::address_space::AddressSpace;
    use crate::process::pcb::{Process, ProcessState};
    use crate::process::table::PROCESS_TABLE;

    #[test]
    fn kill_requires_root_or_matching_uid() {
        let _guard = crate::mm::test_lock();
        let target = PROCESS_TABLE.alloc_pid();
        let mut victim = Process::new(
            target,
            crate::process::Pid(0),
            String::from("victim"),
            AddressSpace::new().unwrap(),
        );
        victim.uid = 1001;
        victim.state = ProcessState::Running;
        PROCESS_TABLE.insert(victim).unwrap();

        // A stranger (uid 1000) is refused and no bit is set.
        let err = kill(1000, target, SIGTERM).unwrap_err();
        assert!(matches!(err, KernelError::PermissionDenied { .. }));
        assert_eq!(
            crate::process::with_process(target, |p| p.pending_signals),
            Some(0)
        );

        // Root and the owner both succeed.
        kill(0, target, SIGTERM).unwrap();
        kill(1001, target, SIGINT).unwrap();
        let pending = crate::process::with_process(target, |p| p.pending_signals).unwrap();
        assert_ne!(pending & (1 << (SIGTERM - 1)), 0);
        assert_ne!(pending & (1 << (SIGINT - 1)), 0);

        PROCESS_TABLE.remove(target);
    }

    #[test]
    fn kill_unknown_pid_or_signal_fails() {
        let _guard = crate::mm::test_lock();
        assert!(kill(0, crate::process::Pid(999_999), SIGTERM).is_err());

        let target = PROCESS_TABLE.alloc_pid();
        let p = Process::new(
            target,
            crate::process::Pid(0),
            String::from("t"),
            AddressSpace::new().unwrap(),
        );
        PROCESS_TABLE.insert(p).unwrap();
        assert!(kill(0, target, 0).is_err());
        assert!(kill(0, target, NSIG + 1).is_err());
        PROCESS_TABLE.remove(target);
    }

    #[test]
    fn default_actions_split_terminate_and_ignore() {
        assert!(default_ignores(SIGWINCH));
        assert!(!default_ignores(SIGTERM));
        assert!(!default_ignores(SIGINT));
        assert!(!default_ignores(SIGKILL));
    }

    #[test]
    fn signal_installs_and_returns_previous() {
        let mut t = SignalTable::new();
        let old = t.set(SIGTERM, SignalAction::Handler(0x0804_8000)).unwrap();
        assert_eq!(old, SignalAction::Default);
        let old = t.set(SIGTERM, SignalAction::Ignore).unwrap();
        assert_eq!(old, SignalAction::Handler(0x0804_8000));
    }

    #[test]
    fn sigkill_cannot_be_caught() {
        let mut t = SignalTable::new();
        assert!(t.set(SIGKILL, SignalAction::Ignore).is_err());
        assert!(t.set(SIGKILL, SignalAction::Handler(0x1000)).is_err());
        assert!(t.set(SIGKILL, SignalAction::Default).is_ok());
    }

    #[test]
    fn exec_reset_keeps_ignore_drops_handlers() {
        let mut t = SignalTable::new();
        t.set(SIGINT, SignalAction::Handler(0x1000)).unwrap();
        t.set(SIGHUP, SignalAction::Ignore).unwrap();
        t.reset_for_exec();
        assert_eq!(t.get(SIGINT), SignalAction::Default);
        assert_eq!(t.get(SIGHUP), SignalAction::Ignore);
    }

    #[test]
    fn termination_status_is_distinctive() {
        assert_eq!(termination_status(SIGTERM), 143);
        assert_eq!(termination_status(SIGKILL), 137);
    }

    #[test]
    fn delivery_frame_layout_round_trips() {
        let context = SignalContext {
            eax: 1,
            ebx: 2,
            ecx: 3,
            edx: 4,
            esi: 5,
            edi: 6,
            ebp: 7,
            eip: 0x0804_8123,
            eflags: 0x202,
            user_esp: 0xBFFF_F000,
        };
        let d = build_delivery_frame(&context, SIGTERM, 0x0804_9000);

        // Stack stays 4-aligned and strictly below the old top.
        assert_eq!(d.user_esp % 4, 0);
        assert!(d.user_esp < context.user_esp);
        assert_eq!(d.user_eip, 0x0804_9000);

        // Word 0: trampoline address; word 1: signum.
        let ret = u32::from_le_bytes(d.bytes[0..4].try_into().unwrap());
        let signum = u32::from_le_bytes(d.bytes[4..8].try_into().unwrap());
        assert_eq!(signum, SIGTERM as u32);

        // The trampoline bytes really live at the advertised address.
        let code_off = (ret - d.user_esp) as usize;
        assert_eq!(
            &d.bytes[code_off..code_off + SIGRETURN_TRAMPOLINE.len()],
            &SIGRETURN_TRAMPOLINE
        );

        // The saved context parses back to the original.
        let ctx_off = 8;
        let mut raw = [0u8; SIGNAL_CONTEXT_SIZE];
        raw.copy_from_slice(&d.bytes[ctx_off..ctx_off + SIGNAL_CONTEXT_SIZE]);
        assert_eq!(parse_signal_context(&raw), context);
    }

    #[test]
    fn trampoline_invokes_sigreturn() {
        // mov eax, imm32 with the sigreturn syscall number.
        assert_eq!(SIGRETURN_TRAMPOLINE[3], 0xB8);
        let nr = u32::from_le_bytes(SIGRETURN_TRAMPOLINE[4..8].try_into().unwrap());
        assert_eq!(nr as usize, crate::syscall::SYS_SIGRETURN);
        // int 0x80
        assert_eq!(&SIGRETURN_TRAMPOLINE[8..10], &[0xCD, 0x80]);
    }
}
