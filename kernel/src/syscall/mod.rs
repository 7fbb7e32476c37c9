//! System-call interface.
//!
//! User code raises vector 0x80 with the call number in EAX and up to five
//! arguments in EBX/ECX/EDX/ESI/EDI. The dispatcher indexes a typed
//! handler, stores the signed result back into the saved EAX, and forces
//! the interrupt flag on so ring 3 never resumes masked. Unknown numbers
//! fail with `ENOSYS`.

use crate::arch::frame::TrapFrame;
use crate::error::{Errno, KernelResult};

mod filesystem;
mod info;
mod memory;
mod process;
mod signal;
pub mod userspace;

/// Syscall numbers (the user-space ABI).
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Exit = 1,
    Fork = 2,
    Read = 3,
    Write = 4,
    Open = 5,
    Close = 6,
    Waitpid = 7,
    Exec = 8,
    Chdir = 9,
    Getcwd = 10,
    Mkdir = 11,
    Unlink = 12,
    Readdir = 13,
    Stat = 14,
    Dup2 = 15,
    Pipe = 16,
    Sbrk = 17,
    Getpid = 18,
    Getuid = 19,
    Yield = 20,
    Sleep = 21,
    Kill = 22,
    Signal = 23,
    Sigreturn = 24,
    Uptime = 25,
    Uname = 26,
    Meminfo = 27,
    Date = 28,
    Ps = 29,
    Scroll = 30,
    Lseek = 31,
    Chmod = 32,
    Chown = 33,
    Dup = 34,
}

/// Number of the `sigreturn` call, baked into the signal trampoline.
pub const SYS_SIGRETURN: usize = Syscall::Sigreturn as usize;

impl TryFrom<usize> for Syscall {
    type Error = ();

    fn try_from(value: usize) -> Result<Self, ()> {
        Ok(match value {
            1 => Self::Exit,
            2 => Self::Fork,
            3 => Self::Read,
            4 => Self::Write,
            5 => Self::Open,
            6 => Self::Close,
            7 => Self::Waitpid,
            8 => Self::Exec,
            9 => Self::Chdir,
            10 => Self::Getcwd,
            11 => Self::Mkdir,
            12 => Self::Unlink,
            13 => Self::Readdir,
            14 => Self::Stat,
            15 => Self::Dup2,
            16 => Self::Pipe,
            17 => Self::Sbrk,
            18 => Self::Getpid,
            19 => Self::Getuid,
            20 => Self::Yield,
            21 => Self::Sleep,
            22 => Self::Kill,
            23 => Self::Signal,
            24 => Self::Sigreturn,
            25 => Self::Uptime,
            26 => Self::Uname,
            27 => Self::Meminfo,
            28 => Self::Date,
            29 => Self::Ps,
            30 => Self::Scroll,
            31 => Self::Lseek,
            32 => Self::Chmod,
            33 => Self::Chown,
            34 => Self::Dup,
            _ => return Err(()),
        })
    }
}

/// Collapse a handler result into the signed ABI status.
fn status(result: KernelResult<i32>) -> i32 {
    match result {
        Ok(value) => value,
        Err(err) => Errno::from(err).as_return_value(),
    }
}

/// Entry from the trap dispatcher on vector 0x80.
pub fn dispatch(frame: &mut TrapFrame) {
    let nr = frame.syscall_number();
    let [a1, a2, a3, a4, a5] = frame.syscall_args();

    let result: i32 = match Syscall::try_from(nr) {
        Err(()) => Errno::Enosys.as_return_value(),
        Ok(call) => match call {
            Syscall::Exit => process::sys_exit(a1 as i32, frame),
            Syscall::Fork => status(process::sys_fork(frame)),
            Syscall::Exec => status(process::sys_exec(a1, a2, frame)),
            Syscall::Waitpid => status(process::sys_waitpid(a1)),
            Syscall::Getpid => status(process::sys_getpid()),
            Syscall::Getuid => status(process::sys_getuid()),
            Syscall::Yield => status(process::sys_yield()),
            Syscall::Sleep => status(process::sys_sleep(a1)),

            Syscall::Open => status(filesystem::sys_open(a1, a2)),
            Syscall::Close => status(filesystem::sys_close(a1)),
            Syscall::Read => status(filesystem::sys_read(a1, a2, a3)),
            Syscall::Write => status(filesystem::sys_write(a1, a2, a3)),
            Syscall::Readdir => status(filesystem::sys_readdir(a1, a2, a3)),
            Syscall::Stat => status(filesystem::sys_stat(a1, a2)),
            Syscall::Mkdir => status(filesystem::sys_mkdir(a1)),
            Syscall::Unlink => status(filesystem::sys_unlink(a1)),
            Syscall::Chdir => status(filesystem::sys_chdir(a1)),
            Syscall::Getcwd => status(filesystem::sys_getcwd(a1, a2)),
            Syscall::Pipe => status(filesystem::sys_pipe(a1)),
            Syscall::Dup2 => status(filesystem::sys_dup2(a1, a2)),
            Syscall::Dup => status(filesystem::sys_dup(a1)),
            Syscall::Lseek => status(filesystem::sys_lseek(a1, a2 as i32, a3)),
            Syscall::Chmod => status(filesystem::sys_chmod(a1, a2)),
            Syscall::Chown => status(filesystem::sys_chown(a1, a2, a3)),

            Syscall::Sbrk => status(memory::sys_sbrk(a1 as isize)),

            Syscall::Kill => status(signal::sys_kill(a1, a2)),
            Syscall::Signal => status(signal::sys_signal(a1, a2)),
            Syscall::Sigreturn => status(signal::sys_sigreturn(a1, frame)),

            Syscall::Uptime => status(info::sys_uptime()),
            Syscall::Uname => status(info::sys_uname(a1)),
            Syscall::Meminfo => status(info::sys_meminfo(a1)),
            Syscall::Date => status(info::sys_date(a1)),
            Syscall::Ps => status(info::sys_ps(a1, a2)),
            Syscall::Scroll => status(info::sys_scroll()),
        },
    };

    let _ = (a4, a5);
    frame.set_return_value(result);
    frame.force_interrupts_enabled();
}

/// Park the caller until `channel` wakes.
///
/// A signal arriving while blocked cancels the wait with `Interrupted`;
/// the caller's retry loop bails out and the signal is delivered on the
/// way back to ring 3.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub(crate) fn block_or_fail(channel: crate::sched::WaitChannel) -> KernelResult<()> {
    crate::sched::block_current_on(channel);
    let interrupted =
        crate::process::with_current(|p| p.pending_signals != 0).unwrap_or(false);
    if interrupted {
        Err(crate::error::KernelError::Interrupted)
    } else {
        Ok(())
    }
}

/// Host builds cannot block a real process; fail with `WouldBlock`.
#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub(crate) fn block_or_fail(channel: crate::sched::WaitChannel) -> KernelResult<()> {
    let _ = channel;
    Err(crate::error::KernelError::WouldBlock)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_numbers_fail_generically() {
        let mut frame = TrapFrame::user_entry(0, 0);
        frame.eax = 9999;
        dispatch(&mut frame);
        assert_eq!(frame.eax as i32, Errno::Enosys.as_return_value());
    }

    #[test]
    fn dispatch_always_restores_if() {
        let mut frame = TrapFrame::user_entry(0, 0);
        frame.eflags = 0;
        frame.eax = 9999;
        dispatch(&mut frame);
        assert_ne!(frame.eflags & crate::arch::frame::EFLAGS_IF, 0);
    }

    #[test]
    fn numbers_round_trip() {
        for nr in 1..=34usize {
            let call = Syscall::try_from(nr).unwrap();
            assert_eq!(call as usize, nr);
        }
        assert!(Syscall::try_from(0).is_err());
        assert!(Syscall::try_from(35).is_err());
    }
}
