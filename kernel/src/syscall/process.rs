//! Process-lifecycle syscalls.

use alloc::string::String;
use alloc::vec::Vec;

use super::userspace;
use crate::arch::frame::TrapFrame;
use crate::error::{KernelError, KernelResult};
use crate::fs::PATH_MAX;
use crate::process;
use crate::sched::WaitChannel;

/// Most argv entries `exec` accepts.
const ARG_MAX: usize = 32;

/// Terminate the calling process with `status`.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn sys_exit(status: i32, frame: &mut TrapFrame) -> i32 {
    process::exit_current(status & 0xFF, frame)
}

/// Terminate the calling process with `status` (host builds do the
/// bookkeeping and return).
#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub fn sys_exit(status: i32, _frame: &mut TrapFrame) -> i32 {
    process::exit_process(process::current_pid(), status & 0xFF);
    0
}

/// Duplicate the caller; returns the child PID here, 0 in the child.
pub fn sys_fork(frame: &mut TrapFrame) -> KernelResult<i32> {
    let child = process::fork::fork(frame)?;
    Ok(child.0 as i32)
}

/// Replace the caller's image. `argv_ptr` may be 0 for an empty vector.
pub fn sys_exec(path_ptr: usize, argv_ptr: usize, frame: &mut TrapFrame) -> KernelResult<i32> {
    let (path, args) = process::with_current(|p| -> KernelResult<(String, Vec<String>)> {
        let path = userspace::copy_in_string(&p.address_space, path_ptr, PATH_MAX)?;
        let mut args = Vec::new();
        if argv_ptr != 0 {
            for i in 0..ARG_MAX {
                let entry = userspace::copy_in_words(&p.address_space, argv_ptr + i * 4, 1)?[0];
                if entry == 0 {
                    break;
                }
                args.push(userspace::copy_in_string(
                    &p.address_space,
                    entry as usize,
                    PATH_MAX,
                )?);
            }
        }
        Ok((path, args))
    })
    .ok_or(KernelError::NotInitialized { subsystem: "process" })??;

    let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
    process::exec::exec(&path, &arg_refs, frame)?;
    Ok(0)
}

/// Reap a child, blocking until one exits. Writes the status through
/// `status_ptr` when non-zero; returns the child's PID.
pub fn sys_waitpid(status_ptr: usize) -> KernelResult<i32> {
    let me = process::current_pid();
    loop {
        match process::wait_for_child(me) {
            Ok((pid, status)) => {
                if status_ptr != 0 {
                    process::with_current(|p| {
                        userspace::copy_out_bytes(
                            &p.address_space,
                            status_ptr,
                            &status.to_le_bytes(),
                        )
                    })
                    .ok_or(KernelError::NotInitialized { subsystem: "process" })??;
                }
                return Ok(pid.0 as i32);
            }
            Err(KernelError::WouldBlock) => {
                super::block_or_fail(WaitChannel::ChildExit(me))?;
            }
            Err(err) => return Err(err),
        }
    }
}

pub fn sys_getpid() -> KernelResult<i32> {
    Ok(process::current_pid().0 as i32)
}

pub fn sys_getuid() -> KernelResult<i32> {
    process::with_current(|p| p.uid as i32)
        .ok_or(KernelError::NotInitialized { subsystem: "process" })
}

/// Give up the CPU; always succeeds.
pub fn sys_yield() -> KernelResult<i32> {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    crate::sched::yield_now();
    Ok(0)
}

/// Sleep for at least `ms` milliseconds.
pub fn sys_sleep(ms: usize) -> KernelResult<i32> {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    crate::sched::sleep_current(ms as u64);
    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    let _ = ms;
    Ok(0)
}
