//! Diagnostic syscalls: uptime, uname, meminfo, date, ps, scroll.

use super::userspace;
use crate::error::{KernelError, KernelResult};
use crate::process::{with_current, ProcessState, table::PROCESS_TABLE};

fn copy_out_struct<T: Copy>(ptr: usize, value: &T) -> KernelResult<()> {
    let bytes = unsafe {
        core::slice::from_raw_parts(value as *const T as *const u8, core::mem::size_of::<T>())
    };
    with_current(|p| userspace::copy_out_bytes(&p.address_space, ptr, bytes))
        .ok_or(KernelError::NotInitialized { subsystem: "process" })?
}

/// uptime() -> scheduler ticks since boot
pub fn sys_uptime() -> KernelResult<i32> {
    Ok(crate::timer::uptime_ticks() as i32)
}

/// The record `uname` writes to user space.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct UserUname {
    pub sysname: [u8; 32],
    pub release: [u8; 32],
    pub machine: [u8; 32],
}

fn fill(field: &mut [u8; 32], value: &str) {
    let n = value.len().min(31);
    field[..n].copy_from_slice(&value.as_bytes()[..n]);
}

/// uname(buf)
pub fn sys_uname(buf_ptr: usize) -> KernelResult<i32> {
    let mut record = UserUname {
        sysname: [0; 32],
        release: [0; 32],
        machine: [0; 32],
    };
    fill(&mut record.sysname, "CinderOS");
    fill(&mut record.release, env!("CARGO_PKG_VERSION"));
    fill(&mut record.machine, "i686");
    copy_out_struct(buf_ptr, &record)?;
    Ok(0)
}

/// meminfo(buf): frame and heap statistics.
pub fn sys_meminfo(buf_ptr: usize) -> KernelResult<i32> {
    let info = crate::mm::meminfo();
    copy_out_struct(buf_ptr, &info)?;
    Ok(0)
}

/// date(buf): current wall-clock time.
pub fn sys_date(buf_ptr: usize) -> KernelResult<i32> {
    let now = crate::timer::now();
    copy_out_struct(buf_ptr, &now)?;
    Ok(0)
}

/// One `ps` record.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct UserPsEntry {
    pub pid: u32,
    pub ppid: u32,
    pub state: u32,
    pub name: [u8; 16],
}

fn state_code(state: ProcessState) -> u32 {
    match state {
        ProcessState::Unused => 0,
        ProcessState::Ready => 1,
        ProcessState::Running => 2,
        ProcessState::Blocked => 3,
        ProcessState::Sleeping => 4,
        ProcessState::Zombie => 5,
    }
}

/// ps(buf, max) -> number of entries written
pub fn sys_ps(buf_ptr: usize, max: usize) -> KernelResult<i32> {
    let mut entries: alloc::vec::Vec<UserPsEntry> = alloc::vec::Vec::new();
    PROCESS_TABLE.for_each(|p| {
        if entries.len() >= max {
            return;
        }
        let mut record = UserPsEntry {
            pid: p.pid.0,
            ppid: p.parent.0,
            state: state_code(p.state),
            name: [0; 16],
        };
        let n = p.name.len().min(15);
        record.name[..n].copy_from_slice(&p.name.as_bytes()[..n]);
        entries.push(record);
    });

    let bytes = unsafe {
        core::slice::from_raw_parts(
            entries.as_ptr() as *const u8,
            entries.len() * core::mem::size_of::<UserPsEntry>(),
        )
    };
    with_current(|p| userspace::copy_out_bytes(&p.address_space, buf_ptr, bytes))
        .ok_or(KernelError::NotInitialized { subsystem: "process" })??;
    Ok(entries.len() as i32)
}

/// scroll(): scroll the console one line.
pub fn sys_scroll() -> KernelResult<i32> {
    crate::fs::console::scroll();
    Ok(0)
}
