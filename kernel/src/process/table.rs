//! The global process table.
//!
//! A fixed arena of slots; parent/child relationships are PIDs resolved
//! through the table, never pointers, so the ownership graph stays acyclic.
//! Interrupt-time code (the scheduler tick) touches the table, so mutation
//! from thread context happens with interrupts masked around the lock.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use spin::Mutex;

use super::pcb::{Process, ProcessState};
use super::{Pid, MAX_PROCESSES};
use crate::error::{KernelError, KernelResult};

struct TableInner {
    slots: [Option<Box<Process>>; MAX_PROCESSES],
    next_pid: u32,
}

pub struct ProcessTable {
    inner: Mutex<TableInner>,
}

impl ProcessTable {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(TableInner {
                slots: [const { None }; MAX_PROCESSES],
                next_pid: 1,
            }),
        }
    }

    /// Reserve a fresh PID.
    pub fn alloc_pid(&self) -> Pid {
        let mut inner = self.inner.lock();
        let pid = Pid(inner.next_pid);
        inner.next_pid += 1;
        pid
    }

    /// Install a PCB into a free slot.
    pub fn insert(&self, process: Process) -> KernelResult<Pid> {
        let pid = process.pid;
        let mut inner = self.inner.lock();
        let slot = inner
            .slots
            .iter_mut()
            .find(|s| s.is_none())
            .ok_or(KernelError::ProcessTableFull)?;
        *slot = Some(Box::new(process));
        Ok(pid)
    }

    /// Remove a PCB (at reap time), returning ownership to the caller.
    pub fn remove(&self, pid: Pid) -> Option<Box<Process>> {
        let mut inner = self.inner.lock();
        for slot in inner.slots.iter_mut() {
            if slot.as_ref().is_some_and(|p| p.pid == pid) {
                return slot.take();
            }
        }
        None
    }

    /// Run `f` against the PCB for `pid`, if present.
    pub fn with<R>(&self, pid: Pid, f: impl FnOnce(&mut Process) -> R) -> Option<R> {
        crate::arch::without_interrupts(|| {
            let mut inner = self.inner.lock();
            inner
                .slots
                .iter_mut()
                .flatten()
                .find(|p| p.pid == pid)
                .map(|p| f(p))
        })
    }

    /// Run `f` over every PCB.
    pub fn for_each(&self, mut f: impl FnMut(&Process)) {
        crate::arch::without_interrupts(|| {
            let inner = self.inner.lock();
            for p in inner.slots.iter().flatten() {
                f(p);
            }
        })
    }

    /// PIDs of all live children of `parent`.
    pub fn children_of(&self, parent: Pid) -> Vec<Pid> {
        let mut pids = Vec::new();
        self.for_each(|p| {
            if p.parent == parent {
                pids.push(p.pid);
            }
        });
        pids
    }

    /// First zombie child of `parent`, with its exit status.
    pub fn zombie_child_of(&self, parent: Pid) -> Option<(Pid, i32)> {
        let mut found = None;
        self.for_each(|p| {
            if found.is_none() && p.parent == parent && p.state == ProcessState::Zombie {
                found = Some((p.pid, p.exit_status));
            }
        });
        found
    }

    /// Number of occupied slots.
    pub fn count(&self) -> usize {
        let mut n = 0;
        self.for_each(|_| n += 1);
        n
    }
}

/// The one process table.
pub static PROCESS_TABLE: ProcessTable = ProcessTable::new();

/// PID of the process currently on the CPU.
static CURRENT: AtomicU32 = AtomicU32::new(0);

pub fn current_pid() -> Pid {
    Pid(CURRENT.load(Ordering::Relaxed))
}

pub fn set_current_pid(pid: Pid) {
    CURRENT.store(pid.0, Ordering::Relaxed);
}

/// Run `f` against the PCB for `pid`.
pub fn with_process<R>(pid: Pid, f: impl FnOnce(&mut Process) -> R) -> Option<R> {
    PROCESS_TABLE.with(pid, f)
}

/// Run `f` against the current process's PCB.
pub fn with_current<R>(f: impl FnOnce(&mut Process) -> R) -> Option<R> {
    PROCESS_TABLE.with(current_pid(), f)
}
