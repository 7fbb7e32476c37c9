//! Process management: lifecycle, the global process table, signals.

use core::fmt;

pub mod creation;
pub mod exec;
pub mod exit;
pub mod fork;
pub mod pcb;
pub mod signals;
pub mod table;
pub mod wait;

pub use creation::{init_idle, spawn_user};
pub use exit::exit_process;
pub use pcb::{Process, ProcessState};
pub use table::{current_pid, set_current_pid, with_current, with_process};
pub use wait::wait_for_child;

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub use exit::exit_current;

/// Fixed capacity of the process table.
pub const MAX_PROCESSES: usize = 64;

/// Per-process kernel stack: 4096 32-bit words (16 KiB).
pub const KERNEL_STACK_WORDS: usize = 4096;

/// Fixed capacity of each process's file-descriptor table.
pub const MAX_FDS: usize = 16;

/// Exit status synthesized for a process killed by a CPU exception other
/// than a page fault.
pub const FAULT_EXIT_STATUS: i32 = 132;

/// Exit status synthesized when `exec` fails after the old address space
/// is already gone.
pub const EXEC_FAILED_STATUS: i32 = 127;

/// Process identifier. PID 0 is the idle/boot context; real processes
/// start at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(pub u32);

/// The idle process: the boot control flow, never scheduled explicitly.
pub const IDLE_PID: Pid = Pid(0);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
