//! Process control block.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec;

use super::{Pid, KERNEL_STACK_WORDS};
use crate::fs::file::FileTable;
use crate::mm::address_space::AddressSpace;
use crate::process::signals::SignalTable;

/// Life-cycle state of a process-table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Slot under construction, not yet schedulable.
    Unused,
    /// Runnable, queued in the scheduler.
    Ready,
    /// Currently on the CPU.
    Running,
    /// Parked on a wait channel.
    Blocked,
    /// Parked until a tick deadline passes.
    Sleeping,
    /// Exited; waiting for the parent to reap the status.
    Zombie,
}

/// Everything the kernel keeps per process.
pub struct Process {
    pub pid: Pid,
    pub parent: Pid,
    pub name: String,
    pub state: ProcessState,

    /// The one kernel stack this process owns.
    pub kernel_stack: Box<[u32]>,
    /// Saved kernel ESP while not running (points into `kernel_stack`).
    pub kernel_esp: u32,

    pub address_space: AddressSpace,
    pub files: FileTable,
    pub signals: SignalTable,
    /// Pending-signal bitmask, bit N-1 for signal N.
    pub pending_signals: u32,

    pub cwd: String,
    pub uid: u32,
    pub gid: u32,

    pub exit_status: i32,
    /// Tick deadline while `Sleeping`.
    pub sleep_until: u64,
}

impl Process {
    /// A blank PCB owning a fresh kernel stack and the given address space.
    pub fn new(pid: Pid, parent: Pid, name: String, address_space: AddressSpace) -> Self {
        Self {
            pid,
            parent,
            name,
            state: ProcessState::Unused,
            kernel_stack: vec![0u32; KERNEL_STACK_WORDS].into_boxed_slice(),
            kernel_esp: 0,
            address_space,
            files: FileTable::new(),
            signals: SignalTable::new(),
            pending_signals: 0,
            cwd: String::from("/"),
            uid: 0,
            gid: 0,
            exit_status: 0,
            sleep_until: 0,
        }
    }

    /// Address one past the top of the kernel stack (for TSS.esp0).
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    pub fn kernel_stack_top(&self) -> u32 {
        self.kernel_stack.as_ptr() as u32 + (self.kernel_stack.len() * 4) as u32
    }

    /// Raw pointer to the saved-ESP slot, stable for the PCB's lifetime
    /// (the PCB is boxed in the process table).
    pub fn kernel_esp_slot(&mut self) -> *mut u32 {
        &mut self.kernel_esp as *mut u32
    }

    /// Whether this process can be handed the CPU.
    pub fn is_runnable(&self) -> bool {
        matches!(self.state, ProcessState::Ready | ProcessState::Running)
    }

    /// Queue a signal. Out-of-range numbers are ignored at this level;
    /// `kill` validates before calling.
    pub fn post_signal(&mut self, signum: usize) {
        if (1..=crate::process::signals::NSIG).contains(&signum) {
            self.pending_signals |= 1 << (signum - 1);
        }
    }

    /// Take the lowest pending signal, clearing its bit.
    pub fn take_pending_signal(&mut self) -> Option<usize> {
        if self.pending_signals == 0 {
            return None;
        }
        let bit = self.pending_signals.trailing_zeros() as usize;
        self.pending_signals &= !(1 << bit);
        Some(bit + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank(pid: u32) -> Process {
        Process::new(
            Pid(pid),
            Pid(0),
            String::from("test"),
            AddressSpace::new().unwrap(),
        )
    }

    #[test]
    fn new_process_owns_one_kernel_stack() {
        let p = blank(1);
        assert_eq!(p.kernel_stack.len(), KERNEL_STACK_WORDS);
        assert_eq!(p.state, ProcessState::Unused);
        assert_eq!(p.cwd, "/");
    }

    #[test]
    fn pending_signals_come_out_lowest_first() {
        let mut p = blank(2);
        p.post_signal(15);
        p.post_signal(2);
        assert_eq!(p.take_pending_signal(), Some(2));
        assert_eq!(p.take_pending_signal(), Some(15));
        assert_eq!(p.take_pending_signal(), None);
    }

    #[test]
    fn out_of_range_signals_are_not_queued() {
        let mut p = blank(3);
        p.post_signal(0);
        p.post_signal(33);
        assert_eq!(p.pending_signals, 0);
    }
}
