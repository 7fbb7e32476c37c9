//! Process termination.
//!
//! Exit releases what the process can no longer use (descriptors, user
//! frames) but leaves the PCB in place as a zombie holding the exit status;
//! the kernel stack and table slot are reclaimed by `wait`.

use super::pcb::ProcessState;
use super::table::with_process;
use super::Pid;
use crate::sched::WaitChannel;

/// Bookkeeping half of exit: mark the PCB zombie, record the status, close
/// descriptors, free the user address space, and wake a parent blocked in
/// `wait`.
pub fn exit_process(pid: Pid, status: i32) {
    // Detach the resources under the table lock, release them after:
    // closing a pipe end wakes waiters, which walks the table again.
    let detached = with_process(pid, |p| {
        p.state = ProcessState::Zombie;
        p.exit_status = status;
        let files = core::mem::take(&mut p.files);
        let space = core::mem::replace(
            &mut p.address_space,
            crate::mm::address_space::AddressSpace::empty(),
        );
        (files, space, p.parent)
    });
    let parent = detached.map(|(mut files, mut space, parent)| {
        files.close_all();
        space.destroy();
        parent
    });

    crate::sched::remove(pid);

    if let Some(parent) = parent {
        crate::sched::wake_all(WaitChannel::ChildExit(parent));
    }
}

/// Terminate the process on the CPU and never come back. The trap frame is
/// abandoned along with the kernel stack.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn exit_current(status: i32, _frame: &mut crate::arch::frame::TrapFrame) -> ! {
    let pid = super::table::current_pid();
    exit_process(pid, status);
    crate::sched::reschedule_never_return()
}

#[cfg(test)]
mod tests {
    use alloc::string::String;

    use super::*;
    use crate::mm::address_space::AddressSpace;
    use crate::process::pcb::Process;
    use crate::process::table::PROCESS_TABLE;

    #[test]
    fn exit_marks_zombie_and_keeps_status() {
        let _guard = crate::mm::test_lock();
        let pid = PROCESS_TABLE.alloc_pid();
        let parent = PROCESS_TABLE.alloc_pid();
        let mut p = Process::new(pid, parent, String::from("doomed"), AddressSpace::new().unwrap());
        p.state = ProcessState::Running;
        PROCESS_TABLE.insert(p).unwrap();

        exit_process(pid, 42);

        let (state, status) =
            with_process(pid, |p| (p.state, p.exit_status)).expect("zombie persists");
        assert_eq!(state, ProcessState::Zombie);
        assert_eq!(status, 42);

        // The record is not freed until wait() reaps it.
        assert!(PROCESS_TABLE.remove(pid).is_some());
    }

    #[test]
    fn exit_wakes_without_signalling_or_reparenting() {
        let _guard = crate::mm::test_lock();
        let grandparent = PROCESS_TABLE.alloc_pid();
        let dying = PROCESS_TABLE.alloc_pid();
        let child = PROCESS_TABLE.alloc_pid();
        let mut g = Process::new(
            grandparent,
            Pid(0),
            String::from("grandparent"),
            AddressSpace::new().unwrap(),
        );
        g.state = ProcessState::Running;
        PROCESS_TABLE.insert(g).unwrap();
        let p = Process::new(dying, grandparent, String::from("parent"), AddressSpace::new().unwrap());
        PROCESS_TABLE.insert(p).unwrap();
        let c = Process::new(child, dying, String::from("child"), AddressSpace::new().unwrap());
        PROCESS_TABLE.insert(c).unwrap();

        exit_process(dying, 0);

        // The parent is woken through its child-wait channel only; no
        // signal is posted.
        assert_eq!(with_process(grandparent, |p| p.pending_signals), Some(0));
        // A surviving child keeps its parent field as-is.
        assert_eq!(with_process(child, |p| p.parent), Some(dying));

        PROCESS_TABLE.remove(grandparent);
        PROCESS_TABLE.remove(dying);
        PROCESS_TABLE.remove(child);
    }
}
