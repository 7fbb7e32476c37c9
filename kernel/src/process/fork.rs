//! `fork`: duplicate the current process.
//!
//! The address space is copied eagerly, page by page; descriptors are
//! shared with bumped reference counts; the signal table is inherited.
//! The child's kernel stack is built so its first scheduling drops straight
//! back to ring 3 at the instruction after the parent's `int 0x80`, with
//! EAX = 0.

use super::creation::prepare_user_entry;
use super::pcb::{Process, ProcessState};
use super::table::{current_pid, with_current, PROCESS_TABLE};
use super::Pid;
use crate::arch::frame::TrapFrame;
use crate::error::{KernelError, KernelResult};

/// Create a child of the current process. Returns the child PID; the child
/// itself observes 0 from the same syscall.
pub fn fork(frame: &TrapFrame) -> KernelResult<Pid> {
    let parent_pid = current_pid();

    let cloned = with_current(|p| {
        let space = p.address_space.clone_for_fork()?;
        Ok::<_, KernelError>((
            space,
            p.files.clone_for_fork(),
            p.signals.clone(),
            p.name.clone(),
            p.cwd.clone(),
            p.uid,
            p.gid,
        ))
    })
    .ok_or(KernelError::ProcessNotFound {
        pid: parent_pid.0,
    })??;
    let (space, files, signals, name, cwd, uid, gid) = cloned;

    let pid = PROCESS_TABLE.alloc_pid();
    let mut child = Process::new(pid, parent_pid, name, space);
    child.files = files;
    child.signals = signals;
    child.cwd = cwd;
    child.uid = uid;
    child.gid = gid;

    // The child resumes from the same saved frame, but its syscall
    // "returns" 0.
    let mut child_frame = *frame;
    child_frame.set_return_value(0);
    prepare_user_entry(&mut child, &child_frame);
    child.state = ProcessState::Ready;

    let pid = PROCESS_TABLE.insert(child)?;
    crate::sched::enqueue_ready(pid);
    Ok(pid)
}

#[cfg(test)]
mod tests {
    use alloc::string::String;

    use super::*;
    use crate::boot::MemoryRegion;
    use crate::mm::address_space::AddressSpace;
    use crate::mm::FRAME_SIZE;
    use crate::process::{exit_process, set_current_pid, wait_for_child};

    #[test]
    fn fork_wait_exit_round_trip() {
        let _guard = crate::mm::test_lock();
        // Give the global frame allocator a private region for the
        // parent's pages and the child's eager copies.
        let regions = alloc::vec![MemoryRegion::usable(
            0x2000_0000,
            (0x2000_0000 + 64 * FRAME_SIZE) as u64,
        )];
        crate::mm::frame_allocator::init(&regions, 0);

        let parent_pid = PROCESS_TABLE.alloc_pid();
        let mut parent = Process::new(
            parent_pid,
            crate::process::Pid(0),
            String::from("parent"),
            AddressSpace::new().unwrap(),
        );
        parent.address_space.map_initial_layout(1).unwrap();
        parent.state = ProcessState::Running;
        parent.uid = 500;
        PROCESS_TABLE.insert(parent).unwrap();
        set_current_pid(parent_pid);

        let frame = TrapFrame::user_entry(
            crate::mm::USER_BASE as u32,
            crate::mm::USER_STACK_TOP as u32,
        );
        let child_pid = fork(&frame).unwrap();
        assert_ne!(child_pid, parent_pid);

        // The child inherits credentials, cwd, and the address-space
        // shape, and is immediately runnable.
        let (uid, pages, state) = crate::process::with_process(child_pid, |p| {
            (p.uid, p.address_space.mapped_pages(), p.state)
        })
        .unwrap();
        assert_eq!(uid, 500);
        assert_eq!(
            Some(pages),
            crate::process::with_process(parent_pid, |p| p.address_space.mapped_pages())
        );
        assert_eq!(state, ProcessState::Ready);

        // Child exits 3; the parent reaps exactly that status.
        exit_process(child_pid, 3);
        assert_eq!(wait_for_child(parent_pid), Ok((child_pid, 3)));

        let mut removed = PROCESS_TABLE.remove(parent_pid).unwrap();
        removed.address_space.destroy();
        set_current_pid(crate::process::IDLE_PID);
    }
}
