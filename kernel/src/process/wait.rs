//! `wait`: reap terminated children.

use super::table::PROCESS_TABLE;
use super::Pid;
use crate::error::{KernelError, KernelResult};

/// Non-blocking wait step: reap one zombie child of `parent` if there is
/// one.
///
/// - `Ok((pid, status))`: the child's PCB, kernel stack, and signal table
///   are freed; its exit status is returned.
/// - `Err(NoChildren)`: nothing to wait for, ever.
/// - `Err(WouldBlock)`: children exist but none has exited; the caller
///   blocks on its child-exit channel and retries.
pub fn wait_for_child(parent: Pid) -> KernelResult<(Pid, i32)> {
    match PROCESS_TABLE.zombie_child_of(parent) {
        Some((pid, status)) => {
            // Dropping the boxed PCB frees the record, the kernel stack,
            // and the signal table in one motion.
            let _reaped = PROCESS_TABLE.remove(pid);
            Ok((pid, status))
        }
        None => {
            if PROCESS_TABLE.children_of(parent).is_empty() {
                Err(KernelError::NoChildren)
            } else {
                Err(KernelError::WouldBlock)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::string::String;

    use super::*;
    use crate::mm::address_space::AddressSpace;
    use crate::process::exit_process;
    use crate::process::pcb::{Process, ProcessState};

    #[test]
    fn wait_with_no_children_errors_immediately() {
        let _guard = crate::mm::test_lock();
        let lonely = PROCESS_TABLE.alloc_pid();
        assert_eq!(wait_for_child(lonely), Err(KernelError::NoChildren));
    }

    #[test]
    fn wait_blocks_while_child_lives_then_reaps() {
        let _guard = crate::mm::test_lock();
        let parent = PROCESS_TABLE.alloc_pid();
        let child = PROCESS_TABLE.alloc_pid();
        let mut c = Process::new(child, parent, String::from("c"), AddressSpace::new().unwrap());
        c.state = ProcessState::Running;
        PROCESS_TABLE.insert(c).unwrap();

        assert_eq!(wait_for_child(parent), Err(KernelError::WouldBlock));

        exit_process(child, 3);
        assert_eq!(wait_for_child(parent), Ok((child, 3)));

        // Reaped: gone from the table, nothing further to wait on.
        assert_eq!(wait_for_child(parent), Err(KernelError::NoChildren));
    }
}
