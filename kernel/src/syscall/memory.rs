//! Memory syscalls.

use crate::error::{KernelError, KernelResult};
use crate::process::with_current;

/// sbrk(delta) -> previous break
///
/// Positive deltas map fresh zeroed pages; negative deltas release whole
/// pages back to the frame allocator.
pub fn sys_sbrk(delta: isize) -> KernelResult<i32> {
    let old = with_current(|p| p.address_space.sbrk(delta))
        .ok_or(KernelError::NotInitialized { subsystem: "process" })??;
    Ok(old as i32)
}
