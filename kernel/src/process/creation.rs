//! Process creation.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use super::pcb::{Process, ProcessState};
use super::table::{self, PROCESS_TABLE};
use super::{Pid, IDLE_PID};
use crate::arch::frame::{self, TrapFrame};
use crate::error::KernelResult;
use crate::fs::file::{OpenFile, OpenFlags};
use crate::mm::address_space::AddressSpace;
use crate::mm::{FRAME_SIZE, USER_BASE, USER_STACK_TOP};
use crate::process::exec::LoadedImage;

/// The argv block written to the top of a fresh user stack, plus the stack
/// pointer the process starts with.
pub struct ArgvBlock {
    /// Bytes to place at `base` (ascending addresses).
    pub bytes: Vec<u8>,
    /// Lowest address of the block; also the initial user ESP.
    pub base: usize,
}

/// Lay out `main`'s view of its arguments at the top of the user stack.
///
/// Ascending from `base`:
///
/// ```text
/// base     -> 0              fake return address for the entry point
///             argc
///             &argv[0]
///             argv[0..argc]  pointers into the strings area
///             0              argv terminator
///             strings        NUL-terminated, in order
/// ```
pub fn build_argv_block(stack_top: usize, args: &[&str]) -> ArgvBlock {
    let argc = args.len();
    let strings_size: usize = args.iter().map(|a| a.len() + 1).sum();

    let strings_base = stack_top - strings_size;
    let array_base = (strings_base - (argc + 1) * 4) & !3;
    let base = array_base - 12;

    let mut bytes = alloc::vec![0u8; stack_top - base];

    bytes[0..4].copy_from_slice(&0u32.to_le_bytes());
    bytes[4..8].copy_from_slice(&(argc as u32).to_le_bytes());
    bytes[8..12].copy_from_slice(&(array_base as u32).to_le_bytes());

    let mut string_addr = strings_base;
    for (i, arg) in args.iter().enumerate() {
        let slot = array_base - base + i * 4;
        bytes[slot..slot + 4].copy_from_slice(&(string_addr as u32).to_le_bytes());

        let off = string_addr - base;
        bytes[off..off + arg.len()].copy_from_slice(arg.as_bytes());
        bytes[off + arg.len()] = 0;
        string_addr += arg.len() + 1;
    }
    // argv[argc] stays zero (already zero-filled).

    ArgvBlock { bytes, base }
}

/// Bind FDs 0/1/2 to the kernel console, read-only for stdin and
/// write-only for stdout/stderr.
pub fn install_standard_fds(process: &mut Process) {
    let console = crate::fs::console::console_node();
    let _ = process.files.insert_at(
        0,
        Arc::new(OpenFile::from_node(console.clone(), OpenFlags::READ)),
    );
    let _ = process.files.insert_at(
        1,
        Arc::new(OpenFile::from_node(console.clone(), OpenFlags::WRITE)),
    );
    let _ = process
        .files
        .insert_at(2, Arc::new(OpenFile::from_node(console, OpenFlags::WRITE)));
}

/// Finish a PCB whose address space and FDs are set up: build the initial
/// kernel stack that drops to ring 3 at `frame`, and record the saved ESP.
pub fn prepare_user_entry(process: &mut Process, user_frame: &TrapFrame) {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    let trap_return = crate::arch::x86::context::trap_return_address();
    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    let trap_return = 0;

    let init = frame::build_user_stack(&mut process.kernel_stack, trap_return, user_frame);

    #[cfg(all(target_arch = "x86", target_os = "none"))]
    {
        process.kernel_esp =
            &process.kernel_stack[init.saved_esp_index] as *const u32 as usize as u32;
    }
    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    {
        process.kernel_esp = init.saved_esp_index as u32;
    }
}

/// Create a user process from a flat binary image and enqueue it Ready.
pub fn spawn_user(
    name: &str,
    image: &[u8],
    args: &[&str],
    parent: Pid,
    uid: u32,
    gid: u32,
) -> KernelResult<Pid> {
    let loaded = LoadedImage::parse(image)?;

    let mut space = AddressSpace::new()?;
    let image_pages = (loaded.memory_size + FRAME_SIZE - 1) / FRAME_SIZE;
    space.map_initial_layout(image_pages.max(1))?;
    space.write_user(USER_BASE, loaded.payload)?;

    let argv = build_argv_block(USER_STACK_TOP, args);
    space.write_user(argv.base, &argv.bytes)?;

    let pid = PROCESS_TABLE.alloc_pid();
    let mut process = Process::new(pid, parent, String::from(name), space);
    process.uid = uid;
    process.gid = gid;
    install_standard_fds(&mut process);

    let user_frame = TrapFrame::user_entry(loaded.entry as u32, argv.base as u32);
    prepare_user_entry(&mut process, &user_frame);
    process.state = ProcessState::Ready;

    PROCESS_TABLE.insert(process)?;
    crate::sched::enqueue_ready(pid);
    log::debug!("spawned pid {} '{}' ({} bytes)", pid, name, image.len());
    Ok(pid)
}

/// Install PID 0, representing the boot control flow. It owns the kernel's
/// original stack conceptually; its saved ESP is filled in by the first
/// switch away from it.
pub fn init_idle() -> KernelResult<()> {
    let mut idle = Process::new(
        IDLE_PID,
        IDLE_PID,
        String::from("idle"),
        AddressSpace::new()?,
    );
    idle.state = ProcessState::Running;
    PROCESS_TABLE.insert(idle)?;
    table::set_current_pid(IDLE_PID);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argv_block_layout() {
        let block = build_argv_block(0xBFFF_F000, &["init", "-s"]);
        let base = block.base;
        assert_eq!(base % 4, 0);

        let word = |off: usize| {
            u32::from_le_bytes(block.bytes[off..off + 4].try_into().unwrap()) as usize
        };
        assert_eq!(word(0), 0); // fake return address
        assert_eq!(word(4), 2); // argc
        let argv = word(8);
        let argv_off = argv - base;
        let arg0 = word(argv_off);
        let arg1 = word(argv_off + 4);
        assert_eq!(word(argv_off + 8), 0); // argv terminator

        let s0 = &block.bytes[arg0 - base..arg0 - base + 5];
        assert_eq!(s0, b"init\0");
        let s1 = &block.bytes[arg1 - base..arg1 - base + 3];
        assert_eq!(s1, b"-s\0");
    }

    #[test]
    fn argv_block_empty_args() {
        let block = build_argv_block(0xBFFF_F000, &[]);
        let word = |off: usize| u32::from_le_bytes(block.bytes[off..off + 4].try_into().unwrap());
        assert_eq!(word(4), 0); // argc
        assert_eq!(block.bytes.len(), 16); // ret + argc + argv ptr + null argv
    }
}
