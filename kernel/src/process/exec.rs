//! `exec`: replace the current image with a program loaded from the
//! filesystem.
//!
//! Programs are flat binaries. An optional 16-byte header names the entry
//! offset and extra zeroed memory; headerless images start executing at
//! their first byte. Once the old address space is torn down there is no
//! way back: any later failure terminates the process with a synthetic
//! status.

use alloc::string::String;
use alloc::vec::Vec;

use super::creation::{build_argv_block, prepare_user_entry};
use super::table::with_current;
use super::EXEC_FAILED_STATUS;
use crate::arch::frame::TrapFrame;
use crate::error::{FsError, KernelError, KernelResult};
use crate::mm::{FRAME_SIZE, USER_BASE, USER_STACK_TOP};

/// Magic identifying a headered flat binary ("CND1").
pub const IMAGE_MAGIC: u32 = 0x31444E43;

/// Optional image header at offset 0.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ImageHeader {
    pub magic: u32,
    /// Entry point, as an offset from the load base.
    pub entry_offset: u32,
    /// Zero-filled memory past the file contents.
    pub bss_size: u32,
    pub reserved: u32,
}

const HEADER_SIZE: usize = core::mem::size_of::<ImageHeader>();

/// A parsed executable: where it starts and how much memory it needs.
pub struct LoadedImage<'a> {
    /// Bytes to place at `USER_BASE`.
    pub payload: &'a [u8],
    /// Entry point virtual address.
    pub entry: usize,
    /// Payload plus zero-filled tail.
    pub memory_size: usize,
}

impl<'a> LoadedImage<'a> {
    pub fn parse(image: &'a [u8]) -> KernelResult<Self> {
        if image.is_empty() {
            return Err(KernelError::FsError(FsError::NotAFile));
        }
        if image.len() >= HEADER_SIZE {
            let magic = u32::from_le_bytes(image[0..4].try_into().unwrap());
            if magic == IMAGE_MAGIC {
                let entry_offset = u32::from_le_bytes(image[4..8].try_into().unwrap()) as usize;
                let bss_size = u32::from_le_bytes(image[8..12].try_into().unwrap()) as usize;
                let payload = &image[HEADER_SIZE..];
                if entry_offset >= payload.len().max(1) {
                    return Err(KernelError::InvalidArgument {
                        name: "image",
                        value: "entry outside image",
                    });
                }
                return Ok(Self {
                    payload,
                    entry: USER_BASE + entry_offset,
                    memory_size: payload.len() + bss_size,
                });
            }
        }
        Ok(Self {
            payload: image,
            entry: USER_BASE,
            memory_size: image.len(),
        })
    }
}

/// Replace the current process image. On success the syscall frame is
/// overwritten with the fresh ring-3 entry state and the old frame's
/// contents are never restored.
pub fn exec(path: &str, args: &[&str], frame: &mut TrapFrame) -> KernelResult<()> {
    // Resolve and read the whole image before touching the address space;
    // failures up to here leave the caller intact.
    let image: Vec<u8> = {
        let (cwd, uid, gid) = with_current(|p| (p.cwd.clone(), p.uid, p.gid))
            .ok_or(KernelError::NotInitialized { subsystem: "process" })?;
        let vfs = crate::fs::vfs();
        let node = vfs.resolve(&cwd, path)?;
        let meta = node.metadata()?;
        crate::fs::check_permission(&meta, uid, gid, crate::fs::Access::Execute)?;
        if meta.node_type != crate::fs::NodeType::File {
            return Err(KernelError::FsError(FsError::NotAFile));
        }
        let mut data = alloc::vec![0u8; meta.size];
        let n = node.read(0, &mut data)?;
        data.truncate(n);
        data
    };

    let loaded = LoadedImage::parse(&image)?;
    let name = String::from(path);

    // Point of no return: wipe the old user space.
    let result = with_current(|p| -> KernelResult<TrapFrame> {
        p.address_space.destroy();

        let image_pages = (loaded.memory_size + FRAME_SIZE - 1) / FRAME_SIZE;
        p.address_space.map_initial_layout(image_pages.max(1))?;
        p.address_space.write_user(USER_BASE, loaded.payload)?;

        let argv = build_argv_block(USER_STACK_TOP, args);
        p.address_space.write_user(argv.base, &argv.bytes)?;

        // Descriptors survive exec; caught signals do not.
        p.signals.reset_for_exec();
        p.pending_signals = 0;
        p.name = name.clone();

        let user_frame = TrapFrame::user_entry(loaded.entry as u32, argv.base as u32);
        prepare_user_entry(p, &user_frame);
        Ok(user_frame)
    })
    .ok_or(KernelError::NotInitialized { subsystem: "process" })?;

    match result {
        Ok(user_frame) => {
            // Discard the original syscall frame: the iret path now drops
            // into the fresh image.
            *frame = user_frame;
            Ok(())
        }
        Err(err) => {
            // The old image is gone and the new one failed to build. The
            // process cannot continue.
            log::error!(
                "exec '{}' failed after teardown: {}; killing process",
                name,
                err
            );
            crate::process::exit_process(crate::process::current_pid(), EXEC_FAILED_STATUS);
            #[cfg(all(target_arch = "x86", target_os = "none"))]
            crate::sched::reschedule_never_return();
            #[cfg(not(all(target_arch = "x86", target_os = "none")))]
            return Err(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headerless_image_enters_at_base() {
        let img = [0x90u8; 64]; // nops
        let loaded = LoadedImage::parse(&img).unwrap();
        assert_eq!(loaded.entry, USER_BASE);
        assert_eq!(loaded.memory_size, 64);
        assert_eq!(loaded.payload.len(), 64);
    }

    #[test]
    fn headered_image_carries_entry_and_bss() {
        let mut img = alloc::vec![0u8; 16 + 32];
        img[0..4].copy_from_slice(&IMAGE_MAGIC.to_le_bytes());
        img[4..8].copy_from_slice(&8u32.to_le_bytes()); // entry offset
        img[8..12].copy_from_slice(&4096u32.to_le_bytes()); // bss
        let loaded = LoadedImage::parse(&img).unwrap();
        assert_eq!(loaded.entry, USER_BASE + 8);
        assert_eq!(loaded.memory_size, 32 + 4096);
        assert_eq!(loaded.payload.len(), 32);
    }

    #[test]
    fn empty_or_bogus_images_are_rejected() {
        assert!(LoadedImage::parse(&[]).is_err());

        let mut img = alloc::vec![0u8; 16];
        img[0..4].copy_from_slice(&IMAGE_MAGIC.to_le_bytes());
        img[4..8].copy_from_slice(&100u32.to_le_bytes()); // entry beyond payload
        assert!(LoadedImage::parse(&img).is_err());
    }
}
