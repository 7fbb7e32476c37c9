//! Filesystem and descriptor syscalls.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use super::userspace;
use crate::error::{FsError, KernelError, KernelResult};
use crate::fs::file::{Fd, OpenFile, SeekFrom};
use crate::fs::pipe::{Pipe, PipeEnd};
use crate::fs::{self, NodeType, OpenFlags, PATH_MAX};
use crate::process::with_current;

/// Largest single read/write the kernel stages through its own buffer.
const IO_CHUNK: usize = 64 * 1024;

fn current_or_fail<R>(f: impl FnOnce(&mut crate::process::Process) -> R) -> KernelResult<R> {
    with_current(f).ok_or(KernelError::NotInitialized { subsystem: "process" })
}

fn copy_path(path_ptr: usize) -> KernelResult<String> {
    current_or_fail(|p| userspace::copy_in_string(&p.address_space, path_ptr, PATH_MAX))?
}

fn get_file(fd: Fd) -> KernelResult<Arc<OpenFile>> {
    current_or_fail(|p| p.files.get(fd))?.ok_or(KernelError::FsError(FsError::BadFileDescriptor))
}

/// open(path, flags) -> fd
pub fn sys_open(path_ptr: usize, flag_bits: usize) -> KernelResult<i32> {
    let path = copy_path(path_ptr)?;
    let flags = OpenFlags::from_user_bits(flag_bits as u32).ok_or(KernelError::InvalidArgument {
        name: "flags",
        value: "bad open flags",
    })?;

    let (cwd, uid, gid) = current_or_fail(|p| (p.cwd.clone(), p.uid, p.gid))?;
    let node = fs::vfs().open(&cwd, &path, flags, uid, gid)?;
    let file = Arc::new(OpenFile::from_node(node, flags));
    let fd = current_or_fail(|p| p.files.insert(file))??;
    Ok(fd as i32)
}

/// close(fd)
pub fn sys_close(fd: usize) -> KernelResult<i32> {
    // Detach under the table lock, release outside it: closing the last
    // pipe end wakes waiters, which walks the table again.
    let file = current_or_fail(|p| p.files.take(fd))??;
    file.release();
    Ok(0)
}

/// read(fd, buf, count) -> bytes read (0 at EOF / closed pipe)
pub fn sys_read(fd: usize, buf_ptr: usize, count: usize) -> KernelResult<i32> {
    let file = get_file(fd)?;
    let count = count.min(IO_CHUNK);

    // Validate the destination before consuming anything, so a bad buffer
    // cannot eat pipe data.
    current_or_fail(|p| {
        if p.address_space.covers_range(buf_ptr, count) {
            Ok(())
        } else {
            Err(KernelError::BadUserAddress { addr: buf_ptr })
        }
    })??;

    let mut kbuf = alloc::vec![0u8; count];
    loop {
        match file.read(&mut kbuf) {
            Ok(n) => {
                current_or_fail(|p| {
                    userspace::copy_out_bytes(&p.address_space, buf_ptr, &kbuf[..n])
                })??;
                return Ok(n as i32);
            }
            Err(KernelError::WouldBlock) => {
                let channel = file
                    .wait_channel(true)
                    .ok_or(KernelError::WouldBlock)?;
                super::block_or_fail(channel)?;
            }
            Err(err) => return Err(err),
        }
    }
}

/// write(fd, buf, count) -> bytes written (pipes may be short)
pub fn sys_write(fd: usize, buf_ptr: usize, count: usize) -> KernelResult<i32> {
    let file = get_file(fd)?;
    let count = count.min(IO_CHUNK);

    let mut kbuf = alloc::vec![0u8; count];
    current_or_fail(|p| userspace::copy_in_bytes(&p.address_space, &mut kbuf, buf_ptr))??;

    loop {
        match file.write(&kbuf) {
            Ok(n) => return Ok(n as i32),
            Err(KernelError::WouldBlock) => {
                let channel = file
                    .wait_channel(false)
                    .ok_or(KernelError::WouldBlock)?;
                super::block_or_fail(channel)?;
            }
            Err(err) => return Err(err),
        }
    }
}

/// The record `readdir` writes to user space.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct UserDirent {
    pub inode: u32,
    pub kind: u8,
    pub name_len: u8,
    pub name: [u8; 58],
}

fn kind_code(node_type: NodeType) -> u8 {
    match node_type {
        NodeType::File => 1,
        NodeType::Directory | NodeType::MountPoint => 2,
        NodeType::CharDevice => 3,
        NodeType::BlockDevice => 4,
        NodeType::Pipe => 5,
        NodeType::Symlink => 7,
    }
}

/// readdir(fd, index, dirent_ptr) -> 1 while entries remain, 0 at the end
pub fn sys_readdir(fd: usize, index: usize, dirent_ptr: usize) -> KernelResult<i32> {
    let file = get_file(fd)?;
    let node = match &file.object {
        crate::fs::file::FileObject::Node(node) => node.clone(),
        _ => return Err(KernelError::FsError(FsError::NotADirectory)),
    };
    match node.readdir(index)? {
        Some(entry) => {
            let mut record = UserDirent {
                inode: entry.inode as u32,
                kind: kind_code(entry.node_type),
                name_len: entry.name.len().min(57) as u8,
                name: [0; 58],
            };
            let n = record.name_len as usize;
            record.name[..n].copy_from_slice(&entry.name.as_bytes()[..n]);

            let bytes = unsafe {
                core::slice::from_raw_parts(
                    &record as *const UserDirent as *const u8,
                    core::mem::size_of::<UserDirent>(),
                )
            };
            current_or_fail(|p| userspace::copy_out_bytes(&p.address_space, dirent_ptr, bytes))??;
            Ok(1)
        }
        None => Ok(0),
    }
}

/// The record `stat` writes to user space.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct UserStat {
    pub inode: u32,
    pub kind: u32,
    pub size: u32,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub created: u64,
    pub modified: u64,
    pub accessed: u64,
}

/// stat(path, stat_ptr)
pub fn sys_stat(path_ptr: usize, stat_ptr: usize) -> KernelResult<i32> {
    let path = copy_path(path_ptr)?;
    let cwd = current_or_fail(|p| p.cwd.clone())?;
    let meta = fs::vfs().stat(&cwd, &path)?;

    let record = UserStat {
        inode: meta.inode as u32,
        kind: kind_code(meta.node_type) as u32,
        size: meta.size as u32,
        mode: meta.permissions.bits() as u32,
        uid: meta.uid,
        gid: meta.gid,
        created: meta.created,
        modified: meta.modified,
        accessed: meta.accessed,
    };
    let bytes = unsafe {
        core::slice::from_raw_parts(
            &record as *const UserStat as *const u8,
            core::mem::size_of::<UserStat>(),
        )
    };
    current_or_fail(|p| userspace::copy_out_bytes(&p.address_space, stat_ptr, bytes))??;
    Ok(0)
}

/// mkdir(path)
pub fn sys_mkdir(path_ptr: usize) -> KernelResult<i32> {
    let path = copy_path(path_ptr)?;
    let (cwd, uid, gid) = current_or_fail(|p| (p.cwd.clone(), p.uid, p.gid))?;
    fs::vfs().mkdir(&cwd, &path, uid, gid)?;
    Ok(0)
}

/// unlink(path)
pub fn sys_unlink(path_ptr: usize) -> KernelResult<i32> {
    let path = copy_path(path_ptr)?;
    let (cwd, uid, gid) = current_or_fail(|p| (p.cwd.clone(), p.uid, p.gid))?;
    fs::vfs().unlink(&cwd, &path, uid, gid)?;
    Ok(0)
}

/// chdir(path)
pub fn sys_chdir(path_ptr: usize) -> KernelResult<i32> {
    let path = copy_path(path_ptr)?;
    let (cwd, uid, gid) = current_or_fail(|p| (p.cwd.clone(), p.uid, p.gid))?;

    let canonical = fs::Vfs::canonicalize(&cwd, &path);
    let node = fs::vfs().resolve("/", &canonical)?;
    let meta = node.metadata()?;
    if meta.node_type != NodeType::Directory {
        return Err(KernelError::FsError(FsError::NotADirectory));
    }
    fs::check_permission(&meta, uid, gid, fs::Access::Execute)?;

    current_or_fail(|p| p.cwd = canonical)?;
    Ok(0)
}

/// getcwd(buf, size) -> length of the path written (without the NUL)
pub fn sys_getcwd(buf_ptr: usize, size: usize) -> KernelResult<i32> {
    let cwd = current_or_fail(|p| p.cwd.clone())?;
    if cwd.len() + 1 > size {
        return Err(KernelError::InvalidArgument {
            name: "size",
            value: "buffer too small for cwd",
        });
    }
    let mut bytes: Vec<u8> = cwd.as_bytes().to_vec();
    bytes.push(0);
    current_or_fail(|p| userspace::copy_out_bytes(&p.address_space, buf_ptr, &bytes))??;
    Ok(cwd.len() as i32)
}

/// pipe(fds_ptr) -> writes [read_fd, write_fd]
pub fn sys_pipe(fds_ptr: usize) -> KernelResult<i32> {
    let pipe = Pipe::new();
    let read_file = Arc::new(OpenFile::from_pipe(pipe.clone(), PipeEnd::Read));
    let write_file = Arc::new(OpenFile::from_pipe(pipe, PipeEnd::Write));

    let (read_fd, write_fd) = current_or_fail(|p| -> KernelResult<(Fd, Fd)> {
        let read_fd = p.files.insert(read_file)?;
        let write_fd = match p.files.insert(write_file) {
            Ok(fd) => fd,
            Err(err) => {
                let _ = p.files.close(read_fd);
                return Err(err);
            }
        };
        Ok((read_fd, write_fd))
    })??;

    let mut words = [0u8; 8];
    words[0..4].copy_from_slice(&(read_fd as u32).to_le_bytes());
    words[4..8].copy_from_slice(&(write_fd as u32).to_le_bytes());
    let copied =
        current_or_fail(|p| userspace::copy_out_bytes(&p.address_space, fds_ptr, &words))?;
    if let Err(err) = copied {
        current_or_fail(|p| {
            let _ = p.files.close(read_fd);
            let _ = p.files.close(write_fd);
        })?;
        return Err(err);
    }
    Ok(0)
}

/// dup2(old, new)
pub fn sys_dup2(old: usize, new: usize) -> KernelResult<i32> {
    let (fd, displaced) = current_or_fail(|p| p.files.dup2(old, new))??;
    if let Some(file) = displaced {
        file.release();
    }
    Ok(fd as i32)
}

/// dup(fd) -> lowest free descriptor
pub fn sys_dup(fd: usize) -> KernelResult<i32> {
    let fd = current_or_fail(|p| p.files.dup(fd))??;
    Ok(fd as i32)
}

/// lseek(fd, offset, whence)
pub fn sys_lseek(fd: usize, offset: i32, whence: usize) -> KernelResult<i32> {
    let file = get_file(fd)?;
    let from = match whence {
        0 => SeekFrom::Start(offset as usize),
        1 => SeekFrom::Current(offset as isize),
        2 => SeekFrom::End(offset as isize),
        _ => {
            return Err(KernelError::InvalidArgument {
                name: "whence",
                value: "not 0/1/2",
            })
        }
    };
    Ok(file.seek(from)? as i32)
}

/// chmod(path, mode)
pub fn sys_chmod(path_ptr: usize, mode: usize) -> KernelResult<i32> {
    let path = copy_path(path_ptr)?;
    let (cwd, uid, gid) = current_or_fail(|p| (p.cwd.clone(), p.uid, p.gid))?;
    fs::vfs().chmod(&cwd, &path, mode as u16, uid, gid)?;
    Ok(0)
}

/// chown(path, uid, gid)
pub fn sys_chown(path_ptr: usize, new_uid: usize, new_gid: usize) -> KernelResult<i32> {
    let path = copy_path(path_ptr)?;
    let (cwd, uid) = current_or_fail(|p| (p.cwd.clone(), p.uid))?;
    fs::vfs().chown(&cwd, &path, new_uid as u32, new_gid as u32, uid)?;
    Ok(0)
}
