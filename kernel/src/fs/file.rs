//! Open files and per-process file-descriptor tables.
//!
//! A descriptor slot holds a shared [`OpenFile`]: either a VFS node plus a
//! byte offset, or one end of a pipe. Fork and `dup2` share the same
//! `OpenFile` (offset included) and bump its reference count; the
//! underlying object is released when the count reaches zero.

use alloc::sync::Arc;

use spin::Mutex;

use super::pipe::{Pipe, PipeEnd};
use super::VfsNode;
use crate::error::{FsError, KernelError, KernelResult};
use crate::process::MAX_FDS;

/// File descriptor number.
pub type Fd = usize;

pub const STDIN: Fd = 0;
pub const STDOUT: Fd = 1;
pub const STDERR: Fd = 2;

bitflags::bitflags! {
    /// Open flags, matching the user-space `O_*` constants.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const READ     = 0x01;
        const WRITE    = 0x02;
        const CREATE   = 0x04;
        const TRUNCATE = 0x08;
        const APPEND   = 0x10;
    }
}

impl OpenFlags {
    /// Decode the syscall argument; unknown bits or an accessless open are
    /// rejected.
    pub fn from_user_bits(bits: u32) -> Option<Self> {
        let flags = Self::from_bits(bits)?;
        if !flags.intersects(Self::READ | Self::WRITE) {
            return None;
        }
        Some(flags)
    }
}

/// Seek origin for `lseek`.
#[derive(Debug, Clone, Copy)]
pub enum SeekFrom {
    Start(usize),
    Current(isize),
    End(isize),
}

/// What an open descriptor refers to.
pub enum FileObject {
    Node(Arc<dyn VfsNode>),
    Pipe { pipe: Arc<Pipe>, end: PipeEnd },
}

/// One open file, shared between descriptors by fork and dup.
pub struct OpenFile {
    pub object: FileObject,
    pub flags: OpenFlags,
    position: Mutex<usize>,
    refcount: Mutex<usize>,
}

impl OpenFile {
    pub fn from_node(node: Arc<dyn VfsNode>, flags: OpenFlags) -> Self {
        Self {
            object: FileObject::Node(node),
            flags,
            position: Mutex::new(0),
            refcount: Mutex::new(1),
        }
    }

    /// Wrap one end of a pipe, registering the end with the pipe.
    pub fn from_pipe(pipe: Arc<Pipe>, end: PipeEnd) -> Self {
        match end {
            PipeEnd::Read => pipe.add_reader(),
            PipeEnd::Write => pipe.add_writer(),
        }
        let flags = match end {
            PipeEnd::Read => OpenFlags::READ,
            PipeEnd::Write => OpenFlags::WRITE,
        };
        Self {
            object: FileObject::Pipe { pipe, end },
            flags,
            position: Mutex::new(0),
            refcount: Mutex::new(1),
        }
    }

    /// Non-blocking read step. Pipe reads may return `WouldBlock`, which
    /// the syscall layer turns into a scheduler block.
    pub fn read(&self, buffer: &mut [u8]) -> KernelResult<usize> {
        if !self.flags.contains(OpenFlags::READ) {
            return Err(KernelError::FsError(FsError::BadFileDescriptor));
        }
        match &self.object {
            FileObject::Node(node) => {
                let mut pos = self.position.lock();
                let n = node.read(*pos, buffer)?;
                *pos += n;
                Ok(n)
            }
            FileObject::Pipe { pipe, .. } => pipe.try_read(buffer),
        }
    }

    /// Non-blocking write step; pipes may return `WouldBlock` when full.
    pub fn write(&self, data: &[u8]) -> KernelResult<usize> {
        if !self.flags.contains(OpenFlags::WRITE) {
            return Err(KernelError::FsError(FsError::BadFileDescriptor));
        }
        match &self.object {
            FileObject::Node(node) => {
                let mut pos = self.position.lock();
                if self.flags.contains(OpenFlags::APPEND) {
                    *pos = node.metadata()?.size;
                }
                let n = node.write(*pos, data)?;
                *pos += n;
                Ok(n)
            }
            FileObject::Pipe { pipe, .. } => pipe.try_write(data),
        }
    }

    /// Reposition a regular file's offset. Pipes cannot seek.
    pub fn seek(&self, from: SeekFrom) -> KernelResult<usize> {
        let node = match &self.object {
            FileObject::Node(node) => node,
            FileObject::Pipe { .. } => {
                return Err(KernelError::FsError(FsError::NotSupported));
            }
        };
        let mut pos = self.position.lock();
        let new = match from {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => add_signed(*pos, delta),
            SeekFrom::End(delta) => add_signed(node.metadata()?.size, delta),
        }
        .ok_or(KernelError::InvalidArgument {
            name: "offset",
            value: "seek out of range",
        })?;
        *pos = new;
        Ok(new)
    }

    /// The pipe's wait channel for the operation that just would-block.
    pub fn wait_channel(&self, for_read: bool) -> Option<crate::sched::WaitChannel> {
        match &self.object {
            FileObject::Pipe { pipe, .. } => Some(if for_read {
                pipe.read_channel()
            } else {
                pipe.write_channel()
            }),
            FileObject::Node(node) => {
                if node.node_type() == super::NodeType::CharDevice && for_read {
                    Some(crate::sched::WaitChannel::ConsoleInput)
                } else {
                    None
                }
            }
        }
    }

    pub fn refcount(&self) -> usize {
        *self.refcount.lock()
    }

    pub fn inc_ref(&self) {
        *self.refcount.lock() += 1;
    }

    /// Drop one reference; on the last one, release the underlying object
    /// (close a pipe end, notify the node).
    ///
    /// Closing a pipe end can wake blocked processes, which walks the
    /// process table; never call this while holding the table lock.
    pub fn release(&self) -> usize {
        self.dec_ref()
    }

    fn dec_ref(&self) -> usize {
        let remaining = {
            let mut count = self.refcount.lock();
            *count = count.saturating_sub(1);
            *count
        };
        if remaining == 0 {
            match &self.object {
                FileObject::Node(node) => node.close(),
                FileObject::Pipe { pipe, end } => match end {
                    PipeEnd::Read => pipe.close_read_end(),
                    PipeEnd::Write => pipe.close_write_end(),
                },
            }
        }
        remaining
    }
}

fn add_signed(base: usize, delta: isize) -> Option<usize> {
    if delta >= 0 {
        base.checked_add(delta as usize)
    } else {
        base.checked_sub(delta.unsigned_abs())
    }
}

/// Fixed-capacity per-process descriptor table.
pub struct FileTable {
    slots: [Option<Arc<OpenFile>>; MAX_FDS],
}

impl FileTable {
    pub fn new() -> Self {
        Self {
            slots: [const { None }; MAX_FDS],
        }
    }

    /// Install in the lowest free slot.
    pub fn insert(&mut self, file: Arc<OpenFile>) -> KernelResult<Fd> {
        for (fd, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(file);
                return Ok(fd);
            }
        }
        Err(KernelError::FsError(FsError::TooManyOpenFiles))
    }

    /// Install at a specific slot, which must be free (stdio setup).
    pub fn insert_at(&mut self, fd: Fd, file: Arc<OpenFile>) -> KernelResult<()> {
        let slot = self
            .slots
            .get_mut(fd)
            .ok_or(KernelError::FsError(FsError::BadFileDescriptor))?;
        if slot.is_some() {
            return Err(KernelError::FsError(FsError::BadFileDescriptor));
        }
        *slot = Some(file);
        Ok(())
    }

    pub fn get(&self, fd: Fd) -> Option<Arc<OpenFile>> {
        self.slots.get(fd)?.clone()
    }

    /// Detach a descriptor without releasing it; the caller must
    /// `release()` the returned file outside any process-table lock.
    pub fn take(&mut self, fd: Fd) -> KernelResult<Arc<OpenFile>> {
        let slot = self
            .slots
            .get_mut(fd)
            .ok_or(KernelError::FsError(FsError::BadFileDescriptor))?;
        slot.take()
            .ok_or(KernelError::FsError(FsError::BadFileDescriptor))
    }

    /// Release a descriptor.
    pub fn close(&mut self, fd: Fd) -> KernelResult<()> {
        self.take(fd)?.dec_ref();
        Ok(())
    }

    /// Duplicate into the lowest free descriptor.
    pub fn dup(&mut self, fd: Fd) -> KernelResult<Fd> {
        let file = self
            .get(fd)
            .ok_or(KernelError::FsError(FsError::BadFileDescriptor))?;
        file.inc_ref();
        match self.insert(file.clone()) {
            Ok(new_fd) => Ok(new_fd),
            Err(e) => {
                file.dec_ref();
                Err(e)
            }
        }
    }

    /// Rebind `new` to `old`'s file. Whatever `new` held comes back to the
    /// caller, to be released outside any process-table lock.
    pub fn dup2(&mut self, old: Fd, new: Fd) -> KernelResult<(Fd, Option<Arc<OpenFile>>)> {
        let file = self
            .get(old)
            .ok_or(KernelError::FsError(FsError::BadFileDescriptor))?;
        if new >= MAX_FDS {
            return Err(KernelError::FsError(FsError::BadFileDescriptor));
        }
        if old == new {
            return Ok((new, None));
        }
        file.inc_ref();
        let displaced = self.slots[new].take();
        self.slots[new] = Some(file);
        Ok((new, displaced))
    }

    /// Share every descriptor with a forked child.
    pub fn clone_for_fork(&self) -> Self {
        let mut clone = Self::new();
        for (fd, slot) in self.slots.iter().enumerate() {
            if let Some(file) = slot {
                file.inc_ref();
                clone.slots[fd] = Some(file.clone());
            }
        }
        clone
    }

    /// Close everything (exit path).
    pub fn close_all(&mut self) {
        for slot in self.slots.iter_mut() {
            if let Some(file) = slot.take() {
                file.dec_ref();
            }
        }
    }

    pub fn count_open(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

impl Default for FileTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::ramfs::RamFs;
    use crate::fs::{Filesystem, Permissions};

    fn file_on_ramfs() -> Arc<OpenFile> {
        let fs = RamFs::new();
        let node = fs
            .root()
            .create("f", Permissions::default_file(), 0, 0)
            .unwrap();
        Arc::new(OpenFile::from_node(
            node,
            OpenFlags::READ | OpenFlags::WRITE,
        ))
    }

    #[test]
    fn descriptors_are_dense_from_zero() {
        let mut table = FileTable::new();
        assert_eq!(table.insert(file_on_ramfs()).unwrap(), 0);
        assert_eq!(table.insert(file_on_ramfs()).unwrap(), 1);
        table.close(0).unwrap();
        // Lowest free slot is reused.
        assert_eq!(table.insert(file_on_ramfs()).unwrap(), 0);
    }

    #[test]
    fn open_close_is_balanced() {
        let mut table = FileTable::new();
        let before = table.count_open();
        let fd = table.insert(file_on_ramfs()).unwrap();
        assert_eq!(table.count_open(), before + 1);
        table.close(fd).unwrap();
        assert_eq!(table.count_open(), before);
        assert!(table.close(fd).is_err());
    }

    #[test]
    fn table_capacity_is_fixed() {
        let mut table = FileTable::new();
        for _ in 0..MAX_FDS {
            table.insert(file_on_ramfs()).unwrap();
        }
        assert_eq!(
            table.insert(file_on_ramfs()).unwrap_err(),
            KernelError::FsError(FsError::TooManyOpenFiles)
        );
    }

    #[test]
    fn dup2_closes_target_and_shares_offset() {
        let mut table = FileTable::new();
        let fd = table.insert(file_on_ramfs()).unwrap();
        let other = table.insert(file_on_ramfs()).unwrap();

        let (_, displaced) = table.dup2(fd, other).unwrap();
        displaced.unwrap().release();
        let a = table.get(fd).unwrap();
        let b = table.get(other).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.refcount(), 2);

        // Writing through one descriptor moves the shared offset.
        a.write(b"xy").unwrap();
        assert_eq!(b.seek(SeekFrom::Current(0)).unwrap(), 2);
    }

    #[test]
    fn dup2_same_fd_is_noop() {
        let mut table = FileTable::new();
        let fd = table.insert(file_on_ramfs()).unwrap();
        let (new, displaced) = table.dup2(fd, fd).unwrap();
        assert_eq!(new, fd);
        assert!(displaced.is_none());
        assert_eq!(table.get(fd).unwrap().refcount(), 1);
    }

    #[test]
    fn fork_clone_bumps_refcounts() {
        let mut table = FileTable::new();
        let fd = table.insert(file_on_ramfs()).unwrap();
        let clone = table.clone_for_fork();
        assert_eq!(table.get(fd).unwrap().refcount(), 2);
        assert!(Arc::ptr_eq(
            &table.get(fd).unwrap(),
            &clone.get(fd).unwrap()
        ));
    }

    #[test]
    fn flags_gate_read_write() {
        let fs = RamFs::new();
        let node = fs
            .root()
            .create("f", Permissions::default_file(), 0, 0)
            .unwrap();
        let wr_only = OpenFile::from_node(node.clone(), OpenFlags::WRITE);
        let mut buf = [0u8; 4];
        assert!(wr_only.read(&mut buf).is_err());
        let rd_only = OpenFile::from_node(node, OpenFlags::READ);
        assert!(rd_only.write(b"x").is_err());
    }

    #[test]
    fn append_writes_at_end() {
        let fs = RamFs::new();
        let node = fs
            .root()
            .create("log", Permissions::default_file(), 0, 0)
            .unwrap();
        node.write(0, b"first").unwrap();
        let appender = OpenFile::from_node(node.clone(), OpenFlags::WRITE | OpenFlags::APPEND);
        appender.write(b"+more").unwrap();
        let mut buf = [0u8; 16];
        let n = node.read(0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"first+more");
    }

    #[test]
    fn user_bits_require_an_access_mode(){
        assert!(OpenFlags::from_user_bits(0x04).is_none()); // CREATE alone
        assert!(OpenFlags::from_user_bits(0x100).is_none()); // unknown bit
        assert_eq!(
            OpenFlags::from_user_bits(0x03),
            Some(OpenFlags::READ | OpenFlags::WRITE)
        );
    }
}
