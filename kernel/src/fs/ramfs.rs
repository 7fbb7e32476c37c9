//! RAM filesystem.
//!
//! Heap-backed files and directories, discarded at shutdown. Serves as the
//! boot root filesystem and the scratch space under /tmp.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::RwLock;

use super::{DirEntry, Filesystem, FsStats, Metadata, NodeType, Permissions, VfsNode};
use crate::error::{FsError, KernelError, KernelResult};

/// Hard per-file size cap (1 MiB).
pub const MAX_FILE_SIZE: usize = 1024 * 1024;

static NEXT_INODE: AtomicU64 = AtomicU64::new(1);

struct RamNode {
    node_type: NodeType,
    inode: u64,
    data: RwLock<Vec<u8>>,
    /// Directory children in creation order, so readdir indices are dense
    /// and stable.
    children: RwLock<Vec<(String, Arc<RamNode>)>>,
    metadata: RwLock<Metadata>,
}

impl RamNode {
    fn new(node_type: NodeType, permissions: Permissions, uid: u32, gid: u32) -> Self {
        let now = crate::timer::timestamp_secs();
        let inode = NEXT_INODE.fetch_add(1, Ordering::Relaxed);
        Self {
            node_type,
            inode,
            data: RwLock::new(Vec::new()),
            children: RwLock::new(Vec::new()),
            metadata: RwLock::new(Metadata {
                node_type,
                size: 0,
                permissions,
                uid,
                gid,
                inode,
                created: now,
                modified: now,
                accessed: now,
            }),
        }
    }

    fn touch_modified(&self) {
        let mut meta = self.metadata.write();
        meta.modified = crate::timer::timestamp_secs();
    }

    fn find_child(&self, name: &str) -> Option<Arc<RamNode>> {
        self.children
            .read()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, node)| node.clone())
    }
}

impl VfsNode for RamNode {
    fn node_type(&self) -> NodeType {
        self.node_type
    }

    fn metadata(&self) -> KernelResult<Metadata> {
        Ok(self.metadata.read().clone())
    }

    fn read(&self, offset: usize, buffer: &mut [u8]) -> KernelResult<usize> {
        if self.node_type != NodeType::File {
            return Err(KernelError::FsError(FsError::NotAFile));
        }
        let data = self.data.read();
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buffer.len().min(data.len() - offset);
        buffer[..n].copy_from_slice(&data[offset..offset + n]);
        self.metadata.write().accessed = crate::timer::timestamp_secs();
        Ok(n)
    }

    fn write(&self, offset: usize, data: &[u8]) -> KernelResult<usize> {
        if self.node_type != NodeType::File {
            return Err(KernelError::FsError(FsError::NotAFile));
        }
        let end = offset
            .checked_add(data.len())
            .ok_or(KernelError::FsError(FsError::FileTooLarge))?;
        if end > MAX_FILE_SIZE {
            return Err(KernelError::FsError(FsError::FileTooLarge));
        }
        let mut file = self.data.write();
        if end > file.len() {
            file.resize(end, 0);
        }
        file[offset..end].copy_from_slice(data);

        let mut meta = self.metadata.write();
        meta.size = file.len();
        meta.modified = crate::timer::timestamp_secs();
        Ok(data.len())
    }

    fn truncate(&self, size: usize) -> KernelResult<()> {
        if self.node_type != NodeType::File {
            return Err(KernelError::FsError(FsError::NotAFile));
        }
        if size > MAX_FILE_SIZE {
            return Err(KernelError::FsError(FsError::FileTooLarge));
        }
        self.data.write().resize(size, 0);
        let mut meta = self.metadata.write();
        meta.size = size;
        meta.modified = crate::timer::timestamp_secs();
        Ok(())
    }

    fn readdir(&self, index: usize) -> KernelResult<Option<DirEntry>> {
        if self.node_type != NodeType::Directory {
            return Err(KernelError::FsError(FsError::NotADirectory));
        }
        // Indices 0 and 1 synthesize `.` and `..`; children follow.
        match index {
            0 => Ok(Some(DirEntry {
                name: String::from("."),
                node_type: NodeType::Directory,
                inode: self.inode,
            })),
            1 => Ok(Some(DirEntry {
                name: String::from(".."),
                node_type: NodeType::Directory,
                inode: self.inode,
            })),
            n => Ok(self.children.read().get(n - 2).map(|(name, node)| DirEntry {
                name: name.clone(),
                node_type: node.node_type,
                inode: node.inode,
            })),
        }
    }

    fn lookup(&self, name: &str) -> KernelResult<Arc<dyn VfsNode>> {
        if self.node_type != NodeType::Directory {
            return Err(KernelError::FsError(FsError::NotADirectory));
        }
        self.find_child(name)
            .map(|node| node as Arc<dyn VfsNode>)
            .ok_or(KernelError::FsError(FsError::NotFound))
    }

    fn create(
        &self,
        name: &str,
        permissions: Permissions,
        uid: u32,
        gid: u32,
    ) -> KernelResult<Arc<dyn VfsNode>> {
        self.add_child(name, NodeType::File, permissions, uid, gid)
    }

    fn mkdir(
        &self,
        name: &str,
        permissions: Permissions,
        uid: u32,
        gid: u32,
    ) -> KernelResult<Arc<dyn VfsNode>> {
        self.add_child(name, NodeType::Directory, permissions, uid, gid)
    }

    fn unlink(&self, name: &str) -> KernelResult<()> {
        if self.node_type != NodeType::Directory {
            return Err(KernelError::FsError(FsError::NotADirectory));
        }
        let mut children = self.children.write();
        let position = children
            .iter()
            .position(|(n, _)| n == name)
            .ok_or(KernelError::FsError(FsError::NotFound))?;
        if children[position].1.node_type == NodeType::Directory
            && !children[position].1.children.read().is_empty()
        {
            return Err(KernelError::FsError(FsError::DirectoryNotEmpty));
        }
        children.remove(position);
        drop(children);
        self.touch_modified();
        Ok(())
    }

    fn chmod(&self, permissions: Permissions) -> KernelResult<()> {
        self.metadata.write().permissions = permissions;
        Ok(())
    }

    fn chown(&self, uid: u32, gid: u32) -> KernelResult<()> {
        let mut meta = self.metadata.write();
        meta.uid = uid;
        meta.gid = gid;
        Ok(())
    }
}

impl RamNode {
    fn add_child(
        &self,
        name: &str,
        node_type: NodeType,
        permissions: Permissions,
        uid: u32,
        gid: u32,
    ) -> KernelResult<Arc<dyn VfsNode>> {
        if self.node_type != NodeType::Directory {
            return Err(KernelError::FsError(FsError::NotADirectory));
        }
        if name.is_empty() || name.contains('/') || name.len() > super::NAME_MAX {
            return Err(KernelError::FsError(FsError::InvalidPath));
        }
        let mut children = self.children.write();
        if children.iter().any(|(n, _)| n == name) {
            return Err(KernelError::FsError(FsError::AlreadyExists));
        }
        let node = Arc::new(RamNode::new(node_type, permissions, uid, gid));
        children.push((String::from(name), node.clone()));
        drop(children);
        self.touch_modified();
        Ok(node)
    }
}

/// The RAM filesystem proper.
pub struct RamFs {
    root: Arc<RamNode>,
}

impl RamFs {
    pub fn new() -> Self {
        Self {
            root: Arc::new(RamNode::new(
                NodeType::Directory,
                Permissions::default_dir(),
                0,
                0,
            )),
        }
    }
}

impl Default for RamFs {
    fn default() -> Self {
        Self::new()
    }
}

impl Filesystem for RamFs {
    fn root(&self) -> Arc<dyn VfsNode> {
        self.root.clone()
    }

    fn name(&self) -> &str {
        "ramfs"
    }

    fn is_readonly(&self) -> bool {
        false
    }

    fn sync(&self) -> KernelResult<()> {
        Ok(())
    }

    fn statfs(&self) -> KernelResult<FsStats> {
        let heap = crate::mm::heap::stats();
        Ok(FsStats {
            total_bytes: heap.total as u64,
            free_bytes: heap.free as u64,
            total_inodes: 0,
            free_inodes: 0,
            block_size: 1,
            volume_label: String::from("ramfs"),
            clean: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_write_read() {
        let fs = RamFs::new();
        let f = fs
            .root()
            .create("a.txt", Permissions::default_file(), 0, 0)
            .unwrap();
        assert_eq!(f.write(0, b"Hello, World!").unwrap(), 13);
        let mut buf = [0u8; 32];
        assert_eq!(f.read(0, &mut buf).unwrap(), 13);
        assert_eq!(&buf[..13], b"Hello, World!");
    }

    #[test]
    fn write_extends_with_zero_fill() {
        let fs = RamFs::new();
        let f = fs
            .root()
            .create("gap", Permissions::default_file(), 0, 0)
            .unwrap();
        f.write(5, b"end").unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(f.read(0, &mut buf).unwrap(), 8);
        assert_eq!(&buf[..5], &[0; 5]);
        assert_eq!(&buf[5..], b"end");
    }

    #[test]
    fn per_file_size_limit_is_enforced() {
        let fs = RamFs::new();
        let f = fs
            .root()
            .create("big", Permissions::default_file(), 0, 0)
            .unwrap();
        assert_eq!(
            f.write(MAX_FILE_SIZE, b"x").unwrap_err(),
            KernelError::FsError(FsError::FileTooLarge)
        );
        assert!(f.write(MAX_FILE_SIZE - 1, b"x").is_ok());
    }

    #[test]
    fn readdir_is_dense_and_terminates() {
        let fs = RamFs::new();
        let root = fs.root();
        root.create("f1", Permissions::default_file(), 0, 0).unwrap();
        root.mkdir("d1", Permissions::default_dir(), 0, 0).unwrap();

        let mut names = alloc::vec::Vec::new();
        let mut index = 0;
        while let Some(entry) = root.readdir(index).unwrap() {
            names.push(entry.name);
            index += 1;
        }
        assert_eq!(names, [".", "..", "f1", "d1"]);
        // Everything at or past the count returns nothing.
        assert!(root.readdir(index).unwrap().is_none());
        assert!(root.readdir(index + 100).unwrap().is_none());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let fs = RamFs::new();
        let root = fs.root();
        root.create("dup", Permissions::default_file(), 0, 0).unwrap();
        match root.create("dup", Permissions::default_file(), 0, 0) {
            Err(e) => assert_eq!(e, KernelError::FsError(FsError::AlreadyExists)),
            Ok(_) => panic!("expected AlreadyExists error"),
        }
    }

    #[test]
    fn unlink_removes_and_protects_nonempty_dirs() {
        let fs = RamFs::new();
        let root = fs.root();
        let d = root.mkdir("d", Permissions::default_dir(), 0, 0).unwrap();
        d.create("inner", Permissions::default_file(), 0, 0).unwrap();

        assert_eq!(
            root.unlink("d").unwrap_err(),
            KernelError::FsError(FsError::DirectoryNotEmpty)
        );
        d.unlink("inner").unwrap();
        root.unlink("d").unwrap();
        assert!(root.lookup("d").is_err());
    }

    #[test]
    fn truncate_then_reread() {
        let fs = RamFs::new();
        let f = fs
            .root()
            .create("t", Permissions::default_file(), 0, 0)
            .unwrap();
        f.write(0, b"0123456789").unwrap();
        f.truncate(4).unwrap();
        assert_eq!(f.metadata().unwrap().size, 4);
        let mut buf = [0u8; 16];
        assert_eq!(f.read(0, &mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"0123");
    }

    #[test]
    fn chmod_chown_update_metadata() {
        let fs = RamFs::new();
        let f = fs
            .root()
            .create("c", Permissions::default_file(), 0, 0)
            .unwrap();
        f.chmod(Permissions::new(0o600)).unwrap();
        f.chown(1000, 1000).unwrap();
        let meta = f.metadata().unwrap();
        assert_eq!(meta.permissions.bits(), 0o600);
        assert_eq!(meta.uid, 1000);
        assert_eq!(meta.gid, 1000);
    }

    #[test]
    fn files_reject_directory_operations() {
        let fs = RamFs::new();
        let f = fs
            .root()
            .create("plain", Permissions::default_file(), 0, 0)
            .unwrap();
        assert!(f.lookup("x").is_err());
        assert!(f.readdir(0).is_err());
        let mut buf = [0u8; 4];
        assert!(fs.root().read(0, &mut buf).is_err());
        assert!(fs.root().write(0, b"x").is_err());
    }
}
