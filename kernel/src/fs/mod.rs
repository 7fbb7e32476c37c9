//! Virtual filesystem layer.
//!
//! Filesystems expose trait-object nodes; the resolver walks path
//! components through `lookup`, handling `.`/`..` itself and forwarding
//! into mounted filesystems. Directory listing is dense-indexed: callers
//! iterate `readdir(0..)` until `None`.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::RwLock;

use crate::error::{FsError, KernelError, KernelResult};

pub mod blockdev;
pub mod console;
pub mod ext2;
pub mod file;
pub mod pipe;
pub mod ramfs;

pub use file::{FileTable, OpenFile, OpenFlags};

/// Maximum path length accepted from user space.
pub const PATH_MAX: usize = 1024;

/// Maximum length of one path component.
pub const NAME_MAX: usize = 255;

/// Filesystem node types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    File,
    Directory,
    CharDevice,
    BlockDevice,
    Pipe,
    /// Type tag only; links are not followed.
    Symlink,
    /// A directory shadowed by a mounted filesystem root.
    MountPoint,
}

/// Unix permission bits (rwxrwxrwx).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permissions(u16);

impl Permissions {
    pub const fn new(mode: u16) -> Self {
        Self(mode & 0o777)
    }

    /// rw-r--r--
    pub const fn default_file() -> Self {
        Self(0o644)
    }

    /// rwxr-xr-x
    pub const fn default_dir() -> Self {
        Self(0o755)
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn owner_has(self, access: Access) -> bool {
        self.0 & (access.bit() << 6) != 0
    }

    pub fn group_has(self, access: Access) -> bool {
        self.0 & (access.bit() << 3) != 0
    }

    pub fn other_has(self, access: Access) -> bool {
        self.0 & access.bit() != 0
    }
}

/// One of the classic rwx access kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    Execute,
}

impl Access {
    fn bit(self) -> u16 {
        match self {
            Self::Read => 0o4,
            Self::Write => 0o2,
            Self::Execute => 0o1,
        }
    }
}

/// Check an access against a node's credentials.
///
/// Grants when the caller's uid matches the owner and the owner bit is
/// set, or the gid matches and the group bit is set, or the other bit is
/// set. uid 0 passes unconditionally.
pub fn check_permission(
    meta: &Metadata,
    uid: u32,
    gid: u32,
    access: Access,
) -> KernelResult<()> {
    if uid == 0 {
        return Ok(());
    }
    let allowed = (uid == meta.uid && meta.permissions.owner_has(access))
        || (gid == meta.gid && meta.permissions.group_has(access))
        || meta.permissions.other_has(access);
    if allowed {
        Ok(())
    } else {
        Err(KernelError::FsError(FsError::PermissionDenied))
    }
}

/// Node metadata.
#[derive(Debug, Clone)]
pub struct Metadata {
    pub node_type: NodeType,
    pub size: usize,
    pub permissions: Permissions,
    pub uid: u32,
    pub gid: u32,
    pub inode: u64,
    pub created: u64,
    pub modified: u64,
    pub accessed: u64,
}

/// One directory entry, as returned by dense-index `readdir`.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub node_type: NodeType,
    pub inode: u64,
}

/// Filesystem statistics (ext2 superblock-derived; RAM FS synthesizes).
#[derive(Debug, Clone)]
pub struct FsStats {
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub total_inodes: u64,
    pub free_inodes: u64,
    pub block_size: u32,
    pub volume_label: String,
    pub clean: bool,
}

/// VFS node operations trait. Drivers implement what their node type
/// supports; the defaults reject with `NotSupported`.
pub trait VfsNode: Send + Sync {
    fn node_type(&self) -> NodeType;

    fn metadata(&self) -> KernelResult<Metadata>;

    /// Called when a descriptor opens this node.
    fn open(&self, _flags: OpenFlags) -> KernelResult<()> {
        Ok(())
    }

    /// Called when the last descriptor for an open file goes away.
    fn close(&self) {}

    /// Read bytes starting at `offset`; short reads at end of file.
    fn read(&self, offset: usize, buffer: &mut [u8]) -> KernelResult<usize>;

    /// Write bytes starting at `offset`, extending the file as needed.
    fn write(&self, offset: usize, data: &[u8]) -> KernelResult<usize>;

    fn truncate(&self, _size: usize) -> KernelResult<()> {
        Err(KernelError::FsError(FsError::NotSupported))
    }

    /// Dense directory iteration: entry `index`, or `None` past the end.
    fn readdir(&self, _index: usize) -> KernelResult<Option<DirEntry>> {
        Err(KernelError::FsError(FsError::NotADirectory))
    }

    /// Look up a child by name.
    fn lookup(&self, _name: &str) -> KernelResult<Arc<dyn VfsNode>> {
        Err(KernelError::FsError(FsError::NotADirectory))
    }

    fn create(
        &self,
        _name: &str,
        _permissions: Permissions,
        _uid: u32,
        _gid: u32,
    ) -> KernelResult<Arc<dyn VfsNode>> {
        Err(KernelError::FsError(FsError::NotSupported))
    }

    fn mkdir(
        &self,
        _name: &str,
        _permissions: Permissions,
        _uid: u32,
        _gid: u32,
    ) -> KernelResult<Arc<dyn VfsNode>> {
        Err(KernelError::FsError(FsError::NotSupported))
    }

    fn unlink(&self, _name: &str) -> KernelResult<()> {
        Err(KernelError::FsError(FsError::NotSupported))
    }

    fn chmod(&self, _permissions: Permissions) -> KernelResult<()> {
        Err(KernelError::FsError(FsError::NotSupported))
    }

    fn chown(&self, _uid: u32, _gid: u32) -> KernelResult<()> {
        Err(KernelError::FsError(FsError::NotSupported))
    }
}

/// A mounted filesystem.
pub trait Filesystem: Send + Sync {
    fn root(&self) -> Arc<dyn VfsNode>;
    fn name(&self) -> &str;
    fn is_readonly(&self) -> bool;
    fn sync(&self) -> KernelResult<()>;
    fn statfs(&self) -> KernelResult<FsStats> {
        Err(KernelError::FsError(FsError::NotSupported))
    }
}

/// Virtual filesystem manager: the root filesystem plus mount points.
pub struct Vfs {
    root_fs: RwLock<Option<Arc<dyn Filesystem>>>,
    mounts: RwLock<BTreeMap<String, Arc<dyn Filesystem>>>,
}

impl Vfs {
    pub const fn new() -> Self {
        Self {
            root_fs: RwLock::new(None),
            mounts: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn mount_root(&self, fs: Arc<dyn Filesystem>) -> KernelResult<()> {
        let mut root = self.root_fs.write();
        if root.is_some() {
            return Err(KernelError::FsError(FsError::AlreadyMounted));
        }
        *root = Some(fs);
        Ok(())
    }

    /// Mount `fs` over the directory at `path`.
    pub fn mount(&self, path: &str, fs: Arc<dyn Filesystem>) -> KernelResult<()> {
        if !path.starts_with('/') || path == "/" {
            return Err(KernelError::FsError(FsError::InvalidPath));
        }
        // The covered directory must exist.
        let node = self.resolve("/", path)?;
        if node.node_type() != NodeType::Directory {
            return Err(KernelError::FsError(FsError::NotADirectory));
        }
        let mut mounts = self.mounts.write();
        if mounts.contains_key(path) {
            return Err(KernelError::FsError(FsError::AlreadyMounted));
        }
        mounts.insert(String::from(path), fs);
        Ok(())
    }

    pub fn unmount(&self, path: &str) -> KernelResult<()> {
        self.mounts
            .write()
            .remove(path)
            .map(|_| ())
            .ok_or(KernelError::FsError(FsError::NotFound))
    }

    /// Canonicalize `path` relative to `cwd`: absolute, no `.`/`..`, no
    /// empty components.
    pub fn canonicalize(cwd: &str, path: &str) -> String {
        let mut stack: Vec<&str> = Vec::new();
        let full: String;
        let joined = if path.starts_with('/') {
            path
        } else {
            full = alloc::format!("{}/{}", cwd, path);
            &full
        };
        for component in joined.split('/') {
            match component {
                "" | "." => {}
                ".." => {
                    stack.pop();
                }
                name => stack.push(name),
            }
        }
        if stack.is_empty() {
            String::from("/")
        } else {
            let mut out = String::new();
            for name in stack {
                out.push('/');
                out.push_str(name);
            }
            out
        }
    }

    /// The filesystem responsible for a canonical path, plus the residual
    /// path inside it. Longest mount prefix wins.
    fn filesystem_for(&self, canonical: &str) -> KernelResult<(Arc<dyn Filesystem>, String)> {
        let mounts = self.mounts.read();
        let mut best: Option<(&String, &Arc<dyn Filesystem>)> = None;
        for (mount_path, fs) in mounts.iter() {
            let covers = canonical == mount_path
                || canonical.starts_with(mount_path.as_str())
                    && canonical.as_bytes()[mount_path.len()] == b'/';
            if covers && best.map_or(true, |(b, _)| mount_path.len() > b.len()) {
                best = Some((mount_path, fs));
            }
        }
        if let Some((mount_path, fs)) = best {
            let rest = String::from(&canonical[mount_path.len()..]);
            return Ok((fs.clone(), rest));
        }
        let root = self
            .root_fs
            .read()
            .clone()
            .ok_or(KernelError::FsError(FsError::NoRootFs))?;
        Ok((root, String::from(canonical)))
    }

    /// Resolve a path (relative paths start at `cwd`) to a node.
    pub fn resolve(&self, cwd: &str, path: &str) -> KernelResult<Arc<dyn VfsNode>> {
        if path.len() > PATH_MAX {
            return Err(KernelError::FsError(FsError::InvalidPath));
        }
        let canonical = Self::canonicalize(cwd, path);
        let (fs, rest) = self.filesystem_for(&canonical)?;
        let mut node = fs.root();
        for component in rest.split('/').filter(|c| !c.is_empty()) {
            node = node.lookup(component)?;
        }
        Ok(node)
    }

    /// Resolve everything but the last component; returns the parent
    /// directory node and the final name.
    pub fn resolve_parent(
        &self,
        cwd: &str,
        path: &str,
    ) -> KernelResult<(Arc<dyn VfsNode>, String)> {
        let canonical = Self::canonicalize(cwd, path);
        if canonical == "/" {
            return Err(KernelError::FsError(FsError::InvalidPath));
        }
        let split = canonical.rfind('/').unwrap();
        let (dir_path, name) = canonical.split_at(split);
        let name = &name[1..];
        if name.is_empty() || name.len() > NAME_MAX {
            return Err(KernelError::FsError(FsError::InvalidPath));
        }
        let dir_path = if dir_path.is_empty() { "/" } else { dir_path };
        let parent = self.resolve("/", dir_path)?;
        if parent.node_type() != NodeType::Directory {
            return Err(KernelError::FsError(FsError::NotADirectory));
        }
        Ok((parent, String::from(name)))
    }

    /// Open (and possibly create/truncate) the node at `path`, enforcing
    /// permissions for the caller.
    pub fn open(
        &self,
        cwd: &str,
        path: &str,
        flags: OpenFlags,
        uid: u32,
        gid: u32,
    ) -> KernelResult<Arc<dyn VfsNode>> {
        let node = match self.resolve(cwd, path) {
            Ok(node) => node,
            Err(KernelError::FsError(FsError::NotFound)) if flags.contains(OpenFlags::CREATE) => {
                let (parent, name) = self.resolve_parent(cwd, path)?;
                check_permission(&parent.metadata()?, uid, gid, Access::Write)?;
                parent.create(&name, Permissions::default_file(), uid, gid)?
            }
            Err(e) => return Err(e),
        };

        let meta = node.metadata()?;
        if meta.node_type == NodeType::Directory && flags.contains(OpenFlags::WRITE) {
            return Err(KernelError::FsError(FsError::IsADirectory));
        }
        if flags.contains(OpenFlags::READ) {
            check_permission(&meta, uid, gid, Access::Read)?;
        }
        if flags.contains(OpenFlags::WRITE) {
            check_permission(&meta, uid, gid, Access::Write)?;
        }
        if flags.contains(OpenFlags::TRUNCATE) && meta.node_type == NodeType::File {
            node.truncate(0)?;
        }
        node.open(flags)?;
        Ok(node)
    }

    pub fn stat(&self, cwd: &str, path: &str) -> KernelResult<Metadata> {
        self.resolve(cwd, path)?.metadata()
    }

    pub fn mkdir(&self, cwd: &str, path: &str, uid: u32, gid: u32) -> KernelResult<()> {
        let (parent, name) = self.resolve_parent(cwd, path)?;
        check_permission(&parent.metadata()?, uid, gid, Access::Write)?;
        parent.mkdir(&name, Permissions::default_dir(), uid, gid)?;
        Ok(())
    }

    pub fn unlink(&self, cwd: &str, path: &str, uid: u32, gid: u32) -> KernelResult<()> {
        let (parent, name) = self.resolve_parent(cwd, path)?;
        check_permission(&parent.metadata()?, uid, gid, Access::Write)?;
        parent.unlink(&name)
    }

    pub fn chmod(
        &self,
        cwd: &str,
        path: &str,
        mode: u16,
        uid: u32,
        _gid: u32,
    ) -> KernelResult<()> {
        let node = self.resolve(cwd, path)?;
        let meta = node.metadata()?;
        if uid != 0 && uid != meta.uid {
            return Err(KernelError::FsError(FsError::PermissionDenied));
        }
        node.chmod(Permissions::new(mode))
    }

    pub fn chown(&self, cwd: &str, path: &str, new_uid: u32, new_gid: u32, uid: u32) -> KernelResult<()> {
        if uid != 0 {
            return Err(KernelError::FsError(FsError::PermissionDenied));
        }
        self.resolve(cwd, path)?.chown(new_uid, new_gid)
    }

    /// Flush every mounted filesystem.
    pub fn sync(&self) -> KernelResult<()> {
        if let Some(root) = self.root_fs.read().clone() {
            root.sync()?;
        }
        let mounts: Vec<Arc<dyn Filesystem>> = self.mounts.read().values().cloned().collect();
        for fs in mounts {
            fs.sync()?;
        }
        Ok(())
    }
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

/// The kernel-wide VFS.
static VFS: Vfs = Vfs::new();

pub fn vfs() -> &'static Vfs {
    &VFS
}

/// Mount a fresh RAM filesystem as root and create the standard
/// directories. The in-memory tree starts empty on every boot.
pub fn init() {
    let ramfs = Arc::new(ramfs::RamFs::new());
    if VFS.mount_root(ramfs.clone()).is_err() {
        log::warn!("vfs: root already mounted, skipping re-init");
        return;
    }
    let root = ramfs.root();
    for dir in ["bin", "dev", "etc", "home", "tmp"] {
        let _ = root.mkdir(dir, Permissions::default_dir(), 0, 0);
    }
    log::info!("vfs: ramfs root mounted");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_vfs() -> Vfs {
        let vfs = Vfs::new();
        vfs.mount_root(Arc::new(ramfs::RamFs::new())).unwrap();
        vfs
    }

    #[test]
    fn canonicalize_handles_dot_and_dotdot() {
        assert_eq!(Vfs::canonicalize("/", "."), "/");
        assert_eq!(Vfs::canonicalize("/home", "file"), "/home/file");
        assert_eq!(Vfs::canonicalize("/home", "../etc//passwd"), "/etc/passwd");
        assert_eq!(Vfs::canonicalize("/", "a/b/../c/./d"), "/a/c/d");
        assert_eq!(Vfs::canonicalize("/", "../.."), "/");
    }

    #[test]
    fn resolve_walks_directories() {
        let vfs = test_vfs();
        vfs.mkdir("/", "/a", 0, 0).unwrap();
        vfs.mkdir("/", "/a/b", 0, 0).unwrap();
        let node = vfs.resolve("/", "/a/b").unwrap();
        assert_eq!(node.node_type(), NodeType::Directory);
        // Relative resolution from a cwd.
        let node = vfs.resolve("/a", "b").unwrap();
        assert_eq!(node.node_type(), NodeType::Directory);
        // `..` is handled by the resolver, not the driver.
        let node = vfs.resolve("/a/b", "../b/../../a").unwrap();
        assert_eq!(node.node_type(), NodeType::Directory);
    }

    #[test]
    fn open_create_write_read_round_trip() {
        let vfs = test_vfs();
        let node = vfs
            .open("/", "/hello", OpenFlags::WRITE | OpenFlags::CREATE, 0, 0)
            .unwrap();
        node.write(0, b"abc").unwrap();

        let node = vfs.open("/", "/hello", OpenFlags::READ, 0, 0).unwrap();
        let mut buf = [0u8; 8];
        let n = node.read(0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"abc");
    }

    #[test]
    fn open_missing_without_create_fails() {
        let vfs = test_vfs();
        match vfs.open("/", "/nope", OpenFlags::READ, 0, 0) {
            Err(err) => assert_eq!(err, KernelError::FsError(FsError::NotFound)),
            Ok(_) => panic!("expected NotFound error"),
        }
    }

    #[test]
    fn truncate_on_open() {
        let vfs = test_vfs();
        let node = vfs
            .open("/", "/t", OpenFlags::WRITE | OpenFlags::CREATE, 0, 0)
            .unwrap();
        node.write(0, b"0123456789").unwrap();
        let node = vfs
            .open("/", "/t", OpenFlags::WRITE | OpenFlags::TRUNCATE, 0, 0)
            .unwrap();
        assert_eq!(node.metadata().unwrap().size, 0);
    }

    #[test]
    fn permission_disjunction_matches_contract() {
        let meta = Metadata {
            node_type: NodeType::File,
            size: 0,
            permissions: Permissions::new(0o004), // only "other" readable
            uid: 100,
            gid: 100,
            inode: 1,
            created: 0,
            modified: 0,
            accessed: 0,
        };
        // Owner whose owner-bit is clear still passes via the other bit.
        assert!(check_permission(&meta, 100, 100, Access::Read).is_ok());
        assert!(check_permission(&meta, 200, 200, Access::Read).is_ok());
        assert!(check_permission(&meta, 200, 200, Access::Write).is_err());
        // Root bypasses everything.
        assert!(check_permission(&meta, 0, 0, Access::Write).is_ok());
    }

    #[test]
    fn unprivileged_writes_need_permission() {
        let vfs = test_vfs();
        let node = vfs
            .open("/", "/secret", OpenFlags::WRITE | OpenFlags::CREATE, 0, 0)
            .unwrap();
        node.write(0, b"root only").unwrap();
        // default_file() is 0o644: uid 1000 cannot open for writing.
        let err = vfs.open("/", "/secret", OpenFlags::WRITE, 1000, 1000);
        assert!(err.is_err());
        // But can read.
        assert!(vfs.open("/", "/secret", OpenFlags::READ, 1000, 1000).is_ok());
    }

    #[test]
    fn mount_forwards_resolution() {
        let vfs = test_vfs();
        vfs.mkdir("/", "/mnt", 0, 0).unwrap();
        let inner = Arc::new(ramfs::RamFs::new());
        inner
            .root()
            .create("inside", Permissions::default_file(), 0, 0)
            .unwrap();
        vfs.mount("/mnt", inner).unwrap();

        let node = vfs.resolve("/", "/mnt/inside").unwrap();
        assert_eq!(node.node_type(), NodeType::File);

        vfs.unmount("/mnt").unwrap();
        assert!(vfs.resolve("/", "/mnt/inside").is_err());
    }

    #[test]
    fn mkdir_and_unlink_round_trip() {
        let vfs = test_vfs();
        vfs.mkdir("/", "/d", 0, 0).unwrap();
        vfs.open("/", "/d/f", OpenFlags::WRITE | OpenFlags::CREATE, 0, 0)
            .unwrap();
        // Non-empty directory cannot be unlinked.
        assert_eq!(
            vfs.unlink("/", "/d", 0, 0),
            Err(KernelError::FsError(FsError::DirectoryNotEmpty))
        );
        vfs.unlink("/", "/d/f", 0, 0).unwrap();
        vfs.unlink("/", "/d", 0, 0).unwrap();
        assert!(vfs.resolve("/", "/d").is_err());
    }

    #[test]
    fn chmod_requires_ownership() {
        let vfs = test_vfs();
        let node = vfs
            .open("/", "/f", OpenFlags::WRITE | OpenFlags::CREATE, 0, 0)
            .unwrap();
        drop(node);
        assert!(vfs.chmod("/", "/f", 0o600, 1000, 1000).is_err());
        assert!(vfs.chmod("/", "/f", 0o600, 0, 0).is_ok());
        assert_eq!(vfs.stat("/", "/f").unwrap().permissions.bits(), 0o600);
    }
}
