//! Read/write ext2 driver.
//!
//! Supports revision 0 and 1 volumes with block size >= 1 KiB and no
//! feature extensions (no journal, no extents). The superblock and group
//! descriptors are cached at mount; inodes are loaded on demand and
//! written back on every metadata change. All writes are synchronous:
//! there is no dirty list, so a crash mid-write can leave bitmap counters
//! ahead of reality until fsck.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::{Mutex, RwLock};

use super::blockdev::BlockDevice;
use super::{DirEntry, Filesystem, FsStats, Metadata, NodeType, Permissions, VfsNode};
use crate::error::{FsError, KernelError, KernelResult};

pub mod disk;
pub mod format;

use disk::{
    dirent_size, encode_dirent, file_type_code, node_type_for_code, parse_dirent, read_struct,
    write_struct, GroupDesc, Inode, RawDirEntry, Superblock, DIND_SLOT, DIRECT_BLOCKS,
    FIRST_FREE_INODE, GROUP_DESC_SIZE, IND_SLOT, ROOT_INODE, S_IFDIR, S_IFMT, S_IFREG, STATE_CLEAN,
    TIND_SLOT,
};

pub use format::mkfs;

struct Ext2Inner {
    dev: Arc<dyn BlockDevice>,
    sb: RwLock<Superblock>,
    groups: RwLock<Vec<GroupDesc>>,
    /// Serializes allocation and directory surgery.
    alloc_lock: Mutex<()>,
    block_size: usize,
}

/// A mounted ext2 filesystem.
pub struct Ext2Fs {
    inner: Arc<Ext2Inner>,
}

impl Ext2Fs {
    /// Mount the volume on `dev`, validating the superblock.
    pub fn mount(dev: Arc<dyn BlockDevice>) -> KernelResult<Self> {
        let mut sb_bytes = alloc::vec![0u8; 1024];
        read_bytes(&*dev, 1024, &mut sb_bytes)?;
        let sb: Superblock = read_struct(&sb_bytes);

        if !sb.is_valid() {
            return Err(KernelError::FsError(FsError::Corrupted));
        }
        if sb.rev_level > 1 || sb.feature_incompat != 0 {
            return Err(KernelError::FsError(FsError::NotSupported));
        }
        if sb.inode_record_size() != disk::INODE_SIZE {
            return Err(KernelError::FsError(FsError::NotSupported));
        }
        let block_size = sb.block_size();
        if block_size % dev.block_size() != 0 {
            return Err(KernelError::FsError(FsError::NotSupported));
        }

        // Cache every group descriptor; they live in the block after the
        // superblock.
        let group_count = sb.group_count();
        let desc_block = sb.first_data_block as u64 + 1;
        let desc_blocks = (group_count * GROUP_DESC_SIZE).div_ceil(block_size);
        let mut desc_bytes = alloc::vec![0u8; desc_blocks * block_size];
        read_bytes(
            &*dev,
            desc_block * block_size as u64,
            &mut desc_bytes,
        )?;
        let mut groups = Vec::with_capacity(group_count);
        for i in 0..group_count {
            groups.push(read_struct::<GroupDesc>(&desc_bytes[i * GROUP_DESC_SIZE..]));
        }

        log::info!(
            "ext2: '{}' {} blocks of {} bytes, {} inodes, {} groups",
            sb.label(),
            sb.blocks_count,
            block_size,
            sb.inodes_count,
            group_count
        );

        Ok(Self {
            inner: Arc::new(Ext2Inner {
                dev,
                sb: RwLock::new(sb),
                groups: RwLock::new(groups),
                alloc_lock: Mutex::new(()),
                block_size,
            }),
        })
    }

    fn node(&self, ino: u32) -> Arc<dyn VfsNode> {
        Arc::new(Ext2Node {
            fs: self.inner.clone(),
            ino,
        })
    }
}

/// Byte-granular device read (offset and length block-aligned at the
/// device level is not required; this helper handles straddling).
fn read_bytes(dev: &dyn BlockDevice, offset: u64, buf: &mut [u8]) -> KernelResult<()> {
    let dev_bs = dev.block_size() as u64;
    let first = offset / dev_bs;
    let last = (offset + buf.len() as u64).div_ceil(dev_bs);
    let mut raw = alloc::vec![0u8; ((last - first) * dev_bs) as usize];
    dev.read_blocks(first, &mut raw)?;
    let skip = (offset - first * dev_bs) as usize;
    buf.copy_from_slice(&raw[skip..skip + buf.len()]);
    Ok(())
}

fn write_bytes(dev: &dyn BlockDevice, offset: u64, data: &[u8]) -> KernelResult<()> {
    let dev_bs = dev.block_size() as u64;
    let first = offset / dev_bs;
    let last = (offset + data.len() as u64).div_ceil(dev_bs);
    let mut raw = alloc::vec![0u8; ((last - first) * dev_bs) as usize];
    dev.read_blocks(first, &mut raw)?;
    let skip = (offset - first * dev_bs) as usize;
    raw[skip..skip + data.len()].copy_from_slice(data);
    dev.write_blocks(first, &raw)?;
    Ok(())
}

impl Ext2Inner {
    fn read_block(&self, block: u32) -> KernelResult<Vec<u8>> {
        let mut buf = alloc::vec![0u8; self.block_size];
        read_bytes(&*self.dev, block as u64 * self.block_size as u64, &mut buf)?;
        Ok(buf)
    }

    fn write_block(&self, block: u32, data: &[u8]) -> KernelResult<()> {
        debug_assert_eq!(data.len(), self.block_size);
        write_bytes(&*self.dev, block as u64 * self.block_size as u64, data)
    }

    /// Pointers per indirect block.
    fn ppb(&self) -> usize {
        self.block_size / 4
    }

    fn write_superblock(&self) -> KernelResult<()> {
        let sb = *self.sb.read();
        let mut bytes = alloc::vec![0u8; core::mem::size_of::<Superblock>()];
        write_struct(&mut bytes, &sb);
        write_bytes(&*self.dev, 1024, &bytes)
    }

    fn write_group(&self, index: usize) -> KernelResult<()> {
        let desc = self.groups.read()[index];
        let sb = self.sb.read();
        let desc_block = sb.first_data_block as u64 + 1;
        drop(sb);
        let offset = desc_block * self.block_size as u64 + (index * GROUP_DESC_SIZE) as u64;
        let mut bytes = [0u8; GROUP_DESC_SIZE];
        write_struct(&mut bytes, &desc);
        write_bytes(&*self.dev, offset, &bytes)
    }

    // -- inode I/O -------------------------------------------------------

    fn inode_location(&self, ino: u32) -> KernelResult<u64> {
        let sb = self.sb.read();
        if ino == 0 || ino > sb.inodes_count {
            return Err(KernelError::FsError(FsError::Corrupted));
        }
        let group = ((ino - 1) / sb.inodes_per_group) as usize;
        let index = ((ino - 1) % sb.inodes_per_group) as u64;
        let table = self.groups.read()[group].inode_table as u64;
        Ok(table * self.block_size as u64 + index * disk::INODE_SIZE as u64)
    }

    fn read_inode(&self, ino: u32) -> KernelResult<Inode> {
        let offset = self.inode_location(ino)?;
        let mut bytes = [0u8; disk::INODE_SIZE];
        read_bytes(&*self.dev, offset, &mut bytes)?;
        Ok(read_struct(&bytes))
    }

    /// Write an inode back; every metadata change goes through here.
    fn write_inode(&self, ino: u32, inode: &Inode) -> KernelResult<()> {
        let offset = self.inode_location(ino)?;
        let mut bytes = [0u8; disk::INODE_SIZE];
        write_struct(&mut bytes, inode);
        write_bytes(&*self.dev, offset, &bytes)
    }

    // -- bitmap allocation ----------------------------------------------

    /// Allocate and zero one data block.
    fn alloc_block(&self) -> KernelResult<u32> {
        let sb_snapshot = *self.sb.read();
        let group_count = sb_snapshot.group_count();
        for group in 0..group_count {
            if self.groups.read()[group].free_blocks_count == 0 {
                continue;
            }
            let bitmap_block = self.groups.read()[group].block_bitmap;
            let mut bitmap = self.read_block(bitmap_block)?;
            let group_blocks = self.blocks_in_group(&sb_snapshot, group);
            if let Some(bit) = find_clear_bit(&bitmap, group_blocks) {
                set_bit(&mut bitmap, bit);
                self.write_block(bitmap_block, &bitmap)?;
                {
                    let mut groups = self.groups.write();
                    groups[group].free_blocks_count -= 1;
                }
                {
                    let mut sb = self.sb.write();
                    sb.free_blocks_count -= 1;
                }
                self.write_group(group)?;
                self.write_superblock()?;

                let block = sb_snapshot.first_data_block
                    + (group as u32 * sb_snapshot.blocks_per_group)
                    + bit as u32;
                let zeros = alloc::vec![0u8; self.block_size];
                self.write_block(block, &zeros)?;
                return Ok(block);
            }
        }
        Err(KernelError::FsError(FsError::NoSpace))
    }

    fn free_block(&self, block: u32) -> KernelResult<()> {
        let sb_snapshot = *self.sb.read();
        let rel = block - sb_snapshot.first_data_block;
        let group = (rel / sb_snapshot.blocks_per_group) as usize;
        let bit = (rel % sb_snapshot.blocks_per_group) as usize;
        let bitmap_block = self.groups.read()[group].block_bitmap;
        let mut bitmap = self.read_block(bitmap_block)?;
        if !test_bit(&bitmap, bit) {
            return Err(KernelError::FsError(FsError::Corrupted));
        }
        clear_bit(&mut bitmap, bit);
        self.write_block(bitmap_block, &bitmap)?;
        self.groups.write()[group].free_blocks_count += 1;
        self.sb.write().free_blocks_count += 1;
        self.write_group(group)?;
        self.write_superblock()
    }

    fn blocks_in_group(&self, sb: &Superblock, group: usize) -> usize {
        let start = sb.first_data_block + group as u32 * sb.blocks_per_group;
        let end = (start + sb.blocks_per_group).min(sb.blocks_count);
        (end - start) as usize
    }

    fn alloc_inode(&self, directory: bool) -> KernelResult<u32> {
        let sb_snapshot = *self.sb.read();
        for group in 0..sb_snapshot.group_count() {
            if self.groups.read()[group].free_inodes_count == 0 {
                continue;
            }
            let bitmap_block = self.groups.read()[group].inode_bitmap;
            let mut bitmap = self.read_block(bitmap_block)?;
            let in_group = sb_snapshot.inodes_per_group as usize;
            if let Some(bit) = find_clear_bit(&bitmap, in_group) {
                let ino = group as u32 * sb_snapshot.inodes_per_group + bit as u32 + 1;
                if ino < FIRST_FREE_INODE {
                    // Reserved range should already be marked; refuse to
                    // hand it out.
                    return Err(KernelError::FsError(FsError::Corrupted));
                }
                set_bit(&mut bitmap, bit);
                self.write_block(bitmap_block, &bitmap)?;
                {
                    let mut groups = self.groups.write();
                    groups[group].free_inodes_count -= 1;
                    if directory {
                        groups[group].used_dirs_count += 1;
                    }
                }
                self.sb.write().free_inodes_count -= 1;
                self.write_group(group)?;
                self.write_superblock()?;
                return Ok(ino);
            }
        }
        Err(KernelError::FsError(FsError::NoSpace))
    }

    fn free_inode(&self, ino: u32, directory: bool) -> KernelResult<()> {
        let sb_snapshot = *self.sb.read();
        let group = ((ino - 1) / sb_snapshot.inodes_per_group) as usize;
        let bit = ((ino - 1) % sb_snapshot.inodes_per_group) as usize;
        let bitmap_block = self.groups.read()[group].inode_bitmap;
        let mut bitmap = self.read_block(bitmap_block)?;
        clear_bit(&mut bitmap, bit);
        self.write_block(bitmap_block, &bitmap)?;
        {
            let mut groups = self.groups.write();
            groups[group].free_inodes_count += 1;
            if directory {
                groups[group].used_dirs_count = groups[group].used_dirs_count.saturating_sub(1);
            }
        }
        self.sb.write().free_inodes_count += 1;
        self.write_group(group)?;
        self.write_superblock()
    }

    // -- block mapping ---------------------------------------------------

    /// Resolve file block `index` of `inode` to a disk block.
    ///
    /// With `allocate`, missing data and indirect blocks are created and
    /// the inode's sector count is bumped for each new block. The caller
    /// writes the inode back.
    fn map_block(&self, inode: &mut Inode, index: usize, allocate: bool) -> KernelResult<Option<u32>> {
        let ppb = self.ppb();
        let sectors_per_block = (self.block_size / 512) as u32;

        // Direct pointers.
        if index < DIRECT_BLOCKS {
            let mut block = inode.block[index];
            if block == 0 && allocate {
                block = self.alloc_block()?;
                inode.block[index] = block;
                inode.blocks += sectors_per_block;
            }
            return Ok(if block == 0 { None } else { Some(block) });
        }

        // One, two, or three levels of indirection.
        let mut index = index - DIRECT_BLOCKS;
        let (slot, levels) = if index < ppb {
            (IND_SLOT, 1)
        } else if index < ppb + ppb * ppb {
            index -= ppb;
            (DIND_SLOT, 2)
        } else if index - ppb - ppb * ppb < ppb * ppb * ppb {
            index -= ppb + ppb * ppb;
            (TIND_SLOT, 3)
        } else {
            return Err(KernelError::FsError(FsError::FileTooLarge));
        };

        let mut table = inode.block[slot];
        if table == 0 {
            if !allocate {
                return Ok(None);
            }
            table = self.alloc_block()?;
            inode.block[slot] = table;
            inode.blocks += sectors_per_block;
        }

        // Walk down the tree; at each level pick the slot covering `index`.
        let mut span = ppb.pow(levels as u32 - 1);
        for _ in 0..levels {
            let slot_index = index / span;
            index %= span;

            let mut table_data = self.read_block(table)?;
            let entry_off = slot_index * 4;
            let mut next =
                u32::from_le_bytes(table_data[entry_off..entry_off + 4].try_into().unwrap());
            let last_level = span == 1;
            if next == 0 {
                if !allocate {
                    return Ok(None);
                }
                next = self.alloc_block()?;
                inode.blocks += sectors_per_block;
                table_data[entry_off..entry_off + 4].copy_from_slice(&next.to_le_bytes());
                self.write_block(table, &table_data)?;
            }
            if last_level {
                return Ok(Some(next));
            }
            table = next;
            span /= ppb;
        }
        unreachable!("indirect walk always terminates at span == 1");
    }

    /// Free every data and indirect block of an inode (unlink/truncate-0).
    fn free_all_blocks(&self, inode: &mut Inode) -> KernelResult<()> {
        for slot in 0..DIRECT_BLOCKS {
            if inode.block[slot] != 0 {
                self.free_block(inode.block[slot])?;
                inode.block[slot] = 0;
            }
        }
        for (slot, depth) in [(IND_SLOT, 1), (DIND_SLOT, 2), (TIND_SLOT, 3)] {
            if inode.block[slot] != 0 {
                self.free_tree(inode.block[slot], depth)?;
                inode.block[slot] = 0;
            }
        }
        inode.blocks = 0;
        Ok(())
    }

    fn free_tree(&self, block: u32, depth: usize) -> KernelResult<()> {
        if depth > 1 {
            let data = self.read_block(block)?;
            for chunk in data.chunks_exact(4) {
                let child = u32::from_le_bytes(chunk.try_into().unwrap());
                if child != 0 {
                    self.free_tree(child, depth - 1)?;
                }
            }
        } else if depth == 1 {
            let data = self.read_block(block)?;
            for chunk in data.chunks_exact(4) {
                let child = u32::from_le_bytes(chunk.try_into().unwrap());
                if child != 0 {
                    self.free_block(child)?;
                }
            }
        }
        self.free_block(block)
    }

    // -- file data -------------------------------------------------------

    fn read_at(&self, ino: u32, offset: usize, buf: &mut [u8]) -> KernelResult<usize> {
        let mut inode = self.read_inode(ino)?;
        let size = inode.size as usize;
        if offset >= size {
            return Ok(0);
        }
        let total = buf.len().min(size - offset);
        let mut done = 0;
        while done < total {
            let pos = offset + done;
            let block_index = pos / self.block_size;
            let block_off = pos % self.block_size;
            let chunk = (self.block_size - block_off).min(total - done);
            match self.map_block(&mut inode, block_index, false)? {
                Some(block) => {
                    let data = self.read_block(block)?;
                    buf[done..done + chunk].copy_from_slice(&data[block_off..block_off + chunk]);
                }
                // Sparse hole: reads as zeros.
                None => buf[done..done + chunk].fill(0),
            }
            done += chunk;
        }
        Ok(total)
    }

    fn write_at(&self, ino: u32, offset: usize, data: &[u8]) -> KernelResult<usize> {
        let _guard = self.alloc_lock.lock();
        let mut inode = self.read_inode(ino)?;
        let mut done = 0;
        while done < data.len() {
            let pos = offset + done;
            let block_index = pos / self.block_size;
            let block_off = pos % self.block_size;
            let chunk = (self.block_size - block_off).min(data.len() - done);
            let block = self
                .map_block(&mut inode, block_index, true)?
                .ok_or(KernelError::FsError(FsError::IoError))?;
            if chunk == self.block_size {
                self.write_block(block, &data[done..done + chunk])?;
            } else {
                let mut existing = self.read_block(block)?;
                existing[block_off..block_off + chunk].copy_from_slice(&data[done..done + chunk]);
                self.write_block(block, &existing)?;
            }
            done += chunk;
        }
        let end = offset + data.len();
        if end > inode.size as usize {
            inode.size = end as u32;
        }
        inode.mtime = crate::timer::timestamp_secs() as u32;
        self.write_inode(ino, &inode)?;
        Ok(data.len())
    }

    fn truncate(&self, ino: u32, size: usize) -> KernelResult<()> {
        let _guard = self.alloc_lock.lock();
        let mut inode = self.read_inode(ino)?;
        let old_size = inode.size as usize;
        if size == 0 {
            self.free_all_blocks(&mut inode)?;
        } else if size < old_size {
            // Free whole data blocks past the new end; the indirect
            // skeleton is kept.
            let first_dead = size.div_ceil(self.block_size);
            let last = old_size.div_ceil(self.block_size);
            for index in first_dead..last {
                if let Some(block) = self.map_block(&mut inode, index, false)? {
                    self.free_block(block)?;
                    self.clear_mapping(&mut inode, index)?;
                    inode.blocks = inode
                        .blocks
                        .saturating_sub((self.block_size / 512) as u32);
                }
            }
        }
        inode.size = size as u32;
        inode.mtime = crate::timer::timestamp_secs() as u32;
        self.write_inode(ino, &inode)
    }

    /// Zero the pointer that maps file block `index` (after freeing it).
    fn clear_mapping(&self, inode: &mut Inode, index: usize) -> KernelResult<()> {
        let ppb = self.ppb();
        if index < DIRECT_BLOCKS {
            inode.block[index] = 0;
            return Ok(());
        }
        let mut index = index - DIRECT_BLOCKS;
        let (slot, levels) = if index < ppb {
            (IND_SLOT, 1)
        } else if index < ppb + ppb * ppb {
            index -= ppb;
            (DIND_SLOT, 2)
        } else {
            index -= ppb + ppb * ppb;
            (TIND_SLOT, 3)
        };
        let mut table = inode.block[slot];
        if table == 0 {
            return Ok(());
        }
        let mut span = ppb.pow(levels as u32 - 1);
        loop {
            let slot_index = index / span;
            index %= span;
            let mut data = self.read_block(table)?;
            let off = slot_index * 4;
            if span == 1 {
                data[off..off + 4].copy_from_slice(&0u32.to_le_bytes());
                return self.write_block(table, &data);
            }
            let next = u32::from_le_bytes(data[off..off + 4].try_into().unwrap());
            if next == 0 {
                return Ok(());
            }
            table = next;
            span /= ppb;
        }
    }

    // -- directories -----------------------------------------------------

    /// The `index`-th live record of a directory.
    fn dir_entry_at(&self, dir: u32, index: usize) -> KernelResult<Option<RawDirEntry>> {
        let mut inode = self.read_inode(dir)?;
        if !inode.is_dir() {
            return Err(KernelError::FsError(FsError::NotADirectory));
        }
        let blocks = (inode.size as usize).div_ceil(self.block_size);
        let mut seen = 0;
        for block_index in 0..blocks {
            let block = match self.map_block(&mut inode, block_index, false)? {
                Some(b) => b,
                None => continue,
            };
            let data = self.read_block(block)?;
            let mut off = 0;
            while let Some(entry) = parse_dirent(&data, off) {
                let rec_len = entry.rec_len as usize;
                if entry.inode != 0 {
                    if seen == index {
                        return Ok(Some(entry));
                    }
                    seen += 1;
                }
                off += rec_len;
            }
        }
        Ok(None)
    }

    fn find_entry(&self, dir: u32, name: &str) -> KernelResult<Option<u32>> {
        let mut index = 0;
        while let Some(entry) = self.dir_entry_at(dir, index)? {
            if entry.name == name {
                return Ok(Some(entry.inode));
            }
            index += 1;
        }
        Ok(None)
    }

    /// Insert a directory record, reusing slack in existing records or
    /// appending a fresh block.
    fn add_entry(&self, dir: u32, name: &str, ino: u32, file_type: u8) -> KernelResult<()> {
        let needed = dirent_size(name.len());
        let mut inode = self.read_inode(dir)?;
        let blocks = (inode.size as usize).div_ceil(self.block_size);

        for block_index in 0..blocks {
            let block = match self.map_block(&mut inode, block_index, false)? {
                Some(b) => b,
                None => continue,
            };
            let mut data = self.read_block(block)?;
            let mut off = 0;
            while let Some(entry) = parse_dirent(&data, off) {
                let rec_len = entry.rec_len as usize;
                if entry.inode == 0 && rec_len >= needed {
                    // Reuse a dead record wholesale.
                    encode_dirent(&mut data, off, ino, rec_len as u16, file_type, name);
                    return self.write_block(block, &data);
                }
                let used = dirent_size(entry.name.len());
                if entry.inode != 0 && rec_len >= used + needed {
                    // Split the slack off the record.
                    encode_dirent(
                        &mut data,
                        off,
                        entry.inode,
                        used as u16,
                        entry.file_type,
                        &entry.name,
                    );
                    encode_dirent(
                        &mut data,
                        off + used,
                        ino,
                        (rec_len - used) as u16,
                        file_type,
                        name,
                    );
                    return self.write_block(block, &data);
                }
                off += rec_len;
            }
        }

        // No room anywhere: append a block holding a single record.
        let block = self
            .map_block(&mut inode, blocks, true)?
            .ok_or(KernelError::FsError(FsError::IoError))?;
        let mut data = alloc::vec![0u8; self.block_size];
        encode_dirent(&mut data, 0, ino, self.block_size as u16, file_type, name);
        self.write_block(block, &data)?;
        inode.size += self.block_size as u32;
        self.write_inode(dir, &inode)
    }

    /// Delete a record by folding its length into the preceding record
    /// (or zeroing the inode for the first record of a block).
    fn remove_entry(&self, dir: u32, name: &str) -> KernelResult<()> {
        let mut inode = self.read_inode(dir)?;
        let blocks = (inode.size as usize).div_ceil(self.block_size);
        for block_index in 0..blocks {
            let block = match self.map_block(&mut inode, block_index, false)? {
                Some(b) => b,
                None => continue,
            };
            let mut data = self.read_block(block)?;
            let mut prev: Option<RawDirEntry> = None;
            let mut off = 0;
            while let Some(entry) = parse_dirent(&data, off) {
                let rec_len = entry.rec_len as usize;
                if entry.inode != 0 && entry.name == name {
                    match prev {
                        Some(p) => {
                            let merged = p.rec_len as usize + rec_len;
                            encode_dirent(
                                &mut data,
                                p.offset,
                                p.inode,
                                merged as u16,
                                p.file_type,
                                &p.name,
                            );
                        }
                        None => {
                            data[off..off + 4].copy_from_slice(&0u32.to_le_bytes());
                        }
                    }
                    return self.write_block(block, &data);
                }
                prev = Some(entry);
                off += rec_len;
            }
        }
        Err(KernelError::FsError(FsError::NotFound))
    }

    fn dir_is_empty(&self, dir: u32) -> KernelResult<bool> {
        let mut index = 0;
        while let Some(entry) = self.dir_entry_at(dir, index)? {
            if entry.name != "." && entry.name != ".." {
                return Ok(false);
            }
            index += 1;
        }
        Ok(true)
    }
}

// -- bitmap helpers ---------------------------------------------------------

fn find_clear_bit(bitmap: &[u8], limit: usize) -> Option<usize> {
    for bit in 0..limit {
        if bitmap[bit / 8] & (1 << (bit % 8)) == 0 {
            return Some(bit);
        }
    }
    None
}

fn test_bit(bitmap: &[u8], bit: usize) -> bool {
    bitmap[bit / 8] & (1 << (bit % 8)) != 0
}

fn set_bit(bitmap: &mut [u8], bit: usize) {
    bitmap[bit / 8] |= 1 << (bit % 8);
}

fn clear_bit(bitmap: &mut [u8], bit: usize) {
    bitmap[bit / 8] &= !(1 << (bit % 8));
}

// -- VFS node ---------------------------------------------------------------

struct Ext2Node {
    fs: Arc<Ext2Inner>,
    ino: u32,
}

impl Ext2Node {
    fn inode(&self) -> KernelResult<Inode> {
        self.fs.read_inode(self.ino)
    }
}

impl VfsNode for Ext2Node {
    fn node_type(&self) -> NodeType {
        self.inode().map(|i| i.node_type()).unwrap_or(NodeType::File)
    }

    fn metadata(&self) -> KernelResult<Metadata> {
        let inode = self.inode()?;
        Ok(Metadata {
            node_type: inode.node_type(),
            size: inode.size as usize,
            permissions: Permissions::new(inode.mode & 0o777),
            uid: inode.uid as u32,
            gid: inode.gid as u32,
            inode: self.ino as u64,
            created: inode.ctime as u64,
            modified: inode.mtime as u64,
            accessed: inode.atime as u64,
        })
    }

    fn read(&self, offset: usize, buffer: &mut [u8]) -> KernelResult<usize> {
        let inode = self.inode()?;
        if inode.is_dir() {
            return Err(KernelError::FsError(FsError::IsADirectory));
        }
        self.fs.read_at(self.ino, offset, buffer)
    }

    fn write(&self, offset: usize, data: &[u8]) -> KernelResult<usize> {
        let inode = self.inode()?;
        if !inode.is_file() {
            return Err(KernelError::FsError(FsError::NotAFile));
        }
        self.fs.write_at(self.ino, offset, data)
    }

    fn truncate(&self, size: usize) -> KernelResult<()> {
        let inode = self.inode()?;
        if !inode.is_file() {
            return Err(KernelError::FsError(FsError::NotAFile));
        }
        self.fs.truncate(self.ino, size)
    }

    fn readdir(&self, index: usize) -> KernelResult<Option<DirEntry>> {
        Ok(self.fs.dir_entry_at(self.ino, index)?.map(|entry| DirEntry {
            node_type: node_type_for_code(entry.file_type),
            inode: entry.inode as u64,
            name: entry.name,
        }))
    }

    fn lookup(&self, name: &str) -> KernelResult<Arc<dyn VfsNode>> {
        let ino = self
            .fs
            .find_entry(self.ino, name)?
            .ok_or(KernelError::FsError(FsError::NotFound))?;
        Ok(Arc::new(Ext2Node {
            fs: self.fs.clone(),
            ino,
        }))
    }

    fn create(
        &self,
        name: &str,
        permissions: Permissions,
        uid: u32,
        gid: u32,
    ) -> KernelResult<Arc<dyn VfsNode>> {
        let _guard = self.fs.alloc_lock.lock();
        if self.fs.find_entry(self.ino, name)?.is_some() {
            return Err(KernelError::FsError(FsError::AlreadyExists));
        }
        let now = crate::timer::timestamp_secs() as u32;
        let ino = self.fs.alloc_inode(false)?;
        let inode = Inode::new(S_IFREG | permissions.bits(), uid as u16, gid as u16, now);
        self.fs.write_inode(ino, &inode)?;
        self.fs
            .add_entry(self.ino, name, ino, file_type_code(NodeType::File))?;
        Ok(Arc::new(Ext2Node {
            fs: self.fs.clone(),
            ino,
        }))
    }

    fn mkdir(
        &self,
        name: &str,
        permissions: Permissions,
        uid: u32,
        gid: u32,
    ) -> KernelResult<Arc<dyn VfsNode>> {
        let _guard = self.fs.alloc_lock.lock();
        if self.fs.find_entry(self.ino, name)?.is_some() {
            return Err(KernelError::FsError(FsError::AlreadyExists));
        }
        let now = crate::timer::timestamp_secs() as u32;
        let ino = self.fs.alloc_inode(true)?;
        let mut inode = Inode::new(S_IFDIR | permissions.bits(), uid as u16, gid as u16, now);
        // "." and the parent's entry.
        inode.links_count = 2;
        self.fs.write_inode(ino, &inode)?;

        // Seed the first block with "." and "..".
        let mut inode = self.fs.read_inode(ino)?;
        let block = self
            .fs
            .map_block(&mut inode, 0, true)?
            .ok_or(KernelError::FsError(FsError::IoError))?;
        let bs = self.fs.block_size;
        let mut data = alloc::vec![0u8; bs];
        let dot_len = dirent_size(1);
        encode_dirent(&mut data, 0, ino, dot_len as u16, disk::FT_DIR, ".");
        encode_dirent(
            &mut data,
            dot_len,
            self.ino,
            (bs - dot_len) as u16,
            disk::FT_DIR,
            "..",
        );
        self.fs.write_block(block, &data)?;
        inode.size = bs as u32;
        self.fs.write_inode(ino, &inode)?;

        self.fs
            .add_entry(self.ino, name, ino, file_type_code(NodeType::Directory))?;

        // ".." links back to us.
        let mut parent = self.fs.read_inode(self.ino)?;
        parent.links_count += 1;
        self.fs.write_inode(self.ino, &parent)?;

        Ok(Arc::new(Ext2Node {
            fs: self.fs.clone(),
            ino,
        }))
    }

    fn unlink(&self, name: &str) -> KernelResult<()> {
        if name == "." || name == ".." {
            return Err(KernelError::FsError(FsError::InvalidPath));
        }
        let _guard = self.fs.alloc_lock.lock();
        let ino = self
            .fs
            .find_entry(self.ino, name)?
            .ok_or(KernelError::FsError(FsError::NotFound))?;
        let mut inode = self.fs.read_inode(ino)?;

        if inode.is_dir() {
            if !self.fs.dir_is_empty(ino)? {
                return Err(KernelError::FsError(FsError::DirectoryNotEmpty));
            }
            self.fs.remove_entry(self.ino, name)?;
            // The child's ".." no longer references us.
            let mut parent = self.fs.read_inode(self.ino)?;
            parent.links_count = parent.links_count.saturating_sub(1);
            self.fs.write_inode(self.ino, &parent)?;
            self.fs.free_all_blocks(&mut inode)?;
            inode.links_count = 0;
            inode.dtime = crate::timer::timestamp_secs() as u32;
            self.fs.write_inode(ino, &inode)?;
            return self.fs.free_inode(ino, true);
        }

        self.fs.remove_entry(self.ino, name)?;
        inode.links_count = inode.links_count.saturating_sub(1);
        if inode.links_count == 0 {
            self.fs.free_all_blocks(&mut inode)?;
            inode.dtime = crate::timer::timestamp_secs() as u32;
            self.fs.write_inode(ino, &inode)?;
            self.fs.free_inode(ino, false)
        } else {
            self.fs.write_inode(ino, &inode)
        }
    }

    fn chmod(&self, permissions: Permissions) -> KernelResult<()> {
        let mut inode = self.inode()?;
        inode.mode = (inode.mode & S_IFMT) | permissions.bits();
        inode.ctime = crate::timer::timestamp_secs() as u32;
        self.fs.write_inode(self.ino, &inode)
    }

    fn chown(&self, uid: u32, gid: u32) -> KernelResult<()> {
        let mut inode = self.inode()?;
        inode.uid = uid as u16;
        inode.gid = gid as u16;
        inode.ctime = crate::timer::timestamp_secs() as u32;
        self.fs.write_inode(self.ino, &inode)
    }
}

impl Filesystem for Ext2Fs {
    fn root(&self) -> Arc<dyn VfsNode> {
        self.node(ROOT_INODE)
    }

    fn name(&self) -> &str {
        "ext2"
    }

    fn is_readonly(&self) -> bool {
        false
    }

    fn sync(&self) -> KernelResult<()> {
        self.inner.dev.flush()
    }

    fn statfs(&self) -> KernelResult<FsStats> {
        let sb = self.inner.sb.read();
        let bs = sb.block_size() as u64;
        Ok(FsStats {
            total_bytes: sb.blocks_count as u64 * bs,
            free_bytes: sb.free_blocks_count as u64 * bs,
            total_inodes: sb.inodes_count as u64,
            free_inodes: sb.free_inodes_count as u64,
            block_size: bs as u32,
            volume_label: String::from(sb.label()),
            clean: sb.state == STATE_CLEAN,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::blockdev::RamDisk;

    fn fresh_fs(blocks: u64) -> Ext2Fs {
        let dev = Arc::new(RamDisk::new("ram0", 1024, blocks));
        mkfs(&*dev, "testvol").unwrap();
        Ext2Fs::mount(dev).unwrap()
    }

    #[test]
    fn mount_validates_magic() {
        let dev = Arc::new(RamDisk::new("ram0", 1024, 64));
        assert!(Ext2Fs::mount(dev).is_err());
    }

    #[test]
    fn statfs_reflects_the_superblock() {
        let fs = fresh_fs(1024);
        let stats = fs.statfs().unwrap();
        assert_eq!(stats.block_size, 1024);
        assert_eq!(stats.volume_label, "testvol");
        assert!(stats.clean);
        assert!(stats.free_bytes < stats.total_bytes);
    }

    #[test]
    fn create_write_read_round_trip() {
        let fs = fresh_fs(1024);
        let root = fs.root();
        let file = root.create("a", Permissions::default_file(), 0, 0).unwrap();
        assert_eq!(file.write(0, b"xyz").unwrap(), 3);

        let again = root.lookup("a").unwrap();
        let mut buf = [0u8; 3];
        assert_eq!(again.read(0, &mut buf).unwrap(), 3);
        assert_eq!(&buf, b"xyz");

        // readdir enumerates ".", "..", then "a" with its size visible in
        // the metadata.
        let mut names = alloc::vec::Vec::new();
        let mut i = 0;
        while let Some(e) = root.readdir(i).unwrap() {
            names.push(e.name);
            i += 1;
        }
        assert_eq!(names, [".", "..", "a"]);
        assert_eq!(again.metadata().unwrap().size, 3);
    }

    #[test]
    fn data_survives_remount() {
        let dev = Arc::new(RamDisk::new("ram0", 1024, 1024));
        mkfs(&*dev, "persist").unwrap();
        {
            let fs = Ext2Fs::mount(dev.clone()).unwrap();
            let f = fs
                .root()
                .create("keep", Permissions::default_file(), 0, 0)
                .unwrap();
            f.write(0, b"durable bytes").unwrap();
        }
        let fs = Ext2Fs::mount(dev).unwrap();
        let f = fs.root().lookup("keep").unwrap();
        let mut buf = [0u8; 13];
        assert_eq!(f.read(0, &mut buf).unwrap(), 13);
        assert_eq!(&buf, b"durable bytes");
    }

    #[test]
    fn large_file_uses_indirect_blocks() {
        let fs = fresh_fs(2048);
        let f = fs
            .root()
            .create("big", Permissions::default_file(), 0, 0)
            .unwrap();
        // 40 KiB spans the 12 direct blocks (12 KiB) well into the single
        // indirect range.
        let mut pattern = alloc::vec![0u8; 40 * 1024];
        for (i, b) in pattern.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        assert_eq!(f.write(0, &pattern).unwrap(), pattern.len());

        let mut back = alloc::vec![0u8; pattern.len()];
        assert_eq!(f.read(0, &mut back).unwrap(), pattern.len());
        assert_eq!(back, pattern);
    }

    #[test]
    fn double_indirect_range_works() {
        let fs = fresh_fs(2048);
        let f = fs
            .root()
            .create("huge", Permissions::default_file(), 0, 0)
            .unwrap();
        // Block 12 + 256 = 268 is the first doubly-indirect block for
        // 1 KiB blocks; write one block there.
        let offset = (12 + 256) * 1024;
        f.write(offset, b"deep").unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(f.read(offset, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"deep");
        // The hole before it reads as zeros.
        let mut hole = [1u8; 16];
        assert_eq!(f.read(4096, &mut hole).unwrap(), 16);
        assert_eq!(hole, [0u8; 16]);
    }

    #[test]
    fn unlink_frees_inode_and_blocks() {
        let fs = fresh_fs(1024);
        let root = fs.root();
        let before = fs.statfs().unwrap();

        let f = root.create("tmp", Permissions::default_file(), 0, 0).unwrap();
        f.write(0, &alloc::vec![9u8; 5000]).unwrap();
        let during = fs.statfs().unwrap();
        assert!(during.free_bytes < before.free_bytes);
        assert_eq!(during.free_inodes, before.free_inodes - 1);
        drop(f);

        root.unlink("tmp").unwrap();
        let after = fs.statfs().unwrap();
        assert_eq!(after.free_bytes, before.free_bytes);
        assert_eq!(after.free_inodes, before.free_inodes);
        assert!(root.lookup("tmp").is_err());
    }

    #[test]
    fn mkdir_maintains_link_counts() {
        let fs = fresh_fs(1024);
        let root = fs.root();
        let root_links_before = fs.inner.read_inode(ROOT_INODE).unwrap().links_count;

        let d = root.mkdir("sub", Permissions::default_dir(), 0, 0).unwrap();
        let d_meta = d.metadata().unwrap();
        let d_inode = fs.inner.read_inode(d_meta.inode as u32).unwrap();
        assert_eq!(d_inode.links_count, 2); // "." + parent entry
        assert_eq!(
            fs.inner.read_inode(ROOT_INODE).unwrap().links_count,
            root_links_before + 1 // our ".."
        );

        // The new directory lists "." and ".." pointing at the right
        // inodes.
        let dot = d.readdir(0).unwrap().unwrap();
        let dotdot = d.readdir(1).unwrap().unwrap();
        assert_eq!(dot.name, ".");
        assert_eq!(dot.inode, d_meta.inode);
        assert_eq!(dotdot.name, "..");
        assert_eq!(dotdot.inode, ROOT_INODE as u64);

        root.unlink("sub").unwrap();
        assert_eq!(
            fs.inner.read_inode(ROOT_INODE).unwrap().links_count,
            root_links_before
        );
    }

    #[test]
    fn dirent_slot_reuse_after_delete() {
        let fs = fresh_fs(1024);
        let root = fs.root();
        for name in ["a", "b", "c"] {
            root.create(name, Permissions::default_file(), 0, 0).unwrap();
        }
        root.unlink("b").unwrap();
        // The freed slack is merged into "a"'s record; creating a new
        // entry reuses it rather than growing the directory.
        let size_before = root.metadata().unwrap().size;
        root.create("d", Permissions::default_file(), 0, 0).unwrap();
        assert_eq!(root.metadata().unwrap().size, size_before);

        let mut names = alloc::vec::Vec::new();
        let mut i = 0;
        while let Some(e) = root.readdir(i).unwrap() {
            names.push(e.name);
            i += 1;
        }
        assert!(names.contains(&String::from("a")));
        assert!(names.contains(&String::from("d")));
        assert!(!names.contains(&String::from("b")));
    }

    #[test]
    fn truncate_releases_blocks() {
        let fs = fresh_fs(1024);
        let root = fs.root();
        let f = root.create("t", Permissions::default_file(), 0, 0).unwrap();
        f.write(0, &alloc::vec![1u8; 8192]).unwrap();
        let mid = fs.statfs().unwrap();
        f.truncate(0).unwrap();
        let after = fs.statfs().unwrap();
        assert!(after.free_bytes > mid.free_bytes);
        assert_eq!(f.metadata().unwrap().size, 0);
    }

    #[test]
    fn chmod_chown_persist() {
        let fs = fresh_fs(1024);
        let f = fs
            .root()
            .create("m", Permissions::default_file(), 0, 0)
            .unwrap();
        f.chmod(Permissions::new(0o600)).unwrap();
        f.chown(7, 8).unwrap();
        let meta = fs.root().lookup("m").unwrap().metadata().unwrap();
        assert_eq!(meta.permissions.bits(), 0o600);
        assert_eq!(meta.uid, 7);
        assert_eq!(meta.gid, 8);
    }
}
