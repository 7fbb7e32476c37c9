//! mkfs: initialize a fresh single-group ext2 volume.
//!
//! Used by the installer tooling and the driver tests. Lays out the
//! classic small-volume geometry with 1 KiB blocks:
//!
//! ```text
//! block 0              boot block (untouched)
//! block 1              superblock
//! block 2              group descriptor table
//! block 3              block bitmap
//! block 4              inode bitmap
//! block 5..5+N         inode table
//! block 5+N            root directory data
//! remainder            data blocks
//! ```

use super::disk::{
    dirent_size, encode_dirent, write_struct, GroupDesc, Inode, Superblock, EXT2_MAGIC, FT_DIR,
    INODE_SIZE, ROOT_INODE, S_IFDIR, STATE_CLEAN,
};
use super::{write_bytes, set_bit};
use crate::error::{FsError, KernelError, KernelResult};
use crate::fs::blockdev::BlockDevice;

const BLOCK_SIZE: usize = 1024;
const BLOCKS_PER_GROUP: u32 = 8192;

/// Format `dev` as an empty ext2 volume with the given label.
///
/// Single block group, 1 KiB blocks; volumes larger than one group are
/// truncated to the group's span.
pub fn mkfs(dev: &dyn BlockDevice, label: &str) -> KernelResult<()> {
    let dev_bytes = dev.block_size() as u64 * dev.block_count();
    if BLOCK_SIZE % dev.block_size() != 0 || dev_bytes < 64 * 1024 {
        return Err(KernelError::FsError(FsError::NotSupported));
    }

    let blocks_count = ((dev_bytes / BLOCK_SIZE as u64) as u32).min(1 + BLOCKS_PER_GROUP);
    let inodes_count = (blocks_count / 4).clamp(16, 8192);
    let itable_blocks = (inodes_count as usize * INODE_SIZE).div_ceil(BLOCK_SIZE) as u32;

    let block_bitmap_block = 3u32;
    let inode_bitmap_block = 4u32;
    let itable_block = 5u32;
    let root_block = itable_block + itable_blocks;
    if root_block + 1 >= blocks_count {
        return Err(KernelError::FsError(FsError::NoSpace));
    }

    let now = crate::timer::timestamp_secs() as u32;

    // Block bitmap: bit b covers block 1 + b. Metadata and the root
    // directory block are in use; bits past the volume end are forced on.
    let mut block_bitmap = alloc::vec![0u8; BLOCK_SIZE];
    for block in 1..=root_block {
        set_bit(&mut block_bitmap, (block - 1) as usize);
    }
    for bit in (blocks_count - 1) as usize..BLOCK_SIZE * 8 {
        set_bit(&mut block_bitmap, bit);
    }
    let free_blocks = blocks_count - 1 - root_block;

    // Inode bitmap: inodes 1-10 are reserved, bit i covers inode i + 1.
    let mut inode_bitmap = alloc::vec![0u8; BLOCK_SIZE];
    for bit in 0..10 {
        set_bit(&mut inode_bitmap, bit);
    }
    for bit in inodes_count as usize..BLOCK_SIZE * 8 {
        set_bit(&mut inode_bitmap, bit);
    }
    let free_inodes = inodes_count - 10;

    let mut volume_name = [0u8; 16];
    for (slot, byte) in volume_name.iter_mut().zip(label.bytes()) {
        *slot = byte;
    }

    let sb = Superblock {
        inodes_count,
        blocks_count,
        r_blocks_count: 0,
        free_blocks_count: free_blocks,
        free_inodes_count: free_inodes,
        first_data_block: 1,
        log_block_size: 0, // 1024 << 0
        log_frag_size: 0,
        blocks_per_group: BLOCKS_PER_GROUP,
        frags_per_group: BLOCKS_PER_GROUP,
        inodes_per_group: inodes_count,
        mtime: 0,
        wtime: now,
        mnt_count: 0,
        max_mnt_count: u16::MAX,
        magic: EXT2_MAGIC,
        state: STATE_CLEAN,
        errors: 1, // continue on errors
        minor_rev_level: 0,
        lastcheck: now,
        checkinterval: 0,
        creator_os: 0,
        rev_level: 1,
        def_resuid: 0,
        def_resgid: 0,
        first_ino: 11,
        inode_size: INODE_SIZE as u16,
        block_group_nr: 0,
        feature_compat: 0,
        feature_incompat: 0,
        feature_ro_compat: 0,
        uuid: [0; 16],
        volume_name,
    };

    let group = GroupDesc {
        block_bitmap: block_bitmap_block,
        inode_bitmap: inode_bitmap_block,
        inode_table: itable_block,
        free_blocks_count: free_blocks as u16,
        free_inodes_count: free_inodes as u16,
        used_dirs_count: 1, // the root
        pad: 0,
        reserved: [0; 12],
    };

    // Root inode: a directory holding one data block with "." and "..".
    let mut root = Inode::new(S_IFDIR | 0o755, 0, 0, now);
    root.links_count = 2;
    root.size = BLOCK_SIZE as u32;
    root.blocks = (BLOCK_SIZE / 512) as u32;
    root.block[0] = root_block;

    let mut root_data = alloc::vec![0u8; BLOCK_SIZE];
    let dot_len = dirent_size(1);
    encode_dirent(&mut root_data, 0, ROOT_INODE, dot_len as u16, FT_DIR, ".");
    encode_dirent(
        &mut root_data,
        dot_len,
        ROOT_INODE,
        (BLOCK_SIZE - dot_len) as u16,
        FT_DIR,
        "..",
    );

    // Zero the metadata area, then lay everything down.
    let zero_block = alloc::vec![0u8; BLOCK_SIZE];
    for block in 1..=root_block {
        write_bytes(dev, block as u64 * BLOCK_SIZE as u64, &zero_block)?;
    }

    let mut sb_bytes = alloc::vec![0u8; core::mem::size_of::<Superblock>()];
    write_struct(&mut sb_bytes, &sb);
    write_bytes(dev, 1024, &sb_bytes)?;

    let mut group_bytes = [0u8; core::mem::size_of::<GroupDesc>()];
    write_struct(&mut group_bytes, &group);
    write_bytes(dev, 2 * BLOCK_SIZE as u64, &group_bytes)?;

    write_bytes(
        dev,
        block_bitmap_block as u64 * BLOCK_SIZE as u64,
        &block_bitmap,
    )?;
    write_bytes(
        dev,
        inode_bitmap_block as u64 * BLOCK_SIZE as u64,
        &inode_bitmap,
    )?;

    let root_inode_offset =
        itable_block as u64 * BLOCK_SIZE as u64 + (ROOT_INODE - 1) as u64 * INODE_SIZE as u64;
    let mut inode_bytes = [0u8; INODE_SIZE];
    write_struct(&mut inode_bytes, &root);
    write_bytes(dev, root_inode_offset, &inode_bytes)?;

    write_bytes(dev, root_block as u64 * BLOCK_SIZE as u64, &root_data)?;

    log::info!(
        "mkfs: '{}' {} blocks, {} inodes, root at block {}",
        label,
        blocks_count,
        inodes_count,
        root_block
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;

    use super::super::Ext2Fs;
    use super::*;
    use crate::fs::blockdev::RamDisk;

    #[test]
    fn formatted_volume_mounts_clean() {
        let dev = Arc::new(RamDisk::new("ram0", 1024, 512));
        mkfs(&*dev, "boot").unwrap();
        let fs = Ext2Fs::mount(dev).unwrap();
        let stats = crate::fs::Filesystem::statfs(&fs).unwrap();
        assert!(stats.clean);
        assert_eq!(stats.volume_label, "boot");
        assert_eq!(stats.free_inodes, stats.total_inodes - 10);
    }

    #[test]
    fn tiny_devices_are_rejected() {
        let dev = RamDisk::new("ram0", 512, 16); // 8 KiB
        assert!(mkfs(&dev, "x").is_err());
    }

    #[test]
    fn fresh_root_lists_dot_and_dotdot_only() {
        let dev = Arc::new(RamDisk::new("ram0", 1024, 256));
        mkfs(&*dev, "r").unwrap();
        let fs = Ext2Fs::mount(dev).unwrap();
        let root = crate::fs::Filesystem::root(&fs);
        let a = root.readdir(0).unwrap().unwrap();
        let b = root.readdir(1).unwrap().unwrap();
        assert_eq!((a.name.as_str(), b.name.as_str()), (".", ".."));
        assert!(root.readdir(2).unwrap().is_none());
    }
}
