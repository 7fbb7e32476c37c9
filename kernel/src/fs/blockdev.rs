//! Block device abstraction.
//!
//! The ext2 driver talks to storage only through this trait; the ATA
//! driver implements it out of tree, and a RAM-backed disk implements it
//! for tests and ramdisks.

use alloc::string::String;
use alloc::vec::Vec;

use crate::error::{FsError, KernelError, KernelResult};

/// Sector-addressed storage.
pub trait BlockDevice: Send + Sync {
    fn name(&self) -> &str;

    /// Device block size in bytes.
    fn block_size(&self) -> usize;

    /// Total number of blocks.
    fn block_count(&self) -> u64;

    /// Fill `buffer` (a whole number of blocks) starting at `start_block`.
    fn read_blocks(&self, start_block: u64, buffer: &mut [u8]) -> KernelResult<()>;

    /// Write `buffer` (a whole number of blocks) starting at `start_block`.
    fn write_blocks(&self, start_block: u64, buffer: &[u8]) -> KernelResult<()>;

    /// Flush device caches; default no-op.
    fn flush(&self) -> KernelResult<()> {
        Ok(())
    }
}

/// Memory-backed block device.
pub struct RamDisk {
    name: String,
    block_size: usize,
    data: spin::RwLock<Vec<u8>>,
}

impl RamDisk {
    pub fn new(name: &str, block_size: usize, block_count: u64) -> Self {
        Self {
            name: String::from(name),
            block_size,
            data: spin::RwLock::new(alloc::vec![0u8; block_size * block_count as usize]),
        }
    }

    pub fn size(&self) -> usize {
        self.data.read().len()
    }
}

impl BlockDevice for RamDisk {
    fn name(&self) -> &str {
        &self.name
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        (self.data.read().len() / self.block_size) as u64
    }

    fn read_blocks(&self, start_block: u64, buffer: &mut [u8]) -> KernelResult<()> {
        let start = start_block as usize * self.block_size;
        let end = start
            .checked_add(buffer.len())
            .ok_or(KernelError::FsError(FsError::IoError))?;
        let data = self.data.read();
        if end > data.len() {
            return Err(KernelError::FsError(FsError::IoError));
        }
        buffer.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_blocks(&self, start_block: u64, buffer: &[u8]) -> KernelResult<()> {
        let start = start_block as usize * self.block_size;
        let end = start
            .checked_add(buffer.len())
            .ok_or(KernelError::FsError(FsError::IoError))?;
        let mut data = self.data.write();
        if end > data.len() {
            return Err(KernelError::FsError(FsError::IoError));
        }
        data[start..end].copy_from_slice(buffer);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ram_disk_round_trip() {
        let dev = RamDisk::new("ram0", 512, 100);
        assert_eq!(dev.block_size(), 512);
        assert_eq!(dev.block_count(), 100);

        let data = [0x42u8; 512];
        dev.write_blocks(3, &data).unwrap();
        let mut out = [0u8; 512];
        dev.read_blocks(3, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn out_of_range_is_an_io_error() {
        let dev = RamDisk::new("ram0", 512, 4);
        let mut buf = [0u8; 512];
        assert!(dev.read_blocks(4, &mut buf).is_err());
        assert!(dev.write_blocks(4, &buf).is_err());
    }
}
