//! RAM-backed storage device.
//!
//! The source's test harness (`stub_device` in `tests2/testsuite_1.c`) is a
//! fixed-size in-memory byte array wired up as a `storage_intf`; the
//! original kernel also attaches one as a real backing store, not only as a
//! test fixture. This is that device: a plain `Vec<u8>` behind a lock,
//! satisfying [`crate::storage::StorageDevice`] the same way the VirtIO
//! driver does, so the cache and KTFS reader can run over it unchanged.

use std::sync::Mutex;

use log::{debug, trace};

use crate::error::{KernelError, Result};
use crate::storage::StorageDevice;

/// An in-memory block device of fixed capacity, block-aligned like any
/// other [`StorageDevice`].
pub struct RamDisk {
    block_size: usize,
    data: Mutex<Vec<u8>>,
}

impl RamDisk {
    /// Allocates `block_count` blocks of `block_size` bytes, zeroed.
    pub fn new(block_size: usize, block_count: usize) -> Self {
        let capacity = block_size * block_count;
        debug!(target: "ramdisk", "created {capacity}-byte ram disk ({block_count} blocks of {block_size})");
        RamDisk {
            block_size,
            data: Mutex::new(vec![0u8; capacity]),
        }
    }

    /// Builds a disk pre-populated from an existing image, one block per
    /// `block_size`-sized chunk of `image`.
    pub fn from_image(block_size: usize, image: Vec<u8>) -> Result<Self> {
        if image.len() % block_size != 0 {
            return Err(KernelError::Inval);
        }
        Ok(RamDisk {
            block_size,
            data: Mutex::new(image),
        })
    }
}

impl StorageDevice for RamDisk {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn capacity(&self) -> u64 {
        self.data.lock().unwrap().len() as u64
    }

    fn fetch(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        if pos % self.block_size as u64 != 0 || buf.len() % self.block_size != 0 {
            return Err(KernelError::Inval);
        }
        let data = self.data.lock().unwrap();
        let start = pos as usize;
        let end = start + buf.len();
        if end > data.len() {
            return Err(KernelError::Inval);
        }
        buf.copy_from_slice(&data[start..end]);
        trace!(target: "ramdisk", "fetch {} bytes at {pos}", buf.len());
        Ok(buf.len())
    }

    fn store(&self, pos: u64, buf: &[u8]) -> Result<usize> {
        if pos % self.block_size as u64 != 0 || buf.len() % self.block_size != 0 {
            return Err(KernelError::Inval);
        }
        let mut data = self.data.lock().unwrap();
        let start = pos as usize;
        let end = start + buf.len();
        if end > data.len() {
            return Err(KernelError::Inval);
        }
        data[start..end].copy_from_slice(buf);
        trace!(target: "ramdisk", "store {} bytes at {pos}", buf.len());
        Ok(buf.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init() {
        let _ = env_logger::try_init();
    }

    #[test]
    fn new_disk_is_zeroed_and_sized() {
        init();
        let disk = RamDisk::new(512, 4);
        assert_eq!(disk.block_size(), 512);
        assert_eq!(disk.capacity(), 2048);

        let mut buf = [0xFFu8; 512];
        assert_eq!(disk.fetch(0, &mut buf).unwrap(), 512);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn store_then_fetch_round_trips() {
        init();
        let disk = RamDisk::new(512, 4);
        let written = vec![0xAB; 512];
        disk.store(512, &written).unwrap();

        let mut read_back = vec![0u8; 512];
        disk.fetch(512, &mut read_back).unwrap();
        assert_eq!(read_back, written);
    }

    #[test]
    fn rejects_misaligned_or_out_of_range_access() {
        init();
        let disk = RamDisk::new(512, 2);
        let mut buf = [0u8; 512];
        assert_eq!(disk.fetch(256, &mut buf).err(), Some(KernelError::Inval));
        assert_eq!(disk.fetch(1024, &mut buf).err(), Some(KernelError::Inval));

        let mut odd = [0u8; 100];
        assert_eq!(disk.fetch(0, &mut odd).err(), Some(KernelError::Inval));
    }

    #[test]
    fn from_image_rejects_size_not_a_multiple_of_block_size() {
        init();
        assert!(RamDisk::from_image(512, vec![0u8; 100]).is_err());
        assert!(RamDisk::from_image(512, vec![0u8; 1024]).is_ok());
    }
}
