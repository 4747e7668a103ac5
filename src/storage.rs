//! Backing storage contract.
//!
//! Consumed by the block cache; produced by the VirtIO block driver and by
//! [`crate::ramdisk::RamDisk`]. Immutable after registration: block size
//! and capacity never change once a device is constructed.

use crate::error::{KernelError, Result};
use crate::io::{Control, ControlValue};

/// A backing device the cache can fetch/store fixed-size blocks from.
///
/// `open`/`close` are reference-counted per-driver in the source; this
/// crate models "at most one open caller at a time" by leaving them as
/// plain methods callers invoke directly rather than threading a refcount
/// through every storage device (the uniform I/O handle in [`crate::io`]
/// is where refcounted sharing actually matters for this crate).
pub trait StorageDevice: Send + Sync {
    /// Fixed block size, a power of two.
    fn block_size(&self) -> usize;

    /// Total capacity in bytes.
    fn capacity(&self) -> u64;

    fn open(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) {}

    /// Reads `buf.len()` bytes at byte offset `pos` into `buf`.
    fn fetch(&self, pos: u64, buf: &mut [u8]) -> Result<usize>;

    /// Writes `buf.len()` bytes at byte offset `pos`.
    fn store(&self, pos: u64, buf: &[u8]) -> Result<usize>;

    /// Supports at minimum `GetEnd`, returning the device capacity.
    fn control(&self, op: Control) -> Result<ControlValue> {
        match op {
            Control::GetEnd => Ok(ControlValue::Pos(self.capacity())),
            _ => Err(KernelError::NotSup),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub const STUB_BLKSZ: usize = 512;
    pub const STUB_TOTAL_BLOCKS: usize = 64;
    pub const STUB_CAPACITY: usize = STUB_BLKSZ * STUB_TOTAL_BLOCKS;

    /// In-memory storage device used by unit tests, mirroring the fixed
    /// byte-array stub the original test suite fetches/stores against.
    pub struct StubDevice {
        data: Mutex<Vec<u8>>,
        pub fetch_calls: AtomicUsize,
        pub store_calls: AtomicUsize,
    }

    impl StubDevice {
        pub fn new() -> Self {
            Self {
                data: Mutex::new(vec![0u8; STUB_CAPACITY]),
                fetch_calls: AtomicUsize::new(0),
                store_calls: AtomicUsize::new(0),
            }
        }

        pub fn fill_with(&self, f: impl Fn(usize) -> u8) {
            let mut data = self.data.lock().unwrap();
            for (i, byte) in data.iter_mut().enumerate() {
                *byte = f(i);
            }
        }

        pub fn read_byte(&self, offset: usize) -> u8 {
            self.data.lock().unwrap()[offset]
        }

        /// Direct access to the backing bytes, for tests that lay out a
        /// whole filesystem image by hand.
        pub fn with_data_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
            f(&mut self.data.lock().unwrap())
        }
    }

    impl StorageDevice for StubDevice {
        fn block_size(&self) -> usize {
            STUB_BLKSZ
        }

        fn capacity(&self) -> u64 {
            STUB_CAPACITY as u64
        }

        fn fetch(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
            if pos % STUB_BLKSZ as u64 != 0 || buf.len() % STUB_BLKSZ != 0 {
                return Err(KernelError::Inval);
            }
            let end = pos as usize + buf.len();
            if end > STUB_CAPACITY {
                return Err(KernelError::Inval);
            }
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            let data = self.data.lock().unwrap();
            buf.copy_from_slice(&data[pos as usize..end]);
            Ok(buf.len())
        }

        fn store(&self, pos: u64, buf: &[u8]) -> Result<usize> {
            if pos % STUB_BLKSZ as u64 != 0 || buf.len() % STUB_BLKSZ != 0 {
                return Err(KernelError::Inval);
            }
            let end = pos as usize + buf.len();
            if end > STUB_CAPACITY {
                return Err(KernelError::Inval);
            }
            self.store_calls.fetch_add(1, Ordering::SeqCst);
            let mut data = self.data.lock().unwrap();
            data[pos as usize..end].copy_from_slice(buf);
            Ok(buf.len())
        }
    }
}
