//! Fixed-slot block cache.
//!
//! Absorbs reads and writes at block granularity: a single canonical
//! buffer per (device, block position) while that buffer is pinned, with
//! write-back on explicit flush. A sibling `buf.rs`-style cache uses the
//! same pin/dirty/last-used fields but threads an intrusive doubly-linked
//! LRU list through the slot array; this cache keeps the fields but
//! replaces the list with a plain linear scan (first invalid slot, else
//! minimum last-used among unpinned slots).

use std::slice;
use std::sync::{Arc, Mutex};

use log::{debug, trace, warn};

use crate::error::{KernelError, Result};
use crate::param::{BLOCK_SIZE, CACHE_SLOTS};
use crate::storage::StorageDevice;

struct Slot {
    buf: Vec<u8>,
    position: u64,
    valid: bool,
    dirty: bool,
    pin_count: u32,
    last_used: u64,
}

struct Inner {
    slots: Vec<Slot>,
    counter: u64,
}

/// A pinned block. Carries a raw pointer into the slot's buffer rather
/// than a borrow of the cache, since per the concurrency model a pinned
/// buffer is handed to its single consumer unsynchronized; the pin alone
/// is what keeps it stable, not the cache lock.
pub struct Block {
    slot: usize,
    ptr: *mut u8,
    len: usize,
}

// Safety: the slot this points into is only mutated by the holder of the
// pin (this `Block`) until it is released back to the cache; the backing
// `Vec<u8>` never reallocates after the cache is constructed.
unsafe impl Send for Block {}

impl Block {
    pub fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    fn slot_index(&self) -> usize {
        self.slot
    }
}

pub struct Cache {
    storage: Arc<dyn StorageDevice>,
    inner: Mutex<Inner>,
}

impl Cache {
    /// Allocates `CACHE_SLOTS` buffers over `storage`. Fails `NotSup` if
    /// the device's block size doesn't match the cache's fixed size,
    /// `NoMem` if any buffer allocation fails (earlier slots are dropped
    /// on the way out, so nothing is left half-built).
    pub fn new(storage: Arc<dyn StorageDevice>) -> Result<Self> {
        if storage.block_size() != BLOCK_SIZE {
            return Err(KernelError::NotSup);
        }

        let mut slots = Vec::with_capacity(CACHE_SLOTS);
        for _ in 0..CACHE_SLOTS {
            let mut buf = Vec::new();
            buf.try_reserve_exact(BLOCK_SIZE)
                .map_err(|_| KernelError::NoMem)?;
            buf.resize(BLOCK_SIZE, 0);
            slots.push(Slot {
                buf,
                position: 0,
                valid: false,
                dirty: false,
                pin_count: 0,
                last_used: 0,
            });
        }

        debug!(target: "cache", "created cache with {CACHE_SLOTS} slots over a {}-byte device", storage.capacity());

        Ok(Cache {
            storage,
            inner: Mutex::new(Inner { slots, counter: 0 }),
        })
    }

    /// Pins the block at `position`, fetching it from the backing device
    /// on a miss. `position` must be a multiple of the block size.
    pub fn get_block(&self, position: u64) -> Result<Block> {
        if position % BLOCK_SIZE as u64 != 0 {
            return Err(KernelError::Inval);
        }

        let mut inner = self.inner.lock().unwrap();

        if let Some(i) = inner
            .slots
            .iter()
            .position(|s| s.valid && s.position == position)
        {
            inner.counter += 1;
            let counter = inner.counter;
            let slot = &mut inner.slots[i];
            slot.pin_count += 1;
            slot.last_used = counter;
            trace!(target: "cache", "hit at slot {i} for position {position}");
            return Ok(Block {
                slot: i,
                ptr: slot.buf.as_mut_ptr(),
                len: slot.buf.len(),
            });
        }

        let victim = inner
            .slots
            .iter()
            .position(|s| !s.valid)
            .or_else(|| {
                inner
                    .slots
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| s.pin_count == 0)
                    .min_by_key(|(_, s)| s.last_used)
                    .map(|(i, _)| i)
            })
            .ok_or(KernelError::Busy)?;

        if inner.slots[victim].valid && inner.slots[victim].dirty {
            let pos = inner.slots[victim].position;
            self.storage.store(pos, &inner.slots[victim].buf)?;
            inner.slots[victim].dirty = false;
        }

        let fetch_result = {
            let slot = &mut inner.slots[victim];
            self.storage.fetch(position, &mut slot.buf)
        };

        if let Err(e) = fetch_result {
            warn!(target: "cache", "fetch at position {position} failed: {e}");
            let slot = &mut inner.slots[victim];
            slot.valid = false;
            slot.pin_count = 0;
            return Err(e);
        }

        inner.counter += 1;
        let counter = inner.counter;
        let slot = &mut inner.slots[victim];
        slot.position = position;
        slot.valid = true;
        slot.dirty = false;
        slot.pin_count += 1;
        slot.last_used = counter;

        trace!(target: "cache", "miss, fetched position {position} into slot {victim}");

        Ok(Block {
            slot: victim,
            ptr: slot.buf.as_mut_ptr(),
            len: slot.buf.len(),
        })
    }

    /// Releases a pin taken by [`Cache::get_block`]. `dirty` marks the
    /// slot dirty if set; the last-used stamp is deliberately not bumped
    /// here; freshness is set at acquisition, matching the source.
    pub fn release(&self, block: Block, dirty: bool) {
        let mut inner = self.inner.lock().unwrap();
        let slot = &mut inner.slots[block.slot_index()];
        if dirty {
            slot.dirty = true;
        }
        if slot.pin_count > 0 {
            slot.pin_count -= 1;
        }
    }

    /// Writes back every valid, dirty, unpinned slot. Returns `Busy` if
    /// any dirty slot was skipped because it was pinned (nothing is
    /// written back for that slot); returns the first store error and
    /// stops there if one occurs.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let mut busy = false;

        for slot in inner.slots.iter_mut() {
            if !slot.valid || !slot.dirty {
                continue;
            }
            if slot.pin_count > 0 {
                busy = true;
                continue;
            }
            self.storage.store(slot.position, &slot.buf)?;
            slot.dirty = false;
        }

        if busy { Err(KernelError::Busy) } else { Ok(()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::StubDevice;

    fn init() {
        let _ = env_logger::try_init();
    }

    #[test]
    fn create_rejects_mismatched_block_size() {
        init();
        struct Wrong;
        impl StorageDevice for Wrong {
            fn block_size(&self) -> usize {
                1024
            }
            fn capacity(&self) -> u64 {
                1024
            }
            fn fetch(&self, _pos: u64, _buf: &mut [u8]) -> Result<usize> {
                unreachable!()
            }
            fn store(&self, _pos: u64, _buf: &[u8]) -> Result<usize> {
                unreachable!()
            }
        }

        let result = Cache::new(Arc::new(Wrong));
        assert_eq!(result.err(), Some(KernelError::NotSup));
    }

    #[test]
    fn miss_then_hit_returns_identical_pointer() {
        init();
        let dev = Arc::new(StubDevice::new());
        dev.fill_with(|i| (i % 256) as u8);
        let cache = Cache::new(dev.clone()).unwrap();

        let first = cache.get_block(0).unwrap();
        let pattern: Vec<u8> = (0..256).map(|i| i as u8).chain(0..256).collect();
        assert_eq!(first.as_slice(), &pattern[..]);
        let ptr = first.as_ptr();
        cache.release(first, false);

        let second = cache.get_block(0).unwrap();
        assert_eq!(second.as_ptr(), ptr);
        cache.release(second, false);

        assert_eq!(dev.fetch_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn dirty_release_then_flush_writes_back_once() {
        init();
        let dev = Arc::new(StubDevice::new());
        let cache = Cache::new(dev.clone()).unwrap();

        let mut block = cache.get_block(0).unwrap();
        block.as_mut_slice()[0] = 0xAA;
        block.as_mut_slice()[1] = 0x55;
        cache.release(block, true);

        cache.flush().unwrap();

        assert_eq!(dev.store_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(dev.read_byte(0), 0xAA);
        assert_eq!(dev.read_byte(1), 0x55);
    }

    #[test]
    fn clean_release_leaves_backing_device_untouched() {
        init();
        let dev = Arc::new(StubDevice::new());
        let cache = Cache::new(dev.clone()).unwrap();

        let mut block = cache.get_block(0).unwrap();
        block.as_mut_slice()[0] = 0xAA;
        cache.release(block, false);
        cache.flush().unwrap();

        assert_eq!(dev.store_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(dev.read_byte(0), 0);
    }

    #[test]
    fn flush_reports_busy_while_dirty_slot_pinned() {
        init();
        let dev = Arc::new(StubDevice::new());
        let cache = Cache::new(dev.clone()).unwrap();

        let first = cache.get_block(0).unwrap();
        let mut same = cache.get_block(0).unwrap();
        same.as_mut_slice()[0] = 0x11;
        same.as_mut_slice()[1] = 0x22;
        cache.release(same, true);

        assert_eq!(cache.flush(), Err(KernelError::Busy));
        assert_eq!(dev.store_calls.load(std::sync::atomic::Ordering::SeqCst), 0);

        cache.release(first, false);
        cache.flush().unwrap();
        assert_eq!(dev.store_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(dev.read_byte(0), 0x11);
        assert_eq!(dev.read_byte(1), 0x22);
    }

    #[test]
    fn misaligned_position_is_rejected() {
        init();
        let dev = Arc::new(StubDevice::new());
        let cache = Cache::new(dev).unwrap();

        assert_eq!(cache.get_block(256).err(), Some(KernelError::Inval));
    }

    #[test]
    fn lru_eviction_refetches_in_access_order() {
        init();
        let dev = Arc::new(StubDevice::new());
        let cache = Cache::new(dev.clone()).unwrap();

        for i in 0..64u64 {
            let block = cache.get_block(i * BLOCK_SIZE as u64).unwrap();
            cache.release(block, false);
        }
        assert_eq!(dev.fetch_calls.load(std::sync::atomic::Ordering::SeqCst), 64);

        let block = cache.get_block(64 * BLOCK_SIZE as u64).unwrap();
        cache.release(block, false);
        assert_eq!(dev.fetch_calls.load(std::sync::atomic::Ordering::SeqCst), 65);

        let block = cache.get_block(0).unwrap();
        cache.release(block, false);
        assert_eq!(dev.fetch_calls.load(std::sync::atomic::Ordering::SeqCst), 66);
    }
}
