//! Production VirtIO-MMIO transport.
//!
//! Implements [`crate::virtio::VirtioTransport`] over real memory-mapped
//! registers, reached directly with `ptr::read_volatile`/`write_volatile`
//! against a fixed base address the way `virtio_disk.rs`-style drivers poke
//! `VIRTIO0`. The feature bits and status-bit constants live in
//! [`crate::virtio`] since both this transport and the driver above it need
//! them.
//!
//! Construction is unsafe: the caller must guarantee `base` is the
//! address of a live VirtIO-MMIO block device register block, mapped and
//! valid for as long as the transport exists, and not touched by anything
//! else.

use std::ptr;
use std::sync::atomic::{Ordering, fence};

use crate::error::{KernelError, Result};
use crate::virtio::VirtioTransport;

const MAGIC_VALUE: usize = 0x000;
const VERSION: usize = 0x004;
const DEVICE_ID: usize = 0x008;
const VENDOR_ID: usize = 0x00c;
const DEVICE_FEATURES: usize = 0x010;
const DEVICE_FEATURES_SEL: usize = 0x014;
const DRIVER_FEATURES: usize = 0x020;
const DRIVER_FEATURES_SEL: usize = 0x024;
const QUEUE_SEL: usize = 0x030;
const QUEUE_NUM_MAX: usize = 0x034;
const QUEUE_NUM: usize = 0x038;
const QUEUE_READY: usize = 0x044;
const QUEUE_NOTIFY: usize = 0x050;
const INTERRUPT_STATUS: usize = 0x060;
const INTERRUPT_ACK: usize = 0x064;
const STATUS: usize = 0x070;
const QUEUE_DESC_LOW: usize = 0x080;
const QUEUE_DESC_HIGH: usize = 0x084;
const QUEUE_DRIVER_LOW: usize = 0x090;
const QUEUE_DRIVER_HIGH: usize = 0x094;
const QUEUE_DEVICE_LOW: usize = 0x0a0;
const QUEUE_DEVICE_HIGH: usize = 0x0a4;
const CONFIG_BLK_CAPACITY: usize = 0x100;

const MAGIC: u32 = 0x7472_6976;
const VENDOR: u32 = 0x554d_4551;

/// A VirtIO-MMIO register block, reached through raw volatile accesses.
pub struct MmioTransport {
    base: usize,
}

impl MmioTransport {
    /// Validates the magic value, version and vendor id at `base` and
    /// returns a transport over it. `BadFmt` if the register block
    /// doesn't look like a VirtIO 1.x device, a recoverable error here
    /// rather than a boot-time panic.
    ///
    /// # Safety
    /// `base` must be the address of a mapped VirtIO-MMIO register block
    /// that remains valid for the lifetime of this transport and is not
    /// concurrently accessed by anything else.
    pub unsafe fn new(base: usize) -> Result<Self> {
        let transport = MmioTransport { base };
        if transport.read32(MAGIC_VALUE) != MAGIC
            || transport.read32(VERSION) != 2
            || transport.read32(VENDOR_ID) != VENDOR
        {
            return Err(KernelError::BadFmt);
        }
        Ok(transport)
    }

    fn read32(&self, reg: usize) -> u32 {
        // Safety: `self.base` was validated as a live register block at
        // construction; `reg` is one of the fixed offsets above.
        unsafe { ptr::read_volatile((self.base + reg) as *const u32) }
    }

    fn write32(&self, reg: usize, value: u32) {
        // Safety: see `read32`.
        unsafe { ptr::write_volatile((self.base + reg) as *mut u32, value) }
    }
}

// Safety: all register access goes through volatile reads/writes on a
// fixed address; the driver above serializes access with its own lock.
unsafe impl Send for MmioTransport {}
unsafe impl Sync for MmioTransport {}

impl VirtioTransport for MmioTransport {
    fn device_id(&self) -> u32 {
        self.read32(DEVICE_ID)
    }

    fn status(&self) -> u32 {
        self.read32(STATUS)
    }

    fn set_status(&self, status: u32) {
        self.write32(STATUS, status);
        fence(Ordering::SeqCst);
    }

    fn device_features(&self) -> u64 {
        self.write32(DEVICE_FEATURES_SEL, 0);
        let lo = self.read32(DEVICE_FEATURES) as u64;
        self.write32(DEVICE_FEATURES_SEL, 1);
        let hi = self.read32(DEVICE_FEATURES) as u64;
        (hi << 32) | lo
    }

    fn set_driver_features(&self, features: u64) {
        self.write32(DRIVER_FEATURES_SEL, 0);
        self.write32(DRIVER_FEATURES, features as u32);
        self.write32(DRIVER_FEATURES_SEL, 1);
        self.write32(DRIVER_FEATURES, (features >> 32) as u32);
    }

    fn queue_num_max(&self) -> u32 {
        self.write32(QUEUE_SEL, 0);
        self.read32(QUEUE_NUM_MAX)
    }

    fn set_queue_num(&self, len: u32) {
        self.write32(QUEUE_SEL, 0);
        self.write32(QUEUE_NUM, len);
    }

    fn set_queue_ready(&self, ready: bool) {
        self.write32(QUEUE_SEL, 0);
        self.write32(QUEUE_READY, ready as u32);
    }

    fn queue_ready(&self) -> bool {
        self.write32(QUEUE_SEL, 0);
        self.read32(QUEUE_READY) != 0
    }

    fn reset_queue(&self) {
        self.write32(QUEUE_SEL, 0);
        self.write32(QUEUE_READY, 0);
    }

    fn attach_queue(&self, queue_index: u32, len: u32, desc: u64, driver_ring: u64, device_ring: u64) {
        self.write32(QUEUE_SEL, queue_index);
        self.write32(QUEUE_NUM, len);
        self.write32(QUEUE_DESC_LOW, desc as u32);
        self.write32(QUEUE_DESC_HIGH, (desc >> 32) as u32);
        self.write32(QUEUE_DRIVER_LOW, driver_ring as u32);
        self.write32(QUEUE_DRIVER_HIGH, (driver_ring >> 32) as u32);
        self.write32(QUEUE_DEVICE_LOW, device_ring as u32);
        self.write32(QUEUE_DEVICE_HIGH, (device_ring >> 32) as u32);
        fence(Ordering::SeqCst);
        self.write32(QUEUE_READY, 1);
    }

    fn notify(&self, queue_index: u32) {
        // The driver has already fenced its descriptor/ring writes before
        // calling this; one more fence here keeps the doorbell write from
        // being reordered ahead of them on architectures with weaker
        // store ordering than the driver assumed.
        fence(Ordering::SeqCst);
        self.write32(QUEUE_NOTIFY, queue_index);
    }

    fn interrupt_status(&self) -> u32 {
        self.read32(INTERRUPT_STATUS)
    }

    fn ack_interrupt(&self, mask: u32) {
        self.write32(INTERRUPT_ACK, mask);
    }

    fn capacity_sectors(&self) -> u64 {
        let lo = self.read32(CONFIG_BLK_CAPACITY) as u64;
        let hi = self.read32(CONFIG_BLK_CAPACITY + 4) as u64;
        (hi << 32) | lo
    }
}
