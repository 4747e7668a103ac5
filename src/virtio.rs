//! VirtIO 1.x split-queue block driver.
//!
//! A compile-time-sized ring (`NUM`/`qlen` baked into a static array) and a
//! Buf-pointer-keyed sleep/wakeup channel are the traditional shape of a
//! driver like this one; here the queue length is negotiated at attach
//! time instead, and completion tracking uses a per-descriptor-head ticket
//! array, each carrying its own condition variable.
//!
//! Real MMIO register access has no meaning on a host running unit tests,
//! so only the register block is abstracted behind [`VirtioTransport`] (a
//! production transport is [`crate::mmio::MmioTransport`], which pokes real
//! registers directly). The descriptor table, available ring and used ring
//! are genuine shared memory this driver owns and hands the transport the
//! address of; the driver's own `handle_interrupt` walks the used ring
//! directly rather than delegating that walk to the transport.
//! [`MockTransport`] (test-only) stands in for the device side: it reads
//! the descriptor chain the driver just published, performs the read/write
//! against an in-memory backing store, writes a real used-ring entry, and
//! invokes [`VirtioBlockDevice::handle_interrupt`] the way a real IRQ
//! would.

use std::ptr;
use std::sync::atomic::{Ordering, fence};
use std::sync::{Arc, Condvar, Mutex};

use log::{debug, trace, warn};

use crate::error::{KernelError, Result};
use crate::param::{VIRTQ_MAX_QUEUE_LEN, VIRTQ_TICKET_BUDGET};
use crate::storage::StorageDevice;

const VRING_DESC_F_NEXT: u16 = 1;
const VRING_DESC_F_WRITE: u16 = 2;

const VIRTIO_BLK_T_IN: u32 = 0;
const VIRTIO_BLK_T_OUT: u32 = 1;

/// Status register bits (VirtIO 1.x, `virtio_config.h`).
pub const VIRTIO_CONFIG_S_ACKNOWLEDGE: u32 = 1;
pub const VIRTIO_CONFIG_S_DRIVER: u32 = 2;
pub const VIRTIO_CONFIG_S_DRIVER_OK: u32 = 4;
pub const VIRTIO_CONFIG_S_FEATURES_OK: u32 = 8;
pub const VIRTIO_CONFIG_S_FAILED: u32 = 128;

/// Feature bits this driver requires or wants (`VIRTIO_F_*`/`VIRTIO_BLK_F_*`).
pub const VIRTIO_F_RING_RESET: u32 = 40;
pub const VIRTIO_F_INDIRECT_DESC: u32 = 28;
pub const VIRTIO_BLK_F_BLK_SIZE: u32 = 6;
pub const VIRTIO_BLK_F_TOPOLOGY: u32 = 10;

const VIRTIO_ID_BLOCK: u32 = 2;

/// The register block, abstracted so the driver logic above it can run
/// against a simulated device in tests as well as real memory-mapped
/// hardware. Ring memory (descriptor table, available ring, used ring) is
/// NOT part of this trait: the driver allocates and owns that memory
/// itself and only publishes its address through [`Self::attach_queue`].
/// The driver, not the transport, owns those three regions.
pub trait VirtioTransport: Send + Sync {
    fn device_id(&self) -> u32;
    fn status(&self) -> u32;
    fn set_status(&self, status: u32);
    fn device_features(&self) -> u64;
    fn set_driver_features(&self, features: u64);
    fn queue_num_max(&self) -> u32;
    fn set_queue_num(&self, len: u32);
    fn set_queue_ready(&self, ready: bool);
    fn queue_ready(&self) -> bool;
    fn reset_queue(&self);

    /// Publishes the physical addresses of the descriptor table, driver
    /// (available) ring and device (used) ring for `queue_index`, with
    /// `len` entries each. Called once at attach time, mirroring the
    /// source's `virtio_attach_virtq`.
    fn attach_queue(&self, queue_index: u32, len: u32, desc: u64, driver_ring: u64, device_ring: u64);

    /// Rings the doorbell for `queue_index`: a new available-ring entry is
    /// ready for the device to consume.
    fn notify(&self, queue_index: u32);

    fn interrupt_status(&self) -> u32;
    fn ack_interrupt(&self, mask: u32);

    /// Device-reported capacity in 512-byte sectors.
    fn capacity_sectors(&self) -> u64;
}

#[repr(C)]
#[derive(Clone, Copy)]
struct VirtqDesc {
    addr: u64,
    len: u32,
    flags: u16,
    next: u16,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct BlockReq {
    r#type: u32,
    reserved: u32,
    sector: u64,
}

/// Driver (available) ring: `u16 flags; u16 idx; u16 ring[len];`, laid out
/// as a raw byte buffer so its address can be handed to the device the
/// same way a real physical address would be. Only the driver writes
/// here, but the fields are still accessed with volatile reads/writes
/// since the memory is shared with hardware on a real transport.
struct AvailRing {
    buf: Vec<u8>,
}

impl AvailRing {
    fn new(len: usize) -> Self {
        AvailRing {
            buf: vec![0u8; 4 + len * 2],
        }
    }

    fn addr(&self) -> u64 {
        self.buf.as_ptr() as u64
    }

    fn idx(&self) -> u16 {
        unsafe { ptr::read_volatile(self.buf.as_ptr().add(2) as *const u16) }
    }

    fn set_idx(&mut self, v: u16) {
        unsafe { ptr::write_volatile(self.buf.as_mut_ptr().add(2) as *mut u16, v) }
    }

    fn set_ring(&mut self, slot: usize, head: u16) {
        let off = 4 + slot * 2;
        unsafe { ptr::write_volatile(self.buf.as_mut_ptr().add(off) as *mut u16, head) }
    }
}

/// Device (used) ring: `u16 flags; u16 idx; struct { u32 id; u32 len; }
/// ring[len];`. The device (real hardware, or [`MockTransport`] standing
/// in for one) writes `idx` and `ring` entries here; the driver only
/// reads.
struct UsedRing {
    buf: Vec<u8>,
}

impl UsedRing {
    fn new(len: usize) -> Self {
        UsedRing {
            buf: vec![0u8; 4 + len * 8],
        }
    }

    fn addr(&self) -> u64 {
        self.buf.as_ptr() as u64
    }

    fn idx(&self) -> u16 {
        unsafe { ptr::read_volatile(self.buf.as_ptr().add(2) as *const u16) }
    }

    fn entry_id(&self, slot: usize) -> u32 {
        let off = 4 + slot * 8;
        unsafe { ptr::read_volatile(self.buf.as_ptr().add(off) as *const u32) }
    }
}

struct Ticket {
    done: bool,
    status: u8,
    cv: Condvar,
}

impl Ticket {
    fn new() -> Self {
        Ticket {
            done: false,
            status: 0xFF,
            cv: Condvar::new(),
        }
    }
}

struct Queue {
    desc: Vec<VirtqDesc>,
    avail: AvailRing,
    used: UsedRing,
    used_idx_seen: u16,
}

struct Inner {
    queue: Queue,
    free_desc: usize,
    open: bool,
}

/// An open VirtIO block device, exposing [`StorageDevice`].
pub struct VirtioBlockDevice {
    transport: Arc<dyn VirtioTransport>,
    queue_len: usize,
    capacity: u64,
    inner: Mutex<Inner>,
    tickets: Vec<Mutex<Ticket>>,
}

impl VirtioBlockDevice {
    /// Attaches to a block device behind `transport`: asserts the device
    /// id, negotiates features, picks a queue length and builds driver
    /// state. Fails `NotSup` if the device isn't a block device or doesn't
    /// offer the required features, `NoMem` if the queue has no usable
    /// length.
    pub fn attach(transport: Arc<dyn VirtioTransport>) -> Result<Arc<VirtioBlockDevice>> {
        if transport.device_id() != VIRTIO_ID_BLOCK {
            return Err(KernelError::NotSup);
        }

        transport.set_status(VIRTIO_CONFIG_S_ACKNOWLEDGE);
        transport.set_status(transport.status() | VIRTIO_CONFIG_S_DRIVER);

        let device_features = transport.device_features();
        let needed = (1u64 << VIRTIO_F_RING_RESET) | (1u64 << VIRTIO_F_INDIRECT_DESC);
        if device_features & needed != needed {
            warn!(target: "virtio", "device does not offer required features");
            transport.set_status(transport.status() | VIRTIO_CONFIG_S_FAILED);
            return Err(KernelError::NotSup);
        }
        let wanted = (1u64 << VIRTIO_BLK_F_BLK_SIZE) | (1u64 << VIRTIO_BLK_F_TOPOLOGY);
        let enabled = needed | (device_features & wanted);
        transport.set_driver_features(enabled);
        transport.set_status(transport.status() | VIRTIO_CONFIG_S_FEATURES_OK);
        if transport.status() & VIRTIO_CONFIG_S_FEATURES_OK == 0 {
            warn!(target: "virtio", "device rejected feature negotiation");
            transport.set_status(transport.status() | VIRTIO_CONFIG_S_FAILED);
            return Err(KernelError::NotSup);
        }

        let qmax = transport.queue_num_max();
        if qmax == 0 {
            transport.set_status(transport.status() | VIRTIO_CONFIG_S_FAILED);
            return Err(KernelError::NoMem);
        }
        let queue_len = (qmax as usize)
            .min(VIRTQ_MAX_QUEUE_LEN)
            .min(VIRTQ_TICKET_BUDGET)
            .max(1);
        transport.set_queue_num(queue_len as u32);

        let mut desc = Vec::new();
        desc.try_reserve_exact(queue_len).map_err(|_| KernelError::NoMem)?;
        desc.resize(
            queue_len,
            VirtqDesc {
                addr: 0,
                len: 0,
                flags: 0,
                next: 0,
            },
        );

        let mut tickets = Vec::new();
        tickets
            .try_reserve_exact(queue_len)
            .map_err(|_| KernelError::NoMem)?;
        for _ in 0..queue_len {
            tickets.push(Mutex::new(Ticket::new()));
        }

        let avail = AvailRing::new(queue_len);
        let used = UsedRing::new(queue_len);

        let desc_addr = desc.as_ptr() as u64;
        let avail_addr = avail.addr();
        let used_addr = used.addr();
        transport.attach_queue(0, queue_len as u32, desc_addr, avail_addr, used_addr);

        let capacity = transport.capacity_sectors() * 512;

        debug!(
            target: "virtio",
            "attached block device: queue length {queue_len}, capacity {capacity} bytes"
        );

        transport.set_status(transport.status() | VIRTIO_CONFIG_S_DRIVER_OK);

        Ok(Arc::new(VirtioBlockDevice {
            transport,
            queue_len,
            capacity,
            inner: Mutex::new(Inner {
                queue: Queue {
                    desc,
                    avail,
                    used,
                    used_idx_seen: 0,
                },
                free_desc: 0,
                open: false,
            }),
            tickets,
        }))
    }

    /// Walks newly completed used-ring entries, marking their tickets done
    /// and waking blocked submitters. Driven by a real interrupt in
    /// production; [`test_support::MockTransport`] calls it directly after
    /// simulating device completion, playing the role of the PLIC/IRQ
    /// line.
    ///
    /// Reads `used.idx` before reading any ring entry: the VirtIO protocol
    /// requires the device to publish a ring entry before incrementing
    /// `idx`, so this ordering is what makes the entries this handler sees
    /// always fully written.
    pub fn handle_interrupt(&self) {
        let is = self.transport.interrupt_status();
        let mut inner = self.inner.lock().unwrap();

        let new_idx = inner.queue.used.idx();
        fence(Ordering::Acquire);

        while inner.queue.used_idx_seen != new_idx {
            let slot = (inner.queue.used_idx_seen as usize) % self.queue_len;
            let head = inner.queue.used.entry_id(slot) as usize;

            let status_desc = (head + 2) % self.queue_len;
            let status_addr = inner.queue.desc[status_desc].addr;
            let status = unsafe { ptr::read_volatile(status_addr as *const u8) };

            let mut ticket = self.tickets[head].lock().unwrap();
            ticket.status = status;
            ticket.done = true;
            ticket.cv.notify_all();
            trace!(target: "virtio", "completed request at descriptor {head} with status {status}");

            inner.queue.used_idx_seen = inner.queue.used_idx_seen.wrapping_add(1);
        }

        self.transport.ack_interrupt(is);
    }

    fn submit(&self, req_type: u32, sector: u64, buf_addr: u64, len: u32, write_to_buf: bool) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.open {
            return Err(KernelError::NotSup);
        }

        let head = inner.free_desc;
        let d0 = head;
        let d1 = (head + 1) % self.queue_len;
        let d2 = (head + 2) % self.queue_len;
        inner.free_desc = (head + 3) % self.queue_len;

        let req = Box::new(BlockReq {
            r#type: req_type,
            reserved: 0,
            sector,
        });
        let req_addr = Box::into_raw(req) as u64;
        let status = Box::new(0xFFu8);
        let status_addr = Box::into_raw(status) as u64;

        {
            let q = &mut inner.queue;
            q.desc[d0] = VirtqDesc {
                addr: req_addr,
                len: size_of::<BlockReq>() as u32,
                flags: VRING_DESC_F_NEXT,
                next: d1 as u16,
            };
            q.desc[d1] = VirtqDesc {
                addr: buf_addr,
                len,
                flags: (if write_to_buf { VRING_DESC_F_WRITE } else { 0 }) | VRING_DESC_F_NEXT,
                next: d2 as u16,
            };
            q.desc[d2] = VirtqDesc {
                addr: status_addr,
                len: 1,
                flags: VRING_DESC_F_WRITE,
                next: 0,
            };
        }

        {
            let mut ticket = self.tickets[head].lock().unwrap();
            ticket.done = false;
            ticket.status = 0xFF;
        }

        // Publish the chain head, fence so the device never observes the
        // incremented idx before the descriptors and the ring slot it
        // points at, then fence again before the doorbell so the device
        // never observes the notify before the idx bump.
        let avail_slot = inner.queue.avail.idx() as usize % self.queue_len;
        inner.queue.avail.set_ring(avail_slot, head as u16);
        fence(Ordering::Release);
        let next_idx = inner.queue.avail.idx().wrapping_add(1);
        inner.queue.avail.set_idx(next_idx);
        fence(Ordering::Release);

        drop(inner);

        self.transport.notify(0);

        let mut ticket = self.tickets[head].lock().unwrap();
        while !ticket.done {
            ticket = ticket.cv.wait(ticket).unwrap();
        }
        let result = if ticket.status == 0 {
            Ok(len as usize)
        } else {
            Err(KernelError::Io)
        };

        // Safety: these were leaked via `Box::into_raw` above and nothing
        // else retains the addresses once the ticket is marked done.
        unsafe {
            drop(Box::from_raw(req_addr as *mut BlockReq));
            drop(Box::from_raw(status_addr as *mut u8));
        }

        result
    }

    fn io(&self, pos: u64, buf_addr: u64, len: u32, write: bool) -> Result<usize> {
        if pos % 512 != 0 || len % 512 != 0 {
            return Err(KernelError::Inval);
        }
        let sector = pos / 512;
        let req_type = if write { VIRTIO_BLK_T_OUT } else { VIRTIO_BLK_T_IN };
        // The device writes into our buffer on a read, so the buffer
        // descriptor carries VRING_DESC_F_WRITE exactly when we're reading.
        self.submit(req_type, sector, buf_addr, len, !write)
    }
}

impl StorageDevice for VirtioBlockDevice {
    fn block_size(&self) -> usize {
        512
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn open(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.open {
            return Err(KernelError::Busy);
        }
        if !self.transport.queue_ready() {
            return Err(KernelError::Busy);
        }
        inner.queue.used_idx_seen = 0;
        inner.queue.avail.set_idx(0);
        inner.open = true;
        self.transport.set_queue_ready(true);
        Ok(())
    }

    fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.open {
            return;
        }
        inner.open = false;
        self.transport.reset_queue();
        drop(inner);

        for ticket_lock in &self.tickets {
            let mut ticket = ticket_lock.lock().unwrap();
            if !ticket.done {
                ticket.status = 1;
                ticket.done = true;
                ticket.cv.notify_all();
            }
        }
    }

    fn fetch(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        self.io(pos, buf.as_mut_ptr() as u64, buf.len() as u32, false)
    }

    fn store(&self, pos: u64, buf: &[u8]) -> Result<usize> {
        self.io(pos, buf.as_ptr() as u64, buf.len() as u32, true)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::MockTransport;
    use super::*;

    fn init() {
        let _ = env_logger::try_init();
    }

    fn attached(capacity_bytes: u64, qmax: u32) -> (Arc<MockTransport>, Arc<VirtioBlockDevice>) {
        let transport = MockTransport::new(capacity_bytes, qmax);
        let device = VirtioBlockDevice::attach(transport.clone()).unwrap();
        transport.bind(&device);
        device.open().unwrap();
        (transport, device)
    }

    #[test]
    fn attach_negotiates_bounded_queue_length() {
        init();
        let (_transport, device) = attached(512 * 64, 4096);
        assert_eq!(device.queue_len, VIRTQ_MAX_QUEUE_LEN);
        assert_eq!(device.capacity(), 512 * 64);
    }

    #[test]
    fn store_then_fetch_round_trips_through_queue() {
        init();
        let (_transport, device) = attached(512 * 4, 8);

        let written = vec![0x5A; 512];
        assert_eq!(device.store(512, &written).unwrap(), 512);

        let mut read_back = vec![0u8; 512];
        assert_eq!(device.fetch(512, &mut read_back).unwrap(), 512);
        assert_eq!(read_back, written);
    }

    #[test]
    fn many_sequential_requests_cycle_through_all_descriptor_heads() {
        init();
        let (_transport, device) = attached(512 * 4, 4);
        // Queue length 4 means only one 3-descriptor chain fits before the
        // free-descriptor cursor wraps; this exercises that wraparound and
        // confirms the ticket array at the reused head still completes
        // correctly each time.
        for i in 0..10 {
            let pattern = vec![i as u8; 512];
            assert_eq!(device.store(0, &pattern).unwrap(), 512);
            let mut back = vec![0u8; 512];
            assert_eq!(device.fetch(0, &mut back).unwrap(), 512);
            assert_eq!(back, pattern);
        }
    }

    #[test]
    fn rejects_misaligned_position_or_length() {
        init();
        let (_transport, device) = attached(512 * 4, 8);
        let mut buf = [0u8; 100];
        assert_eq!(device.fetch(0, &mut buf).err(), Some(KernelError::Inval));
    }

    #[test]
    fn close_forces_pending_tickets_to_io_error() {
        init();
        let (_transport, device) = attached(512 * 4, 8);
        {
            let mut ticket = device.tickets[0].lock().unwrap();
            ticket.done = false;
        }
        device.close();
        let ticket = device.tickets[0].lock().unwrap();
        assert!(ticket.done);
        assert_eq!(ticket.status, 1);
    }

    #[test]
    fn second_open_while_already_open_is_busy() {
        init();
        let (_transport, device) = attached(512 * 4, 8);
        assert_eq!(device.open().err(), Some(KernelError::Busy));
    }
}
