//! Shared memory slots gated by a pair of process-shared semaphores
//!
//! Layout of the segment, one cache-line-aligned slot per worker:
//!
//! ```text
//! [ request sem | reply sem | len | text ... ] [ slot 1 ] ... [ slot N-1 ]
//! ```
//!
//! The coordinator owns a slot's text between a reply and the next request;
//! the worker owns it between a request and its reply. The semaphore pair
//! enforces that turn-taking, so the text itself needs no lock.

use super::{check_len, check_slot, ReplyBody, Transport, WorkerChannel};
use crate::config::{BenchmarkConfig, TransportKind};
use crate::error::{BenchError, Result};
use crate::lifecycle::{Owner, ResourceNames};
use crate::shm::SharedRegion;
use crate::sys::{retry_eintr, PosixSemaphore};
use log::warn;
use std::marker::PhantomData;
use std::mem::size_of;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Cache line size
const CACHE_LINE_SIZE: usize = 64;

/// Minimum text capacity of a slot
pub const SLOT_TEXT_LEN: usize = 256;

/// Worker reply body
const PONG: &[u8] = b"Pong";

/// Per-slot header stored at the start of each slot
#[repr(C)]
struct SlotHeader {
    /// Posted by the coordinator: text holds a fresh request
    request: libc::sem_t,
    /// Posted by the worker: text holds a fresh reply
    reply: libc::sem_t,
    len: AtomicUsize,
}

#[inline]
fn align(size: usize) -> usize {
    (size + CACHE_LINE_SIZE - 1) & !(CACHE_LINE_SIZE - 1)
}

/// Pointers into one slot of the mapping
#[derive(Clone, Copy)]
struct Slot {
    request: PosixSemaphore,
    reply: PosixSemaphore,
    len: *const AtomicUsize,
    text: *mut u8,
    capacity: usize,
}

impl Slot {
    /// Initialize slot `index`; both semaphores start at zero
    ///
    /// # Safety
    /// `base` must point to a zeroed mapping of at least `(index + 1) * stride` bytes.
    unsafe fn init(base: *mut u8, index: usize, stride: usize, capacity: usize) -> std::io::Result<Self> {
        let header = base.add(index * stride) as *mut SlotHeader;
        let request = PosixSemaphore::init(std::ptr::addr_of_mut!((*header).request), 0)?;
        let reply = match PosixSemaphore::init(std::ptr::addr_of_mut!((*header).reply), 0) {
            Ok(reply) => reply,
            Err(e) => {
                let _ = request.destroy();
                return Err(e);
            }
        };
        Ok(Self {
            request,
            reply,
            len: std::ptr::addr_of!((*header).len),
            text: (header as *mut u8).add(size_of::<SlotHeader>()),
            capacity,
        })
    }

    /// Only the side currently holding the turn may call this
    #[inline]
    fn write(&self, payload: &[u8]) {
        let len = payload.len().min(self.capacity);
        unsafe {
            std::ptr::copy_nonoverlapping(payload.as_ptr(), self.text, len);
            (*self.len).store(len, Ordering::Release);
        }
    }

    #[inline]
    fn read(&self, buf: &mut [u8]) -> usize {
        let len = unsafe { (*self.len).load(Ordering::Acquire) };
        let copy = len.min(buf.len());
        unsafe {
            std::ptr::copy_nonoverlapping(self.text, buf.as_mut_ptr(), copy);
        }
        copy
    }
}

/// Coordinator side: owns the segment and every slot's semaphores
pub struct SharedBufferTransport {
    region: SharedRegion,
    slots: Vec<Slot>,
    capacity: usize,
    owner: Owner,
    torn_down: bool,
}

// SAFETY: slots point into `region`, which lives as long as the transport;
// access to slot text is serialized by the semaphore hand-off.
unsafe impl Send for SharedBufferTransport {}

impl SharedBufferTransport {
    /// Bytes one slot occupies for a given text capacity
    pub fn stride(capacity: usize) -> usize {
        align(size_of::<SlotHeader>() + capacity)
    }

    /// Create the segment sized for `config.worker_count` slots
    pub fn create(config: &BenchmarkConfig) -> Result<Self> {
        let names = ResourceNames::new(&config.namespace);
        let capacity = config.payload_size.max(SLOT_TEXT_LEN);
        let stride = Self::stride(capacity);
        let size = stride
            .checked_mul(config.worker_count)
            .ok_or_else(|| BenchError::config("shared memory size overflows"))?;

        let region = SharedRegion::create(&names.shm(), size)?;
        let base = region.as_ptr();

        let mut transport = Self {
            region,
            slots: Vec::with_capacity(config.worker_count),
            capacity,
            owner: Owner::current(),
            torn_down: false,
        };

        for index in 0..config.worker_count {
            // Already-initialized slots are destroyed by Drop on early return.
            let slot = unsafe { Slot::init(base, index, stride, capacity) }.map_err(|source| {
                BenchError::ResourceCreate {
                    resource: "semaphore",
                    name: format!("{} slot {}", transport.region.name(), index),
                    op: "sem_init",
                    source,
                }
            })?;
            transport.slots.push(slot);
        }

        Ok(transport)
    }

    pub fn region(&self) -> &SharedRegion {
        &self.region
    }

    fn destroy_semaphores(&mut self) {
        for (index, slot) in self.slots.drain(..).enumerate() {
            for sem in [slot.request, slot.reply] {
                if let Err(e) = unsafe { sem.destroy() } {
                    warn!("sem_destroy on slot {} failed: {}", index, e);
                }
            }
        }
    }
}

impl Transport for SharedBufferTransport {
    type Worker<'a> = SharedBufferWorker<'a>;

    fn kind(&self) -> TransportKind {
        TransportKind::SharedBuffer
    }

    fn slots(&self) -> usize {
        self.slots.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn reply_body(&self) -> ReplyBody {
        ReplyBody::Fixed(PONG)
    }

    fn worker(&self, slot: usize) -> Result<SharedBufferWorker<'_>> {
        check_slot(slot, self.slots.len())?;
        Ok(SharedBufferWorker {
            slot: self.slots[slot],
            index: slot,
            _region: PhantomData,
        })
    }

    #[inline]
    fn send(&self, slot: usize, payload: &[u8]) -> Result<()> {
        check_slot(slot, self.slots.len())?;
        check_len(payload.len(), self.capacity)?;
        let s = &self.slots[slot];
        s.write(payload);
        s.request
            .post()
            .map_err(|e| BenchError::transport("sem_post(request)", slot, e))
    }

    #[inline]
    fn receive(&self, slot: usize, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        check_slot(slot, self.slots.len())?;
        let s = &self.slots[slot];
        match timeout {
            None => s
                .reply
                .wait()
                .map_err(|e| BenchError::transport("sem_wait(reply)", slot, e))?,
            Some(timeout) => s
                .reply
                .wait_timeout(timeout)
                .map_err(|e| BenchError::transport("sem_timedwait(reply)", slot, e))?,
        }
        Ok(s.read(buf))
    }

    fn teardown(&mut self) -> Result<()> {
        if self.torn_down || !self.owner.is_current() {
            return Ok(());
        }
        self.torn_down = true;
        self.destroy_semaphores();
        self.region.remove()
    }
}

impl Drop for SharedBufferTransport {
    fn drop(&mut self) {
        // The region unlinks itself when dropped.
        if !self.torn_down && self.owner.is_current() {
            self.destroy_semaphores();
        }
    }
}

/// Worker side of one slot
pub struct SharedBufferWorker<'a> {
    slot: Slot,
    index: usize,
    _region: PhantomData<&'a SharedRegion>,
}

// SAFETY: see `SharedBufferTransport`
unsafe impl Send for SharedBufferWorker<'_> {}

impl WorkerChannel for SharedBufferWorker<'_> {
    #[inline]
    fn receive(&mut self, buf: &mut [u8]) -> Result<usize> {
        retry_eintr(|| self.slot.request.wait())
            .map_err(|e| BenchError::transport("sem_wait(request)", self.index, e))?;
        Ok(self.slot.read(buf))
    }

    #[inline]
    fn send(&mut self, payload: &[u8]) -> Result<()> {
        self.slot.write(payload);
        self.slot
            .reply
            .post()
            .map_err(|e| BenchError::transport("sem_post(reply)", self.index, e))
    }
}
