//! Channels between the coordinator and its workers
//!
//! A [`Transport`] owns every kernel object one run needs and exposes the
//! coordinator's half of each worker slot. [`Transport::worker`] hands out
//! the other half as a [`WorkerChannel`]; it is built in the parent before
//! the fork so the child starts with everything it needs.
//!
//! All four strategies deliver each message exactly once and in order
//! under one-producer/one-consumer use of a slot.

mod posix_queue;
mod semaphore;
mod shared_buffer;
mod sysv_queue;

pub use posix_queue::{PosixQueueTransport, QUEUE_DEPTH};
pub use semaphore::SysvSemaphoreTransport;
pub use shared_buffer::{SharedBufferTransport, SLOT_TEXT_LEN};
pub use sysv_queue::SysvQueueTransport;

use crate::config::{BenchmarkConfig, TransportKind};
use crate::error::{BenchError, Result};
use std::time::Duration;

/// Body a worker writes back for each request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyBody {
    /// Send the request bytes back unchanged
    Echo,
    /// Always answer with the same bytes
    Fixed(&'static [u8]),
}

/// Worker half of one slot
pub trait WorkerChannel {
    /// Block until the next request arrives; returns the bytes placed in `buf`.
    /// Signals do not end the wait.
    fn receive(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Reply to the request just received
    fn send(&mut self, payload: &[u8]) -> Result<()>;
}

/// Coordinator half of every slot, plus ownership of the kernel objects
pub trait Transport {
    type Worker<'a>: WorkerChannel
    where
        Self: 'a;

    fn kind(&self) -> TransportKind;

    /// Number of worker slots
    fn slots(&self) -> usize;

    /// Largest message one slot carries; receive buffers use this size
    fn capacity(&self) -> usize;

    /// What workers on this transport answer with
    fn reply_body(&self) -> ReplyBody {
        ReplyBody::Echo
    }

    /// Worker half of `slot`
    fn worker(&self, slot: usize) -> Result<Self::Worker<'_>>;

    /// Record the process serving `slot`
    fn bind(&mut self, _slot: usize, _pid: i32) {}

    /// Deliver `payload` to the worker in `slot`
    fn send(&self, slot: usize, payload: &[u8]) -> Result<()>;

    /// Take the reply of the worker in `slot`.
    ///
    /// `None` blocks until the reply arrives or a signal breaks the wait;
    /// the latter surfaces as a transport error whose source kind is
    /// `Interrupted`. With a timeout an expired wait surfaces the same way
    /// with source kind `TimedOut`, and signals are absorbed.
    fn receive(&self, slot: usize, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize>;

    /// Remove every kernel object this transport created
    fn teardown(&mut self) -> Result<()>;
}

/// Request bytes sent on every hop.
///
/// Content is never checked; only completion of the round trip matters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    bytes: Vec<u8>,
}

impl Payload {
    const PATTERN: &'static [u8] = b"Ping";

    /// `len` bytes of a repeating pattern; at least one byte
    pub fn new(len: usize) -> Self {
        let bytes = Self::PATTERN.iter().copied().cycle().take(len.max(1)).collect();
        Self { bytes }
    }

    /// Payload for `config` on `kind`.
    ///
    /// Queues always carry `message_len()` bytes. The shared buffer carries
    /// the payload when one is configured and the bare pattern otherwise;
    /// the semaphore transport carries nothing, so it gets the pattern too.
    pub fn for_config(config: &BenchmarkConfig, kind: TransportKind) -> Self {
        match kind {
            TransportKind::SysvSemaphore => Self::new(Self::PATTERN.len()),
            TransportKind::SharedBuffer if config.payload_size == 0 => {
                Self::new(Self::PATTERN.len())
            }
            _ => Self::new(config.message_len()),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

pub(crate) fn check_slot(slot: usize, slots: usize) -> Result<()> {
    if slot < slots {
        Ok(())
    } else {
        Err(BenchError::config(format!(
            "slot {} out of range ({} slots)",
            slot, slots
        )))
    }
}

pub(crate) fn check_len(len: usize, capacity: usize) -> Result<()> {
    if len <= capacity {
        Ok(())
    } else {
        Err(BenchError::PayloadTooLarge { max: capacity, got: len })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_pattern() {
        assert_eq!(Payload::new(0).as_bytes(), b"P");
        assert_eq!(Payload::new(6).as_bytes(), b"PingPi");
        assert_eq!(Payload::new(64).len(), 64);
    }

    #[test]
    fn test_payload_for_signal_transport_ignores_size() {
        let config = BenchmarkConfig::new(1, 1, 4096);
        assert_eq!(Payload::for_config(&config, TransportKind::SysvSemaphore).len(), 4);
        assert_eq!(Payload::for_config(&config, TransportKind::PosixQueue).len(), 4096);
        assert_eq!(Payload::for_config(&config, TransportKind::SharedBuffer).len(), 4096);

        let empty = BenchmarkConfig::new(1, 1, 0);
        assert_eq!(Payload::for_config(&empty, TransportKind::SharedBuffer).as_bytes(), b"Ping");
        assert_eq!(Payload::for_config(&empty, TransportKind::SysvQueue).len(), 1);
    }

    #[test]
    fn test_bounds_checks() {
        assert!(check_slot(0, 1).is_ok());
        assert!(check_slot(1, 1).is_err());
        assert!(check_len(8, 8).is_ok());
        assert!(check_len(9, 8).is_err());
    }
}
