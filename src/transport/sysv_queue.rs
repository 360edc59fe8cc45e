//! A shared System V queue pair with messages routed by worker pid
//!
//! Every worker reads the same down queue and writes the same up queue.
//! The message type is the worker's pid in both directions, so each worker
//! only pulls its own requests and the coordinator can pick one worker's
//! reply out of the shared up queue.
//!
//! Both queues are sized at creation to hold one full message per worker.
//! A queue that is too small would stall on a worker whose reply the
//! coordinator is not reading yet, so that is a setup error, not a hang.

use super::{check_len, check_slot, Transport, WorkerChannel};
use crate::config::{BenchmarkConfig, TransportKind};
use crate::error::{BenchError, Result};
use crate::lifecycle::ResourceNames;
use crate::sys::sysv_msg::max_message_len;
use crate::sys::{retry_eintr, MessageBuf, MessageQueue};
use nix::unistd::getpid;
use std::cell::RefCell;
use std::time::Duration;

/// Coordinator side of the shared queue pair
pub struct SysvQueueTransport {
    down: MessageQueue,
    up: MessageQueue,
    /// Pid serving each slot, learned after spawn
    routes: Vec<Option<i32>>,
    outgoing: RefCell<MessageBuf>,
    incoming: RefCell<MessageBuf>,
    capacity: usize,
}

impl SysvQueueTransport {
    pub fn create(config: &BenchmarkConfig) -> Result<Self> {
        let names = ResourceNames::new(&config.namespace);
        let capacity = config.message_len();
        let msgmax = max_message_len();
        if capacity > msgmax {
            return Err(BenchError::Undersized {
                resource: "message queue",
                name: names.sysv_label("down"),
                required: capacity,
                actual: msgmax,
            });
        }

        // Up to one request per worker sits in the down queue, and one
        // reply per worker in the up queue.
        let in_flight = capacity.saturating_mul(config.worker_count);
        let down = MessageQueue::create(&names.sysv_label("down"), names.sysv_key("down"))?;
        down.reserve(in_flight)?;
        let up = MessageQueue::create(&names.sysv_label("up"), names.sysv_key("up"))?;
        up.reserve(in_flight)?;

        Ok(Self {
            down,
            up,
            routes: vec![None; config.worker_count],
            outgoing: RefCell::new(MessageBuf::new(capacity)),
            incoming: RefCell::new(MessageBuf::new(capacity)),
            capacity,
        })
    }

    fn route(&self, slot: usize) -> Result<libc::c_long> {
        check_slot(slot, self.routes.len())?;
        self.routes[slot]
            .map(libc::c_long::from)
            .ok_or_else(|| BenchError::config(format!("slot {} has no worker bound", slot)))
    }
}

impl Transport for SysvQueueTransport {
    type Worker<'a> = SysvQueueWorker<'a>;

    fn kind(&self) -> TransportKind {
        TransportKind::SysvQueue
    }

    fn slots(&self) -> usize {
        self.routes.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn worker(&self, slot: usize) -> Result<SysvQueueWorker<'_>> {
        check_slot(slot, self.routes.len())?;
        Ok(SysvQueueWorker {
            down: &self.down,
            up: &self.up,
            slot,
            pid: None,
            buf: MessageBuf::new(self.capacity),
        })
    }

    fn bind(&mut self, slot: usize, pid: i32) {
        if let Some(route) = self.routes.get_mut(slot) {
            *route = Some(pid);
        }
    }

    #[inline]
    fn send(&self, slot: usize, payload: &[u8]) -> Result<()> {
        let mtype = self.route(slot)?;
        check_len(payload.len(), self.capacity)?;
        let mut out = self.outgoing.borrow_mut();
        out.set_mtype(mtype);
        out.text_mut()[..payload.len()].copy_from_slice(payload);
        self.down
            .send(&out, payload.len())
            .map_err(|e| BenchError::transport("msgsnd", slot, e))
    }

    #[inline]
    fn receive(&self, slot: usize, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        let mtype = self.route(slot)?;
        let mut input = self.incoming.borrow_mut();
        let n = match timeout {
            None => self.up.receive(&mut input, mtype),
            Some(timeout) => self.up.receive_timeout(&mut input, mtype, timeout),
        }
        .map_err(|e| BenchError::transport("msgrcv", slot, e))?;
        let copy = n.min(buf.len());
        buf[..copy].copy_from_slice(&input.text()[..copy]);
        Ok(copy)
    }

    fn teardown(&mut self) -> Result<()> {
        let down = self.down.remove();
        let up = self.up.remove();
        down.and(up)
    }
}

/// Worker side: the shared queues plus the worker's own pid as routing tag
pub struct SysvQueueWorker<'a> {
    down: &'a MessageQueue,
    up: &'a MessageQueue,
    slot: usize,
    /// Read in the child on first use; the parent's pid is wrong here
    pid: Option<libc::c_long>,
    buf: MessageBuf,
}

impl SysvQueueWorker<'_> {
    fn mtype(&mut self) -> libc::c_long {
        *self
            .pid
            .get_or_insert_with(|| libc::c_long::from(getpid().as_raw()))
    }
}

impl WorkerChannel for SysvQueueWorker<'_> {
    #[inline]
    fn receive(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mtype = self.mtype();
        let n = retry_eintr(|| self.down.receive(&mut self.buf, mtype))
            .map_err(|e| BenchError::transport("msgrcv", self.slot, e))?;
        let copy = n.min(buf.len());
        buf[..copy].copy_from_slice(&self.buf.text()[..copy]);
        Ok(copy)
    }

    #[inline]
    fn send(&mut self, payload: &[u8]) -> Result<()> {
        check_len(payload.len(), self.buf.capacity())?;
        let mtype = self.mtype();
        self.buf.set_mtype(mtype);
        self.buf.text_mut()[..payload.len()].copy_from_slice(payload);
        self.up
            .send(&self.buf, payload.len())
            .map_err(|e| BenchError::transport("msgsnd", self.slot, e))
    }
}
