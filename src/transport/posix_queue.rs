//! One POSIX message queue pair per worker slot

use super::{check_len, check_slot, Transport, WorkerChannel};
use crate::config::{BenchmarkConfig, TransportKind};
use crate::error::{BenchError, Result};
use crate::lifecycle::{QueueRole, ResourceNames};
use crate::sys::{retry_eintr, PosixQueue};
use std::time::Duration;

/// Messages a queue holds before `mq_send` blocks
pub const QUEUE_DEPTH: usize = 10;

struct QueuePair {
    down: PosixQueue,
    up: PosixQueue,
}

/// Coordinator side: owns `/<ns>_down_<slot>` and `/<ns>_up_<slot>` for every slot
pub struct PosixQueueTransport {
    pairs: Vec<QueuePair>,
    capacity: usize,
}

impl PosixQueueTransport {
    pub fn create(config: &BenchmarkConfig) -> Result<Self> {
        let names = ResourceNames::new(&config.namespace);
        let msgsize = config.message_len();
        let mut pairs = Vec::with_capacity(config.worker_count);

        // Queues created so far are closed and unlinked by their Drop if a
        // later one fails.
        for slot in 0..config.worker_count {
            let down = PosixQueue::create(
                &names.posix_queue(QueueRole::Down, slot),
                QUEUE_DEPTH,
                msgsize,
            )?;
            let up = PosixQueue::create(&names.posix_queue(QueueRole::Up, slot), QUEUE_DEPTH, msgsize)?;
            pairs.push(QueuePair { down, up });
        }

        let capacity = pairs
            .iter()
            .flat_map(|p| [p.down.msgsize(), p.up.msgsize()])
            .min()
            .unwrap_or(msgsize);

        Ok(Self { pairs, capacity })
    }

    fn receive_buffer_ok(queue: &PosixQueue, buf: &[u8], slot: usize) -> Result<()> {
        if buf.len() < queue.msgsize() {
            return Err(BenchError::config(format!(
                "receive buffer for slot {} is {} bytes, queue needs {}",
                slot,
                buf.len(),
                queue.msgsize()
            )));
        }
        Ok(())
    }
}

impl Transport for PosixQueueTransport {
    type Worker<'a> = PosixQueueWorker<'a>;

    fn kind(&self) -> TransportKind {
        TransportKind::PosixQueue
    }

    fn slots(&self) -> usize {
        self.pairs.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn worker(&self, slot: usize) -> Result<PosixQueueWorker<'_>> {
        check_slot(slot, self.pairs.len())?;
        let pair = &self.pairs[slot];
        Ok(PosixQueueWorker {
            down: &pair.down,
            up: &pair.up,
            slot,
        })
    }

    #[inline]
    fn send(&self, slot: usize, payload: &[u8]) -> Result<()> {
        check_slot(slot, self.pairs.len())?;
        check_len(payload.len(), self.capacity)?;
        self.pairs[slot]
            .down
            .send(payload)
            .map_err(|e| BenchError::transport("mq_send", slot, e))
    }

    #[inline]
    fn receive(&self, slot: usize, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        check_slot(slot, self.pairs.len())?;
        let up = &self.pairs[slot].up;
        Self::receive_buffer_ok(up, buf, slot)?;
        match timeout {
            None => up
                .receive(buf)
                .map_err(|e| BenchError::transport("mq_receive", slot, e)),
            Some(timeout) => up
                .receive_timeout(buf, timeout)
                .map_err(|e| BenchError::transport("mq_timedreceive", slot, e)),
        }
    }

    fn teardown(&mut self) -> Result<()> {
        let mut first_err = None;
        for pair in &mut self.pairs {
            for queue in [&mut pair.down, &mut pair.up] {
                if let Err(e) = queue.remove() {
                    first_err.get_or_insert(e);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// Worker side of one queue pair
pub struct PosixQueueWorker<'a> {
    down: &'a PosixQueue,
    up: &'a PosixQueue,
    slot: usize,
}

impl WorkerChannel for PosixQueueWorker<'_> {
    #[inline]
    fn receive(&mut self, buf: &mut [u8]) -> Result<usize> {
        PosixQueueTransport::receive_buffer_ok(self.down, buf, self.slot)?;
        retry_eintr(|| self.down.receive(buf))
            .map_err(|e| BenchError::transport("mq_receive", self.slot, e))
    }

    #[inline]
    fn send(&mut self, payload: &[u8]) -> Result<()> {
        self.up
            .send(payload)
            .map_err(|e| BenchError::transport("mq_send", self.slot, e))
    }
}
