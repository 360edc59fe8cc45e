//! Worker state machine
//!
//! ```text
//! Idle -> AwaitingRequest -> Processing -> Replying -> AwaitingRequest -> ... -> Done
//! ```
//!
//! A worker blocks only while awaiting a request on its own slot. Any channel
//! failure ends the run for that worker; it never retries.

use crate::error::Result;
use crate::transport::{ReplyBody, WorkerChannel};
use log::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    AwaitingRequest,
    Processing,
    Replying,
    Done,
}

/// How a worker answers and, for fault injection, when it gives up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerOptions {
    pub reply: ReplyBody,
    /// Stop after this many completed cycles regardless of the iteration count
    pub abort_after: Option<u64>,
    /// When stopping early, die by `SIGKILL` instead of exiting
    pub crash: bool,
}

impl WorkerOptions {
    pub fn new(reply: ReplyBody) -> Self {
        Self {
            reply,
            abort_after: None,
            crash: false,
        }
    }

    /// Quit after `cycles` completed cycles with a failure status
    pub fn abort_after(mut self, cycles: u64) -> Self {
        self.abort_after = Some(cycles);
        self
    }

    /// Kill the worker process after `cycles` completed cycles
    pub fn crash_after(mut self, cycles: u64) -> Self {
        self.abort_after = Some(cycles);
        self.crash = true;
        self
    }
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self::new(ReplyBody::Echo)
    }
}

/// How a worker's run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// Every assigned cycle finished
    Completed(u64),
    /// Stopped early by [`WorkerOptions::abort_after`]
    Aborted(u64),
}

pub struct Worker<W: WorkerChannel> {
    slot: usize,
    channel: W,
    state: WorkerState,
    completed: u64,
    options: WorkerOptions,
    buf: Vec<u8>,
}

impl<W: WorkerChannel> Worker<W> {
    /// `capacity` sizes the receive buffer; it must be at least the
    /// transport's message capacity
    pub fn new(slot: usize, channel: W, capacity: usize, options: WorkerOptions) -> Self {
        Self {
            slot,
            channel,
            state: WorkerState::Idle,
            completed: 0,
            options,
            buf: vec![0; capacity.max(1)],
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Request/reply cycles finished so far
    pub fn completed(&self) -> u64 {
        self.completed
    }

    /// Serve `iterations` request/reply cycles
    pub fn run(&mut self, iterations: u64) -> Result<WorkerOutcome> {
        while self.completed < iterations {
            if self.options.abort_after == Some(self.completed) {
                self.state = WorkerState::Done;
                return Ok(WorkerOutcome::Aborted(self.completed));
            }
            self.cycle()?;
        }
        self.state = WorkerState::Done;
        trace!("worker {} done after {} cycles", self.slot, self.completed);
        Ok(WorkerOutcome::Completed(self.completed))
    }

    fn cycle(&mut self) -> Result<()> {
        self.state = WorkerState::AwaitingRequest;
        let n = self.channel.receive(&mut self.buf)?;

        self.state = WorkerState::Processing;
        let reply: &[u8] = match self.options.reply {
            ReplyBody::Echo => &self.buf[..n],
            ReplyBody::Fixed(body) => body,
        };

        self.state = WorkerState::Replying;
        self.channel.send(reply)?;
        self.completed += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BenchError;
    use std::collections::VecDeque;
    use std::io;

    /// Channel that replays canned requests and records replies
    struct Scripted {
        requests: VecDeque<Vec<u8>>,
        replies: Vec<Vec<u8>>,
    }

    impl Scripted {
        fn new(requests: &[&[u8]]) -> Self {
            Self {
                requests: requests.iter().map(|r| r.to_vec()).collect(),
                replies: Vec::new(),
            }
        }
    }

    impl WorkerChannel for Scripted {
        fn receive(&mut self, buf: &mut [u8]) -> Result<usize> {
            match self.requests.pop_front() {
                Some(req) => {
                    buf[..req.len()].copy_from_slice(&req);
                    Ok(req.len())
                }
                None => Err(BenchError::transport(
                    "receive",
                    0,
                    io::Error::from_raw_os_error(libc::EIDRM),
                )),
            }
        }

        fn send(&mut self, payload: &[u8]) -> Result<()> {
            self.replies.push(payload.to_vec());
            Ok(())
        }
    }

    #[test]
    fn test_echo_worker_completes_all_cycles() {
        let mut worker = Worker::new(0, Scripted::new(&[b"a", b"bb", b"ccc"]), 8, WorkerOptions::default());
        assert_eq!(worker.state(), WorkerState::Idle);
        assert_eq!(worker.run(3).unwrap(), WorkerOutcome::Completed(3));
        assert_eq!(worker.state(), WorkerState::Done);
        assert_eq!(worker.channel.replies, vec![b"a".to_vec(), b"bb".to_vec(), b"ccc".to_vec()]);
    }

    #[test]
    fn test_fixed_reply_body() {
        let options = WorkerOptions::new(ReplyBody::Fixed(b"Pong"));
        let mut worker = Worker::new(1, Scripted::new(&[b"Ping", b"Ping"]), 8, options);
        worker.run(2).unwrap();
        assert!(worker.channel.replies.iter().all(|r| r == b"Pong"));
    }

    #[test]
    fn test_channel_failure_is_fatal() {
        let mut worker = Worker::new(0, Scripted::new(&[b"x"]), 8, WorkerOptions::default());
        let err = worker.run(5).unwrap_err();
        assert!(matches!(err, BenchError::Transport { .. }));
        assert_eq!(worker.completed(), 1);
        assert_eq!(worker.state(), WorkerState::AwaitingRequest);
    }

    #[test]
    fn test_abort_after_stops_early() {
        let options = WorkerOptions::default().abort_after(2);
        let mut worker = Worker::new(0, Scripted::new(&[b"1", b"2", b"3"]), 8, options);
        assert_eq!(worker.run(3).unwrap(), WorkerOutcome::Aborted(2));
        assert_eq!(worker.channel.replies.len(), 2);

        let options = WorkerOptions::default().crash_after(1);
        assert!(options.crash);
        let mut worker = Worker::new(0, Scripted::new(&[b"1", b"2"]), 8, options);
        assert_eq!(worker.run(2).unwrap(), WorkerOutcome::Aborted(1));
    }
}
