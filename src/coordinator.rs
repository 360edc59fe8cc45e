//! Fan-out/fan-in driver
//!
//! Each iteration sends to every slot, then receives from every slot, both
//! in slot order. The timing window opens just before the first send and
//! closes right after the last receive. The reported figure is one-way
//! latency: elapsed time over `iterations * 2` hops.
//!
//! Teardown order on every path: workers are reaped (or killed and reaped)
//! first, then the transport removes its kernel objects.
//!
//! Under the default blocking wait policy a worker's death still ends the
//! run: the `SIGCHLD` it raises breaks the coordinator's wait, and the slot's
//! worker is checked before every later wait once any child has exited.

use crate::clock::{Clock, TimingWindow};
use crate::config::{BenchmarkConfig, TransportKind, WaitPolicy};
use crate::error::{BenchError, Result};
use crate::process::WorkerFleet;
use crate::signals::{check_stop, ChildExitWatch};
use crate::transport::{
    Payload, PosixQueueTransport, SharedBufferTransport, SysvQueueTransport,
    SysvSemaphoreTransport, Transport,
};
use crate::worker::WorkerOptions;
use log::{debug, info, warn};
use std::time::{Duration, Instant};

/// Outcome of one completed run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BenchmarkReport {
    pub kind: TransportKind,
    pub worker_count: usize,
    pub iteration_count: u64,
    /// Bytes actually carried per message
    pub message_size: usize,
    pub window: TimingWindow,
    pub sends: u64,
    pub receives: u64,
}

impl BenchmarkReport {
    pub fn elapsed_ns(&self) -> u64 {
        self.window.elapsed_ns()
    }

    /// Average one-way latency in nanoseconds
    pub fn average_latency_ns(&self) -> u64 {
        self.elapsed_ns() / (self.iteration_count * 2)
    }
}

/// Early exit planted in one worker
#[derive(Debug, Clone, Copy)]
struct Fault {
    slot: usize,
    cycles: u64,
    crash: bool,
}

/// Owns one transport for the length of one run
pub struct Coordinator<T: Transport> {
    transport: T,
    config: BenchmarkConfig,
    clock: Clock,
    fault: Option<Fault>,
}

impl<T: Transport> Coordinator<T> {
    pub fn new(transport: T, config: BenchmarkConfig, clock: Clock) -> Self {
        Self {
            transport,
            config,
            clock,
            fault: None,
        }
    }

    /// Make the worker in `slot` exit with a failure after `cycles` completed cycles
    pub fn inject_abort(mut self, slot: usize, cycles: u64) -> Self {
        self.fault = Some(Fault {
            slot,
            cycles,
            crash: false,
        });
        self
    }

    /// Make the worker in `slot` die by `SIGKILL` after `cycles` completed cycles
    pub fn inject_crash(mut self, slot: usize, cycles: u64) -> Self {
        self.fault = Some(Fault {
            slot,
            cycles,
            crash: true,
        });
        self
    }

    /// Run the benchmark and tear the transport down, whatever the outcome
    pub fn run(mut self) -> Result<BenchmarkReport> {
        let result = self.drive();
        let teardown = self.transport.teardown();
        match (result, teardown) {
            (Ok(report), Ok(())) => Ok(report),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(teardown)) => {
                warn!("teardown after failed run also failed: {}", teardown);
                Err(e)
            }
        }
    }

    fn drive(&mut self) -> Result<BenchmarkReport> {
        let iterations = self.config.iteration_count;
        let kind = self.transport.kind();
        let payload = Payload::for_config(&self.config, kind);
        let reply = self.transport.reply_body();
        let fault = self.fault;

        // Declared before the fleet so the handler outlives the final reap.
        let children = ChildExitWatch::install()?;
        let mut fleet = WorkerFleet::spawn_all(&mut self.transport, iterations, |slot| {
            let options = WorkerOptions::new(reply);
            match fault {
                Some(f) if f.slot == slot && f.crash => options.crash_after(f.cycles),
                Some(f) if f.slot == slot => options.abort_after(f.cycles),
                _ => options,
            }
        })?;
        debug!("{} workers up on {}", fleet.len(), kind);

        let mut buf = vec![0u8; self.transport.capacity().max(1)];
        let window = self.clock.open_window();
        // The fleet drops on early return, killing and reaping the workers.
        let (sends, receives) = self.rounds(&mut fleet, &children, payload.as_bytes(), &mut buf)?;
        let window = window.close();

        fleet.join_all()?;

        let report = BenchmarkReport {
            kind,
            worker_count: self.config.worker_count,
            iteration_count: iterations,
            message_size: payload.len(),
            window,
            sends,
            receives,
        };
        info!(
            "{} round trips across {} workers in {} ns",
            iterations,
            report.worker_count,
            report.elapsed_ns()
        );
        Ok(report)
    }

    #[inline]
    fn rounds(
        &self,
        fleet: &mut WorkerFleet,
        children: &ChildExitWatch,
        payload: &[u8],
        buf: &mut [u8],
    ) -> Result<(u64, u64)> {
        let slots = self.transport.slots();
        let mut sends = 0u64;
        let mut receives = 0u64;

        for _ in 0..self.config.iteration_count {
            for slot in 0..slots {
                self.transport.send(slot, payload)?;
                sends += 1;
            }
            for slot in 0..slots {
                match self.config.wait {
                    WaitPolicy::Blocking => self.await_blocking(fleet, children, slot, buf)?,
                    WaitPolicy::Watchdog { poll, limit } => {
                        self.await_watched(fleet, slot, buf, poll, limit)?
                    }
                }
                receives += 1;
            }
        }
        Ok((sends, receives))
    }

    #[inline]
    fn await_blocking(
        &self,
        fleet: &mut WorkerFleet,
        children: &ChildExitWatch,
        slot: usize,
        buf: &mut [u8],
    ) -> Result<()> {
        loop {
            check_stop()?;
            // A worker that died before this wait began has no signal left
            // to break it.
            if children.fired() && self.drain_if_exited(fleet, slot, buf)? {
                return Ok(());
            }
            match self.transport.receive(slot, buf, None) {
                Ok(_) => return Ok(()),
                Err(e) if e.is_interrupted() => debug!("wait on slot {} interrupted", slot),
                Err(e) => return Err(e),
            }
        }
    }

    fn await_watched(
        &self,
        fleet: &mut WorkerFleet,
        slot: usize,
        buf: &mut [u8],
        poll: Duration,
        limit: Duration,
    ) -> Result<()> {
        let started = Instant::now();
        loop {
            check_stop()?;
            match self.transport.receive(slot, buf, Some(poll)) {
                Ok(_) => return Ok(()),
                Err(e) if e.is_timed_out() => {}
                Err(e) => return Err(e),
            }

            if self.drain_if_exited(fleet, slot, buf)? {
                return Ok(());
            }

            let waited = started.elapsed();
            if waited >= limit {
                return Err(BenchError::Timeout { slot, waited });
            }
        }
    }

    /// Check on the worker in `slot` after a wait came back without a reply.
    ///
    /// `Ok(false)` while it is still running. Once it has exited, its last
    /// reply is taken if one is still queued (`Ok(true)`); otherwise the run
    /// fails with `PeerExited`.
    fn drain_if_exited(&self, fleet: &mut WorkerFleet, slot: usize, buf: &mut [u8]) -> Result<bool> {
        let Some(status) = fleet.liveness(slot)? else {
            return Ok(false);
        };
        match self.transport.receive(slot, buf, Some(Duration::ZERO)) {
            Ok(_) => return Ok(true),
            Err(e) if e.is_timed_out() => {}
            Err(e) => return Err(e),
        }
        Err(BenchError::PeerExited {
            slot,
            pid: fleet.handles()[slot].pid(),
            status: status.to_string(),
        })
    }
}

/// Validate `config`, select the clock, create the transport for `kind` and run.
///
/// Nothing is created when validation or no clock is available.
pub fn run_benchmark(kind: TransportKind, config: &BenchmarkConfig) -> Result<BenchmarkReport> {
    config.validate()?;
    let clock = Clock::select()?;
    info!(
        "{} benchmark: {} workers, {} iterations, namespace '{}'",
        kind, config.worker_count, config.iteration_count, config.namespace
    );

    match kind {
        TransportKind::PosixQueue => {
            Coordinator::new(PosixQueueTransport::create(config)?, config.clone(), clock).run()
        }
        TransportKind::SysvQueue => {
            Coordinator::new(SysvQueueTransport::create(config)?, config.clone(), clock).run()
        }
        TransportKind::SharedBuffer => {
            Coordinator::new(SharedBufferTransport::create(config)?, config.clone(), clock).run()
        }
        TransportKind::SysvSemaphore => {
            Coordinator::new(SysvSemaphoreTransport::create(config)?, config.clone(), clock).run()
        }
    }
}
