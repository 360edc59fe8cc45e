//! Worker processes
//!
//! [`spawn_worker`] forks once. The parent gets a [`WorkerHandle`]; the child
//! runs the worker state machine and leaves through `_exit`, so none of the
//! parent's destructors run in it and it can never unlink a shared object.

use crate::error::{BenchError, Result};
use crate::signals;
use crate::transport::{Transport, WorkerChannel};
use crate::worker::{Worker, WorkerOptions, WorkerOutcome};
use log::{debug, error, warn};
use nix::errno::Errno;
use nix::sys::signal::{kill, raise, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, getpid, ForkResult, Pid};
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};

/// Exit status of a worker that completed every cycle
const EXIT_OK: i32 = 0;
/// Exit status of a worker that failed or was told to abort
const EXIT_FAILED: i32 = 1;

/// How a reaped worker ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitState {
    Exited(i32),
    Signaled(Signal),
}

impl ExitState {
    pub fn success(&self) -> bool {
        matches!(self, ExitState::Exited(EXIT_OK))
    }

    fn from_wait(status: WaitStatus) -> Option<Self> {
        match status {
            WaitStatus::Exited(_, code) => Some(ExitState::Exited(code)),
            WaitStatus::Signaled(_, signal, _) => Some(ExitState::Signaled(signal)),
            _ => None,
        }
    }
}

impl fmt::Display for ExitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitState::Exited(code) => write!(f, "exited with status {}", code),
            ExitState::Signaled(signal) => write!(f, "killed by {}", signal.as_str()),
        }
    }
}

/// Parent's view of one forked worker
#[derive(Debug)]
pub struct WorkerHandle {
    slot: usize,
    pid: Pid,
    status: Option<ExitState>,
}

impl WorkerHandle {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    /// Status if the worker has already been reaped
    pub fn status(&self) -> Option<ExitState> {
        self.status
    }

    /// Block until the worker exits
    pub fn join(&mut self) -> Result<ExitState> {
        loop {
            if let Some(status) = self.status {
                return Ok(status);
            }
            match waitpid(self.pid, None) {
                Ok(status) => self.status = ExitState::from_wait(status),
                Err(Errno::EINTR) => {}
                Err(e) => return Err(self.reap_error("wait for", e)),
            }
        }
    }

    /// Reap the worker if it has exited; `None` while it is still running
    pub fn try_status(&mut self) -> Result<Option<ExitState>> {
        if self.status.is_none() {
            match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(status) => self.status = ExitState::from_wait(status),
                Err(Errno::EINTR) => {}
                Err(e) => return Err(self.reap_error("poll", e)),
            }
        }
        Ok(self.status)
    }

    /// Send `SIGKILL`; a worker that is already gone is not an error
    pub fn kill(&self) -> Result<()> {
        if self.status.is_some() {
            return Ok(());
        }
        match kill(self.pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(self.reap_error("kill", e)),
        }
    }

    fn reap_error(&self, op: &'static str, errno: Errno) -> BenchError {
        BenchError::Reap {
            op,
            pid: self.pid(),
            source: io::Error::from(errno),
        }
    }
}

/// Fork a worker serving `channel` for `iterations` cycles.
///
/// Returns in the parent only. The worker and its receive buffer are built
/// before the fork so the child does not allocate. The child dies with the
/// calling process.
pub fn spawn_worker<W: WorkerChannel>(
    slot: usize,
    channel: W,
    capacity: usize,
    iterations: u64,
    options: WorkerOptions,
) -> Result<WorkerHandle> {
    let crash = options.crash;
    let mut worker = Worker::new(slot, channel, capacity, options);
    let coordinator = getpid();

    // SAFETY: the child only runs the worker loop on memory prepared above
    // and then calls `_exit`.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => {
            debug!("spawned worker {} (pid {})", slot, child);
            Ok(WorkerHandle {
                slot,
                pid: child,
                status: None,
            })
        }
        Ok(ForkResult::Child) => {
            if signals::detach_worker(coordinator).is_err() {
                unsafe { libc::_exit(EXIT_FAILED) }
            }
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| worker.run(iterations)));
            let code = match outcome {
                Ok(Ok(WorkerOutcome::Completed(_))) => EXIT_OK,
                Ok(Ok(WorkerOutcome::Aborted(done))) => {
                    debug!("worker {} aborting after {} cycles", slot, done);
                    if crash {
                        let _ = raise(Signal::SIGKILL);
                    }
                    EXIT_FAILED
                }
                Ok(Err(e)) => {
                    error!("worker {}: {}", slot, e);
                    EXIT_FAILED
                }
                Err(_) => EXIT_FAILED,
            };
            unsafe { libc::_exit(code) }
        }
        Err(e) => Err(BenchError::Spawn(io::Error::from(e))),
    }
}

/// Every worker of one run.
///
/// Dropping a fleet with workers still running kills and reaps them.
#[derive(Debug, Default)]
pub struct WorkerFleet {
    handles: Vec<WorkerHandle>,
}

impl WorkerFleet {
    /// Fork one worker per transport slot and bind each slot to its pid.
    ///
    /// On failure the workers already started are killed and reaped.
    pub fn spawn_all<T: Transport>(
        transport: &mut T,
        iterations: u64,
        options: impl Fn(usize) -> WorkerOptions,
    ) -> Result<Self> {
        let mut fleet = Self {
            handles: Vec::with_capacity(transport.slots()),
        };
        for slot in 0..transport.slots() {
            let handle = {
                let channel = transport.worker(slot)?;
                spawn_worker(slot, channel, transport.capacity(), iterations, options(slot))?
            };
            transport.bind(slot, handle.pid());
            fleet.handles.push(handle);
        }
        Ok(fleet)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn handles(&self) -> &[WorkerHandle] {
        &self.handles
    }

    /// Exit state of the worker in `slot` if it is no longer running
    pub fn liveness(&mut self, slot: usize) -> Result<Option<ExitState>> {
        match self.handles.get_mut(slot) {
            Some(handle) => handle.try_status(),
            None => Err(BenchError::config(format!("no worker in slot {}", slot))),
        }
    }

    /// Reap every worker; reports the first one that did not exit cleanly
    pub fn join_all(&mut self) -> Result<()> {
        let mut first_err = None;
        for handle in &mut self.handles {
            match handle.join() {
                Ok(status) if status.success() => {}
                Ok(status) => {
                    first_err.get_or_insert(BenchError::WorkerFailed {
                        slot: handle.slot,
                        pid: handle.pid(),
                        status: status.to_string(),
                    });
                }
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Kill and reap whatever is still running
    pub fn abort(&mut self) {
        for handle in &mut self.handles {
            if handle.status.is_some() {
                continue;
            }
            if let Err(e) = handle.kill() {
                warn!("{}", e);
            }
            match handle.join() {
                Ok(status) => debug!("worker {} {}", handle.slot, status),
                Err(e) => warn!("{}", e),
            }
        }
    }
}

impl Drop for WorkerFleet {
    fn drop(&mut self) {
        self.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BenchmarkConfig;
    use crate::transport::SysvSemaphoreTransport;
    use serial_test::serial;

    fn transport(ns: &str, workers: usize) -> SysvSemaphoreTransport {
        SysvSemaphoreTransport::create(&BenchmarkConfig::new(workers, 1, 0).with_namespace(ns))
            .unwrap()
    }

    #[test]
    fn test_exit_state_display() {
        assert_eq!(ExitState::Exited(0).to_string(), "exited with status 0");
        assert!(ExitState::Exited(0).success());
        assert!(!ExitState::Exited(1).success());
        assert_eq!(
            ExitState::Signaled(Signal::SIGKILL).to_string(),
            "killed by SIGKILL"
        );
    }

    #[test]
    #[serial]
    fn test_workers_complete_and_join() {
        let mut transport = transport("ipc_latency_test_proc_join", 2);
        let mut fleet = WorkerFleet::spawn_all(&mut transport, 10, |_| WorkerOptions::default()).unwrap();
        assert_eq!(fleet.len(), 2);

        let mut buf = [0u8; 1];
        for _ in 0..10 {
            for slot in 0..2 {
                transport.send(slot, b"P").unwrap();
            }
            for slot in 0..2 {
                transport.receive(slot, &mut buf, None).unwrap();
            }
        }

        fleet.join_all().unwrap();
        assert!(fleet
            .handles()
            .iter()
            .all(|h| h.status() == Some(ExitState::Exited(0))));
    }

    #[test]
    #[serial]
    fn test_aborting_worker_reports_failure() {
        let mut transport = transport("ipc_latency_test_proc_abort", 1);
        let mut fleet = WorkerFleet::spawn_all(&mut transport, 10, |_| {
            WorkerOptions::default().abort_after(0)
        })
        .unwrap();

        let err = fleet.join_all().unwrap_err();
        assert!(matches!(err, BenchError::WorkerFailed { slot: 0, .. }));
        assert_eq!(fleet.liveness(0).unwrap(), Some(ExitState::Exited(EXIT_FAILED)));
    }

    #[test]
    #[serial]
    fn test_crashing_worker_reports_signal() {
        let mut transport = transport("ipc_latency_test_proc_crash", 1);
        let mut fleet = WorkerFleet::spawn_all(&mut transport, 10, |_| {
            WorkerOptions::default().crash_after(0)
        })
        .unwrap();

        let err = fleet.join_all().unwrap_err();
        assert!(err.to_string().contains("killed by SIGKILL"), "{err}");
        assert_eq!(
            fleet.liveness(0).unwrap(),
            Some(ExitState::Signaled(Signal::SIGKILL))
        );
    }

    #[test]
    #[serial]
    fn test_drop_kills_blocked_workers() {
        let mut transport = transport("ipc_latency_test_proc_drop", 2);
        let fleet = WorkerFleet::spawn_all(&mut transport, 10, |_| WorkerOptions::default()).unwrap();
        let pids: Vec<i32> = fleet.handles().iter().map(|h| h.pid()).collect();
        drop(fleet);

        // Reaped children no longer exist.
        for pid in pids {
            assert_eq!(kill(Pid::from_raw(pid), None::<Signal>), Err(Errno::ESRCH));
        }
    }
}
