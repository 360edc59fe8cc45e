//! Signal handling around a run
//!
//! The coordinator spends a run blocked in untimed kernel waits. The
//! handlers here are installed without `SA_RESTART`, so a signal ends such a
//! wait with `EINTR` and the coordinator gets to look at why: a worker exited
//! (`SIGCHLD`) or someone asked the run to stop (`SIGINT`, `SIGTERM`).
//!
//! A process-directed signal may land on any thread. While a run is active
//! the handlers forward it to the thread driving the run, so that thread's
//! wait is the one that breaks. Handlers only touch atomics and forward with
//! `pthread_kill`.

use crate::error::{BenchError, Result};
use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::prctl;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::{getppid, Pid};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};

/// Signals that end a run early
const STOP_SIGNALS: [Signal; 2] = [Signal::SIGINT, Signal::SIGTERM];

static CHILD_EXITED: AtomicBool = AtomicBool::new(false);
static STOP_SIGNAL: AtomicI32 = AtomicI32::new(0);
/// `pthread_t` of the thread driving a run; 0 when no run is active
static WATCHER: AtomicUsize = AtomicUsize::new(0);

fn forward_to_watcher(signal: libc::c_int) {
    let watcher = WATCHER.load(Ordering::SeqCst);
    if watcher != 0 && unsafe { libc::pthread_self() } as usize != watcher {
        unsafe {
            libc::pthread_kill(watcher as libc::pthread_t, signal);
        }
    }
}

extern "C" fn note_child_exit(signal: libc::c_int) {
    CHILD_EXITED.store(true, Ordering::SeqCst);
    forward_to_watcher(signal);
}

extern "C" fn note_stop(signal: libc::c_int) {
    STOP_SIGNAL.store(signal, Ordering::SeqCst);
    forward_to_watcher(signal);
}

fn set_action(signal: Signal, action: &SigAction) -> Result<SigAction> {
    // SAFETY: the handlers above are async-signal-safe.
    unsafe { sigaction(signal, action) }.map_err(|errno| BenchError::SignalSetup {
        signal: signal.as_str(),
        source: io::Error::from(errno),
    })
}

fn interrupting(handler: extern "C" fn(libc::c_int), flags: SaFlags) -> SigAction {
    SigAction::new(SigHandler::Handler(handler), flags, SigSet::empty())
}

/// Turn SIGINT and SIGTERM into a stop request.
///
/// A run in progress notices the request at its next wait. It kills and
/// reaps its workers, removes its kernel objects and fails with
/// [`BenchError::Stopped`]. Any earlier request is forgotten.
pub fn install_stop_handlers() -> Result<()> {
    STOP_SIGNAL.store(0, Ordering::SeqCst);
    let action = interrupting(note_stop, SaFlags::empty());
    for signal in STOP_SIGNALS {
        set_action(signal, &action)?;
    }
    debug!("SIGINT and SIGTERM now stop the run");
    Ok(())
}

/// The stop signal received since [`install_stop_handlers`], if any
pub fn stop_requested() -> Option<Signal> {
    match STOP_SIGNAL.load(Ordering::SeqCst) {
        0 => None,
        raw => Signal::try_from(raw).ok(),
    }
}

#[inline]
pub(crate) fn check_stop() -> Result<()> {
    match stop_requested() {
        Some(signal) => Err(BenchError::Stopped {
            signal: signal.as_str(),
        }),
        None => Ok(()),
    }
}

/// `SIGCHLD` handler for the length of one run.
///
/// Installing it makes the calling thread the one signals are forwarded
/// to. Dropping it puts the previous disposition back. One run per process
/// at a time.
pub(crate) struct ChildExitWatch {
    previous: SigAction,
}

impl ChildExitWatch {
    pub fn install() -> Result<Self> {
        CHILD_EXITED.store(false, Ordering::SeqCst);
        let previous = set_action(
            Signal::SIGCHLD,
            &interrupting(note_child_exit, SaFlags::SA_NOCLDSTOP),
        )?;
        WATCHER.store(unsafe { libc::pthread_self() } as usize, Ordering::SeqCst);
        Ok(Self { previous })
    }

    /// Whether any child exited since the watch was installed
    #[inline]
    pub fn fired(&self) -> bool {
        CHILD_EXITED.load(Ordering::SeqCst)
    }
}

impl Drop for ChildExitWatch {
    fn drop(&mut self) {
        WATCHER.store(0, Ordering::SeqCst);
        if let Err(e) = set_action(Signal::SIGCHLD, &self.previous) {
            warn!("{}", e);
        }
    }
}

/// Worker-side setup, run in the child right after fork.
///
/// Puts the signals the coordinator handles back to their defaults and has
/// the kernel kill the worker when the coordinator dies. Fails with `ESRCH`
/// when the coordinator is already gone. Does not allocate.
pub(crate) fn detach_worker(coordinator: Pid) -> nix::Result<()> {
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for signal in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGCHLD] {
        unsafe { sigaction(signal, &default) }?;
    }
    prctl::set_pdeathsig(Signal::SIGKILL)?;
    // The coordinator may have died before the death signal was armed.
    if getppid() != coordinator {
        return Err(Errno::ESRCH);
    }
    Ok(())
}

/// Undo [`install_stop_handlers`] so later tests in the same process see
/// default dispositions.
#[cfg(test)]
pub(crate) fn reset_stop_handlers() {
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for signal in STOP_SIGNALS {
        let _ = set_action(signal, &default);
    }
    STOP_SIGNAL.store(0, Ordering::SeqCst);
}
