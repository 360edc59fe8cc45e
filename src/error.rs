//! Error types for the latency harness

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for harness operations
pub type Result<T> = std::result::Result<T, BenchError>;

/// Broad failure classes, used to pick the exit path and for reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad argument count or shape; nothing was created yet
    Configuration,
    /// A shared resource could not be created or sized
    ResourceCreation,
    /// A send/receive/wait/post failed mid-run
    Transport,
    /// No usable clock source
    TimerUnavailable,
    /// Worker processes could not be managed, or one exited abnormally
    Worker,
    /// The run was stopped by SIGINT or SIGTERM
    Interrupted,
}

/// Errors that can occur while setting up or running a benchmark
#[derive(Debug, Error)]
pub enum BenchError {
    /// Invalid benchmark configuration
    #[error("Invalid configuration: {reason}")]
    Config { reason: String },

    /// Failed to create a named kernel resource
    #[error("Failed to create {resource} '{name}' ({op}): {source}")]
    ResourceCreate {
        resource: &'static str,
        name: String,
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// Failed to remove a named kernel resource at teardown
    #[error("Failed to remove {resource} '{name}' ({op}): {source}")]
    ResourceRemove {
        resource: &'static str,
        name: String,
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// Resource came out smaller than the configured worker count requires
    #[error("{resource} '{name}' is undersized: need {required}, got {actual}")]
    Undersized {
        resource: &'static str,
        name: String,
        required: usize,
        actual: usize,
    },

    /// Payload does not fit the slot or queue message size
    #[error("Payload too large: max {max} bytes, got {got} bytes")]
    PayloadTooLarge { max: usize, got: usize },

    /// A channel operation failed
    #[error("{op} failed on slot {slot}: {source}")]
    Transport {
        op: &'static str,
        slot: usize,
        #[source]
        source: io::Error,
    },

    /// The worker serving a slot is gone
    #[error("Worker for slot {slot} (pid {pid}) exited mid-run: {status}")]
    PeerExited { slot: usize, pid: i32, status: String },

    /// Watchdog gave up waiting on a live worker
    #[error("Timed out after {waited:?} waiting on slot {slot}")]
    Timeout { slot: usize, waited: Duration },

    /// Neither the monotonic nor the realtime clock could be read
    #[error("No usable clock source: {0}")]
    TimerUnavailable(#[source] io::Error),

    /// fork() failed
    #[error("Failed to spawn worker: {0}")]
    Spawn(#[source] io::Error),

    /// waitpid() or kill() on a worker failed
    #[error("Failed to {op} worker (pid {pid}): {source}")]
    Reap {
        op: &'static str,
        pid: i32,
        #[source]
        source: io::Error,
    },

    /// sigaction() failed
    #[error("Failed to install {signal} handler: {source}")]
    SignalSetup {
        signal: &'static str,
        #[source]
        source: io::Error,
    },

    /// SIGINT or SIGTERM arrived mid-run
    #[error("Stopped by {signal}")]
    Stopped { signal: &'static str },

    /// A worker was reaped with a non-success status
    #[error("Worker for slot {slot} (pid {pid}) failed: {status}")]
    WorkerFailed { slot: usize, pid: i32, status: String },
}

impl BenchError {
    pub(crate) fn config(reason: impl Into<String>) -> Self {
        BenchError::Config {
            reason: reason.into(),
        }
    }

    pub(crate) fn transport(op: &'static str, slot: usize, source: io::Error) -> Self {
        BenchError::Transport { op, slot, source }
    }

    /// Category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            BenchError::Config { .. } | BenchError::PayloadTooLarge { .. } => {
                ErrorKind::Configuration
            }
            BenchError::ResourceCreate { .. }
            | BenchError::ResourceRemove { .. }
            | BenchError::Undersized { .. } => ErrorKind::ResourceCreation,
            BenchError::Transport { .. }
            | BenchError::PeerExited { .. }
            | BenchError::Timeout { .. } => ErrorKind::Transport,
            BenchError::TimerUnavailable(_) => ErrorKind::TimerUnavailable,
            BenchError::Spawn(_)
            | BenchError::Reap { .. }
            | BenchError::SignalSetup { .. }
            | BenchError::WorkerFailed { .. } => ErrorKind::Worker,
            BenchError::Stopped { .. } => ErrorKind::Interrupted,
        }
    }

    /// True when the underlying OS call returned `ETIMEDOUT`/`EAGAIN` from a timed wait
    pub(crate) fn is_timed_out(&self) -> bool {
        matches!(
            self,
            BenchError::Transport { source, .. }
                if source.kind() == io::ErrorKind::TimedOut
        )
    }

    /// True when a blocking wait was broken by a signal (`EINTR`)
    pub(crate) fn is_interrupted(&self) -> bool {
        matches!(
            self,
            BenchError::Transport { source, .. }
                if source.kind() == io::ErrorKind::Interrupted
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(BenchError::config("x").kind(), ErrorKind::Configuration);
        let err = BenchError::transport("sem_wait", 3, io::Error::from_raw_os_error(libc::EINVAL));
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(err.to_string().contains("sem_wait"));
        assert!(err.to_string().contains("slot 3"));
        let err = BenchError::PeerExited {
            slot: 0,
            pid: 42,
            status: "killed by SIGKILL".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[test]
    fn test_timed_out_detection() {
        let err = BenchError::transport(
            "sem_timedwait",
            0,
            io::Error::from(io::ErrorKind::TimedOut),
        );
        assert!(err.is_timed_out());
        let err = BenchError::transport("sem_wait", 0, io::Error::from_raw_os_error(libc::EIDRM));
        assert!(!err.is_timed_out());
        assert!(!err.is_interrupted());
        let err = BenchError::transport("sem_wait", 0, io::Error::from_raw_os_error(libc::EINTR));
        assert!(err.is_interrupted());
    }

    #[test]
    fn test_removal_failure_names_removal() {
        let err = BenchError::ResourceRemove {
            resource: "message queue",
            name: "/ns_up_0".into(),
            op: "mq_unlink",
            source: io::Error::from_raw_os_error(libc::EACCES),
        };
        let message = err.to_string();
        assert!(message.starts_with("Failed to remove message queue '/ns_up_0' (mq_unlink)"));
        assert!(!message.contains("create"));
        assert_eq!(err.kind(), ErrorKind::ResourceCreation);
        assert_eq!(BenchError::Stopped { signal: "SIGTERM" }.kind(), ErrorKind::Interrupted);
    }
}
