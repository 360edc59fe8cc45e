//! Benchmark configuration

use crate::error::{BenchError, Result};
use std::fmt;
use std::time::Duration;

/// Prefix for every named resource unless overridden
pub const DEFAULT_NAMESPACE: &str = "ipc_latency";

/// POSIX names are limited to NAME_MAX; leave room for `/` and role suffixes
pub const MAX_NAMESPACE_LEN: usize = 200;

/// Which channel implementation carries the round trips
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// POSIX message queue pair per worker
    PosixQueue,
    /// Shared System V queue pair, replies routed by worker pid
    SysvQueue,
    /// POSIX shared memory slots gated by process-shared semaphores
    SharedBuffer,
    /// System V semaphore set used as a pure token pass
    SysvSemaphore,
}

impl TransportKind {
    /// Whether `payload_size` is meaningful for this transport
    pub fn carries_payload(self) -> bool {
        matches!(self, TransportKind::PosixQueue | TransportKind::SysvQueue)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportKind::PosixQueue => "posix message queue",
            TransportKind::SysvQueue => "System V message queue",
            TransportKind::SharedBuffer => "POSIX shared memory",
            TransportKind::SysvSemaphore => "System V semaphore",
        })
    }
}

/// How the coordinator waits for a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitPolicy {
    /// Block until the reply arrives, however long that takes
    #[default]
    Blocking,
    /// Wait in `poll` slices; check worker liveness after each slice and
    /// give up after `limit`
    Watchdog { poll: Duration, limit: Duration },
}

/// Immutable description of one benchmark run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BenchmarkConfig {
    /// Number of worker processes, at least 1
    pub worker_count: usize,
    /// Fan-out/fan-in rounds, at least 1
    pub iteration_count: u64,
    /// Bytes per message; ignored by pure-signal transports
    pub payload_size: usize,
    /// Prefix of every named kernel resource this run creates
    pub namespace: String,
    pub wait: WaitPolicy,
}

impl BenchmarkConfig {
    pub fn new(worker_count: usize, iteration_count: u64, payload_size: usize) -> Self {
        Self {
            worker_count,
            iteration_count,
            payload_size,
            namespace: DEFAULT_NAMESPACE.to_string(),
            wait: WaitPolicy::default(),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_wait_policy(mut self, wait: WaitPolicy) -> Self {
        self.wait = wait;
        self
    }

    /// Payload length actually sent; queues cannot carry zero-byte messages
    pub fn message_len(&self) -> usize {
        self.payload_size.max(1)
    }

    /// Check the configuration before any resource is touched
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(BenchError::config("worker count must be at least 1"));
        }
        if self.iteration_count == 0 {
            return Err(BenchError::config("iteration count must be at least 1"));
        }
        if self
            .iteration_count
            .checked_mul(self.worker_count as u64)
            .and_then(|n| n.checked_mul(2))
            .is_none()
        {
            return Err(BenchError::config("iteration count times worker count overflows"));
        }
        if self.namespace.is_empty() {
            return Err(BenchError::config("namespace must not be empty"));
        }
        if self.namespace.len() > MAX_NAMESPACE_LEN {
            return Err(BenchError::config(format!(
                "namespace too long: max {} chars, got {}",
                MAX_NAMESPACE_LEN,
                self.namespace.len()
            )));
        }
        if self.namespace.contains('/') || self.namespace.contains('\0') {
            return Err(BenchError::config("namespace must not contain '/' or NUL"));
        }
        if let WaitPolicy::Watchdog { poll, limit } = self.wait {
            if poll.is_zero() || limit < poll {
                return Err(BenchError::config(
                    "watchdog poll must be non-zero and not exceed the reply timeout",
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BenchmarkConfig::new(1, 1000, 64);
        assert_eq!(config.namespace, DEFAULT_NAMESPACE);
        assert_eq!(config.wait, WaitPolicy::Blocking);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_counts() {
        assert!(BenchmarkConfig::new(0, 10, 1).validate().is_err());
        assert!(BenchmarkConfig::new(2, 0, 1).validate().is_err());
    }

    #[test]
    fn test_rejects_bad_namespace() {
        let config = BenchmarkConfig::new(1, 1, 1).with_namespace("a/b");
        assert!(config.validate().is_err());
        let config = BenchmarkConfig::new(1, 1, 1).with_namespace("");
        assert!(config.validate().is_err());
        let config = BenchmarkConfig::new(1, 1, 1).with_namespace("x".repeat(MAX_NAMESPACE_LEN + 1));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_watchdog_bounds() {
        let bad = BenchmarkConfig::new(1, 1, 1).with_wait_policy(WaitPolicy::Watchdog {
            poll: Duration::from_millis(100),
            limit: Duration::from_millis(10),
        });
        assert!(bad.validate().is_err());
        let good = BenchmarkConfig::new(1, 1, 1).with_wait_policy(WaitPolicy::Watchdog {
            poll: Duration::from_millis(10),
            limit: Duration::from_secs(1),
        });
        assert!(good.validate().is_ok());
    }

    #[test]
    fn test_message_len_never_zero() {
        assert_eq!(BenchmarkConfig::new(1, 1, 0).message_len(), 1);
        assert_eq!(BenchmarkConfig::new(1, 1, 64).message_len(), 64);
    }
}
