//! Pure token passing over one System V semaphore set
//!
//! Semaphore `j` signals "go" to worker `j`; semaphore `N + j` signals
//! "done" back to the coordinator. No bytes move; a round trip is one post
//! and one wait in each direction.

use super::{check_slot, Transport, WorkerChannel};
use crate::config::{BenchmarkConfig, TransportKind};
use crate::error::{BenchError, Result};
use crate::lifecycle::ResourceNames;
use crate::sys::{retry_eintr, SemaphoreControlReply, SemaphoreControlRequest, SemaphoreSet};
use std::time::Duration;

/// Coordinator side: owns the set of `2 * N` semaphores
pub struct SysvSemaphoreTransport {
    set: SemaphoreSet,
    workers: usize,
}

impl SysvSemaphoreTransport {
    pub fn create(config: &BenchmarkConfig) -> Result<Self> {
        let names = ResourceNames::new(&config.namespace);
        let label = names.sysv_label("sem");
        let required = config
            .worker_count
            .checked_mul(2)
            .filter(|n| *n <= u16::MAX as usize)
            .ok_or_else(|| BenchError::config("too many workers for one semaphore set"))?;

        let set = SemaphoreSet::create(&label, names.sysv_key("sem"), required)?;

        let creation = |op: &'static str| {
            let label = label.clone();
            move |source: std::io::Error| BenchError::ResourceCreate {
                resource: "semaphore set",
                name: label,
                op,
                source,
            }
        };

        let zeros = vec![0u16; required];
        set.control(SemaphoreControlRequest::SetAll(&zeros))
            .map_err(creation("semctl(SETALL)"))?;

        let actual = match set
            .control(SemaphoreControlRequest::Stat)
            .map_err(creation("semctl(IPC_STAT)"))?
        {
            SemaphoreControlReply::Stat { nsems } => nsems,
            _ => 0,
        };
        if actual < required {
            return Err(BenchError::Undersized {
                resource: "semaphore set",
                name: label,
                required,
                actual,
            });
        }

        Ok(Self {
            set,
            workers: config.worker_count,
        })
    }

    pub fn set(&self) -> &SemaphoreSet {
        &self.set
    }

    fn go(&self, slot: usize) -> u16 {
        slot as u16
    }

    fn done(&self, slot: usize) -> u16 {
        (self.workers + slot) as u16
    }
}

impl Transport for SysvSemaphoreTransport {
    type Worker<'a> = SemaphoreWorker<'a>;

    fn kind(&self) -> TransportKind {
        TransportKind::SysvSemaphore
    }

    fn slots(&self) -> usize {
        self.workers
    }

    /// Nothing is carried; receive buffers are never written
    fn capacity(&self) -> usize {
        0
    }

    fn worker(&self, slot: usize) -> Result<SemaphoreWorker<'_>> {
        check_slot(slot, self.workers)?;
        Ok(SemaphoreWorker {
            set: &self.set,
            go: self.go(slot),
            done: self.done(slot),
            slot,
        })
    }

    #[inline]
    fn send(&self, slot: usize, _payload: &[u8]) -> Result<()> {
        check_slot(slot, self.workers)?;
        self.set
            .post(self.go(slot))
            .map_err(|e| BenchError::transport("semop(go)", slot, e))
    }

    #[inline]
    fn receive(&self, slot: usize, _buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        check_slot(slot, self.workers)?;
        self.set
            .wait(self.done(slot), timeout)
            .map_err(|e| BenchError::transport("semop(done)", slot, e))?;
        Ok(0)
    }

    fn teardown(&mut self) -> Result<()> {
        self.set.remove()
    }
}

/// Worker side: its go/done pair inside the shared set
pub struct SemaphoreWorker<'a> {
    set: &'a SemaphoreSet,
    go: u16,
    done: u16,
    slot: usize,
}

impl WorkerChannel for SemaphoreWorker<'_> {
    #[inline]
    fn receive(&mut self, _buf: &mut [u8]) -> Result<usize> {
        retry_eintr(|| self.set.wait(self.go, None))
            .map_err(|e| BenchError::transport("semop(go)", self.slot, e))?;
        Ok(0)
    }

    #[inline]
    fn send(&mut self, _payload: &[u8]) -> Result<()> {
        self.set
            .post(self.done)
            .map_err(|e| BenchError::transport("semop(done)", self.slot, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const REPLY_WAIT: Duration = Duration::from_secs(10);

    fn config(ns: &str, workers: usize) -> BenchmarkConfig {
        BenchmarkConfig::new(workers, 1, 0).with_namespace(ns)
    }

    #[test]
    fn test_set_holds_two_per_worker_all_zero() {
        let transport =
            SysvSemaphoreTransport::create(&config("ipc_latency_test_sem_size", 3)).unwrap();
        assert_eq!(transport.set().len(), 6);
        assert_eq!(
            transport.set().control(SemaphoreControlRequest::GetAll).unwrap(),
            SemaphoreControlReply::Values(vec![0; 6])
        );
        assert_eq!(transport.done(2), 5);
    }

    #[test]
    fn test_send_posts_only_the_slot_go_semaphore() {
        let transport =
            SysvSemaphoreTransport::create(&config("ipc_latency_test_sem_go", 2)).unwrap();
        transport.send(1, &[]).unwrap();
        assert_eq!(
            transport.set().control(SemaphoreControlRequest::GetAll).unwrap(),
            SemaphoreControlReply::Values(vec![0, 1, 0, 0])
        );
    }

    #[test]
    fn test_token_round_trips() {
        let transport =
            SysvSemaphoreTransport::create(&config("ipc_latency_test_sem_round", 2)).unwrap();
        let w0 = transport.worker(0).unwrap();
        let w1 = transport.worker(1).unwrap();

        thread::scope(|s| {
            for mut w in [w0, w1] {
                s.spawn(move || {
                    for _ in 0..50 {
                        w.receive(&mut []).unwrap();
                        w.send(&[]).unwrap();
                    }
                });
            }

            for _ in 0..50 {
                for slot in 0..2 {
                    transport.send(slot, &[]).unwrap();
                }
                for slot in 0..2 {
                    assert_eq!(transport.receive(slot, &mut [], Some(REPLY_WAIT)).unwrap(), 0);
                }
            }
        });
    }

    #[test]
    fn test_timed_wait_expires() {
        let transport =
            SysvSemaphoreTransport::create(&config("ipc_latency_test_sem_timeout", 1)).unwrap();
        let err = transport
            .receive(0, &mut [], Some(Duration::from_millis(5)))
            .unwrap_err();
        assert!(err.is_timed_out());
    }

    #[test]
    fn test_teardown_then_recreate() {
        let ns = "ipc_latency_test_sem_teardown";
        let mut transport = SysvSemaphoreTransport::create(&config(ns, 1)).unwrap();
        transport.teardown().unwrap();
        transport.teardown().unwrap();
        drop(transport);
        assert!(SysvSemaphoreTransport::create(&config(ns, 1)).is_ok());
    }
}
