//! System V semaphore sets

use super::{relative_timespec, retry_eintr, timed_out_from_eagain};
use crate::error::{BenchError, Result};
use crate::lifecycle::{cvt, log_release, remove_stale, Owner};
use log::debug;
use std::io;
use std::time::Duration;

/// `semctl` command with its argument, replacing the untyped `semun` union
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SemaphoreControlRequest<'a> {
    /// Set every semaphore in the set; length must equal the set size
    SetAll(&'a [u16]),
    GetAll,
    SetValue { num: u16, value: i32 },
    GetValue(u16),
    /// Read the kernel's description of the set
    Stat,
    /// Remove the set from the kernel namespace
    Remove,
}

/// What a [`SemaphoreControlRequest`] produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SemaphoreControlReply {
    Done,
    Values(Vec<u16>),
    Value(i32),
    Stat { nsems: usize },
}

/// A System V semaphore set identified by an IPC key
#[derive(Debug)]
pub struct SemaphoreSet {
    id: libc::c_int,
    nsems: usize,
    label: String,
    owner: Option<Owner>,
}

impl SemaphoreSet {
    /// Create a set of `nsems` semaphores under `key`, removing any set
    /// an earlier run left under the same key.
    pub fn create(label: &str, key: libc::key_t, nsems: usize) -> Result<Self> {
        remove_stale("semaphore set", label, || {
            let id = cvt(unsafe { libc::semget(key, 0, 0) })?;
            cvt(unsafe { libc::semctl(id, 0, libc::IPC_RMID) }).map(drop)
        })?;

        let id = cvt(unsafe {
            libc::semget(
                key,
                nsems as libc::c_int,
                libc::IPC_CREAT | libc::IPC_EXCL | 0o600,
            )
        })
        .map_err(|source| BenchError::ResourceCreate {
            resource: "semaphore set",
            name: label.to_string(),
            op: "semget",
            source,
        })?;

        debug!("created semaphore set '{}' (id {}, {} semaphores)", label, id, nsems);

        Ok(Self {
            id,
            nsems,
            label: label.to_string(),
            owner: Some(Owner::current()),
        })
    }

    pub fn id(&self) -> libc::c_int {
        self.id
    }

    pub fn len(&self) -> usize {
        self.nsems
    }

    pub fn is_empty(&self) -> bool {
        self.nsems == 0
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Issue a `semctl` command
    pub fn control(&self, request: SemaphoreControlRequest<'_>) -> io::Result<SemaphoreControlReply> {
        use SemaphoreControlRequest::*;

        match request {
            SetAll(values) => {
                if values.len() != self.nsems {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("SETALL needs {} values, got {}", self.nsems, values.len()),
                    ));
                }
                cvt(unsafe { libc::semctl(self.id, 0, libc::SETALL, values.as_ptr()) })?;
                Ok(SemaphoreControlReply::Done)
            }
            GetAll => {
                let mut values = vec![0u16; self.nsems];
                cvt(unsafe { libc::semctl(self.id, 0, libc::GETALL, values.as_mut_ptr()) })?;
                Ok(SemaphoreControlReply::Values(values))
            }
            SetValue { num, value } => {
                cvt(unsafe {
                    libc::semctl(self.id, num as libc::c_int, libc::SETVAL, value as libc::c_int)
                })?;
                Ok(SemaphoreControlReply::Done)
            }
            GetValue(num) => {
                let value = cvt(unsafe { libc::semctl(self.id, num as libc::c_int, libc::GETVAL) })?;
                Ok(SemaphoreControlReply::Value(value))
            }
            Stat => {
                let mut ds: libc::semid_ds = unsafe { std::mem::zeroed() };
                cvt(unsafe { libc::semctl(self.id, 0, libc::IPC_STAT, &mut ds as *mut libc::semid_ds) })?;
                Ok(SemaphoreControlReply::Stat {
                    nsems: ds.sem_nsems as usize,
                })
            }
            Remove => {
                cvt(unsafe { libc::semctl(self.id, 0, libc::IPC_RMID) })?;
                Ok(SemaphoreControlReply::Done)
            }
        }
    }

    /// Add `delta` to semaphore `num`, blocking while the result would go
    /// negative. With a timeout the call gives up with `TimedOut`; without
    /// one a signal breaks the wait with `Interrupted`.
    pub fn op(&self, num: u16, delta: i16, timeout: Option<Duration>) -> io::Result<()> {
        let mut sop = libc::sembuf {
            sem_num: num,
            sem_op: delta,
            sem_flg: 0,
        };
        match timeout {
            None => cvt(unsafe { libc::semop(self.id, &mut sop, 1) }).map(drop),
            Some(timeout) => {
                let ts = relative_timespec(timeout);
                retry_eintr(|| {
                    let ret = unsafe {
                        libc::syscall(
                            libc::SYS_semtimedop,
                            self.id,
                            &mut sop as *mut libc::sembuf,
                            1 as libc::size_t,
                            &ts as *const libc::timespec,
                        )
                    };
                    if ret == -1 {
                        Err(timed_out_from_eagain(io::Error::last_os_error()))
                    } else {
                        Ok(())
                    }
                })
            }
        }
    }

    #[inline]
    pub fn post(&self, num: u16) -> io::Result<()> {
        self.op(num, 1, None)
    }

    #[inline]
    pub fn wait(&self, num: u16, timeout: Option<Duration>) -> io::Result<()> {
        self.op(num, -1, timeout)
    }

    /// Remove the set now instead of at drop
    pub fn remove(&mut self) -> Result<()> {
        if !self.owner.is_some_and(|o| o.is_current()) {
            return Ok(());
        }
        self.owner = None;
        self.control(SemaphoreControlRequest::Remove)
            .map(|_| debug!("removed semaphore set '{}'", self.label))
            .map_err(|source| BenchError::ResourceRemove {
                resource: "semaphore set",
                name: self.label.clone(),
                op: "semctl(IPC_RMID)",
                source,
            })
    }
}

impl Drop for SemaphoreSet {
    fn drop(&mut self) {
        if self.owner.is_some_and(|o| o.is_current()) {
            let result = self.control(SemaphoreControlRequest::Remove).map(drop);
            log_release("semaphore set", &self.label, result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::sysv_key_for;
    use std::thread;

    #[test]
    fn test_set_all_and_stat() {
        let label = "ipc_latency_test_semset_stat";
        let set = SemaphoreSet::create(label, sysv_key_for(label), 4).unwrap();

        set.control(SemaphoreControlRequest::SetAll(&[0, 1, 2, 3])).unwrap();
        assert_eq!(
            set.control(SemaphoreControlRequest::GetAll).unwrap(),
            SemaphoreControlReply::Values(vec![0, 1, 2, 3])
        );
        assert_eq!(
            set.control(SemaphoreControlRequest::GetValue(2)).unwrap(),
            SemaphoreControlReply::Value(2)
        );
        assert_eq!(
            set.control(SemaphoreControlRequest::Stat).unwrap(),
            SemaphoreControlReply::Stat { nsems: 4 }
        );
        assert!(set.control(SemaphoreControlRequest::SetAll(&[0, 0])).is_err());
    }

    #[test]
    fn test_recreate_removes_stale_set() {
        let label = "ipc_latency_test_semset_stale";
        let key = sysv_key_for(label);
        let first = SemaphoreSet::create(label, key, 2).unwrap();
        let first_id = first.id();
        // Leave the set behind as a crashed run would.
        std::mem::forget(first);

        let second = SemaphoreSet::create(label, key, 2).unwrap();
        assert_eq!(second.len(), 2);
        assert_ne!(second.id(), first_id);
    }

    #[test]
    fn test_token_pass_between_threads() {
        let label = "ipc_latency_test_semset_pass";
        let set = SemaphoreSet::create(label, sysv_key_for(label), 2).unwrap();
        set.control(SemaphoreControlRequest::SetAll(&[0, 0])).unwrap();

        thread::scope(|s| {
            s.spawn(|| {
                for _ in 0..50 {
                    retry_eintr(|| set.wait(0, None)).unwrap();
                    set.post(1).unwrap();
                }
            });
            for _ in 0..50 {
                set.post(0).unwrap();
                retry_eintr(|| set.wait(1, None)).unwrap();
            }
        });
    }

    #[test]
    fn test_timed_wait_expires() {
        let label = "ipc_latency_test_semset_timeout";
        let set = SemaphoreSet::create(label, sysv_key_for(label), 1).unwrap();
        set.control(SemaphoreControlRequest::SetValue { num: 0, value: 0 }).unwrap();
        let err = set.wait(0, Some(Duration::from_millis(5))).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let label = "ipc_latency_test_semset_remove";
        let mut set = SemaphoreSet::create(label, sysv_key_for(label), 1).unwrap();
        set.remove().unwrap();
        set.remove().unwrap();
        let again = SemaphoreSet::create(label, sysv_key_for(label), 1).unwrap();
        assert_eq!(again.len(), 1);
    }
}
