//! Process-shared unnamed POSIX semaphores living inside shared memory

use super::{realtime_deadline, retry_eintr};
use crate::lifecycle::cvt;
use std::io;
use std::ptr::NonNull;
use std::time::Duration;

/// Handle to a `sem_t` placed in a shared mapping.
///
/// The handle does not own the storage; the mapping must outlive it.
#[derive(Debug, Clone, Copy)]
pub struct PosixSemaphore {
    sem: NonNull<libc::sem_t>,
}

// SAFETY: sem_t is designed for concurrent use across threads and, with
// pshared = 1, across processes.
unsafe impl Send for PosixSemaphore {}
unsafe impl Sync for PosixSemaphore {}

impl PosixSemaphore {
    /// Initialize a process-shared semaphore at `ptr` with `value`
    ///
    /// # Safety
    /// `ptr` must point to writable, suitably aligned memory inside a
    /// `MAP_SHARED` mapping that nobody else is using as a semaphore yet.
    pub unsafe fn init(ptr: *mut libc::sem_t, value: u32) -> io::Result<Self> {
        let sem = NonNull::new(ptr)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "null semaphore"))?;
        cvt(libc::sem_init(sem.as_ptr(), 1, value))?;
        Ok(Self { sem })
    }

    #[inline]
    pub fn post(&self) -> io::Result<()> {
        cvt(unsafe { libc::sem_post(self.sem.as_ptr()) }).map(drop)
    }

    /// Block until the count is positive, then decrement it.
    ///
    /// A signal breaks the wait with `Interrupted`.
    #[inline]
    pub fn wait(&self) -> io::Result<()> {
        cvt(unsafe { libc::sem_wait(self.sem.as_ptr()) }).map(drop)
    }

    /// Like [`wait`](Self::wait), but give up after `timeout`
    pub fn wait_timeout(&self, timeout: Duration) -> io::Result<()> {
        let deadline = realtime_deadline(timeout);
        retry_eintr(|| cvt(unsafe { libc::sem_timedwait(self.sem.as_ptr(), &deadline) }).map(drop))
    }

    /// Current count
    pub fn value(&self) -> io::Result<i32> {
        let mut value: libc::c_int = 0;
        cvt(unsafe { libc::sem_getvalue(self.sem.as_ptr(), &mut value) })?;
        Ok(value)
    }

    /// Destroy the semaphore
    ///
    /// # Safety
    /// No process may be waiting on it or use it afterwards.
    pub unsafe fn destroy(&self) -> io::Result<()> {
        cvt(libc::sem_destroy(self.sem.as_ptr())).map(drop)
    }
}
