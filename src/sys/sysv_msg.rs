//! System V message queues

use super::retry_eintr;
use crate::error::{BenchError, Result};
use crate::lifecycle::{cvt, log_release, remove_stale, Owner};
use log::debug;
use std::io;
use std::mem::size_of;
use std::time::{Duration, Instant};

/// Sleep between non-blocking polls while a timed receive is pending
const POLL_INTERVAL: Duration = Duration::from_micros(50);

/// Where the kernel publishes its per-message size limit
const MSGMAX_PATH: &str = "/proc/sys/kernel/msgmax";

/// Linux default for `kernel.msgmax`
const DEFAULT_MSGMAX: usize = 8192;

/// Largest message text the kernel accepts on any System V queue
pub fn max_message_len() -> usize {
    std::fs::read_to_string(MSGMAX_PATH)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(DEFAULT_MSGMAX)
}

/// `struct msgbuf`: a `long` type tag followed by the message text.
///
/// Backed by `c_long` words so the tag is always aligned.
pub struct MessageBuf {
    words: Vec<libc::c_long>,
    capacity: usize,
}

impl MessageBuf {
    /// Buffer able to carry `capacity` bytes of text
    pub fn new(capacity: usize) -> Self {
        let word = size_of::<libc::c_long>();
        let words = 1 + capacity.div_ceil(word);
        Self {
            words: vec![0; words],
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn mtype(&self) -> libc::c_long {
        self.words[0]
    }

    pub fn set_mtype(&mut self, mtype: libc::c_long) {
        self.words[0] = mtype;
    }

    pub fn text(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(self.words.as_ptr().add(1).cast::<u8>(), self.capacity)
        }
    }

    pub fn text_mut(&mut self) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(self.words.as_mut_ptr().add(1).cast::<u8>(), self.capacity)
        }
    }

    fn as_mut_ptr(&mut self) -> *mut libc::c_void {
        self.words.as_mut_ptr().cast()
    }

    fn as_ptr(&self) -> *const libc::c_void {
        self.words.as_ptr().cast()
    }
}

/// A System V message queue identified by an IPC key
#[derive(Debug)]
pub struct MessageQueue {
    id: libc::c_int,
    label: String,
    owner: Option<Owner>,
}

impl MessageQueue {
    /// Create a queue under `key`, first removing any queue an earlier run
    /// left behind under the same key.
    pub fn create(label: &str, key: libc::key_t) -> Result<Self> {
        remove_stale("message queue", label, || {
            let id = cvt(unsafe { libc::msgget(key, 0) })?;
            cvt(unsafe { libc::msgctl(id, libc::IPC_RMID, std::ptr::null_mut()) }).map(drop)
        })?;

        let id = cvt(unsafe { libc::msgget(key, libc::IPC_CREAT | libc::IPC_EXCL | 0o600) })
            .map_err(|source| BenchError::ResourceCreate {
                resource: "message queue",
                name: label.to_string(),
                op: "msgget",
                source,
            })?;

        debug!("created message queue '{}' (id {})", label, id);

        Ok(Self {
            id,
            label: label.to_string(),
            owner: Some(Owner::current()),
        })
    }

    pub fn id(&self) -> libc::c_int {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Send the first `len` text bytes of `buf`, tagged with its current type
    pub fn send(&self, buf: &MessageBuf, len: usize) -> io::Result<()> {
        debug_assert!(len <= buf.capacity());
        retry_eintr(|| cvt(unsafe { libc::msgsnd(self.id, buf.as_ptr(), len, 0) }).map(drop))
    }

    /// Block until a message of type `mtype` arrives; returns its text length.
    ///
    /// A signal breaks the wait with `Interrupted`.
    pub fn receive(&self, buf: &mut MessageBuf, mtype: libc::c_long) -> io::Result<usize> {
        let capacity = buf.capacity();
        let n = unsafe { libc::msgrcv(self.id, buf.as_mut_ptr(), capacity, mtype, 0) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    /// Non-blocking receive; `Ok(None)` when no matching message is queued
    pub fn try_receive(&self, buf: &mut MessageBuf, mtype: libc::c_long) -> io::Result<Option<usize>> {
        let capacity = buf.capacity();
        let n = unsafe { libc::msgrcv(self.id, buf.as_mut_ptr(), capacity, mtype, libc::IPC_NOWAIT) };
        if n >= 0 {
            return Ok(Some(n as usize));
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ENOMSG) | Some(libc::EINTR) => Ok(None),
            _ => Err(err),
        }
    }

    /// Receive with a deadline.
    ///
    /// `msgrcv` has no timed form, so this polls; only the watchdog wait
    /// policy goes through here.
    pub fn receive_timeout(
        &self,
        buf: &mut MessageBuf,
        mtype: libc::c_long,
        timeout: Duration,
    ) -> io::Result<usize> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(n) = self.try_receive(buf, mtype)? {
                return Ok(n);
            }
            if Instant::now() >= deadline {
                return Err(io::Error::from(io::ErrorKind::TimedOut));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn stat(&self) -> io::Result<libc::msqid_ds> {
        let mut ds: libc::msqid_ds = unsafe { std::mem::zeroed() };
        cvt(unsafe { libc::msgctl(self.id, libc::IPC_STAT, &mut ds) })?;
        Ok(ds)
    }

    /// Number of messages currently queued
    pub fn pending(&self) -> io::Result<usize> {
        Ok(self.stat()?.msg_qnum as usize)
    }

    /// Bytes of text the queue holds before `msgsnd` blocks
    pub fn byte_limit(&self) -> io::Result<usize> {
        Ok(self.stat()?.msg_qbytes as usize)
    }

    /// Make room for `bytes` of queued text.
    ///
    /// Raising the limit past `kernel.msgmnb` needs `CAP_SYS_RESOURCE`. When
    /// the kernel refuses, the queue is reported as undersized.
    pub fn reserve(&self, bytes: usize) -> Result<()> {
        let stat_error = |source| BenchError::ResourceCreate {
            resource: "message queue",
            name: self.label.clone(),
            op: "msgctl(IPC_STAT)",
            source,
        };

        let mut ds = self.stat().map_err(stat_error)?;
        if ds.msg_qbytes as usize >= bytes {
            return Ok(());
        }
        let default = ds.msg_qbytes as usize;
        ds.msg_qbytes = bytes as _;
        match cvt(unsafe { libc::msgctl(self.id, libc::IPC_SET, &mut ds) }) {
            Ok(_) => debug!(
                "raised message queue '{}' from {} to {} bytes",
                self.label, default, bytes
            ),
            Err(e) if e.raw_os_error() == Some(libc::EPERM) => {
                debug!("not allowed to raise message queue '{}' past {} bytes", self.label, default)
            }
            Err(source) => {
                return Err(BenchError::ResourceCreate {
                    resource: "message queue",
                    name: self.label.clone(),
                    op: "msgctl(IPC_SET)",
                    source,
                })
            }
        }

        let actual = self.byte_limit().map_err(stat_error)?;
        if actual < bytes {
            return Err(BenchError::Undersized {
                resource: "message queue",
                name: self.label.clone(),
                required: bytes,
                actual,
            });
        }
        Ok(())
    }

    /// Remove the queue now instead of at drop
    pub fn remove(&mut self) -> Result<()> {
        if !self.owner.is_some_and(|o| o.is_current()) {
            return Ok(());
        }
        self.owner = None;
        cvt(unsafe { libc::msgctl(self.id, libc::IPC_RMID, std::ptr::null_mut()) })
            .map(|_| debug!("removed message queue '{}'", self.label))
            .map_err(|source| BenchError::ResourceRemove {
                resource: "message queue",
                name: self.label.clone(),
                op: "msgctl(IPC_RMID)",
                source,
            })
    }
}

impl Drop for MessageQueue {
    fn drop(&mut self) {
        if self.owner.is_some_and(|o| o.is_current()) {
            let result = cvt(unsafe { libc::msgctl(self.id, libc::IPC_RMID, std::ptr::null_mut()) });
            log_release("message queue", &self.label, result.map(drop));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::sysv_key_for;

    #[test]
    fn test_buffer_layout() {
        let mut buf = MessageBuf::new(13);
        assert_eq!(buf.capacity(), 13);
        buf.set_mtype(42);
        buf.text_mut().copy_from_slice(b"hello, world!");
        assert_eq!(buf.mtype(), 42);
        assert_eq!(buf.text(), b"hello, world!");
    }

    #[test]
    fn test_selective_receive_by_type() {
        let label = "ipc_latency_test_msgq_select";
        let queue = MessageQueue::create(label, sysv_key_for(label)).unwrap();

        let mut out = MessageBuf::new(4);
        out.set_mtype(7);
        out.text_mut().copy_from_slice(b"7777");
        queue.send(&out, 4).unwrap();
        out.set_mtype(3);
        out.text_mut().copy_from_slice(b"3333");
        queue.send(&out, 4).unwrap();
        assert_eq!(queue.pending().unwrap(), 2);

        // Type 3 is pulled out ahead of the older type 7 message.
        let mut input = MessageBuf::new(4);
        assert_eq!(queue.receive(&mut input, 3).unwrap(), 4);
        assert_eq!(input.text(), b"3333");
        assert_eq!(queue.receive(&mut input, 7).unwrap(), 4);
        assert_eq!(input.text(), b"7777");
        assert_eq!(queue.pending().unwrap(), 0);
    }

    #[test]
    fn test_timed_receive_expires() {
        let label = "ipc_latency_test_msgq_timeout";
        let queue = MessageQueue::create(label, sysv_key_for(label)).unwrap();
        let mut buf = MessageBuf::new(8);
        assert!(queue.try_receive(&mut buf, 1).unwrap().is_none());
        let err = queue.receive_timeout(&mut buf, 1, Duration::from_millis(5)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_reserve_raises_or_reports_limit() {
        assert!(max_message_len() > 0);
        let label = "ipc_latency_test_msgq_reserve";
        let queue = MessageQueue::create(label, sysv_key_for(label)).unwrap();
        let default = queue.byte_limit().unwrap();
        assert!(default > 0);
        queue.reserve(default).unwrap();

        let wanted = default * 4;
        match queue.reserve(wanted) {
            Ok(()) => assert!(queue.byte_limit().unwrap() >= wanted),
            Err(BenchError::Undersized {
                required, actual, ..
            }) => {
                assert_eq!(required, wanted);
                assert_eq!(actual, default);
            }
            Err(e) => panic!("unexpected {e}"),
        }
    }

    #[test]
    fn test_recreate_after_stale() {
        let label = "ipc_latency_test_msgq_stale";
        let key = sysv_key_for(label);
        std::mem::forget(MessageQueue::create(label, key).unwrap());
        let mut queue = MessageQueue::create(label, key).unwrap();
        queue.remove().unwrap();
        assert!(MessageQueue::create(label, key).is_ok());
    }
}
