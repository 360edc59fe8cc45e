//! POSIX message queues

use super::{realtime_deadline, retry_eintr};
use crate::error::{BenchError, Result};
use crate::lifecycle::{c_name, log_release, remove_stale, Owner};
use log::debug;
use nix::mqueue::{
    mq_attr_member_t, mq_close, mq_getattr, mq_open, mq_receive, mq_send, mq_timedreceive,
    mq_unlink, MQ_OFlag, MqAttr, MqdT,
};
use nix::sys::stat::Mode;
use nix::sys::time::TimeSpec;
use std::ffi::CString;
use std::io;
use std::mem::ManuallyDrop;
use std::time::Duration;

/// A named POSIX message queue
pub struct PosixQueue {
    mqd: ManuallyDrop<MqdT>,
    name: String,
    c_name: CString,
    msgsize: usize,
    owner: Option<Owner>,
}

impl PosixQueue {
    /// Create a queue holding up to `depth` messages of `msgsize` bytes.
    ///
    /// A queue left under `name` by an earlier run is unlinked first; the
    /// new one is created exclusively.
    pub fn create(name: &str, depth: usize, msgsize: usize) -> Result<Self> {
        let c_name = c_name(name)?;
        remove_stale("message queue", name, || {
            mq_unlink(c_name.as_c_str()).map_err(io::Error::from)
        })?;

        let attr = MqAttr::new(0, depth as mq_attr_member_t, msgsize as mq_attr_member_t, 0);
        let mqd = mq_open(
            c_name.as_c_str(),
            MQ_OFlag::O_RDWR | MQ_OFlag::O_CREAT | MQ_OFlag::O_EXCL,
            Mode::S_IRUSR | Mode::S_IWUSR,
            Some(&attr),
        )
        .map_err(|errno| BenchError::ResourceCreate {
            resource: "message queue",
            name: name.to_string(),
            op: "mq_open",
            source: errno.into(),
        })?;

        let mut queue = Self {
            mqd: ManuallyDrop::new(mqd),
            name: name.to_string(),
            c_name,
            msgsize,
            owner: Some(Owner::current()),
        };

        // The kernel may clamp attributes; a smaller message size would
        // truncate payloads.
        let actual = queue.attributes().map_err(|source| BenchError::ResourceCreate {
            resource: "message queue",
            name: name.to_string(),
            op: "mq_getattr",
            source,
        })?;
        let actual_msgsize = actual.msgsize() as usize;
        if actual_msgsize < msgsize {
            return Err(BenchError::Undersized {
                resource: "message queue",
                name: name.to_string(),
                required: msgsize,
                actual: actual_msgsize,
            });
        }
        queue.msgsize = actual_msgsize;

        debug!("created message queue '{}' (depth {}, msgsize {})", name, depth, msgsize);
        Ok(queue)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Largest message the queue accepts; receive buffers must be this big
    pub fn msgsize(&self) -> usize {
        self.msgsize
    }

    pub fn attributes(&self) -> io::Result<MqAttr> {
        mq_getattr(&self.mqd).map_err(io::Error::from)
    }

    pub fn send(&self, payload: &[u8]) -> io::Result<()> {
        retry_eintr(|| mq_send(&self.mqd, payload, 0).map_err(io::Error::from))
    }

    /// Block until a message arrives; `buf` must hold at least
    /// [`msgsize`](Self::msgsize) bytes.
    ///
    /// A signal breaks the wait with `Interrupted`.
    pub fn receive(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut prio = 0;
        mq_receive(&self.mqd, buf, &mut prio).map_err(io::Error::from)
    }

    /// Like [`receive`](Self::receive), but give up after `timeout`
    pub fn receive_timeout(&self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let deadline = TimeSpec::from(realtime_deadline(timeout));
        let mut prio = 0;
        retry_eintr(|| mq_timedreceive(&self.mqd, buf, &mut prio, &deadline).map_err(io::Error::from))
    }

    /// Unlink the queue name now; the descriptor stays usable until drop
    pub fn remove(&mut self) -> Result<()> {
        if !self.owner.is_some_and(|o| o.is_current()) {
            return Ok(());
        }
        self.owner = None;
        mq_unlink(self.c_name.as_c_str())
            .map(|_| debug!("removed message queue '{}'", self.name))
            .map_err(|errno| BenchError::ResourceRemove {
                resource: "message queue",
                name: self.name.clone(),
                op: "mq_unlink",
                source: errno.into(),
            })
    }
}

impl Drop for PosixQueue {
    fn drop(&mut self) {
        // SAFETY: the descriptor is not touched again after this.
        let mqd = unsafe { ManuallyDrop::take(&mut self.mqd) };
        let _ = mq_close(mqd);
        if self.owner.is_some_and(|o| o.is_current()) {
            let result = mq_unlink(self.c_name.as_c_str()).map_err(io::Error::from);
            log_release("message queue", &self.name, result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_receive_in_order() {
        let queue = PosixQueue::create("/ipc_latency_test_mq_order", 10, 8).unwrap();
        assert_eq!(queue.msgsize(), 8);
        assert_eq!(queue.attributes().unwrap().maxmsg(), 10);

        queue.send(b"first").unwrap();
        queue.send(b"second").unwrap();

        let mut buf = [0u8; 8];
        let n = queue.receive(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"first");
        let n = queue.receive(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"second");
    }

    #[test]
    fn test_timed_receive_expires() {
        let queue = PosixQueue::create("/ipc_latency_test_mq_timeout", 10, 4).unwrap();
        let mut buf = [0u8; 4];
        let err = queue.receive_timeout(&mut buf, Duration::from_millis(5)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        // A short buffer is refused by the kernel rather than truncated.
        let mut short = [0u8; 2];
        let err = queue.receive_timeout(&mut short, Duration::from_millis(5)).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EMSGSIZE));
    }

    #[test]
    fn test_create_twice_serially() {
        let name = "/ipc_latency_test_mq_twice";
        let first = PosixQueue::create(name, 10, 16).unwrap();
        std::mem::forget(first);
        let mut second = PosixQueue::create(name, 10, 16).unwrap();
        second.remove().unwrap();
        assert!(PosixQueue::create(name, 10, 16).is_ok());
    }
}
