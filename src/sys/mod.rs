//! Thin wrappers over the kernel synchronization primitives
//!
//! Untimed waits hand `EINTR` back as `io::ErrorKind::Interrupted`, so a
//! signal can break a coordinator out of a wait on a dead worker. Sends and
//! timed waits are re-issued instead; the interrupted call never completed,
//! so nothing is lost or duplicated. Worker channels wrap their waits in
//! [`retry_eintr`]. Timed variants report expiry as `io::ErrorKind::TimedOut`.

pub mod posix_mq;
pub mod posix_sem;
pub mod sysv_msg;
pub mod sysv_sem;

pub use posix_mq::PosixQueue;
pub use posix_sem::PosixSemaphore;
pub use sysv_msg::{MessageBuf, MessageQueue};
pub use sysv_sem::{SemaphoreControlReply, SemaphoreControlRequest, SemaphoreSet};

use rustix::time::{clock_gettime, ClockId};
use std::io;
use std::time::Duration;

/// Absolute CLOCK_REALTIME deadline `timeout` from now, as the `*_timed*`
/// calls expect
pub(crate) fn realtime_deadline(timeout: Duration) -> libc::timespec {
    let now = clock_gettime(ClockId::Realtime);
    let mut secs = now.tv_sec as i64 + timeout.as_secs() as i64;
    let mut nanos = now.tv_nsec as i64 + timeout.subsec_nanos() as i64;
    if nanos >= 1_000_000_000 {
        secs += 1;
        nanos -= 1_000_000_000;
    }
    libc::timespec {
        tv_sec: secs as libc::time_t,
        tv_nsec: nanos as _,
    }
}

/// Relative timeout, as `semtimedop` expects
pub(crate) fn relative_timespec(timeout: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_nsec: timeout.subsec_nanos() as _,
    }
}

/// Run `op` until it stops failing with `EINTR`
#[inline]
pub(crate) fn retry_eintr<T>(mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    loop {
        match op() {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

/// Map `EAGAIN` (what `semtimedop` returns on expiry) onto `TimedOut`
pub(crate) fn timed_out_from_eagain(err: io::Error) -> io::Error {
    if err.raw_os_error() == Some(libc::EAGAIN) {
        io::Error::from(io::ErrorKind::TimedOut)
    } else {
        err
    }
}
