//! Monotonic clock and timing window
//!
//! Every transport measures through the same [`Clock`] so the nanosecond
//! arithmetic lives in exactly one place. The clock is selected once at startup;
//! if the monotonic source is missing the realtime clock is used instead, and
//! if neither can be read the run stops before anything is created or forked.

use crate::error::{BenchError, Result};
use log::{debug, warn};
use rustix::time::{clock_gettime, clock_gettime_dynamic, ClockId, DynamicClockId, Timespec};

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Which kernel clock backs a [`Clock`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockSource {
    Monotonic,
    /// Wall clock fallback; can jump, so deltas are clamped at zero
    Realtime,
}

impl ClockSource {
    fn id(self) -> ClockId {
        match self {
            ClockSource::Monotonic => ClockId::Monotonic,
            ClockSource::Realtime => ClockId::Realtime,
        }
    }
}

/// A point in time read from a [`Clock`], kept at full nanosecond resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    secs: i64,
    nanos: i64,
}

impl Timestamp {
    /// Build a timestamp from seconds and a sub-second nanosecond part
    pub fn from_parts(secs: i64, nanos: i64) -> Self {
        debug_assert!((0..NANOS_PER_SEC).contains(&nanos));
        Self { secs, nanos }
    }

    fn from_timespec(ts: Timespec) -> Self {
        Self::from_parts(ts.tv_sec as i64, ts.tv_nsec as i64)
    }
}

/// `b - a` in nanoseconds.
///
/// Seconds and nanoseconds are subtracted separately and combined once, so a
/// borrow across a second boundary (`b.nanos < a.nanos`) comes out exact.
#[inline]
pub fn delta_ns(a: Timestamp, b: Timestamp) -> i64 {
    (b.secs - a.secs) * NANOS_PER_SEC + (b.nanos - a.nanos)
}

/// Handle to the selected clock source
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    source: ClockSource,
}

impl Clock {
    /// Find a readable clock, preferring the monotonic one
    pub fn select() -> Result<Self> {
        let monotonic = clock_gettime_dynamic(DynamicClockId::Known(ClockId::Monotonic));
        if monotonic.is_ok() {
            debug!("using CLOCK_MONOTONIC");
            return Ok(Self {
                source: ClockSource::Monotonic,
            });
        }

        match clock_gettime_dynamic(DynamicClockId::Known(ClockId::Realtime)) {
            Ok(_) => {
                warn!("CLOCK_MONOTONIC unavailable, falling back to CLOCK_REALTIME");
                Ok(Self {
                    source: ClockSource::Realtime,
                })
            }
            Err(e) => Err(BenchError::TimerUnavailable(e.into())),
        }
    }

    /// Which source was selected by [`Clock::select`]
    pub fn source(&self) -> ClockSource {
        self.source
    }

    #[inline(always)]
    pub fn now(&self) -> Timestamp {
        Timestamp::from_timespec(clock_gettime(self.source.id()))
    }

    /// Start a timing window at the current instant
    #[inline]
    pub fn open_window(&self) -> OpenWindow {
        OpenWindow {
            clock: *self,
            start: self.now(),
        }
    }
}

/// A timing window that has started but not stopped yet
#[derive(Debug)]
pub struct OpenWindow {
    clock: Clock,
    start: Timestamp,
}

impl OpenWindow {
    /// Stop the window at the current instant
    #[inline]
    pub fn close(self) -> TimingWindow {
        let stop = self.clock.now();
        TimingWindow::new(self.start, stop)
    }
}

/// Closed measurement interval; `stop >= start` always holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingWindow {
    start: Timestamp,
    stop: Timestamp,
}

impl TimingWindow {
    /// A realtime clock may step backwards; such a window collapses to zero length.
    pub fn new(start: Timestamp, stop: Timestamp) -> Self {
        let stop = stop.max(start);
        Self { start, stop }
    }

    pub fn start(&self) -> Timestamp {
        self.start
    }

    pub fn stop(&self) -> Timestamp {
        self.stop
    }

    pub fn elapsed_ns(&self) -> u64 {
        delta_ns(self.start, self.stop) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delta_within_second() {
        let a = Timestamp::from_parts(10, 100);
        let b = Timestamp::from_parts(10, 350);
        assert_eq!(delta_ns(a, b), 250);
    }

    #[test]
    fn test_delta_across_second_boundary() {
        let a = Timestamp::from_parts(5, 999_999_900);
        let b = Timestamp::from_parts(6, 50);
        assert_eq!(delta_ns(a, b), 150);

        let a = Timestamp::from_parts(1, 999_999_999);
        let b = Timestamp::from_parts(4, 1);
        assert_eq!(delta_ns(a, b), 2_000_000_002);
    }

    #[test]
    fn test_delta_keeps_sub_microsecond_precision() {
        let a = Timestamp::from_parts(0, 1_001);
        let b = Timestamp::from_parts(0, 1_999);
        assert_eq!(delta_ns(a, b), 998);
    }

    #[test]
    fn test_window_never_negative() {
        let later = Timestamp::from_parts(7, 0);
        let earlier = Timestamp::from_parts(6, 500);
        let window = TimingWindow::new(later, earlier);
        assert!(window.stop() >= window.start());
        assert_eq!(window.elapsed_ns(), 0);
    }

    #[test]
    fn test_select_and_measure() {
        let clock = Clock::select().unwrap();
        assert_eq!(clock.source(), ClockSource::Monotonic);

        let window = clock.open_window();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let window = window.close();
        assert!(window.stop() >= window.start());
        assert!(window.elapsed_ns() >= 2_000_000);
    }
}
