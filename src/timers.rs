//! Standalone timer measurements
//!
//! Both report on the same [`Clock`] the round-trip benchmarks use, so their
//! numbers can be read alongside a latency report.

use crate::clock::{delta_ns, Clock};
use crate::error::{BenchError, Result};
use std::thread;
use std::time::Duration;

/// Sleeps per wakeup run unless told otherwise
pub const DEFAULT_WAKEUP_COUNT: u32 = 200;

/// Requested sleep per wakeup sample
pub const DEFAULT_WAKEUP_DELAY: Duration = Duration::from_micros(100);

/// Cost of reading the clock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockOverhead {
    pub count: u64,
    pub elapsed_ns: u64,
}

impl ClockOverhead {
    /// Reported like a round trip: elapsed time over `count * 2`, so the
    /// figure lines up with the one-way latencies of the transports
    pub fn average_latency_ns(&self) -> u64 {
        self.elapsed_ns / self.count.saturating_mul(2)
    }
}

/// Time `count` back-to-back clock reads
pub fn clock_overhead(clock: &Clock, count: u64) -> Result<ClockOverhead> {
    if count == 0 {
        return Err(BenchError::config("count must be at least 1"));
    }
    let window = clock.open_window();
    for _ in 0..count {
        std::hint::black_box(clock.now());
    }
    let window = window.close();
    Ok(ClockOverhead {
        count,
        elapsed_ns: window.elapsed_ns(),
    })
}

/// Oversleep statistics, in microseconds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WakeupStats {
    pub count: u32,
    pub delay: Duration,
    pub min_us: f64,
    pub max_us: f64,
    pub avg_us: f64,
}

/// Sleep `delay` `count` times and measure how late each wakeup is
pub fn wakeup_latency(clock: &Clock, count: u32, delay: Duration) -> Result<WakeupStats> {
    if count == 0 {
        return Err(BenchError::config("count must be at least 1"));
    }
    let delay_ns = delay.as_nanos() as i64;
    let mut min = f64::MAX;
    let mut max = f64::MIN;
    let mut total = 0.0;

    for _ in 0..count {
        let before = clock.now();
        thread::sleep(delay);
        let after = clock.now();
        let late_us = (delta_ns(before, after) - delay_ns) as f64 / 1_000.0;
        min = min.min(late_us);
        max = max.max(late_us);
        total += late_us;
    }

    Ok(WakeupStats {
        count,
        delay,
        min_us: min,
        max_us: max,
        avg_us: total / count as f64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_overhead_counts_every_call() {
        let clock = Clock::select().unwrap();
        let overhead = clock_overhead(&clock, 10_000).unwrap();
        assert_eq!(overhead.count, 10_000);
        assert!(overhead.average_latency_ns() <= overhead.elapsed_ns);
        assert!(clock_overhead(&clock, 0).is_err());
    }

    #[test]
    fn test_clock_average_counts_two_reads_per_sample() {
        let overhead = ClockOverhead {
            count: 10,
            elapsed_ns: 2_000,
        };
        assert_eq!(overhead.average_latency_ns(), 100);
    }

    #[test]
    fn test_wakeup_never_early() {
        let clock = Clock::select().unwrap();
        let stats = wakeup_latency(&clock, 5, Duration::from_micros(200)).unwrap();
        assert_eq!(stats.count, 5);
        // thread::sleep sleeps at least the requested time.
        assert!(stats.min_us >= 0.0);
        assert!(stats.max_us >= stats.min_us);
        assert!(stats.avg_us >= 0.0);
    }
}
