//! ipc_latency - Round-trip latency of inter-process synchronization primitives
//!
//! A coordinator forks N workers and runs fan-out/fan-in rounds over one
//! transport, timing the whole batch on the monotonic clock.
//!
//! # Transports
//!
//! - **POSIX message queues**: one down/up queue pair per worker
//! - **System V message queues**: one shared pair, replies routed by worker pid
//! - **POSIX shared memory**: a text slot per worker, handed back and forth
//!   with two process-shared semaphores
//! - **System V semaphores**: pure token passing, no payload
//!
//! # Example
//!
//! ```no_run
//! use ipc_latency::{run_benchmark, BenchmarkConfig, TransportKind};
//!
//! let config = BenchmarkConfig::new(4, 10_000, 0);
//! let report = run_benchmark(TransportKind::SharedBuffer, &config)?;
//! println!("average latency: {} ns", report.average_latency_ns());
//! # Ok::<(), ipc_latency::BenchError>(())
//! ```

pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod lifecycle;
pub mod process;
pub mod shm;
pub mod signals;
pub mod sys;
pub mod timers;
pub mod transport;
pub mod worker;

pub use clock::{Clock, ClockSource, TimingWindow};
pub use config::{BenchmarkConfig, TransportKind, WaitPolicy, DEFAULT_NAMESPACE};
pub use coordinator::{run_benchmark, BenchmarkReport, Coordinator};
pub use error::{BenchError, ErrorKind, Result};
pub use process::{WorkerFleet, WorkerHandle};
pub use signals::install_stop_handlers;
pub use transport::{Transport, WorkerChannel};
pub use worker::{WorkerOptions, WorkerState};
