//! ipc-latency - Round-trip latency benchmarks for IPC primitives
//!
//! One subcommand per transport, plus two standalone timer tools.
//! Stdout carries the configuration echo and the result line; logs and
//! errors go to stderr.

use clap::{ArgAction, Args, Parser, Subcommand};
use console::style;
use ipc_latency::timers::{self, DEFAULT_WAKEUP_COUNT, DEFAULT_WAKEUP_DELAY};
use ipc_latency::{
    install_stop_handlers, run_benchmark, BenchError, BenchmarkConfig, Clock, TransportKind,
    WaitPolicy, DEFAULT_NAMESPACE,
};
use log::{debug, LevelFilter};
use std::process::ExitCode;
use std::time::Duration;

/// Poll slice when only a reply timeout is given
const DEFAULT_WATCHDOG_MS: u64 = 100;

/// Reply timeout when only a poll slice is given
const DEFAULT_REPLY_TIMEOUT_MS: u64 = 10_000;

#[derive(Parser)]
#[command(name = "ipc-latency", version)]
#[command(about = "Round-trip latency of IPC primitives between forked processes", long_about = None)]
#[command(arg_required_else_help = true)]
struct Cli {
    /// Prefix for every shared memory, queue and semaphore name
    #[arg(long, global = true, env = "IPC_LATENCY_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    namespace: String,

    /// Wait for replies in slices of MS milliseconds and notice dead workers
    #[arg(long, global = true, value_name = "MS")]
    watchdog_ms: Option<u64>,

    /// Give up on a silent worker after MS milliseconds (turns the watchdog on)
    #[arg(long, global = true, value_name = "MS")]
    reply_timeout_ms: Option<u64>,

    /// Log more to stderr (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct PayloadArgs {
    /// Bytes per message
    payload_size: usize,

    /// Fan-out/fan-in rounds
    iteration_count: u64,

    /// Worker processes
    #[arg(default_value_t = 1)]
    worker_count: usize,
}

#[derive(Args)]
struct SignalArgs {
    /// Fan-out/fan-in rounds
    iteration_count: u64,

    /// Worker processes
    #[arg(default_value_t = 1)]
    worker_count: usize,
}

#[derive(Subcommand)]
enum Commands {
    /// POSIX message queue pair per worker
    PosixMq(PayloadArgs),

    /// Shared System V message queue pair, replies routed by worker pid
    SysvMq(PayloadArgs),

    /// POSIX shared memory slot per worker, gated by two semaphores
    PosixShm(SignalArgs),

    /// System V semaphore token passing
    SysvSem(SignalArgs),

    /// Cost of one clock read
    Clock {
        /// Clock reads to time
        count: u64,
    },

    /// Oversleep of short sleeps
    Wakeup {
        /// Sleeps to measure
        #[arg(default_value_t = DEFAULT_WAKEUP_COUNT)]
        count: u32,
    },
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            // --help and --version are not failures
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    setup_logging(cli.verbose);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("error:").red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

fn setup_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();
}

fn run(cli: &Cli) -> Result<(), BenchError> {
    match &cli.command {
        Commands::PosixMq(args) => benchmark(cli, TransportKind::PosixQueue, args.into()),
        Commands::SysvMq(args) => benchmark(cli, TransportKind::SysvQueue, args.into()),
        Commands::PosixShm(args) => benchmark(cli, TransportKind::SharedBuffer, args.into()),
        Commands::SysvSem(args) => benchmark(cli, TransportKind::SysvSemaphore, args.into()),
        Commands::Clock { count } => {
            let clock = Clock::select()?;
            println!("measurements count: {}", count);
            let overhead = timers::clock_overhead(&clock, *count)?;
            println!("average latency: {} ns", overhead.average_latency_ns());
            Ok(())
        }
        Commands::Wakeup { count } => {
            let clock = Clock::select()?;
            println!(
                "Running {} loops of {} us delays",
                count,
                DEFAULT_WAKEUP_DELAY.as_micros()
            );
            let stats = timers::wakeup_latency(&clock, *count, DEFAULT_WAKEUP_DELAY)?;
            println!("min: {:.3} us", stats.min_us);
            println!("max: {:.3} us", stats.max_us);
            println!("average: {:.3} us", stats.avg_us);
            Ok(())
        }
    }
}

impl From<&PayloadArgs> for BenchmarkConfig {
    fn from(args: &PayloadArgs) -> Self {
        BenchmarkConfig::new(args.worker_count, args.iteration_count, args.payload_size)
    }
}

impl From<&SignalArgs> for BenchmarkConfig {
    fn from(args: &SignalArgs) -> Self {
        BenchmarkConfig::new(args.worker_count, args.iteration_count, 0)
    }
}

fn wait_policy(cli: &Cli) -> WaitPolicy {
    match (cli.watchdog_ms, cli.reply_timeout_ms) {
        (None, None) => WaitPolicy::Blocking,
        (poll, limit) => WaitPolicy::Watchdog {
            poll: Duration::from_millis(poll.unwrap_or(DEFAULT_WATCHDOG_MS)),
            limit: Duration::from_millis(limit.unwrap_or(DEFAULT_REPLY_TIMEOUT_MS)),
        },
    }
}

fn benchmark(cli: &Cli, kind: TransportKind, config: BenchmarkConfig) -> Result<(), BenchError> {
    let config = config
        .with_namespace(cli.namespace.clone())
        .with_wait_policy(wait_policy(cli));
    config.validate()?;
    debug!("{:?}", config);

    if kind.carries_payload() {
        println!("message size: {} octets", config.message_len());
    }
    println!("roundtrip count: {}", config.iteration_count);
    println!("worker count: {}", config.worker_count);

    // Ctrl-C and SIGTERM still kill the workers and remove every object.
    install_stop_handlers()?;
    let report = run_benchmark(kind, &config)?;
    println!("average latency: {} ns", report.average_latency_ns());
    Ok(())
}
