//! `cache_profiler`: prime+probe latency profiles of one CPU cache.
//!
//! `info` prints the cache geometry, `bench` checks the timing apparatus on a
//! single scratch word and `profile` streams one latency matrix per
//! iteration, optionally next to a companion workload bound to the same core.

#[cfg(not(target_arch = "x86_64"))]
compile_error!("cache_profiler reads the cycle counter with rdpmc and needs x86_64");

mod companion;

use cache_utils::affinity::{current_cpu, focus_cpu_core};
use cache_utils::cache_info::{self, CacheGeometry};
use cache_utils::mmap::alloc_aligned;
use cache_utils::perf::{can_use_rdpmc, PerformanceCounter};
use cache_utils::RdpmcPrimitives;
use clap::{Parser, ValueEnum};
use companion::Companion;
use lazy_static::lazy_static;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{alarm, geteuid, Pid};
use prime_probe::benchmark::{run_benchmark, DEFAULT_ITERATIONS};
use prime_probe::output::{MatrixSink, OutputSink};
use prime_probe::{CancellationToken, EngineState};
use std::fmt;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

lazy_static! {
    static ref CANCEL: CancellationToken = CancellationToken::new();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Print the geometry of the selected cache.
    Info,
    /// Benchmark the timing of a single memory access.
    Bench,
    /// Prime+probe the selected cache.
    Profile,
}

#[derive(Parser, Debug)]
#[command(name = "cache_profiler", version, about = "Prime+probe profiler of CPU caches")]
struct Cli {
    mode: Mode,

    /// Number of iterations, 0 runs until interrupted.
    #[arg(short, long, default_value_t = 0)]
    iter: u64,

    /// Stop profiling after this many seconds, 0 for no limit.
    #[arg(short, long, default_value_t = 0)]
    seconds: u32,

    /// Core to run on. -1 keeps the current core, for when another tool
    /// binds this process.
    #[arg(short, long, default_value_t = 0, allow_negative_numbers = true)]
    cpu: i64,

    /// Running process to bind to the same core.
    #[arg(short, long, conflicts_with_all = ["program", "program_args"])]
    pid: Option<i32>,

    /// Cache level to profile.
    #[arg(short, long, default_value_t = 1)]
    level: u32,

    /// Program to start next to the measurement, killed afterwards.
    #[arg(long)]
    program: Option<PathBuf>,

    /// Arguments of --program, split on whitespace.
    #[arg(long, requires = "program")]
    program_args: Option<String>,

    /// Dataset file (msgpack, zstd compressed for *.zst). Text on stdout
    /// otherwise.
    #[arg(short, long)]
    output: Option<PathBuf>,
}

struct Failure {
    context: &'static str,
    tag: Option<&'static str>,
    error: Option<Box<dyn std::error::Error>>,
}

impl Failure {
    fn message(context: &'static str) -> Failure {
        Failure {
            context,
            tag: None,
            error: None,
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.context)?;
        if let Some(e) = &self.error {
            write!(f, ": {}", e)?;
            if let Some(tag) = self.tag {
                write!(f, " ({})", tag)?;
            }
            let mut source = e.source();
            while let Some(s) = source {
                write!(f, ": {}", s)?;
                source = s.source();
            }
        }
        Ok(())
    }
}

trait OrFail<T> {
    fn or_fail(self, context: &'static str) -> Result<T, Failure>;
}

fn failure(context: &'static str, e: impl Into<prime_probe::Error>) -> Failure {
    let e = e.into();
    Failure {
        context,
        tag: Some(e.kind_name()),
        error: Some(Box::new(e)),
    }
}

impl<T, E: Into<prime_probe::Error>> OrFail<T> for Result<T, E> {
    fn or_fail(self, context: &'static str) -> Result<T, Failure> {
        self.map_err(|e| failure(context, e))
    }
}

fn os_failure(
    context: &'static str,
    tag: &'static str,
    e: impl std::error::Error + 'static,
) -> Failure {
    Failure {
        context,
        tag: Some(tag),
        error: Some(Box::new(e)),
    }
}

extern "C" fn request_stop(_signo: libc::c_int) {
    CANCEL.cancel();
}

extern "C" fn reap_children(_signo: libc::c_int) {
    while let Ok(status) = waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
        if status == WaitStatus::StillAlive {
            break;
        }
    }
    CANCEL.cancel();
}

fn install_signal_handlers() -> Result<(), Failure> {
    lazy_static::initialize(&CANCEL);
    let stop = SigAction::new(
        SigHandler::Handler(request_stop),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for signal in [Signal::SIGTERM, Signal::SIGALRM, Signal::SIGINT] {
        unsafe { sigaction(signal, &stop) }
            .map_err(|e| {
                os_failure("Error while setting a signal handler", "ERROR_SIGNAL", e)
            })?;
    }
    let reap = SigAction::new(
        SigHandler::Handler(reap_children),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGCHLD, &reap) }
        .map_err(|e| {
            os_failure("Error while setting signal handler SIGCHLD", "ERROR_SIGNAL", e)
        })?;
    Ok(())
}

fn select_cpu(cli: &Cli) -> Result<usize, Failure> {
    let this = Pid::this();
    if cli.cpu > -1 {
        let cpu = cli.cpu as usize;
        println!("Binding this process({}) to CPU {}.", this, cpu);
        focus_cpu_core(Pid::from_raw(0), cpu)
            .or_fail("Error while setting CPU affinity of this process")?;
        Ok(cpu)
    } else {
        println!(
            "WARNING: you have to bind this process({}) to a fixed CPU by yourself.",
            this
        );
        current_cpu().or_fail("Error while retrieving current CPU core")
    }
}

fn require_privileges() -> Result<(), Failure> {
    if !geteuid().is_root() {
        return Err(Failure::message("this program needs root permissions"));
    }
    can_use_rdpmc().or_fail("While checking if the rdpmc instruction can be used in userspace")
}

fn bench(cli: &Cli, cpu: usize) -> Result<(), Failure> {
    let iterations = if cli.iter < 1 {
        DEFAULT_ITERATIONS
    } else {
        cli.iter
    };
    println!("Starting benchmark with {} iterations ...", iterations);
    let counter = PerformanceCounter::enable(cpu).or_fail("Error while benchmarking")?;
    let stats = run_benchmark(&RdpmcPrimitives, iterations as usize, counter)
        .or_fail("Error while benchmarking")?;
    println!("{}", stats);
    Ok(())
}

fn start_companion(cli: &Cli, cpu: usize) -> Result<Companion, Failure> {
    if let Some(pid) = cli.pid {
        println!("Binding the given process({}) to CPU {}.", pid, cpu);
        let companion = Companion::Existing(Pid::from_raw(pid));
        companion
            .bind(cpu)
            .or_fail("Error while setting CPU affinity of the given process")?;
        return Ok(companion);
    }
    let Some(program) = &cli.program else {
        return Ok(Companion::None);
    };
    println!("Starting external program.");
    let child = companion::spawn(program, cli.program_args.as_deref())
        .map_err(|e| os_failure("Error while starting external program", "ERROR_SPAWN", e))?;
    let companion = Companion::Spawned(child);
    if let Some(pid) = companion.pid() {
        println!("Started external program with PID {}.", pid);
    }
    if let Err(e) = companion.bind(cpu) {
        companion.abandon();
        return Err(failure(
            "Error while setting CPU affinity of the external program",
            e,
        ));
    }
    Ok(companion)
}

fn measure(
    cli: &Cli,
    cpu: usize,
    geometry: &CacheGeometry,
    sink: &mut OutputSink,
) -> Result<(), Failure> {
    let buffer = alloc_aligned(geometry).or_fail("Failed to allocate an aligned buffer.")?;
    let companion = start_companion(cli, cpu)?;

    if cli.seconds > 0 {
        alarm::set(cli.seconds);
    }

    let result = prime_probe::profile(&buffer, *geometry, cpu, cli.iter, &CANCEL, sink)
        .or_fail("Error while profiling");

    alarm::cancel();
    let killed = companion.finish();
    let freed = buffer.free();

    let outcome = result?;
    killed.map_err(|e| os_failure("Error while stopping external program", "ERROR_KILL", e))?;
    freed.or_fail("Error while freeing buffer")?;

    debug!(?outcome, "profiling done");
    if outcome.state == EngineState::Cancelled {
        println!("Interrupted after {} iterations.", outcome.iterations);
    }
    Ok(())
}

fn profile(cli: &Cli, cpu: usize, geometry: &CacheGeometry) -> Result<(), Failure> {
    let mut sink = OutputSink::open(cli.output.as_deref(), geometry)
        .or_fail("Error while creating the output")?;

    let mut banner = String::from("Start profiling ");
    if cli.iter > 0 {
        banner.push_str(&format!("for {} iterations ", cli.iter));
    }
    if cli.seconds > 0 {
        banner.push_str(&format!("for {} seconds ", cli.seconds));
    }
    println!("{}\n", banner);

    let result = measure(cli, cpu, geometry, &mut sink);
    let closed = sink.close();
    result?;
    closed.or_fail("Error while closing the output")
}

fn run(cli: &Cli) -> Result<(), Failure> {
    install_signal_handlers()?;
    let cpu = select_cpu(cli)?;

    println!(" --------------------------------------------------------------");
    println!("Using L{} cache on CPU {}", cli.level, cpu);
    let geometry =
        cache_info::discover(cpu, cli.level).or_fail("Error while initializing the cache info")?;
    println!("{}", geometry);
    println!(" --------------------------------------------------------------");

    match cli.mode {
        Mode::Info => {
            println!("Do nothing ... done.");
            return Ok(());
        }
        Mode::Bench => {
            require_privileges()?;
            bench(cli, cpu)?;
        }
        Mode::Profile => {
            require_privileges()?;
            profile(cli, cpu, &geometry)?;
        }
    }
    println!("Finished. Bye :)");
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(failure) => {
            eprintln!("ERROR {}", failure);
            ExitCode::FAILURE
        }
    }
}
