//! StarForth command-line front end: argument parsing, logging setup and
//! the outer interpreter loop.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::rc::Rc;

use clap::error::ErrorKind;
use clap::{Parser, ValueEnum};
use log::LevelFilter;

use starforth::blkio;
use starforth::heartbeat::HeartbeatMode;
use starforth::host::{HostServices, ParityHost, StdHost};
use starforth::vm::Vm;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum HeartbeatArg {
    Off,
    Summary,
    Full,
}

impl From<HeartbeatArg> for HeartbeatMode {
    fn from(arg: HeartbeatArg) -> Self {
        match arg {
            HeartbeatArg::Off => Self::Off,
            HeartbeatArg::Summary => Self::Summary,
            HeartbeatArg::Full => Self::Full,
        }
    }
}

/// StarForth - a Forth-79 virtual machine
#[derive(Debug, Parser)]
#[command(name = "starforth", version, about)]
struct Cli {
    /// Script mode: suppress prompts and "ok" output
    #[arg(short = 's')]
    script: bool,

    /// Use a raw disk image file as the backing device
    #[arg(long = "disk-img", value_name = "PATH")]
    disk_img: Option<PathBuf>,

    /// RAM backing size in MiB when no image is given
    #[arg(long = "ram-disk", value_name = "MB", default_value_t = 1,
          value_parser = clap::value_parser!(u32).range(1..))]
    ram_disk: u32,

    /// Log only errors
    #[arg(long = "log-error")]
    log_error: bool,

    /// Log warnings and errors
    #[arg(long = "log-warn")]
    log_warn: bool,

    /// Log informational messages (default)
    #[arg(long = "log-info")]
    log_info: bool,

    /// Log test diagnostics
    #[arg(long = "log-test")]
    log_test: bool,

    /// Log everything
    #[arg(long = "log-debug")]
    log_debug: bool,

    /// Disable all logging
    #[arg(long = "log-none")]
    log_none: bool,

    /// Stop diagnostic runs at the first failure
    #[arg(long = "fail-fast")]
    fail_fast: bool,

    /// Run the benchmark workload for N iterations and exit
    #[arg(long, value_name = "N", num_args = 0..=1, default_missing_value = "1000")]
    benchmark: Option<u32>,

    /// Exhaustive diagnostic mode
    #[arg(long = "break-me")]
    break_me: bool,

    /// Design-of-experiments mode: run the workload once, collect metrics
    #[arg(long)]
    doe: bool,

    /// Heartbeat telemetry mode
    #[arg(long = "heartbeat-log", value_enum, default_value_t = HeartbeatArg::Off)]
    heartbeat_log: HeartbeatArg,

    /// Deterministic clock for bit-reproducible runs
    #[arg(long)]
    parity: bool,
}

impl Cli {
    fn log_level(&self) -> LevelFilter {
        if self.doe || self.log_none {
            LevelFilter::Off
        } else if self.log_debug {
            LevelFilter::Trace
        } else if self.log_test {
            LevelFilter::Debug
        } else if self.log_warn {
            LevelFilter::Warn
        } else if self.log_error {
            LevelFilter::Error
        } else {
            LevelFilter::Info
        }
    }
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err)
            if matches!(
                err.kind(),
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion
            ) =>
        {
            let _ = err.print();
            return ExitCode::SUCCESS;
        }
        Err(err) => {
            let _ = err.print();
            return ExitCode::from(1);
        }
    };

    env_logger::Builder::new()
        .filter_level(cli.log_level())
        .format_timestamp_millis()
        .init();

    let host: Rc<dyn HostServices> = if cli.parity {
        Rc::new(ParityHost::new(100))
    } else {
        Rc::new(StdHost::new())
    };

    let mut vm = Vm::new(host.clone());

    let (device, used_file) = match blkio::open_backend(cli.disk_img.as_deref(), cli.ram_disk) {
        Ok(pair) => pair,
        Err(err) => {
            eprintln!("failed to open block backend: {err}");
            return ExitCode::from(1);
        }
    };
    let info = device.info();
    log::info!(
        "blkio: backend={} units={} size={}B ro={}",
        if used_file { "FILE" } else { "RAM" },
        info.total_units,
        info.physical_size_bytes,
        info.read_only
    );
    if let Err(err) = vm.blocks.attach_device(device, &*host) {
        eprintln!("failed to attach block device: {err}");
        return ExitCode::from(1);
    }

    let code = if cli.doe {
        run_doe(&mut vm, &cli)
    } else if let Some(iterations) = cli.benchmark {
        run_benchmark(&mut vm, iterations, cli.heartbeat_log.into())
    } else if cli.break_me {
        run_break_me(&mut vm, cli.fail_fast)
    } else {
        repl(&mut vm, &cli)
    };

    if let Err(err) = vm.blocks.detach() {
        log::warn!("block shutdown failed: {err}");
    }
    code
}

/// Interactive (or scripted) outer interpreter loop.
fn repl(vm: &mut Vm, cli: &Cli) -> ExitCode {
    let heartbeat: HeartbeatMode = cli.heartbeat_log.into();
    if !cli.script {
        println!("StarForth {} (Forth-79)", env!("CARGO_PKG_VERSION"));
    }

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        vm.interpret(&line);

        if heartbeat == HeartbeatMode::Full {
            eprintln!("{}", vm.heartbeat_tick().csv_row());
        }

        if vm.halted {
            break;
        }
        if vm.error {
            if cli.script {
                return ExitCode::from(1);
            }
            println!(" error");
            vm.quiesce();
            continue;
        }
        if !cli.script {
            println!(" ok");
            let _ = io::stdout().flush();
        }
    }

    if heartbeat == HeartbeatMode::Summary {
        let tick = vm.heartbeat_tick();
        eprintln!("{}", tick.csv_row());
    }
    ExitCode::SUCCESS
}

const BENCH_SETUP: &[&str] = &[
    ": BENCH-SQUARE DUP * ;",
    ": BENCH-SUM 0 SWAP 0 DO I + LOOP ;",
    ": BENCH-ROUND 17 BENCH-SQUARE DROP 100 BENCH-SUM DROP ;",
];

/// Run the interpreter workload `iterations` times and report cache
/// statistics.
fn run_benchmark(vm: &mut Vm, iterations: u32, heartbeat: HeartbeatMode) -> ExitCode {
    log::info!("benchmark: {iterations} iterations");
    for line in BENCH_SETUP {
        vm.interpret(line);
        if vm.error {
            eprintln!("benchmark setup failed");
            return ExitCode::from(1);
        }
    }

    for i in 0..iterations {
        vm.interpret("BENCH-ROUND");
        if vm.error {
            eprintln!("benchmark failed at iteration {i}");
            return ExitCode::from(1);
        }
        if heartbeat == HeartbeatMode::Full && i % 100 == 0 {
            eprintln!("{}", vm.heartbeat_tick().csv_row());
        }
    }

    print!("{}", vm.cache.stats.summary());
    let tick = vm.heartbeat_tick();
    println!(
        "executed {} words in {} ns",
        vm.word_executions(),
        tick.elapsed_ns
    );
    ExitCode::SUCCESS
}

/// DoE mode: one full workload pass, metrics only, exit 2 on instability.
fn run_doe(vm: &mut Vm, cli: &Cli) -> ExitCode {
    vm.interpret("PHYSICS-RESET-STATS");
    vm.quiesce();

    for line in BENCH_SETUP {
        vm.interpret(line);
    }
    let mut unstable = vm.error;
    for _ in 0..1000 {
        vm.interpret("BENCH-ROUND");
        if vm.error {
            unstable = true;
            vm.quiesce();
        }
    }

    let tick = vm.heartbeat_tick();
    if HeartbeatMode::from(cli.heartbeat_log) != HeartbeatMode::Off {
        eprintln!("{}", tick.csv_row());
    }
    if unstable {
        return ExitCode::from(2);
    }
    ExitCode::SUCCESS
}

/// Diagnostic sweep: run edge-case probes and report.
fn run_break_me(vm: &mut Vm, fail_fast: bool) -> ExitCode {
    // (source, expect_error)
    let probes: &[(&str, bool)] = &[
        ("1 2 + 3 = 0= 0= DROP", false),
        ("DROP", true),
        ("NOSUCHWORD", true),
        (": BM-NEST1 1 + ; : BM-NEST2 BM-NEST1 BM-NEST1 ; 0 BM-NEST2 2 = DROP", false),
        (": BM-DEEP BEGIN DUP 0> WHILE 1- REPEAT ; 100 BM-DEEP DROP", false),
        (": BM-COUNT 0 SWAP 0 DO I + LOOP ; 5 BM-COUNT 10 = DROP", false),
        ("1 0 /", true),
        ("FORGET BM-NEST2", false),
    ];

    let mut failures = 0u32;
    for (i, &(source, expect_error)) in probes.iter().enumerate() {
        vm.interpret(source);
        let failed = vm.error != expect_error;
        if failed {
            failures += 1;
            println!("probe {i} FAIL: '{source}'");
            if fail_fast {
                vm.quiesce();
                break;
            }
        } else {
            println!("probe {i} pass");
        }
        vm.quiesce();
    }

    println!("break-me: {failures} failures / {} probes", probes.len());
    if failures > 0 {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    }
}
