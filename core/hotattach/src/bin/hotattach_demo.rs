//! hotattach-demo: a small target process with the debugger armed.
//!
//! Prints `PID <pid>` on stdout once the debugger is ready, then runs a tick
//! loop. Attach with `hotattach <pid>`; `counter` in the shell shows the
//! current tick and `explode` panics inside the session.

use clap::Parser;
use hotattach::{logging, run_guarded, Debugger, DebuggerConfig, InspectShell};
use hotattach_protocol::parse_signal;
use std::io::Write;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const TICK: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(name = "hotattach-demo")]
#[command(about = "Demo target process with an armed debugger")]
#[command(version)]
struct Cli {
    /// Only open a session on a fault (default: proactive)
    #[arg(long)]
    reactive: bool,

    /// Activation signal, by name or number
    #[arg(long, value_parser = parse_signal)]
    signal: Option<i32>,

    /// Directory for the socket and readiness marker
    #[arg(long, value_name = "DIR")]
    runtime_dir: Option<PathBuf>,

    /// Serve sessions over TCP on this loopback port
    #[arg(long, value_name = "PORT")]
    tcp_port: Option<u16>,

    /// Panic after this many seconds
    #[arg(long, value_name = "SECS")]
    panic_after: Option<u64>,

    /// Return an error from the main loop after this many seconds
    #[arg(long, value_name = "SECS")]
    fail_after: Option<u64>,

    /// Exit normally after this many seconds
    #[arg(long, value_name = "SECS")]
    run_for: Option<u64>,

    /// Also write a daily log file into this directory
    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
#[error("work loop gave up after {ticks} ticks")]
struct WorkFailed {
    ticks: u64,
}

fn main() {
    let cli = Cli::parse();
    let _log_guard = logging::init(cli.log_dir.as_deref());

    let mut config = DebuggerConfig::from_env();
    config = if cli.reactive {
        config.reactive()
    } else {
        config.proactive()
    };
    if let Some(signal) = cli.signal {
        config = config.with_signal(signal);
    }
    if let Some(dir) = &cli.runtime_dir {
        config = config.with_runtime_dir(dir);
    }
    if let Some(port) = cli.tcp_port {
        config = config.tcp(port, true);
    }

    let ticks = Arc::new(AtomicU64::new(0));
    let shown = Arc::clone(&ticks);
    let shell = InspectShell::new()
        .with_prompt("(demo) ")
        .with_command("counter", "current tick count", move |_, _| {
            Ok(format!("ticks={}", shown.load(Ordering::Relaxed)))
        })
        .with_command("explode", "panic inside the shell", |_, _| -> Result<String, String> {
            panic!("shell command exploded")
        });

    let debugger = match Debugger::init_with_engine(config, Arc::new(shell)) {
        Ok(debugger) => debugger,
        Err(err) => {
            tracing::error!(error = %err, "hotattach-demo failed to arm debugger");
            process::exit(1);
        }
    };

    let mut stdout = std::io::stdout();
    let _ = writeln!(stdout, "PID {}", debugger.pid());
    let _ = stdout.flush();

    let result = run_guarded(|| work(&cli, &ticks));

    if let Err(err) = debugger.shutdown() {
        tracing::warn!(error = %err, "hotattach-demo failed to disarm debugger");
    }
    if let Err(err) = result {
        tracing::error!(error = %err, "hotattach-demo failed");
        process::exit(1);
    }
}

fn work(cli: &Cli, ticks: &AtomicU64) -> Result<(), WorkFailed> {
    let started = Instant::now();
    loop {
        thread::sleep(TICK);
        let count = ticks.fetch_add(1, Ordering::Relaxed) + 1;
        let elapsed = started.elapsed().as_secs();

        if cli.panic_after.is_some_and(|secs| elapsed >= secs) {
            panic!("demo panic after {} ticks", count);
        }
        if cli.fail_after.is_some_and(|secs| elapsed >= secs) {
            return Err(WorkFailed { ticks: count });
        }
        if cli.run_for.is_some_and(|secs| elapsed >= secs) {
            tracing::info!(ticks = count, "Work loop finished");
            return Ok(());
        }
    }
}
