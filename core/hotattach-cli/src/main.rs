//! hotattach: attach to a process that embeds the hotattach debugger.
//!
//! ```text
//! hotattach 4242
//! hotattach --signal USR1 --runtime-dir /run/user/1000 4242
//! hotattach --tcp 127.0.0.1:7777
//! ```
//!
//! Status lines go to stdout with the session; diagnostics go to stderr.

use clap::Parser;
use hotattach_cli::{attach_tcp, AttachConfig, AttachError, Attacher, RelayReport};
use hotattach_protocol::parse_signal;
use std::env;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hotattach")]
#[command(about = "Attach an interactive debugger to a running process")]
#[command(version)]
struct Cli {
    /// The PID of the process to attach to
    #[arg(value_name = "PID", required_unless_present = "tcp")]
    pid: Option<u32>,

    /// Activation signal when the target's marker does not name one
    #[arg(long, value_parser = parse_signal)]
    signal: Option<i32>,

    /// Directory holding debug sockets and readiness markers
    #[arg(long, value_name = "DIR")]
    runtime_dir: Option<PathBuf>,

    /// Delay between readiness checks
    #[arg(long, value_name = "MS")]
    poll_interval_ms: Option<u64>,

    /// Readiness checks before giving up
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u32).range(1..))]
    max_attempts: Option<u32>,

    /// Attach to a target serving over TCP instead of a local pid
    #[arg(long, value_name = "HOST:PORT", conflicts_with = "pid")]
    tcp: Option<SocketAddr>,
}

fn main() {
    init_logging();
    let cli = Cli::parse();

    match run(cli) {
        Ok(_) => println!("Debugger terminated."),
        Err(err) => {
            println!("{}", err);
            tracing::debug!(error = ?err, "hotattach failed");
            process::exit(1);
        }
    }
}

fn run(cli: Cli) -> Result<RelayReport, AttachError> {
    let stdin = io::stdin();
    let mut operator = stdin.lock();
    let mut display = io::stdout();

    if let Some(addr) = cli.tcp {
        println!("Trying to attach to {}...", addr);
        return attach_tcp(addr, &mut operator, &mut display);
    }

    let mut config = AttachConfig::from_env();
    if let Some(signal) = cli.signal {
        config.signal = signal;
    }
    if let Some(dir) = cli.runtime_dir {
        config.runtime_dir = dir;
    }
    if let Some(ms) = cli.poll_interval_ms {
        config.poll_interval = Duration::from_millis(ms);
    }
    if let Some(attempts) = cli.max_attempts {
        config.max_attempts = attempts;
    }

    let attacher = Attacher::new(config);
    let pid = attacher.resolve(cli.pid.unwrap_or(0))?;
    println!("Trying to attach to process with PID {}...", pid);
    let _ = display.flush();

    let report = attacher.attach(pid, &mut operator, &mut display)?;
    // Session output may not end with a newline.
    println!();
    Ok(report)
}

fn init_logging() {
    let debug_enabled = env::var("HOTATTACH_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}
