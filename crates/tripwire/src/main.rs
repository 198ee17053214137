use std::path::PathBuf;
use std::process;
use std::time::Duration;

use chrono::{DateTime, Local};
use clap::{Parser, Subcommand};
use tripwire_core::classify::{classify_in, select_mode};
use tripwire_core::platform::{open_process, region_factory};
use tripwire_core::slots::SlotRegistry;
use tripwire_core::{
    AccessMode, Address, HitRecord, ProcessId, SessionConfig, ShutdownReport, WatchEvent, WatchEventReceiver,
    WatchpointConfig, WatchpointSession,
};
use tripwire_utils::{info, init_logging, warn, LogFormat, LogLevel, LoggingConfig};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Watch memory accesses inside a running Windows process.
#[derive(Parser, Debug)]
#[command(name = "tripwire")]
#[command(version)]
#[command(about = "Watch memory accesses inside a running Windows process", long_about = None)]
struct Cli
{
    /// Log level (overrides RUST_LOG)
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,
    /// Log format: pretty or json (overrides TRIPWIRE_LOG_FORMAT)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,
    /// Also log to this file (overrides TRIPWIRE_LOG_FILE)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands
{
    /// Report every access to an address until Ctrl-C
    Watch
    {
        /// Target process ID
        #[arg(long)]
        pid: u32,
        /// Address to watch (hex with 0x prefix, or decimal)
        #[arg(long, value_parser = parse_address)]
        address: Address,
        /// Bytes to watch: 1, 2, 4 or 8
        #[arg(long, default_value_t = 4)]
        size: u32,
        /// Only report writes (always uses a hardware breakpoint)
        #[arg(long, default_value_t = false)]
        write_only: bool,
        /// Agent library to load into the target
        #[arg(long)]
        agent: Option<PathBuf>,
        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<u64>,
    },
    /// Show whether an address is static or dynamic and which mode would watch it
    Classify
    {
        /// Target process ID
        #[arg(long)]
        pid: u32,
        /// Address to classify (hex with 0x prefix, or decimal)
        #[arg(long, value_parser = parse_address)]
        address: Address,
    },
}

fn parse_address(s: &str) -> Result<Address, String>
{
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
        None => s.replace('_', "").parse::<u64>(),
    };
    parsed
        .map(Address::new)
        .map_err(|e| format!("invalid address '{s}': {e}"))
}

fn main()
{
    let cli = Cli::parse();

    let mut logging = LoggingConfig::from_env();
    if let Some(level) = cli.log_level {
        logging = logging.with_level(level);
    }
    if let Some(format) = cli.log_format {
        logging = logging.with_format(format);
    }
    if let Some(file) = &cli.log_file {
        logging = logging.with_file(file);
    }
    let _guard = match init_logging(&logging) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Watch {
            pid,
            address,
            size,
            write_only,
            agent,
            duration,
        } => {
            let access = if write_only {
                AccessMode::WriteOnly
            } else {
                AccessMode::ReadWrite
            };
            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(Into::into)
                .and_then(|rt| {
                    rt.block_on(watch(
                        ProcessId::from(pid),
                        address,
                        size,
                        access,
                        agent,
                        duration.map(Duration::from_secs),
                    ))
                })
        }
        Commands::Classify { pid, address } => run_classify(ProcessId::from(pid), address),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

async fn watch(
    pid: ProcessId,
    address: Address,
    size: u32,
    access: AccessMode,
    agent: Option<PathBuf>,
    duration: Option<Duration>,
) -> CliResult<()>
{
    let watch = WatchpointConfig::new(address, size, access)?;
    let mut config = SessionConfig::from_env();
    if let Some(agent) = agent {
        config = config.with_agent_path(agent);
    }

    let target = open_process(pid)?;
    let mut session = WatchpointSession::new(target, region_factory()?, SlotRegistry::shared(), config);
    let events = session.subscribe();

    let mode = session.start_monitoring(watch)?;
    println!("Watching {address} ({size} bytes, {access}) in process {pid} via {mode}. Press Ctrl-C to stop.");

    let printer = tokio::task::spawn_blocking(move || print_events(&events));

    match duration {
        Some(limit) => {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => signal?,
                () = tokio::time::sleep(limit) => info!("Watch duration of {limit:?} elapsed"),
            }
        }
        None => tokio::signal::ctrl_c().await?,
    }

    let hits = session.hit_count().unwrap_or(0);
    let report = session.stop_monitoring()?;
    let printed = printer.await?;
    println!("Stopped after {printed} reported hit(s) ({hits} recorded by the agent)");
    if let Some(report) = report {
        print_report(&report);
    }
    Ok(())
}

fn print_events(events: &WatchEventReceiver) -> u64
{
    let mut printed = 0;
    for event in events {
        match event {
            WatchEvent::Hit(hit) => {
                print_hit(&hit);
                printed += 1;
            }
            WatchEvent::Stopped => break,
        }
    }
    printed
}

fn print_hit(hit: &HitRecord)
{
    let at: DateTime<Local> = hit.received_at.into();
    println!(
        "{} #{:<6} {} thread {}",
        at.format("%H:%M:%S%.3f"),
        hit.sequence,
        hit.address,
        hit.thread_id
    );
}

fn print_report(report: &ShutdownReport)
{
    if report.trap_flags_cleared > 0 {
        info!("Cancelled {} pending single-step(s)", report.trap_flags_cleared);
    }
    if report.drain_timed_out {
        warn!("Agent handlers were still running when shutdown gave up waiting");
    }
    for error in &report.errors {
        warn!("Shutdown: {error}");
    }
}

fn run_classify(pid: ProcessId, address: Address) -> CliResult<()>
{
    let target = open_process(pid)?;
    let class = classify_in(&*target, address);
    println!("{address} in process {pid} is {class}");
    for access in [AccessMode::ReadWrite, AccessMode::WriteOnly] {
        println!("  {access:<10} -> {}", select_mode(class, access));
    }
    Ok(())
}
