use std::path::PathBuf;
use std::time::{Duration, UNIX_EPOCH};

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing::level_filters::LevelFilter;

use servicemon::config::Config;
use servicemon::database::{EventLog, initialize_database};
use servicemon::monitoring::probe::ProbeArgs;
use servicemon::monitoring::validation::{validate_address, validate_timeout};
use servicemon::monitoring::{Probe, ProbeKind, Target};
use servicemon::orchestrator::Orchestrator;
use servicemon::pool::open_pool;

/// Servicemon - periodic service availability monitor
#[derive(Parser, Debug)]
#[command(name = "servicemon", about = "Periodic service availability monitor", version)]
struct Args {
    /// Config file (defaults to $XDG_CONFIG_HOME/servicemon/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every configured job until Ctrl+C
    Run,
    /// Probe one service once and print the outcome
    Check {
        #[arg(long)]
        kind: ProbeKind,
        #[arg(long)]
        address: String,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long, default_value_t = 5)]
        timeout: u64,
        /// Probe argument as key=value, may be repeated
        #[arg(long = "arg", value_parser = parse_key_value)]
        args: Vec<(String, String)>,
    },
    /// Print the effective configuration
    Config,
    /// Print the latest stored state changes of a job
    History {
        #[arg(long)]
        job: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

fn log_level(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

fn parse_key_value(raw: &str) -> Result<(String, String)> {
    let (key, value) = raw.split_once('=').ok_or_else(|| anyhow!("Expected key=value, got '{raw}'"))?;
    Ok((key.trim().to_string(), value.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logger::init_with_level(log_level(args.verbose));

    match args.command {
        Command::Check { kind, address, port, timeout, args } => {
            check(kind, address, port, timeout, args.into_iter().collect()).await
        }
        Command::Run => {
            let config = Config::from_config(args.config.as_ref())?;
            info!("Starting servicemon with {} services", config.services.len());
            Orchestrator::start(config).await
        }
        Command::Config => {
            let config = Config::from_config(args.config.as_ref())?;
            print!("{config}");
            Ok(())
        }
        Command::History { job, limit } => {
            let config = Config::from_config(args.config.as_ref())?;
            history(&config, &job, limit).await
        }
    }
}

async fn check(kind: ProbeKind, address: String, port: Option<u16>, timeout: u64, args: ProbeArgs) -> Result<()> {
    validate_address(&address)?;
    validate_timeout(timeout)?;
    let probe = Probe::from_args(kind, &args)?;
    let port = port.or(kind.default_port()).ok_or_else(|| anyhow!("--port is required for {kind} probes"))?;
    let target = Target::new(address, port);

    let observation = probe.observe(&target, Duration::from_secs(timeout)).await;
    println!("{} {}: {}", target, observation.outcome.status, observation.outcome.diagnostic);
    if let Some(elapsed) = observation.response_time() {
        println!("response time: {:.3}s", elapsed.as_secs_f64());
    }
    Ok(())
}

async fn history(config: &Config, job: &str, limit: usize) -> Result<()> {
    let pool = open_pool(&config.storage.database, 1)
        .await
        .with_context(|| format!("Opening {}", config.storage.database.display()))?;
    initialize_database(&pool).await?;

    let events = EventLog::new(pool).recent(job, limit).await?;
    if events.is_empty() {
        println!("No events stored for {job}");
    }
    for event in events {
        let at = event.timestamp.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or_default();
        println!("{at} {} -> {}: {}", event.prior, event.state, event.diagnostic);
    }
    Ok(())
}
