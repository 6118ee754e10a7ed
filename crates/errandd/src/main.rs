//! errandd - Errand marketplace daemon
//!
//! Hosts the matching engine in-process: seeds the runner directory,
//! serves line-delimited JSON commands on stdin, keeps stale offers and
//! overdue errands expired, and can simulate a full errand lifecycle locally.

mod commands;
mod config;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use errand_market::{
    Actor, Coordinate, Decision, LoggingNotifier, MatchPhase, MatchStrategy, Marketplace,
    NewErrand, NoOpGateway, RunnerDirectory, Task, TrustLedger, UserId, start_sweeper,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::commands::Session;
use crate::config::{DaemonConfig, LogFormat};

const DEFAULT_FILTER: &str = "errandd=info,errand_market=info";

#[derive(Parser)]
#[command(name = "errandd")]
#[command(about = "Errand marketplace daemon")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve JSON commands from stdin with periodic expiry sweeps until interrupted
    Run {
        /// Path to config file
        #[arg(short, long, env = "ERRANDD_CONFIG", default_value = "/etc/errandd/config.toml")]
        config: PathBuf,
    },

    /// Post one errand and drive it through matching with simulated runners
    Simulate {
        /// Path to config file (defaults and a sample runner set if omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Pickup latitude
        #[arg(long, default_value_t = 51.5014)]
        latitude: f64,

        /// Pickup longitude
        #[arg(long, default_value_t = -0.1419)]
        longitude: f64,

        /// Task as `description:price`, repeatable
        #[arg(long = "task", value_parser = parse_task, default_value = "collect parcel:1500")]
        tasks: Vec<Task>,

        /// Override the matching strategy
        #[arg(long, value_parser = parse_strategy)]
        strategy: Option<MatchStrategy>,

        /// Runners that reject every offer, repeatable
        #[arg(long)]
        reject: Vec<String>,

        /// How long simulated runners think before accepting
        #[arg(long, default_value_t = 200)]
        accept_after_ms: u64,
    },

    /// Generate a sample config file
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = "errandd.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => {
            let config = DaemonConfig::from_file(&config)
                .with_context(|| format!("loading {}", config.display()))?;
            init_tracing(config.log_format)?;
            run(config).await?;
        }

        Commands::Simulate {
            config,
            latitude,
            longitude,
            tasks,
            strategy,
            reject,
            accept_after_ms,
        } => {
            let mut config = load_or_sample(config.as_deref())?;
            init_tracing(config.log_format)?;
            if let Some(strategy) = strategy {
                config.market.strategy = strategy;
            }
            let pickup = Coordinate::new(latitude, longitude);
            let rejecting = reject.into_iter().map(UserId::new).collect();
            simulate(
                config,
                pickup,
                tasks,
                rejecting,
                Duration::from_millis(accept_after_ms),
            )
            .await?;
        }

        Commands::InitConfig { output } => {
            init_tracing(LogFormat::Text)?;
            init_config(&output)?;
        }
    }

    Ok(())
}

fn init_tracing(format: LogFormat) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(DEFAULT_FILTER))?;
    let registry = tracing_subscriber::registry().with(filter);
    // stdout carries command replies
    match format {
        LogFormat::Text => registry.with(fmt::layer().with_writer(std::io::stderr)).try_init()?,
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()?,
    }
    Ok(())
}

fn load_or_sample(path: Option<&Path>) -> anyhow::Result<DaemonConfig> {
    match path {
        Some(path) => DaemonConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display())),
        None => Ok(DaemonConfig::sample()),
    }
}

fn build_market(config: &DaemonConfig) -> (Arc<Marketplace>, Arc<RunnerDirectory>) {
    let trust = Arc::new(TrustLedger::new());
    let directory = Arc::new(RunnerDirectory::new(Arc::clone(&trust)));
    for runner in &config.runners {
        directory.upsert(runner.user_id(), Some(runner.location()));
    }

    let market = Marketplace::new(config.market.clone(), directory.clone(), Arc::new(NoOpGateway))
        .with_notifier(Arc::new(LoggingNotifier))
        .with_trust(trust);
    (Arc::new(market), directory)
}

async fn run(config: DaemonConfig) -> anyhow::Result<()> {
    let (market, directory) = build_market(&config);
    info!(
        runners = directory.len(),
        strategy = %config.market.strategy,
        offer_ttl_ms = config.market.offer_ttl_ms,
        "starting errandd"
    );

    let sweeper = start_sweeper(Arc::clone(&market), config.market.sweep_interval());
    let session = Session::new(Arc::clone(&market), directory);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut input_open = true;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            line = lines.next_line(), if input_open => {
                match line.context("reading command")? {
                    Some(line) => {
                        if let Some(reply) = session.handle_line(&line) {
                            let mut out = serde_json::to_vec(&reply)?;
                            out.push(b'\n');
                            stdout.write_all(&out).await.context("writing reply")?;
                            stdout.flush().await.context("writing reply")?;
                        }
                    }
                    None => {
                        info!("command stream closed, waiting for shutdown signal");
                        input_open = false;
                    }
                }
            }
            signal = &mut shutdown => {
                signal.context("waiting for shutdown signal")?;
                break;
            }
        }
    }
    info!(sweeps = sweeper.sweeps(), "shutting down");
    sweeper.stop().await;

    let report = market.sweep().primary;
    info!(
        offers_expired = report.offers_expired,
        errands_expired = report.errands_expired,
        "final sweep complete"
    );
    Ok(())
}

async fn simulate(
    config: DaemonConfig,
    pickup: Coordinate,
    tasks: Vec<Task>,
    rejecting: HashSet<UserId>,
    think: Duration,
) -> anyhow::Result<()> {
    let (market, _directory) = build_market(&config);
    let buyer = UserId::new("sim-buyer");

    let errand = market
        .create_errand(NewErrand::new(buyer, pickup, tasks))
        .context("posting errand")?
        .primary;
    info!(errand_id = %errand.id, strategy = %config.market.strategy, "errand posted");

    let matching = market.start_matching(errand.id.clone());
    let runners: Vec<UserId> = config.runners.iter().map(|r| r.user_id()).collect();

    while !matching.is_finished() {
        tokio::time::sleep(Duration::from_millis(25)).await;
        let now = market.now();
        for runner in &runners {
            for offer in market.pending_offers(runner) {
                let decision = if rejecting.contains(runner) {
                    Decision::Reject
                } else if (now - offer.created_at).to_std().unwrap_or_default() >= think {
                    Decision::Accept
                } else {
                    continue;
                };
                match market.respond_to_offer(&offer.id, runner, decision) {
                    Ok(reply) => info!(
                        runner_id = %runner,
                        offer_id = %offer.id,
                        ?decision,
                        status = %reply.primary.errand.status,
                        "runner answered"
                    ),
                    Err(e) => warn!(runner_id = %runner, offer_id = %offer.id, error = %e, "answer refused"),
                }
            }
        }
    }

    let report = matching.await.context("matching task failed")?;
    info!(
        phase = %report.phase,
        offers_sent = report.offers_sent,
        runner_id = ?report.runner_id,
        "matching finished"
    );

    if let (MatchPhase::Matched, Some(runner)) = (report.phase, report.runner_id) {
        market
            .complete_errand(&errand.id, &Actor::Runner(runner))
            .context("completing errand")?;
    }

    let view = market.get_errand_status(&errand.id)?;
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}

fn init_config(output: &Path) -> anyhow::Result<()> {
    DaemonConfig::sample().save(output)?;

    println!("Config written to {}", output.display());
    println!();
    println!("Edit the runner list, then run:");
    println!("  errandd run --config {}", output.display());

    Ok(())
}

fn parse_task(s: &str) -> Result<Task, String> {
    let (description, price) = s
        .rsplit_once(':')
        .ok_or_else(|| format!("expected `description:price`, got `{s}`"))?;
    let price = price
        .trim()
        .parse::<u64>()
        .map_err(|e| format!("invalid price `{price}`: {e}"))?;
    Ok(Task::new(description.trim(), price))
}

fn parse_strategy(s: &str) -> Result<MatchStrategy, String> {
    match s {
        "broadcast" => Ok(MatchStrategy::Broadcast),
        "sequential" => Ok(MatchStrategy::Sequential),
        other => Err(format!("unknown strategy `{other}`")),
    }
}
