use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rampart::analysis::AnalysisOutcome;
use rampart::clock::ManualClock;
use rampart::config::RampartConfig;
use rampart::decision::Decision;
use rampart::engine::{AdmissionEngine, AdmissionRequest};
use rampart::geo::StaticGeoResolver;
use rampart::store::Counters;

#[derive(Parser)]
#[command(name = "rampart", version, about = "Multi-dimensional admission control")]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check a configuration file and print the effective configuration
    Validate {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Replay recorded requests through an in-memory engine, printing one
    /// JSON decision per line
    Replay {
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// JSON Lines file of recorded requests
        events: PathBuf,
    },
}

/// One recorded request.
#[derive(Debug, Deserialize)]
struct ReplayRecord {
    /// When the request arrived
    at: DateTime<Utc>,
    #[serde(flatten)]
    request: AdmissionRequest,
    /// Response status, fed back to the abuse detector when present
    #[serde(default)]
    status_code: Option<u16>,
    #[serde(default)]
    response_time_ms: f64,
}

#[derive(Debug, Serialize)]
struct ReplayLine<'a> {
    at: DateTime<Utc>,
    client: &'a str,
    method: &'a str,
    path: &'a str,
    decision: &'a Decision,
}

fn init_tracing(json: bool, level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json, &cli.log_level);

    match cli.command {
        Command::Validate { config } => validate(config),
        Command::Replay { config, events } => replay(config, events).await,
    }
}

fn validate(path: PathBuf) -> anyhow::Result<()> {
    let config = RampartConfig::load(Some(&path))
        .with_context(|| format!("invalid configuration in {}", path.display()))?;
    info!(path = %path.display(), "Configuration is valid");
    println!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}

async fn replay(config: Option<PathBuf>, events: PathBuf) -> anyhow::Result<()> {
    let config = RampartConfig::load(config.as_deref()).context("failed to load configuration")?;
    let file = std::fs::File::open(&events)
        .with_context(|| format!("cannot open {}", events.display()))?;

    let resolver = Arc::new(StaticGeoResolver::from_entries(
        config.geo.static_locations.clone(),
        config.geo.default_location.clone(),
    ));
    let clock = ManualClock::new(Utc::now());
    let engine = AdmissionEngine::new(
        config,
        Counters::in_memory(),
        resolver,
        Arc::new(clock.clone()),
    );
    info!(events = %events.display(), "Replaying recorded requests");

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let (mut replayed, mut denied) = (0u64, 0u64);

    for (number, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: ReplayRecord = match serde_json::from_str(&line) {
            Ok(record) => record,
            Err(e) => {
                warn!(line = number + 1, error = %e, "Skipping malformed record");
                continue;
            }
        };

        clock.set(record.at);
        let admission = engine.check(&record.request).await;
        replayed += 1;
        if !admission.is_allowed() {
            denied += 1;
        }

        let output = ReplayLine {
            at: record.at,
            client: &record.request.client,
            method: &record.request.method,
            path: &record.request.path,
            decision: &admission.decision,
        };
        writeln!(out, "{}", serde_json::to_string(&output)?)?;

        if let Some(status) = record.status_code {
            if let Some(ticket) = admission.ticket {
                let outcome = if status < 400 {
                    AnalysisOutcome::success()
                } else {
                    AnalysisOutcome::failure()
                };
                engine.finish_analysis(ticket, outcome);
            }
            engine.record_outcome(&record.request, status, record.response_time_ms);
        }
    }

    info!(replayed = replayed, denied = denied, "Replay finished");
    Ok(())
}
