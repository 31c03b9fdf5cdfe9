//! VeriGreen CLI - binary entry point for the claim verification orchestrator.
//!
//! # Architecture
//!
//! ```text
//! main() -> init_tracing() -> load config -> subcommand
//!                                               |
//!      run:      EventSource --claims-----> Orchestrator::run
//!                            --randomness-> RandomnessClient::resolve_from
//!      backfill: feed history ------------> Orchestrator::backfill
//!      records:  RecordStore::list -> JSON lines on stdout
//!      sample:   select_sample -> JSON array on stdout
//! ```
//!
//! `run` exits non-zero when the feed exhausts its reconnect attempts; no new
//! claims can be processed until the process is restarted.

mod wiring;

use std::fs::{self, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use verigreen_config::{VerigreenConfig, config_dir};
use tokio::task::JoinHandle;
use verigreen_engine::{
    ConnectionState, DEFAULT_SAMPLE_SIZE, EventSource, EventSourceError, RunSummary,
    select_sample,
};
use verigreen_types::{ClaimantAddress, EventKind, EventMarker, RecordId, SubmissionRecord};

#[derive(Parser)]
#[command(name = "verigreen", version, about = "Verifiable claim audits for land stewardship")]
struct Cli {
    /// Config file (default: ~/.verigreen/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Subscribe to the feed and verify claims until interrupted or the feed fails.
    Run,
    /// Re-drive claim events between two feed markers (inclusive).
    Backfill {
        #[arg(long)]
        from: u64,
        #[arg(long)]
        to: u64,
    },
    /// Print stored submission records as JSON lines.
    Records {
        #[arg(long)]
        claimant: Option<String>,
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Recompute an audit sample from a published seed.
    Sample {
        #[arg(long)]
        seed: u64,
        #[arg(long)]
        grid_size: usize,
        #[arg(long, default_value_t = DEFAULT_SAMPLE_SIZE)]
        count: usize,
    },
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (log_file, init_warnings) = open_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(env_filter)
        .init();
    for warning in init_warnings {
        tracing::warn!("{warning}");
    }
}

fn open_log_file() -> (Option<(PathBuf, fs::File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in log_file_candidates() {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&candidate)
        {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => {
                warnings.push(format!(
                    "Failed to open log file {}: {e}",
                    candidate.display()
                ));
            }
        }
    }

    (None, warnings)
}

fn log_file_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    // Primary: ~/.verigreen/logs/verigreen.log
    if let Some(dir) = config_dir() {
        candidates.push(dir.join("logs").join("verigreen.log"));
    }

    // Fallback: ./.verigreen/logs/verigreen.log
    candidates.push(
        PathBuf::from(".verigreen")
            .join("logs")
            .join("verigreen.log"),
    );

    candidates
}

fn load_config(path: Option<&PathBuf>) -> Result<VerigreenConfig> {
    let loaded = match path {
        Some(path) => VerigreenConfig::load_from(path)?,
        None => VerigreenConfig::load()?,
    };
    Ok(loaded.unwrap_or_else(|| {
        tracing::info!("No config file found; using defaults");
        VerigreenConfig::default()
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Command::Sample {
            seed,
            grid_size,
            count,
        } => {
            let sample = select_sample(seed, grid_size, count);
            println!("{}", serde_json::to_string(&sample)?);
            Ok(())
        }
        Command::Records { claimant, limit } => {
            let config = load_config(cli.config.as_ref())?;
            print_records(&config, claimant.as_deref(), limit)
        }
        Command::Run => {
            let config = load_config(cli.config.as_ref())?;
            run_live(&config).await
        }
        Command::Backfill { from, to } => {
            if from > to {
                bail!("--from ({from}) must not exceed --to ({to})");
            }
            let config = load_config(cli.config.as_ref())?;
            backfill(&config, EventMarker::new(from), EventMarker::new(to)).await
        }
    }
}

async fn run_live(config: &VerigreenConfig) -> Result<()> {
    let store = Arc::new(Mutex::new(wiring::open_store(config)?));
    let (orchestrator, randomness) = wiring::orchestrator(config, store)?;
    let feed = Arc::new(wiring::feed(config)?);

    let mut source = EventSource::new(feed, wiring::reconnect_policy(config));
    let randomness_events =
        source.subscribe_all(&[EventKind::RandomnessRequested, EventKind::RandomnessFulfilled]);
    let claims = source.subscribe(EventKind::ClaimSubmitted);
    watch_connection(&source);

    let resolver = tokio::spawn(randomness.resolve_from(randomness_events));
    let intake = tokio::spawn(orchestrator.run(claims));

    let feed_result = tokio::select! {
        result = source.run() => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted; finishing in-flight claims");
            Ok(())
        }
    };

    // The source is gone, so both subscriptions are closed and the tasks wind down.
    let summary = intake.await.context("Claim intake task failed")?;
    let _ = resolver.await;
    report(&summary);

    feed_result.context("Event feed failed; restart required to process new claims")
}

async fn backfill(config: &VerigreenConfig, from: EventMarker, to: EventMarker) -> Result<()> {
    let store = Arc::new(Mutex::new(wiring::open_store(config)?));
    let (orchestrator, randomness) = wiring::orchestrator(config, store)?;
    let feed = Arc::new(wiring::feed(config)?);

    let mut source = EventSource::new(feed, wiring::reconnect_policy(config));
    let history = source
        .historical_events(EventKind::ClaimSubmitted, from, to)
        .await
        .with_context(|| format!("Failed to fetch claim history {from}..={to}"))?;
    tracing::info!(events = history.len(), %from, %to, "Backfilling claim events");

    // Randomness still arrives on the live feed.
    let randomness_events =
        source.subscribe_all(&[EventKind::RandomnessRequested, EventKind::RandomnessFulfilled]);
    let resolver = tokio::spawn(randomness.resolve_from(randomness_events));
    let live = tokio::spawn(source.run());

    let summary = orchestrator.backfill(history).await;
    let feed_result = stop_live_feed(live).await;
    let _ = resolver.await;
    report(&summary);
    feed_result
}

/// Cancels the live feed task, surfacing any failure it ended with first.
async fn stop_live_feed(live: JoinHandle<Result<(), EventSourceError>>) -> Result<()> {
    live.abort();
    match live.await {
        Ok(result) => {
            result.context("Event feed failed during backfill; some claims lost their randomness")
        }
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => Err(e).context("Event feed task failed"),
    }
}

fn watch_connection(source: &EventSource) {
    let mut state = source.state();
    tokio::spawn(async move {
        while state.changed().await.is_ok() {
            let current = *state.borrow_and_update();
            match current {
                ConnectionState::Failed => tracing::error!(state = %current, "Feed connection"),
                ConnectionState::Reconnecting { .. } => {
                    tracing::warn!(state = %current, "Feed connection");
                }
                _ => tracing::info!(state = %current, "Feed connection"),
            }
        }
    });
}

fn report(summary: &RunSummary) {
    tracing::info!(?summary, "Run finished");
    eprintln!(
        "verified: {}, failed: {}, rejected: {}, error: {}, duplicate: {}, invalid: {}, unrecorded: {}",
        summary.verified,
        summary.failed,
        summary.rejected,
        summary.errored,
        summary.duplicates,
        summary.invalid,
        summary.unrecorded,
    );
}

#[derive(Serialize)]
struct RecordLine<'a> {
    id: RecordId,
    status_text: &'static str,
    #[serde(flatten)]
    record: &'a SubmissionRecord,
}

fn print_records(config: &VerigreenConfig, claimant: Option<&str>, limit: usize) -> Result<()> {
    let claimant = claimant
        .map(ClaimantAddress::new)
        .transpose()
        .context("Invalid --claimant")?;
    let store = wiring::open_store(config)?;

    for stored in store.list(claimant.as_ref(), limit)? {
        let line = RecordLine {
            id: stored.id,
            status_text: stored.record.status.display_text(),
            record: &stored.record,
        };
        println!("{}", serde_json::to_string(&line)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_backfill_range() {
        let cli = Cli::try_parse_from(["verigreen", "backfill", "--from", "10", "--to", "20"])
            .unwrap();
        assert!(matches!(cli.command, Command::Backfill { from: 10, to: 20 }));
    }

    #[test]
    fn sample_count_defaults() {
        let cli =
            Cli::try_parse_from(["verigreen", "sample", "--seed", "155", "--grid-size", "10"])
                .unwrap();
        match cli.command {
            Command::Sample { count, .. } => assert_eq!(count, DEFAULT_SAMPLE_SIZE),
            _ => panic!("expected sample command"),
        }
    }

    #[test]
    fn config_flag_is_global() {
        let cli =
            Cli::try_parse_from(["verigreen", "records", "--config", "/tmp/v.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/v.toml")));
    }

    #[test]
    fn log_candidates_end_with_local_fallback() {
        let candidates = log_file_candidates();
        assert_eq!(
            candidates.last(),
            Some(&PathBuf::from(".verigreen/logs/verigreen.log"))
        );
    }

    #[test]
    fn load_config_with_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(Some(&dir.path().join("missing.toml"))).unwrap();
        assert_eq!(config.pipeline.sample_size, DEFAULT_SAMPLE_SIZE);
    }

    #[tokio::test]
    async fn feed_failure_during_backfill_is_returned() {
        let live = tokio::spawn(async {
            Err(EventSourceError::ReconnectExhausted {
                attempts: 5,
                last_error: "connection refused".into(),
            })
        });
        while !live.is_finished() {
            tokio::task::yield_now().await;
        }

        let err = stop_live_feed(live).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EventSourceError>(),
            Some(EventSourceError::ReconnectExhausted { attempts: 5, .. })
        ));
    }

    #[tokio::test]
    async fn running_feed_is_cancelled_quietly() {
        let live = tokio::spawn(std::future::pending::<Result<(), EventSourceError>>());
        stop_live_feed(live).await.unwrap();
    }
}
