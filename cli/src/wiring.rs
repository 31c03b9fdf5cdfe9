//! Builds the live components from configuration.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use url::Url;
use verigreen_clients::retry::RetryConfig;
use verigreen_clients::{HttpBeacon, HttpFeed, HttpLedger, HttpSettings, HttpVerifier};
use verigreen_config::{EndpointConfig, VerigreenConfig};
use verigreen_engine::{
    LedgerCommitter, Orchestrator, PipelineConfig, RandomnessClient, ReconnectPolicy,
};
use verigreen_store::RecordStore;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub fn open_store(config: &VerigreenConfig) -> Result<RecordStore> {
    let path = config
        .store_path()
        .ok_or_else(|| anyhow!("Could not determine record store path; set [store] path"))?;
    RecordStore::open(&path)
        .with_context(|| format!("Failed to open record store at {}", path.display()))
}

fn endpoint<'a>(
    section: Option<&'a EndpointConfig>,
    name: &str,
) -> Result<(Url, &'a EndpointConfig)> {
    let section = section.ok_or_else(|| anyhow!("Missing [{name}] section in config"))?;
    let raw = section
        .url()
        .ok_or_else(|| anyhow!("Missing {name}.url in config"))?;
    let url = Url::parse(&raw).with_context(|| format!("Invalid {name}.url '{raw}'"))?;
    Ok((url, section))
}

fn http_settings(section: &EndpointConfig) -> HttpSettings {
    HttpSettings {
        request_timeout: Some(section.timeout().unwrap_or(DEFAULT_REQUEST_TIMEOUT)),
        allow_insecure_http: section.allow_insecure_http,
        api_token: section.api_token(),
    }
}

pub fn feed(config: &VerigreenConfig) -> Result<HttpFeed> {
    let feed = config.feed.as_ref();
    let (url, section) = endpoint(feed.map(|f| &f.endpoint), "feed")?;
    let client =
        HttpFeed::new(&url, &http_settings(section)).context("Failed to build feed client")?;
    Ok(match feed {
        Some(feed) => client.with_idle_timeout(feed.idle_timeout()),
        None => client,
    })
}

pub fn reconnect_policy(config: &VerigreenConfig) -> ReconnectPolicy {
    let events = &config.event_source;
    ReconnectPolicy {
        max_attempts: events.max_reconnect_attempts,
        initial_backoff: events.initial_backoff(),
        max_backoff: events.max_backoff(),
        ..ReconnectPolicy::default()
    }
}

pub fn pipeline_config(config: &VerigreenConfig) -> PipelineConfig {
    PipelineConfig {
        sample_size: config.pipeline.sample_size,
        health_threshold: config.pipeline.health_threshold,
        claim_deadline: config.pipeline.claim_deadline(),
    }
}

/// The orchestrator plus the randomness client that must be fed from the event source.
pub fn orchestrator(
    config: &VerigreenConfig,
    store: Arc<Mutex<RecordStore>>,
) -> Result<(Arc<Orchestrator>, RandomnessClient)> {
    let (verifier_url, verifier_cfg) = endpoint(config.verifier.as_ref(), "verifier")?;
    let (beacon_url, beacon_cfg) = endpoint(config.beacon.as_ref(), "beacon")?;
    let (ledger_url, ledger_cfg) = endpoint(config.ledger.as_ref(), "ledger")?;

    let verifier = HttpVerifier::new(&verifier_url, &http_settings(verifier_cfg))
        .context("Failed to build verifier client")?;
    let beacon = HttpBeacon::new(&beacon_url, &http_settings(beacon_cfg))
        .context("Failed to build beacon client")?;
    let ledger = HttpLedger::new(&ledger_url, &http_settings(ledger_cfg))
        .context("Failed to build ledger client")?;

    let randomness =
        RandomnessClient::new(Arc::new(beacon), config.pipeline.randomness_timeout());
    let committer = LedgerCommitter::new(
        Arc::new(ledger),
        RetryConfig {
            max_retries: config.pipeline.ledger_max_retries,
            ..RetryConfig::default()
        },
    );
    let orchestrator = Orchestrator::new(
        Arc::new(verifier),
        randomness.clone(),
        committer,
        store,
        pipeline_config(config),
    );
    Ok((Arc::new(orchestrator), randomness))
}
