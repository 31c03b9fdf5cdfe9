//! End-to-end verification of claims.
//!
//! Each claim runs as its own task: fetch grid, request randomness sized to the
//! grid, select the audit sample, evaluate, commit when valid. Whatever the
//! pipeline gathered is written to the record store as the final step, on success,
//! on failure and on deadline expiry alike.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use verigreen_clients::VerificationGridSource;
use verigreen_store::{PersistOutcome, RecordStore};
use verigreen_types::{
    Claim, ClaimStatus, ClaimantAddress, EventMarker, FeedEvent, LedgerReceipt, ParcelId,
    RandomSeed, RecordId, Sample, SubmissionRecord, Verdict, VerificationGrid,
};

use crate::committer::LedgerCommitter;
use crate::decision::{self, DEFAULT_HEALTH_THRESHOLD, DecisionError};
use crate::error::{ErrorClass, PipelineError};
use crate::randomness::RandomnessClient;
use crate::sample::{self, DEFAULT_SAMPLE_SIZE};

pub const DEFAULT_CLAIM_DEADLINE: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub sample_size: usize,
    /// A cell passes when its health score is strictly above this.
    pub health_threshold: f64,
    /// Upper bound on one claim's pipeline, persistence excluded.
    pub claim_deadline: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sample_size: DEFAULT_SAMPLE_SIZE,
            health_threshold: DEFAULT_HEALTH_THRESHOLD,
            claim_deadline: DEFAULT_CLAIM_DEADLINE,
        }
    }
}

/// What happened to one claim event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Recorded { id: RecordId, status: ClaimStatus },
    /// The event was already recorded; nothing was driven or written.
    Duplicate { existing: RecordId },
    /// Another delivery of the same event is being driven right now; nothing was written.
    InFlight,
}

/// Counts from one [`Orchestrator::run`] or [`Orchestrator::backfill`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub verified: usize,
    pub failed: usize,
    pub rejected: usize,
    pub errored: usize,
    pub duplicates: usize,
    /// Claim events dropped before a pipeline started.
    pub invalid: usize,
    /// Pipelines whose record could not be written.
    pub unrecorded: usize,
}

impl RunSummary {
    fn absorb(&mut self, outcome: Result<ClaimOutcome>) {
        match outcome {
            Ok(ClaimOutcome::Recorded { status, .. }) => match status {
                ClaimStatus::Verified => self.verified += 1,
                ClaimStatus::Failed => self.failed += 1,
                ClaimStatus::Rejected => self.rejected += 1,
                ClaimStatus::Error => self.errored += 1,
            },
            Ok(ClaimOutcome::Duplicate { .. } | ClaimOutcome::InFlight) => self.duplicates += 1,
            Err(e) => {
                tracing::error!(error = %format!("{e:#}"), "Failed to record claim outcome");
                self.unrecorded += 1;
            }
        }
    }
}

/// Partial state of one pipeline, filled step by step.
#[derive(Default)]
struct Trail {
    grid: Option<VerificationGrid>,
    seed: Option<RandomSeed>,
    verdict: Option<Verdict>,
    receipt: Option<LedgerReceipt>,
}

type EventKey = (ClaimantAddress, ParcelId, EventMarker);

/// Membership of one claim event in the in-flight set, released on drop.
struct InFlightClaim<'a> {
    set: &'a Mutex<HashSet<EventKey>>,
    key: EventKey,
}

impl Drop for InFlightClaim<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

pub struct Orchestrator {
    verifier: Arc<dyn VerificationGridSource>,
    randomness: RandomnessClient,
    committer: LedgerCommitter,
    store: Arc<Mutex<RecordStore>>,
    config: PipelineConfig,
    /// Claim events between the duplicate check and their persisted record.
    in_flight: Mutex<HashSet<EventKey>>,
}

impl Orchestrator {
    pub fn new(
        verifier: Arc<dyn VerificationGridSource>,
        randomness: RandomnessClient,
        committer: LedgerCommitter,
        store: Arc<Mutex<RecordStore>>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            verifier,
            randomness,
            committer,
            store,
            config,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Process claim events as they arrive, one task per claim, until the channel closes.
    ///
    /// Claims already in flight are awaited before returning.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<FeedEvent>) -> RunSummary {
        let mut summary = RunSummary::default();
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    self.dispatch(&event, &mut tasks, &mut summary);
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    absorb_joined(&mut summary, joined);
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            absorb_joined(&mut summary, joined);
        }
        tracing::info!(?summary, "Claim intake closed");
        summary
    }

    /// Re-drive a batch of past claim events. Already-recorded events are skipped.
    pub async fn backfill(self: Arc<Self>, events: Vec<FeedEvent>) -> RunSummary {
        let mut summary = RunSummary::default();
        let mut tasks = JoinSet::new();
        for event in &events {
            self.dispatch(event, &mut tasks, &mut summary);
        }
        while let Some(joined) = tasks.join_next().await {
            absorb_joined(&mut summary, joined);
        }
        summary
    }

    fn dispatch(
        self: &Arc<Self>,
        event: &FeedEvent,
        tasks: &mut JoinSet<Result<ClaimOutcome>>,
        summary: &mut RunSummary,
    ) {
        let FeedEvent::ClaimSubmitted(raw) = event else {
            tracing::debug!(kind = %event.kind(), "Ignoring non-claim event");
            return;
        };
        match raw.to_claim(Utc::now()) {
            Ok(claim) => {
                let this = Arc::clone(self);
                tasks.spawn(async move { this.process_claim(claim).await });
            }
            Err(e) => {
                tracing::warn!(
                    marker = %raw.marker,
                    claimant = %raw.claimant,
                    error = %e,
                    "Dropping invalid claim event"
                );
                summary.invalid += 1;
            }
        }
    }

    /// Drive one claim and persist its record.
    ///
    /// A delivery of an event that is already recorded, or already being driven,
    /// is not driven again. Errors only when the record itself cannot be written;
    /// pipeline failures are part of the record.
    pub async fn process_claim(&self, claim: Claim) -> Result<ClaimOutcome> {
        let _in_flight = {
            let store = self.lock_store();
            if let Some(existing) =
                store.find_by_event(claim.claimant(), claim.parcel(), claim.marker())?
            {
                tracing::debug!(
                    claimant = %claim.claimant(),
                    parcel = %claim.parcel(),
                    marker = %claim.marker(),
                    "Claim event already recorded"
                );
                return Ok(ClaimOutcome::Duplicate {
                    existing: existing.id,
                });
            }
            let Some(in_flight) = self.enter_in_flight(&claim) else {
                tracing::debug!(
                    claimant = %claim.claimant(),
                    parcel = %claim.parcel(),
                    marker = %claim.marker(),
                    "Claim event already being verified"
                );
                return Ok(ClaimOutcome::InFlight);
            };
            if let Some(valid) = store.valid_record(claim.claimant(), claim.parcel())? {
                drop(store);
                let err = PipelineError::ParcelAlreadyVerified { existing: valid.id };
                return self.record(&claim, &Trail::default(), Err(err));
            }
            in_flight
        };

        tracing::info!(
            claimant = %claim.claimant(),
            parcel = %claim.parcel(),
            marker = %claim.marker(),
            "Verifying claim"
        );

        let mut trail = Trail::default();
        let deadline = self.config.claim_deadline;
        let result = match tokio::time::timeout(deadline, self.drive(&claim, &mut trail)).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::DeadlineExceeded(deadline)),
        };
        self.record(&claim, &trail, result)
    }

    async fn drive(&self, claim: &Claim, trail: &mut Trail) -> Result<(), PipelineError> {
        let grid = self
            .verifier
            .fetch_grid(claim.bounds(), claim.claimant())
            .await?;
        let grid = trail.grid.insert(grid);
        if grid.is_empty() {
            return Err(DecisionError::EmptyGrid.into());
        }
        let grid_len = grid.len();

        let seed = self.randomness.request(grid_len as u64).await?;
        trail.seed = Some(seed);

        let sample = sample::select(seed.value, grid_len, self.config.sample_size);
        let verdict = decision::evaluate(claim, grid, &sample, self.config.health_threshold)?;
        tracing::info!(
            claimant = %claim.claimant(),
            parcel = %claim.parcel(),
            sample = ?sample.indices(),
            valid = verdict.valid,
            "Sample evaluated"
        );
        let verdict = trail.verdict.insert(verdict);

        if verdict.valid {
            trail.receipt = Some(self.committer.commit(claim, verdict).await?);
        }
        Ok(())
    }

    fn record(
        &self,
        claim: &Claim,
        trail: &Trail,
        result: Result<(), PipelineError>,
    ) -> Result<ClaimOutcome> {
        if let Err(e) = &result {
            log_failure(claim, e);
        }
        let record = build_record(claim, trail, result.as_ref().err());

        let mut store = self.lock_store();
        let outcome = match store.persist(&record)? {
            PersistOutcome::Conflict { existing } => {
                // Another delivery for this parcel verified first.
                tracing::warn!(
                    claimant = %claim.claimant(),
                    parcel = %claim.parcel(),
                    existing,
                    "Parcel verified concurrently; recording as rejected"
                );
                let err = PipelineError::ParcelAlreadyVerified { existing };
                let record = build_record(claim, trail, Some(&err));
                store.persist(&record)?
            }
            outcome => outcome,
        };

        match outcome {
            PersistOutcome::Inserted(id) => Ok(ClaimOutcome::Recorded {
                id,
                status: record_status(trail, result.as_ref().err()),
            }),
            PersistOutcome::AlreadyRecorded(existing) => Ok(ClaimOutcome::Duplicate { existing }),
            PersistOutcome::Conflict { existing } => {
                Err(anyhow::anyhow!("rejected record conflicts with valid record {existing}"))
                    .context("Failed to persist submission record")
            }
        }
    }

    /// Called with the store lock held, so no record for the event can appear in between.
    fn enter_in_flight(&self, claim: &Claim) -> Option<InFlightClaim<'_>> {
        let key = (claim.claimant().clone(), claim.parcel().clone(), claim.marker());
        let mut set = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        set.insert(key.clone()).then_some(InFlightClaim {
            set: &self.in_flight,
            key,
        })
    }

    fn lock_store(&self) -> MutexGuard<'_, RecordStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn absorb_joined(
    summary: &mut RunSummary,
    joined: Result<Result<ClaimOutcome>, tokio::task::JoinError>,
) {
    match joined {
        Ok(outcome) => summary.absorb(outcome),
        Err(e) => {
            tracing::error!(error = %e, "Claim task panicked");
            summary.unrecorded += 1;
        }
    }
}

fn log_failure(claim: &Claim, err: &PipelineError) {
    match err.class() {
        ErrorClass::Policy => tracing::info!(
            claimant = %claim.claimant(),
            parcel = %claim.parcel(),
            reason = %err,
            "Claim rejected"
        ),
        ErrorClass::Transport | ErrorClass::Protocol => tracing::warn!(
            claimant = %claim.claimant(),
            parcel = %claim.parcel(),
            class = ?err.class(),
            error = %err,
            "Claim pipeline aborted"
        ),
        ErrorClass::Fatal => tracing::error!(
            claimant = %claim.claimant(),
            parcel = %claim.parcel(),
            error = %err,
            "Claim pipeline aborted"
        ),
    }
}

fn record_status(trail: &Trail, err: Option<&PipelineError>) -> ClaimStatus {
    match err {
        Some(e) => e.status(),
        None if trail.receipt.is_some() => ClaimStatus::Verified,
        None => ClaimStatus::Failed,
    }
}

fn build_record(claim: &Claim, trail: &Trail, err: Option<&PipelineError>) -> SubmissionRecord {
    let status = record_status(trail, err);
    SubmissionRecord {
        claimant: claim.claimant().clone(),
        parcel: claim.parcel().clone(),
        coordinates: *claim.bounds(),
        marker: claim.marker(),
        sample_indices: trail
            .verdict
            .as_ref()
            .map_or_else(Sample::empty, |v| v.sample.clone()),
        commitment_hash: trail.verdict.as_ref().map(|v| v.commitment),
        valid: status == ClaimStatus::Verified,
        transaction_ref: trail.receipt.as_ref().map(|r| r.transaction_ref.clone()),
        random_seed: trail.seed.map(|s| s.value),
        processing_time_secs: trail.grid.as_ref().map(|g| g.processing_time_secs),
        grid: trail.grid.clone(),
        status,
        error: err.map(ToString::to_string),
        recorded_at: Utc::now(),
    }
}
