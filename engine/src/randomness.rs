//! Correlation of randomness requests with their asynchronous results.
//!
//! The beacon acknowledges a request immediately and publishes the value later on
//! the feed. [`RandomnessClient`] keeps one pending entry per outstanding nonce;
//! feed events resolve entries by nonce, or by the sequence number the beacon
//! assigned to that nonce. Entries are removed on resolution, on timeout and when
//! the waiting caller goes away, so a late result can never land on a reused slot.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use verigreen_clients::{BeaconError, RandomnessBeacon};
use verigreen_types::{
    FeedEvent, RandomSeed, RandomnessFulfilledEvent, RandomnessRequestedEvent, RequestNonce,
};

pub const DEFAULT_RANDOMNESS_TIMEOUT: Duration = Duration::from_secs(120);

/// Fulfilments seen before their sequence was known. Bounded so a noisy feed cannot grow it.
const MAX_EARLY_FULFILMENTS: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum RandomnessError {
    #[error("randomness upper bound must be at least 1")]
    ZeroUpperBound,
    #[error("beacon rejected randomness request: {0}")]
    Rejected(#[from] BeaconError),
    #[error("no randomness result within {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("randomness request abandoned before it resolved")]
    Abandoned,
}

#[derive(Debug, Clone, Copy)]
struct Resolution {
    sequence: u64,
    value: u64,
}

struct PendingRequest {
    sequence: Option<u64>,
    resolve: oneshot::Sender<Resolution>,
}

#[derive(Default)]
struct PendingTable {
    by_nonce: HashMap<RequestNonce, PendingRequest>,
    by_sequence: HashMap<u64, RequestNonce>,
    early: VecDeque<(u64, u64)>,
}

impl PendingTable {
    fn remove(&mut self, nonce: &RequestNonce) -> Option<PendingRequest> {
        let entry = self.by_nonce.remove(nonce)?;
        if let Some(sequence) = entry.sequence {
            self.by_sequence.remove(&sequence);
        }
        Some(entry)
    }

    fn assign_sequence(&mut self, nonce: RequestNonce, sequence: u64) -> bool {
        let Some(entry) = self.by_nonce.get_mut(&nonce) else {
            return false;
        };
        if let Some(previous) = entry.sequence.replace(sequence) {
            self.by_sequence.remove(&previous);
        }
        self.by_sequence.insert(sequence, nonce);

        if let Some(pos) = self.early.iter().position(|&(seq, _)| seq == sequence)
            && let Some((_, value)) = self.early.remove(pos)
        {
            self.resolve(nonce, sequence, value);
        }
        true
    }

    fn resolve(&mut self, nonce: RequestNonce, sequence: u64, value: u64) -> bool {
        let Some(entry) = self.remove(&nonce) else {
            return false;
        };
        // The receiver may already be gone; the entry is removed either way.
        let _ = entry.resolve.send(Resolution { sequence, value });
        true
    }

    fn remember_early(&mut self, sequence: u64, value: u64) {
        if self.early.len() == MAX_EARLY_FULFILMENTS {
            self.early.pop_front();
        }
        self.early.push_back((sequence, value));
    }
}

type SharedTable = Arc<Mutex<PendingTable>>;

fn lock(table: &SharedTable) -> MutexGuard<'_, PendingTable> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes the pending entry if the request future is dropped before it resolves.
struct PendingGuard {
    table: SharedTable,
    nonce: RequestNonce,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        lock(&self.table).remove(&self.nonce);
    }
}

#[derive(Clone)]
pub struct RandomnessClient {
    beacon: Arc<dyn RandomnessBeacon>,
    pending: SharedTable,
    timeout: Duration,
}

impl RandomnessClient {
    pub fn new(beacon: Arc<dyn RandomnessBeacon>, timeout: Duration) -> Self {
        Self {
            beacon,
            pending: Arc::default(),
            timeout,
        }
    }

    /// Request a random value below `upper_bound` and wait for it to arrive on the feed.
    pub async fn request(&self, upper_bound: u64) -> Result<RandomSeed, RandomnessError> {
        if upper_bound == 0 {
            return Err(RandomnessError::ZeroUpperBound);
        }

        let (tx, rx) = oneshot::channel();
        let nonce = {
            let mut table = lock(&self.pending);
            let mut nonce = RequestNonce::from_bytes(rand::random());
            while table.by_nonce.contains_key(&nonce) {
                nonce = RequestNonce::from_bytes(rand::random());
            }
            table.by_nonce.insert(
                nonce,
                PendingRequest {
                    sequence: None,
                    resolve: tx,
                },
            );
            nonce
        };
        let _guard = PendingGuard {
            table: Arc::clone(&self.pending),
            nonce,
        };

        let ack = self.beacon.submit(nonce, upper_bound).await?;
        if let Some(sequence) = ack.sequence {
            lock(&self.pending).assign_sequence(nonce, sequence);
        }
        tracing::debug!(%nonce, upper_bound, sequence = ?ack.sequence, "Randomness requested");

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(resolution)) => Ok(RandomSeed {
                nonce,
                upper_bound,
                sequence: Some(resolution.sequence),
                value: resolution.value,
            }),
            Ok(Err(_)) => Err(RandomnessError::Abandoned),
            Err(_) => {
                tracing::warn!(
                    %nonce,
                    timeout_secs = self.timeout.as_secs(),
                    "Randomness request timed out"
                );
                Err(RandomnessError::Timeout(self.timeout))
            }
        }
    }

    /// Apply one feed event. Returns `true` if it matched an outstanding request.
    pub fn handle_event(&self, event: &FeedEvent) -> bool {
        match event {
            FeedEvent::RandomnessRequested(requested) => self.on_requested(requested),
            FeedEvent::RandomnessFulfilled(fulfilled) => self.on_fulfilled(fulfilled),
            FeedEvent::ClaimSubmitted(_) => false,
        }
    }

    fn on_requested(&self, event: &RandomnessRequestedEvent) -> bool {
        lock(&self.pending).assign_sequence(event.nonce, event.sequence)
    }

    fn on_fulfilled(&self, event: &RandomnessFulfilledEvent) -> bool {
        let mut table = lock(&self.pending);

        let nonce = event
            .nonce
            .filter(|n| table.by_nonce.contains_key(n))
            .or_else(|| table.by_sequence.get(&event.sequence).copied());

        match nonce {
            Some(nonce) => table.resolve(nonce, event.sequence, event.value),
            None if event.nonce.is_some() => {
                tracing::debug!(sequence = event.sequence, "Ignoring result for unknown nonce");
                false
            }
            None => {
                table.remember_early(event.sequence, event.value);
                false
            }
        }
    }

    /// Number of requests still waiting for a result.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).by_nonce.len()
    }

    /// Resolve requests from a feed subscription until the subscription closes.
    ///
    /// Once it closes no result can arrive, so every outstanding request fails with
    /// [`RandomnessError::Abandoned`].
    pub async fn resolve_from(self, mut events: mpsc::Receiver<FeedEvent>) {
        while let Some(event) = events.recv().await {
            if !self.handle_event(&event) {
                tracing::trace!(marker = %event.marker(), "Feed event matched no pending request");
            }
        }

        let abandoned = {
            let mut table = lock(&self.pending);
            let count = table.by_nonce.len();
            *table = PendingTable::default();
            count
        };
        if abandoned > 0 {
            tracing::warn!(abandoned, "Randomness subscription closed with requests outstanding");
        } else {
            tracing::debug!("Randomness subscription closed");
        }
    }
}
