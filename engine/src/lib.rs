//! Claim verification pipeline for VeriGreen.
//!
//! This crate composes the external collaborators from `verigreen-clients` and the
//! record store into the per-claim pipeline:
//!
//! ```text
//! EventSource ──claim──▶ Orchestrator ─▶ grid fetch ─▶ RandomnessClient ─▶ sample
//!      │                                                   ▲              │
//!      └──randomness events────────────────────────────────┘           evaluate
//!                                                                          │
//!                                          RecordStore ◀─ LedgerCommitter ◀┘
//! ```
//!
//! The sampling and decision steps are pure functions; everything that waits on
//! the outside world is behind a trait object so tests can substitute it.

mod committer;
mod decision;
mod error;
mod event_source;
mod orchestrator;
mod randomness;
mod sample;

pub use committer::{CommitError, LedgerCommitter};
pub use decision::{DEFAULT_HEALTH_THRESHOLD, DecisionError, commitment_hash, evaluate};
pub use error::{ErrorClass, PipelineError};
pub use event_source::{ConnectionState, EventSource, EventSourceError, ReconnectPolicy};
pub use orchestrator::{
    ClaimOutcome, DEFAULT_CLAIM_DEADLINE, Orchestrator, PipelineConfig, RunSummary,
};
pub use randomness::{DEFAULT_RANDOMNESS_TIMEOUT, RandomnessClient, RandomnessError};
pub use sample::{DEFAULT_SAMPLE_SIZE, select as select_sample};
