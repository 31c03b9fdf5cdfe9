use std::time::Duration;

use verigreen_clients::{BeaconError, VerifierError};
use verigreen_types::{ClaimStatus, RecordId};

use crate::committer::CommitError;
use crate::decision::DecisionError;
use crate::randomness::RandomnessError;

/// How a failure should be handled, independent of where it happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network-level trouble; recovered by reconnect or bounded retry where possible.
    Transport,
    /// A collaborator answered wrongly or not at all; recorded, not retried.
    Protocol,
    /// The ledger refused on policy grounds; terminal for the claim, not a system fault.
    Policy,
    /// Nothing more can be processed until an operator intervenes.
    Fatal,
}

/// Why a single claim's pipeline stopped early.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("grid fetch failed: {0}")]
    GridFetch(#[from] VerifierError),
    #[error(transparent)]
    Decision(#[from] DecisionError),
    #[error(transparent)]
    Randomness(#[from] RandomnessError),
    #[error(transparent)]
    Commit(#[from] CommitError),
    #[error("parcel already verified (record {existing})")]
    ParcelAlreadyVerified { existing: RecordId },
    #[error("claim exceeded its {}s deadline", .0.as_secs())]
    DeadlineExceeded(Duration),
}

impl PipelineError {
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            PipelineError::GridFetch(VerifierError::Unreachable { .. }) => ErrorClass::Transport,
            PipelineError::GridFetch(VerifierError::Status { status, .. }) if *status >= 500 => {
                ErrorClass::Transport
            }
            PipelineError::GridFetch(_)
            | PipelineError::Decision(_)
            | PipelineError::DeadlineExceeded(_) => ErrorClass::Protocol,
            PipelineError::Randomness(RandomnessError::Rejected(BeaconError::Unreachable {
                ..
            })) => ErrorClass::Transport,
            PipelineError::Randomness(RandomnessError::Abandoned) => ErrorClass::Fatal,
            PipelineError::Randomness(_) => ErrorClass::Protocol,
            PipelineError::Commit(CommitError::RetriesExhausted { .. }) => ErrorClass::Transport,
            PipelineError::Commit(CommitError::ClaimNotRegistered | CommitError::AlreadyVerified)
            | PipelineError::ParcelAlreadyVerified { .. } => ErrorClass::Policy,
            PipelineError::Commit(_) => ErrorClass::Protocol,
        }
    }

    /// What the claimant sees for a claim that ended with this error.
    #[must_use]
    pub fn status(&self) -> ClaimStatus {
        match self.class() {
            ErrorClass::Policy => ClaimStatus::Rejected,
            ErrorClass::Transport | ErrorClass::Protocol | ErrorClass::Fatal => ClaimStatus::Error,
        }
    }
}
