use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::claim::BoundingBox;
use crate::grid::VerificationGrid;
use crate::ids::{ClaimantAddress, EventMarker, ParcelId};
use crate::verdict::{CommitmentHash, Sample};

/// Row identifier assigned by the record store.
pub type RecordId = i64;

/// Ledger confirmation that a commitment was included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerReceipt {
    pub transaction_ref: String,
    #[serde(default)]
    pub block_number: Option<u64>,
}

/// What the claimant sees for a recorded claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimStatus {
    /// Sample passed and the commitment is on the ledger.
    Verified,
    /// Sample did not meet the health threshold.
    Failed,
    /// The ledger refused the claim (not registered, or already verified).
    Rejected,
    /// The pipeline could not finish; the claim is still pending from the claimant's view.
    Error,
}

impl ClaimStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ClaimStatus::Verified => "verified",
            ClaimStatus::Failed => "failed",
            ClaimStatus::Rejected => "rejected",
            ClaimStatus::Error => "error",
        }
    }

    #[must_use]
    pub const fn display_text(self) -> &'static str {
        match self {
            ClaimStatus::Verified => "verified and rewarded",
            ClaimStatus::Failed => "verification failed",
            ClaimStatus::Rejected => "rejected by ledger",
            ClaimStatus::Error => "pending/error",
        }
    }
}

impl fmt::Display for ClaimStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClaimStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "verified" => Ok(ClaimStatus::Verified),
            "failed" => Ok(ClaimStatus::Failed),
            "rejected" => Ok(ClaimStatus::Rejected),
            "error" => Ok(ClaimStatus::Error),
            other => Err(format!("unknown claim status '{other}'")),
        }
    }
}

/// Durable decision trail for one claim event.
///
/// Fields after `marker` are whatever the pipeline had gathered when it
/// finished or aborted; a record is written even when every optional field is empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionRecord {
    pub claimant: ClaimantAddress,
    pub parcel: ParcelId,
    pub coordinates: BoundingBox,
    pub marker: EventMarker,
    pub sample_indices: Sample,
    pub commitment_hash: Option<CommitmentHash>,
    pub valid: bool,
    pub transaction_ref: Option<String>,
    pub random_seed: Option<u64>,
    pub grid: Option<VerificationGrid>,
    pub processing_time_secs: Option<f64>,
    pub status: ClaimStatus,
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}
