use std::fmt;

use serde::{Deserialize, Serialize};

use crate::claim::Claim;
use crate::hex::{HexParseError, decode_hex_32, encode_hex};
use crate::ids::RequestNonce;

/// A resolved value from the randomness beacon.
///
/// Pending requests never appear as a `RandomSeed`: a seed exists only once the
/// beacon's asynchronous response has been correlated to its request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RandomSeed {
    pub nonce: RequestNonce,
    pub upper_bound: u64,
    /// Beacon-assigned sequence number, when one was observed.
    pub sequence: Option<u64>,
    pub value: u64,
}

/// Ordered cell positions chosen for audit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sample(Vec<usize>);

impl Sample {
    #[must_use]
    pub fn new(indices: Vec<usize>) -> Self {
        Self(indices)
    }

    #[must_use]
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    #[must_use]
    pub fn indices(&self) -> &[usize] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// SHA-256 commitment over the audited cells' coordinates, published on the ledger.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CommitmentHash([u8; 32]);

impl CommitmentHash {
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        encode_hex(&self.0)
    }
}

impl TryFrom<String> for CommitmentHash {
    type Error = HexParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        decode_hex_32(&value).map(Self)
    }
}

impl From<CommitmentHash> for String {
    fn from(value: CommitmentHash) -> Self {
        value.to_hex()
    }
}

impl fmt::Display for CommitmentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for CommitmentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommitmentHash({})", self.to_hex())
    }
}

/// Outcome of checking a single sampled cell against the health threshold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CellCheck {
    /// Position as it appeared in the sample.
    pub sampled: usize,
    /// Position actually scored, after reduction into the grid.
    pub scored: usize,
    pub health_score: f64,
    pub passed: bool,
}

/// Pass/fail decision for one claim. Computed once and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub valid: bool,
    pub commitment: CommitmentHash,
    pub sample: Sample,
    pub checks: Vec<CellCheck>,
    pub claim: Claim,
}
