//! Pass/fail decision over an audit sample.
//!
//! A claim passes only if every sampled cell's health score is strictly above the
//! threshold. Positions are reduced modulo the grid length before lookup, and the
//! reduced position is the one that gets scored and committed.

use sha2::{Digest, Sha256};
use verigreen_types::{CellCheck, Claim, CommitmentHash, Sample, Verdict, VerificationGrid};

pub const DEFAULT_HEALTH_THRESHOLD: f64 = 0.57;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecisionError {
    #[error("verification grid has no cells")]
    EmptyGrid,
}

/// Evaluate `sample` against `grid`.
///
/// An empty sample never passes: there is nothing to vouch for the claim.
pub fn evaluate(
    claim: &Claim,
    grid: &VerificationGrid,
    sample: &Sample,
    threshold: f64,
) -> Result<Verdict, DecisionError> {
    if grid.is_empty() {
        return Err(DecisionError::EmptyGrid);
    }

    let checks: Vec<CellCheck> = sample
        .indices()
        .iter()
        .map(|&sampled| {
            let scored = sampled % grid.len();
            let health_score = grid.cells[scored].health_score;
            CellCheck {
                sampled,
                scored,
                health_score,
                passed: health_score > threshold,
            }
        })
        .collect();

    let scored: Vec<usize> = checks.iter().map(|c| c.scored).collect();
    let valid = !checks.is_empty() && checks.iter().all(|c| c.passed);

    Ok(Verdict {
        valid,
        commitment: commitment_hash(grid, &scored),
        sample: sample.clone(),
        checks,
        claim: claim.clone(),
    })
}

/// SHA-256 over the audited cells in sample order.
///
/// Per cell: its index (u64 BE), its coordinate count (u32 BE), then every
/// coordinate's IEEE-754 bits (u64 BE). Positions outside the grid contribute nothing.
#[must_use]
pub fn commitment_hash(grid: &VerificationGrid, positions: &[usize]) -> CommitmentHash {
    let mut hasher = Sha256::new();
    for cell in positions.iter().filter_map(|&p| grid.cell(p)) {
        hasher.update(cell.index.to_be_bytes());
        hasher.update((cell.coordinates.len() as u32).to_be_bytes());
        for coordinate in &cell.coordinates {
            hasher.update(coordinate.to_bits().to_be_bytes());
        }
    }
    CommitmentHash::from_bytes(hasher.finalize().into())
}
