//! Audit sample selection.
//!
//! Draw `j` (j = 0, 1, 2, ...) is the first eight bytes, read big-endian, of
//! `SHA-256("verigreen-sample" || seed_be64 || j_be64)`, reduced modulo the grid
//! size. Repeated positions are skipped, so a sample never audits the same cell
//! twice. Anyone holding the published seed and the grid size can recompute it.

use sha2::{Digest, Sha256};
use verigreen_types::Sample;

const SAMPLE_DOMAIN: &[u8] = b"verigreen-sample";

/// Cells audited per claim unless configured otherwise.
pub const DEFAULT_SAMPLE_SIZE: usize = 4;

/// Derive `count` distinct positions in `[0, grid_size)` from `seed`.
///
/// When `count >= grid_size` every position is audited, in ascending order.
/// An empty grid yields an empty sample.
#[must_use]
pub fn select(seed: u64, grid_size: usize, count: usize) -> Sample {
    if grid_size == 0 || count == 0 {
        return Sample::empty();
    }
    if count >= grid_size {
        return Sample::new((0..grid_size).collect());
    }

    let mut chosen = Vec::with_capacity(count);
    let mut draw = 0u64;
    while chosen.len() < count {
        let position = draw_position(seed, draw, grid_size);
        if !chosen.contains(&position) {
            chosen.push(position);
        }
        draw += 1;
    }
    Sample::new(chosen)
}

fn draw_position(seed: u64, draw: u64, grid_size: usize) -> usize {
    let mut hasher = Sha256::new();
    hasher.update(SAMPLE_DOMAIN);
    hasher.update(seed.to_be_bytes());
    hasher.update(draw.to_be_bytes());
    let digest = hasher.finalize();

    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(head) % grid_size as u64) as usize
}
