use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque pointer into the distributed storage layer holding the raw imagery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentRef(String);

impl ContentRef {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One cell of a verification grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    #[serde(alias = "id")]
    pub index: u64,
    pub x: i64,
    pub y: i64,
    pub health_score: f64,
    pub vegetation_index: f64,
    #[serde(default)]
    pub coordinates: Vec<f64>,
}

/// Per-cell vegetation health for a claimed parcel, computed by the external verifier.
///
/// Owned by the pipeline that fetched it and never shared across claims.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationGrid {
    pub cells: Vec<Cell>,
    pub content_ref: ContentRef,
    /// Verifier-side computation time in seconds.
    pub processing_time_secs: f64,
    pub generated_at: DateTime<Utc>,
}

impl VerificationGrid {
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    #[must_use]
    pub fn cell(&self, position: usize) -> Option<&Cell> {
        self.cells.get(position)
    }
}
