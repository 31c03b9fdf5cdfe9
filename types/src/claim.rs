use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::{ClaimantAddress, EventMarker, ParcelId};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClaimValidationError {
    #[error("invalid claimant address '{0}': expected 0x followed by 40 hex digits")]
    InvalidClaimant(String),
    #[error("parcel identifier must not be empty")]
    EmptyParcel,
    #[error("coordinate '{0}' is not a finite number")]
    InvalidCoordinate(String),
    #[error("northeast corner ({ne_x}, {ne_y}) must lie strictly above and right of southwest ({sw_x}, {sw_y})")]
    NotARectangle {
        sw_x: f64,
        sw_y: f64,
        ne_x: f64,
        ne_y: f64,
    },
}

/// A boundary coordinate as it appears on the wire: feeds deliver either
/// numbers or decimal strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Coordinate {
    Number(f64),
    Text(String),
}

impl Coordinate {
    pub fn to_f64(&self) -> Result<f64, ClaimValidationError> {
        let value = match self {
            Coordinate::Number(n) => *n,
            Coordinate::Text(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| ClaimValidationError::InvalidCoordinate(s.clone()))?,
        };
        if value.is_finite() {
            Ok(value)
        } else {
            Err(ClaimValidationError::InvalidCoordinate(value.to_string()))
        }
    }
}

impl From<f64> for Coordinate {
    fn from(value: f64) -> Self {
        Coordinate::Number(value)
    }
}

/// Rectangular claim area: `[southwest_x, southwest_y, northeast_x, northeast_y]`.
///
/// # Invariants
///
/// - All four values are finite
/// - `northeast_x > southwest_x` and `northeast_y > southwest_y`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "[Coordinate; 4]", into = "[f64; 4]")]
pub struct BoundingBox([f64; 4]);

impl BoundingBox {
    pub fn new(coords: [f64; 4]) -> Result<Self, ClaimValidationError> {
        if let Some(bad) = coords.iter().find(|c| !c.is_finite()) {
            return Err(ClaimValidationError::InvalidCoordinate(bad.to_string()));
        }
        let [sw_x, sw_y, ne_x, ne_y] = coords;
        if ne_x <= sw_x || ne_y <= sw_y {
            return Err(ClaimValidationError::NotARectangle {
                sw_x,
                sw_y,
                ne_x,
                ne_y,
            });
        }
        Ok(Self(coords))
    }

    pub fn from_wire(coords: &[Coordinate; 4]) -> Result<Self, ClaimValidationError> {
        let mut values = [0.0; 4];
        for (slot, coord) in values.iter_mut().zip(coords) {
            *slot = coord.to_f64()?;
        }
        Self::new(values)
    }

    #[must_use]
    pub fn coords(&self) -> [f64; 4] {
        self.0
    }

    #[must_use]
    pub fn southwest(&self) -> (f64, f64) {
        (self.0[0], self.0[1])
    }

    #[must_use]
    pub fn northeast(&self) -> (f64, f64) {
        (self.0[2], self.0[3])
    }
}

impl TryFrom<[Coordinate; 4]> for BoundingBox {
    type Error = ClaimValidationError;

    fn try_from(value: [Coordinate; 4]) -> Result<Self, Self::Error> {
        Self::from_wire(&value)
    }
}

impl From<BoundingBox> for [f64; 4] {
    fn from(value: BoundingBox) -> Self {
        value.0
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.0;
        write!(f, "({a}, {b}) -> ({c}, {d})")
    }
}

/// A landowner's claim over a parcel, as observed on the feed.
///
/// Immutable once created; the orchestrator only reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    claimant: ClaimantAddress,
    parcel: ParcelId,
    bounds: BoundingBox,
    submitted_at: DateTime<Utc>,
    marker: EventMarker,
}

impl Claim {
    #[must_use]
    pub fn new(
        claimant: ClaimantAddress,
        parcel: ParcelId,
        bounds: BoundingBox,
        submitted_at: DateTime<Utc>,
        marker: EventMarker,
    ) -> Self {
        Self {
            claimant,
            parcel,
            bounds,
            submitted_at,
            marker,
        }
    }

    #[must_use]
    pub fn claimant(&self) -> &ClaimantAddress {
        &self.claimant
    }

    #[must_use]
    pub fn parcel(&self) -> &ParcelId {
        &self.parcel
    }

    #[must_use]
    pub fn bounds(&self) -> &BoundingBox {
        &self.bounds
    }

    #[must_use]
    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }

    #[must_use]
    pub fn marker(&self) -> EventMarker {
        self.marker
    }
}
