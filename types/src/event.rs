//! Events delivered by the notification feed.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::claim::{BoundingBox, Claim, ClaimValidationError, Coordinate};
use crate::ids::{ClaimantAddress, EventMarker, ParcelId, RequestNonce};

/// Kinds of event a subscriber can register for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ClaimSubmitted,
    RandomnessRequested,
    RandomnessFulfilled,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [
        EventKind::ClaimSubmitted,
        EventKind::RandomnessRequested,
        EventKind::RandomnessFulfilled,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            EventKind::ClaimSubmitted => "claim_submitted",
            EventKind::RandomnessRequested => "randomness_requested",
            EventKind::RandomnessFulfilled => "randomness_fulfilled",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown event kind '{s}'"))
    }
}

/// Raw "claim submitted" notification. Validated into a [`Claim`] by [`Self::to_claim`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimSubmittedEvent {
    pub claimant: String,
    pub parcel_id: String,
    pub coordinates: [Coordinate; 4],
    pub marker: EventMarker,
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
}

impl ClaimSubmittedEvent {
    /// Validate the raw fields. `observed_at` stands in when the feed omits a submission time.
    pub fn to_claim(&self, observed_at: DateTime<Utc>) -> Result<Claim, ClaimValidationError> {
        Ok(Claim::new(
            ClaimantAddress::new(self.claimant.as_str())?,
            ParcelId::new(self.parcel_id.as_str())?,
            BoundingBox::from_wire(&self.coordinates)?,
            self.submitted_at.unwrap_or(observed_at),
            self.marker,
        ))
    }
}

/// The beacon acknowledged a request and assigned it a sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RandomnessRequestedEvent {
    pub nonce: RequestNonce,
    pub sequence: u64,
    pub marker: EventMarker,
}

/// The beacon produced a value for a previously requested sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RandomnessFulfilledEvent {
    pub sequence: u64,
    pub value: u64,
    /// Some beacons echo the nonce here; when absent, correlation goes through `sequence`.
    #[serde(default)]
    pub nonce: Option<RequestNonce>,
    pub marker: EventMarker,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeedEvent {
    ClaimSubmitted(ClaimSubmittedEvent),
    RandomnessRequested(RandomnessRequestedEvent),
    RandomnessFulfilled(RandomnessFulfilledEvent),
}

impl FeedEvent {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            FeedEvent::ClaimSubmitted(_) => EventKind::ClaimSubmitted,
            FeedEvent::RandomnessRequested(_) => EventKind::RandomnessRequested,
            FeedEvent::RandomnessFulfilled(_) => EventKind::RandomnessFulfilled,
        }
    }

    #[must_use]
    pub fn marker(&self) -> EventMarker {
        match self {
            FeedEvent::ClaimSubmitted(e) => e.marker,
            FeedEvent::RandomnessRequested(e) => e.marker,
            FeedEvent::RandomnessFulfilled(e) => e.marker,
        }
    }
}
