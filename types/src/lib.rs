//! Core domain types for VeriGreen claim verification.
//!
//! This crate contains pure domain types with no IO, no async, and minimal dependencies.
//! Everything here can be used from any layer of the application.
//!
//! Values that carry invariants (addresses, parcel ids, bounding boxes, nonces) validate
//! at construction time. Once you hold one, you know it satisfies its constraints.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory
#![allow(clippy::missing_panics_doc)] // Panics are documented in assertions

mod claim;
mod event;
mod grid;
mod hex;
mod ids;
mod record;
mod verdict;

pub use claim::{BoundingBox, Claim, ClaimValidationError, Coordinate};
pub use event::{
    ClaimSubmittedEvent, EventKind, FeedEvent, RandomnessFulfilledEvent, RandomnessRequestedEvent,
};
pub use grid::{Cell, ContentRef, VerificationGrid};
pub use hex::{HexParseError, decode_hex_32, encode_hex};
pub use ids::{ClaimantAddress, EventMarker, ParcelId, RequestNonce};
pub use record::{ClaimStatus, LedgerReceipt, RecordId, SubmissionRecord};
pub use verdict::{CellCheck, CommitmentHash, RandomSeed, Sample, Verdict};
