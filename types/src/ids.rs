use std::fmt;

use serde::{Deserialize, Serialize};

use crate::claim::ClaimValidationError;
use crate::hex::{HexParseError, decode_hex_32, encode_hex};

/// Ledger address of the landowner submitting a claim.
///
/// # Invariants
///
/// - `0x` followed by exactly 40 hex digits
/// - Stored lowercase, so two spellings of the same address compare equal
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClaimantAddress(String);

impl ClaimantAddress {
    pub fn new(value: impl Into<String>) -> Result<Self, ClaimValidationError> {
        let value = value.into();
        let trimmed = value.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"));
        match digits {
            Some(d) if d.len() == 40 && d.chars().all(|c| c.is_ascii_hexdigit()) => {
                Ok(Self(format!("0x{}", d.to_ascii_lowercase())))
            }
            _ => Err(ClaimValidationError::InvalidClaimant(value)),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ClaimantAddress {
    type Error = ClaimValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ClaimantAddress> for String {
    fn from(value: ClaimantAddress) -> Self {
        value.0
    }
}

impl fmt::Display for ClaimantAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a claimed parcel. Never empty after trimming.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ParcelId(String);

impl ParcelId {
    pub fn new(value: impl Into<String>) -> Result<Self, ClaimValidationError> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            Err(ClaimValidationError::EmptyParcel)
        } else {
            Ok(Self(trimmed.to_string()))
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ParcelId {
    type Error = ClaimValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ParcelId> for String {
    fn from(value: ParcelId) -> Self {
        value.0
    }
}

impl fmt::Display for ParcelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Block/sequence marker assigned by the feed. Used for replay and deduplication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventMarker(u64);

impl EventMarker {
    #[must_use]
    pub fn new(marker: u64) -> Self {
        Self(marker)
    }

    #[must_use]
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EventMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 32-byte nonce correlating a randomness request with its asynchronous response.
///
/// Serializes as a `0x`-prefixed hex string.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RequestNonce([u8; 32]);

impl RequestNonce {
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

impl TryFrom<String> for RequestNonce {
    type Error = HexParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        decode_hex_32(&value).map(Self)
    }
}

impl From<RequestNonce> for String {
    fn from(value: RequestNonce) -> Self {
        value.to_hex()
    }
}

impl fmt::Display for RequestNonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for RequestNonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestNonce({})", self.to_hex())
    }
}
