//! `0x`-prefixed lowercase hex encoding for fixed-size digests.

use std::fmt::Write;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HexParseError {
    #[error("hex value must start with 0x")]
    MissingPrefix,
    #[error("expected {expected} hex digits, got {actual}")]
    WrongLength { expected: usize, actual: usize },
    #[error("invalid hex digit '{0}'")]
    InvalidDigit(char),
}

/// Encode bytes as `0x` followed by lowercase hex digits.
#[must_use]
pub fn encode_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("0x");
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// Decode a `0x`-prefixed, 64-digit hex string into 32 bytes.
///
/// Accepts upper- and lowercase digits.
pub fn decode_hex_32(value: &str) -> Result<[u8; 32], HexParseError> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .ok_or(HexParseError::MissingPrefix)?;
    if let Some(bad) = digits.chars().find(|c| !c.is_ascii()) {
        return Err(HexParseError::InvalidDigit(bad));
    }
    if digits.len() != 64 {
        return Err(HexParseError::WrongLength {
            expected: 64,
            actual: digits.len(),
        });
    }

    let mut out = [0u8; 32];
    let chars: Vec<char> = digits.chars().collect();
    for (i, pair) in chars.chunks(2).enumerate() {
        let hi = pair[0].to_digit(16).ok_or(HexParseError::InvalidDigit(pair[0]))?;
        let lo = pair[1].to_digit(16).ok_or(HexParseError::InvalidDigit(pair[1]))?;
        out[i] = ((hi << 4) | lo) as u8;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_is_lowercase_and_prefixed() {
        assert_eq!(encode_hex(&[0xAB, 0x01, 0x00]), "0xab0100");
        assert_eq!(encode_hex(&[]), "0x");
    }

    #[test]
    fn decode_accepts_mixed_case() {
        let upper = format!("0x{}", "AB".repeat(32));
        assert_eq!(decode_hex_32(&upper).unwrap(), [0xAB; 32]);
    }

    #[test]
    fn decode_rejects_missing_prefix() {
        let raw = "ab".repeat(32);
        assert_eq!(decode_hex_32(&raw), Err(HexParseError::MissingPrefix));
    }

    #[test]
    fn decode_rejects_wrong_length() {
        assert_eq!(
            decode_hex_32("0xabcd"),
            Err(HexParseError::WrongLength {
                expected: 64,
                actual: 4
            })
        );
    }

    #[test]
    fn decode_rejects_non_hex() {
        let bad = format!("0x{}zz", "00".repeat(31));
        assert_eq!(decode_hex_32(&bad), Err(HexParseError::InvalidDigit('z')));
    }
}
