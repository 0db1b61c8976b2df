//! Core domain types

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// Length of an identity hash in bytes (truncated 128-bit hash)
pub const IDENTITY_HASH_LEN: usize = 16;

/// Hash identifying a remote peer's identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdentityHash(pub [u8; IDENTITY_HASH_LEN]);

impl IdentityHash {
    /// Create an identity hash from raw bytes
    pub fn new(bytes: [u8; IDENTITY_HASH_LEN]) -> Self {
        Self(bytes)
    }

    /// Create an identity hash from a byte slice of the right length
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; IDENTITY_HASH_LEN]>::try_from(bytes).ok().map(Self)
    }

    /// Parse a hash from its hexadecimal form
    pub fn from_hex(value: &str) -> Result<Self, ConfigError> {
        let expected = IDENTITY_HASH_LEN * 2;
        if value.len() != expected {
            return Err(ConfigError::InvalidIdentity {
                value: value.to_string(),
                reason: format!(
                    "must be {} hexadecimal characters ({} bytes)",
                    expected, IDENTITY_HASH_LEN
                ),
            });
        }

        let bytes = hex::decode(value).map_err(|e| ConfigError::InvalidIdentity {
            value: value.to_string(),
            reason: e.to_string(),
        })?;

        Self::from_slice(&bytes).ok_or_else(|| ConfigError::InvalidIdentity {
            value: value.to_string(),
            reason: "wrong length".to_string(),
        })
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Lowercase hex without decoration
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Display form exposed to child processes, e.g. `<0123...ef>`
    pub fn pretty(&self) -> String {
        format!("<{}>", self.to_hex())
    }
}

impl fmt::Display for IdentityHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.pretty())
    }
}

impl FromStr for IdentityHash {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s.trim().trim_start_matches('<').trim_end_matches('>'))
    }
}

impl Serialize for IdentityHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for IdentityHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    fn test_identity_from_hex() {
        let id = IdentityHash::from_hex(HASH).unwrap();
        assert_eq!(id.to_hex(), HASH);
        assert_eq!(id.as_bytes()[0], 0x01);
    }

    #[test]
    fn test_identity_pretty() {
        let id = IdentityHash::from_hex(HASH).unwrap();
        assert_eq!(id.pretty(), format!("<{}>", HASH));
        assert_eq!(id.to_string(), id.pretty());
    }

    #[test]
    fn test_identity_rejects_wrong_length() {
        let err = IdentityHash::from_hex("abcd").unwrap_err();
        assert!(err.to_string().contains("32 hexadecimal characters"));
    }

    #[test]
    fn test_identity_rejects_non_hex() {
        let bad = "zz23456789abcdef0123456789abcdef";
        assert!(IdentityHash::from_hex(bad).is_err());
    }

    #[test]
    fn test_identity_parse_accepts_pretty_form() {
        let id: IdentityHash = format!("<{}>", HASH).parse().unwrap();
        assert_eq!(id.to_hex(), HASH);
    }

    #[test]
    fn test_identity_serde_as_hex() {
        let id = IdentityHash::from_hex(HASH).unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", HASH));
        let back: IdentityHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
