//! Content-address identifiers.
//!
//! Containers and objects are identified by 32-byte SHA-256 values. An
//! address is the `(container, object)` pair; its canonical string encoding
//! is `"<container_hex>/<object_hex>"`.

use crate::checksum::{hex_decode, hex_encode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Unique identifier for a container.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContainerId([u8; 32]);

impl ContainerId {
    /// Create from raw digest bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get as bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContainerId({})", hex_encode(&self.0))
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex_encode(&self.0))
    }
}

impl FromStr for ContainerId {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(parse_digest(s)?))
    }
}

/// Unique identifier for an object.
///
/// For a stored object this equals the SHA-256 digest of its payload.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId([u8; 32]);

impl ObjectId {
    /// Create from raw digest bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get as bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", hex_encode(&self.0))
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex_encode(&self.0))
    }
}

impl FromStr for ObjectId {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(parse_digest(s)?))
    }
}

/// Content address of an object: the `(container, object)` pair.
///
/// Equality is bitwise on the pair; addresses are globally unique.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address {
    /// Container the object belongs to.
    pub container: ContainerId,
    /// Object identifier within the container.
    pub object: ObjectId,
}

impl Address {
    /// Create a new address.
    #[must_use]
    pub const fn new(container: ContainerId, object: ObjectId) -> Self {
        Self { container, object }
    }

    /// Canonical string encoding: `"<container_hex>/<object_hex>"`.
    #[must_use]
    pub fn encode_to_string(&self) -> String {
        format!("{}/{}", self.container, self.object)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({}/{})", self.container, self.object)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.container, self.object)
    }
}

impl FromStr for Address {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (container, object) = s.split_once('/').ok_or(AddressParseError::MissingSeparator)?;
        Ok(Self {
            container: container.parse()?,
            object: object.parse()?,
        })
    }
}

/// Errors that can occur when parsing an identifier or address.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressParseError {
    #[error("address must contain a '/' separator")]
    MissingSeparator,
    #[error("identifier must be 64 hex characters, got {0}")]
    InvalidLength(usize),
    #[error("identifier contains non-hex characters")]
    InvalidHex,
}

fn parse_digest(s: &str) -> Result<[u8; 32], AddressParseError> {
    if s.len() != 64 {
        return Err(AddressParseError::InvalidLength(s.len()));
    }
    let bytes = hex_decode(s).ok_or(AddressParseError::InvalidHex)?;
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_address() -> Address {
        Address::new(
            ContainerId::from_bytes([0xc1; 32]),
            ObjectId::from_bytes([0x0b; 32]),
        )
    }

    #[test]
    fn test_address_round_trip() {
        let addr = sample_address();
        let encoded = addr.encode_to_string();
        assert_eq!(encoded.len(), 64 + 1 + 64);
        let parsed: Address = encoded.parse().unwrap();
        assert_eq!(parsed, addr);
    }

    #[test]
    fn test_address_parse_errors() {
        assert_eq!(
            "deadbeef".parse::<Address>().unwrap_err(),
            AddressParseError::MissingSeparator
        );
        assert_eq!(
            "ab/cd".parse::<Address>().unwrap_err(),
            AddressParseError::InvalidLength(2)
        );
        let bad = format!("{}/{}", "g".repeat(64), "0".repeat(64));
        assert_eq!(
            bad.parse::<Address>().unwrap_err(),
            AddressParseError::InvalidHex
        );
    }

    #[test]
    fn test_address_equality_is_bitwise() {
        let a = sample_address();
        let mut b = a;
        assert_eq!(a, b);
        let mut bytes = *b.object.as_bytes();
        bytes[31] ^= 1;
        b.object = ObjectId::from_bytes(bytes);
        assert_ne!(a, b);
    }
}
