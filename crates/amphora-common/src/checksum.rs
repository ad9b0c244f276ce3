//! Checksum utilities: SHA-256 for content addressing, CRC32C for
//! on-disk record framing.

use sha2::{Digest, Sha256};

/// Compute the SHA-256 digest of a payload.
///
/// This is the value a content address is derived from: an object identifier
/// equals the digest of its payload.
#[must_use]
pub fn payload_digest(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Quick CRC32C computation for record framing.
#[inline]
#[must_use]
pub fn compute_crc32c(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

/// Quick CRC32C verification.
#[inline]
#[must_use]
pub fn verify_crc32c(data: &[u8], expected: u32) -> bool {
    crc32c::crc32c(data) == expected
}

/// Hex encode bytes.
#[must_use]
pub fn hex_encode(bytes: &[u8]) -> String {
    const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";
    let mut result = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        result.push(HEX_CHARS[(byte >> 4) as usize] as char);
        result.push(HEX_CHARS[(byte & 0x0f) as usize] as char);
    }
    result
}

/// Hex decode a string. Returns `None` on odd length or non-hex characters.
#[must_use]
pub fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    let mut out = Vec::with_capacity(s.len() / 2);
    let bytes = s.as_bytes();
    for pair in bytes.chunks(2) {
        let hi = hex_nibble(pair[0])?;
        let lo = hex_nibble(pair[1])?;
        out.push((hi << 4) | lo);
    }
    Some(out)
}

fn hex_nibble(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_digest_stable() {
        let a = payload_digest(b"hello, world!");
        let b = payload_digest(b"hello, world!");
        assert_eq!(a, b);
        assert_ne!(a, payload_digest(b"hello, world?"));
    }

    #[test]
    fn test_crc32c() {
        let data = b"hello, world!";
        let crc = compute_crc32c(data);
        assert!(verify_crc32c(data, crc));
        assert!(!verify_crc32c(b"hello, world?", crc));
    }

    #[test]
    fn test_hex_round_trip() {
        assert_eq!(hex_encode(&[0x12, 0xab, 0xcd]), "12abcd");
        assert_eq!(hex_decode("12abcd").unwrap(), vec![0x12, 0xab, 0xcd]);
        assert_eq!(hex_decode("00ff").unwrap(), vec![0x00, 0xff]);
        assert!(hex_decode("0").is_none());
        assert!(hex_decode("zz").is_none());
    }
}
