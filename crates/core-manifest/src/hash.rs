//! 256-bit content hashes
//!
//! A content hash is the SHA-256 digest of a blob's raw (uncompressed) bytes.
//! It is written everywhere as 64 lowercase hex digits: in staged file names,
//! in manifest records and in the manifest file name itself.

use crate::error::{Error, Result};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Number of bytes in a content hash
pub const CONTENT_HASH_LEN: usize = 32;

/// Number of hex digits in the textual form of a content hash
pub const CONTENT_HASH_HEX_LEN: usize = CONTENT_HASH_LEN * 2;

/// A 256-bit content digest
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; CONTENT_HASH_LEN]);

impl ContentHash {
    /// Wrap raw digest bytes
    pub fn from_bytes(bytes: [u8; CONTENT_HASH_LEN]) -> Self {
        ContentHash(bytes)
    }

    /// Copy a digest out of a slice; the slice must be exactly 32 bytes
    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        let bytes: [u8; CONTENT_HASH_LEN] = slice
            .try_into()
            .map_err(|_| Error::InvalidContentHash(format!("{} bytes", slice.len())))?;
        Ok(ContentHash(bytes))
    }

    /// Raw digest bytes
    pub fn as_bytes(&self) -> &[u8; CONTENT_HASH_LEN] {
        &self.0
    }

    /// Lowercase hex form
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl FromStr for ContentHash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != CONTENT_HASH_HEX_LEN {
            return Err(Error::InvalidContentHash(s.to_string()));
        }
        let mut bytes = [0u8; CONTENT_HASH_LEN];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|_| Error::InvalidContentHash(s.to_string()))?;
        Ok(ContentHash(bytes))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_parse_and_display() {
        let hash: ContentHash = EMPTY_SHA256.parse().unwrap();
        assert_eq!(hash.to_string(), EMPTY_SHA256);
        assert_eq!(hash.as_bytes()[0], 0xe3);
    }

    #[test]
    fn test_uppercase_is_accepted_and_normalized() {
        let hash: ContentHash = EMPTY_SHA256.to_uppercase().parse().unwrap();
        assert_eq!(hash.to_hex(), EMPTY_SHA256);
    }

    #[test]
    fn test_rejects_bad_lengths_and_digits() {
        assert!("abc".parse::<ContentHash>().is_err());
        assert!(EMPTY_SHA256[1..].parse::<ContentHash>().is_err());
        let bad = format!("{}g", &EMPTY_SHA256[1..]);
        assert!(bad.parse::<ContentHash>().is_err());
    }

    #[test]
    fn test_from_slice_length_check() {
        assert!(ContentHash::from_slice(&[0u8; 31]).is_err());
        assert!(ContentHash::from_slice(&[0u8; 32]).is_ok());
    }

    #[test]
    fn test_serde_as_hex_string() {
        let hash: ContentHash = EMPTY_SHA256.parse().unwrap();
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", EMPTY_SHA256));
        let back: ContentHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
    }
}
