//! Provides a wrapper type that decodes a string into bytes at deserialization time while
//! retaining the original string form, so that re-serialization is byte-stable even when the
//! input used a non-normalized encoding.

use crate::schema::error::{self, Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use snafu::ResultExt;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::ops::Deref;
use std::str::FromStr;

/// A string encoding scheme for a byte sequence.
pub trait Encode {
    /// Encode bytes into their string form.
    fn encode(bytes: &[u8]) -> String;
}

/// The inverse of [`Encode`].
pub trait Decode {
    /// Decode a string into its raw bytes.
    fn decode(s: &str) -> Result<Vec<u8>>;
}

/// Lowercase hexadecimal encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hex;

impl Encode for Hex {
    fn encode(bytes: &[u8]) -> String {
        hex::encode(bytes)
    }
}

impl Decode for Hex {
    fn decode(s: &str) -> Result<Vec<u8>> {
        hex::decode(s).context(error::HexDecodeSnafu { hex: s })
    }
}

/// A byte sequence decoded from a string, remembering the original string.
///
/// Equality, ordering, and hashing are all defined over the decoded bytes, so two values that
/// differ only in encoding (such as hex case) compare equal. Serialization writes the original
/// string back out, which keeps canonical forms stable across a parse/serialize round trip.
pub struct Decoded<T> {
    bytes: Vec<u8>,
    original: String,
    spooky: PhantomData<T>,
}

impl<T> Decoded<T> {
    /// The decoded bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consumes this value, returning the decoded bytes.
    pub fn into_vec(self) -> Vec<u8> {
        self.bytes
    }
}

impl<T: Encode> From<Vec<u8>> for Decoded<T> {
    fn from(bytes: Vec<u8>) -> Self {
        let original = T::encode(&bytes);
        Self {
            bytes,
            original,
            spooky: PhantomData,
        }
    }
}

impl<T: Decode> FromStr for Decoded<T> {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(Self {
            bytes: T::decode(s)?,
            original: s.to_owned(),
            spooky: PhantomData,
        })
    }
}

impl<T> fmt::Display for Decoded<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.original)
    }
}

impl<T> fmt::Debug for Decoded<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.original)
    }
}

impl<T> Clone for Decoded<T> {
    fn clone(&self) -> Self {
        Self {
            bytes: self.bytes.clone(),
            original: self.original.clone(),
            spooky: PhantomData,
        }
    }
}

impl<T> PartialEq for Decoded<T> {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl<T> Eq for Decoded<T> {}

impl<T> PartialEq<[u8]> for Decoded<T> {
    fn eq(&self, other: &[u8]) -> bool {
        self.bytes == other
    }
}

impl<T> Hash for Decoded<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bytes.hash(state);
    }
}

impl<T> Deref for Decoded<T> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.bytes
    }
}

impl<T> AsRef<[u8]> for Decoded<T> {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl<'de, T: Decode> Deserialize<'de> for Decoded<T> {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let original = String::deserialize(deserializer)?;
        original.parse().map_err(serde::de::Error::custom)
    }
}

impl<T> Serialize for Decoded<T> {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.original)
    }
}

#[cfg(test)]
mod tests {
    use super::{Decoded, Hex};

    #[test]
    fn hex_round_trip_preserves_original() {
        let decoded: Decoded<Hex> = "DEADBEEF".parse().unwrap();
        assert_eq!(decoded.bytes(), &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(decoded.to_string(), "DEADBEEF");

        let lower: Decoded<Hex> = "deadbeef".parse().unwrap();
        assert_eq!(decoded, lower);
    }

    #[test]
    fn invalid_hex_is_rejected() {
        assert!("xyz".parse::<Decoded<Hex>>().is_err());
        assert!("abc".parse::<Decoded<Hex>>().is_err());
    }
}
