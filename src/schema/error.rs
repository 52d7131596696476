//! Error types for the metadata schema.

use snafu::Snafu;
use std::path::PathBuf;

/// Alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for parsing and encoding metadata documents.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum Error {
    /// A duplicate key ID was encountered while building a key environment.
    #[snafu(display("Duplicate key id '{}'", keyid))]
    DuplicateKeyId {
        /// The offending key ID.
        keyid: String,
    },

    /// Unable to open a file.
    #[snafu(display("Failed to open '{}': {}", path.display(), source))]
    FileOpen {
        /// The file that could not be opened.
        path: PathBuf,
        /// The source of the error.
        source: std::io::Error,
    },

    /// Unable to read a file.
    #[snafu(display("Failed to read '{}': {}", path.display(), source))]
    FileRead {
        /// The file that could not be read.
        path: PathBuf,
        /// The source of the error.
        source: std::io::Error,
    },

    /// A hex string could not be decoded.
    #[snafu(display("Invalid hex string '{}': {}", hex, source))]
    HexDecode {
        /// The invalid string.
        hex: String,
        /// The source of the error.
        source: hex::FromHexError,
    },

    /// A key ID in a key environment did not match the contained public key.
    #[snafu(display("Key id '{}' does not match calculated id '{}'", keyid, calculated))]
    InvalidKeyId {
        /// The key ID as stated in the document.
        keyid: String,
        /// The key ID calculated from the public key.
        calculated: String,
    },

    /// A delegation path pattern could not be parsed.
    #[snafu(display("Invalid path pattern '{}': {}", pattern, reason))]
    InvalidPattern {
        /// The pattern as written in the document.
        pattern: String,
        /// Why the pattern was rejected.
        reason: &'static str,
    },

    /// A value could not be serialized to canonical JSON.
    #[snafu(display("Failed to serialize {} to canonical JSON: {}", what, source))]
    JsonSerialization {
        /// What was being serialized.
        what: String,
        /// The source of the error.
        source: serde_json::Error,
    },
}
