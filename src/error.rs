//! Contains the error type for this library.

#![allow(clippy::default_trait_access)]

use crate::schema::RoleType;
use crate::transport::TransportError;
use chrono::{DateTime, Utc};
use snafu::Snafu;
use std::fmt;
use std::path::PathBuf;

/// Alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for this library.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
#[allow(missing_docs)]
pub enum Error {
    /// The cache directory could not be created or opened.
    #[snafu(display("Failed to initialize cache at '{}': {}", path.display(), source))]
    CacheInit {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A terminating delegation matched a target path but could not resolve it.
    #[snafu(display("Delegation for '{}' terminated without resolving it", path))]
    DelegationUnresolved { path: String },

    /// Delegation recursion went deeper than the configured bound.
    #[snafu(display("Delegation recursion exceeded {} levels", limit))]
    DelegationDepthExceeded { limit: u32 },

    /// A download stream failed partway through.
    #[snafu(display("Failed to download {}: {}", context, source))]
    Download {
        context: String,
        source: std::io::Error,
    },

    /// A role was used past its expiration date.
    #[snafu(display("Role '{}' expired at {}", role, expires))]
    Expired {
        role: String,
        expires: DateTime<Utc>,
    },

    /// Unable to create a file.
    #[snafu(display("Failed to create '{}': {}", path.display(), source))]
    FileCreate {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Unable to open a file.
    #[snafu(display("Failed to open '{}': {}", path.display(), source))]
    FileOpen {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Unable to read a file.
    #[snafu(display("Failed to read '{}': {}", path.display(), source))]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Unable to rename a file.
    #[snafu(display("Failed to rename '{}' to '{}': {}", from.display(), to.display(), source))]
    FileRename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },

    /// A download exceeded its size bound.
    #[snafu(display("Downloaded {} exceeded the maximum size of {} bytes", specifier, max_size))]
    FileTooLarge {
        specifier: String,
        max_size: u64,
    },

    /// Unable to write a file.
    #[snafu(display("Failed to write '{}': {}", path.display(), source))]
    FileWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A file's bytes did not match its declared length and digests.
    #[snafu(display(
        "File '{}' did not match its declared info: expected {}, calculated {}",
        file,
        expected,
        actual
    ))]
    InvalidFileInfo {
        file: String,
        expected: String,
        actual: String,
    },

    /// A signature failed cryptographic verification.
    #[snafu(display("Invalid signature by key id '{}'", keyid))]
    InvalidSignature { keyid: String },

    /// A JSON document could not be parsed.
    #[snafu(display("Failed to parse {}: {}", file, source))]
    JsonParse {
        file: String,
        source: serde_json::Error,
    },

    /// A value could not be serialized to JSON.
    #[snafu(display("Failed to serialize {}: {}", what, source))]
    JsonSerialize {
        what: String,
        source: serde_json::Error,
    },

    /// A private key could not be parsed.
    #[snafu(display("Unable to parse keypair: {}", source))]
    KeyRejected { source: ring::error::KeyRejected },

    /// A required file map entry was absent from a role document.
    #[snafu(display("Meta for '{}' missing from role '{}'", file, role))]
    MetaMissing { file: String, role: String },

    /// `with_remote` was called outside a `with_mirror` scope.
    #[snafu(display("No mirror is selected; remote fetches must run inside a mirror scope"))]
    NoMirrorSelected,

    /// A mirror scope was entered without any configured mirrors.
    #[snafu(display("No mirrors are configured"))]
    NoMirrorsConfigured,

    /// A package identifier could not be parsed as `<name>-<version>`.
    #[snafu(display("Invalid package identifier '{}'", id))]
    PackageIdInvalid { id: String },

    /// The trusted root is absent from the cache.
    #[snafu(display("No trusted root found at '{}'; bootstrap one first", path.display()))]
    RootNotFound { path: PathBuf },

    /// A role entry was absent from the root document.
    #[snafu(display("Root does not define the '{}' role", role))]
    RoleMissing { role: RoleType },

    /// The server kept rotating root trust faster than we were willing to follow.
    #[snafu(display("Gave up after {} root updates within one check cycle", max))]
    RootUpdatesExceeded { max: u32 },

    /// A schema-level parse or encoding error.
    #[snafu(display("Metadata error: {}", source))]
    Schema { source: crate::schema::Error },

    /// An envelope did not carry enough valid signatures for its role.
    #[snafu(display(
        "Signature threshold for role '{}' not met: needed {}, got {}",
        role,
        need,
        got
    ))]
    SignatureThresholdNotMet {
        role: String,
        need: u64,
        got: u64,
    },

    /// A target path resolved to nothing in the targets tree.
    #[snafu(display("Target '{}' was not found", path))]
    TargetNotFound { path: String },

    /// Unable to create a temporary file.
    #[snafu(display("Failed to create a temporary file in '{}': {}", path.display(), source))]
    TempFileCreate {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A transport failed to fetch a file.
    #[snafu(display("Transport error: {}", source))]
    Transport { source: TransportError },

    /// An incremental update could not even be attempted. Always downgraded to a full download.
    #[snafu(display("Incremental index update impossible: {}", reason))]
    UpdateImpossible { reason: UpdateImpossibleReason },

    /// An incremental update was attempted and failed. Always downgraded to a full download.
    #[snafu(display("Incremental index update failed: {}", detail))]
    UpdateFailed { detail: String },

    /// A key ID that no key environment entry resolves was referenced by a role.
    #[snafu(display("Unknown key id '{}'", keyid))]
    UnknownKey { keyid: String },

    /// A URL path could not be joined onto a mirror's base URL.
    #[snafu(display("Failed to join \"{}\" to URL \"{}\": {}", path, url, source))]
    UrlJoin {
        path: String,
        url: url::Url,
        source: url::ParseError,
    },

    /// A role document with the same version as the trusted copy had differing contents.
    #[snafu(display(
        "Role '{}' version {} differs from the trusted copy of the same version",
        role,
        version
    ))]
    VersionContentMismatch { role: String, version: u64 },

    /// A role document's version went backwards.
    #[snafu(display(
        "Version rollback for role '{}': trusted version {}, got {}",
        role,
        have,
        got
    ))]
    VersionRollback {
        role: String,
        have: u64,
        got: u64,
    },

    /// A document's `_type` discriminator did not match the expected role.
    #[snafu(display("Expected metadata of type '{}', got '{}'", expected, got))]
    WrongType { expected: RoleType, got: String },
}

impl Error {
    /// Whether failing over to the next mirror could plausibly cure this error.
    ///
    /// Transport failures and verification failures are per-mirror (a mirror can be stale or
    /// hostile); local I/O problems and programmer errors are not.
    pub(crate) fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Download { .. }
                | Error::Expired { .. }
                | Error::FileTooLarge { .. }
                | Error::InvalidFileInfo { .. }
                | Error::InvalidSignature { .. }
                | Error::JsonParse { .. }
                | Error::MetaMissing { .. }
                | Error::SignatureThresholdNotMet { .. }
                | Error::Transport { .. }
                | Error::UnknownKey { .. }
                | Error::VersionContentMismatch { .. }
                | Error::VersionRollback { .. }
                | Error::WrongType { .. }
        )
    }
}

/// Why an incremental index update could not be attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateImpossibleReason {
    /// The server only advertises the compressed index.
    OnlyCompressed,
    /// The server has not been observed to support byte ranges.
    Unsupported,
    /// There is no cached index to extend.
    NoLocalCopy,
}

impl fmt::Display for UpdateImpossibleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateImpossibleReason::OnlyCompressed => {
                f.write_str("only a compressed index is advertised")
            }
            UpdateImpossibleReason::Unsupported => {
                f.write_str("byte-range support has not been observed")
            }
            UpdateImpossibleReason::NoLocalCopy => f.write_str("no local index copy exists"),
        }
    }
}
