#![warn(clippy::pedantic)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::must_use_candidate
)]

//! `palisade` is a secure package-index client for Hackage-style repositories.
//!
//! The repository publishes a set of signed metadata documents (root, timestamp, snapshot,
//! mirrors, and a package index whose entries include the signed targets tree), and this crate
//! verifies all of it against a root of trust established out-of-band, so that package
//! archives can be fetched from entirely untrusted mirrors.
//!
//! The crate is organized around three pieces:
//!
//! * the **verification pipeline** ([`TrustState`], in `verify`): signature thresholds,
//!   version monotonicity, expiry, chained root rotation, and targets delegation. Documents
//!   that pass come back wrapped in [`Trusted`], which nothing else can construct.
//! * the **repository layer** ([`Repository`], [`RemoteRepository`]): mirror selection with
//!   failover, bounded downloads into unverified staging, incremental index updates over HTTP
//!   byte ranges, and the atomic-rename cache of verified files.
//! * the **client driver** ([`Client`]): `check_for_updates` and `download_package`,
//!   orchestrating the two layers so that nothing unverified ever lands in the cache.
//!
//! ```no_run
//! use chrono::Utc;
//! use palisade::{Cache, Client, ExpirationEnforcement, FilesystemTransport, Limits,
//!     PackageId, RemoteRepository};
//! use std::path::Path;
//! use url::Url;
//!
//! # fn main() -> palisade::Result<()> {
//! let repository = RemoteRepository::new(
//!     Box::new(FilesystemTransport::new()),
//!     vec![Url::parse("file:///var/mirror/").unwrap()],
//!     Cache::open("/var/cache/palisade")?,
//!     Limits::default(),
//! );
//! let mut client = Client::bootstrap(
//!     repository,
//!     Path::new("/etc/palisade/root.json"),
//!     ExpirationEnforcement::Safe,
//!     Limits::default(),
//!     Utc::now(),
//! )?;
//! client.check_for_updates(Utc::now())?;
//! let id: PackageId = "acme-widgets-1.2.0".parse()?;
//! client.download_package(&id, Path::new("acme-widgets-1.2.0.tar.gz"), Utc::now())?;
//! # Ok(())
//! # }
//! ```

mod cache;
mod client;
mod error;
#[cfg(feature = "http")]
mod http;
mod index;
mod io;
mod remote;
mod repository;
pub mod schema;
mod sign;
mod transport;
mod verify;

pub use crate::cache::{Cache, CachedFile};
pub use crate::client::{Client, UpdateOutcome};
pub use crate::error::{Error, Result, UpdateImpossibleReason};
#[cfg(feature = "http")]
pub use crate::http::{HttpTransport, HttpTransportBuilder};
pub use crate::index::PackageId;
pub use crate::remote::RemoteRepository;
pub use crate::repository::{FetchHandler, Format, IndexDownloads, RemoteFile, Repository};
pub use crate::sign::{parse_keypair, sign_envelope, Sign};
pub use crate::transport::{
    FilesystemTransport, RangeResponse, ServerCapabilities, Transport, TransportError,
    TransportErrorKind,
};
pub use crate::verify::{RootUpdate, SnapshotFiles, Trusted, TrustState};

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};

/// Bounds on downloads whose sizes no verified metadata declares, and on how far the client is
/// willing to chase the repository within one operation.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// Maximum size in bytes of a fetched `root.json` when no snapshot declares its length
    /// (i.e. at bootstrap). Default 1 MiB.
    pub max_root_size: u64,

    /// Maximum size in bytes of a fetched `timestamp.json`; its length is never declared
    /// anywhere. Default 1 MiB.
    pub max_timestamp_size: u64,

    /// Snapshot-size half of the budget for the optional timestamp+snapshot bundle, which is
    /// fetched before a verified snapshot length is available. Default 16 MiB.
    pub max_snapshot_size: u64,

    /// Maximum decoded size in bytes of a compressed index whose uncompressed length is not
    /// declared. Default 1 GiB.
    pub max_index_size: u64,

    /// How many root rotations the client will follow within a single check cycle before
    /// giving up. Default 3.
    pub max_root_updates: u32,

    /// Maximum depth of targets delegation. Default 8.
    pub max_delegation_depth: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_root_size: 1024 * 1024,
            max_timestamp_size: 1024 * 1024,
            max_snapshot_size: 16 * 1024 * 1024,
            max_index_size: 1024 * 1024 * 1024,
            max_root_updates: 3,
            max_delegation_depth: 8,
        }
    }
}

/// Whether or not to fail when metadata has expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpirationEnforcement {
    /// Expirations are enforced. You should use this option unless you have a good reason not
    /// to.
    Safe,
    /// Expirations are not enforced. This is intended for working with repository copies that
    /// are known to be stale, e.g. backups; every other check still runs.
    Unsafe,
}

/// Characters that must not appear verbatim in a file name derived from a role name.
const FILENAME_CHARACTERS_TO_AVOID: &AsciiSet = &CONTROLS
    .add(b'/')
    .add(b'\\')
    .add(b'%')
    .add(b'?')
    .add(b'#')
    .add(b'*');

/// Percent-encodes a role or target name so it is safe to use as a single file name or URL
/// path segment.
pub fn encode_filename<S: AsRef<str>>(name: S) -> String {
    utf8_percent_encode(name.as_ref(), FILENAME_CHARACTERS_TO_AVOID).to_string()
}

#[cfg(test)]
mod tests {
    use super::encode_filename;

    #[test]
    fn filename_encoding() {
        assert_eq!(encode_filename("team-alpha"), "team-alpha");
        assert_eq!(encode_filename("a/../b"), "a%2F..%2Fb");
        assert_eq!(encode_filename("50%"), "50%25");
    }
}
