//! The uniform interface the client driver uses to talk to a repository, local or remote.

use crate::cache::{CachedFile, INDEX_TAR, INDEX_TAR_GZ};
use crate::error::Result;
use crate::index::PackageId;
use crate::schema::{FileInfo, Mirrors};
use crate::verify::Trusted;
use std::fmt::Debug;
use std::path::{Path, PathBuf};

/// The format a fetched index archive arrived in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// A plain ustar archive.
    Uncompressed,
    /// A gzip-compressed ustar archive.
    Gzip,
}

/// The non-empty set of index formats a snapshot advertises, each pinned by its `FileInfo`.
///
/// Handlers must match exhaustively on the three shapes; which downloads are possible (and
/// whether an incremental update can even be attempted) follows from the shape alone.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexDownloads {
    /// Only the uncompressed archive is available.
    Tar {
        /// Info for `00-index.tar`.
        tar: FileInfo,
    },
    /// Only the compressed archive is available.
    TarGz {
        /// Info for `00-index.tar.gz`.
        tar_gz: FileInfo,
    },
    /// Both formats are available.
    Both {
        /// Info for `00-index.tar`.
        tar: FileInfo,
        /// Info for `00-index.tar.gz`.
        tar_gz: FileInfo,
    },
}

impl IndexDownloads {
    /// Info for the uncompressed archive, when advertised.
    pub fn tar(&self) -> Option<&FileInfo> {
        match self {
            IndexDownloads::Tar { tar } | IndexDownloads::Both { tar, .. } => Some(tar),
            IndexDownloads::TarGz { .. } => None,
        }
    }

    /// Info for the compressed archive, when advertised.
    pub fn tar_gz(&self) -> Option<&FileInfo> {
        match self {
            IndexDownloads::TarGz { tar_gz } | IndexDownloads::Both { tar_gz, .. } => Some(tar_gz),
            IndexDownloads::Tar { .. } => None,
        }
    }
}

/// A file that may be fetched from a repository, carrying whatever sizing information the
/// caller has already verified.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteFile {
    /// `timestamp.json`. Its size is never declared anywhere, so fetches are bounded by
    /// [`Limits::max_timestamp_size`](crate::Limits::max_timestamp_size).
    Timestamp,
    /// `root.json`, with its snapshot-declared info when a snapshot has been verified (absent
    /// only at bootstrap).
    Root {
        /// Declared info, when known.
        info: Option<FileInfo>,
    },
    /// `snapshot.json`, pinned by the verified timestamp.
    Snapshot {
        /// Declared info.
        info: FileInfo,
    },
    /// `mirrors.json`, pinned by the verified snapshot.
    Mirrors {
        /// Declared info.
        info: FileInfo,
    },
    /// The package index archive, in whichever formats the verified snapshot advertises.
    Index {
        /// The advertised formats and their declared infos.
        downloads: IndexDownloads,
    },
    /// A package release archive, pinned by the verified targets tree.
    Package {
        /// Which package.
        id: PackageId,
        /// Declared info.
        info: FileInfo,
    },
}

impl RemoteFile {
    /// The repository-relative path of this file in the given format.
    ///
    /// Only the index varies by format; every other file has exactly one representation.
    pub(crate) fn remote_path(&self, format: Format) -> String {
        match self {
            RemoteFile::Timestamp => "timestamp.json".to_owned(),
            RemoteFile::Root { .. } => "root.json".to_owned(),
            RemoteFile::Snapshot { .. } => "snapshot.json".to_owned(),
            RemoteFile::Mirrors { .. } => "mirrors.json".to_owned(),
            RemoteFile::Index { .. } => match format {
                Format::Uncompressed => INDEX_TAR.to_owned(),
                Format::Gzip => INDEX_TAR_GZ.to_owned(),
            },
            RemoteFile::Package { id, .. } => format!("package/{}", id.archive_file_name()),
        }
    }

    /// A short human name for size-bound errors.
    pub(crate) fn specifier(&self) -> &'static str {
        match self {
            RemoteFile::Timestamp => "timestamp.json",
            RemoteFile::Root { .. } => "root.json",
            RemoteFile::Snapshot { .. } => "snapshot.json",
            RemoteFile::Mirrors { .. } => "mirrors.json",
            RemoteFile::Index { .. } => "the package index",
            RemoteFile::Package { .. } => "a package archive",
        }
    }
}

/// The handler invoked by [`Repository::with_remote`] once the requested file is available on
/// the local filesystem. The path points into unverified staging; the handler must verify the
/// bytes before anything is committed to cache.
pub type FetchHandler<'a> = &'a mut dyn FnMut(Format, &Path) -> Result<()>;

/// A repository of signed metadata and package archives.
///
/// Implementations differ in where bytes come from; the trust decisions all live in the caller,
/// which verifies every byte against the trusted metadata chain before committing anything.
/// Structured logging of repository events goes through the `log` facade.
pub trait Repository: Debug {
    /// Runs `scope` with a mirror selected. Nested [`Repository::with_remote`] calls use that
    /// mirror. On recoverable failure the scope is retried under the next mirror; the last
    /// mirror's error surfaces.
    fn with_mirror(&self, scope: &mut dyn FnMut() -> Result<()>) -> Result<()>;

    /// Ensures `file` is available on the local filesystem and invokes the handler with the
    /// selected format and a staged path. The caller is responsible for verifying the bytes
    /// before any cache commit.
    fn with_remote(&self, file: &RemoteFile, handler: FetchHandler<'_>) -> Result<()>;

    /// Read-only access to verified local state.
    fn get_cached(&self, file: CachedFile) -> Option<PathBuf>;

    /// As [`Repository::get_cached`], root-specific: the root must exist.
    fn get_cached_root(&self) -> Result<PathBuf>;

    /// Moves verified bytes to a stable staging location, to be committed at the end of the
    /// update cycle. Returns the staged path.
    fn stage(&self, verified: &Path, file: CachedFile) -> Result<PathBuf>;

    /// The verified handoff: atomically replaces the cached `file` with the bytes at `staged`.
    fn cache_remote(&self, staged: &Path, file: CachedFile) -> Result<()>;

    /// As [`Repository::cache_remote`], for bytes already in memory.
    fn cache_bytes(&self, bytes: &[u8], file: CachedFile) -> Result<()>;

    /// Forgets the cached timestamp and snapshot.
    fn clear_cache(&self) -> Result<()>;

    /// Looks up one of a package's files in the cached index archive.
    fn get_from_index(&self, id: &PackageId, file_name: &str) -> Result<Option<Vec<u8>>>;

    /// Looks up an index-resident file by its raw entry path, e.g. `targets.json`.
    fn get_index_file(&self, entry: &str) -> Result<Option<Vec<u8>>>;

    /// Feeds a verified mirror list back into mirror selection. The default implementation
    /// ignores it; only backends with a mirror concept care.
    fn note_mirrors(&self, mirrors: &Trusted<Mirrors>) -> Result<()> {
        let _ = mirrors;
        Ok(())
    }
}
