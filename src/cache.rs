//! The local trusted cache.
//!
//! Layout:
//!
//! ```text
//! <cache>/root.json
//! <cache>/timestamp.json
//! <cache>/snapshot.json
//! <cache>/mirrors.json
//! <cache>/00-index.tar
//! <cache>/00-index.tar.idx        (offset table for O(1) lookup)
//! <cache>/unverified/             (staging; never trusted)
//! ```
//!
//! Everything outside `unverified/` has been verified before it was written, and every write is
//! a temp-file-then-rename so concurrent readers always see a self-consistent file set.

use crate::error::{self, Result};
use crate::index::TarIndex;
use crate::io;
use log::debug;
use snafu::{OptionExt, ResultExt};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

pub(crate) const INDEX_TAR: &str = "00-index.tar";
pub(crate) const INDEX_TAR_GZ: &str = "00-index.tar.gz";
const INDEX_SIDECAR: &str = "00-index.tar.idx";
const UNVERIFIED_DIR: &str = "unverified";

/// Identifies a file in the trusted cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CachedFile {
    /// The trusted root document.
    Root,
    /// The trusted timestamp document.
    Timestamp,
    /// The trusted snapshot document.
    Snapshot,
    /// The trusted mirror list.
    Mirrors,
    /// The uncompressed package index archive.
    Index,
}

impl CachedFile {
    pub(crate) fn file_name(self) -> &'static str {
        match self {
            CachedFile::Root => "root.json",
            CachedFile::Timestamp => "timestamp.json",
            CachedFile::Snapshot => "snapshot.json",
            CachedFile::Mirrors => "mirrors.json",
            CachedFile::Index => INDEX_TAR,
        }
    }
}

/// The on-disk store of verified repository state.
#[derive(Debug, Clone)]
pub struct Cache {
    dir: PathBuf,
}

impl Cache {
    /// Opens (creating if necessary) a cache directory.
    pub fn open<P: Into<PathBuf>>(dir: P) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(dir.join(UNVERIFIED_DIR))
            .context(error::CacheInitSnafu { path: &dir })?;
        Ok(Self { dir })
    }

    /// The path a cached file lives at, whether or not it currently exists.
    pub fn path_for(&self, file: CachedFile) -> PathBuf {
        self.dir.join(file.file_name())
    }

    /// The path of a cached file, if it exists.
    pub fn get(&self, file: CachedFile) -> Option<PathBuf> {
        let path = self.path_for(file);
        path.is_file().then_some(path)
    }

    /// The path of the trusted root. Unlike the other files, its absence is fatal: nothing can
    /// be verified without it.
    pub fn root(&self) -> Result<PathBuf> {
        self.get(CachedFile::Root)
            .context(error::RootNotFoundSnafu {
                path: self.path_for(CachedFile::Root),
            })
    }

    /// Reads a cached file's bytes, if it exists.
    pub fn read(&self, file: CachedFile) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(file);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).context(error::FileReadSnafu { path }),
        }
    }

    /// Forgets the timestamp and snapshot. Called after a root update rotates the keys of the
    /// roles that vouch for them, so the next fetch is treated as first-use.
    pub fn clear(&self) -> Result<()> {
        for file in [CachedFile::Timestamp, CachedFile::Snapshot] {
            let path = self.path_for(file);
            debug!("removing '{}'", path.display());
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(err).context(error::FileWriteSnafu { path }),
            }
        }
        Ok(())
    }

    /// The staging directory for unverified downloads.
    pub(crate) fn staging_dir(&self) -> PathBuf {
        self.dir.join(UNVERIFIED_DIR)
    }

    /// Creates a temp file in the staging directory.
    pub(crate) fn temp_file(&self) -> Result<NamedTempFile> {
        NamedTempFile::new_in(self.staging_dir()).context(error::TempFileCreateSnafu {
            path: self.staging_dir(),
        })
    }

    /// Moves verified bytes at `staged` to a stable name in the staging directory, where they
    /// wait for [`Cache::commit`] at the end of the update cycle.
    pub(crate) fn stage(&self, staged: &Path, file: CachedFile) -> Result<PathBuf> {
        let dest = self
            .staging_dir()
            .join(format!("{}.verified", file.file_name()));
        fs::rename(staged, &dest).context(error::FileRenameSnafu {
            from: staged,
            to: &dest,
        })?;
        Ok(dest)
    }

    /// The verified handoff: atomically replaces the cached `file` with the bytes at `staged`.
    /// Replacing the index also regenerates its sidecar offset table.
    pub(crate) fn commit(&self, staged: &Path, file: CachedFile) -> Result<()> {
        let dest = self.path_for(file);
        io::persist(staged, &dest)?;
        debug!("cached '{}'", dest.display());
        if file == CachedFile::Index {
            self.rebuild_sidecar(&dest)?;
        }
        Ok(())
    }

    /// Writes in-memory verified bytes through the same staging-then-rename path.
    pub(crate) fn commit_bytes(&self, bytes: &[u8], file: CachedFile) -> Result<()> {
        let mut tmp = self.temp_file()?;
        std::io::Write::write_all(&mut tmp, bytes).context(error::FileWriteSnafu {
            path: tmp.path().to_owned(),
        })?;
        self.commit(tmp.path(), file)
    }

    fn sidecar_path(&self) -> PathBuf {
        self.dir.join(INDEX_SIDECAR)
    }

    fn rebuild_sidecar(&self, tar_path: &Path) -> Result<TarIndex> {
        let index = TarIndex::build(tar_path)?;
        let mut tmp = self.temp_file()?;
        std::io::Write::write_all(&mut tmp, &index.to_json()?).context(
            error::FileWriteSnafu {
                path: tmp.path().to_owned(),
            },
        )?;
        io::persist(tmp.path(), &self.sidecar_path())?;
        Ok(index)
    }

    /// Reads one entry out of the cached index archive, using the sidecar for O(1) lookup and
    /// rebuilding it first if it is missing or unreadable.
    pub(crate) fn read_index_entry(&self, entry: &str) -> Result<Option<Vec<u8>>> {
        let Some(tar_path) = self.get(CachedFile::Index) else {
            return Ok(None);
        };
        let index = match TarIndex::load(&self.sidecar_path()) {
            Some(index) => index,
            None => {
                debug!("index sidecar missing or unreadable; rebuilding");
                self.rebuild_sidecar(&tar_path)?
            }
        };
        index.read_entry(&tar_path, entry)
    }

    /// Best-effort sweep of leftover staging files from an interrupted operation.
    pub(crate) fn clean_staging(&self) {
        if let Ok(entries) = fs::read_dir(self.staging_dir()) {
            for entry in entries.flatten() {
                let _ = fs::remove_file(entry.path());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Cache, CachedFile};

    #[test]
    fn commit_replaces_atomically_and_clear_keeps_root() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path()).unwrap();

        cache.commit_bytes(b"root", CachedFile::Root).unwrap();
        cache.commit_bytes(b"ts-1", CachedFile::Timestamp).unwrap();
        cache.commit_bytes(b"ts-2", CachedFile::Timestamp).unwrap();
        assert_eq!(
            cache.read(CachedFile::Timestamp).unwrap().unwrap(),
            b"ts-2"
        );

        cache.clear().unwrap();
        assert!(cache.get(CachedFile::Timestamp).is_none());
        assert!(cache.root().is_ok());
    }

    #[test]
    fn missing_root_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path()).unwrap();
        assert!(matches!(
            cache.root(),
            Err(crate::Error::RootNotFound { .. })
        ));
    }

    #[test]
    fn index_entry_lookup_without_index() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path()).unwrap();
        assert!(cache.read_index_entry("a/1.0/a.cabal").unwrap().is_none());
    }
}
