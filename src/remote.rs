//! A repository backed by untrusted mirrors reached through a [`Transport`].
//!
//! This adapter owns the three behaviors the trust engine should not have to think about:
//! mirror selection with failover, the download budget, and the incremental index update with
//! its full-download fallback. Verification stays with the caller.

use crate::cache::{Cache, CachedFile, INDEX_TAR};
use crate::error::{self, Error, Result, UpdateImpossibleReason};
use crate::index::PackageId;
use crate::io::{self, MaxSizeAdapter};
use crate::repository::{FetchHandler, Format, IndexDownloads, RemoteFile, Repository};
use crate::schema::{FileInfo, Mirrors};
use crate::transport::Transport;
use crate::verify::{self, Trusted};
use crate::Limits;
use log::{debug, warn};
use snafu::ResultExt;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tempfile::NamedTempFile;
use url::Url;

const BUNDLE_FILE: &str = "timestamp-snapshot.json";
const STAGED_TIMESTAMP: &str = "timestamp.json";
const STAGED_SNAPSHOT: &str = "snapshot.json";

/// How far back from the end of the cached archive an incremental fetch starts: a tar stream
/// ends in two zero blocks that the updated archive overwrites rather than preserves.
const TAR_TRAILER_BACKSTEP: u64 = 1024;

/// A [`Repository`] served by one or more remote mirrors.
#[derive(Debug)]
pub struct RemoteRepository {
    transport: Box<dyn Transport>,
    cache: Cache,
    limits: Limits,
    /// Out-of-band mirrors, in priority order.
    mirrors: Vec<Url>,
    /// Mirrors learned from a verified mirror list, appended after the out-of-band set.
    learned: Mutex<Vec<Url>>,
    /// The one-slot selected-mirror cell. Written only under `with_mirror` scoping.
    selected: Mutex<Option<Url>>,
    /// Whether the timestamp+snapshot bundle has been tried under the current mirror.
    bundle: Mutex<BundleState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BundleState {
    Untried,
    Unavailable,
    Staged,
}

impl RemoteRepository {
    /// Creates a repository over `transport`, anchored at the out-of-band `mirrors` and storing
    /// verified state in `cache`.
    pub fn new(
        transport: Box<dyn Transport>,
        mirrors: Vec<Url>,
        cache: Cache,
        limits: Limits,
    ) -> Self {
        Self {
            transport,
            cache,
            limits,
            mirrors,
            learned: Mutex::new(Vec::new()),
            selected: Mutex::new(None),
            bundle: Mutex::new(BundleState::Untried),
        }
    }

    fn lock<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
        mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn selected_mirror(&self) -> Result<Url> {
        Self::lock(&self.selected)
            .clone()
            .ok_or_else(|| error::NoMirrorSelectedSnafu.build())
    }

    fn mirror_list(&self) -> Vec<Url> {
        let mut list = self.mirrors.clone();
        for learned in Self::lock(&self.learned).iter() {
            if !list.contains(learned) {
                list.push(learned.clone());
            }
        }
        list
    }

    fn url_for(&self, mirror: &Url, path: &str) -> Result<Url> {
        mirror.join(path).context(error::UrlJoinSnafu {
            path,
            url: mirror.clone(),
        })
    }

    /// Streams a fetched body into a staging temp file, enforcing `max_size`.
    fn copy_bounded(
        &self,
        body: Box<dyn Read + Send>,
        url: &Url,
        max_size: u64,
        specifier: &'static str,
    ) -> Result<NamedTempFile> {
        let mut tmp = self.cache.temp_file()?;
        let mut reader = MaxSizeAdapter::new(body, specifier, max_size);
        std::io::copy(&mut reader, tmp.as_file_mut())
            .map_err(|e| io::recover_error(e, url.as_str()))?;
        Ok(tmp)
    }

    fn fetch_to_temp(
        &self,
        path: &str,
        max_size: u64,
        specifier: &'static str,
    ) -> Result<NamedTempFile> {
        let mirror = self.selected_mirror()?;
        let url = self.url_for(&mirror, path)?;
        let body = self
            .transport
            .fetch(url.clone())
            .context(error::TransportSnafu)?;
        self.copy_bounded(body, &url, max_size, specifier)
    }

    fn staged_path(&self, name: &str) -> PathBuf {
        self.cache.staging_dir().join(name)
    }

    /// Picks up a document previously extracted from the bundle, handing it to the handler and
    /// consuming it either way.
    fn bundle_pickup(&self, name: &str, handler: FetchHandler<'_>) -> Result<()> {
        let staged = self.staged_path(name);
        let result = handler(Format::Uncompressed, &staged);
        let _ = fs::remove_file(&staged);
        result
    }

    /// Opportunistically fetches the `timestamp-snapshot.json` bundle, a ustar archive packing
    /// both documents byte-exactly, and extracts them into staging. Entirely best-effort: any
    /// failure downgrades to direct fetches.
    fn try_stage_bundle(&self) {
        {
            let mut bundle = Self::lock(&self.bundle);
            if *bundle != BundleState::Untried {
                return;
            }
            // One attempt per mirror scope, however it goes.
            *bundle = BundleState::Unavailable;
        }

        let budget = self
            .limits
            .max_timestamp_size
            .saturating_add(self.limits.max_snapshot_size);
        let tmp = match self.fetch_to_temp(BUNDLE_FILE, budget, "timestamp-snapshot.json") {
            Ok(tmp) => tmp,
            Err(e) => {
                debug!("timestamp+snapshot bundle not used: {}", e);
                return;
            }
        };
        match self.extract_bundle(tmp.path()) {
            Ok(()) => {
                debug!("timestamp+snapshot bundle staged");
                *Self::lock(&self.bundle) = BundleState::Staged;
            }
            Err(e) => {
                debug!("timestamp+snapshot bundle unusable: {}", e);
                self.discard_bundle();
            }
        }
    }

    fn extract_bundle(&self, bundle: &Path) -> Result<()> {
        let file = File::open(bundle).context(error::FileOpenSnafu { path: bundle })?;
        let mut archive = tar::Archive::new(file);
        let mut found = 0;
        for entry in archive
            .entries()
            .context(error::FileReadSnafu { path: bundle })?
        {
            let mut entry = entry.context(error::FileReadSnafu { path: bundle })?;
            let Ok(path) = entry.path() else { continue };
            let name = match path.to_str() {
                Some(STAGED_TIMESTAMP) => STAGED_TIMESTAMP,
                Some(STAGED_SNAPSHOT) => STAGED_SNAPSHOT,
                _ => continue,
            };
            let dest = self.staged_path(name);
            let mut out = File::create(&dest).context(error::FileCreateSnafu { path: &dest })?;
            std::io::copy(&mut entry, &mut out)
                .context(error::FileWriteSnafu { path: &dest })?;
            found += 1;
        }
        if found == 2 {
            Ok(())
        } else {
            error::UpdateFailedSnafu {
                detail: "bundle did not contain both documents",
            }
            .fail()
        }
    }

    fn discard_bundle(&self) {
        let _ = fs::remove_file(self.staged_path(STAGED_TIMESTAMP));
        let _ = fs::remove_file(self.staged_path(STAGED_SNAPSHOT));
        let mut bundle = Self::lock(&self.bundle);
        if *bundle == BundleState::Staged {
            *bundle = BundleState::Unavailable;
        }
    }

    /// Fetches the index, preferring an incremental extension of the cached archive, then the
    /// smaller compressed download, then the plain one.
    fn fetch_index(&self, downloads: &IndexDownloads, handler: FetchHandler<'_>) -> Result<()> {
        if let Some(tar_info) = downloads.tar() {
            match self.try_incremental(tar_info) {
                Ok(Some(tmp)) => return handler(Format::Uncompressed, tmp.path()),
                Ok(None) => {}
                Err(e) => {
                    warn!("{}; falling back to a full download", Error::UpdateFailed {
                        detail: e.to_string()
                    });
                }
            }
        } else {
            debug!(
                "{}",
                Error::UpdateImpossible {
                    reason: UpdateImpossibleReason::OnlyCompressed
                }
            );
        }

        // Full download. Prefer the compressed form when the server offers both.
        let (format, info) = match downloads {
            IndexDownloads::Tar { tar } => (Format::Uncompressed, tar),
            IndexDownloads::TarGz { tar_gz } | IndexDownloads::Both { tar_gz, .. } => {
                (Format::Gzip, tar_gz)
            }
        };
        let path = match format {
            Format::Uncompressed => INDEX_TAR,
            Format::Gzip => crate::cache::INDEX_TAR_GZ,
        };
        let tmp = self.fetch_to_temp(path, info.length, "the package index")?;
        handler(format, tmp.path())
    }

    /// Attempts the ranged extension of the cached archive. `Ok(None)` means the attempt was
    /// impossible and was skipped; `Err` means it was tried and failed. Both downgrade to a
    /// full download.
    fn try_incremental(&self, tar_info: &FileInfo) -> Result<Option<NamedTempFile>> {
        let Some(cached) = self.cache.get(CachedFile::Index) else {
            debug!(
                "{}",
                Error::UpdateImpossible {
                    reason: UpdateImpossibleReason::NoLocalCopy
                }
            );
            return Ok(None);
        };
        if !self.transport.capabilities().supports_byte_ranges() {
            debug!(
                "{}",
                Error::UpdateImpossible {
                    reason: UpdateImpossibleReason::Unsupported
                }
            );
            return Ok(None);
        }

        let current = fs::metadata(&cached)
            .context(error::FileReadSnafu { path: &cached })?
            .len();
        if current < TAR_TRAILER_BACKSTEP || tar_info.length <= current - TAR_TRAILER_BACKSTEP {
            // Nothing sensible to extend; a shrunken remote index means a full refetch anyway.
            return Ok(None);
        }
        let start = current - TAR_TRAILER_BACKSTEP;

        let mirror = self.selected_mirror()?;
        let url = self.url_for(&mirror, INDEX_TAR)?;
        debug!(
            "incremental index update: range {}-{} of {}",
            start,
            tar_info.length - 1,
            url
        );
        let response = self
            .transport
            .fetch_range(url.clone(), start, tar_info.length)
            .context(error::TransportSnafu)?;

        if !response.satisfied {
            // The server ignored the range and sent the whole file; consume it as a full
            // download rather than wasting the bytes.
            debug!("range request answered with the full index");
            let tmp = self.copy_bounded(response.body, &url, tar_info.length, "the package index")?;
            verify::verify_file_info(tmp.path(), tar_info, INDEX_TAR)?;
            return Ok(Some(tmp));
        }

        let mut tmp = self.cache.temp_file()?;
        let mut prefix = File::open(&cached)
            .context(error::FileOpenSnafu { path: &cached })?
            .take(start);
        std::io::copy(&mut prefix, tmp.as_file_mut())
            .context(error::FileWriteSnafu {
                path: tmp.path().to_owned(),
            })?;
        let mut suffix = MaxSizeAdapter::new(
            response.body,
            "the package index",
            tar_info.length - start,
        );
        std::io::copy(&mut suffix, tmp.as_file_mut())
            .map_err(|e| io::recover_error(e, url.as_str()))?;

        // The spliced archive must match the snapshot's declaration exactly, or we throw it
        // away and download whole.
        verify::verify_file_info(tmp.path(), tar_info, INDEX_TAR)?;
        Ok(Some(tmp))
    }
}

/// Clears the selected-mirror slot on scope exit, success or panic.
struct MirrorGuard<'a> {
    slot: &'a Mutex<Option<Url>>,
}

impl Drop for MirrorGuard<'_> {
    fn drop(&mut self) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl Repository for RemoteRepository {
    fn with_mirror(&self, scope: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        let mirrors = self.mirror_list();
        if mirrors.is_empty() {
            return error::NoMirrorsConfiguredSnafu.fail();
        }

        // Leftover staging files from an interrupted run are untrusted garbage.
        self.cache.clean_staging();

        let mut last_error = None;
        for mirror in mirrors {
            // Fresh bundle state per mirror; leftovers from the previous mirror are untrusted
            // bytes of unknown vintage.
            self.discard_bundle();
            *Self::lock(&self.bundle) = BundleState::Untried;

            debug!("selected mirror {}", mirror);
            *Self::lock(&self.selected) = Some(mirror.clone());
            let guard = MirrorGuard {
                slot: &self.selected,
            };
            let result = scope();
            drop(guard);

            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_recoverable() => {
                    warn!("mirror {} failed: {}", mirror, e);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| error::NoMirrorsConfiguredSnafu.build()))
    }

    fn with_remote(&self, file: &RemoteFile, handler: FetchHandler<'_>) -> Result<()> {
        // Even filesystem pickups are part of a mirror-scoped operation.
        let _ = self.selected_mirror()?;

        match file {
            RemoteFile::Timestamp => {
                self.try_stage_bundle();
                if *Self::lock(&self.bundle) == BundleState::Staged {
                    return self.bundle_pickup(STAGED_TIMESTAMP, handler);
                }
                let tmp = self.fetch_to_temp(
                    &file.remote_path(Format::Uncompressed),
                    self.limits.max_timestamp_size,
                    file.specifier(),
                )?;
                handler(Format::Uncompressed, tmp.path())
            }
            RemoteFile::Snapshot { info } => {
                let staged = self.staged_path(STAGED_SNAPSHOT);
                if staged.is_file() {
                    // A stale bundle must not shadow the snapshot the new timestamp points
                    // at; pre-check the staged bytes and fall through on mismatch.
                    if verify::file_matches(&staged, info)? {
                        return self.bundle_pickup(STAGED_SNAPSHOT, handler);
                    }
                    debug!("staged snapshot does not match the verified timestamp; refetching");
                    let _ = fs::remove_file(&staged);
                }
                let tmp = self.fetch_to_temp(
                    &file.remote_path(Format::Uncompressed),
                    info.length,
                    file.specifier(),
                )?;
                handler(Format::Uncompressed, tmp.path())
            }
            RemoteFile::Root { info } => {
                let max_size = info
                    .as_ref()
                    .map_or(self.limits.max_root_size, |info| info.length);
                let tmp = self.fetch_to_temp(
                    &file.remote_path(Format::Uncompressed),
                    max_size,
                    file.specifier(),
                )?;
                handler(Format::Uncompressed, tmp.path())
            }
            RemoteFile::Mirrors { info } | RemoteFile::Package { info, .. } => {
                let tmp = self.fetch_to_temp(
                    &file.remote_path(Format::Uncompressed),
                    info.length,
                    file.specifier(),
                )?;
                handler(Format::Uncompressed, tmp.path())
            }
            RemoteFile::Index { downloads } => self.fetch_index(downloads, handler),
        }
    }

    fn get_cached(&self, file: CachedFile) -> Option<PathBuf> {
        self.cache.get(file)
    }

    fn get_cached_root(&self) -> Result<PathBuf> {
        self.cache.root()
    }

    fn stage(&self, verified: &Path, file: CachedFile) -> Result<PathBuf> {
        self.cache.stage(verified, file)
    }

    fn cache_remote(&self, staged: &Path, file: CachedFile) -> Result<()> {
        self.cache.commit(staged, file)
    }

    fn cache_bytes(&self, bytes: &[u8], file: CachedFile) -> Result<()> {
        self.cache.commit_bytes(bytes, file)
    }

    fn clear_cache(&self) -> Result<()> {
        self.cache.clear()
    }

    fn get_from_index(&self, id: &PackageId, file_name: &str) -> Result<Option<Vec<u8>>> {
        self.cache.read_index_entry(&id.index_entry(file_name))
    }

    fn get_index_file(&self, entry: &str) -> Result<Option<Vec<u8>>> {
        self.cache.read_index_entry(entry)
    }

    fn note_mirrors(&self, mirrors: &Trusted<Mirrors>) -> Result<()> {
        let mut learned = Self::lock(&self.learned);
        learned.clear();
        for mirror in &mirrors.get().mirrors {
            learned.push(mirror.url_base.clone());
        }
        Ok(())
    }
}
