//! The client driver: orchestrates update checks and package downloads over a [`Repository`],
//! feeding everything through the verification pipeline before it can reach the trusted cache.

use crate::cache::CachedFile;
use crate::encode_filename;
use crate::error::{self, Result};
use crate::index::PackageId;
use crate::io::{DigestAdapter, MaxSizeAdapter};
use crate::repository::{Format, RemoteFile, Repository};
use crate::schema::{FileInfo, Mirrors, Root, Snapshot, Targets, Timestamp};
use crate::verify::{self, RootUpdate, Trusted, TrustState};
use crate::{ExpirationEnforcement, Limits};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use log::{debug, info, warn};
use snafu::{ensure, OptionExt, ResultExt};
use std::fs::{self, File};
use std::path::{Path, PathBuf};

/// What a completed check cycle found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The repository had nothing newer; only the timestamp was refreshed.
    UpToDate,
    /// New repository state was verified and cached.
    Updated,
}

/// A secure package-index client.
///
/// The client owns the trust state and drives the repository: `check_for_updates` walks the
/// timestamp → snapshot → root/mirrors/index chain, and `download_package` resolves a package
/// through the targets tree and fetches its content-addressed archive.
///
/// `now` is supplied by the caller, once per operation.
#[derive(Debug)]
pub struct Client<R: Repository> {
    repository: R,
    state: TrustState,
    limits: Limits,
}

impl<R: Repository> Client<R> {
    /// First-run bootstrap: establishes trust from a root document supplied out-of-band and
    /// seeds the cache with it.
    pub fn bootstrap(
        repository: R,
        trusted_root: &Path,
        expiration: ExpirationEnforcement,
        limits: Limits,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let bytes = fs::read(trusted_root).context(error::FileReadSnafu {
            path: trusted_root,
        })?;
        let state = TrustState::from_trusted_root(&bytes, expiration, now)?;
        repository.cache_bytes(&bytes, CachedFile::Root)?;
        info!(
            "bootstrapped trust from '{}' (root version {})",
            trusted_root.display(),
            state.root().get().version
        );
        Ok(Self {
            repository,
            state,
            limits,
        })
    }

    /// Loads a client from previously cached state. The cached root must exist; cached
    /// timestamp, snapshot, and mirror documents are re-verified and quietly dropped if they no
    /// longer pass (an update cycle will replace them).
    pub fn load(
        repository: R,
        expiration: ExpirationEnforcement,
        limits: Limits,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let root_path = repository.get_cached_root()?;
        let bytes = fs::read(&root_path).context(error::FileReadSnafu { path: &root_path })?;
        let mut state = TrustState::from_trusted_root(&bytes, expiration, now)?;

        let timestamp = read_cached::<Timestamp, _>(&repository, CachedFile::Timestamp)?
            .and_then(|doc| match state.update_timestamp(doc, now) {
                Ok(info) => Some(info),
                Err(e) => {
                    warn!("dropping cached timestamp: {}", e);
                    None
                }
            });

        if let Some(snapshot_info) = timestamp {
            let snapshot_ok = repository
                .get_cached(CachedFile::Snapshot)
                .map_or(Ok(false), |path| verify::file_matches(&path, &snapshot_info))?;
            if snapshot_ok {
                if let Some(doc) = read_cached::<Snapshot, _>(&repository, CachedFile::Snapshot)? {
                    if let Err(e) = state.update_snapshot(doc, now) {
                        warn!("dropping cached snapshot: {}", e);
                    }
                }
            } else if repository.get_cached(CachedFile::Snapshot).is_some() {
                warn!("cached snapshot does not match the cached timestamp; dropping it");
            }
        }

        if let Some(doc) = read_cached::<Mirrors, _>(&repository, CachedFile::Mirrors)? {
            match state.update_mirrors(doc, now) {
                Ok(()) => {
                    if let Some(mirrors) = state.mirrors() {
                        repository.note_mirrors(mirrors)?;
                    }
                }
                Err(e) => warn!("dropping cached mirror list: {}", e),
            }
        }

        Ok(Self {
            repository,
            state,
            limits,
        })
    }

    /// The repository this client drives.
    pub fn repository(&self) -> &R {
        &self.repository
    }

    /// The current trust state.
    pub fn trust(&self) -> &TrustState {
        &self.state
    }

    /// Asks the repository whether anything changed, verifying and atomically caching whatever
    /// did. Verification failures leave both the cache and the previous trust state's files
    /// untouched.
    pub fn check_for_updates(&mut self, now: DateTime<Utc>) -> Result<UpdateOutcome> {
        self.state.ensure_root_fresh(now)?;
        let repository = &self.repository;
        let state = &mut self.state;
        let limits = &self.limits;
        let mut outcome = UpdateOutcome::UpToDate;
        repository.with_mirror(&mut || {
            outcome = run_update_cycle(repository, state, limits, now)?;
            Ok(())
        })?;
        Ok(outcome)
    }

    /// Downloads a package's release archive to `dest`, verifying its bytes against the
    /// targets tree before anything is written there.
    pub fn download_package(&self, id: &PackageId, dest: &Path, now: DateTime<Utc>) -> Result<()> {
        self.state.ensure_root_fresh(now)?;
        let target_path = format!("package/{}", id.archive_file_name());
        let info = self.target_info(&target_path, now)?;

        let repository = &self.repository;
        let file = RemoteFile::Package {
            id: id.clone(),
            info: info.clone(),
        };
        repository.with_mirror(&mut || {
            repository.with_remote(&file, &mut |_, staged| {
                write_verified(staged, dest, &info, &target_path)
            })
        })?;
        info!("downloaded {} to '{}'", id, dest.display());
        Ok(())
    }

    /// Reads one of a package's files out of the cached index, e.g. its description or the
    /// package's preferred-versions declaration.
    pub fn read_index_file(&self, id: &PackageId, file_name: &str) -> Result<Option<Vec<u8>>> {
        self.repository.get_from_index(id, file_name)
    }

    /// Resolves a target path to its declared `FileInfo` through the targets tree: the
    /// top-level document first, then delegations in declared order, first match wins.
    pub fn target_info(&self, target_path: &str, now: DateTime<Utc>) -> Result<FileInfo> {
        let bytes = self
            .repository
            .get_index_file("targets.json")?
            .context(error::MetaMissingSnafu {
                file: "targets.json",
                role: "index",
            })?;
        let envelope = verify::parse_signed::<Targets>(&bytes, "targets.json")?;
        let targets = self.state.verify_targets(envelope, now)?;
        self.resolve_target(&targets, target_path, 0, now)
    }

    fn resolve_target(
        &self,
        targets: &Trusted<Targets>,
        target_path: &str,
        depth: u32,
        now: DateTime<Utc>,
    ) -> Result<FileInfo> {
        let doc = targets.get();
        if let Some(info) = doc.target(target_path) {
            return Ok(info.clone());
        }
        let Some(delegations) = &doc.delegations else {
            return error::TargetNotFoundSnafu { path: target_path }.fail();
        };

        for role in &delegations.roles {
            if !role.matches(target_path) {
                continue;
            }
            ensure!(
                depth < self.limits.max_delegation_depth,
                error::DelegationDepthExceededSnafu {
                    limit: self.limits.max_delegation_depth,
                }
            );

            let entry = format!("{}.json", encode_filename(&role.name));
            let Some(bytes) = self.repository.get_index_file(&entry)? else {
                if role.terminating {
                    return error::DelegationUnresolvedSnafu { path: target_path }.fail();
                }
                debug!("delegated role '{}' has no document in the index", role.name);
                continue;
            };
            let envelope = verify::parse_signed::<Targets>(&bytes, &entry)?;
            let delegated =
                self.state
                    .verify_delegated_targets(role, &delegations.keys, envelope, now)?;
            match self.resolve_target(&delegated, target_path, depth + 1, now) {
                Ok(info) => return Ok(info),
                Err(
                    error::Error::TargetNotFound { .. } | error::Error::DelegationUnresolved { .. },
                ) if !role.terminating => continue,
                Err(error::Error::TargetNotFound { .. }) => {
                    return error::DelegationUnresolvedSnafu { path: target_path }.fail()
                }
                Err(e) => return Err(e),
            }
        }
        error::TargetNotFoundSnafu { path: target_path }.fail()
    }
}

/// One pass of the update algorithm, under a selected mirror. Verified files are staged as they
/// are accepted and committed together at the end, so a failure anywhere leaves the cache
/// byte-identical.
fn run_update_cycle<R: Repository>(
    repository: &R,
    state: &mut TrustState,
    limits: &Limits,
    now: DateTime<Utc>,
) -> Result<UpdateOutcome> {
    let mut staged: Vec<(CachedFile, PathBuf)> = Vec::new();
    let result = update_cycle_inner(repository, state, limits, now, &mut staged);
    match result {
        Ok(outcome) => {
            // Commit order is chosen so that a crash between renames never leaves the
            // timestamp pointing at state that is not there yet: mirrors and index first,
            // snapshot, then the timestamp that vouches for it all.
            staged.sort_by_key(|(file, _)| commit_rank(*file));
            for (file, path) in staged {
                repository.cache_remote(&path, file)?;
            }
            Ok(outcome)
        }
        Err(e) => {
            discard_staged(&mut staged);
            Err(e)
        }
    }
}

fn commit_rank(file: CachedFile) -> u8 {
    match file {
        CachedFile::Root => 0,
        CachedFile::Mirrors => 1,
        CachedFile::Index => 2,
        CachedFile::Snapshot => 3,
        CachedFile::Timestamp => 4,
    }
}

fn discard_staged(staged: &mut Vec<(CachedFile, PathBuf)>) {
    for (_, path) in staged.drain(..) {
        let _ = fs::remove_file(path);
    }
}

fn update_cycle_inner<R: Repository>(
    repository: &R,
    state: &mut TrustState,
    limits: &Limits,
    now: DateTime<Utc>,
    staged: &mut Vec<(CachedFile, PathBuf)>,
) -> Result<UpdateOutcome> {
    for _ in 0..limits.max_root_updates {
        discard_staged(staged);

        // --- timestamp -----------------------------------------------------------------
        let mut snapshot_info = None;
        let fetched = repository.with_remote(&RemoteFile::Timestamp, &mut |_, path| {
            let bytes = fs::read(path).context(error::FileReadSnafu { path })?;
            let envelope = verify::parse_signed::<Timestamp>(&bytes, "timestamp.json")?;
            snapshot_info = Some(state.update_timestamp(envelope, now)?);
            staged.push((
                CachedFile::Timestamp,
                repository.stage(path, CachedFile::Timestamp)?,
            ));
            Ok(())
        });
        if retry_after_root_refresh(repository, state, &fetched, now)? {
            continue;
        }
        fetched?;
        let snapshot_info = snapshot_info.take().context(error::MetaMissingSnafu {
            file: "snapshot.json",
            role: "timestamp",
        })?;

        // --- snapshot ------------------------------------------------------------------
        let snapshot_current = repository
            .get_cached(CachedFile::Snapshot)
            .map_or(Ok(false), |path| verify::file_matches(&path, &snapshot_info))?;
        if snapshot_current {
            debug!("snapshot unchanged; repository is current");
            return Ok(UpdateOutcome::UpToDate);
        }

        let mut snapshot_files = None;
        let fetched = repository.with_remote(
            &RemoteFile::Snapshot {
                info: snapshot_info.clone(),
            },
            &mut |_, path| {
                // byte-level check against the timestamp's record before parsing
                verify::verify_file_info(path, &snapshot_info, "snapshot.json")?;
                let bytes = fs::read(path).context(error::FileReadSnafu { path })?;
                let envelope = verify::parse_signed::<Snapshot>(&bytes, "snapshot.json")?;
                snapshot_files = Some(state.update_snapshot(envelope, now)?);
                staged.push((
                    CachedFile::Snapshot,
                    repository.stage(path, CachedFile::Snapshot)?,
                ));
                Ok(())
            },
        );
        if retry_after_root_refresh(repository, state, &fetched, now)? {
            continue;
        }
        fetched?;
        let files = snapshot_files.take().context(error::MetaMissingSnafu {
            file: "snapshot.json",
            role: "snapshot",
        })?;

        // --- root, if the snapshot pins a different one ----------------------------------
        let root_path = repository.get_cached_root()?;
        if !verify::file_matches(&root_path, &files.root)? {
            let mut update = RootUpdate::Unchanged;
            repository.with_remote(
                &RemoteFile::Root {
                    info: Some(files.root.clone()),
                },
                &mut |_, path| {
                    verify::verify_file_info(path, &files.root, "root.json")?;
                    let bytes = fs::read(path).context(error::FileReadSnafu { path })?;
                    let envelope = verify::parse_signed::<Root>(&bytes, "root.json")?;
                    update = state.update_root(envelope, now)?;
                    // The new root is trusted on its own chain; it commits immediately, not
                    // with the cycle.
                    repository.cache_remote(path, CachedFile::Root)?;
                    Ok(())
                },
            )?;
            if let RootUpdate::Accepted { keys_rotated } = update {
                if keys_rotated {
                    info!("role keys rotated; invalidating cached timestamp and snapshot");
                    repository.clear_cache()?;
                }
                debug!("root changed; restarting the update cycle");
                continue;
            }
        }

        // --- mirrors ---------------------------------------------------------------------
        if let Some(mirrors_info) = &files.mirrors {
            let mirrors_current = repository
                .get_cached(CachedFile::Mirrors)
                .map_or(Ok(false), |path| verify::file_matches(&path, mirrors_info))?;
            if !mirrors_current {
                repository.with_remote(
                    &RemoteFile::Mirrors {
                        info: mirrors_info.clone(),
                    },
                    &mut |_, path| {
                        verify::verify_file_info(path, mirrors_info, "mirrors.json")?;
                        let bytes = fs::read(path).context(error::FileReadSnafu { path })?;
                        let envelope = verify::parse_signed::<Mirrors>(&bytes, "mirrors.json")?;
                        state.update_mirrors(envelope, now)?;
                        staged.push((
                            CachedFile::Mirrors,
                            repository.stage(path, CachedFile::Mirrors)?,
                        ));
                        Ok(())
                    },
                )?;
                if let Some(mirrors) = state.mirrors() {
                    repository.note_mirrors(mirrors)?;
                }
            }
        } else {
            debug!("snapshot lists no mirrors.json; using out-of-band mirrors only");
        }

        // --- index -----------------------------------------------------------------------
        let index_current = match files.index.tar() {
            Some(tar_info) => repository
                .get_cached(CachedFile::Index)
                .map_or(Ok(false), |path| verify::file_matches(&path, tar_info))?,
            // compressed-only repositories give us nothing to compare the cached tar to
            None => false,
        };
        if !index_current {
            let downloads = files.index.clone();
            repository.with_remote(&RemoteFile::Index { downloads: downloads.clone() }, &mut |format, path| {
                match format {
                    Format::Uncompressed => {
                        let tar_info = downloads.tar().context(error::MetaMissingSnafu {
                            file: "00-index.tar",
                            role: "snapshot",
                        })?;
                        verify::verify_file_info(path, tar_info, "00-index.tar")?;
                        staged.push((CachedFile::Index, repository.stage(path, CachedFile::Index)?));
                    }
                    Format::Gzip => {
                        let tar_gz_info = downloads.tar_gz().context(error::MetaMissingSnafu {
                            file: "00-index.tar.gz",
                            role: "snapshot",
                        })?;
                        verify::verify_file_info(path, tar_gz_info, "00-index.tar.gz")?;
                        let unpacked = decompress_index(
                            path,
                            downloads.tar(),
                            limits.max_index_size,
                        )?;
                        staged.push((
                            CachedFile::Index,
                            repository.stage(&unpacked, CachedFile::Index)?,
                        ));
                    }
                }
                Ok(())
            })?;
        }

        return Ok(UpdateOutcome::Updated);
    }

    error::RootUpdatesExceededSnafu {
        max: limits.max_root_updates,
    }
    .fail()
}

/// A signature-verification failure on the timestamp or snapshot can mean the role's keys were
/// rotated out from under us: the rotation is only discoverable through the new root. When
/// `fetched` failed that way, refetch the root (its size is no longer pinned by anything we can
/// verify, so the configured bound applies) and report whether trust actually changed, in
/// which case the cycle restarts instead of surfacing the stale failure.
fn retry_after_root_refresh<R: Repository>(
    repository: &R,
    state: &mut TrustState,
    fetched: &Result<()>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let stale = matches!(
        fetched,
        Err(error::Error::SignatureThresholdNotMet { .. }
            | error::Error::UnknownKey { .. }
            | error::Error::InvalidSignature { .. })
    );
    if !stale {
        return Ok(false);
    }

    let mut update = RootUpdate::Unchanged;
    let refresh = repository.with_remote(&RemoteFile::Root { info: None }, &mut |_, path| {
        let bytes = fs::read(path).context(error::FileReadSnafu { path })?;
        let envelope = verify::parse_signed::<Root>(&bytes, "root.json")?;
        update = state.update_root(envelope, now)?;
        if update != RootUpdate::Unchanged {
            repository.cache_remote(path, CachedFile::Root)?;
        }
        Ok(())
    });
    match refresh {
        Ok(()) => match update {
            RootUpdate::Accepted { keys_rotated } => {
                if keys_rotated {
                    info!("role keys rotated; invalidating cached timestamp and snapshot");
                    repository.clear_cache()?;
                }
                debug!("root changed; restarting the update cycle");
                Ok(true)
            }
            RootUpdate::Unchanged => Ok(false),
        },
        Err(refresh_error) => {
            // The original verification failure is the interesting one.
            debug!("root refresh did not help: {}", refresh_error);
            Ok(false)
        }
    }
}

/// Decompresses a verified `00-index.tar.gz` next to itself, bounding the decoded stream and
/// checking it against the uncompressed declaration when the snapshot carries one.
fn decompress_index(
    gz_path: &Path,
    tar_info: Option<&FileInfo>,
    max_index_size: u64,
) -> Result<PathBuf> {
    let staging = gz_path
        .parent()
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    let mut tmp = tempfile::NamedTempFile::new_in(&staging)
        .context(error::TempFileCreateSnafu { path: &staging })?;

    let gz = File::open(gz_path).context(error::FileOpenSnafu { path: gz_path })?;
    let bound = tar_info.map_or(max_index_size, |info| info.length);
    let mut decoder = MaxSizeAdapter::new(GzDecoder::new(gz), "the package index", bound);
    std::io::copy(&mut decoder, tmp.as_file_mut())
        .map_err(|e| crate::io::recover_error(e, "the package index"))?;

    if let Some(tar_info) = tar_info {
        verify::verify_file_info(tmp.path(), tar_info, "00-index.tar")?;
    }
    // keep the file; the caller stages it away by rename
    let (_, path) = tmp.keep().map_err(|e| {
        error::Error::FileWrite {
            path: staging,
            source: e.error,
        }
    })?;
    Ok(path)
}

/// Copies a verified download to its destination, re-checking length and digest in the same
/// pass that writes the bytes.
fn write_verified(staged: &Path, dest: &Path, info: &FileInfo, name: &str) -> Result<()> {
    verify::verify_file_info(staged, info, name)?;
    let source = File::open(staged).context(error::FileOpenSnafu { path: staged })?;
    let sha256 = info
        .sha256()
        .map(|digest| digest.bytes().to_vec())
        .unwrap_or_default();
    let mut reader: Box<dyn std::io::Read> = if sha256.is_empty() {
        Box::new(MaxSizeAdapter::new(source, "a package archive", info.length))
    } else {
        Box::new(DigestAdapter::sha256(
            MaxSizeAdapter::new(source, "a package archive", info.length),
            &sha256,
            name.to_owned(),
        ))
    };
    let mut out = File::create(dest).context(error::FileCreateSnafu { path: dest })?;
    std::io::copy(&mut reader, &mut out).map_err(|e| crate::io::recover_error(e, name))?;
    out.sync_all().context(error::FileWriteSnafu { path: dest })?;
    Ok(())
}

fn read_cached<T, R>(repository: &R, file: CachedFile) -> Result<Option<crate::schema::Signed<T>>>
where
    T: crate::schema::Role + serde::de::DeserializeOwned,
    R: Repository,
{
    let Some(path) = repository.get_cached(file) else {
        return Ok(None);
    };
    let bytes = fs::read(&path).context(error::FileReadSnafu { path })?;
    match verify::parse_signed::<T>(&bytes, file.file_name()) {
        Ok(envelope) => Ok(Some(envelope)),
        Err(e) => {
            warn!("cached {} is unreadable: {}", file.file_name(), e);
            Ok(None)
        }
    }
}
