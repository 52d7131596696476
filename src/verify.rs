//! The verification pipeline.
//!
//! Every trust decision the client makes happens in this module: signature thresholds, version
//! monotonicity, expiry, chained root updates, and delegation. [`Trusted`] values cannot be
//! constructed anywhere else, so an API that takes `Trusted<T>` can rely on the pipeline having
//! run.

use crate::error::{self, Result};
use crate::repository::IndexDownloads;
use crate::schema::{
    DelegatedRole, FileInfo, KeyEnv, Mirrors, Role, RoleKeys, RoleType, Root, Signed, Snapshot,
    Targets, Timestamp,
};
use crate::ExpirationEnforcement;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use snafu::{ensure, OptionExt, ResultExt};
use std::collections::HashSet;
use std::path::Path;

/// A value that has passed verification.
///
/// The only constructor is private to this module; holding a `Trusted<T>` means the wrapped
/// document carried enough valid signatures from the right role, was unexpired, and did not
/// roll any version backwards at the time it was accepted. Projecting the inner value out is an
/// explicit, visible operation.
#[derive(Debug, Clone)]
pub struct Trusted<T> {
    inner: T,
}

impl<T> Trusted<T> {
    fn new(inner: T) -> Self {
        Self { inner }
    }

    /// Borrows the verified document.
    pub fn get(&self) -> &T {
        &self.inner
    }

    /// Unwraps the verified document, leaving the trust marker behind.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

/// The outcome of offering a candidate root to [`TrustState::update_root`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootUpdate {
    /// The candidate was the same version with identical canonical content; nothing changed.
    Unchanged,
    /// The candidate became the new trusted root.
    Accepted {
        /// Whether the timestamp or snapshot role's keys or threshold changed, which
        /// invalidates the cached timestamp and snapshot.
        keys_rotated: bool,
    },
}

/// What a verified snapshot declares about the rest of the repository.
#[derive(Debug, Clone)]
pub struct SnapshotFiles {
    /// Info pinning the next root to be trusted.
    pub root: FileInfo,
    /// Info pinning the mirror list, absent when the repository publishes none.
    pub mirrors: Option<FileInfo>,
    /// The advertised index formats and their infos.
    pub index: IndexDownloads,
}

/// The set of verified role documents the client is willing to act on.
///
/// A state holding only a root is the bootstrap state; the timestamp, snapshot, and mirror list
/// fill in as check cycles verify them, and a root rotation that changes their role keys drops
/// them back out.
#[derive(Debug)]
pub struct TrustState {
    root: Trusted<Root>,
    timestamp: Option<Trusted<Timestamp>>,
    snapshot: Option<Trusted<Snapshot>>,
    mirrors: Option<Trusted<Mirrors>>,
    expiration: ExpirationEnforcement,
}

impl TrustState {
    /// Establishes trust from a root document obtained out-of-band (or from the local cache).
    ///
    /// The document must verify under its own root role: a root that cannot vouch for itself
    /// cannot vouch for anything.
    pub fn from_trusted_root(
        bytes: &[u8],
        expiration: ExpirationEnforcement,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let envelope = parse_signed::<Root>(bytes, "root.json")?;
        verify_root_integrity(&envelope.signed)?;
        verify_signed(
            "root",
            &envelope.signed.keys,
            root_role(&envelope.signed)?,
            &envelope,
        )?;
        check_expiry(expiration, "root", &envelope.signed, now)?;
        Ok(Self {
            root: Trusted::new(envelope.signed),
            timestamp: None,
            snapshot: None,
            mirrors: None,
            expiration,
        })
    }

    /// The trusted root.
    pub fn root(&self) -> &Trusted<Root> {
        &self.root
    }

    /// The trusted timestamp, when one has been verified.
    pub fn timestamp(&self) -> Option<&Trusted<Timestamp>> {
        self.timestamp.as_ref()
    }

    /// The trusted snapshot, when one has been verified.
    pub fn snapshot(&self) -> Option<&Trusted<Snapshot>> {
        self.snapshot.as_ref()
    }

    /// The trusted mirror list, when one has been verified.
    pub fn mirrors(&self) -> Option<&Trusted<Mirrors>> {
        self.mirrors.as_ref()
    }

    /// Fails when the trusted root itself has expired. Called at the start of every client
    /// operation; a repository whose root lapses must be re-bootstrapped or rotated in time.
    pub fn ensure_root_fresh(&self, now: DateTime<Utc>) -> Result<()> {
        check_expiry(self.expiration, "root", self.root.get(), now)
    }

    /// Offers a candidate root. Acceptance requires the chained verification: the candidate
    /// must satisfy the trusted root's root role **and** its own.
    pub fn update_root(&mut self, candidate: Signed<Root>, now: DateTime<Utc>) -> Result<RootUpdate> {
        let old = self.root.get();

        verify_signed("root", &old.keys, root_role(old)?, &candidate)?;
        verify_root_integrity(&candidate.signed)?;
        verify_signed(
            "root",
            &candidate.signed.keys,
            root_role(&candidate.signed)?,
            &candidate,
        )?;

        let (have, got) = (old.version.get(), candidate.signed.version.get());
        ensure!(
            got >= have,
            error::VersionRollbackSnafu {
                role: "root",
                have,
                got,
            }
        );
        if got == have {
            let old_form = old.canonical_form().context(error::SchemaSnafu)?;
            let new_form = candidate
                .signed
                .canonical_form()
                .context(error::SchemaSnafu)?;
            ensure!(
                old_form == new_form,
                error::VersionContentMismatchSnafu {
                    role: "root",
                    version: got,
                }
            );
            return Ok(RootUpdate::Unchanged);
        }
        check_expiry(self.expiration, "root", &candidate.signed, now)?;

        // A change to any re-derived role's keys or threshold invalidates the cached
        // timestamp and snapshot; the next fetch is first-use.
        let keys_rotated = [
            RoleType::Timestamp,
            RoleType::Snapshot,
            RoleType::Mirrors,
            RoleType::Targets,
        ]
        .iter()
        .any(|role| role_keys_differ(old.role_keys(*role), candidate.signed.role_keys(*role)));

        debug!(
            "accepting root version {} (was {}); keys_rotated={}",
            got, have, keys_rotated
        );
        self.root = Trusted::new(candidate.signed);
        if keys_rotated {
            self.timestamp = None;
            self.snapshot = None;
        }
        Ok(RootUpdate::Accepted { keys_rotated })
    }

    /// Offers a candidate timestamp. On success the timestamp becomes trusted and the declared
    /// snapshot info is returned.
    pub fn update_timestamp(
        &mut self,
        candidate: Signed<Timestamp>,
        now: DateTime<Utc>,
    ) -> Result<FileInfo> {
        let root = self.root.get();
        verify_signed(
            "timestamp",
            &root.keys,
            role_keys(root, RoleType::Timestamp)?,
            &candidate,
        )?;
        check_expiry(self.expiration, "timestamp", &candidate.signed, now)?;
        if let Some(old) = &self.timestamp {
            check_version("timestamp", old.get().version(), &candidate.signed)?;
        }
        let snapshot_info = candidate
            .signed
            .snapshot_info()
            .context(error::MetaMissingSnafu {
                file: "snapshot.json",
                role: "timestamp",
            })?
            .clone();
        self.timestamp = Some(Trusted::new(candidate.signed));
        Ok(snapshot_info)
    }

    /// Offers a candidate snapshot whose bytes have already been checked against the trusted
    /// timestamp's declared info. On success the snapshot becomes trusted and its declarations
    /// about the rest of the repository are returned.
    pub fn update_snapshot(
        &mut self,
        candidate: Signed<Snapshot>,
        now: DateTime<Utc>,
    ) -> Result<SnapshotFiles> {
        let root = self.root.get();
        verify_signed(
            "snapshot",
            &root.keys,
            role_keys(root, RoleType::Snapshot)?,
            &candidate,
        )?;
        check_expiry(self.expiration, "snapshot", &candidate.signed, now)?;
        if let Some(old) = &self.snapshot {
            check_version("snapshot", old.get().version(), &candidate.signed)?;
        }

        let doc = &candidate.signed;
        let root_info = doc.root_info().context(error::MetaMissingSnafu {
            file: "root.json",
            role: "snapshot",
        })?;
        let index = match (doc.index_tar_info(), doc.index_tar_gz_info()) {
            (Some(tar), Some(tar_gz)) => IndexDownloads::Both {
                tar: tar.clone(),
                tar_gz: tar_gz.clone(),
            },
            (Some(tar), None) => IndexDownloads::Tar { tar: tar.clone() },
            (None, Some(tar_gz)) => IndexDownloads::TarGz {
                tar_gz: tar_gz.clone(),
            },
            (None, None) => {
                return error::MetaMissingSnafu {
                    file: "00-index.tar",
                    role: "snapshot",
                }
                .fail()
            }
        };
        let files = SnapshotFiles {
            root: root_info.clone(),
            mirrors: doc.mirrors_info().cloned(),
            index,
        };
        self.snapshot = Some(Trusted::new(candidate.signed));
        Ok(files)
    }

    /// Offers a candidate mirror list whose bytes have already been checked against the trusted
    /// snapshot's declared info.
    pub fn update_mirrors(&mut self, candidate: Signed<Mirrors>, now: DateTime<Utc>) -> Result<()> {
        let root = self.root.get();
        verify_signed(
            "mirrors",
            &root.keys,
            role_keys(root, RoleType::Mirrors)?,
            &candidate,
        )?;
        check_expiry(self.expiration, "mirrors", &candidate.signed, now)?;
        if let Some(old) = &self.mirrors {
            check_version("mirrors", old.get().version(), &candidate.signed)?;
        }
        self.mirrors = Some(Trusted::new(candidate.signed));
        Ok(())
    }

    /// Verifies the top-level targets document under the root's targets role.
    ///
    /// Targets documents live inside the index archive, whose bytes are pinned by the verified
    /// snapshot, so no version state is kept for them here.
    pub fn verify_targets(
        &self,
        candidate: Signed<Targets>,
        now: DateTime<Utc>,
    ) -> Result<Trusted<Targets>> {
        let root = self.root.get();
        verify_signed(
            "targets",
            &root.keys,
            role_keys(root, RoleType::Targets)?,
            &candidate,
        )?;
        check_expiry(self.expiration, "targets", &candidate.signed, now)?;
        Ok(Trusted::new(candidate.signed))
    }

    /// Verifies a delegated targets document under the delegation's declared role, using the
    /// delegating document's key environment.
    pub fn verify_delegated_targets(
        &self,
        role: &DelegatedRole,
        keys: &KeyEnv,
        candidate: Signed<Targets>,
        now: DateTime<Utc>,
    ) -> Result<Trusted<Targets>> {
        verify_signed(&role.name, keys, &role.role_keys(), &candidate)?;
        check_expiry(self.expiration, &role.name, &candidate.signed, now)?;
        Ok(Trusted::new(candidate.signed))
    }
}

/// Parses a signed envelope, insisting on the expected `_type` discriminator before the
/// document is interpreted as a role.
pub(crate) fn parse_signed<T>(bytes: &[u8], what: &str) -> Result<Signed<T>>
where
    T: Role + serde::de::DeserializeOwned,
{
    let value: serde_json::Value =
        serde_json::from_slice(bytes).context(error::JsonParseSnafu { file: what })?;
    let got = value
        .get("signed")
        .and_then(|signed| signed.get("_type"))
        .and_then(serde_json::Value::as_str)
        .unwrap_or("(missing)")
        .to_owned();
    ensure!(
        got == T::TYPE.to_string(),
        error::WrongTypeSnafu {
            expected: T::TYPE,
            got,
        }
    );
    serde_json::from_value(value).context(error::JsonParseSnafu { file: what })
}

/// Counts valid signatures over the canonical form of `envelope.signed` from distinct
/// authorized key IDs, and fails unless the role's threshold is met.
///
/// Unknown and unauthorized key IDs in the signature list are logged and skipped, as are
/// signatures that fail cryptographic verification; none of them are fatal on their own.
/// Duplicate key IDs never double-count.
fn verify_signed<T: Role>(
    role_name: &str,
    keys: &KeyEnv,
    role: &RoleKeys,
    envelope: &Signed<T>,
) -> Result<()> {
    let canonical = envelope.signed.canonical_form().context(error::SchemaSnafu)?;

    let mut valid: HashSet<&[u8]> = HashSet::new();
    for signature in &envelope.signatures {
        match keys.get(&signature.keyid) {
            None => {
                warn!(
                    "unknown key id '{}' in signatures for role '{}'",
                    signature.keyid, role_name
                );
            }
            Some(_) if !role.keyids.contains(&signature.keyid) => {
                warn!(
                    "key id '{}' is not authorized to sign for role '{}'",
                    signature.keyid, role_name
                );
            }
            Some(key) => {
                if signature.method.usable_with(key) && key.verify(&canonical, &signature.sig) {
                    valid.insert(signature.keyid.as_ref());
                } else {
                    warn!(
                        "invalid signature by key id '{}' on role '{}'",
                        signature.keyid, role_name
                    );
                }
            }
        }
    }

    let need = role.threshold.get();
    let got = valid.len() as u64;
    ensure!(
        got >= need,
        error::SignatureThresholdNotMetSnafu {
            role: role_name,
            need,
            got,
        }
    );
    Ok(())
}

/// Checks that every key ID referenced by the root's role definitions resolves in its key
/// environment, and that all five top-level roles are defined.
fn verify_root_integrity(root: &Root) -> Result<()> {
    for role in [
        RoleType::Root,
        RoleType::Timestamp,
        RoleType::Snapshot,
        RoleType::Targets,
        RoleType::Mirrors,
    ] {
        let role_keys = root
            .role_keys(role)
            .context(error::RoleMissingSnafu { role })?;
        for keyid in &role_keys.keyids {
            ensure!(
                root.keys.contains(keyid),
                error::UnknownKeySnafu {
                    keyid: keyid.to_string(),
                }
            );
        }
    }
    Ok(())
}

fn root_role(root: &Root) -> Result<&RoleKeys> {
    role_keys(root, RoleType::Root)
}

fn role_keys(root: &Root, role: RoleType) -> Result<&RoleKeys> {
    root.role_keys(role)
        .context(error::RoleMissingSnafu { role })
}

fn check_expiry<T: Role>(
    enforcement: ExpirationEnforcement,
    role_name: &str,
    role: &T,
    now: DateTime<Utc>,
) -> Result<()> {
    if enforcement == ExpirationEnforcement::Unsafe {
        return Ok(());
    }
    ensure!(
        role.expires() > now,
        error::ExpiredSnafu {
            role: role_name,
            expires: role.expires(),
        }
    );
    Ok(())
}

fn check_version<T: Role>(
    role_name: &str,
    have: std::num::NonZeroU64,
    candidate: &T,
) -> Result<()> {
    let got = candidate.version().get();
    ensure!(
        got >= have.get(),
        error::VersionRollbackSnafu {
            role: role_name,
            have: have.get(),
            got,
        }
    );
    Ok(())
}

fn role_keys_differ(old: Option<&RoleKeys>, new: Option<&RoleKeys>) -> bool {
    match (old, new) {
        (Some(old), Some(new)) => {
            if old.threshold != new.threshold {
                return true;
            }
            let old_ids: HashSet<&[u8]> = old.keyids.iter().map(AsRef::as_ref).collect();
            let new_ids: HashSet<&[u8]> = new.keyids.iter().map(AsRef::as_ref).collect();
            old_ids != new_ids
        }
        (None, None) => false,
        _ => true,
    }
}

/// Checks a file on disk against declared info, for the "bytes must match before trust" steps
/// of the pipeline.
pub(crate) fn verify_file_info(path: &Path, info: &FileInfo, file: &str) -> Result<()> {
    let actual = FileInfo::for_path(path).context(error::SchemaSnafu)?;
    ensure!(
        info.matches(&actual),
        error::InvalidFileInfoSnafu {
            file,
            expected: describe(info),
            actual: describe(&actual),
        }
    );
    Ok(())
}

/// Whether a file on disk matches declared info; missing files simply don't match.
pub(crate) fn file_matches(path: &Path, info: &FileInfo) -> Result<bool> {
    if !path.is_file() {
        return Ok(false);
    }
    let actual = FileInfo::for_path(path).context(error::SchemaSnafu)?;
    Ok(info.matches(&actual))
}

fn describe(info: &FileInfo) -> String {
    format!(
        "length {}, sha256 {}",
        info.length,
        info.sha256()
            .map_or_else(|| "(none)".to_owned(), ToString::to_string)
    )
}
