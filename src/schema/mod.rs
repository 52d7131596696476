//! Provides the schema objects for the repository's signed metadata documents.

mod de;
pub mod decoded;
mod error;
mod iter;
pub mod key;
pub mod pattern;

pub use crate::schema::error::{Error, Result};
pub use crate::schema::key::KeyEnv;
pub use crate::schema::pattern::Pattern;

use crate::schema::decoded::{Decoded, Hex};
use crate::schema::iter::KeysIter;
use crate::schema::key::Key;
use chrono::{DateTime, Utc};
use olpc_cjson::CanonicalFormatter;
use ring::digest::{Context, SHA256, SHA512};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_plain::{forward_display_to_serde, forward_from_str_to_serde};
use snafu::ResultExt;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::Read;
use std::num::NonZeroU64;
use std::path::Path;

/// The type of metadata role.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum RoleType {
    /// The root role delegates trust to specific keys trusted for all other top-level roles used
    /// in the system.
    Root,
    /// The snapshot role signs a metadata file that pins, by length and digest, the current
    /// root, mirror list, and package index.
    Snapshot,
    /// The targets role's signature indicates which package archives are trusted by clients.
    Targets,
    /// The timestamp role is used to prevent an adversary from replaying an out-of-date signed
    /// metadata file whose signature has not yet expired.
    Timestamp,
    /// The mirrors role signs the list of mirrors that serve the repository's content.
    Mirrors,
}

forward_display_to_serde!(RoleType);
forward_from_str_to_serde!(RoleType);

/// An ordered mapping from repository-relative path to the file's declared length and digests.
pub type FileMap = BTreeMap<String, FileInfo>;

/// Common trait implemented by all roles.
pub trait Role: Serialize {
    /// The type of role this object represents.
    const TYPE: RoleType;

    /// Determines when metadata should be considered expired and no longer trusted by clients.
    fn expires(&self) -> DateTime<Utc>;

    /// An integer that is greater than 0. Clients MUST NOT replace a metadata file with a
    /// version number less than the one currently trusted.
    fn version(&self) -> NonZeroU64;

    /// A deterministic JSON serialization used when calculating the digest of a metadata object
    /// and when verifying or producing signatures over it.
    fn canonical_form(&self) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        let mut ser = serde_json::Serializer::with_formatter(&mut data, CanonicalFormatter::new());
        self.serialize(&mut ser)
            .context(error::JsonSerializationSnafu { what: "role" })?;
        Ok(data)
    }
}

/// A signed metadata object.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Signed<T> {
    /// The role that is signed.
    pub signed: T,
    /// A list of signatures and their key IDs.
    pub signatures: Vec<Signature>,
}

/// A signature and the key ID that made it.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Signature {
    /// The key ID (listed in root.json) that made this signature.
    pub keyid: Decoded<Hex>,
    /// The signature method.
    pub method: SignatureMethod,
    /// A hex-encoded signature of the canonical JSON form of a role.
    pub sig: Decoded<Hex>,
}

/// The method used to produce a signature.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub enum SignatureMethod {
    /// Ed25519 over the canonical JSON form of the signed value.
    #[serde(rename = "ed25519")]
    Ed25519,
}

impl SignatureMethod {
    /// Whether a key can produce signatures with this method.
    pub(crate) fn usable_with(self, key: &Key) -> bool {
        match (self, key) {
            (SignatureMethod::Ed25519, Key::Ed25519 { .. }) => true,
        }
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// A hash algorithm usable in a [`FileInfo`] digest map.
#[derive(
    Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// SHA-256.
    Sha256,
    /// SHA-512.
    Sha512,
}

forward_display_to_serde!(HashAlgorithm);

/// The declared length and digests of a repository file.
///
/// Two `FileInfo` values match when their lengths are equal and at least one hash algorithm
/// present in both yields the same digest. SHA-256 is consulted first when present.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct FileInfo {
    /// The length in bytes of the file.
    pub length: u64,

    /// One or more digests of the file, keyed by algorithm.
    pub hashes: BTreeMap<HashAlgorithm, Decoded<Hex>>,

    /// Extra arguments found during deserialization.
    ///
    /// We must store these to correctly verify signatures for this object.
    ///
    /// If you're instantiating this struct, you should make this `HashMap::empty()`.
    #[serde(flatten)]
    pub _extra: HashMap<String, Value>,
}

impl FileInfo {
    /// Whether `other` describes the same file contents as `self`.
    pub fn matches(&self, other: &FileInfo) -> bool {
        if self.length != other.length {
            return false;
        }
        for algorithm in [HashAlgorithm::Sha256, HashAlgorithm::Sha512] {
            if let (Some(a), Some(b)) = (self.hashes.get(&algorithm), other.hashes.get(&algorithm))
            {
                return a == b;
            }
        }
        false
    }

    /// The SHA-256 digest, if declared.
    pub fn sha256(&self) -> Option<&Decoded<Hex>> {
        self.hashes.get(&HashAlgorithm::Sha256)
    }

    /// Calculates the `FileInfo` of a file on disk, with both supported digests.
    pub fn for_path<P: AsRef<Path>>(path: P) -> Result<FileInfo> {
        let path = path.as_ref();
        let file = File::open(path).context(error::FileOpenSnafu { path })?;
        Self::for_reader(file).context(error::FileReadSnafu { path })
    }

    /// Calculates the `FileInfo` of a byte stream, with both supported digests.
    pub fn for_reader<R: Read>(mut reader: R) -> std::io::Result<FileInfo> {
        let mut sha256 = Context::new(&SHA256);
        let mut sha512 = Context::new(&SHA512);
        let mut buf = [0; 8 * 1024];
        let mut length = 0;
        loop {
            match reader.read(&mut buf)? {
                0 => break,
                n => {
                    sha256.update(&buf[..n]);
                    sha512.update(&buf[..n]);
                    length += n as u64;
                }
            }
        }

        let mut hashes = BTreeMap::new();
        hashes.insert(
            HashAlgorithm::Sha256,
            Decoded::from(sha256.finish().as_ref().to_vec()),
        );
        hashes.insert(
            HashAlgorithm::Sha512,
            Decoded::from(sha512.finish().as_ref().to_vec()),
        );
        Ok(FileInfo {
            length,
            hashes,
            _extra: HashMap::new(),
        })
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// The root.json file is signed by the root role's keys. It indicates which keys are authorized
/// for all top-level roles, including the root role itself. Revocation and replacement of
/// top-level role keys, including for the root role, is done by changing the keys listed for the
/// roles in this file.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "_type")]
#[serde(rename = "root")]
pub struct Root {
    /// A boolean indicating whether the repository supports consistent snapshots.
    pub consistent_snapshot: bool,

    /// An integer that is greater than 0. Clients MUST NOT replace a metadata file with a
    /// version number less than the one currently trusted.
    pub version: NonZeroU64,

    /// Determines when metadata should be considered expired and no longer trusted by clients.
    pub expires: DateTime<Utc>,

    /// The key environment for all key IDs referenced by the top-level roles. Each KEYID must
    /// be correct for its KEY; [`KeyEnv`] recalculates and enforces this while the table is
    /// decoded, along with uniqueness.
    pub keys: KeyEnv,

    /// A list of roles, the keys associated with each role, and the threshold of signatures used
    /// for each role.
    pub roles: HashMap<RoleType, RoleKeys>,

    /// Extra arguments found during deserialization.
    ///
    /// We must store these to correctly verify signatures for this object.
    ///
    /// If you're instantiating this struct, you should make this `HashMap::empty()`.
    #[serde(flatten)]
    #[serde(deserialize_with = "de::extra_skip_type")]
    pub _extra: HashMap<String, Value>,
}

/// Represents the key IDs used for a role and the threshold of signatures required to validate
/// it.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RoleKeys {
    /// The key IDs used for the role.
    pub keyids: Vec<Decoded<Hex>>,

    /// The threshold of signatures required to validate the role.
    pub threshold: NonZeroU64,

    /// Extra arguments found during deserialization.
    ///
    /// We must store these to correctly verify signatures for this object.
    ///
    /// If you're instantiating this struct, you should make this `HashMap::empty()`.
    #[serde(flatten)]
    pub _extra: HashMap<String, Value>,
}

impl Root {
    /// An iterator over the keys for a given role.
    pub fn keys(&self, role: RoleType) -> impl Iterator<Item = &Key> {
        KeysIter {
            keyids_iter: match self.roles.get(&role) {
                Some(role_keys) => role_keys.keyids.iter(),
                None => [].iter(),
            },
            keys: &self.keys,
        }
    }

    /// The key IDs and threshold for a given role, if the root defines it.
    pub fn role_keys(&self, role: RoleType) -> Option<&RoleKeys> {
        self.roles.get(&role)
    }
}

impl Role for Root {
    const TYPE: RoleType = RoleType::Root;

    fn expires(&self) -> DateTime<Utc> {
        self.expires
    }

    fn version(&self) -> NonZeroU64 {
        self.version
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// Represents a `timestamp.json` file. The timestamp file is signed by a timestamp key. It
/// records the current snapshot's length and digests and is frequently resigned to limit the
/// amount of time a client can be kept unaware of interference with obtaining updates.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "_type")]
#[serde(rename = "timestamp")]
pub struct Timestamp {
    /// An integer that is greater than 0. Clients MUST NOT replace a metadata file with a
    /// version number less than the one currently trusted.
    pub version: NonZeroU64,

    /// Determines when metadata should be considered expired and no longer trusted by clients.
    pub expires: DateTime<Utc>,

    /// The file map; for timestamp.json this holds the `snapshot.json` entry.
    pub meta: FileMap,

    /// Extra arguments found during deserialization.
    ///
    /// We must store these to correctly verify signatures for this object.
    ///
    /// If you're instantiating this struct, you should make this `HashMap::empty()`.
    #[serde(flatten)]
    #[serde(deserialize_with = "de::extra_skip_type")]
    pub _extra: HashMap<String, Value>,
}

impl Timestamp {
    /// The declared `FileInfo` of the current snapshot.
    pub fn snapshot_info(&self) -> Option<&FileInfo> {
        self.meta.get("snapshot.json")
    }
}

impl Role for Timestamp {
    const TYPE: RoleType = RoleType::Timestamp;

    fn expires(&self) -> DateTime<Utc> {
        self.expires
    }

    fn version(&self) -> NonZeroU64 {
        self.version
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// Represents a `snapshot.json` file, signed by the snapshot role. It pins the current root,
/// the mirror list, and the package index by length and digest. The `root.json` entry is what a
/// client uses to discover that trust has rotated; the index entries are what make every package
/// description content-addressed.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "_type")]
#[serde(rename = "snapshot")]
pub struct Snapshot {
    /// An integer that is greater than 0. Clients MUST NOT replace a metadata file with a
    /// version number less than the one currently trusted.
    pub version: NonZeroU64,

    /// Determines when metadata should be considered expired and no longer trusted by clients.
    pub expires: DateTime<Utc>,

    /// The file map covering `root.json`, `mirrors.json`, and the index archive in one or both
    /// of its formats.
    pub meta: FileMap,

    /// Extra arguments found during deserialization.
    ///
    /// We must store these to correctly verify signatures for this object.
    ///
    /// If you're instantiating this struct, you should make this `HashMap::empty()`.
    #[serde(flatten)]
    #[serde(deserialize_with = "de::extra_skip_type")]
    pub _extra: HashMap<String, Value>,
}

impl Snapshot {
    /// The declared `FileInfo` of the root document to be trusted next.
    pub fn root_info(&self) -> Option<&FileInfo> {
        self.meta.get("root.json")
    }

    /// The declared `FileInfo` of the mirror list, when the repository publishes one.
    pub fn mirrors_info(&self) -> Option<&FileInfo> {
        self.meta.get("mirrors.json")
    }

    /// The declared `FileInfo` of the uncompressed index archive.
    pub fn index_tar_info(&self) -> Option<&FileInfo> {
        self.meta.get("00-index.tar")
    }

    /// The declared `FileInfo` of the gzip-compressed index archive.
    pub fn index_tar_gz_info(&self) -> Option<&FileInfo> {
        self.meta.get("00-index.tar.gz")
    }
}

impl Role for Snapshot {
    const TYPE: RoleType = RoleType::Snapshot;

    fn expires(&self) -> DateTime<Utc> {
        self.expires
    }

    fn version(&self) -> NonZeroU64 {
        self.version
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// Represents a `mirrors.json` file: the signed, ordered list of mirrors serving the
/// repository's content.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "_type")]
#[serde(rename = "mirrors")]
pub struct Mirrors {
    /// An integer that is greater than 0. Clients MUST NOT replace a metadata file with a
    /// version number less than the one currently trusted.
    pub version: NonZeroU64,

    /// Determines when metadata should be considered expired and no longer trusted by clients.
    pub expires: DateTime<Utc>,

    /// The mirrors, in preference order.
    pub mirrors: Vec<Mirror>,

    /// Extra arguments found during deserialization.
    ///
    /// We must store these to correctly verify signatures for this object.
    ///
    /// If you're instantiating this struct, you should make this `HashMap::empty()`.
    #[serde(flatten)]
    #[serde(deserialize_with = "de::extra_skip_type")]
    pub _extra: HashMap<String, Value>,
}

/// A single mirror descriptor.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Mirror {
    /// The base URL against which repository-relative paths are resolved.
    #[serde(rename = "urlBase")]
    pub url_base: url::Url,

    /// Content types this mirror serves; absent means everything.
    #[serde(rename = "content-types")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_types: Option<Vec<String>>,

    /// Extra arguments found during deserialization.
    ///
    /// We must store these to correctly verify signatures for this object.
    ///
    /// If you're instantiating this struct, you should make this `HashMap::empty()`.
    #[serde(flatten)]
    pub _extra: HashMap<String, Value>,
}

impl Role for Mirrors {
    const TYPE: RoleType = RoleType::Mirrors;

    fn expires(&self) -> DateTime<Utc> {
        self.expires
    }

    fn version(&self) -> NonZeroU64 {
        self.version
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// Represents a `targets.json` file (top-level or delegated): the file map of trusted target
/// paths, plus delegations handing off authority for subsets of paths to further roles.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "_type")]
#[serde(rename = "targets")]
pub struct Targets {
    /// An integer that is greater than 0. Clients MUST NOT replace a metadata file with a
    /// version number less than the one currently trusted.
    pub version: NonZeroU64,

    /// Determines when metadata should be considered expired and no longer trusted by clients.
    pub expires: DateTime<Utc>,

    /// Each key is a target path relative to a mirror's base URL, e.g.
    /// `package/acme-widgets-1.2.0.tar.gz`.
    pub targets: FileMap,

    /// Delegations describe subsets of the targets for which responsibility is delegated to
    /// another role.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delegations: Option<Delegations>,

    /// Extra arguments found during deserialization.
    ///
    /// We must store these to correctly verify signatures for this object.
    ///
    /// If you're instantiating this struct, you should make this `HashMap::empty()`.
    #[serde(flatten)]
    #[serde(deserialize_with = "de::extra_skip_type")]
    pub _extra: HashMap<String, Value>,
}

impl Targets {
    /// The declared `FileInfo` for `path`, if this document lists it directly.
    pub fn target(&self, path: &str) -> Option<&FileInfo> {
        self.targets.get(path)
    }
}

impl Role for Targets {
    const TYPE: RoleType = RoleType::Targets;

    fn expires(&self) -> DateTime<Utc> {
        self.expires
    }

    fn version(&self) -> NonZeroU64 {
        self.version
    }
}

/// Delegations as found in a `targets.json` file: the key environment for the delegated roles,
/// and the roles themselves in declared (priority) order.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Delegations {
    /// Lists the public keys to verify signatures of delegated targets roles. Revocation and
    /// replacement of delegated targets roles keys is done by changing the keys in this field in
    /// the delegating role's metadata.
    pub keys: KeyEnv,

    /// The list of delegated roles.
    pub roles: Vec<DelegatedRole>,
}

/// Each role delegated in a targets file is considered a delegated role.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct DelegatedRole {
    /// The name of the delegated role. For example, "projects".
    pub name: String,

    /// The key IDs used by this role.
    pub keyids: Vec<Decoded<Hex>>,

    /// The threshold of signatures required to validate the role.
    pub threshold: NonZeroU64,

    /// The path patterns governed by this role.
    pub paths: Vec<Pattern>,

    /// Indicates whether subsequent delegations should be considered when this role matches a
    /// path but cannot resolve it.
    #[serde(default)]
    pub terminating: bool,

    /// Extra arguments found during deserialization.
    ///
    /// We must store these to correctly verify signatures for this object.
    ///
    /// If you're instantiating this struct, you should make this `HashMap::empty()`.
    #[serde(flatten)]
    pub _extra: HashMap<String, Value>,
}

impl DelegatedRole {
    /// Whether any of this role's path patterns matches `path`.
    pub fn matches(&self, path: &str) -> bool {
        self.paths.iter().any(|pattern| pattern.matches(path))
    }

    /// Returns a `RoleKeys` representation of the role.
    pub fn role_keys(&self) -> RoleKeys {
        RoleKeys {
            keyids: self.keyids.clone(),
            threshold: self.threshold,
            _extra: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root_json() -> serde_json::Value {
        serde_json::json!({
            "signed": {
                "_type": "root",
                "consistent_snapshot": false,
                "version": 1,
                "expires": "2030-01-01T00:00:00Z",
                "keys": {},
                "roles": {
                    "root": { "keyids": [], "threshold": 1 },
                    "snapshot": { "keyids": [], "threshold": 1 },
                    "targets": { "keyids": [], "threshold": 1 },
                    "timestamp": { "keyids": [], "threshold": 1 },
                    "mirrors": { "keyids": [], "threshold": 1 }
                },
                "unrecognized_field": "carried through"
            },
            "signatures": []
        })
    }

    #[test]
    fn canonical_form_is_stable_across_round_trips() {
        let parsed: Signed<Root> = serde_json::from_value(root_json()).unwrap();
        let first = parsed.signed.canonical_form().unwrap();
        let reparsed: Signed<Root> =
            serde_json::from_slice(&serde_json::to_vec(&parsed).unwrap()).unwrap();
        assert_eq!(first, reparsed.signed.canonical_form().unwrap());
    }

    #[test]
    fn unknown_fields_are_preserved() {
        let parsed: Signed<Root> = serde_json::from_value(root_json()).unwrap();
        assert_eq!(
            parsed.signed._extra.get("unrecognized_field"),
            Some(&serde_json::Value::String("carried through".to_owned()))
        );
        // and _type is not double-recorded
        assert!(!parsed.signed._extra.contains_key("_type"));
    }

    #[test]
    fn wrong_discriminator_fails_to_parse() {
        let mut doc = root_json();
        doc["signed"]["_type"] = "timestamp".into();
        assert!(serde_json::from_value::<Signed<Root>>(doc).is_err());
    }

    #[test]
    fn file_info_matching() {
        let both = FileInfo::for_reader(&b"data"[..]).unwrap();

        let mut sha256_only = both.clone();
        sha256_only.hashes.remove(&HashAlgorithm::Sha512);
        let mut sha512_only = both.clone();
        sha512_only.hashes.remove(&HashAlgorithm::Sha256);

        // any common algorithm with an equal digest is enough
        assert!(both.matches(&sha256_only));
        assert!(both.matches(&sha512_only));

        // no common algorithm, or no hashes at all, is never a match
        assert!(!sha256_only.matches(&sha512_only));
        let mut bare = both.clone();
        bare.hashes.clear();
        assert!(!both.matches(&bare));

        // equal digests with differing lengths is a mismatch
        let mut shorter = both.clone();
        shorter.length = 3;
        assert!(!both.matches(&shorter));

        // a corrupted digest is a mismatch even when lengths agree
        let other = FileInfo::for_reader(&b"datA"[..]).unwrap();
        assert_eq!(both.length, other.length);
        assert!(!both.matches(&other));
    }
}
