//! Utilities for integration tests: builds complete signed repositories on disk.
//!
//! Not every test module uses every helper, so we suppress unused warnings.
#![allow(unused)]

use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use palisade::schema::decoded::{Decoded, Hex};
use palisade::schema::key::Key;
use palisade::schema::{
    DelegatedRole, Delegations, FileInfo, FileMap, KeyEnv, Mirror, Mirrors, Pattern, Role,
    RoleKeys, RoleType, Root, Snapshot, Targets, Timestamp,
};
use palisade::{
    sign_envelope, Cache, Client, ExpirationEnforcement, FilesystemTransport, Limits,
    RemoteRepository, Sign,
};
use ring::rand::SystemRandom;
use ring::signature::Ed25519KeyPair;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::num::NonZeroU64;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use url::Url;

pub fn now() -> DateTime<Utc> {
    "2024-01-01T00:00:00Z".parse().unwrap()
}

pub fn fresh() -> DateTime<Utc> {
    "2030-01-01T00:00:00Z".parse().unwrap()
}

pub fn generate_keypair() -> Ed25519KeyPair {
    let rng = SystemRandom::new();
    let document = Ed25519KeyPair::generate_pkcs8(&rng).unwrap();
    Ed25519KeyPair::from_pkcs8(document.as_ref()).unwrap()
}

pub fn key_id(key: &Ed25519KeyPair) -> Decoded<Hex> {
    Sign::public_key(key).key_id().unwrap()
}

/// One signing key per top-level role.
pub struct Keys {
    pub root: Ed25519KeyPair,
    pub timestamp: Ed25519KeyPair,
    pub snapshot: Ed25519KeyPair,
    pub targets: Ed25519KeyPair,
    pub mirrors: Ed25519KeyPair,
}

impl Keys {
    pub fn generate() -> Self {
        Self {
            root: generate_keypair(),
            timestamp: generate_keypair(),
            snapshot: generate_keypair(),
            targets: generate_keypair(),
            mirrors: generate_keypair(),
        }
    }
}

/// Serializes and signs a role document the way the repository tools publish them.
pub fn sign_role<T: Role>(role: T, signers: &[&Ed25519KeyPair]) -> Vec<u8> {
    let signers: Vec<&dyn Sign> = signers.iter().map(|k| *k as &dyn Sign).collect();
    let envelope = sign_envelope(role, &signers).unwrap();
    let mut buffer = serde_json::to_vec_pretty(&envelope).unwrap();
    buffer.push(b'\n');
    buffer
}

pub fn file_info(bytes: &[u8]) -> FileInfo {
    FileInfo::for_reader(bytes).unwrap()
}

fn one_key_role(key: &Ed25519KeyPair) -> RoleKeys {
    RoleKeys {
        keyids: vec![key_id(key)],
        threshold: NonZeroU64::new(1).unwrap(),
        _extra: HashMap::new(),
    }
}

/// Builds a root document whose five roles are held by `keys`, one key and a threshold of one
/// each.
pub fn build_root(keys: &Keys, version: u64) -> Root {
    let mut env = KeyEnv::new();
    for key in [
        &keys.root,
        &keys.timestamp,
        &keys.snapshot,
        &keys.targets,
        &keys.mirrors,
    ] {
        env.insert(key_id(key), Sign::public_key(key)).unwrap();
    }
    let mut roles = HashMap::new();
    roles.insert(RoleType::Root, one_key_role(&keys.root));
    roles.insert(RoleType::Timestamp, one_key_role(&keys.timestamp));
    roles.insert(RoleType::Snapshot, one_key_role(&keys.snapshot));
    roles.insert(RoleType::Targets, one_key_role(&keys.targets));
    roles.insert(RoleType::Mirrors, one_key_role(&keys.mirrors));
    Root {
        consistent_snapshot: false,
        version: NonZeroU64::new(version).unwrap(),
        expires: fresh(),
        keys: env,
        roles,
        _extra: HashMap::new(),
    }
}

/// Publication parameters for one repository state.
pub struct Publish {
    pub root_version: u64,
    pub timestamp_version: u64,
    pub snapshot_version: u64,
    pub mirrors_version: u64,
    pub timestamp_expires: DateTime<Utc>,
    /// Pre-signed root document bytes, for rotation tests; `None` builds and signs one from
    /// the signing keys.
    pub root_bytes: Option<Vec<u8>>,
}

impl Default for Publish {
    fn default() -> Self {
        Self {
            root_version: 1,
            timestamp_version: 1,
            snapshot_version: 1,
            mirrors_version: 1,
            timestamp_expires: fresh(),
            root_bytes: None,
        }
    }
}

/// A delegated role interposed between the top-level targets document and the packages.
pub struct DelegationSpec {
    pub name: String,
    pub key: Ed25519KeyPair,
    pub patterns: Vec<String>,
    pub terminating: bool,
}

/// A complete repository served from a local directory, plus a cache directory for the client
/// under test.
pub struct Fixture {
    pub server: TempDir,
    pub cache: TempDir,
    pub keys: Keys,
    /// `(id, archive bytes)` for every published package.
    pub packages: Vec<(String, Vec<u8>)>,
    /// Accumulated index entries, append-only like the real archive.
    index_entries: Vec<(String, Vec<u8>)>,
    /// Names of packages already described in the index.
    indexed: Vec<String>,
    pub with_gzip: bool,
    pub delegation: Option<DelegationSpec>,
    /// The most recently generated root document, keyed by version: `HashMap`-backed fields in
    /// `Root` serialize with an iteration order that varies across otherwise-identical values,
    /// so re-signing an unchanged version from scratch would produce different bytes (and thus
    /// a different digest) each time. Reusing the bytes keeps `root.json` stable across
    /// publishes that don't actually change the root.
    last_root: Option<(u64, Vec<u8>)>,
}

impl Fixture {
    /// A one-package repository, fully published at version 1.
    pub fn new() -> Self {
        let mut fixture = Self::empty();
        fixture.add_package("acme-widgets-1.2.0", b"acme-widgets 1.2.0 release archive");
        fixture.publish(&Publish::default());
        fixture
    }

    pub fn empty() -> Self {
        Self {
            server: TempDir::new().unwrap(),
            cache: TempDir::new().unwrap(),
            keys: Keys::generate(),
            packages: Vec::new(),
            index_entries: Vec::new(),
            indexed: Vec::new(),
            with_gzip: true,
            delegation: None,
            last_root: None,
        }
    }

    /// Registers a package and writes its archive into the server's package directory.
    pub fn add_package(&mut self, id: &str, contents: &[u8]) {
        let package_dir = self.server.path().join("package");
        fs::create_dir_all(&package_dir).unwrap();
        fs::write(package_dir.join(format!("{id}.tar.gz")), contents).unwrap();
        self.packages.push((id.to_owned(), contents.to_vec()));
    }

    /// Writes a complete, consistent set of signed metadata into the server directory, signed
    /// by the fixture's own keys.
    pub fn publish(&mut self, publish: &Publish) {
        self.publish_as(None, publish);
    }

    /// As [`Fixture::publish`], signing the non-root roles with `keys` (for rotation tests).
    pub fn publish_as(&mut self, keys: Option<&Keys>, publish: &Publish) {
        // The signing keys may be the fixture's own; split the borrows up front.
        let Self {
            server,
            cache: _,
            keys: own_keys,
            packages,
            index_entries,
            indexed,
            with_gzip,
            delegation,
            last_root,
        } = self;
        let keys = keys.unwrap_or(own_keys);
        let mirror_url = Url::from_directory_path(server.path()).unwrap();

        let root_bytes = match &publish.root_bytes {
            Some(bytes) => bytes.clone(),
            None => match last_root {
                Some((version, bytes)) if *version == publish.root_version => bytes.clone(),
                _ => {
                    let bytes = sign_role(build_root(keys, publish.root_version), &[&keys.root]);
                    *last_root = Some((publish.root_version, bytes.clone()));
                    bytes
                }
            },
        };

        append_index_entries(packages, delegation.as_ref(), keys, index_entries, indexed);
        let index_tar = tar_bytes(index_entries);
        let index_tar_gz = {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&index_tar).unwrap();
            encoder.finish().unwrap()
        };

        let mirrors = Mirrors {
            version: NonZeroU64::new(publish.mirrors_version).unwrap(),
            expires: fresh(),
            mirrors: vec![Mirror {
                url_base: mirror_url,
                content_types: None,
                _extra: HashMap::new(),
            }],
            _extra: HashMap::new(),
        };
        let mirrors_bytes = sign_role(mirrors, &[&keys.mirrors]);

        let mut snapshot_meta = BTreeMap::new();
        snapshot_meta.insert("root.json".to_owned(), file_info(&root_bytes));
        snapshot_meta.insert("mirrors.json".to_owned(), file_info(&mirrors_bytes));
        snapshot_meta.insert("00-index.tar".to_owned(), file_info(&index_tar));
        if *with_gzip {
            snapshot_meta.insert("00-index.tar.gz".to_owned(), file_info(&index_tar_gz));
        }
        let snapshot = Snapshot {
            version: NonZeroU64::new(publish.snapshot_version).unwrap(),
            expires: fresh(),
            meta: snapshot_meta,
            _extra: HashMap::new(),
        };
        let snapshot_bytes = sign_role(snapshot, &[&keys.snapshot]);

        let mut timestamp_meta = BTreeMap::new();
        timestamp_meta.insert("snapshot.json".to_owned(), file_info(&snapshot_bytes));
        let timestamp = Timestamp {
            version: NonZeroU64::new(publish.timestamp_version).unwrap(),
            expires: publish.timestamp_expires,
            meta: timestamp_meta,
            _extra: HashMap::new(),
        };
        let timestamp_bytes = sign_role(timestamp, &[&keys.timestamp]);

        let server = server.path();
        fs::write(server.join("root.json"), &root_bytes).unwrap();
        fs::write(server.join("mirrors.json"), &mirrors_bytes).unwrap();
        fs::write(server.join("00-index.tar"), &index_tar).unwrap();
        if *with_gzip {
            fs::write(server.join("00-index.tar.gz"), &index_tar_gz).unwrap();
        }
        fs::write(server.join("snapshot.json"), &snapshot_bytes).unwrap();
        fs::write(server.join("timestamp.json"), &timestamp_bytes).unwrap();
    }

    /// Packs the currently published timestamp and snapshot into the optional bundle file.
    pub fn publish_bundle(&self) {
        let server = self.server.path();
        let mut builder = tar::Builder::new(Vec::new());
        for name in ["timestamp.json", "snapshot.json"] {
            let contents = fs::read(server.join(name)).unwrap();
            let mut header = tar::Header::new_ustar();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, name, contents.as_slice())
                .unwrap();
        }
        fs::write(
            server.join("timestamp-snapshot.json"),
            builder.into_inner().unwrap(),
        )
        .unwrap();
    }

    pub fn mirror_url(&self) -> Url {
        Url::from_directory_path(self.server.path()).unwrap()
    }

    pub fn server_file(&self, name: &str) -> Vec<u8> {
        fs::read(self.server.path().join(name)).unwrap()
    }

    pub fn cache_file(&self, name: &str) -> Option<Vec<u8>> {
        fs::read(self.cache.path().join(name)).ok()
    }

    /// A repository over the local filesystem transport, anchored at the fixture's server
    /// directory.
    pub fn repository(&self) -> RemoteRepository {
        self.repository_at(vec![self.mirror_url()])
    }

    pub fn repository_at(&self, mirrors: Vec<Url>) -> RemoteRepository {
        RemoteRepository::new(
            Box::new(FilesystemTransport::new()),
            mirrors,
            Cache::open(self.cache.path()).unwrap(),
            Limits::default(),
        )
    }

    /// Bootstraps a client from the server's current root document.
    pub fn bootstrap_client(&self) -> Client<RemoteRepository> {
        Client::bootstrap(
            self.repository(),
            &self.server.path().join("root.json"),
            ExpirationEnforcement::Safe,
            Limits::default(),
            now(),
        )
        .unwrap()
    }

    /// Loads a client from the cache populated by an earlier client.
    pub fn load_client(&self) -> Client<RemoteRepository> {
        Client::load(
            self.repository(),
            ExpirationEnforcement::Safe,
            Limits::default(),
            now(),
        )
        .unwrap()
    }
}

fn targets_file_map(packages: &[(String, Vec<u8>)]) -> FileMap {
    let mut targets = BTreeMap::new();
    for (id, contents) in packages {
        targets.insert(format!("package/{id}.tar.gz"), file_info(contents));
    }
    targets
}

fn build_targets_entries(
    packages: &[(String, Vec<u8>)],
    delegation: Option<&DelegationSpec>,
    keys: &Keys,
) -> Vec<(String, Vec<u8>)> {
    let mut entries = Vec::new();
    match delegation {
        None => {
            let targets = Targets {
                version: NonZeroU64::new(1).unwrap(),
                expires: fresh(),
                targets: targets_file_map(packages),
                delegations: None,
                _extra: HashMap::new(),
            };
            entries.push(("targets.json".to_owned(), sign_role(targets, &[&keys.targets])));
        }
        Some(delegation) => {
            let delegated = Targets {
                version: NonZeroU64::new(1).unwrap(),
                expires: fresh(),
                targets: targets_file_map(packages),
                delegations: None,
                _extra: HashMap::new(),
            };
            entries.push((
                format!("{}.json", delegation.name),
                sign_role(delegated, &[&delegation.key]),
            ));

            let mut delegated_env = KeyEnv::new();
            delegated_env
                .insert(key_id(&delegation.key), Sign::public_key(&delegation.key))
                .unwrap();
            let top = Targets {
                version: NonZeroU64::new(1).unwrap(),
                expires: fresh(),
                targets: BTreeMap::new(),
                delegations: Some(Delegations {
                    keys: delegated_env,
                    roles: vec![DelegatedRole {
                        name: delegation.name.clone(),
                        keyids: vec![key_id(&delegation.key)],
                        threshold: NonZeroU64::new(1).unwrap(),
                        paths: delegation
                            .patterns
                            .iter()
                            .map(|p| p.parse::<Pattern>().unwrap())
                            .collect(),
                        terminating: delegation.terminating,
                        _extra: HashMap::new(),
                    }],
                }),
                _extra: HashMap::new(),
            };
            entries.push(("targets.json".to_owned(), sign_role(top, &[&keys.targets])));
        }
    }
    entries
}

/// The index is append-only: new package descriptions and a fresh copy of the targets tree go
/// on the end, the way the real archive grows.
fn append_index_entries(
    packages: &[(String, Vec<u8>)],
    delegation: Option<&DelegationSpec>,
    keys: &Keys,
    index_entries: &mut Vec<(String, Vec<u8>)>,
    indexed: &mut Vec<String>,
) {
    for (id, _) in packages {
        if indexed.contains(id) {
            continue;
        }
        let (name, version) = split_package_id(id);
        index_entries.push((
            format!("{name}/{version}/{name}.cabal"),
            format!("name: {name}\nversion: {version}\n").into_bytes(),
        ));
        indexed.push(id.clone());
    }
    index_entries.extend(build_targets_entries(packages, delegation, keys));
}

fn tar_bytes(entries: &[(String, Vec<u8>)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, contents) in entries {
        let mut header = tar::Header::new_ustar();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, path, contents.as_slice())
            .unwrap();
    }
    builder.into_inner().unwrap()
}

pub fn split_package_id(id: &str) -> (&str, &str) {
    id.rsplit_once('-').unwrap()
}

/// Gets the goods from a read and makes a Vec.
pub fn read_to_end<R: std::io::Read>(mut reader: R) -> Vec<u8> {
    let mut v = Vec::new();
    reader.read_to_end(&mut v).unwrap();
    v
}
