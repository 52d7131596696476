//! Public keys and the key environment for signed metadata.

use crate::schema::decoded::{Decoded, Hex};
use crate::schema::error::{self, Result};
use olpc_cjson::CanonicalFormatter;
use ring::digest::{digest, SHA256};
use ring::signature::{UnparsedPublicKey, ED25519};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use snafu::{ensure, ResultExt};
use std::collections::HashMap;
use std::fmt;

/// A public key as it appears in a role document's key environment.
///
/// The repository format signs everything with Ed25519; the enum shape leaves room for further
/// schemes without breaking the wire format.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "keytype")]
#[non_exhaustive]
pub enum Key {
    /// An Ed25519 public key.
    #[serde(rename = "ed25519")]
    Ed25519 {
        /// The public key material.
        keyval: Ed25519Key,
        /// The signature scheme used with this key.
        scheme: Ed25519Scheme,
        /// Extra fields found during deserialization, preserved for canonical re-encoding.
        #[serde(flatten)]
        _extra: HashMap<String, Value>,
    },
}

/// Ed25519 public key material.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Ed25519Key {
    /// The raw public key, hex-encoded on the wire.
    pub public: Decoded<Hex>,

    /// Extra fields found during deserialization, preserved for canonical re-encoding.
    #[serde(flatten)]
    pub _extra: HashMap<String, Value>,
}

/// The Ed25519 signature scheme discriminator.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub enum Ed25519Scheme {
    /// `ed25519`
    #[serde(rename = "ed25519")]
    Ed25519,
}

impl Key {
    /// Calculates this key's ID: the SHA-256 digest of the key's canonical JSON form.
    pub fn key_id(&self) -> Result<Decoded<Hex>> {
        let mut buf = Vec::new();
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, CanonicalFormatter::new());
        self.serialize(&mut ser)
            .context(error::JsonSerializationSnafu { what: "public key" })?;
        Ok(Decoded::from(digest(&SHA256, &buf).as_ref().to_vec()))
    }

    /// Verifies `sig` as a signature over `msg` made by this key.
    pub fn verify(&self, msg: &[u8], sig: &[u8]) -> bool {
        let Key::Ed25519 { keyval, .. } = self;
        UnparsedPublicKey::new(&ED25519, keyval.public.bytes())
            .verify(msg, sig)
            .is_ok()
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// A mapping from key ID to public key, built while a role document's key table is decoded and
/// closed before any signature in that document is verified.
///
/// The environment enforces the table's integrity as it is built: every ID must equal the one
/// calculated from its key, and an ID can be bound at most once. Lookups during verification
/// that miss are verification failures, never panics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyEnv {
    keys: HashMap<Decoded<Hex>, Key>,
}

impl KeyEnv {
    /// An empty environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Closes an environment over `entries`, enforcing the ID and uniqueness rules for each.
    pub fn from_entries<I>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (Decoded<Hex>, Key)>,
    {
        let mut env = Self::new();
        for (keyid, key) in entries {
            env.insert(keyid, key)?;
        }
        Ok(env)
    }

    /// Binds `keyid` to `key`. The ID must be the one calculated from the key, and must not
    /// already be bound.
    pub fn insert(&mut self, keyid: Decoded<Hex>, key: Key) -> Result<()> {
        let calculated = key.key_id()?;
        ensure!(
            keyid == calculated,
            error::InvalidKeyIdSnafu {
                keyid: keyid.to_string(),
                calculated: calculated.to_string(),
            }
        );
        ensure!(
            !self.keys.contains_key(&keyid),
            error::DuplicateKeyIdSnafu {
                keyid: keyid.to_string(),
            }
        );
        self.keys.insert(keyid, key);
        Ok(())
    }

    /// Resolves a key ID.
    pub fn get(&self, keyid: &Decoded<Hex>) -> Option<&Key> {
        self.keys.get(keyid)
    }

    /// Whether `keyid` resolves in this environment.
    pub fn contains(&self, keyid: &Decoded<Hex>) -> bool {
        self.keys.contains_key(keyid)
    }

    /// The number of keys in the environment.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the environment holds no keys at all.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl<'de> Deserialize<'de> for KeyEnv {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        // Pass one: collect the table exactly as written, duplicates included. Folding into a
        // map here would silently collapse a duplicated key ID before it could be rejected.
        struct TableVisitor;

        impl<'de> serde::de::Visitor<'de> for TableVisitor {
            type Value = Vec<(Decoded<Hex>, Key)>;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a map of key id to public key")
            }

            fn visit_map<M>(self, mut access: M) -> std::result::Result<Self::Value, M::Error>
            where
                M: serde::de::MapAccess<'de>,
            {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some(entry) = access.next_entry()? {
                    entries.push(entry);
                }
                Ok(entries)
            }
        }

        // Pass two: close the environment, which applies the integrity rules.
        let entries = deserializer.deserialize_map(TableVisitor)?;
        KeyEnv::from_entries(entries).map_err(serde::de::Error::custom)
    }
}

impl Serialize for KeyEnv {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_map(self.keys.iter())
    }
}
