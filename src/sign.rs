//! Signing of metadata documents.
//!
//! Clients only ever verify, but fixture builders and the server-side tools that feed them need
//! to produce signatures; this module is the producing half of the envelope format.

use crate::error::{self, Result};
use crate::schema::decoded::Decoded;
use crate::schema::key::{Ed25519Key, Ed25519Scheme, Key};
use crate::schema::{Role, Signature, SignatureMethod, Signed};
use ring::signature::{Ed25519KeyPair, KeyPair};
use snafu::ResultExt;
use std::collections::HashMap;

/// This trait must be implemented for each type of key with which you will sign things.
pub trait Sign: Send + Sync {
    /// Returns the public half of the key in its metadata form.
    fn public_key(&self) -> Key;

    /// Signs the supplied message.
    fn sign(&self, msg: &[u8]) -> Result<Vec<u8>>;
}

impl Sign for Ed25519KeyPair {
    fn public_key(&self) -> Key {
        Key::Ed25519 {
            keyval: Ed25519Key {
                public: Decoded::from(KeyPair::public_key(self).as_ref().to_vec()),
                _extra: HashMap::new(),
            },
            scheme: Ed25519Scheme::Ed25519,
            _extra: HashMap::new(),
        }
    }

    fn sign(&self, msg: &[u8]) -> Result<Vec<u8>> {
        Ok(Ed25519KeyPair::sign(self, msg).as_ref().to_vec())
    }
}

/// Parses a PKCS#8 Ed25519 keypair, returning an object that implements the [`Sign`] trait.
pub fn parse_keypair(pkcs8: &[u8]) -> Result<impl Sign> {
    Ed25519KeyPair::from_pkcs8(pkcs8).context(error::KeyRejectedSnafu)
}

/// Signs a role document with each of the given keys, producing the envelope to publish.
pub fn sign_envelope<T: Role>(role: T, keys: &[&dyn Sign]) -> Result<Signed<T>> {
    let canonical = role.canonical_form().context(error::SchemaSnafu)?;
    let mut signatures = Vec::with_capacity(keys.len());
    for key in keys {
        let keyid = key
            .public_key()
            .key_id()
            .context(error::SchemaSnafu)?;
        let sig = key.sign(&canonical)?;
        signatures.push(Signature {
            keyid,
            method: SignatureMethod::Ed25519,
            sig: Decoded::from(sig),
        });
    }
    Ok(Signed {
        signed: role,
        signatures,
    })
}
