use crate::schema::decoded::{Decoded, Hex};
use crate::schema::key::{Key, KeyEnv};

/// An iterator over a role's authorized keys, yielding only the key IDs that resolve in the
/// document's key environment.
pub(crate) struct KeysIter<'a> {
    pub(crate) keyids_iter: std::slice::Iter<'a, Decoded<Hex>>,
    pub(crate) keys: &'a KeyEnv,
}

impl<'a> Iterator for KeysIter<'a> {
    type Item = &'a Key;

    fn next(&mut self) -> Option<Self::Item> {
        self.keyids_iter.by_ref().find_map(|keyid| self.keys.get(keyid))
    }
}
