//! In-memory ordered key-value store backing contract variables.
//!
//! Mirrors the contract a persistent store offers the processor:
//! `find`, `create` (key must be new) and `delete`. Keys and values are
//! opaque byte strings; the lexicographic order only serves the index.

use crate::virtual_machine::host::Host;
use crate::virtual_machine::state::{State, VarKey};
use bvm_derive::Error;
use std::collections::BTreeMap;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("entry already exists for a {len}-byte key")]
    AlreadyExists { len: usize },
}

#[derive(Debug, Clone, Default)]
pub struct VariableMem {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl VariableMem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, key: &[u8]) -> Option<&[u8]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    pub fn find_mut(&mut self, key: &[u8]) -> Option<&mut Vec<u8>> {
        self.entries.get_mut(key)
    }

    /// Inserts an empty entry for `key` and returns it for filling.
    pub fn create(&mut self, key: &[u8]) -> Result<&mut Vec<u8>, StorageError> {
        if self.entries.contains_key(key) {
            return Err(StorageError::AlreadyExists { len: key.len() });
        }
        Ok(self.entries.entry(key.to_vec()).or_default())
    }

    /// Removes the entry, returning its value if it existed.
    pub fn delete(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        self.entries.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.entries
            .iter()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
    }
}

impl State for VariableMem {
    fn load_var(&self, key: &VarKey) -> Option<Vec<u8>> {
        self.find(key.as_slice()).map(<[u8]>::to_vec)
    }

    fn save_var(&mut self, key: &VarKey, value: &[u8]) -> bool {
        let raw = key.as_slice();
        if value.is_empty() {
            return self.delete(raw).is_some();
        }
        if let Some(existing) = self.find_mut(raw) {
            existing.clear();
            existing.extend_from_slice(value);
            return true;
        }
        self.entries.insert(raw.to_vec(), value.to_vec());
        false
    }
}

impl Host for VariableMem {}
