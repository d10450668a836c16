//! Contract variable keys and the storage interface the processor consumes.
//!
//! The [`State`] trait defines the host's key-value storage. [`OverlayState`]
//! buffers writes over a read-only base so a host can apply or discard all
//! effects of an invocation at once.

use crate::types::hash::HASH_LEN;
use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::program::{ContractID, VAR_KEY_SIZE};
use std::collections::BTreeMap;
use std::fmt;

/// Maximum serialized [`VarKey`] length.
pub const VAR_KEY_MAX: usize = HASH_LEN + 1 + VAR_KEY_SIZE;

/// Namespace byte following the contract id in a [`VarKey`].
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VarTag {
    /// Variables written by the contract itself through `save_var`.
    Internal = 0,
}

/// Fully-qualified storage key: `cid (32) || tag (1) || subkey (<= 256)`.
///
/// The module of a contract is stored under the bare `cid`
/// ([`VarKey::code`]). Keys always start with the owning contract id, so a
/// contract can never address another contract's variables.
#[derive(Clone)]
pub struct VarKey {
    bytes: [u8; VAR_KEY_MAX],
    len: usize,
}

impl VarKey {
    /// Key under which the module of `cid` is stored.
    pub fn code(cid: &ContractID) -> Self {
        let mut bytes = [0u8; VAR_KEY_MAX];
        bytes[..HASH_LEN].copy_from_slice(cid.as_slice());
        Self {
            bytes,
            len: HASH_LEN,
        }
    }

    pub fn new(cid: &ContractID, tag: VarTag, subkey: &[u8]) -> Result<Self, VMError> {
        if subkey.len() > VAR_KEY_SIZE {
            return Err(VMError::KeyTooLarge {
                size: subkey.len(),
                max: VAR_KEY_SIZE,
            });
        }
        let mut key = Self::code(cid);
        key.bytes[HASH_LEN] = tag as u8;
        key.bytes[HASH_LEN + 1..HASH_LEN + 1 + subkey.len()].copy_from_slice(subkey);
        key.len = HASH_LEN + 1 + subkey.len();
        Ok(key)
    }

    /// Rebuilds a key from its serialized bytes, truncating anything past
    /// [`VAR_KEY_MAX`].
    pub fn from_raw(raw: &[u8]) -> Self {
        let len = raw.len().min(VAR_KEY_MAX);
        let mut bytes = [0u8; VAR_KEY_MAX];
        bytes[..len].copy_from_slice(&raw[..len]);
        Self { bytes, len }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl PartialEq for VarKey {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for VarKey {}

impl fmt::Debug for VarKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VarKey(")?;
        for byte in self.as_slice() {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, ")")
    }
}

/// Key-value storage interface for VM execution.
///
/// Keys and values are opaque byte strings; a zero-length value is never
/// stored, saving one deletes the key instead.
pub trait State {
    /// Retrieves a value by key, returning `None` if the key does not exist.
    fn load_var(&self, key: &VarKey) -> Option<Vec<u8>>;

    /// Copies a value into `buf`, returning the full stored size.
    ///
    /// When the stored value is larger than `buf`, only the prefix that fits
    /// is copied and the caller decides whether that is an error.
    fn load_var_into(&self, key: &VarKey, buf: &mut [u8]) -> Option<usize> {
        let value = self.load_var(key)?;
        let n = value.len().min(buf.len());
        buf[..n].copy_from_slice(&value[..n]);
        Some(value.len())
    }

    /// Stores `value` under `key`, deleting it when `value` is empty.
    ///
    /// Returns whether a value existed before.
    fn save_var(&mut self, key: &VarKey, value: &[u8]) -> bool;
}

/// Write buffer on top of a read-only base storage.
///
/// Reads fall through to the base for keys not yet written.
pub struct OverlayState<'a, S: State + ?Sized> {
    base: &'a S,
    /// Pending writes: `Some(value)` for insertions, `None` for deletions.
    pub(crate) writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl<'a, S: State + ?Sized> OverlayState<'a, S> {
    /// Creates a new overlay backed by the given base storage.
    pub fn new(base: &'a S) -> Self {
        Self {
            base,
            writes: BTreeMap::new(),
        }
    }

    /// Consumes the overlay and returns the pending writes in key order.
    pub fn into_writes(self) -> Vec<(Vec<u8>, Option<Vec<u8>>)> {
        self.writes.into_iter().collect()
    }

    fn lookup(&self, key: &VarKey) -> Option<Vec<u8>> {
        match self.writes.get(key.as_slice()) {
            Some(v) => v.clone(),
            None => self.base.load_var(key),
        }
    }
}

impl<S: State + ?Sized> State for OverlayState<'_, S> {
    fn load_var(&self, key: &VarKey) -> Option<Vec<u8>> {
        self.lookup(key)
    }

    fn save_var(&mut self, key: &VarKey, value: &[u8]) -> bool {
        let existed = self.lookup(key).is_some();
        let entry = (!value.is_empty()).then(|| value.to_vec());
        self.writes.insert(key.as_slice().to_vec(), entry);
        existed
    }
}

/// Applies writes collected by [`OverlayState::into_writes`] to `target`.
pub fn apply_writes<T: State + ?Sized>(target: &mut T, writes: Vec<(Vec<u8>, Option<Vec<u8>>)>) {
    for (raw, value) in writes {
        let key = VarKey::from_raw(&raw);
        target.save_var(&key, value.as_deref().unwrap_or_default());
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::types::hash::Hash;

    /// Minimal in-memory storage for overlay tests.
    #[derive(Default)]
    pub struct TestState {
        data: BTreeMap<Vec<u8>, Vec<u8>>,
    }

    impl TestState {
        pub fn with_data(data: Vec<(VarKey, Vec<u8>)>) -> Self {
            Self {
                data: data
                    .into_iter()
                    .map(|(k, v)| (k.as_slice().to_vec(), v))
                    .collect(),
            }
        }
    }

    impl State for TestState {
        fn load_var(&self, key: &VarKey) -> Option<Vec<u8>> {
            self.data.get(key.as_slice()).cloned()
        }

        fn save_var(&mut self, key: &VarKey, value: &[u8]) -> bool {
            if value.is_empty() {
                self.data.remove(key.as_slice()).is_some()
            } else {
                self.data
                    .insert(key.as_slice().to_vec(), value.to_vec())
                    .is_some()
            }
        }
    }

    fn k(s: &[u8]) -> VarKey {
        VarKey::new(&Hash::digest(b"contract"), VarTag::Internal, s).unwrap()
    }

    #[test]
    fn var_key_layout() {
        let cid = Hash::digest(b"contract");
        let key = VarKey::new(&cid, VarTag::Internal, b"abc").unwrap();
        assert_eq!(key.len(), 32 + 1 + 3);
        assert_eq!(&key.as_slice()[..32], cid.as_slice());
        assert_eq!(key.as_slice()[32], VarTag::Internal as u8);
        assert_eq!(&key.as_slice()[33..], b"abc");
        assert_eq!(VarKey::code(&cid).as_slice(), cid.as_slice());
    }

    #[test]
    fn var_key_rejects_long_subkey() {
        let cid = Hash::digest(b"contract");
        assert!(VarKey::new(&cid, VarTag::Internal, &[0u8; VAR_KEY_SIZE]).is_ok());
        assert!(matches!(
            VarKey::new(&cid, VarTag::Internal, &[0u8; VAR_KEY_SIZE + 1]),
            Err(VMError::KeyTooLarge { size: 257, .. })
        ));
    }

    #[test]
    fn load_var_into_reports_full_size() {
        let base = TestState::with_data(vec![(k(b"key"), b"value".to_vec())]);
        let mut buf = [0u8; 3];
        assert_eq!(base.load_var_into(&k(b"key"), &mut buf), Some(5));
        assert_eq!(&buf, b"val");
        assert_eq!(base.load_var_into(&k(b"missing"), &mut buf), None);
    }

    #[test]
    fn overlay_reads_through_to_base() {
        let base = TestState::with_data(vec![(k(b"key"), b"value".to_vec())]);
        let overlay = OverlayState::new(&base);
        assert_eq!(overlay.load_var(&k(b"key")), Some(b"value".to_vec()));
        assert_eq!(overlay.load_var(&k(b"missing")), None);
    }

    #[test]
    fn overlay_write_shadows_base() {
        let base = TestState::with_data(vec![(k(b"key"), b"old".to_vec())]);
        let mut overlay = OverlayState::new(&base);
        assert!(overlay.save_var(&k(b"key"), b"new"));
        assert_eq!(overlay.load_var(&k(b"key")), Some(b"new".to_vec()));
        assert_eq!(base.load_var(&k(b"key")), Some(b"old".to_vec()));
    }

    #[test]
    fn overlay_empty_save_deletes() {
        let base = TestState::with_data(vec![(k(b"key"), b"value".to_vec())]);
        let mut overlay = OverlayState::new(&base);
        assert!(overlay.save_var(&k(b"key"), &[]));
        assert_eq!(overlay.load_var(&k(b"key")), None);
        assert!(!overlay.save_var(&k(b"key"), &[]));
    }

    #[test]
    fn overlay_writes_apply_to_target() {
        let mut base = TestState::with_data(vec![(k(b"gone"), b"x".to_vec())]);
        let writes = {
            let mut overlay = OverlayState::new(&base);
            overlay.save_var(&k(b"a"), b"1");
            overlay.save_var(&k(b"gone"), &[]);
            overlay.into_writes()
        };
        assert_eq!(writes.len(), 2);

        apply_writes(&mut base, writes);
        assert_eq!(base.load_var(&k(b"a")), Some(b"1".to_vec()));
        assert_eq!(base.load_var(&k(b"gone")), None);
    }
}
