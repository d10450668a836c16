//! 32-byte SHA3-256 hash type and the incremental builder used for
//! content-addressed identities.

use sha3::{Digest, Sha3_256};
use std::fmt;

/// Hash length in bytes.
pub const HASH_LEN: usize = 32;

/// Fixed-size 32-byte hash.
///
/// Contract identities and asset owners are hashes, so this type is `Copy`
/// and ordered byte-wise.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Hash, Ord, PartialOrd)]
pub struct Hash(pub [u8; HASH_LEN]);

impl Hash {
    /// Creates a zero-valued hash (all bytes are 0x00).
    pub const fn zero() -> Hash {
        Hash([0u8; HASH_LEN])
    }

    /// Returns the hash as a byte slice.
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Builds a hash from exactly [`HASH_LEN`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Hash> {
        let arr: [u8; HASH_LEN] = bytes.try_into().ok()?;
        Some(Hash(arr))
    }

    /// Creates a new SHA3-256 hash builder for incremental hashing.
    pub fn sha3() -> HashBuilder {
        HashBuilder::new()
    }

    /// One-shot hash of a byte slice.
    pub fn digest(data: &[u8]) -> Hash {
        let mut h = Hash::sha3();
        h.update(data);
        h.finalize()
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Incremental SHA3-256 hash builder.
pub struct HashBuilder {
    hasher: Sha3_256,
}

impl HashBuilder {
    /// Creates a new hash builder with empty state.
    pub fn new() -> Self {
        Self {
            hasher: Sha3_256::new(),
        }
    }

    /// Feeds raw bytes into the hash computation.
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Feeds a domain tag followed by its NUL terminator.
    pub fn update_tag(&mut self, tag: &str) {
        self.hasher.update(tag.as_bytes());
        self.hasher.update([0u8]);
    }

    /// Feeds an unsigned integer as little-endian bytes, stopping once the
    /// remaining value is zero, then a zero terminator.
    ///
    /// Zero itself is therefore a single `0x00` byte.
    pub fn update_varint(&mut self, mut value: u64) {
        while value != 0 {
            self.hasher.update([value as u8]);
            value >>= 8;
        }
        self.hasher.update([0u8]);
    }

    /// Consumes the builder and returns the final hash.
    pub fn finalize(self) -> Hash {
        Hash(self.hasher.finalize().into())
    }
}

impl Default for HashBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_slice_requires_exact_length() {
        let h = Hash::digest(b"test");
        assert_eq!(Hash::from_slice(h.as_slice()), Some(h));
        assert_eq!(Hash::from_slice(&[0u8; 31]), None);
        assert_eq!(Hash::from_slice(&[0u8; 33]), None);
    }

    #[test]
    fn display_is_lowercase_hex() {
        let mut bytes = [0u8; HASH_LEN];
        bytes[0] = 0xAB;
        bytes[31] = 0x01;
        let s = Hash(bytes).to_string();
        assert_eq!(s.len(), 64);
        assert!(s.starts_with("ab00"));
        assert!(s.ends_with("01"));
    }

    #[test]
    fn varint_encoding_stops_at_zero() {
        let mut a = Hash::sha3();
        a.update_varint(0x0102);
        let mut b = Hash::sha3();
        b.update(&[0x02, 0x01, 0x00]);
        assert_eq!(a.finalize(), b.finalize());

        let mut zero = Hash::sha3();
        zero.update_varint(0);
        assert_eq!(zero.finalize(), Hash::digest(&[0]));
    }

    #[test]
    fn tag_includes_terminator() {
        let mut a = Hash::sha3();
        a.update_tag("bvm");
        assert_eq!(a.finalize(), Hash::digest(b"bvm\0"));
    }
}
