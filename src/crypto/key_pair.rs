//! Schnorr key pairs on secp256k1 and the pending signature set that
//! contracts fill through `add_sig`.

use crate::types::hash::Hash;
use crate::virtual_machine::errors::VMError;
use k256::schnorr::signature::{Signer, Verifier};
use k256::schnorr::{Signature, SigningKey, VerifyingKey};
use rand_core::OsRng;
use std::fmt;

/// Serialized public key length: SEC1 parity prefix plus 32-byte X coordinate.
pub const PUBKEY_LEN: usize = 33;

/// BIP-340 signature length.
pub const SIGNATURE_LEN: usize = 64;

/// Public key as contracts see it: 33 opaque bytes in compressed SEC1 layout.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PubKey(pub [u8; PUBKEY_LEN]);

impl PubKey {
    /// Builds a key from exactly [`PUBKEY_LEN`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; PUBKEY_LEN] = bytes.try_into().ok()?;
        Some(PubKey(arr))
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// The x-only part used by BIP-340; only even-Y (`0x02`) keys have one.
    fn x_only(&self) -> Option<&[u8]> {
        (self.0[0] == 0x02).then(|| &self.0[1..])
    }
}

impl fmt::Debug for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PubKey(")?;
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, ")")
    }
}

/// Private key for signing invocations.
#[derive(Clone)]
pub struct PrivateKey {
    key: SigningKey,
}

impl PrivateKey {
    /// Generates a new random private key using OS-provided entropy.
    pub fn new() -> Self {
        let mut rng = OsRng;
        Self {
            key: SigningKey::random(&mut rng),
        }
    }

    /// Creates a private key from raw bytes.
    ///
    /// Returns `None` if the bytes do not represent a valid scalar for secp256k1.
    pub fn from_bytes(bytes: &[u8; 32]) -> Option<Self> {
        SigningKey::from_bytes(bytes).ok().map(|key| Self { key })
    }

    /// Derives the public key. BIP-340 keys always have even Y.
    pub fn public_key(&self) -> PubKey {
        let mut out = [0u8; PUBKEY_LEN];
        out[0] = 0x02;
        out[1..].copy_from_slice(&self.key.verifying_key().to_bytes());
        PubKey(out)
    }

    /// Signs a message hash.
    pub fn sign(&self, msg: &Hash) -> [u8; SIGNATURE_LEN] {
        let sig: Signature = self.key.sign(msg.as_slice());
        sig.to_bytes()
    }
}

impl Default for PrivateKey {
    fn default() -> Self {
        Self::new()
    }
}

/// External signature scheme checking a collected key set against the
/// enclosing transaction.
pub trait SigVerifier {
    /// Returns `true` when `sig` authorizes `msg` for every key in `keys`.
    fn verify(&self, keys: &[PubKey], msg: &Hash, sig: &[u8]) -> bool;
}

/// Reference verifier: one BIP-340 signature per key, concatenated in the
/// order the keys were collected.
#[derive(Clone, Copy, Debug, Default)]
pub struct SchnorrVerifier;

impl SigVerifier for SchnorrVerifier {
    fn verify(&self, keys: &[PubKey], msg: &Hash, sig: &[u8]) -> bool {
        if sig.len() != keys.len() * SIGNATURE_LEN {
            return false;
        }
        keys.iter()
            .zip(sig.chunks_exact(SIGNATURE_LEN))
            .all(|(pk, chunk)| {
                let Some(Ok(vk)) = pk.x_only().map(VerifyingKey::from_bytes) else {
                    return false;
                };
                let Ok(signature) = Signature::try_from(chunk) else {
                    return false;
                };
                vk.verify(msg.as_slice(), &signature).is_ok()
            })
    }
}

/// Ordered public keys accumulated during one invocation.
///
/// Keys are only accepted while a signing context is open; [`verify`](Self::verify)
/// consumes them exactly once and closes the context.
#[derive(Clone, Debug, Default)]
pub struct SigCollector {
    keys: Vec<PubKey>,
    active: bool,
}

impl SigCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a signing context, discarding anything left from a previous one.
    pub fn begin(&mut self) {
        self.keys.clear();
        self.active = true;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Appends a key. Returns `false` outside a signing context.
    pub fn add(&mut self, pk: PubKey) -> bool {
        if !self.active {
            return false;
        }
        self.keys.push(pk);
        true
    }

    pub fn pending(&self) -> &[PubKey] {
        &self.keys
    }

    /// Checks the pending set against `sig` and closes the context.
    pub fn verify(
        &mut self,
        verifier: &dyn SigVerifier,
        msg: &Hash,
        sig: &[u8],
    ) -> Result<(), VMError> {
        self.active = false;
        let keys = std::mem::take(&mut self.keys);
        if verifier.verify(&keys, msg, sig) {
            Ok(())
        } else {
            Err(VMError::SignatureInvalid { keys: keys.len() })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg() -> Hash {
        Hash::digest(b"invocation")
    }

    #[test]
    fn test_sign_verify_success() {
        let key = PrivateKey::new();
        let sig = key.sign(&msg());
        assert!(SchnorrVerifier.verify(&[key.public_key()], &msg(), &sig));
    }

    #[test]
    fn test_verify_wrong_message_fails() {
        let key = PrivateKey::new();
        let sig = key.sign(&msg());
        assert!(!SchnorrVerifier.verify(
            &[key.public_key()],
            &Hash::digest(b"other"),
            &sig
        ));
    }

    #[test]
    fn test_verify_requires_one_signature_per_key() {
        let a = PrivateKey::new();
        let b = PrivateKey::new();
        let keys = [a.public_key(), b.public_key()];

        let mut sig = a.sign(&msg()).to_vec();
        assert!(!SchnorrVerifier.verify(&keys, &msg(), &sig));

        sig.extend_from_slice(&b.sign(&msg()));
        assert!(SchnorrVerifier.verify(&keys, &msg(), &sig));

        let swapped = [b.public_key(), a.public_key()];
        assert!(!SchnorrVerifier.verify(&swapped, &msg(), &sig));
    }

    #[test]
    fn test_verify_rejects_odd_prefix() {
        let key = PrivateKey::new();
        let sig = key.sign(&msg());
        for prefix in [0x03, 0x00, 0x04] {
            let mut pk = key.public_key();
            pk.0[0] = prefix;
            assert!(!SchnorrVerifier.verify(&[pk], &msg(), &sig));
        }
        assert!(SchnorrVerifier.verify(&[key.public_key()], &msg(), &sig));
    }

    #[test]
    fn test_empty_key_set_needs_empty_signature() {
        assert!(SchnorrVerifier.verify(&[], &msg(), &[]));
        assert!(!SchnorrVerifier.verify(&[], &msg(), &[0u8; SIGNATURE_LEN]));
    }

    #[test]
    fn collector_rejects_keys_outside_context() {
        let mut sigs = SigCollector::new();
        let pk = PrivateKey::new().public_key();
        assert!(!sigs.add(pk));
        sigs.begin();
        assert!(sigs.add(pk));
        assert_eq!(sigs.pending(), &[pk]);
    }

    #[test]
    fn collector_is_consumed_once() {
        let key = PrivateKey::new();
        let mut sigs = SigCollector::new();
        sigs.begin();
        assert!(sigs.add(key.public_key()));

        let sig = key.sign(&msg());
        sigs.verify(&SchnorrVerifier, &msg(), &sig).unwrap();
        assert!(!sigs.is_active());
        assert!(sigs.pending().is_empty());

        // The set is gone, so the same signature no longer matches.
        let err = sigs.verify(&SchnorrVerifier, &msg(), &sig).unwrap_err();
        assert!(matches!(err, VMError::SignatureInvalid { keys: 0 }));
    }

    #[test]
    fn pubkey_from_slice_requires_exact_length() {
        assert!(PubKey::from_slice(&[0u8; PUBKEY_LEN]).is_some());
        assert!(PubKey::from_slice(&[0u8; 32]).is_none());
    }
}
