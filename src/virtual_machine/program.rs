//! Bytecode module format, execution limits and content-addressed identities.
//!
//! A [`Module`] is the unit the processor loads per far call:
//!
//! ```text
//! version: u16 BE (= 1) | method count N: u16 BE (>= 2) | N x entry: u16 BE | instructions
//! ```
//!
//! Entries are absolute offsets into the module, header included.

use crate::types::hash::Hash;
use crate::virtual_machine::errors::VMError;
use std::sync::Arc;

/// Current module format version.
pub const MODULE_VERSION: u16 = 1;

/// Every module exposes at least a constructor and a destructor.
pub const METHODS_MIN: u16 = 2;

/// Method run when a contract is created.
pub const METHOD_CTOR: u16 = 0;

/// Method run when a contract is destroyed.
pub const METHOD_DTOR: u16 = 1;

/// Maximum number of simultaneously active far calls.
pub const FAR_CALL_DEPTH: usize = 32;

/// Size of the processor stack in bytes.
pub const STACK_SIZE: usize = 0x8000;

/// Maximum contract-supplied subkey length.
pub const VAR_KEY_SIZE: usize = 256;

/// Maximum stored variable size.
pub const VAR_SIZE: usize = 0x2000;

/// Maximum asset metadata size accepted by `asset_create`.
pub const ASSET_METADATA_MAX: usize = 1024;

/// Largest module whose every byte is reachable through a 16-bit offset.
pub const MODULE_SIZE_MAX: usize = u16::MAX as usize;

/// Identity of a deployed contract.
pub type ContractID = Hash;

/// Parsed module header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u16,
    /// Absolute entry offset of every method.
    pub methods: Vec<u16>,
}

impl Header {
    /// Serialized size of a header with `method_count` entries.
    pub const fn size(method_count: usize) -> usize {
        4 + 2 * method_count
    }

    /// Parses and validates the header at the start of `code`.
    pub fn parse(code: &[u8]) -> Result<Self, VMError> {
        let truncated = || VMError::TruncatedModule { len: code.len() };

        let version = read_u16(code, 0).ok_or_else(truncated)?;
        if version != MODULE_VERSION {
            return Err(VMError::BadVersion { version });
        }

        let count = read_u16(code, 2).ok_or_else(truncated)?;
        if count < METHODS_MIN {
            return Err(VMError::TooFewMethods {
                count,
                min: METHODS_MIN,
            });
        }

        let methods = (0..count as usize)
            .map(|i| read_u16(code, 4 + 2 * i).ok_or_else(truncated))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Header { version, methods })
    }

    /// Appends the serialized header to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(&(self.methods.len() as u16).to_be_bytes());
        for entry in &self.methods {
            out.extend_from_slice(&entry.to_be_bytes());
        }
    }
}

fn read_u16(code: &[u8], at: usize) -> Option<u16> {
    let bytes = code.get(at..at + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Immutable, validated module bytes shared between call frames.
#[derive(Debug, Clone)]
pub struct Module {
    bytes: Arc<[u8]>,
    header: Arc<Header>,
}

impl Module {
    /// Validates `code` and wraps it for execution.
    pub fn load(code: impl Into<Arc<[u8]>>) -> Result<Self, VMError> {
        let bytes: Arc<[u8]> = code.into();
        if bytes.len() > MODULE_SIZE_MAX {
            return Err(VMError::ModuleTooLarge { len: bytes.len() });
        }
        let header = Header::parse(&bytes)?;
        Ok(Self {
            bytes,
            header: Arc::new(header),
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn method_count(&self) -> u16 {
        self.header.methods.len() as u16
    }

    /// Entry offset of `method`.
    pub fn entry(&self, method: u16) -> Result<u16, VMError> {
        self.header
            .methods
            .get(method as usize)
            .copied()
            .ok_or(VMError::InvalidMethod {
                method,
                count: self.method_count(),
            })
    }
}

/// Derives the identity of a contract from its module and constructor arguments.
pub fn contract_id(code: &[u8], args: &[u8]) -> ContractID {
    let mut h = Hash::sha3();
    h.update_tag("bvm.cid");
    h.update_varint(code.len() as u64);
    h.update_varint(args.len() as u64);
    h.update(code);
    h.update(args);
    h.finalize()
}

/// Owner identity handed to the host when `cid` creates an asset.
pub fn asset_owner(cid: &ContractID, metadata: &[u8]) -> Hash {
    let mut h = Hash::sha3();
    h.update_tag("bvm.a.own");
    h.update(cid.as_slice());
    h.update(Hash::digest(metadata).as_slice());
    h.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module_bytes(version: u16, entries: &[u16], body: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        Header {
            version,
            methods: entries.to_vec(),
        }
        .encode(&mut out);
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn header_roundtrip() {
        let code = module_bytes(1, &[8, 9], &[0x4A, 0x4A]);
        let header = Header::parse(&code).unwrap();
        assert_eq!(header.methods, vec![8, 9]);
        assert_eq!(Header::size(2), 8);
    }

    #[test]
    fn rejects_bad_version() {
        let code = module_bytes(2, &[8, 9], &[0x4A, 0x4A]);
        assert!(matches!(
            Module::load(code),
            Err(VMError::BadVersion { version: 2 })
        ));
    }

    #[test]
    fn rejects_single_method() {
        let code = module_bytes(1, &[6], &[0x4A]);
        assert!(matches!(
            Module::load(code),
            Err(VMError::TooFewMethods { count: 1, .. })
        ));
    }

    #[test]
    fn rejects_truncated_table() {
        // Claims three methods but only carries one entry.
        let code = vec![0, 1, 0, 3, 0, 6];
        assert!(matches!(
            Module::load(code),
            Err(VMError::TruncatedModule { len: 6 })
        ));
        assert!(matches!(
            Module::load(vec![0u8]),
            Err(VMError::TruncatedModule { len: 1 })
        ));
    }

    #[test]
    fn entry_checks_method_index() {
        let module = Module::load(module_bytes(1, &[8, 9], &[0x4A, 0x4A])).unwrap();
        assert_eq!(module.entry(1).unwrap(), 9);
        assert!(matches!(
            module.entry(2),
            Err(VMError::InvalidMethod {
                method: 2,
                count: 2
            })
        ));
    }

    #[test]
    fn contract_id_depends_on_code_and_args() {
        let code = module_bytes(1, &[8, 9], &[0x4A, 0x4A]);
        let base = contract_id(&code, b"args");
        assert_eq!(base, contract_id(&code, b"args"));
        assert_ne!(base, contract_id(&code, b"argz"));

        let mut other = code.clone();
        other[8] = 0x4B;
        assert_ne!(base, contract_id(&other, b"args"));
    }

    #[test]
    fn contract_id_separates_code_from_args() {
        // Same concatenation, different split.
        assert_ne!(contract_id(b"ab", b"c"), contract_id(b"a", b"bc"));
    }

    #[test]
    fn asset_owner_binds_contract_and_metadata() {
        let cid = Hash::digest(b"cid");
        let owner = asset_owner(&cid, b"meta");
        assert_ne!(owner, asset_owner(&cid, b"other"));
        assert_ne!(owner, asset_owner(&Hash::digest(b"cid2"), b"meta"));
    }
}
