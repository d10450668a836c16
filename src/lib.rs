//! Beam virtual machine.
//!
//! Provides the contract processor, its assembler, storage backends and the
//! cryptographic primitives contracts rely on.

pub mod crypto;
pub mod storage;
pub mod types;
pub mod utils;
pub mod virtual_machine;
