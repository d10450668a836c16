//! Core value types shared by the processor and the host.
//!
//! - `Hash`: 32-byte SHA3-256 digests, used for contract identities

pub mod hash;
