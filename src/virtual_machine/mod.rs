//! Bytecode virtual machine for contract execution.
//!
//! Contracts are modules of bytecode for a stack machine. A module starts
//! with a header listing method entry points; method 0 constructs a
//! contract, method 1 destroys it, the rest are the contract's own API.
//!
//! # Architecture
//!
//! - **Stack**: one fixed-size byte stack per [`vm::Processor`], addressed
//!   relative to `sp`; the running module's bytes are readable as a second segment
//! - **Frames**: local `call`s and far calls into other contracts share the
//!   stack; far calls are bounded by [`program::FAR_CALL_DEPTH`]
//! - **Storage**: variables are keyed by the running contract's id, so
//!   contracts only reach their own state
//! - **Host**: signatures, funds custody, references and assets are
//!   delegated to a [`host::Host`]
//!
//! # Modules
//!
//! - [`assembler`]: Assembly parsing, diagnostics and module generation
//! - [`contract`]: Deploy, invoke and destroy helpers
//! - [`errors`]: Assembly and execution error types
//! - [`host`]: Extension points the processor calls into
//! - [`isa`]: Instruction set definition and opcode mappings
//! - [`operand`]: Bit-packed operand encoding/decoding
//! - [`program`]: Module format, limits and contract identity
//! - [`state`]: Variable keys, storage trait and overlay state
//! - [`vm`]: The processor

pub mod assembler;
pub mod contract;
pub mod errors;
pub mod host;
pub mod isa;
#[cfg(test)]
mod isa_static_check;
pub mod operand;
pub mod program;
pub mod state;
pub mod vm;
