//! Execution and assembly error types.
//!
//! [`VMError`] is the single fault channel of the processor: any variant
//! aborts the whole top-level invocation. [`AsmError`] is the build-time
//! taxonomy of the compiler.

use crate::types::hash::Hash;
use bvm_derive::{Error, Fault};

/// Coarse classification of an execution fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Malformed module, bad method index or out-of-range instruction pointer.
    Structural,
    /// Stack, call depth or key/value size limits exceeded.
    ResourceLimit,
    /// Unknown opcode, bad padding bits or an operand the opcode cannot use.
    IllegalInstruction,
    /// Storage or an extension point refused the request.
    HostRejection,
    /// The contract executed `fail`.
    ExplicitAbort,
}

/// Errors that abort contract execution.
#[derive(Debug, Error, Fault)]
pub enum VMError {
    #[error("unsupported module version {version}")]
    #[fault(Structural)]
    BadVersion { version: u16 },

    #[error("module truncated: {len} bytes cannot hold its header")]
    #[fault(Structural)]
    TruncatedModule { len: usize },

    #[error("module declares {count} methods, at least {min} required")]
    #[fault(Structural)]
    TooFewMethods { count: u16, min: u16 },

    #[error("module of {len} bytes exceeds the addressable range")]
    #[fault(Structural)]
    ModuleTooLarge { len: usize },

    #[error("method {method} out of range (module has {count})")]
    #[fault(Structural)]
    InvalidMethod { method: u16, count: u16 },

    #[error("instruction pointer {ip} outside module of {len} bytes")]
    #[fault(Structural)]
    InvalidIP { ip: usize, len: usize },

    #[error("contract {cid} not found")]
    #[fault(Structural)]
    ContractNotFound { cid: Hash },

    #[error("no active call frame")]
    #[fault(Structural)]
    NoActiveFrame,

    #[error("arguments of {size} bytes exceed stack capacity {max}")]
    #[fault(ResourceLimit)]
    ArgsTooLarge { size: usize, max: usize },

    #[error("stack access at {offset} of {size} bytes out of range")]
    #[fault(ResourceLimit)]
    StackOverflow { offset: usize, size: usize },

    #[error("stack underflow: need {need} bytes below sp {sp}")]
    #[fault(ResourceLimit)]
    StackUnderflow { sp: usize, need: usize },

    #[error("far call depth limit {max} exceeded")]
    #[fault(ResourceLimit)]
    CallDepthExceeded { max: usize },

    #[error("variable key of {size} bytes exceeds {max}")]
    #[fault(ResourceLimit)]
    KeyTooLarge { size: usize, max: usize },

    #[error("variable of {size} bytes exceeds {max}")]
    #[fault(ResourceLimit)]
    VarTooLarge { size: usize, max: usize },

    #[error("asset metadata of {size} bytes exceeds {max}")]
    #[fault(ResourceLimit)]
    MetadataTooLarge { size: usize, max: usize },

    #[error("invalid instruction {opcode:#04x} at offset {offset}")]
    #[fault(IllegalInstruction)]
    InvalidInstruction { opcode: u8, offset: usize },

    #[error("nonzero padding bits in instruction at offset {offset}")]
    #[fault(IllegalInstruction)]
    NonZeroPadding { offset: usize },

    #[error("instruction at offset {offset} runs past the module end")]
    #[fault(IllegalInstruction)]
    TruncatedInstruction { offset: usize },

    #[error("write to read-only module memory at {offset}")]
    #[fault(IllegalInstruction)]
    WriteToCode { offset: usize },

    #[error("module access at {offset} of {size} bytes out of range")]
    #[fault(IllegalInstruction)]
    CodeOutOfBounds { offset: usize, size: usize },

    #[error("sort key {key_pos}+{key_width} does not fit element width {width}")]
    #[fault(IllegalInstruction)]
    BadSortLayout {
        width: usize,
        key_pos: usize,
        key_width: usize,
    },

    #[error("stored variable of {size} bytes does not fit buffer of {capacity}")]
    #[fault(HostRejection)]
    VarBufferTooSmall { size: usize, capacity: usize },

    #[error("host rejected {operation}")]
    #[fault(HostRejection)]
    HostRejected { operation: &'static str },

    #[error("contract {cid} already exists")]
    #[fault(HostRejection)]
    ContractExists { cid: Hash },

    #[error("signature check failed for {keys} pending keys")]
    #[fault(HostRejection)]
    SignatureInvalid { keys: usize },

    #[error("contract aborted at offset {offset}")]
    #[fault(ExplicitAbort)]
    Aborted { offset: usize },
}

/// Errors raised while compiling assembly source.
///
/// Line and column numbers are 1-based.
#[derive(Debug, Error)]
pub enum AsmError {
    #[error("unknown instruction `{name}`")]
    UnknownMnemonic {
        line: usize,
        column: usize,
        name: String,
    },

    #[error("{message}")]
    Syntax {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("literal `{token}` does not fit {width} bytes")]
    LiteralOverflow {
        line: usize,
        column: usize,
        token: String,
        width: usize,
    },

    #[error("`{mnemonic}` takes {expected} operands, got {actual}")]
    ArityMismatch {
        line: usize,
        column: usize,
        mnemonic: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("duplicate label `{label}`")]
    DuplicateLabel {
        line: usize,
        column: usize,
        label: String,
    },

    #[error("undefined label `{label}`")]
    UndefinedLabel {
        line: usize,
        column: usize,
        label: String,
    },

    #[error("module defines {found} methods, at least {min} required")]
    TooFewMethods { found: usize, min: usize },

    #[error("module of {size} bytes exceeds the addressable range")]
    CodeTooLarge { size: usize },

    #[error("io error on {path}: {source}")]
    Io { path: String, source: String },
}

impl AsmError {
    /// Source location of line-scoped errors.
    pub fn location(&self) -> Option<(usize, usize)> {
        match self {
            AsmError::UnknownMnemonic { line, column, .. }
            | AsmError::Syntax { line, column, .. }
            | AsmError::LiteralOverflow { line, column, .. }
            | AsmError::ArityMismatch { line, column, .. }
            | AsmError::DuplicateLabel { line, column, .. }
            | AsmError::UndefinedLabel { line, column, .. } => Some((*line, *column)),
            AsmError::TooFewMethods { .. } | AsmError::CodeTooLarge { .. } | AsmError::Io { .. } => {
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_uses_named_fields() {
        let err = VMError::InvalidInstruction {
            opcode: 0xFF,
            offset: 12,
        };
        assert_eq!(err.to_string(), "invalid instruction 0xff at offset 12");
    }

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(VMError::BadVersion { version: 2 }.kind(), FaultKind::Structural);
        assert_eq!(
            VMError::CallDepthExceeded { max: 32 }.kind(),
            FaultKind::ResourceLimit
        );
        assert_eq!(
            VMError::NonZeroPadding { offset: 0 }.kind(),
            FaultKind::IllegalInstruction
        );
        assert_eq!(
            VMError::HostRejected {
                operation: "funds_lock"
            }
            .kind(),
            FaultKind::HostRejection
        );
        assert_eq!(VMError::Aborted { offset: 7 }.kind(), FaultKind::ExplicitAbort);
    }

    #[test]
    fn asm_error_location() {
        let err = AsmError::UndefinedLabel {
            line: 3,
            column: 9,
            label: "loop".into(),
        };
        assert_eq!(err.location(), Some((3, 9)));
        assert_eq!(err.to_string(), "undefined label `loop`");
        assert_eq!(AsmError::CodeTooLarge { size: 70000 }.location(), None);
    }
}
