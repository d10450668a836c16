//! Instruction Set Architecture (ISA) definitions.
//!
//! The [`for_each_instruction!`](crate::for_each_instruction) macro holds the
//! canonical instruction list and invokes a callback macro for code
//! generation, so the processor, the assembler and the static ISA check all
//! derive from one table.
//!
//! This module generates:
//! - The [`Instruction`] enum with opcode mappings
//! - `TryFrom<u8>` for decoding opcodes
//! - Mnemonic lookup in both directions and the per-opcode operand shapes
//!
//! # Bytecode Format
//!
//! An instruction is one opcode byte followed by its operands in table order.
//! Each operand is preceded by addressing-mode bits packed LSB-first into
//! bit bytes that are interleaved with the operand bytes (see
//! [`operand`](super::operand)):
//! - `Ptr`: 2-byte big-endian offset, segment bit, indirection bit and, when
//!   indirect, a second segment bit for the target
//! - `ImmN`: indirection bit, then either N inline big-endian bytes or a
//!   2-byte offset plus segment bit locating them

use crate::virtual_machine::errors::VMError;

/// Invokes a callback macro with the complete instruction definition list.
#[macro_export]
macro_rules! for_each_instruction {
    ($callback:ident) => {
        $callback! {
            // =========================
            // Moves and bitwise logic
            // =========================
            /// mov dst, src, size ; copy size bytes
            Mov = 0x01, "mov" => [dst: Ptr, src: Ptr, size: Imm2],
            /// mov1 dst, imm ; store 1-byte immediate
            Mov1 = 0x02, "mov1" => [dst: Ptr, src: Imm1],
            /// mov2 dst, imm ; store 2-byte immediate
            Mov2 = 0x03, "mov2" => [dst: Ptr, src: Imm2],
            /// mov4 dst, imm ; store 4-byte immediate
            Mov4 = 0x04, "mov4" => [dst: Ptr, src: Imm4],
            /// mov8 dst, imm ; store 8-byte immediate
            Mov8 = 0x05, "mov8" => [dst: Ptr, src: Imm8],
            /// xor dst, src, size ; dst ^= src
            Xor = 0x08, "xor" => [dst: Ptr, src: Ptr, size: Imm2],
            Xor1 = 0x09, "xor1" => [dst: Ptr, src: Imm1],
            Xor2 = 0x0A, "xor2" => [dst: Ptr, src: Imm2],
            Xor4 = 0x0B, "xor4" => [dst: Ptr, src: Imm4],
            Xor8 = 0x0C, "xor8" => [dst: Ptr, src: Imm8],
            /// or dst, src, size ; dst |= src
            Or = 0x10, "or" => [dst: Ptr, src: Ptr, size: Imm2],
            Or1 = 0x11, "or1" => [dst: Ptr, src: Imm1],
            Or2 = 0x12, "or2" => [dst: Ptr, src: Imm2],
            Or4 = 0x13, "or4" => [dst: Ptr, src: Imm4],
            Or8 = 0x14, "or8" => [dst: Ptr, src: Imm8],
            /// and dst, src, size ; dst &= src
            And = 0x18, "and" => [dst: Ptr, src: Ptr, size: Imm2],
            And1 = 0x19, "and1" => [dst: Ptr, src: Imm1],
            And2 = 0x1A, "and2" => [dst: Ptr, src: Imm2],
            And4 = 0x1B, "and4" => [dst: Ptr, src: Imm4],
            And8 = 0x1C, "and8" => [dst: Ptr, src: Imm8],
            // =========================
            // Arithmetic
            // =========================
            /// add dst, src, size ; dst += src, flag = carry out
            Add = 0x20, "add" => [dst: Ptr, src: Ptr, size: Imm2],
            Add1 = 0x21, "add1" => [dst: Ptr, src: Imm1],
            Add2 = 0x22, "add2" => [dst: Ptr, src: Imm2],
            Add4 = 0x23, "add4" => [dst: Ptr, src: Imm4],
            Add8 = 0x24, "add8" => [dst: Ptr, src: Imm8],
            /// sub dst, src, size ; dst -= src, flag = -1 on borrow
            Sub = 0x28, "sub" => [dst: Ptr, src: Ptr, size: Imm2],
            Sub1 = 0x29, "sub1" => [dst: Ptr, src: Imm1],
            Sub2 = 0x2A, "sub2" => [dst: Ptr, src: Imm2],
            Sub4 = 0x2B, "sub4" => [dst: Ptr, src: Imm4],
            Sub8 = 0x2C, "sub8" => [dst: Ptr, src: Imm8],
            /// inc dst, size ; dst += 1, flag = carry out
            Inc = 0x30, "inc" => [dst: Ptr, size: Imm2],
            /// neg dst, size ; dst = -dst (two's complement)
            Neg = 0x31, "neg" => [dst: Ptr, size: Imm2],
            // =========================
            // Compare
            // =========================
            /// cmp a, b, size ; flag = sign of lexicographic a <=> b
            Cmp = 0x38, "cmp" => [a: Ptr, b: Ptr, size: Imm2],
            Cmp1 = 0x39, "cmp1" => [a: Ptr, b: Imm1],
            Cmp2 = 0x3A, "cmp2" => [a: Ptr, b: Imm2],
            Cmp4 = 0x3B, "cmp4" => [a: Ptr, b: Imm4],
            Cmp8 = 0x3C, "cmp8" => [a: Ptr, b: Imm8],
            // =========================
            // Control Flow
            // =========================
            /// jmp addr ; unconditional
            Jmp = 0x40, "jmp" => [addr: Imm2],
            /// jz addr ; if flag == 0
            Jz = 0x41, "jz" => [addr: Imm2],
            /// jnz addr ; if flag != 0
            Jnz = 0x42, "jnz" => [addr: Imm2],
            /// jg addr ; if flag > 0
            Jg = 0x43, "jg" => [addr: Imm2],
            /// jb addr ; if flag < 0
            Jb = 0x44, "jb" => [addr: Imm2],
            /// jgz addr ; if flag >= 0
            Jgz = 0x45, "jgz" => [addr: Imm2],
            /// jbz addr ; if flag <= 0
            Jbz = 0x46, "jbz" => [addr: Imm2],
            /// call addr, frame ; local call, callee frame starts frame bytes above sp
            Call = 0x48, "call" => [addr: Imm2, frame: Imm2],
            /// call_far cid, method, frame ; call a method of another contract
            CallFar = 0x49, "call_far" => [cid: Ptr, method: Imm2, frame: Imm2],
            /// ret ; pop the in-stack frame
            Ret = 0x4A, "ret" => [],
            /// fail ; abort the invocation
            Fail = 0x4B, "fail" => [],
            // =========================
            // Storage
            // =========================
            /// load_var dst, dst_size, key, key_size ; flag = 1 if found
            LoadVar = 0x50, "load_var" => [dst: Ptr, dst_size: Imm2, key: Ptr, key_size: Imm2],
            /// save_var src, src_size, key, key_size ; size 0 deletes, flag = 1 if it existed
            SaveVar = 0x51, "save_var" => [src: Ptr, src_size: Imm2, key: Ptr, key_size: Imm2],
            // =========================
            // Authorization
            // =========================
            /// add_sig pk ; require a signature by the 33-byte key at pk
            AddSig = 0x58, "add_sig" => [pk: Ptr],
            // =========================
            // Custody and assets
            // =========================
            /// funds_lock amount, aid
            FundsLock = 0x60, "funds_lock" => [amount: Imm8, aid: Imm4],
            /// funds_unlock amount, aid
            FundsUnlock = 0x61, "funds_unlock" => [amount: Imm8, aid: Imm4],
            /// ref_add cid
            RefAdd = 0x62, "ref_add" => [cid: Ptr],
            /// ref_release cid
            RefRelease = 0x63, "ref_release" => [cid: Ptr],
            /// asset_create aid, meta, meta_size ; writes the new asset id, flag = 1 on success
            AssetCreate = 0x64, "asset_create" => [aid: Ptr, meta: Ptr, meta_size: Imm2],
            /// asset_emit aid, amount, burn
            AssetEmit = 0x65, "asset_emit" => [aid: Imm4, amount: Imm8, burn: Imm1],
            /// asset_destroy aid
            AssetDestroy = 0x66, "asset_destroy" => [aid: Imm4],
            // =========================
            // Misc
            // =========================
            /// sort arr, count, width, key_pos, key_width ; stable in-place sort
            Sort = 0x70, "sort" => [arr: Ptr, count: Imm2, width: Imm2, key_pos: Imm2, key_width: Imm2],
        }
    };
}

/// Operand shape as seen by the encoder and decoder.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OperandKind {
    /// Memory operand (stack or module code, optionally indirect).
    Ptr,
    Imm1,
    Imm2,
    Imm4,
    Imm8,
}

impl OperandKind {
    /// Byte width of an immediate, `None` for pointers.
    pub const fn width(&self) -> Option<usize> {
        match self {
            OperandKind::Ptr => None,
            OperandKind::Imm1 => Some(1),
            OperandKind::Imm2 => Some(2),
            OperandKind::Imm4 => Some(4),
            OperandKind::Imm8 => Some(8),
        }
    }
}

#[macro_export]
macro_rules! define_instructions {
    (
        $(
            $(#[$doc:meta])*
            $name:ident = $opcode:expr, $mnemonic:literal => [
                $( $field:ident : $kind:ident ),* $(,)?
            ]
        ),* $(,)?
    ) => {
        #[derive(Copy, Clone, Debug, Eq, PartialEq)]
        pub enum Instruction {
            $(
                $(#[$doc])*
                $name = $opcode,
            )*
        }

        impl TryFrom<u8> for Instruction {
            type Error = VMError;

            fn try_from(value: u8) -> Result<Self, Self::Error> {
                match value {
                    $( $opcode => Ok(Instruction::$name), )*
                    _ => Err(VMError::InvalidInstruction {
                        opcode: value,
                        offset: 0,
                    }),
                }
            }
        }

        impl Instruction {
            /// Every instruction, in table order.
            pub const ALL: &'static [Instruction] = &[ $( Instruction::$name, )* ];

            /// Returns the assembly mnemonic for this instruction.
            pub const fn mnemonic(&self) -> &'static str {
                match self {
                    $( Instruction::$name => $mnemonic, )*
                }
            }

            /// Looks an instruction up by its assembly mnemonic.
            pub fn from_mnemonic(name: &str) -> Option<Instruction> {
                match name {
                    $( $mnemonic => Some(Instruction::$name), )*
                    _ => None,
                }
            }

            /// Operand shapes in encoding order.
            pub const fn operands(&self) -> &'static [OperandKind] {
                match self {
                    $( Instruction::$name => &[ $( OperandKind::$kind ),* ], )*
                }
            }
        }
    };
}

for_each_instruction!(define_instructions);
