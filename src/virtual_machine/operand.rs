//! Bit-packed operand encoding shared by the assembler and the processor.
//!
//! Addressing-mode bits are packed LSB-first into *bit bytes*. A bit byte
//! is inserted into the stream at the point its first bit is needed, so it
//! sits between operand bytes rather than in a prefix. Every instruction
//! starts with a fresh bit byte and its unused bits must be zero.
//!
//! | operand  | layout                                                                 |
//! |----------|------------------------------------------------------------------------|
//! | `Ptr`    | offset (2 BE), segment bit, indirect bit, [target segment bit]         |
//! | `ImmN`   | indirect bit, then N BE bytes or offset (2 BE) + segment bit           |
//!
//! A segment bit of 1 selects module code, 0 selects the stack.

use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::isa::OperandKind;

/// Memory segment an offset refers to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Segment {
    /// Processor stack, offsets relative to `sp`.
    Stack,
    /// Current module bytes, read-only.
    Code,
}

impl Segment {
    fn from_bit(bit: bool) -> Self {
        if bit { Segment::Code } else { Segment::Stack }
    }

    fn bit(self) -> bool {
        self == Segment::Code
    }

    pub fn from_letter(c: char) -> Option<Self> {
        match c {
            's' => Some(Segment::Stack),
            'd' => Some(Segment::Code),
            _ => None,
        }
    }
}

/// Pointer operand as encoded: an offset into `segment`, optionally
/// dereferenced once into the `deref` segment.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PtrOperand {
    pub offset: u16,
    pub segment: Segment,
    pub deref: Option<Segment>,
}

impl PtrOperand {
    pub const fn direct(segment: Segment, offset: u16) -> Self {
        Self {
            offset,
            segment,
            deref: None,
        }
    }

    /// A pointer whose 2-byte target offset is stored at `holder`/`offset`.
    pub const fn indirect(target: Segment, holder: Segment, offset: u16) -> Self {
        Self {
            offset,
            segment: holder,
            deref: Some(target),
        }
    }
}

/// Fixed-width immediate, either inline or read from memory.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ImmOperand<const N: usize> {
    Value([u8; N]),
    Indirect { offset: u16, segment: Segment },
}

/// Width-erased operand, used by the assembler and for inspection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operand {
    Ptr(PtrOperand),
    Imm(Vec<u8>),
    ImmIndirect { offset: u16, segment: Segment },
}

impl<const N: usize> From<ImmOperand<N>> for Operand {
    fn from(imm: ImmOperand<N>) -> Self {
        match imm {
            ImmOperand::Value(bytes) => Operand::Imm(bytes.to_vec()),
            ImmOperand::Indirect { offset, segment } => Operand::ImmIndirect { offset, segment },
        }
    }
}

/// Encoder producing the instruction stream.
#[derive(Debug, Default)]
pub struct OperandWriter {
    out: Vec<u8>,
    /// Position of the current bit byte.
    bit_pos: usize,
    /// Bits consumed in the current bit byte; 0 or 8 means a new one is needed.
    bits: u8,
}

impl OperandWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.out.len()
    }

    pub fn is_empty(&self) -> bool {
        self.out.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.out
    }

    /// Mutable access for patching label references after the fact.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.out
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.out
    }

    /// Starts a new instruction. Pending bits stay in their byte.
    pub fn begin_instruction(&mut self, opcode: u8) {
        self.bits = 0;
        self.out.push(opcode);
    }

    fn push_bit(&mut self, bit: bool) {
        if self.bits == 0 || self.bits == 8 {
            self.bit_pos = self.out.len();
            self.out.push(0);
            self.bits = 0;
        }
        self.out[self.bit_pos] |= (bit as u8) << self.bits;
        self.bits += 1;
    }

    fn push_location(&mut self, offset: u16, segment: Segment) {
        self.out.extend_from_slice(&offset.to_be_bytes());
        self.push_bit(segment.bit());
    }

    pub fn write_ptr(&mut self, ptr: &PtrOperand) {
        self.push_location(ptr.offset, ptr.segment);
        self.push_bit(ptr.deref.is_some());
        if let Some(target) = ptr.deref {
            self.push_bit(target.bit());
        }
    }

    /// Writes an inline immediate and returns where its bytes start.
    pub fn write_imm(&mut self, value: &[u8]) -> usize {
        self.push_bit(false);
        let at = self.out.len();
        self.out.extend_from_slice(value);
        at
    }

    /// Writes an indirect immediate and returns where its offset starts.
    pub fn write_imm_indirect(&mut self, offset: u16, segment: Segment) -> usize {
        self.push_bit(true);
        let at = self.out.len();
        self.push_location(offset, segment);
        at
    }

    /// Writes any operand; returns the position of its leading payload byte.
    pub fn write_operand(&mut self, operand: &Operand) -> usize {
        match operand {
            Operand::Ptr(ptr) => {
                let at = self.out.len();
                self.write_ptr(ptr);
                at
            }
            Operand::Imm(value) => self.write_imm(value),
            Operand::ImmIndirect { offset, segment } => self.write_imm_indirect(*offset, *segment),
        }
    }
}

/// Decoder walking one instruction's operands.
#[derive(Debug)]
pub struct OperandReader<'a> {
    code: &'a [u8],
    /// Offset of the instruction being decoded, for diagnostics.
    start: usize,
    pos: usize,
    /// Bits left in `value`.
    bits: u8,
    value: u8,
}

impl<'a> OperandReader<'a> {
    /// Starts decoding operands at `pos`; `start` is the opcode offset.
    pub fn new(code: &'a [u8], start: usize, pos: usize) -> Self {
        Self {
            code,
            start,
            pos,
            bits: 0,
            value: 0,
        }
    }

    fn read_byte(&mut self) -> Result<u8, VMError> {
        let byte = *self
            .code
            .get(self.pos)
            .ok_or(VMError::TruncatedInstruction { offset: self.start })?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_bytes<const N: usize>(&mut self) -> Result<[u8; N], VMError> {
        let end = self.pos + N;
        let slice = self
            .code
            .get(self.pos..end)
            .ok_or(VMError::TruncatedInstruction { offset: self.start })?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        self.pos = end;
        Ok(out)
    }

    fn read_bit(&mut self) -> Result<bool, VMError> {
        if self.bits == 0 {
            self.value = self.read_byte()?;
            self.bits = 8;
        }
        self.bits -= 1;
        let bit = self.value & 1 != 0;
        self.value >>= 1;
        Ok(bit)
    }

    fn read_location(&mut self) -> Result<(u16, Segment), VMError> {
        let offset = u16::from_be_bytes(self.read_bytes::<2>()?);
        let segment = Segment::from_bit(self.read_bit()?);
        Ok((offset, segment))
    }

    pub fn read_ptr(&mut self) -> Result<PtrOperand, VMError> {
        let (offset, segment) = self.read_location()?;
        let deref = if self.read_bit()? {
            Some(Segment::from_bit(self.read_bit()?))
        } else {
            None
        };
        Ok(PtrOperand {
            offset,
            segment,
            deref,
        })
    }

    pub fn read_imm<const N: usize>(&mut self) -> Result<ImmOperand<N>, VMError> {
        if self.read_bit()? {
            let (offset, segment) = self.read_location()?;
            Ok(ImmOperand::Indirect { offset, segment })
        } else {
            Ok(ImmOperand::Value(self.read_bytes::<N>()?))
        }
    }

    pub fn read_operand(&mut self, kind: OperandKind) -> Result<Operand, VMError> {
        Ok(match kind {
            OperandKind::Ptr => Operand::Ptr(self.read_ptr()?),
            OperandKind::Imm1 => self.read_imm::<1>()?.into(),
            OperandKind::Imm2 => self.read_imm::<2>()?.into(),
            OperandKind::Imm4 => self.read_imm::<4>()?.into(),
            OperandKind::Imm8 => self.read_imm::<8>()?.into(),
        })
    }

    /// Ends the instruction, returning the offset of the next one.
    ///
    /// Unused bits of the last bit byte must be zero.
    pub fn finish(&self) -> Result<usize, VMError> {
        if self.value != 0 {
            return Err(VMError::NonZeroPadding { offset: self.start });
        }
        Ok(self.pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(bytes: &[u8], kinds: &[OperandKind]) -> (Vec<Operand>, usize) {
        let mut reader = OperandReader::new(bytes, 0, 1);
        let ops = kinds
            .iter()
            .map(|k| reader.read_operand(*k).unwrap())
            .collect();
        (ops, reader.finish().unwrap())
    }

    #[test]
    fn direct_stack_pointer_layout() {
        let mut w = OperandWriter::new();
        w.begin_instruction(0x58);
        w.write_ptr(&PtrOperand::direct(Segment::Stack, 0x0102));
        // opcode, offset, then the bit byte holding segment=0 and indirect=0
        assert_eq!(w.bytes(), &[0x58, 0x01, 0x02, 0x00]);
    }

    #[test]
    fn indirect_pointer_layout() {
        let mut w = OperandWriter::new();
        w.begin_instruction(0x58);
        w.write_ptr(&PtrOperand::indirect(Segment::Code, Segment::Stack, 8));
        // bits: holder=stack(0), indirect(1), target=code(1) -> 0b110
        assert_eq!(w.bytes(), &[0x58, 0x00, 0x08, 0b110]);
    }

    #[test]
    fn bit_byte_shared_across_operands() {
        let mut w = OperandWriter::new();
        w.begin_instruction(0x01);
        w.write_ptr(&PtrOperand::direct(Segment::Code, 4));
        w.write_ptr(&PtrOperand::direct(Segment::Stack, 5));
        w.write_imm(&[0x00, 0x03]);
        // One bit byte after the first offset carries all five bits.
        assert_eq!(
            w.bytes(),
            &[0x01, 0x00, 0x04, 0b00001, 0x00, 0x05, 0x00, 0x03]
        );
    }

    #[test]
    fn ninth_bit_opens_new_byte() {
        let mut w = OperandWriter::new();
        w.begin_instruction(0x70);
        for _ in 0..4 {
            w.write_imm_indirect(1, Segment::Code); // 2 bits each
        }
        let before = w.len();
        w.write_imm(&[7]);
        // 8 bits used, so the inline immediate needs a fresh bit byte first.
        assert_eq!(w.len(), before + 2);
        assert_eq!(w.bytes()[before], 0);
        assert_eq!(w.bytes()[before + 1], 7);
    }

    #[test]
    fn indirect_immediate_position_skips_new_bit_byte() {
        let mut w = OperandWriter::new();
        w.begin_instruction(0x01);
        let ptr = PtrOperand::indirect(Segment::Stack, Segment::Stack, 1);
        w.write_ptr(&ptr);
        w.write_ptr(&ptr);
        // 6 bits used; the indirect bit is the 7th, the segment bit the 9th
        let at = w.write_operand(&Operand::ImmIndirect {
            offset: 0xABCD,
            segment: Segment::Code,
        });
        assert_eq!(at, 6);
        assert_eq!(&w.bytes()[6..], &[0xAB, 0xCD, 0b1]);
        // deref bits of both pointers, then the indirect bit
        assert_eq!(w.bytes()[3], 0b0101_0010);
    }

    #[test]
    fn roundtrip_mixed_operands() {
        let ops = vec![
            Operand::Ptr(PtrOperand::indirect(Segment::Stack, Segment::Code, 0xFFFC)),
            Operand::Imm(vec![1, 2, 3, 4, 5, 6, 7, 8]),
            Operand::ImmIndirect {
                offset: 12,
                segment: Segment::Stack,
            },
            Operand::Ptr(PtrOperand::direct(Segment::Code, 9)),
            Operand::Imm(vec![0xAA]),
        ];
        let kinds = [
            OperandKind::Ptr,
            OperandKind::Imm8,
            OperandKind::Imm2,
            OperandKind::Ptr,
            OperandKind::Imm1,
        ];

        let mut w = OperandWriter::new();
        w.begin_instruction(0xEE);
        for op in &ops {
            w.write_operand(op);
        }
        let bytes = w.into_bytes();

        let (decoded, next) = decode(&bytes, &kinds);
        assert_eq!(decoded, ops);
        assert_eq!(next, bytes.len());
    }

    #[test]
    fn nonzero_padding_rejected() {
        // mov1-shaped instruction whose bit byte has a stray high bit.
        let bytes = [0x02, 0x00, 0x00, 0b1000_0000, 0x05];
        let mut r = OperandReader::new(&bytes, 0, 1);
        r.read_ptr().unwrap();
        r.read_imm::<1>().unwrap();
        assert!(matches!(r.finish(), Err(VMError::NonZeroPadding { offset: 0 })));
    }

    #[test]
    fn truncated_operand_rejected() {
        let bytes = [0x02, 0x00];
        let mut r = OperandReader::new(&bytes, 0, 1);
        assert!(matches!(
            r.read_ptr(),
            Err(VMError::TruncatedInstruction { offset: 0 })
        ));
    }

    #[test]
    fn write_operand_reports_payload_position() {
        let mut w = OperandWriter::new();
        w.begin_instruction(0x40);
        let at = w.write_operand(&Operand::Imm(vec![0, 0]));
        assert_eq!(at, 2);
        w.bytes_mut()[at..at + 2].copy_from_slice(&[0x12, 0x34]);
        assert_eq!(w.bytes(), &[0x40, 0x00, 0x12, 0x34]);
    }
}
