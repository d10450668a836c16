//! Stack-machine processor executing contract modules.
//!
//! The [`Processor`] owns a fixed [`STACK_SIZE`]-byte stack and a stack of
//! far frames, one per contract on the call path. Operands address either
//! the stack (relative to `sp`) or the read-only bytes of the running
//! module. All storage and custody effects go through the [`Host`].
//!
//! Any error aborts the whole top-level invocation; the processor keeps no
//! partial state worth resuming and the host is expected to discard the
//! invocation's writes.

mod frames;
mod memory;

use crate::crypto::key_pair::{PUBKEY_LEN, PubKey};
use crate::debug;
use crate::types::hash::{HASH_LEN, Hash};
use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::host::Host;
use crate::virtual_machine::isa::Instruction;
use crate::virtual_machine::operand::{ImmOperand, OperandReader, PtrOperand, Segment};
use crate::virtual_machine::program::{
    ASSET_METADATA_MAX, ContractID, FAR_CALL_DEPTH, Module, STACK_SIZE, VAR_KEY_SIZE, VAR_SIZE,
    asset_owner,
};
use crate::virtual_machine::state::{State, VarKey, VarTag};
use crate::warn;
use frames::{FarFrame, StackFrame};
use memory::{Ptr, Stack};
use std::cmp::Ordering;

macro_rules! exec_vm {
    // Entry point
    (
        vm = $vm:ident,
        host = $host:ident,
        reader = $rd:ident,
        instr = $instr:ident,
        { $( $variant:ident => $handler:ident $args:tt ),* $(,)? }
    ) => {{
        match $instr {
            $(
                Instruction::$variant => exec_vm!(@call $vm, $host, $rd, $handler, $args),
            )*
        }
    }};

    // Handler calling back into the host (semicolon separator)
    (@call $vm:ident, $host:ident, $rd:ident, $handler:ident,
        (host; $( $field:ident : $kind:ident ),* $(,)? )
    ) => {{
        $( let $field = exec_vm!(@read $vm, $rd, $kind)?; )*
        $vm.ip = $rd.finish()?;
        $vm.$handler($host, $( $field ),*)
    }};

    // Handler touching only processor memory
    (@call $vm:ident, $host:ident, $rd:ident, $handler:ident,
        ( $( $field:ident : $kind:ident ),* $(,)? )
    ) => {{
        $( let $field = exec_vm!(@read $vm, $rd, $kind)?; )*
        $vm.ip = $rd.finish()?;
        $vm.$handler($( $field ),*)
    }};

    // Decode and resolve a pointer
    (@read $vm:ident, $rd:ident, Ptr) => {{
        $rd.read_ptr().and_then(|op| $vm.resolve_ptr(op))
    }};

    // Decode an immediate, fetching it from memory when indirect
    (@read $vm:ident, $rd:ident, Imm1) => {{
        $rd.read_imm::<1>().and_then(|op| $vm.resolve_imm(op))
    }};
    (@read $vm:ident, $rd:ident, Imm2) => {{
        $rd.read_imm::<2>().and_then(|op| $vm.resolve_imm(op))
    }};
    (@read $vm:ident, $rd:ident, Imm4) => {{
        $rd.read_imm::<4>().and_then(|op| $vm.resolve_imm(op))
    }};
    (@read $vm:ident, $rd:ident, Imm8) => {{
        $rd.read_imm::<8>().and_then(|op| $vm.resolve_imm(op))
    }};
}

/// Two-operand data operations sharing one code path.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Alu {
    Mov,
    Xor,
    Or,
    And,
    Add,
    Sub,
    Cmp,
}

/// In-place big-endian addition; returns the carry out.
fn add_be(dst: &mut [u8], src: &[u8]) -> bool {
    let mut carry = 0u16;
    for (d, s) in dst.iter_mut().rev().zip(src.iter().rev()) {
        let sum = *d as u16 + *s as u16 + carry;
        *d = sum as u8;
        carry = sum >> 8;
    }
    carry != 0
}

/// In-place big-endian subtraction; returns the borrow out.
fn sub_be(dst: &mut [u8], src: &[u8]) -> bool {
    let mut borrow = 0i16;
    for (d, s) in dst.iter_mut().rev().zip(src.iter().rev()) {
        let diff = *d as i16 - *s as i16 - borrow;
        *d = diff as u8;
        borrow = (diff < 0) as i16;
    }
    borrow != 0
}

/// In-place big-endian increment; returns the carry out.
fn inc_be(dst: &mut [u8]) -> bool {
    for byte in dst.iter_mut().rev() {
        let (value, overflow) = byte.overflowing_add(1);
        *byte = value;
        if !overflow {
            return false;
        }
    }
    !dst.is_empty()
}

fn zip_with(dst: &mut [u8], src: &[u8], f: impl Fn(u8, u8) -> u8) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d = f(*d, *s);
    }
}

fn require(accepted: bool, operation: &'static str) -> Result<(), VMError> {
    if accepted {
        Ok(())
    } else {
        Err(VMError::HostRejected { operation })
    }
}

fn size_of(size: [u8; 2]) -> usize {
    u16::from_be_bytes(size) as usize
}

/// Bytecode processor.
///
/// A processor is reusable: every [`invoke`](Processor::invoke) starts from
/// a cleared stack, and a fault leaves it idle.
pub struct Processor {
    stack: Stack,
    /// Stack pointer, always `<= STACK_SIZE`.
    sp: usize,
    /// Offset of the next instruction in the running module.
    ip: usize,
    /// Offset of the instruction being executed, for diagnostics.
    instr_offset: usize,
    /// Result of the last flag-setting instruction.
    flags: i8,
    far_calls: Vec<FarFrame>,
    trace: bool,
}

impl Default for Processor {
    fn default() -> Self {
        Self::new()
    }
}

impl Processor {
    pub fn new() -> Self {
        Self {
            stack: Stack::new(),
            sp: 0,
            ip: 0,
            instr_offset: 0,
            flags: 0,
            far_calls: Vec::new(),
            trace: false,
        }
    }

    /// Enables per-instruction `debug!` traces.
    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    pub fn sp(&self) -> usize {
        self.sp
    }

    pub fn ip(&self) -> usize {
        self.ip
    }

    pub fn flags(&self) -> i8 {
        self.flags
    }

    /// Number of far frames, i.e. contracts on the current call path.
    pub fn depth(&self) -> usize {
        self.far_calls.len()
    }

    pub fn stack(&self) -> &[u8] {
        self.stack.as_slice()
    }

    /// True once the outermost method has returned (or before any call).
    pub fn is_done(&self) -> bool {
        self.far_calls.is_empty()
    }

    /// Clears the stack, copies `args` to its bottom and pushes the frame
    /// the outermost `ret` pops.
    pub fn init_stack(&mut self, args: &[u8]) -> Result<(), VMError> {
        let max = STACK_SIZE - StackFrame::SIZE;
        if args.len() > max {
            return Err(VMError::ArgsTooLarge {
                size: args.len(),
                max,
            });
        }
        self.stack.clear();
        self.stack.get_mut(0, args.len())?.copy_from_slice(args);
        let frame = StackFrame {
            prev: args.len() as u16,
            ret: 0,
        };
        self.stack
            .get_mut(args.len(), StackFrame::SIZE)?
            .copy_from_slice(&frame.encode());
        self.sp = args.len() + StackFrame::SIZE;
        self.ip = 0;
        self.flags = 0;
        self.far_calls.clear();
        Ok(())
    }

    /// Enters `method` of contract `cid`, loading its module from `state`.
    pub fn call_far<S: State + ?Sized>(
        &mut self,
        state: &S,
        cid: &ContractID,
        method: u16,
    ) -> Result<(), VMError> {
        if self.far_calls.len() >= FAR_CALL_DEPTH {
            return Err(VMError::CallDepthExceeded {
                max: FAR_CALL_DEPTH,
            });
        }
        let code = state
            .load_var(&VarKey::code(cid))
            .ok_or(VMError::ContractNotFound { cid: *cid })?;
        let module = Module::load(code)?;
        let entry = module.entry(method)? as usize;
        if entry >= module.len() {
            return Err(VMError::InvalidIP {
                ip: entry,
                len: module.len(),
            });
        }
        self.far_calls.push(FarFrame {
            cid: *cid,
            module,
            local_depth: 0,
        });
        self.ip = entry;
        Ok(())
    }

    /// Executes one instruction.
    ///
    /// A fault is final: the far frames are dropped, so the processor is
    /// done and cannot resume past the faulting instruction.
    pub fn run_once<H: Host + ?Sized>(&mut self, host: &mut H) -> Result<(), VMError> {
        let result = self.step(host);
        if let Err(err) = &result {
            self.abort(err);
        }
        result
    }

    fn step<H: Host + ?Sized>(&mut self, host: &mut H) -> Result<(), VMError> {
        let frame = self.far_calls.last().ok_or(VMError::NoActiveFrame)?;
        let module = frame.module.clone();
        let code = module.bytes();
        let start = self.ip;
        self.instr_offset = start;
        let opcode = *code.get(start).ok_or(VMError::InvalidIP {
            ip: start,
            len: code.len(),
        })?;
        let instr = Instruction::try_from(opcode).map_err(|_| VMError::InvalidInstruction {
            opcode,
            offset: start,
        })?;
        if self.trace {
            debug!(
                "{} @{start:#06x} {} sp={} flags={}",
                frame.cid,
                instr.mnemonic(),
                self.sp,
                self.flags
            );
        }
        let mut reader = OperandReader::new(code, start, start + 1);
        self.exec(instr, host, &mut reader)
    }

    fn abort(&mut self, err: &VMError) {
        if let Some(frame) = self.far_calls.last() {
            warn!(
                "{} aborted at {:#06x}: {err} ({:?})",
                frame.cid,
                self.instr_offset,
                err.kind()
            );
        }
        self.far_calls.clear();
    }

    /// Runs until the outermost method returns.
    pub fn run<H: Host + ?Sized>(&mut self, host: &mut H) -> Result<(), VMError> {
        while !self.is_done() {
            self.run_once(host)?;
        }
        Ok(())
    }

    /// Runs `method` of `cid` to completion and returns the argument region,
    /// which methods use to hand results back.
    pub fn invoke<H: Host + ?Sized>(
        &mut self,
        host: &mut H,
        cid: &ContractID,
        method: u16,
        args: &[u8],
    ) -> Result<Vec<u8>, VMError> {
        let entered = self
            .init_stack(args)
            .and_then(|()| self.call_far(&*host, cid, method));
        if let Err(err) = entered {
            warn!("cannot enter {cid} method {method}: {err} ({:?})", err.kind());
            return Err(err);
        }
        self.run(host)?;
        Ok(self.stack.get(0, args.len())?.to_vec())
    }

    fn exec<H: Host + ?Sized>(
        &mut self,
        instruction: Instruction,
        host: &mut H,
        reader: &mut OperandReader<'_>,
    ) -> Result<(), VMError> {
        exec_vm! {
            vm = self,
            host = host,
            reader = reader,
            instr = instruction,
            {
                // Moves and bitwise logic
                Mov => op_mov(dst: Ptr, src: Ptr, size: Imm2),
                Mov1 => op_mov_imm(dst: Ptr, src: Imm1),
                Mov2 => op_mov_imm(dst: Ptr, src: Imm2),
                Mov4 => op_mov_imm(dst: Ptr, src: Imm4),
                Mov8 => op_mov_imm(dst: Ptr, src: Imm8),
                Xor => op_xor(dst: Ptr, src: Ptr, size: Imm2),
                Xor1 => op_xor_imm(dst: Ptr, src: Imm1),
                Xor2 => op_xor_imm(dst: Ptr, src: Imm2),
                Xor4 => op_xor_imm(dst: Ptr, src: Imm4),
                Xor8 => op_xor_imm(dst: Ptr, src: Imm8),
                Or => op_or(dst: Ptr, src: Ptr, size: Imm2),
                Or1 => op_or_imm(dst: Ptr, src: Imm1),
                Or2 => op_or_imm(dst: Ptr, src: Imm2),
                Or4 => op_or_imm(dst: Ptr, src: Imm4),
                Or8 => op_or_imm(dst: Ptr, src: Imm8),
                And => op_and(dst: Ptr, src: Ptr, size: Imm2),
                And1 => op_and_imm(dst: Ptr, src: Imm1),
                And2 => op_and_imm(dst: Ptr, src: Imm2),
                And4 => op_and_imm(dst: Ptr, src: Imm4),
                And8 => op_and_imm(dst: Ptr, src: Imm8),
                // Arithmetic
                Add => op_add(dst: Ptr, src: Ptr, size: Imm2),
                Add1 => op_add_imm(dst: Ptr, src: Imm1),
                Add2 => op_add_imm(dst: Ptr, src: Imm2),
                Add4 => op_add_imm(dst: Ptr, src: Imm4),
                Add8 => op_add_imm(dst: Ptr, src: Imm8),
                Sub => op_sub(dst: Ptr, src: Ptr, size: Imm2),
                Sub1 => op_sub_imm(dst: Ptr, src: Imm1),
                Sub2 => op_sub_imm(dst: Ptr, src: Imm2),
                Sub4 => op_sub_imm(dst: Ptr, src: Imm4),
                Sub8 => op_sub_imm(dst: Ptr, src: Imm8),
                Inc => op_inc(dst: Ptr, size: Imm2),
                Neg => op_neg(dst: Ptr, size: Imm2),
                // Compare
                Cmp => op_cmp(a: Ptr, b: Ptr, size: Imm2),
                Cmp1 => op_cmp_imm(a: Ptr, b: Imm1),
                Cmp2 => op_cmp_imm(a: Ptr, b: Imm2),
                Cmp4 => op_cmp_imm(a: Ptr, b: Imm4),
                Cmp8 => op_cmp_imm(a: Ptr, b: Imm8),
                // Control flow
                Jmp => op_jmp(addr: Imm2),
                Jz => op_jz(addr: Imm2),
                Jnz => op_jnz(addr: Imm2),
                Jg => op_jg(addr: Imm2),
                Jb => op_jb(addr: Imm2),
                Jgz => op_jgz(addr: Imm2),
                Jbz => op_jbz(addr: Imm2),
                Call => op_call(addr: Imm2, frame: Imm2),
                CallFar => op_call_far(host; cid: Ptr, method: Imm2, frame: Imm2),
                Ret => op_ret(),
                Fail => op_fail(),
                // Storage
                LoadVar => op_load_var(host; dst: Ptr, dst_size: Imm2, key: Ptr, key_size: Imm2),
                SaveVar => op_save_var(host; src: Ptr, src_size: Imm2, key: Ptr, key_size: Imm2),
                // Authorization
                AddSig => op_add_sig(host; pk: Ptr),
                // Custody and assets
                FundsLock => op_funds_lock(host; amount: Imm8, aid: Imm4),
                FundsUnlock => op_funds_unlock(host; amount: Imm8, aid: Imm4),
                RefAdd => op_ref_add(host; cid: Ptr),
                RefRelease => op_ref_release(host; cid: Ptr),
                AssetCreate => op_asset_create(host; aid: Ptr, meta: Ptr, meta_size: Imm2),
                AssetEmit => op_asset_emit(host; aid: Imm4, amount: Imm8, burn: Imm1),
                AssetDestroy => op_asset_destroy(host; aid: Imm4),
                // Utilities
                Sort => op_sort(arr: Ptr, count: Imm2, width: Imm2, key_pos: Imm2, key_width: Imm2),
            }
        }
    }

    // ==========================================================
    // Memory
    // ==========================================================

    fn module(&self) -> Result<&Module, VMError> {
        self.far_calls
            .last()
            .map(|frame| &frame.module)
            .ok_or(VMError::NoActiveFrame)
    }

    fn current_cid(&self) -> Result<ContractID, VMError> {
        self.far_calls
            .last()
            .map(|frame| frame.cid)
            .ok_or(VMError::NoActiveFrame)
    }

    /// Turns a segment-relative offset into a checked location. Stack
    /// offsets wrap around 16 bits so negative offsets reach below `sp`.
    fn locate(&self, segment: Segment, offset: u16) -> Result<Ptr, VMError> {
        match segment {
            Segment::Stack => {
                let at = (self.sp as u16).wrapping_add(offset) as usize;
                if at > STACK_SIZE {
                    return Err(VMError::StackOverflow {
                        offset: at,
                        size: 0,
                    });
                }
                Ok(Ptr::Stack {
                    offset: at,
                    len: STACK_SIZE - at,
                })
            }
            Segment::Code => {
                let len = self.module()?.len();
                let at = offset as usize;
                if at > len {
                    return Err(VMError::CodeOutOfBounds {
                        offset: at,
                        size: 0,
                    });
                }
                Ok(Ptr::Code {
                    offset: at,
                    len: len - at,
                })
            }
        }
    }

    fn resolve_ptr(&self, op: PtrOperand) -> Result<Ptr, VMError> {
        let ptr = self.locate(op.segment, op.offset)?;
        match op.deref {
            None => Ok(ptr),
            Some(target) => {
                let holder = self.read_array::<2>(ptr)?;
                self.locate(target, u16::from_be_bytes(holder))
            }
        }
    }

    fn resolve_imm<const N: usize>(&self, op: ImmOperand<N>) -> Result<[u8; N], VMError> {
        match op {
            ImmOperand::Value(bytes) => Ok(bytes),
            ImmOperand::Indirect { offset, segment } => {
                let ptr = self.locate(segment, offset)?;
                self.read_array(ptr)
            }
        }
    }

    fn read(&self, ptr: Ptr, size: usize) -> Result<&[u8], VMError> {
        match ptr {
            Ptr::Stack { offset, len } => {
                if size > len {
                    return Err(VMError::StackOverflow { offset, size });
                }
                self.stack.get(offset, size)
            }
            Ptr::Code { offset, len } => {
                if size > len {
                    return Err(VMError::CodeOutOfBounds { offset, size });
                }
                Ok(&self.module()?.bytes()[offset..offset + size])
            }
        }
    }

    fn read_array<const N: usize>(&self, ptr: Ptr) -> Result<[u8; N], VMError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read(ptr, N)?);
        Ok(out)
    }

    fn write(&mut self, ptr: Ptr, size: usize) -> Result<&mut [u8], VMError> {
        match ptr {
            Ptr::Stack { offset, len } => {
                if size > len {
                    return Err(VMError::StackOverflow { offset, size });
                }
                self.stack.get_mut(offset, size)
            }
            Ptr::Code { offset, .. } => Err(VMError::WriteToCode { offset }),
        }
    }

    // ==========================================================
    // Data operations
    // ==========================================================

    fn alu(&mut self, op: Alu, dst: Ptr, src: &[u8]) -> Result<(), VMError> {
        if op == Alu::Cmp {
            let ordering = self.read(dst, src.len())?.cmp(src);
            self.flags = match ordering {
                Ordering::Less => -1,
                Ordering::Equal => 0,
                Ordering::Greater => 1,
            };
            return Ok(());
        }
        let out = self.write(dst, src.len())?;
        let flags = match op {
            Alu::Mov => {
                out.copy_from_slice(src);
                None
            }
            Alu::Xor => {
                zip_with(out, src, |a, b| a ^ b);
                None
            }
            Alu::Or => {
                zip_with(out, src, |a, b| a | b);
                None
            }
            Alu::And => {
                zip_with(out, src, |a, b| a & b);
                None
            }
            Alu::Add => Some(add_be(out, src) as i8),
            Alu::Sub => Some(-(sub_be(out, src) as i8)),
            Alu::Cmp => None,
        };
        if let Some(flags) = flags {
            self.flags = flags;
        }
        Ok(())
    }

    /// Memory-to-memory form; the source is copied first since it may
    /// overlap the destination.
    fn alu_mem(&mut self, op: Alu, dst: Ptr, src: Ptr, size: [u8; 2]) -> Result<(), VMError> {
        let src = self.read(src, size_of(size))?.to_vec();
        self.alu(op, dst, &src)
    }

    fn op_mov(&mut self, dst: Ptr, src: Ptr, size: [u8; 2]) -> Result<(), VMError> {
        self.alu_mem(Alu::Mov, dst, src, size)
    }

    fn op_mov_imm<const N: usize>(&mut self, dst: Ptr, src: [u8; N]) -> Result<(), VMError> {
        self.alu(Alu::Mov, dst, &src)
    }

    fn op_xor(&mut self, dst: Ptr, src: Ptr, size: [u8; 2]) -> Result<(), VMError> {
        self.alu_mem(Alu::Xor, dst, src, size)
    }

    fn op_xor_imm<const N: usize>(&mut self, dst: Ptr, src: [u8; N]) -> Result<(), VMError> {
        self.alu(Alu::Xor, dst, &src)
    }

    fn op_or(&mut self, dst: Ptr, src: Ptr, size: [u8; 2]) -> Result<(), VMError> {
        self.alu_mem(Alu::Or, dst, src, size)
    }

    fn op_or_imm<const N: usize>(&mut self, dst: Ptr, src: [u8; N]) -> Result<(), VMError> {
        self.alu(Alu::Or, dst, &src)
    }

    fn op_and(&mut self, dst: Ptr, src: Ptr, size: [u8; 2]) -> Result<(), VMError> {
        self.alu_mem(Alu::And, dst, src, size)
    }

    fn op_and_imm<const N: usize>(&mut self, dst: Ptr, src: [u8; N]) -> Result<(), VMError> {
        self.alu(Alu::And, dst, &src)
    }

    fn op_add(&mut self, dst: Ptr, src: Ptr, size: [u8; 2]) -> Result<(), VMError> {
        self.alu_mem(Alu::Add, dst, src, size)
    }

    fn op_add_imm<const N: usize>(&mut self, dst: Ptr, src: [u8; N]) -> Result<(), VMError> {
        self.alu(Alu::Add, dst, &src)
    }

    fn op_sub(&mut self, dst: Ptr, src: Ptr, size: [u8; 2]) -> Result<(), VMError> {
        self.alu_mem(Alu::Sub, dst, src, size)
    }

    fn op_sub_imm<const N: usize>(&mut self, dst: Ptr, src: [u8; N]) -> Result<(), VMError> {
        self.alu(Alu::Sub, dst, &src)
    }

    fn op_inc(&mut self, dst: Ptr, size: [u8; 2]) -> Result<(), VMError> {
        let out = self.write(dst, size_of(size))?;
        let carry = inc_be(out);
        self.flags = carry as i8;
        Ok(())
    }

    /// Two's complement negation; the flag is -1 unless the value was zero.
    fn op_neg(&mut self, dst: Ptr, size: [u8; 2]) -> Result<(), VMError> {
        let out = self.write(dst, size_of(size))?;
        let was_zero = out.iter().all(|b| *b == 0);
        for byte in out.iter_mut() {
            *byte = !*byte;
        }
        inc_be(out);
        self.flags = if was_zero { 0 } else { -1 };
        Ok(())
    }

    fn op_cmp(&mut self, a: Ptr, b: Ptr, size: [u8; 2]) -> Result<(), VMError> {
        self.alu_mem(Alu::Cmp, a, b, size)
    }

    fn op_cmp_imm<const N: usize>(&mut self, a: Ptr, b: [u8; N]) -> Result<(), VMError> {
        self.alu(Alu::Cmp, a, &b)
    }

    // ==========================================================
    // Control flow
    // ==========================================================

    fn jump(&mut self, addr: u16) -> Result<(), VMError> {
        let len = self.module()?.len();
        let ip = addr as usize;
        if ip >= len {
            return Err(VMError::InvalidIP { ip, len });
        }
        self.ip = ip;
        Ok(())
    }

    fn jump_if(&mut self, taken: bool, addr: [u8; 2]) -> Result<(), VMError> {
        if taken {
            self.jump(u16::from_be_bytes(addr))
        } else {
            Ok(())
        }
    }

    fn op_jmp(&mut self, addr: [u8; 2]) -> Result<(), VMError> {
        self.jump_if(true, addr)
    }

    fn op_jz(&mut self, addr: [u8; 2]) -> Result<(), VMError> {
        self.jump_if(self.flags == 0, addr)
    }

    fn op_jnz(&mut self, addr: [u8; 2]) -> Result<(), VMError> {
        self.jump_if(self.flags != 0, addr)
    }

    fn op_jg(&mut self, addr: [u8; 2]) -> Result<(), VMError> {
        self.jump_if(self.flags > 0, addr)
    }

    fn op_jb(&mut self, addr: [u8; 2]) -> Result<(), VMError> {
        self.jump_if(self.flags < 0, addr)
    }

    fn op_jgz(&mut self, addr: [u8; 2]) -> Result<(), VMError> {
        self.jump_if(self.flags >= 0, addr)
    }

    fn op_jbz(&mut self, addr: [u8; 2]) -> Result<(), VMError> {
        self.jump_if(self.flags <= 0, addr)
    }

    /// Writes a frame record `frame` bytes above `sp` and moves `sp` past it.
    /// The return address is the already advanced `ip`.
    fn push_frame(&mut self, frame: [u8; 2]) -> Result<(), VMError> {
        let size = size_of(frame);
        let at = self.sp + size;
        let record = StackFrame {
            prev: size as u16,
            ret: self.ip as u16,
        };
        self.stack
            .get_mut(at, StackFrame::SIZE)?
            .copy_from_slice(&record.encode());
        self.sp = at + StackFrame::SIZE;
        Ok(())
    }

    fn op_call(&mut self, addr: [u8; 2], frame: [u8; 2]) -> Result<(), VMError> {
        self.push_frame(frame)?;
        self.jump(u16::from_be_bytes(addr))?;
        let top = self.far_calls.last_mut().ok_or(VMError::NoActiveFrame)?;
        top.local_depth += 1;
        Ok(())
    }

    fn op_call_far<H: Host + ?Sized>(
        &mut self,
        host: &mut H,
        cid: Ptr,
        method: [u8; 2],
        frame: [u8; 2],
    ) -> Result<(), VMError> {
        let cid = Hash(self.read_array::<HASH_LEN>(cid)?);
        self.push_frame(frame)?;
        self.call_far(&*host, &cid, u16::from_be_bytes(method))
    }

    /// Pops the innermost frame. Leaving the outermost method empties the
    /// far-call stack and ends execution.
    fn op_ret(&mut self) -> Result<(), VMError> {
        if self.sp < StackFrame::SIZE {
            return Err(VMError::StackUnderflow {
                sp: self.sp,
                need: StackFrame::SIZE,
            });
        }
        self.sp -= StackFrame::SIZE;
        let frame = StackFrame::decode(&self.stack.read_array(self.sp)?);
        let prev = frame.prev as usize;
        if self.sp < prev {
            return Err(VMError::StackUnderflow {
                sp: self.sp,
                need: prev,
            });
        }
        self.sp -= prev;

        let top = self.far_calls.last_mut().ok_or(VMError::NoActiveFrame)?;
        if top.local_depth > 0 {
            top.local_depth -= 1;
        } else {
            self.far_calls.pop();
            if self.far_calls.is_empty() {
                return Ok(());
            }
        }
        self.jump(frame.ret)
    }

    fn op_fail(&mut self) -> Result<(), VMError> {
        Err(VMError::Aborted {
            offset: self.instr_offset,
        })
    }

    // ==========================================================
    // Storage
    // ==========================================================

    /// Builds the running contract's key for the `key_size` bytes at `key`.
    fn var_key(&self, key: Ptr, key_size: [u8; 2]) -> Result<VarKey, VMError> {
        let size = size_of(key_size);
        if size > VAR_KEY_SIZE {
            return Err(VMError::KeyTooLarge {
                size,
                max: VAR_KEY_SIZE,
            });
        }
        let cid = self.current_cid()?;
        VarKey::new(&cid, VarTag::Internal, self.read(key, size)?)
    }

    /// Loads a variable into `dst`, zero-filling the rest of the buffer.
    /// The flag is 1 when the variable exists.
    fn op_load_var<H: Host + ?Sized>(
        &mut self,
        host: &mut H,
        dst: Ptr,
        dst_size: [u8; 2],
        key: Ptr,
        key_size: [u8; 2],
    ) -> Result<(), VMError> {
        let key = self.var_key(key, key_size)?;
        let capacity = size_of(dst_size);
        let buf = self.write(dst, capacity)?;
        let found = match host.load_var_into(&key, buf) {
            Some(size) if size > capacity => {
                return Err(VMError::VarBufferTooSmall { size, capacity });
            }
            Some(size) => {
                buf[size..].fill(0);
                true
            }
            None => {
                buf.fill(0);
                false
            }
        };
        self.flags = found as i8;
        Ok(())
    }

    /// Stores `src_size` bytes under the key; size 0 deletes. The flag is 1
    /// when the variable existed before.
    fn op_save_var<H: Host + ?Sized>(
        &mut self,
        host: &mut H,
        src: Ptr,
        src_size: [u8; 2],
        key: Ptr,
        key_size: [u8; 2],
    ) -> Result<(), VMError> {
        let size = size_of(src_size);
        if size > VAR_SIZE {
            return Err(VMError::VarTooLarge {
                size,
                max: VAR_SIZE,
            });
        }
        let key = self.var_key(key, key_size)?;
        let existed = host.save_var(&key, self.read(src, size)?);
        self.flags = existed as i8;
        Ok(())
    }

    // ==========================================================
    // Authorization, custody and assets
    // ==========================================================

    fn op_add_sig<H: Host + ?Sized>(&mut self, host: &mut H, pk: Ptr) -> Result<(), VMError> {
        let pk = PubKey(self.read_array::<PUBKEY_LEN>(pk)?);
        require(host.add_sig(&pk), "add_sig")
    }

    fn op_funds_lock<H: Host + ?Sized>(
        &mut self,
        host: &mut H,
        amount: [u8; 8],
        aid: [u8; 4],
    ) -> Result<(), VMError> {
        let cid = self.current_cid()?;
        let accepted = host.funds_lock(&cid, u32::from_be_bytes(aid), u64::from_be_bytes(amount));
        require(accepted, "funds_lock")
    }

    fn op_funds_unlock<H: Host + ?Sized>(
        &mut self,
        host: &mut H,
        amount: [u8; 8],
        aid: [u8; 4],
    ) -> Result<(), VMError> {
        let cid = self.current_cid()?;
        let accepted =
            host.funds_unlock(&cid, u32::from_be_bytes(aid), u64::from_be_bytes(amount));
        require(accepted, "funds_unlock")
    }

    fn op_ref_add<H: Host + ?Sized>(&mut self, host: &mut H, target: Ptr) -> Result<(), VMError> {
        let cid = self.current_cid()?;
        let target = Hash(self.read_array::<HASH_LEN>(target)?);
        require(host.ref_add(&cid, &target), "ref_add")
    }

    fn op_ref_release<H: Host + ?Sized>(
        &mut self,
        host: &mut H,
        target: Ptr,
    ) -> Result<(), VMError> {
        let cid = self.current_cid()?;
        let target = Hash(self.read_array::<HASH_LEN>(target)?);
        require(host.ref_release(&cid, &target), "ref_release")
    }

    /// Creates an asset and writes its id to `aid` (u32 BE). A refused
    /// creation writes 0 and clears the flag.
    fn op_asset_create<H: Host + ?Sized>(
        &mut self,
        host: &mut H,
        aid: Ptr,
        meta: Ptr,
        meta_size: [u8; 2],
    ) -> Result<(), VMError> {
        let size = size_of(meta_size);
        if size > ASSET_METADATA_MAX {
            return Err(VMError::MetadataTooLarge {
                size,
                max: ASSET_METADATA_MAX,
            });
        }
        let cid = self.current_cid()?;
        let metadata = self.read(meta, size)?.to_vec();
        // the id slot must be writable before the host creates anything
        self.write(aid, 4)?;
        let owner = asset_owner(&cid, &metadata);
        let id = host.asset_create(&cid, &metadata, &owner);
        self.write(aid, 4)?.copy_from_slice(&id.to_be_bytes());
        self.flags = (id != 0) as i8;
        Ok(())
    }

    fn op_asset_emit<H: Host + ?Sized>(
        &mut self,
        host: &mut H,
        aid: [u8; 4],
        amount: [u8; 8],
        burn: [u8; 1],
    ) -> Result<(), VMError> {
        let cid = self.current_cid()?;
        let accepted = host.asset_emit(
            &cid,
            u32::from_be_bytes(aid),
            u64::from_be_bytes(amount),
            burn[0] != 0,
        );
        require(accepted, "asset_emit")
    }

    fn op_asset_destroy<H: Host + ?Sized>(
        &mut self,
        host: &mut H,
        aid: [u8; 4],
    ) -> Result<(), VMError> {
        let cid = self.current_cid()?;
        require(host.asset_destroy(&cid, u32::from_be_bytes(aid)), "asset_destroy")
    }

    // ==========================================================
    // Utilities
    // ==========================================================

    /// Stable in-place sort of `count` fixed-width elements by the
    /// big-endian key at `key_pos..key_pos + key_width`.
    fn op_sort(
        &mut self,
        arr: Ptr,
        count: [u8; 2],
        width: [u8; 2],
        key_pos: [u8; 2],
        key_width: [u8; 2],
    ) -> Result<(), VMError> {
        let (count, width) = (size_of(count), size_of(width));
        let (key_pos, key_width) = (size_of(key_pos), size_of(key_width));
        if width == 0 || key_pos + key_width > width {
            return Err(VMError::BadSortLayout {
                width,
                key_pos,
                key_width,
            });
        }
        let buf = self.write(arr, count * width)?;
        let mut items: Vec<Vec<u8>> = buf.chunks_exact(width).map(<[u8]>::to_vec).collect();
        let key = key_pos..key_pos + key_width;
        items.sort_by(|a, b| a[key.clone()].cmp(&b[key.clone()]));
        for (slot, item) in buf.chunks_exact_mut(width).zip(&items) {
            slot.copy_from_slice(item);
        }
        Ok(())
    }
}
