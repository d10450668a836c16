use crate::virtual_machine::program::{ContractID, Module};

/// Record written on the stack by `call`, `call_far` and the invocation
/// entry: the size of the caller's frame and the return address, both u16
/// big-endian.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(super) struct StackFrame {
    pub prev: u16,
    pub ret: u16,
}

impl StackFrame {
    pub const SIZE: usize = 4;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let [p0, p1] = self.prev.to_be_bytes();
        let [r0, r1] = self.ret.to_be_bytes();
        [p0, p1, r0, r1]
    }

    pub fn decode(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            prev: u16::from_be_bytes([bytes[0], bytes[1]]),
            ret: u16::from_be_bytes([bytes[2], bytes[3]]),
        }
    }
}

/// One entry of the far-call stack: the contract whose code is running and
/// how many local `call`s it has pending.
#[derive(Clone, Debug)]
pub(super) struct FarFrame {
    pub cid: ContractID,
    pub module: Module,
    pub local_depth: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_frame_is_big_endian() {
        let frame = StackFrame {
            prev: 0x0102,
            ret: 0xA0B0,
        };
        assert_eq!(frame.encode(), [0x01, 0x02, 0xA0, 0xB0]);
        assert_eq!(StackFrame::decode(&frame.encode()), frame);
    }
}
