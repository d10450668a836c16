use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::program::STACK_SIZE;

/// Resolved operand location. `len` is the number of bytes addressable from
/// `offset` to the end of the segment.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(super) enum Ptr {
    Stack { offset: usize, len: usize },
    Code { offset: usize, len: usize },
}

/// Fixed-size zero-initialized processor stack.
pub(super) struct Stack {
    bytes: Box<[u8]>,
}

impl Stack {
    pub fn new() -> Self {
        Self {
            bytes: vec![0u8; STACK_SIZE].into_boxed_slice(),
        }
    }

    pub fn clear(&mut self) {
        self.bytes.fill(0);
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn get(&self, offset: usize, size: usize) -> Result<&[u8], VMError> {
        offset
            .checked_add(size)
            .and_then(|end| self.bytes.get(offset..end))
            .ok_or(VMError::StackOverflow { offset, size })
    }

    pub fn get_mut(&mut self, offset: usize, size: usize) -> Result<&mut [u8], VMError> {
        offset
            .checked_add(size)
            .and_then(|end| self.bytes.get_mut(offset..end))
            .ok_or(VMError::StackOverflow { offset, size })
    }

    /// Reads a fixed-size record.
    pub fn read_array<const N: usize>(&self, offset: usize) -> Result<[u8; N], VMError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.get(offset, N)?);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_is_bounded() {
        let mut stack = Stack::new();
        stack.get_mut(STACK_SIZE - 2, 2).unwrap().copy_from_slice(&[7, 9]);
        assert_eq!(stack.read_array::<2>(STACK_SIZE - 2).unwrap(), [7, 9]);
        assert!(stack.get(STACK_SIZE - 1, 2).is_err());
        assert!(stack.get(STACK_SIZE, 0).unwrap().is_empty());
        assert!(matches!(
            stack.get_mut(usize::MAX, 2),
            Err(VMError::StackOverflow { .. })
        ));
        stack.clear();
        assert!(stack.as_slice().iter().all(|b| *b == 0));
    }
}
