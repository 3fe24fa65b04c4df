//! Stack operations for the interpreter.
//!
//! Rotations and duplications work on the top `n` slots in place.

use tracing::trace;

use super::types::{Flow, VmError, VmResult};
use super::Exec;

impl Exec<'_> {
    fn underflow(&self) -> VmError {
        VmError::StackUnderflow {
            ip: self.site.ip as usize,
        }
    }

    pub(super) fn op_pop_top(&mut self) -> VmResult<Flow> {
        self.frame.pop()?;
        Ok(Flow::Next)
    }

    /// Move the top of stack down `n - 1` slots
    pub(super) fn op_rot(&mut self, n: usize) -> VmResult<Flow> {
        trace!(target: "tiervm::vm::stack", ip = self.site.ip, n, "rot");
        let len = self.frame.stack.len();
        if len < n {
            return Err(self.underflow());
        }
        let top = self.frame.pop()?;
        self.frame.stack.insert(len - n, top);
        Ok(Flow::Next)
    }

    /// Duplicate the top `n` slots, keeping their order
    pub(super) fn op_dup(&mut self, n: usize) -> VmResult<Flow> {
        let len = self.frame.stack.len();
        if len < n {
            return Err(self.underflow());
        }
        self.frame.stack.extend_from_within(len - n..);
        Ok(Flow::Next)
    }
}
