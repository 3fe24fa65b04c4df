//! Control flow operations for the interpreter.
//!
//! Jumps, block setup and teardown, iteration, `raise` and the
//! with-statement exit call. Anything that leaves the current instruction
//! sequence is reported as a [`Flow`]; the caller decides whether that means
//! a jump or an unwind.

use std::sync::Arc;

use super::calls::call_value;
use super::types::{Flow, VmError, VmResult};
use super::Exec;
use crate::backend::bytecode::frame::BlockKind;
use crate::backend::bytecode::instruction::jump_target;
use crate::backend::bytecode::opcodes::Opcode;
use crate::backend::bytecode::unwind::UnwindReason;
use crate::backend::object::{ExceptionKind, ExceptionObj, Value};
use crate::backend::ops;

impl Exec<'_> {
    fn target(&self, op: Opcode, arg: u32) -> VmResult<usize> {
        jump_target(op, arg, self.frame.ip)
            .ok_or_else(|| VmError::Runtime(format!("{} has no jump target", op)))
    }

    // === Jumps ===

    pub(super) fn op_jump(&mut self, op: Opcode, arg: u32) -> VmResult<Flow> {
        Ok(Flow::Jump(self.target(op, arg)?))
    }

    pub(super) fn op_conditional_jump(&mut self, op: Opcode, arg: u32) -> VmResult<Flow> {
        let target = self.target(op, arg)?;
        let tested = self.frame.peek(0)?.clone();
        if self.record {
            self.frame.code.feedback().record_branch(self.site, &tested);
        }
        let truth = tested.is_true();
        let flow = match op {
            Opcode::PopJumpIfFalse => {
                self.frame.pop()?;
                if truth { Flow::Next } else { Flow::Jump(target) }
            }
            Opcode::PopJumpIfTrue => {
                self.frame.pop()?;
                if truth { Flow::Jump(target) } else { Flow::Next }
            }
            Opcode::JumpIfFalseOrPop => {
                if truth {
                    self.frame.pop()?;
                    Flow::Next
                } else {
                    Flow::Jump(target)
                }
            }
            Opcode::JumpIfTrueOrPop => {
                if truth {
                    Flow::Jump(target)
                } else {
                    self.frame.pop()?;
                    Flow::Next
                }
            }
            other => return Err(VmError::Runtime(format!("{} is not a conditional jump", other))),
        };
        Ok(flow)
    }

    // === Blocks ===

    pub(super) fn op_setup_block(&mut self, op: Opcode, arg: u32) -> VmResult<Flow> {
        let kind = match op {
            Opcode::SetupLoop => BlockKind::Loop,
            Opcode::SetupExcept => BlockKind::Except,
            _ => BlockKind::Finally,
        };
        let handler = self.target(op, arg)?;
        self.frame.push_block(kind, handler)?;
        Ok(Flow::Next)
    }

    pub(super) fn op_pop_block(&mut self) -> VmResult<Flow> {
        let block = self.frame.pop_block()?;
        self.frame.stack.truncate(block.level);
        Ok(Flow::Next)
    }

    // === Iteration ===

    /// Push the next item, or pop the exhausted iterator and jump past the
    /// loop body
    pub(super) fn op_for_iter(&mut self, arg: u32) -> VmResult<Flow> {
        let iter = self.frame.peek(0)?.clone();
        match ops::iter_next(self.engine, &iter)? {
            Some(item) => {
                self.frame.push(item);
                Ok(Flow::Next)
            }
            None => {
                self.frame.pop()?;
                Ok(Flow::Jump(self.target(Opcode::ForIter, arg)?))
            }
        }
    }

    // === Raising ===

    pub(super) fn op_raise_varargs(&mut self, argc: u32) -> VmResult<Flow> {
        match argc {
            0 => match self.frame.exc_info.clone() {
                Some(exc) => Ok(Flow::Raise { exc, fresh: false }),
                None => Err(VmError::raise(
                    ExceptionKind::TypeError,
                    "exceptions must be classes or instances, not NoneType",
                )),
            },
            1 => {
                let kind = self.frame.pop()?;
                Ok(Flow::Raise {
                    exc: make_exception(kind, None)?,
                    fresh: true,
                })
            }
            2 => {
                let value = self.frame.pop()?;
                let kind = self.frame.pop()?;
                Ok(Flow::Raise {
                    exc: make_exception(kind, Some(value))?,
                    fresh: true,
                })
            }
            n => Err(VmError::Runtime(format!("bad RAISE_VARARGS argument {}", n))),
        }
    }

    // === With-statements ===

    /// Call `__exit__`, which sits under the values a finally clause
    /// received
    ///
    /// For an exception the exit function gets `(type, value, traceback)` and
    /// a true result swallows the exception. Otherwise it gets three `None`s.
    pub(super) fn op_with_cleanup(&mut self) -> VmResult<Flow> {
        let top = self.frame.peek(0)?.clone();
        let (depth, exc_args) = match &top {
            Value::None => (1, None),
            Value::Int(code) => match UnwindReason::from_code(*code) {
                Some(UnwindReason::Return) | Some(UnwindReason::Continue) => (2, None),
                _ => (1, None),
            },
            Value::ExcType(_) => {
                let value = self.frame.peek(1)?.clone();
                let traceback = self.frame.peek(2)?.clone();
                (3, Some(vec![top.clone(), value, traceback]))
            }
            other => {
                return Err(VmError::Runtime(format!(
                    "WITH_CLEANUP with bad stack top {}",
                    other.repr()
                )))
            }
        };

        let len = self.frame.stack.len();
        if len < depth + 1 {
            return Err(VmError::StackUnderflow {
                ip: self.site.ip as usize,
            });
        }
        let exit = self.frame.stack.remove(len - depth - 1);
        let swallowing = exc_args.is_some();
        let args = exc_args.unwrap_or_else(|| vec![Value::None, Value::None, Value::None]);
        let result = call_value(self.engine, &exit, args, Vec::new())?;

        if swallowing && result.is_true() {
            self.frame.pop_n(3)?;
            self.frame.push(Value::None);
        }
        Ok(Flow::Next)
    }
}

/// Build the exception object for `raise kind` or `raise kind, value`
fn make_exception(kind: Value, value: Option<Value>) -> VmResult<Arc<ExceptionObj>> {
    match (kind, value) {
        (Value::ExcType(k), None | Some(Value::None)) => Ok(ExceptionObj::new(k, Vec::new())),
        (Value::ExcType(k), Some(Value::Exception(e))) if e.kind.is_subclass(k) => Ok(e),
        (Value::ExcType(k), Some(Value::Tuple(args))) => Ok(ExceptionObj::new(k, args.to_vec())),
        (Value::ExcType(k), Some(v)) => Ok(ExceptionObj::new(k, vec![v])),
        (Value::Exception(e), None | Some(Value::None)) => Ok(e),
        (Value::Exception(_), Some(_)) => Err(VmError::raise(
            ExceptionKind::TypeError,
            "instance exception may not have a separate value",
        )),
        (other, _) => Err(VmError::raise(
            ExceptionKind::TypeError,
            format!(
                "exceptions must be classes or instances, not {}",
                other.type_name()
            ),
        )),
    }
}
