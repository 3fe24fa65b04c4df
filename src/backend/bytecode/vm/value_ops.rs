//! Value operations for the interpreter.
//!
//! Constants, locals, globals, closure cells, attributes, containers and
//! operators. Operator semantics live in [`crate::backend::ops`]; this module
//! only moves values between the stack and the operation, recording type
//! feedback on the way.

use std::sync::Arc;

use super::types::{Flow, VmError, VmResult};
use super::Exec;
use crate::backend::bytecode::frame::Frame;
use crate::backend::bytecode::opcodes::{CmpOp, Opcode};
use crate::backend::object::{ExceptionKind, Value};
use crate::backend::ops::{self, BinaryOp, UnaryOp};

impl Exec<'_> {
    fn name(&self, idx: u32) -> VmResult<Arc<str>> {
        self.frame
            .code
            .names()
            .get(idx as usize)
            .cloned()
            .ok_or(VmError::InvalidName(idx))
    }

    // === Constants and locals ===

    pub(super) fn op_load_const(&mut self, idx: u32) -> VmResult<Flow> {
        let value = self
            .frame
            .code
            .consts()
            .get(idx as usize)
            .cloned()
            .ok_or(VmError::InvalidConstant(idx))?;
        self.frame.push(value);
        Ok(Flow::Next)
    }

    pub(super) fn op_load_fast(&mut self, idx: u32) -> VmResult<Flow> {
        let value = self.frame.load_local(idx)?;
        self.frame.push(value);
        Ok(Flow::Next)
    }

    pub(super) fn op_store_fast(&mut self, idx: u32) -> VmResult<Flow> {
        let value = self.frame.pop()?;
        self.frame.store_local(idx, value)?;
        Ok(Flow::Next)
    }

    pub(super) fn op_delete_fast(&mut self, idx: u32) -> VmResult<Flow> {
        self.frame.delete_local(idx)?;
        Ok(Flow::Next)
    }

    // === Globals ===

    pub(super) fn op_load_global(&mut self, idx: u32) -> VmResult<Flow> {
        let name = self.name(idx)?;
        let value = load_global(self.frame, &name)?;
        self.frame.push(value);
        Ok(Flow::Next)
    }

    pub(super) fn op_store_global(&mut self, idx: u32) -> VmResult<Flow> {
        let name = self.name(idx)?;
        let value = self.frame.pop()?;
        self.frame.globals.set(name, value);
        Ok(Flow::Next)
    }

    pub(super) fn op_delete_global(&mut self, idx: u32) -> VmResult<Flow> {
        let name = self.name(idx)?;
        match self.frame.globals.remove(&name) {
            Some(_) => Ok(Flow::Next),
            None => Err(VmError::raise(
                ExceptionKind::NameError,
                format!("global name '{}' is not defined", name),
            )),
        }
    }

    // === Closure cells ===

    pub(super) fn op_load_closure(&mut self, idx: u32) -> VmResult<Flow> {
        let cell = self.frame.cell(idx)?.clone();
        self.frame.push(Value::Cell(cell));
        Ok(Flow::Next)
    }

    pub(super) fn op_load_deref(&mut self, idx: u32) -> VmResult<Flow> {
        match self.frame.cell(idx)?.get() {
            Some(value) => {
                self.frame.push(value);
                Ok(Flow::Next)
            }
            None => {
                let code = &self.frame.code;
                let name = code.cell_name(idx as usize).cloned().unwrap_or_else(|| "?".into());
                if (idx as usize) < code.cellvars().len() {
                    Err(VmError::raise(
                        ExceptionKind::UnboundLocalError,
                        format!("local variable '{}' referenced before assignment", name),
                    ))
                } else {
                    Err(VmError::raise(
                        ExceptionKind::NameError,
                        format!(
                            "free variable '{}' referenced before assignment in enclosing scope",
                            name
                        ),
                    ))
                }
            }
        }
    }

    pub(super) fn op_store_deref(&mut self, idx: u32) -> VmResult<Flow> {
        let value = self.frame.pop()?;
        self.frame.cell(idx)?.set(value);
        Ok(Flow::Next)
    }

    // === Attributes ===

    pub(super) fn op_load_attr(&mut self, idx: u32) -> VmResult<Flow> {
        let name = self.name(idx)?;
        let obj = self.frame.pop()?;
        let value = ops::getattr(self.engine, &obj, &name)?;
        self.frame.push(value);
        Ok(Flow::Next)
    }

    pub(super) fn op_store_attr(&mut self, idx: u32) -> VmResult<Flow> {
        let name = self.name(idx)?;
        let obj = self.frame.pop()?;
        let value = self.frame.pop()?;
        ops::setattr(&obj, &name, value)?;
        Ok(Flow::Next)
    }

    pub(super) fn op_delete_attr(&mut self, idx: u32) -> VmResult<Flow> {
        let name = self.name(idx)?;
        let obj = self.frame.pop()?;
        ops::delattr(&obj, &name)?;
        Ok(Flow::Next)
    }

    // === Operators ===

    pub(super) fn op_unary(&mut self, op: UnaryOp) -> VmResult<Flow> {
        let value = self.frame.pop()?;
        let result = ops::unary_op(self.engine, op, &value)?;
        self.frame.push(result);
        Ok(Flow::Next)
    }

    pub(super) fn op_binary(&mut self, op: BinaryOp, inplace: bool) -> VmResult<Flow> {
        let rhs = self.frame.pop()?;
        let lhs = self.frame.pop()?;
        if self.record {
            self.frame.code.feedback().record_operands(self.site, &lhs, &rhs);
        }
        let result = if inplace {
            ops::inplace_op(self.engine, op, &lhs, &rhs)?
        } else {
            ops::binary_op(self.engine, op, &lhs, &rhs)?
        };
        self.frame.push(result);
        Ok(Flow::Next)
    }

    pub(super) fn op_compare(&mut self, arg: u32) -> VmResult<Flow> {
        let op = CmpOp::from_arg(arg)
            .ok_or_else(|| VmError::Runtime(format!("bad comparison operator {}", arg)))?;
        let rhs = self.frame.pop()?;
        let lhs = self.frame.pop()?;
        let result = ops::compare(self.engine, op, &lhs, &rhs)?;
        self.frame.push(result);
        Ok(Flow::Next)
    }

    // === Containers ===

    pub(super) fn op_store_subscr(&mut self) -> VmResult<Flow> {
        let index = self.frame.pop()?;
        let container = self.frame.pop()?;
        let value = self.frame.pop()?;
        ops::setitem(self.engine, &container, &index, value)?;
        Ok(Flow::Next)
    }

    pub(super) fn op_delete_subscr(&mut self) -> VmResult<Flow> {
        let index = self.frame.pop()?;
        let container = self.frame.pop()?;
        ops::delitem(self.engine, &container, &index)?;
        Ok(Flow::Next)
    }

    pub(super) fn op_build_tuple(&mut self, n: u32) -> VmResult<Flow> {
        let items = self.frame.pop_n(n as usize)?;
        self.frame.push(Value::tuple(items));
        Ok(Flow::Next)
    }

    pub(super) fn op_build_list(&mut self, n: u32) -> VmResult<Flow> {
        let items = self.frame.pop_n(n as usize)?;
        self.frame.push(Value::list(items));
        Ok(Flow::Next)
    }

    /// `BUILD_SLICE`: `[start, stop, (step)?] -> [slice]`
    pub(super) fn op_build_slice(&mut self, n: u32) -> VmResult<Flow> {
        let step = match n {
            2 => Value::None,
            3 => self.frame.pop()?,
            other => return Err(VmError::Runtime(format!("BUILD_SLICE of {} values", other))),
        };
        let stop = self.frame.pop()?;
        let start = self.frame.pop()?;
        self.frame.push(Value::slice(start, stop, step));
        Ok(Flow::Next)
    }

    /// Pop the bounds of a `SLICE`-family opcode, upper bound on top
    fn slice_operand(&mut self, op: Opcode) -> VmResult<Value> {
        let (lower, upper) = op.slice_bounds().ok_or(VmError::InvalidOpcode {
            ip: self.site.ip as usize,
            opcode: op,
        })?;
        let stop = if upper { self.frame.pop()? } else { Value::None };
        let start = if lower { self.frame.pop()? } else { Value::None };
        Ok(Value::slice(start, stop, Value::None))
    }

    /// `SLICE+n`: `[obj, (lower)?, (upper)?] -> [obj[lower:upper]]`
    pub(super) fn op_slice(&mut self, op: Opcode) -> VmResult<Flow> {
        let slice = self.slice_operand(op)?;
        let obj = self.frame.pop()?;
        let result = ops::binary_op(self.engine, BinaryOp::GetItem, &obj, &slice)?;
        self.frame.push(result);
        Ok(Flow::Next)
    }

    /// `STORE_SLICE+n`: `obj[lower:upper] = value`
    pub(super) fn op_store_slice(&mut self, op: Opcode) -> VmResult<Flow> {
        let slice = self.slice_operand(op)?;
        let obj = self.frame.pop()?;
        let value = self.frame.pop()?;
        ops::setitem(self.engine, &obj, &slice, value)?;
        Ok(Flow::Next)
    }

    /// `DELETE_SLICE+n`: `del obj[lower:upper]`
    pub(super) fn op_delete_slice(&mut self, op: Opcode) -> VmResult<Flow> {
        let slice = self.slice_operand(op)?;
        let obj = self.frame.pop()?;
        ops::delitem(self.engine, &obj, &slice)?;
        Ok(Flow::Next)
    }

    pub(super) fn op_build_map(&mut self) -> VmResult<Flow> {
        self.frame.push(Value::dict());
        Ok(Flow::Next)
    }

    /// `TOS2[TOS] = TOS1`, leaving the dict on the stack
    pub(super) fn op_store_map(&mut self) -> VmResult<Flow> {
        let key = self.frame.pop()?;
        let value = self.frame.pop()?;
        match self.frame.peek(0)? {
            Value::Dict(d) => d.lock().insert(key, value)?,
            other => {
                return Err(VmError::Runtime(format!(
                    "STORE_MAP on {}",
                    other.type_name()
                )))
            }
        }
        Ok(Flow::Next)
    }

    /// Append TOS to the list `n` slots below it (1 is the slot right under)
    pub(super) fn op_list_append(&mut self, n: u32) -> VmResult<Flow> {
        let value = self.frame.pop()?;
        match self.frame.peek(n.max(1) as usize - 1)? {
            Value::List(l) => l.lock().push(value),
            other => {
                return Err(VmError::Runtime(format!(
                    "LIST_APPEND on {}",
                    other.type_name()
                )))
            }
        }
        Ok(Flow::Next)
    }

    pub(super) fn op_unpack_sequence(&mut self, n: u32) -> VmResult<Flow> {
        let n = n as usize;
        let seq = self.frame.pop()?;
        let items = ops::collect_iterable(self.engine, &seq)?;
        if items.len() < n {
            return Err(VmError::raise(
                ExceptionKind::ValueError,
                format!(
                    "need more than {} value{} to unpack",
                    items.len(),
                    if items.len() == 1 { "" } else { "s" }
                ),
            ));
        }
        if items.len() > n {
            return Err(VmError::raise(
                ExceptionKind::ValueError,
                "too many values to unpack",
            ));
        }
        self.frame.stack.extend(items.into_iter().rev());
        Ok(Flow::Next)
    }

    pub(super) fn op_get_iter(&mut self) -> VmResult<Flow> {
        let value = self.frame.pop()?;
        let iter = ops::get_iter(self.engine, &value)?;
        self.frame.push(iter);
        Ok(Flow::Next)
    }
}

/// Full global lookup: globals, then builtins
fn load_global(frame: &Frame, name: &str) -> VmResult<Value> {
    frame
        .globals
        .get(name)
        .or_else(|| frame.builtins.get(name))
        .ok_or_else(|| {
            VmError::raise(
                ExceptionKind::NameError,
                format!("global name '{}' is not defined", name),
            )
        })
}
