//! Block-stack unwinding shared by every tier
//!
//! Exceptions, returns, `break` and `continue` all leave a block the same
//! way: pop blocks until one of them wants the unwind, truncate the value
//! stack to that block's level and jump to its handler. A `finally` handler
//! finds on the stack what sent it there, encoded with the numeric reason
//! codes below, and `END_FINALLY` decodes that to resume the unwind.
//!
//! The interpreter and native code both call [`unwind`] and
//! [`end_finally`], so a finally clause behaves the same no matter which tier
//! entered it or which tier resumes after it.

use std::sync::Arc;

use super::frame::{BlockKind, Frame};
use super::vm::{Flow, VmError, VmResult};
use crate::backend::object::{ExceptionKind, ExceptionObj, Value};

/// Why the block stack is being unwound
///
/// The discriminants are the codes pushed for a `finally` clause.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnwindReason {
    NotSet = 0x01,
    Exception = 0x02,
    Reraise = 0x04,
    Return = 0x08,
    Break = 0x10,
    Continue = 0x20,
    Yield = 0x40,
}

impl UnwindReason {
    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            0x01 => UnwindReason::NotSet,
            0x02 => UnwindReason::Exception,
            0x04 => UnwindReason::Reraise,
            0x08 => UnwindReason::Return,
            0x10 => UnwindReason::Break,
            0x20 => UnwindReason::Continue,
            0x40 => UnwindReason::Yield,
            _ => return None,
        })
    }
}

/// An unwind in progress
#[derive(Debug, Clone)]
pub enum Unwind {
    Exception(Arc<ExceptionObj>),
    Return(Value),
    Break,
    /// `continue` targeting a loop header
    Continue(usize),
}

impl Unwind {
    pub fn reason(&self) -> UnwindReason {
        match self {
            Unwind::Exception(_) => UnwindReason::Exception,
            Unwind::Return(_) => UnwindReason::Return,
            Unwind::Break => UnwindReason::Break,
            Unwind::Continue(_) => UnwindReason::Continue,
        }
    }
}

/// Where an unwind ended up
#[derive(Debug)]
pub enum Unwound {
    /// A block took the unwind; continue at this instruction
    Handler(usize),
    /// No block wanted it; the frame exits with it
    Exit(Unwind),
}

/// Pop blocks until one handles `pending`
pub fn unwind(frame: &mut Frame, pending: Unwind) -> VmResult<Unwound> {
    while let Some(block) = frame.blocks.last().copied() {
        if block.kind == BlockKind::Loop {
            if let Unwind::Continue(target) = pending {
                return Ok(Unwound::Handler(target));
            }
        }
        frame.blocks.pop();
        frame.stack.truncate(block.level);

        match (block.kind, &pending) {
            (BlockKind::Loop, Unwind::Break) => return Ok(Unwound::Handler(block.handler)),
            (BlockKind::Loop, _) => {}
            (BlockKind::Except, Unwind::Exception(exc)) => {
                frame.exc_info = Some(exc.clone());
                push_exception(frame, exc);
                return Ok(Unwound::Handler(block.handler));
            }
            (BlockKind::Except, _) => {}
            (BlockKind::Finally, _) => {
                match &pending {
                    Unwind::Exception(exc) => push_exception(frame, exc),
                    Unwind::Return(value) => {
                        frame.push(value.clone());
                        frame.push(Value::Int(UnwindReason::Return.code()));
                    }
                    Unwind::Continue(target) => {
                        frame.push(Value::Int(*target as i64));
                        frame.push(Value::Int(UnwindReason::Continue.code()));
                    }
                    Unwind::Break => frame.push(Value::Int(UnwindReason::Break.code())),
                }
                return Ok(Unwound::Handler(block.handler));
            }
        }
    }
    Ok(Unwound::Exit(pending))
}

/// Push the `(traceback, value, type)` triple a handler expects
fn push_exception(frame: &mut Frame, exc: &Arc<ExceptionObj>) {
    frame.push(Value::Traceback(Arc::new(exc.traceback())));
    frame.push(Value::Exception(exc.clone()));
    frame.push(Value::ExcType(exc.kind));
}

/// Execute `END_FINALLY`: resume whatever unwind entered the clause
///
/// Returns `Flow::Next` when the clause was entered normally.
pub fn end_finally(frame: &mut Frame) -> VmResult<Flow> {
    let top = frame.pop()?;
    match top {
        Value::None => Ok(Flow::Next),
        Value::Int(code) => match UnwindReason::from_code(code) {
            Some(UnwindReason::Return) => Ok(Flow::Unwind(Unwind::Return(frame.pop()?))),
            Some(UnwindReason::Continue) => {
                let target = frame.pop()?;
                match target.as_int() {
                    Some(t) if t >= 0 => Ok(Flow::Unwind(Unwind::Continue(t as usize))),
                    _ => Err(VmError::Runtime(format!("bad continue target {}", target.repr()))),
                }
            }
            Some(UnwindReason::Break) => Ok(Flow::Unwind(Unwind::Break)),
            _ => Err(VmError::Runtime(format!("bad unwind reason code {}", code))),
        },
        Value::ExcType(_) => {
            let value = frame.pop()?;
            let _traceback = frame.pop()?;
            match value {
                Value::Exception(exc) => Ok(Flow::Raise { exc, fresh: false }),
                other => Err(VmError::Runtime(format!(
                    "'finally' pops bad exception value {}",
                    other.repr()
                ))),
            }
        }
        other => Err(VmError::raise(
            ExceptionKind::SystemError,
            format!("'finally' pops bad exception {}", other.repr()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::bytecode::builder::CodeBuilder;
    use crate::backend::bytecode::opcodes::Opcode;
    use crate::backend::object::Namespace;

    fn frame() -> Frame {
        let mut b = CodeBuilder::new("t");
        b.emit(Opcode::Nop);
        b.load_const(Value::None);
        b.emit(Opcode::ReturnValue);
        let code = b.build().unwrap();
        Frame::new(code, Namespace::new(), Namespace::new())
    }

    #[test]
    fn test_reason_codes_roundtrip() {
        for reason in [
            UnwindReason::NotSet,
            UnwindReason::Exception,
            UnwindReason::Reraise,
            UnwindReason::Return,
            UnwindReason::Break,
            UnwindReason::Continue,
            UnwindReason::Yield,
        ] {
            assert_eq!(UnwindReason::from_code(reason.code()), Some(reason));
        }
        assert_eq!(UnwindReason::from_code(3), None);
    }

    #[test]
    fn test_break_goes_to_loop_handler() {
        let mut f = frame();
        f.push(Value::Int(1));
        f.push_block(BlockKind::Loop, 40).unwrap();
        f.push(Value::Int(2));
        f.push(Value::Int(3));
        match unwind(&mut f, Unwind::Break).unwrap() {
            Unwound::Handler(ip) => assert_eq!(ip, 40),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(f.stack.len(), 1);
        assert!(f.blocks.is_empty());
    }

    #[test]
    fn test_continue_keeps_loop_block() {
        let mut f = frame();
        f.push_block(BlockKind::Loop, 40).unwrap();
        f.push_block(BlockKind::Except, 30).unwrap();
        match unwind(&mut f, Unwind::Continue(7)).unwrap() {
            Unwound::Handler(ip) => assert_eq!(ip, 7),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(f.blocks.len(), 1);
        assert_eq!(f.blocks[0].kind, BlockKind::Loop);
    }

    #[test]
    fn test_return_through_finally_and_back() {
        let mut f = frame();
        f.push_block(BlockKind::Finally, 12).unwrap();
        f.push(Value::Int(99));
        match unwind(&mut f, Unwind::Return(Value::Int(5))).unwrap() {
            Unwound::Handler(ip) => assert_eq!(ip, 12),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(f.stack.len(), 2);
        match end_finally(&mut f).unwrap() {
            Flow::Unwind(Unwind::Return(v)) => assert_eq!(v.as_int(), Some(5)),
            other => panic!("unexpected {:?}", other),
        }
        assert!(f.stack.is_empty());
    }

    #[test]
    fn test_exception_skips_loops_and_reraises() {
        let mut f = frame();
        f.push_block(BlockKind::Finally, 50).unwrap();
        f.push_block(BlockKind::Loop, 20).unwrap();
        let exc = ExceptionObj::with_message(ExceptionKind::ValueError, "x");
        match unwind(&mut f, Unwind::Exception(exc.clone())).unwrap() {
            Unwound::Handler(ip) => assert_eq!(ip, 50),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(f.stack.len(), 3);
        match end_finally(&mut f).unwrap() {
            Flow::Raise { exc: e, fresh } => {
                assert!(Arc::ptr_eq(&e, &exc));
                assert!(!fresh);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_exit_without_handlers() {
        let mut f = frame();
        f.push_block(BlockKind::Except, 9).unwrap();
        match unwind(&mut f, Unwind::Return(Value::None)).unwrap() {
            Unwound::Exit(Unwind::Return(_)) => {}
            other => panic!("unexpected {:?}", other),
        }
        assert!(f.blocks.is_empty());
    }
}
