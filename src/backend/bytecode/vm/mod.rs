//! Interpreter Loop
//!
//! The interpreter executes one [`Frame`] instruction by instruction. It is
//! the reference semantics for every tier: native code runs the same
//! primitives through [`exec_primitive`] and unwinds through the same block
//! stack helpers, so the two tiers can hand a frame back and forth at any
//! instruction boundary.
//!
//! While a unit is interpreted, instrumented primitives feed its
//! [`FeedbackMap`](crate::backend::bytecode::jit::feedback::FeedbackMap):
//! conditional jumps record truth values, calls record callees and binary
//! operators record operand types.
//!
//! This module is organized into submodules by functionality:
//! - `types`: Core type definitions (VmError, Flow, FrameEntry, FrameExit)
//! - `stack`: Stack manipulation operations
//! - `value_ops`: Constants, variables, attributes, containers and operators
//! - `control_flow`: Jumps, blocks, iteration, raising and with-statements
//! - `calls`: Calls, argument binding and function creation
//! - `trace`: Tracing hook interface

use std::sync::Arc;

use tracing::trace;

use super::code::CodeUnit;
use super::frame::Frame;
use super::jit::events::EventKind;
use super::jit::feedback::SiteId;
use super::opcodes::Opcode;
use super::unwind::{unwind, Unwind, Unwound};
use crate::backend::object::ExceptionObj;
use crate::engine::Engine;

// === Submodules ===

mod calls;
mod control_flow;
mod stack;
mod trace;
mod types;
mod value_ops;


// === Re-exports ===

pub use calls::{call_value, DepthGuard, KwArgs};
pub use trace::{TraceEvent, TraceHook};
pub use types::{Flow, FrameEntry, FrameExit, VmError, VmResult};

/// Execution context of a single primitive
pub(crate) struct Exec<'a> {
    pub(crate) engine: &'a Engine,
    pub(crate) frame: &'a mut Frame,
    pub(crate) site: SiteId,
    /// Record feedback for this execution
    pub(crate) record: bool,
}

impl Exec<'_> {
    #[inline]
    fn arg(&self, op: Opcode, arg: Option<u32>) -> VmResult<u32> {
        arg.ok_or(VmError::MissingArgument {
            ip: self.site.ip as usize,
            opcode: op,
        })
    }
}

// =============================================================================
// Primitive dispatch
// =============================================================================

/// Execute one primitive on `frame`
///
/// `frame.ip` must already point past the enclosing instruction; relative
/// jumps are resolved against it.
pub(crate) fn exec_primitive(
    engine: &Engine,
    frame: &mut Frame,
    op: Opcode,
    arg: Option<u32>,
    site: SiteId,
    record: bool,
) -> VmResult<Flow> {
    let mut ex = Exec {
        engine,
        frame,
        site,
        record,
    };

    if let Some(bop) = op.binary_op() {
        return ex.op_binary(bop, false);
    }
    if let Some(bop) = op.inplace_op() {
        return ex.op_binary(bop, true);
    }
    if let Some(uop) = op.unary_op() {
        return ex.op_unary(uop);
    }

    match op {
        // Stack
        Opcode::Nop => Ok(Flow::Next),
        Opcode::PopTop => ex.op_pop_top(),
        Opcode::RotTwo => ex.op_rot(2),
        Opcode::RotThree => ex.op_rot(3),
        Opcode::RotFour => ex.op_rot(4),
        Opcode::DupTop => ex.op_dup(1),
        Opcode::DupTopTwo => ex.op_dup(2),
        Opcode::DupTopThree => ex.op_dup(3),

        // Containers and iteration
        Opcode::StoreSubscr => ex.op_store_subscr(),
        Opcode::DeleteSubscr => ex.op_delete_subscr(),
        Opcode::GetIter => ex.op_get_iter(),
        Opcode::StoreMap => ex.op_store_map(),
        Opcode::Slice0 | Opcode::Slice1 | Opcode::Slice2 | Opcode::Slice3 => ex.op_slice(op),
        Opcode::StoreSlice0
        | Opcode::StoreSlice1
        | Opcode::StoreSlice2
        | Opcode::StoreSlice3 => ex.op_store_slice(op),
        Opcode::DeleteSlice0
        | Opcode::DeleteSlice1
        | Opcode::DeleteSlice2
        | Opcode::DeleteSlice3 => ex.op_delete_slice(op),
        Opcode::BuildSlice => ex.op_build_slice(ex.arg(op, arg)?),
        Opcode::UnpackSequence => ex.op_unpack_sequence(ex.arg(op, arg)?),
        Opcode::ForIter => ex.op_for_iter(ex.arg(op, arg)?),
        Opcode::BuildTuple => ex.op_build_tuple(ex.arg(op, arg)?),
        Opcode::BuildList => ex.op_build_list(ex.arg(op, arg)?),
        Opcode::BuildMap => ex.op_build_map(),
        Opcode::ListAppend => ex.op_list_append(ex.arg(op, arg)?),

        // Block and frame control
        Opcode::BreakLoop => Ok(Flow::Unwind(Unwind::Break)),
        Opcode::ReturnValue => Ok(Flow::Unwind(Unwind::Return(ex.frame.pop()?))),
        Opcode::YieldValue => Ok(Flow::Yield(ex.frame.pop()?)),
        Opcode::PopBlock => ex.op_pop_block(),
        Opcode::EndFinally => super::unwind::end_finally(ex.frame),
        Opcode::WithCleanup => ex.op_with_cleanup(),
        Opcode::ContinueLoop => Ok(Flow::Unwind(Unwind::Continue(ex.arg(op, arg)? as usize))),
        Opcode::SetupLoop | Opcode::SetupExcept | Opcode::SetupFinally => {
            ex.op_setup_block(op, ex.arg(op, arg)?)
        }
        Opcode::RaiseVarargs => ex.op_raise_varargs(ex.arg(op, arg)?),

        // Jumps
        Opcode::JumpForward | Opcode::JumpAbsolute => ex.op_jump(op, ex.arg(op, arg)?),
        Opcode::PopJumpIfFalse
        | Opcode::PopJumpIfTrue
        | Opcode::JumpIfFalseOrPop
        | Opcode::JumpIfTrueOrPop => ex.op_conditional_jump(op, ex.arg(op, arg)?),

        // Variables
        Opcode::LoadConst => ex.op_load_const(ex.arg(op, arg)?),
        Opcode::LoadFast => ex.op_load_fast(ex.arg(op, arg)?),
        Opcode::StoreFast => ex.op_store_fast(ex.arg(op, arg)?),
        Opcode::DeleteFast => ex.op_delete_fast(ex.arg(op, arg)?),
        Opcode::LoadGlobal => ex.op_load_global(ex.arg(op, arg)?),
        Opcode::StoreGlobal => ex.op_store_global(ex.arg(op, arg)?),
        Opcode::DeleteGlobal => ex.op_delete_global(ex.arg(op, arg)?),
        Opcode::LoadClosure => ex.op_load_closure(ex.arg(op, arg)?),
        Opcode::LoadDeref => ex.op_load_deref(ex.arg(op, arg)?),
        Opcode::StoreDeref => ex.op_store_deref(ex.arg(op, arg)?),

        // Attributes and comparison
        Opcode::LoadAttr => ex.op_load_attr(ex.arg(op, arg)?),
        Opcode::StoreAttr => ex.op_store_attr(ex.arg(op, arg)?),
        Opcode::DeleteAttr => ex.op_delete_attr(ex.arg(op, arg)?),
        Opcode::CompareOp => ex.op_compare(ex.arg(op, arg)?),

        // Calls and functions
        Opcode::CallFunction
        | Opcode::CallFunctionVar
        | Opcode::CallFunctionKw
        | Opcode::CallFunctionVarKw => ex.op_call_function(op, ex.arg(op, arg)?),
        Opcode::MakeFunction => ex.op_make_function(ex.arg(op, arg)?, false),
        Opcode::MakeClosure => ex.op_make_function(ex.arg(op, arg)?, true),

        // Superinstructions are expanded by the decoder and never reach here;
        // operator opcodes were handled above.
        _ => Err(VmError::InvalidOpcode {
            ip: site.ip as usize,
            opcode: op,
        }),
    }
}

// =============================================================================
// Unwinding shared by all tiers
// =============================================================================

/// Start unwinding for a raised exception
///
/// A fresh raise adds this frame to the traceback; a re-raise keeps the
/// traceback as it is.
pub(crate) fn begin_raise(
    engine: &Engine,
    frame: &Frame,
    exc: Arc<ExceptionObj>,
    fresh: bool,
    event: EventKind,
) -> Unwind {
    if fresh {
        frame.record_traceback(&exc);
        engine.record_event(event);
    }
    Unwind::Exception(exc)
}

/// Unwind the block stack and either land on a handler (`Ok(None)`, with
/// `frame.ip` set to it) or leave the frame
pub(crate) fn dispatch_unwind(
    engine: &Engine,
    frame: &mut Frame,
    pending: Unwind,
    catch_event: EventKind,
) -> VmResult<Option<FrameExit>> {
    let is_exception = matches!(pending, Unwind::Exception(_));
    match unwind(frame, pending)? {
        Unwound::Handler(ip) => {
            frame.ip = ip;
            if is_exception {
                engine.record_event(catch_event);
            }
            Ok(None)
        }
        Unwound::Exit(Unwind::Return(value)) => Ok(Some(FrameExit::Return(value))),
        Unwound::Exit(Unwind::Exception(exc)) => Err(VmError::Raised(exc)),
        Unwound::Exit(Unwind::Break) => Err(VmError::Runtime("'break' outside loop".into())),
        Unwound::Exit(Unwind::Continue(_)) => Err(VmError::Runtime(
            "'continue' not properly in loop".into(),
        )),
    }
}

// =============================================================================
// Interpreter loop
// =============================================================================

/// Run `frame` in the interpreter until it returns, yields or raises
pub fn eval_frame(engine: &Engine, frame: &mut Frame, entry: FrameEntry) -> VmResult<FrameExit> {
    let code = frame.code.clone();
    let tracer = engine.trace_hook();
    let record = code.profile().collects_feedback();
    let backedge_weight = engine.config().backedge_weight;

    trace!(target: "tiervm::vm", unit = code.name(), ip = frame.ip, ?entry, "eval frame");

    let mut pending = match entry {
        FrameEntry::Call => {
            if let Some(t) = &tracer {
                t.trace(&code, TraceEvent::Call);
            }
            None
        }
        FrameEntry::Resume(value) => {
            frame.push(value);
            None
        }
        FrameEntry::Throw(exc) => Some(Flow::Raise { exc, fresh: true }),
        FrameEntry::Continue => None,
    };

    loop {
        let flow = match pending.take() {
            Some(flow) => flow,
            None => step(engine, frame, &code, tracer.as_deref(), record)?,
        };

        let unwinding = match flow {
            Flow::Next => continue,
            Flow::Jump(target) => {
                if frame.lasti.is_some_and(|last| target <= last) {
                    code.profile().record_backedge(backedge_weight);
                }
                frame.ip = target;
                continue;
            }
            Flow::Yield(value) => return Ok(FrameExit::Yield(value)),
            Flow::Raise { exc, fresh } => {
                if fresh {
                    if let Some(t) = &tracer {
                        t.trace(&code, TraceEvent::Exception(&exc));
                    }
                }
                begin_raise(engine, frame, exc, fresh, EventKind::ExceptRaiseEval)
            }
            Flow::Unwind(u) => u,
        };

        if let Some(exit) = dispatch_unwind(engine, frame, unwinding, EventKind::ExceptCatchEval)? {
            if let (Some(t), FrameExit::Return(value)) = (&tracer, &exit) {
                t.trace(&code, TraceEvent::Return(value));
            }
            return Ok(exit);
        }
    }
}

/// Execute the instruction at `frame.ip`
fn step(
    engine: &Engine,
    frame: &mut Frame,
    code: &CodeUnit,
    tracer: Option<&dyn TraceHook>,
    record: bool,
) -> VmResult<Flow> {
    let ip = frame.ip;
    let instr = code.instr_at(ip).ok_or(VmError::IpOutOfBounds(ip))?;

    if let Some(t) = tracer {
        let jumped_back = frame.lasti.is_some_and(|last| ip <= last);
        if code.is_line_start(ip) || jumped_back {
            t.trace(code, TraceEvent::Line(instr.line));
        }
    }

    frame.lasti = Some(ip);
    frame.ip = instr.next;

    for (k, &(op, arg)) in instr.prims.iter().enumerate() {
        let flow = match exec_primitive(engine, frame, op, arg, SiteId::new(ip, k), record) {
            Ok(flow) => flow,
            Err(err) => Flow::from_error(err)?,
        };
        if !matches!(flow, Flow::Next) {
            return Ok(flow);
        }
    }
    Ok(Flow::Next)
}
