//! Hybrid Execution
//!
//! Every activation of a code unit, and every generator resume, goes
//! through [`execute`]. It counts the activation, lets the tiered compiler
//! promote the unit, and runs the frame natively when native code is
//! installed and enabled. When native code bails, the frame continues in the
//! interpreter from the instruction boundary the bail left it at.
//!
//! ```text
//! execute(frame, entry)
//!   ├─ Call: count hotness, maybe compile
//!   ├─ tracer installed   -> trace-on-entry bail, interpret
//!   ├─ native runnable    -> run native
//!   │     └─ Bail(reason) -> bailout::handle, eval_frame(Continue)
//!   └─ otherwise          -> eval_frame(entry)
//! ```

use tracing::trace;

use super::backend::NativeExit;
use super::bailout;
use super::events::EventKind;
use super::types::BailReason;
use crate::backend::bytecode::frame::Frame;
use crate::backend::bytecode::vm::{eval_frame, FrameEntry, FrameExit, VmResult};
use crate::backend::object::{ExceptionKind, ExceptionObj};
use crate::engine::Engine;

/// Message of the exception raised at a guard bail in bail-error mode
pub const BAIL_ERROR_MESSAGE: &str = "bailed to the interpreter";

/// Run `frame` to its next exit in whichever tier is in force
pub fn execute(engine: &Engine, frame: &mut Frame, entry: FrameEntry) -> VmResult<FrameExit> {
    let code = frame.code.clone();
    let profile = code.profile();
    let is_call = matches!(entry, FrameEntry::Call);

    if is_call {
        engine.record_event(EventKind::CallStartEval);
        profile.record_entry();
        engine.tiered().maybe_compile(engine, &code, &frame.globals);
    }

    let state = profile.snapshot();
    let Some(native) = state.runnable() else {
        return interpret(engine, frame, entry, is_call);
    };

    if engine.trace_hook().is_some() {
        bailout::handle(engine, &code, frame, BailReason::TraceOnEntry);
        return interpret(engine, frame, entry, is_call);
    }

    trace!(
        target: "tiervm::jit::hybrid",
        unit = code.name(),
        level = %native.level,
        ?entry,
        "enter native"
    );
    if is_call {
        engine.record_event(EventKind::CallEnterNative);
    }
    engine.tiered().record_native_run();

    match native.run(engine, frame, entry)? {
        NativeExit::Done(exit) => Ok(exit),
        NativeExit::Bail(reason) => {
            bailout::handle(engine, &code, frame, reason);
            if reason.is_guard() && engine.bail_error() {
                let exc = ExceptionObj::with_message(ExceptionKind::RuntimeError, BAIL_ERROR_MESSAGE);
                return eval_frame(engine, frame, FrameEntry::Throw(exc));
            }
            eval_frame(engine, frame, FrameEntry::Continue)
        }
    }
}

fn interpret(engine: &Engine, frame: &mut Frame, entry: FrameEntry, is_call: bool) -> VmResult<FrameExit> {
    if !is_call {
        return eval_frame(engine, frame, entry);
    }
    engine.record_event(EventKind::CallEnterEval);
    engine.tiered().record_interpreted_run();
    let result = eval_frame(engine, frame, entry);
    engine.record_event(EventKind::CallEndEval);
    result
}
