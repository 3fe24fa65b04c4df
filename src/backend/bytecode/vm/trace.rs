//! Tracing hook interface.
//!
//! A tracer sees calls, source lines, returns and exceptions of interpreted
//! frames. Native code cannot deliver these events, so while a tracer is
//! installed new activations stay in the interpreter and running native
//! frames bail at their next safe point.

use crate::backend::bytecode::code::CodeUnit;
use crate::backend::object::{ExceptionObj, Value};

/// Event delivered to a [`TraceHook`]
#[derive(Debug, Clone, Copy)]
pub enum TraceEvent<'a> {
    /// A frame started executing
    Call,
    /// Execution reached a new source line or jumped backwards
    Line(u32),
    /// A frame returned a value
    Return(&'a Value),
    /// An exception was raised in or propagated into a frame
    Exception(&'a ExceptionObj),
}

/// Receives interpreter trace events
pub trait TraceHook: Send + Sync {
    fn trace(&self, code: &CodeUnit, event: TraceEvent<'_>);
}

impl<F> TraceHook for F
where
    F: Fn(&CodeUnit, TraceEvent<'_>) + Send + Sync,
{
    fn trace(&self, code: &CodeUnit, event: TraceEvent<'_>) {
        self(code, event)
    }
}
