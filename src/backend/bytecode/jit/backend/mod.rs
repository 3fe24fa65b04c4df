//! Native Backends
//!
//! A backend turns an [`IrFunction`] into a [`NativeFunction`]. The rest of
//! the engine treats it as a black box: it only calls [`NativeFunction::run`]
//! on a frame and gets back either the frame's exit or a bail.
//!
//! # Backends
//!
//! - [`ThreadedBackend`]: pre-decoded closure-threaded code over the shared
//!   frame; handles every IR construct
//! - [`CraneliftBackend`]: machine code for integer kernels; anything outside
//!   its subset is reported as `NotCompilable`
//! - [`AutoBackend`]: Cranelift when possible, threaded otherwise
//!
//! # Bail contract
//!
//! When `run` returns [`NativeExit::Bail`], the frame is exactly what the
//! interpreter would have at the start of the instruction at `frame.ip`:
//! value stack, locals, block stack and `lasti` all agree with it.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use super::ir::IrFunction;
use super::types::{BackendKind, BailReason, JitError, JitResult, OptLevel};
use crate::backend::bytecode::frame::Frame;
use crate::backend::bytecode::vm::{FrameEntry, FrameExit, VmResult};
use crate::engine::Engine;

mod kernel;
mod threaded;

pub use kernel::CraneliftBackend;
pub use threaded::ThreadedBackend;

/// How a native run ended
#[derive(Debug)]
pub enum NativeExit {
    /// The frame returned or yielded
    Done(FrameExit),
    /// The frame must continue in the interpreter
    Bail(BailReason),
}

/// Executable form produced by a backend
pub trait NativeCode: Send + Sync {
    fn run(&self, engine: &Engine, frame: &mut Frame, entry: FrameEntry) -> VmResult<NativeExit>;
}

/// Compiled code for one unit
pub struct NativeFunction {
    pub name: Arc<str>,
    pub level: OptLevel,
    /// Backend that produced the code
    pub backend: BackendKind,
    code: Box<dyn NativeCode>,
    dump: String,
}

impl NativeFunction {
    pub fn new(
        name: Arc<str>,
        level: OptLevel,
        backend: BackendKind,
        code: Box<dyn NativeCode>,
        dump: String,
    ) -> Self {
        NativeFunction {
            name,
            level,
            backend,
            code,
            dump,
        }
    }

    #[inline]
    pub fn run(&self, engine: &Engine, frame: &mut Frame, entry: FrameEntry) -> VmResult<NativeExit> {
        self.code.run(engine, frame, entry)
    }

    /// Backend-specific listing of the generated code
    pub fn dump(&self) -> &str {
        &self.dump
    }
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFunction")
            .field("name", &self.name)
            .field("level", &self.level)
            .field("backend", &self.backend)
            .finish()
    }
}

/// `compile(IR, level) -> NativeFunction`
pub trait NativeBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn compile(&self, ir: &IrFunction, level: OptLevel) -> JitResult<NativeFunction>;
}

/// Cranelift for integer kernels, threaded code for everything else
#[derive(Debug, Default)]
pub struct AutoBackend {
    cranelift: CraneliftBackend,
    threaded: ThreadedBackend,
}

impl NativeBackend for AutoBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Auto
    }

    fn compile(&self, ir: &IrFunction, level: OptLevel) -> JitResult<NativeFunction> {
        match self.cranelift.compile(ir, level) {
            Err(JitError::NotCompilable(why)) => {
                debug!(
                    target: "tiervm::jit::backend",
                    unit = %ir.name,
                    reason = %why,
                    "not a kernel, using threaded code"
                );
                self.threaded.compile(ir, level)
            }
            other => other,
        }
    }
}

/// Backend for a configured kind
pub fn for_kind(kind: BackendKind) -> Box<dyn NativeBackend> {
    match kind {
        BackendKind::Threaded => Box::new(ThreadedBackend),
        BackendKind::Cranelift => Box::new(CraneliftBackend),
        BackendKind::Auto => Box::new(AutoBackend::default()),
    }
}
