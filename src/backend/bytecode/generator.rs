//! Generators
//!
//! A generator owns the suspended [`Frame`] of a generator function. Each
//! resume hands the frame to the hybrid executor, so a generator started in
//! the interpreter may later resume in native code and the other way round:
//! the frame's `lasti` (the index of the last `YIELD_VALUE`) is all either
//! tier needs to continue.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use super::frame::Frame;
use super::jit::hybrid;
use super::vm::{DepthGuard, FrameEntry, FrameExit, VmError, VmResult};
use crate::backend::object::{ExceptionKind, ExceptionObj, Value};
use crate::engine::Engine;

struct GenState {
    /// `None` once the generator finished
    frame: Option<Box<Frame>>,
    running: bool,
}

/// A suspended generator activation
pub struct Generator {
    name: Arc<str>,
    state: Mutex<GenState>,
}

/// How to resume a generator
enum Resume {
    Send(Value),
    Throw(Arc<ExceptionObj>),
}

impl Generator {
    pub fn new(frame: Frame) -> Arc<Self> {
        Arc::new(Generator {
            name: Arc::from(frame.code.name()),
            state: Mutex::new(GenState {
                frame: Some(Box::new(frame)),
                running: false,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        let state = self.state.lock();
        !state.running && state.frame.is_none()
    }

    /// Resume with `value` as the result of the pending `yield`
    pub fn send(&self, engine: &Engine, value: Value) -> VmResult<Value> {
        self.resume(engine, Resume::Send(value))
    }

    /// Raise `exc` at the pending `yield`
    pub fn throw(&self, engine: &Engine, exc: Arc<ExceptionObj>) -> VmResult<Value> {
        self.resume(engine, Resume::Throw(exc))
    }

    /// Throw `GeneratorExit` into a suspended generator
    pub fn close(&self, engine: &Engine) -> VmResult<()> {
        {
            let mut state = self.state.lock();
            if state.running {
                return Err(VmError::raise(
                    ExceptionKind::ValueError,
                    "generator already executing",
                ));
            }
            match &state.frame {
                None => return Ok(()),
                Some(frame) if frame.lasti.is_none() => {
                    state.frame = None;
                    return Ok(());
                }
                Some(_) => {}
            }
        }

        let exit = ExceptionObj::new(ExceptionKind::GeneratorExit, Vec::new());
        match self.throw(engine, exit) {
            Ok(_) => Err(VmError::raise(
                ExceptionKind::RuntimeError,
                "generator ignored GeneratorExit",
            )),
            Err(e)
                if e.is_exception(ExceptionKind::GeneratorExit)
                    || e.is_exception(ExceptionKind::StopIteration) =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn resume(&self, engine: &Engine, how: Resume) -> VmResult<Value> {
        let mut frame = {
            let mut state = self.state.lock();
            if state.running {
                return Err(VmError::raise(
                    ExceptionKind::ValueError,
                    "generator already executing",
                ));
            }
            match state.frame.take() {
                Some(frame) => {
                    state.running = true;
                    frame
                }
                None => {
                    return Err(match how {
                        Resume::Send(_) => {
                            VmError::Raised(ExceptionObj::new(ExceptionKind::StopIteration, Vec::new()))
                        }
                        Resume::Throw(exc) => VmError::Raised(exc),
                    })
                }
            }
        };

        let entry = match (frame.lasti.is_some(), how) {
            (false, Resume::Send(Value::None)) => FrameEntry::Call,
            (false, Resume::Send(_)) => {
                let mut state = self.state.lock();
                state.running = false;
                state.frame = Some(frame);
                return Err(VmError::raise(
                    ExceptionKind::TypeError,
                    "can't send non-None value to a just-started generator",
                ));
            }
            (true, Resume::Send(value)) => FrameEntry::Resume(value),
            (_, Resume::Throw(exc)) => FrameEntry::Throw(exc),
        };

        trace!(target: "tiervm::vm::generator", name = %self.name, ?entry, "resume");
        let result = DepthGuard::enter(engine.config().recursion_limit)
            .and_then(|_depth| hybrid::execute(engine, &mut frame, entry));

        let mut state = self.state.lock();
        state.running = false;
        match result {
            Ok(FrameExit::Yield(value)) => {
                state.frame = Some(frame);
                Ok(value)
            }
            Ok(FrameExit::Return(_)) => Err(VmError::Raised(ExceptionObj::new(
                ExceptionKind::StopIteration,
                Vec::new(),
            ))),
            Err(e) => Err(e),
        }
    }
}

impl std::fmt::Debug for Generator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generator")
            .field("name", &self.name)
            .field("finished", &self.is_finished())
            .finish()
    }
}
