//! Closure-threaded backend
//!
//! Each IR operation is pre-decoded into a boxed closure over the shared
//! [`Frame`]; terminators are dispatched by the run loop. Primitives run
//! through the interpreter's own [`exec_primitive`] and unwinding goes
//! through the same block-stack helpers, so a bail leaves nothing to
//! translate: the frame already is the interpreter's frame.

use std::sync::Arc;

use tracing::trace;

use super::{NativeBackend, NativeCode, NativeExit, NativeFunction};
use crate::backend::bytecode::frame::Frame;
use crate::backend::bytecode::jit::events::EventKind;
use crate::backend::bytecode::jit::feedback::SiteId;
use crate::backend::bytecode::jit::ir::{BlockId, IrFunction, IrOp, Terminator};
use crate::backend::bytecode::jit::types::{BackendKind, BailReason, JitResult, OptLevel};
use crate::backend::bytecode::opcodes::Opcode;
use crate::backend::bytecode::vm::{
    begin_raise, call_value, dispatch_unwind, exec_primitive, Flow, FrameEntry, FrameExit,
    VmError, VmResult,
};
use crate::backend::object::Value;
use crate::backend::ops::int_binary;
use crate::engine::Engine;

/// Backend producing closure-threaded code
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadedBackend;

impl NativeBackend for ThreadedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Threaded
    }

    fn compile(&self, ir: &IrFunction, level: OptLevel) -> JitResult<NativeFunction> {
        let blocks: Vec<ThreadedBlock> = ir
            .blocks
            .iter()
            .map(|block| ThreadedBlock {
                start: block.start,
                ops: block.insts.iter().map(|inst| thread_op(ir, inst.site, &inst.op)).collect(),
                term: block.term.clone(),
            })
            .collect();

        let nops: usize = blocks.iter().map(|b| b.ops.len()).sum();
        trace!(
            target: "tiervm::jit::backend",
            unit = %ir.name,
            blocks = blocks.len(),
            ops = nops,
            "threaded code built"
        );

        let dump = format!(
            "threaded {} at {}: {} blocks, {} ops\n{}",
            ir.name,
            level,
            blocks.len(),
            nops,
            ir
        );
        let code = ThreadedCode {
            blocks,
            entry: ir.entry,
            ir: Arc::new(ir.clone()),
        };
        Ok(NativeFunction::new(
            ir.name.clone(),
            level,
            BackendKind::Threaded,
            Box::new(code),
            dump,
        ))
    }
}

// =============================================================================
// Threaded form
// =============================================================================

/// Result of one threaded operation
enum Step {
    Next,
    Bail(BailReason),
    Flow(Flow),
}

type OpFn = Box<dyn Fn(&Engine, &mut Frame) -> VmResult<Step> + Send + Sync>;

struct ThreadedBlock {
    start: usize,
    ops: Vec<OpFn>,
    term: Terminator,
}

struct ThreadedCode {
    blocks: Vec<ThreadedBlock>,
    entry: BlockId,
    /// Block lookup for handler and resume targets
    ir: Arc<IrFunction>,
}

/// Map a primitive outcome onto a threaded step
#[inline]
fn step_of(result: VmResult<Flow>) -> VmResult<Step> {
    let flow = match result {
        Ok(flow) => flow,
        Err(err) => Flow::from_error(err)?,
    };
    Ok(match flow {
        Flow::Next => Step::Next,
        other => Step::Flow(other),
    })
}

fn thread_op(ir: &IrFunction, site: SiteId, op: &IrOp) -> OpFn {
    let ip = site.ip as usize;
    match op.clone() {
        IrOp::SafePoint(kind) => Box::new(move |engine: &Engine, _frame: &mut Frame| {
            Ok(match engine.poll_safe_point(kind) {
                Some(reason) => Step::Bail(reason),
                None => Step::Next,
            })
        }),
        IrOp::GuardGlobals {
            globals,
            globals_version,
            builtins,
            builtins_version,
        } => Box::new(move |_engine: &Engine, frame: &mut Frame| {
            let holds = frame.globals.id() == globals
                && frame.globals.version() == globals_version
                && frame.builtins.id() == builtins
                && frame.builtins.version() == builtins_version;
            Ok(if holds {
                Step::Next
            } else {
                Step::Bail(BailReason::FatalGuardFail)
            })
        }),
        IrOp::Begin { next } => Box::new(move |_engine: &Engine, frame: &mut Frame| {
            frame.lasti = Some(ip);
            frame.ip = next;
            Ok(Step::Next)
        }),
        IrOp::Prim { op, arg } => Box::new(move |engine: &Engine, frame: &mut Frame| {
            step_of(exec_primitive(engine, frame, op, arg, site, false))
        }),
        IrOp::PushHandler(h) => {
            let desc = ir.handler(h).clone();
            Box::new(move |_engine: &Engine, frame: &mut Frame| {
                step_of(frame.push_block(desc.kind, desc.target_ip).map(|()| Flow::Next))
            })
        }
        IrOp::LoadCached(a) => {
            let value = ir.assumptions[a].value.clone();
            Box::new(move |_engine: &Engine, frame: &mut Frame| {
                frame.push(value.clone());
                Ok(Step::Next)
            })
        }
        IrOp::CallDirect { arg, expected } => {
            let argc = (arg & 0xff) as usize;
            let nkw = ((arg >> 8) & 0xff) as usize;
            Box::new(move |engine: &Engine, frame: &mut Frame| {
                if nkw != 0 || !frame.peek(argc)?.is_same(&expected) {
                    return step_of(exec_primitive(
                        engine,
                        frame,
                        Opcode::CallFunction,
                        Some(arg),
                        site,
                        false,
                    ));
                }
                let args = frame.pop_n(argc)?;
                frame.pop()?;
                step_of(call_value(engine, &expected, args, Vec::new()).map(|result| {
                    frame.push(result);
                    Flow::Next
                }))
            })
        }
        IrOp::IntBinary { op } => {
            let Some(bop) = op.binary_op().or_else(|| op.inplace_op()) else {
                return Box::new(move |engine: &Engine, frame: &mut Frame| {
                    step_of(exec_primitive(engine, frame, op, None, site, false))
                });
            };
            Box::new(move |engine: &Engine, frame: &mut Frame| {
                let ints = match (frame.peek(1)?, frame.peek(0)?) {
                    (Value::Int(a), Value::Int(b)) => Some((*a, *b)),
                    _ => None,
                };
                // Overflow and zero division take the generic path, which raises.
                if let Some(Ok(Some(result))) = ints.map(|(a, b)| int_binary(bop, a, b)) {
                    frame.pop()?;
                    frame.pop()?;
                    frame.push(Value::Int(result));
                    return Ok(Step::Next);
                }
                step_of(exec_primitive(engine, frame, op, None, site, false))
            })
        }
    }
}

/// Where a non-local transfer ended up
enum Landing {
    At(BlockId),
    Exit(FrameExit),
    Bail(BailReason),
}

impl ThreadedCode {
    /// Block starting at `frame.ip`, or a bail if the graph has none there
    fn land(&self, frame: &Frame) -> Landing {
        match self.ir.block_at(frame.ip) {
            Some(b) => Landing::At(b),
            None => Landing::Bail(BailReason::GuardFail),
        }
    }

    /// Route a flow that left straight-line code
    fn settle(&self, engine: &Engine, frame: &mut Frame, flow: Flow) -> VmResult<Landing> {
        let pending = match flow {
            Flow::Next => return Ok(self.land(frame)),
            Flow::Jump(target) => {
                frame.ip = target;
                return Ok(self.land(frame));
            }
            Flow::Yield(value) => return Ok(Landing::Exit(FrameExit::Yield(value))),
            Flow::Raise { exc, fresh } => {
                begin_raise(engine, frame, exc, fresh, EventKind::ExceptRaiseNative)
            }
            Flow::Unwind(u) => u,
        };
        match dispatch_unwind(engine, frame, pending, EventKind::ExceptCatchNative)? {
            Some(exit) => Ok(Landing::Exit(exit)),
            None => Ok(self.land(frame)),
        }
    }

    fn entry_landing(&self, engine: &Engine, frame: &mut Frame, entry: FrameEntry) -> VmResult<Landing> {
        match entry {
            FrameEntry::Call => Ok(Landing::At(self.entry)),
            FrameEntry::Resume(value) => {
                frame.push(value);
                let resume = frame.lasti.and_then(|lasti| self.ir.resume_block(lasti));
                match resume {
                    Some(b) => Ok(Landing::At(b)),
                    None => Ok(self.land(frame)),
                }
            }
            FrameEntry::Throw(exc) => self.settle(engine, frame, Flow::Raise { exc, fresh: true }),
            FrameEntry::Continue => Ok(self.land(frame)),
        }
    }
}

impl NativeCode for ThreadedCode {
    fn run(&self, engine: &Engine, frame: &mut Frame, entry: FrameEntry) -> VmResult<NativeExit> {
        let mut current = match self.entry_landing(engine, frame, entry)? {
            Landing::At(b) => b,
            Landing::Exit(exit) => return Ok(NativeExit::Done(exit)),
            Landing::Bail(reason) => return Ok(NativeExit::Bail(reason)),
        };

        loop {
            let block = &self.blocks[current.index()];
            frame.ip = block.start;

            let mut escaped = None;
            for op in &block.ops {
                match op(engine, frame)? {
                    Step::Next => {}
                    Step::Bail(reason) => return Ok(NativeExit::Bail(reason)),
                    Step::Flow(flow) => {
                        escaped = Some(flow);
                        break;
                    }
                }
            }

            let landing = match escaped {
                Some(flow) => self.settle(engine, frame, flow)?,
                None => self.terminate(engine, frame, &block.term)?,
            };
            current = match landing {
                Landing::At(b) => b,
                Landing::Exit(exit) => return Ok(NativeExit::Done(exit)),
                Landing::Bail(reason) => return Ok(NativeExit::Bail(reason)),
            };
        }
    }
}

impl ThreadedCode {
    fn terminate(&self, engine: &Engine, frame: &mut Frame, term: &Terminator) -> VmResult<Landing> {
        let run = |frame: &mut Frame, op: Opcode, arg: Option<u32>, site: SiteId| -> VmResult<Flow> {
            match exec_primitive(engine, frame, op, arg, site, false) {
                Ok(flow) => Ok(flow),
                Err(err) => Flow::from_error(err),
            }
        };

        match term {
            Terminator::Goto(b) => Ok(Landing::At(*b)),
            Terminator::Branch {
                op,
                arg,
                site,
                taken,
                fallthrough,
            } => match run(frame, *op, Some(*arg), *site)? {
                Flow::Next => Ok(Landing::At(*fallthrough)),
                Flow::Jump(_) => Ok(Landing::At(*taken)),
                other => self.settle(engine, frame, other),
            },
            Terminator::Speculate {
                op,
                arg,
                site,
                expected,
                next,
            } => {
                let expect_jump = (*op == Opcode::PopJumpIfTrue) == *expected;
                match run(frame, *op, Some(*arg), *site)? {
                    Flow::Next if !expect_jump => Ok(Landing::At(*next)),
                    Flow::Jump(_) if expect_jump => Ok(Landing::At(*next)),
                    Flow::Next => Ok(Landing::Bail(BailReason::GuardFail)),
                    Flow::Jump(target) => {
                        frame.ip = target;
                        Ok(Landing::Bail(BailReason::GuardFail))
                    }
                    other => self.settle(engine, frame, other),
                }
            }
            Terminator::ForIter {
                arg,
                site,
                body,
                exit,
            } => match run(frame, Opcode::ForIter, Some(*arg), *site)? {
                Flow::Next => Ok(Landing::At(*body)),
                Flow::Jump(_) => Ok(Landing::At(*exit)),
                other => self.settle(engine, frame, other),
            },
            Terminator::Return { site } => {
                let flow = run(frame, Opcode::ReturnValue, None, *site)?;
                self.settle(engine, frame, flow)
            }
            Terminator::Yield { site, .. } => {
                let flow = run(frame, Opcode::YieldValue, None, *site)?;
                self.settle(engine, frame, flow)
            }
            Terminator::Unwind {
                op,
                arg,
                site,
                fallthrough,
            } => match (run(frame, *op, *arg, *site)?, fallthrough) {
                (Flow::Next, Some(b)) => Ok(Landing::At(*b)),
                (Flow::Next, None) => Err(VmError::IpOutOfBounds(frame.ip)),
                (other, _) => self.settle(engine, frame, other),
            },
            Terminator::Trap { ip } => Err(VmError::IpOutOfBounds(*ip)),
        }
    }
}
