//! Cranelift backend for integer kernels
//!
//! Units whose locals and stack values are all machine integers compile to
//! real machine code. Locals live in a buffer the host fills from the frame;
//! stack values are SSA values that only reach memory when the kernel bails.
//!
//! # Calling convention
//!
//! ```text
//! extern "C" fn(locals: *mut i64, bound: *mut u8, stack: *mut i64, poll: *const u8) -> i64
//! ```
//!
//! A negative status is a return whose value is in `stack[0]`; a status
//! `n >= 0` is a bail at [`BailPoint`] `n`, with the live stack spilled to
//! `stack[..]`. The host rebuilds the interpreter frame from the bail point.
//!
//! # Bail points
//!
//! Stores to locals are buffered until their instruction completes, so a
//! kernel can always bail at the start of the instruction it is executing:
//! - safe points bail when the engine's poll flag is set
//! - `+`, `-`, `*` and negation bail on overflow and let the interpreter
//!   raise `OverflowError`
//! - loads of unbound locals bail and let the interpreter raise
//!   `UnboundLocalError`
//! - a speculated branch going the other way completes the jump and bails
//!   at its target
//!
//! Anything else (calls, globals, exceptions, iteration, generators) is
//! reported as `NotCompilable`, as is a unit whose operand feedback already
//! saw a non-int at some arithmetic site.

use cranelift::prelude::*;
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{Linkage, Module};
use smallvec::SmallVec;
use tracing::{debug, trace};

use super::{NativeBackend, NativeCode, NativeExit, NativeFunction};
use crate::backend::bytecode::frame::{Block as FrameBlock, BlockKind, Frame};
use crate::backend::bytecode::instruction::jump_target;
use crate::backend::bytecode::jit::ir::{IrBlock, IrFunction, IrOp, SafePointKind, Terminator};
use crate::backend::bytecode::jit::types::{BackendKind, BailReason, JitError, JitResult, OptLevel};
use crate::backend::bytecode::opcodes::{CmpOp, Opcode};
use crate::backend::bytecode::vm::{FrameEntry, FrameExit, VmError, VmResult};
use crate::backend::object;
use crate::backend::ops::BinaryOp;
use crate::engine::Engine;

/// Status for a returned integer
const STATUS_RETURN_INT: i64 = -1;
/// Status for a returned boolean
const STATUS_RETURN_BOOL: i64 = -2;

type KernelFn = unsafe extern "C" fn(*mut i64, *mut u8, *mut i64, *const u8) -> i64;

/// Backend compiling integer kernels with Cranelift
#[derive(Debug, Default, Clone, Copy)]
pub struct CraneliftBackend;

impl NativeBackend for CraneliftBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Cranelift
    }

    fn compile(&self, ir: &IrFunction, level: OptLevel) -> JitResult<NativeFunction> {
        check_kernel(ir)?;

        let mut flag_builder = settings::builder();
        let opt = if level <= OptLevel::O0 { "none" } else { "speed" };
        flag_builder
            .set("opt_level", opt)
            .map_err(|e| JitError::Backend(format!("Failed to set opt_level: {}", e)))?;

        let isa_builder = cranelift_native::builder()
            .map_err(|e| JitError::Backend(format!("Failed to create ISA builder: {}", e)))?;
        let isa = isa_builder
            .finish(settings::Flags::new(flag_builder))
            .map_err(|e| JitError::Backend(format!("Failed to create ISA: {}", e)))?;

        let builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
        let mut module = JITModule::new(builder);

        let ptr = module.target_config().pointer_type();
        let mut sig = module.make_signature();
        for _ in 0..4 {
            sig.params.push(AbiParam::new(ptr));
        }
        sig.returns.push(AbiParam::new(types::I64));

        let name = format!("kernel_{}", ir.code_id);
        let func_id = module
            .declare_function(&name, Linkage::Local, &sig)
            .map_err(|e| JitError::Backend(format!("Failed to declare function: {}", e)))?;

        let mut ctx = module.make_context();
        ctx.func.signature = sig;
        let mut func_ctx = FunctionBuilderContext::new();

        let bails = {
            let mut builder = FunctionBuilder::new(&mut ctx.func, &mut func_ctx);
            let mut kb = KernelBuilder::new(ir, &mut builder);
            kb.build()?;
            let bails = kb.bails;
            builder.seal_all_blocks();
            builder.finalize();
            bails
        };

        let dump = format!("{}", ctx.func.display());

        module
            .define_function(func_id, &mut ctx)
            .map_err(|e| JitError::Backend(format!("Failed to define function: {}", e)))?;
        module.clear_context(&mut ctx);
        module
            .finalize_definitions()
            .map_err(|e| JitError::Backend(format!("Failed to finalize: {}", e)))?;

        let code_ptr = module.get_finalized_function(func_id);
        // SAFETY: the function was declared with exactly the `KernelFn` signature
        let entry: KernelFn = unsafe { std::mem::transmute(code_ptr) };

        debug!(
            target: "tiervm::jit::backend",
            unit = %ir.name,
            level = %level,
            bail_points = bails.len(),
            "kernel compiled"
        );

        let code = KernelCode {
            module: Some(module),
            entry,
            bails,
            nlocals: ir.nlocals,
            stack_size: ir.max_depth.max(1),
        };
        Ok(NativeFunction::new(
            ir.name.clone(),
            level,
            BackendKind::Cranelift,
            Box::new(code),
            dump,
        ))
    }
}

/// Reject units outside the kernel subset before building anything
fn check_kernel(ir: &IrFunction) -> JitResult<()> {
    let reject = |why: &str| Err(JitError::NotCompilable(why.to_string()));
    if ir.is_generator {
        return reject("generator");
    }
    if !ir.assumptions.is_empty() {
        return reject("global loads");
    }
    if ir.mixed_operand_sites > 0 {
        return reject("operands seen outside the integers");
    }
    if ir.handlers.iter().any(|h| h.kind != BlockKind::Loop) {
        return reject("exception handlers");
    }
    if ir.blocks.iter().any(|b| b.depth.is_some_and(|d| d != 0)) {
        return reject("values live across blocks");
    }
    Ok(())
}

// =============================================================================
// Bail table
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotTy {
    Int,
    Bool,
}

#[derive(Debug, Clone, Copy)]
enum BailKind {
    SafePoint(SafePointKind),
    Guard,
}

/// Interpreter state to rebuild at one bail site
#[derive(Debug, Clone)]
struct BailPoint {
    ip: usize,
    lasti: usize,
    kind: BailKind,
    stack: Vec<SlotTy>,
    blocks: SmallVec<[FrameBlock; 4]>,
}

// =============================================================================
// Code generation
// =============================================================================

#[derive(Clone, Copy)]
struct Slot {
    value: Value,
    ty: SlotTy,
}

/// Abstract state at an instruction boundary
#[derive(Clone)]
struct Snapshot {
    ip: usize,
    lasti: usize,
    stack: Vec<Slot>,
    blocks: SmallVec<[FrameBlock; 4]>,
}

struct KernelBuilder<'a, 'b> {
    ir: &'a IrFunction,
    b: &'a mut FunctionBuilder<'b>,
    blocks: Vec<Option<Block>>,
    locals: Value,
    bound: Value,
    stack_buf: Value,
    poll: Value,
    bails: Vec<BailPoint>,

    // Per-block state
    stack: Vec<Slot>,
    frame_blocks: SmallVec<[FrameBlock; 4]>,
    start: Option<Snapshot>,
    next_ip: usize,
    /// Local stores of the current instruction, committed when it completes
    pending: SmallVec<[(u32, Value); 4]>,
}

fn not_kernel<T>(why: impl Into<String>) -> JitResult<T> {
    Err(JitError::NotCompilable(why.into()))
}

impl<'a, 'b> KernelBuilder<'a, 'b> {
    fn new(ir: &'a IrFunction, b: &'a mut FunctionBuilder<'b>) -> Self {
        let entry = b.create_block();
        b.append_block_params_for_function_params(entry);
        b.switch_to_block(entry);
        let params = b.block_params(entry).to_vec();

        let blocks = ir
            .blocks
            .iter()
            .map(|blk| blk.depth.map(|_| b.create_block()))
            .collect();

        KernelBuilder {
            ir,
            b,
            blocks,
            locals: params[0],
            bound: params[1],
            stack_buf: params[2],
            poll: params[3],
            bails: Vec::new(),
            stack: Vec::new(),
            frame_blocks: SmallVec::new(),
            start: None,
            next_ip: 0,
            pending: SmallVec::new(),
        }
    }

    fn build(&mut self) -> JitResult<()> {
        let entry = self.target(self.ir.entry.index())?;
        self.b.ins().jump(entry, &[]);

        let ir = self.ir;
        for blk in &ir.blocks {
            let Some(cl_block) = self.blocks[blk.id.index()] else {
                continue;
            };
            self.b.switch_to_block(cl_block);
            self.enter_block(blk)?;
            for inst in &blk.insts {
                self.emit_op(inst.site.ip as usize, &inst.op)?;
            }
            self.commit();
            self.emit_terminator(blk)?;
        }
        Ok(())
    }

    fn target(&self, index: usize) -> JitResult<Block> {
        match self.blocks.get(index).copied().flatten() {
            Some(b) => Ok(b),
            None => not_kernel("edge into unanalyzed block"),
        }
    }

    fn enter_block(&mut self, blk: &IrBlock) -> JitResult<()> {
        self.stack.clear();
        self.pending.clear();
        self.start = None;
        self.frame_blocks.clear();
        for &h in &blk.handlers {
            let desc = self.ir.handler(h);
            let Some(level) = desc.depth else {
                return not_kernel("handler with unknown depth");
            };
            self.frame_blocks.push(FrameBlock {
                kind: desc.kind,
                handler: desc.target_ip,
                level,
            });
        }
        Ok(())
    }

    fn snapshot(&self, ip: usize) -> Snapshot {
        Snapshot {
            ip,
            lasti: ip,
            stack: self.stack.clone(),
            blocks: self.frame_blocks.clone(),
        }
    }

    /// Flush buffered local stores
    fn commit(&mut self) {
        for (idx, value) in std::mem::take(&mut self.pending) {
            let offset = (idx as i32) * 8;
            self.b.ins().store(MemFlags::trusted(), value, self.locals, offset);
            let one = self.b.ins().iconst(types::I8, 1);
            self.b.ins().store(MemFlags::trusted(), one, self.bound, idx as i32);
        }
    }

    /// Leave through a bail point when `cond` is nonzero
    fn bail_if(&mut self, cond: Value, at: &Snapshot, kind: BailKind) {
        let index = self.bails.len();
        self.bails.push(BailPoint {
            ip: at.ip,
            lasti: at.lasti,
            kind,
            stack: at.stack.iter().map(|s| s.ty).collect(),
            blocks: at.blocks.clone(),
        });

        let bail = self.b.create_block();
        let cont = self.b.create_block();
        self.b.ins().brif(cond, bail, &[], cont, &[]);

        self.b.switch_to_block(bail);
        for (i, slot) in at.stack.iter().enumerate() {
            self.b
                .ins()
                .store(MemFlags::trusted(), slot.value, self.stack_buf, (i as i32) * 8);
        }
        let status = self.b.ins().iconst(types::I64, index as i64);
        self.b.ins().return_(&[status]);

        self.b.switch_to_block(cont);
    }

    /// Bail at the start of the current instruction when `cond` is nonzero
    fn guard(&mut self, cond: Value) -> JitResult<()> {
        let Some(at) = self.start.clone() else {
            return not_kernel("guard outside an instruction");
        };
        self.bail_if(cond, &at, BailKind::Guard);
        Ok(())
    }

    fn pop(&mut self) -> JitResult<Slot> {
        match self.stack.pop() {
            Some(slot) => Ok(slot),
            None => not_kernel("stack underflow"),
        }
    }

    fn pop_int(&mut self) -> JitResult<Value> {
        let slot = self.pop()?;
        match slot.ty {
            SlotTy::Int => Ok(slot.value),
            SlotTy::Bool => not_kernel("boolean operand"),
        }
    }

    fn push(&mut self, value: Value, ty: SlotTy) {
        self.stack.push(Slot { value, ty });
    }

    fn emit_op(&mut self, ip: usize, op: &IrOp) -> JitResult<()> {
        match op {
            IrOp::SafePoint(kind) => {
                self.commit();
                let at = self.snapshot(ip);
                let flag = self.b.ins().load(types::I8, MemFlags::trusted(), self.poll, 0);
                self.bail_if(flag, &at, BailKind::SafePoint(*kind));
                Ok(())
            }
            IrOp::Begin { next } => {
                self.commit();
                self.start = Some(self.snapshot(ip));
                self.next_ip = *next;
                Ok(())
            }
            IrOp::Prim { op, arg } => self.emit_prim(*op, *arg),
            IrOp::PushHandler(h) => {
                let desc = self.ir.handler(*h);
                self.frame_blocks.push(FrameBlock {
                    kind: desc.kind,
                    handler: desc.target_ip,
                    level: self.stack.len(),
                });
                Ok(())
            }
            IrOp::GuardGlobals { .. } | IrOp::LoadCached(_) => not_kernel("global loads"),
            IrOp::CallDirect { .. } => not_kernel("calls"),
            IrOp::IntBinary { op } => self.emit_prim(*op, None),
        }
    }

    fn emit_prim(&mut self, op: Opcode, arg: Option<u32>) -> JitResult<()> {
        if let Some(bop) = op.binary_op().or_else(|| op.inplace_op()) {
            return self.emit_binary(bop);
        }
        let arg_of = |arg: Option<u32>| match arg {
            Some(a) => Ok(a),
            None => not_kernel(format!("{} without argument", op)),
        };

        match op {
            Opcode::Nop => {}
            Opcode::PopTop => {
                self.pop()?;
            }
            Opcode::DupTop => {
                let top = self.pop()?;
                self.stack.push(top);
                self.stack.push(top);
            }
            Opcode::RotTwo => {
                let a = self.pop()?;
                let b = self.pop()?;
                self.stack.push(a);
                self.stack.push(b);
            }
            Opcode::RotThree => {
                let a = self.pop()?;
                let b = self.pop()?;
                let c = self.pop()?;
                self.stack.push(a);
                self.stack.push(c);
                self.stack.push(b);
            }
            Opcode::LoadConst => {
                let idx = arg_of(arg)? as usize;
                match self.ir.consts.get(idx) {
                    Some(object::Value::Int(v)) => {
                        let v = self.b.ins().iconst(types::I64, *v);
                        self.push(v, SlotTy::Int);
                    }
                    Some(object::Value::Bool(v)) => {
                        let v = self.b.ins().iconst(types::I64, *v as i64);
                        self.push(v, SlotTy::Bool);
                    }
                    _ => return not_kernel("non-integer constant"),
                }
            }
            Opcode::LoadFast => {
                let idx = arg_of(arg)?;
                if idx as usize >= self.ir.nlocals {
                    return not_kernel("local index out of range");
                }
                let buffered = self.pending.iter().rev().find(|(i, _)| *i == idx).map(|(_, v)| *v);
                let value = match buffered {
                    Some(v) => v,
                    None => {
                        let flag = self.b.ins().load(types::I8, MemFlags::trusted(), self.bound, idx as i32);
                        let unbound = self.b.ins().icmp_imm(IntCC::Equal, flag, 0);
                        self.guard(unbound)?;
                        self.b
                            .ins()
                            .load(types::I64, MemFlags::trusted(), self.locals, (idx as i32) * 8)
                    }
                };
                self.push(value, SlotTy::Int);
            }
            Opcode::StoreFast => {
                let idx = arg_of(arg)?;
                if idx as usize >= self.ir.nlocals {
                    return not_kernel("local index out of range");
                }
                let value = self.pop_int()?;
                self.pending.push((idx, value));
            }
            Opcode::UnaryNegative => {
                let v = self.pop_int()?;
                let overflow = self.b.ins().icmp_imm(IntCC::Equal, v, i64::MIN);
                self.guard(overflow)?;
                let r = self.b.ins().ineg(v);
                self.push(r, SlotTy::Int);
            }
            Opcode::CompareOp => {
                let cc = match CmpOp::from_arg(arg_of(arg)?) {
                    Some(CmpOp::Lt) => IntCC::SignedLessThan,
                    Some(CmpOp::Le) => IntCC::SignedLessThanOrEqual,
                    Some(CmpOp::Eq) => IntCC::Equal,
                    Some(CmpOp::Ne) => IntCC::NotEqual,
                    Some(CmpOp::Gt) => IntCC::SignedGreaterThan,
                    Some(CmpOp::Ge) => IntCC::SignedGreaterThanOrEqual,
                    _ => return not_kernel("comparison"),
                };
                let rhs = self.pop_int()?;
                let lhs = self.pop_int()?;
                let c = self.b.ins().icmp(cc, lhs, rhs);
                let v = self.b.ins().uextend(types::I64, c);
                self.push(v, SlotTy::Bool);
            }
            Opcode::PopBlock => match self.frame_blocks.pop() {
                Some(block) => self.stack.truncate(block.level),
                None => return not_kernel("block stack underflow"),
            },
            other => return not_kernel(format!("opcode {}", other)),
        }
        Ok(())
    }

    fn emit_binary(&mut self, bop: BinaryOp) -> JitResult<()> {
        let rhs = self.pop_int()?;
        let lhs = self.pop_int()?;
        let result = match bop {
            BinaryOp::Add => {
                let r = self.b.ins().iadd(lhs, rhs);
                let x = self.b.ins().bxor(lhs, r);
                let y = self.b.ins().bxor(rhs, r);
                let t = self.b.ins().band(x, y);
                let overflow = self.b.ins().icmp_imm(IntCC::SignedLessThan, t, 0);
                self.guard(overflow)?;
                r
            }
            BinaryOp::Sub => {
                let r = self.b.ins().isub(lhs, rhs);
                let x = self.b.ins().bxor(lhs, rhs);
                let y = self.b.ins().bxor(lhs, r);
                let t = self.b.ins().band(x, y);
                let overflow = self.b.ins().icmp_imm(IntCC::SignedLessThan, t, 0);
                self.guard(overflow)?;
                r
            }
            BinaryOp::Mul => {
                let lo = self.b.ins().imul(lhs, rhs);
                let hi = self.b.ins().smulhi(lhs, rhs);
                let sign = self.b.ins().sshr_imm(lo, 63);
                let overflow = self.b.ins().icmp(IntCC::NotEqual, hi, sign);
                self.guard(overflow)?;
                lo
            }
            BinaryOp::And => self.b.ins().band(lhs, rhs),
            BinaryOp::Or => self.b.ins().bor(lhs, rhs),
            BinaryOp::Xor => self.b.ins().bxor(lhs, rhs),
            other => return not_kernel(format!("operator {:?}", other)),
        };
        self.push(result, SlotTy::Int);
        Ok(())
    }

    fn emit_terminator(&mut self, blk: &IrBlock) -> JitResult<()> {
        match &blk.term {
            Terminator::Goto(t) => {
                self.expect_empty()?;
                let t = self.target(t.index())?;
                self.b.ins().jump(t, &[]);
            }
            Terminator::Branch {
                op,
                taken,
                fallthrough,
                ..
            } => {
                let cond = self.pop()?.value;
                self.expect_empty()?;
                let taken = self.target(taken.index())?;
                let fallthrough = self.target(fallthrough.index())?;
                match op {
                    Opcode::PopJumpIfFalse => self.b.ins().brif(cond, fallthrough, &[], taken, &[]),
                    Opcode::PopJumpIfTrue => self.b.ins().brif(cond, taken, &[], fallthrough, &[]),
                    _ => return not_kernel("conditional jump keeping its operand"),
                };
            }
            Terminator::Speculate {
                op,
                arg,
                expected,
                next,
                ..
            } => {
                let cond = self.pop()?.value;
                self.expect_empty()?;
                let Some(start) = self.start.as_ref() else {
                    return not_kernel("branch outside an instruction");
                };
                let lasti = start.ip;
                let expect_jump = (*op == Opcode::PopJumpIfTrue) == *expected;
                let other_ip = if expect_jump {
                    self.next_ip
                } else {
                    match jump_target(*op, *arg, self.next_ip) {
                        Some(t) => t,
                        None => return not_kernel("jump without target"),
                    }
                };
                let at = Snapshot {
                    ip: other_ip,
                    lasti,
                    stack: Vec::new(),
                    blocks: self.frame_blocks.clone(),
                };
                let mismatch = if *expected {
                    self.b.ins().icmp_imm(IntCC::Equal, cond, 0)
                } else {
                    self.b.ins().icmp_imm(IntCC::NotEqual, cond, 0)
                };
                self.bail_if(mismatch, &at, BailKind::Guard);
                let next = self.target(next.index())?;
                self.b.ins().jump(next, &[]);
            }
            Terminator::Return { .. } => {
                let slot = self.pop()?;
                self.b.ins().store(MemFlags::trusted(), slot.value, self.stack_buf, 0);
                let status = match slot.ty {
                    SlotTy::Int => STATUS_RETURN_INT,
                    SlotTy::Bool => STATUS_RETURN_BOOL,
                };
                let status = self.b.ins().iconst(types::I64, status);
                self.b.ins().return_(&[status]);
            }
            Terminator::ForIter { .. } => return not_kernel("iteration"),
            Terminator::Yield { .. } => return not_kernel("generator"),
            Terminator::Unwind { op, .. } => return not_kernel(format!("unwinding {}", op)),
            Terminator::Trap { .. } => return not_kernel("falls off the end"),
        }
        Ok(())
    }

    fn expect_empty(&self) -> JitResult<()> {
        if self.stack.is_empty() {
            Ok(())
        } else {
            not_kernel("values live across blocks")
        }
    }
}

// =============================================================================
// Execution
// =============================================================================

struct KernelCode {
    module: Option<JITModule>,
    entry: KernelFn,
    bails: Vec<BailPoint>,
    nlocals: usize,
    stack_size: usize,
}

// SAFETY: the module is only touched again in `drop`; the finalized code is
// immutable and reentrant.
unsafe impl Send for KernelCode {}
unsafe impl Sync for KernelCode {}

impl Drop for KernelCode {
    fn drop(&mut self) {
        if let Some(module) = self.module.take() {
            // SAFETY: `entry` points into this module and dies with `self`
            unsafe { module.free_memory() };
        }
    }
}

impl NativeCode for KernelCode {
    fn run(&self, engine: &Engine, frame: &mut Frame, entry: FrameEntry) -> VmResult<NativeExit> {
        if !matches!(entry, FrameEntry::Call) {
            return Err(VmError::Runtime(format!(
                "kernel for {} entered with {:?}",
                frame.code.name(),
                entry
            )));
        }
        if frame.locals.len() != self.nlocals {
            return Err(VmError::Runtime("kernel local count mismatch".into()));
        }

        let slots = self.nlocals.max(1);
        let mut locals = vec![0i64; slots];
        let mut bound = vec![0u8; slots];
        for (i, slot) in frame.locals.iter().enumerate() {
            match slot {
                None => {}
                Some(object::Value::Int(v)) => {
                    locals[i] = *v;
                    bound[i] = 1;
                }
                Some(_) => return Ok(NativeExit::Bail(BailReason::FatalGuardFail)),
            }
        }
        let mut stack = vec![0i64; self.stack_size];

        // SAFETY: buffers are sized for every local and the deepest stack;
        // the poll flag outlives the call
        let status = unsafe {
            (self.entry)(
                locals.as_mut_ptr(),
                bound.as_mut_ptr(),
                stack.as_mut_ptr(),
                engine.poll_flag_ptr(),
            )
        };

        match status {
            STATUS_RETURN_INT => Ok(NativeExit::Done(FrameExit::Return(object::Value::Int(stack[0])))),
            STATUS_RETURN_BOOL => Ok(NativeExit::Done(FrameExit::Return(object::Value::Bool(
                stack[0] != 0,
            )))),
            n => {
                let point = usize::try_from(n)
                    .ok()
                    .and_then(|n| self.bails.get(n))
                    .ok_or_else(|| VmError::Runtime(format!("unknown kernel status {}", n)))?;
                rebuild_frame(frame, point, &locals, &bound, &stack);
                trace!(
                    target: "tiervm::jit::backend",
                    unit = frame.code.name(),
                    ip = point.ip,
                    kind = ?point.kind,
                    "kernel bail"
                );
                let reason = match point.kind {
                    BailKind::SafePoint(kind) => engine
                        .poll_safe_point(kind)
                        .unwrap_or(BailReason::Requested),
                    BailKind::Guard => BailReason::GuardFail,
                };
                Ok(NativeExit::Bail(reason))
            }
        }
    }
}

/// Reconstruct the interpreter frame at a bail point
fn rebuild_frame(frame: &mut Frame, point: &BailPoint, locals: &[i64], bound: &[u8], stack: &[i64]) {
    for (i, slot) in frame.locals.iter_mut().enumerate() {
        *slot = (bound[i] != 0).then(|| object::Value::Int(locals[i]));
    }
    frame.stack.clear();
    for (ty, raw) in point.stack.iter().zip(stack) {
        frame.push(match ty {
            SlotTy::Int => object::Value::Int(*raw),
            SlotTy::Bool => object::Value::Bool(*raw != 0),
        });
    }
    frame.blocks = point.blocks.iter().copied().collect();
    frame.ip = point.ip;
    frame.lasti = Some(point.lasti);
}
