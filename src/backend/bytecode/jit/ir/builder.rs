//! Lowering Pass
//!
//! Translates a code unit into an [`IrFunction`] in three steps:
//!
//! 1. **Leaders**: instruction 0, every jump and handler target, and every
//!    instruction following a control transfer start a basic block.
//! 2. **Stack analysis**: a worklist pass computes the static stack depth
//!    and handler stack at every reachable instruction, checking that they
//!    agree wherever control merges. `END_FINALLY` falls through only when
//!    its clause was entered normally, so its fall-through edge is weak: it
//!    never conflicts with, and is replaced by, any other incoming edge.
//! 3. **Emission**: each block is filled with `Begin`/primitive operations,
//!    specialized from feedback at level 2, then cleaned up at level 1 and
//!    above. Binary operators whose feedback saw non-int operands are
//!    counted so a backend can tell the unit is no integer kernel.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use smallvec::SmallVec;
use tracing::{debug, trace};

use super::optimize;
use super::{
    BlockId, GlobalAssumption, HandlerDesc, HandlerId, IrBlock, IrFunction, IrInst, IrOp,
    SafePointKind, Terminator,
};
use crate::backend::bytecode::code::{CodeUnit, Instr};
use crate::backend::bytecode::frame::{BlockKind, MAX_BLOCKS};
use crate::backend::bytecode::instruction::jump_target;
use crate::backend::bytecode::jit::feedback::{LimitedFeedback, SiteId};
use crate::backend::bytecode::jit::types::{JitError, JitResult, OptLevel};
use crate::backend::bytecode::opcodes::Opcode;
use crate::backend::object::{Namespace, TypeTag};

/// Default observations a branch needs before it is speculated
pub const DEFAULT_BRANCH_MIN_SAMPLES: u64 = 200;

/// Inputs to [`lower`] besides the code itself
#[derive(Debug, Clone)]
pub struct LowerOptions {
    pub level: OptLevel,
    /// Observations a branch needs before level 2 speculates on it
    pub branch_min_samples: u64,
    /// Namespaces the unit runs against, for caching global bindings
    pub globals: Option<Arc<Namespace>>,
    pub builtins: Option<Arc<Namespace>>,
}

impl LowerOptions {
    pub fn new(level: OptLevel) -> Self {
        LowerOptions {
            level,
            branch_min_samples: DEFAULT_BRANCH_MIN_SAMPLES,
            globals: None,
            builtins: None,
        }
    }

    pub fn with_namespaces(mut self, globals: Arc<Namespace>, builtins: Arc<Namespace>) -> Self {
        self.globals = Some(globals);
        self.builtins = Some(builtins);
        self
    }

    pub fn with_branch_min_samples(mut self, samples: u64) -> Self {
        self.branch_min_samples = samples;
        self
    }
}

/// Lower `code` to IR at `opts.level`
pub fn lower(code: &CodeUnit, opts: &LowerOptions) -> JitResult<IrFunction> {
    if opts.level == OptLevel::Unoptimized {
        return Err(JitError::InvalidOptLevel(opts.level.as_i32()));
    }

    let instrs = code.instrs();
    let index_of: HashMap<usize, usize> = instrs.iter().enumerate().map(|(i, ins)| (ins.ip, i)).collect();

    let leaders = find_leaders(instrs);
    let mut analysis = Analysis::new(instrs, &index_of);
    analysis.run()?;

    let mut lowering = Lowering {
        code,
        opts,
        analysis: &analysis,
        leaders: leaders.iter().copied().collect(),
        backedge_targets: backedge_targets(instrs),
        handlers: analysis.handlers.clone(),
        assumptions: Vec::new(),
        resume: Vec::new(),
        mixed_operand_sites: 0,
    };
    let blocks = lowering.emit_blocks()?;

    let mut func = IrFunction {
        name: Arc::from(code.name()),
        code_id: code.id(),
        level: opts.level,
        blocks,
        entry: BlockId(0),
        handlers: lowering.handlers,
        resume: lowering.resume,
        assumptions: lowering.assumptions,
        consts: code.consts().into(),
        max_depth: analysis.max_depth,
        argcount: code.argcount(),
        nlocals: code.varnames().len(),
        is_generator: code.is_generator(),
        mixed_operand_sites: lowering.mixed_operand_sites,
    };
    func.resume.sort_by_key(|(ip, _)| *ip);

    if opts.level >= OptLevel::O1 {
        optimize::cleanup(&mut func);
    }

    debug!(
        target: "tiervm::jit::ir",
        unit = %func.name,
        level = %opts.level,
        blocks = func.blocks.len(),
        guards = func.guard_count(),
        mixed_operand_sites = func.mixed_operand_sites,
        "lowered"
    );
    Ok(func)
}

// =============================================================================
// Leaders
// =============================================================================

/// Whether an instruction ending in `op` never simply falls into the next one
fn ends_block(op: Opcode) -> bool {
    op.is_control_transfer() && !op.is_block_setup()
}

fn find_leaders(instrs: &[Instr]) -> BTreeSet<usize> {
    let mut leaders = BTreeSet::new();
    leaders.insert(0);
    let end = instrs.last().map_or(0, |i| i.next);
    for instr in instrs {
        for &(op, arg) in &instr.prims {
            if let Some(t) = arg.and_then(|a| jump_target(op, a, instr.next)) {
                leaders.insert(t);
            }
        }
        if ends_block(instr.last().0) && instr.next < end {
            leaders.insert(instr.next);
        }
    }
    leaders
}

/// Instructions reached by a backward jump
fn backedge_targets(instrs: &[Instr]) -> BTreeSet<usize> {
    instrs
        .iter()
        .filter_map(|i| i.target().filter(|&t| t <= i.ip))
        .collect()
}

// =============================================================================
// Stack analysis
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
struct EntryState {
    depth: usize,
    handlers: SmallVec<[HandlerId; 4]>,
    /// Only reached through an `END_FINALLY` fall-through
    weak: bool,
}

/// `(values needed, net change)` of a primitive that neither jumps nor
/// touches the block stack
fn stack_effect(op: Opcode, arg: Option<u32>) -> (usize, isize) {
    let n = arg.unwrap_or(0) as usize;
    if op.binary_op().is_some() || op.inplace_op().is_some() {
        return (2, -1);
    }
    if op.unary_op().is_some() {
        return (1, 0);
    }
    match op {
        Opcode::PopTop => (1, -1),
        Opcode::RotTwo => (2, 0),
        Opcode::RotThree => (3, 0),
        Opcode::RotFour => (4, 0),
        Opcode::DupTop => (1, 1),
        Opcode::DupTopTwo => (2, 2),
        Opcode::DupTopThree => (3, 3),
        Opcode::StoreSubscr => (3, -3),
        Opcode::DeleteSubscr => (2, -2),
        Opcode::GetIter => (1, 0),
        Opcode::StoreMap => (3, -2),
        Opcode::UnpackSequence => (1, n as isize - 1),
        Opcode::StoreAttr => (2, -2),
        Opcode::DeleteAttr => (1, -1),
        Opcode::StoreGlobal => (1, -1),
        Opcode::LoadConst | Opcode::LoadFast | Opcode::LoadGlobal => (0, 1),
        Opcode::LoadClosure | Opcode::LoadDeref | Opcode::BuildMap => (0, 1),
        Opcode::StoreFast | Opcode::StoreDeref => (1, -1),
        Opcode::BuildTuple | Opcode::BuildList => (n, 1 - n as isize),
        Opcode::LoadAttr => (1, 0),
        Opcode::CompareOp => (2, -1),
        Opcode::ListAppend => (n.max(1) + 1, -1),
        Opcode::Slice0 => (1, 0),
        Opcode::Slice1 | Opcode::Slice2 => (2, -1),
        Opcode::Slice3 => (3, -2),
        Opcode::StoreSlice0 => (2, -2),
        Opcode::StoreSlice1 | Opcode::StoreSlice2 => (3, -3),
        Opcode::StoreSlice3 => (4, -4),
        Opcode::DeleteSlice0 => (1, -1),
        Opcode::DeleteSlice1 | Opcode::DeleteSlice2 => (2, -2),
        Opcode::DeleteSlice3 => (3, -3),
        Opcode::BuildSlice => (n, 1 - n as isize),
        Opcode::CallFunction
        | Opcode::CallFunctionVar
        | Opcode::CallFunctionKw
        | Opcode::CallFunctionVarKw => {
            let (star, dstar) = op.call_extras().unwrap_or((false, false));
            let popped = (n & 0xff) + 2 * ((n >> 8) & 0xff) + star as usize + dstar as usize;
            (popped + 1, -(popped as isize))
        }
        Opcode::MakeFunction => (n + 1, -(n as isize)),
        Opcode::MakeClosure => (n + 2, -(n as isize) - 1),
        Opcode::WithCleanup => (2, -1),
        _ => (0, 0),
    }
}

struct Analysis<'a> {
    instrs: &'a [Instr],
    index_of: &'a HashMap<usize, usize>,
    states: Vec<Option<EntryState>>,
    handlers: Vec<HandlerDesc>,
    handler_at: HashMap<usize, HandlerId>,
    worklist: Vec<usize>,
    max_depth: usize,
}

impl<'a> Analysis<'a> {
    fn new(instrs: &'a [Instr], index_of: &'a HashMap<usize, usize>) -> Self {
        Analysis {
            instrs,
            index_of,
            states: vec![None; instrs.len()],
            handlers: Vec::new(),
            handler_at: HashMap::new(),
            worklist: Vec::new(),
            max_depth: 0,
        }
    }

    fn state_at(&self, ip: usize) -> Option<&EntryState> {
        self.index_of.get(&ip).and_then(|&i| self.states[i].as_ref())
    }

    fn run(&mut self) -> JitResult<()> {
        self.merge(
            0,
            0,
            EntryState {
                depth: 0,
                handlers: SmallVec::new(),
                weak: false,
            },
        )?;
        while let Some(idx) = self.worklist.pop() {
            let Some(state) = self.states[idx].clone() else { continue };
            self.step(idx, state)?;
        }
        Ok(())
    }

    /// Propagate `incoming` into the instruction at `ip`, reached from `from`
    fn merge(&mut self, from: usize, ip: usize, incoming: EntryState) -> JitResult<()> {
        let idx = *self.index_of.get(&ip).ok_or(JitError::BadControlFlow { ip: from })?;
        self.max_depth = self.max_depth.max(incoming.depth);
        match &self.states[idx] {
            None => {}
            Some(old) if old.depth == incoming.depth && old.handlers == incoming.handlers => {
                if !old.weak || incoming.weak {
                    return Ok(());
                }
            }
            Some(_) if incoming.weak => return Ok(()),
            Some(old) if old.weak => {}
            Some(old) if old.handlers != incoming.handlers => {
                return Err(JitError::BlockMismatch { ip });
            }
            Some(old) => {
                return Err(JitError::StackMismatch {
                    ip,
                    expected: old.depth,
                    got: incoming.depth,
                })
            }
        }
        self.states[idx] = Some(incoming);
        self.worklist.push(idx);
        Ok(())
    }

    fn handler_for(
        &mut self,
        setup_ip: usize,
        kind: BlockKind,
        target_ip: usize,
        depth: usize,
        parent: Option<HandlerId>,
    ) -> HandlerId {
        if let Some(&h) = self.handler_at.get(&setup_ip) {
            return h;
        }
        let h = HandlerId(self.handlers.len() as u32);
        self.handlers.push(HandlerDesc {
            kind,
            setup_ip,
            target_ip,
            target: BlockId(0),
            depth: Some(depth),
            parent,
        });
        self.handler_at.insert(setup_ip, h);
        h
    }

    fn step(&mut self, idx: usize, state: EntryState) -> JitResult<()> {
        let instrs = self.instrs;
        let instr = &instrs[idx];
        let ip = instr.ip;
        let EntryState {
            mut depth,
            handlers: mut hs,
            weak: mut is_weak,
        } = state;

        let need = |depth: usize, n: usize| -> JitResult<()> {
            if depth < n {
                Err(JitError::StackMismatch {
                    ip,
                    expected: n,
                    got: depth,
                })
            } else {
                Ok(())
            }
        };

        for &(op, arg) in &instr.prims {
            let target = arg.and_then(|a| jump_target(op, a, instr.next));
            match op {
                Opcode::SetupLoop | Opcode::SetupExcept | Opcode::SetupFinally => {
                    let target = target.ok_or(JitError::BadControlFlow { ip })?;
                    let (kind, pushed) = match op {
                        Opcode::SetupLoop => (BlockKind::Loop, 0),
                        Opcode::SetupExcept => (BlockKind::Except, 3),
                        _ => (BlockKind::Finally, 1),
                    };
                    if hs.len() >= MAX_BLOCKS {
                        return Err(JitError::BlockMismatch { ip });
                    }
                    let h = self.handler_for(ip, kind, target, depth, hs.last().copied());
                    let handler_state = EntryState {
                        depth: depth + pushed,
                        handlers: hs.clone(),
                        weak: is_weak,
                    };
                    self.merge(ip, target, handler_state)?;
                    hs.push(h);
                }
                Opcode::PopBlock => {
                    let h = hs.pop().ok_or(JitError::BlockMismatch { ip })?;
                    if let Some(level) = self.handlers[h.index()].depth {
                        depth = depth.min(level);
                    }
                }
                Opcode::JumpForward | Opcode::JumpAbsolute => {
                    let target = target.ok_or(JitError::BadControlFlow { ip })?;
                    let st = EntryState {
                        depth,
                        handlers: hs,
                        weak: is_weak,
                    };
                    return self.merge(ip, target, st);
                }
                Opcode::PopJumpIfFalse | Opcode::PopJumpIfTrue => {
                    need(depth, 1)?;
                    depth -= 1;
                    let target = target.ok_or(JitError::BadControlFlow { ip })?;
                    let st = EntryState {
                        depth,
                        handlers: hs.clone(),
                        weak: is_weak,
                    };
                    self.merge(ip, target, st)?;
                }
                Opcode::JumpIfFalseOrPop | Opcode::JumpIfTrueOrPop => {
                    need(depth, 1)?;
                    let target = target.ok_or(JitError::BadControlFlow { ip })?;
                    let st = EntryState {
                        depth,
                        handlers: hs.clone(),
                        weak: is_weak,
                    };
                    self.merge(ip, target, st)?;
                    depth -= 1;
                }
                Opcode::ForIter => {
                    need(depth, 1)?;
                    let target = target.ok_or(JitError::BadControlFlow { ip })?;
                    let st = EntryState {
                        depth: depth - 1,
                        handlers: hs.clone(),
                        weak: is_weak,
                    };
                    self.merge(ip, target, st)?;
                    depth += 1;
                }
                Opcode::ReturnValue => {
                    need(depth, 1)?;
                    return Ok(());
                }
                Opcode::RaiseVarargs => {
                    let argc = arg.unwrap_or(0);
                    if argc > 2 {
                        return Err(JitError::Unsupported { ip, opcode: op });
                    }
                    need(depth, argc as usize)?;
                    return Ok(());
                }
                Opcode::BreakLoop => return Ok(()),
                Opcode::ContinueLoop => {
                    let target = arg.ok_or(JitError::BadControlFlow { ip })? as usize;
                    return self.continue_edge(ip, target, depth, &hs, is_weak);
                }
                Opcode::YieldValue => need(depth, 1)?,
                Opcode::EndFinally => {
                    need(depth, 1)?;
                    depth -= 1;
                    is_weak = true;
                }
                _ => {
                    let (needs, delta) = stack_effect(op, arg);
                    need(depth, needs)?;
                    depth = (depth as isize + delta) as usize;
                }
            }
            self.max_depth = self.max_depth.max(depth);
        }

        let end = instrs.last().map_or(0, |i| i.next);
        if instr.next < end {
            let st = EntryState {
                depth,
                handlers: hs,
                weak: is_weak,
            };
            self.merge(ip, instr.next, st)?;
        }
        Ok(())
    }

    /// `continue` lands on the loop header with the loop block still pushed
    ///
    /// Through a `finally` the target is reached only after `END_FINALLY`
    /// resumes the unwind, which the weak edge rules cover.
    fn continue_edge(
        &mut self,
        ip: usize,
        target: usize,
        depth: usize,
        hs: &[HandlerId],
        weak: bool,
    ) -> JitResult<()> {
        let Some(pos) = hs
            .iter()
            .rposition(|h| self.handlers[h.index()].kind == BlockKind::Loop)
        else {
            return Ok(());
        };
        let inner = &hs[pos + 1..];
        if inner
            .iter()
            .any(|h| self.handlers[h.index()].kind == BlockKind::Finally)
        {
            return Ok(());
        }
        let depth = inner
            .first()
            .and_then(|h| self.handlers[h.index()].depth)
            .unwrap_or(depth);
        let st = EntryState {
            depth,
            handlers: hs[..=pos].iter().copied().collect(),
            weak,
        };
        self.merge(ip, target, st)
    }
}

// =============================================================================
// Emission
// =============================================================================

struct Lowering<'a> {
    code: &'a CodeUnit,
    opts: &'a LowerOptions,
    analysis: &'a Analysis<'a>,
    leaders: Vec<usize>,
    backedge_targets: BTreeSet<usize>,
    handlers: Vec<HandlerDesc>,
    assumptions: Vec<GlobalAssumption>,
    resume: Vec<(usize, BlockId)>,
    mixed_operand_sites: usize,
}

impl Lowering<'_> {
    fn block_id(&self, ip: usize) -> JitResult<BlockId> {
        self.leaders
            .binary_search(&ip)
            .map(|i| BlockId(i as u32))
            .map_err(|_| JitError::BadControlFlow { ip })
    }

    fn emit_blocks(&mut self) -> JitResult<Vec<IrBlock>> {
        let instrs = self.code.instrs();
        let end = instrs.last().map_or(0, |i| i.next);

        // Handlers of unreachable setups still need descriptors.
        for instr in instrs {
            let (op, arg) = instr.last();
            if op.is_block_setup() && !self.analysis.handler_at.contains_key(&instr.ip) {
                let target = arg
                    .and_then(|a| jump_target(op, a, instr.next))
                    .ok_or(JitError::BadControlFlow { ip: instr.ip })?;
                let kind = match op {
                    Opcode::SetupLoop => BlockKind::Loop,
                    Opcode::SetupExcept => BlockKind::Except,
                    _ => BlockKind::Finally,
                };
                self.handlers.push(HandlerDesc {
                    kind,
                    setup_ip: instr.ip,
                    target_ip: target,
                    target: BlockId(0),
                    depth: None,
                    parent: None,
                });
            }
        }
        for i in 0..self.handlers.len() {
            self.handlers[i].target = self.block_id(self.handlers[i].target_ip)?;
        }

        let mut blocks = Vec::with_capacity(self.leaders.len());
        let mut current: Option<IrBlock> = None;
        for instr in instrs {
            if self.leaders.binary_search(&instr.ip).is_ok() {
                if let Some(mut done) = current.take() {
                    done.term = Terminator::Goto(self.block_id(instr.ip)?);
                    blocks.push(done);
                }
                let state = self.analysis.state_at(instr.ip);
                current = Some(IrBlock {
                    id: BlockId(blocks.len() as u32),
                    start: instr.ip,
                    insts: Vec::new(),
                    term: Terminator::Trap { ip: end },
                    depth: state.map(|s| s.depth),
                    handlers: state.map(|s| s.handlers.clone()).unwrap_or_default(),
                });
            }
            let Some(block) = current.as_mut() else {
                return Err(JitError::BadControlFlow { ip: instr.ip });
            };
            if let Some(term) = self.emit_instr(instr, &mut block.insts, end)? {
                block.term = term;
                if let Some(done) = current.take() {
                    blocks.push(done);
                }
            }
        }
        if let Some(done) = current.take() {
            blocks.push(done);
        }
        Ok(blocks)
    }

    /// Lower one instruction; returns its terminator if it ends the block
    fn emit_instr(
        &mut self,
        instr: &Instr,
        out: &mut Vec<IrInst>,
        end: usize,
    ) -> JitResult<Option<Terminator>> {
        let ip = instr.ip;
        let head = SiteId::new(ip, 0);

        if self.code.is_safe_point(ip) {
            let kind = if self.backedge_targets.contains(&ip) {
                SafePointKind::Backedge
            } else {
                SafePointKind::Line
            };
            out.push(IrInst {
                site: head,
                op: IrOp::SafePoint(kind),
            });
        }

        let cached = match instr.prims[0] {
            (Opcode::LoadGlobal, Some(idx)) if self.opts.level >= OptLevel::O2 => {
                self.assume_global(idx)
            }
            _ => None,
        };
        if let Some(a) = cached {
            let assumption = &self.assumptions[a];
            out.push(IrInst {
                site: head,
                op: IrOp::GuardGlobals {
                    globals: assumption.globals,
                    globals_version: assumption.globals_version,
                    builtins: assumption.builtins,
                    builtins_version: assumption.builtins_version,
                },
            });
        }

        out.push(IrInst {
            site: head,
            op: IrOp::Begin { next: instr.next },
        });

        let last = instr.prims.len() - 1;
        for (k, &(op, arg)) in instr.prims.iter().enumerate() {
            let site = SiteId::new(ip, k);
            if k == last && ends_block(op) {
                return self.terminator(instr, site, op, arg, end).map(Some);
            }
            let lowered = match (op, cached) {
                (Opcode::LoadGlobal, Some(a)) if k == 0 => IrOp::LoadCached(a),
                (Opcode::SetupLoop | Opcode::SetupExcept | Opcode::SetupFinally, _) => {
                    let h = self
                        .handlers
                        .iter()
                        .position(|h| h.setup_ip == ip)
                        .ok_or(JitError::BadControlFlow { ip })?;
                    IrOp::PushHandler(HandlerId(h as u32))
                }
                (Opcode::CallFunction, _) if self.opts.level >= OptLevel::O2 => {
                    match (arg, self.code.feedback().stable_callee(site)) {
                        (Some(arg), Some(expected)) => {
                            trace!(target: "tiervm::jit::ir", %site, "direct call");
                            IrOp::CallDirect { arg, expected }
                        }
                        _ => IrOp::Prim { op, arg },
                    }
                }
                (op, _) if op.binary_op().is_some() || op.inplace_op().is_some() => {
                    self.binary(site, op, arg)
                }
                _ => IrOp::Prim { op, arg },
            };
            out.push(IrInst { site, op: lowered });
        }
        Ok(None)
    }

    fn terminator(
        &mut self,
        instr: &Instr,
        site: SiteId,
        op: Opcode,
        arg: Option<u32>,
        end: usize,
    ) -> JitResult<Terminator> {
        let ip = instr.ip;
        let target = arg.and_then(|a| jump_target(op, a, instr.next));
        let next_block = || -> JitResult<BlockId> {
            if instr.next < end {
                self.block_id(instr.next)
            } else {
                Err(JitError::BadControlFlow { ip })
            }
        };
        let require_arg = || arg.ok_or(JitError::BadControlFlow { ip });

        Ok(match op {
            Opcode::JumpForward | Opcode::JumpAbsolute => {
                Terminator::Goto(self.block_id(target.ok_or(JitError::BadControlFlow { ip })?)?)
            }
            Opcode::PopJumpIfFalse | Opcode::PopJumpIfTrue => {
                let taken = self.block_id(target.ok_or(JitError::BadControlFlow { ip })?)?;
                let fallthrough = next_block()?;
                let arg = require_arg()?;
                match self.speculation(site) {
                    Some(truth) => {
                        let jumps = (op == Opcode::PopJumpIfTrue) == truth;
                        Terminator::Speculate {
                            op,
                            arg,
                            site,
                            expected: truth,
                            next: if jumps { taken } else { fallthrough },
                        }
                    }
                    None => Terminator::Branch {
                        op,
                        arg,
                        site,
                        taken,
                        fallthrough,
                    },
                }
            }
            Opcode::JumpIfFalseOrPop | Opcode::JumpIfTrueOrPop => Terminator::Branch {
                op,
                arg: require_arg()?,
                site,
                taken: self.block_id(target.ok_or(JitError::BadControlFlow { ip })?)?,
                fallthrough: next_block()?,
            },
            Opcode::ForIter => Terminator::ForIter {
                arg: require_arg()?,
                site,
                body: next_block()?,
                exit: self.block_id(target.ok_or(JitError::BadControlFlow { ip })?)?,
            },
            Opcode::ReturnValue => Terminator::Return { site },
            Opcode::YieldValue => {
                let resume = next_block()?;
                self.resume.push((ip, resume));
                Terminator::Yield { site, resume }
            }
            Opcode::EndFinally => Terminator::Unwind {
                op,
                arg,
                site,
                fallthrough: if instr.next < end {
                    Some(self.block_id(instr.next)?)
                } else {
                    None
                },
            },
            Opcode::RaiseVarargs | Opcode::BreakLoop | Opcode::ContinueLoop => Terminator::Unwind {
                op,
                arg,
                site,
                fallthrough: None,
            },
            other => return Err(JitError::Unsupported { ip, opcode: other }),
        })
    }

    /// Direction to speculate a branch on, if its feedback allows it
    fn speculation(&self, site: SiteId) -> Option<bool> {
        if self.opts.level < OptLevel::O2 {
            return None;
        }
        let feedback = self.code.feedback();
        if !feedback.is_consistent_with(site, self.opts.branch_min_samples) {
            return None;
        }
        feedback.branch(site)?.direction()
    }

    /// Lower a binary operator from its operand-type feedback
    fn binary(&mut self, site: SiteId, op: Opcode, arg: Option<u32>) -> IrOp {
        match self.int_operands(site) {
            Some(true) if self.opts.level >= OptLevel::O2 => {
                trace!(target: "tiervm::jit::ir", %site, %op, "int fast path");
                IrOp::IntBinary { op }
            }
            Some(false) => {
                self.mixed_operand_sites += 1;
                IrOp::Prim { op, arg }
            }
            _ => IrOp::Prim { op, arg },
        }
    }

    /// Whether both operands at `site` were always ints; `None` if the site
    /// never ran
    fn int_operands(&self, site: SiteId) -> Option<bool> {
        let (lhs, rhs) = self.code.feedback().operand_types(site)?;
        let ints = |seen: &LimitedFeedback<TypeTag>| seen.single() == Some(TypeTag::Int);
        Some(ints(&lhs) && ints(&rhs))
    }

    /// Record an assumption for the global at name index `idx`
    fn assume_global(&mut self, idx: u32) -> Option<usize> {
        let globals = self.opts.globals.as_ref()?;
        let builtins = self.opts.builtins.as_ref()?;
        let name = self.code.names().get(idx as usize)?.clone();
        if let Some(i) = self.assumptions.iter().position(|a| a.name == name) {
            return Some(i);
        }

        let globals_version = globals.version();
        let builtins_version = builtins.version();
        let (value, builtin) = match globals.get(&name) {
            Some(v) => (v, false),
            None => (builtins.get(&name)?, true),
        };
        self.assumptions.push(GlobalAssumption {
            name,
            value,
            builtin,
            globals: globals.id(),
            globals_version,
            builtins: builtins.id(),
            builtins_version,
        });
        Some(self.assumptions.len() - 1)
    }
}
