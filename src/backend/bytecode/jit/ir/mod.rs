//! Intermediate Representation
//!
//! The lowering pass turns a [`CodeUnit`](crate::backend::bytecode::code::CodeUnit)
//! into an [`IrFunction`]: a control-flow graph of basic blocks whose
//! instructions are the unit's primitives plus the bookkeeping native code
//! needs to stay interchangeable with the interpreter.
//!
//! # Structure
//!
//! ```text
//! IrFunction
//! ├── blocks      basic blocks in bytecode order, indexed by BlockId
//! ├── handlers    arena of HandlerDesc, one per SETUP_* instruction
//! ├── resume      (yield index -> resume block) table for generators
//! └── assumptions global bindings baked into specialized loads
//! ```
//!
//! Every bytecode instruction lowers to a `Begin` marker (which records
//! `lasti` and advances `ip` exactly as the interpreter does) followed by its
//! primitives. Exceptions, `break`, `continue` and `return` through a
//! `finally` all leave through the shared unwinder; the IR only records where
//! handlers live so a backend can re-enter the graph after an unwind.
//!
//! Optimized levels add guards: `GuardGlobals` protects cached global loads,
//! `CallDirect` checks callee identity and `Speculate` replaces a branch
//! whose direction never varied. A failed guard hands the frame back to the
//! interpreter at an instruction boundary.

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

use super::feedback::SiteId;
use super::types::{BailReason, OptLevel};
use crate::backend::bytecode::frame::BlockKind;
use crate::backend::bytecode::opcodes::Opcode;
use crate::backend::object::Value;

pub mod builder;
mod display;
pub mod optimize;


pub use builder::{lower, LowerOptions};

// =============================================================================
// Identifiers
// =============================================================================

/// Index of a basic block in [`IrFunction::blocks`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl BlockId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// Index of a handler in the [`IrFunction::handlers`] arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(pub u32);

impl HandlerId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

// =============================================================================
// Handlers and assumptions
// =============================================================================

/// A `SETUP_*` block as seen by the IR
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerDesc {
    pub kind: BlockKind,
    /// Instruction that pushes the block
    pub setup_ip: usize,
    /// Handler instruction
    pub target_ip: usize,
    /// Block starting at the handler
    pub target: BlockId,
    /// Static stack depth when the block is pushed
    pub depth: Option<usize>,
    /// Enclosing handler
    pub parent: Option<HandlerId>,
}

/// Why a safe point exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SafePointKind {
    /// First instruction of a source line
    Line,
    /// Target of a backward jump
    Backedge,
}

impl SafePointKind {
    /// Bail reason when a tracer is found installed here
    pub fn trace_reason(self) -> BailReason {
        match self {
            SafePointKind::Line => BailReason::LineTrace,
            SafePointKind::Backedge => BailReason::BackedgeTrace,
        }
    }
}

/// A global binding a specialized load relies on
#[derive(Debug, Clone)]
pub struct GlobalAssumption {
    pub name: Arc<str>,
    pub value: Value,
    /// Found in builtins rather than globals
    pub builtin: bool,
    pub globals: u64,
    pub globals_version: u64,
    pub builtins: u64,
    pub builtins_version: u64,
}

// =============================================================================
// Instructions and terminators
// =============================================================================

/// One IR operation
#[derive(Debug, Clone)]
pub enum IrOp {
    /// Poll for trace or bail requests before the instruction starts
    SafePoint(SafePointKind),
    /// Fatal bail unless the frame still runs against these namespaces at
    /// these versions
    GuardGlobals {
        globals: u64,
        globals_version: u64,
        builtins: u64,
        builtins_version: u64,
    },
    /// Start of a bytecode instruction: `lasti = site.ip`, `ip = next`
    Begin { next: usize },
    /// Run a primitive generically
    Prim { op: Opcode, arg: Option<u32> },
    /// Push the block described by a handler
    PushHandler(HandlerId),
    /// Push a global value resolved at compile time
    LoadCached(usize),
    /// `CALL_FUNCTION` expecting `expected` as the callee
    CallDirect { arg: u32, expected: Value },
    /// Binary operator that only ever saw two ints: checked integer
    /// arithmetic when both operands are ints, the generic primitive otherwise
    IntBinary { op: Opcode },
}

/// An operation tagged with the site it came from
#[derive(Debug, Clone)]
pub struct IrInst {
    pub site: SiteId,
    pub op: IrOp,
}

/// How control leaves a block
#[derive(Debug, Clone)]
pub enum Terminator {
    /// Continue in another block; any jump primitive was folded in
    Goto(BlockId),
    /// Conditional jump compiled both ways
    Branch {
        op: Opcode,
        arg: u32,
        site: SiteId,
        taken: BlockId,
        fallthrough: BlockId,
    },
    /// Conditional jump specialized on one direction
    ///
    /// When the test goes the expected way control continues in `next`.
    /// Otherwise the jump completes generically and the frame bails to the
    /// interpreter at the instruction it landed on.
    Speculate {
        op: Opcode,
        arg: u32,
        site: SiteId,
        expected: bool,
        next: BlockId,
    },
    /// `FOR_ITER`: next item into `body`, exhaustion into `exit`
    ForIter {
        arg: u32,
        site: SiteId,
        body: BlockId,
        exit: BlockId,
    },
    /// `RETURN_VALUE`
    Return { site: SiteId },
    /// `YIELD_VALUE`; the generator resumes in `resume`
    Yield { site: SiteId, resume: BlockId },
    /// A primitive whose outcome is decided by the unwinder: raise, break,
    /// continue or `END_FINALLY`
    Unwind {
        op: Opcode,
        arg: Option<u32>,
        site: SiteId,
        fallthrough: Option<BlockId>,
    },
    /// Falls off the end of the code
    Trap { ip: usize },
}

impl Terminator {
    /// Statically known successors
    pub fn successors(&self) -> SmallVec<[BlockId; 2]> {
        let mut out = SmallVec::new();
        match self {
            Terminator::Goto(b) => out.push(*b),
            Terminator::Branch {
                taken, fallthrough, ..
            } => {
                out.push(*taken);
                out.push(*fallthrough);
            }
            Terminator::Speculate { next, .. } => out.push(*next),
            Terminator::ForIter { body, exit, .. } => {
                out.push(*body);
                out.push(*exit);
            }
            Terminator::Yield { resume, .. } => out.push(*resume),
            Terminator::Unwind {
                fallthrough: Some(b),
                ..
            } => out.push(*b),
            Terminator::Unwind { .. } | Terminator::Return { .. } | Terminator::Trap { .. } => {}
        }
        out
    }

    pub(crate) fn successors_mut(&mut self) -> SmallVec<[&mut BlockId; 2]> {
        let mut out = SmallVec::new();
        match self {
            Terminator::Goto(b) => out.push(b),
            Terminator::Branch {
                taken, fallthrough, ..
            } => {
                out.push(taken);
                out.push(fallthrough);
            }
            Terminator::Speculate { next, .. } => out.push(next),
            Terminator::ForIter { body, exit, .. } => {
                out.push(body);
                out.push(exit);
            }
            Terminator::Yield { resume, .. } => out.push(resume),
            Terminator::Unwind {
                fallthrough: Some(b),
                ..
            } => out.push(b),
            Terminator::Unwind { .. } | Terminator::Return { .. } | Terminator::Trap { .. } => {}
        }
        out
    }
}

// =============================================================================
// Blocks and functions
// =============================================================================

/// A straight-line run of instructions
#[derive(Debug, Clone)]
pub struct IrBlock {
    pub id: BlockId,
    /// First bytecode instruction
    pub start: usize,
    pub insts: Vec<IrInst>,
    pub term: Terminator,
    /// Static stack depth on entry, if known
    pub depth: Option<usize>,
    /// Static handler stack on entry, innermost last
    pub handlers: SmallVec<[HandlerId; 4]>,
}

impl IrBlock {
    /// Nothing but the `Begin` of a jump
    pub fn is_trivial_jump(&self) -> bool {
        matches!(self.term, Terminator::Goto(_))
            && self.insts.len() == 1
            && matches!(self.insts[0].op, IrOp::Begin { .. })
    }
}

/// The lowered form of a code unit
#[derive(Debug, Clone)]
pub struct IrFunction {
    pub name: Arc<str>,
    pub code_id: u64,
    pub level: OptLevel,
    /// Sorted by `start`; `blocks[i].id == BlockId(i)`
    pub blocks: Vec<IrBlock>,
    pub entry: BlockId,
    pub handlers: Vec<HandlerDesc>,
    /// `(index of YIELD_VALUE, block to resume in)`, sorted
    pub resume: Vec<(usize, BlockId)>,
    pub assumptions: Vec<GlobalAssumption>,
    /// Constant pool of the unit
    pub consts: Arc<[Value]>,
    /// Largest static stack depth seen
    pub max_depth: usize,
    pub argcount: usize,
    pub nlocals: usize,
    pub is_generator: bool,
    /// Binary operator sites whose feedback saw an operand other than an int
    pub mixed_operand_sites: usize,
}

impl IrFunction {
    #[inline]
    pub fn block(&self, id: BlockId) -> &IrBlock {
        &self.blocks[id.index()]
    }

    /// Block starting exactly at instruction `ip`
    pub fn block_at(&self, ip: usize) -> Option<BlockId> {
        self.blocks
            .binary_search_by_key(&ip, |b| b.start)
            .ok()
            .map(|i| self.blocks[i].id)
    }

    /// Block a generator resumes in after the yield at `lasti`
    pub fn resume_block(&self, lasti: usize) -> Option<BlockId> {
        self.resume
            .binary_search_by_key(&lasti, |(ip, _)| *ip)
            .ok()
            .map(|i| self.resume[i].1)
    }

    #[inline]
    pub fn handler(&self, id: HandlerId) -> &HandlerDesc {
        &self.handlers[id.index()]
    }

    /// Whether native code caches global or builtin bindings
    pub fn assumes_globals(&self) -> bool {
        !self.assumptions.is_empty()
    }

    /// Every block control can reach without running the unwinder
    pub fn successors(&self, id: BlockId) -> SmallVec<[BlockId; 4]> {
        let block = self.block(id);
        let mut out: SmallVec<[BlockId; 4]> = block.term.successors().into_iter().collect();
        for inst in &block.insts {
            if let IrOp::PushHandler(h) = inst.op {
                out.push(self.handler(h).target);
            }
        }
        out
    }

    /// Number of guards of any kind
    pub fn guard_count(&self) -> usize {
        self.blocks
            .iter()
            .map(|b| {
                let insts = b
                    .insts
                    .iter()
                    .filter(|i| matches!(i.op, IrOp::GuardGlobals { .. } | IrOp::CallDirect { .. }))
                    .count();
                insts + matches!(b.term, Terminator::Speculate { .. }) as usize
            })
            .sum()
    }

    /// Number of lowered bytecode instructions
    pub fn instruction_count(&self) -> usize {
        self.blocks
            .iter()
            .flat_map(|b| &b.insts)
            .filter(|i| matches!(i.op, IrOp::Begin { .. }))
            .count()
    }
}
