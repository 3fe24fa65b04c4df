//! Code units
//!
//! A [`CodeUnit`] is the immutable compiled form of one function or module
//! body: the instruction stream, its tables and metadata. The only mutable
//! parts are the tiering state ([`JitProfile`]) and the interpreter's type
//! feedback ([`FeedbackMap`]), both shared by every frame running the unit.
//!
//! Instructions are decoded once when the unit is created, with the same
//! decoder the IR builder and the disassembler use.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use smallvec::SmallVec;

use super::frame::BlockKind;
use super::instruction::{
    decode_superinstruction, jump_target, CodeError, CodeResult, Primitive, Word,
};
use super::opcodes::{ArgKind, CmpOp, Opcode};
use crate::backend::bytecode::jit::feedback::FeedbackMap;
use crate::backend::bytecode::jit::profile::JitProfile;
use crate::backend::object::Value;

static NEXT_CODE_ID: AtomicU64 = AtomicU64::new(1);

const NOT_AN_INSTRUCTION: u32 = u32::MAX;

// =============================================================================
// Flags
// =============================================================================

/// Code unit flags
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CodeFlags(u32);

impl CodeFlags {
    /// Takes `*args`
    pub const VARARGS: CodeFlags = CodeFlags(0x0004);
    /// Takes `**kwargs`
    pub const VARKEYWORDS: CodeFlags = CodeFlags(0x0008);
    /// Defined inside another function
    pub const NESTED: CodeFlags = CodeFlags(0x0010);
    /// Calling it returns a generator
    pub const GENERATOR: CodeFlags = CodeFlags(0x0020);
    /// No cell or free variables
    pub const NOFREE: CodeFlags = CodeFlags(0x0040);
    /// Contains try/except/finally/with blocks
    pub const BLOCKSTACK: CodeFlags = CodeFlags(0x0100);
    /// Native code for this unit assumes global and builtin bindings
    pub const FDO_GLOBALS: CodeFlags = CodeFlags(0x0200);

    pub const fn empty() -> Self {
        CodeFlags(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn contains(self, other: CodeFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: CodeFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: CodeFlags) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for CodeFlags {
    type Output = CodeFlags;

    fn bitor(self, rhs: CodeFlags) -> CodeFlags {
        CodeFlags(self.0 | rhs.0)
    }
}

impl fmt::Debug for CodeFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(CodeFlags, &str); 7] = [
            (CodeFlags::VARARGS, "VARARGS"),
            (CodeFlags::VARKEYWORDS, "VARKEYWORDS"),
            (CodeFlags::NESTED, "NESTED"),
            (CodeFlags::GENERATOR, "GENERATOR"),
            (CodeFlags::NOFREE, "NOFREE"),
            (CodeFlags::BLOCKSTACK, "BLOCKSTACK"),
            (CodeFlags::FDO_GLOBALS, "FDO_GLOBALS"),
        ];
        let set: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "CodeFlags({})", set.join(" | "))
    }
}

// =============================================================================
// Decoded instructions and tables
// =============================================================================

/// One decoded instruction
#[derive(Debug, Clone)]
pub struct Instr {
    /// Index of the opcode word
    pub ip: usize,
    /// The opcode as stored, possibly a superinstruction
    pub op: Opcode,
    /// Fully expanded primitives with their arguments
    pub prims: SmallVec<[Primitive; 4]>,
    /// Index of the following instruction
    pub next: usize,
    pub line: u32,
}

impl Instr {
    /// The primitive that ends this instruction
    pub fn last(&self) -> Primitive {
        self.prims[self.prims.len() - 1]
    }

    /// Jump target of the final primitive, if it has one
    pub fn target(&self) -> Option<usize> {
        let (op, arg) = self.last();
        arg.and_then(|a| jump_target(op, a, self.next))
    }
}

/// Protected range of a `SETUP_*` block, derived from the instruction stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerEntry {
    /// First protected instruction
    pub start: usize,
    /// End of the protected range (the handler itself)
    pub end: usize,
    pub handler: usize,
    pub kind: BlockKind,
}

/// Everything needed to build a code unit
#[derive(Default)]
pub struct CodeParts {
    pub name: String,
    pub argcount: usize,
    pub flags: CodeFlags,
    pub first_line: u32,
    pub words: Vec<Word>,
    pub consts: Vec<Value>,
    pub names: Vec<Arc<str>>,
    pub varnames: Vec<Arc<str>>,
    pub cellvars: Vec<Arc<str>>,
    pub freevars: Vec<Arc<str>>,
    /// `(instruction index, line)` pairs in increasing index order
    pub lines: Vec<(usize, u32)>,
}

// =============================================================================
// CodeUnit
// =============================================================================

/// Immutable compiled code plus its tiering state
pub struct CodeUnit {
    id: u64,
    name: Arc<str>,
    argcount: usize,
    flags: CodeFlags,
    first_line: u32,
    words: Vec<Word>,
    instrs: Vec<Instr>,
    instr_at_word: Vec<u32>,
    consts: Vec<Value>,
    names: Vec<Arc<str>>,
    varnames: Vec<Arc<str>>,
    cellvars: Vec<Arc<str>>,
    freevars: Vec<Arc<str>>,
    cell2arg: Vec<Option<usize>>,
    lines: Vec<(usize, u32)>,
    handlers: Vec<HandlerEntry>,
    safe_points: Vec<bool>,
    profile: JitProfile,
    feedback: FeedbackMap,
}

impl CodeUnit {
    /// Decode and validate a code unit
    pub fn new(parts: CodeParts) -> CodeResult<Arc<Self>> {
        let CodeParts {
            name,
            argcount,
            mut flags,
            first_line,
            words,
            consts,
            names,
            varnames,
            cellvars,
            freevars,
            mut lines,
        } = parts;

        if words.is_empty() {
            return Err(CodeError::Empty);
        }
        lines.sort_by_key(|(ip, _)| *ip);

        let line_for = |ip: usize| -> u32 {
            match lines.partition_point(|(start, _)| *start <= ip) {
                0 => first_line,
                n => lines[n - 1].1,
            }
        };

        let mut instrs = Vec::new();
        let mut instr_at_word = vec![NOT_AN_INSTRUCTION; words.len()];
        let mut ip = 0;
        while ip < words.len() {
            let op = super::instruction::opcode_at(&words, ip)?;
            let (prims, next) = decode_superinstruction(&words, ip)?;
            instr_at_word[ip] = instrs.len() as u32;
            instrs.push(Instr {
                ip,
                op,
                prims: SmallVec::from_vec(prims),
                next,
                line: line_for(ip),
            });
            ip = next;
        }

        let total_args = argcount
            + flags.contains(CodeFlags::VARARGS) as usize
            + flags.contains(CodeFlags::VARKEYWORDS) as usize;
        if total_args > varnames.len() {
            return Err(CodeError::IndexOutOfBounds {
                index: total_args,
                len: varnames.len(),
            });
        }

        // Validate arguments against their tables and jumps against
        // instruction starts.
        let ncells = cellvars.len() + freevars.len();
        let mut handlers = Vec::new();
        for instr in &instrs {
            for &(op, arg) in &instr.prims {
                let Some(arg) = arg else { continue };
                let idx = arg as usize;
                let table_len = match op.arg_kind() {
                    ArgKind::Const => Some(consts.len()),
                    ArgKind::Name => Some(names.len()),
                    ArgKind::Local => Some(varnames.len()),
                    ArgKind::Free => Some(ncells),
                    _ => None,
                };
                if let Some(len) = table_len {
                    if idx >= len {
                        return Err(CodeError::IndexOutOfBounds { index: idx, len });
                    }
                }
                if op.arg_kind() == ArgKind::Compare && CmpOp::from_arg(arg).is_none() {
                    return Err(CodeError::ArgumentMismatch { opcode: op });
                }
                if let Some(target) = jump_target(op, arg, instr.next) {
                    let valid = instr_at_word
                        .get(target)
                        .is_some_and(|&i| i != NOT_AN_INSTRUCTION);
                    if !valid {
                        return Err(CodeError::BadJumpTarget {
                            index: instr.ip,
                            target: target as i64,
                        });
                    }
                    let kind = match op {
                        Opcode::SetupLoop => Some(BlockKind::Loop),
                        Opcode::SetupExcept => Some(BlockKind::Except),
                        Opcode::SetupFinally => Some(BlockKind::Finally),
                        _ => None,
                    };
                    if let Some(kind) = kind {
                        handlers.push(HandlerEntry {
                            start: instr.next,
                            end: target,
                            handler: target,
                            kind,
                        });
                    }
                }
            }
        }

        if handlers.iter().any(|h| h.kind != BlockKind::Loop) {
            flags.insert(CodeFlags::BLOCKSTACK);
        }
        if ncells == 0 {
            flags.insert(CodeFlags::NOFREE);
        }
        if instrs.iter().any(|i| i.op == Opcode::YieldValue) {
            flags.insert(CodeFlags::GENERATOR);
        }

        // Safe points: every line start and every backward jump target.
        let mut safe_points = vec![false; words.len()];
        let mut prev_line = None;
        for instr in &instrs {
            if prev_line != Some(instr.line) {
                safe_points[instr.ip] = true;
                prev_line = Some(instr.line);
            }
            if let Some(target) = instr.target() {
                if target <= instr.ip {
                    safe_points[target] = true;
                }
            }
        }

        let cell2arg = cellvars
            .iter()
            .map(|cell| varnames[..total_args].iter().position(|v| v == cell))
            .collect();

        Ok(Arc::new(CodeUnit {
            id: NEXT_CODE_ID.fetch_add(1, Ordering::Relaxed),
            name: Arc::from(name.as_str()),
            argcount,
            flags,
            first_line,
            words,
            instrs,
            instr_at_word,
            consts,
            names,
            varnames,
            cellvars,
            freevars,
            cell2arg,
            lines,
            handlers,
            safe_points,
            profile: JitProfile::new(),
            feedback: FeedbackMap::new(),
        }))
    }

    // === Identity and metadata ===

    /// Process-unique identity of this unit
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn argcount(&self) -> usize {
        self.argcount
    }

    /// Static flags, plus `FDO_GLOBALS` while native code assumes bindings
    pub fn flags(&self) -> CodeFlags {
        let mut flags = self.flags;
        if self.profile.assumes_globals() {
            flags.insert(CodeFlags::FDO_GLOBALS);
        }
        flags
    }

    #[inline]
    pub fn is_generator(&self) -> bool {
        self.flags.contains(CodeFlags::GENERATOR)
    }

    pub fn first_line(&self) -> u32 {
        self.first_line
    }

    // === Tables ===

    #[inline]
    pub fn words(&self) -> &[Word] {
        &self.words
    }

    #[inline]
    pub fn consts(&self) -> &[Value] {
        &self.consts
    }

    #[inline]
    pub fn names(&self) -> &[Arc<str>] {
        &self.names
    }

    #[inline]
    pub fn varnames(&self) -> &[Arc<str>] {
        &self.varnames
    }

    pub fn cellvars(&self) -> &[Arc<str>] {
        &self.cellvars
    }

    pub fn freevars(&self) -> &[Arc<str>] {
        &self.freevars
    }

    /// Name of cell slot `idx` (cellvars first, then freevars)
    pub fn cell_name(&self, idx: usize) -> Option<&Arc<str>> {
        self.cellvars
            .get(idx)
            .or_else(|| self.freevars.get(idx.checked_sub(self.cellvars.len())?))
    }

    /// Argument slot each cellvar is initialised from
    pub fn cell2arg(&self) -> &[Option<usize>] {
        &self.cell2arg
    }

    pub fn handlers(&self) -> &[HandlerEntry] {
        &self.handlers
    }

    // === Instructions ===

    pub fn instrs(&self) -> &[Instr] {
        &self.instrs
    }

    /// The instruction starting at word index `ip`
    #[inline]
    pub fn instr_at(&self, ip: usize) -> Option<&Instr> {
        match self.instr_at_word.get(ip) {
            Some(&i) if i != NOT_AN_INSTRUCTION => Some(&self.instrs[i as usize]),
            _ => None,
        }
    }

    #[inline]
    pub fn is_instruction_start(&self, ip: usize) -> bool {
        self.instr_at(ip).is_some()
    }

    /// Source line of the instruction at `ip`
    pub fn line_for(&self, ip: usize) -> u32 {
        match self.lines.partition_point(|(start, _)| *start <= ip) {
            0 => self.first_line,
            n => self.lines[n - 1].1,
        }
    }

    /// Whether `ip` starts a source line or is the target of a backward jump
    #[inline]
    pub fn is_safe_point(&self, ip: usize) -> bool {
        self.safe_points.get(ip).copied().unwrap_or(false)
    }

    /// Whether `ip` starts a new source line
    pub fn is_line_start(&self, ip: usize) -> bool {
        match self.instr_at_word.get(ip) {
            Some(&0) => true,
            Some(&i) if i != NOT_AN_INSTRUCTION => {
                self.instrs[i as usize - 1].line != self.instrs[i as usize].line
            }
            _ => false,
        }
    }

    // === Tiering state ===

    #[inline]
    pub fn profile(&self) -> &JitProfile {
        &self.profile
    }

    #[inline]
    pub fn feedback(&self) -> &FeedbackMap {
        &self.feedback
    }
}

impl fmt::Debug for CodeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeUnit")
            .field("name", &self.name)
            .field("argcount", &self.argcount)
            .field("flags", &self.flags())
            .field("words", &self.words.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::bytecode::builder::CodeBuilder;
    use crate::backend::bytecode::instruction::encode_unfused;

    #[test]
    fn test_rejects_empty_code() {
        assert_eq!(CodeUnit::new(CodeParts::default()).err(), Some(CodeError::Empty));
    }

    #[test]
    fn test_rejects_jump_into_instruction() {
        let words = encode_unfused(&[
            (Opcode::LoadConst, Some(0)),
            (Opcode::JumpAbsolute, Some(1)),
        ])
        .unwrap();
        let parts = CodeParts {
            name: "bad".into(),
            words,
            consts: vec![Value::None],
            ..Default::default()
        };
        assert!(matches!(
            CodeUnit::new(parts),
            Err(CodeError::BadJumpTarget { target: 1, .. })
        ));
    }

    #[test]
    fn test_rejects_bad_const_index() {
        let words = encode_unfused(&[(Opcode::LoadConst, Some(3)), (Opcode::ReturnValue, None)])
            .unwrap();
        let parts = CodeParts {
            name: "bad".into(),
            words,
            ..Default::default()
        };
        assert!(matches!(
            CodeUnit::new(parts),
            Err(CodeError::IndexOutOfBounds { index: 3, len: 0 })
        ));
    }

    #[test]
    fn test_lines_and_safe_points() {
        let mut b = CodeBuilder::new("loop");
        b.args(&["n"]);
        b.line(1);
        let top = b.label();
        let done = b.label();
        b.bind(top);
        b.line(2);
        b.load_fast("n");
        b.jump(Opcode::PopJumpIfFalse, done);
        b.load_fast("n");
        b.load_const(Value::Int(1));
        b.emit(Opcode::BinarySubtract);
        b.store_fast("n");
        b.line(3);
        b.jump(Opcode::JumpAbsolute, top);
        b.bind(done);
        b.line(4);
        b.load_const(Value::None);
        b.emit(Opcode::ReturnValue);
        let code = b.build().unwrap();

        assert_eq!(code.line_for(0), 2);
        assert!(code.is_safe_point(0));
        let jump = code
            .instrs()
            .iter()
            .find(|i| i.op == Opcode::JumpAbsolute)
            .unwrap();
        assert_eq!(code.line_for(jump.ip), 3);
        assert!(code.is_line_start(jump.ip));
        assert!(code.is_safe_point(jump.ip));
        assert_eq!(jump.target(), Some(0));
        assert!(!code.is_instruction_start(1));
        assert!(code.flags().contains(CodeFlags::NOFREE));
        assert!(!code.flags().contains(CodeFlags::BLOCKSTACK));
    }

    #[test]
    fn test_cell_names_and_cell2arg() {
        let mut b = CodeBuilder::new("outer");
        b.args(&["a"]);
        b.cellvar("a");
        b.cellvar("b");
        b.freevar("c");
        b.load_deref("c");
        b.emit(Opcode::ReturnValue);
        let code = b.build().unwrap();
        assert_eq!(code.cell_name(0).map(|s| s.as_ref()), Some("a"));
        assert_eq!(code.cell_name(2).map(|s| s.as_ref()), Some("c"));
        assert_eq!(code.cell_name(3), None);
        assert_eq!(code.cell2arg(), &[Some(0), None]);
    }
}
