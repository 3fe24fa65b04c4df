//! Instruction stream encoding and superinstruction decoding
//!
//! The instruction stream is a flat sequence of 32-bit words. The low bit
//! tells opcode words (`op << 1`) apart from argument words (`arg << 1 | 1`),
//! which lets the decoder detect when it would consume an argument that
//! belongs to someone else.
//!
//! The decoder here is shared by the interpreter, the IR lowering pass and
//! the disassembler, so every consumer agrees on instruction boundaries.

use std::fmt;
use std::fmt::Write as _;

use smallvec::SmallVec;

use super::code::CodeUnit;
use super::opcodes::{ArgKind, CmpOp, Opcode, ALL_OPCODES};

/// Largest value an argument word can carry
pub const MAX_ARG: u32 = (1 << 31) - 1;

/// A primitive opcode and its argument, if it takes one
pub type Primitive = (Opcode, Option<u32>);

/// Result type for instruction stream operations
pub type CodeResult<T> = Result<T, CodeError>;

/// Malformed instruction streams and code construction errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeError {
    /// Opcode word with no matching opcode
    UnknownOpcode { index: usize, byte: u32 },
    /// An argument word where an opcode was expected
    ArgumentAsOpcode { index: usize },
    /// A primitive's argument word is absent
    MissingArgument { index: usize, opcode: Opcode },
    /// Decoding finished but the following word is an argument
    TrailingArgument { index: usize },
    /// Index past the end of the stream
    IndexOutOfBounds { index: usize, len: usize },
    /// An argument was supplied to a primitive that takes none, or omitted
    ArgumentMismatch { opcode: Opcode },
    /// Argument does not fit in an argument word
    ArgumentTooLarge(u64),
    /// A label was referenced but never bound
    UnboundLabel(usize),
    /// A jump lands outside the stream or inside an instruction
    BadJumpTarget { index: usize, target: i64 },
    /// Unknown local, name or cell referenced by the builder
    UnknownName(String),
    /// Code unit has no instructions
    Empty,
}

impl fmt::Display for CodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownOpcode { index, byte } => {
                write!(f, "Unknown opcode 0x{:02x} at index {}", byte, index)
            }
            Self::ArgumentAsOpcode { index } => {
                write!(f, "Expected an opcode at index {}, found an argument", index)
            }
            Self::MissingArgument { index, opcode } => {
                write!(f, "Missing argument for {} at index {}", opcode, index)
            }
            Self::TrailingArgument { index } => {
                write!(f, "Decoding would leave an argument at index {}", index)
            }
            Self::IndexOutOfBounds { index, len } => {
                write!(f, "Index {} out of bounds for stream of length {}", index, len)
            }
            Self::ArgumentMismatch { opcode } => {
                write!(f, "Argument presence does not match opcode {}", opcode)
            }
            Self::ArgumentTooLarge(arg) => write!(f, "Argument {} too large", arg),
            Self::UnboundLabel(label) => write!(f, "Label {} was never bound", label),
            Self::BadJumpTarget { index, target } => {
                write!(f, "Jump at index {} targets invalid index {}", index, target)
            }
            Self::UnknownName(name) => write!(f, "Unknown name: {}", name),
            Self::Empty => write!(f, "Code unit has no instructions"),
        }
    }
}

impl std::error::Error for CodeError {}

/// One word of the instruction stream
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Word(u32);

impl Word {
    /// Encode an opcode word
    #[inline]
    pub const fn opcode(op: Opcode) -> Self {
        Word((op as u32) << 1)
    }

    /// Encode an argument word
    #[inline]
    pub fn argument(arg: u32) -> CodeResult<Self> {
        if arg > MAX_ARG {
            return Err(CodeError::ArgumentTooLarge(arg as u64));
        }
        Ok(Word((arg << 1) | 1))
    }

    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Word(raw)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_argument(self) -> bool {
        self.0 & 1 == 1
    }

    /// The argument carried by this word, if it is an argument word
    #[inline]
    pub const fn as_argument(self) -> Option<u32> {
        if self.is_argument() {
            Some(self.0 >> 1)
        } else {
            None
        }
    }
}

impl fmt::Debug for Word {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_argument() {
            Some(arg) => write!(f, "arg({})", arg),
            None => match u8::try_from(self.0 >> 1).ok().and_then(Opcode::from_byte) {
                Some(op) => write!(f, "{}", op),
                None => write!(f, "op(0x{:x})", self.0 >> 1),
            },
        }
    }
}

/// Read the opcode stored at `index`
pub fn opcode_at(words: &[Word], index: usize) -> CodeResult<Opcode> {
    let word = words.get(index).copied().ok_or(CodeError::IndexOutOfBounds {
        index,
        len: words.len(),
    })?;
    if word.is_argument() {
        return Err(CodeError::ArgumentAsOpcode { index });
    }
    let byte = word.raw() >> 1;
    u8::try_from(byte)
        .ok()
        .and_then(Opcode::from_byte)
        .ok_or(CodeError::UnknownOpcode { index, byte })
}

/// Decode the instruction at `index` into its primitive opcodes
///
/// Nested superinstructions are expanded fully. Returns the primitives with
/// their arguments and the index of the next instruction. Fails if an
/// argument is missing or if the word after the consumed arguments is itself
/// an argument, which would mean the stream and the opcode table disagree.
pub fn decode_superinstruction(
    words: &[Word],
    index: usize,
) -> CodeResult<(Vec<Primitive>, usize)> {
    let op = opcode_at(words, index)?;
    let mut out = Vec::with_capacity(op.primitives().len());
    let next = expand(words, op, index + 1, &mut out)?;
    if words.get(next).is_some_and(|w| w.is_argument()) {
        return Err(CodeError::TrailingArgument { index: next });
    }
    Ok((out, next))
}

fn expand(words: &[Word], op: Opcode, next: usize, out: &mut Vec<Primitive>) -> CodeResult<usize> {
    if op.is_superinstruction() {
        let mut next = next;
        for &component in op.components() {
            next = expand(words, component, next, out)?;
        }
        Ok(next)
    } else if op.has_arg() {
        let arg = words
            .get(next)
            .and_then(|w| w.as_argument())
            .ok_or(CodeError::MissingArgument { index: next, opcode: op })?;
        out.push((op, Some(arg)));
        Ok(next + 1)
    } else {
        out.push((op, None));
        Ok(next)
    }
}

/// Length in words of an instruction starting with `op`
#[inline]
pub fn instruction_len(op: Opcode) -> usize {
    1 + op.arg_count()
}

/// Longest superinstruction whose expansion is a prefix of `ops`
pub fn longest_fusion(ops: &[Opcode]) -> Option<Opcode> {
    ALL_OPCODES
        .iter()
        .copied()
        .filter(|op| op.is_superinstruction())
        .filter(|op| ops.starts_with(op.primitives()))
        .max_by_key(|op| op.primitives().len())
}

/// Encode primitives without fusing anything
pub fn encode_unfused(prims: &[Primitive]) -> CodeResult<Vec<Word>> {
    let mut words = Vec::with_capacity(prims.len() * 2);
    for &(op, arg) in prims {
        push_primitive(&mut words, op, arg)?;
    }
    Ok(words)
}

/// Encode primitives, greedily fusing runs into superinstructions
///
/// Inverse of [`decode_superinstruction`]: decoding the output instruction
/// by instruction reproduces `prims` exactly.
pub fn encode(prims: &[Primitive]) -> CodeResult<Vec<Word>> {
    let ops: SmallVec<[Opcode; 16]> = prims.iter().map(|(op, _)| *op).collect();
    let mut words = Vec::with_capacity(prims.len() * 2);
    let mut i = 0;
    while i < prims.len() {
        match longest_fusion(&ops[i..]) {
            Some(fused) => {
                let n = fused.primitives().len();
                words.push(Word::opcode(fused));
                for &(op, arg) in &prims[i..i + n] {
                    push_argument(&mut words, op, arg)?;
                }
                i += n;
            }
            None => {
                let (op, arg) = prims[i];
                push_primitive(&mut words, op, arg)?;
                i += 1;
            }
        }
    }
    Ok(words)
}

fn push_primitive(words: &mut Vec<Word>, op: Opcode, arg: Option<u32>) -> CodeResult<()> {
    if op.is_superinstruction() {
        return Err(CodeError::ArgumentMismatch { opcode: op });
    }
    words.push(Word::opcode(op));
    push_argument(words, op, arg)
}

fn push_argument(words: &mut Vec<Word>, op: Opcode, arg: Option<u32>) -> CodeResult<()> {
    match (op.has_arg(), arg) {
        (true, Some(arg)) => {
            words.push(Word::argument(arg)?);
            Ok(())
        }
        (false, None) => Ok(()),
        _ => Err(CodeError::ArgumentMismatch { opcode: op }),
    }
}

/// Resolve the jump target of a primitive inside the instruction ending at
/// `next_index`
///
/// Relative targets are measured from the end of the whole instruction,
/// including fused components.
pub fn jump_target(op: Opcode, arg: u32, next_index: usize) -> Option<usize> {
    match op.arg_kind() {
        ArgKind::RelJump => Some(next_index + arg as usize),
        ArgKind::AbsJump => Some(arg as usize),
        _ => None,
    }
}

/// Render a human-readable listing of a code unit
///
/// Output lines look like `   3 >>   12 FOR_ITER            9 (to 23)`.
pub fn disassemble(code: &CodeUnit) -> String {
    let words = code.words();
    let mut targets = std::collections::BTreeSet::new();
    let mut index = 0;
    while index < words.len() {
        match decode_superinstruction(words, index) {
            Ok((prims, next)) => {
                for (op, arg) in &prims {
                    if let Some(t) = arg.and_then(|a| jump_target(*op, a, next)) {
                        targets.insert(t);
                    }
                }
                index = next;
            }
            Err(_) => break,
        }
    }

    let mut out = String::new();
    let mut index = 0;
    let mut last_line = None;
    while index < words.len() {
        let (prims, next) = match decode_superinstruction(words, index) {
            Ok(decoded) => decoded,
            Err(e) => {
                let _ = writeln!(out, "      {:>5} <{}>", index, e);
                break;
            }
        };
        let line = code.line_for(index);
        let line_col = if last_line != Some(line) {
            last_line = Some(line);
            format!("{:>4}", line)
        } else {
            "    ".to_string()
        };
        let marker = if targets.contains(&index) { ">>" } else { "  " };
        let op = match opcode_at(words, index) {
            Ok(op) => op,
            Err(_) => break,
        };
        let args: Vec<String> = prims
            .iter()
            .filter_map(|&(p, arg)| arg.map(|a| describe_arg(code, p, a, next)))
            .collect();
        let _ = writeln!(
            out,
            "{} {} {:>5} {:<28} {}",
            line_col,
            marker,
            index,
            op.mnemonic(),
            args.join(", ")
        );
        index = next;
    }
    out
}

fn describe_arg(code: &CodeUnit, op: Opcode, arg: u32, next: usize) -> String {
    let idx = arg as usize;
    match op.arg_kind() {
        ArgKind::Const => match code.consts().get(idx) {
            Some(v) => format!("{} ({})", arg, v.repr()),
            None => format!("{} (?)", arg),
        },
        ArgKind::Name => match code.names().get(idx) {
            Some(n) => format!("{} ({})", arg, n),
            None => format!("{} (?)", arg),
        },
        ArgKind::Local => match code.varnames().get(idx) {
            Some(n) => format!("{} ({})", arg, n),
            None => format!("{} (?)", arg),
        },
        ArgKind::Free => match code.cell_name(idx) {
            Some(n) => format!("{} ({})", arg, n),
            None => format!("{} (?)", arg),
        },
        ArgKind::Compare => match CmpOp::from_arg(arg) {
            Some(c) => format!("{} ({})", arg, c),
            None => format!("{} (BAD)", arg),
        },
        ArgKind::RelJump => format!("{} (to {})", arg, next + idx),
        ArgKind::AbsJump | ArgKind::Count | ArgKind::None => arg.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(words: &[Word]) -> Vec<Primitive> {
        let mut out = Vec::new();
        let mut i = 0;
        while i < words.len() {
            let (prims, next) = decode_superinstruction(words, i).unwrap();
            out.extend(prims);
            i = next;
        }
        out
    }

    #[test]
    fn test_word_encoding() {
        let op = Word::opcode(Opcode::LoadFast);
        assert!(!op.is_argument());
        assert_eq!(op.raw(), (Opcode::LoadFast as u32) << 1);
        let arg = Word::argument(7).unwrap();
        assert!(arg.is_argument());
        assert_eq!(arg.as_argument(), Some(7));
        assert!(Word::argument(MAX_ARG + 1).is_err());
    }

    #[test]
    fn test_decode_primitive() {
        let words = encode_unfused(&[(Opcode::LoadFast, Some(3)), (Opcode::ReturnValue, None)]).unwrap();
        let (prims, next) = decode_superinstruction(&words, 0).unwrap();
        assert_eq!(prims, vec![(Opcode::LoadFast, Some(3))]);
        assert_eq!(next, 2);
        let (prims, next) = decode_superinstruction(&words, 2).unwrap();
        assert_eq!(prims, vec![(Opcode::ReturnValue, None)]);
        assert_eq!(next, 3);
    }

    #[test]
    fn test_decode_nested_superinstruction() {
        let prims = vec![
            (Opcode::LoadFast, Some(0)),
            (Opcode::LoadConst, Some(1)),
            (Opcode::CompareOp, Some(0)),
            (Opcode::PopJumpIfFalse, Some(12)),
        ];
        let words = encode(&prims).unwrap();
        assert_eq!(
            opcode_at(&words, 0).unwrap(),
            Opcode::LoadFastLoadConstCompareOpPopJumpIfFalse
        );
        assert_eq!(words.len(), 5);
        let (decoded, next) = decode_superinstruction(&words, 0).unwrap();
        assert_eq!(decoded, prims);
        assert_eq!(next, words.len());
    }

    #[test]
    fn test_encode_decode_sequence() {
        let prims = vec![
            (Opcode::LoadFast, Some(0)),
            (Opcode::LoadFast, Some(1)),
            (Opcode::BinaryAdd, None),
            (Opcode::StoreFast, Some(2)),
            (Opcode::LoadGlobal, Some(0)),
            (Opcode::CallFunction, Some(0)),
            (Opcode::PopTop, None),
            (Opcode::LoadConst, Some(0)),
            (Opcode::ReturnValue, None),
        ];
        let words = encode(&prims).unwrap();
        assert!(words.len() < encode_unfused(&prims).unwrap().len());
        assert_eq!(decode_all(&words), prims);
    }

    #[test]
    fn test_decode_rejects_missing_argument() {
        let words = vec![Word::opcode(Opcode::LoadFastLoadFast), Word::argument(1).unwrap()];
        assert_eq!(
            decode_superinstruction(&words, 0),
            Err(CodeError::MissingArgument { index: 2, opcode: Opcode::LoadFast })
        );
    }

    #[test]
    fn test_decode_rejects_trailing_argument() {
        let words = vec![
            Word::opcode(Opcode::LoadFast),
            Word::argument(1).unwrap(),
            Word::argument(2).unwrap(),
        ];
        assert_eq!(
            decode_superinstruction(&words, 0),
            Err(CodeError::TrailingArgument { index: 2 })
        );
        assert_eq!(
            decode_superinstruction(&words, 1),
            Err(CodeError::ArgumentAsOpcode { index: 1 })
        );
    }

    #[test]
    fn test_encode_rejects_argument_mismatch() {
        assert!(encode(&[(Opcode::PopTop, Some(1))]).is_err());
        assert!(encode(&[(Opcode::LoadFast, None)]).is_err());
    }

    #[test]
    fn test_longest_fusion_prefers_nested() {
        let ops = [Opcode::LoadFast, Opcode::LoadFast, Opcode::BinaryAdd, Opcode::PopTop];
        assert_eq!(longest_fusion(&ops), Some(Opcode::LoadFastLoadFastBinaryAdd));
        assert_eq!(longest_fusion(&[Opcode::PopTop, Opcode::PopTop]), None);
    }

    #[test]
    fn test_jump_target() {
        assert_eq!(jump_target(Opcode::JumpForward, 4, 10), Some(14));
        assert_eq!(jump_target(Opcode::JumpAbsolute, 4, 10), Some(4));
        assert_eq!(jump_target(Opcode::LoadFast, 4, 10), None);
    }
}
