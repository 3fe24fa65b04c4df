//! Bytecode opcodes for the tiered VM
//!
//! This module defines the instruction set executed by the interpreter and
//! lowered by the IR builder. Opcodes are grouped by category and assigned
//! contiguous ranges:
//!
//! - `0x00-0x4F`: primitives without an inline argument
//! - `0x50-0xBF`: primitives followed by exactly one argument word
//! - `0xC0-0xFF`: superinstructions (fused primitive sequences)
//!
//! A superinstruction never carries an argument of its own. Its arguments are
//! the arguments of its components, stored in component order right after the
//! superinstruction word.

use std::fmt;

use crate::backend::ops::{BinaryOp, UnaryOp};

/// First opcode value whose primitive takes an argument
pub const HAVE_ARGUMENT: u8 = 0x50;

/// First opcode value reserved for superinstructions
pub const FIRST_SUPERINSTRUCTION: u8 = 0xC0;

/// Bytecode opcode enumeration
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Opcode {
    // === Stack Operations (0x00-0x0F) ===
    /// No operation
    Nop = 0x00,
    /// Discard top of stack
    PopTop = 0x01,
    /// Swap top two stack elements
    RotTwo = 0x02,
    /// Rotate top 3: [a,b,c] -> [c,a,b]
    RotThree = 0x03,
    /// Rotate top 4: [a,b,c,d] -> [d,a,b,c]
    RotFour = 0x04,
    /// Duplicate top of stack
    DupTop = 0x05,
    /// Duplicate the top two elements
    DupTopTwo = 0x06,
    /// Duplicate the top three elements
    DupTopThree = 0x07,

    // === Unary Operators (0x10-0x17) ===
    UnaryPositive = 0x10,
    UnaryNegative = 0x11,
    UnaryNot = 0x12,
    UnaryInvert = 0x13,

    // === Binary Operators (0x18-0x27) ===
    BinaryPower = 0x18,
    BinaryMultiply = 0x19,
    BinaryTrueDivide = 0x1A,
    BinaryFloorDivide = 0x1B,
    BinaryModulo = 0x1C,
    BinaryAdd = 0x1D,
    BinarySubtract = 0x1E,
    BinaryLshift = 0x1F,
    BinaryRshift = 0x20,
    BinaryAnd = 0x21,
    BinaryXor = 0x22,
    BinaryOr = 0x23,
    /// TOS1[TOS]
    BinarySubscr = 0x24,

    // === In-place Operators (0x28-0x37) ===
    InplacePower = 0x28,
    InplaceMultiply = 0x29,
    InplaceTrueDivide = 0x2A,
    InplaceFloorDivide = 0x2B,
    InplaceModulo = 0x2C,
    InplaceAdd = 0x2D,
    InplaceSubtract = 0x2E,
    InplaceLshift = 0x2F,
    InplaceRshift = 0x30,
    InplaceAnd = 0x31,
    InplaceXor = 0x32,
    InplaceOr = 0x33,

    // === Containers and Iteration (0x38-0x3F) ===
    /// TOS1[TOS] = TOS2
    StoreSubscr = 0x38,
    /// del TOS1[TOS]
    DeleteSubscr = 0x39,
    /// TOS = iter(TOS)
    GetIter = 0x3A,
    /// TOS2[TOS] = TOS1, leaving the dict on the stack
    StoreMap = 0x3B,
    /// TOS = TOS[:]
    Slice0 = 0x3C,
    /// TOS = TOS1[TOS:]
    Slice1 = 0x3D,
    /// TOS = TOS1[:TOS]
    Slice2 = 0x3E,
    /// TOS = TOS2[TOS1:TOS]
    Slice3 = 0x3F,

    // === Block and Frame Control (0x40-0x47) ===
    /// Unwind with reason `break`
    BreakLoop = 0x40,
    /// Return TOS to the caller
    ReturnValue = 0x41,
    /// Suspend the generator, yielding TOS
    YieldValue = 0x42,
    /// Pop the innermost block
    PopBlock = 0x43,
    /// Finish a finally/except clause, resuming any pending unwind
    EndFinally = 0x44,
    /// Call a context manager's `__exit__`
    WithCleanup = 0x45,

    // === Slice Assignment (0x48-0x4F) ===
    /// TOS[:] = TOS1
    StoreSlice0 = 0x48,
    /// TOS1[TOS:] = TOS2
    StoreSlice1 = 0x49,
    /// TOS1[:TOS] = TOS2
    StoreSlice2 = 0x4A,
    /// TOS2[TOS1:TOS] = TOS3
    StoreSlice3 = 0x4B,
    /// del TOS[:]
    DeleteSlice0 = 0x4C,
    /// del TOS1[TOS:]
    DeleteSlice1 = 0x4D,
    /// del TOS1[:TOS]
    DeleteSlice2 = 0x4E,
    /// del TOS2[TOS1:TOS]
    DeleteSlice3 = 0x4F,

    // === Primitives with an argument (0x50-0xBF) ===
    /// Unpack TOS into `arg` values
    UnpackSequence = 0x50,
    /// Advance the iterator at TOS, or pop it and jump forward by `arg`
    ForIter = 0x51,
    StoreAttr = 0x52,
    DeleteAttr = 0x53,
    StoreGlobal = 0x54,
    DeleteGlobal = 0x55,
    LoadConst = 0x56,
    BuildTuple = 0x57,
    BuildList = 0x58,
    BuildMap = 0x59,
    LoadAttr = 0x5A,
    CompareOp = 0x5B,
    JumpForward = 0x5C,
    PopJumpIfFalse = 0x5D,
    PopJumpIfTrue = 0x5E,
    JumpIfFalseOrPop = 0x5F,
    JumpIfTrueOrPop = 0x60,
    JumpAbsolute = 0x61,
    LoadGlobal = 0x62,
    /// Unwind with reason `continue`, targeting `arg`
    ContinueLoop = 0x63,
    SetupLoop = 0x64,
    SetupExcept = 0x65,
    SetupFinally = 0x66,
    LoadFast = 0x67,
    StoreFast = 0x68,
    DeleteFast = 0x69,
    /// Raise with 0, 1 or 2 stack operands
    RaiseVarargs = 0x6A,
    /// Call with `arg & 0xff` positional and `arg >> 8` keyword arguments
    CallFunction = 0x6B,
    /// Build a function from the code at TOS and `arg` defaults
    MakeFunction = 0x6C,
    /// Like MakeFunction with a tuple of cells below the code
    MakeClosure = 0x6D,
    LoadClosure = 0x6E,
    LoadDeref = 0x6F,
    StoreDeref = 0x70,
    /// Append TOS to the list `arg` slots below it
    ListAppend = 0x71,
    /// Slice object from the top 2 or 3 values (`arg`)
    BuildSlice = 0x72,
    /// CallFunction with a `*args` iterable on top
    CallFunctionVar = 0x73,
    /// CallFunction with a `**kwargs` dict on top
    CallFunctionKw = 0x74,
    /// CallFunction with `*args` then `**kwargs` on top
    CallFunctionVarKw = 0x75,

    // === Superinstructions (0xC0-0xFF) ===
    LoadFastLoadFast = 0xC0,
    LoadFastLoadConst = 0xC1,
    LoadGlobalCallFunction = 0xC2,
    CompareOpPopJumpIfFalse = 0xC3,
    StoreFastLoadFast = 0xC4,
    BinaryAddStoreFast = 0xC5,
    LoadFastLoadFastBinaryAdd = 0xC6,
    LoadFastLoadConstCompareOpPopJumpIfFalse = 0xC7,
    InplaceAddStoreFast = 0xC8,
    LoadFastInplaceAddStoreFast = 0xC9,
    LoadConstReturnValue = 0xCA,
    PopTopJumpAbsolute = 0xCB,
}

/// Class of the argument word following a primitive
///
/// The lowering pass and the disassembler use this to decide which table an
/// argument indexes and whether it names a jump target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgKind {
    /// The primitive takes no argument
    None,
    /// A plain count or packed count pair
    Count,
    /// Index into the constant pool
    Const,
    /// Index into the names table (globals and attributes)
    Name,
    /// Index into the local variable slots
    Local,
    /// Index into cellvars followed by freevars
    Free,
    /// A comparison operator
    Compare,
    /// Jump target relative to the end of the instruction
    RelJump,
    /// Absolute jump target
    AbsJump,
}

/// Comparison operators encoded in `CompareOp`'s argument
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Lt = 0,
    Le = 1,
    Eq = 2,
    Ne = 3,
    Gt = 4,
    Ge = 5,
    In = 6,
    NotIn = 7,
    Is = 8,
    IsNot = 9,
    ExcMatch = 10,
}

impl CmpOp {
    /// Decode a `CompareOp` argument
    pub fn from_arg(arg: u32) -> Option<Self> {
        Some(match arg {
            0 => CmpOp::Lt,
            1 => CmpOp::Le,
            2 => CmpOp::Eq,
            3 => CmpOp::Ne,
            4 => CmpOp::Gt,
            5 => CmpOp::Ge,
            6 => CmpOp::In,
            7 => CmpOp::NotIn,
            8 => CmpOp::Is,
            9 => CmpOp::IsNot,
            10 => CmpOp::ExcMatch,
            _ => return None,
        })
    }

    pub fn symbol(self) -> &'static str {
        match self {
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::In => "in",
            CmpOp::NotIn => "not in",
            CmpOp::Is => "is",
            CmpOp::IsNot => "is not",
            CmpOp::ExcMatch => "exception match",
        }
    }
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

impl Opcode {
    /// Convert a byte to an opcode
    #[inline]
    pub fn from_byte(byte: u8) -> Option<Self> {
        OPCODE_TABLE[byte as usize]
    }

    /// Convert opcode to byte
    #[inline]
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Whether this is a fused superinstruction
    #[inline]
    pub fn is_superinstruction(self) -> bool {
        self as u8 >= FIRST_SUPERINSTRUCTION
    }

    /// Whether this primitive is followed by an argument word
    ///
    /// Superinstructions never take an argument of their own.
    #[inline]
    pub fn has_arg(self) -> bool {
        let b = self as u8;
        (HAVE_ARGUMENT..FIRST_SUPERINSTRUCTION).contains(&b)
    }

    /// Table class of this primitive's argument
    pub fn arg_kind(self) -> ArgKind {
        match self {
            Self::LoadConst => ArgKind::Const,
            Self::StoreAttr
            | Self::DeleteAttr
            | Self::StoreGlobal
            | Self::DeleteGlobal
            | Self::LoadAttr
            | Self::LoadGlobal => ArgKind::Name,
            Self::LoadFast | Self::StoreFast | Self::DeleteFast => ArgKind::Local,
            Self::LoadClosure | Self::LoadDeref | Self::StoreDeref => ArgKind::Free,
            Self::CompareOp => ArgKind::Compare,
            Self::ForIter
            | Self::JumpForward
            | Self::SetupLoop
            | Self::SetupExcept
            | Self::SetupFinally => ArgKind::RelJump,
            Self::PopJumpIfFalse
            | Self::PopJumpIfTrue
            | Self::JumpIfFalseOrPop
            | Self::JumpIfTrueOrPop
            | Self::JumpAbsolute
            | Self::ContinueLoop => ArgKind::AbsJump,
            op if op.has_arg() => ArgKind::Count,
            _ => ArgKind::None,
        }
    }

    /// Direct components of a superinstruction (empty for primitives)
    ///
    /// Components may themselves be superinstructions.
    pub fn components(self) -> &'static [Opcode] {
        use Opcode::*;
        match self {
            LoadFastLoadFast => &[LoadFast, LoadFast],
            LoadFastLoadConst => &[LoadFast, LoadConst],
            LoadGlobalCallFunction => &[LoadGlobal, CallFunction],
            CompareOpPopJumpIfFalse => &[CompareOp, PopJumpIfFalse],
            StoreFastLoadFast => &[StoreFast, LoadFast],
            BinaryAddStoreFast => &[BinaryAdd, StoreFast],
            LoadFastLoadFastBinaryAdd => &[LoadFastLoadFast, BinaryAdd],
            LoadFastLoadConstCompareOpPopJumpIfFalse => {
                &[LoadFastLoadConst, CompareOpPopJumpIfFalse]
            }
            InplaceAddStoreFast => &[InplaceAdd, StoreFast],
            LoadFastInplaceAddStoreFast => &[LoadFast, InplaceAddStoreFast],
            LoadConstReturnValue => &[LoadConst, ReturnValue],
            PopTopJumpAbsolute => &[PopTop, JumpAbsolute],
            _ => &[],
        }
    }

    /// Fully expanded primitive sequence
    ///
    /// A primitive expands to itself. The interpreter executes an instruction
    /// by running these in order.
    pub fn primitives(self) -> &'static [Opcode] {
        use Opcode::*;
        match self {
            LoadFastLoadFast => &[LoadFast, LoadFast],
            LoadFastLoadConst => &[LoadFast, LoadConst],
            LoadGlobalCallFunction => &[LoadGlobal, CallFunction],
            CompareOpPopJumpIfFalse => &[CompareOp, PopJumpIfFalse],
            StoreFastLoadFast => &[StoreFast, LoadFast],
            BinaryAddStoreFast => &[BinaryAdd, StoreFast],
            LoadFastLoadFastBinaryAdd => &[LoadFast, LoadFast, BinaryAdd],
            LoadFastLoadConstCompareOpPopJumpIfFalse => {
                &[LoadFast, LoadConst, CompareOp, PopJumpIfFalse]
            }
            InplaceAddStoreFast => &[InplaceAdd, StoreFast],
            LoadFastInplaceAddStoreFast => &[LoadFast, InplaceAdd, StoreFast],
            LoadConstReturnValue => &[LoadConst, ReturnValue],
            PopTopJumpAbsolute => &[PopTop, JumpAbsolute],
            op => std::slice::from_ref(&SELF_TABLE[op as usize]),
        }
    }

    /// Number of argument words following this instruction
    #[inline]
    pub fn arg_count(self) -> usize {
        self.primitives().iter().filter(|p| p.has_arg()).count()
    }

    /// Whether this primitive can transfer control somewhere other than the
    /// next instruction (jumps, unwinds, suspension, block setup)
    ///
    /// Only the last primitive of a superinstruction may be one of these.
    pub fn is_control_transfer(self) -> bool {
        matches!(
            self,
            Self::BreakLoop
                | Self::ReturnValue
                | Self::YieldValue
                | Self::EndFinally
                | Self::RaiseVarargs
                | Self::ForIter
                | Self::JumpForward
                | Self::PopJumpIfFalse
                | Self::PopJumpIfTrue
                | Self::JumpIfFalseOrPop
                | Self::JumpIfTrueOrPop
                | Self::JumpAbsolute
                | Self::ContinueLoop
                | Self::SetupLoop
                | Self::SetupExcept
                | Self::SetupFinally
        )
    }

    /// Check if this opcode is a jump instruction
    #[inline]
    pub fn is_jump(self) -> bool {
        matches!(self.arg_kind(), ArgKind::RelJump | ArgKind::AbsJump)
            && !self.is_block_setup()
            && self != Self::ContinueLoop
    }

    /// Check if this opcode is a conditional branch
    #[inline]
    pub fn is_conditional_jump(self) -> bool {
        matches!(
            self,
            Self::PopJumpIfFalse
                | Self::PopJumpIfTrue
                | Self::JumpIfFalseOrPop
                | Self::JumpIfTrueOrPop
        )
    }

    /// Check if this opcode pushes a block-stack entry
    #[inline]
    pub fn is_block_setup(self) -> bool {
        matches!(self, Self::SetupLoop | Self::SetupExcept | Self::SetupFinally)
    }

    /// Binary operator implemented by this opcode, if any
    pub fn binary_op(self) -> Option<BinaryOp> {
        Some(match self {
            Self::BinaryPower => BinaryOp::Pow,
            Self::BinaryMultiply => BinaryOp::Mul,
            Self::BinaryTrueDivide => BinaryOp::TrueDiv,
            Self::BinaryFloorDivide => BinaryOp::FloorDiv,
            Self::BinaryModulo => BinaryOp::Mod,
            Self::BinaryAdd => BinaryOp::Add,
            Self::BinarySubtract => BinaryOp::Sub,
            Self::BinaryLshift => BinaryOp::LShift,
            Self::BinaryRshift => BinaryOp::RShift,
            Self::BinaryAnd => BinaryOp::And,
            Self::BinaryXor => BinaryOp::Xor,
            Self::BinaryOr => BinaryOp::Or,
            Self::BinarySubscr => BinaryOp::GetItem,
            _ => return None,
        })
    }

    /// In-place operator implemented by this opcode, if any
    pub fn inplace_op(self) -> Option<BinaryOp> {
        Some(match self {
            Self::InplacePower => BinaryOp::Pow,
            Self::InplaceMultiply => BinaryOp::Mul,
            Self::InplaceTrueDivide => BinaryOp::TrueDiv,
            Self::InplaceFloorDivide => BinaryOp::FloorDiv,
            Self::InplaceModulo => BinaryOp::Mod,
            Self::InplaceAdd => BinaryOp::Add,
            Self::InplaceSubtract => BinaryOp::Sub,
            Self::InplaceLshift => BinaryOp::LShift,
            Self::InplaceRshift => BinaryOp::RShift,
            Self::InplaceAnd => BinaryOp::And,
            Self::InplaceXor => BinaryOp::Xor,
            Self::InplaceOr => BinaryOp::Or,
            _ => return None,
        })
    }

    /// Whether a slice opcode takes its `(lower, upper)` bounds from the stack
    pub fn slice_bounds(self) -> Option<(bool, bool)> {
        use Opcode::*;
        Some(match self {
            Slice0 | StoreSlice0 | DeleteSlice0 => (false, false),
            Slice1 | StoreSlice1 | DeleteSlice1 => (true, false),
            Slice2 | StoreSlice2 | DeleteSlice2 => (false, true),
            Slice3 | StoreSlice3 | DeleteSlice3 => (true, true),
            _ => return None,
        })
    }

    /// `(*args, **kwargs)` operands of a call opcode
    pub fn call_extras(self) -> Option<(bool, bool)> {
        Some(match self {
            Self::CallFunction => (false, false),
            Self::CallFunctionVar => (true, false),
            Self::CallFunctionKw => (false, true),
            Self::CallFunctionVarKw => (true, true),
            _ => return None,
        })
    }

    /// Unary operator implemented by this opcode, if any
    pub fn unary_op(self) -> Option<UnaryOp> {
        Some(match self {
            Self::UnaryPositive => UnaryOp::Pos,
            Self::UnaryNegative => UnaryOp::Neg,
            Self::UnaryNot => UnaryOp::Not,
            Self::UnaryInvert => UnaryOp::Invert,
            _ => return None,
        })
    }

    /// Get the mnemonic name
    pub fn mnemonic(self) -> &'static str {
        match self {
            Self::Nop => "NOP",
            Self::PopTop => "POP_TOP",
            Self::RotTwo => "ROT_TWO",
            Self::RotThree => "ROT_THREE",
            Self::RotFour => "ROT_FOUR",
            Self::DupTop => "DUP_TOP",
            Self::DupTopTwo => "DUP_TOP_TWO",
            Self::DupTopThree => "DUP_TOP_THREE",
            Self::UnaryPositive => "UNARY_POSITIVE",
            Self::UnaryNegative => "UNARY_NEGATIVE",
            Self::UnaryNot => "UNARY_NOT",
            Self::UnaryInvert => "UNARY_INVERT",
            Self::BinaryPower => "BINARY_POWER",
            Self::BinaryMultiply => "BINARY_MULTIPLY",
            Self::BinaryTrueDivide => "BINARY_TRUE_DIVIDE",
            Self::BinaryFloorDivide => "BINARY_FLOOR_DIVIDE",
            Self::BinaryModulo => "BINARY_MODULO",
            Self::BinaryAdd => "BINARY_ADD",
            Self::BinarySubtract => "BINARY_SUBTRACT",
            Self::BinaryLshift => "BINARY_LSHIFT",
            Self::BinaryRshift => "BINARY_RSHIFT",
            Self::BinaryAnd => "BINARY_AND",
            Self::BinaryXor => "BINARY_XOR",
            Self::BinaryOr => "BINARY_OR",
            Self::BinarySubscr => "BINARY_SUBSCR",
            Self::InplacePower => "INPLACE_POWER",
            Self::InplaceMultiply => "INPLACE_MULTIPLY",
            Self::InplaceTrueDivide => "INPLACE_TRUE_DIVIDE",
            Self::InplaceFloorDivide => "INPLACE_FLOOR_DIVIDE",
            Self::InplaceModulo => "INPLACE_MODULO",
            Self::InplaceAdd => "INPLACE_ADD",
            Self::InplaceSubtract => "INPLACE_SUBTRACT",
            Self::InplaceLshift => "INPLACE_LSHIFT",
            Self::InplaceRshift => "INPLACE_RSHIFT",
            Self::InplaceAnd => "INPLACE_AND",
            Self::InplaceXor => "INPLACE_XOR",
            Self::InplaceOr => "INPLACE_OR",
            Self::StoreSubscr => "STORE_SUBSCR",
            Self::DeleteSubscr => "DELETE_SUBSCR",
            Self::GetIter => "GET_ITER",
            Self::StoreMap => "STORE_MAP",
            Self::Slice0 => "SLICE+0",
            Self::Slice1 => "SLICE+1",
            Self::Slice2 => "SLICE+2",
            Self::Slice3 => "SLICE+3",
            Self::BreakLoop => "BREAK_LOOP",
            Self::ReturnValue => "RETURN_VALUE",
            Self::YieldValue => "YIELD_VALUE",
            Self::PopBlock => "POP_BLOCK",
            Self::EndFinally => "END_FINALLY",
            Self::WithCleanup => "WITH_CLEANUP",
            Self::StoreSlice0 => "STORE_SLICE+0",
            Self::StoreSlice1 => "STORE_SLICE+1",
            Self::StoreSlice2 => "STORE_SLICE+2",
            Self::StoreSlice3 => "STORE_SLICE+3",
            Self::DeleteSlice0 => "DELETE_SLICE+0",
            Self::DeleteSlice1 => "DELETE_SLICE+1",
            Self::DeleteSlice2 => "DELETE_SLICE+2",
            Self::DeleteSlice3 => "DELETE_SLICE+3",
            Self::UnpackSequence => "UNPACK_SEQUENCE",
            Self::ForIter => "FOR_ITER",
            Self::StoreAttr => "STORE_ATTR",
            Self::DeleteAttr => "DELETE_ATTR",
            Self::StoreGlobal => "STORE_GLOBAL",
            Self::DeleteGlobal => "DELETE_GLOBAL",
            Self::LoadConst => "LOAD_CONST",
            Self::BuildTuple => "BUILD_TUPLE",
            Self::BuildList => "BUILD_LIST",
            Self::BuildMap => "BUILD_MAP",
            Self::LoadAttr => "LOAD_ATTR",
            Self::CompareOp => "COMPARE_OP",
            Self::JumpForward => "JUMP_FORWARD",
            Self::PopJumpIfFalse => "POP_JUMP_IF_FALSE",
            Self::PopJumpIfTrue => "POP_JUMP_IF_TRUE",
            Self::JumpIfFalseOrPop => "JUMP_IF_FALSE_OR_POP",
            Self::JumpIfTrueOrPop => "JUMP_IF_TRUE_OR_POP",
            Self::JumpAbsolute => "JUMP_ABSOLUTE",
            Self::LoadGlobal => "LOAD_GLOBAL",
            Self::ContinueLoop => "CONTINUE_LOOP",
            Self::SetupLoop => "SETUP_LOOP",
            Self::SetupExcept => "SETUP_EXCEPT",
            Self::SetupFinally => "SETUP_FINALLY",
            Self::LoadFast => "LOAD_FAST",
            Self::StoreFast => "STORE_FAST",
            Self::DeleteFast => "DELETE_FAST",
            Self::RaiseVarargs => "RAISE_VARARGS",
            Self::CallFunction => "CALL_FUNCTION",
            Self::MakeFunction => "MAKE_FUNCTION",
            Self::MakeClosure => "MAKE_CLOSURE",
            Self::LoadClosure => "LOAD_CLOSURE",
            Self::LoadDeref => "LOAD_DEREF",
            Self::StoreDeref => "STORE_DEREF",
            Self::ListAppend => "LIST_APPEND",
            Self::BuildSlice => "BUILD_SLICE",
            Self::CallFunctionVar => "CALL_FUNCTION_VAR",
            Self::CallFunctionKw => "CALL_FUNCTION_KW",
            Self::CallFunctionVarKw => "CALL_FUNCTION_VAR_KW",
            Self::LoadFastLoadFast => "LOAD_FAST__LOAD_FAST",
            Self::LoadFastLoadConst => "LOAD_FAST__LOAD_CONST",
            Self::LoadGlobalCallFunction => "LOAD_GLOBAL__CALL_FUNCTION",
            Self::CompareOpPopJumpIfFalse => "COMPARE_OP__POP_JUMP_IF_FALSE",
            Self::StoreFastLoadFast => "STORE_FAST__LOAD_FAST",
            Self::BinaryAddStoreFast => "BINARY_ADD__STORE_FAST",
            Self::LoadFastLoadFastBinaryAdd => "LOAD_FAST__LOAD_FAST__BINARY_ADD",
            Self::LoadFastLoadConstCompareOpPopJumpIfFalse => {
                "LOAD_FAST__LOAD_CONST__COMPARE_OP__POP_JUMP_IF_FALSE"
            }
            Self::InplaceAddStoreFast => "INPLACE_ADD__STORE_FAST",
            Self::LoadFastInplaceAddStoreFast => "LOAD_FAST__INPLACE_ADD__STORE_FAST",
            Self::LoadConstReturnValue => "LOAD_CONST__RETURN_VALUE",
            Self::PopTopJumpAbsolute => "POP_TOP__JUMP_ABSOLUTE",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mnemonic())
    }
}

/// Every opcode, primitives first
pub const ALL_OPCODES: [Opcode; 109] = {
    use Opcode::*;
    [
        Nop, PopTop, RotTwo, RotThree, RotFour, DupTop, DupTopTwo, DupTopThree,
        UnaryPositive, UnaryNegative, UnaryNot, UnaryInvert,
        BinaryPower, BinaryMultiply, BinaryTrueDivide, BinaryFloorDivide, BinaryModulo,
        BinaryAdd, BinarySubtract, BinaryLshift, BinaryRshift, BinaryAnd, BinaryXor,
        BinaryOr, BinarySubscr,
        InplacePower, InplaceMultiply, InplaceTrueDivide, InplaceFloorDivide, InplaceModulo,
        InplaceAdd, InplaceSubtract, InplaceLshift, InplaceRshift, InplaceAnd, InplaceXor,
        InplaceOr,
        StoreSubscr, DeleteSubscr, GetIter, StoreMap, Slice0, Slice1, Slice2, Slice3,
        BreakLoop, ReturnValue, YieldValue, PopBlock, EndFinally, WithCleanup,
        StoreSlice0, StoreSlice1, StoreSlice2, StoreSlice3,
        DeleteSlice0, DeleteSlice1, DeleteSlice2, DeleteSlice3,
        UnpackSequence, ForIter, StoreAttr, DeleteAttr, StoreGlobal, DeleteGlobal,
        LoadConst, BuildTuple, BuildList, BuildMap, LoadAttr, CompareOp, JumpForward,
        PopJumpIfFalse, PopJumpIfTrue, JumpIfFalseOrPop, JumpIfTrueOrPop, JumpAbsolute,
        LoadGlobal, ContinueLoop, SetupLoop, SetupExcept, SetupFinally, LoadFast,
        StoreFast, DeleteFast, RaiseVarargs, CallFunction, MakeFunction, MakeClosure,
        LoadClosure, LoadDeref, StoreDeref, ListAppend, BuildSlice, CallFunctionVar,
        CallFunctionKw, CallFunctionVarKw,
        LoadFastLoadFast, LoadFastLoadConst, LoadGlobalCallFunction,
        CompareOpPopJumpIfFalse, StoreFastLoadFast, BinaryAddStoreFast,
        LoadFastLoadFastBinaryAdd, LoadFastLoadConstCompareOpPopJumpIfFalse,
        InplaceAddStoreFast, LoadFastInplaceAddStoreFast, LoadConstReturnValue,
        PopTopJumpAbsolute,
    ]
};

/// Lookup table for byte -> Opcode conversion
static OPCODE_TABLE: [Option<Opcode>; 256] = {
    let mut table = [None; 256];
    let mut i = 0;
    while i < ALL_OPCODES.len() {
        table[ALL_OPCODES[i] as usize] = Some(ALL_OPCODES[i]);
        i += 1;
    }
    table
};

/// Backing storage for the one-element expansion of each primitive
static SELF_TABLE: [Opcode; 256] = {
    let mut table = [Opcode::Nop; 256];
    let mut i = 0;
    while i < ALL_OPCODES.len() {
        table[ALL_OPCODES[i] as usize] = ALL_OPCODES[i];
        i += 1;
    }
    table
};
