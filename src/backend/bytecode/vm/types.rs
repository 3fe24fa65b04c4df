//! Interpreter error and frame-exit types.

use std::fmt;
use std::sync::Arc;

use crate::backend::bytecode::instruction::CodeError;
use crate::backend::bytecode::opcodes::Opcode;
use crate::backend::bytecode::unwind::Unwind;
use crate::backend::object::{ExceptionKind, ExceptionObj, Value};

// =============================================================================
// VmResult and VmError
// =============================================================================

/// Errors raised while executing bytecode
///
/// `Raised` carries a guest exception and is the only variant guest handlers
/// can catch. Every other variant is a host-level invariant violation and
/// aborts the whole call.
#[derive(Debug, Clone)]
pub enum VmError {
    /// Guest exception in flight
    Raised(Arc<ExceptionObj>),

    /// Pop from an empty value stack
    StackUnderflow { ip: usize },

    /// Opcode the interpreter cannot execute in this position
    InvalidOpcode { ip: usize, opcode: Opcode },

    /// Primitive that requires an argument was decoded without one
    MissingArgument { ip: usize, opcode: Opcode },

    /// Constant pool index out of range
    InvalidConstant(u32),

    /// Names table index out of range
    InvalidName(u32),

    /// Local slot index out of range
    InvalidLocal(u32),

    /// Cell index out of range
    InvalidCell(u32),

    /// More than the allowed number of nested blocks
    BlockStackOverflow { ip: usize },

    /// Block stack popped while empty
    BlockStackUnderflow { ip: usize },

    /// Instruction pointer outside the code or inside an instruction
    IpOutOfBounds(usize),

    /// Other host-level failures
    Runtime(String),

    /// Malformed instruction stream
    Code(CodeError),
}

impl VmError {
    /// Build a guest exception of `kind` with a message
    pub fn raise(kind: ExceptionKind, message: impl Into<String>) -> Self {
        VmError::Raised(ExceptionObj::with_message(kind, message))
    }

    /// The guest exception, if this is one
    pub fn exception(&self) -> Option<&Arc<ExceptionObj>> {
        match self {
            VmError::Raised(e) => Some(e),
            _ => None,
        }
    }

    /// Whether this error is a guest exception of `kind` (or a subclass)
    pub fn is_exception(&self, kind: ExceptionKind) -> bool {
        self.exception().is_some_and(|e| e.matches(kind))
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::Raised(e) => write!(f, "{}", e),
            VmError::StackUnderflow { ip } => write!(f, "Stack underflow at ip {}", ip),
            VmError::InvalidOpcode { ip, opcode } => {
                write!(f, "Invalid opcode {} at ip {}", opcode, ip)
            }
            VmError::MissingArgument { ip, opcode } => {
                write!(f, "Missing argument for {} at ip {}", opcode, ip)
            }
            VmError::InvalidConstant(idx) => write!(f, "Invalid constant index: {}", idx),
            VmError::InvalidName(idx) => write!(f, "Invalid name index: {}", idx),
            VmError::InvalidLocal(idx) => write!(f, "Invalid local index: {}", idx),
            VmError::InvalidCell(idx) => write!(f, "Invalid cell index: {}", idx),
            VmError::BlockStackOverflow { ip } => {
                write!(f, "Block stack overflow at ip {}", ip)
            }
            VmError::BlockStackUnderflow { ip } => {
                write!(f, "Block stack underflow at ip {}", ip)
            }
            VmError::IpOutOfBounds(ip) => write!(f, "Instruction pointer {} out of bounds", ip),
            VmError::Runtime(msg) => write!(f, "Runtime error: {}", msg),
            VmError::Code(e) => write!(f, "Code error: {}", e),
        }
    }
}

impl std::error::Error for VmError {}

impl From<CodeError> for VmError {
    fn from(e: CodeError) -> Self {
        VmError::Code(e)
    }
}

/// Result type for VM operations
pub type VmResult<T> = Result<T, VmError>;

// =============================================================================
// Frame entry and exit
// =============================================================================

/// How a frame left its executor
#[derive(Debug, Clone)]
pub enum FrameExit {
    /// The frame finished with a return value
    Return(Value),
    /// A generator frame suspended, yielding a value
    Yield(Value),
}

/// How an executor starts working on a frame
#[derive(Debug, Clone)]
pub enum FrameEntry {
    /// Fresh activation starting at instruction 0
    Call,
    /// Resume a suspended generator, pushing the sent value
    Resume(Value),
    /// Raise an exception at the current position
    Throw(Arc<ExceptionObj>),
    /// Carry on at `frame.ip` with the frame as it is (after a bail)
    Continue,
}

/// Outcome of executing one primitive or instruction
#[derive(Debug)]
pub enum Flow {
    /// Fall through to the next instruction
    Next,
    /// Transfer to an instruction index
    Jump(usize),
    /// Suspend the generator
    Yield(Value),
    /// Raise an exception; `fresh` is false for re-raises, which do not add
    /// a traceback entry
    Raise { exc: Arc<ExceptionObj>, fresh: bool },
    /// Start unwinding the block stack for a non-exception reason
    Unwind(Unwind),
}

impl Flow {
    /// Convert a primitive's error into control flow
    ///
    /// Guest exceptions become `Raise`; host errors stay errors.
    pub fn from_error(err: VmError) -> VmResult<Flow> {
        match err {
            VmError::Raised(exc) => Ok(Flow::Raise { exc, fresh: true }),
            other => Err(other),
        }
    }
}
