//! JIT error types.
//!
//! This module defines [`JitError`] and [`JitResult`] for lowering and
//! native compilation error handling.

use std::fmt;

use crate::backend::bytecode::opcodes::Opcode;

// =============================================================================
// JitResult and JitError
// =============================================================================

/// Error types for lowering and native compilation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JitError {
    /// The lowering pass met a construct it does not translate
    Unsupported { ip: usize, opcode: Opcode },

    /// Stack depths disagree where control flow merges
    StackMismatch { ip: usize, expected: usize, got: usize },

    /// Block stacks disagree where control flow merges
    BlockMismatch { ip: usize },

    /// Control flow runs past the end of the code or into an argument word
    BadControlFlow { ip: usize },

    /// The backend cannot translate this IR
    NotCompilable(String),

    /// Code generation failed inside the backend
    Backend(String),

    /// A native function was requested for a unit that already has one
    AlreadyNative,

    /// Native execution is permanently disabled for this unit
    Disabled,

    /// Optimization level outside `-1..=2`
    InvalidOptLevel(i32),
}

impl fmt::Display for JitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JitError::Unsupported { ip, opcode } => {
                write!(f, "Unsupported opcode {} at ip {}", opcode, ip)
            }
            JitError::StackMismatch { ip, expected, got } => write!(
                f,
                "Stack depth mismatch at ip {}: expected {}, got {}",
                ip, expected, got
            ),
            JitError::BlockMismatch { ip } => write!(f, "Block stack mismatch at ip {}", ip),
            JitError::BadControlFlow { ip } => write!(f, "Bad control flow at ip {}", ip),
            JitError::NotCompilable(msg) => write!(f, "Not compilable: {}", msg),
            JitError::Backend(msg) => write!(f, "Backend error: {}", msg),
            JitError::AlreadyNative => write!(f, "Code unit already has native code"),
            JitError::Disabled => write!(f, "Native execution disabled for this code unit"),
            JitError::InvalidOptLevel(level) => {
                write!(f, "Invalid optimization level {} (expected -1..=2)", level)
            }
        }
    }
}

impl std::error::Error for JitError {}

impl JitError {
    /// Lowering failures leave the unit interpreted without surfacing an error
    pub fn is_lowering_failure(&self) -> bool {
        matches!(
            self,
            JitError::Unsupported { .. }
                | JitError::StackMismatch { .. }
                | JitError::BlockMismatch { .. }
                | JitError::BadControlFlow { .. }
                | JitError::NotCompilable(_)
        )
    }
}

/// Result type for JIT operations
pub type JitResult<T> = Result<T, JitError>;
