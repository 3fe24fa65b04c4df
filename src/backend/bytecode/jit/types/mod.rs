//! JIT Type Definitions
//!
//! This module defines the core types shared by the tiering machinery:
//! - [`JitResult`] and [`JitError`]: Result types for lowering and compilation
//! - [`Tier`]: Per-unit execution strategy
//! - [`OptLevel`]: Requested optimization level
//! - [`BailReason`]: Why native code handed a frame back to the interpreter
//! - [`JitControl`] and [`BackendKind`]: Engine-wide policy knobs

mod error;
mod tier;

#[cfg(test)]
mod tests;

pub use error::{JitError, JitResult};
pub use tier::{BackendKind, BailReason, JitControl, OptLevel, Tier};
