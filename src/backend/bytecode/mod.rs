//! Bytecode Execution
//!
//! Stack bytecode, its interpreter and the tiering machinery that promotes
//! hot code units to native code.
//!
//! # Modules
//!
//! - [`opcodes`]: Opcode table and metadata
//! - [`instruction`]: Instruction words, superinstruction decode/encode, disassembly
//! - [`code`]: Immutable code units
//! - [`builder`]: Assembler for code units
//! - [`frame`]: Execution frames
//! - [`unwind`]: Block-stack unwinding shared by all tiers
//! - [`vm`]: The interpreter loop
//! - [`generator`]: Generator objects
//! - [`jit`]: Hotness tracking, IR, native backends and bail-out

pub mod builder;
pub mod code;
pub mod frame;
pub mod generator;
pub mod instruction;
pub mod jit;
pub mod opcodes;
pub mod unwind;
pub mod vm;

pub use builder::{CodeBuilder, Label};
pub use code::{CodeFlags, CodeParts, CodeUnit};
pub use frame::{Block, BlockKind, Frame, MAX_BLOCKS};
pub use generator::Generator;
pub use instruction::{decode_superinstruction, disassemble, encode, CodeError, CodeResult, Primitive, Word};
pub use opcodes::{ArgKind, CmpOp, Opcode};
pub use vm::{call_value, eval_frame, FrameEntry, FrameExit, TraceEvent, TraceHook, VmError, VmResult};
