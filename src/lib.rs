/// tiervm - Tiered Bytecode Execution Engine
///
/// A stack-based bytecode virtual machine that interprets code units by
/// default and promotes hot ones to native code, handing frames back to the
/// interpreter whenever an assumption the native code relied on stops
/// holding.
///
/// # Architecture
///
/// 1. **Object model and operators** (`backend::object`, `backend::ops`)
///    - Reference-counted values, namespaces with modification versions
///    - Tagged dispatch for unary, binary and comparison operators
///
/// 2. **Bytecode engine** (`backend::bytecode`)
///    - Opcode table, instruction words and superinstructions
///    - Code units, frames, the interpreter loop and generators
///
/// 3. **Tiering** (`backend::bytecode::jit`)
///    - Hotness tracking: calls count 1, backward jumps count 10
///    - Lowering from bytecode to a CFG IR with guards and safe points
///    - Native backends behind `compile(ir, level)`
///    - Bail-out to the interpreter at instruction boundaries
///
/// # Example
///
/// ```rust
/// use tiervm::backend::bytecode::{CodeBuilder, Opcode};
/// use tiervm::{Engine, Value};
///
/// let mut b = CodeBuilder::new("double");
/// b.args(&["x"]);
/// b.load_fast("x");
/// b.load_const(Value::Int(2));
/// b.emit(Opcode::BinaryMultiply);
/// b.return_value();
/// let code = b.build().unwrap();
///
/// let engine = Engine::new();
/// let double = engine.define("double", code);
/// let result = engine.call(&double, vec![Value::Int(21)]).unwrap();
/// assert_eq!(result.as_int(), Some(42));
/// ```
///
/// # Tiers
///
/// - **Interpreted**: every unit starts here and records feedback
/// - **Native**: installed once hotness reaches the threshold (10,000)
/// - **Permanently interpreted**: after a fatal bail or a lowering failure

pub mod backend;
pub mod config;
pub mod engine;

pub use backend::bytecode::jit::events::{EventAnalyzer, EventKind};
pub use backend::bytecode::jit::tiered::TieredStats;
pub use backend::bytecode::jit::types::{
    BackendKind, BailReason, JitControl, JitError, JitResult, OptLevel, Tier,
};
pub use backend::bytecode::vm::{TraceEvent, TraceHook, VmError, VmResult};
pub use backend::bytecode::{CodeBuilder, CodeUnit};
pub use backend::object::{ExceptionKind, ExceptionObj, Namespace, Value};
pub use config::{ConfigError, EngineConfig};
pub use engine::Engine;

/// Install a `fmt` subscriber logging at `level` and above
///
/// Later calls, or calls after another subscriber was installed, do nothing.
pub fn init_tracing(level: tracing::Level) {
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true)
        .try_init();
}
