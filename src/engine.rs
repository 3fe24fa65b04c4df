//! Engine
//!
//! The [`Engine`] ties the pieces together for an embedder: it owns the
//! configuration, the builtins and module namespaces, the tiered compiler,
//! the event timer and the safe-point poll flag that native code checks.
//!
//! # Usage
//!
//! ```ignore
//! let engine = Engine::new();
//! let f = engine.define("f", code);
//! let result = engine.call(&f, vec![Value::Int(10)])?;
//! assert_eq!(engine.tier(&code), Tier::Interpreted);
//! ```
//!
//! # Knobs
//!
//! - [`Engine::set_optimization_level`]: compile a unit now at a level, or
//!   pin it interpreted with `-1`
//! - [`Engine::set_use_native`]: toggle use of a unit's native code
//! - [`Engine::request_bail`]: make the next safe-point poll bail
//! - [`Engine::set_trace`]: install a tracer; native frames bail to deliver
//!   its events
//! - [`Engine::set_jit_control`] and [`Engine::set_bail_error`]: engine-wide
//!   policy

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::backend::builtins::builtins_namespace;
use crate::backend::bytecode::code::CodeUnit;
use crate::backend::bytecode::frame::Frame;
use crate::backend::bytecode::jit::events::{EventKind, EventTimer};
use crate::backend::bytecode::jit::hybrid;
use crate::backend::bytecode::jit::ir::SafePointKind;
use crate::backend::bytecode::jit::tiered::{TieredCompiler, TieredStats};
use crate::backend::bytecode::jit::types::{BailReason, JitControl, JitResult, OptLevel, Tier};
use crate::backend::bytecode::vm::{
    call_value, DepthGuard, FrameEntry, FrameExit, KwArgs, TraceHook, VmError, VmResult,
};
use crate::backend::object::{Function, Namespace, Value};
use crate::config::EngineConfig;

/// Poll bit: a tracer is installed
const POLL_TRACING: u8 = 0b01;

/// Poll bit: a bail was requested for the next safe point
const POLL_REQUESTED: u8 = 0b10;

/// Embedding facade over the tiered execution engine
pub struct Engine {
    config: EngineConfig,
    builtins: Arc<Namespace>,
    globals: Arc<Namespace>,
    tracer: RwLock<Option<Arc<dyn TraceHook>>>,
    /// Read by native code at every safe point
    poll: AtomicU8,
    bail_error: AtomicBool,
    jit_control: AtomicU8,
    events: EventTimer,
    tiered: TieredCompiler,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        debug!(
            target: "tiervm::engine",
            threshold = config.hotness_threshold,
            jit_control = ?config.jit_control,
            backend = ?config.backend,
            "engine created"
        );
        Engine {
            builtins: builtins_namespace(),
            globals: Namespace::new(),
            tracer: RwLock::new(None),
            poll: AtomicU8::new(0),
            bail_error: AtomicBool::new(config.bail_error),
            jit_control: AtomicU8::new(config.jit_control as u8),
            events: EventTimer::new(config.event_capacity, config.record_events),
            tiered: TieredCompiler::new(config.backend),
            config,
        }
    }

    #[inline]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The builtins namespace shared by every frame
    #[inline]
    pub fn builtins(&self) -> Arc<Namespace> {
        self.builtins.clone()
    }

    /// The module namespace used by [`Engine::run`] and [`Engine::define`]
    #[inline]
    pub fn globals(&self) -> &Arc<Namespace> {
        &self.globals
    }

    #[inline]
    pub fn tiered(&self) -> &TieredCompiler {
        &self.tiered
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Run a module body against the engine's globals
    pub fn run(&self, code: Arc<CodeUnit>) -> VmResult<Value> {
        let mut frame = Frame::new(code, self.globals.clone(), self.builtins());
        let _depth = DepthGuard::enter(self.config.recursion_limit)?;
        match hybrid::execute(self, &mut frame, FrameEntry::Call)? {
            FrameExit::Return(value) => Ok(value),
            FrameExit::Yield(_) => Err(VmError::Runtime(format!(
                "module {} yielded",
                frame.code.name()
            ))),
        }
    }

    /// Call any callable value
    pub fn call(&self, callee: &Value, args: Vec<Value>) -> VmResult<Value> {
        call_value(self, callee, args, Vec::new())
    }

    pub fn call_kw(&self, callee: &Value, args: Vec<Value>, kwargs: KwArgs) -> VmResult<Value> {
        call_value(self, callee, args, kwargs)
    }

    /// Wrap `code` in a function over the engine's globals
    pub fn function(&self, code: Arc<CodeUnit>) -> Value {
        Value::Function(Function::new(code, self.globals.clone()))
    }

    /// Bind a function for `code` to the global `name` and return it
    pub fn define(&self, name: &str, code: Arc<CodeUnit>) -> Value {
        let func = self.function(code);
        self.globals.set(name, func.clone());
        func
    }

    pub fn set_global(&self, name: &str, value: Value) {
        self.globals.set(name, value);
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        self.globals.get(name)
    }

    // =========================================================================
    // Safe points and tracing
    // =========================================================================

    /// Check the poll flag at a safe point of `kind`
    ///
    /// A pending bail request is consumed by the poll that reports it.
    #[inline]
    pub fn poll_safe_point(&self, kind: SafePointKind) -> Option<BailReason> {
        let bits = self.poll.load(Ordering::Acquire);
        if bits == 0 {
            return None;
        }
        if bits & POLL_TRACING != 0 {
            return Some(kind.trace_reason());
        }
        let prev = self.poll.fetch_and(!POLL_REQUESTED, Ordering::AcqRel);
        (prev & POLL_REQUESTED != 0).then_some(BailReason::Requested)
    }

    /// Address of the poll flag, read directly by machine code
    pub fn poll_flag_ptr(&self) -> *const u8 {
        self.poll.as_ptr() as *const u8
    }

    /// Make the next safe-point poll in any native frame bail
    pub fn request_bail(&self) {
        self.poll.fetch_or(POLL_REQUESTED, Ordering::AcqRel);
    }

    /// Whether a bail request is still waiting for a safe point
    pub fn bail_requested(&self) -> bool {
        self.poll.load(Ordering::Acquire) & POLL_REQUESTED != 0
    }

    /// Install or remove the tracer
    pub fn set_trace(&self, hook: Option<Arc<dyn TraceHook>>) {
        let installed = hook.is_some();
        *self.tracer.write() = hook;
        if installed {
            self.poll.fetch_or(POLL_TRACING, Ordering::AcqRel);
        } else {
            self.poll.fetch_and(!POLL_TRACING, Ordering::AcqRel);
        }
        debug!(target: "tiervm::engine", installed, "tracer changed");
    }

    #[inline]
    pub fn trace_hook(&self) -> Option<Arc<dyn TraceHook>> {
        self.tracer.read().clone()
    }

    // =========================================================================
    // Engine-wide policy
    // =========================================================================

    #[inline]
    pub fn bail_error(&self) -> bool {
        self.bail_error.load(Ordering::Relaxed)
    }

    /// Raise `RuntimeError` at guard bails instead of resuming silently
    pub fn set_bail_error(&self, on: bool) {
        self.bail_error.store(on, Ordering::Relaxed);
    }

    #[inline]
    pub fn jit_control(&self) -> JitControl {
        JitControl::from_u8(self.jit_control.load(Ordering::Relaxed))
    }

    pub fn set_jit_control(&self, control: JitControl) {
        self.jit_control.store(control as u8, Ordering::Relaxed);
        info!(target: "tiervm::engine", ?control, "jit control changed");
    }

    // =========================================================================
    // Per-unit knobs
    // =========================================================================

    /// Force `code` to optimization level `level`
    ///
    /// `-1` drops any native code and keeps the unit interpreted. Levels
    /// `0..=2` compile immediately against the engine's globals and replace
    /// installed code. Either way automatic promotion no longer touches the
    /// unit.
    pub fn set_optimization_level(&self, code: &CodeUnit, level: i32) -> JitResult<()> {
        let level = OptLevel::from_i32(level)?;
        if level == OptLevel::Unoptimized {
            code.profile().set_manual_level(level);
            self.tiered.forget(code.id());
            return Ok(());
        }
        self.tiered
            .compile(self, code, level, true, Some(&self.globals))
            .map(|_| ())
    }

    /// Toggle use of native code for new activations of `code`
    ///
    /// Turning it on compiles the unit at the default level first when it has
    /// no native code yet.
    pub fn set_use_native(&self, code: &CodeUnit, on: bool) -> JitResult<()> {
        if on && code.profile().tier() != Tier::Native {
            let level = match code.profile().opt_level() {
                Some(level) if level != OptLevel::Unoptimized => level,
                _ => match OptLevel::from_i32(self.config.default_opt_level) {
                    Ok(OptLevel::Unoptimized) | Err(_) => OptLevel::O2,
                    Ok(level) => level,
                },
            };
            self.tiered.compile(self, code, level, true, Some(&self.globals))?;
        }
        code.profile().set_use_native(on);
        Ok(())
    }

    /// Return `code` to a fresh interpreted state
    ///
    /// Clears hotness, bail counters and feedback, drops native code and
    /// lifts a permanent-interpretation verdict.
    pub fn reset_tier(&self, code: &CodeUnit) {
        code.profile().reset();
        code.feedback().clear();
        self.tiered.forget(code.id());
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn tier(&self, code: &CodeUnit) -> Tier {
        code.profile().tier()
    }

    /// Level of the installed or requested code; `-1` when none
    pub fn opt_level(&self, code: &CodeUnit) -> i32 {
        code.profile()
            .opt_level()
            .map_or(OptLevel::Unoptimized.as_i32(), OptLevel::as_i32)
    }

    /// Whether new activations of `code` run natively
    pub fn uses_native(&self, code: &CodeUnit) -> bool {
        code.profile().uses_native()
    }

    pub fn hotness(&self, code: &CodeUnit) -> u64 {
        code.profile().hotness()
    }

    pub fn bails(&self, code: &CodeUnit) -> u64 {
        code.profile().bails()
    }

    pub fn fatal_bails(&self, code: &CodeUnit) -> u32 {
        code.profile().fatal_bails()
    }

    /// Textual IR of the installed native code
    pub fn dump_ir(&self, code: &CodeUnit) -> Option<String> {
        code.profile().snapshot().ir.as_ref().map(|ir| ir.to_string())
    }

    /// Backend description of the installed native code
    pub fn dump_native(&self, code: &CodeUnit) -> Option<String> {
        code.profile()
            .snapshot()
            .native
            .as_ref()
            .map(|native| native.dump().to_string())
    }

    pub fn stats(&self) -> TieredStats {
        self.tiered.stats()
    }

    // =========================================================================
    // Events
    // =========================================================================

    #[inline]
    pub fn record_event(&self, kind: EventKind) {
        self.events.record(kind);
    }

    pub fn events(&self) -> &EventTimer {
        &self.events
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("jit_control", &self.jit_control())
            .field("bail_error", &self.bail_error())
            .field("tiered", &self.tiered)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::bytecode::builder::CodeBuilder;
    use crate::backend::bytecode::vm::TraceEvent;

    fn answer() -> Arc<CodeUnit> {
        let mut b = CodeBuilder::new("answer");
        b.load_const(Value::Int(42));
        b.return_value();
        b.build().unwrap()
    }

    #[test]
    fn test_poll_flag() {
        let engine = Engine::new();
        assert_eq!(engine.poll_safe_point(SafePointKind::Line), None);

        engine.request_bail();
        assert!(engine.bail_requested());
        assert_eq!(
            engine.poll_safe_point(SafePointKind::Backedge),
            Some(BailReason::Requested)
        );
        assert!(!engine.bail_requested());
        assert_eq!(engine.poll_safe_point(SafePointKind::Backedge), None);

        engine.set_trace(Some(Arc::new(|_: &CodeUnit, _: TraceEvent<'_>| {})));
        assert_eq!(
            engine.poll_safe_point(SafePointKind::Line),
            Some(BailReason::LineTrace)
        );
        assert_eq!(
            engine.poll_safe_point(SafePointKind::Backedge),
            Some(BailReason::BackedgeTrace)
        );
        engine.set_trace(None);
        assert_eq!(engine.poll_safe_point(SafePointKind::Line), None);
    }

    #[test]
    fn test_policy_knobs() {
        let engine = Engine::with_config(EngineConfig::default().with_jit_control(JitControl::Never));
        assert_eq!(engine.jit_control(), JitControl::Never);
        engine.set_jit_control(JitControl::Always);
        assert_eq!(engine.jit_control(), JitControl::Always);
        assert!(!engine.bail_error());
        engine.set_bail_error(true);
        assert!(engine.bail_error());
    }

    #[test]
    fn test_run_module() {
        let engine = Engine::new();
        assert_eq!(engine.run(answer()).unwrap().as_int(), Some(42));
        assert_eq!(engine.stats().interpreted_runs, 1);
    }

    #[test]
    fn test_unoptimized_level_pins_interpreter() {
        let engine = Engine::with_config(EngineConfig::default().with_jit_control(JitControl::Always));
        let code = answer();
        engine.set_optimization_level(&code, -1).unwrap();
        let f = engine.function(code.clone());
        assert_eq!(engine.call(&f, vec![]).unwrap().as_int(), Some(42));
        assert_eq!(engine.tier(&code), Tier::Interpreted);
        assert_eq!(engine.opt_level(&code), -1);
        assert!(engine.set_optimization_level(&code, 7).is_err());
    }

    #[test]
    fn test_use_native_compiles_on_demand() {
        let engine = Engine::new();
        let code = answer();
        engine.set_use_native(&code, true).unwrap();
        assert_eq!(engine.tier(&code), Tier::Native);
        assert!(engine.uses_native(&code));
        assert!(engine.dump_ir(&code).is_some());
        assert!(engine.dump_native(&code).is_some());

        engine.set_use_native(&code, false).unwrap();
        assert!(!engine.uses_native(&code));
        assert_eq!(engine.tier(&code), Tier::Native);

        engine.reset_tier(&code);
        assert_eq!(engine.tier(&code), Tier::Interpreted);
        assert!(engine.dump_ir(&code).is_none());
        assert_eq!(engine.hotness(&code), 0);
    }
}
