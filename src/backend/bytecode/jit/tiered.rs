//! Tiered Compilation
//!
//! The [`TieredCompiler`] decides when a unit is promoted and drives the
//! pipeline that promotes it:
//!
//! ```text
//! claim (JitProfile::try_begin_compile)
//!   -> lower (CodeUnit -> IrFunction)
//!   -> backend compile (IrFunction -> NativeFunction)
//!   -> install (JitProfile::finish_compile)
//! ```
//!
//! Any failure after the claim marks the unit permanently interpreted, so a
//! unit is compiled at most once unless a caller explicitly asks again.
//!
//! The compiler also keeps the engine-wide registry of units with installed
//! native code and the engine's execution statistics.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::backend::{self, NativeBackend, NativeFunction};
use super::events::EventKind;
use super::ir::{lower, LowerOptions};
use super::types::{BackendKind, BailReason, JitControl, JitError, JitResult, OptLevel, Tier};
use crate::backend::bytecode::code::CodeUnit;
use crate::backend::object::Namespace;
use crate::engine::Engine;

/// Statistics about tiered execution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TieredStats {
    /// Activations run by the interpreter from their start
    pub interpreted_runs: u64,

    /// Activations entered in native code
    pub native_runs: u64,

    /// Bails, indexed by `BailReason as usize`
    pub bails: [u64; BailReason::ALL.len()],

    /// Bails that disabled native execution for their unit
    pub disabling_bails: u64,

    /// Number of successful compilations
    pub compilations: u64,

    /// Number of failed compilations (lowering and backend)
    pub compile_failures: u64,

    /// Failures caused by constructs the lowering pass does not handle
    pub lowering_failures: u64,
}

impl TieredStats {
    /// Bails recorded for `reason`
    pub fn bails_for(&self, reason: BailReason) -> u64 {
        self.bails[reason as usize]
    }

    /// All bails
    pub fn total_bails(&self) -> u64 {
        self.bails.iter().sum()
    }

    /// Fatal guard failures
    pub fn fatal_bails(&self) -> u64 {
        self.bails_for(BailReason::FatalGuardFail)
    }

    /// Percentage of activations entered natively
    pub fn native_percentage(&self) -> f64 {
        let total = self.interpreted_runs + self.native_runs;
        if total == 0 {
            0.0
        } else {
            (self.native_runs as f64 / total as f64) * 100.0
        }
    }
}

/// A unit with installed native code
#[derive(Debug, Clone)]
pub struct CompiledUnit {
    pub name: Arc<str>,
    pub level: OptLevel,
    pub backend: BackendKind,
}

/// Promotion policy and compile pipeline
pub struct TieredCompiler {
    backend: Box<dyn NativeBackend>,

    /// Units with installed native code, by code identity
    compiled: DashMap<u64, CompiledUnit>,

    stats: Mutex<TieredStats>,
}

impl std::fmt::Debug for TieredCompiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredCompiler")
            .field("backend", &self.backend.kind())
            .field("compiled", &self.compiled.len())
            .finish()
    }
}

impl TieredCompiler {
    pub fn new(kind: BackendKind) -> Self {
        TieredCompiler {
            backend: backend::for_kind(kind),
            compiled: DashMap::new(),
            stats: Mutex::new(TieredStats::default()),
        }
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Promote `code` if the policy says it is time
    ///
    /// Called on every activation that starts at the top of a unit. Units
    /// with manually set tier state are left alone.
    pub fn maybe_compile(&self, engine: &Engine, code: &CodeUnit, globals: &Arc<Namespace>) {
        let profile = code.profile();
        let state = profile.snapshot();
        if state.tier != Tier::Interpreted || state.manual {
            return;
        }
        match engine.jit_control() {
            JitControl::Never => return,
            JitControl::WhenHot if profile.hotness() < engine.config().hotness_threshold => return,
            JitControl::WhenHot | JitControl::Always => {}
        }

        let level = match OptLevel::from_i32(engine.config().default_opt_level) {
            Ok(OptLevel::Unoptimized) | Err(_) => OptLevel::O2,
            Ok(level) => level,
        };
        if let Err(e) = self.compile(engine, code, level, false, Some(globals)) {
            debug!(
                target: "tiervm::jit::tiered",
                unit = code.name(),
                error = %e,
                "automatic promotion failed"
            );
        }
    }

    /// Compile `code` at `level` and install the result
    ///
    /// `manual` compiles are explicit requests: they may replace installed
    /// code and they pin the unit's tier state. `globals` is the namespace
    /// the code will run against; without it global loads are not cached.
    pub fn compile(
        &self,
        engine: &Engine,
        code: &CodeUnit,
        level: OptLevel,
        manual: bool,
        globals: Option<&Arc<Namespace>>,
    ) -> JitResult<Arc<NativeFunction>> {
        if level == OptLevel::Unoptimized {
            return Err(JitError::InvalidOptLevel(level.as_i32()));
        }
        let profile = code.profile();
        if !profile.try_begin_compile(manual) {
            return Err(match profile.tier() {
                Tier::PermanentlyInterpreted => JitError::Disabled,
                _ => JitError::AlreadyNative,
            });
        }

        engine.record_event(EventKind::CompileStart);
        debug!(
            target: "tiervm::jit::tiered",
            unit = code.name(),
            %level,
            hotness = profile.hotness(),
            manual,
            "compile"
        );

        let mut opts = LowerOptions::new(level).with_branch_min_samples(engine.config().branch_min_samples);
        if let Some(globals) = globals {
            opts = opts.with_namespaces(globals.clone(), engine.builtins());
        }

        engine.record_event(EventKind::LowerStart);
        let lowered = lower(code, &opts);
        engine.record_event(EventKind::LowerEnd);

        let result = lowered.and_then(|ir| {
            let native = self.backend.compile(&ir, level)?;
            Ok((Arc::new(ir), Arc::new(native)))
        });

        let outcome = match result {
            Ok((ir, native)) => {
                profile.finish_compile(level, ir, native.clone());
                self.compiled.insert(
                    code.id(),
                    CompiledUnit {
                        name: native.name.clone(),
                        level,
                        backend: native.backend,
                    },
                );
                self.stats.lock().compilations += 1;
                info!(
                    target: "tiervm::jit::tiered",
                    unit = code.name(),
                    %level,
                    backend = ?native.backend,
                    "promoted to native"
                );
                Ok(native)
            }
            Err(e) => {
                profile.fail_compile();
                self.compiled.remove(&code.id());
                {
                    let mut stats = self.stats.lock();
                    stats.compile_failures += 1;
                    if e.is_lowering_failure() {
                        stats.lowering_failures += 1;
                    }
                }
                if e.is_lowering_failure() {
                    debug!(
                        target: "tiervm::jit::tiered",
                        unit = code.name(),
                        error = %e,
                        "lowering failed; unit stays interpreted"
                    );
                } else {
                    warn!(
                        target: "tiervm::jit::tiered",
                        unit = code.name(),
                        error = %e,
                        "backend failed; unit stays interpreted"
                    );
                }
                Err(e)
            }
        };

        engine.record_event(EventKind::CompileEnd);
        outcome
    }

    // === Registry ===

    /// Drop `id` from the registry of native units
    pub fn forget(&self, id: u64) {
        self.compiled.remove(&id);
    }

    pub fn compiled_unit(&self, id: u64) -> Option<CompiledUnit> {
        self.compiled.get(&id).map(|entry| entry.value().clone())
    }

    /// Number of units with installed native code
    pub fn compiled_count(&self) -> usize {
        self.compiled.len()
    }

    // === Statistics ===

    pub fn record_interpreted_run(&self) {
        self.stats.lock().interpreted_runs += 1;
    }

    pub fn record_native_run(&self) {
        self.stats.lock().native_runs += 1;
    }

    pub fn record_bail(&self, reason: BailReason) {
        self.stats.lock().bails[reason as usize] += 1;
    }

    pub fn record_disabling_bail(&self) {
        self.stats.lock().disabling_bails += 1;
    }

    pub fn stats(&self) -> TieredStats {
        self.stats.lock().clone()
    }

    pub fn reset_stats(&self) {
        *self.stats.lock() = TieredStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_helpers() {
        let mut stats = TieredStats::default();
        assert_eq!(stats.native_percentage(), 0.0);
        stats.interpreted_runs = 1;
        stats.native_runs = 3;
        stats.bails[BailReason::GuardFail as usize] = 2;
        stats.bails[BailReason::FatalGuardFail as usize] = 1;
        assert_eq!(stats.native_percentage(), 75.0);
        assert_eq!(stats.total_bails(), 3);
        assert_eq!(stats.fatal_bails(), 1);
        assert_eq!(stats.bails_for(BailReason::Requested), 0);
    }

    #[test]
    fn test_registry() {
        let tiered = TieredCompiler::new(BackendKind::Threaded);
        assert_eq!(tiered.backend_kind(), BackendKind::Threaded);
        assert_eq!(tiered.compiled_count(), 0);
        assert!(tiered.compiled_unit(7).is_none());
        tiered.forget(7);
        tiered.record_bail(BailReason::Requested);
        assert_eq!(tiered.stats().bails_for(BailReason::Requested), 1);
        tiered.reset_stats();
        assert_eq!(tiered.stats(), TieredStats::default());
    }
}
