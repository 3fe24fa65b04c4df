//! Hotness Tracking and Tier State
//!
//! Every code unit owns a [`JitProfile`]. It counts activations and loop
//! iterations and holds the unit's tier state. The tiering strategy is:
//!
//! 1. Interpreted: each call adds 1 to the hotness counter and each backward
//!    jump adds the backedge weight (10 by default)
//! 2. Hot: once hotness reaches the threshold (10,000 by default) the next
//!    activation claims the unit for compilation
//! 3. Compiling: exactly one activation wins the claim and compiles
//! 4. Native: native code is installed and used by later activations
//! 5. PermanentlyInterpreted: a fatal bail or a lowering failure disabled
//!    native execution for good
//!
//! Counters are atomics so concurrent activations never block each other.
//! The tier, requested level and native handles live together in one
//! immutable [`TierState`] swapped behind a lock, so no reader can see a tier
//! that disagrees with the installed code.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::backend::NativeFunction;
use super::ir::IrFunction;
use super::types::{OptLevel, Tier};

/// Default hotness needed before a unit is compiled
pub const HOT_THRESHOLD: u64 = 10_000;

/// Default hotness added by one backward jump
pub const BACKEDGE_WEIGHT: u64 = 10;

/// Snapshot of a unit's tier
#[derive(Debug, Clone)]
pub struct TierState {
    pub tier: Tier,
    /// Level of the installed code, or the level manually requested
    pub opt_level: Option<OptLevel>,
    /// Whether installed native code is used for new activations
    pub use_native: bool,
    /// Set by an explicit level or use-native request; disables automatic
    /// promotion
    pub manual: bool,
    pub native: Option<Arc<NativeFunction>>,
    pub ir: Option<Arc<IrFunction>>,
}

impl TierState {
    const fn initial() -> Self {
        TierState {
            tier: Tier::Interpreted,
            opt_level: None,
            use_native: false,
            manual: false,
            native: None,
            ir: None,
        }
    }

    /// Native code that new activations should run, if any
    pub fn runnable(&self) -> Option<&Arc<NativeFunction>> {
        match (self.tier, self.use_native) {
            (Tier::Native, true) => self.native.as_ref(),
            _ => None,
        }
    }
}

/// Profiling data and tier state for one code unit
///
/// # Thread Safety
///
/// - Counters may be bumped by many activations at once
/// - Only one caller of [`JitProfile::try_begin_compile`] wins the claim
/// - Tier changes replace the whole [`TierState`] at once
#[derive(Debug)]
pub struct JitProfile {
    hotness: AtomicU64,
    calls: AtomicU64,
    backedges: AtomicU64,
    bails: AtomicU64,
    fatal_bails: AtomicU32,
    compile_count: AtomicU32,
    state: RwLock<Arc<TierState>>,
}

impl Default for JitProfile {
    fn default() -> Self {
        Self::new()
    }
}

impl JitProfile {
    /// Create a fresh interpreted profile
    pub fn new() -> Self {
        JitProfile {
            hotness: AtomicU64::new(0),
            calls: AtomicU64::new(0),
            backedges: AtomicU64::new(0),
            bails: AtomicU64::new(0),
            fatal_bails: AtomicU32::new(0),
            compile_count: AtomicU32::new(0),
            state: RwLock::new(Arc::new(TierState::initial())),
        }
    }

    // === Counters ===

    /// Record one activation; returns the new hotness
    #[inline]
    pub fn record_entry(&self) -> u64 {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.hotness.fetch_add(1, Ordering::Relaxed).saturating_add(1)
    }

    /// Record one backward jump, weighted
    #[inline]
    pub fn record_backedge(&self, weight: u64) {
        self.backedges.fetch_add(1, Ordering::Relaxed);
        self.hotness.fetch_add(weight, Ordering::Relaxed);
    }

    #[inline]
    pub fn hotness(&self) -> u64 {
        self.hotness.load(Ordering::Relaxed)
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn backedges(&self) -> u64 {
        self.backedges.load(Ordering::Relaxed)
    }

    pub fn bails(&self) -> u64 {
        self.bails.load(Ordering::Relaxed)
    }

    pub fn fatal_bails(&self) -> u32 {
        self.fatal_bails.load(Ordering::Relaxed)
    }

    /// Compilations claimed over the lifetime of the unit
    pub fn compile_count(&self) -> u32 {
        self.compile_count.load(Ordering::Relaxed)
    }

    // === Tier state ===

    /// Current tier snapshot
    #[inline]
    pub fn snapshot(&self) -> Arc<TierState> {
        self.state.read().clone()
    }

    #[inline]
    pub fn tier(&self) -> Tier {
        self.state.read().tier
    }

    /// Whether native code is installed and enabled
    pub fn uses_native(&self) -> bool {
        self.state.read().runnable().is_some()
    }

    pub fn opt_level(&self) -> Option<OptLevel> {
        self.state.read().opt_level
    }

    pub fn is_manual(&self) -> bool {
        self.state.read().manual
    }

    /// Whether the installed native code caches global or builtin bindings
    pub fn assumes_globals(&self) -> bool {
        self.state
            .read()
            .ir
            .as_ref()
            .is_some_and(|ir| ir.assumes_globals())
    }

    /// Whether interpreted runs should record feedback
    #[inline]
    pub fn collects_feedback(&self) -> bool {
        self.state.read().tier == Tier::Interpreted
    }

    fn update(&self, f: impl FnOnce(&mut TierState)) {
        let mut guard = self.state.write();
        let mut next = TierState::clone(&guard);
        f(&mut next);
        *guard = Arc::new(next);
    }

    /// Claim the unit for compilation
    ///
    /// Succeeds for exactly one caller while the unit is interpreted. With
    /// `manual` set the claim also replaces installed native code.
    pub fn try_begin_compile(&self, manual: bool) -> bool {
        let mut guard = self.state.write();
        let allowed = match guard.tier {
            Tier::Interpreted => true,
            Tier::Native => manual,
            Tier::Compiling | Tier::PermanentlyInterpreted => false,
        };
        if !allowed {
            return false;
        }
        let mut next = TierState::clone(&guard);
        next.tier = Tier::Compiling;
        if manual {
            next.manual = true;
        }
        *guard = Arc::new(next);
        self.compile_count.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Install freshly compiled code
    pub fn finish_compile(&self, level: OptLevel, ir: Arc<IrFunction>, native: Arc<NativeFunction>) {
        self.update(|s| {
            s.tier = Tier::Native;
            s.opt_level = Some(level);
            s.use_native = true;
            s.ir = Some(ir);
            s.native = Some(native);
        });
    }

    /// A claimed compilation failed; the unit stays interpreted for good
    pub fn fail_compile(&self) {
        self.update(|s| {
            s.tier = Tier::PermanentlyInterpreted;
            s.use_native = false;
            s.native = None;
            s.ir = None;
        });
    }

    /// Count a bail; returns true when it disabled native execution
    pub fn record_bail(&self, fatal: bool, max_fatal_bails: u32) -> bool {
        self.bails.fetch_add(1, Ordering::Relaxed);
        if !fatal {
            return false;
        }
        let fatal_count = self.fatal_bails.fetch_add(1, Ordering::Relaxed) + 1;
        if fatal_count < max_fatal_bails.max(1) {
            return false;
        }
        let mut disabled = false;
        self.update(|s| {
            disabled = s.tier != Tier::PermanentlyInterpreted;
            s.tier = Tier::PermanentlyInterpreted;
            s.use_native = false;
            s.native = None;
            s.ir = None;
        });
        disabled
    }

    /// Pin the unit at `level` without compiling; `Unoptimized` drops native
    /// code and keeps the unit interpreted
    pub fn set_manual_level(&self, level: OptLevel) {
        self.update(|s| {
            s.manual = true;
            s.opt_level = Some(level);
            if level == OptLevel::Unoptimized && s.tier == Tier::Native {
                s.tier = Tier::Interpreted;
                s.use_native = false;
                s.native = None;
                s.ir = None;
            }
        });
    }

    /// Toggle use of installed native code
    pub fn set_use_native(&self, on: bool) {
        self.update(|s| {
            s.manual = true;
            s.use_native = on;
        });
    }

    /// Back to a fresh interpreted unit: counters, tier and fatal-bail state
    pub fn reset(&self) {
        self.hotness.store(0, Ordering::Relaxed);
        self.calls.store(0, Ordering::Relaxed);
        self.backedges.store(0, Ordering::Relaxed);
        self.bails.store(0, Ordering::Relaxed);
        self.fatal_bails.store(0, Ordering::Relaxed);
        *self.state.write() = Arc::new(TierState::initial());
    }
}
