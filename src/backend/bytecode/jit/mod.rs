//! Tiered Native Compilation
//!
//! Hot code units are lowered to an intermediate representation and handed
//! to a native backend; native code hands frames back to the interpreter
//! whenever an assumption it was built on stops holding.
//!
//! ```text
//! Interpreted ──(hotness >= threshold)──> Compiling ──> Native
//!      ^                                     │            │
//!      └──────── reset ──── PermanentlyInterpreted <──────┘
//!                          (lowering failure, fatal bail)
//! ```
//!
//! # Modules
//!
//! - [`types`]: JitError, Tier, OptLevel, BailReason, policy enums
//! - [`profile`]: Hotness tracking and the per-unit tier state
//! - [`feedback`]: Value, callee and branch feedback per instruction site
//! - [`ir`]: IR data structures and the lowering pass
//! - [`backend`]: Native backends (threaded, Cranelift, auto)
//! - [`tiered`]: Promotion policy and the compile pipeline
//! - [`hybrid`]: Per-activation dispatch between the tiers
//! - [`bailout`]: Bail accounting and the fatal-bail policy
//! - [`events`]: Timestamped tier-transition events and their analysis

pub mod backend;
pub mod bailout;
pub mod events;
pub mod feedback;
pub mod hybrid;
pub mod ir;
pub mod profile;
pub mod tiered;
pub mod types;

pub use backend::{NativeBackend, NativeExit, NativeFunction};
pub use events::{DeltaStats, Event, EventAnalyzer, EventKind, EventTimer};
pub use feedback::{FeedbackMap, SiteId};
pub use ir::{IrFunction, LowerOptions};
pub use profile::{JitProfile, TierState, BACKEDGE_WEIGHT, HOT_THRESHOLD};
pub use tiered::{CompiledUnit, TieredCompiler, TieredStats};
pub use types::{BackendKind, BailReason, JitControl, JitError, JitResult, OptLevel, Tier};
