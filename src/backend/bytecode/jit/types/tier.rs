//! Tier, optimization level and policy enums.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::{JitError, JitResult};

/// Execution strategy currently in force for a code unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Tier {
    /// Runs in the interpreter, collecting feedback
    Interpreted = 0,
    /// A compilation has been claimed and is in progress
    Compiling = 1,
    /// Native code is installed
    Native = 2,
    /// Native execution disabled after a fatal bail or a lowering failure
    PermanentlyInterpreted = 3,
}

impl Tier {
    pub fn name(self) -> &'static str {
        match self {
            Tier::Interpreted => "interpreted",
            Tier::Compiling => "compiling",
            Tier::Native => "native",
            Tier::PermanentlyInterpreted => "permanently-interpreted",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Optimization level requested for a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OptLevel {
    /// Never compiled
    Unoptimized,
    /// Plain lowering
    O0,
    /// Adds jump threading and unreachable block removal
    O1,
    /// Adds feedback-directed specialization
    O2,
}

impl OptLevel {
    pub fn from_i32(level: i32) -> JitResult<Self> {
        Ok(match level {
            -1 => OptLevel::Unoptimized,
            0 => OptLevel::O0,
            1 => OptLevel::O1,
            2 => OptLevel::O2,
            other => return Err(JitError::InvalidOptLevel(other)),
        })
    }

    pub fn as_i32(self) -> i32 {
        match self {
            OptLevel::Unoptimized => -1,
            OptLevel::O0 => 0,
            OptLevel::O1 => 1,
            OptLevel::O2 => 2,
        }
    }
}

impl fmt::Display for OptLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_i32())
    }
}

/// Why native code handed a frame back to the interpreter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BailReason {
    /// A tracer was installed when the unit was entered
    TraceOnEntry = 0,
    /// A tracer was installed while native code ran; polled at a line start
    LineTrace = 1,
    /// A tracer was installed while native code ran; polled at a backward jump
    BackedgeTrace = 2,
    /// An explicit bail request was polled at a safe point
    Requested = 3,
    /// A speculated branch went the other way
    GuardFail = 4,
    /// An assumption baked into the native code no longer holds
    FatalGuardFail = 5,
}

impl BailReason {
    pub const ALL: [BailReason; 6] = [
        BailReason::TraceOnEntry,
        BailReason::LineTrace,
        BailReason::BackedgeTrace,
        BailReason::Requested,
        BailReason::GuardFail,
        BailReason::FatalGuardFail,
    ];

    #[inline]
    pub fn is_fatal(self) -> bool {
        self == BailReason::FatalGuardFail
    }

    /// Whether `bail_error` mode turns this bail into a guest exception
    #[inline]
    pub fn is_guard(self) -> bool {
        matches!(self, BailReason::GuardFail | BailReason::FatalGuardFail)
    }

    pub fn name(self) -> &'static str {
        match self {
            BailReason::TraceOnEntry => "trace-on-entry",
            BailReason::LineTrace => "line-trace",
            BailReason::BackedgeTrace => "backedge-trace",
            BailReason::Requested => "requested",
            BailReason::GuardFail => "guard-fail",
            BailReason::FatalGuardFail => "fatal-guard-fail",
        }
    }
}

impl fmt::Display for BailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Engine-wide automatic promotion policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum JitControl {
    /// Never promote automatically
    Never = 0,
    /// Promote once the hotness threshold is crossed
    #[default]
    WhenHot = 1,
    /// Promote every unit on its first activation
    Always = 2,
}

impl JitControl {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => JitControl::Never,
            2 => JitControl::Always,
            _ => JitControl::WhenHot,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "never" => Some(JitControl::Never),
            "whenhot" => Some(JitControl::WhenHot),
            "always" => Some(JitControl::Always),
            _ => None,
        }
    }
}

/// Which native backend compiles IR
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Closure-threaded code over the shared frame
    Threaded,
    /// Cranelift machine code for integer kernels
    Cranelift,
    /// Cranelift when the unit is a kernel, threaded otherwise
    #[default]
    Auto,
}
