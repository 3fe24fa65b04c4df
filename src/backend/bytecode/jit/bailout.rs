//! Bail-out Protocol
//!
//! Native code returns [`NativeExit::Bail`](super::backend::NativeExit) with
//! the frame already rebuilt at an instruction boundary. This module does
//! the bookkeeping around that hand-off: it counts the bail on the unit and
//! in the engine statistics, applies the fatal-bail policy and emits the
//! `BAIL_START` / `BAIL_END` events. The caller then continues the frame in
//! the interpreter.
//!
//! # Fatal bails
//!
//! A fatal bail means an assumption the native code was built on no longer
//! holds. Once a unit has seen `max_fatal_bails` of them (one by default) it
//! becomes permanently interpreted: its native code is dropped and automatic
//! promotion never picks it again. Only an explicit reset undoes this.

use tracing::{debug, warn};

use super::events::EventKind;
use super::types::BailReason;
use crate::backend::bytecode::code::CodeUnit;
use crate::backend::bytecode::frame::Frame;
use crate::engine::Engine;

/// Account for a bail of `frame` out of native code
///
/// Returns true when this bail disabled native execution for the unit.
pub fn handle(engine: &Engine, code: &CodeUnit, frame: &Frame, reason: BailReason) -> bool {
    engine.record_event(EventKind::BailStart);

    let disabled = code
        .profile()
        .record_bail(reason.is_fatal(), engine.config().max_fatal_bails);
    engine.tiered().record_bail(reason);

    if disabled {
        engine.tiered().forget(code.id());
        engine.tiered().record_disabling_bail();
        warn!(
            target: "tiervm::jit::bailout",
            unit = code.name(),
            ip = frame.ip,
            %reason,
            fatal_bails = code.profile().fatal_bails(),
            "native execution disabled"
        );
    } else {
        debug!(
            target: "tiervm::jit::bailout",
            unit = code.name(),
            ip = frame.ip,
            depth = frame.stack.len(),
            blocks = frame.blocks.len(),
            %reason,
            "bail to interpreter"
        );
    }

    engine.record_event(EventKind::BailEnd);
    disabled
}
