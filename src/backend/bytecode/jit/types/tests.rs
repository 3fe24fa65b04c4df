//! Tests for JIT type definitions.

use super::*;
use crate::backend::bytecode::opcodes::Opcode;

#[test]
fn test_opt_level_roundtrip() {
    for level in -1..=2 {
        assert_eq!(OptLevel::from_i32(level).unwrap().as_i32(), level);
    }
    assert_eq!(OptLevel::from_i32(3), Err(JitError::InvalidOptLevel(3)));
    assert!(OptLevel::O2 > OptLevel::O1);
}

#[test]
fn test_bail_reason_classes() {
    assert!(BailReason::FatalGuardFail.is_fatal());
    assert!(!BailReason::GuardFail.is_fatal());
    assert!(BailReason::GuardFail.is_guard());
    assert!(!BailReason::Requested.is_guard());
    assert_eq!(BailReason::ALL.len(), 6);
}

#[test]
fn test_jit_control_parse() {
    assert_eq!(JitControl::parse("whenhot"), Some(JitControl::WhenHot));
    assert_eq!(JitControl::parse("sometimes"), None);
    assert_eq!(JitControl::from_u8(JitControl::Always as u8), JitControl::Always);
}

#[test]
fn test_lowering_failures_are_recoverable() {
    let unsupported = JitError::Unsupported {
        ip: 3,
        opcode: Opcode::YieldValue,
    };
    assert!(unsupported.is_lowering_failure());
    assert!(!JitError::AlreadyNative.is_lowering_failure());
    assert_eq!(unsupported.to_string(), "Unsupported opcode YIELD_VALUE at ip 3");
}
