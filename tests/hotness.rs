//! Hotness accounting and automatic promotion.

mod common;

use common::*;
use std::sync::Arc;

use tiervm::backend::bytecode::{CodeBuilder, CodeUnit, Opcode};
use tiervm::{Engine, EngineConfig, EventAnalyzer, EventKind, JitControl, Tier, Value};

#[test]
fn test_promotes_on_the_threshold_call() {
    let engine = Engine::new();
    let code = pick();
    let f = engine.define("pick", code.clone());

    for _ in 0..9_999 {
        assert_eq!(engine.call(&f, vec![Value::Int(5)]).unwrap().as_int(), Some(1));
    }
    assert_eq!(engine.hotness(&code), 9_999);
    assert_eq!(engine.tier(&code), Tier::Interpreted);
    assert_eq!(code.profile().compile_count(), 0);

    assert_eq!(engine.call(&f, vec![Value::Int(5)]).unwrap().as_int(), Some(1));
    assert_eq!(engine.tier(&code), Tier::Native);
    assert!(engine.uses_native(&code));
    assert_eq!(engine.opt_level(&code), 2);
    assert_eq!(code.profile().compile_count(), 1);
    assert!(engine.stats().native_runs >= 1);
}

#[test]
fn test_compiles_exactly_once() {
    let engine = Engine::new();
    let code = pick();
    let f = engine.define("pick", code.clone());

    for _ in 0..12_000 {
        engine.call(&f, vec![Value::Int(3)]).unwrap();
    }
    assert_eq!(engine.tier(&code), Tier::Native);
    assert_eq!(code.profile().compile_count(), 1);
    assert_eq!(engine.stats().compilations, 1);
    assert_eq!(code.profile().calls(), 12_000);
}

#[test]
fn test_backedges_weigh_ten() {
    let engine = Engine::new();
    let code = loop_sum();
    let f = engine.define("loop_sum", code.clone());

    let result = engine.call(&f, vec![Value::Int(1_000)]).unwrap();
    assert_eq!(result.as_int(), Some(499_500));
    assert_eq!(code.profile().backedges(), 1_000);
    assert_eq!(engine.hotness(&code), 1 + 1_000 * 10);
    // Promotion is only considered when a call starts.
    assert_eq!(engine.tier(&code), Tier::Interpreted);

    let result = engine.call(&f, vec![Value::Int(10)]).unwrap();
    assert_eq!(result.as_int(), Some(45));
    assert_eq!(engine.tier(&code), Tier::Native);
    assert_eq!(code.profile().compile_count(), 1);
}

#[test]
fn test_loop_sum_goes_native_by_call_ten_thousand() {
    let engine = Engine::new();
    let code = loop_sum();
    let f = engine.define("loop_sum", code.clone());

    let mut promoted_at = None;
    for call in 1..=11_000u32 {
        let result = engine.call(&f, vec![Value::Int(10)]).unwrap();
        assert_eq!(result.as_int(), Some(45), "call {}", call);
        if promoted_at.is_none() && engine.uses_native(&code) {
            promoted_at = Some(call);
        }
    }
    let promoted_at = promoted_at.expect("loop_sum was never promoted");
    assert!(promoted_at <= 10_000, "promoted at call {}", promoted_at);
    assert_eq!(code.profile().compile_count(), 1);
    assert_eq!(engine.bails(&code), 0);
}

#[test]
fn test_custom_threshold_and_weight() {
    let config = EngineConfig {
        hotness_threshold: 100,
        backedge_weight: 1,
        ..EngineConfig::default()
    };
    let engine = Engine::with_config(config);
    let code = loop_sum();
    let f = engine.define("loop_sum", code.clone());

    engine.call(&f, vec![Value::Int(50)]).unwrap();
    assert_eq!(engine.hotness(&code), 51);
    engine.call(&f, vec![Value::Int(50)]).unwrap();
    assert_eq!(engine.tier(&code), Tier::Interpreted);
    engine.call(&f, vec![Value::Int(50)]).unwrap();
    assert_eq!(engine.tier(&code), Tier::Native);
}

#[test]
fn test_jit_control_never_and_always() {
    let engine = Engine::with_config(EngineConfig::default().with_jit_control(JitControl::Never));
    let code = loop_sum();
    let f = engine.define("loop_sum", code.clone());
    for _ in 0..20 {
        engine.call(&f, vec![Value::Int(100)]).unwrap();
    }
    assert!(engine.hotness(&code) > 10_000);
    assert_eq!(engine.tier(&code), Tier::Interpreted);

    engine.set_jit_control(JitControl::Always);
    let other = pick();
    let g = engine.define("pick", other.clone());
    engine.call(&g, vec![Value::Int(1)]).unwrap();
    assert_eq!(engine.tier(&other), Tier::Native);
    // The hot unit is picked up on its next call too.
    engine.call(&f, vec![Value::Int(1)]).unwrap();
    assert_eq!(engine.tier(&code), Tier::Native);
}

#[test]
fn test_concurrent_calls_compile_once() {
    let engine = Engine::new();
    let code = pick();
    let f = engine.define("pick", code.clone());

    std::thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..5_000 {
                    let result = engine.call(&f, vec![Value::Int(2)]).unwrap();
                    assert_eq!(result.as_int(), Some(1));
                }
            });
        }
    });

    assert_eq!(code.profile().calls(), 20_000);
    assert_eq!(engine.tier(&code), Tier::Native);
    assert_eq!(code.profile().compile_count(), 1);
}

#[test]
fn test_promotion_emits_timing_events() {
    let engine = Engine::with_config(
        EngineConfig::default()
            .with_threshold(10)
            .with_events(true),
    );
    let code = pick();
    let f = engine.define("pick", code.clone());
    for _ in 0..20 {
        engine.call(&f, vec![Value::Int(1)]).unwrap();
    }

    let events = engine.events().snapshot();
    let count = |kind: EventKind| events.iter().filter(|e| e.kind == kind).count();
    assert_eq!(count(EventKind::CompileStart), 1);
    assert_eq!(count(EventKind::CompileEnd), 1);
    assert_eq!(count(EventKind::CallStartEval), 20);
    assert_eq!(count(EventKind::CallEnterEval), 9);
    assert_eq!(count(EventKind::CallEnterNative), 11);

    let analyzer = EventAnalyzer::analyze(&events);
    assert_eq!(analyzer.stats("compile").map(|s| s.count), Some(1));
    assert_eq!(analyzer.stats("call_to_native").map(|s| s.count), Some(11));
    assert!(analyzer.report().contains("call_to_eval"));
}

/// `if x: raise E, v, tb` on a path never taken; the three-argument form
/// has no lowering
fn unlowerable() -> Arc<CodeUnit> {
    let mut b = CodeBuilder::new("unlowerable");
    b.args(&["x"]);
    let skip = b.label();
    b.load_fast("x");
    b.jump(Opcode::PopJumpIfFalse, skip);
    b.load_global("ValueError").load_const(Value::Int(1)).load_const(Value::None);
    b.emit_arg(Opcode::RaiseVarargs, 3);
    b.bind(skip);
    b.load_const(Value::Int(1)).return_value();
    b.build().unwrap()
}

#[test]
fn test_lowering_failure_keeps_unit_interpreted() {
    let engine = Engine::with_config(EngineConfig::default().with_threshold(5));
    let code = unlowerable();
    let f = engine.define("unlowerable", code.clone());

    for _ in 0..20 {
        let result = engine.call(&f, vec![Value::Bool(false)]).unwrap();
        assert_eq!(result.as_int(), Some(1));
    }
    assert_eq!(engine.tier(&code), Tier::PermanentlyInterpreted);
    assert!(!engine.uses_native(&code));
    assert!(engine.dump_ir(&code).is_none());

    let stats = engine.stats();
    assert_eq!(stats.lowering_failures, 1);
    assert_eq!(stats.compile_failures, 1);
    assert_eq!(stats.compilations, 0);
    assert_eq!(code.profile().compile_count(), 1);
}
