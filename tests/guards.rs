//! Speculation guards: a branch that always went one way is compiled as a
//! guard, global lookups are cached behind a namespace guard, and integer
//! kernels guard their argument types on entry.

mod common;

use std::sync::Arc;

use common::*;
use tiervm::backend::bytecode::{CodeBuilder, CodeUnit, Opcode};
use tiervm::{
    BackendKind, BailReason, Engine, EngineConfig, ExceptionKind, JitControl, JitError, Tier,
    Value,
};

fn guarded_engine(backend: BackendKind) -> Engine {
    Engine::with_config(
        EngineConfig::default()
            .with_threshold(300)
            .with_backend(backend),
    )
}

/// `scale * x`, with `scale` a global
fn scaled() -> Arc<CodeUnit> {
    let mut b = CodeBuilder::new("scaled");
    b.args(&["x"]);
    b.load_global("scale").load_fast("x").emit(Opcode::BinaryMultiply);
    b.return_value();
    b.build().unwrap()
}

#[test]
fn test_consistent_branch_becomes_guard() {
    for backend in [BackendKind::Threaded, BackendKind::Auto] {
        let engine = guarded_engine(backend);
        let code = pick();
        let f = engine.define("pick", code.clone());

        for _ in 0..300 {
            assert_eq!(engine.call(&f, vec![Value::Int(5)]).unwrap().as_int(), Some(1));
        }
        assert_eq!(engine.tier(&code), Tier::Native, "{:?}", backend);
        let ir = engine.dump_ir(&code).expect("ir is kept for native units");
        assert!(ir.contains("speculate"), "{:?}: {}", backend, ir);

        assert_eq!(engine.call(&f, vec![Value::Int(5)]).unwrap().as_int(), Some(1));
        assert_eq!(engine.bails(&code), 0);

        // The unlikely side still computes the right answer, via the interpreter.
        assert_eq!(engine.call(&f, vec![Value::Int(20)]).unwrap().as_int(), Some(2));
        assert_eq!(engine.bails(&code), 1);
        assert_eq!(engine.stats().bails_for(BailReason::GuardFail), 1);
        assert_eq!(engine.tier(&code), Tier::Native, "a guard bail is not fatal");

        assert_eq!(engine.call(&f, vec![Value::Int(5)]).unwrap().as_int(), Some(1));
        assert_eq!(engine.bails(&code), 1);
    }
}

#[test]
fn test_bail_error_mode_raises_at_guard() {
    let engine = guarded_engine(BackendKind::Threaded);
    let code = pick();
    let f = engine.define("pick", code.clone());
    for _ in 0..300 {
        engine.call(&f, vec![Value::Int(5)]).unwrap();
    }
    assert!(engine.uses_native(&code));

    engine.set_bail_error(true);
    assert_eq!(engine.call(&f, vec![Value::Int(5)]).unwrap().as_int(), Some(1));
    let err = engine.call(&f, vec![Value::Int(20)]).unwrap_err();
    assert!(err.is_exception(ExceptionKind::RuntimeError), "{}", err);
    assert_eq!(
        err.exception().map(|e| e.message()),
        Some("bailed to the interpreter".to_string())
    );
    assert_eq!(engine.bails(&code), 1);
    assert_eq!(engine.tier(&code), Tier::Native);

    engine.set_bail_error(false);
    assert_eq!(engine.call(&f, vec![Value::Int(20)]).unwrap().as_int(), Some(2));
    assert_eq!(engine.call(&f, vec![Value::Int(5)]).unwrap().as_int(), Some(1));
}

#[test]
fn test_mixed_branch_is_not_speculated() {
    let engine = guarded_engine(BackendKind::Threaded);
    let code = pick();
    let f = engine.define("pick", code.clone());
    for i in 0..300 {
        let x = if i % 2 == 0 { 5 } else { 50 };
        engine.call(&f, vec![Value::Int(x)]).unwrap();
    }
    assert_eq!(engine.tier(&code), Tier::Native);
    let ir = engine.dump_ir(&code).unwrap();
    assert!(!ir.contains("speculate"), "{}", ir);
    engine.call(&f, vec![Value::Int(5)]).unwrap();
    engine.call(&f, vec![Value::Int(50)]).unwrap();
    assert_eq!(engine.bails(&code), 0);
}

#[test]
fn test_changed_global_is_a_permanent_fatal_bail() {
    let engine = guarded_engine(BackendKind::Auto);
    engine.set_global("scale", Value::Int(3));
    let code = scaled();
    let f = engine.define("scaled", code.clone());

    for _ in 0..300 {
        assert_eq!(engine.call(&f, vec![Value::Int(2)]).unwrap().as_int(), Some(6));
    }
    assert_eq!(engine.tier(&code), Tier::Native);
    assert!(engine.dump_ir(&code).unwrap().contains("load_cached"));

    engine.set_global("scale", Value::Int(4));
    assert_eq!(engine.call(&f, vec![Value::Int(2)]).unwrap().as_int(), Some(8));
    assert_eq!(engine.fatal_bails(&code), 1);
    assert_eq!(engine.tier(&code), Tier::PermanentlyInterpreted);
    assert!(!engine.uses_native(&code));
    assert_eq!(engine.stats().fatal_bails(), 1);
    assert_eq!(engine.stats().disabling_bails, 1);

    for _ in 0..2_000 {
        assert_eq!(engine.call(&f, vec![Value::Int(2)]).unwrap().as_int(), Some(8));
    }
    assert_eq!(engine.tier(&code), Tier::PermanentlyInterpreted);
    assert_eq!(code.profile().compile_count(), 1);
    assert_eq!(
        engine.set_optimization_level(&code, 2),
        Err(JitError::Disabled)
    );
}

#[test]
fn test_kernel_entry_guard_and_reset() {
    let engine = Engine::with_config(EngineConfig::default().with_backend(BackendKind::Auto));
    let code = loop_sum();
    let f = engine.define("loop_sum", code.clone());
    engine.set_optimization_level(&code, 1).unwrap();
    let compiled = engine.tiered().compiled_unit(code.id()).unwrap();
    assert_eq!(compiled.backend, BackendKind::Cranelift);
    assert!(engine.dump_native(&code).is_some());

    assert_eq!(engine.call(&f, vec![Value::Int(100)]).unwrap().as_int(), Some(4_950));
    assert_eq!(engine.bails(&code), 0);

    // A float argument breaks the kernel's integer assumption.
    let result = engine.call(&f, vec![Value::Float(3.0)]).unwrap();
    assert_eq!(result.as_int(), Some(3));
    assert_eq!(engine.fatal_bails(&code), 1);
    assert_eq!(engine.tier(&code), Tier::PermanentlyInterpreted);

    engine.reset_tier(&code);
    assert_eq!(engine.tier(&code), Tier::Interpreted);
    assert_eq!(engine.hotness(&code), 0);
    assert_eq!(engine.fatal_bails(&code), 0);
    engine.set_optimization_level(&code, 1).unwrap();
    assert!(engine.uses_native(&code));
    assert_eq!(engine.call(&f, vec![Value::Int(10)]).unwrap().as_int(), Some(45));
}

#[test]
fn test_max_fatal_bails_is_configurable() {
    let config = EngineConfig {
        max_fatal_bails: 2,
        backend: BackendKind::Auto,
        ..EngineConfig::default()
    };
    let engine = Engine::with_config(config);
    let code = loop_sum();
    let f = engine.define("loop_sum", code.clone());
    engine.set_optimization_level(&code, 0).unwrap();

    engine.call(&f, vec![Value::Float(2.0)]).unwrap();
    assert_eq!(engine.fatal_bails(&code), 1);
    assert_eq!(engine.tier(&code), Tier::Native);
    engine.call(&f, vec![Value::Float(2.0)]).unwrap();
    assert_eq!(engine.fatal_bails(&code), 2);
    assert_eq!(engine.tier(&code), Tier::PermanentlyInterpreted);
}

#[test]
fn test_operand_feedback_picks_the_auto_backend() {
    let engine = Engine::with_config(
        EngineConfig::default()
            .with_jit_control(JitControl::Never)
            .with_backend(BackendKind::Auto),
    );

    // Only ints seen: an integer kernel with int fast paths
    let ints = straight_line();
    let f = engine.define("straight_line", ints.clone());
    assert_eq!(engine.call(&f, vec![Value::Int(3), Value::Int(4)]).unwrap().as_int(), Some(11));
    engine.set_optimization_level(&ints, 2).unwrap();
    let compiled = engine.tiered().compiled_unit(ints.id()).unwrap();
    assert_eq!(compiled.backend, BackendKind::Cranelift);
    assert!(engine.dump_ir(&ints).unwrap().contains("[int]"));

    // A float already went through `a + b`: threaded code, no entry guard to trip
    let mixed = straight_line();
    let g = engine.define("straight_line", mixed.clone());
    let float = engine.call(&g, vec![Value::Float(1.5), Value::Int(2)]).unwrap();
    engine.set_optimization_level(&mixed, 2).unwrap();
    let compiled = engine.tiered().compiled_unit(mixed.id()).unwrap();
    assert_eq!(compiled.backend, BackendKind::Threaded);

    let again = engine.call(&g, vec![Value::Float(1.5), Value::Int(2)]).unwrap();
    assert_eq!(again.repr(), float.repr());
    assert_eq!(engine.call(&g, vec![Value::Int(3), Value::Int(4)]).unwrap().as_int(), Some(11));
    assert_eq!(engine.fatal_bails(&mixed), 0);
    assert_eq!(engine.bails(&mixed), 0);
}
