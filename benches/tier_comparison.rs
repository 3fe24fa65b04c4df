//! Benchmark comparing the execution tiers on the same code units
//!
//! - Interpreter: the reference eval loop
//! - Threaded: lowered IR run by the closure-threaded backend
//! - Cranelift: integer kernels compiled to machine code

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use std::time::Duration;
use tiervm::backend::bytecode::{CmpOp, CodeBuilder, CodeUnit, Opcode};
use tiervm::{BackendKind, Engine, EngineConfig, JitControl, Value};

/// `total = 0; i = 0; while i < n: total += i; i += 1; return total`
fn loop_sum() -> Arc<CodeUnit> {
    let mut b = CodeBuilder::new("loop_sum");
    b.args(&["n"]);
    let (top, exit, end) = (b.label(), b.label(), b.label());
    b.load_const(Value::Int(0)).store_fast("total");
    b.load_const(Value::Int(0)).store_fast("i");
    b.jump(Opcode::SetupLoop, end);
    b.bind(top);
    b.load_fast("i").load_fast("n").compare(CmpOp::Lt);
    b.jump(Opcode::PopJumpIfFalse, exit);
    b.load_fast("total").load_fast("i").emit(Opcode::InplaceAdd).store_fast("total");
    b.load_fast("i").load_const(Value::Int(1)).emit(Opcode::InplaceAdd).store_fast("i");
    b.jump(Opcode::JumpAbsolute, top);
    b.bind(exit);
    b.emit(Opcode::PopBlock);
    b.bind(end);
    b.load_fast("total").return_value();
    b.build().expect("loop_sum builds")
}

/// `if x < 10: return 1; return 2`
fn pick() -> Arc<CodeUnit> {
    let mut b = CodeBuilder::new("pick");
    b.args(&["x"]);
    let other = b.label();
    b.load_fast("x").load_const(Value::Int(10)).compare(CmpOp::Lt);
    b.jump(Opcode::PopJumpIfFalse, other);
    b.load_const(Value::Int(1)).return_value();
    b.bind(other);
    b.load_const(Value::Int(2)).return_value();
    b.build().expect("pick builds")
}

/// Engine with `code` pinned to one tier
fn setup(code: &Arc<CodeUnit>, tier: Option<BackendKind>) -> (Engine, Value) {
    let config = EngineConfig::default()
        .with_jit_control(JitControl::Never)
        .with_backend(tier.unwrap_or(BackendKind::Threaded));
    let engine = Engine::with_config(config);
    let f = engine.define(code.name(), code.clone());
    if tier.is_some() {
        engine
            .set_optimization_level(code, 2)
            .expect("compilation failed");
    }
    (engine, f)
}

const TIERS: [(&str, Option<BackendKind>); 3] = [
    ("interpreter", None),
    ("threaded", Some(BackendKind::Threaded)),
    ("cranelift", Some(BackendKind::Auto)),
];

// ============================================================================
// Benchmark 1: Counted loop
// ============================================================================

fn bench_loop_sum(c: &mut Criterion) {
    let mut group = c.benchmark_group("loop_sum");
    group.measurement_time(Duration::from_secs(10));

    for n in [10i64, 1_000, 100_000] {
        group.throughput(Throughput::Elements(n as u64));
        for (label, tier) in TIERS {
            let code = loop_sum();
            let (engine, f) = setup(&code, tier);
            group.bench_with_input(BenchmarkId::new(label, n), &n, |b, n| {
                b.iter(|| engine.call(&f, vec![Value::Int(black_box(*n))]))
            });
        }
    }

    group.finish();
}

// ============================================================================
// Benchmark 2: Call overhead
// ============================================================================

fn bench_call_overhead(c: &mut Criterion) {
    let mut group = c.benchmark_group("call_overhead");

    for (label, tier) in TIERS {
        let code = pick();
        let (engine, f) = setup(&code, tier);
        group.bench_function(label, |b| {
            b.iter(|| engine.call(&f, vec![Value::Int(black_box(3))]))
        });
    }

    group.finish();
}

// ============================================================================
// Benchmark 3: Promotion cost
// ============================================================================

fn bench_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile");

    for (label, tier) in TIERS.into_iter().skip(1) {
        let code = loop_sum();
        let (engine, _f) = setup(&code, tier);
        group.bench_function(label, |b| {
            b.iter(|| {
                engine.reset_tier(&code);
                engine.set_optimization_level(black_box(&code), 2)
            })
        });
    }

    group.finish();
}

// ============================================================================
// Main
// ============================================================================

criterion_group!(benches, bench_loop_sum, bench_call_overhead, bench_compile);

criterion_main!(benches);
