//! Shared programs and harness for integration tests
//!
//! Every program is assembled with `CodeBuilder` the way a front end would
//! emit it. The harness runs a scenario once per execution mode (pure
//! interpretation, and native code at each optimization level on each
//! backend) and collects what the guest observed, so tests can assert that
//! the tier a unit runs in never changes its behavior.
#![allow(dead_code)]

use std::sync::Arc;

use tiervm::backend::bytecode::{CmpOp, CodeBuilder, CodeUnit, Opcode};
use tiervm::backend::object::{Class, Instance};
use tiervm::{
    BackendKind, Engine, EngineConfig, ExceptionKind, JitControl, VmError, VmResult, Value,
};

// =============================================================================
// Execution modes
// =============================================================================

/// Where a scenario's code units run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Pinned to the interpreter
    Interpreted,
    /// Compiled up front at `level` with `backend`
    Native(i32, BackendKind),
}

impl Mode {
    /// Interpreted first, then every level on the threaded and auto backends
    pub fn all() -> Vec<Mode> {
        let mut modes = vec![Mode::Interpreted];
        for backend in [BackendKind::Threaded, BackendKind::Auto] {
            for level in 0..=2 {
                modes.push(Mode::Native(level, backend));
            }
        }
        modes
    }

    pub fn level(self) -> i32 {
        match self {
            Mode::Interpreted => -1,
            Mode::Native(level, _) => level,
        }
    }

    /// Engine with automatic promotion off, so only the requested tier runs
    pub fn engine(self) -> Engine {
        let backend = match self {
            Mode::Interpreted => BackendKind::Auto,
            Mode::Native(_, backend) => backend,
        };
        Engine::with_config(
            EngineConfig::default()
                .with_jit_control(JitControl::Never)
                .with_backend(backend),
        )
    }

    /// Apply this mode to `units`; panics if a unit cannot be compiled
    pub fn apply(self, engine: &Engine, units: &[Arc<CodeUnit>]) {
        for unit in units {
            engine
                .set_optimization_level(unit, self.level())
                .unwrap_or_else(|e| panic!("{:?}: cannot set level on {}: {}", self, unit.name(), e));
            assert_eq!(
                engine.uses_native(unit),
                self != Mode::Interpreted,
                "{:?}: unexpected tier for {}",
                self,
                unit.name()
            );
        }
    }
}

// =============================================================================
// Scenarios
// =============================================================================

/// What one call produced: the result's repr, or the escaping exception
pub type Outcome = Result<String, (ExceptionKind, String)>;

/// A callable with the argument lists to call it with
pub struct Scenario {
    pub entry: Value,
    pub calls: Vec<Vec<Value>>,
    /// Every code unit the scenario runs, nested ones included
    pub units: Vec<Arc<CodeUnit>>,
    /// Shared state rendered after all calls, such as a log list
    pub observe: Option<Value>,
}

impl Scenario {
    pub fn new(entry: Value, units: Vec<Arc<CodeUnit>>) -> Self {
        Scenario {
            entry,
            calls: Vec::new(),
            units,
            observe: None,
        }
    }

    pub fn call(mut self, args: Vec<Value>) -> Self {
        self.calls.push(args);
        self
    }

    pub fn observe(mut self, value: Value) -> Self {
        self.observe = Some(value);
        self
    }
}

/// Turn a call result into an [`Outcome`]; host-level errors fail the test
pub fn outcome(result: VmResult<Value>) -> Outcome {
    match result {
        Ok(value) => Ok(value.repr()),
        Err(VmError::Raised(exc)) => Err((exc.kind, exc.message())),
        Err(other) => panic!("host error: {}", other),
    }
}

/// Run the scenario built by `build` in `mode`
pub fn run_in_mode(mode: Mode, build: fn(&Engine) -> Scenario) -> Vec<Outcome> {
    let engine = mode.engine();
    let scenario = build(&engine);
    mode.apply(&engine, &scenario.units);

    let mut outcomes: Vec<Outcome> = scenario
        .calls
        .iter()
        .map(|args| outcome(engine.call(&scenario.entry, args.clone())))
        .collect();
    if let Some(observed) = &scenario.observe {
        outcomes.push(Ok(observed.repr()));
    }
    outcomes
}

/// Run the scenario in every mode and require identical outcomes
///
/// Returns the interpreted outcomes for further checks.
pub fn assert_tier_transparent(build: fn(&Engine) -> Scenario) -> Vec<Outcome> {
    let mut modes = Mode::all().into_iter();
    let baseline = run_in_mode(modes.next().unwrap_or(Mode::Interpreted), build);
    for mode in modes {
        let got = run_in_mode(mode, build);
        assert_eq!(got, baseline, "{:?} diverged from the interpreter", mode);
    }
    baseline
}

/// Code units reachable from `code` through code constants, `code` first
pub fn with_nested(code: &Arc<CodeUnit>) -> Vec<Arc<CodeUnit>> {
    let mut out = vec![code.clone()];
    let mut i = 0;
    while i < out.len() {
        let nested: Vec<_> = out[i]
            .consts()
            .iter()
            .filter_map(|c| match c {
                Value::Code(inner) => Some(inner.clone()),
                _ => None,
            })
            .collect();
        out.extend(nested);
        i += 1;
    }
    out
}

// =============================================================================
// Builtins used by tests
// =============================================================================

/// Guest-callable `bail()` that asks native frames to bail at their next
/// safe point
pub fn bail_builtin() -> Value {
    fn request(engine: &Engine, _args: &[Value]) -> VmResult<Value> {
        engine.request_bail();
        Ok(Value::None)
    }
    Value::builtin("bail", request)
}

/// Emit `<target>.append(<const>)` as a statement
fn append_const(b: &mut CodeBuilder, target: &str, value: Value) {
    b.load_fast(target).load_attr("append").load_const(value).call(1).emit(Opcode::PopTop);
}

// =============================================================================
// Programs
// =============================================================================

/// `total = 0; i = 0; while i < n: total += i; i += 1; return total`
pub fn loop_sum() -> Arc<CodeUnit> {
    loop_sum_with(false)
}

/// [`loop_sum`] built with superinstructions
pub fn loop_sum_fused() -> Arc<CodeUnit> {
    loop_sum_with(true)
}

fn loop_sum_with(fuse: bool) -> Arc<CodeUnit> {
    let mut b = CodeBuilder::new("loop_sum");
    b.args(&["n"]);
    b.fuse(fuse);
    let (top, exit, end) = (b.label(), b.label(), b.label());
    b.load_const(Value::Int(0)).store_fast("total");
    b.load_const(Value::Int(0)).store_fast("i");
    b.jump(Opcode::SetupLoop, end);
    b.bind(top);
    b.line(2);
    b.load_fast("i").load_fast("n").compare(CmpOp::Lt);
    b.jump(Opcode::PopJumpIfFalse, exit);
    b.line(3);
    b.load_fast("total").load_fast("i").emit(Opcode::InplaceAdd).store_fast("total");
    b.load_fast("i").load_const(Value::Int(1)).emit(Opcode::InplaceAdd).store_fast("i");
    b.jump(Opcode::JumpAbsolute, top);
    b.bind(exit);
    b.emit(Opcode::PopBlock);
    b.bind(end);
    b.line(4);
    b.load_fast("total").return_value();
    b.build().unwrap()
}

/// `(a + b) * 2 - a`
pub fn straight_line() -> Arc<CodeUnit> {
    let mut b = CodeBuilder::new("straight_line");
    b.args(&["a", "b"]);
    b.load_fast("a").load_fast("b").emit(Opcode::BinaryAdd);
    b.load_const(Value::Int(2)).emit(Opcode::BinaryMultiply);
    b.load_fast("a").emit(Opcode::BinarySubtract);
    b.return_value();
    b.build().unwrap()
}

/// `if x < 10: return 1 else: return 2`
pub fn pick() -> Arc<CodeUnit> {
    let mut b = CodeBuilder::new("pick");
    b.args(&["x"]);
    let other = b.label();
    b.load_fast("x").load_const(Value::Int(10)).compare(CmpOp::Lt);
    b.jump(Opcode::PopJumpIfFalse, other);
    b.line(2);
    b.load_const(Value::Int(1)).return_value();
    b.bind(other);
    b.line(4);
    b.load_const(Value::Int(2)).return_value();
    b.build().unwrap()
}

/// Sum of `xrange(n)` skipping 2 and stopping at 6
pub fn for_break_continue() -> Arc<CodeUnit> {
    let mut b = CodeBuilder::new("for_break_continue");
    b.args(&["n"]);
    let (top, not_two, not_six, done, end) = (b.label(), b.label(), b.label(), b.label(), b.label());
    b.load_const(Value::Int(0)).store_fast("total");
    b.jump(Opcode::SetupLoop, end);
    b.load_global("xrange").load_fast("n").call(1).emit(Opcode::GetIter);
    b.bind(top);
    b.jump(Opcode::ForIter, done);
    b.store_fast("i");
    b.line(2);
    b.load_fast("i").load_const(Value::Int(2)).compare(CmpOp::Eq);
    b.jump(Opcode::PopJumpIfFalse, not_two);
    b.jump(Opcode::JumpAbsolute, top);
    b.bind(not_two);
    b.line(3);
    b.load_fast("i").load_const(Value::Int(6)).compare(CmpOp::Eq);
    b.jump(Opcode::PopJumpIfFalse, not_six);
    b.emit(Opcode::BreakLoop);
    b.bind(not_six);
    b.line(4);
    b.load_fast("total").load_fast("i").emit(Opcode::InplaceAdd).store_fast("total");
    b.jump(Opcode::JumpAbsolute, top);
    b.bind(done);
    b.emit(Opcode::PopBlock);
    b.bind(end);
    b.line(5);
    b.load_fast("total").return_value();
    b.build().unwrap()
}

/// A `continue` inside `try/finally` in a loop: returns `total * 100 + count`
pub fn continue_through_finally() -> Arc<CodeUnit> {
    let mut b = CodeBuilder::new("continue_through_finally");
    b.args(&["n"]);
    let (top, fin, done, end) = (b.label(), b.label(), b.label(), b.label());
    b.load_const(Value::Int(0)).store_fast("total");
    b.load_const(Value::Int(0)).store_fast("count");
    b.jump(Opcode::SetupLoop, end);
    b.load_global("xrange").load_fast("n").call(1).emit(Opcode::GetIter);
    b.bind(top);
    b.jump(Opcode::ForIter, done);
    b.store_fast("i");
    b.jump(Opcode::SetupFinally, fin);
    b.line(2);
    b.load_fast("total").load_const(Value::Int(1)).emit(Opcode::InplaceAdd).store_fast("total");
    b.jump(Opcode::ContinueLoop, top);
    b.bind(fin);
    b.line(3);
    b.load_fast("count").load_const(Value::Int(1)).emit(Opcode::InplaceAdd).store_fast("count");
    b.emit(Opcode::EndFinally);
    b.jump(Opcode::JumpAbsolute, top);
    b.bind(done);
    b.emit(Opcode::PopBlock);
    b.bind(end);
    b.line(4);
    b.load_fast("total").load_const(Value::Int(100)).emit(Opcode::BinaryMultiply);
    b.load_fast("count").emit(Opcode::BinaryAdd);
    b.return_value();
    b.build().unwrap()
}

/// `try: log.append(1); return 10 finally: log.append(2)`
pub fn try_finally_return() -> Arc<CodeUnit> {
    let mut b = CodeBuilder::new("try_finally_return");
    b.args(&["log"]);
    let fin = b.label();
    b.jump(Opcode::SetupFinally, fin);
    append_const(&mut b, "log", Value::Int(1));
    b.load_const(Value::Int(10)).return_value();
    b.bind(fin);
    append_const(&mut b, "log", Value::Int(2));
    b.emit(Opcode::EndFinally);
    b.load_const(Value::None).return_value();
    b.build().unwrap()
}

/// `try: return a // b except ZeroDivisionError: return -1`
pub fn safe_div() -> Arc<CodeUnit> {
    let mut b = CodeBuilder::new("safe_div");
    b.args(&["a", "b"]);
    let (handler, reraise) = (b.label(), b.label());
    b.jump(Opcode::SetupExcept, handler);
    b.load_fast("a").load_fast("b").emit(Opcode::BinaryFloorDivide);
    b.return_value();
    b.bind(handler);
    b.emit(Opcode::DupTop);
    b.load_global("ZeroDivisionError").compare(CmpOp::ExcMatch);
    b.jump(Opcode::PopJumpIfFalse, reraise);
    b.emit(Opcode::PopTop).emit(Opcode::PopTop).emit(Opcode::PopTop);
    b.load_const(Value::Int(-1)).return_value();
    b.bind(reraise);
    b.emit(Opcode::EndFinally);
    b.load_const(Value::None).return_value();
    b.build().unwrap()
}

/// A `ValueError` handler that raises `KeyError`, caught one level out
pub fn nested_handlers() -> Arc<CodeUnit> {
    let mut b = CodeBuilder::new("nested_handlers");
    b.args(&["log"]);
    let (outer, inner, inner_reraise, outer_reraise, done) =
        (b.label(), b.label(), b.label(), b.label(), b.label());
    b.jump(Opcode::SetupExcept, outer);
    b.jump(Opcode::SetupExcept, inner);
    append_const(&mut b, "log", Value::Int(1));
    b.load_global("ValueError").emit_arg(Opcode::RaiseVarargs, 1);

    b.bind(inner);
    b.emit(Opcode::DupTop);
    b.load_global("ValueError").compare(CmpOp::ExcMatch);
    b.jump(Opcode::PopJumpIfFalse, inner_reraise);
    b.emit(Opcode::PopTop).emit(Opcode::PopTop).emit(Opcode::PopTop);
    append_const(&mut b, "log", Value::Int(2));
    b.load_global("KeyError").load_const(Value::str("k")).emit_arg(Opcode::RaiseVarargs, 2);
    b.bind(inner_reraise);
    b.emit(Opcode::EndFinally);
    b.emit(Opcode::PopBlock);
    b.jump(Opcode::JumpForward, done);

    b.bind(outer);
    b.emit(Opcode::DupTop);
    b.load_global("KeyError").compare(CmpOp::ExcMatch);
    b.jump(Opcode::PopJumpIfFalse, outer_reraise);
    b.emit(Opcode::PopTop).emit(Opcode::PopTop).emit(Opcode::PopTop);
    b.load_const(Value::Int(3)).return_value();
    b.bind(outer_reraise);
    b.emit(Opcode::EndFinally);
    b.bind(done);
    b.load_const(Value::None).return_value();
    b.build().unwrap()
}

/// `def make_adder(n): def add(x): return x + n; return add`
pub fn make_adder() -> Arc<CodeUnit> {
    let mut inner = CodeBuilder::new("add");
    inner.args(&["x"]);
    inner.freevar("n");
    inner.load_fast("x").load_deref("n").emit(Opcode::BinaryAdd).return_value();
    let inner = inner.build().unwrap();

    let mut b = CodeBuilder::new("make_adder");
    b.args(&["n"]);
    b.cellvar("n");
    b.load_closure("n").emit_arg(Opcode::BuildTuple, 1);
    b.load_const(Value::Code(inner));
    b.emit_arg(Opcode::MakeClosure, 0);
    b.return_value();
    b.build().unwrap()
}

/// `make_adder(a)(b)`
pub fn closure_driver() -> Arc<CodeUnit> {
    let mut b = CodeBuilder::new("closure_driver");
    b.args(&["a", "b"]);
    b.load_global("make_adder").load_fast("a").call(1);
    b.load_fast("b").call(1);
    b.return_value();
    b.build().unwrap()
}

/// `while n > 0: yield n; n -= 1`
pub fn countdown() -> Arc<CodeUnit> {
    let mut b = CodeBuilder::new("countdown");
    b.args(&["n"]);
    let (top, done) = (b.label(), b.label());
    b.bind(top);
    b.load_fast("n").load_const(Value::Int(0)).compare(CmpOp::Gt);
    b.jump(Opcode::PopJumpIfFalse, done);
    b.line(2);
    b.load_fast("n").emit(Opcode::YieldValue).emit(Opcode::PopTop);
    b.line(3);
    b.load_fast("n").load_const(Value::Int(1)).emit(Opcode::InplaceSubtract).store_fast("n");
    b.jump(Opcode::JumpAbsolute, top);
    b.bind(done);
    b.load_const(Value::None).return_value();
    b.build().unwrap()
}

/// `list(countdown(n))`
pub fn countdown_driver() -> Arc<CodeUnit> {
    let mut b = CodeBuilder::new("countdown_driver");
    b.args(&["n"]);
    b.load_global("list").load_global("countdown").load_fast("n").call(1).call(1);
    b.return_value();
    b.build().unwrap()
}

/// `try: yield 1; yield 2 finally: log.append("closed")`
pub fn guarded_gen() -> Arc<CodeUnit> {
    let mut b = CodeBuilder::new("guarded_gen");
    b.args(&["log"]);
    let fin = b.label();
    b.jump(Opcode::SetupFinally, fin);
    b.load_const(Value::Int(1)).emit(Opcode::YieldValue).emit(Opcode::PopTop);
    b.load_const(Value::Int(2)).emit(Opcode::YieldValue).emit(Opcode::PopTop);
    b.emit(Opcode::PopBlock);
    b.load_const(Value::None);
    b.bind(fin);
    append_const(&mut b, "log", Value::str("closed"));
    b.emit(Opcode::EndFinally);
    b.load_const(Value::None).return_value();
    b.build().unwrap()
}

/// `g = guarded_gen(log); first = next(g); g.close(); return first`
pub fn close_driver() -> Arc<CodeUnit> {
    let mut b = CodeBuilder::new("close_driver");
    b.args(&["log"]);
    b.load_global("guarded_gen").load_fast("log").call(1).store_fast("g");
    b.load_global("next").load_fast("g").call(1).store_fast("first");
    b.load_fast("g").load_attr("close").call(0).emit(Opcode::PopTop);
    b.load_fast("first").return_value();
    b.build().unwrap()
}

/// `def __enter__(self): self.log.append("enter"); return self`
pub fn manager_enter() -> Arc<CodeUnit> {
    let mut b = CodeBuilder::new("__enter__");
    b.args(&["self"]);
    b.load_fast("self").load_attr("log").load_attr("append");
    b.load_const(Value::str("enter")).call(1).emit(Opcode::PopTop);
    b.load_fast("self").return_value();
    b.build().unwrap()
}

/// `def __exit__(self, t, v, tb): self.log.append("exit"); return t is not None`
pub fn manager_exit() -> Arc<CodeUnit> {
    let mut b = CodeBuilder::new("__exit__");
    b.args(&["self", "t", "v", "tb"]);
    b.load_fast("self").load_attr("log").load_attr("append");
    b.load_const(Value::str("exit")).call(1).emit(Opcode::PopTop);
    b.load_fast("t").load_const(Value::None).compare(CmpOp::IsNot);
    b.return_value();
    b.build().unwrap()
}

/// `with mgr: if fail: raise ValueError("boom"); mgr.log.append("body")`
/// then `return "done"`
pub fn with_body() -> Arc<CodeUnit> {
    let mut b = CodeBuilder::new("with_body");
    b.args(&["mgr", "fail"]);
    let (cleanup, ok) = (b.label(), b.label());
    b.load_fast("mgr").emit(Opcode::DupTop).load_attr("__exit__");
    b.emit(Opcode::RotTwo).load_attr("__enter__").call(0).emit(Opcode::PopTop);
    b.jump(Opcode::SetupFinally, cleanup);
    b.line(2);
    b.load_fast("fail");
    b.jump(Opcode::PopJumpIfFalse, ok);
    b.load_global("ValueError").load_const(Value::str("boom")).emit_arg(Opcode::RaiseVarargs, 2);
    b.bind(ok);
    b.line(3);
    b.load_fast("mgr").load_attr("log").load_attr("append");
    b.load_const(Value::str("body")).call(1).emit(Opcode::PopTop);
    b.emit(Opcode::PopBlock);
    b.load_const(Value::None);
    b.bind(cleanup);
    b.emit(Opcode::WithCleanup);
    b.emit(Opcode::EndFinally);
    b.line(4);
    b.load_const(Value::str("done")).return_value();
    b.build().unwrap()
}

/// A `Manager` instance with an empty `log` list, plus its method units
pub fn manager(engine: &Engine) -> (Value, Value, Vec<Arc<CodeUnit>>) {
    let (enter, exit) = (manager_enter(), manager_exit());
    let class = Class::new("Manager");
    class.set_attr("__enter__", engine.function(enter.clone()));
    class.set_attr("__exit__", engine.function(exit.clone()));
    let instance = Instance::new(class);
    let log = Value::list(Vec::new());
    instance.set_attr("log", log.clone());
    (Value::Instance(instance), log, vec![enter, exit])
}

/// `(seq[1:], seq[:2], seq[1:3], seq[:], seq[::-1])`
pub fn slicing() -> Arc<CodeUnit> {
    let mut b = CodeBuilder::new("slicing");
    b.args(&["seq"]);
    b.load_fast("seq").load_const(Value::Int(1)).slice(true, false);
    b.load_fast("seq").load_const(Value::Int(2)).slice(false, true);
    b.load_fast("seq").load_const(Value::Int(1)).load_const(Value::Int(3)).slice(true, true);
    b.load_fast("seq").slice(false, false);
    b.load_fast("seq").load_const(Value::None).load_const(Value::None);
    b.load_const(Value::Int(-1)).emit_arg(Opcode::BuildSlice, 3);
    b.emit(Opcode::BinarySubscr);
    b.emit_arg(Opcode::BuildTuple, 5).return_value();
    b.build().unwrap()
}

/// `items[1:3] = ["x"]; del items[:1]; items[1:] = (7, 8, 9); del items[::2]`
/// then `return items`
pub fn slice_mutation() -> Arc<CodeUnit> {
    let mut b = CodeBuilder::new("slice_mutation");
    b.args(&["items"]);
    b.load_const(Value::str("x")).emit_arg(Opcode::BuildList, 1);
    b.load_fast("items").load_const(Value::Int(1)).load_const(Value::Int(3));
    b.emit(Opcode::StoreSlice3);
    b.load_fast("items").load_const(Value::Int(1)).emit(Opcode::DeleteSlice2);
    b.load_const(Value::Int(7)).load_const(Value::Int(8)).load_const(Value::Int(9));
    b.emit_arg(Opcode::BuildTuple, 3);
    b.load_fast("items").load_const(Value::Int(1)).emit(Opcode::StoreSlice1);
    b.load_fast("items").load_const(Value::None).load_const(Value::None);
    b.load_const(Value::Int(2)).emit_arg(Opcode::BuildSlice, 3);
    b.emit(Opcode::DeleteSubscr);
    b.load_fast("items").return_value();
    b.build().unwrap()
}

/// `def combine(a, b, c): return (a, b, c)`
pub fn combine() -> Arc<CodeUnit> {
    let mut b = CodeBuilder::new("combine");
    b.args(&["a", "b", "c"]);
    b.load_fast("a").load_fast("b").load_fast("c");
    b.emit_arg(Opcode::BuildTuple, 3).return_value();
    b.build().unwrap()
}

/// `combine(*seq, **mapping)`
pub fn spread_call() -> Arc<CodeUnit> {
    let mut b = CodeBuilder::new("spread_call");
    b.args(&["seq", "mapping"]);
    b.load_global("combine").load_fast("seq").load_fast("mapping");
    b.call_unpack(0, 0, true, true).return_value();
    b.build().unwrap()
}

/// `(combine(0, c=9, *seq), combine(1, **mapping))`
pub fn mixed_spread_call() -> Arc<CodeUnit> {
    let mut b = CodeBuilder::new("mixed_spread_call");
    b.args(&["seq", "mapping"]);
    b.load_global("combine").load_const(Value::Int(0));
    b.load_const(Value::str("c")).load_const(Value::Int(9)).load_fast("seq");
    b.call_unpack(1, 1, true, false);
    b.load_global("combine").load_const(Value::Int(1)).load_fast("mapping");
    b.call_unpack(1, 0, false, true);
    b.emit_arg(Opcode::BuildTuple, 2).return_value();
    b.build().unwrap()
}

/// A dict with string keys, in order
pub fn dict_of(pairs: &[(&str, Value)]) -> Value {
    let dict = Value::dict();
    if let Value::Dict(d) = &dict {
        for (key, value) in pairs {
            d.lock().insert(Value::str(key), value.clone()).unwrap();
        }
    }
    dict
}
