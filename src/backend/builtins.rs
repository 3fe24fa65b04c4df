//! Builtin namespace and methods of builtin types
//!
//! Every builtin is a plain `fn(&Engine, &[Value]) -> VmResult<Value>`.
//! Methods on builtin types receive their receiver as the first argument.

use std::sync::Arc;

use crate::backend::bytecode::opcodes::CmpOp;
use crate::backend::bytecode::vm::{VmError, VmResult};
use crate::backend::object::{
    BuiltinFn, ExceptionKind, ExceptionObj, IterState, Namespace, Value,
};
use crate::backend::ops;
use crate::engine::Engine;

/// Functions installed in every builtins namespace
const FUNCTIONS: &[(&str, BuiltinFn)] = &[
    ("len", builtin_len),
    ("range", builtin_range),
    ("xrange", builtin_xrange),
    ("abs", builtin_abs),
    ("min", builtin_min),
    ("max", builtin_max),
    ("sum", builtin_sum),
    ("int", builtin_int),
    ("float", builtin_float),
    ("str", builtin_str),
    ("repr", builtin_repr),
    ("bool", builtin_bool),
    ("list", builtin_list),
    ("tuple", builtin_tuple),
    ("iter", builtin_iter),
    ("next", builtin_next),
    ("isinstance", builtin_isinstance),
];

/// A fresh builtins namespace with every builtin function and exception type
pub fn builtins_namespace() -> Arc<Namespace> {
    let ns = Namespace::new();
    for &(name, func) in FUNCTIONS {
        ns.set(name, Value::builtin(name, func));
    }
    for kind in ExceptionKind::ALL {
        ns.set(kind.name(), Value::ExcType(kind));
    }
    ns
}

/// Method `name` of a builtin-typed receiver, unbound
pub fn method(receiver: &Value, name: &str) -> Option<Value> {
    let (name, func): (&'static str, BuiltinFn) = match (receiver, name) {
        (Value::List(_), "append") => ("append", list_append),
        (Value::List(_), "pop") => ("pop", list_pop),
        (Value::List(_), "extend") => ("extend", list_extend),
        (Value::Dict(_), "get") => ("get", dict_get),
        (Value::Dict(_), "keys") => ("keys", dict_keys),
        (Value::Dict(_), "values") => ("values", dict_values),
        (Value::Dict(_), "items") => ("items", dict_items),
        (Value::Str(_), "join") => ("join", str_join),
        (Value::Generator(_), "send") => ("send", gen_send),
        (Value::Generator(_), "next") => ("next", gen_next),
        (Value::Generator(_), "throw") => ("throw", gen_throw),
        (Value::Generator(_), "close") => ("close", gen_close),
        _ => return None,
    };
    Some(Value::builtin(name, func))
}

// =============================================================================
// Argument helpers
// =============================================================================

fn arity(name: &str, args: &[Value], min: usize, max: usize) -> VmResult<()> {
    if args.len() >= min && args.len() <= max {
        return Ok(());
    }
    let expected = if min == max {
        format!("exactly {}", min)
    } else if args.len() < min {
        format!("at least {}", min)
    } else {
        format!("at most {}", max)
    };
    Err(VmError::raise(
        ExceptionKind::TypeError,
        format!(
            "{}() takes {} argument{} ({} given)",
            name,
            expected,
            if min == max && min == 1 { "" } else { "s" },
            args.len()
        ),
    ))
}

fn int_arg(name: &str, v: &Value) -> VmResult<i64> {
    v.as_int().ok_or_else(|| {
        VmError::raise(
            ExceptionKind::TypeError,
            format!("{}() integer argument expected, got {}", name, v.type_name()),
        )
    })
}

// =============================================================================
// Functions
// =============================================================================

fn builtin_len(_engine: &Engine, args: &[Value]) -> VmResult<Value> {
    arity("len", args, 1, 1)?;
    let n = match &args[0] {
        Value::Str(s) => s.chars().count(),
        Value::Tuple(t) => t.len(),
        Value::List(l) => l.lock().len(),
        Value::Dict(d) => d.lock().len(),
        other => {
            return Err(VmError::raise(
                ExceptionKind::TypeError,
                format!("object of type '{}' has no len()", other.type_name()),
            ))
        }
    };
    Ok(Value::Int(n as i64))
}

fn range_bounds(name: &str, args: &[Value]) -> VmResult<(i64, i64, i64)> {
    let (start, stop, step) = match args {
        [stop] => (0, int_arg(name, stop)?, 1),
        [start, stop] => (int_arg(name, start)?, int_arg(name, stop)?, 1),
        [start, stop, step] => (int_arg(name, start)?, int_arg(name, stop)?, int_arg(name, step)?),
        _ => return arity(name, args, 1, 3).map(|_| (0, 0, 1)),
    };
    if step == 0 {
        return Err(VmError::raise(
            ExceptionKind::ValueError,
            format!("{}() step argument must not be zero", name),
        ));
    }
    Ok((start, stop, step))
}

fn builtin_range(_engine: &Engine, args: &[Value]) -> VmResult<Value> {
    let (start, stop, step) = range_bounds("range", args)?;
    let mut it = IterState::range(start, stop, step);
    let mut items = Vec::new();
    while let Some(v) = it.next() {
        items.push(v);
    }
    Ok(Value::list(items))
}

fn builtin_xrange(_engine: &Engine, args: &[Value]) -> VmResult<Value> {
    let (start, stop, step) = range_bounds("xrange", args)?;
    Ok(Value::Iterator(Arc::new(parking_lot::Mutex::new(IterState::range(
        start, stop, step,
    )))))
}

fn builtin_abs(engine: &Engine, args: &[Value]) -> VmResult<Value> {
    arity("abs", args, 1, 1)?;
    match &args[0] {
        Value::Float(f) => Ok(Value::Float(f.abs())),
        v if v.as_int().is_some() => {
            let i = v.as_int().unwrap_or(0);
            i.checked_abs()
                .map(Value::Int)
                .ok_or_else(|| VmError::raise(ExceptionKind::OverflowError, "integer overflow"))
        }
        v => ops::unary_op(engine, ops::UnaryOp::Pos, v),
    }
}

fn extremum(engine: &Engine, name: &str, args: &[Value], want: CmpOp) -> VmResult<Value> {
    arity(name, args, 1, usize::MAX)?;
    let items = if args.len() == 1 {
        ops::collect_iterable(engine, &args[0])?
    } else {
        args.to_vec()
    };
    let mut iter = items.into_iter();
    let mut best = iter.next().ok_or_else(|| {
        VmError::raise(
            ExceptionKind::ValueError,
            format!("{}() arg is an empty sequence", name),
        )
    })?;
    for item in iter {
        if ops::compare(engine, want, &item, &best)?.is_true() {
            best = item;
        }
    }
    Ok(best)
}

fn builtin_min(engine: &Engine, args: &[Value]) -> VmResult<Value> {
    extremum(engine, "min", args, CmpOp::Lt)
}

fn builtin_max(engine: &Engine, args: &[Value]) -> VmResult<Value> {
    extremum(engine, "max", args, CmpOp::Gt)
}

fn builtin_sum(engine: &Engine, args: &[Value]) -> VmResult<Value> {
    arity("sum", args, 1, 2)?;
    let mut total = args.get(1).cloned().unwrap_or(Value::Int(0));
    for item in ops::collect_iterable(engine, &args[0])? {
        total = ops::binary_op(engine, ops::BinaryOp::Add, &total, &item)?;
    }
    Ok(total)
}

fn builtin_int(_engine: &Engine, args: &[Value]) -> VmResult<Value> {
    arity("int", args, 0, 1)?;
    let Some(v) = args.first() else {
        return Ok(Value::Int(0));
    };
    match v {
        Value::Float(f) => {
            if !f.is_finite() || f.abs() >= 9.2e18 {
                return Err(VmError::raise(
                    ExceptionKind::OverflowError,
                    "cannot convert float to integer",
                ));
            }
            Ok(Value::Int(f.trunc() as i64))
        }
        Value::Str(s) => s.trim().parse::<i64>().map(Value::Int).map_err(|_| {
            VmError::raise(
                ExceptionKind::ValueError,
                format!("invalid literal for int() with base 10: {}", v.repr()),
            )
        }),
        other => other.as_int().map(Value::Int).ok_or_else(|| {
            VmError::raise(
                ExceptionKind::TypeError,
                format!("int() argument must be a string or a number, not '{}'", other.type_name()),
            )
        }),
    }
}

fn builtin_float(_engine: &Engine, args: &[Value]) -> VmResult<Value> {
    arity("float", args, 0, 1)?;
    let Some(v) = args.first() else {
        return Ok(Value::Float(0.0));
    };
    match v {
        Value::Float(_) => Ok(v.clone()),
        Value::Str(s) => s.trim().parse::<f64>().map(Value::Float).map_err(|_| {
            VmError::raise(
                ExceptionKind::ValueError,
                format!("could not convert string to float: {}", s),
            )
        }),
        other => other.as_int().map(|i| Value::Float(i as f64)).ok_or_else(|| {
            VmError::raise(
                ExceptionKind::TypeError,
                format!("float() argument must be a string or a number, not '{}'", other.type_name()),
            )
        }),
    }
}

fn builtin_str(_engine: &Engine, args: &[Value]) -> VmResult<Value> {
    arity("str", args, 0, 1)?;
    Ok(match args.first() {
        Some(v @ Value::Str(_)) => v.clone(),
        Some(v) => Value::str(&v.to_string()),
        None => Value::str(""),
    })
}

fn builtin_repr(_engine: &Engine, args: &[Value]) -> VmResult<Value> {
    arity("repr", args, 1, 1)?;
    Ok(Value::str(&args[0].repr()))
}

fn builtin_bool(_engine: &Engine, args: &[Value]) -> VmResult<Value> {
    arity("bool", args, 0, 1)?;
    Ok(Value::Bool(args.first().is_some_and(Value::is_true)))
}

fn builtin_list(engine: &Engine, args: &[Value]) -> VmResult<Value> {
    arity("list", args, 0, 1)?;
    Ok(Value::list(match args.first() {
        Some(v) => ops::collect_iterable(engine, v)?,
        None => Vec::new(),
    }))
}

fn builtin_tuple(engine: &Engine, args: &[Value]) -> VmResult<Value> {
    arity("tuple", args, 0, 1)?;
    Ok(match args.first() {
        Some(v @ Value::Tuple(_)) => v.clone(),
        Some(v) => Value::tuple(ops::collect_iterable(engine, v)?),
        None => Value::tuple(Vec::new()),
    })
}

fn builtin_iter(engine: &Engine, args: &[Value]) -> VmResult<Value> {
    arity("iter", args, 1, 1)?;
    ops::get_iter(engine, &args[0])
}

fn builtin_next(engine: &Engine, args: &[Value]) -> VmResult<Value> {
    arity("next", args, 1, 2)?;
    match ops::iter_next(engine, &args[0])? {
        Some(v) => Ok(v),
        None => match args.get(1) {
            Some(default) => Ok(default.clone()),
            None => Err(VmError::raise(ExceptionKind::StopIteration, "")),
        },
    }
}

fn builtin_isinstance(_engine: &Engine, args: &[Value]) -> VmResult<Value> {
    arity("isinstance", args, 2, 2)?;
    fn check(obj: &Value, class: &Value) -> bool {
        match (obj, class) {
            (Value::Instance(i), Value::Class(c)) => Arc::ptr_eq(&i.class, c),
            (Value::Exception(e), Value::ExcType(k)) => e.kind.is_subclass(*k),
            (_, Value::Tuple(options)) => options.iter().any(|c| check(obj, c)),
            _ => false,
        }
    }
    Ok(Value::Bool(check(&args[0], &args[1])))
}

// =============================================================================
// Methods
// =============================================================================

fn list_append(_engine: &Engine, args: &[Value]) -> VmResult<Value> {
    arity("append", args, 2, 2)?;
    if let Value::List(l) = &args[0] {
        l.lock().push(args[1].clone());
    }
    Ok(Value::None)
}

fn list_pop(_engine: &Engine, args: &[Value]) -> VmResult<Value> {
    arity("pop", args, 1, 2)?;
    let Value::List(l) = &args[0] else {
        return Ok(Value::None);
    };
    let mut items = l.lock();
    if items.is_empty() {
        return Err(VmError::raise(ExceptionKind::IndexError, "pop from empty list"));
    }
    let index = match args.get(1) {
        Some(i) => {
            let i = int_arg("pop", i)?;
            let resolved = if i < 0 { i + items.len() as i64 } else { i };
            if resolved < 0 || resolved >= items.len() as i64 {
                return Err(VmError::raise(ExceptionKind::IndexError, "pop index out of range"));
            }
            resolved as usize
        }
        None => items.len() - 1,
    };
    Ok(items.remove(index))
}

fn list_extend(engine: &Engine, args: &[Value]) -> VmResult<Value> {
    arity("extend", args, 2, 2)?;
    let extra = ops::collect_iterable(engine, &args[1])?;
    if let Value::List(l) = &args[0] {
        l.lock().extend(extra);
    }
    Ok(Value::None)
}

fn dict_get(_engine: &Engine, args: &[Value]) -> VmResult<Value> {
    arity("get", args, 2, 3)?;
    let Value::Dict(d) = &args[0] else {
        return Ok(Value::None);
    };
    let found = d.lock().get(&args[1])?;
    Ok(found.unwrap_or_else(|| args.get(2).cloned().unwrap_or(Value::None)))
}

fn dict_keys(_engine: &Engine, args: &[Value]) -> VmResult<Value> {
    arity("keys", args, 1, 1)?;
    Ok(match &args[0] {
        Value::Dict(d) => Value::list(d.lock().keys()),
        _ => Value::list(Vec::new()),
    })
}

fn dict_values(_engine: &Engine, args: &[Value]) -> VmResult<Value> {
    arity("values", args, 1, 1)?;
    Ok(match &args[0] {
        Value::Dict(d) => Value::list(d.lock().iter().map(|(_, v)| v.clone()).collect()),
        _ => Value::list(Vec::new()),
    })
}

fn dict_items(_engine: &Engine, args: &[Value]) -> VmResult<Value> {
    arity("items", args, 1, 1)?;
    Ok(match &args[0] {
        Value::Dict(d) => Value::list(
            d.lock()
                .iter()
                .map(|(k, v)| Value::tuple(vec![k.clone(), v.clone()]))
                .collect(),
        ),
        _ => Value::list(Vec::new()),
    })
}

fn str_join(engine: &Engine, args: &[Value]) -> VmResult<Value> {
    arity("join", args, 2, 2)?;
    let Value::Str(sep) = &args[0] else {
        return Ok(Value::None);
    };
    let mut parts = Vec::new();
    for item in ops::collect_iterable(engine, &args[1])? {
        match item {
            Value::Str(s) => parts.push(s),
            other => {
                return Err(VmError::raise(
                    ExceptionKind::TypeError,
                    format!("sequence item {}: expected string, {} found", parts.len(), other.type_name()),
                ))
            }
        }
    }
    Ok(Value::str(&parts.iter().map(|s| s.as_ref()).collect::<Vec<_>>().join(sep)))
}

fn gen_send(engine: &Engine, args: &[Value]) -> VmResult<Value> {
    arity("send", args, 2, 2)?;
    match &args[0] {
        Value::Generator(g) => g.send(engine, args[1].clone()),
        _ => Ok(Value::None),
    }
}

fn gen_next(engine: &Engine, args: &[Value]) -> VmResult<Value> {
    arity("next", args, 1, 1)?;
    match &args[0] {
        Value::Generator(g) => g.send(engine, Value::None),
        _ => Ok(Value::None),
    }
}

fn gen_throw(engine: &Engine, args: &[Value]) -> VmResult<Value> {
    arity("throw", args, 2, 3)?;
    let exc = match (&args[1], args.get(2)) {
        (Value::Exception(e), _) => e.clone(),
        (Value::ExcType(kind), Some(Value::Exception(e))) if e.kind == *kind => e.clone(),
        (Value::ExcType(kind), Some(v)) => ExceptionObj::new(*kind, vec![v.clone()]),
        (Value::ExcType(kind), None) => ExceptionObj::new(*kind, Vec::new()),
        (other, _) => {
            return Err(VmError::raise(
                ExceptionKind::TypeError,
                format!(
                    "exceptions must be classes or instances, not {}",
                    other.type_name()
                ),
            ))
        }
    };
    match &args[0] {
        Value::Generator(g) => g.throw(engine, exc),
        _ => Ok(Value::None),
    }
}

fn gen_close(engine: &Engine, args: &[Value]) -> VmResult<Value> {
    arity("close", args, 1, 1)?;
    if let Value::Generator(g) = &args[0] {
        g.close(engine)?;
    }
    Ok(Value::None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, args: &[Value]) -> VmResult<Value> {
        let engine = Engine::default();
        let ns = builtins_namespace();
        match ns.get(name) {
            Some(Value::Builtin(b)) => (b.func)(&engine, args),
            other => panic!("{} is not a builtin: {:?}", name, other),
        }
    }

    #[test]
    fn test_namespace_contents() {
        let ns = builtins_namespace();
        assert!(ns.contains("len"));
        assert!(matches!(ns.get("KeyError"), Some(Value::ExcType(ExceptionKind::KeyError))));
    }

    #[test]
    fn test_len_and_range() {
        assert_eq!(call("len", &[Value::str("héllo")]).unwrap().as_int(), Some(5));
        assert_eq!(
            call("range", &[Value::Int(1), Value::Int(7), Value::Int(2)]).unwrap().to_string(),
            "[1, 3, 5]"
        );
        let err = call("range", &[Value::Int(1), Value::Int(2), Value::Int(0)]).unwrap_err();
        assert!(err.is_exception(ExceptionKind::ValueError));
        let err = call("len", &[]).unwrap_err();
        assert_eq!(
            err.exception().unwrap().message(),
            "len() takes exactly 1 argument (0 given)"
        );
    }

    #[test]
    fn test_conversions() {
        assert_eq!(call("int", &[Value::str(" 42 ")]).unwrap().as_int(), Some(42));
        assert_eq!(call("int", &[Value::Float(-2.7)]).unwrap().as_int(), Some(-2));
        assert!(call("int", &[Value::str("x")]).unwrap_err().is_exception(ExceptionKind::ValueError));
        assert_eq!(call("str", &[Value::Int(3)]).unwrap().to_string(), "3");
        assert_eq!(call("repr", &[Value::str("a")]).unwrap().to_string(), "'a'");
        assert!(!call("bool", &[Value::list(vec![])]).unwrap().is_true());
    }

    #[test]
    fn test_min_max_sum() {
        let l = Value::list(vec![Value::Int(3), Value::Int(-1), Value::Int(7)]);
        assert_eq!(call("min", &[l.clone()]).unwrap().as_int(), Some(-1));
        assert_eq!(call("max", &[Value::Int(2), Value::Int(9)]).unwrap().as_int(), Some(9));
        assert_eq!(call("sum", &[l]).unwrap().as_int(), Some(9));
        assert!(call("max", &[Value::list(vec![])]).is_err());
    }

    #[test]
    fn test_list_and_dict_methods() {
        let engine = Engine::default();
        let l = Value::list(vec![Value::Int(1)]);
        let append = method(&l, "append").unwrap();
        let Value::Builtin(append) = append else { panic!() };
        (append.func)(&engine, &[l.clone(), Value::Int(2)]).unwrap();
        assert_eq!(l.to_string(), "[1, 2]");
        assert_eq!(list_pop(&engine, &[l.clone()]).unwrap().as_int(), Some(2));
        assert!(list_pop(&engine, &[Value::list(vec![])]).is_err());

        let d = Value::dict();
        if let Value::Dict(inner) = &d {
            inner.lock().insert(Value::str("a"), Value::Int(1)).unwrap();
        }
        assert_eq!(dict_get(&engine, &[d.clone(), Value::str("a")]).unwrap().as_int(), Some(1));
        assert!(dict_get(&engine, &[d.clone(), Value::str("b")]).unwrap().is_none());
        assert_eq!(dict_items(&engine, &[d]).unwrap().to_string(), "[('a', 1)]");
        assert!(method(&Value::Int(1), "append").is_none());
    }

    #[test]
    fn test_next_with_default() {
        let it = call("iter", &[Value::list(vec![])]).unwrap();
        assert_eq!(call("next", &[it.clone(), Value::Int(0)]).unwrap().as_int(), Some(0));
        assert!(call("next", &[it]).unwrap_err().is_exception(ExceptionKind::StopIteration));
    }
}
