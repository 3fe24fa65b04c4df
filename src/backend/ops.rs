//! Polymorphic operations over values
//!
//! Operators are a closed set of tagged operations. Each binary operation
//! dispatches in a fixed order: the left operand's slot, then the right
//! operand's reflected slot, then (for augmented assignment) the in-place
//! slot is tried before both. A slot that does not handle its operand types
//! answers `NotImplemented` and dispatch moves on.
//!
//! Builtin types implement their slots here directly; instances of guest
//! classes implement them with `__add__`, `__radd__`, `__iadd__` and friends.
//!
//! Integers are 64-bit. Results that do not fit raise `OverflowError`.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::bytecode::opcodes::CmpOp;
use crate::backend::bytecode::vm::{call_value, VmError, VmResult};
use crate::backend::object::{BoundMethod, ExceptionKind, IterState, Slice, Value};
use crate::engine::Engine;

// =============================================================================
// Operation kinds
// =============================================================================

/// Binary operations, including subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    TrueDiv,
    FloorDiv,
    Mod,
    Pow,
    LShift,
    RShift,
    And,
    Or,
    Xor,
    GetItem,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::TrueDiv => "/",
            BinaryOp::FloorDiv => "//",
            BinaryOp::Mod => "%",
            BinaryOp::Pow => "** or pow()",
            BinaryOp::LShift => "<<",
            BinaryOp::RShift => ">>",
            BinaryOp::And => "&",
            BinaryOp::Or => "|",
            BinaryOp::Xor => "^",
            BinaryOp::GetItem => "[]",
        }
    }

    /// Left-operand special method
    pub fn dunder(self) -> &'static str {
        match self {
            BinaryOp::Add => "__add__",
            BinaryOp::Sub => "__sub__",
            BinaryOp::Mul => "__mul__",
            BinaryOp::TrueDiv => "__truediv__",
            BinaryOp::FloorDiv => "__floordiv__",
            BinaryOp::Mod => "__mod__",
            BinaryOp::Pow => "__pow__",
            BinaryOp::LShift => "__lshift__",
            BinaryOp::RShift => "__rshift__",
            BinaryOp::And => "__and__",
            BinaryOp::Or => "__or__",
            BinaryOp::Xor => "__xor__",
            BinaryOp::GetItem => "__getitem__",
        }
    }

    /// Right-operand (reflected) special method
    pub fn reflected_dunder(self) -> Option<&'static str> {
        Some(match self {
            BinaryOp::Add => "__radd__",
            BinaryOp::Sub => "__rsub__",
            BinaryOp::Mul => "__rmul__",
            BinaryOp::TrueDiv => "__rtruediv__",
            BinaryOp::FloorDiv => "__rfloordiv__",
            BinaryOp::Mod => "__rmod__",
            BinaryOp::Pow => "__rpow__",
            BinaryOp::LShift => "__rlshift__",
            BinaryOp::RShift => "__rrshift__",
            BinaryOp::And => "__rand__",
            BinaryOp::Or => "__ror__",
            BinaryOp::Xor => "__rxor__",
            BinaryOp::GetItem => return None,
        })
    }

    /// In-place special method
    pub fn inplace_dunder(self) -> Option<&'static str> {
        Some(match self {
            BinaryOp::Add => "__iadd__",
            BinaryOp::Sub => "__isub__",
            BinaryOp::Mul => "__imul__",
            BinaryOp::TrueDiv => "__itruediv__",
            BinaryOp::FloorDiv => "__ifloordiv__",
            BinaryOp::Mod => "__imod__",
            BinaryOp::Pow => "__ipow__",
            BinaryOp::LShift => "__ilshift__",
            BinaryOp::RShift => "__irshift__",
            BinaryOp::And => "__iand__",
            BinaryOp::Or => "__ior__",
            BinaryOp::Xor => "__ixor__",
            BinaryOp::GetItem => return None,
        })
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Unary operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Pos,
    Neg,
    Not,
    Invert,
}

impl UnaryOp {
    pub fn dunder(self) -> Option<&'static str> {
        match self {
            UnaryOp::Pos => Some("__pos__"),
            UnaryOp::Neg => Some("__neg__"),
            UnaryOp::Invert => Some("__invert__"),
            UnaryOp::Not => None,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            UnaryOp::Pos => "unary +",
            UnaryOp::Neg => "unary -",
            UnaryOp::Not => "not",
            UnaryOp::Invert => "unary ~",
        }
    }
}

// =============================================================================
// Error helpers
// =============================================================================

fn overflow() -> VmError {
    VmError::raise(ExceptionKind::OverflowError, "integer overflow")
}

fn zero_division(msg: &str) -> VmError {
    VmError::raise(ExceptionKind::ZeroDivisionError, msg)
}

fn type_error(msg: String) -> VmError {
    VmError::raise(ExceptionKind::TypeError, msg)
}

// =============================================================================
// Integer kernels
// =============================================================================

/// Integer arithmetic shared by the interpreter and native fast paths
///
/// Returns `Ok(None)` for operations that do not stay in the integers
/// (true division, negative powers).
pub fn int_binary(op: BinaryOp, a: i64, b: i64) -> VmResult<Option<i64>> {
    Ok(Some(match op {
        BinaryOp::Add => a.checked_add(b).ok_or_else(overflow)?,
        BinaryOp::Sub => a.checked_sub(b).ok_or_else(overflow)?,
        BinaryOp::Mul => a.checked_mul(b).ok_or_else(overflow)?,
        BinaryOp::FloorDiv => {
            if b == 0 {
                return Err(zero_division("integer division or modulo by zero"));
            }
            let q = a.checked_div(b).ok_or_else(overflow)?;
            if (a % b != 0) && ((a < 0) != (b < 0)) {
                q - 1
            } else {
                q
            }
        }
        BinaryOp::Mod => {
            if b == 0 {
                return Err(zero_division("integer division or modulo by zero"));
            }
            let r = a.checked_rem(b).unwrap_or(0);
            if r != 0 && ((r < 0) != (b < 0)) {
                r + b
            } else {
                r
            }
        }
        BinaryOp::Pow => {
            if b < 0 {
                return Ok(None);
            }
            let exp = u32::try_from(b).map_err(|_| overflow())?;
            a.checked_pow(exp).ok_or_else(overflow)?
        }
        BinaryOp::LShift => {
            if b < 0 {
                return Err(VmError::raise(ExceptionKind::ValueError, "negative shift count"));
            }
            if a == 0 {
                0
            } else if b >= 63 {
                return Err(overflow());
            } else {
                let r = a << b;
                if r >> b != a {
                    return Err(overflow());
                }
                r
            }
        }
        BinaryOp::RShift => {
            if b < 0 {
                return Err(VmError::raise(ExceptionKind::ValueError, "negative shift count"));
            }
            a >> b.min(63)
        }
        BinaryOp::And => a & b,
        BinaryOp::Or => a | b,
        BinaryOp::Xor => a ^ b,
        BinaryOp::TrueDiv | BinaryOp::GetItem => return Ok(None),
    }))
}

fn float_binary(op: BinaryOp, a: f64, b: f64) -> VmResult<Value> {
    Ok(Value::Float(match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::TrueDiv => {
            if b == 0.0 {
                return Err(zero_division("float division by zero"));
            }
            a / b
        }
        BinaryOp::FloorDiv => {
            if b == 0.0 {
                return Err(zero_division("float divmod()"));
            }
            (a / b).floor()
        }
        BinaryOp::Mod => {
            if b == 0.0 {
                return Err(zero_division("float modulo"));
            }
            let r = a % b;
            if r != 0.0 && ((r < 0.0) != (b < 0.0)) {
                r + b
            } else {
                r
            }
        }
        BinaryOp::Pow => a.powf(b),
        _ => return Ok(Value::NotImplemented),
    }))
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Float(f) => Some(*f),
        other => other.as_int().map(|i| i as f64),
    }
}

fn repeat_count(v: &Value) -> Option<usize> {
    v.as_int().map(|n| n.max(0) as usize)
}

// =============================================================================
// Binary dispatch
// =============================================================================

/// Builtin slot for a binary operation; `NotImplemented` when the operand
/// types are not handled
fn builtin_binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> VmResult<Value> {
    if op == BinaryOp::GetItem {
        return getitem_builtin(lhs, rhs);
    }
    if let (Some(a), Some(b)) = (lhs.as_int(), rhs.as_int()) {
        if let Some(r) = int_binary(op, a, b)? {
            return Ok(Value::Int(r));
        }
        if op == BinaryOp::TrueDiv && b == 0 {
            return Err(zero_division("integer division or modulo by zero"));
        }
        return float_binary(op, a as f64, b as f64);
    }
    let is_float = matches!(lhs, Value::Float(_)) || matches!(rhs, Value::Float(_));
    if is_float {
        if let (Some(a), Some(b)) = (as_number(lhs), as_number(rhs)) {
            return float_binary(op, a, b);
        }
    }
    Ok(match (op, lhs, rhs) {
        (BinaryOp::Add, Value::Str(a), Value::Str(b)) => {
            let mut s = String::with_capacity(a.len() + b.len());
            s.push_str(a);
            s.push_str(b);
            Value::str(&s)
        }
        (BinaryOp::Add, Value::List(a), Value::List(b)) => {
            let mut items = a.lock().clone();
            items.extend(b.lock().iter().cloned());
            Value::list(items)
        }
        (BinaryOp::Add, Value::Tuple(a), Value::Tuple(b)) => {
            Value::tuple(a.iter().chain(b.iter()).cloned().collect())
        }
        (BinaryOp::Mul, Value::Str(s), n) | (BinaryOp::Mul, n, Value::Str(s))
            if repeat_count(n).is_some() =>
        {
            Value::str(&s.repeat(repeat_count(n).unwrap_or(0)))
        }
        (BinaryOp::Mul, Value::List(l), n) | (BinaryOp::Mul, n, Value::List(l))
            if repeat_count(n).is_some() =>
        {
            let items = l.lock().clone();
            let count = repeat_count(n).unwrap_or(0);
            Value::list(items.iter().cloned().cycle().take(items.len() * count).collect())
        }
        (BinaryOp::Mul, Value::Tuple(t), n) | (BinaryOp::Mul, n, Value::Tuple(t))
            if repeat_count(n).is_some() =>
        {
            let count = repeat_count(n).unwrap_or(0);
            Value::tuple(t.iter().cloned().cycle().take(t.len() * count).collect())
        }
        _ => Value::NotImplemented,
    })
}

/// Call a special method on an instance operand, if it defines one
fn call_special(engine: &Engine, receiver: &Value, name: &str, args: Vec<Value>) -> VmResult<Value> {
    match receiver {
        Value::Instance(inst) => match inst.special(name) {
            Some(method) => call_value(engine, &method, args, Vec::new()),
            None => Ok(Value::NotImplemented),
        },
        _ => Ok(Value::NotImplemented),
    }
}

/// `lhs <op> rhs`
pub fn binary_op(engine: &Engine, op: BinaryOp, lhs: &Value, rhs: &Value) -> VmResult<Value> {
    // Left operand's slot.
    let result = match lhs {
        Value::Instance(_) => call_special(engine, lhs, op.dunder(), vec![rhs.clone()])?,
        _ => builtin_binary(op, lhs, rhs)?,
    };
    if !matches!(result, Value::NotImplemented) {
        return Ok(result);
    }

    // Right operand's reflected slot.
    if let (Value::Instance(_), Some(name)) = (rhs, op.reflected_dunder()) {
        let result = call_special(engine, rhs, name, vec![lhs.clone()])?;
        if !matches!(result, Value::NotImplemented) {
            return Ok(result);
        }
    }

    if op == BinaryOp::GetItem {
        return Err(type_error(format!(
            "'{}' object is unsubscriptable",
            lhs.type_name()
        )));
    }
    Err(type_error(format!(
        "unsupported operand type(s) for {}: '{}' and '{}'",
        op.symbol(),
        lhs.type_name(),
        rhs.type_name()
    )))
}

/// `lhs <op>= rhs`
///
/// Lists extend in place; everything else falls back to [`binary_op`].
pub fn inplace_op(engine: &Engine, op: BinaryOp, lhs: &Value, rhs: &Value) -> VmResult<Value> {
    match (op, lhs) {
        (BinaryOp::Add, Value::List(l)) => {
            let extra = collect_iterable(engine, rhs)?;
            l.lock().extend(extra);
            return Ok(lhs.clone());
        }
        (_, Value::Instance(_)) => {
            if let Some(name) = op.inplace_dunder() {
                let result = call_special(engine, lhs, name, vec![rhs.clone()])?;
                if !matches!(result, Value::NotImplemented) {
                    return Ok(result);
                }
            }
        }
        _ => {}
    }
    binary_op(engine, op, lhs, rhs)
}

/// Unary operators
pub fn unary_op(engine: &Engine, op: UnaryOp, value: &Value) -> VmResult<Value> {
    if op == UnaryOp::Not {
        return Ok(Value::Bool(!value.is_true()));
    }
    let result = match (op, value) {
        (UnaryOp::Pos, Value::Bool(b)) => Value::Int(*b as i64),
        (UnaryOp::Pos, Value::Int(_) | Value::Float(_)) => value.clone(),
        (UnaryOp::Neg, Value::Float(f)) => Value::Float(-f),
        (UnaryOp::Neg, v) if v.as_int().is_some() => {
            Value::Int(v.as_int().unwrap_or(0).checked_neg().ok_or_else(overflow)?)
        }
        (UnaryOp::Invert, v) if v.as_int().is_some() => Value::Int(!v.as_int().unwrap_or(0)),
        (_, Value::Instance(_)) => match op.dunder() {
            Some(name) => call_special(engine, value, name, Vec::new())?,
            None => Value::NotImplemented,
        },
        _ => Value::NotImplemented,
    };
    if matches!(result, Value::NotImplemented) {
        return Err(type_error(format!(
            "bad operand type for {}: '{}'",
            op.symbol(),
            value.type_name()
        )));
    }
    Ok(result)
}

// =============================================================================
// Comparison
// =============================================================================

/// Structural equality
pub fn values_equal(engine: &Engine, a: &Value, b: &Value) -> VmResult<bool> {
    Ok(match (a, b) {
        (Value::Float(_), _) | (_, Value::Float(_)) => match (as_number(a), as_number(b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
        (Value::Int(_) | Value::Bool(_), Value::Int(_) | Value::Bool(_)) => a.as_int() == b.as_int(),
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Tuple(x), Value::Tuple(y)) => seq_equal(engine, x, y)?,
        (Value::List(x), Value::List(y)) => {
            if Arc::ptr_eq(x, y) {
                return Ok(true);
            }
            let (x, y) = (x.lock().clone(), y.lock().clone());
            seq_equal(engine, &x, &y)?
        }
        (Value::Dict(x), Value::Dict(y)) => {
            if Arc::ptr_eq(x, y) {
                return Ok(true);
            }
            let (x, y) = (x.lock().clone(), y.lock().clone());
            if x.len() != y.len() {
                return Ok(false);
            }
            for (k, v) in x.iter() {
                match y.get(k)? {
                    Some(other) if values_equal(engine, v, &other)? => {}
                    _ => return Ok(false),
                }
            }
            true
        }
        (Value::Instance(_), _) => {
            let r = call_special(engine, a, "__eq__", vec![b.clone()])?;
            match r {
                Value::NotImplemented => a.is_same(b),
                other => other.is_true(),
            }
        }
        (Value::Exception(x), Value::Exception(y)) => Arc::ptr_eq(x, y),
        _ => a.is_same(b),
    })
}

fn seq_equal(engine: &Engine, x: &[Value], y: &[Value]) -> VmResult<bool> {
    if x.len() != y.len() {
        return Ok(false);
    }
    for (a, b) in x.iter().zip(y) {
        if !values_equal(engine, a, b)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn ordering(engine: &Engine, a: &Value, b: &Value) -> VmResult<std::cmp::Ordering> {
    use std::cmp::Ordering;
    if let (Some(x), Some(y)) = (a.as_int(), b.as_int()) {
        return Ok(x.cmp(&y));
    }
    if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
        return x.partial_cmp(&y).ok_or_else(|| {
            VmError::raise(ExceptionKind::ValueError, "cannot order NaN")
        });
    }
    let seq_cmp = |x: &[Value], y: &[Value]| -> VmResult<Ordering> {
        for (p, q) in x.iter().zip(y) {
            if !values_equal(engine, p, q)? {
                return ordering(engine, p, q);
            }
        }
        Ok(x.len().cmp(&y.len()))
    };
    match (a, b) {
        (Value::Str(x), Value::Str(y)) => Ok(x.cmp(y)),
        (Value::Tuple(x), Value::Tuple(y)) => seq_cmp(x, y),
        (Value::List(x), Value::List(y)) => {
            let (x, y) = (x.lock().clone(), y.lock().clone());
            seq_cmp(&x, &y)
        }
        _ => Err(type_error(format!(
            "unorderable types: {}() and {}()",
            a.type_name(),
            b.type_name()
        ))),
    }
}

/// `COMPARE_OP`
pub fn compare(engine: &Engine, op: CmpOp, a: &Value, b: &Value) -> VmResult<Value> {
    use std::cmp::Ordering::*;
    let result = match op {
        CmpOp::Eq => values_equal(engine, a, b)?,
        CmpOp::Ne => !values_equal(engine, a, b)?,
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
            if let Value::Instance(_) = a {
                let name = match op {
                    CmpOp::Lt => "__lt__",
                    CmpOp::Le => "__le__",
                    CmpOp::Gt => "__gt__",
                    _ => "__ge__",
                };
                let r = call_special(engine, a, name, vec![b.clone()])?;
                if !matches!(r, Value::NotImplemented) {
                    return Ok(r);
                }
            }
            let ord = ordering(engine, a, b)?;
            match op {
                CmpOp::Lt => ord == Less,
                CmpOp::Le => ord != Greater,
                CmpOp::Gt => ord == Greater,
                _ => ord != Less,
            }
        }
        CmpOp::In => contains(engine, b, a)?,
        CmpOp::NotIn => !contains(engine, b, a)?,
        CmpOp::Is => a.is_same(b),
        CmpOp::IsNot => !a.is_same(b),
        CmpOp::ExcMatch => exception_matches(a, b)?,
    };
    Ok(Value::Bool(result))
}

/// Whether the raised value `exc` is caught by `handler`, which is an
/// exception class or a tuple of them
pub fn exception_matches(exc: &Value, handler: &Value) -> VmResult<bool> {
    let kind = match exc {
        Value::ExcType(k) => *k,
        Value::Exception(e) => e.kind,
        _ => return Ok(false),
    };
    match handler {
        Value::ExcType(h) => Ok(kind.is_subclass(*h)),
        Value::Tuple(items) => {
            for item in items.iter() {
                if exception_matches(exc, item)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        other => Err(type_error(format!(
            "catching '{}' that does not inherit from BaseException is not allowed",
            other.type_name()
        ))),
    }
}

/// `item in container`
pub fn contains(engine: &Engine, container: &Value, item: &Value) -> VmResult<bool> {
    match container {
        Value::List(l) => {
            let items = l.lock().clone();
            any_equal(engine, &items, item)
        }
        Value::Tuple(t) => any_equal(engine, t, item),
        Value::Str(s) => match item {
            Value::Str(sub) => Ok(s.contains(sub.as_ref())),
            other => Err(type_error(format!(
                "'in <string>' requires string as left operand, not {}",
                other.type_name()
            ))),
        },
        Value::Dict(d) => d.lock().contains(item),
        Value::Instance(_) => {
            let r = call_special(engine, container, "__contains__", vec![item.clone()])?;
            match r {
                Value::NotImplemented => Err(type_error(format!(
                    "argument of type '{}' is not iterable",
                    container.type_name()
                ))),
                other => Ok(other.is_true()),
            }
        }
        other => Err(type_error(format!(
            "argument of type '{}' is not iterable",
            other.type_name()
        ))),
    }
}

fn any_equal(engine: &Engine, items: &[Value], item: &Value) -> VmResult<bool> {
    for candidate in items {
        if values_equal(engine, candidate, item)? {
            return Ok(true);
        }
    }
    Ok(false)
}

// =============================================================================
// Subscription
// =============================================================================

fn normalize_index(index: &Value, len: usize, what: &str) -> VmResult<usize> {
    let i = index.as_int().ok_or_else(|| {
        type_error(format!("{} indices must be integers, not {}", what, index.type_name()))
    })?;
    let resolved = if i < 0 { i + len as i64 } else { i };
    if resolved < 0 || resolved >= len as i64 {
        return Err(VmError::raise(
            ExceptionKind::IndexError,
            format!("{} index out of range", what),
        ));
    }
    Ok(resolved as usize)
}

/// `(start, step, count)` of `slice` over a sequence of `len` items
///
/// Bounds are clamped the way sequence slicing clamps them, so every
/// resulting position is in range.
fn slice_indices(slice: &Slice, len: usize) -> VmResult<(i64, i64, usize)> {
    let bound = |v: &Value| -> VmResult<Option<i64>> {
        match v {
            Value::None => Ok(None),
            other => other
                .as_int()
                .map(Some)
                .ok_or_else(|| type_error("slice indices must be integers or None".to_string())),
        }
    };
    let len = len as i64;
    let step = bound(&slice.step)?.unwrap_or(1).max(-i64::MAX);
    if step == 0 {
        return Err(VmError::raise(ExceptionKind::ValueError, "slice step cannot be zero"));
    }
    let (low, high) = if step < 0 { (-1, len - 1) } else { (0, len) };
    let clamp = |i: Option<i64>, default: i64| match i {
        None => default,
        Some(i) if i < 0 => i.saturating_add(len).max(low),
        Some(i) => i.min(high),
    };
    let start = clamp(bound(&slice.start)?, if step < 0 { high } else { low });
    let stop = clamp(bound(&slice.stop)?, if step < 0 { low } else { high });
    let count = match step {
        s if s < 0 && stop < start => (start - stop - 1) / -s + 1,
        s if s > 0 && start < stop => (stop - start - 1) / s + 1,
        _ => 0,
    };
    Ok((start, step, count as usize))
}

/// Positions selected by `slice`, in slice order
fn slice_positions(slice: &Slice, len: usize) -> VmResult<impl Iterator<Item = usize>> {
    let (start, step, count) = slice_indices(slice, len)?;
    Ok((0..count as i64).map(move |k| (start + k * step) as usize))
}

fn getslice_builtin(container: &Value, slice: &Slice) -> VmResult<Value> {
    let pick = |items: &[Value]| -> VmResult<Vec<Value>> {
        Ok(slice_positions(slice, items.len())?
            .map(|i| items[i].clone())
            .collect())
    };
    Ok(match container {
        Value::List(l) => Value::list(pick(l.lock().as_slice())?),
        Value::Tuple(t) => Value::tuple(pick(&t[..])?),
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let out: String = slice_positions(slice, chars.len())?.map(|i| chars[i]).collect();
            Value::str(&out)
        }
        _ => Value::NotImplemented,
    })
}

/// `list[slice] = value`
fn assign_slice(
    engine: &Engine,
    list: &Mutex<Vec<Value>>,
    slice: &Slice,
    value: &Value,
) -> VmResult<()> {
    let new = collect_iterable(engine, value)?;
    let mut items = list.lock();
    let (start, step, count) = slice_indices(slice, items.len())?;
    if step == 1 {
        let start = start as usize;
        items.splice(start..start + count, new);
        return Ok(());
    }
    if new.len() != count {
        return Err(VmError::raise(
            ExceptionKind::ValueError,
            format!(
                "attempt to assign sequence of size {} to extended slice of size {}",
                new.len(),
                count
            ),
        ));
    }
    for (k, v) in new.into_iter().enumerate() {
        items[(start + k as i64 * step) as usize] = v;
    }
    Ok(())
}

/// `del list[slice]`
fn delete_slice(list: &Mutex<Vec<Value>>, slice: &Slice) -> VmResult<()> {
    let mut items = list.lock();
    let mut doomed: Vec<usize> = slice_positions(slice, items.len())?.collect();
    doomed.sort_unstable();
    for i in doomed.into_iter().rev() {
        items.remove(i);
    }
    Ok(())
}

fn getitem_builtin(container: &Value, index: &Value) -> VmResult<Value> {
    if let (Value::Slice(slice), Value::List(_) | Value::Tuple(_) | Value::Str(_)) =
        (index, container)
    {
        return getslice_builtin(container, slice);
    }
    Ok(match container {
        Value::List(l) => {
            let items = l.lock();
            let i = normalize_index(index, items.len(), "list")?;
            items[i].clone()
        }
        Value::Tuple(t) => t[normalize_index(index, t.len(), "tuple")?].clone(),
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let i = normalize_index(index, chars.len(), "string")?;
            let mut buf = [0u8; 4];
            Value::str(chars[i].encode_utf8(&mut buf))
        }
        Value::Dict(d) => match d.lock().get(index)? {
            Some(v) => v,
            None => {
                return Err(VmError::Raised(
                    crate::backend::object::ExceptionObj::new(
                        ExceptionKind::KeyError,
                        vec![index.clone()],
                    ),
                ))
            }
        },
        _ => Value::NotImplemented,
    })
}

/// `container[index] = value`
pub fn setitem(engine: &Engine, container: &Value, index: &Value, value: Value) -> VmResult<()> {
    if let (Value::List(l), Value::Slice(slice)) = (container, index) {
        return assign_slice(engine, l, slice, &value);
    }
    match container {
        Value::List(l) => {
            let mut items = l.lock();
            let i = normalize_index(index, items.len(), "list assignment")?;
            items[i] = value;
            Ok(())
        }
        Value::Dict(d) => d.lock().insert(index.clone(), value),
        Value::Instance(_) => {
            match call_special(engine, container, "__setitem__", vec![index.clone(), value])? {
                Value::NotImplemented => Err(type_error(format!(
                    "'{}' object does not support item assignment",
                    container.type_name()
                ))),
                _ => Ok(()),
            }
        }
        other => Err(type_error(format!(
            "'{}' object does not support item assignment",
            other.type_name()
        ))),
    }
}

/// `del container[index]`
pub fn delitem(engine: &Engine, container: &Value, index: &Value) -> VmResult<()> {
    if let (Value::List(l), Value::Slice(slice)) = (container, index) {
        return delete_slice(l, slice);
    }
    match container {
        Value::List(l) => {
            let mut items = l.lock();
            let i = normalize_index(index, items.len(), "list assignment")?;
            items.remove(i);
            Ok(())
        }
        Value::Dict(d) => match d.lock().remove(index)? {
            Some(_) => Ok(()),
            None => Err(VmError::Raised(crate::backend::object::ExceptionObj::new(
                ExceptionKind::KeyError,
                vec![index.clone()],
            ))),
        },
        Value::Instance(_) => {
            match call_special(engine, container, "__delitem__", vec![index.clone()])? {
                Value::NotImplemented => Err(type_error(format!(
                    "'{}' object does not support item deletion",
                    container.type_name()
                ))),
                _ => Ok(()),
            }
        }
        other => Err(type_error(format!(
            "'{}' object does not support item deletion",
            other.type_name()
        ))),
    }
}

// =============================================================================
// Attributes
// =============================================================================

fn no_attribute(obj: &Value, name: &str) -> VmError {
    let owner = match obj {
        Value::Instance(i) => format!("{} instance", i.class.name),
        Value::Class(c) => format!("class {}", c.name),
        other => format!("'{}' object", other.type_name()),
    };
    VmError::raise(
        ExceptionKind::AttributeError,
        format!("{} has no attribute '{}'", owner, name),
    )
}

fn bind(receiver: &Value, func: Value) -> Value {
    Value::Method(Arc::new(BoundMethod {
        receiver: receiver.clone(),
        func,
    }))
}

/// `obj.name`
pub fn getattr(engine: &Engine, obj: &Value, name: &str) -> VmResult<Value> {
    match obj {
        Value::Instance(inst) => {
            if let Some(v) = inst.get_own(name) {
                return Ok(v);
            }
            match inst.class.get_attr(name) {
                Some(f @ (Value::Function(_) | Value::Builtin(_))) => Ok(bind(obj, f)),
                Some(other) => Ok(other),
                None => match inst.class.get_attr("__getattr__") {
                    Some(hook) => call_value(
                        engine,
                        &bind(obj, hook),
                        vec![Value::str(name)],
                        Vec::new(),
                    ),
                    None => Err(no_attribute(obj, name)),
                },
            }
        }
        Value::Class(class) => class.get_attr(name).ok_or_else(|| no_attribute(obj, name)),
        Value::Exception(exc) => match name {
            "args" => Ok(Value::tuple(exc.args.clone())),
            "message" => Ok(Value::str(&exc.message())),
            _ => Err(no_attribute(obj, name)),
        },
        Value::Function(f) => match name {
            "__name__" => Ok(Value::str(&f.name)),
            "__code__" | "func_code" => Ok(Value::Code(f.code.clone())),
            _ => Err(no_attribute(obj, name)),
        },
        _ => match crate::backend::builtins::method(obj, name) {
            Some(func) => Ok(bind(obj, func)),
            None => Err(no_attribute(obj, name)),
        },
    }
}

/// `obj.name = value`
pub fn setattr(obj: &Value, name: &str, value: Value) -> VmResult<()> {
    match obj {
        Value::Instance(inst) => {
            inst.set_attr(name, value);
            Ok(())
        }
        Value::Class(class) => {
            class.set_attr(name, value);
            Ok(())
        }
        other => Err(no_attribute(other, name)),
    }
}

/// `del obj.name`
pub fn delattr(obj: &Value, name: &str) -> VmResult<()> {
    let removed = match obj {
        Value::Instance(inst) => inst.remove_attr(name),
        Value::Class(class) => class.remove_attr(name),
        _ => None,
    };
    removed.map(|_| ()).ok_or_else(|| no_attribute(obj, name))
}

// =============================================================================
// Iteration
// =============================================================================

/// `iter(value)`
pub fn get_iter(engine: &Engine, value: &Value) -> VmResult<Value> {
    let state = match value {
        Value::List(l) => IterState::List {
            list: l.clone(),
            index: 0,
        },
        Value::Tuple(t) => IterState::Tuple {
            items: t.clone(),
            index: 0,
        },
        Value::Str(s) => IterState::Str {
            chars: s.chars().collect(),
            index: 0,
        },
        Value::Dict(d) => IterState::Values {
            items: d.lock().keys(),
            index: 0,
        },
        Value::Iterator(_) | Value::Generator(_) => return Ok(value.clone()),
        Value::Instance(_) => {
            return match call_special(engine, value, "__iter__", Vec::new())? {
                Value::NotImplemented => Err(not_iterable(value)),
                it => Ok(it),
            }
        }
        other => return Err(not_iterable(other)),
    };
    Ok(Value::Iterator(Arc::new(Mutex::new(state))))
}

fn not_iterable(value: &Value) -> VmError {
    type_error(format!("'{}' object is not iterable", value.type_name()))
}

/// Advance an iterator; `None` when it is exhausted
pub fn iter_next(engine: &Engine, iter: &Value) -> VmResult<Option<Value>> {
    let result = match iter {
        Value::Iterator(state) => return Ok(state.lock().next()),
        Value::Generator(gen) => gen.send(engine, Value::None),
        Value::Instance(_) => match call_special(engine, iter, "next", Vec::new()) {
            Ok(Value::NotImplemented) => {
                return Err(type_error(format!(
                    "'{}' object is not an iterator",
                    iter.type_name()
                )))
            }
            other => other,
        },
        other => {
            return Err(type_error(format!(
                "'{}' object is not an iterator",
                other.type_name()
            )))
        }
    };
    match result {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.is_exception(ExceptionKind::StopIteration) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Drain any iterable into a vector
pub fn collect_iterable(engine: &Engine, value: &Value) -> VmResult<Vec<Value>> {
    match value {
        Value::List(l) => return Ok(l.lock().clone()),
        Value::Tuple(t) => return Ok(t.to_vec()),
        _ => {}
    }
    let iter = get_iter(engine, value)?;
    let mut out = Vec::new();
    while let Some(v) = iter_next(engine, &iter)? {
        out.push(v);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::object::Class;

    fn engine() -> Engine {
        Engine::default()
    }

    #[test]
    fn test_int_arithmetic_follows_floor_semantics() {
        assert_eq!(int_binary(BinaryOp::FloorDiv, -7, 2).unwrap(), Some(-4));
        assert_eq!(int_binary(BinaryOp::Mod, -7, 2).unwrap(), Some(1));
        assert_eq!(int_binary(BinaryOp::Mod, 7, -2).unwrap(), Some(-1));
        assert_eq!(int_binary(BinaryOp::Pow, 2, 10).unwrap(), Some(1024));
        assert_eq!(int_binary(BinaryOp::Pow, 2, -1).unwrap(), None);
        assert_eq!(int_binary(BinaryOp::LShift, 1, 4).unwrap(), Some(16));
    }

    #[test]
    fn test_int_overflow_raises() {
        let e = int_binary(BinaryOp::Add, i64::MAX, 1).unwrap_err();
        assert!(e.is_exception(ExceptionKind::OverflowError));
        let e = int_binary(BinaryOp::Mul, i64::MAX, 2).unwrap_err();
        assert!(e.is_exception(ExceptionKind::OverflowError));
        let e = int_binary(BinaryOp::LShift, 1, 63).unwrap_err();
        assert!(e.is_exception(ExceptionKind::OverflowError));
    }

    #[test]
    fn test_mixed_numeric() {
        let e = engine();
        let r = binary_op(&e, BinaryOp::Add, &Value::Int(1), &Value::Float(0.5)).unwrap();
        assert_eq!(r.to_string(), "1.5");
        let r = binary_op(&e, BinaryOp::TrueDiv, &Value::Int(1), &Value::Int(2)).unwrap();
        assert_eq!(r.to_string(), "0.5");
        let err = binary_op(&e, BinaryOp::TrueDiv, &Value::Int(1), &Value::Int(0)).unwrap_err();
        assert!(err.is_exception(ExceptionKind::ZeroDivisionError));
    }

    #[test]
    fn test_sequences() {
        let e = engine();
        let r = binary_op(&e, BinaryOp::Add, &Value::str("ab"), &Value::str("c")).unwrap();
        assert_eq!(r.to_string(), "abc");
        let r = binary_op(&e, BinaryOp::Mul, &Value::Int(2), &Value::str("ab")).unwrap();
        assert_eq!(r.to_string(), "abab");
        let l = Value::list(vec![Value::Int(1)]);
        let same = inplace_op(&e, BinaryOp::Add, &l, &Value::tuple(vec![Value::Int(2)])).unwrap();
        assert!(same.is_same(&l));
        assert_eq!(l.to_string(), "[1, 2]");
    }

    #[test]
    fn test_unsupported_operands() {
        let e = engine();
        let err = binary_op(&e, BinaryOp::Add, &Value::Int(1), &Value::str("x")).unwrap_err();
        assert!(err.is_exception(ExceptionKind::TypeError));
        assert_eq!(
            err.exception().unwrap().message(),
            "unsupported operand type(s) for +: 'int' and 'str'"
        );
    }

    #[test]
    fn test_compare_and_contains() {
        let e = engine();
        let t = |v: VmResult<Value>| v.unwrap().is_true();
        assert!(t(compare(&e, CmpOp::Lt, &Value::Int(1), &Value::Float(1.5))));
        assert!(t(compare(&e, CmpOp::Eq, &Value::Int(1), &Value::Bool(true))));
        let l = Value::list(vec![Value::Int(1), Value::str("a")]);
        assert!(t(compare(&e, CmpOp::In, &Value::str("a"), &l)));
        assert!(t(compare(&e, CmpOp::NotIn, &Value::Int(3), &l)));
        assert!(t(compare(
            &e,
            CmpOp::Lt,
            &Value::tuple(vec![Value::Int(1), Value::Int(2)]),
            &Value::tuple(vec![Value::Int(1), Value::Int(3)])
        )));
        assert!(compare(&e, CmpOp::Lt, &Value::Int(1), &Value::str("a")).is_err());
    }

    #[test]
    fn test_exception_match() {
        let handlers = Value::tuple(vec![
            Value::ExcType(ExceptionKind::KeyError),
            Value::ExcType(ExceptionKind::ArithmeticError),
        ]);
        assert!(exception_matches(&Value::ExcType(ExceptionKind::ZeroDivisionError), &handlers).unwrap());
        assert!(!exception_matches(&Value::ExcType(ExceptionKind::ValueError), &handlers).unwrap());
        assert!(exception_matches(&Value::Int(1), &Value::Int(1)).is_ok());
        assert!(exception_matches(&Value::ExcType(ExceptionKind::ValueError), &Value::Int(1)).is_err());
    }

    #[test]
    fn test_subscription() {
        let e = engine();
        let l = Value::list(vec![Value::Int(1), Value::Int(2)]);
        let r = binary_op(&e, BinaryOp::GetItem, &l, &Value::Int(-1)).unwrap();
        assert_eq!(r.as_int(), Some(2));
        let err = binary_op(&e, BinaryOp::GetItem, &l, &Value::Int(5)).unwrap_err();
        assert!(err.is_exception(ExceptionKind::IndexError));
        let d = Value::dict();
        setitem(&e, &d, &Value::str("k"), Value::Int(3)).unwrap();
        assert_eq!(binary_op(&e, BinaryOp::GetItem, &d, &Value::str("k")).unwrap().as_int(), Some(3));
        delitem(&e, &d, &Value::str("k")).unwrap();
        let err = binary_op(&e, BinaryOp::GetItem, &d, &Value::str("k")).unwrap_err();
        assert!(err.is_exception(ExceptionKind::KeyError));
    }

    #[test]
    fn test_slicing_clamps_like_sequences() {
        let e = engine();
        let l = Value::list((0..6).map(Value::Int).collect());
        let get = |start: Value, stop: Value, step: Value| {
            binary_op(&e, BinaryOp::GetItem, &l, &Value::slice(start, stop, step))
                .unwrap()
                .to_string()
        };
        assert_eq!(get(Value::Int(1), Value::Int(4), Value::None), "[1, 2, 3]");
        assert_eq!(get(Value::Int(-2), Value::None, Value::None), "[4, 5]");
        assert_eq!(get(Value::Int(-100), Value::Int(100), Value::None), "[0, 1, 2, 3, 4, 5]");
        assert_eq!(get(Value::None, Value::None, Value::Int(-2)), "[5, 3, 1]");
        assert_eq!(get(Value::Int(4), Value::Int(1), Value::None), "[]");
        assert_eq!(get(Value::Int(10), Value::Int(-10), Value::Int(-3)), "[5, 2]");

        let s = Value::str("héllo");
        let r = binary_op(&e, BinaryOp::GetItem, &s, &Value::slice(Value::Int(1), Value::Int(3), Value::None));
        assert_eq!(r.unwrap().to_string(), "él");
        let t = Value::tuple(vec![Value::Int(1), Value::Int(2)]);
        let r = binary_op(&e, BinaryOp::GetItem, &t, &Value::slice(Value::None, Value::None, Value::Int(-1)));
        assert_eq!(r.unwrap().to_string(), "(2, 1)");

        let zero = Value::slice(Value::None, Value::None, Value::Int(0));
        let err = binary_op(&e, BinaryOp::GetItem, &l, &zero).unwrap_err();
        assert!(err.is_exception(ExceptionKind::ValueError));
        let bad = Value::slice(Value::str("a"), Value::None, Value::None);
        let err = binary_op(&e, BinaryOp::GetItem, &l, &bad).unwrap_err();
        assert!(err.is_exception(ExceptionKind::TypeError));
    }

    #[test]
    fn test_slice_assignment_and_deletion() {
        let e = engine();
        let l = Value::list((0..5).map(Value::Int).collect());
        let head = Value::slice(Value::None, Value::Int(2), Value::None);
        setitem(&e, &l, &head, Value::list(vec![Value::str("a")])).unwrap();
        assert_eq!(l.to_string(), "['a', 2, 3, 4]");

        // Assigning a list to a slice of itself copies it first
        let all = Value::slice(Value::None, Value::None, Value::None);
        setitem(&e, &l, &all, l.clone()).unwrap();
        assert_eq!(l.to_string(), "['a', 2, 3, 4]");

        let evens = Value::slice(Value::None, Value::None, Value::Int(2));
        setitem(&e, &l, &evens, Value::tuple(vec![Value::Int(0), Value::Int(9)])).unwrap();
        assert_eq!(l.to_string(), "[0, 2, 9, 4]");
        let err = setitem(&e, &l, &evens, Value::list(vec![Value::Int(1)])).unwrap_err();
        assert!(err.is_exception(ExceptionKind::ValueError));

        delitem(&e, &l, &evens).unwrap();
        assert_eq!(l.to_string(), "[2, 4]");
        delitem(&e, &l, &all).unwrap();
        assert_eq!(l.to_string(), "[]");

        let t = Value::tuple(vec![Value::Int(1)]);
        assert!(setitem(&e, &t, &all, Value::list(vec![])).is_err());
    }

    #[test]
    fn test_attributes() {
        let e = engine();
        let class = Class::new("Point");
        class.set_attr("kind", Value::str("point"));
        let obj = Value::Instance(crate::backend::object::Instance::new(class));
        setattr(&obj, "x", Value::Int(3)).unwrap();
        assert_eq!(getattr(&e, &obj, "x").unwrap().as_int(), Some(3));
        assert_eq!(getattr(&e, &obj, "kind").unwrap().to_string(), "point");
        let err = getattr(&e, &obj, "y").unwrap_err();
        assert!(err.is_exception(ExceptionKind::AttributeError));
        delattr(&obj, "x").unwrap();
        assert!(delattr(&obj, "x").is_err());
    }

    #[test]
    fn test_iteration() {
        let e = engine();
        let d = Value::dict();
        setitem(&e, &d, &Value::str("a"), Value::Int(1)).unwrap();
        setitem(&e, &d, &Value::str("b"), Value::Int(2)).unwrap();
        let keys = collect_iterable(&e, &d).unwrap();
        assert_eq!(Value::list(keys).to_string(), "['a', 'b']");
        assert!(get_iter(&e, &Value::Int(1)).is_err());
    }
}
