//! Object model consumed by the execution engine
//!
//! Values are cheap to clone: scalars are stored inline and everything else is
//! reference counted. Mutable containers sit behind `parking_lot` locks so a
//! value can be shared between frames, suspended generators and native code.
//!
//! Only what the tiered engine needs is modelled here: numbers, strings,
//! tuples, lists, dicts, slices, functions and closures, simple classes with
//! instances, iterators, generators and exceptions.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::backend::bytecode::code::CodeUnit;
use crate::backend::bytecode::generator::Generator;
use crate::backend::bytecode::vm::{VmError, VmResult};
use crate::engine::Engine;

mod exception;
mod iter;

pub use exception::{ExceptionKind, ExceptionObj, TracebackEntry};
pub use iter::IterState;

/// Signature of builtin functions
pub type BuiltinFn = fn(&Engine, &[Value]) -> VmResult<Value>;

/// A runtime value
#[derive(Clone)]
pub enum Value {
    None,
    NotImplemented,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    Tuple(Arc<[Value]>),
    List(Arc<Mutex<Vec<Value>>>),
    Dict(Arc<Mutex<Dict>>),
    Slice(Arc<Slice>),
    Function(Arc<Function>),
    Builtin(Arc<Builtin>),
    Method(Arc<BoundMethod>),
    Class(Arc<Class>),
    Instance(Arc<Instance>),
    Code(Arc<CodeUnit>),
    Cell(Arc<Cell>),
    Iterator(Arc<Mutex<IterState>>),
    Generator(Arc<Generator>),
    ExcType(ExceptionKind),
    Exception(Arc<ExceptionObj>),
    Traceback(Arc<Vec<TracebackEntry>>),
}

/// Type tag of a value, used for type feedback and error messages
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TypeTag {
    None = 0,
    NotImplemented,
    Bool,
    Int,
    Float,
    Str,
    Tuple,
    List,
    Dict,
    Slice,
    Function,
    Builtin,
    Method,
    Class,
    Instance,
    Code,
    Cell,
    Iterator,
    Generator,
    ExcType,
    Exception,
    Traceback,
}

impl TypeTag {
    /// Python-visible type name
    pub fn name(self) -> &'static str {
        match self {
            TypeTag::None => "NoneType",
            TypeTag::NotImplemented => "NotImplementedType",
            TypeTag::Bool => "bool",
            TypeTag::Int => "int",
            TypeTag::Float => "float",
            TypeTag::Str => "str",
            TypeTag::Tuple => "tuple",
            TypeTag::List => "list",
            TypeTag::Dict => "dict",
            TypeTag::Slice => "slice",
            TypeTag::Function => "function",
            TypeTag::Builtin => "builtin_function_or_method",
            TypeTag::Method => "instancemethod",
            TypeTag::Class => "classobj",
            TypeTag::Instance => "instance",
            TypeTag::Code => "code",
            TypeTag::Cell => "cell",
            TypeTag::Iterator => "iterator",
            TypeTag::Generator => "generator",
            TypeTag::ExcType => "type",
            TypeTag::Exception => "exception",
            TypeTag::Traceback => "traceback",
        }
    }
}

impl Value {
    pub fn str(s: &str) -> Self {
        Value::Str(Arc::from(s))
    }

    pub fn tuple(items: Vec<Value>) -> Self {
        Value::Tuple(Arc::from(items))
    }

    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Arc::new(Mutex::new(items)))
    }

    pub fn dict() -> Self {
        Value::Dict(Arc::new(Mutex::new(Dict::default())))
    }

    pub fn slice(start: Value, stop: Value, step: Value) -> Self {
        Value::Slice(Arc::new(Slice { start, stop, step }))
    }

    pub fn builtin(name: &'static str, func: BuiltinFn) -> Self {
        Value::Builtin(Arc::new(Builtin { name, func }))
    }

    pub fn type_tag(&self) -> TypeTag {
        match self {
            Value::None => TypeTag::None,
            Value::NotImplemented => TypeTag::NotImplemented,
            Value::Bool(_) => TypeTag::Bool,
            Value::Int(_) => TypeTag::Int,
            Value::Float(_) => TypeTag::Float,
            Value::Str(_) => TypeTag::Str,
            Value::Tuple(_) => TypeTag::Tuple,
            Value::List(_) => TypeTag::List,
            Value::Dict(_) => TypeTag::Dict,
            Value::Slice(_) => TypeTag::Slice,
            Value::Function(_) => TypeTag::Function,
            Value::Builtin(_) => TypeTag::Builtin,
            Value::Method(_) => TypeTag::Method,
            Value::Class(_) => TypeTag::Class,
            Value::Instance(_) => TypeTag::Instance,
            Value::Code(_) => TypeTag::Code,
            Value::Cell(_) => TypeTag::Cell,
            Value::Iterator(_) => TypeTag::Iterator,
            Value::Generator(_) => TypeTag::Generator,
            Value::ExcType(_) => TypeTag::ExcType,
            Value::Exception(_) => TypeTag::Exception,
            Value::Traceback(_) => TypeTag::Traceback,
        }
    }

    #[inline]
    pub fn type_name(&self) -> &'static str {
        self.type_tag().name()
    }

    #[inline]
    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    /// Truth value used by conditional jumps and `not`
    pub fn is_true(&self) -> bool {
        match self {
            Value::None | Value::NotImplemented => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Tuple(t) => !t.is_empty(),
            Value::List(l) => !l.lock().is_empty(),
            Value::Dict(d) => !d.lock().is_empty(),
            _ => true,
        }
    }

    /// Stable identity for heap values; scalars compare by value
    ///
    /// Used for `is` comparisons and callee identity feedback.
    pub fn identity(&self) -> usize {
        fn addr<T: ?Sized>(a: &Arc<T>) -> usize {
            Arc::as_ptr(a) as *const u8 as usize
        }
        match self {
            Value::None => 0,
            Value::NotImplemented => 1,
            Value::Bool(b) => 2 + *b as usize,
            Value::Int(i) => *i as usize,
            Value::Float(f) => f.to_bits() as usize,
            Value::Str(s) => addr(s),
            Value::Tuple(t) => addr(t),
            Value::List(l) => addr(l),
            Value::Dict(d) => addr(d),
            Value::Slice(s) => addr(s),
            Value::Function(f) => addr(f),
            Value::Builtin(b) => addr(b),
            Value::Method(m) => addr(m),
            Value::Class(c) => addr(c),
            Value::Instance(i) => addr(i),
            Value::Code(c) => addr(c),
            Value::Cell(c) => addr(c),
            Value::Iterator(i) => addr(i),
            Value::Generator(g) => addr(g),
            Value::ExcType(k) => *k as usize,
            Value::Exception(e) => addr(e),
            Value::Traceback(t) => addr(t),
        }
    }

    /// Identity comparison backing `is` and `is not`
    pub fn is_same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::NotImplemented, Value::NotImplemented) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Str(a), Value::Str(b)) => Arc::ptr_eq(a, b) || a == b,
            (Value::ExcType(a), Value::ExcType(b)) => a == b,
            (a, b) => a.type_tag() == b.type_tag() && a.identity() == b.identity(),
        }
    }

    /// Quoted representation, as `repr()` shows it
    pub fn repr(&self) -> String {
        match self {
            Value::Str(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
            other => other.to_string(),
        }
    }
}

fn join_repr(items: &[Value]) -> String {
    items.iter().map(Value::repr).collect::<Vec<_>>().join(", ")
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::NotImplemented => write!(f, "NotImplemented"),
            Value::Bool(true) => write!(f, "True"),
            Value::Bool(false) => write!(f, "False"),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => {
                if x.is_finite() && x.fract() == 0.0 && x.abs() < 1e16 {
                    write!(f, "{:.1}", x)
                } else {
                    write!(f, "{}", x)
                }
            }
            Value::Str(s) => write!(f, "{}", s),
            Value::Tuple(t) if t.len() == 1 => write!(f, "({},)", t[0].repr()),
            Value::Tuple(t) => write!(f, "({})", join_repr(t)),
            Value::List(l) => write!(f, "[{}]", join_repr(&l.lock())),
            Value::Dict(d) => {
                let d = d.lock();
                let parts: Vec<String> = d
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k.repr(), v.repr()))
                    .collect();
                write!(f, "{{{}}}", parts.join(", "))
            }
            Value::Slice(s) => write!(
                f,
                "slice({}, {}, {})",
                s.start.repr(),
                s.stop.repr(),
                s.step.repr()
            ),
            Value::Function(func) => write!(f, "<function {}>", func.name),
            Value::Builtin(b) => write!(f, "<built-in function {}>", b.name),
            Value::Method(m) => write!(f, "<bound method of {}>", m.receiver.type_name()),
            Value::Class(c) => write!(f, "<class {}>", c.name),
            Value::Instance(i) => write!(f, "<{} instance>", i.class.name),
            Value::Code(c) => write!(f, "<code object {}>", c.name()),
            Value::Cell(_) => write!(f, "<cell>"),
            Value::Iterator(_) => write!(f, "<iterator>"),
            Value::Generator(g) => write!(f, "<generator object {}>", g.name()),
            Value::ExcType(k) => write!(f, "<type '{}'>", k.name()),
            Value::Exception(e) => write!(f, "{}", e.message()),
            Value::Traceback(_) => write!(f, "<traceback>"),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Exception(e) => write!(f, "{}({:?})", e.kind.name(), e.message()),
            other => write!(f, "{}", other.repr()),
        }
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::str(s)
    }
}

// =============================================================================
// Dictionaries
// =============================================================================

/// Hashable projection of a value
///
/// Numbers that compare equal hash equal: `True`, `1` and `1.0` are the same
/// key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HashKey {
    None,
    Int(i64),
    Float(u64),
    Str(Arc<str>),
    Tuple(Box<[HashKey]>),
    ExcType(ExceptionKind),
    Identity(usize),
}

impl HashKey {
    pub fn from_value(v: &Value) -> VmResult<Self> {
        Ok(match v {
            Value::None => HashKey::None,
            Value::Bool(b) => HashKey::Int(*b as i64),
            Value::Int(i) => HashKey::Int(*i),
            Value::Float(x) => {
                if x.fract() == 0.0 && x.abs() < 9.2e18 {
                    HashKey::Int(*x as i64)
                } else {
                    HashKey::Float(x.to_bits())
                }
            }
            Value::Str(s) => HashKey::Str(s.clone()),
            Value::Tuple(items) => HashKey::Tuple(
                items
                    .iter()
                    .map(HashKey::from_value)
                    .collect::<VmResult<Vec<_>>>()?
                    .into_boxed_slice(),
            ),
            Value::ExcType(k) => HashKey::ExcType(*k),
            Value::List(_) | Value::Dict(_) | Value::Slice(_) => {
                return Err(VmError::raise(
                    ExceptionKind::TypeError,
                    format!("unhashable type: '{}'", v.type_name()),
                ))
            }
            other => HashKey::Identity(other.identity()),
        })
    }
}

/// Insertion-ordered dictionary
#[derive(Default, Clone)]
pub struct Dict {
    index: HashMap<HashKey, usize>,
    entries: Vec<Option<(Value, Value)>>,
    len: usize,
}

impl Dict {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, key: &Value) -> VmResult<Option<Value>> {
        let k = HashKey::from_value(key)?;
        Ok(self
            .index
            .get(&k)
            .and_then(|&i| self.entries[i].as_ref())
            .map(|(_, v)| v.clone()))
    }

    pub fn insert(&mut self, key: Value, value: Value) -> VmResult<()> {
        let k = HashKey::from_value(&key)?;
        match self.index.get(&k) {
            Some(&i) => {
                if let Some(entry) = self.entries[i].as_mut() {
                    entry.1 = value;
                }
            }
            None => {
                self.index.insert(k, self.entries.len());
                self.entries.push(Some((key, value)));
                self.len += 1;
            }
        }
        Ok(())
    }

    pub fn remove(&mut self, key: &Value) -> VmResult<Option<Value>> {
        let k = HashKey::from_value(key)?;
        Ok(match self.index.remove(&k) {
            Some(i) => {
                self.len -= 1;
                self.entries[i].take().map(|(_, v)| v)
            }
            None => None,
        })
    }

    pub fn contains(&self, key: &Value) -> VmResult<bool> {
        Ok(self.index.contains_key(&HashKey::from_value(key)?))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.entries.iter().flatten().map(|(k, v)| (k, v))
    }

    pub fn keys(&self) -> Vec<Value> {
        self.iter().map(|(k, _)| k.clone()).collect()
    }
}

// =============================================================================
// Namespaces
// =============================================================================

/// A globals or builtins namespace
///
/// Every mutation bumps `version`, which native code compares against the
/// version it assumed when it cached a binding.
pub struct Namespace {
    id: u64,
    map: RwLock<HashMap<Arc<str>, Value>>,
    version: AtomicU64,
}

static NEXT_NAMESPACE_ID: AtomicU64 = AtomicU64::new(1);

impl Namespace {
    pub fn new() -> Arc<Self> {
        Arc::new(Namespace {
            id: NEXT_NAMESPACE_ID.fetch_add(1, Ordering::Relaxed),
            map: RwLock::new(HashMap::new()),
            version: AtomicU64::new(0),
        })
    }

    /// Process-unique identity, never reused
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn get(&self, name: &str) -> Option<Value> {
        self.map.read().get(name).cloned()
    }

    pub fn set(&self, name: impl Into<Arc<str>>, value: Value) {
        self.map.write().insert(name.into(), value);
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    pub fn remove(&self, name: &str) -> Option<Value> {
        let removed = self.map.write().remove(name);
        if removed.is_some() {
            self.version.fetch_add(1, Ordering::AcqRel);
        }
        removed
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.read().contains_key(name)
    }

    /// Modification counter
    #[inline]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn names(&self) -> Vec<Arc<str>> {
        let mut names: Vec<_> = self.map.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Namespace")
            .field("names", &self.names())
            .field("version", &self.version())
            .finish()
    }
}

// =============================================================================
// Callables and classes
// =============================================================================

/// A user function: code plus the environment it closes over
pub struct Function {
    pub name: Arc<str>,
    pub code: Arc<CodeUnit>,
    pub globals: Arc<Namespace>,
    pub defaults: Box<[Value]>,
    pub closure: Box<[Arc<Cell>]>,
}

impl Function {
    pub fn new(code: Arc<CodeUnit>, globals: Arc<Namespace>) -> Arc<Self> {
        Arc::new(Function {
            name: code.name().into(),
            code,
            globals,
            defaults: Box::new([]),
            closure: Box::new([]),
        })
    }
}

/// `start:stop:step`, each bound an int or `None`
pub struct Slice {
    pub start: Value,
    pub stop: Value,
    pub step: Value,
}

/// A function implemented in Rust
pub struct Builtin {
    pub name: &'static str,
    pub func: BuiltinFn,
}

/// A callable bound to its receiver, which is passed as the first argument
pub struct BoundMethod {
    pub receiver: Value,
    pub func: Value,
}

/// A closure cell shared between a frame and the functions it creates
#[derive(Default)]
pub struct Cell(Mutex<Option<Value>>);

impl Cell {
    pub fn new(value: Option<Value>) -> Arc<Self> {
        Arc::new(Cell(Mutex::new(value)))
    }

    pub fn get(&self) -> Option<Value> {
        self.0.lock().clone()
    }

    pub fn set(&self, value: Value) {
        *self.0.lock() = Some(value);
    }

    pub fn clear(&self) -> Option<Value> {
        self.0.lock().take()
    }
}

/// A minimal class: a name and an attribute table
pub struct Class {
    pub name: Arc<str>,
    attrs: RwLock<HashMap<Arc<str>, Value>>,
}

impl Class {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Class {
            name: name.into(),
            attrs: RwLock::new(HashMap::new()),
        })
    }

    pub fn get_attr(&self, name: &str) -> Option<Value> {
        self.attrs.read().get(name).cloned()
    }

    pub fn set_attr(&self, name: impl Into<Arc<str>>, value: Value) {
        self.attrs.write().insert(name.into(), value);
    }

    pub fn remove_attr(&self, name: &str) -> Option<Value> {
        self.attrs.write().remove(name)
    }
}

/// An instance of a [`Class`]
pub struct Instance {
    pub class: Arc<Class>,
    attrs: Mutex<HashMap<Arc<str>, Value>>,
}

impl Instance {
    pub fn new(class: Arc<Class>) -> Arc<Self> {
        Arc::new(Instance {
            class,
            attrs: Mutex::new(HashMap::new()),
        })
    }

    pub fn get_own(&self, name: &str) -> Option<Value> {
        self.attrs.lock().get(name).cloned()
    }

    pub fn set_attr(&self, name: impl Into<Arc<str>>, value: Value) {
        self.attrs.lock().insert(name.into(), value);
    }

    pub fn remove_attr(&self, name: &str) -> Option<Value> {
        self.attrs.lock().remove(name)
    }

    /// Look up a special method on the class, bound to this instance
    pub fn special(self: &Arc<Self>, name: &str) -> Option<Value> {
        self.class.get_attr(name).map(|func| {
            Value::Method(Arc::new(BoundMethod {
                receiver: Value::Instance(self.clone()),
                func,
            }))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(!Value::None.is_true());
        assert!(!Value::Int(0).is_true());
        assert!(Value::Int(-1).is_true());
        assert!(!Value::str("").is_true());
        assert!(Value::list(vec![Value::None]).is_true());
        assert!(!Value::tuple(vec![]).is_true());
    }

    #[test]
    fn test_display_and_repr() {
        assert_eq!(Value::Float(2.0).to_string(), "2.0");
        assert_eq!(Value::Float(0.5).to_string(), "0.5");
        assert_eq!(Value::str("a'b").repr(), "'a\\'b'");
        assert_eq!(Value::tuple(vec![Value::Int(1)]).to_string(), "(1,)");
        assert_eq!(
            Value::list(vec![Value::Int(1), Value::str("x")]).to_string(),
            "[1, 'x']"
        );
    }

    #[test]
    fn test_dict_numeric_keys_collapse() {
        let mut d = Dict::default();
        d.insert(Value::Int(1), Value::str("int")).unwrap();
        d.insert(Value::Bool(true), Value::str("bool")).unwrap();
        d.insert(Value::Float(1.0), Value::str("float")).unwrap();
        assert_eq!(d.len(), 1);
        assert_eq!(d.get(&Value::Int(1)).unwrap().unwrap().to_string(), "float");
        assert!(d.insert(Value::list(vec![]), Value::None).is_err());
        assert_eq!(d.remove(&Value::Int(1)).unwrap().unwrap().to_string(), "float");
        assert!(d.is_empty());
    }

    #[test]
    fn test_namespace_version_bumps() {
        let ns = Namespace::new();
        let v0 = ns.version();
        ns.set("x", Value::Int(1));
        assert!(ns.version() > v0);
        let v1 = ns.version();
        assert!(ns.remove("missing").is_none());
        assert_eq!(ns.version(), v1);
        ns.remove("x");
        assert!(ns.version() > v1);
    }

    #[test]
    fn test_identity() {
        let l = Value::list(vec![]);
        assert!(l.is_same(&l.clone()));
        assert!(!l.is_same(&Value::list(vec![])));
        assert!(Value::Int(5).is_same(&Value::Int(5)));
        assert!(!Value::Int(1).is_same(&Value::Bool(true)));
    }
}
