//! Guest exceptions and tracebacks

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use super::Value;

/// Builtin exception classes, arranged in a fixed hierarchy
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ExceptionKind {
    BaseException,
    Exception,
    StopIteration,
    GeneratorExit,
    ArithmeticError,
    ZeroDivisionError,
    OverflowError,
    LookupError,
    IndexError,
    KeyError,
    NameError,
    UnboundLocalError,
    TypeError,
    ValueError,
    AttributeError,
    RuntimeError,
    AssertionError,
    SystemError,
}

impl ExceptionKind {
    pub const ALL: [ExceptionKind; 18] = [
        ExceptionKind::BaseException,
        ExceptionKind::Exception,
        ExceptionKind::StopIteration,
        ExceptionKind::GeneratorExit,
        ExceptionKind::ArithmeticError,
        ExceptionKind::ZeroDivisionError,
        ExceptionKind::OverflowError,
        ExceptionKind::LookupError,
        ExceptionKind::IndexError,
        ExceptionKind::KeyError,
        ExceptionKind::NameError,
        ExceptionKind::UnboundLocalError,
        ExceptionKind::TypeError,
        ExceptionKind::ValueError,
        ExceptionKind::AttributeError,
        ExceptionKind::RuntimeError,
        ExceptionKind::AssertionError,
        ExceptionKind::SystemError,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ExceptionKind::BaseException => "BaseException",
            ExceptionKind::Exception => "Exception",
            ExceptionKind::StopIteration => "StopIteration",
            ExceptionKind::GeneratorExit => "GeneratorExit",
            ExceptionKind::ArithmeticError => "ArithmeticError",
            ExceptionKind::ZeroDivisionError => "ZeroDivisionError",
            ExceptionKind::OverflowError => "OverflowError",
            ExceptionKind::LookupError => "LookupError",
            ExceptionKind::IndexError => "IndexError",
            ExceptionKind::KeyError => "KeyError",
            ExceptionKind::NameError => "NameError",
            ExceptionKind::UnboundLocalError => "UnboundLocalError",
            ExceptionKind::TypeError => "TypeError",
            ExceptionKind::ValueError => "ValueError",
            ExceptionKind::AttributeError => "AttributeError",
            ExceptionKind::RuntimeError => "RuntimeError",
            ExceptionKind::AssertionError => "AssertionError",
            ExceptionKind::SystemError => "SystemError",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.name() == name)
    }

    /// Direct base class, `None` for the root
    pub fn parent(self) -> Option<Self> {
        use ExceptionKind::*;
        match self {
            BaseException => None,
            Exception | GeneratorExit => Some(BaseException),
            ZeroDivisionError | OverflowError => Some(ArithmeticError),
            IndexError | KeyError => Some(LookupError),
            UnboundLocalError => Some(NameError),
            _ => Some(Exception),
        }
    }

    /// Whether `self` is `other` or derives from it
    pub fn is_subclass(self, other: ExceptionKind) -> bool {
        let mut current = Some(self);
        while let Some(kind) = current {
            if kind == other {
                return true;
            }
            current = kind.parent();
        }
        false
    }
}

impl fmt::Display for ExceptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One frame of a traceback, with the frame's locals at the time the
/// exception passed through it
#[derive(Clone)]
pub struct TracebackEntry {
    pub function: Arc<str>,
    pub line: u32,
    pub lasti: usize,
    pub locals: Vec<(Arc<str>, Value)>,
}

impl TracebackEntry {
    pub fn local(&self, name: &str) -> Option<&Value> {
        self.locals
            .iter()
            .find(|(n, _)| n.as_ref() == name)
            .map(|(_, v)| v)
    }
}

impl fmt::Debug for TracebackEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} line {} (lasti {}) {{", self.function, self.line, self.lasti)?;
        for (i, (name, value)) in self.locals.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", name, value.repr())?;
        }
        write!(f, "}}")
    }
}

/// A raised (or raisable) exception instance
///
/// The traceback grows as the exception propagates: the innermost frame is
/// recorded first.
pub struct ExceptionObj {
    pub kind: ExceptionKind,
    pub args: Vec<Value>,
    traceback: Mutex<Vec<TracebackEntry>>,
}

impl ExceptionObj {
    pub fn new(kind: ExceptionKind, args: Vec<Value>) -> Arc<Self> {
        Arc::new(ExceptionObj {
            kind,
            args,
            traceback: Mutex::new(Vec::new()),
        })
    }

    pub fn with_message(kind: ExceptionKind, message: impl Into<String>) -> Arc<Self> {
        Self::new(kind, vec![Value::str(&message.into())])
    }

    /// The `str()` of the exception
    pub fn message(&self) -> String {
        match self.args.as_slice() {
            [] => String::new(),
            [single] => single.to_string(),
            many => Value::tuple(many.to_vec()).to_string(),
        }
    }

    pub fn push_traceback(&self, entry: TracebackEntry) {
        self.traceback.lock().push(entry);
    }

    pub fn traceback(&self) -> Vec<TracebackEntry> {
        self.traceback.lock().clone()
    }

    /// Whether this exception is caught by a handler for `kind`
    #[inline]
    pub fn matches(&self, kind: ExceptionKind) -> bool {
        self.kind.is_subclass(kind)
    }
}

impl fmt::Debug for ExceptionObj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message())
    }
}

impl fmt::Display for ExceptionObj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = self.message();
        if message.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}: {}", self.kind, message)
        }
    }
}
