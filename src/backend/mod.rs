//! Runtime backend: object model, operator dispatch, builtins and the
//! bytecode engine.

pub mod builtins;
pub mod bytecode;
pub mod object;
pub mod ops;

pub use object::{ExceptionKind, ExceptionObj, Namespace, Value};
