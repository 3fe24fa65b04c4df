//! Call operations for the interpreter.
//!
//! The `CALL_FUNCTION` family, `MAKE_FUNCTION` and `MAKE_CLOSURE`, plus
//! [`call_value`], the one entry point every tier uses to call a value.
//! Calling a user function binds its arguments into a fresh [`Frame`] and
//! hands the frame to the hybrid executor, which picks the interpreter or
//! native code for it.

use std::cell::Cell as StdCell;
use std::sync::Arc;

use tracing::{debug, trace};

use super::types::{Flow, FrameEntry, FrameExit, VmError, VmResult};
use super::Exec;
use crate::backend::bytecode::code::CodeFlags;
use crate::backend::bytecode::frame::Frame;
use crate::backend::bytecode::generator::Generator;
use crate::backend::bytecode::jit::hybrid;
use crate::backend::bytecode::opcodes::Opcode;
use crate::backend::object::{Cell, ExceptionKind, ExceptionObj, Function, Instance, Value};
use crate::backend::ops;
use crate::engine::Engine;

/// Keyword arguments in call order
pub type KwArgs = Vec<(Arc<str>, Value)>;

/// Append the entries of a `**` mapping to `kwargs`
fn merge_kwargs(kwargs: &mut KwArgs, mapping: &Value) -> VmResult<()> {
    let Value::Dict(d) = mapping else {
        return Err(VmError::raise(
            ExceptionKind::TypeError,
            format!("argument after ** must be a mapping, not {}", mapping.type_name()),
        ));
    };
    let entries: Vec<(Value, Value)> = d
        .lock()
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    for (key, value) in entries {
        let Value::Str(name) = key else {
            return Err(VmError::raise(ExceptionKind::TypeError, "keywords must be strings"));
        };
        if kwargs.iter().any(|(k, _)| *k == name) {
            return Err(VmError::raise(
                ExceptionKind::TypeError,
                format!("got multiple values for keyword argument '{}'", name),
            ));
        }
        kwargs.push((name, value));
    }
    Ok(())
}

// =============================================================================
// Recursion depth
// =============================================================================

thread_local! {
    static DEPTH: StdCell<usize> = const { StdCell::new(0) };
}

/// Counts nested guest activations on this thread while alive
#[must_use]
pub struct DepthGuard(());

impl DepthGuard {
    pub fn enter(limit: usize) -> VmResult<Self> {
        DEPTH.with(|d| {
            let depth = d.get();
            if depth >= limit {
                debug!(target: "tiervm::vm::calls", depth, limit, "recursion limit hit");
                return Err(VmError::raise(
                    ExceptionKind::RuntimeError,
                    "maximum recursion depth exceeded",
                ));
            }
            d.set(depth + 1);
            Ok(DepthGuard(()))
        })
    }

    /// Current depth on this thread
    pub fn depth() -> usize {
        DEPTH.with(|d| d.get())
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

// =============================================================================
// Opcodes
// =============================================================================

impl Exec<'_> {
    /// `CALL_FUNCTION` and its `*args` / `**kwargs` forms: arg is `nkw << 8 | argc`
    ///
    /// Stack: `[func, positional..., name1, value1, ..., (args)?, (kwargs)?] -> [result]`
    pub(super) fn op_call_function(&mut self, op: Opcode, arg: u32) -> VmResult<Flow> {
        let (star, dstar) = op.call_extras().ok_or(VmError::InvalidOpcode {
            ip: self.site.ip as usize,
            opcode: op,
        })?;
        let argc = (arg & 0xff) as usize;
        let nkw = ((arg >> 8) & 0xff) as usize;

        let mapping = if dstar { Some(self.frame.pop()?) } else { None };
        let sequence = if star { Some(self.frame.pop()?) } else { None };
        let kw_flat = self.frame.pop_n(nkw * 2)?;
        let mut args = self.frame.pop_n(argc)?;
        let func = self.frame.pop()?;

        if self.record {
            self.frame.code.feedback().record_callee(self.site, &func);
        }

        let mut kwargs = Vec::with_capacity(nkw);
        let mut it = kw_flat.into_iter();
        while let (Some(name), Some(value)) = (it.next(), it.next()) {
            match name {
                Value::Str(s) => kwargs.push((s, value)),
                _ => {
                    return Err(VmError::raise(
                        ExceptionKind::TypeError,
                        "keywords must be strings",
                    ))
                }
            }
        }

        if let Some(sequence) = sequence {
            let iter = match ops::get_iter(self.engine, &sequence) {
                Ok(iter) => iter,
                Err(e) if e.is_exception(ExceptionKind::TypeError) => {
                    return Err(VmError::raise(
                        ExceptionKind::TypeError,
                        format!(
                            "argument after * must be an iterable, not {}",
                            sequence.type_name()
                        ),
                    ))
                }
                Err(e) => return Err(e),
            };
            args.extend(ops::collect_iterable(self.engine, &iter)?);
        }

        if let Some(mapping) = mapping {
            merge_kwargs(&mut kwargs, &mapping)?;
        }

        let result = call_value(self.engine, &func, args, kwargs)?;
        self.frame.push(result);
        Ok(Flow::Next)
    }

    /// `MAKE_FUNCTION` / `MAKE_CLOSURE` with `ndefaults` default values
    ///
    /// Stack: `[defaults..., (cells,)?, code] -> [function]`
    pub(super) fn op_make_function(&mut self, ndefaults: u32, closure: bool) -> VmResult<Flow> {
        let code = match self.frame.pop()? {
            Value::Code(code) => code,
            other => {
                return Err(VmError::Runtime(format!(
                    "MAKE_FUNCTION expects code, got {}",
                    other.type_name()
                )))
            }
        };

        let cells: Box<[Arc<Cell>]> = if closure {
            match self.frame.pop()? {
                Value::Tuple(items) => items
                    .iter()
                    .map(|v| match v {
                        Value::Cell(c) => Ok(c.clone()),
                        other => Err(VmError::Runtime(format!(
                            "closure tuple holds {}",
                            other.type_name()
                        ))),
                    })
                    .collect::<VmResult<_>>()?,
                other => {
                    return Err(VmError::Runtime(format!(
                        "MAKE_CLOSURE expects a cell tuple, got {}",
                        other.type_name()
                    )))
                }
            }
        } else {
            Box::new([])
        };

        if cells.len() != code.freevars().len() {
            return Err(VmError::Runtime(format!(
                "{} needs {} closure cells, got {}",
                code.name(),
                code.freevars().len(),
                cells.len()
            )));
        }

        let defaults = self.frame.pop_n(ndefaults as usize)?;
        let func = Function {
            name: code.name().into(),
            globals: self.frame.globals.clone(),
            defaults: defaults.into_boxed_slice(),
            closure: cells,
            code,
        };
        self.frame.push(Value::Function(Arc::new(func)));
        Ok(Flow::Next)
    }
}

// =============================================================================
// Calling values
// =============================================================================

/// Call `callee` with positional and keyword arguments
pub fn call_value(engine: &Engine, callee: &Value, args: Vec<Value>, kwargs: KwArgs) -> VmResult<Value> {
    match callee {
        Value::Function(func) => call_function(engine, func, args, kwargs),
        Value::Builtin(b) => {
            if let Some((name, _)) = kwargs.first() {
                return Err(VmError::raise(
                    ExceptionKind::TypeError,
                    format!("{}() got an unexpected keyword argument '{}'", b.name, name),
                ));
            }
            (b.func)(engine, &args)
        }
        Value::Method(m) => {
            let mut full = Vec::with_capacity(args.len() + 1);
            full.push(m.receiver.clone());
            full.extend(args);
            call_value(engine, &m.func, full, kwargs)
        }
        Value::Class(class) => {
            let inst = Instance::new(class.clone());
            if let Some(init) = inst.special("__init__") {
                let result = call_value(engine, &init, args, kwargs)?;
                if !result.is_none() {
                    return Err(VmError::raise(
                        ExceptionKind::TypeError,
                        "__init__() should return None",
                    ));
                }
            } else if !args.is_empty() || !kwargs.is_empty() {
                return Err(VmError::raise(
                    ExceptionKind::TypeError,
                    "this constructor takes no arguments",
                ));
            }
            Ok(Value::Instance(inst))
        }
        Value::ExcType(kind) => {
            if !kwargs.is_empty() {
                return Err(VmError::raise(
                    ExceptionKind::TypeError,
                    format!("{} does not take keyword arguments", kind),
                ));
            }
            Ok(Value::Exception(ExceptionObj::new(*kind, args)))
        }
        Value::Instance(inst) => match inst.special("__call__") {
            Some(call) => call_value(engine, &call, args, kwargs),
            None => Err(VmError::raise(
                ExceptionKind::AttributeError,
                format!("{} instance has no __call__ method", inst.class.name),
            )),
        },
        other => Err(VmError::raise(
            ExceptionKind::TypeError,
            format!("'{}' object is not callable", other.type_name()),
        )),
    }
}

fn call_function(engine: &Engine, func: &Arc<Function>, args: Vec<Value>, kwargs: KwArgs) -> VmResult<Value> {
    let mut frame = bind_arguments(engine, func, args, kwargs)?;

    if func.code.is_generator() {
        return Ok(Value::Generator(Generator::new(frame)));
    }

    trace!(target: "tiervm::vm::calls", function = %func.name, "call");
    let _depth = DepthGuard::enter(engine.config().recursion_limit)?;
    match hybrid::execute(engine, &mut frame, FrameEntry::Call)? {
        FrameExit::Return(value) => Ok(value),
        FrameExit::Yield(_) => Err(VmError::Runtime(format!(
            "{} yielded outside a generator",
            func.name
        ))),
    }
}

fn arg_count_error(func: &Function, given: usize) -> VmError {
    let code = &func.code;
    let argcount = code.argcount();
    let has_varargs = code.flags().contains(CodeFlags::VARARGS);
    let (quantifier, expected) = if !func.defaults.is_empty() || has_varargs {
        if given < argcount {
            ("at least", argcount - func.defaults.len())
        } else {
            ("at most", argcount)
        }
    } else {
        ("exactly", argcount)
    };
    VmError::raise(
        ExceptionKind::TypeError,
        format!(
            "{}() takes {} {} argument{} ({} given)",
            func.name,
            quantifier,
            expected,
            if expected == 1 { "" } else { "s" },
            given
        ),
    )
}

/// Build the frame for a call: parameters, `*args`, `**kwargs`, cells
fn bind_arguments(engine: &Engine, func: &Function, args: Vec<Value>, kwargs: KwArgs) -> VmResult<Frame> {
    let code = &func.code;
    let argcount = code.argcount();
    let flags = code.flags();
    let given = args.len() + kwargs.len();
    let mut frame = Frame::new(code.clone(), func.globals.clone(), engine.builtins());

    let mut next_slot = argcount;
    let mut args = args.into_iter();
    for slot in 0..argcount.min(args.len()) {
        if let Some(v) = args.next() {
            frame.locals[slot] = Some(v);
        }
    }
    let extra: Vec<Value> = args.collect();

    if flags.contains(CodeFlags::VARARGS) {
        frame.locals[next_slot] = Some(Value::tuple(extra));
        next_slot += 1;
    } else if !extra.is_empty() {
        return Err(arg_count_error(func, given));
    }

    let kw_dict = if flags.contains(CodeFlags::VARKEYWORDS) {
        let d = Value::dict();
        frame.locals[next_slot] = Some(d.clone());
        Some(d)
    } else {
        None
    };

    for (name, value) in kwargs {
        match code.varnames()[..argcount].iter().position(|n| *n == name) {
            Some(slot) => {
                if frame.locals[slot].is_some() {
                    return Err(VmError::raise(
                        ExceptionKind::TypeError,
                        format!(
                            "{}() got multiple values for keyword argument '{}'",
                            func.name, name
                        ),
                    ));
                }
                frame.locals[slot] = Some(value);
            }
            None => match &kw_dict {
                Some(Value::Dict(d)) => d.lock().insert(Value::Str(name), value)?,
                _ => {
                    return Err(VmError::raise(
                        ExceptionKind::TypeError,
                        format!(
                            "{}() got an unexpected keyword argument '{}'",
                            func.name, name
                        ),
                    ))
                }
            },
        }
    }

    let first_default = argcount.saturating_sub(func.defaults.len());
    for slot in 0..argcount {
        if frame.locals[slot].is_none() {
            match slot.checked_sub(first_default) {
                Some(d) => frame.locals[slot] = Some(func.defaults[d].clone()),
                None => return Err(arg_count_error(func, given)),
            }
        }
    }

    for (cell, arg) in frame.cells.iter().zip(code.cell2arg()) {
        if let Some(value) = arg.and_then(|a| frame.locals[a].clone()) {
            cell.set(value);
        }
    }
    frame.cells.extend(func.closure.iter().cloned());

    Ok(frame)
}
