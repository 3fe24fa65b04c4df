//! Code unit builder
//!
//! Stands in for the source compiler: tests, benchmarks and embedders
//! assemble code units primitive by primitive, with symbolic labels for
//! jumps. With fusion enabled, adjacent primitives are packed into
//! superinstructions, except across a bound label (a jump must land on an
//! instruction start).

use std::sync::Arc;

use super::code::{CodeFlags, CodeParts, CodeUnit};
use super::instruction::{CodeError, CodeResult, Word};
use super::opcodes::{ArgKind, CmpOp, Opcode, ALL_OPCODES};
use crate::backend::object::Value;

/// A jump destination, bound to a position with [`CodeBuilder::bind`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

#[derive(Debug, Clone, Copy)]
enum PendingArg {
    None,
    Value(u32),
    Label(Label),
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    op: Opcode,
    arg: PendingArg,
    line: u32,
}

/// Incremental builder for [`CodeUnit`]s
pub struct CodeBuilder {
    name: String,
    argcount: usize,
    flags: CodeFlags,
    first_line: u32,
    line: u32,
    fuse: bool,
    prims: Vec<Pending>,
    labels: Vec<Option<usize>>,
    consts: Vec<Value>,
    names: Vec<Arc<str>>,
    varnames: Vec<Arc<str>>,
    cellvars: Vec<Arc<str>>,
    freevars: Vec<Arc<str>>,
    error: Option<CodeError>,
}

impl CodeBuilder {
    pub fn new(name: &str) -> Self {
        CodeBuilder {
            name: name.to_string(),
            argcount: 0,
            flags: CodeFlags::empty(),
            first_line: 1,
            line: 1,
            fuse: false,
            prims: Vec::new(),
            labels: Vec::new(),
            consts: Vec::new(),
            names: Vec::new(),
            varnames: Vec::new(),
            cellvars: Vec::new(),
            freevars: Vec::new(),
            error: None,
        }
    }

    // === Signature and metadata ===

    /// Declare positional parameters; they take the first local slots
    pub fn args(&mut self, names: &[&str]) -> &mut Self {
        for name in names {
            self.local(name);
        }
        self.argcount = names.len();
        self
    }

    /// Declare a `*args` parameter (after the positional ones)
    pub fn varargs(&mut self, name: &str) -> &mut Self {
        self.local(name);
        self.flags.insert(CodeFlags::VARARGS);
        self
    }

    /// Declare a `**kwargs` parameter (after `*args`, if any)
    pub fn varkeywords(&mut self, name: &str) -> &mut Self {
        self.local(name);
        self.flags.insert(CodeFlags::VARKEYWORDS);
        self
    }

    pub fn flag(&mut self, flag: CodeFlags) -> &mut Self {
        self.flags.insert(flag);
        self
    }

    /// Declare a cell variable. Cells must be declared before they are
    /// referenced, cellvars before freevars.
    pub fn cellvar(&mut self, name: &str) -> &mut Self {
        self.cellvars.push(Arc::from(name));
        self
    }

    /// Declare a free variable captured from an enclosing function
    pub fn freevar(&mut self, name: &str) -> &mut Self {
        self.freevars.push(Arc::from(name));
        self.flags.insert(CodeFlags::NESTED);
        self
    }

    /// Set the source line for following instructions
    pub fn line(&mut self, line: u32) -> &mut Self {
        if self.prims.is_empty() && self.line == self.first_line {
            self.first_line = line;
        }
        self.line = line;
        self
    }

    /// Pack adjacent primitives into superinstructions
    pub fn fuse(&mut self, enabled: bool) -> &mut Self {
        self.fuse = enabled;
        self
    }

    // === Tables ===

    /// Local slot for `name`, adding it if new
    pub fn local(&mut self, name: &str) -> u32 {
        index_of_or_push(&mut self.varnames, name)
    }

    /// Names-table index for `name`, adding it if new
    pub fn name(&mut self, name: &str) -> u32 {
        index_of_or_push(&mut self.names, name)
    }

    /// Constant pool index for `value`
    ///
    /// Scalars and strings are shared; other constants always get a slot.
    pub fn constant(&mut self, value: Value) -> u32 {
        let shareable = matches!(
            value,
            Value::None | Value::Bool(_) | Value::Int(_) | Value::Str(_)
        );
        if shareable {
            if let Some(i) = self
                .consts
                .iter()
                .position(|c| c.type_tag() == value.type_tag() && c.is_same(&value))
            {
                return i as u32;
            }
        }
        self.consts.push(value);
        (self.consts.len() - 1) as u32
    }

    /// Cell slot of a declared cell or free variable
    pub fn cell(&mut self, name: &str) -> u32 {
        if let Some(i) = self.cellvars.iter().position(|c| c.as_ref() == name) {
            return i as u32;
        }
        if let Some(i) = self.freevars.iter().position(|c| c.as_ref() == name) {
            return (self.cellvars.len() + i) as u32;
        }
        self.error
            .get_or_insert(CodeError::UnknownName(name.to_string()));
        0
    }

    // === Emission ===

    /// Emit a primitive without an argument
    pub fn emit(&mut self, op: Opcode) -> &mut Self {
        if op.has_arg() || op.is_superinstruction() {
            self.error.get_or_insert(CodeError::ArgumentMismatch { opcode: op });
        }
        self.push(op, PendingArg::None)
    }

    /// Emit a primitive with an argument
    pub fn emit_arg(&mut self, op: Opcode, arg: u32) -> &mut Self {
        if !op.has_arg() {
            self.error.get_or_insert(CodeError::ArgumentMismatch { opcode: op });
        }
        self.push(op, PendingArg::Value(arg))
    }

    fn push(&mut self, op: Opcode, arg: PendingArg) -> &mut Self {
        self.prims.push(Pending {
            op,
            arg,
            line: self.line,
        });
        self
    }

    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind `label` to the next emitted primitive
    pub fn bind(&mut self, label: Label) -> &mut Self {
        self.labels[label.0] = Some(self.prims.len());
        self
    }

    /// Emit a jump or block setup targeting `label`
    pub fn jump(&mut self, op: Opcode, label: Label) -> &mut Self {
        if !matches!(op.arg_kind(), ArgKind::RelJump | ArgKind::AbsJump) {
            self.error.get_or_insert(CodeError::ArgumentMismatch { opcode: op });
        }
        self.push(op, PendingArg::Label(label))
    }

    // === Convenience emitters ===

    pub fn load_const(&mut self, value: Value) -> &mut Self {
        let idx = self.constant(value);
        self.emit_arg(Opcode::LoadConst, idx)
    }

    pub fn load_fast(&mut self, name: &str) -> &mut Self {
        let idx = self.local(name);
        self.emit_arg(Opcode::LoadFast, idx)
    }

    pub fn store_fast(&mut self, name: &str) -> &mut Self {
        let idx = self.local(name);
        self.emit_arg(Opcode::StoreFast, idx)
    }

    pub fn delete_fast(&mut self, name: &str) -> &mut Self {
        let idx = self.local(name);
        self.emit_arg(Opcode::DeleteFast, idx)
    }

    pub fn load_global(&mut self, name: &str) -> &mut Self {
        let idx = self.name(name);
        self.emit_arg(Opcode::LoadGlobal, idx)
    }

    pub fn store_global(&mut self, name: &str) -> &mut Self {
        let idx = self.name(name);
        self.emit_arg(Opcode::StoreGlobal, idx)
    }

    pub fn load_attr(&mut self, name: &str) -> &mut Self {
        let idx = self.name(name);
        self.emit_arg(Opcode::LoadAttr, idx)
    }

    pub fn store_attr(&mut self, name: &str) -> &mut Self {
        let idx = self.name(name);
        self.emit_arg(Opcode::StoreAttr, idx)
    }

    pub fn load_deref(&mut self, name: &str) -> &mut Self {
        let idx = self.cell(name);
        self.emit_arg(Opcode::LoadDeref, idx)
    }

    pub fn store_deref(&mut self, name: &str) -> &mut Self {
        let idx = self.cell(name);
        self.emit_arg(Opcode::StoreDeref, idx)
    }

    pub fn load_closure(&mut self, name: &str) -> &mut Self {
        let idx = self.cell(name);
        self.emit_arg(Opcode::LoadClosure, idx)
    }

    pub fn compare(&mut self, op: CmpOp) -> &mut Self {
        self.emit_arg(Opcode::CompareOp, op as u32)
    }

    /// Call with `argc` positional arguments
    pub fn call(&mut self, argc: u32) -> &mut Self {
        self.emit_arg(Opcode::CallFunction, argc)
    }

    /// Call with positional and keyword arguments
    pub fn call_kw(&mut self, argc: u32, nkw: u32) -> &mut Self {
        self.emit_arg(Opcode::CallFunction, (nkw << 8) | argc)
    }

    /// Call that also unpacks `*args` and/or `**kwargs` from the stack top
    pub fn call_unpack(&mut self, argc: u32, nkw: u32, star: bool, dstar: bool) -> &mut Self {
        let op = match (star, dstar) {
            (false, false) => Opcode::CallFunction,
            (true, false) => Opcode::CallFunctionVar,
            (false, true) => Opcode::CallFunctionKw,
            (true, true) => Opcode::CallFunctionVarKw,
        };
        self.emit_arg(op, (nkw << 8) | argc)
    }

    /// `obj[lower:upper]` with the bounds that are present on the stack
    pub fn slice(&mut self, lower: bool, upper: bool) -> &mut Self {
        let op = match (lower, upper) {
            (false, false) => Opcode::Slice0,
            (true, false) => Opcode::Slice1,
            (false, true) => Opcode::Slice2,
            (true, true) => Opcode::Slice3,
        };
        self.emit(op)
    }

    pub fn return_value(&mut self) -> &mut Self {
        self.emit(Opcode::ReturnValue)
    }

    // === Finishing ===

    /// Resolve labels, optionally fuse, and build the code unit
    pub fn build(&self) -> CodeResult<Arc<CodeUnit>> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }

        let mut bound_at = vec![false; self.prims.len() + 1];
        for pos in self.labels.iter().flatten() {
            bound_at[*pos] = true;
        }

        // Group primitives into instructions.
        let mut groups: Vec<(Opcode, usize, usize)> = Vec::new();
        let mut i = 0;
        while i < self.prims.len() {
            let fused = if self.fuse {
                self.best_fusion(i, &bound_at)
            } else {
                None
            };
            match fused {
                Some(op) => {
                    let n = op.primitives().len();
                    groups.push((op, i, i + n));
                    i += n;
                }
                None => {
                    groups.push((self.prims[i].op, i, i + 1));
                    i += 1;
                }
            }
        }

        // Word offsets for every instruction and every primitive position.
        let mut prim_to_word = vec![0usize; self.prims.len() + 1];
        let mut ends = Vec::with_capacity(groups.len());
        let mut offset = 0;
        for &(_, start, end) in &groups {
            for p in start..end {
                prim_to_word[p] = offset;
            }
            let nargs = self.prims[start..end]
                .iter()
                .filter(|p| p.op.has_arg())
                .count();
            offset += 1 + nargs;
            ends.push(offset);
        }
        prim_to_word[self.prims.len()] = offset;

        let mut words = Vec::with_capacity(offset);
        let mut lines: Vec<(usize, u32)> = Vec::new();
        for (g, &(op, start, end)) in groups.iter().enumerate() {
            let ip = words.len();
            let line = self.prims[start].line;
            if lines.last().map(|(_, l)| *l) != Some(line) {
                lines.push((ip, line));
            }
            words.push(Word::opcode(op));
            for p in &self.prims[start..end] {
                let arg = match p.arg {
                    PendingArg::None => continue,
                    PendingArg::Value(v) => v,
                    PendingArg::Label(label) => {
                        let pos = self.labels[label.0].ok_or(CodeError::UnboundLabel(label.0))?;
                        let target = prim_to_word[pos];
                        match p.op.arg_kind() {
                            ArgKind::RelJump => {
                                let end_word = ends[g];
                                if target < end_word {
                                    return Err(CodeError::BadJumpTarget {
                                        index: ip,
                                        target: target as i64,
                                    });
                                }
                                (target - end_word) as u32
                            }
                            _ => target as u32,
                        }
                    }
                };
                words.push(Word::argument(arg)?);
            }
        }

        CodeUnit::new(CodeParts {
            name: self.name.clone(),
            argcount: self.argcount,
            flags: self.flags,
            first_line: self.first_line,
            words,
            consts: self.consts.clone(),
            names: self.names.clone(),
            varnames: self.varnames.clone(),
            cellvars: self.cellvars.clone(),
            freevars: self.freevars.clone(),
            lines,
        })
    }

    /// Longest superinstruction starting at `i` that no label splits
    fn best_fusion(&self, i: usize, bound_at: &[bool]) -> Option<Opcode> {
        ALL_OPCODES
            .iter()
            .copied()
            .filter(|op| op.is_superinstruction())
            .filter(|op| {
                let prims = op.primitives();
                let n = prims.len();
                i + n <= self.prims.len()
                    && prims
                        .iter()
                        .zip(&self.prims[i..i + n])
                        .all(|(want, have)| *want == have.op)
                    && !bound_at[i + 1..i + n].iter().any(|b| *b)
            })
            .max_by_key(|op| op.primitives().len())
    }
}

fn index_of_or_push(table: &mut Vec<Arc<str>>, name: &str) -> u32 {
    match table.iter().position(|n| n.as_ref() == name) {
        Some(i) => i as u32,
        None => {
            table.push(Arc::from(name));
            (table.len() - 1) as u32
        }
    }
}
