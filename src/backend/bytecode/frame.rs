//! Execution frames
//!
//! A [`Frame`] is the complete dynamic state of one activation. Both the
//! interpreter and native code run directly on it, so handing a frame from
//! one tier to the other needs no translation: at any instruction boundary
//! the value stack, locals, block stack and `ip` mean the same thing to both.

use std::sync::Arc;

use smallvec::SmallVec;

use super::code::CodeUnit;
use super::vm::{VmError, VmResult};
use crate::backend::object::{Cell, ExceptionKind, ExceptionObj, Namespace, TracebackEntry, Value};

/// Maximum nesting of loop/except/finally blocks in one frame
pub const MAX_BLOCKS: usize = 20;

/// Kind of an entry on the block stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKind {
    Loop,
    Except,
    Finally,
}

impl BlockKind {
    pub fn name(self) -> &'static str {
        match self {
            BlockKind::Loop => "loop",
            BlockKind::Except => "except",
            BlockKind::Finally => "finally",
        }
    }
}

/// Handler descriptor pushed by `SETUP_*`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub kind: BlockKind,
    /// Instruction index of the handler
    pub handler: usize,
    /// Value stack depth when the block was entered
    pub level: usize,
}

/// One activation of a code unit
pub struct Frame {
    pub code: Arc<CodeUnit>,
    pub globals: Arc<Namespace>,
    pub builtins: Arc<Namespace>,
    pub stack: Vec<Value>,
    pub locals: Vec<Option<Value>>,
    /// Cell variables followed by free variables
    pub cells: Vec<Arc<Cell>>,
    pub blocks: SmallVec<[Block; 8]>,
    /// Index of the next instruction to execute
    pub ip: usize,
    /// Start of the last instruction begun; `None` before the first one
    ///
    /// For a suspended generator this is the index of the `YIELD_VALUE`.
    pub lasti: Option<usize>,
    /// Exception being handled by an `except` clause, for bare `raise`
    pub exc_info: Option<Arc<ExceptionObj>>,
}

impl Frame {
    pub fn new(code: Arc<CodeUnit>, globals: Arc<Namespace>, builtins: Arc<Namespace>) -> Self {
        let nlocals = code.varnames().len();
        let cells = (0..code.cellvars().len()).map(|_| Cell::new(None)).collect();
        Frame {
            stack: Vec::with_capacity(16),
            locals: vec![None; nlocals],
            cells,
            blocks: SmallVec::new(),
            ip: 0,
            lasti: None,
            exc_info: None,
            code,
            globals,
            builtins,
        }
    }

    // === Value stack ===

    #[inline]
    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    #[inline]
    pub fn pop(&mut self) -> VmResult<Value> {
        self.stack.pop().ok_or(VmError::StackUnderflow {
            ip: self.lasti.unwrap_or(self.ip),
        })
    }

    /// Pop `n` values, returned in push order
    pub fn pop_n(&mut self, n: usize) -> VmResult<Vec<Value>> {
        if self.stack.len() < n {
            return Err(VmError::StackUnderflow {
                ip: self.lasti.unwrap_or(self.ip),
            });
        }
        let at = self.stack.len() - n;
        Ok(self.stack.split_off(at))
    }

    /// Value `depth` slots below the top (0 is the top)
    #[inline]
    pub fn peek(&self, depth: usize) -> VmResult<&Value> {
        let len = self.stack.len();
        if depth >= len {
            return Err(VmError::StackUnderflow {
                ip: self.lasti.unwrap_or(self.ip),
            });
        }
        Ok(&self.stack[len - 1 - depth])
    }

    // === Locals and cells ===

    pub fn load_local(&self, idx: u32) -> VmResult<Value> {
        match self.locals.get(idx as usize) {
            Some(Some(v)) => Ok(v.clone()),
            Some(None) => Err(VmError::raise(
                ExceptionKind::UnboundLocalError,
                format!(
                    "local variable '{}' referenced before assignment",
                    self.code.varnames()[idx as usize]
                ),
            )),
            None => Err(VmError::InvalidLocal(idx)),
        }
    }

    pub fn store_local(&mut self, idx: u32, value: Value) -> VmResult<()> {
        let slot = self
            .locals
            .get_mut(idx as usize)
            .ok_or(VmError::InvalidLocal(idx))?;
        *slot = Some(value);
        Ok(())
    }

    pub fn delete_local(&mut self, idx: u32) -> VmResult<()> {
        let slot = self
            .locals
            .get_mut(idx as usize)
            .ok_or(VmError::InvalidLocal(idx))?;
        if slot.take().is_none() {
            return Err(VmError::raise(
                ExceptionKind::UnboundLocalError,
                format!(
                    "local variable '{}' referenced before assignment",
                    self.code.varnames()[idx as usize]
                ),
            ));
        }
        Ok(())
    }

    pub fn cell(&self, idx: u32) -> VmResult<&Arc<Cell>> {
        self.cells.get(idx as usize).ok_or(VmError::InvalidCell(idx))
    }

    // === Block stack ===

    pub fn push_block(&mut self, kind: BlockKind, handler: usize) -> VmResult<()> {
        if self.blocks.len() >= MAX_BLOCKS {
            return Err(VmError::BlockStackOverflow {
                ip: self.lasti.unwrap_or(self.ip),
            });
        }
        self.blocks.push(Block {
            kind,
            handler,
            level: self.stack.len(),
        });
        Ok(())
    }

    pub fn pop_block(&mut self) -> VmResult<Block> {
        self.blocks.pop().ok_or(VmError::BlockStackUnderflow {
            ip: self.lasti.unwrap_or(self.ip),
        })
    }

    // === Tracebacks ===

    /// Source line of the instruction currently executing
    pub fn line(&self) -> u32 {
        self.code.line_for(self.lasti.unwrap_or(self.ip))
    }

    /// Bound locals and cell contents, by name
    pub fn locals_snapshot(&self) -> Vec<(Arc<str>, Value)> {
        let varnames = self.code.varnames();
        let mut out: Vec<(Arc<str>, Value)> = self
            .locals
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.as_ref().map(|v| (varnames[i].clone(), v.clone())))
            .collect();
        for (i, cell) in self.cells.iter().enumerate() {
            if let (Some(name), Some(value)) = (self.code.cell_name(i), cell.get()) {
                if !out.iter().any(|(n, _)| n == name) {
                    out.push((name.clone(), value));
                }
            }
        }
        out
    }

    /// Add this frame to an exception's traceback
    pub fn record_traceback(&self, exc: &ExceptionObj) {
        let lasti = self.lasti.unwrap_or(self.ip);
        exc.push_traceback(TracebackEntry {
            function: Arc::from(self.code.name()),
            line: self.code.line_for(lasti),
            lasti,
            locals: self.locals_snapshot(),
        });
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("code", &self.code.name())
            .field("ip", &self.ip)
            .field("lasti", &self.lasti)
            .field("stack", &self.stack)
            .field("blocks", &self.blocks)
            .finish()
    }
}
