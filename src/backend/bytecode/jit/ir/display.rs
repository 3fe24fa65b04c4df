//! Textual IR dump.

use std::fmt;

use super::{IrFunction, IrOp, Terminator};

impl fmt::Display for IrFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "function {} (unit {}) level {} max_depth {}",
            self.name, self.code_id, self.level, self.max_depth
        )?;

        for (i, h) in self.handlers.iter().enumerate() {
            write!(
                f,
                "  h{}: {} @{} -> {} (@{})",
                i,
                h.kind.name(),
                h.setup_ip,
                h.target,
                h.target_ip
            )?;
            if let Some(depth) = h.depth {
                write!(f, " depth {}", depth)?;
            }
            if let Some(parent) = h.parent {
                write!(f, " in {}", parent)?;
            }
            writeln!(f)?;
        }
        for (lasti, block) in &self.resume {
            writeln!(f, "  resume @{} -> {}", lasti, block)?;
        }
        for (i, a) in self.assumptions.iter().enumerate() {
            writeln!(
                f,
                "  assume g{}: {} = {} ({} v{}, builtins v{})",
                i,
                a.name,
                a.value.repr(),
                if a.builtin { "builtin" } else { "global" },
                a.globals_version,
                a.builtins_version
            )?;
        }

        for block in &self.blocks {
            write!(f, "{} @{}:", block.id, block.start)?;
            match block.depth {
                Some(d) => write!(f, " depth {}", d)?,
                None => write!(f, " unreachable")?,
            }
            if !block.handlers.is_empty() {
                let hs: Vec<String> = block.handlers.iter().map(|h| h.to_string()).collect();
                write!(f, " [{}]", hs.join(" "))?;
            }
            writeln!(f)?;

            for inst in &block.insts {
                match &inst.op {
                    IrOp::SafePoint(kind) => writeln!(f, "    safepoint {:?}", kind)?,
                    IrOp::GuardGlobals {
                        globals_version,
                        builtins_version,
                        ..
                    } => writeln!(
                        f,
                        "    guard_globals v{} builtins v{}",
                        globals_version, builtins_version
                    )?,
                    IrOp::Begin { next } => writeln!(f, "  {:>4}: begin -> {}", inst.site.ip, next)?,
                    IrOp::Prim { op, arg: Some(arg) } => writeln!(f, "    {} {}", op, arg)?,
                    IrOp::Prim { op, arg: None } => writeln!(f, "    {}", op)?,
                    IrOp::PushHandler(h) => writeln!(f, "    push_handler {}", h)?,
                    IrOp::LoadCached(a) => writeln!(f, "    load_cached g{}", a)?,
                    IrOp::IntBinary { op } => writeln!(f, "    {} [int]", op)?,
                    IrOp::CallDirect { arg, expected } => {
                        writeln!(f, "    call_direct {} expecting {}", arg, expected.repr())?
                    }
                }
            }

            match &block.term {
                Terminator::Goto(b) => writeln!(f, "    goto {}", b)?,
                Terminator::Branch {
                    op,
                    taken,
                    fallthrough,
                    ..
                } => writeln!(f, "    {} taken {} else {}", op, taken, fallthrough)?,
                Terminator::Speculate {
                    op, expected, next, ..
                } => writeln!(f, "    speculate {} {} -> {}", op, expected, next)?,
                Terminator::ForIter { body, exit, .. } => {
                    writeln!(f, "    FOR_ITER body {} exit {}", body, exit)?
                }
                Terminator::Return { .. } => writeln!(f, "    return")?,
                Terminator::Yield { resume, .. } => writeln!(f, "    yield resume {}", resume)?,
                Terminator::Unwind {
                    op, fallthrough, ..
                } => match fallthrough {
                    Some(b) => writeln!(f, "    unwind {} else {}", op, b)?,
                    None => writeln!(f, "    unwind {}", op)?,
                },
                Terminator::Trap { ip } => writeln!(f, "    trap @{}", ip)?,
            }
        }
        Ok(())
    }
}
