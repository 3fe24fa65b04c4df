//! CFG cleanup
//!
//! Level 1 and above thread jumps through blocks that do nothing but jump,
//! then drop blocks no edge reaches. Blocks the unwinder or a generator
//! resume can enter (handlers, resume points, `continue` targets) are
//! pinned: they are never threaded over and never removed.

use std::collections::HashSet;

use tracing::trace;

use super::{BlockId, IrFunction, Terminator};
use crate::backend::bytecode::opcodes::Opcode;

/// Run every cleanup pass; returns `(edges threaded, blocks removed)`
pub fn cleanup(func: &mut IrFunction) -> (usize, usize) {
    let threaded = thread_jumps(func);
    let removed = remove_unreachable(func);
    trace!(
        target: "tiervm::jit::ir",
        unit = %func.name,
        threaded,
        removed,
        "cfg cleanup"
    );
    (threaded, removed)
}

/// Blocks entered other than through a static edge
fn pinned(func: &IrFunction) -> HashSet<BlockId> {
    let mut pinned = HashSet::new();
    pinned.insert(func.entry);
    pinned.extend(func.handlers.iter().map(|h| h.target));
    pinned.extend(func.resume.iter().map(|(_, b)| *b));
    for block in &func.blocks {
        if let Terminator::Unwind {
            op: Opcode::ContinueLoop,
            arg: Some(target),
            ..
        } = block.term
        {
            pinned.extend(func.block_at(target as usize));
        }
    }
    pinned
}

/// Redirect edges that land on a trivial jump to its final destination
pub fn thread_jumps(func: &mut IrFunction) -> usize {
    let pinned = pinned(func);
    let forward: Vec<Option<BlockId>> = func
        .blocks
        .iter()
        .map(|b| match b.term {
            Terminator::Goto(t) if b.is_trivial_jump() && !pinned.contains(&b.id) => Some(t),
            _ => None,
        })
        .collect();

    let resolve = |mut id: BlockId| {
        for _ in 0..forward.len() {
            match forward[id.index()] {
                Some(next) if next != id => id = next,
                _ => break,
            }
        }
        id
    };

    let mut count = 0;
    for block in &mut func.blocks {
        for succ in block.term.successors_mut() {
            let resolved = resolve(*succ);
            if resolved != *succ {
                *succ = resolved;
                count += 1;
            }
        }
    }
    count
}

/// Drop blocks unreachable from the entry and the pinned blocks, then
/// renumber the survivors
pub fn remove_unreachable(func: &mut IrFunction) -> usize {
    let mut reachable = vec![false; func.blocks.len()];
    let mut stack: Vec<BlockId> = pinned(func).into_iter().collect();
    while let Some(id) = stack.pop() {
        if std::mem::replace(&mut reachable[id.index()], true) {
            continue;
        }
        stack.extend(func.successors(id).into_iter().filter(|s| !reachable[s.index()]));
    }

    let removed = reachable.iter().filter(|r| !**r).count();
    if removed == 0 {
        return 0;
    }

    let mut renumber = vec![None; func.blocks.len()];
    let mut next = 0u32;
    for (old, live) in reachable.iter().enumerate() {
        if *live {
            renumber[old] = Some(BlockId(next));
            next += 1;
        }
    }
    let map = |id: BlockId| renumber[id.index()].unwrap_or(id);

    let blocks = std::mem::take(&mut func.blocks);
    func.blocks = blocks
        .into_iter()
        .filter(|b| reachable[b.id.index()])
        .map(|mut b| {
            b.id = map(b.id);
            for succ in b.term.successors_mut() {
                *succ = map(*succ);
            }
            b
        })
        .collect();
    for handler in &mut func.handlers {
        handler.target = map(handler.target);
    }
    for (_, block) in &mut func.resume {
        *block = map(*block);
    }
    func.entry = map(func.entry);
    removed
}
