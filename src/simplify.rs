//! Simplification of SSA code: algebraic identities, copy propagation and dead-code elimination.

use crate::config::DecompilerConfig;
use crate::error::Result;
use crate::graph::NodeId;
use crate::location::Location;
use crate::log::*;
use crate::pcode::Opcode;
use crate::ssa::{OpId, SsaArena, SsaFunction, ValueId};

/// What an operation reduces to under the algebraic table
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Reduction {
    /// The value of one of its inputs
    Identity(ValueId),
    /// The constant zero
    Zero,
}

/// Look up `op` in the table of algebraic identities.
///
/// | pattern          | operation                        | result |
/// |------------------|----------------------------------|--------|
/// | `a OP 0`         | OR, ADD, SUB, XOR, shifts        | `a`    |
/// | `a OP 0`         | AND, MULT                        | `0`    |
/// | `a OP 1`         | MULT, DIV, SDIV                  | `a`    |
/// | all inputs equal | AND, OR, MULTIEQUAL              | `a`    |
/// | all inputs equal | XOR                              | `0`    |
pub fn reduction(arena: &SsaArena, op: OpId) -> Option<Reduction> {
    use Opcode::*;
    let o = arena.op(op);
    if o.removed || o.output.is_none() {
        return None;
    }
    let inputs = o.inputs.as_slice();

    if let [a, b] = inputs {
        match (o.opcode, arena.const_value(*b)) {
            (IntOr | IntAdd | IntSub | IntXor | IntLeft | IntRight | IntSRight, Some(0)) => {
                return Some(Reduction::Identity(*a))
            }
            (IntAnd | IntMult, Some(0)) => return Some(Reduction::Zero),
            (IntMult | IntDiv | IntSDiv, Some(1)) => return Some(Reduction::Identity(*a)),
            _ => {}
        }
    }

    if let [first, rest @ ..] = inputs {
        if !rest.is_empty() && rest.iter().all(|v| v == first) {
            match o.opcode {
                IntAnd | IntOr | MultiEqual => return Some(Reduction::Identity(*first)),
                IntXor => return Some(Reduction::Zero),
                _ => {}
            }
        }
    }

    None
}

/// Apply the algebraic table to `op`, turning it into a `COPY` when it matches. Returns whether
/// the operation was rewritten.
pub fn rewrite_algebraically(arena: &mut SsaArena, op: OpId) -> bool {
    let red = match reduction(arena, op) {
        Some(r) => r,
        None => return false,
    };
    let src = match red {
        Reduction::Identity(v) => v,
        Reduction::Zero => {
            let size = match arena.op(op).output {
                Some(out) => arena.value(out).loc.size,
                None => return false,
            };
            arena.constant(Location::constant(0, size))
        }
    };
    // A phi whose inputs are all its own result has nothing to copy from
    if arena.op(op).output == Some(src) {
        return false;
    }
    trace!("Algebraic rewrite"; "op" => ?op, "opcode" => %arena.op(op).opcode, "to" => ?red);
    arena.rewrite(op, Opcode::Copy, vec![src]);
    true
}

/// `op` is a copy whose uses can all be pointed at its source
fn is_propagatable(arena: &SsaArena, op: OpId) -> bool {
    let o = arena.op(op);
    if o.removed || !o.is_copy() || o.inputs.len() != 1 {
        return false;
    }
    let out = match o.output {
        Some(out) => out,
        None => return false,
    };
    if out == o.inputs[0] {
        return false;
    }
    // Phis only ever receive other phis' results and constants
    o.from_phi
        || arena.value(o.inputs[0]).is_const()
        || arena
            .value(out)
            .uses
            .iter()
            .all(|u| !arena.op(u.op).is_phi())
}

/// `op` computes a value nobody reads and has no other effect
fn is_dead(arena: &SsaArena, op: OpId) -> bool {
    let o = arena.op(op);
    !o.removed
        && !o.opcode.has_side_effects()
        && o.clobbers.is_empty()
        && arena.output_uses(op) == Some(0)
}

/// What one run of [`simplify_block`] did
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct Progress {
    /// Operations removed by propagation or as dead code
    pub removed: usize,
    /// Operations rewritten in place by the algebraic table
    pub rewritten: usize,
}

impl Progress {
    /// The block's operation count changed
    pub fn count_changed(&self) -> bool {
        self.removed > 0
    }

    pub fn changed(&self) -> bool {
        self.removed > 0 || self.rewritten > 0
    }
}

/// Simplify the operations of block `b` until nothing more applies locally.
pub fn simplify_block(func: &mut SsaFunction, b: NodeId, config: &DecompilerConfig) -> Progress {
    let mut progress = Progress::default();
    loop {
        let mut changed = false;
        for op in func.block_ops[b.0].clone() {
            let arena = &mut func.arena;
            if arena.op(op).removed {
                continue;
            }
            if config.enable_algebraic_rewrites && rewrite_algebraically(arena, op) {
                progress.rewritten += 1;
                changed = true;
            }
            if config.enable_copy_propagation && is_propagatable(arena, op) {
                let o = arena.op(op);
                if let Some(out) = o.output {
                    let src = o.inputs[0];
                    arena.replace_all_uses(out, src);
                    arena.remove_op(op);
                    progress.removed += 1;
                    changed = true;
                    continue;
                }
            }
            if is_dead(arena, op) {
                arena.remove_op(op);
                progress.removed += 1;
                changed = true;
            }
        }
        let arena = &func.arena;
        func.block_ops[b.0].retain(|&op| !arena.op(op).removed);
        if !changed {
            break;
        }
    }
    progress
}

/// Simplify every block, in postorder, until a whole pass changes nothing; then drop blocks that
/// became empty. Returns the number of passes.
pub fn simplify(func: &mut SsaFunction, config: &DecompilerConfig) -> Result<usize> {
    if !config.enable_simplification {
        return Ok(0);
    }
    let mut passes = 0;
    loop {
        passes += 1;
        let mut changed = false;
        for b in func.cfg.dom.postorder().to_vec() {
            changed |= simplify_block(func, b, config).changed();
        }
        if !changed {
            break;
        }
    }
    debug!("Simplified"; "passes" => passes, "ops" => func.live_ops().count());
    if config.enable_empty_block_pruning {
        prune_empty_blocks(func)?;
    }
    Ok(passes)
}

/// Splice out blocks left with no operations. Only blocks with a single predecessor and a single
/// successor are dropped, and only when doing so neither duplicates an edge nor hides the taken
/// side of a conditional branch. The entry block is kept.
pub fn prune_empty_blocks(func: &mut SsaFunction) -> Result<usize> {
    let cfg = &func.cfg;
    let mut dropped = vec![false; cfg.graph.len()];
    let mut candidates = vec![];
    for b in cfg.graph.ids() {
        if b == cfg.entry || !func.block_ops[b.0].is_empty() || !cfg.dom.is_reachable(b) {
            continue;
        }
        if let ([p], [s]) = (cfg.graph.predecessors(b), cfg.graph.successors(b)) {
            let conditional_target = cfg
                .graph
                .node(*p)
                .terminator()
                .map_or(false, |t| t.is_conditional())
                && cfg.target(*p) == Some(b);
            if *p != b && *s != b && !conditional_target {
                candidates.push(b);
            }
        }
    }

    for b in candidates {
        // Earlier splices may have changed this block's neighbourhood
        let ok = match (func.cfg.graph.predecessors(b), func.cfg.graph.successors(b)) {
            ([p], [s]) => *p != b && *s != b && !func.cfg.graph.has_edge(*p, *s),
            _ => false,
        };
        if ok {
            func.cfg.graph.bypass(b)?;
            dropped[b.0] = true;
        }
    }

    let count = dropped.iter().filter(|d| **d).count();
    if count == 0 {
        return Ok(0);
    }

    let graph = std::mem::take(&mut func.cfg.graph);
    let (graph, remap) = graph.retain(|id, _| !dropped[id.0]);
    let entry = remap[func.cfg.entry.0]
        .ok_or_else(|| structure_error!("Entry block was dropped"))?;
    func.block_ops = std::mem::take(&mut func.block_ops)
        .into_iter()
        .enumerate()
        .filter(|(i, _)| !dropped[*i])
        .map(|(_, ops)| ops)
        .collect();
    func.cfg.graph = graph;
    func.cfg.entry = entry;
    func.cfg.recompute()?;
    debug!("Dropped empty blocks"; "count" => count);
    Ok(count)
}
