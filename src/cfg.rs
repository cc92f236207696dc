//! Basic blocks and the control-flow graph over them.

use std::collections::BTreeMap;

use crate::error::Result;
use crate::graph::{Dominance, Graph, NodeId};
use crate::insn::{Address, Instruction};
use crate::log::*;
use crate::pcode::PcodeOp;

/// Something a block is made of: an [`Instruction`] before lowering, a [`PcodeOp`] after.
pub trait BlockElem: Clone {
    fn addr(&self) -> Address;
    /// The micro-op that decides where control goes after this element
    fn last_op(&self) -> Option<&PcodeOp>;
}

impl BlockElem for Instruction {
    fn addr(&self) -> Address {
        self.addr
    }
    fn last_op(&self) -> Option<&PcodeOp> {
        self.ops.last()
    }
}

impl BlockElem for PcodeOp {
    fn addr(&self) -> Address {
        self.addr
    }
    fn last_op(&self) -> Option<&PcodeOp> {
        Some(self)
    }
}

/// A maximal straight-line run of elements
#[derive(Clone)]
pub struct Block<E> {
    pub start: Address,
    /// Address of the last element
    pub end: Address,
    pub elems: Vec<E>,
}

pub type InstructionBlock = Block<Instruction>;
pub type PcodeBlock = Block<PcodeOp>;

impl<E: BlockElem> Block<E> {
    fn from_elems(elems: Vec<E>) -> Option<Self> {
        Some(Self {
            start: elems.first()?.addr(),
            end: elems.last()?.addr(),
            elems,
        })
    }

    /// `start <= addr <= end`
    pub fn contains(&self, addr: Address) -> bool {
        self.start <= addr && addr <= self.end
    }

    /// `start < addr <= end`, i.e., `addr` is inside the block but not its first element
    pub fn contains_exclusive(&self, addr: Address) -> bool {
        self.start < addr && addr <= self.end
    }

    /// The control transfer ending this block, if it ends in one
    pub fn terminator(&self) -> Option<&PcodeOp> {
        self.elems
            .last()
            .and_then(|e| e.last_op())
            .filter(|op| op.terminates())
    }

    /// Split off everything from `at` onwards into a new block, leaving the head in `self`.
    pub fn split(&mut self, at: Address) -> Result<Self> {
        let idx = self
            .elems
            .iter()
            .position(|e| e.addr() == at)
            .filter(|&i| i > 0)
            .ok_or_else(|| {
                structure_error!(
                    "Cannot split block {}..={} at {}: no element starts there",
                    self.start,
                    self.end,
                    at
                )
            })?;
        let tail = self.elems.split_off(idx);
        self.end = self.elems[idx - 1].addr();
        Ok(Self {
            start: at,
            end: tail[tail.len() - 1].addr(),
            elems: tail,
        })
    }
}

impl Block<Instruction> {
    /// Flatten into a block of micro-ops
    pub fn lower(&self) -> PcodeBlock {
        Block {
            start: self.start,
            end: self.end,
            elems: self
                .elems
                .iter()
                .flat_map(|i| i.ops.iter().cloned())
                .collect(),
        }
    }
}

impl<E: std::fmt::Debug> std::fmt::Debug for Block<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "block {}..={}", self.start, self.end)?;
        for e in &self.elems {
            writeln!(f, "  {:?}", e)?;
        }
        Ok(())
    }
}

/// Work-list state: continue at `addr`, with `buffer` holding the instructions of a block still
/// being formed, which is entered from `pred`.
struct Work {
    addr: Address,
    buffer: Vec<Instruction>,
    pred: Option<NodeId>,
}

struct Builder<'a> {
    insns: &'a [Instruction],
    by_addr: BTreeMap<Address, usize>,
    graph: Graph<InstructionBlock>,
    starts: BTreeMap<Address, NodeId>,
}

impl<'a> Builder<'a> {
    fn new(insns: &'a [Instruction]) -> Result<Self> {
        let mut by_addr = BTreeMap::new();
        for (i, insn) in insns.iter().enumerate() {
            if by_addr.insert(insn.addr, i).is_some() {
                return Err(malformed_error!("Duplicate instruction at {}", insn.addr));
            }
        }
        Ok(Self {
            insns,
            by_addr,
            graph: Graph::new(),
            starts: BTreeMap::new(),
        })
    }

    /// Turn a non-empty buffer into a block entered from `pred`. Returns the node control now
    /// flows out of: the new block, or `pred` itself when there was nothing to flush.
    fn flush(&mut self, buffer: Vec<Instruction>, pred: Option<NodeId>) -> Result<Option<NodeId>> {
        let block = match Block::from_elems(buffer) {
            Some(b) => b,
            None => return Ok(pred),
        };
        let start = block.start;
        let id = self.graph.add_node(block);
        self.starts.insert(start, id);
        if let Some(p) = pred {
            self.graph.add_edge(p, id)?;
        }
        trace!("Formed block"; "id" => ?id, "start" => %start, "pred" => ?pred);
        Ok(Some(id))
    }

    /// The already-formed block that holds `addr` somewhere after its first element
    fn block_containing(&self, addr: Address) -> Option<NodeId> {
        let (_, &id) = self.starts.range(..addr).next_back()?;
        if self.graph.node(id).contains_exclusive(addr) {
            Some(id)
        } else {
            None
        }
    }

    /// Split block `id` at `at`, moving its outgoing edges to the new tail block
    fn split(&mut self, id: NodeId, at: Address) -> Result<NodeId> {
        let tail = self.graph.node_mut(id).split(at)?;
        let tail = self.graph.add_node(tail);
        self.starts.insert(at, tail);
        for s in self.graph.successors(id).to_vec() {
            self.graph.remove_edge(id, s)?;
            self.graph.add_edge(tail, s)?;
        }
        self.graph.add_edge(id, tail)?;
        debug!("Split block"; "head" => ?id, "tail" => ?tail, "at" => %at);
        Ok(tail)
    }

    fn run(mut self, entry: Address) -> Result<Graph<InstructionBlock>> {
        let mut work = vec![Work {
            addr: entry,
            buffer: vec![],
            pred: None,
        }];

        while let Some(Work { addr, buffer, pred }) = work.pop() {
            if let Some(&existing) = self.starts.get(&addr) {
                if let Some(from) = self.flush(buffer, pred)? {
                    self.graph.add_edge(from, existing)?;
                }
                continue;
            }

            if let Some(existing) = self.block_containing(addr) {
                let from = self.flush(buffer, pred)?;
                let tail = self.split(existing, addr)?;
                // Pending edges out of the split block now leave from its tail
                for w in work.iter_mut() {
                    if w.pred == Some(existing) {
                        w.pred = Some(tail);
                    }
                }
                if let Some(from) = from {
                    let from = if from == existing { tail } else { from };
                    self.graph.add_edge(from, tail)?;
                }
                continue;
            }

            let insn = match self.by_addr.get(&addr) {
                Some(&i) => self.insns[i].clone(),
                None => {
                    if buffer.is_empty() {
                        debug!("Control leaves the function"; "to" => %addr, "from" => ?pred);
                    }
                    self.flush(buffer, pred)?;
                    continue;
                }
            };

            let mut buffer = buffer;
            if !insn.terminates() {
                let next = insn.next;
                buffer.push(insn);
                work.push(Work {
                    addr: next,
                    buffer,
                    pred,
                });
                continue;
            }

            let target = insn.target();
            let fallthrough = insn.fallthrough();
            if insn.is_indirect() {
                warn!("Indirect branch is not modelled; block gets no successors"; "at" => %insn.addr);
            } else if insn.branches() && target.is_none() {
                warn!("Branch without a static target"; "at" => %insn.addr);
            }
            buffer.push(insn);
            let block = self.flush(buffer, pred)?;
            if let Some(target) = target {
                work.push(Work {
                    addr: target,
                    buffer: vec![],
                    pred: block,
                });
            }
            if let Some(fallthrough) = fallthrough {
                work.push(Work {
                    addr: fallthrough,
                    buffer: vec![],
                    pred: block,
                });
            }
        }

        self.sorted()
    }

    /// Renumber blocks in order of start address
    fn sorted(self) -> Result<Graph<InstructionBlock>> {
        let order: Vec<NodeId> = self.starts.values().copied().collect();
        let mut renum = vec![NodeId(0); self.graph.len()];
        for (i, &old) in order.iter().enumerate() {
            renum[old.0] = NodeId(i);
        }
        let mut g = Graph::new();
        for &old in &order {
            g.add_node(self.graph.node(old).clone());
        }
        for &old in &order {
            for &s in self.graph.successors(old) {
                g.add_edge(renum[old.0], renum[s.0])?;
            }
        }
        Ok(g)
    }
}

/// Partition `insns` (sorted, unique addresses, entry first) into basic blocks reachable from the
/// first instruction. The returned graph's ids follow block start addresses.
pub fn decompose_into_blocks(insns: &[Instruction]) -> Result<Graph<InstructionBlock>> {
    let entry = insns
        .first()
        .ok_or_else(|| malformed_error!("Function has no instructions"))?
        .addr;
    Builder::new(insns)?.run(entry)
}

/// A control-flow graph with a single entry and its dominance information
#[derive(Clone)]
pub struct Cfg<E> {
    pub graph: Graph<Block<E>>,
    pub entry: NodeId,
    pub dom: Dominance,
}

impl Cfg<Instruction> {
    /// Build the instruction-level CFG of a function whose first instruction is its entry.
    pub fn from_instructions(insns: &[Instruction]) -> Result<Self> {
        let graph = decompose_into_blocks(insns)?;
        let start = insns
            .first()
            .ok_or_else(|| malformed_error!("Function has no instructions"))?
            .addr;
        let cfg = Cfg::new(graph, start)?;
        debug!("Built instruction CFG"; "blocks" => cfg.graph.len(), "entry" => ?cfg.entry);
        Ok(cfg)
    }

    /// Copy into a micro-op level CFG with the same block ids and edges
    pub fn lower(&self) -> Result<Cfg<PcodeOp>> {
        let graph = self.graph.copy(|_, b| b.lower());
        Ok(Cfg {
            graph,
            entry: self.entry,
            dom: self.dom.clone(),
        })
    }
}

impl<E: BlockElem> Cfg<E> {
    /// Wrap `graph`, locating its entry and computing dominance. The entry is the block with no
    /// predecessors; if every block has one (a loop back to the head of the function), it is the
    /// block starting at `function_start`.
    pub fn new(graph: Graph<Block<E>>, function_start: Address) -> Result<Self> {
        let roots = graph.roots();
        let entry = match roots.as_slice() {
            [entry] => *entry,
            [] => graph
                .iter()
                .find(|(_, b)| b.start == function_start)
                .map(|(id, _)| id)
                .ok_or_else(|| structure_error!("No block starts at {}", function_start))?,
            _ => {
                return Err(structure_error!(
                    "Graph has {} entry candidates: {:?}",
                    roots.len(),
                    roots
                ))
            }
        };
        let dom = Dominance::compute(&graph, entry)?;
        Ok(Self { graph, entry, dom })
    }

    /// Recompute dominance after the graph was edited
    pub fn recompute(&mut self) -> Result<()> {
        let start = self.graph.node(self.entry).start;
        let graph = std::mem::take(&mut self.graph);
        *self = Self::new(graph, start)?;
        Ok(())
    }

    pub fn block_at(&self, addr: Address) -> Option<NodeId> {
        self.graph
            .iter()
            .find(|(_, b)| b.start == addr)
            .map(|(id, _)| id)
    }

    /// Successor taken when the block's branch is taken. For an unconditional branch this is the
    /// lone successor.
    pub fn target(&self, id: NodeId) -> Option<NodeId> {
        let succs = self.graph.successors(id);
        let term = self.graph.node(id).terminator()?;
        if !term.branches() || term.is_indirect() {
            return None;
        }
        if !term.is_conditional() {
            return succs.first().copied();
        }
        let dest = Address::machine(term.target()?);
        succs
            .iter()
            .copied()
            .find(|&s| self.graph.node(s).start == dest)
    }

    /// Successor reached when the block's branch is not taken. For an unconditional branch this
    /// is the lone successor, the same as [`Self::target`].
    pub fn fallthrough(&self, id: NodeId) -> Option<NodeId> {
        let succs = self.graph.successors(id);
        let conditional = self
            .graph
            .node(id)
            .terminator()
            .map_or(false, |t| t.is_conditional());
        if conditional && succs.len() == 2 {
            let target = self.target(id);
            succs.iter().copied().find(|&s| Some(s) != target)
        } else {
            succs.first().copied()
        }
    }
}

impl<E: BlockElem + std::fmt::Debug> std::fmt::Debug for Cfg<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (id, b) in self.graph.iter() {
            write!(f, "{:?} {:?}", id, b)?;
            writeln!(
                f,
                "  preds {:?} succs {:?}",
                self.graph.predecessors(id),
                self.graph.successors(id)
            )?;
        }
        Ok(())
    }
}
