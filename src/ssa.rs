//! Static single assignment form of a function's micro-ops.
//!
//! Conversion follows the classic scheme of Cytron et al.:
//!
//! > Cytron R., Ferrante J., Rosen B. K., Wegman M. N., Zadeck F. K. (1991) Efficiently Computing
//! > Static Single Assignment Form and the Control Dependence Graph. ACM TOPLAS 13(4).
//! > <https://doi.org/10.1145/115372.115320>
//!
//! Phis are placed at the iterated dominance frontier of each location's writing blocks, and
//! locations are then renamed by a walk over the dominator tree. Entering a block pushes the new
//! versions it defines onto per-location stacks ([`VersionStacks`]); leaving it pops them, so that
//! sibling subtrees never observe each other's definitions.
//!
//! Values and operations live in arenas ([`SsaArena`]) and refer to each other by index: each
//! value knows its defining operation and every use of it.

use std::cell::RefCell;

use crate::abi::Abi;
use crate::cfg::Cfg;
use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use crate::containers::InsertionOrderedSet;
use crate::error::Result;
use crate::graph::NodeId;
use crate::insn::Address;
use crate::location::Location;
use crate::log::*;
use crate::pcode::{Opcode, PcodeOp};

/// Index of an [`SsaValue`]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ValueId(pub usize);

/// Index of an [`SsaOp`]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpId(pub usize);

impl std::fmt::Debug for ValueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s{}", self.0)
    }
}

impl std::fmt::Debug for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "op{}", self.0)
    }
}

/// Which operand of an operation a use occupies
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum Slot {
    /// A regular input
    Input(usize),
    /// A location a return reads on behalf of the caller
    Observed(usize),
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Use {
    pub op: OpId,
    pub slot: Slot,
}

/// A versioned location
#[derive(Clone, Debug)]
pub struct SsaValue {
    pub loc: Location,
    /// `0` for function inputs and constants, counting up from `1` for each definition of `loc`
    pub version: u32,
    pub def: Option<OpId>,
    pub uses: Vec<Use>,
}

impl SsaValue {
    pub fn is_const(&self) -> bool {
        self.loc.is_const()
    }

    /// A value live on entry to the function: read before any write reaches it
    pub fn is_function_input(&self) -> bool {
        self.def.is_none() && !self.loc.is_const()
    }
}

/// A micro-op over SSA values
#[derive(Clone, Debug)]
pub struct SsaOp {
    pub addr: Address,
    pub opcode: Opcode,
    pub inputs: Vec<ValueId>,
    pub output: Option<ValueId>,
    /// Hidden writes: locations a call overwrites
    pub clobbers: Vec<ValueId>,
    /// Hidden reads: locations a return hands back
    pub observed: Vec<ValueId>,
    /// Was created as a phi (it may since have been simplified into a `COPY`)
    pub from_phi: bool,
    pub removed: bool,
}

impl SsaOp {
    pub fn is_phi(&self) -> bool {
        self.opcode == Opcode::MultiEqual
    }

    pub fn is_copy(&self) -> bool {
        self.opcode == Opcode::Copy
    }
}

/// The stack-of-stacks of currently live versions, keyed by raw location. Owned by the
/// decompilation session and threaded through renaming.
#[derive(Default, Debug)]
pub struct VersionStacks {
    live: UnorderedMap<Location, Vec<ValueId>>,
    next_version: UnorderedMap<Location, u32>,
}

impl VersionStacks {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn live(&self, loc: &Location) -> Option<ValueId> {
        self.live.get(loc).and_then(|s| s.last().copied())
    }

    fn push(&mut self, loc: Location, v: ValueId) {
        self.live.entry(loc).or_default().push(v);
    }

    fn pop(&mut self, loc: &Location) -> Option<ValueId> {
        self.live.get_mut(loc).and_then(|s| s.pop())
    }

    /// Allocate the next version number for `loc`
    fn bump(&mut self, loc: Location) -> u32 {
        let v = self.next_version.entry(loc).or_insert(0);
        *v += 1;
        *v
    }

    /// No version is live for any location
    pub fn is_unwound(&self) -> bool {
        self.live.values().all(|s| s.is_empty())
    }
}

/// Storage for the values and operations of one function
#[derive(Default, Clone)]
pub struct SsaArena {
    ops: Vec<SsaOp>,
    values: Vec<SsaValue>,
    function_inputs: UnorderedMap<Location, ValueId>,
    constants: UnorderedMap<Location, ValueId>,
}

impl SsaArena {
    pub fn op(&self, id: OpId) -> &SsaOp {
        &self.ops[id.0]
    }

    pub fn value(&self, id: ValueId) -> &SsaValue {
        &self.values[id.0]
    }

    pub fn values(&self) -> impl Iterator<Item = (ValueId, &SsaValue)> {
        self.values.iter().enumerate().map(|(i, v)| (ValueId(i), v))
    }

    pub fn ops(&self) -> impl Iterator<Item = (OpId, &SsaOp)> {
        self.ops.iter().enumerate().map(|(i, o)| (OpId(i), o))
    }

    fn new_value(&mut self, loc: Location, version: u32, def: Option<OpId>) -> ValueId {
        let id = ValueId(self.values.len());
        self.values.push(SsaValue {
            loc,
            version,
            def,
            uses: vec![],
        });
        id
    }

    /// The version of `loc` live on entry to the function
    pub fn function_input(&mut self, loc: Location) -> ValueId {
        if let Some(&v) = self.function_inputs.get(&loc) {
            return v;
        }
        let v = self.new_value(loc, 0, None);
        self.function_inputs.insert(loc, v);
        v
    }

    /// The shared value of constant `loc`
    pub fn constant(&mut self, loc: Location) -> ValueId {
        if let Some(&v) = self.constants.get(&loc) {
            return v;
        }
        let v = self.new_value(loc, 0, None);
        self.constants.insert(loc, v);
        v
    }

    pub fn const_value(&self, v: ValueId) -> Option<u64> {
        self.value(v).loc.const_value()
    }

    fn alloc_op(&mut self, addr: Address, opcode: Opcode, from_phi: bool) -> OpId {
        let id = OpId(self.ops.len());
        self.ops.push(SsaOp {
            addr,
            opcode,
            inputs: vec![],
            output: None,
            clobbers: vec![],
            observed: vec![],
            from_phi,
            removed: false,
        });
        id
    }

    fn link(&mut self, v: ValueId, op: OpId, slot: Slot) {
        self.values[v.0].uses.push(Use { op, slot });
    }

    fn unlink(&mut self, v: ValueId, op: OpId, slot: Slot) {
        let uses = &mut self.values[v.0].uses;
        if let Some(pos) = uses.iter().position(|u| u.op == op && u.slot == slot) {
            uses.remove(pos);
        }
    }

    /// Rewrite `op` in place to `opcode inputs`, keeping use lists exact
    pub fn rewrite(&mut self, op: OpId, opcode: Opcode, inputs: Vec<ValueId>) {
        let old = std::mem::take(&mut self.ops[op.0].inputs);
        for (i, v) in old.into_iter().enumerate() {
            self.unlink(v, op, Slot::Input(i));
        }
        for (i, &v) in inputs.iter().enumerate() {
            self.link(v, op, Slot::Input(i));
        }
        let o = &mut self.ops[op.0];
        o.opcode = opcode;
        o.inputs = inputs;
    }

    /// Point every use of `old` at `new` instead
    pub fn replace_all_uses(&mut self, old: ValueId, new: ValueId) {
        let uses = std::mem::take(&mut self.values[old.0].uses);
        for u in uses {
            match u.slot {
                Slot::Input(i) => self.ops[u.op.0].inputs[i] = new,
                Slot::Observed(i) => self.ops[u.op.0].observed[i] = new,
            }
            self.values[new.0].uses.push(u);
        }
    }

    /// Detach `op` from the values it reads and mark it removed. Values it defined keep their
    /// (now dangling) definition so that stale references remain printable.
    pub fn remove_op(&mut self, op: OpId) {
        let o = &mut self.ops[op.0];
        let inputs = std::mem::take(&mut o.inputs);
        let observed = std::mem::take(&mut o.observed);
        o.removed = true;
        for (i, v) in inputs.into_iter().enumerate() {
            self.unlink(v, op, Slot::Input(i));
        }
        for (i, v) in observed.into_iter().enumerate() {
            self.unlink(v, op, Slot::Observed(i));
        }
    }

    /// Number of uses of the value `op` outputs, if it outputs anything
    pub fn output_uses(&self, op: OpId) -> Option<usize> {
        self.op(op).output.map(|v| self.value(v).uses.len())
    }
}

/// A function in SSA form. `block_ops[b]` lists the live operations of block `b` of `cfg`.
#[derive(Clone)]
pub struct SsaFunction {
    pub cfg: Cfg<PcodeOp>,
    pub block_ops: Vec<Vec<OpId>>,
    pub arena: SsaArena,
}

/// Number of inputs a phi of block `b` takes: one per predecessor, in predecessor order, and for
/// the entry block one more, last, for the value on entry to the function.
pub fn phi_arity(cfg: &Cfg<PcodeOp>, b: NodeId) -> usize {
    cfg.graph.predecessors(b).len() + cfg.dom.incoming_from_outside(b)
}

/// Insert phis into `cfg` at the iterated dominance frontier of every tracked location's writing
/// blocks. Returns, per location, the blocks that received a phi.
pub fn place_phis(cfg: &mut Cfg<PcodeOp>, abi: &Abi) -> UnorderedMap<Location, UnorderedSet<NodeId>> {
    let mut tracked: InsertionOrderedSet<Location> = InsertionOrderedSet::new();
    let mut def_blocks: UnorderedMap<Location, UnorderedSet<NodeId>> = Default::default();
    for b in cfg.dom.reverse_postorder().collect::<Vec<_>>() {
        for op in &cfg.graph.node(b).elems {
            let mut writes: Vec<Location> = op.output.iter().copied().collect();
            if op.opcode.is_call() {
                writes.extend(abi.killed_locations.iter().copied());
            }
            for w in writes {
                if w.is_unique() || abi.is_program_counter(&w) {
                    continue;
                }
                tracked.insert(w);
                def_blocks.entry(w).or_default().insert(b);
            }
        }
    }

    let mut placed: UnorderedMap<Location, UnorderedSet<NodeId>> = Default::default();
    let mut per_block: Vec<Vec<Location>> = vec![vec![]; cfg.graph.len()];
    for loc in tracked.iter() {
        let defs = match def_blocks.get(loc) {
            Some(defs) => defs,
            None => continue,
        };
        let mut has_phi: UnorderedSet<NodeId> = Default::default();
        let mut work: Vec<NodeId> = defs.iter().copied().collect();
        while let Some(x) = work.pop() {
            for &y in cfg.dom.frontier(x) {
                if has_phi.insert(y) {
                    per_block[y.0].push(*loc);
                    if !defs.contains(&y) {
                        work.push(y);
                    }
                }
            }
        }
        if !has_phi.is_empty() {
            placed.insert(*loc, has_phi);
        }
    }

    let mut count = 0;
    for (i, locs) in per_block.into_iter().enumerate() {
        if locs.is_empty() {
            continue;
        }
        let b = NodeId(i);
        let npreds = phi_arity(cfg, b);
        let block = cfg.graph.node_mut(b);
        let start = block.start;
        count += locs.len();
        let phis = locs.into_iter().map(|l| PcodeOp::phi(start, l, npreds));
        block.elems.splice(0..0, phis);
    }
    debug!("Placed phis"; "count" => count, "tracked_locations" => tracked.len());
    placed
}

struct Renamer<'a> {
    cfg: &'a Cfg<PcodeOp>,
    abi: &'a Abi,
    stacks: &'a mut VersionStacks,
    arena: SsaArena,
    block_ops: Vec<Vec<OpId>>,
    /// Locations pushed while in each block, popped on leaving it
    pushed: Vec<Vec<Location>>,
    /// `phi_slots[b][j][p]`: value flowing into the `j`th phi of block `b` from its `p`th
    /// predecessor
    phi_slots: Vec<Vec<Vec<Option<ValueId>>>>,
}

impl<'a> Renamer<'a> {
    fn read(&mut self, loc: Location) -> ValueId {
        if loc.is_const() {
            return self.arena.constant(loc);
        }
        match self.stacks.live(&loc) {
            Some(v) => v,
            None => self.arena.function_input(loc),
        }
    }

    fn write(&mut self, b: NodeId, loc: Location, op: OpId) -> ValueId {
        let version = self.stacks.bump(loc);
        let v = self.arena.new_value(loc, version, Some(op));
        self.stacks.push(loc, v);
        self.pushed[b.0].push(loc);
        v
    }

    fn enter(&mut self, b: NodeId) {
        let cfg = self.cfg;
        let block = cfg.graph.node(b);
        let mut ops = Vec::with_capacity(block.elems.len());
        for raw in &block.elems {
            let op = self.arena.alloc_op(raw.addr, raw.opcode, raw.is_phi());
            if !raw.is_phi() {
                let inputs: Vec<ValueId> = raw.inputs.iter().map(|&l| self.read(l)).collect();
                for (i, &v) in inputs.iter().enumerate() {
                    self.arena.link(v, op, Slot::Input(i));
                }
                self.arena.ops[op.0].inputs = inputs;
            }
            if raw.returns() {
                let observed: Vec<ValueId> = self
                    .abi
                    .observed_locations
                    .iter()
                    .map(|&l| self.read(l))
                    .collect();
                for (i, &v) in observed.iter().enumerate() {
                    self.arena.link(v, op, Slot::Observed(i));
                }
                self.arena.ops[op.0].observed = observed;
            }
            if let Some(out) = raw.output {
                let v = self.write(b, out, op);
                self.arena.ops[op.0].output = Some(v);
            }
            if raw.opcode.is_call() {
                // The explicit output is already the call's write of that location
                let killed: Vec<Location> = self
                    .abi
                    .killed_locations
                    .iter()
                    .copied()
                    .filter(|&l| Some(l) != raw.output)
                    .collect();
                let clobbers = killed.into_iter().map(|l| self.write(b, l, op)).collect();
                self.arena.ops[op.0].clobbers = clobbers;
            }
            ops.push(op);
        }
        self.block_ops[b.0] = ops;

        // Control leaves `b` here: hand its live versions to the phis of its successors
        for &s in cfg.graph.successors(b) {
            let p = match cfg.graph.predecessors(s).iter().position(|&x| x == b) {
                Some(p) => p,
                None => continue,
            };
            let phi_locs: Vec<Location> = cfg
                .graph
                .node(s)
                .elems
                .iter()
                .take_while(|op| op.is_phi())
                .filter_map(|op| op.output)
                .collect();
            for (j, loc) in phi_locs.into_iter().enumerate() {
                let v = self.read(loc);
                self.phi_slots[s.0][j][p] = Some(v);
            }
        }
        trace!("Renamed block"; "block" => ?b, "ops" => self.block_ops[b.0].len());
    }

    fn leave(&mut self, b: NodeId) {
        for loc in std::mem::take(&mut self.pushed[b.0]).into_iter().rev() {
            self.stacks.pop(&loc);
        }
    }

    /// Fill phi inputs from the recorded slots. Slots no predecessor filled (the entry's
    /// trailing slot, unreachable predecessors) take the function-input version.
    fn finish_phis(&mut self) {
        let cfg = self.cfg;
        for b in cfg.graph.ids() {
            let phis: Vec<OpId> = self.block_ops[b.0]
                .iter()
                .copied()
                .take_while(|&op| self.arena.op(op).is_phi())
                .collect();
            for (j, op) in phis.into_iter().enumerate() {
                let loc = match self.arena.op(op).output {
                    Some(v) => self.arena.value(v).loc,
                    None => continue,
                };
                let slots = std::mem::take(&mut self.phi_slots[b.0][j]);
                let inputs: Vec<ValueId> = slots
                    .into_iter()
                    .map(|s| s.unwrap_or_else(|| self.arena.function_input(loc)))
                    .collect();
                for (i, &v) in inputs.iter().enumerate() {
                    self.arena.link(v, op, Slot::Input(i));
                }
                self.arena.ops[op.0].inputs = inputs;
            }
        }
    }
}

impl SsaFunction {
    /// Convert `cfg` to SSA form: place phis, then rename along the dominator tree.
    pub fn convert(mut cfg: Cfg<PcodeOp>, abi: &Abi, stacks: &mut VersionStacks) -> Result<Self> {
        place_phis(&mut cfg, abi);

        let phi_slots = cfg
            .graph
            .ids()
            .map(|b| {
                let npreds = phi_arity(&cfg, b);
                let nphis = cfg
                    .graph
                    .node(b)
                    .elems
                    .iter()
                    .take_while(|op| op.is_phi())
                    .count();
                vec![vec![None; npreds]; nphis]
            })
            .collect();

        let (arena, block_ops) = {
            let renamer = RefCell::new(Renamer {
                cfg: &cfg,
                abi,
                stacks,
                arena: SsaArena::default(),
                block_ops: vec![vec![]; cfg.graph.len()],
                pushed: vec![vec![]; cfg.graph.len()],
                phi_slots,
            });
            cfg.dom.tree().dfs(
                cfg.entry,
                |b| renamer.borrow_mut().enter(b),
                |b| renamer.borrow_mut().leave(b),
            );
            let mut renamer = renamer.into_inner();
            renamer.finish_phis();
            if !renamer.stacks.is_unwound() {
                return Err(structure_error!("Version stacks were not unwound after renaming"));
            }
            (renamer.arena, renamer.block_ops)
        };

        for b in cfg.graph.ids() {
            if !cfg.dom.is_reachable(b) {
                warn!("Block unreachable from entry is left out of SSA form"; "block" => ?b);
            }
        }

        let func = SsaFunction {
            cfg,
            block_ops,
            arena,
        };
        debug!("Converted to SSA";
               "values" => func.arena.values.len(),
               "ops" => func.arena.ops.len());
        Ok(func)
    }

    pub fn op(&self, id: OpId) -> &SsaOp {
        self.arena.op(id)
    }

    pub fn value(&self, id: ValueId) -> &SsaValue {
        self.arena.value(id)
    }

    /// Live operations of block `b`
    pub fn ops_of(&self, b: NodeId) -> &[OpId] {
        &self.block_ops[b.0]
    }

    /// All live operations, block by block
    pub fn live_ops(&self) -> impl Iterator<Item = OpId> + '_ {
        self.block_ops.iter().flatten().copied()
    }

    pub fn debug_listing(&self) -> DebugSsa<'_> {
        DebugSsa { func: self }
    }

    pub fn dump_to_trace(&self) {
        slog_scope::scope(
            &slog_scope::logger().new(slog::slog_o!("ssa" => true)),
            || {
                for b in self.cfg.graph.ids() {
                    trace!("SSA block";
                           "block" => ?b,
                           "start" => %self.cfg.graph.node(b).start,
                           "preds" => ?self.cfg.graph.predecessors(b),
                           "succs" => ?self.cfg.graph.successors(b));
                    for &op in self.ops_of(b) {
                        let o = self.op(op);
                        trace!("SSA op";
                               "op" => ?op,
                               "addr" => %o.addr,
                               OptionalKV("output", o.output.map(|v| self.display_value(v))),
                               "opcode" => %o.opcode,
                               OptionalKV("input0", o.inputs.first().map(|&v| self.display_value(v))),
                               OptionalKV("input1", o.inputs.get(1).map(|&v| self.display_value(v))),
                        );
                    }
                }
            },
        )
    }

    /// `loc(version)`, or just the literal for constants
    pub fn display_value(&self, v: ValueId) -> String {
        let val = self.value(v);
        if val.is_const() {
            format!("{:?}", val.loc)
        } else {
            format!("{:?}({})", val.loc, val.version)
        }
    }

    pub fn display_op(&self, op: OpId) -> String {
        use itertools::Itertools;
        let o = self.op(op);
        let mut s = String::new();
        if let Some(out) = o.output {
            s += &format!("{} = ", self.display_value(out));
        }
        s += o.opcode.mnemonic();
        if !o.inputs.is_empty() {
            s += " ";
            s += &o.inputs.iter().map(|&v| self.display_value(v)).join(", ");
        }
        if !o.clobbers.is_empty() {
            s += &format!(
                " [kills {}]",
                o.clobbers.iter().map(|&v| self.display_value(v)).join(", ")
            );
        }
        if !o.observed.is_empty() {
            s += &format!(
                " [observes {}]",
                o.observed.iter().map(|&v| self.display_value(v)).join(", ")
            );
        }
        s
    }
}

/// A printable view of an [`SsaFunction`]
pub struct DebugSsa<'a> {
    func: &'a SsaFunction,
}

impl std::fmt::Debug for DebugSsa<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let func = self.func;
        for b in func.cfg.graph.ids() {
            writeln!(
                f,
                "{:?} @ {} preds={:?} succs={:?}",
                b,
                func.cfg.graph.node(b).start,
                func.cfg.graph.predecessors(b),
                func.cfg.graph.successors(b)
            )?;
            for &op in func.ops_of(b) {
                writeln!(f, "  {}: {}", func.op(op).addr, func.display_op(op))?;
            }
        }
        Ok(())
    }
}
