//! Reconstruction of expressions and structured statements from SSA form.
//!
//! Values are turned into expression trees by walking back through their definitions. A value is
//! inlined into its single consumer unless it must be named: phis, loads, call results and
//! anything read more than once are assigned to an intermediate `v<n>` at the point they are
//! defined, and referred to by name afterwards.
//!
//! Control flow is rebuilt by walking the dominator tree. A block ending in a two-way branch whose
//! arms are dominated by it becomes an `if` (with an `else` when neither arm rejoins the other);
//! remaining dominator-tree children follow it in reverse postorder. Back edges and branches that
//! cannot be folded are kept as explicit `goto`s.

use std::rc::Rc;

use crate::abi::Abi;
use crate::config::DecompilerConfig;
use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use crate::graph::NodeId;
use crate::insn::Address;
use crate::log::*;
use crate::pcode::{Opcode, Shape};
use crate::ssa::{OpId, SsaFunction, ValueId};

/// An expression tree. Sub-expressions are shared.
#[derive(Clone, PartialEq, Eq)]
pub enum Expr {
    Const { value: u64, size: u32 },
    /// A named intermediate or a function input
    Var { name: String },
    Unary { op: Opcode, arg: Rc<Expr> },
    Binary { op: Opcode, lhs: Rc<Expr>, rhs: Rc<Expr> },
    Nary { op: Opcode, args: Vec<Rc<Expr>> },
}

impl Expr {
    /// The logical negation of `e`, folding `!!x` to `x` and flipping (in)equalities.
    pub fn negate(e: &Rc<Expr>) -> Rc<Expr> {
        match &**e {
            Expr::Unary {
                op: Opcode::BoolNegate,
                arg,
            } => arg.clone(),
            Expr::Binary { op, lhs, rhs } if matches!(op, Opcode::IntEqual | Opcode::IntNotEqual) => {
                let op = if *op == Opcode::IntEqual {
                    Opcode::IntNotEqual
                } else {
                    Opcode::IntEqual
                };
                Rc::new(Expr::Binary {
                    op,
                    lhs: lhs.clone(),
                    rhs: rhs.clone(),
                })
            }
            _ => Rc::new(Expr::Unary {
                op: Opcode::BoolNegate,
                arg: e.clone(),
            }),
        }
    }

    pub fn var(name: impl Into<String>) -> Rc<Expr> {
        Rc::new(Expr::Var { name: name.into() })
    }

    pub fn constant(value: u64, size: u32) -> Rc<Expr> {
        Rc::new(Expr::Const { value, size })
    }
}

fn write_args(f: &mut std::fmt::Formatter<'_>, args: &[Rc<Expr>]) -> std::fmt::Result {
    for (i, a) in args.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", a)?;
    }
    Ok(())
}

impl std::fmt::Display for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Expr::Const { value, .. } => write!(f, "{:#x}", value),
            Expr::Var { name } => write!(f, "{}", name),
            Expr::Unary { op, arg } => match op.symbol() {
                Some(s) => write!(f, "{}{}", s, arg),
                None => write!(f, "{}({})", op, arg),
            },
            Expr::Binary { op, lhs, rhs } => match op.symbol() {
                Some(s) => write!(f, "({} {} {})", lhs, s, rhs),
                None => write!(f, "{}({}, {})", op, lhs, rhs),
            },
            Expr::Nary { op, args } => match (op, args.as_slice()) {
                (Opcode::Load, [_, ptr]) => write!(f, "*{}", ptr),
                (Opcode::Store, [_, dst, data]) => write!(f, "*{} = {}", dst, data),
                (Opcode::Call | Opcode::CallInd, [target, rest @ ..]) => {
                    write!(f, "call {}(", target)?;
                    write_args(f, rest)?;
                    write!(f, ")")
                }
                (Opcode::Return, []) => write!(f, "return"),
                (Opcode::Return, [value]) => write!(f, "return {}", value),
                (Opcode::Return, values) => {
                    write!(f, "return (")?;
                    write_args(f, values)?;
                    write!(f, ")")
                }
                (Opcode::BranchInd, [target]) => write!(f, "goto *{}", target),
                (Opcode::MultiEqual, args) => {
                    write!(f, "phi(")?;
                    write_args(f, args)?;
                    write!(f, ")")
                }
                (op, args) => {
                    write!(f, "{}(", op)?;
                    write_args(f, args)?;
                    write!(f, ")")
                }
            },
        }
    }
}

impl std::fmt::Debug for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

/// A statement of the reconstructed function
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Stmt {
    Assign {
        addr: Address,
        var: String,
        expr: Rc<Expr>,
    },
    Store {
        addr: Address,
        expr: Rc<Expr>,
    },
    If {
        addr: Address,
        cond: Rc<Expr>,
        body: StmtBlockList,
        orelse: Option<StmtBlockList>,
    },
    /// A call or return evaluated for its effect
    Effect {
        addr: Address,
        expr: Rc<Expr>,
    },
    Goto {
        addr: Address,
        cond: Option<Rc<Expr>>,
        target: Address,
    },
}

impl Stmt {
    pub fn addr(&self) -> Address {
        match self {
            Stmt::Assign { addr, .. }
            | Stmt::Store { addr, .. }
            | Stmt::If { addr, .. }
            | Stmt::Effect { addr, .. }
            | Stmt::Goto { addr, .. } => *addr,
        }
    }

    fn write_indented(&self, f: &mut std::fmt::Formatter<'_>, depth: usize) -> std::fmt::Result {
        let pad = "    ".repeat(depth);
        match self {
            Stmt::Assign { var, expr, .. } => writeln!(f, "{}{} = {};", pad, var, expr),
            Stmt::Store { expr, .. } | Stmt::Effect { expr, .. } => {
                writeln!(f, "{}{};", pad, expr)
            }
            Stmt::Goto {
                cond: None, target, ..
            } => writeln!(f, "{}goto {};", pad, target),
            Stmt::Goto {
                cond: Some(c),
                target,
                ..
            } => writeln!(f, "{}if ({}) goto {};", pad, c, target),
            Stmt::If {
                cond, body, orelse, ..
            } => {
                writeln!(f, "{}if ({}) {{", pad, cond)?;
                body.write_indented(f, depth + 1)?;
                if let Some(orelse) = orelse {
                    writeln!(f, "{}}} else {{", pad)?;
                    orelse.write_indented(f, depth + 1)?;
                }
                writeln!(f, "{}}}", pad)
            }
        }
    }

    /// Render a single statement at indentation `depth`
    pub fn render(&self, depth: usize) -> String {
        struct R<'a>(&'a Stmt, usize);
        impl std::fmt::Display for R<'_> {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.write_indented(f, self.1)
            }
        }
        R(self, depth).to_string()
    }
}

impl std::fmt::Display for Stmt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.write_indented(f, 0)
    }
}

/// The statements of one basic block, with the block's place in the control-flow graph
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct StmtBlock {
    pub start: Address,
    pub stmts: Vec<Stmt>,
    pub successors: Vec<Address>,
    pub predecessors: Vec<Address>,
}

/// An ordered sequence of statement blocks: a function body, or the body of an `if`
#[derive(Clone, Default, PartialEq, Eq, Debug)]
pub struct StmtBlockList {
    pub blocks: Vec<StmtBlock>,
}

impl StmtBlockList {
    /// Reconstruct the structured body of `func`.
    pub fn from_ssa(
        func: &SsaFunction,
        abi: &Abi,
        cache: &mut ExprCache,
        config: &DecompilerConfig,
    ) -> Self {
        let mut r = Reconstructor::new(func, abi, cache, config);
        let list = r.region(func.cfg.entry);
        debug!("Reconstructed statements";
               "blocks" => list.len(),
               "named" => r.cache.names.len());
        list
    }

    /// Number of blocks, counting those nested inside `if` bodies
    pub fn len(&self) -> usize {
        self.blocks
            .iter()
            .map(|b| {
                1 + b
                    .stmts
                    .iter()
                    .map(|s| match s {
                        Stmt::If { body, orelse, .. } => {
                            body.len() + orelse.as_ref().map_or(0, |o| o.len())
                        }
                        _ => 0,
                    })
                    .sum::<usize>()
            })
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Start addresses of every block, nested ones included, in emission order
    pub fn block_starts(&self) -> Vec<Address> {
        let mut r = vec![];
        self.collect_starts(&mut r);
        r
    }

    fn collect_starts(&self, r: &mut Vec<Address>) {
        for b in &self.blocks {
            r.push(b.start);
            for s in &b.stmts {
                if let Stmt::If { body, orelse, .. } = s {
                    body.collect_starts(r);
                    if let Some(o) = orelse {
                        o.collect_starts(r);
                    }
                }
            }
        }
    }

    fn write_indented(&self, f: &mut std::fmt::Formatter<'_>, depth: usize) -> std::fmt::Result {
        for b in &self.blocks {
            for s in &b.stmts {
                s.write_indented(f, depth)?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for StmtBlockList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in &self.blocks {
            writeln!(f, "// {}", b.start)?;
            for s in &b.stmts {
                s.write_indented(f, 0)?;
            }
        }
        Ok(())
    }
}

/// Expressions and names handed out for the values of one function
#[derive(Default, Debug)]
pub struct ExprCache {
    exprs: UnorderedMap<ValueId, Rc<Expr>>,
    names: UnorderedMap<ValueId, String>,
    next_name: usize,
}

impl ExprCache {
    pub fn new() -> Self {
        Default::default()
    }

    /// Name given to `v`, if it was materialized
    pub fn name(&self, v: ValueId) -> Option<&str> {
        self.names.get(&v).map(|s| s.as_str())
    }

    fn name_or_assign(&mut self, v: ValueId) -> String {
        if let Some(n) = self.names.get(&v) {
            return n.clone();
        }
        let n = format!("v{}", self.next_name);
        self.next_name += 1;
        self.names.insert(v, n.clone());
        n
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// The value a call hands back, if anything reads it: its explicit output, or else the hidden
/// write of the first return-value location
fn call_result(func: &SsaFunction, abi: &Abi, op: OpId) -> Option<ValueId> {
    let o = func.op(op);
    o.output
        .or_else(|| {
            o.clobbers
                .iter()
                .copied()
                .find(|&v| abi.output_locations.contains(&func.value(v).loc))
        })
        .filter(|&v| !func.value(v).uses.is_empty())
}

struct Reconstructor<'a> {
    func: &'a SsaFunction,
    abi: &'a Abi,
    cache: &'a mut ExprCache,
    /// Values that get their own assignment
    named: UnorderedSet<ValueId>,
}

impl<'a> Reconstructor<'a> {
    fn new(
        func: &'a SsaFunction,
        abi: &'a Abi,
        cache: &'a mut ExprCache,
        config: &'a DecompilerConfig,
    ) -> Self {
        let mut named = UnorderedSet::new();
        for op in func.live_ops() {
            let o = func.op(op);
            if o.opcode.is_call() {
                if let Some(v) = call_result(func, abi, op) {
                    named.insert(v);
                }
            }
            let out = match o.output {
                Some(out) => out,
                None => continue,
            };
            let uses = &func.value(out).uses;
            let must_name = o.from_phi
                || o.opcode.is_call()
                || (o.opcode == Opcode::Load && !config.inline_single_use_loads)
                || uses.len() != 1
                || uses.iter().any(|u| func.op(u.op).is_phi());
            if must_name {
                named.insert(out);
            }
        }
        Self {
            func,
            abi,
            cache,
            named,
        }
    }

    /// How a value with no definition is referred to
    fn leaf(&self, v: ValueId) -> Rc<Expr> {
        let val = self.func.value(v);
        if let Some(c) = val.loc.const_value() {
            return Expr::constant(c, val.loc.size);
        }
        if val.def.is_some() {
            // A hidden write of a call that is not its primary result
            let base = match self.abi.register_name(&val.loc) {
                Some(n) => n.to_string(),
                None => format!("{:?}", val.loc),
            };
            return Expr::var(format!("{}_{}", base, val.version));
        }
        match self.abi.register_name(&val.loc) {
            Some(n) => Expr::var(n),
            None if val.loc.is_ram() => Expr::var(format!("mem_{:x}", val.loc.offset)),
            None => Expr::var(format!("{:?}", val.loc)),
        }
    }

    /// Expression referring to `v`
    fn expr(&mut self, v: ValueId) -> Rc<Expr> {
        if let Some(e) = self.cache.exprs.get(&v) {
            return e.clone();
        }
        let func = self.func;
        let e = if self.named.contains(&v) {
            Expr::var(self.cache.name_or_assign(v))
        } else {
            match func.value(v).def {
                Some(def) if func.op(def).output == Some(v) => self.definition(def),
                _ => self.leaf(v),
            }
        };
        self.cache.exprs.insert(v, e.clone());
        e
    }

    /// A code address operand (branch or call destination)
    fn code_ref(&mut self, v: ValueId) -> Rc<Expr> {
        let val = self.func.value(v);
        if val.def.is_none() && val.loc.is_ram() {
            Expr::constant(val.loc.offset, val.loc.size)
        } else {
            self.expr(v)
        }
    }

    /// The computation performed by `op`
    fn definition(&mut self, op: OpId) -> Rc<Expr> {
        let o = self.func.op(op);
        let opcode = o.opcode;
        let inputs = o.inputs.clone();
        match (opcode, opcode.shape(), inputs.as_slice()) {
            (Opcode::Copy, _, [src]) => self.expr(*src),
            (_, Shape::Unary, [a]) => Rc::new(Expr::Unary {
                op: opcode,
                arg: self.expr(*a),
            }),
            (_, Shape::Binary, [a, b]) => Rc::new(Expr::Binary {
                op: opcode,
                lhs: self.expr(*a),
                rhs: self.expr(*b),
            }),
            (Opcode::Call | Opcode::CallInd, _, [target, rest @ ..]) => {
                let mut args = vec![self.code_ref(*target)];
                args.extend(rest.iter().map(|&v| self.expr(v)));
                Rc::new(Expr::Nary { op: opcode, args })
            }
            _ => Rc::new(Expr::Nary {
                op: opcode,
                args: inputs.iter().map(|&v| self.expr(v)).collect(),
            }),
        }
    }

    /// Statements for the operations of block `b`, except its conditional branch
    fn statements(&mut self, b: NodeId) -> Vec<Stmt> {
        let func = self.func;
        let mut stmts = vec![];
        for &op in func.ops_of(b) {
            let o = func.op(op);
            let addr = o.addr;
            match o.opcode {
                Opcode::Branch | Opcode::Cbranch => {}
                Opcode::Store => stmts.push(Stmt::Store {
                    addr,
                    expr: self.definition(op),
                }),
                Opcode::Return => {
                    let observed = o.observed.clone();
                    let args = observed.into_iter().map(|v| self.expr(v)).collect();
                    stmts.push(Stmt::Effect {
                        addr,
                        expr: Rc::new(Expr::Nary {
                            op: Opcode::Return,
                            args,
                        }),
                    });
                }
                Opcode::BranchInd => {
                    let target = o.inputs[0];
                    stmts.push(Stmt::Effect {
                        addr,
                        expr: Rc::new(Expr::Nary {
                            op: Opcode::BranchInd,
                            args: vec![self.expr(target)],
                        }),
                    });
                }
                opcode if opcode.is_call() => {
                    let expr = self.definition(op);
                    match call_result(func, self.abi, op) {
                        Some(v) => {
                            let var = self.cache.name_or_assign(v);
                            stmts.push(Stmt::Assign { addr, var, expr });
                        }
                        None => stmts.push(Stmt::Effect { addr, expr }),
                    }
                }
                _ => {
                    if let Some(out) = o.output {
                        if self.named.contains(&out) {
                            let var = self.cache.name_or_assign(out);
                            let expr = self.definition(op);
                            stmts.push(Stmt::Assign { addr, var, expr });
                        }
                    }
                }
            }
        }
        stmts
    }

    fn stmt_block(&mut self, b: NodeId) -> StmtBlock {
        let graph = &self.func.cfg.graph;
        let start = |n: &NodeId| graph.node(*n).start;
        StmtBlock {
            start: graph.node(b).start,
            stmts: self.statements(b),
            successors: graph.successors(b).iter().map(start).collect(),
            predecessors: graph.predecessors(b).iter().map(start).collect(),
        }
    }

    /// `x` is a child of `b` in the dominator tree
    fn is_child(&self, b: NodeId, x: NodeId) -> bool {
        x != b && self.func.cfg.dom.immediate_dominator(x) == Some(b)
    }

    /// Jumping from `b` to `s` goes back to a block already on the path
    fn is_back_edge(&self, b: NodeId, s: NodeId) -> bool {
        self.func.cfg.dom.dominates(s, b)
    }

    /// Condition and address of the conditional branch ending `b`
    fn branch_condition(&mut self, b: NodeId) -> Option<(Address, Rc<Expr>)> {
        let func = self.func;
        let &last = func.ops_of(b).last()?;
        let o = func.op(last);
        if o.opcode != Opcode::Cbranch {
            return None;
        }
        let (addr, cond) = (o.addr, o.inputs[1]);
        Some((addr, self.expr(cond)))
    }

    fn region(&mut self, b: NodeId) -> StmtBlockList {
        let mut list = StmtBlockList::default();
        self.emit(b, &mut list);
        list
    }

    /// Append `b` and the part of the dominator tree below it to `list`.
    fn emit(&mut self, b: NodeId, list: &mut StmtBlockList) {
        let func = self.func;
        let cfg = &func.cfg;
        let mut block = self.stmt_block(b);
        let mut consumed: Vec<NodeId> = vec![];
        let mut follows: Vec<NodeId> = vec![];

        let target = cfg.target(b);
        let fallthrough = cfg.fallthrough(b);
        let two_way = match (target, fallthrough) {
            (Some(t), Some(f)) if t != f => Some((t, f)),
            _ => None,
        };
        let branch = if two_way.is_some() {
            self.branch_condition(b)
        } else {
            None
        };

        match (two_way, branch) {
            (Some((t, f)), Some((addr, cond))) => {
                let (c, body, cont) = if cfg.dom.frontier(f).contains(&t) {
                    (Expr::negate(&cond), f, t)
                } else {
                    (cond.clone(), t, f)
                };
                if self.is_child(b, body) {
                    consumed.push(body);
                    let body_list = self.region(body);
                    let orelse = if self.is_child(b, cont)
                        && !cfg.dom.frontier(body).contains(&cont)
                    {
                        consumed.push(cont);
                        Some(self.region(cont))
                    } else {
                        None
                    };
                    block.stmts.push(Stmt::If {
                        addr,
                        cond: c,
                        body: body_list,
                        orelse,
                    });
                    if !consumed.contains(&cont) {
                        self.continue_to(b, cont, addr, &mut block, &mut follows);
                    }
                } else {
                    trace!("Conditional branch left unstructured"; "block" => ?b);
                    block.stmts.push(Stmt::Goto {
                        addr,
                        cond: Some(cond),
                        target: cfg.graph.node(t).start,
                    });
                    self.continue_to(b, f, addr, &mut block, &mut follows);
                }
            }
            _ => {
                if let Some(s) = fallthrough {
                    let node = cfg.graph.node(b);
                    let addr = node.terminator().map_or(node.end, |t| t.addr);
                    self.continue_to(b, s, addr, &mut block, &mut follows);
                }
            }
        }

        list.blocks.push(block);

        let rest: Vec<NodeId> = cfg
            .dom
            .children(b)
            .iter()
            .copied()
            .filter(|c| !consumed.contains(c) && !follows.contains(c))
            .collect();
        for c in follows.into_iter().chain(rest) {
            self.emit(c, list);
        }
    }

    /// Control continues from `b` to `s` after `b`'s statements: emit `s` right after when `b`
    /// dominates it, and jump explicitly when going backwards.
    fn continue_to(
        &self,
        b: NodeId,
        s: NodeId,
        addr: Address,
        block: &mut StmtBlock,
        follows: &mut Vec<NodeId>,
    ) {
        if self.is_child(b, s) {
            follows.push(s);
        } else if self.is_back_edge(b, s) {
            block.stmts.push(Stmt::Goto {
                addr,
                cond: None,
                target: self.func.cfg.graph.node(s).start,
            });
        }
    }
}
