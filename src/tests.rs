use crate::abi::Abi;
use crate::ast::{Expr, Stmt, StmtBlockList};
use crate::cfg::{decompose_into_blocks, Cfg};
use crate::config::DecompilerConfig;
use crate::containers::unordered::UnorderedSet;
use crate::error::Error;
use crate::graph::{Dominance, Graph, NodeId};
use crate::insn::{Address, Instruction};
use crate::location::{parse_hex, Location, Space};
use crate::pcode::{Opcode, PcodeOp};
use crate::session::Decompilation;
use crate::simplify::{self, Progress, Reduction};
use crate::ssa::{place_phis, OpId, SsaFunction, VersionStacks};

use std::rc::Rc;

const RAX: u64 = 0x0;
const RCX: u64 = 0x8;
const RDX: u64 = 0x10;
const RBX: u64 = 0x18;
const RSI: u64 = 0x30;
const RDI: u64 = 0x38;
const RIP: u64 = 0x288;

fn assert_unorderedset_eq<T: Eq + std::hash::Hash + Ord + std::fmt::Debug>(
    a: impl IntoIterator<Item = T>,
    b: impl IntoIterator<Item = T>,
) {
    let a: UnorderedSet<_> = a.into_iter().collect();
    let b: UnorderedSet<_> = b.into_iter().collect();
    assert_eq!(a, b)
}

type RawOp = (Opcode, Vec<Location>, Option<Location>);

fn reg(offset: u64) -> Location {
    Location::register(offset, 8)
}

fn cst(value: u64) -> Location {
    Location::constant(value, 8)
}

fn tmp(offset: u64) -> Location {
    Location::unique(offset, 1)
}

fn copy(dst: Location, src: Location) -> RawOp {
    (Opcode::Copy, vec![src], Some(dst))
}

fn binop(op: Opcode, dst: Location, a: Location, b: Location) -> RawOp {
    (op, vec![a, b], Some(dst))
}

fn cbranch(target: u64, cond: Location) -> RawOp {
    (Opcode::Cbranch, vec![Location::ram(target, 8), cond], None)
}

fn branch(target: u64) -> RawOp {
    (Opcode::Branch, vec![Location::ram(target, 8)], None)
}

fn call(target: u64) -> RawOp {
    (Opcode::Call, vec![Location::ram(target, 8)], None)
}

fn ret() -> RawOp {
    (Opcode::Return, vec![cst(0)], None)
}

/// Build the instructions of one function from `(offset, length, micro-ops)` records.
pub fn program(records: Vec<(u64, u64, Vec<RawOp>)>) -> Vec<Instruction> {
    let mut insns: Vec<Instruction> = records
        .into_iter()
        .flat_map(|(offset, length, ops)| {
            let ops = ops
                .into_iter()
                .enumerate()
                .map(|(i, (opcode, inputs, output))| {
                    PcodeOp::new(Address::new(offset, i as u32), opcode, inputs, output).unwrap()
                })
                .collect();
            Instruction::split_machine_instruction(offset, length, ops).unwrap()
        })
        .collect();
    insns.sort_by_key(|i| i.addr);
    insns
}

fn to_ssa(insns: &[Instruction]) -> SsaFunction {
    let cfg = Cfg::from_instructions(insns).unwrap().lower().unwrap();
    SsaFunction::convert(cfg, &Abi::x86_64(), &mut VersionStacks::new()).unwrap()
}

fn block_starting(func: &SsaFunction, offset: u64) -> NodeId {
    func.cfg.block_at(Address::machine(offset)).unwrap()
}

/// `RAX = RDI + RSI`, then a diamond on `RDX == 0` whose arms write different constants to `RAX`
/// and the same constant to `RBX`, joining at a return.
pub fn diamond_program() -> Vec<Instruction> {
    program(vec![
        (0x1000, 4, vec![binop(Opcode::IntAdd, reg(RAX), reg(RDI), reg(RSI))]),
        (0x1004, 4, vec![branch(0x1010)]),
        (
            0x1010,
            4,
            vec![
                binop(Opcode::IntEqual, tmp(0x100), reg(RDX), cst(0)),
                cbranch(0x1030, tmp(0x100)),
            ],
        ),
        (0x1014, 4, vec![copy(reg(RAX), cst(1)), copy(reg(RBX), cst(7))]),
        (0x1018, 4, vec![branch(0x1040)]),
        (0x1030, 4, vec![copy(reg(RAX), cst(2)), copy(reg(RBX), cst(7))]),
        (0x1034, 4, vec![branch(0x1040)]),
        (0x1040, 4, vec![ret()]),
    ])
}

/// A branch around a single block: `if (RDI == 0) goto join; RAX = 1; join: return`
pub fn triangle_program() -> Vec<Instruction> {
    program(vec![
        (
            0x100,
            4,
            vec![
                binop(Opcode::IntEqual, tmp(0x100), reg(RDI), cst(0)),
                cbranch(0x110, tmp(0x100)),
            ],
        ),
        (0x104, 0xc, vec![copy(reg(RAX), cst(1))]),
        (0x110, 4, vec![ret()]),
    ])
}

/// A loop whose body is a two-way branch:
///
/// ```text
/// n0 -> n1 -> {n2, n3} -> n4 -> {n1, n5}
/// ```
pub fn loop_program() -> Vec<Instruction> {
    program(vec![
        (0x100, 4, vec![copy(reg(RBX), cst(0))]),
        (
            0x104,
            4,
            vec![
                binop(Opcode::IntEqual, tmp(0x100), reg(RDX), cst(0)),
                cbranch(0x110, tmp(0x100)),
            ],
        ),
        (0x108, 4, vec![copy(reg(RCX), cst(1))]),
        (0x10c, 4, vec![branch(0x118)]),
        (0x110, 8, vec![copy(reg(RSI), cst(2))]),
        (0x118, 4, vec![copy(reg(RDI), cst(3))]),
        (
            0x11c,
            4,
            vec![
                binop(Opcode::IntLess, tmp(0x200), reg(RDI), reg(RCX)),
                cbranch(0x104, tmp(0x200)),
            ],
        ),
        (0x120, 4, vec![ret()]),
    ])
}

#[test]
fn location_parsing_and_display() {
    assert_eq!(Space::parse("register").unwrap(), Space::Register);
    assert_eq!(Space::parse("const").unwrap(), Space::Const);
    assert!(matches!(
        Space::parse("stack"),
        Err(Error::Malformed { .. })
    ));

    assert_eq!(parse_hex("0x10").unwrap(), 16);
    assert_eq!(parse_hex("ff").unwrap(), 255);
    assert!(parse_hex("0xzz").is_err());

    assert_eq!(format!("{:?}", Location::constant(5, 4)), "0x5:4");
    assert_eq!(format!("{:?}", Location::unique(0x10, 8)), "U10:8");
    assert_eq!(format!("{:?}", reg(RAX)), "[register]0x0:8");
    assert_eq!(Location::constant(5, 4).const_value(), Some(5));
    assert_eq!(reg(RAX).const_value(), None);

    // Overlapping registers of different widths are different locations
    assert_ne!(Location::register(RAX, 4), reg(RAX));
}

#[test]
fn commutative_operations_are_canonicalized() {
    let add = PcodeOp::new(
        Address::machine(0),
        Opcode::IntAdd,
        vec![cst(5), reg(RDI)],
        Some(reg(RAX)),
    )
    .unwrap();
    assert_eq!(add.inputs, vec![reg(RDI), cst(5)]);

    let sub = PcodeOp::new(
        Address::machine(0),
        Opcode::IntSub,
        vec![cst(5), reg(RDI)],
        Some(reg(RAX)),
    )
    .unwrap();
    assert_eq!(sub.inputs, vec![cst(5), reg(RDI)]);
}

#[test]
fn malformed_operations_are_rejected() {
    let a = Address::machine(0);
    assert!(matches!(
        PcodeOp::new(a, Opcode::IntAdd, vec![reg(RDI)], Some(reg(RAX))),
        Err(Error::Malformed { .. })
    ));
    assert!(matches!(
        PcodeOp::new(a, Opcode::Store, vec![cst(0), reg(RDI), reg(RSI)], Some(reg(RAX))),
        Err(Error::Malformed { .. })
    ));
    assert!(matches!(
        PcodeOp::new(a, Opcode::Copy, vec![reg(RDI)], Some(cst(1))),
        Err(Error::Malformed { .. })
    ));
    assert!(Opcode::from_mnemonic("FROBNICATE").is_none());
    assert_eq!(Opcode::from_mnemonic("INT_XOR"), Some(Opcode::IntXor));
}

#[test]
fn instructions_split_after_control_transfer() {
    let insns = program(vec![(
        0x100,
        4,
        vec![
            copy(reg(RAX), cst(1)),
            cbranch(0x200, reg(RDX)),
            copy(reg(RAX), cst(2)),
            branch(0x300),
        ],
    )]);
    assert_eq!(insns.len(), 2);
    assert_eq!(insns[0].addr, Address::new(0x100, 0));
    assert_eq!(insns[1].addr, Address::new(0x100, 2));
    assert!(insns[0].is_conditional());
    assert_eq!(insns[0].target(), Some(Address::machine(0x200)));
    assert_eq!(insns[0].fallthrough(), Some(Address::new(0x100, 2)));
    assert_eq!(insns[1].next, Address::machine(0x104));
    assert_eq!(insns[1].target(), Some(Address::machine(0x300)));
    assert_eq!(insns[1].fallthrough(), None);
    assert_eq!(format!("{}", insns[1].addr), "0x100.02");
}

#[test]
fn blocks_partition_instructions() {
    for insns in [diamond_program(), triangle_program(), loop_program()] {
        let graph = decompose_into_blocks(&insns).unwrap();
        dbg!(&graph.iter().map(|(_, b)| b).collect::<Vec<_>>());

        let mut seen: Vec<Address> = graph
            .iter()
            .flat_map(|(_, b)| b.elems.iter().map(|i| i.addr))
            .collect();
        seen.sort();
        let all: Vec<Address> = insns.iter().map(|i| i.addr).collect();
        assert_eq!(seen, all);

        for (_, b) in graph.iter() {
            assert_eq!(b.start, b.elems[0].addr);
            assert_eq!(b.end, b.elems[b.elems.len() - 1].addr);
            for (x, y) in b.elems.iter().zip(b.elems.iter().skip(1)) {
                assert_eq!(x.next, y.addr);
            }
        }

        // Ids follow start addresses
        let starts: Vec<Address> = graph.iter().map(|(_, b)| b.start).collect();
        let mut sorted = starts.clone();
        sorted.sort();
        assert_eq!(starts, sorted);
    }
}

#[test]
fn successor_counts_follow_terminators() {
    let insns = diamond_program();
    let graph = decompose_into_blocks(&insns).unwrap();
    assert_eq!(graph.len(), 5);
    for (id, b) in graph.iter() {
        let last = b.elems.last().unwrap();
        let expected = if last.returns() {
            0
        } else if last.is_conditional() {
            2
        } else {
            1
        };
        assert_eq!(graph.successors(id).len(), expected, "block {}", b.start);
    }
}

#[test]
fn branch_into_block_middle_splits_it() {
    let insns = program(vec![
        (0x100, 4, vec![copy(reg(RAX), cst(0))]),
        (0x104, 4, vec![binop(Opcode::IntAdd, reg(RAX), reg(RAX), cst(1))]),
        (
            0x108,
            4,
            vec![
                binop(Opcode::IntLess, tmp(0), reg(RAX), cst(10)),
                cbranch(0x104, tmp(0)),
            ],
        ),
        (0x10c, 4, vec![ret()]),
    ]);
    let graph = decompose_into_blocks(&insns).unwrap();
    let starts: Vec<u64> = graph.iter().map(|(_, b)| b.start.offset).collect();
    assert_eq!(starts, vec![0x100, 0x104, 0x10c]);
    assert_eq!(graph.successors(NodeId(0)), &[NodeId(1)]);
    assert_unorderedset_eq(
        graph.successors(NodeId(1)).iter().copied(),
        [NodeId(1), NodeId(2)],
    );
    assert!(graph.successors(NodeId(2)).is_empty());
    assert_eq!(graph.node(NodeId(0)).end, Address::new(0x100, 0));
}

#[test]
fn loop_to_function_head_keeps_head_as_entry() {
    let insns = program(vec![
        (0x100, 4, vec![binop(Opcode::IntAdd, reg(RAX), reg(RAX), cst(1))]),
        (
            0x104,
            4,
            vec![
                binop(Opcode::IntLess, tmp(0), reg(RAX), cst(10)),
                cbranch(0x100, tmp(0)),
            ],
        ),
        (0x108, 4, vec![ret()]),
    ]);
    let cfg = Cfg::from_instructions(&insns).unwrap();
    assert!(cfg.graph.roots().is_empty());
    assert_eq!(cfg.graph.node(cfg.entry).start, Address::machine(0x100));
}

#[test]
fn branch_leaving_function_has_no_edge() {
    let insns = program(vec![
        (0x100, 4, vec![copy(reg(RAX), cst(0))]),
        (0x104, 4, vec![branch(0x9000)]),
    ]);
    let cfg = Cfg::from_instructions(&insns).unwrap();
    assert_eq!(cfg.graph.len(), 1);
    assert!(cfg.graph.successors(cfg.entry).is_empty());
}

#[test]
fn splitting_at_foreign_address_is_an_error() {
    let insns = diamond_program();
    let graph = decompose_into_blocks(&insns).unwrap();
    let mut b = graph.node(NodeId(0)).clone();
    assert!(matches!(
        b.split(Address::machine(0x1002)),
        Err(Error::Structure { .. })
    ));
    assert!(matches!(
        b.split(b.start),
        Err(Error::Structure { .. })
    ));
}

/// The example graph of Cooper, Harvey and Kennedy (figure 4), entry `s5`
fn chk_graph() -> (Graph<&'static str>, Vec<NodeId>) {
    let mut g = Graph::new();
    let s: Vec<NodeId> = ["s1", "s2", "s3", "s4", "s5"]
        .into_iter()
        .map(|n| g.add_node(n))
        .collect();
    for (a, b) in [(4, 2), (4, 3), (2, 1), (3, 0), (0, 1), (1, 0)] {
        g.add_edge(s[a], s[b]).unwrap();
    }
    (g, s)
}

#[test]
fn dominators_of_simple_graph() {
    let (g, s) = chk_graph();
    let dom = Dominance::compute(&g, s[4]).unwrap();
    dbg!(&dom);

    for &n in &s[..4] {
        assert_eq!(dom.immediate_dominator(n), Some(s[4]));
    }
    assert_eq!(dom.postorder_index(s[4]), Some(4));
    assert_eq!(dom.reverse_postorder().next(), Some(s[4]));

    assert_unorderedset_eq(dom.frontier(s[2]).iter().copied(), [s[1]]);
    assert_unorderedset_eq(dom.frontier(s[3]).iter().copied(), [s[0]]);
    assert_unorderedset_eq(dom.frontier(s[0]).iter().copied(), [s[1]]);
    assert_unorderedset_eq(dom.frontier(s[1]).iter().copied(), [s[0]]);
    assert!(dom.frontier(s[4]).is_empty());

    assert!(dom.is_converged(&g));
}

#[test]
fn dominators_of_loop_graph() {
    let insns = loop_program();
    let cfg = Cfg::from_instructions(&insns).unwrap();
    let n: Vec<NodeId> = cfg.graph.ids().collect();
    assert_eq!(n.len(), 6);
    let dom = &cfg.dom;

    assert_eq!(dom.immediate_dominator(n[0]), Some(n[0]));
    assert_eq!(dom.immediate_dominator(n[1]), Some(n[0]));
    assert_eq!(dom.immediate_dominator(n[2]), Some(n[1]));
    assert_eq!(dom.immediate_dominator(n[3]), Some(n[1]));
    assert_eq!(dom.immediate_dominator(n[4]), Some(n[1]));
    assert_eq!(dom.immediate_dominator(n[5]), Some(n[4]));

    assert!(dom.frontier(n[0]).is_empty());
    assert_unorderedset_eq(dom.frontier(n[1]).iter().copied(), [n[1]]);
    assert_unorderedset_eq(dom.frontier(n[2]).iter().copied(), [n[4]]);
    assert_unorderedset_eq(dom.frontier(n[3]).iter().copied(), [n[4]]);
    assert_unorderedset_eq(dom.frontier(n[4]).iter().copied(), [n[1]]);
    assert!(dom.frontier(n[5]).is_empty());

    assert!(dom.strictly_dominates(n[1], n[5]));
    assert!(!dom.strictly_dominates(n[2], n[4]));
    assert_eq!(dom.children(n[1]).len(), 3);

    // Frontier members are joins just outside the region their block dominates
    for x in cfg.graph.ids() {
        for &y in dom.frontier(x) {
            assert!(!dom.strictly_dominates(x, y));
            assert!(cfg
                .graph
                .predecessors(y)
                .iter()
                .any(|&p| dom.dominates(x, p)));
        }
    }
}

#[test]
fn dominance_is_idempotent() {
    let insns = loop_program();
    let cfg = Cfg::from_instructions(&insns).unwrap();
    assert!(cfg.dom.is_converged(&cfg.graph));
    let again = Dominance::compute(&cfg.graph, cfg.entry).unwrap();
    for n in cfg.graph.ids() {
        assert_eq!(
            again.immediate_dominator(n),
            cfg.dom.immediate_dominator(n)
        );
        assert_eq!(again.frontier(n), cfg.dom.frontier(n));
    }
}

#[test]
fn graph_retain_remaps_ids() {
    let (g, s) = chk_graph();
    let (kept, remap) = g.retain(|id, _| id != s[2]);
    assert_eq!(kept.len(), 4);
    assert_eq!(remap[s[2].0], None);
    let s5 = remap[s[4].0].unwrap();
    let s4 = remap[s[3].0].unwrap();
    assert_eq!(kept.successors(s5), &[s4]);
    assert_eq!(*kept.node(s5), "s5");
    assert!(kept.generate_dot("g", |_, n| n.to_string()).contains("s5"));
}

#[test]
fn phis_at_iterated_dominance_frontier() {
    let insns = loop_program();
    let mut cfg = Cfg::from_instructions(&insns).unwrap().lower().unwrap();
    let placed = place_phis(&mut cfg, &Abi::x86_64());
    dbg!(&placed);
    let n: Vec<NodeId> = cfg.graph.ids().collect();

    // Written in one arm only: the join, then the loop head through the back edge
    assert_unorderedset_eq(placed.get(&reg(RCX)).unwrap().iter().copied(), [n[1], n[4]]);
    assert_unorderedset_eq(placed.get(&reg(RSI)).unwrap().iter().copied(), [n[1], n[4]]);
    // Written in the loop latch
    assert_unorderedset_eq(placed.get(&reg(RDI)).unwrap().iter().copied(), [n[1]]);
    // Written once before the loop
    assert!(!placed.contains_key(&reg(RBX)));
    // Temporaries and never-written locations
    assert!(!placed.contains_key(&tmp(0x100)));
    assert!(!placed.contains_key(&reg(RDX)));

    let phis_in = |b: NodeId| cfg.graph.node(b).elems.iter().filter(|o| o.is_phi()).count();
    assert_eq!(phis_in(n[1]), 3);
    assert_eq!(phis_in(n[4]), 2);
    assert_eq!(phis_in(n[0]), 0);
}

#[test]
fn ssa_is_single_assignment() {
    for insns in [diamond_program(), triangle_program(), loop_program()] {
        let func = to_ssa(&insns);
        let mut defined = UnorderedSet::new();
        for op in func.live_ops() {
            let o = func.op(op);
            for v in o.output.iter().chain(o.clobbers.iter()) {
                assert!(defined.insert(*v), "{:?} defined twice", v);
                assert_eq!(func.value(*v).def, Some(op));
            }
            // Use lists agree with operands
            for (i, v) in o.inputs.iter().enumerate() {
                assert!(func
                    .value(*v)
                    .uses
                    .iter()
                    .any(|u| u.op == op && u.slot == crate::ssa::Slot::Input(i)));
            }
        }
        for (v, val) in func.arena.values() {
            assert_eq!(val.def.is_some(), defined.contains(&v));
        }
    }
}

#[test]
fn phi_inputs_follow_predecessors() {
    let func = to_ssa(&loop_program());
    let head = block_starting(&func, 0x104);
    let npreds = func.cfg.graph.predecessors(head).len();
    assert_eq!(npreds, 2);
    for &op in func.ops_of(head) {
        let o = func.op(op);
        if !o.is_phi() {
            break;
        }
        assert_eq!(o.inputs.len(), npreds);
        let loc = func.value(o.output.unwrap()).loc;
        for &v in &o.inputs {
            assert_eq!(func.value(v).loc, loc);
        }
    }
}

#[test]
fn diamond_join_gets_one_phi() {
    let insns = diamond_program();
    let mut func = to_ssa(&insns);
    simplify::simplify(&mut func, &DecompilerConfig::default()).unwrap();
    println!("{:?}", func.debug_listing());

    let join = block_starting(&func, 0x1040);
    let phis: Vec<_> = func
        .ops_of(join)
        .iter()
        .filter(|&&op| func.op(op).is_phi())
        .collect();
    assert_eq!(phis.len(), 1);
    let phi = func.op(*phis[0]);
    assert_eq!(func.value(phi.output.unwrap()).loc, reg(RAX));
    assert_unorderedset_eq(
        phi.inputs.iter().map(|&v| func.arena.const_value(v)),
        [Some(1), Some(2)],
    );

    // Nothing else carries a phi
    let total_phis = func.live_ops().filter(|&op| func.op(op).is_phi()).count();
    assert_eq!(total_phis, 1);
}

#[test]
fn entry_loop_header_gets_phi_with_function_input() {
    // `RAX += 1` until `RDX == 0`, looping straight back to the first instruction
    let insns = program(vec![
        (
            0x100,
            4,
            vec![
                binop(Opcode::IntAdd, reg(RAX), reg(RAX), cst(1)),
                binop(Opcode::IntEqual, tmp(0x100), reg(RDX), cst(0)),
                cbranch(0x100, tmp(0x100)),
            ],
        ),
        (0x104, 4, vec![ret()]),
    ]);
    let mut cfg = Cfg::from_instructions(&insns).unwrap().lower().unwrap();
    let entry = cfg.entry;
    assert!(cfg.dom.frontier(entry).contains(&entry));
    let placed = place_phis(&mut cfg, &Abi::x86_64());
    assert_unorderedset_eq(placed.get(&reg(RAX)).unwrap().iter().copied(), [entry]);

    let func = to_ssa(&insns);
    let entry = func.cfg.entry;
    assert_eq!(func.cfg.graph.predecessors(entry), &[entry]);
    let ops = func.ops_of(entry);
    let phi = func.op(ops[0]);
    assert!(phi.is_phi());
    assert_eq!(phi.inputs.len(), 2);

    let add = ops[1];
    assert_eq!(func.op(add).opcode, Opcode::IntAdd);
    // Around the loop, then on entry to the function
    assert_eq!(phi.inputs[0], func.op(add).output.unwrap());
    assert!(func.value(phi.inputs[1]).is_function_input());
    assert_eq!(func.op(add).inputs[0], phi.output.unwrap());
}

fn single_op_function(op: RawOp) -> Decompilation {
    let insns = program(vec![(0x100, 4, vec![op]), (0x104, 4, vec![ret()])]);
    Decompilation::run(insns, Abi::x86_64(), &DecompilerConfig::default()).unwrap()
}

#[test]
fn or_with_zero_is_identity() {
    let d = single_op_function(binop(Opcode::IntOr, reg(RAX), reg(RDI), cst(0)));
    assert!(d
        .ssa
        .live_ops()
        .all(|op| d.ssa.op(op).opcode != Opcode::IntOr));
    assert_eq!(d.ast.to_string(), "// 0x100.00\nreturn RDI;\n");
}

#[test]
fn and_with_zero_is_zero() {
    let d = single_op_function(binop(Opcode::IntAnd, reg(RAX), reg(RDI), cst(0)));
    assert!(d.ast.to_string().contains("return 0x0;"));
    assert!(d.parameters().is_empty());
}

#[test]
fn xor_with_self_is_zero() {
    let d = single_op_function(binop(Opcode::IntXor, reg(RAX), reg(RDI), reg(RDI)));
    assert!(d.ast.to_string().contains("return 0x0;"));
}

#[test]
fn reduction_table() {
    let rdi = || Some(reg(RDI));
    let cases: Vec<(RawOp, Option<Option<Location>>)> = vec![
        (binop(Opcode::IntAdd, reg(RAX), reg(RDI), cst(0)), Some(rdi())),
        (binop(Opcode::IntSub, reg(RAX), reg(RDI), cst(0)), Some(rdi())),
        (binop(Opcode::IntLeft, reg(RAX), reg(RDI), cst(0)), Some(rdi())),
        (binop(Opcode::IntRight, reg(RAX), reg(RDI), cst(0)), Some(rdi())),
        (binop(Opcode::IntSRight, reg(RAX), reg(RDI), cst(0)), Some(rdi())),
        (binop(Opcode::IntMult, reg(RAX), reg(RDI), cst(0)), Some(None)),
        (binop(Opcode::IntMult, reg(RAX), cst(0), reg(RDI)), Some(None)),
        (binop(Opcode::IntMult, reg(RAX), reg(RDI), cst(1)), Some(rdi())),
        (binop(Opcode::IntDiv, reg(RAX), reg(RDI), cst(1)), Some(rdi())),
        (binop(Opcode::IntSDiv, reg(RAX), reg(RDI), cst(1)), Some(rdi())),
        (binop(Opcode::IntAnd, reg(RAX), reg(RDI), reg(RDI)), Some(rdi())),
        (binop(Opcode::IntOr, reg(RAX), reg(RDI), reg(RDI)), Some(rdi())),
        (binop(Opcode::IntSub, reg(RAX), reg(RDI), cst(1)), None),
        (binop(Opcode::IntDiv, reg(RAX), cst(1), reg(RDI)), None),
        (binop(Opcode::IntAdd, reg(RAX), reg(RDI), reg(RDI)), None),
    ];
    for (raw, expected) in cases {
        let opcode = raw.0;
        let func = to_ssa(&program(vec![(0x100, 4, vec![raw]), (0x104, 4, vec![ret()])]));
        let op = *func
            .ops_of(func.cfg.entry)
            .iter()
            .find(|&&op| func.op(op).opcode == opcode)
            .unwrap();
        let got = simplify::reduction(&func.arena, op).map(|r| match r {
            Reduction::Identity(v) => Some(func.value(v).loc),
            Reduction::Zero => None,
        });
        assert_eq!(got, expected, "{}", func.display_op(op));
    }
}

/// A diamond on `RDX == 0` whose arms write `RAX` from `left` and `right`
fn two_arm_program(left: Location, right: Location) -> Vec<Instruction> {
    program(vec![
        (
            0x1000,
            4,
            vec![
                binop(Opcode::IntEqual, tmp(0x100), reg(RDX), cst(0)),
                cbranch(0x1010, tmp(0x100)),
            ],
        ),
        (0x1004, 4, vec![copy(reg(RAX), left)]),
        (0x1008, 4, vec![branch(0x1014)]),
        (0x1010, 4, vec![copy(reg(RAX), right)]),
        (0x1014, 4, vec![ret()]),
    ])
}

fn join_phi(func: &SsaFunction) -> OpId {
    let join = block_starting(func, 0x1014);
    *func
        .ops_of(join)
        .iter()
        .find(|&&op| func.op(op).is_phi())
        .unwrap()
}

#[test]
fn phi_of_equal_inputs_is_identity() {
    let config = DecompilerConfig::default();
    let mut func = to_ssa(&two_arm_program(cst(7), cst(7)));
    let phi = join_phi(&func);
    assert_eq!(simplify::reduction(&func.arena, phi), None);

    for arm in [0x1004, 0x1010] {
        let b = block_starting(&func, arm);
        simplify::simplify_block(&mut func, b, &config);
    }
    match simplify::reduction(&func.arena, phi) {
        Some(Reduction::Identity(v)) => assert_eq!(func.arena.const_value(v), Some(7)),
        other => panic!("phi reduced to {:?}", other),
    }

    let d = Decompilation::run(
        two_arm_program(cst(7), cst(7)),
        Abi::x86_64(),
        &config,
    )
    .unwrap();
    assert!(d.ssa.live_ops().all(|op| !d.ssa.op(op).is_phi()));
    assert!(d.ast.to_string().contains("return 0x7;"));
}

#[test]
fn register_copies_are_not_propagated_into_phis() {
    let mut func = to_ssa(&two_arm_program(reg(RDI), reg(RSI)));
    simplify::simplify(&mut func, &DecompilerConfig::default()).unwrap();
    println!("{:?}", func.debug_listing());

    let phi = func.op(join_phi(&func));
    assert_eq!(phi.inputs.len(), 2);
    let mut sources = vec![];
    for &v in &phi.inputs {
        assert_eq!(func.value(v).loc, reg(RAX));
        let def = func.value(v).def.unwrap();
        let o = func.op(def);
        assert!(o.is_copy() && !o.removed);
        sources.push(func.value(o.inputs[0]).loc);
    }
    assert_unorderedset_eq(sources, [reg(RDI), reg(RSI)]);
}

#[test]
fn algebraic_rewrites_can_be_disabled() {
    let insns = program(vec![
        (0x100, 4, vec![binop(Opcode::IntOr, reg(RAX), reg(RDI), cst(0))]),
        (0x104, 4, vec![ret()]),
    ]);
    let config = DecompilerConfig {
        enable_algebraic_rewrites: false,
        ..Default::default()
    };
    let d = Decompilation::run(insns, Abi::x86_64(), &config).unwrap();
    assert!(d.ast.to_string().contains("return (RDI | 0x0);"));
}

#[test]
fn simplification_reaches_fixed_point() {
    let config = DecompilerConfig::default();
    for insns in [diamond_program(), triangle_program(), loop_program()] {
        let mut func = to_ssa(&insns);
        simplify::simplify(&mut func, &config).unwrap();
        let before = format!("{:?}", func.debug_listing());

        for b in func.cfg.graph.ids() {
            assert_eq!(
                simplify::simplify_block(&mut func, b, &config),
                Progress::default()
            );
        }
        assert_eq!(simplify::simplify(&mut func, &config).unwrap(), 1);
        assert_eq!(format!("{:?}", func.debug_listing()), before);
    }
}

#[test]
fn side_effects_survive_simplification() {
    let insns = program(vec![
        (
            0x100,
            4,
            vec![(Opcode::Store, vec![cst(0x1b1), reg(RDI), reg(RSI)], None)],
        ),
        (0x104, 4, vec![call(0x2000)]),
        (0x108, 4, vec![ret()]),
    ]);
    let d = Decompilation::run(insns, Abi::x86_64(), &DecompilerConfig::default()).unwrap();
    let opcodes: Vec<Opcode> = d.ssa.live_ops().map(|op| d.ssa.op(op).opcode).collect();
    assert_eq!(opcodes, vec![Opcode::Store, Opcode::Call, Opcode::Return]);

    let text = d.ast.to_string();
    assert!(text.contains("*RDI = RSI;"));
    // The return hands back what the call left in RAX
    assert!(text.contains("v0 = call 0x2000();"));
    assert!(text.contains("return v0;"));
}

#[test]
fn emptied_block_is_pruned() {
    let insns = program(vec![
        (
            0x100,
            4,
            vec![
                binop(Opcode::IntEqual, tmp(0x100), reg(RDI), cst(0)),
                cbranch(0x120, tmp(0x100)),
            ],
        ),
        (0x104, 4, vec![branch(0x110)]),
        (0x110, 0x10, vec![copy(reg(RBX), cst(1))]),
        (0x120, 4, vec![ret()]),
    ]);
    let mut func = to_ssa(&insns);
    assert_eq!(func.cfg.graph.len(), 4);
    simplify::simplify(&mut func, &DecompilerConfig::default()).unwrap();

    assert_eq!(func.cfg.graph.len(), 3);
    assert_eq!(func.block_ops.len(), 3);
    assert!(func.cfg.block_at(Address::machine(0x110)).is_none());
    let jump = block_starting(&func, 0x104);
    let exit = block_starting(&func, 0x120);
    assert_eq!(func.cfg.graph.successors(jump), &[exit]);
    assert!(func.cfg.dom.is_converged(&func.cfg.graph));
}

#[test]
fn block_feeding_conditional_join_is_kept() {
    let mut func = to_ssa(&triangle_program());
    simplify::simplify(&mut func, &DecompilerConfig::default()).unwrap();
    // The arm is empty, but dropping it would duplicate the edge into the join
    let arm = block_starting(&func, 0x104);
    assert!(func.ops_of(arm).is_empty());
    assert_eq!(func.cfg.graph.len(), 3);
}

fn ifs(list: &StmtBlockList) -> Vec<&Stmt> {
    list.blocks
        .iter()
        .flat_map(|b| b.stmts.iter())
        .filter(|s| matches!(s, Stmt::If { .. }))
        .collect()
}

#[test]
fn diamond_becomes_single_if() {
    let d = Decompilation::run(diamond_program(), Abi::x86_64(), &DecompilerConfig::default())
        .unwrap();
    println!("{}", d.ast);

    let found = ifs(&d.ast);
    assert_eq!(found.len(), 1);
    match found[0] {
        Stmt::If {
            cond, body, orelse, ..
        } => {
            assert_eq!(cond.to_string(), "(RDX == 0x0)");
            assert_eq!(body.blocks[0].start, Address::machine(0x1030));
            let orelse = orelse.as_ref().unwrap();
            assert_eq!(orelse.blocks[0].start, Address::machine(0x1014));
            assert!(ifs(body).is_empty());
        }
        _ => unreachable!(),
    }

    let top: Vec<u64> = d.ast.blocks.iter().map(|b| b.start.offset).collect();
    assert_eq!(top, vec![0x1000, 0x1010, 0x1040]);

    // Every reachable block is emitted exactly once
    let mut starts = d.ast.block_starts();
    starts.sort();
    let mut expected: Vec<Address> = d.ssa.cfg.graph.iter().map(|(_, b)| b.start).collect();
    expected.sort();
    assert_eq!(starts, expected);

    let join = d.ast.blocks.last().unwrap();
    assert_eq!(join.predecessors.len(), 2);
    assert!(join.successors.is_empty());
    assert!(d.ast.to_string().contains("return v0;"));
    assert!(d.versions_unwound());
}

#[test]
fn rejoining_arm_swaps_branch_polarity() {
    let d = Decompilation::run(triangle_program(), Abi::x86_64(), &DecompilerConfig::default())
        .unwrap();
    println!("{}", d.ast);

    let found = ifs(&d.ast);
    assert_eq!(found.len(), 1);
    match found[0] {
        Stmt::If {
            cond, body, orelse, ..
        } => {
            assert_eq!(cond.to_string(), "(RDI != 0x0)");
            assert_eq!(body.blocks.len(), 1);
            assert_eq!(body.blocks[0].start, Address::machine(0x104));
            assert!(orelse.is_none());
        }
        _ => unreachable!(),
    }
    let top: Vec<u64> = d.ast.blocks.iter().map(|b| b.start.offset).collect();
    assert_eq!(top, vec![0x100, 0x110]);
}

#[test]
fn back_edge_becomes_goto() {
    let d = Decompilation::run(loop_program(), Abi::x86_64(), &DecompilerConfig::default())
        .unwrap();
    let text = d.ast.to_string();
    println!("{}", text);
    assert!(text.contains("goto 0x104.00;"));

    let mut starts = d.ast.block_starts();
    starts.sort();
    let mut expected: Vec<Address> = d.ssa.cfg.graph.iter().map(|(_, b)| b.start).collect();
    expected.sort();
    assert_eq!(starts, expected);
}

#[test]
fn negation_folds() {
    let x = Expr::var("x");
    let not_x = Expr::negate(&x);
    assert_eq!(not_x.to_string(), "!x");
    assert_eq!(Expr::negate(&not_x), x);

    let eq = Rc::new(Expr::Binary {
        op: Opcode::IntEqual,
        lhs: x.clone(),
        rhs: Expr::constant(0, 8),
    });
    let ne = Expr::negate(&eq);
    assert_eq!(ne.to_string(), "(x != 0x0)");
    assert_eq!(Expr::negate(&ne), eq);
}

#[test]
fn multiply_used_values_are_named() {
    let insns = program(vec![
        (0x100, 4, vec![binop(Opcode::IntAdd, reg(RCX), reg(RDI), cst(1))]),
        (0x104, 4, vec![binop(Opcode::IntMult, reg(RAX), reg(RCX), reg(RCX))]),
        (0x108, 4, vec![ret()]),
    ]);
    let d = Decompilation::run(insns, Abi::x86_64(), &DecompilerConfig::default()).unwrap();
    let text = d.ast.to_string();
    assert!(text.contains("v0 = (RDI + 0x1);"));
    assert!(text.contains("return (v0 * v0);"));
}

#[test]
fn loads_are_named_unless_configured() {
    let insns = program(vec![
        (0x100, 4, vec![(Opcode::Load, vec![cst(0x1b1), reg(RDI)], Some(reg(RAX)))]),
        (0x104, 4, vec![ret()]),
    ]);
    let d = Decompilation::run(insns.clone(), Abi::x86_64(), &DecompilerConfig::default())
        .unwrap();
    assert!(d.ast.to_string().contains("v0 = *RDI;"));

    let config = DecompilerConfig {
        inline_single_use_loads: true,
        ..Default::default()
    };
    let d = Decompilation::run(insns, Abi::x86_64(), &config).unwrap();
    assert!(d.ast.to_string().contains("return *RDI;"));
}

#[test]
fn without_abi_returns_observe_nothing() {
    let insns = program(vec![
        (0x100, 4, vec![binop(Opcode::IntAdd, reg(RAX), reg(RDI), reg(RSI))]),
        (0x104, 4, vec![ret()]),
    ]);
    let d = Decompilation::run(insns, Abi::none(), &DecompilerConfig::default()).unwrap();
    assert_eq!(d.ast.to_string(), "// 0x100.00\nreturn;\n");
}

#[test]
fn call_output_is_not_clobbered() {
    let insns = program(vec![
        (
            0x100,
            4,
            vec![(Opcode::CallOther, vec![cst(5), reg(RDI)], Some(reg(RAX)))],
        ),
        (0x104, 4, vec![ret()]),
    ]);
    let func = to_ssa(&insns);
    let ops = func.ops_of(func.cfg.entry);
    let call = func.op(ops[0]);
    assert_eq!(call.opcode, Opcode::CallOther);
    let out = call.output.unwrap();
    assert!(call.clobbers.iter().all(|&v| func.value(v).loc != reg(RAX)));
    assert_eq!(call.clobbers.len(), Abi::x86_64().killed_locations.len() - 1);

    let ret = func.op(*ops.last().unwrap());
    assert!(ret.opcode.returns());
    assert_eq!(ret.observed, vec![out]);

    let d = Decompilation::run(insns, Abi::x86_64(), &DecompilerConfig::default()).unwrap();
    let text = d.ast.to_string();
    assert!(text.contains("CALLOTHER"));
    assert!(!text.contains("return RAX;"));
}

fn add_listing() -> serde_json::Value {
    serde_json::json!([
        {
            "addr": "0x1000",
            "length": 3,
            "pcode": [{
                "addr": 4096.0,
                "mnemonic": "INT_ADD",
                "inputs": [
                    { "space": "register", "offset": "0x38", "size": "0x8" },
                    { "space": "register", "offset": "0x30", "size": 8 }
                ],
                "output": { "space": "register", "offset": "0x0", "size": 8 }
            }]
        },
        {
            "address": "0x1003",
            "length": "0x1",
            "pcode": [{
                "address": 4099.0,
                "mnemonic": "RETURN",
                "inputs": [{ "space": "register", "offset": "0x288", "size": 8 }]
            }]
        }
    ])
}

#[test]
fn lift_json_listing() {
    let insns = crate::lifter::lift_from_json(&add_listing().to_string()).unwrap();
    assert_eq!(insns.len(), 2);
    assert_eq!(insns[0].addr, Address::machine(0x1000));
    assert_eq!(insns[0].next, Address::machine(0x1003));
    assert_eq!(insns[0].ops[0].opcode, Opcode::IntAdd);
    assert_eq!(insns[0].ops[0].inputs, vec![reg(RDI), reg(RSI)]);
    assert!(insns[1].returns());
    assert_eq!(insns[1].ops[0].inputs, vec![reg(RIP)]);
}

#[test]
fn decompile_json_listing() {
    let d = Decompilation::from_json(
        &add_listing().to_string(),
        Abi::x86_64(),
        &DecompilerConfig::default(),
    )
    .unwrap();
    assert!(d.ast.to_string().contains("return (RDI + RSI);"));
    assert_eq!(d.parameters(), vec![reg(RDI), reg(RSI)]);

    let cfg = serde_json::to_value(d.cfg_listing()).unwrap();
    assert_eq!(cfg["entry"], "0x1000.00");
    assert_eq!(cfg["blocks"].as_array().unwrap().len(), 1);
    assert!(cfg["blocks"][0]["successors"].as_array().unwrap().is_empty());

    let ast = serde_json::to_value(d.ast_listing()).unwrap();
    assert_eq!(ast["blocks"][0]["statements"][0], "return (RDI + RSI);");
    assert!(d.generate_dot().contains("digraph"));
}

#[test]
fn malformed_listings_are_rejected() {
    let mut bad_mnemonic = add_listing();
    bad_mnemonic[0]["pcode"][0]["mnemonic"] = "FROBNICATE".into();
    assert!(matches!(
        crate::lifter::lift_from_json(&bad_mnemonic.to_string()),
        Err(Error::Malformed { .. })
    ));

    let mut bad_space = add_listing();
    bad_space[0]["pcode"][0]["inputs"][0]["space"] = "stack".into();
    assert!(matches!(
        crate::lifter::lift_from_json(&bad_space.to_string()),
        Err(Error::Malformed { .. })
    ));

    let mut backwards = add_listing();
    backwards[1]["pcode"] = serde_json::json!([
        { "address": 4100.0, "mnemonic": "COPY",
          "inputs": [{ "space": "const", "offset": "0x1", "size": 8 }],
          "output": { "space": "register", "offset": "0x0", "size": 8 } },
        { "address": 4099.0, "mnemonic": "RETURN",
          "inputs": [{ "space": "register", "offset": "0x288", "size": 8 }] }
    ]);
    assert!(matches!(
        crate::lifter::lift_from_json(&backwards.to_string()),
        Err(Error::Malformed { .. })
    ));

    let mut duplicate = add_listing();
    duplicate[1]["address"] = "0x1000".into();
    assert!(matches!(
        crate::lifter::lift_from_json(&duplicate.to_string()),
        Err(Error::Malformed { .. })
    ));

    let mut missing_field = add_listing();
    missing_field[0]["pcode"][0]
        .as_object_mut()
        .unwrap()
        .remove("mnemonic");
    assert!(matches!(
        crate::lifter::lift_from_json(&missing_field.to_string()),
        Err(Error::Malformed { .. })
    ));
    assert!(matches!(
        crate::lifter::lift_from_json(r#"{ "address": "0x1000" }"#),
        Err(Error::Malformed { .. })
    ));

    let past_the_end = serde_json::json!([{
        "address": "0xfffffffffffffffe",
        "length": 4,
        "pcode": [{ "mnemonic": "RETURN",
                    "inputs": [{ "space": "register", "offset": "0x288", "size": 8 }] }]
    }]);
    assert!(matches!(
        crate::lifter::lift_from_json(&past_the_end.to_string()),
        Err(Error::Malformed { .. })
    ));
    assert!(matches!(
        Instruction::split_machine_instruction(u64::MAX, 1, vec![]),
        Err(Error::Malformed { .. })
    ));

    assert!(matches!(
        crate::lifter::lift_from_json("{ not json"),
        Err(Error::Json(_))
    ));
    assert!(matches!(
        crate::lifter::lift_from_json("[]"),
        Ok(v) if v.is_empty()
    ));
    assert!(matches!(
        Decompilation::from_json("[]", Abi::x86_64(), &DecompilerConfig::default()),
        Err(Error::Malformed { .. })
    ));
}
