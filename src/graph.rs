//! A generic directed graph with dominance analysis.
//!
//! Nodes live in a `Vec` and are referred to by [`NodeId`]. Edges are kept in parallel
//! predecessor/successor vectors owned by the graph, so node payloads never point at each other.
//! Derived structures (postorder numbering, immediate dominators, frontiers and the dominator tree)
//! are likewise parallel arrays indexed by the same ids, see [`Dominance`].
//!
//! Dominators are computed with the iterative scheme of Cooper, Harvey and Kennedy, "A Simple,
//! Fast Dominance Algorithm".

use crate::containers::unordered::UnorderedSet;
use crate::error::Result;
use crate::log::*;

/// Stable index of a node within one [`Graph`]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub usize);

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "n{}", self.0)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "n{}", self.0)
    }
}

#[derive(Clone)]
pub struct Graph<N> {
    nodes: Vec<N>,
    preds: Vec<Vec<NodeId>>,
    succs: Vec<Vec<NodeId>>,
}

impl<N> Default for Graph<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<N> Graph<N> {
    pub fn new() -> Self {
        Self {
            nodes: vec![],
            preds: vec![],
            succs: vec![],
        }
    }

    pub fn add_node(&mut self, n: N) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(n);
        self.preds.push(vec![]);
        self.succs.push(vec![]);
        id
    }

    fn check(&self, id: NodeId) -> Result<()> {
        if id.0 < self.nodes.len() {
            Ok(())
        } else {
            Err(structure_error!(
                "{:?} is not a node of a graph with {} nodes",
                id,
                self.nodes.len()
            ))
        }
    }

    /// Add the edge `from -> to`. Adding an edge that already exists does nothing.
    pub fn add_edge(&mut self, from: NodeId, to: NodeId) -> Result<()> {
        self.check(from)?;
        self.check(to)?;
        if !self.succs[from.0].contains(&to) {
            self.succs[from.0].push(to);
            self.preds[to.0].push(from);
        }
        Ok(())
    }

    pub fn remove_edge(&mut self, from: NodeId, to: NodeId) -> Result<()> {
        self.check(from)?;
        self.check(to)?;
        self.succs[from.0].retain(|&s| s != to);
        self.preds[to.0].retain(|&p| p != from);
        Ok(())
    }

    pub fn has_edge(&self, from: NodeId, to: NodeId) -> bool {
        self.succs
            .get(from.0)
            .map_or(false, |s| s.contains(&to))
    }

    /// Route control around `node`, which must have exactly one predecessor `p` and one
    /// successor `s`: the edge `p -> s` takes the place of `p -> node` in `p`'s successor list
    /// and of `node -> s` in `s`'s predecessor list, and `node` is left without edges.
    pub fn bypass(&mut self, node: NodeId) -> Result<()> {
        self.check(node)?;
        let (p, s) = match (self.preds[node.0].as_slice(), self.succs[node.0].as_slice()) {
            ([p], [s]) => (*p, *s),
            _ => {
                return Err(structure_error!(
                    "Cannot bypass {:?}: needs exactly one predecessor and one successor",
                    node
                ))
            }
        };
        if p == node || s == node || self.has_edge(p, s) {
            return Err(structure_error!("Bypassing {:?} would duplicate an edge", node));
        }
        for x in self.succs[p.0].iter_mut().filter(|x| **x == node) {
            *x = s;
        }
        for x in self.preds[s.0].iter_mut().filter(|x| **x == node) {
            *x = p;
        }
        self.preds[node.0].clear();
        self.succs[node.0].clear();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &N {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut N {
        &mut self.nodes[id.0]
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> {
        (0..self.nodes.len()).map(NodeId)
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &N)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeId(i), n))
    }

    pub fn predecessors(&self, id: NodeId) -> &[NodeId] {
        &self.preds[id.0]
    }

    pub fn successors(&self, id: NodeId) -> &[NodeId] {
        &self.succs[id.0]
    }

    /// Nodes without predecessors
    pub fn roots(&self) -> Vec<NodeId> {
        self.ids().filter(|&n| self.preds[n.0].is_empty()).collect()
    }

    /// Depth-first traversal from `start`, skipping nodes already marked in `visited`. `pre` runs
    /// when a node is first reached, `post` once all of its successors have been handled.
    pub fn dfs_with_visited(
        &self,
        start: NodeId,
        visited: &mut [bool],
        pre: &mut impl FnMut(NodeId),
        post: &mut impl FnMut(NodeId),
    ) {
        if visited[start.0] {
            return;
        }
        visited[start.0] = true;
        pre(start);
        let mut stack: Vec<(NodeId, usize)> = vec![(start, 0)];
        while let Some((n, i)) = stack.pop() {
            if let Some(&s) = self.succs[n.0].get(i) {
                stack.push((n, i + 1));
                if !visited[s.0] {
                    visited[s.0] = true;
                    pre(s);
                    stack.push((s, 0));
                }
            } else {
                post(n);
            }
        }
    }

    /// Depth-first traversal from `start` with pre- and post-visit callbacks
    pub fn dfs(&self, start: NodeId, mut pre: impl FnMut(NodeId), mut post: impl FnMut(NodeId)) {
        let mut visited = vec![false; self.nodes.len()];
        self.dfs_with_visited(start, &mut visited, &mut pre, &mut post);
    }

    /// Nodes reachable from `entry`, in post-visit order; `entry` comes last.
    pub fn postorder(&self, entry: NodeId) -> Vec<NodeId> {
        let mut order = vec![];
        self.dfs(entry, |_| {}, |n| order.push(n));
        order
    }

    /// An isomorphic graph (same ids, same edge order) with every payload mapped through `f`.
    pub fn copy<M>(&self, mut f: impl FnMut(NodeId, &N) -> M) -> Graph<M> {
        Graph {
            nodes: self.iter().map(|(id, n)| f(id, n)).collect(),
            preds: self.preds.clone(),
            succs: self.succs.clone(),
        }
    }

    /// Keep only the nodes selected by `keep`, renumbering them in their current order. Edges
    /// touching a dropped node are dropped too. Returns the new graph and the old-to-new id map.
    pub fn retain(
        self,
        mut keep: impl FnMut(NodeId, &N) -> bool,
    ) -> (Graph<N>, Vec<Option<NodeId>>) {
        let mut remap = vec![None; self.nodes.len()];
        let mut next = 0;
        for (id, n) in self.iter() {
            if keep(id, n) {
                remap[id.0] = Some(NodeId(next));
                next += 1;
            }
        }
        let fix = |v: &Vec<NodeId>| -> Vec<NodeId> { v.iter().filter_map(|n| remap[n.0]).collect() };
        let mut g = Graph::new();
        for (i, n) in self.nodes.into_iter().enumerate() {
            if remap[i].is_some() {
                g.nodes.push(n);
                g.preds.push(fix(&self.preds[i]));
                g.succs.push(fix(&self.succs[i]));
            }
        }
        (g, remap)
    }

    /// Write a GraphViz rendering of the graph, labelling each node with `label`.
    pub fn write_dot(
        &self,
        w: &mut impl std::io::Write,
        name: &str,
        label: impl Fn(NodeId, &N) -> String,
    ) -> std::io::Result<()> {
        type Edge = (NodeId, NodeId);
        struct View<'a, N, L> {
            g: &'a Graph<N>,
            name: &'a str,
            label: L,
        }
        impl<'a, N, L: Fn(NodeId, &N) -> String> dot::Labeller<'a, NodeId, Edge> for View<'a, N, L> {
            fn graph_id(&'a self) -> dot::Id<'a> {
                dot::Id::new(self.name.to_string())
                    .unwrap_or_else(|_| dot::Id::new("G").expect("valid identifier"))
            }
            fn node_id(&'a self, n: &NodeId) -> dot::Id<'a> {
                dot::Id::new(format!("n{}", n.0)).expect("valid identifier")
            }
            fn node_label<'b>(&'b self, n: &NodeId) -> dot::LabelText<'b> {
                dot::LabelText::escaped(
                    (self.label)(*n, self.g.node(*n)).replace('\n', "\\l") + "\\l",
                )
            }
            fn node_shape(&'a self, _n: &NodeId) -> Option<dot::LabelText<'a>> {
                Some(dot::LabelText::label("box"))
            }
        }
        impl<'a, N, L> dot::GraphWalk<'a, NodeId, Edge> for View<'a, N, L> {
            fn nodes(&self) -> dot::Nodes<'a, NodeId> {
                self.g.ids().collect::<Vec<_>>().into()
            }
            fn edges(&'a self) -> dot::Edges<'a, Edge> {
                self.g
                    .ids()
                    .flat_map(|n| self.g.successors(n).iter().map(move |&s| (n, s)))
                    .collect::<Vec<_>>()
                    .into()
            }
            fn source(&self, e: &Edge) -> NodeId {
                e.0
            }
            fn target(&self, e: &Edge) -> NodeId {
                e.1
            }
        }

        dot::render(
            &View {
                g: self,
                name,
                label,
            },
            w,
        )
    }

    /// Generate a `.dot` rendering of the graph
    pub fn generate_dot(&self, name: &str, label: impl Fn(NodeId, &N) -> String) -> String {
        let mut s: Vec<u8> = vec![];
        self.write_dot(&mut s, name, label)
            .expect("writing to a Vec cannot fail");
        String::from_utf8_lossy(&s).into_owned()
    }
}

/// Dominance information for the nodes of a [`Graph`] reachable from a chosen entry.
///
/// All vectors are indexed by [`NodeId`]; unreachable nodes have no postorder index, no immediate
/// dominator and an empty frontier.
#[derive(Clone)]
pub struct Dominance {
    entry: NodeId,
    postorder_index: Vec<Option<usize>>,
    postorder: Vec<NodeId>,
    idom: Vec<Option<NodeId>>,
    frontier: Vec<UnorderedSet<NodeId>>,
    tree: Graph<NodeId>,
}

impl Dominance {
    /// Compute postorder numbering, immediate dominators, dominance frontiers and the dominator
    /// tree of `graph` rooted at `entry`.
    pub fn compute<N>(graph: &Graph<N>, entry: NodeId) -> Result<Self> {
        graph.check(entry)?;
        let postorder = graph.postorder(entry);
        let mut postorder_index = vec![None; graph.len()];
        for (i, n) in postorder.iter().enumerate() {
            postorder_index[n.0] = Some(i);
        }
        let mut idom = vec![None; graph.len()];
        idom[entry.0] = Some(entry);

        let mut dom = Self {
            entry,
            postorder_index,
            postorder,
            idom,
            frontier: vec![UnorderedSet::new(); graph.len()],
            tree: Graph::new(),
        };

        let mut sweeps = 0;
        while dom.sweep(graph) {
            sweeps += 1;
        }
        trace!("Dominators converged"; "sweeps" => sweeps, "reachable" => dom.postorder.len());

        for n in dom.postorder.iter().copied() {
            if dom.idom[n.0].is_none() {
                return Err(structure_error!(
                    "{:?} is reachable from {:?} but has no immediate dominator",
                    n,
                    entry
                ));
            }
        }

        dom.compute_frontiers(graph);
        dom.build_tree(graph.len())?;
        Ok(dom)
    }

    /// One pass over the reachable nodes in reverse postorder, refining each immediate dominator
    /// from its already-processed predecessors. Returns whether anything changed.
    fn sweep<N>(&mut self, graph: &Graph<N>) -> bool {
        let mut changed = false;
        for i in (0..self.postorder.len()).rev() {
            let n = self.postorder[i];
            if n == self.entry {
                continue;
            }
            let mut new_idom: Option<NodeId> = None;
            for &p in graph.predecessors(n) {
                if self.idom[p.0].is_none() {
                    continue;
                }
                new_idom = Some(match new_idom {
                    None => p,
                    Some(x) => self.shared_idom(p, x),
                });
            }
            if new_idom.is_some() && self.idom[n.0] != new_idom {
                self.idom[n.0] = new_idom;
                changed = true;
            }
        }
        changed
    }

    /// Nearest common ancestor of `a` and `b` in the (partially built) dominator tree
    fn shared_idom(&self, mut a: NodeId, mut b: NodeId) -> NodeId {
        let po = |n: NodeId| self.postorder_index[n.0].unwrap_or(0);
        while a != b {
            while po(a) < po(b) {
                a = self.idom[a.0].unwrap_or(self.entry);
            }
            while po(b) < po(a) {
                b = self.idom[b.0].unwrap_or(self.entry);
            }
        }
        a
    }

    /// The entry is also reached from outside the graph, so a back edge into it makes it a join
    /// whose frontier walk runs up to and including the entry itself.
    fn compute_frontiers<N>(&mut self, graph: &Graph<N>) {
        for n in self.postorder.clone() {
            let preds = graph.predecessors(n);
            if preds.len() + self.incoming_from_outside(n) < 2 {
                continue;
            }
            let stop = if n == self.entry { None } else { self.idom[n.0] };
            for &p in preds {
                if !self.is_reachable(p) {
                    continue;
                }
                let mut runner = p;
                while Some(runner) != stop {
                    self.frontier[runner.0].insert(n);
                    match self.idom[runner.0] {
                        Some(up) if up != runner => runner = up,
                        _ => break,
                    }
                }
            }
        }
    }

    fn build_tree(&mut self, len: usize) -> Result<()> {
        let mut tree = Graph::new();
        for i in 0..len {
            tree.add_node(NodeId(i));
        }
        for n in self.reverse_postorder().collect::<Vec<_>>() {
            if n == self.entry {
                continue;
            }
            if let Some(parent) = self.idom[n.0] {
                tree.add_edge(parent, n)?;
            }
        }
        self.tree = tree;
        Ok(())
    }

    /// Whether another full sweep would leave every immediate dominator unchanged
    pub fn is_converged<N>(&self, graph: &Graph<N>) -> bool {
        !self.clone().sweep(graph)
    }

    pub fn entry(&self) -> NodeId {
        self.entry
    }

    /// Number of edges into `n` from outside the graph: one for the entry, none otherwise
    pub fn incoming_from_outside(&self, n: NodeId) -> usize {
        usize::from(n == self.entry)
    }

    pub fn is_reachable(&self, n: NodeId) -> bool {
        self.postorder_index
            .get(n.0)
            .map_or(false, |i| i.is_some())
    }

    pub fn postorder_index(&self, n: NodeId) -> Option<usize> {
        self.postorder_index.get(n.0).copied().flatten()
    }

    /// Reachable nodes in postorder (entry last)
    pub fn postorder(&self) -> &[NodeId] {
        &self.postorder
    }

    /// Reachable nodes in reverse postorder (entry first)
    pub fn reverse_postorder(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.postorder.iter().rev().copied()
    }

    /// The immediate dominator of `n`. The entry is its own immediate dominator.
    pub fn immediate_dominator(&self, n: NodeId) -> Option<NodeId> {
        self.idom.get(n.0).copied().flatten()
    }

    pub fn dominates(&self, a: NodeId, b: NodeId) -> bool {
        if !self.is_reachable(a) || !self.is_reachable(b) {
            return false;
        }
        let mut runner = b;
        loop {
            if runner == a {
                return true;
            }
            if runner == self.entry {
                return false;
            }
            match self.idom[runner.0] {
                Some(up) => runner = up,
                None => return false,
            }
        }
    }

    pub fn strictly_dominates(&self, a: NodeId, b: NodeId) -> bool {
        a != b && self.dominates(a, b)
    }

    pub fn frontier(&self, n: NodeId) -> &UnorderedSet<NodeId> {
        &self.frontier[n.0]
    }

    /// The dominator tree. Its node `i` stands for node `i` of the analysed graph, and its edges
    /// run from each immediate dominator to the nodes it immediately dominates, children in
    /// reverse postorder.
    pub fn tree(&self) -> &Graph<NodeId> {
        &self.tree
    }

    pub fn children(&self, n: NodeId) -> &[NodeId] {
        self.tree.successors(n)
    }
}

impl std::fmt::Debug for Dominance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dominance")
            .field("entry", &self.entry)
            .field("postorder", &self.postorder)
            .field("idom", &self.idom)
            .field("frontier", &self.frontier)
            .finish()
    }
}
