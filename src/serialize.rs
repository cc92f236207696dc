//! Serialize the decompiled function to a machine-readable form.
//!
//! Two views are offered: [`CfgListing`], the micro-op level control-flow graph before any
//! reconstruction, and [`AstListing`], the structured statements. Both refer to blocks by their
//! start address and are plain `serde` structures; the caller picks the wire format.

use serde::Serialize;

use crate::ast::{Stmt, StmtBlockList};
use crate::cfg::Cfg;
use crate::pcode::PcodeOp;

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct CfgBlockListing {
    pub start: String,
    pub end: String,
    /// One line per micro-op
    pub pcode: Vec<String>,
    pub successors: Vec<String>,
    pub predecessors: Vec<String>,
}

/// The blocks of a control-flow graph, sorted by start address
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct CfgListing {
    pub entry: String,
    pub blocks: Vec<CfgBlockListing>,
}

impl CfgListing {
    pub fn new(cfg: &Cfg<PcodeOp>) -> Self {
        let addr = |id: &crate::graph::NodeId| cfg.graph.node(*id).start.to_string();
        let mut blocks: Vec<_> = cfg.graph.iter().collect();
        blocks.sort_by_key(|(_, b)| b.start);
        Self {
            entry: cfg.graph.node(cfg.entry).start.to_string(),
            blocks: blocks
                .into_iter()
                .map(|(id, b)| CfgBlockListing {
                    start: b.start.to_string(),
                    end: b.end.to_string(),
                    pcode: b.elems.iter().map(|op| format!("{:?}", op)).collect(),
                    successors: cfg.graph.successors(id).iter().map(addr).collect(),
                    predecessors: cfg.graph.predecessors(id).iter().map(addr).collect(),
                })
                .collect(),
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct AstBlockListing {
    pub start: String,
    /// Rendered statements; nested bodies are indented below their `if`
    pub statements: Vec<String>,
    pub successors: Vec<String>,
    pub predecessors: Vec<String>,
}

/// The top-level statement blocks of a function, in emission order
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct AstListing {
    pub blocks: Vec<AstBlockListing>,
    /// The whole function as pseudo-C
    pub text: String,
}

impl AstListing {
    pub fn new(list: &StmtBlockList) -> Self {
        Self {
            blocks: list
                .blocks
                .iter()
                .map(|b| AstBlockListing {
                    start: b.start.to_string(),
                    statements: b.stmts.iter().map(render).collect(),
                    successors: b.successors.iter().map(|a| a.to_string()).collect(),
                    predecessors: b.predecessors.iter().map(|a| a.to_string()).collect(),
                })
                .collect(),
            text: list.to_string(),
        }
    }
}

fn render(s: &Stmt) -> String {
    s.render(0).trim_end().to_owned()
}
