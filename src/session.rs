//! A decompilation session: one function taken from its micro-op listing to structured
//! statements.
//!
//! All state that lives for the duration of one function (the live-version stacks used while
//! renaming, the expression cache, the calling convention) is owned here and handed to each stage
//! explicitly. Sessions share nothing, so independent functions may be decompiled side by side.

use crate::abi::Abi;
use crate::ast::{ExprCache, StmtBlockList};
use crate::cfg::Cfg;
use crate::config::DecompilerConfig;
use crate::error::Result;
use crate::insn::Instruction;
use crate::lifter;
use crate::location::Location;
use crate::log::*;
use crate::pcode::PcodeOp;
use crate::serialize::{AstListing, CfgListing};
use crate::simplify;
use crate::ssa::{SsaFunction, VersionStacks};

pub struct Decompilation {
    pub abi: Abi,
    pub insns: Vec<Instruction>,
    /// The micro-op level CFG as decomposed, before phis are inserted
    pub cfg: Cfg<PcodeOp>,
    pub ssa: SsaFunction,
    pub ast: StmtBlockList,
    stacks: VersionStacks,
    cache: ExprCache,
}

impl Decompilation {
    /// Decompile a function given as a JSON listing.
    pub fn from_json(json: &str, abi: Abi, config: &DecompilerConfig) -> Result<Self> {
        Self::run(lifter::lift_from_json(json)?, abi, config)
    }

    /// Decompile a function given as instructions sorted by address, entry first.
    pub fn run(insns: Vec<Instruction>, abi: Abi, config: &DecompilerConfig) -> Result<Self> {
        let mut stacks = VersionStacks::new();
        let mut cache = ExprCache::new();

        let cfg = Cfg::from_instructions(&insns)?.lower()?;

        let mut ssa = SsaFunction::convert(cfg.clone(), &abi, &mut stacks)?;
        if config.debug_trace_ssa_after_each_stage {
            trace!("SSA after conversion");
            ssa.dump_to_trace();
        }

        simplify::simplify(&mut ssa, config)?;
        if config.debug_trace_ssa_after_each_stage {
            trace!("SSA after simplification");
            ssa.dump_to_trace();
        }

        let ast = StmtBlockList::from_ssa(&ssa, &abi, &mut cache, config);
        info!("Decompiled function";
              "entry" => %cfg.graph.node(cfg.entry).start,
              "blocks" => ssa.cfg.graph.len(),
              "statement_blocks" => ast.len());

        Ok(Self {
            abi,
            insns,
            cfg,
            ssa,
            ast,
            stacks,
            cache,
        })
    }

    /// Argument locations of the calling convention that the function reads before writing
    pub fn parameters(&self) -> Vec<Location> {
        self.abi
            .input_locations
            .iter()
            .copied()
            .filter(|loc| {
                self.ssa
                    .arena
                    .values()
                    .any(|(_, v)| v.is_function_input() && v.loc == *loc && !v.uses.is_empty())
            })
            .collect()
    }

    pub fn cfg_listing(&self) -> CfgListing {
        CfgListing::new(&self.cfg)
    }

    pub fn ast_listing(&self) -> AstListing {
        AstListing::new(&self.ast)
    }

    /// The name the reconstructed code uses for the value `v`, if it was named
    pub fn value_name(&self, v: crate::ssa::ValueId) -> Option<&str> {
        self.cache.name(v)
    }

    /// Every renaming push was matched by a pop
    pub fn versions_unwound(&self) -> bool {
        self.stacks.is_unwound()
    }

    /// The simplified control-flow graph in GraphViz format, one node per block
    pub fn generate_dot(&self) -> String {
        let ssa = &self.ssa;
        ssa.cfg.graph.generate_dot("decompiled", |id, b| {
            let mut label = format!("{}", b.start);
            for &op in ssa.ops_of(id) {
                label += "\n";
                label += &ssa.display_op(op);
            }
            label
        })
    }
}
