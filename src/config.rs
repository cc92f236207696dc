//! Process-wide knobs that alter how a function is decompiled.
//!
//! The configuration is fixed once at start-up (from `-Z` command line flags) and only ever read
//! afterwards, so every decompilation session in the process sees the same settings. Anything that
//! is per-function mutable state lives in [`crate::session::Decompilation`] instead.

/// The global configuration store. Its fields are expected to be accessed across the program via
/// the global [`CONFIG`](static@CONFIG).
pub struct DecompilerConfig {
    /// Run the simplifier (algebraic rewrites, copy propagation, dead-code elimination) between
    /// SSA construction and reconstruction.
    pub enable_simplification: bool,
    /// Apply the table of algebraic identities (`a | 0`, `a & 0`, `a ^ a`, ...) to each operation.
    pub enable_algebraic_rewrites: bool,
    /// Propagate `COPY` operations into their uses.
    pub enable_copy_propagation: bool,
    /// Drop blocks that simplification has emptied, splicing their single predecessor to their
    /// single successor.
    pub enable_empty_block_pruning: bool,
    /// Allow single-use `LOAD`s to be inlined into their consumer rather than being named. Off by
    /// default, since an inlined load may move across an intervening store.
    pub inline_single_use_loads: bool,
    /// Dump the SSA listing to the trace log after each stage.
    pub debug_trace_ssa_after_each_stage: bool,
}

impl DecompilerConfig {
    /// Internal method: sets up initialization
    #[allow(static_mut_refs)]
    fn from_initialized() -> Self {
        let init = unsafe {
            INTERNAL_CONFIG_INITIALIZER
                .take()
                .expect("Should be initialized only once")
        };
        init.unwrap_or_default()
    }

    /// Initialize with the given command line configuration. Should only be called once, and should
    /// only be called from `main`.
    #[allow(static_mut_refs)]
    pub fn initialize(command_line_config: Vec<CommandLineDecompilerConfig>) {
        let prev = unsafe { INTERNAL_CONFIG_INITIALIZER.replace(Some(command_line_config.into())) };
        assert!(prev.is_some(), "Performed double initialization");
        lazy_static::initialize(&CONFIG);
    }
}

/// Internal initialization detail.
static mut INTERNAL_CONFIG_INITIALIZER: Option<Option<DecompilerConfig>> = Some(None);

lazy_static::lazy_static! {
    /// The global configuration store
    pub static ref CONFIG: DecompilerConfig = DecompilerConfig::from_initialized();
}

#[derive(clap::ArgEnum, Clone, Debug)]
/// Decompiler configuration parameters
pub enum CommandLineDecompilerConfig {
    DisableSimplification,
    DisableAlgebraicRewrites,
    DisableCopyPropagation,
    DisableEmptyBlockPruning,
    EnableInliningSingleUseLoads,
    EnableTraceSsaAfterEachStage,
}

impl Default for DecompilerConfig {
    fn default() -> Self {
        DecompilerConfig {
            enable_simplification: true,
            enable_algebraic_rewrites: true,
            enable_copy_propagation: true,
            enable_empty_block_pruning: true,
            inline_single_use_loads: false,
            debug_trace_ssa_after_each_stage: false,
        }
    }
}

impl From<Vec<CommandLineDecompilerConfig>> for DecompilerConfig {
    fn from(v: Vec<CommandLineDecompilerConfig>) -> Self {
        use CommandLineDecompilerConfig::*;
        let mut r = DecompilerConfig::default();
        for v in v {
            match v {
                DisableSimplification => {
                    r.enable_simplification = false;
                }
                DisableAlgebraicRewrites => {
                    r.enable_algebraic_rewrites = false;
                }
                DisableCopyPropagation => {
                    r.enable_copy_propagation = false;
                }
                DisableEmptyBlockPruning => {
                    r.enable_empty_block_pruning = false;
                }
                EnableInliningSingleUseLoads => {
                    r.inline_single_use_loads = true;
                }
                EnableTraceSsaAfterEachStage => {
                    r.debug_trace_ssa_after_each_stage = true;
                }
            }
        }
        r
    }
}
