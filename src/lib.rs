//! A decompiler middle-end: from a function's micro-op listing to structured statements.
//!
//! The pipeline, driven by [`session::Decompilation`], runs:
//!
//! 1. [`lifter`]: JSON listing to [`insn::Instruction`]s
//! 2. [`cfg`]: instructions to basic blocks and a control-flow graph with dominance
//! 3. [`ssa`]: phi placement and renaming
//! 4. [`simplify`]: algebraic rewrites, copy propagation, dead-code elimination
//! 5. [`ast`]: expressions and `if`-structured statements

#[macro_use]
pub mod error;

pub mod abi;
pub mod ast;
pub mod cfg;
pub mod config;
pub mod containers;
pub mod graph;
pub mod insn;
pub mod lifter;
pub mod location;
pub mod pcode;
pub mod serialize;
pub mod session;
pub mod simplify;
pub mod ssa;
#[cfg(test)]
mod tests;

pub mod log {
    pub use slog_scope::{crit, debug, error, info, trace, warn};

    pub struct OptionalKV<V: slog::Value>(pub &'static str, pub Option<V>);
    impl<V: slog::Value> slog::KV for OptionalKV<V> {
        fn serialize(
            &self,
            record: &slog::Record,
            serializer: &mut dyn slog::Serializer,
        ) -> slog::Result {
            if let Some(v) = &self.1 {
                v.serialize(record, self.0, serializer)
            } else {
                Ok(())
            }
        }
    }

    pub struct FileAndTermDrain {
        file_drain: Option<slog::Logger>,
        term_drain: slog::Logger,
    }
    impl FileAndTermDrain {
        pub fn new(
            debug_level: usize,
            disable_terminal_logging: bool,
            force_block: bool,
            path: Option<std::path::PathBuf>,
        ) -> Result<slog::Logger, sloggers::Error> {
            use sloggers::Build;

            let debug_level = match debug_level {
                0 => sloggers::types::Severity::Warning,
                1 => sloggers::types::Severity::Info,
                2 => sloggers::types::Severity::Debug,
                3 => sloggers::types::Severity::Trace,
                _ => sloggers::types::Severity::Trace,
            };

            let term_drain = if disable_terminal_logging {
                sloggers::null::NullLoggerBuilder.build()?
            } else {
                sloggers::terminal::TerminalLoggerBuilder::new()
                    .destination(sloggers::terminal::Destination::Stderr)
                    .level(if path.is_none() {
                        debug_level
                    } else {
                        sloggers::types::Severity::Error
                    })
                    .overflow_strategy(if force_block || path.is_none() {
                        sloggers::types::OverflowStrategy::Block
                    } else {
                        sloggers::types::OverflowStrategy::DropAndReport
                    })
                    .format(sloggers::types::Format::Compact)
                    .build()?
            };

            let file_drain = path
                .map(|path| {
                    sloggers::file::FileLoggerBuilder::new(path)
                        .truncate()
                        .level(debug_level)
                        .overflow_strategy(sloggers::types::OverflowStrategy::Block)
                        .format(sloggers::types::Format::Json)
                        .build()
                })
                .transpose()?;

            Ok(slog::Logger::root(
                Self {
                    file_drain,
                    term_drain,
                },
                slog::o!(),
            ))
        }
    }
    impl slog::Drain for FileAndTermDrain {
        type Ok = ();
        type Err = slog::Never;
        fn log(
            &self,
            r: &slog::Record<'_>,
            kv: &slog::OwnedKVList,
        ) -> Result<<Self as slog::Drain>::Ok, <Self as slog::Drain>::Err> {
            if let Some(f) = &self.file_drain {
                <slog::Logger as slog::Drain>::log(f, r, kv)?;
            }
            <slog::Logger as slog::Drain>::log(&self.term_drain, r, kv)?;
            Ok(())
        }
    }
}
