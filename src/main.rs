use deco::*;

use std::path::PathBuf;

use clap::Parser;

/// Decompile a function from its micro-op listing
#[derive(Parser, Debug)]
#[clap(about, version, author)]
enum Args {
    /// Decompile a function exported as a JSON micro-op listing
    FromJson {
        /// Path to the JSON listing of one function, entry instruction first
        listing: PathBuf,
        /// Path to output file for the structured statements (as JSON). Without it, the statements
        /// are printed as pseudo-C to stdout.
        #[clap(long)]
        output_ast: Option<PathBuf>,
        /// Path to output file for the micro-op level control-flow graph (as JSON)
        #[clap(long)]
        output_cfg: Option<PathBuf>,
        /// Path to dump the simplified SSA form to
        #[clap(long)]
        dump_ssa: Option<PathBuf>,
        /// Output the simplified control-flow graph as a GraphViz `.dot` file to the given path
        #[clap(long)]
        debug_output_graphviz: Option<PathBuf>,
        /// Calling convention used for calls and returns
        #[clap(long, arg_enum, default_value = "x86-64")]
        abi: AbiChoice,
        /// Disable terminal logging, even for high severity alerts. Strongly discouraged for normal
        /// use.
        #[clap(long)]
        debug_disable_terminal_logging: bool,
        /// Force blocking for terminal logging. If too many messages are being spewed the logger,
        /// by default, does not block, but instead dumps a dropped-messages alert. This option
        /// forces it to block and dump even if too many are being sent.
        #[clap(long)]
        debug_forced_blocking_terminal_logging: bool,
        /// Path to send log (as JSON) to
        ///
        /// Error or higher severity alerts will still continue being shown at stderr (in addition
        /// to being added to the log)
        #[clap(long = "--log")]
        log_file: Option<PathBuf>,
        /// Debug level (repeat for more: 0-warn, 1-info, 2-debug, 3-trace)
        #[clap(short, long, parse(from_occurrences))]
        debug: usize,
        /// Advanced configuration options to tweak decompilation
        #[clap(short = 'Z', long, arg_enum)]
        advanced_config: Vec<config::CommandLineDecompilerConfig>,
    },
}

#[derive(clap::ArgEnum, Clone, Copy, Debug)]
enum AbiChoice {
    X86_64,
    None,
}

impl AbiChoice {
    fn abi(self) -> abi::Abi {
        match self {
            AbiChoice::X86_64 => abi::Abi::x86_64(),
            AbiChoice::None => abi::Abi::none(),
        }
    }
}

fn write_json(path: PathBuf, value: &impl serde::Serialize) -> error::Result<()> {
    let file = std::fs::File::create(path)?;
    serde_json::to_writer_pretty(std::io::BufWriter::new(file), value)?;
    Ok(())
}

fn from_json(
    listing: PathBuf,
    output_ast: Option<PathBuf>,
    output_cfg: Option<PathBuf>,
    dump_ssa: Option<PathBuf>,
    debug_output_graphviz: Option<PathBuf>,
    abi: AbiChoice,
) -> error::Result<()> {
    let json = std::fs::read_to_string(listing)?;
    let decompiled = session::Decompilation::from_json(&json, abi.abi(), &config::CONFIG)?;

    if let Some(path) = dump_ssa {
        use std::io::Write;
        write!(
            std::fs::File::create(path)?,
            "{:?}",
            decompiled.ssa.debug_listing()
        )?;
    }

    if let Some(path) = debug_output_graphviz {
        use std::io::Write;
        write!(std::fs::File::create(path)?, "{}", decompiled.generate_dot())?;
    }

    if let Some(path) = output_cfg {
        write_json(path, &decompiled.cfg_listing())?;
    }

    if let Some(path) = output_ast {
        write_json(path, &decompiled.ast_listing())?;
    } else {
        print!("{}", decompiled.ast);
    }

    Ok(())
}

fn main() {
    let args = Args::parse();

    match args {
        Args::FromJson {
            listing,
            output_ast,
            output_cfg,
            dump_ssa,
            debug_output_graphviz,
            abi,
            debug_disable_terminal_logging,
            debug_forced_blocking_terminal_logging,
            log_file,
            debug,
            advanced_config,
        } => {
            let logger = match crate::log::FileAndTermDrain::new(
                debug,
                debug_disable_terminal_logging,
                debug_forced_blocking_terminal_logging,
                log_file,
            ) {
                Ok(logger) => logger,
                Err(e) => {
                    eprintln!("Could not set up logging: {}", e);
                    std::process::exit(2);
                }
            };
            let _log_guard = slog_scope::set_global_logger(logger);

            config::DecompilerConfig::initialize(advanced_config);

            if let Err(e) = from_json(
                listing,
                output_ast,
                output_cfg,
                dump_ssa,
                debug_output_graphviz,
                abi,
            ) {
                log::crit!("Decompilation failed"; "error" => %e);
                drop(_log_guard);
                std::process::exit(1);
            }

            log::trace!("Done");
        }
    }
}
