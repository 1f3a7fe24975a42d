use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;

use cyberbasic::compiler;
use cyberbasic::config::{DivisionPolicy, ForeignPolicy, RuntimeConfig};

// Wrapper types for clap ValueEnum support
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum DivisionArg {
    Fatal,
    Ieee,
}

impl From<DivisionArg> for DivisionPolicy {
    fn from(arg: DivisionArg) -> Self {
        match arg {
            DivisionArg::Fatal => DivisionPolicy::Fatal,
            DivisionArg::Ieee => DivisionPolicy::Ieee,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ForeignArg {
    Fatal,
    Nil,
}

impl From<ForeignArg> for ForeignPolicy {
    fn from(arg: ForeignArg) -> Self {
        match arg {
            ForeignArg::Fatal => ForeignPolicy::Fatal,
            ForeignArg::Nil => ForeignPolicy::Nil,
        }
    }
}

#[derive(Parser)]
#[command(name = "cyberbasic")]
#[command(about = "A BASIC dialect for small games", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a program (.bas source, .json AST or .cbc bytecode)
    Run {
        file: PathBuf,

        /// Read runtime settings from the [runtime] table of a TOML file
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Trace coroutine scheduling
        #[arg(long)]
        trace_sched: bool,

        /// Trace event registration and dispatch
        #[arg(long)]
        trace_events: bool,

        /// Trace user and foreign calls
        #[arg(long)]
        trace_calls: bool,

        /// Division by zero policy (fatal, ieee)
        #[arg(long, value_enum)]
        division: Option<DivisionArg>,

        /// Policy for calls to unregistered foreign functions (fatal, nil)
        #[arg(long, value_enum)]
        unknown_foreign: Option<ForeignArg>,

        /// Stop after this many scheduling passes
        #[arg(long)]
        max_passes: Option<u64>,

        /// Dump AST to stderr, or to a file with --dump-ast=path
        #[arg(long, value_name = "FILE", num_args = 0..=1)]
        dump_ast: Option<Option<PathBuf>>,

        /// Dump bytecode to stderr, or to a file with --dump-bytecode=path
        #[arg(long, value_name = "FILE", num_args = 0..=1)]
        dump_bytecode: Option<Option<PathBuf>>,
    },
    /// Compile a program without running it
    Check { file: PathBuf },
    /// Compile a program to a bytecode file
    Build {
        file: PathBuf,

        /// Output path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Print the disassembled bytecode of a program
    Disasm { file: PathBuf },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            config,
            trace_sched,
            trace_events,
            trace_calls,
            division,
            unknown_foreign,
            max_passes,
            dump_ast,
            dump_bytecode,
        } => {
            let mut runtime = match config {
                Some(path) => match RuntimeConfig::load(&path) {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        eprintln!("error: {}", e);
                        return ExitCode::FAILURE;
                    }
                },
                None => RuntimeConfig::default(),
            };

            // Flags override the config file
            runtime.trace_scheduler |= trace_sched;
            runtime.trace_events |= trace_events;
            runtime.trace_calls |= trace_calls;
            if let Some(division) = division {
                runtime.division = division.into();
            }
            if let Some(policy) = unknown_foreign {
                runtime.unknown_foreign = policy.into();
            }
            if max_passes.is_some() {
                runtime.max_passes = max_passes;
            }

            let dump_opts = compiler::DumpOptions {
                dump_ast,
                dump_bytecode,
            };

            if let Err(e) = compiler::run_file_with_config(&file, &runtime, &dump_opts) {
                eprintln!("{}", e);
                return ExitCode::FAILURE;
            }
        }
        Commands::Check { file } => {
            if let Err(e) = compiler::check_file(&file) {
                eprintln!("{}", e);
                return ExitCode::FAILURE;
            }
            println!("Compile check passed.");
        }
        Commands::Build { file, output } => {
            if let Err(e) = compiler::build_file(&file, &output) {
                eprintln!("{}", e);
                return ExitCode::FAILURE;
            }
        }
        Commands::Disasm { file } => match compiler::disasm_file(&file) {
            Ok(text) => print!("{}", text),
            Err(e) => {
                eprintln!("{}", e);
                return ExitCode::FAILURE;
            }
        },
    }

    ExitCode::SUCCESS
}
