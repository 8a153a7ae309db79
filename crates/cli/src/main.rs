mod commands;
mod config;
mod error;

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use crate::error::CliError;

/// Output format for CLI responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

/// SpecQL action compiler.
#[derive(Parser)]
#[command(name = "specql", version, about = "SpecQL action compiler")]
struct Cli {
    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text", value_enum)]
    output: OutputFormat,

    /// Suppress non-essential output
    #[arg(long, global = true)]
    quiet: bool,

    /// Config file (default: ./specql.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Flags shared by every command that compiles a bundle.
#[derive(clap::Args, Debug, Clone)]
pub(crate) struct CompileArgs {
    /// Path to the JSON AST bundle
    pub bundle: PathBuf,
    /// Only compile these entities (repeatable)
    #[arg(long = "entity")]
    pub entities: Vec<String>,
    /// Unknown functions are fatal
    #[arg(long)]
    pub strict: bool,
    /// Treat every warning as an error
    #[arg(long)]
    pub warnings_as_errors: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a bundle and report diagnostics without emitting code
    Check {
        #[command(flatten)]
        args: CompileArgs,
    },

    /// Compile a bundle and write the generated artifacts
    Compile {
        #[command(flatten)]
        args: CompileArgs,
        /// Target profile (postgres, postgres-legacy, typescript)
        #[arg(long)]
        profile: Option<String>,
        /// Output directory for generated files
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();
    init_logging();

    let result = config::Config::load(cli.config.as_deref())
        .map_err(CliError::from)
        .and_then(|config| match &cli.command {
            Commands::Check { args } => {
                commands::check::cmd_check(args, &config, cli.output, cli.quiet)
            }
            Commands::Compile { args, profile, out } => commands::compile::cmd_compile(
                args,
                profile.as_deref(),
                out.as_deref(),
                &config,
                cli.output,
                cli.quiet,
            ),
        });

    match result {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            report_error(&e.to_string(), cli.output, cli.quiet);
            process::exit(1);
        }
    }
}

/// Library crates only emit events; the filter comes from `SPECQL_LOG`,
/// then `RUST_LOG`, and defaults to `warn`.
fn init_logging() {
    let filter = EnvFilter::try_from_env("SPECQL_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

pub(crate) fn report_error(msg: &str, output: OutputFormat, quiet: bool) {
    match output {
        OutputFormat::Json => {
            let err_json = serde_json::json!({ "error": msg });
            eprintln!(
                "{}",
                serde_json::to_string_pretty(&err_json).unwrap_or_else(|_| msg.to_owned())
            );
        }
        OutputFormat::Text => {
            if !quiet {
                eprintln!("error: {}", msg);
            }
        }
    }
}
