pub(crate) mod check;
pub(crate) mod compile;

use specql_core::{compile_batch, BatchOutput, Bundle, CompileOptions, Diagnostics};

use crate::config::Config;
use crate::error::CliError;
use crate::{CompileArgs, OutputFormat};

/// Load the bundle named by `args` and compile it with the configured
/// options; command-line flags can only tighten them.
pub(crate) fn compile_bundle(args: &CompileArgs, config: &Config) -> Result<(Bundle, BatchOutput), CliError> {
    let mut bundle = Bundle::load(&args.bundle)?;
    if !args.entities.is_empty() {
        bundle.retain_entities(&args.entities);
    }
    let options = CompileOptions {
        strict: config.compiler.strict || args.strict,
        warnings_as_errors: config.compiler.warnings_as_errors || args.warnings_as_errors,
    };
    let functions = bundle.function_catalog();
    let batch = compile_batch(&bundle.entities, &functions, &options);
    tracing::info!(
        entities = bundle.entities.len(),
        actions = batch.actions.len(),
        failed = batch.actions.iter().filter(|a| a.result.is_err()).count(),
        "bundle compiled"
    );
    Ok((bundle, batch))
}

/// Text mode only; JSON callers embed the list in their own document.
pub(crate) fn print_diagnostics(diagnostics: &Diagnostics, output: OutputFormat, quiet: bool) {
    if output != OutputFormat::Text {
        return;
    }
    for d in diagnostics.iter() {
        if quiet && !d.is_error() {
            continue;
        }
        eprintln!("{}", d);
    }
}

pub(crate) fn print_json(value: &serde_json::Value) {
    let json = serde_json::to_string_pretty(value)
        .unwrap_or_else(|e| format!("{{\"error\": \"serialization: {}\"}}", e));
    println!("{}", json);
}
