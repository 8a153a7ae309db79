use serde_json::json;

use super::{compile_bundle, print_diagnostics, print_json};
use crate::config::Config;
use crate::error::CliError;
use crate::{CompileArgs, OutputFormat};

/// Returns whether the bundle compiled without errors.
pub(crate) fn cmd_check(args: &CompileArgs, config: &Config, output: OutputFormat, quiet: bool) -> Result<bool, CliError> {
    let (_, batch) = compile_bundle(args, config)?;
    let diagnostics = batch.all_diagnostics();
    let ok = !batch.has_errors();
    let failed = batch.actions.iter().filter(|a| a.result.is_err()).count();

    match output {
        OutputFormat::Json => print_json(&json!({
            "ok": ok,
            "actions": batch.actions.len(),
            "failed": failed,
            "errors": diagnostics.errors().count(),
            "warnings": diagnostics.warnings().count(),
            "diagnostics": diagnostics,
        })),
        OutputFormat::Text => {
            print_diagnostics(&diagnostics, output, quiet);
            if !quiet {
                println!(
                    "checked {} actions: {} failed, {} errors, {} warnings",
                    batch.actions.len(),
                    failed,
                    diagnostics.errors().count(),
                    diagnostics.warnings().count()
                );
            }
        }
    }
    Ok(ok)
}
