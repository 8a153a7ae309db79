use std::fs;
use std::path::{Path, PathBuf};

use serde_json::json;
use specql_codegen::{generate, GeneratedArtifact};

use super::{compile_bundle, print_diagnostics, print_json};
use crate::config::Config;
use crate::error::CliError;
use crate::{CompileArgs, OutputFormat};

/// Compile, emit and write every artifact under the output directory.
///
/// Actions that fail to compile or emit are skipped; everything else is
/// still written. Returns whether the run was clean.
pub(crate) fn cmd_compile(
    args: &CompileArgs,
    profile: Option<&str>,
    out: Option<&Path>,
    config: &Config,
    output: OutputFormat,
    quiet: bool,
) -> Result<bool, CliError> {
    let profile = config.profile(profile)?;
    let out_dir = out.map(Path::to_path_buf).unwrap_or_else(|| config.output.dir.clone());

    let (bundle, batch) = compile_bundle(args, config)?;
    let diagnostics = batch.all_diagnostics();
    let generated = generate(&batch, &bundle.entities, &profile);

    let mut written = Vec::with_capacity(generated.artifacts.len());
    for artifact in &generated.artifacts {
        written.push(write_artifact(&out_dir, artifact)?);
    }
    let ok = !batch.has_errors() && generated.is_clean();

    match output {
        OutputFormat::Json => print_json(&json!({
            "ok": ok,
            "profile": profile.name,
            "out_dir": out_dir.display().to_string(),
            "written": generated.artifacts.iter().map(|a| a.path.as_str()).collect::<Vec<_>>(),
            "diagnostics": diagnostics,
            "failures": generated.failures,
        })),
        OutputFormat::Text => {
            print_diagnostics(&diagnostics, output, quiet);
            for failure in &generated.failures {
                match &failure.action {
                    Some(action) => eprintln!("emit error {}.{}: {}", failure.entity, action, failure.error),
                    None => eprintln!("emit error {}: {}", failure.entity, failure.error),
                }
            }
            if !quiet {
                for path in &written {
                    println!("  wrote {}", path.display());
                }
                println!(
                    "{} artifacts for profile '{}' in {}",
                    written.len(),
                    profile.name,
                    out_dir.display()
                );
            }
        }
    }
    Ok(ok)
}

fn write_artifact(out_dir: &Path, artifact: &GeneratedArtifact) -> Result<PathBuf, CliError> {
    let path = out_dir.join(&artifact.path);
    let to_write_error = |source| CliError::Write {
        path: path.clone(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(to_write_error)?;
    }
    fs::write(&path, &artifact.content).map_err(to_write_error)?;
    tracing::debug!(path = %path.display(), bytes = artifact.content.len(), "artifact written");
    Ok(path)
}
