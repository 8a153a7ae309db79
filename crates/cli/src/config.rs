//! Project configuration for `specql`.
//!
//! Read from `specql.toml` in the working directory, or from the file given
//! with `--config`. Every section is optional.
//!
//! # Example
//!
//! ```toml
//! [compiler]
//! strict = false
//! warnings_as_errors = false
//!
//! [target]
//! profile = "postgres-legacy"
//! native_try_catch = true
//!
//! [target.types]
//! decimal = "NUMERIC(18,4)"
//!
//! [output]
//! dir = "generated"
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use specql_codegen::{ProfileOverrides, TargetProfile, BUILTIN_PROFILES};
use specql_core::CompileOptions;

/// Looked up in the working directory when `--config` is not given.
pub(crate) const DEFAULT_CONFIG_FILE: &str = "specql.toml";

#[derive(Debug, thiserror::Error)]
pub(crate) enum ConfigError {
    #[error("could not read '{path}': {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not parse '{path}': {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("unknown target profile '{name}' (builtin: {})", BUILTIN_PROFILES.join(", "))]
    UnknownProfile { name: String },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct Config {
    pub compiler: CompileOptions,
    pub target: TargetConfig,
    pub output: OutputConfig,
}

/// `[target]`: a builtin profile plus capability and type-map overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub(crate) struct TargetConfig {
    pub profile: String,
    #[serde(flatten)]
    pub overrides: ProfileOverrides,
}

impl Default for TargetConfig {
    fn default() -> Self {
        TargetConfig {
            profile: "postgres".to_owned(),
            overrides: ProfileOverrides::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub(crate) struct OutputConfig {
    pub dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            dir: PathBuf::from("generated"),
        }
    }
}

impl Config {
    /// An explicit path must exist; the default file is optional.
    pub(crate) fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG_FILE);
                if !default.exists() {
                    tracing::debug!("no {} found, using defaults", DEFAULT_CONFIG_FILE);
                    return Ok(Config::default());
                }
                default
            }
        };
        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let config = Config::parse(&content).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        tracing::debug!(path = %path.display(), profile = %config.target.profile, "config loaded");
        Ok(config)
    }

    pub(crate) fn parse(content: &str) -> Result<Config, toml::de::Error> {
        toml::from_str(content)
    }

    /// The configured builtin profile with overrides applied; `name`
    /// replaces the configured profile name.
    pub(crate) fn profile(&self, name: Option<&str>) -> Result<TargetProfile, ConfigError> {
        let name = name.unwrap_or(&self.target.profile);
        TargetProfile::builtin(name)
            .map(|p| p.with_overrides(&self.target.overrides))
            .ok_or_else(|| ConfigError::UnknownProfile {
                name: name.to_owned(),
            })
    }
}
