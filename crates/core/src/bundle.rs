//! AST bundle: the JSON document a specification loader hands to the
//! compiler.
//!
//! ```json
//! { "entities": [EntitySpec, ...], "functions": [FunctionSignature, ...] }
//! ```

use crate::ast::EntitySpec;
use crate::catalog::{FunctionSignature, StaticCatalog};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    #[error("cannot read bundle '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid bundle JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Bundle {
    #[serde(default)]
    pub entities: Vec<EntitySpec>,
    #[serde(default)]
    pub functions: Vec<FunctionSignature>,
}

impl Bundle {
    pub fn from_json_str(text: &str) -> Result<Self, BundleError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, BundleError> {
        let text = std::fs::read_to_string(path).map_err(|source| BundleError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    /// Keep only `names`, in bundle order.
    pub fn retain_entities(&mut self, names: &[String]) {
        self.entities.retain(|e| names.contains(&e.name));
    }

    pub fn function_catalog(&self) -> StaticCatalog {
        self.functions.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::FunctionCatalog;

    #[test]
    fn parses_entities_and_functions() {
        let bundle = Bundle::from_json_str(
            r#"{
                "entities": [{"name": "Contact", "schema": "crm", "fields": []}],
                "functions": [{"name": "crm.score_lead", "returns": {"base": "integer"}}]
            }"#,
        )
        .unwrap();
        assert_eq!(bundle.entities[0].namespace, "crm");
        assert!(bundle.function_catalog().lookup("crm.score_lead").is_some());
    }

    #[test]
    fn rejects_unknown_step_kinds() {
        let err = Bundle::from_json_str(
            r#"{"entities": [{"name": "X", "actions": [{"name": "a", "steps": [{"kind": "goto"}]}]}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, BundleError::Json(_)));
    }
}
