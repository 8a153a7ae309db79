//! Read-only lookups consulted during compilation: the entity index and the
//! external function catalog.

use crate::ast::{EntitySpec, SemanticType};
use crate::diagnostic::{Diagnostic, DiagnosticCode, Location};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ──────────────────────────────────────────────
// Function catalog
// ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionParam {
    pub name: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub ty: Option<SemanticType>,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSignature {
    /// Qualified name, e.g. `crm.score_lead`.
    pub name: String,
    #[serde(default)]
    pub params: Vec<FunctionParam>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub returns: Option<SemanticType>,
}

impl FunctionSignature {
    pub fn param(&self, name: &str) -> Option<&FunctionParam> {
        self.params.iter().find(|p| p.name == name)
    }
}

/// Registry of externally or previously defined callable functions.
///
/// Shared read-only across compilation workers.
pub trait FunctionCatalog: Sync {
    fn lookup(&self, qualified_name: &str) -> Option<&FunctionSignature>;

    /// An empty catalog cannot vouch for anything; unknown calls are then
    /// always reported as warnings.
    fn is_empty(&self) -> bool;
}

#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    functions: BTreeMap<String, FunctionSignature>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, signature: FunctionSignature) {
        self.functions.insert(signature.name.clone(), signature);
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }
}

impl FromIterator<FunctionSignature> for StaticCatalog {
    fn from_iter<I: IntoIterator<Item = FunctionSignature>>(iter: I) -> Self {
        let mut catalog = StaticCatalog::new();
        for sig in iter {
            catalog.insert(sig);
        }
        catalog
    }
}

impl FunctionCatalog for StaticCatalog {
    fn lookup(&self, qualified_name: &str) -> Option<&FunctionSignature> {
        self.functions.get(qualified_name)
    }

    fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

// ──────────────────────────────────────────────
// Entity index
// ──────────────────────────────────────────────

/// Lookup index over the entities of one compilation run.
///
/// References between entities are resolved lazily through this index, so
/// cyclic `reference` fields never recurse.
#[derive(Debug, Clone, Default)]
pub struct Index<'a> {
    entities: BTreeMap<&'a str, &'a EntitySpec>,
}

impl<'a> Index<'a> {
    pub fn get(&self, name: &str) -> Option<&'a EntitySpec> {
        self.entities.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entities.contains_key(name)
    }

    pub fn entities(&self) -> impl Iterator<Item = &'a EntitySpec> + '_ {
        self.entities.values().copied()
    }
}

/// Build the entity index, reporting duplicate entity names. The first
/// declaration wins.
pub fn build_index(entities: &[EntitySpec]) -> (Index<'_>, Vec<Diagnostic>) {
    let mut index = Index::default();
    let mut diagnostics = Vec::new();
    for entity in entities {
        if index.entities.contains_key(entity.name.as_str()) {
            diagnostics.push(Diagnostic::new(
                DiagnosticCode::DuplicateDeclaration,
                Location {
                    entity: entity.name.clone(),
                    action: None,
                    step: Default::default(),
                },
                format!("duplicate entity '{}'", entity.name),
            ));
            continue;
        }
        index.entities.insert(entity.name.as_str(), entity);
    }
    (index, diagnostics)
}

/// Everything the step compiler may consult besides the action itself.
#[derive(Clone, Copy)]
pub struct Catalog<'a> {
    pub entities: &'a Index<'a>,
    pub functions: &'a dyn FunctionCatalog,
}

impl<'a> Catalog<'a> {
    pub fn new(entities: &'a Index<'a>, functions: &'a dyn FunctionCatalog) -> Self {
        Catalog {
            entities,
            functions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn static_catalog_lookup() {
        let catalog: StaticCatalog = vec![FunctionSignature {
            name: "crm.score_lead".into(),
            params: vec![FunctionParam {
                name: "contact_id".into(),
                ty: Some(SemanticType::Uuid),
                required: true,
            }],
            returns: Some(SemanticType::Integer),
        }]
        .into_iter()
        .collect();
        assert!(!FunctionCatalog::is_empty(&catalog));
        let sig = catalog.lookup("crm.score_lead").unwrap();
        assert_eq!(sig.returns, Some(SemanticType::Integer));
        assert!(catalog.lookup("crm.other").is_none());
    }

    #[test]
    fn duplicate_entities_are_reported() {
        let entities: Vec<EntitySpec> = serde_json::from_value(json!([
            {"name": "Contact", "fields": []},
            {"name": "Contact", "fields": []},
            {"name": "Company", "fields": []}
        ]))
        .unwrap();
        let (index, diags) = build_index(&entities);
        assert!(index.contains("Contact"));
        assert!(index.contains("Company"));
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].code, DiagnosticCode::DuplicateDeclaration);
    }
}
