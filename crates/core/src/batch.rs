//! Batch compilation over every action of a set of entities.
//!
//! Actions share nothing but the read-only catalog, so a failing action never
//! affects its siblings. With the `parallel` feature actions are compiled on
//! the rayon pool; the output order is always declaration order.

use crate::ast::EntitySpec;
use crate::catalog::{build_index, Catalog, FunctionCatalog};
use crate::compiled::CompiledAction;
use crate::compiler::{compile, CompileOptions};
use crate::diagnostic::Diagnostics;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Result of compiling one action.
#[derive(Debug, Clone)]
pub struct ActionOutput {
    pub entity: String,
    pub action: String,
    pub result: Result<CompiledAction, Diagnostics>,
}

impl ActionOutput {
    /// Errors on failure, warnings on success.
    pub fn diagnostics(&self) -> &Diagnostics {
        match &self.result {
            Ok(compiled) => &compiled.diagnostics,
            Err(diagnostics) => diagnostics,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BatchOutput {
    /// Diagnostics not tied to one action (duplicate entities).
    pub diagnostics: Diagnostics,
    pub actions: Vec<ActionOutput>,
    /// Compilation stopped before every action was compiled.
    pub cancelled: bool,
}

impl BatchOutput {
    pub fn has_errors(&self) -> bool {
        self.diagnostics.has_errors() || self.actions.iter().any(|a| a.result.is_err())
    }

    pub fn compiled(&self) -> impl Iterator<Item = &CompiledAction> {
        self.actions.iter().filter_map(|a| a.result.as_ref().ok())
    }

    /// Every diagnostic of the batch, in declaration order.
    pub fn all_diagnostics(&self) -> Diagnostics {
        let mut all = self.diagnostics.clone();
        for action in &self.actions {
            all.extend(action.diagnostics().clone());
        }
        all
    }
}

pub fn compile_batch(
    entities: &[EntitySpec],
    functions: &dyn FunctionCatalog,
    options: &CompileOptions,
) -> BatchOutput {
    compile_batch_cancellable(entities, functions, options, &AtomicBool::new(false))
}

/// Like [`compile_batch`], checking `cancel` between actions. Actions not
/// yet started when the flag is raised are left out of the output.
pub fn compile_batch_cancellable(
    entities: &[EntitySpec],
    functions: &dyn FunctionCatalog,
    options: &CompileOptions,
    cancel: &AtomicBool,
) -> BatchOutput {
    let (index, duplicates) = build_index(entities);
    let catalog = Catalog::new(&index, functions);

    // Actions of a duplicated entity name are compiled only for the first
    // declaration, the one the index kept.
    let jobs: Vec<(&EntitySpec, usize)> = entities
        .iter()
        .filter(|e| index.get(&e.name).is_some_and(|kept| std::ptr::eq(kept, *e)))
        .flat_map(|e| (0..e.actions.len()).map(move |i| (e, i)))
        .collect();
    debug!(
        entities = entities.len(),
        actions = jobs.len(),
        "compiling batch"
    );

    let run = |&(entity, i): &(&EntitySpec, usize)| -> Option<ActionOutput> {
        if cancel.load(Ordering::Relaxed) {
            return None;
        }
        let action = &entity.actions[i];
        Some(ActionOutput {
            entity: entity.name.clone(),
            action: action.name.clone(),
            result: compile(action, entity, &catalog, options),
        })
    };

    #[cfg(feature = "parallel")]
    let results: Vec<Option<ActionOutput>> = jobs.par_iter().map(run).collect();
    #[cfg(not(feature = "parallel"))]
    let results: Vec<Option<ActionOutput>> = jobs.iter().map(run).collect();

    let cancelled = results.iter().any(Option::is_none);
    BatchOutput {
        diagnostics: duplicates.into_iter().collect(),
        actions: results.into_iter().flatten().collect(),
        cancelled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StaticCatalog;
    use crate::diagnostic::DiagnosticCode;
    use serde_json::json;

    fn entities() -> Vec<EntitySpec> {
        serde_json::from_value(json!([
            {"name": "Contact", "fields": [{"name": "score", "type": {"base": "integer"}}],
             "actions": [
                {"name": "broken", "steps": [{"kind": "assign", "target": "nope",
                  "value": {"expr": "literal", "value": {"type": "integer", "value": 1}}}]},
                {"name": "fine", "steps": [{"kind": "return", "payload": {}}]}
             ]},
            {"name": "Company", "fields": [],
             "actions": [{"name": "noop", "steps": []}]}
        ]))
        .unwrap()
    }

    #[test]
    fn failures_are_isolated_and_ordered() {
        let out = compile_batch(&entities(), &StaticCatalog::new(), &CompileOptions::default());
        let names: Vec<(&str, &str)> = out
            .actions
            .iter()
            .map(|a| (a.entity.as_str(), a.action.as_str()))
            .collect();
        assert_eq!(
            names,
            vec![("Contact", "broken"), ("Contact", "fine"), ("Company", "noop")]
        );
        assert!(out.actions[0].result.is_err());
        assert!(out.actions[1].result.is_ok());
        assert!(out.actions[2].result.is_ok());
        assert!(out.has_errors());
        assert!(out
            .all_diagnostics()
            .contains_code(DiagnosticCode::UnknownVariable));
    }

    #[test]
    fn cancelled_batch_compiles_nothing() {
        let cancel = AtomicBool::new(true);
        let out = compile_batch_cancellable(
            &entities(),
            &StaticCatalog::new(),
            &CompileOptions::default(),
            &cancel,
        );
        assert!(out.cancelled);
        assert!(out.actions.is_empty());
    }

    #[test]
    fn duplicate_entities_compile_first_declaration_only() {
        let mut list = entities();
        let mut dup = list[1].clone();
        dup.actions[0].name = "shadowed".into();
        list.push(dup);
        let out = compile_batch(&list, &StaticCatalog::new(), &CompileOptions::default());
        assert!(out
            .diagnostics
            .contains_code(DiagnosticCode::DuplicateDeclaration));
        assert!(out.actions.iter().all(|a| a.action != "shadowed"));
    }
}
