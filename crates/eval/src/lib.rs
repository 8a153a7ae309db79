//! SpecQL reference interpreter -- runs compiled actions against an
//! in-memory relational store.
//!
//! The interpreter consumes the same [`CompiledAction`] IR the emitters
//! lower, and follows the semantics of the generated PL/pgSQL: SQL `NULL`
//! handling, `INTO STRICT` single-row queries, constraint checks on every
//! write, subtransactions around `TryCatch` bodies and a full rollback when
//! an error escapes the action. It is the oracle for behavioral tests of
//! the compiler and its fallback lowerings.

pub mod error;
mod expr;
pub mod functions;
pub mod interp;
pub mod query;
pub mod store;
pub mod value;

pub use error::RuntimeError;
pub use functions::FunctionRegistry;
pub use interp::{evaluate, ActionOutcome, Inputs, Notification, ServiceCall, WHILE_ITERATION_LIMIT};
pub use query::RECURSION_LIMIT;
pub use store::{Database, Table};
pub use value::{Row, Value};

use specql_core::catalog::{build_index, Catalog};
use specql_core::compiler::{compile, CompileOptions};
use specql_core::{Bundle, CompiledAction, Diagnostics};

/// Failure of [`evaluate_action`] before or while the action runs.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("no action '{action}' on entity '{entity}'")]
    UnknownAction { entity: String, action: String },
    #[error("'{entity}.{action}' does not compile ({} errors)", .diagnostics.errors().count())]
    Compile {
        entity: String,
        action: String,
        diagnostics: Diagnostics,
    },
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Compile one action of `bundle` and run it.
///
/// The top-level convenience for tests and tooling: it builds the entity
/// index and function catalog from the bundle, compiles with default
/// options and evaluates against `db`.
pub fn evaluate_action(
    bundle: &Bundle,
    entity: &str,
    action: &str,
    db: &mut Database,
    inputs: &Inputs,
    functions: &FunctionRegistry,
) -> Result<ActionOutcome, ActionError> {
    let compiled = compile_action(bundle, entity, action)?;
    Ok(evaluate(&compiled, db, inputs, functions)?)
}

/// Compile one action of `bundle` with default options.
pub fn compile_action(bundle: &Bundle, entity: &str, action: &str) -> Result<CompiledAction, ActionError> {
    let unknown = || ActionError::UnknownAction {
        entity: entity.to_owned(),
        action: action.to_owned(),
    };
    let spec = bundle.entities.iter().find(|e| e.name == entity).ok_or_else(unknown)?;
    let action_spec = spec.actions.iter().find(|a| a.name == action).ok_or_else(unknown)?;
    let (index, _) = build_index(&bundle.entities);
    let functions = bundle.function_catalog();
    let catalog = Catalog::new(&index, &functions);
    compile(action_spec, spec, &catalog, &CompileOptions::default()).map_err(|diagnostics| {
        ActionError::Compile {
            entity: entity.to_owned(),
            action: action.to_owned(),
            diagnostics,
        }
    })
}
