//! The target emitter interface.
//!
//! An emitter turns one compiled action into source text for one target
//! family. What a concrete target can express natively comes from the
//! [`TargetProfile`]; constructs it lacks are lowered first (see
//! [`crate::fallback`]) or rejected with `TargetCapabilityMissing`.

use crate::error::EmissionError;
use crate::plpgsql::PlPgSqlEmitter;
use crate::profile::{Dialect, TargetProfile};
use crate::typescript::TypeScriptEmitter;
use serde::Serialize;
use specql_core::ast::EntitySpec;
use specql_core::catalog::Index;
use specql_core::compiled::{CompiledAction, CompiledQuery, CompiledStep};

/// One generated file, relative to the output directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeneratedArtifact {
    pub path: String,
    pub content: String,
}

impl GeneratedArtifact {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        GeneratedArtifact {
            path: path.into(),
            content: content.into(),
        }
    }
}

/// Emitters hold no state between calls and may be shared across workers.
pub trait TargetEmitter: Sync {
    fn dialect(&self) -> Dialect;

    /// Emit one action. Deterministic: identical input and profile give
    /// byte-identical output.
    fn emit(
        &self,
        compiled: &CompiledAction,
        profile: &TargetProfile,
    ) -> Result<GeneratedArtifact, EmissionError>;

    /// Support files every generated action relies on.
    fn emit_prelude(&self, _profile: &TargetProfile) -> Vec<GeneratedArtifact> {
        Vec::new()
    }

    /// Entity-level artifacts (tables, record types).
    fn emit_entity(
        &self,
        _entity: &EntitySpec,
        _entities: &Index<'_>,
        _profile: &TargetProfile,
    ) -> Result<Vec<GeneratedArtifact>, EmissionError> {
        Ok(Vec::new())
    }
}

static PLPGSQL: PlPgSqlEmitter = PlPgSqlEmitter;
static TYPESCRIPT: TypeScriptEmitter = TypeScriptEmitter;

pub fn emitter_for(dialect: Dialect) -> &'static dyn TargetEmitter {
    match dialect {
        Dialect::Postgres => &PLPGSQL,
        Dialect::TypeScript => &TYPESCRIPT,
    }
}

/// Checks shared by every emitter before any text is produced.
pub(crate) fn preflight(
    compiled: &CompiledAction,
    profile: &TargetProfile,
) -> Result<(), EmissionError> {
    if let Some(error) = compiled.diagnostics.errors().next() {
        return Err(EmissionError::InvalidCompiledAction {
            entity: compiled.entity.name.clone(),
            action: compiled.action.clone(),
            reason: format!("carries error diagnostic: {}", error),
        });
    }
    let missing = |construct: &'static str| EmissionError::TargetCapabilityMissing {
        profile: profile.name.clone(),
        construct,
        entity: compiled.entity.name.clone(),
        action: compiled.action.clone(),
    };
    let caps = &profile.capabilities;
    if !caps.native_recursive_cte && any_step(&compiled.body, &|s| step_has_recursive_cte(s)) {
        return Err(missing("recursive CTE"));
    }
    if !caps.native_try_catch
        && any_step(&compiled.body, &|s| matches!(s, CompiledStep::TryCatch { .. }))
    {
        return Err(missing("try/catch"));
    }
    Ok(())
}

fn any_step(steps: &[CompiledStep], pred: &dyn Fn(&CompiledStep) -> bool) -> bool {
    steps
        .iter()
        .any(|s| pred(s) || s.blocks().iter().any(|b| any_step(b, pred)))
}

fn step_has_recursive_cte(step: &CompiledStep) -> bool {
    let query: Option<&CompiledQuery> = match step {
        CompiledStep::Query { query, .. }
        | CompiledStep::ForQuery { query, .. }
        | CompiledStep::Aggregate { query, .. }
        | CompiledStep::Transform { query, .. }
        | CompiledStep::Cursor { query, .. } => Some(query),
        _ => None,
    };
    query.is_some_and(CompiledQuery::has_recursive_cte)
}
