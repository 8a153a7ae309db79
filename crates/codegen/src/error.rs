//! Emission errors.
//!
//! An emission error is fatal for the one action (or entity) being emitted;
//! callers keep emitting the rest of the batch.

use specql_core::ast::SemanticType;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EmissionError {
    /// The action needs a construct the target has no native form or
    /// fallback lowering for.
    #[error("target '{profile}' cannot express {construct} (in {entity}.{action})")]
    TargetCapabilityMissing {
        profile: String,
        construct: &'static str,
        entity: String,
        action: String,
    },
    #[error("target '{profile}' has no type mapping for '{ty}'")]
    UnsupportedType { profile: String, ty: String },
    /// The compiled action is not something the compiler could have
    /// produced (errors present, dangling symbol ids, misplaced columns).
    #[error("invalid compiled action {entity}.{action}: {reason}")]
    InvalidCompiledAction {
        entity: String,
        action: String,
        reason: String,
    },
    #[error("field '{field}' of '{entity}' references unknown entity '{target}'")]
    UnresolvedReference {
        entity: String,
        field: String,
        target: String,
    },
}

impl EmissionError {
    pub(crate) fn unsupported(profile: &str, ty: &SemanticType) -> Self {
        EmissionError::UnsupportedType {
            profile: profile.to_owned(),
            ty: ty.key().to_owned(),
        }
    }
}
