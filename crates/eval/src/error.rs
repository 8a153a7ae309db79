//! Runtime errors raised while executing a compiled action.
//!
//! Every error maps to an [`ExceptionKind`] so that `TryCatch` clauses can
//! route it; anything without a named kind carries its SQLSTATE as
//! `ExceptionKind::Custom`.

use specql_core::ast::ExceptionKind;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    #[error("query returned no rows ({context})")]
    NoDataFound { context: String },
    #[error("query returned more than one row ({context})")]
    TooManyRows { context: String },
    #[error("duplicate key value violates unique constraint \"{constraint}\"")]
    UniqueViolation { entity: String, constraint: String },
    #[error("'{entity}.{field}' references a missing '{target}' row")]
    ForeignKeyViolation {
        entity: String,
        field: String,
        target: String,
    },
    #[error("null value in '{entity}.{field}' violates not-null constraint")]
    NotNullViolation { entity: String, field: String },
    #[error("value '{value}' is not allowed in '{entity}.{field}'")]
    CheckViolation {
        entity: String,
        field: String,
        value: String,
    },
    #[error("division by zero")]
    DivisionByZero,
    #[error("numeric value out of range: {message}")]
    OutOfRange { message: String },
    #[error("invalid input for {expected}: '{value}'")]
    InvalidText { expected: String, value: String },
    /// Raised by a host function.
    #[error("{message}")]
    Raised { kind: ExceptionKind, message: String },
    #[error("function '{name}' does not exist")]
    UnknownFunction { name: String },
    #[error("relation '{name}' does not exist")]
    UnknownEntity { name: String },
    #[error("missing input '{name}'")]
    MissingInput { name: String },
    #[error("{construct} exceeded {limit} iterations")]
    IterationLimit { construct: &'static str, limit: usize },
    /// The compiled action does not match what the interpreter can run.
    #[error("cannot execute: {message}")]
    Invalid { message: String },
}

impl RuntimeError {
    pub fn kind(&self) -> ExceptionKind {
        match self {
            RuntimeError::NoDataFound { .. } => ExceptionKind::NoDataFound,
            RuntimeError::TooManyRows { .. } => ExceptionKind::TooManyRows,
            RuntimeError::UniqueViolation { .. } => ExceptionKind::UniqueViolation,
            RuntimeError::ForeignKeyViolation { .. } => ExceptionKind::ForeignKeyViolation,
            RuntimeError::NotNullViolation { .. } => ExceptionKind::NotNullViolation,
            RuntimeError::CheckViolation { .. } => ExceptionKind::CheckViolation,
            RuntimeError::DivisionByZero => ExceptionKind::DivisionByZero,
            RuntimeError::Raised { kind, .. } => kind.clone(),
            RuntimeError::OutOfRange { .. } => ExceptionKind::Custom("22003".into()),
            RuntimeError::InvalidText { .. } => ExceptionKind::Custom("22P02".into()),
            RuntimeError::UnknownFunction { .. } => ExceptionKind::Custom("42883".into()),
            RuntimeError::UnknownEntity { .. } => ExceptionKind::Custom("42P01".into()),
            RuntimeError::MissingInput { .. } => ExceptionKind::Custom("22004".into()),
            RuntimeError::IterationLimit { .. } => ExceptionKind::Custom("54000".into()),
            RuntimeError::Invalid { .. } => ExceptionKind::Custom("XX000".into()),
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        RuntimeError::Invalid {
            message: message.into(),
        }
    }

    /// A host-function failure of the given kind.
    pub fn raise(kind: ExceptionKind, message: impl Into<String>) -> Self {
        RuntimeError::Raised {
            kind,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_route_to_catch_targets() {
        assert_eq!(RuntimeError::DivisionByZero.kind(), ExceptionKind::DivisionByZero);
        assert_eq!(
            RuntimeError::raise(ExceptionKind::ValidationFailed, "nope").kind(),
            ExceptionKind::ValidationFailed
        );
        assert_eq!(
            RuntimeError::UnknownFunction { name: "f".into() }.kind(),
            ExceptionKind::Custom("42883".into())
        );
    }

    #[test]
    fn messages_name_the_constraint() {
        let err = RuntimeError::UniqueViolation {
            entity: "Contact".into(),
            constraint: "idx_tb_contact_email".into(),
        };
        assert_eq!(
            err.to_string(),
            "duplicate key value violates unique constraint \"idx_tb_contact_email\""
        );
    }
}
