//! Compiler diagnostics: code, severity, message and entity/action/step
//! location. Diagnostics are data; the compiler never aborts on the first one.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Scope,
    Type,
    ControlFlow,
    Catalog,
    Lint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiagnosticCode {
    UnknownVariable,
    DuplicateDeclaration,
    AssignToImmutable,
    TypeMismatch,
    InvalidFieldReference,
    InconsistentReturnShape,
    UnsupportedRecursion,
    DuplicateDefaultCatch,
    UnreachableCode,
    UnknownFunctionWarning,
    UnfilteredMutation,
    UnusedCte,
}

impl DiagnosticCode {
    pub fn category(self) -> Category {
        match self {
            DiagnosticCode::UnknownVariable
            | DiagnosticCode::DuplicateDeclaration
            | DiagnosticCode::AssignToImmutable => Category::Scope,
            DiagnosticCode::TypeMismatch | DiagnosticCode::InvalidFieldReference => Category::Type,
            DiagnosticCode::InconsistentReturnShape
            | DiagnosticCode::UnsupportedRecursion
            | DiagnosticCode::DuplicateDefaultCatch => Category::ControlFlow,
            DiagnosticCode::UnknownFunctionWarning => Category::Catalog,
            DiagnosticCode::UnreachableCode
            | DiagnosticCode::UnfilteredMutation
            | DiagnosticCode::UnusedCte => Category::Lint,
        }
    }

    /// Severity when no option changes it.
    pub fn default_severity(self) -> Severity {
        match self {
            DiagnosticCode::UnreachableCode
            | DiagnosticCode::UnknownFunctionWarning
            | DiagnosticCode::UnfilteredMutation
            | DiagnosticCode::UnusedCte => Severity::Warning,
            _ => Severity::Error,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DiagnosticCode::UnknownVariable => "UnknownVariable",
            DiagnosticCode::DuplicateDeclaration => "DuplicateDeclaration",
            DiagnosticCode::AssignToImmutable => "AssignToImmutable",
            DiagnosticCode::TypeMismatch => "TypeMismatch",
            DiagnosticCode::InvalidFieldReference => "InvalidFieldReference",
            DiagnosticCode::InconsistentReturnShape => "InconsistentReturnShape",
            DiagnosticCode::UnsupportedRecursion => "UnsupportedRecursion",
            DiagnosticCode::DuplicateDefaultCatch => "DuplicateDefaultCatch",
            DiagnosticCode::UnreachableCode => "UnreachableCode",
            DiagnosticCode::UnknownFunctionWarning => "UnknownFunctionWarning",
            DiagnosticCode::UnfilteredMutation => "UnfilteredMutation",
            DiagnosticCode::UnusedCte => "UnusedCte",
        }
    }
}

impl fmt::Display for DiagnosticCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position of a step: the top-level index, then for each nested block the
/// block number inside its step (branch, case, catch clause) and the step
/// index inside that block. Empty for action-level diagnostics (guard,
/// return shape).
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepPath(pub Vec<usize>);

impl StepPath {
    pub fn child(&self, index: usize) -> StepPath {
        let mut path = self.0.clone();
        path.push(index);
        StepPath(path)
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for StepPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|i| i.to_string()).collect();
        f.write_str(&parts.join("."))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub entity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "StepPath::is_root", default)]
    pub step: StepPath,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.entity)?;
        if let Some(action) = &self.action {
            write!(f, ".{}", action)?;
        }
        if !self.step.is_root() {
            write!(f, "#{}", self.step)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub code: DiagnosticCode,
    pub severity: Severity,
    pub message: String,
    pub location: Location,
}

impl Diagnostic {
    pub fn new(code: DiagnosticCode, location: Location, message: impl Into<String>) -> Self {
        Diagnostic {
            code,
            severity: code.default_severity(),
            message: message.into(),
            location,
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        write!(
            f,
            "{}[{}] {}: {}",
            level, self.code, self.location, self.message
        )
    }
}

/// Ordered diagnostic list for one action (or a whole batch).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Diagnostics(Vec<Diagnostic>);

impl Diagnostics {
    pub fn new() -> Self {
        Diagnostics(Vec::new())
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.0.push(diagnostic);
    }

    pub fn extend(&mut self, other: Diagnostics) {
        self.0.extend(other.0);
    }

    pub fn has_errors(&self) -> bool {
        self.0.iter().any(Diagnostic::is_error)
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.0.iter().filter(|d| d.is_error())
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.0.iter().filter(|d| !d.is_error())
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Diagnostic> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains_code(&self, code: DiagnosticCode) -> bool {
        self.0.iter().any(|d| d.code == code)
    }

    /// Promote every warning to an error.
    pub fn escalate_warnings(&mut self) {
        for d in &mut self.0 {
            d.severity = Severity::Error;
        }
    }

    pub fn into_vec(self) -> Vec<Diagnostic> {
        self.0
    }
}

impl IntoIterator for Diagnostics {
    type Item = Diagnostic;
    type IntoIter = std::vec::IntoIter<Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Diagnostics {
    type Item = &'a Diagnostic;
    type IntoIter = std::slice::Iter<'a, Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl FromIterator<Diagnostic> for Diagnostics {
    fn from_iter<I: IntoIterator<Item = Diagnostic>>(iter: I) -> Self {
        Diagnostics(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc() -> Location {
        Location {
            entity: "Contact".into(),
            action: Some("qualify_lead".into()),
            step: StepPath(vec![2, 0]),
        }
    }

    #[test]
    fn display_includes_location() {
        let d = Diagnostic::new(
            DiagnosticCode::UnknownVariable,
            loc(),
            "unknown variable 'x'",
        );
        assert_eq!(
            d.to_string(),
            "error[UnknownVariable] Contact.qualify_lead#2.0: unknown variable 'x'"
        );
    }

    #[test]
    fn warnings_do_not_count_as_errors() {
        let mut ds = Diagnostics::new();
        ds.push(Diagnostic::new(DiagnosticCode::UnreachableCode, loc(), "x"));
        assert!(!ds.has_errors());
        ds.escalate_warnings();
        assert!(ds.has_errors());
    }

    #[test]
    fn categories_follow_taxonomy() {
        assert_eq!(DiagnosticCode::UnknownVariable.category(), Category::Scope);
        assert_eq!(DiagnosticCode::InvalidFieldReference.category(), Category::Type);
        assert_eq!(
            DiagnosticCode::DuplicateDefaultCatch.category(),
            Category::ControlFlow
        );
        assert_eq!(
            DiagnosticCode::UnknownFunctionWarning.default_severity(),
            Severity::Warning
        );
    }
}
