//! Compile-time value types.
//!
//! `ValueType` is what the step compiler infers for bindings and expressions.
//! It extends the entity-level `SemanticType` with rows (query results),
//! arrays, cursors and an explicit `Dynamic` escape for inference failures.

use crate::ast::SemanticType;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ValueType,
}

impl Column {
    pub fn new(name: impl Into<String>, ty: ValueType) -> Self {
        Column {
            name: name.into(),
            ty,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValueType {
    Scalar { ty: SemanticType },
    /// The type of the `null` literal: compatible with every nullable slot.
    Null,
    Row { columns: Vec<Column> },
    Array { element: Box<ValueType> },
    Cursor { columns: Vec<Column> },
    /// Unresolved: inference failed. A documented escape, never an error.
    Dynamic,
}

impl ValueType {
    pub fn scalar(ty: SemanticType) -> Self {
        ValueType::Scalar { ty }
    }

    pub fn boolean() -> Self {
        ValueType::scalar(SemanticType::Boolean)
    }

    pub fn integer() -> Self {
        ValueType::scalar(SemanticType::Integer)
    }

    pub fn decimal() -> Self {
        ValueType::scalar(SemanticType::Decimal)
    }

    pub fn text() -> Self {
        ValueType::scalar(SemanticType::Text)
    }

    pub fn json() -> Self {
        ValueType::scalar(SemanticType::Json)
    }

    pub fn uuid() -> Self {
        ValueType::scalar(SemanticType::Uuid)
    }

    pub fn array(element: ValueType) -> Self {
        ValueType::Array {
            element: Box::new(element),
        }
    }

    pub fn as_scalar(&self) -> Option<&SemanticType> {
        match self {
            ValueType::Scalar { ty } => Some(ty),
            _ => None,
        }
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, ValueType::Dynamic)
    }

    /// Usable where a boolean is required.
    pub fn is_boolean_like(&self) -> bool {
        matches!(
            self,
            ValueType::Scalar {
                ty: SemanticType::Boolean
            } | ValueType::Dynamic
                | ValueType::Null
        )
    }

    pub fn is_numeric_like(&self) -> bool {
        match self {
            ValueType::Scalar { ty } => ty.is_numeric(),
            ValueType::Dynamic | ValueType::Null => true,
            _ => false,
        }
    }

    pub fn is_textual_like(&self) -> bool {
        match self {
            ValueType::Scalar { ty } => ty.is_textual(),
            ValueType::Dynamic | ValueType::Null => true,
            _ => false,
        }
    }

    /// Columns of a row-shaped type.
    pub fn columns(&self) -> Option<&[Column]> {
        match self {
            ValueType::Row { columns } | ValueType::Cursor { columns } => Some(columns),
            _ => None,
        }
    }

    /// Whether a value of type `value` may be stored in a slot of this type.
    ///
    /// There is no implicit coercion between text and numeric types. The only
    /// widenings are integer to decimal, between the text-backed scalars,
    /// and structured values into json.
    pub fn accepts(&self, value: &ValueType) -> bool {
        match (self, value) {
            (ValueType::Dynamic, _) | (_, ValueType::Dynamic) | (_, ValueType::Null) => true,
            (ValueType::Scalar { ty: target }, ValueType::Scalar { ty: source }) => {
                scalar_accepts(target, source)
            }
            (
                ValueType::Scalar {
                    ty: SemanticType::Json,
                },
                ValueType::Row { .. } | ValueType::Array { .. },
            ) => true,
            (ValueType::Row { columns: a }, ValueType::Row { columns: b }) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b)
                        .all(|(x, y)| x.name == y.name && x.ty.accepts(&y.ty))
            }
            (ValueType::Array { element: a }, ValueType::Array { element: b }) => a.accepts(b),
            (ValueType::Cursor { .. }, ValueType::Cursor { .. }) => true,
            _ => false,
        }
    }

    /// Least upper bound of two types, used for array elements, aggregate
    /// results and return payload fields. `None` when they are unrelated.
    pub fn unify(&self, other: &ValueType) -> Option<ValueType> {
        match (self, other) {
            (a, b) if a == b => Some(a.clone()),
            (ValueType::Null, t) | (t, ValueType::Null) => Some(t.clone()),
            (ValueType::Dynamic, _) | (_, ValueType::Dynamic) => Some(ValueType::Dynamic),
            (ValueType::Scalar { ty: a }, ValueType::Scalar { ty: b }) => {
                if a.is_numeric() && b.is_numeric() {
                    Some(ValueType::decimal())
                } else if a.is_textual() && b.is_textual() {
                    Some(ValueType::text())
                } else {
                    None
                }
            }
            (ValueType::Array { element: a }, ValueType::Array { element: b }) => {
                a.unify(b).map(ValueType::array)
            }
            _ => None,
        }
    }
}

fn scalar_accepts(target: &SemanticType, source: &SemanticType) -> bool {
    use SemanticType::*;
    match (target, source) {
        (Decimal, Integer) => true,
        (Reference { entity: a }, Reference { entity: b }) => a == b,
        (Reference { .. }, Integer) => true,
        (Enum { values }, Enum { values: other }) => other.iter().all(|v| values.contains(v)),
        (t, s) if t.is_textual() && s.is_textual() => true,
        (t, s) => t == s,
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Scalar { ty } => match ty {
                SemanticType::Enum { values } => write!(f, "enum({})", values.join(", ")),
                SemanticType::Reference { entity } => write!(f, "ref({})", entity),
                other => write!(f, "{}", other.key()),
            },
            ValueType::Null => write!(f, "null"),
            ValueType::Row { columns } => {
                let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
                write!(f, "row({})", names.join(", "))
            }
            ValueType::Array { element } => write!(f, "array<{}>", element),
            ValueType::Cursor { .. } => write!(f, "cursor"),
            ValueType::Dynamic => write!(f, "dynamic"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_text_numeric_coercion() {
        assert!(!ValueType::integer().accepts(&ValueType::text()));
        assert!(!ValueType::text().accepts(&ValueType::integer()));
    }

    #[test]
    fn integer_widens_to_decimal_only() {
        assert!(ValueType::decimal().accepts(&ValueType::integer()));
        assert!(!ValueType::integer().accepts(&ValueType::decimal()));
    }

    #[test]
    fn text_family_is_interchangeable() {
        let email = ValueType::scalar(SemanticType::Email);
        assert!(email.accepts(&ValueType::text()));
        assert!(ValueType::text().accepts(&email));
    }

    #[test]
    fn dynamic_and_null_are_always_accepted() {
        assert!(ValueType::boolean().accepts(&ValueType::Dynamic));
        assert!(ValueType::boolean().accepts(&ValueType::Null));
        assert!(ValueType::Dynamic.accepts(&ValueType::text()));
    }

    #[test]
    fn unify_numeric_and_unrelated() {
        assert_eq!(
            ValueType::integer().unify(&ValueType::decimal()),
            Some(ValueType::decimal())
        );
        assert_eq!(ValueType::integer().unify(&ValueType::text()), None);
        assert_eq!(
            ValueType::Null.unify(&ValueType::text()),
            Some(ValueType::text())
        );
    }

    #[test]
    fn display_names() {
        assert_eq!(ValueType::array(ValueType::integer()).to_string(), "array<integer>");
        assert_eq!(
            ValueType::scalar(SemanticType::Reference {
                entity: "Company".into()
            })
            .to_string(),
            "ref(Company)"
        );
    }
}
