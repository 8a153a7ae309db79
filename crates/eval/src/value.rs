//! Runtime values with SQL semantics: `NULL` propagation, three-valued
//! comparisons and assignment casts to entity field types.
//!
//! All numeric values use `rust_decimal::Decimal` or `i64`, never `f64`.
//! Temporal, uuid and other text-backed types are carried as text.

use crate::error::RuntimeError;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::Value as Json;
use specql_core::ast::{Literal, SemanticType};
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Decimal(Decimal),
    Text(String),
    Json(Json),
    Row(Row),
    Array(Vec<Value>),
    /// An open cursor: its materialized rows and the next fetch position.
    Cursor { rows: Vec<Row>, position: usize },
}

/// Named columns in select-list order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    columns: Vec<(String, Value)>,
}

impl Row {
    pub fn new() -> Self {
        Row::default()
    }

    /// A row of `NULL`s, used for the missing side of a left join.
    pub fn nulls<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        Row {
            columns: names.into_iter().map(|n| (n.to_owned(), Value::Null)).collect(),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.set(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Replace the column if present, append it otherwise.
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        match self.columns.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.columns.push((name, value)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.columns.iter().map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn to_json(&self) -> Json {
        Json::Object(
            self.columns
                .iter()
                .map(|(n, v)| (n.clone(), v.to_json()))
                .collect(),
        )
    }

    /// Positional rename, as a column list on a CTE does.
    pub fn renamed(&self, names: &[String]) -> Row {
        Row {
            columns: self
                .columns
                .iter()
                .enumerate()
                .map(|(i, (n, v))| (names.get(i).cloned().unwrap_or_else(|| n.clone()), v.clone()))
                .collect(),
        }
    }
}

impl Value {
    pub fn text(s: impl Into<String>) -> Self {
        Value::Text(s.into())
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "integer",
            Value::Decimal(_) => "decimal",
            Value::Text(_) => "text",
            Value::Json(_) => "json",
            Value::Row(_) => "row",
            Value::Array(_) => "array",
            Value::Cursor { .. } => "cursor",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn from_literal(literal: &Literal) -> Self {
        match literal {
            Literal::Null => Value::Null,
            Literal::Bool(b) => Value::Bool(*b),
            Literal::Integer(i) => Value::Int(*i),
            Literal::Decimal(d) => Value::Decimal(*d),
            Literal::Text(s) => Value::Text(s.clone()),
        }
    }

    /// Truth value of a condition; `NULL` is unknown.
    pub fn truth(&self) -> Result<Option<bool>, RuntimeError> {
        match self {
            Value::Null | Value::Json(Json::Null) => Ok(None),
            Value::Bool(b) | Value::Json(Json::Bool(b)) => Ok(Some(*b)),
            Value::Text(s) if s == "true" => Ok(Some(true)),
            Value::Text(s) if s == "false" => Ok(Some(false)),
            other => Err(RuntimeError::invalid(format!(
                "{} used as a condition",
                other.type_name()
            ))),
        }
    }

    /// `IS TRUE`: unknown counts as false.
    pub fn is_true(&self) -> Result<bool, RuntimeError> {
        Ok(self.truth()? == Some(true))
    }

    pub fn to_json(&self) -> Json {
        match self {
            Value::Null | Value::Cursor { .. } => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => Json::from(*i),
            Value::Decimal(d) => decimal_to_json(*d),
            Value::Text(s) => Json::String(s.clone()),
            Value::Json(j) => j.clone(),
            Value::Row(row) => row.to_json(),
            Value::Array(items) => Json::Array(items.iter().map(Value::to_json).collect()),
        }
    }

    /// Scalars become native values; objects and arrays stay json.
    pub fn from_json(json: &Json) -> Self {
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => parse_decimal(&n.to_string())
                    .map(Value::Decimal)
                    .unwrap_or_else(|| Value::Json(json.clone())),
            },
            Json::String(s) => Value::Text(s.clone()),
            Json::Array(_) | Json::Object(_) => Value::Json(json.clone()),
        }
    }

    /// Text rendering, as a `::text` cast would produce it.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Bool(b) => Some(b.to_string()),
            Value::Int(i) => Some(i.to_string()),
            Value::Decimal(d) => Some(d.to_string()),
            Value::Text(s) => Some(s.clone()),
            Value::Json(Json::String(s)) => Some(s.clone()),
            other => Some(other.to_json().to_string()),
        }
    }

    pub(crate) fn as_decimal(&self) -> Option<Decimal> {
        match self {
            Value::Int(i) => Some(Decimal::from(*i)),
            Value::Decimal(d) => Some(*d),
            Value::Text(s) => parse_decimal(s),
            Value::Json(Json::Number(n)) => parse_decimal(&n.to_string()),
            _ => None,
        }
    }

    /// Assignment cast into a slot of type `ty`.
    pub fn coerce(self, ty: &SemanticType) -> Result<Value, RuntimeError> {
        if self.is_null() {
            return Ok(Value::Null);
        }
        let invalid = |v: &Value| RuntimeError::InvalidText {
            expected: ty.key().to_owned(),
            value: v.as_text().unwrap_or_default(),
        };
        match ty {
            SemanticType::Integer | SemanticType::Reference { .. } => match &self {
                Value::Int(_) => Ok(self),
                Value::Decimal(d) => d
                    .round()
                    .to_i64()
                    .map(Value::Int)
                    .ok_or_else(|| RuntimeError::OutOfRange {
                        message: d.to_string(),
                    }),
                Value::Text(s) => s.trim().parse().map(Value::Int).map_err(|_| invalid(&self)),
                Value::Json(Json::Number(n)) => n.as_i64().map(Value::Int).ok_or_else(|| invalid(&self)),
                _ => Err(invalid(&self)),
            },
            SemanticType::Decimal => self
                .as_decimal()
                .map(Value::Decimal)
                .ok_or_else(|| invalid(&self)),
            SemanticType::Boolean => match &self {
                Value::Bool(_) => Ok(self),
                Value::Json(Json::Bool(b)) => Ok(Value::Bool(*b)),
                Value::Text(s) => match s.as_str() {
                    "true" | "t" => Ok(Value::Bool(true)),
                    "false" | "f" => Ok(Value::Bool(false)),
                    _ => Err(invalid(&self)),
                },
                _ => Err(invalid(&self)),
            },
            SemanticType::Json => Ok(Value::Json(self.to_json())),
            _ => match &self {
                Value::Row(_) | Value::Array(_) | Value::Cursor { .. } => Err(invalid(&self)),
                other => Ok(Value::Text(other.as_text().unwrap_or_default())),
            },
        }
    }

    /// SQL comparison; `None` when either side is `NULL`.
    pub fn compare(&self, other: &Value) -> Result<Option<Ordering>, RuntimeError> {
        use Value::*;
        Ok(match (self, other) {
            (Null, _) | (_, Null) => None,
            (Int(a), Int(b)) => Some(a.cmp(b)),
            (Bool(a), Bool(b)) => Some(a.cmp(b)),
            (Text(a), Text(b)) => Some(a.cmp(b)),
            (Json(a), Json(b)) => Some(if a == b {
                Ordering::Equal
            } else {
                a.to_string().cmp(&b.to_string())
            }),
            (Row(a), Row(b)) => Some(if a == b {
                Ordering::Equal
            } else {
                a.to_json().to_string().cmp(&b.to_json().to_string())
            }),
            (a, b) => match (a.as_decimal(), b.as_decimal()) {
                (Some(x), Some(y)) => Some(x.cmp(&y)),
                _ => match (a, b) {
                    (Text(s), v) | (v, Text(s)) => {
                        let t = v.as_text().unwrap_or_default();
                        if matches!(a, Text(_)) {
                            Some(s.cmp(&t))
                        } else {
                            Some(t.cmp(s))
                        }
                    }
                    _ => {
                        return Err(RuntimeError::invalid(format!(
                            "cannot compare {} with {}",
                            a.type_name(),
                            b.type_name()
                        )))
                    }
                },
            },
        })
    }

    /// SQL equality; `None` when either side is `NULL`.
    pub fn sql_eq(&self, other: &Value) -> Result<Option<bool>, RuntimeError> {
        Ok(self.compare(other)?.map(|o| o == Ordering::Equal))
    }

    /// Total order for `ORDER BY`: `NULL`s sort after every value.
    pub fn sort_order(&self, other: &Value) -> Ordering {
        match (self.is_null(), other.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => self
                .compare(other)
                .ok()
                .flatten()
                .unwrap_or(Ordering::Equal),
        }
    }
}

fn parse_decimal(s: &str) -> Option<Decimal> {
    let s = s.trim();
    s.parse::<Decimal>()
        .ok()
        .or_else(|| Decimal::from_scientific(s).ok())
}

fn decimal_to_json(d: Decimal) -> Json {
    if d.fract().is_zero() {
        if let Some(i) = d.to_i64() {
            return Json::from(i);
        }
    }
    d.to_f64()
        .and_then(serde_json::Number::from_f64)
        .map(Json::Number)
        .unwrap_or_else(|| Json::String(d.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn comparisons_with_null_are_unknown() {
        assert_eq!(Value::Int(1).sql_eq(&Value::Null).unwrap(), None);
        assert_eq!(Value::Null.truth().unwrap(), None);
        assert!(!Value::Null.is_true().unwrap());
    }

    #[test]
    fn numbers_compare_across_representations() {
        let d = Value::Decimal(Decimal::new(25, 1));
        assert_eq!(Value::Int(2).compare(&d).unwrap(), Some(Ordering::Less));
        assert_eq!(Value::Int(3).sql_eq(&Value::text("3")).unwrap(), Some(true));
    }

    #[test]
    fn nulls_sort_last() {
        let mut values = vec![Value::Null, Value::Int(2), Value::Int(1)];
        values.sort_by(|a, b| a.sort_order(b));
        assert_eq!(values, vec![Value::Int(1), Value::Int(2), Value::Null]);
    }

    #[test]
    fn coerce_follows_field_types() {
        assert_eq!(
            Value::text("42").coerce(&SemanticType::Integer).unwrap(),
            Value::Int(42)
        );
        assert_eq!(
            Value::Int(7).coerce(&SemanticType::Decimal).unwrap(),
            Value::Decimal(Decimal::from(7))
        );
        assert_eq!(
            Value::Int(7).coerce(&SemanticType::Text).unwrap(),
            Value::text("7")
        );
        assert!(matches!(
            Value::text("x").coerce(&SemanticType::Integer),
            Err(RuntimeError::InvalidText { .. })
        ));
    }

    #[test]
    fn json_round_trip_keeps_structure() {
        let row = Row::new()
            .with("n", Value::Int(1))
            .with("d", Value::Decimal(Decimal::new(15, 1)))
            .with("tags", Value::Array(vec![Value::text("a")]));
        assert_eq!(row.to_json(), json!({"n": 1, "d": 1.5, "tags": ["a"]}));
        assert_eq!(Value::from_json(&json!("x")), Value::text("x"));
        assert_eq!(Value::from_json(&json!(3)), Value::Int(3));
    }
}
