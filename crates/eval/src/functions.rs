//! Host functions standing in for the catalog functions an action calls,
//! plus the builtin whitelist every backend provides natively.

use crate::error::RuntimeError;
use crate::store::Database;
use crate::value::Value;
use rust_decimal::{Decimal, RoundingStrategy};
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::fmt;

type HostFn = dyn Fn(&[Value]) -> Result<Value, RuntimeError> + Send + Sync;

struct Registered {
    params: Vec<String>,
    body: Box<HostFn>,
}

/// Callable functions by qualified name. Parameters are declared by name so
/// that `CallFunction` steps (named arguments) and expression calls
/// (positional) reach the same body.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: BTreeMap<String, Registered>,
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.functions.keys()).finish()
    }
}

impl FunctionRegistry {
    pub fn new() -> Self {
        FunctionRegistry::default()
    }

    pub fn register<F>(&mut self, name: &str, params: &[&str], body: F) -> &mut Self
    where
        F: Fn(&[Value]) -> Result<Value, RuntimeError> + Send + Sync + 'static,
    {
        self.functions.insert(
            name.to_owned(),
            Registered {
                params: params.iter().map(|p| (*p).to_owned()).collect(),
                body: Box::new(body),
            },
        );
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    fn get(&self, name: &str) -> Result<&Registered, RuntimeError> {
        self.functions
            .get(name)
            .ok_or_else(|| RuntimeError::UnknownFunction {
                name: name.to_owned(),
            })
    }

    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value, RuntimeError> {
        (self.get(name)?.body)(args)
    }

    /// Named arguments land on their declared position; missing ones are
    /// `NULL`.
    pub fn call_named(&self, name: &str, args: &[(String, Value)]) -> Result<Value, RuntimeError> {
        let function = self.get(name)?;
        let mut positional = vec![Value::Null; function.params.len()];
        for (key, value) in args {
            let slot = function
                .params
                .iter()
                .position(|p| p == key)
                .ok_or_else(|| RuntimeError::UnknownFunction {
                    name: format!("{}({} => ...)", name, key),
                })?;
            positional[slot] = value.clone();
        }
        (function.body)(&positional)
    }
}

// ──────────────────────────────────────────────
// Builtins
// ──────────────────────────────────────────────

fn text_arg(args: &[Value], i: usize) -> Option<String> {
    args.get(i).and_then(Value::as_text)
}

fn map_text(args: &[Value], f: impl Fn(&str) -> Value) -> Value {
    match text_arg(args, 0) {
        Some(s) => f(&s),
        None => Value::Null,
    }
}

/// Evaluate a whitelisted builtin.
pub(crate) fn builtin(name: &str, args: &[Value], db: &Database) -> Result<Value, RuntimeError> {
    let name = name.to_ascii_lowercase();
    Ok(match name.as_str() {
        "upper" => map_text(args, |s| Value::text(s.to_uppercase())),
        "lower" => map_text(args, |s| Value::text(s.to_lowercase())),
        "trim" => map_text(args, |s| Value::text(s.trim())),
        "length" => map_text(args, |s| Value::Int(s.chars().count() as i64)),
        "coalesce" => args
            .iter()
            .find(|v| !v.is_null())
            .cloned()
            .unwrap_or(Value::Null),
        "now" => Value::text(db.now()),
        "current_date" => Value::Text(db.now().chars().take(10).collect()),
        "concat" => Value::Text(args.iter().filter_map(Value::as_text).collect()),
        "abs" => match args.first() {
            Some(Value::Int(i)) => Value::Int(i.checked_abs().ok_or_else(|| {
                RuntimeError::OutOfRange {
                    message: i.to_string(),
                }
            })?),
            Some(Value::Decimal(d)) => Value::Decimal(d.abs()),
            Some(Value::Null) | None => Value::Null,
            Some(other) => {
                return Err(RuntimeError::invalid(format!("abs of {}", other.type_name())))
            }
        },
        "round" => {
            let digits = match args.get(1) {
                Some(Value::Int(d)) => u32::try_from(*d).unwrap_or(0),
                _ => 0,
            };
            match args.first() {
                Some(Value::Int(i)) => Value::Decimal(Decimal::from(*i)),
                Some(Value::Decimal(d)) => Value::Decimal(
                    d.round_dp_with_strategy(digits, RoundingStrategy::MidpointAwayFromZero),
                ),
                Some(Value::Null) | None => Value::Null,
                Some(other) => {
                    return Err(RuntimeError::invalid(format!(
                        "round of {}",
                        other.type_name()
                    )))
                }
            }
        }
        "gen_random_uuid" => Value::Text(db.next_uuid()),
        "jsonb_array_length" => match args.first() {
            Some(Value::Json(Json::Array(items))) => Value::Int(items.len() as i64),
            Some(Value::Array(items)) => Value::Int(items.len() as i64),
            Some(Value::Null) | None => Value::Null,
            Some(other) => {
                return Err(RuntimeError::invalid(format!(
                    "jsonb_array_length of {}",
                    other.type_name()
                )))
            }
        },
        other => {
            return Err(RuntimeError::UnknownFunction {
                name: other.to_owned(),
            })
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use specql_core::ast::ExceptionKind;

    #[test]
    fn named_arguments_follow_declared_order() {
        let mut registry = FunctionRegistry::new();
        registry.register("crm.sub", &["a", "b"], |args| match (&args[0], &args[1]) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a - b)),
            _ => Err(RuntimeError::raise(ExceptionKind::CheckViolation, "bad args")),
        });
        let named = vec![("b".to_owned(), Value::Int(1)), ("a".to_owned(), Value::Int(5))];
        assert_eq!(registry.call_named("crm.sub", &named).unwrap(), Value::Int(4));
        assert!(matches!(
            registry.call("crm.nope", &[]),
            Err(RuntimeError::UnknownFunction { .. })
        ));
    }

    #[test]
    fn builtins_propagate_null() {
        let db = Database::new(&[]);
        assert_eq!(builtin("upper", &[Value::Null], &db).unwrap(), Value::Null);
        assert_eq!(
            builtin("concat", &[Value::text("a"), Value::Null, Value::Int(1)], &db).unwrap(),
            Value::text("a1")
        );
        assert_eq!(
            builtin("coalesce", &[Value::Null, Value::Int(2)], &db).unwrap(),
            Value::Int(2)
        );
        assert_eq!(
            builtin("round", &[Value::Decimal(Decimal::new(125, 2)), Value::Int(1)], &db).unwrap(),
            Value::Decimal(Decimal::new(13, 1))
        );
    }
}
