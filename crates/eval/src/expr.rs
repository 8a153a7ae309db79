//! Expression evaluator.
//!
//! Expressions evaluate against the action's variable slots plus a frame of
//! relation bindings supplied by the enclosing query (empty outside one).
//! Operators follow SQL: `NULL` propagates through arithmetic and
//! comparisons, `AND`/`OR` use three-valued logic.

use crate::error::RuntimeError;
use crate::functions;
use crate::interp::Machine;
use crate::value::{Row, Value};
use rust_decimal::Decimal;
use serde_json::Value as Json;
use specql_core::ast::{BinaryOp, UnaryOp};
use specql_core::compiled::{TypedExpr, TypedExprKind};
use specql_core::scope::SymbolKind;
use std::cmp::Ordering;

/// Relation bindings visible to an expression, innermost last.
pub(crate) type Frame = Vec<(String, Row)>;

impl Machine<'_> {
    pub(crate) fn eval(&self, expr: &TypedExpr, frame: &[(String, Row)]) -> Result<Value, RuntimeError> {
        match &expr.kind {
            TypedExprKind::Literal { value } => Ok(Value::from_literal(value)),
            TypedExprKind::Var { symbol } => {
                let sym = self.symbol(*symbol)?;
                if sym.kind == SymbolKind::EntityField {
                    return Ok(self.current_field(&sym.name));
                }
                self.slot(*symbol)
            }
            TypedExprKind::Column { relation, field } => frame
                .iter()
                .rev()
                .find(|(binding, _)| binding == relation)
                .ok_or_else(|| RuntimeError::invalid(format!("relation '{}' is not bound", relation)))?
                .1
                .get(field)
                .cloned()
                .ok_or_else(|| {
                    RuntimeError::invalid(format!("'{}' has no column '{}'", relation, field))
                }),
            TypedExprKind::Binary { op, left, right } => self.binary(*op, left, right, frame),
            TypedExprKind::Unary { op, operand } => {
                let value = self.eval(operand, frame)?;
                unary(*op, value)
            }
            TypedExprKind::Call {
                function,
                builtin,
                args,
            } => {
                let args = args
                    .iter()
                    .map(|a| self.eval(a, frame))
                    .collect::<Result<Vec<_>, _>>()?;
                if *builtin {
                    functions::builtin(function, &args, &*self.db)
                } else {
                    self.functions.call(function, &args)
                }
            }
            TypedExprKind::Member { base, member } => {
                match self.eval(base, frame)? {
                    Value::Null => Ok(Value::Null),
                    Value::Row(row) => Ok(row.get(member).cloned().unwrap_or_default()),
                    // `->>` on jsonb: a missing key or a non-object is NULL
                    Value::Json(Json::Object(map)) => {
                        Ok(map.get(member).map(Value::from_json).unwrap_or_default())
                    }
                    Value::Json(_) => Ok(Value::Null),
                    other => Err(RuntimeError::invalid(format!(
                        "member '{}' of {}",
                        member,
                        other.type_name()
                    ))),
                }
            }
        }
    }

    /// Entity fields are read from the current record at the time of use,
    /// so they see earlier updates in the same action.
    fn current_field(&self, name: &str) -> Value {
        self.record
            .as_deref()
            .and_then(|id| self.db.find(&self.compiled.entity.name, id))
            .and_then(|row| row.get(name))
            .cloned()
            .unwrap_or_default()
    }

    fn binary(
        &self,
        op: BinaryOp,
        left: &TypedExpr,
        right: &TypedExpr,
        frame: &[(String, Row)],
    ) -> Result<Value, RuntimeError> {
        let l = self.eval(left, frame)?;
        // `false AND x` and `true OR x` never look at `x`
        let decided = match op {
            BinaryOp::And => l.truth()? == Some(false),
            BinaryOp::Or => l.truth()? == Some(true),
            _ => false,
        };
        if decided {
            return Ok(l);
        }
        let r = self.eval(right, frame)?;
        apply(op, l, r)
    }
}

/// Binary operators on evaluated operands. Everything except `AND`/`OR`
/// yields `NULL` on a `NULL` operand.
pub(crate) fn apply(op: BinaryOp, left: Value, right: Value) -> Result<Value, RuntimeError> {
    match op {
        BinaryOp::And | BinaryOp::Or => logical(op == BinaryOp::And, left.truth()?, right.truth()?),
        _ if left.is_null() || right.is_null() => Ok(Value::Null),
        BinaryOp::Eq => compared(&left, &right, |o| o == Ordering::Equal),
        BinaryOp::Ne => compared(&left, &right, |o| o != Ordering::Equal),
        BinaryOp::Lt => compared(&left, &right, |o| o == Ordering::Less),
        BinaryOp::Le => compared(&left, &right, |o| o != Ordering::Greater),
        BinaryOp::Gt => compared(&left, &right, |o| o == Ordering::Greater),
        BinaryOp::Ge => compared(&left, &right, |o| o != Ordering::Less),
        BinaryOp::Concat => Ok(Value::Text(format!(
            "{}{}",
            left.as_text().unwrap_or_default(),
            right.as_text().unwrap_or_default()
        ))),
        BinaryOp::Like => {
            let text: Vec<char> = left.as_text().unwrap_or_default().chars().collect();
            let pattern: Vec<char> = right.as_text().unwrap_or_default().chars().collect();
            Ok(Value::Bool(like(&text, &pattern)))
        }
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
            arithmetic(op, &left, &right)
        }
    }
}

fn logical(and: bool, left: Option<bool>, right: Option<bool>) -> Result<Value, RuntimeError> {
    // the dominant value wins even against unknown
    let dominant = !and;
    Ok(match (left, right) {
        (Some(l), _) if l == dominant => Value::Bool(dominant),
        (_, Some(r)) if r == dominant => Value::Bool(dominant),
        (Some(_), Some(_)) => Value::Bool(!dominant),
        _ => Value::Null,
    })
}

fn compared(left: &Value, right: &Value, test: fn(Ordering) -> bool) -> Result<Value, RuntimeError> {
    Ok(match left.compare(right)? {
        Some(ordering) => Value::Bool(test(ordering)),
        None => Value::Null,
    })
}

fn arithmetic(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, RuntimeError> {
    let overflow = || RuntimeError::OutOfRange {
        message: format!(
            "{} {:?} {}",
            left.as_text().unwrap_or_default(),
            op,
            right.as_text().unwrap_or_default()
        ),
    };
    if let (Value::Int(a), Value::Int(b)) = (left, right) {
        let (a, b) = (*a, *b);
        if matches!(op, BinaryOp::Div | BinaryOp::Mod) && b == 0 {
            return Err(RuntimeError::DivisionByZero);
        }
        // integer division truncates toward zero
        let result = match op {
            BinaryOp::Add => a.checked_add(b),
            BinaryOp::Sub => a.checked_sub(b),
            BinaryOp::Mul => a.checked_mul(b),
            BinaryOp::Div => a.checked_div(b),
            _ => a.checked_rem(b),
        };
        return result.map(Value::Int).ok_or_else(overflow);
    }
    let (Some(a), Some(b)) = (left.as_decimal(), right.as_decimal()) else {
        return Err(RuntimeError::invalid(format!(
            "cannot apply {:?} to {} and {}",
            op,
            left.type_name(),
            right.type_name()
        )));
    };
    if matches!(op, BinaryOp::Div | BinaryOp::Mod) && b == Decimal::ZERO {
        return Err(RuntimeError::DivisionByZero);
    }
    let result = match op {
        BinaryOp::Add => a.checked_add(b),
        BinaryOp::Sub => a.checked_sub(b),
        BinaryOp::Mul => a.checked_mul(b),
        BinaryOp::Div => a.checked_div(b),
        _ => a.checked_rem(b),
    };
    result.map(Value::Decimal).ok_or_else(overflow)
}

fn unary(op: UnaryOp, value: Value) -> Result<Value, RuntimeError> {
    match op {
        UnaryOp::IsNull => Ok(Value::Bool(value.is_null())),
        UnaryOp::IsNotNull => Ok(Value::Bool(!value.is_null())),
        UnaryOp::Not => Ok(match value.truth()? {
            Some(b) => Value::Bool(!b),
            None => Value::Null,
        }),
        UnaryOp::Neg => match value {
            Value::Null => Ok(Value::Null),
            Value::Int(i) => i.checked_neg().map(Value::Int).ok_or_else(|| RuntimeError::OutOfRange {
                message: i.to_string(),
            }),
            Value::Decimal(d) => Ok(Value::Decimal(-d)),
            other => match other.as_decimal() {
                Some(d) => Ok(Value::Decimal(-d)),
                None => Err(RuntimeError::invalid(format!("cannot negate {}", other.type_name()))),
            },
        },
    }
}

/// `LIKE` matching: `%` is any run, `_` one character, `\` escapes.
fn like(text: &[char], pattern: &[char]) -> bool {
    match pattern.split_first() {
        None => text.is_empty(),
        Some(('%', rest)) => (0..=text.len()).any(|i| like(&text[i..], rest)),
        Some(('_', rest)) => !text.is_empty() && like(&text[1..], rest),
        Some(('\\', rest)) if !rest.is_empty() => {
            text.first() == Some(&rest[0]) && like(&text[1..], &rest[1..])
        }
        Some((c, rest)) => text.first() == Some(c) && like(&text[1..], rest),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chars(s: &str) -> Vec<char> {
        s.chars().collect()
    }

    #[test]
    fn like_patterns() {
        assert!(like(&chars("alice@example.com"), &chars("%@example.com")));
        assert!(like(&chars("abc"), &chars("a_c")));
        assert!(!like(&chars("abc"), &chars("a_")));
        assert!(like(&chars("50%"), &chars("50\\%")));
        assert!(!like(&chars("500"), &chars("50\\%")));
    }

    #[test]
    fn arithmetic_follows_sql() {
        assert_eq!(apply(BinaryOp::Div, Value::Int(-7), Value::Int(2)).unwrap(), Value::Int(-3));
        assert_eq!(
            apply(BinaryOp::Add, Value::Int(1), Value::Decimal(Decimal::new(15, 1))).unwrap(),
            Value::Decimal(Decimal::new(25, 1))
        );
        assert_eq!(apply(BinaryOp::Mul, Value::Null, Value::Int(3)).unwrap(), Value::Null);
        assert_eq!(
            apply(BinaryOp::Mod, Value::Int(1), Value::Int(0)),
            Err(RuntimeError::DivisionByZero)
        );
        assert!(matches!(
            apply(BinaryOp::Add, Value::Int(i64::MAX), Value::Int(1)),
            Err(RuntimeError::OutOfRange { .. })
        ));
    }

    #[test]
    fn comparisons_with_null_are_unknown() {
        assert_eq!(apply(BinaryOp::Eq, Value::Null, Value::Null).unwrap(), Value::Null);
        assert_eq!(
            apply(BinaryOp::Ge, Value::Int(3), Value::Decimal(Decimal::new(3, 0))).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(unary(UnaryOp::Not, Value::Null).unwrap(), Value::Null);
        assert_eq!(unary(UnaryOp::IsNull, Value::Null).unwrap(), Value::Bool(true));
    }
}
