//! Lowerings for targets that lack a construct natively.
//!
//! `lower_switches` rewrites every `Switch` into a temporary plus an
//! `If`/`else` chain. The subject is evaluated exactly once, into the
//! temporary, before any case is tested. Early return without a native
//! `RETURN` is handled by the emitters with a done flag; [`return_segments`]
//! tells them where the flag has to be tested.

use specql_core::ast::{BinaryOp, Literal};
use specql_core::compiled::{
    CompiledAction, CompiledBranch, CompiledCase, CompiledStep, TypedExpr, TypedExprKind,
};
use specql_core::scope::SymbolTable;
use specql_core::types::ValueType;
use tracing::debug;

/// A copy of `compiled` without any `Switch` step.
pub fn lower_switches(compiled: &CompiledAction) -> CompiledAction {
    let mut lowered = compiled.clone();
    let mut counter = 0;
    let body = std::mem::take(&mut lowered.body);
    lowered.body = lower_block(body, &mut lowered.symbols, &mut counter);
    if counter > 0 {
        debug!(
            entity = %compiled.entity.name,
            action = %compiled.action,
            switches = counter,
            "lowered switch statements"
        );
    }
    lowered
}

fn lower_block(
    steps: Vec<CompiledStep>,
    symbols: &mut SymbolTable,
    counter: &mut usize,
) -> Vec<CompiledStep> {
    let mut out = Vec::with_capacity(steps.len());
    for step in steps {
        match step {
            CompiledStep::Switch {
                subject,
                cases,
                default,
            } => {
                *counter += 1;
                let temp = symbols.push_temp(&format!("switch_{}", counter), subject.ty.clone());
                let temp_expr = TypedExpr::new(TypedExprKind::Var { symbol: temp }, subject.ty.clone());
                out.push(CompiledStep::Assign {
                    target: temp,
                    value: subject,
                });

                let mut branches = Vec::with_capacity(cases.len());
                for CompiledCase { values, body } in cases {
                    branches.push(CompiledBranch {
                        condition: matches_any(&temp_expr, values),
                        body: lower_block(body, symbols, counter),
                    });
                }
                let else_body = default.map(|d| lower_block(d, symbols, counter));
                match (branches.is_empty(), else_body) {
                    (true, Some(default)) => out.extend(default),
                    (true, None) => {}
                    (false, else_body) => out.push(CompiledStep::If {
                        branches,
                        else_body,
                    }),
                }
            }
            other => out.push(lower_nested(other, symbols, counter)),
        }
    }
    out
}

/// `temp = v1 OR temp = v2 ...`; a case without values never matches.
fn matches_any(temp: &TypedExpr, values: Vec<Literal>) -> TypedExpr {
    let mut conditions = values.into_iter().map(|value| {
        TypedExpr::new(
            TypedExprKind::Binary {
                op: BinaryOp::Eq,
                left: Box::new(temp.clone()),
                right: Box::new(TypedExpr::literal(value)),
            },
            ValueType::boolean(),
        )
    });
    let Some(first) = conditions.next() else {
        return TypedExpr::literal(Literal::Bool(false));
    };
    conditions.fold(first, |acc, next| {
        TypedExpr::new(
            TypedExprKind::Binary {
                op: BinaryOp::Or,
                left: Box::new(acc),
                right: Box::new(next),
            },
            ValueType::boolean(),
        )
    })
}

fn lower_nested(step: CompiledStep, symbols: &mut SymbolTable, counter: &mut usize) -> CompiledStep {
    match step {
        CompiledStep::If {
            branches,
            else_body,
        } => CompiledStep::If {
            branches: branches
                .into_iter()
                .map(|b| CompiledBranch {
                    condition: b.condition,
                    body: lower_block(b.body, symbols, counter),
                })
                .collect(),
            else_body: else_body.map(|e| lower_block(e, symbols, counter)),
        },
        CompiledStep::While { condition, body } => CompiledStep::While {
            condition,
            body: lower_block(body, symbols, counter),
        },
        CompiledStep::ForQuery {
            iterator,
            query,
            body,
        } => CompiledStep::ForQuery {
            iterator,
            query,
            body: lower_block(body, symbols, counter),
        },
        CompiledStep::ForeachCursor {
            cursor,
            iterator,
            body,
        } => CompiledStep::ForeachCursor {
            cursor,
            iterator,
            body: lower_block(body, symbols, counter),
        },
        CompiledStep::TryCatch { body, catches } => CompiledStep::TryCatch {
            body: lower_block(body, symbols, counter),
            catches: catches
                .into_iter()
                .map(|mut c| {
                    c.body = lower_block(std::mem::take(&mut c.body), symbols, counter);
                    c
                })
                .collect(),
        },
        other => other,
    }
}

/// Split a block after every step that may return. Every segment but the
/// first must only run while nothing has returned yet.
pub fn return_segments(steps: &[CompiledStep]) -> Vec<&[CompiledStep]> {
    let mut segments = Vec::new();
    let mut start = 0;
    for (i, step) in steps.iter().enumerate() {
        if step.contains_return() && i + 1 < steps.len() {
            segments.push(&steps[start..=i]);
            start = i + 1;
        }
    }
    segments.push(&steps[start..]);
    segments
}

#[cfg(test)]
mod tests {
    use super::*;
    use specql_core::ast::EntitySpec;
    use specql_core::catalog::{build_index, Catalog, StaticCatalog};
    use specql_core::compiler::{compile, CompileOptions};
    use specql_core::scope::SymbolKind;
    use serde_json::json;

    fn compiled(steps: serde_json::Value) -> CompiledAction {
        let entities: Vec<EntitySpec> = serde_json::from_value(json!([
            {"name": "Contact", "fields": [{"name": "status", "type": {"base": "text"}}],
             "actions": [{"name": "route", "steps": steps}]}
        ]))
        .unwrap();
        let (index, _) = build_index(&entities);
        let functions = StaticCatalog::new();
        let catalog = Catalog::new(&index, &functions);
        compile(&entities[0].actions[0], &entities[0], &catalog, &CompileOptions::default())
            .unwrap()
    }

    fn text(s: &str) -> serde_json::Value {
        json!({"expr": "literal", "value": {"type": "text", "value": s}})
    }

    fn ret(status: &str) -> serde_json::Value {
        json!({"kind": "return_early", "payload": {"status": status}})
    }

    #[test]
    fn switch_becomes_temp_and_if_chain() {
        let action = compiled(json!([
            {"kind": "switch", "subject": {"expr": "var", "name": "status"}, "cases": [
                {"values": [{"type": "text", "value": "lead"}, {"type": "text", "value": "new"}],
                 "steps": [ret("a")]},
                {"values": [], "steps": [ret("never")]}
            ], "default": [ret("b")]}
        ]));
        let lowered = lower_switches(&action);
        assert!(!lowered.body.iter().any(CompiledStep::contains_switch));

        let CompiledStep::Assign { target, .. } = &lowered.body[0] else {
            panic!("expected subject assignment, got {:?}", lowered.body[0]);
        };
        assert_eq!(lowered.symbol(*target).kind, SymbolKind::Temp);
        assert_eq!(lowered.symbol(*target).name, "switch_1");

        let CompiledStep::If {
            branches,
            else_body,
        } = &lowered.body[1]
        else {
            panic!("expected if chain");
        };
        assert_eq!(branches.len(), 2);
        assert!(matches!(
            branches[0].condition.kind,
            TypedExprKind::Binary { op: BinaryOp::Or, .. }
        ));
        assert_eq!(
            branches[1].condition,
            TypedExpr::literal(Literal::Bool(false))
        );
        assert!(else_body.is_some());
    }

    #[test]
    fn nested_switches_are_lowered() {
        let inner = json!({"kind": "switch", "subject": text("x"), "cases": [
            {"values": [{"type": "text", "value": "x"}], "steps": [ret("inner")]}
        ]});
        let action = compiled(json!([
            {"kind": "if", "branches": [{"condition":
                {"expr": "literal", "value": {"type": "bool", "value": true}},
                "steps": [inner]}]}
        ]));
        let lowered = lower_switches(&action);
        assert!(!lowered.body.iter().any(CompiledStep::contains_switch));
        assert_eq!(lowered.symbols.len(), action.symbols.len() + 1);
    }

    #[test]
    fn segments_split_after_returning_steps() {
        let action = compiled(json!([
            {"kind": "declare", "name": "a"},
            {"kind": "validate", "condition": {"expr": "literal", "value": {"type": "bool", "value": true}},
             "failure_code": "bad"},
            {"kind": "declare", "name": "b"},
            ret("done")
        ]));
        let segments = return_segments(&action.body);
        let lengths: Vec<usize> = segments.iter().map(|s| s.len()).collect();
        assert_eq!(lengths, vec![2, 2]);
    }
}
