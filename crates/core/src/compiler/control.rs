//! Control-flow steps: branches, loops, validation, returns and exception
//! handling.

use super::expr::comparable;
use super::Compiler;
use crate::ast::{Branch, CatchClause, CatchTarget, Expr, ExceptionKind, Literal, ReturnPayload, Step, SwitchCase};
use crate::compiled::{
    CompiledBranch, CompiledCase, CompiledCatch, CompiledStep, ReturnValue, TypedExpr,
};
use crate::diagnostic::DiagnosticCode;
use crate::scope::{BindingMode, SymbolKind};
use crate::types::{Column, ValueType};
use std::collections::BTreeSet;

/// Name of the implicit binding holding the caught error's message.
pub const ERROR_MESSAGE: &str = "error_message";

impl<'a> Compiler<'a> {
    pub(crate) fn compile_if(
        &mut self,
        branches: &[Branch],
        else_steps: Option<&[Step]>,
    ) -> (Option<CompiledStep>, bool) {
        let mut compiled = Vec::with_capacity(branches.len());
        let mut all_terminate = !branches.is_empty();
        for (i, branch) in branches.iter().enumerate() {
            let condition = self.compile_condition(&branch.condition, None, "if condition");
            let block = self.compile_nested(i, &branch.steps);
            all_terminate &= block.terminates;
            compiled.push(CompiledBranch {
                condition,
                body: block.steps,
            });
        }
        let else_body = else_steps.map(|steps| {
            let block = self.compile_nested(branches.len(), steps);
            all_terminate &= block.terminates;
            block.steps
        });
        let terminates = else_body.is_some() && all_terminate;
        let step = CompiledStep::If {
            branches: compiled,
            else_body,
        };
        (Some(step), terminates)
    }

    pub(crate) fn compile_switch(
        &mut self,
        subject: &Expr,
        cases: &[SwitchCase],
        default: Option<&[Step]>,
    ) -> (Option<CompiledStep>, bool) {
        let subject = self.compile_expr(subject, None);
        let mut seen: Vec<Literal> = Vec::new();
        let mut compiled = Vec::with_capacity(cases.len());
        let mut all_terminate = !cases.is_empty();
        for (i, case) in cases.iter().enumerate() {
            if case.values.is_empty() {
                self.report(
                    DiagnosticCode::UnreachableCode,
                    format!("switch case {} has no values and never matches", i),
                );
            }
            for value in &case.values {
                let literal = TypedExpr::literal(value.clone());
                if !comparable(&subject.ty, &literal.ty) {
                    self.report(
                        DiagnosticCode::TypeMismatch,
                        format!(
                            "switch case value of type {} does not match subject of type {}",
                            literal.ty, subject.ty
                        ),
                    );
                }
                if seen.contains(value) {
                    self.report(
                        DiagnosticCode::UnreachableCode,
                        format!("switch case {} repeats a value matched by an earlier case", i),
                    );
                } else {
                    seen.push(value.clone());
                }
            }
            let block = self.compile_nested(i, &case.steps);
            all_terminate &= block.terminates;
            compiled.push(CompiledCase {
                values: case.values.clone(),
                body: block.steps,
            });
        }
        let default = default.map(|steps| {
            let block = self.compile_nested(cases.len(), steps);
            all_terminate &= block.terminates;
            block.steps
        });
        let terminates = default.is_some() && all_terminate;
        let step = CompiledStep::Switch {
            subject,
            cases: compiled,
            default,
        };
        (Some(step), terminates)
    }

    pub(crate) fn compile_while(&mut self, condition: &Expr, body: &[Step]) -> CompiledStep {
        let condition = self.compile_condition(condition, None, "while condition");
        let block = self.compile_nested(0, body);
        CompiledStep::While {
            condition,
            body: block.steps,
        }
    }

    /// `Validate` behaves like `If (not condition) { ReturnEarly { status:
    /// failure_code } }`. Its payload is not part of the action's return
    /// shape.
    pub(crate) fn compile_validate(
        &mut self,
        condition: &Expr,
        failure_code: &str,
        message: Option<&str>,
    ) -> CompiledStep {
        let condition = self.compile_condition(condition, None, "validation");
        CompiledStep::Validate {
            condition,
            failure: ReturnValue::status(failure_code, message.map(str::to_owned)),
        }
    }

    pub(crate) fn compile_return_payload(&mut self, payload: &ReturnPayload) -> ReturnValue {
        let message = payload.message.as_ref().map(|m| {
            let message = self.compile_expr(m, None);
            if !message.ty.is_textual_like() {
                self.report(
                    DiagnosticCode::TypeMismatch,
                    format!("return message must be text, got {}", message.ty),
                );
            }
            message
        });
        let fields = self.compile_entries(&payload.fields, None);
        let mut keys = BTreeSet::new();
        for entry in &fields {
            if !keys.insert(entry.key.as_str()) {
                self.report(
                    DiagnosticCode::InconsistentReturnShape,
                    format!("return payload field '{}' appears twice", entry.key),
                );
            }
        }
        self.record_return_shape(
            fields
                .iter()
                .map(|e| Column::new(e.key.clone(), e.value.ty.clone()))
                .collect(),
        );
        ReturnValue {
            status: payload.status.clone(),
            message,
            fields,
        }
    }

    pub(crate) fn compile_try_catch(
        &mut self,
        body: &[Step],
        catches: &[CatchClause],
    ) -> (Option<CompiledStep>, bool) {
        let body = self.compile_nested(0, body);
        let mut terminates = body.terminates;
        let mut seen_default = false;
        let mut seen_kinds: Vec<&ExceptionKind> = Vec::new();
        let mut compiled = Vec::with_capacity(catches.len());
        for (i, clause) in catches.iter().enumerate() {
            match &clause.on {
                CatchTarget::Default if seen_default => self.report(
                    DiagnosticCode::DuplicateDefaultCatch,
                    format!("catch clause {} is a second default clause", i),
                ),
                CatchTarget::Default => seen_default = true,
                CatchTarget::Kind(_) if seen_default => self.report(
                    DiagnosticCode::UnreachableCode,
                    format!("catch clause {} follows the default clause", i),
                ),
                CatchTarget::Kind(kind) if seen_kinds.contains(&kind) => self.report(
                    DiagnosticCode::UnreachableCode,
                    format!("catch clause {} repeats an exception kind handled earlier", i),
                ),
                CatchTarget::Kind(kind) => seen_kinds.push(kind),
            }
            let (error_message, block) = self.nested(i + 1, &clause.steps, |c| {
                c.declare(
                    ERROR_MESSAGE,
                    ValueType::text(),
                    BindingMode {
                        mutable: false,
                        nullable: false,
                        kind: SymbolKind::Implicit,
                    },
                )
            });
            terminates &= block.terminates;
            compiled.push(CompiledCatch {
                on: clause.on.clone(),
                error_message,
                body: block.steps,
            });
        }
        let step = CompiledStep::TryCatch {
            body: body.steps,
            catches: compiled,
        };
        (Some(step), terminates)
    }
}

#[cfg(test)]
mod tests {
    use crate::compiled::CompiledStep;
    use crate::compiler::tests::{bin, compile_steps, error_codes, int, text, var, warning_codes};
    use crate::diagnostic::DiagnosticCode;
    use serde_json::json;

    fn insert_contact() -> serde_json::Value {
        json!({"kind": "insert", "entity": "Contact",
               "values": [{"field": "email", "value": text("a@b.c")}]})
    }

    #[test]
    fn two_default_catches_are_rejected() {
        let result = compile_steps(json!([
            {"kind": "try_catch", "body": [insert_contact()], "catches": [
                {"on": "default", "steps": []},
                {"on": "default", "steps": []}
            ]}
        ]));
        assert_eq!(error_codes(&result), vec![DiagnosticCode::DuplicateDefaultCatch]);
    }

    #[test]
    fn clause_after_default_is_unreachable() {
        let compiled = compile_steps(json!([
            {"kind": "try_catch", "body": [insert_contact()], "catches": [
                {"on": "default", "steps": []},
                {"on": {"kind": "unique_violation"}, "steps": []}
            ]}
        ]))
        .unwrap();
        assert_eq!(warning_codes(&compiled), vec![DiagnosticCode::UnreachableCode]);
    }

    #[test]
    fn error_message_is_scoped_to_catch_clause() {
        let compiled = compile_steps(json!([
            {"kind": "try_catch", "body": [insert_contact()], "catches": [
                {"on": {"kind": "unique_violation"}, "steps": [
                    {"kind": "return_early", "payload": {"status": "duplicate", "message": var("error_message")}}
                ]}
            ]}
        ]))
        .unwrap();
        match &compiled.body[0] {
            CompiledStep::TryCatch { catches, .. } => {
                assert_eq!(compiled.symbol(catches[0].error_message).name, "error_message");
            }
            other => panic!("unexpected step {:?}", other),
        }

        let result = compile_steps(json!([
            {"kind": "try_catch", "body": [insert_contact()], "catches": [{"on": "default", "steps": []}]},
            {"kind": "return", "payload": {"message": var("error_message")}}
        ]));
        assert_eq!(error_codes(&result), vec![DiagnosticCode::UnknownVariable]);
    }

    #[test]
    fn switch_case_types_must_match_subject() {
        let result = compile_steps(json!([
            {"kind": "switch", "subject": var("new_score"), "cases": [
                {"values": [{"type": "text", "value": "high"}], "steps": []}
            ]}
        ]));
        assert_eq!(error_codes(&result), vec![DiagnosticCode::TypeMismatch]);
    }

    #[test]
    fn repeated_switch_value_is_unreachable() {
        let compiled = compile_steps(json!([
            {"kind": "switch", "subject": var("new_score"), "cases": [
                {"values": [{"type": "integer", "value": 1}], "steps": []},
                {"values": [{"type": "integer", "value": 2}, {"type": "integer", "value": 1}], "steps": []}
            ], "default": []}
        ]))
        .unwrap();
        assert_eq!(warning_codes(&compiled), vec![DiagnosticCode::UnreachableCode]);
    }

    #[test]
    fn validate_needs_boolean_and_is_not_a_return_shape() {
        let result = compile_steps(json!([
            {"kind": "validate", "condition": int(1), "failure_code": "bad"}
        ]));
        assert_eq!(error_codes(&result), vec![DiagnosticCode::TypeMismatch]);

        let compiled = compile_steps(json!([
            {"kind": "validate", "condition": bin("gt", var("new_score"), int(0)),
             "failure_code": "invalid_score", "message": "score must be positive"},
            {"kind": "return", "payload": {"fields": [{"key": "score", "value": var("new_score")}]}}
        ]))
        .unwrap();
        assert_eq!(compiled.return_shape.field_names(), vec!["score"]);
    }

    #[test]
    fn try_catch_terminates_only_if_every_path_returns() {
        let compiled = compile_steps(json!([
            {"kind": "try_catch",
             "body": [insert_contact(), {"kind": "return", "payload": {}}],
             "catches": [{"on": "default", "steps": [{"kind": "return", "payload": {"status": "failed"}}]}]},
            {"kind": "notify", "channel": "after"}
        ]))
        .unwrap();
        assert_eq!(warning_codes(&compiled), vec![DiagnosticCode::UnreachableCode]);
        assert!(compiled.body[0].terminates());
    }
}
