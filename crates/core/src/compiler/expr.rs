//! Expression typing.
//!
//! Every `Expr` is turned into a `TypedExpr`. Type errors are reported and
//! the offending node is typed `Dynamic`, so one mistake does not cascade
//! into a chain of follow-up diagnostics.

use super::Compiler;
use crate::ast::{BinaryOp, Expr, SemanticType, UnaryOp};
use crate::catalog::FunctionSignature;
use crate::compiled::{CompiledRelation, TypedExpr, TypedExprKind};
use crate::diagnostic::DiagnosticCode;
use crate::scope::SymbolKind;
use crate::types::ValueType;
use std::collections::BTreeSet;

/// Functions typed by the compiler itself and rendered natively by every
/// backend. Anything else goes through the function catalog.
pub const BUILTIN_FUNCTIONS: &[&str] = &[
    "upper",
    "lower",
    "trim",
    "length",
    "coalesce",
    "now",
    "current_date",
    "concat",
    "abs",
    "round",
    "gen_random_uuid",
    "jsonb_array_length",
];

pub fn is_builtin(name: &str) -> bool {
    BUILTIN_FUNCTIONS.contains(&name.to_ascii_lowercase().as_str())
}

/// Relations visible to column references; the first one is the primary
/// relation that unqualified columns refer to.
#[derive(Debug, Clone, Default)]
pub(crate) struct QueryContext {
    relations: Vec<CompiledRelation>,
    /// Bindings whose relation did not resolve; columns of these are not
    /// reported again.
    broken: BTreeSet<String>,
}

impl QueryContext {
    pub(crate) fn new(primary: CompiledRelation) -> Self {
        QueryContext {
            relations: vec![primary],
            broken: BTreeSet::new(),
        }
    }

    pub(crate) fn add(&mut self, relation: CompiledRelation) {
        self.relations.push(relation);
    }

    pub(crate) fn has_binding(&self, binding: &str) -> bool {
        self.relations.iter().any(|r| r.binding == binding)
    }

    pub(crate) fn mark_broken(&mut self, binding: &str) {
        self.broken.insert(binding.to_owned());
    }

    fn lookup(&self, binding: Option<&str>) -> Option<&CompiledRelation> {
        match binding {
            None => self.relations.first(),
            Some(name) => self.relations.iter().find(|r| r.binding == name),
        }
    }
}

fn op_name(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Add => "+",
        BinaryOp::Sub => "-",
        BinaryOp::Mul => "*",
        BinaryOp::Div => "/",
        BinaryOp::Mod => "%",
        BinaryOp::Eq => "=",
        BinaryOp::Ne => "<>",
        BinaryOp::Lt => "<",
        BinaryOp::Le => "<=",
        BinaryOp::Gt => ">",
        BinaryOp::Ge => ">=",
        BinaryOp::And => "and",
        BinaryOp::Or => "or",
        BinaryOp::Like => "like",
        BinaryOp::Concat => "||",
    }
}

/// Either side may be stored into the other.
pub(crate) fn comparable(a: &ValueType, b: &ValueType) -> bool {
    a.accepts(b) || b.accepts(a)
}

impl<'a> Compiler<'a> {
    pub(crate) fn compile_expr(&mut self, expr: &Expr, ctx: Option<&QueryContext>) -> TypedExpr {
        match expr {
            Expr::Literal { value } => TypedExpr::literal(value.clone()),
            Expr::Var { name } => self.compile_var(name),
            Expr::Field { relation, field } => {
                self.compile_column(relation.as_deref(), field, ctx)
            }
            Expr::Binary { op, left, right } => {
                let left = self.compile_expr(left, ctx);
                let right = self.compile_expr(right, ctx);
                let ty = self.binary_type(*op, &left.ty, &right.ty);
                TypedExpr::new(
                    TypedExprKind::Binary {
                        op: *op,
                        left: Box::new(left),
                        right: Box::new(right),
                    },
                    ty,
                )
            }
            Expr::Unary { op, operand } => {
                let operand = self.compile_expr(operand, ctx);
                let ty = self.unary_type(*op, &operand.ty);
                TypedExpr::new(
                    TypedExprKind::Unary {
                        op: *op,
                        operand: Box::new(operand),
                    },
                    ty,
                )
            }
            Expr::Call { function, args } => {
                let args: Vec<TypedExpr> =
                    args.iter().map(|a| self.compile_expr(a, ctx)).collect();
                let builtin = is_builtin(function);
                let (function, ty) = if builtin {
                    let name = function.to_ascii_lowercase();
                    let ty = self.builtin_type(&name, &args);
                    (name, ty)
                } else {
                    let ty = self.catalog_call_type(function, &args);
                    (function.clone(), ty)
                };
                TypedExpr::new(
                    TypedExprKind::Call {
                        function,
                        builtin,
                        args,
                    },
                    ty,
                )
            }
            Expr::Member { base, member } => {
                let base = self.compile_expr(base, ctx);
                let ty = self.member_type(&base.ty, member);
                TypedExpr::new(
                    TypedExprKind::Member {
                        base: Box::new(base),
                        member: member.clone(),
                    },
                    ty,
                )
            }
        }
    }

    /// Compile `expr` and require a boolean result.
    pub(crate) fn compile_condition(
        &mut self,
        expr: &Expr,
        ctx: Option<&QueryContext>,
        what: &str,
    ) -> TypedExpr {
        let cond = self.compile_expr(expr, ctx);
        if !cond.ty.is_boolean_like() {
            self.report(
                DiagnosticCode::TypeMismatch,
                format!("{} must be boolean, got {}", what, cond.ty),
            );
        }
        cond
    }

    fn compile_var(&mut self, name: &str) -> TypedExpr {
        let symbol = match self.scopes.resolve(name) {
            Ok(s) => s.clone(),
            Err(e) => {
                self.report_scope(e);
                return TypedExpr::invalid();
            }
        };
        if symbol.kind == SymbolKind::EntityField {
            self.uses_current_record = true;
        }
        TypedExpr::var(&symbol)
    }

    fn compile_column(
        &mut self,
        relation: Option<&str>,
        field: &str,
        ctx: Option<&QueryContext>,
    ) -> TypedExpr {
        let Some(ctx) = ctx else {
            self.report(
                DiagnosticCode::InvalidFieldReference,
                format!("column reference '{}' outside of a query", field),
            );
            return TypedExpr::invalid();
        };
        let Some(rel) = ctx.lookup(relation) else {
            if relation.is_some_and(|r| ctx.broken.contains(r)) {
                return TypedExpr::invalid();
            }
            self.report(
                DiagnosticCode::InvalidFieldReference,
                format!("unknown relation '{}'", relation.unwrap_or_default()),
            );
            return TypedExpr::invalid();
        };
        if ctx.broken.contains(&rel.binding) {
            return TypedExpr::invalid();
        }
        match rel.column(field) {
            Some(col) => TypedExpr::new(
                TypedExprKind::Column {
                    relation: rel.binding.clone(),
                    field: field.to_owned(),
                },
                col.ty.clone(),
            ),
            None => {
                let message = format!("relation '{}' has no column '{}'", rel.binding, field);
                self.report(DiagnosticCode::InvalidFieldReference, message);
                TypedExpr::invalid()
            }
        }
    }

    fn binary_type(&mut self, op: BinaryOp, l: &ValueType, r: &ValueType) -> ValueType {
        let ok = if op.is_arithmetic() {
            l.is_numeric_like() && r.is_numeric_like()
        } else if op.is_comparison() {
            comparable(l, r)
        } else if op.is_logical() {
            l.is_boolean_like() && r.is_boolean_like()
        } else if op == BinaryOp::Like {
            l.is_textual_like() && r.is_textual_like()
        } else {
            // concat accepts any scalar
            l.columns().is_none() && r.columns().is_none()
        };
        if !ok {
            self.report(
                DiagnosticCode::TypeMismatch,
                format!(
                    "operator '{}' cannot be applied to {} and {}",
                    op_name(op),
                    l,
                    r
                ),
            );
            return if op.is_arithmetic() {
                ValueType::Dynamic
            } else if op == BinaryOp::Concat {
                ValueType::text()
            } else {
                ValueType::boolean()
            };
        }
        if op.is_arithmetic() {
            l.unify(r).unwrap_or(ValueType::Dynamic)
        } else if op == BinaryOp::Concat {
            ValueType::text()
        } else {
            ValueType::boolean()
        }
    }

    fn unary_type(&mut self, op: UnaryOp, operand: &ValueType) -> ValueType {
        match op {
            UnaryOp::Not => {
                if !operand.is_boolean_like() {
                    self.report(
                        DiagnosticCode::TypeMismatch,
                        format!("'not' needs a boolean operand, got {}", operand),
                    );
                }
                ValueType::boolean()
            }
            UnaryOp::Neg => {
                if operand.is_numeric_like() {
                    operand.clone()
                } else {
                    self.report(
                        DiagnosticCode::TypeMismatch,
                        format!("cannot negate {}", operand),
                    );
                    ValueType::Dynamic
                }
            }
            UnaryOp::IsNull | UnaryOp::IsNotNull => ValueType::boolean(),
        }
    }

    fn member_type(&mut self, base: &ValueType, member: &str) -> ValueType {
        match base {
            ValueType::Row { columns } | ValueType::Cursor { columns } => {
                match columns.iter().find(|c| c.name == member) {
                    Some(col) => col.ty.clone(),
                    None => {
                        self.report(
                            DiagnosticCode::InvalidFieldReference,
                            format!("{} has no field '{}'", base, member),
                        );
                        ValueType::Dynamic
                    }
                }
            }
            ValueType::Scalar {
                ty: SemanticType::Json,
            }
            | ValueType::Dynamic
            | ValueType::Null => ValueType::Dynamic,
            other => {
                self.report(
                    DiagnosticCode::TypeMismatch,
                    format!("cannot access member '{}' of {}", member, other),
                );
                ValueType::Dynamic
            }
        }
    }

    // ──────────────────────────────────────────────
    // Function calls
    // ──────────────────────────────────────────────

    fn check_arity(&mut self, name: &str, got: usize, min: usize, max: Option<usize>) -> bool {
        let ok = got >= min && max.map_or(true, |m| got <= m);
        if !ok {
            let expected = match max {
                Some(m) if m == min => format!("{}", min),
                Some(m) => format!("{} to {}", min, m),
                None => format!("at least {}", min),
            };
            self.report(
                DiagnosticCode::TypeMismatch,
                format!(
                    "function '{}' takes {} argument(s), got {}",
                    name, expected, got
                ),
            );
        }
        ok
    }

    fn require_args(
        &mut self,
        name: &str,
        args: &[TypedExpr],
        what: &str,
        pred: fn(&ValueType) -> bool,
    ) {
        for arg in args {
            if !pred(&arg.ty) {
                self.report(
                    DiagnosticCode::TypeMismatch,
                    format!("function '{}' expects {} arguments, got {}", name, what, arg.ty),
                );
            }
        }
    }

    fn builtin_type(&mut self, name: &str, args: &[TypedExpr]) -> ValueType {
        let n = args.len();
        match name {
            "upper" | "lower" | "trim" => {
                self.check_arity(name, n, 1, Some(1));
                self.require_args(name, args, "text", ValueType::is_textual_like);
                ValueType::text()
            }
            "length" => {
                self.check_arity(name, n, 1, Some(1));
                self.require_args(name, args, "text", ValueType::is_textual_like);
                ValueType::integer()
            }
            "coalesce" => {
                if !self.check_arity(name, n, 1, None) {
                    return ValueType::Dynamic;
                }
                let mut ty = ValueType::Null;
                for arg in args {
                    match ty.unify(&arg.ty) {
                        Some(t) => ty = t,
                        None => {
                            self.report(
                                DiagnosticCode::TypeMismatch,
                                format!("coalesce mixes {} and {}", ty, arg.ty),
                            );
                            return ValueType::Dynamic;
                        }
                    }
                }
                ty
            }
            "now" => {
                self.check_arity(name, n, 0, Some(0));
                ValueType::scalar(SemanticType::Timestamp)
            }
            "current_date" => {
                self.check_arity(name, n, 0, Some(0));
                ValueType::scalar(SemanticType::Date)
            }
            "gen_random_uuid" => {
                self.check_arity(name, n, 0, Some(0));
                ValueType::uuid()
            }
            "concat" => ValueType::text(),
            "abs" => {
                self.check_arity(name, n, 1, Some(1));
                self.require_args(name, args, "numeric", ValueType::is_numeric_like);
                args.first().map(|a| a.ty.clone()).unwrap_or(ValueType::Dynamic)
            }
            "round" => {
                self.check_arity(name, n, 1, Some(2));
                self.require_args(name, args, "numeric", ValueType::is_numeric_like);
                ValueType::decimal()
            }
            "jsonb_array_length" => {
                self.check_arity(name, n, 1, Some(1));
                self.require_args(name, args, "json", |t| {
                    matches!(
                        t,
                        ValueType::Array { .. } | ValueType::Dynamic | ValueType::Null
                    ) || t.as_scalar() == Some(&SemanticType::Json)
                });
                ValueType::integer()
            }
            _ => ValueType::Dynamic,
        }
    }

    /// Positional call of a catalog function inside an expression.
    fn catalog_call_type(&mut self, name: &str, args: &[TypedExpr]) -> ValueType {
        let Some(sig) = self.lookup_function(name) else {
            return ValueType::Dynamic;
        };
        let required = sig.params.iter().filter(|p| p.required).count();
        if self.check_arity(name, args.len(), required, Some(sig.params.len())) {
            for (param, arg) in sig.params.iter().zip(args) {
                self.check_param(&sig, &param.name, param.ty.as_ref(), &arg.ty);
            }
        }
        return_type(&sig)
    }

    pub(crate) fn check_param(
        &mut self,
        sig: &FunctionSignature,
        param: &str,
        expected: Option<&SemanticType>,
        got: &ValueType,
    ) {
        if let Some(ty) = expected {
            let expected = ValueType::scalar(ty.clone());
            if !expected.accepts(got) {
                self.report(
                    DiagnosticCode::TypeMismatch,
                    format!(
                        "argument '{}' of '{}' expects {}, got {}",
                        param, sig.name, expected, got
                    ),
                );
            }
        }
    }
}

pub(crate) fn return_type(sig: &FunctionSignature) -> ValueType {
    sig.returns
        .clone()
        .map(ValueType::scalar)
        .unwrap_or(ValueType::Dynamic)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Literal;
    use crate::compiler::tests::{fixture_action, with_compiler};
    use serde_json::json;

    fn typed(expr: Expr) -> (TypedExpr, Vec<DiagnosticCode>) {
        let action = fixture_action(json!({"name": "sample"}));
        with_compiler(&action, |compiler| {
            let out = compiler.compile_expr(&expr, None);
            let codes = compiler.diagnostics.iter().map(|d| d.code).collect();
            (out, codes)
        })
    }

    #[test]
    fn arithmetic_widens_to_decimal() {
        let expr = Expr::binary(
            BinaryOp::Add,
            Expr::int(1),
            Expr::lit(Literal::Decimal(rust_decimal::Decimal::new(15, 1))),
        );
        let (t, codes) = typed(expr);
        assert!(codes.is_empty());
        assert_eq!(t.ty, ValueType::decimal());
    }

    #[test]
    fn text_plus_integer_is_a_mismatch() {
        let (t, codes) = typed(Expr::binary(BinaryOp::Add, Expr::text("a"), Expr::int(1)));
        assert_eq!(codes, vec![DiagnosticCode::TypeMismatch]);
        assert!(t.ty.is_dynamic());
    }

    #[test]
    fn entity_field_reads_mark_current_record() {
        let action = fixture_action(json!({"name": "sample"}));
        with_compiler(&action, |compiler| {
            let t = compiler.compile_expr(&Expr::var("email"), None);
            assert_eq!(t.ty, ValueType::scalar(SemanticType::Email));
            assert!(compiler.uses_current_record);
        });
    }

    #[test]
    fn builtin_arity_is_checked() {
        let (_, codes) = typed(Expr::call("upper", vec![]));
        assert_eq!(codes, vec![DiagnosticCode::TypeMismatch]);
        let (t, codes) = typed(Expr::call("UPPER", vec![Expr::text("x")]));
        assert!(codes.is_empty());
        assert_eq!(t.ty, ValueType::text());
    }

    #[test]
    fn column_outside_query_is_invalid() {
        let (_, codes) = typed(Expr::column("email"));
        assert_eq!(codes, vec![DiagnosticCode::InvalidFieldReference]);
    }

    #[test]
    fn coalesce_unifies_arguments() {
        let (t, codes) = typed(Expr::call("coalesce", vec![Expr::null(), Expr::int(0)]));
        assert!(codes.is_empty());
        assert_eq!(t.ty, ValueType::integer());
    }

    #[test]
    fn member_of_unknown_row_field() {
        let action = fixture_action(json!({
            "name": "sample",
            "steps": []
        }));
        with_compiler(&action, |compiler| {
            let row = ValueType::Row {
                columns: vec![crate::types::Column::new("id", ValueType::uuid())],
            };
            let ty = compiler.member_type(&row, "missing");
            assert!(ty.is_dynamic());
            assert_eq!(
                compiler.diagnostics.iter().next().map(|d| d.code),
                Some(DiagnosticCode::InvalidFieldReference)
            );
        });
    }
}
