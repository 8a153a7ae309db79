//! Query-family steps: relation resolution, CTEs and the steps that read
//! relations (`Query`, `ForQuery`, `Cursor`, `ForeachCursor`, `Aggregate`,
//! `Transform`).

use super::expr::QueryContext;
use super::{Compiler, PendingCte};
use crate::ast::{AggregateFn, EntitySpec, Expr, IntoBinding, QuerySpec, RelationRef, Step};
use crate::compiled::{
    CompiledCte, CompiledJoin, CompiledOrder, CompiledQuery, CompiledRelation, CompiledSelect,
    CompiledStep, EntityTarget, QueryInto, RelationSource, TypedExpr, TypedExprKind,
};
use crate::diagnostic::DiagnosticCode;
use crate::scope::{BindingMode, SymbolId, SymbolKind};
use crate::types::{Column, ValueType};

/// The CTE whose recursive term is being compiled.
struct Recursion<'r> {
    name: &'r str,
    columns: &'r [Column],
}

/// Row shape of an entity as a relation: `id` followed by the fields in
/// declaration order.
pub fn entity_columns(entity: &EntitySpec) -> Vec<Column> {
    let mut columns = Vec::with_capacity(entity.fields.len() + 1);
    columns.push(Column::new("id", ValueType::uuid()));
    columns.extend(
        entity
            .fields
            .iter()
            .map(|f| Column::new(f.name.clone(), ValueType::scalar(f.ty.clone()))),
    );
    columns
}

fn output_name(expr: &Expr, position: usize) -> String {
    match expr {
        Expr::Field { field, .. } => field.clone(),
        Expr::Var { name } => name.clone(),
        Expr::Member { member, .. } => member.clone(),
        Expr::Call { function, .. } => function.to_ascii_lowercase(),
        _ => format!("column{}", position + 1),
    }
}

impl<'a> Compiler<'a> {
    pub(crate) fn collect_cte_names(&mut self, steps: &[Step]) {
        for step in steps {
            if let Step::Cte { name, .. } = step {
                self.cte_names.insert(name.clone());
            }
            for block in step.blocks() {
                self.collect_cte_names(block);
            }
        }
    }

    pub(crate) fn take_pending_ctes(&mut self) -> Vec<CompiledCte> {
        std::mem::take(&mut self.pending_ctes)
            .into_iter()
            .map(|p| p.cte)
            .collect()
    }

    fn resolve_relation(
        &mut self,
        relation: &RelationRef,
        recursion: Option<&Recursion<'_>>,
    ) -> Option<CompiledRelation> {
        let binding = relation.binding_name().to_owned();
        let cte = |name: &str, columns: Vec<Column>| CompiledRelation {
            source: RelationSource::Cte {
                name: name.to_owned(),
            },
            binding: binding.clone(),
            columns,
        };
        if let Some(rec) = recursion {
            if relation.name == rec.name {
                return Some(cte(rec.name, rec.columns.to_vec()));
            }
            if self.cte_names.contains(&relation.name) {
                self.report(
                    DiagnosticCode::UnsupportedRecursion,
                    format!(
                        "recursive term of CTE '{}' references CTE '{}'; only self-reference is supported",
                        rec.name, relation.name
                    ),
                );
                return None;
            }
        }
        if let Some(pending) = self
            .pending_ctes
            .iter()
            .find(|p| p.cte.name == relation.name)
        {
            return Some(cte(&relation.name, pending.cte.columns.clone()));
        }
        if self.cte_names.contains(&relation.name) {
            self.report(
                DiagnosticCode::InvalidFieldReference,
                format!(
                    "CTE '{}' is not visible here; a CTE is only visible to the query that follows it",
                    relation.name
                ),
            );
            return None;
        }
        match self.catalog.entities.get(&relation.name) {
            Some(entity) => Some(CompiledRelation {
                source: RelationSource::Entity(EntityTarget::from(entity)),
                binding,
                columns: entity_columns(entity),
            }),
            None => {
                self.report(
                    DiagnosticCode::InvalidFieldReference,
                    format!("unknown relation '{}'", relation.name),
                );
                None
            }
        }
    }

    /// Resolve a relation, falling back to an empty placeholder that is
    /// marked broken in `ctx` so its columns are not reported again.
    fn relation_or_placeholder(
        &mut self,
        relation: &RelationRef,
        recursion: Option<&Recursion<'_>>,
    ) -> (CompiledRelation, bool) {
        match self.resolve_relation(relation, recursion) {
            Some(r) => (r, true),
            None => (
                CompiledRelation {
                    source: RelationSource::Cte {
                        name: relation.name.clone(),
                    },
                    binding: relation.binding_name().to_owned(),
                    columns: Vec::new(),
                },
                false,
            ),
        }
    }

    fn compile_query_in(
        &mut self,
        query: &QuerySpec,
        recursion: Option<&Recursion<'_>>,
    ) -> (CompiledQuery, QueryContext) {
        let (from, ok) = self.relation_or_placeholder(&query.from, recursion);
        let mut ctx = QueryContext::new(from.clone());
        if !ok {
            ctx.mark_broken(&from.binding);
        }

        let mut joins = Vec::with_capacity(query.joins.len());
        for join in &query.joins {
            let (relation, ok) = self.relation_or_placeholder(&join.relation, recursion);
            if ctx.has_binding(&relation.binding) {
                self.report(
                    DiagnosticCode::DuplicateDeclaration,
                    format!("relation '{}' is bound twice in one query", relation.binding),
                );
            }
            if !ok {
                ctx.mark_broken(&relation.binding);
            }
            ctx.add(relation.clone());
            let on = self.compile_condition(&join.on, Some(&ctx), "join condition");
            joins.push(CompiledJoin {
                kind: join.kind,
                relation,
                on,
            });
        }

        let select = if query.select.is_empty() {
            from.columns
                .iter()
                .map(|c| CompiledSelect {
                    expr: TypedExpr::new(
                        TypedExprKind::Column {
                            relation: from.binding.clone(),
                            field: c.name.clone(),
                        },
                        c.ty.clone(),
                    ),
                    name: c.name.clone(),
                })
                .collect()
        } else {
            query
                .select
                .iter()
                .enumerate()
                .map(|(i, item)| CompiledSelect {
                    expr: self.compile_expr(&item.expr, Some(&ctx)),
                    name: item
                        .alias
                        .clone()
                        .unwrap_or_else(|| output_name(&item.expr, i)),
                })
                .collect()
        };

        let filter = query
            .filter
            .as_ref()
            .map(|f| self.compile_condition(f, Some(&ctx), "query filter"));
        let order_by = query
            .order_by
            .iter()
            .map(|o| CompiledOrder {
                expr: self.compile_expr(&o.expr, Some(&ctx)),
                descending: o.descending,
            })
            .collect();

        let compiled = CompiledQuery {
            ctes: Vec::new(),
            select,
            from,
            joins,
            filter,
            order_by,
            limit: query.limit,
        };
        (compiled, ctx)
    }

    /// Compile a query that consumes the pending CTEs of the current block.
    fn compile_consuming_query(&mut self, query: &QuerySpec) -> (CompiledQuery, QueryContext) {
        let (mut compiled, ctx) = self.compile_query_in(query, None);
        compiled.ctes = self.take_pending_ctes();
        (compiled, ctx)
    }

    // ──────────────────────────────────────────────
    // Steps
    // ──────────────────────────────────────────────

    pub(crate) fn compile_cte(
        &mut self,
        name: &str,
        recursive: bool,
        columns: &[String],
        base: &QuerySpec,
        recursive_term: Option<&QuerySpec>,
    ) {
        if self.pending_ctes.iter().any(|p| p.cte.name == name) {
            self.report(
                DiagnosticCode::DuplicateDeclaration,
                format!("CTE '{}' is already defined for the following query", name),
            );
        }
        let (base, _) = self.compile_query_in(base, None);
        let mut shape = base.columns();
        if !columns.is_empty() {
            if columns.len() == shape.len() {
                for (col, name) in shape.iter_mut().zip(columns) {
                    col.name = name.clone();
                }
            } else {
                self.report(
                    DiagnosticCode::TypeMismatch,
                    format!(
                        "CTE '{}' names {} column(s) but its base term selects {}",
                        name,
                        columns.len(),
                        shape.len()
                    ),
                );
            }
        }

        let recursive_term = match recursive_term {
            None => None,
            Some(_) if !recursive => {
                self.report(
                    DiagnosticCode::UnsupportedRecursion,
                    format!("CTE '{}' has a recursive term but is not marked recursive", name),
                );
                None
            }
            Some(term) => {
                let depth = self.scopes.depth();
                self.scopes.push();
                self.declare(
                    name,
                    ValueType::Row {
                        columns: shape.clone(),
                    },
                    BindingMode::readonly(SymbolKind::Relation),
                );
                let recursion = Recursion {
                    name,
                    columns: &shape,
                };
                let (term, _) = self.compile_query_in(term, Some(&recursion));
                self.scopes.truncate(depth);
                self.check_recursive_shape(name, &shape, &term);
                Some(term)
            }
        };

        let path = self.path.clone();
        self.pending_ctes.push(PendingCte {
            cte: CompiledCte {
                name: name.to_owned(),
                recursive,
                columns: shape,
                base,
                recursive_term,
            },
            path,
        });
    }

    fn check_recursive_shape(&mut self, name: &str, shape: &[Column], term: &CompiledQuery) {
        if term.select.len() != shape.len() {
            self.report(
                DiagnosticCode::TypeMismatch,
                format!(
                    "recursive term of CTE '{}' selects {} column(s), base term selects {}",
                    name,
                    term.select.len(),
                    shape.len()
                ),
            );
            return;
        }
        for (col, item) in shape.iter().zip(&term.select) {
            if col.ty.unify(&item.expr.ty).is_none() {
                self.report(
                    DiagnosticCode::TypeMismatch,
                    format!(
                        "column '{}' of CTE '{}' is {} in the base term but {} in the recursive term",
                        col.name, name, col.ty, item.expr.ty
                    ),
                );
            }
        }
    }

    pub(crate) fn compile_query_step(
        &mut self,
        into: &[IntoBinding],
        query: &QuerySpec,
        single: bool,
    ) -> CompiledStep {
        let (compiled, _) = self.compile_consuming_query(query);
        let columns = compiled.columns();
        let whole_row = into.len() == 1 && (query.select.is_empty() || columns.len() != 1);
        let into = if whole_row {
            let binding = &into[0];
            let symbol = self.declare(
                &binding.name,
                ValueType::Row { columns },
                BindingMode {
                    mutable: true,
                    nullable: binding.nullable,
                    kind: SymbolKind::QueryBinding,
                },
            );
            QueryInto::Row { symbol }
        } else {
            if into.len() != columns.len() {
                self.report(
                    DiagnosticCode::TypeMismatch,
                    format!(
                        "query selects {} column(s) into {} binding(s)",
                        columns.len(),
                        into.len()
                    ),
                );
            }
            let symbols = into
                .iter()
                .enumerate()
                .map(|(i, binding)| {
                    let ty = columns
                        .get(i)
                        .map(|c| c.ty.clone())
                        .unwrap_or(ValueType::Dynamic);
                    self.declare(
                        &binding.name,
                        ty,
                        BindingMode {
                            mutable: true,
                            nullable: binding.nullable,
                            kind: SymbolKind::QueryBinding,
                        },
                    )
                })
                .collect();
            QueryInto::Columns { symbols }
        };
        CompiledStep::Query {
            into,
            query: compiled,
            single,
        }
    }

    pub(crate) fn compile_for_query(
        &mut self,
        iterator: &str,
        query: &QuerySpec,
        body: &[Step],
    ) -> CompiledStep {
        let (compiled, _) = self.compile_consuming_query(query);
        let row = ValueType::Row {
            columns: compiled.columns(),
        };
        let (iterator, block) = self.nested(0, body, |c| {
            c.declare(iterator, row, BindingMode::readonly(SymbolKind::Iterator))
        });
        CompiledStep::ForQuery {
            iterator,
            query: compiled,
            body: block.steps,
        }
    }

    pub(crate) fn compile_cursor(&mut self, name: &str, query: &QuerySpec) -> CompiledStep {
        let (compiled, _) = self.compile_consuming_query(query);
        let symbol = self.declare(
            name,
            ValueType::Cursor {
                columns: compiled.columns(),
            },
            BindingMode::readonly(SymbolKind::Cursor),
        );
        CompiledStep::Cursor {
            symbol,
            query: compiled,
        }
    }

    pub(crate) fn compile_foreach_cursor(
        &mut self,
        cursor: &str,
        iterator: &str,
        body: &[Step],
    ) -> CompiledStep {
        let resolved = self.scopes.resolve(cursor).map(|s| (s.id, s.ty.clone()));
        let (cursor, row) = match resolved {
            Ok((id, ValueType::Cursor { columns })) => (id, ValueType::Row { columns }),
            Ok((id, other)) => {
                self.report(
                    DiagnosticCode::TypeMismatch,
                    format!("'{}' is {}, not a cursor", cursor, other),
                );
                (id, ValueType::Dynamic)
            }
            Err(err) => {
                self.report_scope(err);
                (SymbolId(0), ValueType::Dynamic)
            }
        };
        let (iterator, block) = self.nested(0, body, |c| {
            c.declare(iterator, row, BindingMode::readonly(SymbolKind::Iterator))
        });
        CompiledStep::ForeachCursor {
            cursor,
            iterator,
            body: block.steps,
        }
    }

    pub(crate) fn compile_aggregate(
        &mut self,
        into: &str,
        function: AggregateFn,
        source: &str,
        field: Option<&str>,
        filter: Option<&Expr>,
    ) -> CompiledStep {
        let mut spec = QuerySpec::from(source);
        spec.filter = filter.cloned();
        let (compiled, ctx) = self.compile_consuming_query(&spec);
        let argument = field.map(|f| self.compile_expr(&Expr::column(f), Some(&ctx)));
        let ty = self.aggregate_type(function, argument.as_ref().map(|a| &a.ty));
        let into = self.declare(
            into,
            ty,
            BindingMode {
                mutable: true,
                nullable: function != AggregateFn::Count,
                kind: SymbolKind::QueryBinding,
            },
        );
        CompiledStep::Aggregate {
            into,
            function,
            argument,
            query: compiled,
        }
    }

    fn aggregate_type(&mut self, function: AggregateFn, arg: Option<&ValueType>) -> ValueType {
        let numeric = |c: &mut Self, ty: &ValueType| {
            if !ty.is_numeric_like() {
                c.report(
                    DiagnosticCode::TypeMismatch,
                    format!("{:?} needs a numeric field, got {}", function, ty),
                );
            }
        };
        match (function, arg) {
            (AggregateFn::Count, _) => ValueType::integer(),
            (AggregateFn::JsonAgg, _) => ValueType::json(),
            (AggregateFn::Sum, Some(ty)) => {
                numeric(self, ty);
                ty.clone()
            }
            (AggregateFn::Avg, Some(ty)) => {
                numeric(self, ty);
                ValueType::decimal()
            }
            (AggregateFn::Min | AggregateFn::Max, Some(ty)) => ty.clone(),
            (AggregateFn::ArrayAgg, Some(ty)) => ValueType::array(ty.clone()),
            (_, None) => {
                self.report(
                    DiagnosticCode::TypeMismatch,
                    format!("{:?} aggregate needs a field", function),
                );
                ValueType::Dynamic
            }
        }
    }

    pub(crate) fn compile_transform(
        &mut self,
        into: &str,
        source: &str,
        filter: Option<&Expr>,
        mapping: &[crate::ast::Entry],
    ) -> CompiledStep {
        let mut spec = QuerySpec::from(source);
        spec.filter = filter.cloned();
        let (compiled, ctx) = self.compile_consuming_query(&spec);
        let mapping = self.compile_entries(mapping, Some(&ctx));
        let into = self.declare(into, ValueType::json(), BindingMode::local(true));
        CompiledStep::Transform {
            into,
            query: compiled,
            mapping,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::compiled::{CompiledStep, QueryInto};
    use crate::compiler::tests::{bin, col, compile_steps, error_codes, int, text, var, warning_codes};
    use crate::diagnostic::DiagnosticCode;
    use crate::types::ValueType;
    use serde_json::json;

    fn cte(name: &str, from: &str, recursive_from: Option<&str>) -> serde_json::Value {
        let mut step = json!({
            "kind": "cte",
            "name": name,
            "base": {"from": {"name": from}, "select": [{"expr": col("id")}, {"expr": col("parent")}]}
        });
        if let Some(r) = recursive_from {
            step["recursive"] = json!(true);
            step["recursive_term"] = json!({
                "from": {"name": "Company", "alias": "c"},
                "select": [{"expr": {"expr": "field", "relation": "c", "field": "id"}},
                           {"expr": {"expr": "field", "relation": "c", "field": "parent"}}],
                "joins": [{"relation": {"name": r, "alias": "t"},
                           "on": bin("eq", json!({"expr": "field", "relation": "c", "field": "parent"}),
                                           json!({"expr": "field", "relation": "t", "field": "id"}))}]
            });
        }
        step
    }

    #[test]
    fn self_recursive_cte_is_accepted() {
        let compiled = compile_steps(json!([
            cte("tree", "Company", Some("tree")),
            {"kind": "aggregate", "into": "n", "function": "count", "source": "tree"},
            {"kind": "return", "payload": {"fields": [{"key": "n", "value": var("n")}]}}
        ]))
        .unwrap();
        assert!(compiled.diagnostics.is_empty());
        match &compiled.body[0] {
            CompiledStep::Aggregate { query, .. } => {
                assert_eq!(query.ctes.len(), 1);
                assert!(query.has_recursive_cte());
            }
            other => panic!("unexpected step {:?}", other),
        }
    }

    #[test]
    fn recursive_term_referencing_other_cte_is_rejected() {
        let result = compile_steps(json!([
            cte("roots", "Company", None),
            cte("tree", "Company", Some("roots")),
            {"kind": "aggregate", "into": "n", "function": "count", "source": "tree"}
        ]));
        assert!(error_codes(&result).contains(&DiagnosticCode::UnsupportedRecursion));
    }

    #[test]
    fn unused_cte_is_a_warning() {
        let compiled = compile_steps(json!([cte("roots", "Company", None)])).unwrap();
        assert_eq!(warning_codes(&compiled), vec![DiagnosticCode::UnusedCte]);
    }

    #[test]
    fn cte_is_consumed_by_one_query_only() {
        let result = compile_steps(json!([
            cte("roots", "Company", None),
            {"kind": "query", "into": [{"name": "a"}], "query": {"from": {"name": "roots"}}},
            {"kind": "query", "into": [{"name": "b"}], "query": {"from": {"name": "roots"}}}
        ]));
        assert_eq!(error_codes(&result), vec![DiagnosticCode::InvalidFieldReference]);
    }

    #[test]
    fn query_into_row_and_columns() {
        let compiled = compile_steps(json!([
            {"kind": "query", "into": [{"name": "c"}], "single": true,
             "query": {"from": {"name": "Contact"}, "filter": bin("eq", col("score"), int(1))}},
            {"kind": "query", "into": [{"name": "e"}, {"name": "s"}],
             "query": {"from": {"name": "Contact"}, "select": [{"expr": col("email")}, {"expr": col("score")}]}},
            {"kind": "return", "payload": {"fields": [
                {"key": "email", "value": {"expr": "member", "base": var("c"), "member": "email"}},
                {"key": "score", "value": var("s")}
            ]}}
        ]))
        .unwrap();
        match &compiled.body[0] {
            CompiledStep::Query { into: QueryInto::Row { symbol }, single, .. } => {
                assert!(single);
                let cols = compiled.symbol(*symbol).ty.columns().unwrap();
                assert_eq!(cols[0].name, "id");
                assert_eq!(cols.len(), 5);
            }
            other => panic!("unexpected step {:?}", other),
        }
        assert_eq!(compiled.return_shape.fields[1].ty, ValueType::integer());
    }

    #[test]
    fn unknown_columns_and_relations() {
        let result = compile_steps(json!([
            {"kind": "query", "into": [{"name": "a"}],
             "query": {"from": {"name": "Contact"}, "select": [{"expr": col("nickname")}]}},
            {"kind": "query", "into": [{"name": "b"}],
             "query": {"from": {"name": "Ghost"}, "filter": bin("eq", col("x"), text("y"))}}
        ]));
        assert_eq!(
            error_codes(&result),
            vec![
                DiagnosticCode::InvalidFieldReference,
                DiagnosticCode::InvalidFieldReference
            ]
        );
    }

    #[test]
    fn sum_of_text_is_a_mismatch() {
        let result = compile_steps(json!([
            {"kind": "aggregate", "into": "total", "function": "sum", "source": "Contact", "field": "email"}
        ]));
        assert_eq!(error_codes(&result), vec![DiagnosticCode::TypeMismatch]);
    }

    #[test]
    fn foreach_cursor_binds_rows() {
        let compiled = compile_steps(json!([
            {"kind": "cursor", "name": "leads", "query": {"from": {"name": "Contact"}}},
            {"kind": "declare", "name": "total", "init": int(0)},
            {"kind": "foreach_cursor", "cursor": "leads", "iterator": "l", "body": [
                {"kind": "assign", "target": "total",
                 "value": bin("add", var("total"), json!({"expr": "member", "base": var("l"), "member": "score"}))}
            ]}
        ]))
        .unwrap();
        assert!(compiled.diagnostics.is_empty());
    }
}
