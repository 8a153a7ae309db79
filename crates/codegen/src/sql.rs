//! SQL rendering of compiled expressions, queries and mutations.
//!
//! Shared by every emitter whose generated code runs SQL: PL/pgSQL embeds
//! the statements directly, the TypeScript emitter sends them with
//! positional parameters. How a variable appears inside a statement is the
//! [`Binder`]'s decision.

use crate::error::EmissionError;
use crate::naming::{entity_column, field_column, ident, qualified, table_name, to_snake};
use crate::profile::TypeMap;
use specql_core::ast::{AggregateFn, BinaryOp, JoinKind, Literal, SemanticType, UnaryOp};
use specql_core::compiled::{
    CompiledAction, CompiledCte, CompiledEntry, CompiledFieldValue, CompiledQuery,
    CompiledRelation, EntityTarget, MutationFilter, RelationSource, TypedExpr, TypedExprKind,
};
use specql_core::scope::{Symbol, SymbolId, SymbolKind};
use specql_core::types::ValueType;

/// Decides how variables of the action appear inside SQL text.
pub trait Binder {
    fn var(&mut self, symbol: &Symbol) -> Result<String, EmissionError>;
    /// A field of a row-typed variable.
    fn var_member(&mut self, symbol: &Symbol, member: &str) -> Result<String, EmissionError>;
    /// The id of the record the action runs on.
    fn record_id(&mut self) -> String;
}

/// What a `SELECT` produces.
#[derive(Debug, Clone, Copy)]
pub enum Projection<'a> {
    /// The query's own select list.
    Columns,
    Aggregate {
        function: AggregateFn,
        argument: Option<&'a TypedExpr>,
    },
    /// One json object per row, collected into a json array.
    Mapping(&'a [CompiledEntry]),
}

/// `RETURNING` handling of inserts.
#[derive(Debug, Clone, Copy)]
pub enum Returning<'a> {
    Nothing,
    Id,
    IdInto(&'a str),
}

#[derive(Debug, Clone)]
struct RelationScope {
    binding: String,
    entity: bool,
}

pub fn literal(value: &Literal) -> String {
    match value {
        Literal::Null => "NULL".to_owned(),
        Literal::Bool(true) => "TRUE".to_owned(),
        Literal::Bool(false) => "FALSE".to_owned(),
        Literal::Integer(n) => n.to_string(),
        Literal::Decimal(d) => d.to_string(),
        Literal::Text(s) => quote(s),
    }
}

pub fn quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

pub fn binary_operator(op: BinaryOp) -> &'static str {
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
        BinaryOp::And => "AND",
        BinaryOp::Or => "OR",
        BinaryOp::Like => "LIKE",
        BinaryOp::Concat => "||",
    }
}

fn binding_ident(binding: &str) -> String {
    ident(&to_snake(binding))
}

pub struct SqlRenderer<'a> {
    compiled: &'a CompiledAction,
    types: &'a TypeMap,
    scopes: Vec<Vec<RelationScope>>,
}

impl<'a> SqlRenderer<'a> {
    pub fn new(compiled: &'a CompiledAction, types: &'a TypeMap) -> Self {
        SqlRenderer {
            compiled,
            types,
            scopes: Vec::new(),
        }
    }

    pub fn invalid(&self, reason: impl Into<String>) -> EmissionError {
        EmissionError::InvalidCompiledAction {
            entity: self.compiled.entity.name.clone(),
            action: self.compiled.action.clone(),
            reason: reason.into(),
        }
    }

    pub fn symbol(&self, id: SymbolId) -> Result<&'a Symbol, EmissionError> {
        let compiled: &'a CompiledAction = self.compiled;
        compiled
            .symbols
            .iter()
            .nth(id.index())
            .ok_or_else(|| self.invalid(format!("dangling symbol id {}", id.0)))
    }

    // ──────────────────────────────────────────────
    // Types
    // ──────────────────────────────────────────────

    pub fn scalar_type(&self, ty: &SemanticType) -> Result<String, EmissionError> {
        self.types
            .get(ty)
            .map(str::to_owned)
            .ok_or_else(|| EmissionError::UnsupportedType {
                profile: "sql".to_owned(),
                ty: ty.key().to_owned(),
            })
    }

    fn dynamic_type(&self) -> Result<String, EmissionError> {
        self.types
            .get_key("dynamic")
            .or_else(|| self.types.get(&SemanticType::Json))
            .map(str::to_owned)
            .ok_or_else(|| EmissionError::UnsupportedType {
                profile: "sql".to_owned(),
                ty: "dynamic".to_owned(),
            })
    }

    /// Native type of a variable holding `ty`.
    pub fn value_type(&self, ty: &ValueType) -> Result<String, EmissionError> {
        match ty {
            ValueType::Scalar { ty } => self.scalar_type(ty),
            ValueType::Row { .. } => Ok("RECORD".to_owned()),
            ValueType::Cursor { .. } => Ok("REFCURSOR".to_owned()),
            ValueType::Array { element } => Ok(format!("{}[]", self.value_type(element)?)),
            ValueType::Null | ValueType::Dynamic => self.dynamic_type(),
        }
    }

    // ──────────────────────────────────────────────
    // Expressions
    // ──────────────────────────────────────────────

    pub fn expr(&mut self, e: &TypedExpr, b: &mut dyn Binder) -> Result<String, EmissionError> {
        match &e.kind {
            TypedExprKind::Literal { value } => Ok(literal(value)),
            TypedExprKind::Var { symbol } => self.var(*symbol, b),
            TypedExprKind::Column { relation, field } => self.column(relation, field, &e.ty),
            TypedExprKind::Binary { op, left, right } => {
                let l = self.expr(left, b)?;
                let r = self.expr(right, b)?;
                Ok(format!("({} {} {})", l, binary_operator(*op), r))
            }
            TypedExprKind::Unary { op, operand } => {
                let inner = self.expr(operand, b)?;
                Ok(match op {
                    UnaryOp::Not => format!("(NOT {})", inner),
                    UnaryOp::Neg => format!("(-{})", inner),
                    UnaryOp::IsNull => format!("({} IS NULL)", inner),
                    UnaryOp::IsNotNull => format!("({} IS NOT NULL)", inner),
                })
            }
            TypedExprKind::Call {
                function,
                builtin,
                args,
            } => self.call(function, *builtin, args, b),
            TypedExprKind::Member { base, member } => self.member(base, member, b),
        }
    }

    fn var(&mut self, id: SymbolId, b: &mut dyn Binder) -> Result<String, EmissionError> {
        let symbol = self.symbol(id)?;
        if symbol.kind == SymbolKind::EntityField {
            return Ok(self.current_field(symbol, b));
        }
        b.var(symbol)
    }

    /// A field of the current record, read fresh at this point.
    fn current_field(&self, symbol: &Symbol, b: &mut dyn Binder) -> String {
        format!(
            "(SELECT r.{} FROM {} AS r WHERE r.id = {})",
            entity_column(&symbol.name, &symbol.ty),
            table_name(&self.compiled.entity),
            b.record_id()
        )
    }

    fn column(
        &self,
        relation: &str,
        field: &str,
        ty: &ValueType,
    ) -> Result<String, EmissionError> {
        let scope = self
            .scopes
            .iter()
            .rev()
            .flat_map(|frame| frame.iter())
            .find(|r| r.binding == relation)
            .ok_or_else(|| self.invalid(format!("column {}.{} outside its query", relation, field)))?;
        let column = if scope.entity {
            entity_column(field, ty)
        } else {
            ident(field)
        };
        Ok(format!("{}.{}", binding_ident(&scope.binding), column))
    }

    fn call(
        &mut self,
        function: &str,
        builtin: bool,
        args: &[TypedExpr],
        b: &mut dyn Binder,
    ) -> Result<String, EmissionError> {
        let mut rendered = Vec::with_capacity(args.len());
        for arg in args {
            let text = self.expr(arg, b)?;
            if builtin && function == "jsonb_array_length" && matches!(arg.ty, ValueType::Array { .. })
            {
                rendered.push(format!("to_jsonb({})", text));
            } else {
                rendered.push(text);
            }
        }
        if builtin && function == "current_date" {
            return Ok("CURRENT_DATE".to_owned());
        }
        let name = if builtin {
            function.to_owned()
        } else {
            qualified(function)
        };
        Ok(format!("{}({})", name, rendered.join(", ")))
    }

    fn member(
        &mut self,
        base: &TypedExpr,
        member: &str,
        b: &mut dyn Binder,
    ) -> Result<String, EmissionError> {
        let row_like = base.ty.columns().is_some();
        if let (TypedExprKind::Var { symbol }, true) = (&base.kind, row_like) {
            let symbol = self.symbol(*symbol)?;
            return b.var_member(symbol, member);
        }
        let inner = self.expr(base, b)?;
        if row_like {
            Ok(format!("({}).{}", inner, ident(member)))
        } else {
            Ok(format!("({} ->> {})", inner, quote(member)))
        }
    }

    /// `jsonb_build_object(...)`, or an empty object literal.
    pub fn json_object(
        &mut self,
        entries: &[CompiledEntry],
        b: &mut dyn Binder,
    ) -> Result<String, EmissionError> {
        if entries.is_empty() {
            return Ok("'{}'::jsonb".to_owned());
        }
        let mut parts = Vec::with_capacity(entries.len() * 2);
        for entry in entries {
            parts.push(quote(&entry.key));
            parts.push(self.expr(&entry.value, b)?);
        }
        Ok(format!("jsonb_build_object({})", parts.join(", ")))
    }

    pub fn array(
        &mut self,
        elements: &[TypedExpr],
        ty: &ValueType,
        b: &mut dyn Binder,
    ) -> Result<String, EmissionError> {
        let mut parts = Vec::with_capacity(elements.len());
        for e in elements {
            parts.push(self.expr(e, b)?);
        }
        Ok(format!("ARRAY[{}]::{}", parts.join(", "), self.value_type(ty)?))
    }

    // ──────────────────────────────────────────────
    // Queries
    // ──────────────────────────────────────────────

    fn relation(&self, relation: &CompiledRelation) -> String {
        let binding = binding_ident(&relation.binding);
        match &relation.source {
            RelationSource::Entity(target) => format!("{} AS {}", table_name(target), binding),
            RelationSource::Cte { name } if ident(name) == binding => binding,
            RelationSource::Cte { name } => format!("{} AS {}", ident(name), binding),
        }
    }

    fn scope_of(relation: &CompiledRelation) -> RelationScope {
        RelationScope {
            binding: relation.binding.clone(),
            entity: matches!(relation.source, RelationSource::Entity(_)),
        }
    }

    fn cte(&mut self, cte: &CompiledCte, b: &mut dyn Binder) -> Result<String, EmissionError> {
        let columns: Vec<String> = cte.columns.iter().map(|c| ident(&c.name)).collect();
        let mut body = self.select(&cte.base, Projection::Columns, None, b)?;
        if let Some(term) = &cte.recursive_term {
            body.push_str("\nUNION ALL\n");
            body.push_str(&self.select(term, Projection::Columns, None, b)?);
        }
        Ok(format!(
            "{}({}) AS (\n{}\n)",
            ident(&cte.name),
            columns.join(", "),
            indent_block(&body)
        ))
    }

    fn select_list(
        &mut self,
        q: &CompiledQuery,
        projection: Projection<'_>,
        b: &mut dyn Binder,
    ) -> Result<String, EmissionError> {
        match projection {
            Projection::Columns => {
                let mut items = Vec::with_capacity(q.select.len());
                for item in &q.select {
                    let text = self.expr(&item.expr, b)?;
                    let alias = ident(&item.name);
                    let bare = match &item.expr.kind {
                        TypedExprKind::Column { relation, .. } => {
                            text == format!("{}.{}", binding_ident(relation), alias)
                        }
                        _ => false,
                    };
                    if bare {
                        items.push(text);
                    } else {
                        items.push(format!("{} AS {}", text, alias));
                    }
                }
                Ok(items.join(", "))
            }
            Projection::Aggregate { function, argument } => {
                let arg = match argument {
                    Some(a) => Some(self.expr(a, b)?),
                    None => None,
                };
                let text = match (function, arg) {
                    (AggregateFn::Count, None) => "count(*)".to_owned(),
                    (AggregateFn::Count, Some(a)) => format!("count({})", a),
                    (AggregateFn::JsonAgg, None) => {
                        let row = self.row_object(&q.from)?;
                        format!("jsonb_agg({})", row)
                    }
                    (AggregateFn::JsonAgg, Some(a)) => format!("jsonb_agg({})", a),
                    (AggregateFn::Sum, Some(a)) => format!("sum({})", a),
                    (AggregateFn::Avg, Some(a)) => format!("avg({})", a),
                    (AggregateFn::Min, Some(a)) => format!("min({})", a),
                    (AggregateFn::Max, Some(a)) => format!("max({})", a),
                    (AggregateFn::ArrayAgg, Some(a)) => format!("array_agg({})", a),
                    (other, None) => {
                        return Err(self.invalid(format!("{:?} aggregate without a field", other)))
                    }
                };
                Ok(text)
            }
            Projection::Mapping(entries) => {
                let object = self.json_object(entries, b)?;
                Ok(format!("coalesce(jsonb_agg({}), '[]'::jsonb)", object))
            }
        }
    }

    /// Every column of a relation as one json object.
    fn row_object(&self, relation: &CompiledRelation) -> Result<String, EmissionError> {
        let mut parts = Vec::with_capacity(relation.columns.len() * 2);
        for column in &relation.columns {
            parts.push(quote(&column.name));
            parts.push(self.column(&relation.binding, &column.name, &column.ty)?);
        }
        Ok(format!("jsonb_build_object({})", parts.join(", ")))
    }

    /// A complete `SELECT`, one clause per line. `into` is spliced in after
    /// the select list (PL/pgSQL `INTO [STRICT] ...`).
    pub fn select(
        &mut self,
        q: &CompiledQuery,
        projection: Projection<'_>,
        into: Option<&str>,
        b: &mut dyn Binder,
    ) -> Result<String, EmissionError> {
        let mut lines = Vec::new();
        if !q.ctes.is_empty() {
            let mut ctes = Vec::with_capacity(q.ctes.len());
            for cte in &q.ctes {
                ctes.push(self.cte(cte, b)?);
            }
            let keyword = if q.has_recursive_cte() {
                "WITH RECURSIVE"
            } else {
                "WITH"
            };
            lines.push(format!("{} {}", keyword, ctes.join(",\n")));
        }

        self.scopes.push(vec![Self::scope_of(&q.from)]);
        let result = self.select_body(q, projection, into, b, &mut lines);
        self.scopes.pop();
        result?;
        Ok(lines.join("\n"))
    }

    fn select_body(
        &mut self,
        q: &CompiledQuery,
        projection: Projection<'_>,
        into: Option<&str>,
        b: &mut dyn Binder,
        lines: &mut Vec<String>,
    ) -> Result<(), EmissionError> {
        let mut joins = Vec::with_capacity(q.joins.len());
        for join in &q.joins {
            if let Some(frame) = self.scopes.last_mut() {
                frame.push(Self::scope_of(&join.relation));
            }
            let keyword = match join.kind {
                JoinKind::Inner => "JOIN",
                JoinKind::Left => "LEFT JOIN",
            };
            let on = self.expr(&join.on, b)?;
            joins.push(format!("{} {} ON {}", keyword, self.relation(&join.relation), on));
        }

        lines.push(format!("SELECT {}", self.select_list(q, projection, b)?));
        if let Some(into) = into {
            lines.push(into.to_owned());
        }
        lines.push(format!("FROM {}", self.relation(&q.from)));
        lines.extend(joins);
        if let Some(filter) = &q.filter {
            lines.push(format!("WHERE {}", self.expr(filter, b)?));
        }
        if !q.order_by.is_empty() {
            let mut items = Vec::with_capacity(q.order_by.len());
            for o in &q.order_by {
                let e = self.expr(&o.expr, b)?;
                items.push(if o.descending {
                    format!("{} DESC", e)
                } else {
                    e
                });
            }
            lines.push(format!("ORDER BY {}", items.join(", ")));
        }
        if let Some(limit) = q.limit {
            lines.push(format!("LIMIT {}", limit));
        }
        Ok(())
    }

    // ──────────────────────────────────────────────
    // Mutations
    // ──────────────────────────────────────────────

    fn field_value(
        &mut self,
        value: &CompiledFieldValue,
        b: &mut dyn Binder,
    ) -> Result<String, EmissionError> {
        let text = self.expr(&value.value, b)?;
        if value.value.ty.is_dynamic() {
            Ok(format!("CAST({} AS {})", text, self.scalar_type(&value.ty)?))
        } else {
            Ok(text)
        }
    }

    pub fn insert(
        &mut self,
        entity: &EntityTarget,
        values: &[CompiledFieldValue],
        conflict: Option<&[String]>,
        returning: Returning<'_>,
        b: &mut dyn Binder,
    ) -> Result<String, EmissionError> {
        let mut lines = Vec::new();
        if values.is_empty() {
            lines.push(format!("INSERT INTO {} DEFAULT VALUES", table_name(entity)));
        } else {
            let columns: Vec<String> = values
                .iter()
                .map(|v| field_column(&v.field, &v.ty))
                .collect();
            let mut rendered = Vec::with_capacity(values.len());
            for v in values {
                rendered.push(self.field_value(v, b)?);
            }
            lines.push(format!(
                "INSERT INTO {} ({})",
                table_name(entity),
                columns.join(", ")
            ));
            lines.push(format!("VALUES ({})", rendered.join(", ")));
        }
        if let Some(conflict) = conflict {
            let target: Vec<String> = conflict
                .iter()
                .map(|name| match values.iter().find(|v| &v.field == name) {
                    Some(v) => field_column(&v.field, &v.ty),
                    None => ident(&to_snake(name)),
                })
                .collect();
            let updates: Vec<String> = values
                .iter()
                .filter(|v| !conflict.contains(&v.field))
                .map(|v| {
                    let column = field_column(&v.field, &v.ty);
                    format!("{} = EXCLUDED.{}", column, column)
                })
                .collect();
            if updates.is_empty() {
                lines.push(format!("ON CONFLICT ({}) DO NOTHING", target.join(", ")));
            } else {
                lines.push(format!(
                    "ON CONFLICT ({}) DO UPDATE SET {}",
                    target.join(", "),
                    updates.join(", ")
                ));
            }
        }
        match returning {
            Returning::Nothing => {}
            Returning::Id => lines.push("RETURNING id".to_owned()),
            Returning::IdInto(target) => lines.push(format!("RETURNING id INTO {}", target)),
        }
        Ok(lines.join("\n"))
    }

    fn mutation_filter(
        &mut self,
        entity: &EntityTarget,
        filter: Option<&MutationFilter>,
        b: &mut dyn Binder,
    ) -> Result<Option<String>, EmissionError> {
        Ok(match filter {
            None | Some(MutationFilter::All) => None,
            Some(MutationFilter::CurrentRecord) => Some(format!(
                "WHERE {}.id = {}",
                binding_ident(&entity.name),
                b.record_id()
            )),
            Some(MutationFilter::Where { condition }) => {
                Some(format!("WHERE {}", self.expr(condition, b)?))
            }
        })
    }

    fn with_entity_scope<T>(
        &mut self,
        entity: &EntityTarget,
        f: impl FnOnce(&mut Self) -> Result<T, EmissionError>,
    ) -> Result<T, EmissionError> {
        self.scopes.push(vec![RelationScope {
            binding: entity.name.clone(),
            entity: true,
        }]);
        let result = f(self);
        self.scopes.pop();
        result
    }

    pub fn update(
        &mut self,
        entity: &EntityTarget,
        set: &[CompiledFieldValue],
        filter: Option<&MutationFilter>,
        b: &mut dyn Binder,
    ) -> Result<String, EmissionError> {
        self.with_entity_scope(entity, |r| {
            let mut assignments = Vec::with_capacity(set.len());
            for v in set {
                let value = r.field_value(v, b)?;
                assignments.push(format!("{} = {}", field_column(&v.field, &v.ty), value));
            }
            let mut lines = vec![format!(
                "UPDATE {} AS {}",
                table_name(entity),
                binding_ident(&entity.name)
            )];
            lines.push(format!("SET {}", assignments.join(", ")));
            lines.extend(r.mutation_filter(entity, filter, b)?);
            Ok(lines.join("\n"))
        })
    }

    pub fn delete(
        &mut self,
        entity: &EntityTarget,
        filter: Option<&MutationFilter>,
        b: &mut dyn Binder,
    ) -> Result<String, EmissionError> {
        self.with_entity_scope(entity, |r| {
            let mut lines = vec![format!(
                "DELETE FROM {} AS {}",
                table_name(entity),
                binding_ident(&entity.name)
            )];
            lines.extend(r.mutation_filter(entity, filter, b)?);
            Ok(lines.join("\n"))
        })
    }
}

fn indent_block(text: &str) -> String {
    text.lines()
        .map(|l| format!("    {}", l))
        .collect::<Vec<_>>()
        .join("\n")
}
