//! Compiled Action IR: the validated, scope-resolved, type-annotated form of
//! an action.
//!
//! Every variable reference is a `SymbolId` into the action's `SymbolTable`
//! and every expression carries its inferred `ValueType`, so emitters never
//! look at scopes or names. CTEs are attached to the query that consumes
//! them; there is no standalone CTE step.

use crate::ast::{
    AggregateFn, BatchKind, BinaryOp, CatchTarget, EntitySpec, JoinKind, Literal, SemanticType,
    UnaryOp,
};
use crate::diagnostic::Diagnostics;
use crate::scope::{Symbol, SymbolId, SymbolTable};
use crate::types::{Column, ValueType};
use serde::Serialize;

// ──────────────────────────────────────────────
// Expressions
// ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TypedExpr {
    pub kind: TypedExprKind,
    #[serde(rename = "type")]
    pub ty: ValueType,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "expr", rename_all = "snake_case")]
pub enum TypedExprKind {
    Literal {
        value: Literal,
    },
    Var {
        symbol: SymbolId,
    },
    /// Column of a relation bound by the enclosing query, by binding name.
    Column {
        relation: String,
        field: String,
    },
    Binary {
        op: BinaryOp,
        left: Box<TypedExpr>,
        right: Box<TypedExpr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<TypedExpr>,
    },
    Call {
        function: String,
        /// Whitelisted builtin, rendered natively by every backend.
        builtin: bool,
        args: Vec<TypedExpr>,
    },
    Member {
        base: Box<TypedExpr>,
        member: String,
    },
}

impl TypedExpr {
    pub fn new(kind: TypedExprKind, ty: ValueType) -> Self {
        TypedExpr { kind, ty }
    }

    pub fn literal(value: Literal) -> Self {
        let ty = match &value {
            Literal::Null => ValueType::Null,
            Literal::Bool(_) => ValueType::boolean(),
            Literal::Integer(_) => ValueType::integer(),
            Literal::Decimal(_) => ValueType::decimal(),
            Literal::Text(_) => ValueType::text(),
        };
        TypedExpr::new(TypedExprKind::Literal { value }, ty)
    }

    pub fn var(symbol: &Symbol) -> Self {
        TypedExpr::new(TypedExprKind::Var { symbol: symbol.id }, symbol.ty.clone())
    }

    /// Placeholder produced after a diagnostic so that checking can go on.
    pub fn invalid() -> Self {
        TypedExpr::literal(Literal::Null).with_type(ValueType::Dynamic)
    }

    pub fn with_type(mut self, ty: ValueType) -> Self {
        self.ty = ty;
        self
    }

    /// Symbols read by this expression, in evaluation order.
    pub fn symbols(&self, out: &mut Vec<SymbolId>) {
        match &self.kind {
            TypedExprKind::Var { symbol } => out.push(*symbol),
            TypedExprKind::Binary { left, right, .. } => {
                left.symbols(out);
                right.symbols(out);
            }
            TypedExprKind::Unary { operand, .. } => operand.symbols(out),
            TypedExprKind::Call { args, .. } => args.iter().for_each(|a| a.symbols(out)),
            TypedExprKind::Member { base, .. } => base.symbols(out),
            TypedExprKind::Literal { .. } | TypedExprKind::Column { .. } => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledEntry {
    pub key: String,
    pub value: TypedExpr,
}

// ──────────────────────────────────────────────
// Relations and queries
// ──────────────────────────────────────────────

/// Where an entity lives in the target: the entity name plus its namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityTarget {
    pub name: String,
    pub namespace: String,
}

impl From<&EntitySpec> for EntityTarget {
    fn from(entity: &EntitySpec) -> Self {
        EntityTarget {
            name: entity.name.clone(),
            namespace: entity.namespace.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum RelationSource {
    Entity(EntityTarget),
    Cte { name: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledRelation {
    pub source: RelationSource,
    /// Name columns are qualified with (alias, or the relation name).
    pub binding: String,
    pub columns: Vec<Column>,
}

impl CompiledRelation {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledJoin {
    pub kind: JoinKind,
    pub relation: CompiledRelation,
    pub on: TypedExpr,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledSelect {
    pub expr: TypedExpr,
    /// Output column name.
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledOrder {
    pub expr: TypedExpr,
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledCte {
    pub name: String,
    pub recursive: bool,
    pub columns: Vec<Column>,
    pub base: CompiledQuery,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recursive_term: Option<CompiledQuery>,
}

/// A resolved `SELECT`. `select` is never empty: an empty select list in the
/// source is expanded to every column of the primary relation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledQuery {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ctes: Vec<CompiledCte>,
    pub select: Vec<CompiledSelect>,
    pub from: CompiledRelation,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub joins: Vec<CompiledJoin>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<TypedExpr>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub order_by: Vec<CompiledOrder>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
}

impl CompiledQuery {
    /// Row shape produced by the select list.
    pub fn columns(&self) -> Vec<Column> {
        self.select
            .iter()
            .map(|s| Column::new(s.name.clone(), s.expr.ty.clone()))
            .collect()
    }

    pub fn has_recursive_cte(&self) -> bool {
        self.ctes.iter().any(|c| c.recursive)
    }
}

// ──────────────────────────────────────────────
// Steps
// ──────────────────────────────────────────────

/// How query results land in bindings.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum QueryInto {
    /// The whole row goes into one row-typed binding.
    Row { symbol: SymbolId },
    /// One binding per selected column, positionally.
    Columns { symbols: Vec<SymbolId> },
}

impl QueryInto {
    pub fn symbols(&self) -> Vec<SymbolId> {
        match self {
            QueryInto::Row { symbol } => vec![*symbol],
            QueryInto::Columns { symbols } => symbols.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledFieldValue {
    pub field: String,
    #[serde(rename = "type")]
    pub ty: SemanticType,
    pub value: TypedExpr,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum MutationFilter {
    /// The record the action was invoked on.
    CurrentRecord,
    Where { condition: TypedExpr },
    /// No filter on a foreign entity: every row.
    All,
}

/// The structured value produced by `Return`, `ReturnEarly`, a failed
/// `Validate` or a failed guard.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReturnValue {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<TypedExpr>,
    pub fields: Vec<CompiledEntry>,
}

impl ReturnValue {
    pub fn status(status: impl Into<String>, message: Option<String>) -> Self {
        ReturnValue {
            status: status.into(),
            message: message.map(|m| TypedExpr::literal(Literal::Text(m))),
            fields: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledBranch {
    pub condition: TypedExpr,
    pub body: Vec<CompiledStep>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledCase {
    pub values: Vec<Literal>,
    pub body: Vec<CompiledStep>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledCatch {
    pub on: CatchTarget,
    /// Implicit `error_message` binding visible in the clause.
    pub error_message: SymbolId,
    pub body: Vec<CompiledStep>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CompiledStep {
    Declare {
        symbol: SymbolId,
        #[serde(skip_serializing_if = "Option::is_none")]
        init: Option<TypedExpr>,
    },
    Assign {
        target: SymbolId,
        value: TypedExpr,
    },
    Query {
        into: QueryInto,
        query: CompiledQuery,
        single: bool,
    },
    Insert {
        entity: EntityTarget,
        values: Vec<CompiledFieldValue>,
        #[serde(skip_serializing_if = "Option::is_none")]
        into: Option<SymbolId>,
    },
    Update {
        entity: EntityTarget,
        set: Vec<CompiledFieldValue>,
        filter: MutationFilter,
    },
    Delete {
        entity: EntityTarget,
        filter: MutationFilter,
    },
    Validate {
        condition: TypedExpr,
        failure: ReturnValue,
    },
    If {
        branches: Vec<CompiledBranch>,
        #[serde(skip_serializing_if = "Option::is_none")]
        else_body: Option<Vec<CompiledStep>>,
    },
    Switch {
        subject: TypedExpr,
        cases: Vec<CompiledCase>,
        #[serde(skip_serializing_if = "Option::is_none")]
        default: Option<Vec<CompiledStep>>,
    },
    While {
        condition: TypedExpr,
        body: Vec<CompiledStep>,
    },
    ForQuery {
        iterator: SymbolId,
        query: CompiledQuery,
        body: Vec<CompiledStep>,
    },
    Aggregate {
        into: SymbolId,
        function: AggregateFn,
        /// Aggregated expression; `None` means the whole row (`count(*)`,
        /// `json_agg(row)`).
        #[serde(skip_serializing_if = "Option::is_none")]
        argument: Option<TypedExpr>,
        /// Source relation and filter; its select list is not used.
        query: CompiledQuery,
    },
    JsonBuild {
        into: SymbolId,
        entries: Vec<CompiledEntry>,
    },
    ArrayBuild {
        into: SymbolId,
        elements: Vec<TypedExpr>,
    },
    Transform {
        into: SymbolId,
        query: CompiledQuery,
        mapping: Vec<CompiledEntry>,
    },
    Upsert {
        entity: EntityTarget,
        values: Vec<CompiledFieldValue>,
        conflict: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        into: Option<SymbolId>,
    },
    BatchOperation {
        entity: EntityTarget,
        operation: BatchKind,
        items: TypedExpr,
        iterator: SymbolId,
        values: Vec<CompiledFieldValue>,
        #[serde(skip_serializing_if = "Option::is_none")]
        filter: Option<TypedExpr>,
    },
    CallFunction {
        function: String,
        args: Vec<CompiledEntry>,
        #[serde(skip_serializing_if = "Option::is_none")]
        into: Option<SymbolId>,
    },
    ReturnEarly {
        result: ReturnValue,
    },
    Return {
        result: ReturnValue,
    },
    TryCatch {
        body: Vec<CompiledStep>,
        catches: Vec<CompiledCatch>,
    },
    Cursor {
        symbol: SymbolId,
        query: CompiledQuery,
    },
    ForeachCursor {
        cursor: SymbolId,
        iterator: SymbolId,
        body: Vec<CompiledStep>,
    },
    Notify {
        channel: String,
        payload: Vec<CompiledEntry>,
    },
    CallService {
        service: String,
        operation: String,
        input: Vec<CompiledEntry>,
        #[serde(skip_serializing_if = "Option::is_none")]
        into: Option<SymbolId>,
    },
}

impl CompiledStep {
    /// Nested step blocks, in source order.
    pub fn blocks(&self) -> Vec<&[CompiledStep]> {
        match self {
            CompiledStep::If {
                branches,
                else_body,
            } => {
                let mut out: Vec<&[CompiledStep]> =
                    branches.iter().map(|b| b.body.as_slice()).collect();
                if let Some(e) = else_body {
                    out.push(e);
                }
                out
            }
            CompiledStep::Switch { cases, default, .. } => {
                let mut out: Vec<&[CompiledStep]> =
                    cases.iter().map(|c| c.body.as_slice()).collect();
                if let Some(d) = default {
                    out.push(d);
                }
                out
            }
            CompiledStep::While { body, .. }
            | CompiledStep::ForQuery { body, .. }
            | CompiledStep::ForeachCursor { body, .. } => vec![body],
            CompiledStep::TryCatch { body, catches } => {
                let mut out: Vec<&[CompiledStep]> = vec![body];
                out.extend(catches.iter().map(|c| c.body.as_slice()));
                out
            }
            _ => Vec::new(),
        }
    }

    /// Whether this step (or anything nested in it) returns early.
    pub fn contains_return(&self) -> bool {
        matches!(
            self,
            CompiledStep::ReturnEarly { .. }
                | CompiledStep::Return { .. }
                | CompiledStep::Validate { .. }
        ) || self
            .blocks()
            .iter()
            .any(|b| b.iter().any(CompiledStep::contains_return))
    }

    pub fn contains_switch(&self) -> bool {
        matches!(self, CompiledStep::Switch { .. })
            || self
                .blocks()
                .iter()
                .any(|b| b.iter().any(CompiledStep::contains_switch))
    }

    /// Control never continues past this step: every path through it
    /// returns or raises.
    pub fn terminates(&self) -> bool {
        match self {
            CompiledStep::Return { .. } | CompiledStep::ReturnEarly { .. } => true,
            CompiledStep::If {
                branches,
                else_body,
            } => {
                else_body.as_deref().is_some_and(block_terminates)
                    && branches.iter().all(|b| block_terminates(&b.body))
            }
            CompiledStep::Switch { cases, default, .. } => {
                default.as_deref().is_some_and(block_terminates)
                    && cases.iter().all(|c| block_terminates(&c.body))
            }
            CompiledStep::TryCatch { body, catches } => {
                block_terminates(body) && catches.iter().all(|c| block_terminates(&c.body))
            }
            _ => false,
        }
    }
}

/// Some step of `steps` terminates, so nothing after the block runs.
pub fn block_terminates(steps: &[CompiledStep]) -> bool {
    steps.iter().any(CompiledStep::terminates)
}

// ──────────────────────────────────────────────
// Action
// ──────────────────────────────────────────────

/// Unified structural shape of every return payload of an action.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReturnShape {
    pub fields: Vec<Column>,
}

impl ReturnShape {
    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|c| c.name.as_str()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledAction {
    pub entity: EntityTarget,
    pub action: String,
    pub symbols: SymbolTable,
    /// Input parameters in declaration order.
    pub params: Vec<SymbolId>,
    /// Owning entity fields, readable from the current record.
    pub fields: Vec<SymbolId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guard: Option<TypedExpr>,
    pub body: Vec<CompiledStep>,
    pub return_shape: ReturnShape,
    /// The action reads or mutates the record it was invoked on, so it
    /// takes the record id as an extra leading parameter.
    pub uses_current_record: bool,
    /// Non-fatal diagnostics (warnings) produced while compiling.
    pub diagnostics: Diagnostics,
}

impl CompiledAction {
    pub fn symbol(&self, id: SymbolId) -> &Symbol {
        self.symbols.get(id)
    }

    /// Every symbol declared inside the body (locals, bindings, iterators,
    /// temporaries), in declaration order.
    pub fn locals(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols.iter().filter(|s| {
            !matches!(
                s.kind,
                crate::scope::SymbolKind::Param | crate::scope::SymbolKind::EntityField
            )
        })
    }

    pub fn has_early_return(&self) -> bool {
        self.guard.is_some() || self.body.iter().any(CompiledStep::contains_return)
    }

    /// The body returns on every path, so no implicit `success` result
    /// follows it.
    pub fn body_terminates(&self) -> bool {
        block_terminates(&self.body)
    }
}
