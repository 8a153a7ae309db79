//! Shared AST types for the SpecQL action compiler.
//!
//! These types are produced by the (external) specification loader or by a
//! reverse-engineering front end, and consumed by the step compiler. They are
//! built once per compilation run and never mutated afterwards.
//!
//! Entities reference each other by name only (`SemanticType::Reference`), so
//! cyclic entity graphs are representable without any pointer cycles.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ──────────────────────────────────────────────
// Semantic field types
// ──────────────────────────────────────────────

/// The semantic type of an entity field or declared variable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "base", rename_all = "snake_case")]
pub enum SemanticType {
    Text,
    Integer,
    Decimal,
    Boolean,
    Timestamp,
    Date,
    Time,
    Json,
    Uuid,
    Email,
    Url,
    Phone,
    Enum { values: Vec<String> },
    Reference { entity: String },
}

impl SemanticType {
    /// Short name used in diagnostics and type-mapping tables.
    pub fn key(&self) -> &'static str {
        match self {
            SemanticType::Text => "text",
            SemanticType::Integer => "integer",
            SemanticType::Decimal => "decimal",
            SemanticType::Boolean => "boolean",
            SemanticType::Timestamp => "timestamp",
            SemanticType::Date => "date",
            SemanticType::Time => "time",
            SemanticType::Json => "json",
            SemanticType::Uuid => "uuid",
            SemanticType::Email => "email",
            SemanticType::Url => "url",
            SemanticType::Phone => "phone",
            SemanticType::Enum { .. } => "enum",
            SemanticType::Reference { .. } => "reference",
        }
    }

    /// Text-backed types: plain text plus the validated string scalars.
    pub fn is_textual(&self) -> bool {
        matches!(
            self,
            SemanticType::Text
                | SemanticType::Email
                | SemanticType::Url
                | SemanticType::Phone
                | SemanticType::Enum { .. }
        )
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, SemanticType::Integer | SemanticType::Decimal)
    }
}

// ──────────────────────────────────────────────
// Entities
// ──────────────────────────────────────────────

fn default_namespace() -> String {
    "public".to_owned()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: SemanticType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Expr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IndexMethod {
    #[default]
    Btree,
    Hash,
    Gin,
    Gist,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub fields: Vec<String>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub method: IndexMethod,
}

/// An entity: a named record type with its business actions.
///
/// Field order is significant: it is the generated column order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySpec {
    pub name: String,
    #[serde(default = "default_namespace", alias = "schema")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
    #[serde(default)]
    pub actions: Vec<ActionSpec>,
    #[serde(default)]
    pub indexes: Vec<IndexSpec>,
}

impl EntitySpec {
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn action(&self, name: &str) -> Option<&ActionSpec> {
        self.actions.iter().find(|a| a.name == name)
    }
}

// ──────────────────────────────────────────────
// Actions
// ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: SemanticType,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub inputs: Vec<ParamSpec>,
    /// Capability guard, evaluated before the first step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires: Option<Expr>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

// ──────────────────────────────────────────────
// Expressions
// ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Literal {
    Null,
    Bool(bool),
    Integer(i64),
    Decimal(Decimal),
    Text(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Like,
    Concat,
}

impl BinaryOp {
    pub fn is_arithmetic(self) -> bool {
        matches!(
            self,
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod
        )
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }

    pub fn is_logical(self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOp {
    Not,
    Neg,
    IsNull,
    IsNotNull,
}

/// Expression sub-AST used inside steps, filters and argument positions.
///
/// Variables are always explicit `Var` nodes; there is no string interpolation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "expr", rename_all = "snake_case")]
pub enum Expr {
    Literal {
        value: Literal,
    },
    Var {
        name: String,
    },
    /// Column reference; only meaningful inside a query context. A missing
    /// relation refers to the query's primary relation.
    Field {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        relation: Option<String>,
        field: String,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Call {
        function: String,
        #[serde(default)]
        args: Vec<Expr>,
    },
    Member {
        base: Box<Expr>,
        member: String,
    },
}

impl Expr {
    pub fn lit(value: Literal) -> Self {
        Expr::Literal { value }
    }

    pub fn null() -> Self {
        Expr::lit(Literal::Null)
    }

    pub fn int(n: i64) -> Self {
        Expr::lit(Literal::Integer(n))
    }

    pub fn bool(b: bool) -> Self {
        Expr::lit(Literal::Bool(b))
    }

    pub fn text(s: impl Into<String>) -> Self {
        Expr::lit(Literal::Text(s.into()))
    }

    pub fn var(name: impl Into<String>) -> Self {
        Expr::Var { name: name.into() }
    }

    pub fn column(field: impl Into<String>) -> Self {
        Expr::Field {
            relation: None,
            field: field.into(),
        }
    }

    pub fn field(relation: impl Into<String>, field: impl Into<String>) -> Self {
        Expr::Field {
            relation: Some(relation.into()),
            field: field.into(),
        }
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Self {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn unary(op: UnaryOp, operand: Expr) -> Self {
        Expr::Unary {
            op,
            operand: Box::new(operand),
        }
    }

    pub fn call(function: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Call {
            function: function.into(),
            args,
        }
    }

    pub fn member(base: Expr, member: impl Into<String>) -> Self {
        Expr::Member {
            base: Box::new(base),
            member: member.into(),
        }
    }
}

// ──────────────────────────────────────────────
// Queries
// ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl RelationRef {
    pub fn named(name: impl Into<String>) -> Self {
        RelationRef {
            name: name.into(),
            alias: None,
        }
    }

    /// The name columns of this relation are qualified with.
    pub fn binding_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JoinKind {
    #[default]
    Inner,
    Left,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Join {
    #[serde(default)]
    pub kind: JoinKind,
    pub relation: RelationRef,
    pub on: Expr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectItem {
    pub expr: Expr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub expr: Expr,
    #[serde(default)]
    pub descending: bool,
}

/// A structured `SELECT`. An empty select list means every column of the
/// primary relation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    #[serde(default)]
    pub select: Vec<SelectItem>,
    pub from: RelationRef,
    #[serde(default)]
    pub joins: Vec<Join>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Expr>,
    #[serde(default)]
    pub order_by: Vec<OrderItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
}

impl QuerySpec {
    pub fn from(relation: impl Into<String>) -> Self {
        QuerySpec {
            select: Vec::new(),
            from: RelationRef::named(relation),
            joins: Vec::new(),
            filter: None,
            order_by: Vec::new(),
            limit: None,
        }
    }
}

// ──────────────────────────────────────────────
// Steps
// ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntoBinding {
    pub name: String,
    #[serde(default = "default_true")]
    pub nullable: bool,
}

impl IntoBinding {
    pub fn named(name: impl Into<String>) -> Self {
        IntoBinding {
            name: name.into(),
            nullable: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValue {
    pub field: String,
    pub value: Expr,
}

/// A keyed expression: JSON object entries, service inputs, named arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub key: String,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub condition: Expr,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchCase {
    pub values: Vec<Literal>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFn {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    ArrayAgg,
    JsonAgg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchKind {
    Insert,
    Update,
    Delete,
}

/// Exception classification used by `TryCatch` clauses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionKind {
    UniqueViolation,
    ForeignKeyViolation,
    CheckViolation,
    NotNullViolation,
    NoDataFound,
    TooManyRows,
    DivisionByZero,
    ValidationFailed,
    /// A backend error code (SQLSTATE) not covered by the named kinds.
    Custom(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatchTarget {
    Kind(ExceptionKind),
    Default,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatchClause {
    pub on: CatchTarget,
    #[serde(default)]
    pub steps: Vec<Step>,
}

fn default_status() -> String {
    "success".to_owned()
}

/// Structured result payload of `Return` / `ReturnEarly`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReturnPayload {
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Expr>,
    #[serde(default)]
    pub fields: Vec<Entry>,
}

/// One instruction of an action body. Closed: every consumer matches
/// exhaustively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Step {
    Declare {
        name: String,
        #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
        ty: Option<SemanticType>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        init: Option<Expr>,
        #[serde(default = "default_true")]
        mutable: bool,
        #[serde(default = "default_true")]
        nullable: bool,
    },
    Assign {
        target: String,
        value: Expr,
    },
    Query {
        into: Vec<IntoBinding>,
        query: QuerySpec,
        #[serde(default)]
        single: bool,
    },
    Insert {
        entity: String,
        values: Vec<FieldValue>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        into: Option<String>,
    },
    Update {
        entity: String,
        set: Vec<FieldValue>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<Expr>,
    },
    Delete {
        entity: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<Expr>,
    },
    Validate {
        condition: Expr,
        failure_code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    If {
        branches: Vec<Branch>,
        #[serde(default, rename = "else", skip_serializing_if = "Option::is_none")]
        else_steps: Option<Vec<Step>>,
    },
    Switch {
        subject: Expr,
        cases: Vec<SwitchCase>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<Vec<Step>>,
    },
    While {
        condition: Expr,
        body: Vec<Step>,
    },
    ForQuery {
        iterator: String,
        query: QuerySpec,
        body: Vec<Step>,
    },
    Cte {
        name: String,
        #[serde(default)]
        recursive: bool,
        #[serde(default)]
        columns: Vec<String>,
        base: QuerySpec,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        recursive_term: Option<QuerySpec>,
    },
    Aggregate {
        into: String,
        function: AggregateFn,
        source: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        field: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<Expr>,
    },
    JsonBuild {
        into: String,
        entries: Vec<Entry>,
    },
    ArrayBuild {
        into: String,
        elements: Vec<Expr>,
    },
    Transform {
        into: String,
        source: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<Expr>,
        mapping: Vec<Entry>,
    },
    Upsert {
        entity: String,
        values: Vec<FieldValue>,
        conflict: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        into: Option<String>,
    },
    BatchOperation {
        entity: String,
        operation: BatchKind,
        items: Expr,
        iterator: String,
        #[serde(default)]
        values: Vec<FieldValue>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<Expr>,
    },
    CallFunction {
        function: String,
        #[serde(default)]
        args: Vec<Entry>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        into: Option<String>,
    },
    ReturnEarly {
        payload: ReturnPayload,
    },
    Return {
        payload: ReturnPayload,
    },
    TryCatch {
        body: Vec<Step>,
        #[serde(default)]
        catches: Vec<CatchClause>,
    },
    Cursor {
        name: String,
        query: QuerySpec,
    },
    ForeachCursor {
        cursor: String,
        iterator: String,
        body: Vec<Step>,
    },
    Notify {
        channel: String,
        #[serde(default)]
        payload: Vec<Entry>,
    },
    CallService {
        service: String,
        operation: String,
        #[serde(default)]
        input: Vec<Entry>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        into: Option<String>,
    },
}

impl Step {
    /// Stable kind name, matching the serialized tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Step::Declare { .. } => "declare",
            Step::Assign { .. } => "assign",
            Step::Query { .. } => "query",
            Step::Insert { .. } => "insert",
            Step::Update { .. } => "update",
            Step::Delete { .. } => "delete",
            Step::Validate { .. } => "validate",
            Step::If { .. } => "if",
            Step::Switch { .. } => "switch",
            Step::While { .. } => "while",
            Step::ForQuery { .. } => "for_query",
            Step::Cte { .. } => "cte",
            Step::Aggregate { .. } => "aggregate",
            Step::JsonBuild { .. } => "json_build",
            Step::ArrayBuild { .. } => "array_build",
            Step::Transform { .. } => "transform",
            Step::Upsert { .. } => "upsert",
            Step::BatchOperation { .. } => "batch_operation",
            Step::CallFunction { .. } => "call_function",
            Step::ReturnEarly { .. } => "return_early",
            Step::Return { .. } => "return",
            Step::TryCatch { .. } => "try_catch",
            Step::Cursor { .. } => "cursor",
            Step::ForeachCursor { .. } => "foreach_cursor",
            Step::Notify { .. } => "notify",
            Step::CallService { .. } => "call_service",
        }
    }

    /// Nested step blocks, in source order.
    pub fn blocks(&self) -> Vec<&[Step]> {
        match self {
            Step::If {
                branches,
                else_steps,
            } => {
                let mut out: Vec<&[Step]> = branches.iter().map(|b| b.steps.as_slice()).collect();
                if let Some(e) = else_steps {
                    out.push(e);
                }
                out
            }
            Step::Switch { cases, default, .. } => {
                let mut out: Vec<&[Step]> = cases.iter().map(|c| c.steps.as_slice()).collect();
                if let Some(d) = default {
                    out.push(d);
                }
                out
            }
            Step::While { body, .. }
            | Step::ForQuery { body, .. }
            | Step::ForeachCursor { body, .. } => vec![body],
            Step::TryCatch { body, catches } => {
                let mut out: Vec<&[Step]> = vec![body];
                out.extend(catches.iter().map(|c| c.steps.as_slice()));
                out
            }
            _ => Vec::new(),
        }
    }

    /// Steps that read a relation and therefore consume pending CTEs.
    pub fn is_query_family(&self) -> bool {
        matches!(
            self,
            Step::Query { .. }
                | Step::ForQuery { .. }
                | Step::Cursor { .. }
                | Step::Aggregate { .. }
                | Step::Transform { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn step_deserializes_from_tagged_json() {
        let step: Step = serde_json::from_value(json!({
            "kind": "declare",
            "name": "count",
            "type": {"base": "integer"},
            "init": {"expr": "literal", "value": {"type": "integer", "value": 0}}
        }))
        .unwrap();
        match step {
            Step::Declare {
                name,
                ty,
                init,
                mutable,
                nullable,
            } => {
                assert_eq!(name, "count");
                assert_eq!(ty, Some(SemanticType::Integer));
                assert_eq!(init, Some(Expr::int(0)));
                assert!(mutable);
                assert!(nullable);
            }
            other => panic!("expected declare, got {:?}", other.kind()),
        }
    }

    #[test]
    fn entity_accepts_schema_alias_and_defaults() {
        let entity: EntitySpec = serde_json::from_value(json!({
            "name": "Contact",
            "schema": "crm",
            "fields": [
                {"name": "email", "type": {"base": "email"}, "required": true},
                {"name": "company", "type": {"base": "reference", "entity": "Company"}}
            ]
        }))
        .unwrap();
        assert_eq!(entity.namespace, "crm");
        assert_eq!(entity.fields.len(), 2);
        assert!(entity.actions.is_empty());
        assert_eq!(
            entity.field("company").map(|f| &f.ty),
            Some(&SemanticType::Reference {
                entity: "Company".into()
            })
        );
    }

    #[test]
    fn decimal_literal_round_trips_as_string() {
        let lit = Literal::Decimal(Decimal::new(1250, 2));
        let v = serde_json::to_value(&lit).unwrap();
        assert_eq!(v, json!({"type": "decimal", "value": "12.50"}));
    }

    #[test]
    fn catch_target_forms() {
        let clause: CatchClause = serde_json::from_value(json!({
            "on": {"kind": "unique_violation"},
            "steps": []
        }))
        .unwrap();
        assert_eq!(clause.on, CatchTarget::Kind(ExceptionKind::UniqueViolation));
        let clause: CatchClause = serde_json::from_value(json!({"on": "default"})).unwrap();
        assert_eq!(clause.on, CatchTarget::Default);
    }
}
