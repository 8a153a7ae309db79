//! TypeScript target: one async function per action, running its SQL
//! through the `Db` interface declared in the generated `runtime.ts`.
//!
//! Control flow is native (`switch`, `try`/`catch`, `return`). A `try` body
//! runs under a savepoint that is rolled back before any catch clause, the
//! way a PL/pgSQL exception block rolls back its subtransaction. Queries and
//! mutations reuse the SQL renderer with `$n` placeholders; every variable
//! read inside a statement becomes a positional argument.

use crate::emitter::{preflight, GeneratedArtifact, TargetEmitter};
use crate::error::EmissionError;
use crate::fallback::lower_switches;
use crate::naming::{to_camel, to_pascal, to_snake, NameStyle, Names};
use crate::profile::{Dialect, TargetProfile, TypeMap};
use crate::sql::{Binder, Projection, Returning, SqlRenderer};
use crate::writer::CodeWriter;
use specql_core::ast::{
    BatchKind, BinaryOp, CatchTarget, EntitySpec, ExceptionKind, Literal, SemanticType, UnaryOp,
};
use specql_core::catalog::Index;
use specql_core::compiled::{
    block_terminates, CompiledAction, CompiledCatch, CompiledEntry, CompiledStep, MutationFilter, QueryInto,
    ReturnValue, TypedExpr, TypedExprKind,
};
use specql_core::compiler::entity_columns;
use specql_core::scope::{Symbol, SymbolId, SymbolKind};
use specql_core::types::{Column, ValueType};
use std::borrow::Cow;
use tracing::debug;

const RUNTIME: &str = include_str!("runtime.ts");

#[derive(Debug, Clone, Copy, Default)]
pub struct TypeScriptEmitter;

impl TargetEmitter for TypeScriptEmitter {
    fn dialect(&self) -> Dialect {
        Dialect::TypeScript
    }

    fn emit(
        &self,
        compiled: &CompiledAction,
        profile: &TargetProfile,
    ) -> Result<GeneratedArtifact, EmissionError> {
        preflight(compiled, profile)?;
        let action: Cow<'_, CompiledAction> =
            if !profile.capabilities.native_switch && compiled.body.iter().any(CompiledStep::contains_switch) {
                Cow::Owned(lower_switches(compiled))
            } else {
                Cow::Borrowed(compiled)
            };
        let sql_types = TargetProfile::postgres().types;
        let text = ModuleWriter::new(&action, profile, &sql_types).write()?;
        debug!(
            entity = %compiled.entity.name,
            action = %compiled.action,
            bytes = text.len(),
            "emitted typescript module"
        );
        Ok(GeneratedArtifact::new(
            format!(
                "{}/{}/{}.ts",
                compiled.entity.namespace,
                to_snake(&compiled.entity.name),
                to_snake(&compiled.action)
            ),
            text,
        ))
    }

    fn emit_prelude(&self, _profile: &TargetProfile) -> Vec<GeneratedArtifact> {
        vec![GeneratedArtifact::new("runtime.ts", RUNTIME)]
    }

    fn emit_entity(
        &self,
        entity: &EntitySpec,
        _entities: &Index<'_>,
        profile: &TargetProfile,
    ) -> Result<Vec<GeneratedArtifact>, EmissionError> {
        let mut w = CodeWriter::new("  ");
        w.line(format!("export interface {} {{", to_pascal(&entity.name)));
        w.indent();
        for column in entity_columns(entity) {
            let ty = ts_type(profile, &column.ty)?;
            let required = column.name == "id" || entity.field(&column.name).is_some_and(|f| f.required);
            if required {
                w.line(format!("{}: {};", property(&column.name), ty));
            } else {
                w.line(format!("{}: {} | null;", property(&column.name), ty));
            }
        }
        w.dedent();
        w.line("}");
        Ok(vec![GeneratedArtifact::new(
            format!("{}/{}/types.ts", entity.namespace, to_snake(&entity.name)),
            w.finish(),
        )])
    }
}

// ──────────────────────────────────────────────
// Text helpers
// ──────────────────────────────────────────────

fn js_string(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for ch in text.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// SQL text as a template literal.
fn sql_template(sql: &str) -> String {
    format!(
        "`{}`",
        sql.replace('\\', "\\\\").replace('`', "\\`").replace("${", "\\${")
    )
}

fn is_js_ident(name: &str) -> bool {
    name.chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_' || c == '$')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

/// Object key as written in a literal or interface.
fn property(name: &str) -> String {
    if is_js_ident(name) {
        name.to_owned()
    } else {
        js_string(name)
    }
}

fn member_access(base: &str, member: &str) -> String {
    if is_js_ident(member) {
        format!("{}?.{}", base, member)
    } else {
        format!("{}?.[{}]", base, js_string(member))
    }
}

fn ts_scalar(profile: &TargetProfile, ty: &SemanticType) -> Result<String, EmissionError> {
    match ty {
        SemanticType::Enum { values } if !values.is_empty() => Ok(values
            .iter()
            .map(|v| js_string(v))
            .collect::<Vec<_>>()
            .join(" | ")),
        other => profile.native_type(other).map(str::to_owned),
    }
}

fn ts_row(profile: &TargetProfile, columns: &[Column]) -> Result<String, EmissionError> {
    let mut fields = Vec::with_capacity(columns.len());
    for c in columns {
        fields.push(format!("{}: {} | null", property(&c.name), ts_type(profile, &c.ty)?));
    }
    Ok(format!("{{ {} }}", fields.join("; ")))
}

fn ts_type(profile: &TargetProfile, ty: &ValueType) -> Result<String, EmissionError> {
    match ty {
        ValueType::Scalar { ty } => ts_scalar(profile, ty),
        ValueType::Row { columns } => ts_row(profile, columns),
        ValueType::Cursor { columns } => Ok(format!("AsyncIterable<{}>", ts_row(profile, columns)?)),
        ValueType::Array { element } => Ok(format!("Array<{}>", ts_type(profile, element)?)),
        ValueType::Null | ValueType::Dynamic => profile.dynamic_type().map(str::to_owned),
    }
}

fn ts_literal(value: &Literal) -> String {
    match value {
        Literal::Null => "null".to_owned(),
        Literal::Bool(b) => b.to_string(),
        Literal::Integer(n) => n.to_string(),
        Literal::Decimal(d) => d.to_string(),
        Literal::Text(s) => js_string(s),
    }
}

// ──────────────────────────────────────────────
// Statement arguments
// ──────────────────────────────────────────────

/// Turns every variable read by a statement into a `$n` placeholder.
struct TsBinder<'n> {
    names: &'n Names,
    compiled: &'n CompiledAction,
    args: Vec<String>,
}

impl<'n> TsBinder<'n> {
    fn new(names: &'n Names, compiled: &'n CompiledAction) -> Self {
        TsBinder {
            names,
            compiled,
            args: Vec::new(),
        }
    }

    fn placeholder(&mut self, arg: String) -> String {
        let position = match self.args.iter().position(|a| *a == arg) {
            Some(i) => i + 1,
            None => {
                self.args.push(arg);
                self.args.len()
            }
        };
        format!("${}", position)
    }

    fn arg_list(&self) -> String {
        format!("[{}]", self.args.join(", "))
    }
}

impl Binder for TsBinder<'_> {
    fn var(&mut self, symbol: &Symbol) -> Result<String, EmissionError> {
        if symbol.kind == SymbolKind::Relation {
            return Ok(crate::naming::ident(&symbol.name));
        }
        let name = self.names.require(self.compiled, symbol.id)?.to_owned();
        Ok(self.placeholder(name))
    }

    fn var_member(&mut self, symbol: &Symbol, member: &str) -> Result<String, EmissionError> {
        let name = self.names.require(self.compiled, symbol.id)?;
        let access = member_access(name, member);
        Ok(self.placeholder(access))
    }

    fn record_id(&mut self) -> String {
        let id = self.names.record_id().to_owned();
        self.placeholder(id)
    }
}

// ──────────────────────────────────────────────
// Module writer
// ──────────────────────────────────────────────

struct ModuleWriter<'a> {
    compiled: &'a CompiledAction,
    profile: &'a TargetProfile,
    names: Names,
    sql: SqlRenderer<'a>,
    w: CodeWriter,
    savepoints: usize,
}

impl<'a> ModuleWriter<'a> {
    fn new(compiled: &'a CompiledAction, profile: &'a TargetProfile, sql_types: &'a TypeMap) -> Self {
        ModuleWriter {
            compiled,
            profile,
            names: Names::assign(compiled, NameStyle::TypeScript),
            sql: SqlRenderer::new(compiled, sql_types),
            w: CodeWriter::new("  "),
            savepoints: 0,
        }
    }

    fn name(&self, id: SymbolId) -> Result<String, EmissionError> {
        self.names.require(self.compiled, id).map(str::to_owned)
    }

    fn var_type(&self, id: SymbolId) -> Result<String, EmissionError> {
        ts_type(self.profile, &self.compiled.symbol(id).ty)
    }

    /// Render a statement; returns `(sql template, argument list)`.
    fn statement(
        &mut self,
        f: impl FnOnce(&mut SqlRenderer<'a>, &mut dyn Binder) -> Result<String, EmissionError>,
    ) -> Result<(String, String), EmissionError> {
        let mut binder = TsBinder::new(&self.names, self.compiled);
        let sql = f(&mut self.sql, &mut binder)?;
        Ok((sql_template(&sql), binder.arg_list()))
    }

    fn write(mut self) -> Result<String, EmissionError> {
        let compiled = self.compiled;
        let base = to_pascal(&compiled.action);
        let function = to_camel(&compiled.action);

        self.w.line("// Generated by specql. Do not edit.");
        self.w.line("import { rt, type Db, type MutationResult } from \"../../runtime\";");
        self.w.blank();

        self.w.line(format!("export interface {}Input {{", base));
        self.w.indent();
        for id in &compiled.params {
            let symbol = compiled.symbol(*id);
            let ty = ts_type(self.profile, &symbol.ty)?;
            if symbol.nullable {
                self.w.line(format!("{}?: {} | null;", to_camel(&symbol.name), ty));
            } else {
                self.w.line(format!("{}: {};", to_camel(&symbol.name), ty));
            }
        }
        self.w.dedent();
        self.w.line("}");
        self.w.blank();

        self.w.line(format!("export interface {}Result {{", base));
        self.w.indent();
        for field in &compiled.return_shape.fields {
            let ty = ts_type(self.profile, &field.ty)?;
            self.w.line(format!("{}?: {} | null;", property(&field.name), ty));
        }
        self.w.dedent();
        self.w.line("}");
        self.w.blank();

        let record = if compiled.uses_current_record {
            format!("{}: string, ", self.names.record_id())
        } else {
            String::new()
        };
        self.w.line(format!(
            "export async function {}(db: Db, {}input: {}Input): Promise<MutationResult<{}Result>> {{",
            function, record, base, base
        ));
        self.w.indent();
        for symbol in compiled.locals() {
            if symbol.kind == SymbolKind::Relation {
                continue;
            }
            let ty = ts_type(self.profile, &symbol.ty)?;
            self.w.line(format!("let {}: {} | null = null;", self.name(symbol.id)?, ty));
        }
        if let Some(guard) = &compiled.guard {
            let condition = self.expr(guard)?;
            self.w.line(format!("if (({}) !== true) {{", condition));
            self.w.indent();
            self.emit_return(&ReturnValue::status("forbidden", None))?;
            self.w.dedent();
            self.w.line("}");
        }
        self.steps(&compiled.body)?;
        if !compiled.body_terminates() {
            self.emit_return(&ReturnValue::status("success", None))?;
        }
        self.w.dedent();
        self.w.line("}");
        Ok(self.w.finish())
    }

    // ── expressions ──

    fn expr(&mut self, e: &TypedExpr) -> Result<String, EmissionError> {
        match &e.kind {
            TypedExprKind::Literal { value } => Ok(ts_literal(value)),
            TypedExprKind::Var { symbol } => {
                let compiled = self.compiled;
                let symbol = compiled.symbol(*symbol);
                if symbol.kind == SymbolKind::EntityField {
                    let ty = ts_type(self.profile, &e.ty)?;
                    let (sql, args) = self.statement(|sql, b| {
                        sql.expr(e, b).map(|sub| format!("SELECT {}", sub))
                    })?;
                    return Ok(format!("(await db.value<{}>({}, {}))", ty, sql, args));
                }
                self.name(symbol.id)
            }
            TypedExprKind::Column { relation, field } => Err(self.sql.invalid(format!(
                "column {}.{} outside a query",
                relation, field
            ))),
            TypedExprKind::Binary { op, left, right } => {
                let l = self.expr(left)?;
                let r = self.expr(right)?;
                Ok(match op {
                    BinaryOp::Eq => format!("({} === {})", l, r),
                    BinaryOp::Ne => format!("({} !== {})", l, r),
                    BinaryOp::And => format!("({} && {})", l, r),
                    BinaryOp::Or => format!("({} || {})", l, r),
                    BinaryOp::Like => format!("rt.like({}, {})", l, r),
                    BinaryOp::Concat => format!("rt.concatOp({}, {})", l, r),
                    BinaryOp::Div if is_integer(&left.ty) && is_integer(&right.ty) => {
                        format!("Math.trunc({} / {})", l, r)
                    }
                    other => format!("({} {} {})", l, crate::sql::binary_operator(*other), r),
                })
            }
            TypedExprKind::Unary { op, operand } => {
                let inner = self.expr(operand)?;
                Ok(match op {
                    UnaryOp::Not => format!("!({})", inner),
                    UnaryOp::Neg => format!("-({})", inner),
                    UnaryOp::IsNull => format!("({} == null)", inner),
                    UnaryOp::IsNotNull => format!("({} != null)", inner),
                })
            }
            TypedExprKind::Call {
                function,
                builtin,
                args,
            } => {
                let mut rendered = Vec::with_capacity(args.len());
                for arg in args {
                    rendered.push(self.expr(arg)?);
                }
                if *builtin {
                    Ok(format!("rt.{}({})", function, rendered.join(", ")))
                } else {
                    let ty = ts_type(self.profile, &e.ty)?;
                    Ok(format!(
                        "(await db.call<{}>({}, [{}]))",
                        ty,
                        js_string(function),
                        rendered.join(", ")
                    ))
                }
            }
            TypedExprKind::Member { base, member } => {
                let base = self.expr(base)?;
                Ok(format!("({})", member_access(&base, member)))
            }
        }
    }

    fn object(&mut self, entries: &[CompiledEntry]) -> Result<String, EmissionError> {
        if entries.is_empty() {
            return Ok("{}".to_owned());
        }
        let mut parts = Vec::with_capacity(entries.len());
        for entry in entries {
            parts.push(format!("{}: {}", property(&entry.key), self.expr(&entry.value)?));
        }
        Ok(format!("{{ {} }}", parts.join(", ")))
    }

    // ── statements ──

    fn steps(&mut self, steps: &[CompiledStep]) -> Result<(), EmissionError> {
        for step in steps {
            self.step(step)?;
        }
        Ok(())
    }

    fn emit_return(&mut self, result: &ReturnValue) -> Result<(), EmissionError> {
        let message = match &result.message {
            Some(m) => self.expr(m)?,
            None => "null".to_owned(),
        };
        let data = self.object(&result.fields)?;
        self.w.line(format!(
            "return {{ status: {}, message: {}, objectData: {} }};",
            js_string(&result.status),
            message,
            data
        ));
        Ok(())
    }

    fn assign_value(&mut self, target: SymbolId, call: &str) -> Result<(), EmissionError> {
        let name = self.name(target)?;
        self.w.line(format!("{} = {};", name, call));
        Ok(())
    }

    fn step(&mut self, step: &CompiledStep) -> Result<(), EmissionError> {
        match step {
            CompiledStep::Declare { symbol, init } => {
                let value = match init {
                    Some(e) => self.expr(e)?,
                    None => "null".to_owned(),
                };
                self.assign_value(*symbol, &value)?;
            }
            CompiledStep::Assign { target, value } => {
                let value = self.expr(value)?;
                self.assign_value(*target, &value)?;
            }
            CompiledStep::Query {
                into,
                query,
                single,
            } => {
                let symbols = into.symbols();
                let nullable = symbols.iter().all(|id| self.compiled.symbol(*id).nullable);
                let method = match (single, nullable) {
                    (true, false) => "one",
                    (true, true) => "maybeOne",
                    (false, _) => "first",
                };
                let (sql, args) =
                    self.statement(|sql, b| sql.select(query, Projection::Columns, None, b))?;
                match into {
                    QueryInto::Row { symbol } => {
                        let ty = self.var_type(*symbol)?;
                        let call = format!("await db.{}<{}>({}, {})", method, ty, sql, args);
                        self.assign_value(*symbol, &call)?;
                    }
                    QueryInto::Columns { symbols } => {
                        self.w.line("{");
                        self.w.indent();
                        self.w.line(format!("const row = await db.{}({}, {});", method, sql, args));
                        for (id, column) in symbols.iter().zip(&query.select) {
                            let ty = self.var_type(*id)?;
                            let value = format!(
                                "({} ?? null) as {} | null",
                                member_access("row", &column.name),
                                ty
                            );
                            self.assign_value(*id, &value)?;
                        }
                        self.w.dedent();
                        self.w.line("}");
                    }
                }
            }
            CompiledStep::Insert {
                entity,
                values,
                into,
            } => self.insert(into, |sql, b, returning| {
                sql.insert(entity, values, None, returning, b)
            })?,
            CompiledStep::Upsert {
                entity,
                values,
                conflict,
                into,
            } => self.insert(into, |sql, b, returning| {
                sql.insert(entity, values, Some(conflict), returning, b)
            })?,
            CompiledStep::Update {
                entity,
                set,
                filter,
            } => {
                let (sql, args) = self.statement(|sql, b| sql.update(entity, set, Some(filter), b))?;
                self.w.line(format!("await db.execute({}, {});", sql, args));
            }
            CompiledStep::Delete { entity, filter } => {
                let (sql, args) = self.statement(|sql, b| sql.delete(entity, Some(filter), b))?;
                self.w.line(format!("await db.execute({}, {});", sql, args));
            }
            CompiledStep::Validate { condition, failure } => {
                let condition = self.expr(condition)?;
                self.w.line(format!("if (({}) !== true) {{", condition));
                self.w.indent();
                self.emit_return(failure)?;
                self.w.dedent();
                self.w.line("}");
            }
            CompiledStep::If {
                branches,
                else_body,
            } => {
                for (i, branch) in branches.iter().enumerate() {
                    let condition = self.expr(&branch.condition)?;
                    if i == 0 {
                        self.w.line(format!("if ({}) {{", condition));
                    } else {
                        self.w.line(format!("}} else if ({}) {{", condition));
                    }
                    self.w.indent();
                    self.steps(&branch.body)?;
                    self.w.dedent();
                }
                if let Some(body) = else_body {
                    self.w.line("} else {");
                    self.w.indent();
                    self.steps(body)?;
                    self.w.dedent();
                }
                self.w.line("}");
            }
            CompiledStep::Switch {
                subject,
                cases,
                default,
            } => {
                let subject = self.expr(subject)?;
                self.w.line(format!("switch ({}) {{", subject));
                self.w.indent();
                for case in cases.iter().filter(|c| !c.values.is_empty()) {
                    for value in &case.values {
                        self.w.line(format!("case {}:", ts_literal(value)));
                    }
                    self.w.line("{");
                    self.w.indent();
                    self.steps(&case.body)?;
                    self.w.line("break;");
                    self.w.dedent();
                    self.w.line("}");
                }
                if let Some(default) = default {
                    self.w.line("default: {");
                    self.w.indent();
                    self.steps(default)?;
                    self.w.dedent();
                    self.w.line("}");
                }
                self.w.dedent();
                self.w.line("}");
            }
            CompiledStep::While { condition, body } => {
                let condition = self.expr(condition)?;
                self.w.line(format!("while ({}) {{", condition));
                self.w.indent();
                self.steps(body)?;
                self.w.dedent();
                self.w.line("}");
            }
            CompiledStep::ForQuery {
                iterator,
                query,
                body,
            } => {
                let name = self.name(*iterator)?;
                let ty = self.var_type(*iterator)?;
                let (sql, args) =
                    self.statement(|sql, b| sql.select(query, Projection::Columns, None, b))?;
                self.w.line(format!(
                    "for ({} of await db.many<{}>({}, {})) {{",
                    name, ty, sql, args
                ));
                self.w.indent();
                self.steps(body)?;
                self.w.dedent();
                self.w.line("}");
            }
            CompiledStep::Aggregate {
                into,
                function,
                argument,
                query,
            } => {
                let projection = Projection::Aggregate {
                    function: *function,
                    argument: argument.as_ref(),
                };
                let ty = self.var_type(*into)?;
                let (sql, args) = self.statement(|sql, b| sql.select(query, projection, None, b))?;
                self.assign_value(*into, &format!("await db.value<{}>({}, {})", ty, sql, args))?;
            }
            CompiledStep::JsonBuild { into, entries } => {
                let object = self.object(entries)?;
                self.assign_value(*into, &object)?;
            }
            CompiledStep::ArrayBuild { into, elements } => {
                let mut items = Vec::with_capacity(elements.len());
                for e in elements {
                    items.push(self.expr(e)?);
                }
                self.assign_value(*into, &format!("[{}]", items.join(", ")))?;
            }
            CompiledStep::Transform {
                into,
                query,
                mapping,
            } => {
                let (sql, args) =
                    self.statement(|sql, b| sql.select(query, Projection::Mapping(mapping), None, b))?;
                self.assign_value(*into, &format!("await db.value<unknown[]>({}, {})", sql, args))?;
            }
            CompiledStep::BatchOperation {
                entity,
                operation,
                items,
                iterator,
                values,
                filter,
            } => {
                let items = self.expr(items)?;
                let name = self.name(*iterator)?;
                let filter = match filter {
                    Some(condition) => MutationFilter::Where {
                        condition: condition.clone(),
                    },
                    None => MutationFilter::All,
                };
                let (sql, args) = self.statement(|sql, b| match operation {
                    BatchKind::Insert => sql.insert(entity, values, None, Returning::Nothing, b),
                    BatchKind::Update => sql.update(entity, values, Some(&filter), b),
                    BatchKind::Delete => sql.delete(entity, Some(&filter), b),
                })?;
                self.w.line(format!("for ({} of ({} ?? []) as unknown[]) {{", name, items));
                self.w.indent();
                self.w.line(format!("await db.execute({}, {});", sql, args));
                self.w.dedent();
                self.w.line("}");
            }
            CompiledStep::CallFunction {
                function,
                args,
                into,
            } => {
                let object = self.object(args)?;
                match into {
                    Some(id) => {
                        let ty = self.var_type(*id)?;
                        let call = format!("await db.call<{}>({}, {})", ty, js_string(function), object);
                        self.assign_value(*id, &call)?;
                    }
                    None => self
                        .w
                        .line(format!("await db.call({}, {});", js_string(function), object)),
                }
            }
            CompiledStep::ReturnEarly { result } | CompiledStep::Return { result } => {
                self.emit_return(result)?;
            }
            CompiledStep::TryCatch { body, catches } => self.try_catch(body, catches)?,
            CompiledStep::Cursor { symbol, query } => {
                let ty = ts_type(self.profile, &ValueType::Row {
                    columns: query.columns(),
                })?;
                let (sql, args) =
                    self.statement(|sql, b| sql.select(query, Projection::Columns, None, b))?;
                self.assign_value(*symbol, &format!("db.cursor<{}>({}, {})", ty, sql, args))?;
            }
            CompiledStep::ForeachCursor {
                cursor,
                iterator,
                body,
            } => {
                let cursor = self.name(*cursor)?;
                let iterator = self.name(*iterator)?;
                self.w.line(format!("for await ({} of {} ?? []) {{", iterator, cursor));
                self.w.indent();
                self.steps(body)?;
                self.w.dedent();
                self.w.line("}");
            }
            CompiledStep::Notify { channel, payload } => {
                let object = self.object(payload)?;
                self.w.line(format!("await db.notify({}, {});", js_string(channel), object));
            }
            CompiledStep::CallService {
                service,
                operation,
                input,
                into,
            } => {
                let object = self.object(input)?;
                let call = format!(
                    "await db.enqueue({}, {}, {})",
                    js_string(service),
                    js_string(operation),
                    object
                );
                match into {
                    Some(id) => self.assign_value(*id, &call)?,
                    None => self.w.line(format!("{};", call)),
                }
            }
        }
        Ok(())
    }

    fn insert(
        &mut self,
        into: &Option<SymbolId>,
        f: impl FnOnce(&mut SqlRenderer<'a>, &mut dyn Binder, Returning<'_>) -> Result<String, EmissionError>,
    ) -> Result<(), EmissionError> {
        match into {
            Some(id) => {
                let (sql, args) = self.statement(|sql, b| f(sql, b, Returning::Id))?;
                self.assign_value(*id, &format!("await db.value<string>({}, {})", sql, args))
            }
            None => {
                let (sql, args) = self.statement(|sql, b| f(sql, b, Returning::Nothing))?;
                self.w.line(format!("await db.execute({}, {});", sql, args));
                Ok(())
            }
        }
    }

    fn try_catch(&mut self, body: &[CompiledStep], catches: &[CompiledCatch]) -> Result<(), EmissionError> {
        if catches.is_empty() {
            // nothing is caught, so errors propagate like any other step
            self.w.line("{");
            self.w.indent();
            self.steps(body)?;
            self.w.dedent();
            self.w.line("}");
            return Ok(());
        }
        self.savepoints += 1;
        let savepoint = format!("$savepoint{}", self.savepoints);
        self.w.line(format!("const {} = await db.savepoint();", savepoint));
        self.w.line("try {");
        self.w.indent();
        self.steps(body)?;
        if !block_terminates(body) {
            self.w.line(format!("await db.release({});", savepoint));
        }
        self.w.dedent();
        self.w.line("} catch (caught) {");
        self.w.indent();
        self.w.line(format!("await db.rollbackTo({});", savepoint));
        let mut has_default = false;
        for (i, catch) in catches.iter().enumerate() {
            let test = match &catch.on {
                CatchTarget::Default => None,
                CatchTarget::Kind(ExceptionKind::Custom(code)) => {
                    Some(format!("rt.isSqlState(caught, {})", js_string(code)))
                }
                CatchTarget::Kind(kind) => Some(format!(
                    "rt.isException(caught, {})",
                    js_string(exception_name(kind))
                )),
            };
            match (i, test) {
                (0, Some(test)) => self.w.line(format!("if ({}) {{", test)),
                (_, Some(test)) => self.w.line(format!("}} else if ({}) {{", test)),
                (0, None) => self.w.line("{"),
                (_, None) => self.w.line("} else {"),
            }
            self.w.indent();
            let message = self.name(catch.error_message)?;
            self.w.line(format!("{} = rt.errorMessage(caught);", message));
            self.steps(&catch.body)?;
            self.w.dedent();
            if matches!(catch.on, CatchTarget::Default) {
                has_default = true;
                break;
            }
        }
        if !has_default {
            self.w.line("} else {");
            self.w.indent();
            self.w.line("throw caught;");
            self.w.dedent();
        }
        self.w.line("}");
        self.w.dedent();
        self.w.line("}");
        Ok(())
    }
}

fn is_integer(ty: &ValueType) -> bool {
    matches!(ty.as_scalar(), Some(SemanticType::Integer))
}

fn exception_name(kind: &ExceptionKind) -> &'static str {
    match kind {
        ExceptionKind::UniqueViolation => "unique_violation",
        ExceptionKind::ForeignKeyViolation => "foreign_key_violation",
        ExceptionKind::CheckViolation => "check_violation",
        ExceptionKind::NotNullViolation => "not_null_violation",
        ExceptionKind::NoDataFound => "no_data_found",
        ExceptionKind::TooManyRows => "too_many_rows",
        ExceptionKind::DivisionByZero => "division_by_zero",
        ExceptionKind::ValidationFailed => "validation_failed",
        ExceptionKind::Custom(_) => "custom",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use specql_core::catalog::{build_index, Catalog, StaticCatalog};
    use specql_core::compiler::{compile, CompileOptions};
    use serde_json::json;

    fn emit(inputs: serde_json::Value, steps: serde_json::Value) -> GeneratedArtifact {
        let entities: Vec<EntitySpec> = serde_json::from_value(json!([
            {"name": "Contact", "schema": "crm", "fields": [
                {"name": "email", "type": {"base": "email"}, "required": true},
                {"name": "score", "type": {"base": "integer"}}
            ], "actions": [{"name": "bump_score", "inputs": inputs, "steps": steps}]}
        ]))
        .unwrap();
        let (index, _) = build_index(&entities);
        let functions = StaticCatalog::new();
        let catalog = Catalog::new(&index, &functions);
        let compiled = compile(
            &entities[0].actions[0],
            &entities[0],
            &catalog,
            &CompileOptions::default(),
        )
        .unwrap();
        TypeScriptEmitter
            .emit(&compiled, &TargetProfile::typescript())
            .unwrap()
    }

    #[test]
    fn module_signature_and_placeholders() {
        let artifact = emit(
            json!([{"name": "by", "type": {"base": "integer"}, "required": true}]),
            json!([
                {"kind": "update", "entity": "Contact", "set": [
                    {"field": "score", "value": {"expr": "binary", "op": "add",
                        "left": {"expr": "var", "name": "score"},
                        "right": {"expr": "var", "name": "by"}}}
                ]}
            ]),
        );
        assert_eq!(artifact.path, "crm/contact/bump_score.ts");
        let text = artifact.content;
        assert!(text.contains("export interface BumpScoreInput {\n  by: number;\n}"));
        assert!(text.contains(
            "export async function bumpScore(db: Db, recordId: string, input: BumpScoreInput): Promise<MutationResult<BumpScoreResult>> {"
        ));
        assert!(text.contains(
            "await db.execute(`UPDATE crm.tb_contact AS contact\n  SET score = ((SELECT r.score FROM crm.tb_contact AS r WHERE r.id = $1) + $2)\n  WHERE contact.id = $1`, [recordId, input.by]);"
        ));
        assert!(text.contains("return { status: \"success\", message: null, objectData: {} };"));
    }

    #[test]
    fn locals_are_hoisted_and_queries_typed() {
        let text = emit(
            json!([]),
            json!([
                {"kind": "aggregate", "into": "total", "function": "count", "source": "Contact"},
                {"kind": "return", "payload": {"fields": [
                    {"key": "total", "value": {"expr": "var", "name": "total"}}
                ]}}
            ]),
        )
        .content;
        assert!(text.contains("let total: number | null = null;"));
        assert!(text.contains("total = await db.value<number>(`SELECT count(*)\n  FROM crm.tb_contact AS contact`, []);"));
        assert!(text.contains("objectData: { total: total }"));
    }

    #[test]
    fn try_body_runs_under_a_savepoint() {
        let text = emit(
            json!([]),
            json!([
                {"kind": "try_catch", "body": [
                    {"kind": "insert", "entity": "Contact", "values": [
                        {"field": "email", "value": {"expr": "literal", "value": {"type": "text", "value": "a@x.io"}}}
                    ]},
                    {"kind": "insert", "entity": "Contact", "values": [
                        {"field": "email", "value": {"expr": "literal", "value": {"type": "text", "value": "b@x.io"}}}
                    ]}
                ], "catches": [
                    {"on": {"kind": "unique_violation"}, "steps": [
                        {"kind": "return_early", "payload": {"status": "duplicate"}}
                    ]}
                ]}
            ]),
        )
        .content;
        let opened = text.find("const $savepoint1 = await db.savepoint();\n  try {").unwrap();
        let released = text.find("await db.release($savepoint1);\n  } catch (caught) {").unwrap();
        let rolled_back = text.find("} catch (caught) {\n    await db.rollbackTo($savepoint1);\n    if (rt.isException(caught, \"unique_violation\")) {").unwrap();
        assert!(opened < released && released < rolled_back);
        assert!(text.contains("} else {\n      throw caught;"));
    }

    #[test]
    fn try_without_catches_propagates_errors() {
        let text = emit(
            json!([]),
            json!([{"kind": "try_catch", "body": [{"kind": "notify", "channel": "touched"}], "catches": []}]),
        )
        .content;
        assert!(!text.contains("catch"));
        assert!(!text.contains("savepoint"));
    }

    #[test]
    fn text_escaping() {
        assert_eq!(js_string("a\"b\n"), "\"a\\\"b\\n\"");
        assert_eq!(sql_template("SELECT `x` ${y}"), "`SELECT \\`x\\` \\${y}`");
        assert_eq!(property("first-name"), "\"first-name\"");
        assert_eq!(member_access("row", "email"), "row?.email");
    }
}
