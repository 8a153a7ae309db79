//! Statement lowering, one `CompiledStep` at a time.

use super::{FunctionWriter, JOB_TABLE};
use crate::error::EmissionError;
use crate::naming::{ident, qualified};
use crate::sql::{quote, Projection, Returning};
use specql_core::ast::{BatchKind, CatchTarget, ExceptionKind};
use specql_core::compiled::{
    CompiledCase, CompiledCatch, CompiledFieldValue, CompiledStep, EntityTarget, MutationFilter,
    TypedExpr,
};
use specql_core::scope::SymbolId;
use specql_core::types::ValueType;

fn condition_name(target: &CatchTarget) -> String {
    match target {
        CatchTarget::Default => "OTHERS".to_owned(),
        CatchTarget::Kind(kind) => match kind {
            ExceptionKind::UniqueViolation => "unique_violation".to_owned(),
            ExceptionKind::ForeignKeyViolation => "foreign_key_violation".to_owned(),
            ExceptionKind::CheckViolation => "check_violation".to_owned(),
            ExceptionKind::NotNullViolation => "not_null_violation".to_owned(),
            ExceptionKind::NoDataFound => "no_data_found".to_owned(),
            ExceptionKind::TooManyRows => "too_many_rows".to_owned(),
            ExceptionKind::DivisionByZero => "division_by_zero".to_owned(),
            ExceptionKind::ValidationFailed => "raise_exception".to_owned(),
            ExceptionKind::Custom(code) => format!("SQLSTATE {}", quote(code)),
        },
    }
}

impl FunctionWriter<'_> {
    pub(super) fn step(&mut self, step: &CompiledStep) -> Result<(), EmissionError> {
        match step {
            CompiledStep::Declare { symbol, init } => {
                let value = match init {
                    Some(e) => self.expr(e)?,
                    None => "NULL".to_owned(),
                };
                let name = self.name(*symbol)?;
                self.w.line(format!("{} := {};", name, value));
            }
            CompiledStep::Assign { target, value } => {
                let value = self.expr(value)?;
                let name = self.name(*target)?;
                self.w.line(format!("{} := {};", name, value));
            }
            CompiledStep::Query {
                into,
                query,
                single,
            } => {
                let targets = into
                    .symbols()
                    .into_iter()
                    .map(|id| self.name(id))
                    .collect::<Result<Vec<_>, _>>()?;
                let keyword = if *single { "INTO STRICT" } else { "INTO" };
                let clause = format!("{} {}", keyword, targets.join(", "));
                let select =
                    self.render(|sql, b| sql.select(query, Projection::Columns, Some(&clause), b))?;
                let nullable = into
                    .symbols()
                    .iter()
                    .all(|id| self.compiled.symbol(*id).nullable);
                if *single && nullable {
                    self.w.line("BEGIN");
                    self.w.indent();
                    self.w.line(format!("{};", select));
                    self.w.dedent();
                    self.w.line("EXCEPTION");
                    self.w.indent();
                    self.w.line("WHEN NO_DATA_FOUND THEN");
                    self.w.indent();
                    for target in &targets {
                        self.w.line(format!("{} := NULL;", target));
                    }
                    self.w.dedent();
                    self.w.dedent();
                    self.w.line("END;");
                } else {
                    self.w.line(format!("{};", select));
                }
            }
            CompiledStep::Insert {
                entity,
                values,
                into,
            } => {
                let target = self.optional_name(*into)?;
                let returning = match &target {
                    Some(t) => Returning::IdInto(t),
                    None => Returning::Nothing,
                };
                let sql = self.render(|sql, b| sql.insert(entity, values, None, returning, b))?;
                self.w.line(format!("{};", sql));
            }
            CompiledStep::Upsert {
                entity,
                values,
                conflict,
                into,
            } => {
                let target = self.optional_name(*into)?;
                let returning = match &target {
                    Some(t) => Returning::IdInto(t),
                    None => Returning::Nothing,
                };
                let sql = self
                    .render(|sql, b| sql.insert(entity, values, Some(conflict), returning, b))?;
                self.w.line(format!("{};", sql));
            }
            CompiledStep::Update {
                entity,
                set,
                filter,
            } => {
                let sql = self.render(|sql, b| sql.update(entity, set, Some(filter), b))?;
                self.w.line(format!("{};", sql));
            }
            CompiledStep::Delete { entity, filter } => {
                let sql = self.render(|sql, b| sql.delete(entity, Some(filter), b))?;
                self.w.line(format!("{};", sql));
            }
            CompiledStep::Validate { condition, failure } => {
                let condition = self.expr(condition)?;
                self.w.line(format!("IF ({}) IS NOT TRUE THEN", condition));
                self.w.indent();
                self.emit_return(failure)?;
                self.w.dedent();
                self.w.line("END IF;");
            }
            CompiledStep::If {
                branches,
                else_body,
            } => {
                for (i, branch) in branches.iter().enumerate() {
                    let condition = self.expr(&branch.condition)?;
                    let keyword = if i == 0 { "IF" } else { "ELSIF" };
                    self.w.line(format!("{} {} THEN", keyword, condition));
                    self.w.indent();
                    self.block(&branch.body)?;
                    self.w.dedent();
                }
                if let Some(body) = else_body {
                    self.w.line("ELSE");
                    self.w.indent();
                    self.block(body)?;
                    self.w.dedent();
                }
                self.w.line("END IF;");
            }
            CompiledStep::Switch {
                subject,
                cases,
                default,
            } => self.switch(subject, cases, default.as_deref())?,
            CompiledStep::While { condition, body } => {
                let condition = self.expr(condition)?;
                self.w.line(format!("WHILE {} LOOP", condition));
                self.w.indent();
                self.loop_body(body)?;
                self.w.dedent();
                self.w.line("END LOOP;");
            }
            CompiledStep::ForQuery {
                iterator,
                query,
                body,
            } => {
                let name = self.name(*iterator)?;
                let select = self.render(|sql, b| sql.select(query, Projection::Columns, None, b))?;
                self.w.line(format!("FOR {} IN", name));
                self.w.indent();
                self.w.line(select);
                self.w.dedent();
                self.w.line("LOOP");
                self.w.indent();
                self.loop_body(body)?;
                self.w.dedent();
                self.w.line("END LOOP;");
            }
            CompiledStep::Aggregate {
                into,
                function,
                argument,
                query,
            } => {
                let clause = format!("INTO {}", self.name(*into)?);
                let projection = Projection::Aggregate {
                    function: *function,
                    argument: argument.as_ref(),
                };
                let sql = self.render(|sql, b| sql.select(query, projection, Some(&clause), b))?;
                self.w.line(format!("{};", sql));
            }
            CompiledStep::JsonBuild { into, entries } => {
                let value = self.render(|sql, b| sql.json_object(entries, b))?;
                let name = self.name(*into)?;
                self.w.line(format!("{} := {};", name, value));
            }
            CompiledStep::ArrayBuild { into, elements } => {
                let ty = self.compiled.symbol(*into).ty.clone();
                let value = self.render(|sql, b| sql.array(elements, &ty, b))?;
                let name = self.name(*into)?;
                self.w.line(format!("{} := {};", name, value));
            }
            CompiledStep::Transform {
                into,
                query,
                mapping,
            } => {
                let clause = format!("INTO {}", self.name(*into)?);
                let sql = self
                    .render(|sql, b| sql.select(query, Projection::Mapping(mapping), Some(&clause), b))?;
                self.w.line(format!("{};", sql));
            }
            CompiledStep::BatchOperation {
                entity,
                operation,
                items,
                iterator,
                values,
                filter,
            } => self.batch(entity, *operation, items, *iterator, values, filter.as_ref())?,
            CompiledStep::CallFunction {
                function,
                args,
                into,
            } => {
                let mut rendered = Vec::with_capacity(args.len());
                for arg in args {
                    rendered.push(format!("{} => {}", ident(&arg.key), self.expr(&arg.value)?));
                }
                let call = format!("{}({})", qualified(function), rendered.join(", "));
                match into {
                    Some(id) => {
                        let name = self.name(*id)?;
                        self.w.line(format!("{} := {};", name, call));
                    }
                    None => self.w.line(format!("PERFORM {};", call)),
                }
            }
            CompiledStep::ReturnEarly { result } | CompiledStep::Return { result } => {
                self.emit_return(result)?;
            }
            CompiledStep::TryCatch { body, catches } => self.try_catch(body, catches)?,
            CompiledStep::Cursor { symbol, query } => {
                let name = self.name(*symbol)?;
                let select = self.render(|sql, b| sql.select(query, Projection::Columns, None, b))?;
                self.w.line(format!("OPEN {} FOR", name));
                self.w.indent();
                self.w.line(format!("{};", select));
                self.w.dedent();
            }
            CompiledStep::ForeachCursor {
                cursor,
                iterator,
                body,
            } => {
                let cursor = self.name(*cursor)?;
                let iterator = self.name(*iterator)?;
                self.w.line("LOOP");
                self.w.indent();
                self.w.line(format!("FETCH {} INTO {};", cursor, iterator));
                self.w.line("EXIT WHEN NOT FOUND;");
                self.loop_body(body)?;
                self.w.dedent();
                self.w.line("END LOOP;");
            }
            CompiledStep::Notify { channel, payload } => {
                let object = self.render(|sql, b| sql.json_object(payload, b))?;
                self.w.line(format!(
                    "PERFORM pg_notify({}, ({})::text);",
                    quote(channel),
                    object
                ));
            }
            CompiledStep::CallService {
                service,
                operation,
                input,
                into,
            } => {
                let object = self.render(|sql, b| sql.json_object(input, b))?;
                self.w.line(format!(
                    "INSERT INTO {} (service, operation, input_data)",
                    JOB_TABLE
                ));
                match self.optional_name(*into)? {
                    Some(target) => {
                        self.w.line(format!(
                            "VALUES ({}, {}, {})",
                            quote(service),
                            quote(operation),
                            object
                        ));
                        self.w.line(format!("RETURNING id INTO {};", target));
                    }
                    None => self.w.line(format!(
                        "VALUES ({}, {}, {});",
                        quote(service),
                        quote(operation),
                        object
                    )),
                }
            }
        }
        Ok(())
    }

    fn optional_name(&self, id: Option<SymbolId>) -> Result<Option<String>, EmissionError> {
        id.map(|id| self.name(id)).transpose()
    }

    fn switch(
        &mut self,
        subject: &TypedExpr,
        cases: &[CompiledCase],
        default: Option<&[CompiledStep]>,
    ) -> Result<(), EmissionError> {
        let live: Vec<&CompiledCase> = cases.iter().filter(|c| !c.values.is_empty()).collect();
        if live.is_empty() {
            if let Some(default) = default {
                self.block(default)?;
            }
            return Ok(());
        }
        let subject = self.expr(subject)?;
        self.w.line(format!("CASE {}", subject));
        self.w.indent();
        for case in live {
            let values: Vec<String> = case.values.iter().map(crate::sql::literal).collect();
            self.w.line(format!("WHEN {} THEN", values.join(", ")));
            self.w.indent();
            self.block(&case.body)?;
            self.w.dedent();
        }
        self.w.line("ELSE");
        self.w.indent();
        match default {
            Some(default) => self.block(default)?,
            None => self.w.line("NULL;"),
        }
        self.w.dedent();
        self.w.dedent();
        self.w.line("END CASE;");
        Ok(())
    }

    fn batch(
        &mut self,
        entity: &EntityTarget,
        operation: BatchKind,
        items: &TypedExpr,
        iterator: SymbolId,
        values: &[CompiledFieldValue],
        filter: Option<&TypedExpr>,
    ) -> Result<(), EmissionError> {
        let item = self.name(iterator)?;
        let source = self.expr(items)?;
        match &items.ty {
            ValueType::Array { .. } => {
                let empty = self.sql.value_type(&items.ty)?;
                self.w.line(format!(
                    "FOREACH {} IN ARRAY coalesce({}, ARRAY[]::{}) LOOP",
                    item, source, empty
                ));
            }
            _ => {
                self.w.line(format!(
                    "FOR {} IN SELECT value FROM jsonb_array_elements(coalesce({}, '[]'::jsonb)) LOOP",
                    item, source
                ));
            }
        }
        self.w.indent();
        let filter = match filter {
            Some(condition) => MutationFilter::Where {
                condition: condition.clone(),
            },
            None => MutationFilter::All,
        };
        let sql = match operation {
            BatchKind::Insert => {
                self.render(|sql, b| sql.insert(entity, values, None, Returning::Nothing, b))?
            }
            BatchKind::Update => self.render(|sql, b| sql.update(entity, values, Some(&filter), b))?,
            BatchKind::Delete => self.render(|sql, b| sql.delete(entity, Some(&filter), b))?,
        };
        self.w.line(format!("{};", sql));
        self.w.dedent();
        self.w.line("END LOOP;");
        Ok(())
    }

    fn try_catch(
        &mut self,
        body: &[CompiledStep],
        catches: &[CompiledCatch],
    ) -> Result<(), EmissionError> {
        self.w.line("BEGIN");
        self.w.indent();
        self.block(body)?;
        self.w.dedent();
        if !catches.is_empty() {
            self.w.line("EXCEPTION");
            self.w.indent();
            for catch in catches {
                self.w.line(format!("WHEN {} THEN", condition_name(&catch.on)));
                self.w.indent();
                let message = self.name(catch.error_message)?;
                self.w.line(format!("{} := SQLERRM;", message));
                self.block(&catch.body)?;
                self.w.dedent();
            }
            self.w.dedent();
        }
        self.w.line("END;");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::PlPgSqlEmitter;
    use crate::emitter::TargetEmitter;
    use crate::profile::TargetProfile;
    use specql_core::ast::EntitySpec;
    use specql_core::catalog::{build_index, Catalog, StaticCatalog};
    use specql_core::compiler::{compile, CompileOptions};
    use serde_json::json;

    fn emit(steps: serde_json::Value, profile: TargetProfile) -> String {
        let entities: Vec<EntitySpec> = serde_json::from_value(json!([
            {"name": "Contact", "schema": "crm", "fields": [
                {"name": "email", "type": {"base": "email"}, "required": true},
                {"name": "status", "type": {"base": "text"}}
            ], "actions": [{"name": "sample", "steps": steps}]}
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
        PlPgSqlEmitter.emit(&compiled, &profile).unwrap().content
    }

    fn text(s: &str) -> serde_json::Value {
        json!({"expr": "literal", "value": {"type": "text", "value": s}})
    }

    #[test]
    fn single_query_tolerates_missing_row() {
        let out = emit(
            json!([
                {"kind": "query", "into": [{"name": "found"}], "single": true, "query": {
                    "select": [{"expr": {"expr": "field", "field": "email"}}],
                    "from": {"name": "Contact"},
                    "filter": {"expr": "binary", "op": "eq",
                               "left": {"expr": "field", "field": "status"}, "right": text("lead")}
                }}
            ]),
            TargetProfile::postgres(),
        );
        assert!(out.contains("SELECT contact.email\n        INTO STRICT v_found\n"));
        assert!(out.contains("WHEN NO_DATA_FOUND THEN\n            v_found := NULL;"));
    }

    #[test]
    fn single_query_into_non_nullable_binding_is_bare_strict() {
        let out = emit(
            json!([
                {"kind": "query", "into": [{"name": "found", "nullable": false}], "single": true, "query": {
                    "select": [{"expr": {"expr": "field", "field": "email"}}],
                    "from": {"name": "Contact"}
                }}
            ]),
            TargetProfile::postgres(),
        );
        assert!(out.contains("INTO STRICT v_found"));
        assert!(!out.contains("NO_DATA_FOUND"));
        assert!(!out.contains("TOO_MANY_ROWS"));
    }

    #[test]
    fn native_case_always_has_else() {
        let out = emit(
            json!([
                {"kind": "switch", "subject": {"expr": "var", "name": "status"}, "cases": [
                    {"values": [{"type": "text", "value": "lead"}, {"type": "text", "value": "new"}],
                     "steps": [{"kind": "return_early", "payload": {"status": "early"}}]}
                ]}
            ]),
            TargetProfile::postgres(),
        );
        assert!(out.contains("WHEN 'lead', 'new' THEN"));
        assert!(out.contains("    ELSE\n            NULL;\n    END CASE;"));
    }

    #[test]
    fn legacy_switch_is_an_if_chain() {
        let out = emit(
            json!([
                {"kind": "switch", "subject": {"expr": "var", "name": "status"}, "cases": [
                    {"values": [{"type": "text", "value": "lead"}],
                     "steps": [{"kind": "return_early", "payload": {"status": "early"}}]}
                ], "default": [{"kind": "declare", "name": "x"}]}
            ]),
            TargetProfile::postgres_legacy(),
        );
        assert!(!out.contains("CASE"));
        assert!(out.contains("v_switch_1 TEXT;"));
        assert!(out.contains("IF (v_switch_1 = 'lead') THEN"));
        assert!(!out.contains("EXIT WHEN"));
    }

    #[test]
    fn try_catch_binds_error_message() {
        let out = emit(
            json!([
                {"kind": "try_catch", "body": [
                    {"kind": "insert", "entity": "Contact", "values": [
                        {"field": "email", "value": text("a@b.c")}
                    ]}
                ], "catches": [
                    {"on": {"kind": "unique_violation"}, "steps": [
                        {"kind": "return_early", "payload": {"status": "duplicate",
                         "message": {"expr": "var", "name": "error_message"}}}
                    ]}
                ]}
            ]),
            TargetProfile::postgres(),
        );
        assert!(out.contains(
            "EXCEPTION\n        WHEN unique_violation THEN\n            v_error_message := SQLERRM;"
        ));
        assert!(out.contains("v_result.message := v_error_message;"));
    }

    #[test]
    fn notify_and_service_calls() {
        let out = emit(
            json!([
                {"kind": "notify", "channel": "contact_events", "payload": [
                    {"key": "kind", "value": text("qualified")}
                ]},
                {"kind": "call_service", "service": "mailer", "operation": "send",
                 "input": [{"key": "to", "value": text("a@b.c")}], "into": "job"}
            ]),
            TargetProfile::postgres(),
        );
        assert!(out.contains(
            "PERFORM pg_notify('contact_events', (jsonb_build_object('kind', 'qualified'))::text);"
        ));
        assert!(out.contains("INSERT INTO app.tb_job_run (service, operation, input_data)"));
        assert!(out.contains("RETURNING id INTO v_job;"));
    }
}
