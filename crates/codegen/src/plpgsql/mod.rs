//! Reference lowering: one PL/pgSQL function per action.
//!
//! Every function returns the composite `app.mutation_result (status,
//! message, object_data)`. Actions that touch the current record take its
//! id as the leading parameter. Without native early return the result is
//! stored in `v_result`, `v_done` is raised, and the rest of every enclosing
//! block is skipped until the single `RETURN` at the end.

mod schema;
mod steps;

use crate::emitter::{preflight, GeneratedArtifact, TargetEmitter};
use crate::error::EmissionError;
use crate::fallback::lower_switches;
use crate::naming::{ident, to_snake, NameStyle, Names};
use crate::profile::{Dialect, TargetProfile};
use crate::sql::{quote, Binder, SqlRenderer};
use crate::writer::CodeWriter;
use specql_core::ast::EntitySpec;
use specql_core::catalog::Index;
use specql_core::compiled::{CompiledAction, CompiledStep, ReturnValue, TypedExpr};
use specql_core::scope::{Symbol, SymbolKind};
use std::borrow::Cow;
use tracing::debug;

pub use schema::emit_table;

/// Background job queue `CallService` steps enqueue into.
pub const JOB_TABLE: &str = "app.tb_job_run";

#[derive(Debug, Clone, Copy, Default)]
pub struct PlPgSqlEmitter;

impl TargetEmitter for PlPgSqlEmitter {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
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
        let text = FunctionWriter::new(&action, profile).write()?;
        debug!(
            entity = %compiled.entity.name,
            action = %compiled.action,
            profile = %profile.name,
            bytes = text.len(),
            "emitted plpgsql function"
        );
        Ok(GeneratedArtifact::new(
            format!(
                "{}/functions/{}.sql",
                compiled.entity.namespace,
                to_snake(&compiled.action)
            ),
            text,
        ))
    }

    fn emit_prelude(&self, profile: &TargetProfile) -> Vec<GeneratedArtifact> {
        let json = profile.dynamic_type().unwrap_or("JSONB");
        vec![
            GeneratedArtifact::new(
                "app/mutation_result.sql",
                format!(
                    "CREATE SCHEMA IF NOT EXISTS app;\n\n\
                     CREATE TYPE {} AS (\n    status TEXT,\n    message TEXT,\n    object_data {}\n);\n",
                    profile.result_type, json
                ),
            ),
            GeneratedArtifact::new(
                "app/tables/tb_job_run.sql",
                format!(
                    "CREATE SCHEMA IF NOT EXISTS app;\n\n\
                     CREATE TABLE {} (\n    \
                     pk_job_run INTEGER GENERATED ALWAYS AS IDENTITY PRIMARY KEY,\n    \
                     id UUID NOT NULL DEFAULT gen_random_uuid() UNIQUE,\n    \
                     service TEXT NOT NULL,\n    \
                     operation TEXT NOT NULL,\n    \
                     input_data {} NOT NULL,\n    \
                     status TEXT NOT NULL DEFAULT 'pending',\n    \
                     created_at TIMESTAMPTZ NOT NULL DEFAULT now()\n);\n",
                    JOB_TABLE, json
                ),
            ),
        ]
    }

    fn emit_entity(
        &self,
        entity: &EntitySpec,
        entities: &Index<'_>,
        profile: &TargetProfile,
    ) -> Result<Vec<GeneratedArtifact>, EmissionError> {
        let ddl = emit_table(entity, entities, profile)?;
        Ok(vec![GeneratedArtifact::new(
            format!(
                "{}/tables/tb_{}.sql",
                entity.namespace,
                to_snake(&entity.name)
            ),
            ddl,
        )])
    }
}

/// Symbol names as seen from SQL text.
struct PgBinder<'n> {
    names: &'n Names,
    compiled: &'n CompiledAction,
}

impl Binder for PgBinder<'_> {
    fn var(&mut self, symbol: &Symbol) -> Result<String, EmissionError> {
        self.names
            .require(self.compiled, symbol.id)
            .map(str::to_owned)
    }

    fn var_member(&mut self, symbol: &Symbol, member: &str) -> Result<String, EmissionError> {
        Ok(format!("{}.{}", self.var(symbol)?, ident(member)))
    }

    fn record_id(&mut self) -> String {
        self.names.record_id().to_owned()
    }
}

pub(crate) struct FunctionWriter<'a> {
    compiled: &'a CompiledAction,
    profile: &'a TargetProfile,
    names: Names,
    sql: SqlRenderer<'a>,
    w: CodeWriter,
    /// Early returns go through `v_done` instead of `RETURN`.
    done_flag: bool,
}

impl<'a> FunctionWriter<'a> {
    fn new(compiled: &'a CompiledAction, profile: &'a TargetProfile) -> Self {
        FunctionWriter {
            compiled,
            profile,
            names: Names::assign(compiled, NameStyle::PlPgSql),
            sql: SqlRenderer::new(compiled, &profile.types),
            w: CodeWriter::new("    "),
            done_flag: !profile.capabilities.native_early_return && compiled.has_early_return(),
        }
    }

    pub(crate) fn expr(&mut self, e: &TypedExpr) -> Result<String, EmissionError> {
        let mut binder = PgBinder {
            names: &self.names,
            compiled: self.compiled,
        };
        self.sql.expr(e, &mut binder)
    }

    /// Run `f` with the SQL renderer and a binder.
    pub(crate) fn render<T>(
        &mut self,
        f: impl FnOnce(&mut SqlRenderer<'a>, &mut dyn Binder) -> Result<T, EmissionError>,
    ) -> Result<T, EmissionError> {
        let mut binder = PgBinder {
            names: &self.names,
            compiled: self.compiled,
        };
        f(&mut self.sql, &mut binder)
    }

    pub(crate) fn name(&self, symbol: specql_core::scope::SymbolId) -> Result<String, EmissionError> {
        self.names.require(self.compiled, symbol).map(str::to_owned)
    }

    fn write(mut self) -> Result<String, EmissionError> {
        let compiled = self.compiled;
        let function = format!(
            "{}.{}",
            ident(&compiled.entity.namespace),
            ident(&to_snake(&compiled.action))
        );
        let params = self.parameters()?;
        if params.is_empty() {
            self.w.line(format!("CREATE OR REPLACE FUNCTION {}()", function));
        } else {
            self.w.line(format!("CREATE OR REPLACE FUNCTION {}(", function));
            self.w.indent();
            let last = params.len() - 1;
            for (i, p) in params.iter().enumerate() {
                let comma = if i < last { "," } else { "" };
                self.w.line(format!("{}{}", p, comma));
            }
            self.w.dedent();
            self.w.line(")");
        }
        self.w.line(format!("RETURNS {}", self.profile.result_type));
        self.w.line("LANGUAGE plpgsql");
        self.w.line("AS $$");
        self.declarations()?;
        self.w.line("BEGIN");
        self.w.indent();

        if let Some(guard) = &compiled.guard {
            let condition = self.expr(guard)?;
            self.w.line(format!("IF ({}) IS NOT TRUE THEN", condition));
            self.w.indent();
            self.emit_return(&ReturnValue::status("forbidden", None))?;
            self.w.dedent();
            self.w.line("END IF;");
            if self.done_flag && !compiled.body.is_empty() {
                self.w.line("IF NOT v_done THEN");
                self.w.indent();
                self.block(&compiled.body)?;
                self.w.dedent();
                self.w.line("END IF;");
            } else {
                self.block_or_nothing(&compiled.body)?;
            }
        } else {
            self.block_or_nothing(&compiled.body)?;
        }

        let fallthrough = ReturnValue::status("success", None);
        match (self.done_flag, compiled.body_terminates()) {
            (true, true) => self.w.line("RETURN v_result;"),
            (true, false) => {
                self.w.line("IF NOT v_done THEN");
                self.w.indent();
                self.result_assignments(&fallthrough)?;
                self.w.dedent();
                self.w.line("END IF;");
                self.w.line("RETURN v_result;");
            }
            (false, true) => {}
            (false, false) => self.emit_return(&fallthrough)?,
        }

        self.w.dedent();
        self.w.line("END;");
        self.w.line("$$;");
        Ok(self.w.finish())
    }

    fn parameters(&self) -> Result<Vec<String>, EmissionError> {
        let compiled = self.compiled;
        let mut params = Vec::with_capacity(compiled.params.len() + 1);
        if compiled.uses_current_record {
            params.push(format!(
                "{} {}",
                self.names.record_id(),
                self.profile.native_type(&specql_core::ast::SemanticType::Uuid)?
            ));
        }
        // Only a trailing run of optional parameters can default to NULL.
        let last_required = compiled
            .params
            .iter()
            .rposition(|id| !compiled.symbol(*id).nullable);
        for (i, id) in compiled.params.iter().enumerate() {
            let symbol = compiled.symbol(*id);
            let ty = self.sql.value_type(&symbol.ty)?;
            let name = self.name(*id)?;
            let optional = last_required.map_or(true, |last| i > last);
            if optional {
                params.push(format!("{} {} DEFAULT NULL", name, ty));
            } else {
                params.push(format!("{} {}", name, ty));
            }
        }
        Ok(params)
    }

    fn declarations(&mut self) -> Result<(), EmissionError> {
        self.w.line("DECLARE");
        self.w.indent();
        self.w.line(format!("v_result {};", self.profile.result_type));
        if self.done_flag {
            self.w.line("v_done BOOLEAN := FALSE;");
        }
        for symbol in self.compiled.locals() {
            if symbol.kind == SymbolKind::Relation {
                continue;
            }
            let ty = self.sql.value_type(&symbol.ty)?;
            self.w.line(format!("{} {};", self.name(symbol.id)?, ty));
        }
        self.w.dedent();
        Ok(())
    }

    fn block_or_nothing(&mut self, steps: &[CompiledStep]) -> Result<(), EmissionError> {
        if steps.is_empty() {
            Ok(())
        } else {
            self.block(steps)
        }
    }

    /// Emit a block; an empty block becomes `NULL;`.
    pub(crate) fn block(&mut self, steps: &[CompiledStep]) -> Result<(), EmissionError> {
        if steps.is_empty() {
            self.w.line("NULL;");
            return Ok(());
        }
        if !self.done_flag {
            for step in steps {
                self.step(step)?;
            }
            return Ok(());
        }
        let segments = crate::fallback::return_segments(steps);
        for (i, segment) in segments.into_iter().enumerate() {
            if i == 0 {
                for step in segment {
                    self.step(step)?;
                }
                continue;
            }
            self.w.line("IF NOT v_done THEN");
            self.w.indent();
            for step in segment {
                self.step(step)?;
            }
            self.w.dedent();
            self.w.line("END IF;");
        }
        Ok(())
    }

    /// Loop bodies leave the loop once something returned.
    pub(crate) fn loop_body(&mut self, body: &[CompiledStep]) -> Result<(), EmissionError> {
        self.block(body)?;
        if self.done_flag && body.iter().any(CompiledStep::contains_return) {
            self.w.line("EXIT WHEN v_done;");
        }
        Ok(())
    }

    fn result_assignments(&mut self, result: &ReturnValue) -> Result<(), EmissionError> {
        let message = match &result.message {
            Some(m) => self.expr(m)?,
            None => "NULL".to_owned(),
        };
        let data = self.render(|sql, b| sql.json_object(&result.fields, b))?;
        self.w.line(format!("v_result.status := {};", quote(&result.status)));
        self.w.line(format!("v_result.message := {};", message));
        self.w.line(format!("v_result.object_data := {};", data));
        Ok(())
    }

    pub(crate) fn emit_return(&mut self, result: &ReturnValue) -> Result<(), EmissionError> {
        self.result_assignments(result)?;
        if self.done_flag {
            self.w.line("v_done := TRUE;");
        } else {
            self.w.line("RETURN v_result;");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use specql_core::catalog::{build_index, Catalog, StaticCatalog};
    use specql_core::compiler::{compile, CompileOptions};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn compiled(inputs: serde_json::Value, steps: serde_json::Value) -> CompiledAction {
        let entities: Vec<EntitySpec> = serde_json::from_value(json!([
            {"name": "Contact", "schema": "crm", "fields": [
                {"name": "email", "type": {"base": "email"}, "required": true},
                {"name": "status", "type": {"base": "enum", "values": ["lead", "qualified"]}}
            ], "actions": [{"name": "qualifyLead", "inputs": inputs, "steps": steps}]}
        ]))
        .unwrap();
        let (index, _) = build_index(&entities);
        let functions = StaticCatalog::new();
        let catalog = Catalog::new(&index, &functions);
        compile(&entities[0].actions[0], &entities[0], &catalog, &CompileOptions::default())
            .unwrap()
    }

    #[test]
    fn function_shape() {
        let action = compiled(
            json!([{"name": "note", "type": {"base": "text"}}]),
            json!([
                {"kind": "update", "entity": "Contact", "set": [
                    {"field": "status", "value": {"expr": "literal", "value": {"type": "text", "value": "qualified"}}}
                ]},
                {"kind": "return", "payload": {"fields": [
                    {"key": "note", "value": {"expr": "var", "name": "note"}}
                ]}}
            ]),
        );
        let artifact = PlPgSqlEmitter
            .emit(&action, &TargetProfile::postgres())
            .unwrap();
        assert_eq!(artifact.path, "crm/functions/qualify_lead.sql");
        assert_eq!(
            artifact.content,
            "CREATE OR REPLACE FUNCTION crm.qualify_lead(
    p_contact_id UUID,
    p_note TEXT DEFAULT NULL
)
RETURNS app.mutation_result
LANGUAGE plpgsql
AS $$
DECLARE
    v_result app.mutation_result;
BEGIN
    UPDATE crm.tb_contact AS contact
    SET status = 'qualified'
    WHERE contact.id = p_contact_id;
    v_result.status := 'success';
    v_result.message := NULL;
    v_result.object_data := jsonb_build_object('note', p_note);
    RETURN v_result;
END;
$$;
"
        );
    }

    #[test]
    fn legacy_profile_uses_done_flag() {
        let action = compiled(
            json!([]),
            json!([
                {"kind": "validate", "condition": {"expr": "binary", "op": "eq",
                    "left": {"expr": "var", "name": "status"},
                    "right": {"expr": "literal", "value": {"type": "text", "value": "lead"}}},
                 "failure_code": "not_a_lead"},
                {"kind": "declare", "name": "n", "type": {"base": "integer"},
                 "init": {"expr": "literal", "value": {"type": "integer", "value": 1}}}
            ]),
        );
        let text = PlPgSqlEmitter
            .emit(&action, &TargetProfile::postgres_legacy())
            .unwrap()
            .content;
        assert!(text.contains("v_done BOOLEAN := FALSE;"));
        assert!(text.contains("    v_done := TRUE;\n"));
        assert!(text.contains("IF NOT v_done THEN\n        v_n := 1;\n    END IF;"));
        assert!(text.trim_end().ends_with("RETURN v_result;\nEND;\n$$;"));
        assert_eq!(text.matches("RETURN v_result;").count(), 1);
    }

    #[test]
    fn success_fallthrough_only_when_the_body_can_fall_through() {
        let returning = compiled(
            json!([]),
            json!([{"kind": "return", "payload": {"status": "done"}}]),
        );
        for profile in [TargetProfile::postgres(), TargetProfile::postgres_legacy()] {
            let text = PlPgSqlEmitter.emit(&returning, &profile).unwrap().content;
            assert!(!text.contains("'success'"), "{}", profile.name);
            assert_eq!(text.matches("RETURN v_result;").count(), 1, "{}", profile.name);
        }

        let open = compiled(json!([]), json!([{"kind": "notify", "channel": "touched"}]));
        let text = PlPgSqlEmitter
            .emit(&open, &TargetProfile::postgres())
            .unwrap()
            .content;
        assert!(text.contains("    v_result.status := 'success';\n"));
        assert!(text.trim_end().ends_with("RETURN v_result;\nEND;\n$$;"));
    }

    #[test]
    fn guard_failure_is_forbidden() {
        let entities: Vec<EntitySpec> = serde_json::from_value(json!([
            {"name": "Contact", "fields": [], "actions": [{"name": "archive",
              "requires": {"expr": "literal", "value": {"type": "bool", "value": false}},
              "steps": []}]}
        ]))
        .unwrap();
        let (index, _) = build_index(&entities);
        let functions = StaticCatalog::new();
        let catalog = Catalog::new(&index, &functions);
        let action = compile(
            &entities[0].actions[0],
            &entities[0],
            &catalog,
            &CompileOptions::default(),
        )
        .unwrap();
        let text = PlPgSqlEmitter
            .emit(&action, &TargetProfile::postgres())
            .unwrap()
            .content;
        assert!(text.starts_with("CREATE OR REPLACE FUNCTION public.archive()\n"));
        assert!(text.contains("IF (FALSE) IS NOT TRUE THEN\n        v_result.status := 'forbidden';"));
    }
}
