//! Variable, mutation and value-building steps.

use super::expr::{return_type, QueryContext};
use super::query::entity_columns;
use super::Compiler;
use crate::ast::{BatchKind, EntitySpec, Entry, Expr, FieldValue, SemanticType};
use crate::compiled::{
    CompiledEntry, CompiledFieldValue, CompiledRelation, CompiledStep, EntityTarget,
    MutationFilter, RelationSource, TypedExpr,
};
use crate::diagnostic::DiagnosticCode;
use crate::scope::{BindingMode, SymbolId, SymbolKind};
use crate::types::ValueType;
use std::collections::BTreeSet;

fn entity_context(entity: &EntitySpec) -> QueryContext {
    QueryContext::new(CompiledRelation {
        source: RelationSource::Entity(EntityTarget::from(entity)),
        binding: entity.name.clone(),
        columns: entity_columns(entity),
    })
}

fn binding(kind: SymbolKind, nullable: bool) -> BindingMode {
    BindingMode {
        mutable: true,
        nullable,
        kind,
    }
}

impl<'a> Compiler<'a> {
    pub(crate) fn compile_entries(
        &mut self,
        entries: &[Entry],
        ctx: Option<&QueryContext>,
    ) -> Vec<CompiledEntry> {
        entries
            .iter()
            .map(|e| CompiledEntry {
                key: e.key.clone(),
                value: self.compile_expr(&e.value, ctx),
            })
            .collect()
    }

    fn lookup_entity(&mut self, name: &str) -> (Option<&'a EntitySpec>, EntityTarget) {
        match self.catalog.entities.get(name) {
            Some(entity) => (Some(entity), EntityTarget::from(entity)),
            None => {
                self.report(
                    DiagnosticCode::InvalidFieldReference,
                    format!("unknown entity '{}'", name),
                );
                let target = EntityTarget {
                    name: name.to_owned(),
                    namespace: self.entity.namespace.clone(),
                };
                (None, target)
            }
        }
    }

    /// Type-check field assignments against the target entity. Without an
    /// entity the values are still compiled so that their variables are
    /// checked.
    fn compile_field_values(
        &mut self,
        entity: Option<&EntitySpec>,
        values: &[FieldValue],
        ctx: Option<&QueryContext>,
    ) -> Vec<CompiledFieldValue> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::with_capacity(values.len());
        for fv in values {
            let value = self.compile_expr(&fv.value, ctx);
            let Some(entity) = entity else {
                continue;
            };
            let Some(field) = entity.field(&fv.field) else {
                self.report(
                    DiagnosticCode::InvalidFieldReference,
                    format!("entity '{}' has no field '{}'", entity.name, fv.field),
                );
                continue;
            };
            if !seen.insert(fv.field.as_str()) {
                self.report(
                    DiagnosticCode::InvalidFieldReference,
                    format!("field '{}' is assigned twice", fv.field),
                );
            }
            let expected = ValueType::scalar(field.ty.clone());
            if !expected.accepts(&value.ty) {
                self.report(
                    DiagnosticCode::TypeMismatch,
                    format!(
                        "field '{}' of '{}' is {}, got {}",
                        field.name, entity.name, expected, value.ty
                    ),
                );
            } else if field.required && value.ty == ValueType::Null {
                self.report(
                    DiagnosticCode::TypeMismatch,
                    format!("required field '{}' cannot be null", field.name),
                );
            }
            out.push(CompiledFieldValue {
                field: field.name.clone(),
                ty: field.ty.clone(),
                value,
            });
        }
        out
    }

    fn check_required(&mut self, entity: &EntitySpec, values: &[FieldValue]) {
        for field in &entity.fields {
            if field.required
                && field.default.is_none()
                && !values.iter().any(|v| v.field == field.name)
            {
                self.report(
                    DiagnosticCode::TypeMismatch,
                    format!(
                        "'{}' requires field '{}' but it is not set",
                        entity.name, field.name
                    ),
                );
            }
        }
    }

    fn mutation_filter(
        &mut self,
        entity: Option<&EntitySpec>,
        target: &EntityTarget,
        filter: Option<&Expr>,
        ctx: Option<&QueryContext>,
    ) -> MutationFilter {
        match filter {
            Some(f) => MutationFilter::Where {
                condition: self.compile_condition(f, ctx, "mutation filter"),
            },
            None if entity.is_some_and(|e| e.name == self.entity.name) => {
                self.uses_current_record = true;
                MutationFilter::CurrentRecord
            }
            None => {
                self.report(
                    DiagnosticCode::UnfilteredMutation,
                    format!("mutation of '{}' has no filter and affects every row", target.name),
                );
                MutationFilter::All
            }
        }
    }

    // ──────────────────────────────────────────────
    // Variables
    // ──────────────────────────────────────────────

    pub(crate) fn compile_declare(
        &mut self,
        name: &str,
        ty: Option<&SemanticType>,
        init: Option<&Expr>,
        mutable: bool,
        nullable: bool,
    ) -> CompiledStep {
        let init = init.map(|e| self.compile_expr(e, None));
        let declared = match (ty, &init) {
            (Some(t), _) => ValueType::scalar(t.clone()),
            (None, Some(i)) if i.ty != ValueType::Null => i.ty.clone(),
            (None, _) => ValueType::Dynamic,
        };
        match &init {
            Some(i) if !declared.accepts(&i.ty) => self.report(
                DiagnosticCode::TypeMismatch,
                format!("'{}' is {} but is initialised with {}", name, declared, i.ty),
            ),
            Some(i) if !nullable && i.ty == ValueType::Null => self.report(
                DiagnosticCode::TypeMismatch,
                format!("non-nullable '{}' is initialised with null", name),
            ),
            None if !nullable || !mutable => self.report(
                DiagnosticCode::TypeMismatch,
                format!("'{}' needs an initializer", name),
            ),
            _ => {}
        }
        let symbol = self.declare(
            name,
            declared,
            BindingMode {
                mutable,
                nullable,
                kind: SymbolKind::Local,
            },
        );
        CompiledStep::Declare { symbol, init }
    }

    pub(crate) fn compile_assign(&mut self, target: &str, value: &Expr) -> CompiledStep {
        let value = self.compile_expr(value, None);
        let symbol = match self.scopes.resolve(target).cloned() {
            Err(err) => {
                self.report_scope(err);
                SymbolId(0)
            }
            Ok(symbol) => {
                if !symbol.mutable {
                    self.report(
                        DiagnosticCode::AssignToImmutable,
                        format!("cannot assign to immutable '{}'", target),
                    );
                } else if !symbol.ty.accepts(&value.ty) {
                    self.report(
                        DiagnosticCode::TypeMismatch,
                        format!(
                            "cannot assign {} to '{}' of type {}",
                            value.ty, target, symbol.ty
                        ),
                    );
                } else if !symbol.nullable && value.ty == ValueType::Null {
                    self.report(
                        DiagnosticCode::TypeMismatch,
                        format!("cannot assign null to non-nullable '{}'", target),
                    );
                }
                if symbol.ty.is_dynamic() && !value.ty.is_dynamic() && value.ty != ValueType::Null
                {
                    self.scopes.refine(symbol.id, value.ty.clone());
                }
                symbol.id
            }
        };
        CompiledStep::Assign {
            target: symbol,
            value,
        }
    }

    // ──────────────────────────────────────────────
    // Mutations
    // ──────────────────────────────────────────────

    pub(crate) fn compile_insert(
        &mut self,
        entity: &str,
        values: &[FieldValue],
        into: Option<&str>,
    ) -> CompiledStep {
        let (spec, target) = self.lookup_entity(entity);
        let compiled = self.compile_field_values(spec, values, None);
        if let Some(spec) = spec {
            self.check_required(spec, values);
        }
        let into = into.map(|name| {
            self.declare(name, ValueType::uuid(), binding(SymbolKind::QueryBinding, false))
        });
        CompiledStep::Insert {
            entity: target,
            values: compiled,
            into,
        }
    }

    pub(crate) fn compile_update(
        &mut self,
        entity: &str,
        set: &[FieldValue],
        filter: Option<&Expr>,
    ) -> CompiledStep {
        let (spec, target) = self.lookup_entity(entity);
        let ctx = spec.map(entity_context);
        let set = self.compile_field_values(spec, set, ctx.as_ref());
        let filter = self.mutation_filter(spec, &target, filter, ctx.as_ref());
        CompiledStep::Update {
            entity: target,
            set,
            filter,
        }
    }

    pub(crate) fn compile_delete(&mut self, entity: &str, filter: Option<&Expr>) -> CompiledStep {
        let (spec, target) = self.lookup_entity(entity);
        let ctx = spec.map(entity_context);
        let filter = self.mutation_filter(spec, &target, filter, ctx.as_ref());
        CompiledStep::Delete {
            entity: target,
            filter,
        }
    }

    pub(crate) fn compile_upsert(
        &mut self,
        entity: &str,
        values: &[FieldValue],
        conflict: &[String],
        into: Option<&str>,
    ) -> CompiledStep {
        let (spec, target) = self.lookup_entity(entity);
        let compiled = self.compile_field_values(spec, values, None);
        if conflict.is_empty() {
            self.report(
                DiagnosticCode::InvalidFieldReference,
                format!("upsert into '{}' names no conflict fields", target.name),
            );
        }
        if let Some(spec) = spec {
            self.check_required(spec, values);
            for field in conflict {
                if spec.field(field).is_none() && field != "id" {
                    self.report(
                        DiagnosticCode::InvalidFieldReference,
                        format!("conflict field '{}' is not a field of '{}'", field, spec.name),
                    );
                }
            }
        }
        let into = into.map(|name| {
            self.declare(name, ValueType::uuid(), binding(SymbolKind::QueryBinding, false))
        });
        CompiledStep::Upsert {
            entity: target,
            values: compiled,
            conflict: conflict.to_vec(),
            into,
        }
    }

    pub(crate) fn compile_batch_operation(
        &mut self,
        entity: &str,
        operation: BatchKind,
        items: &Expr,
        iterator: &str,
        values: &[FieldValue],
        filter: Option<&Expr>,
    ) -> CompiledStep {
        let (spec, target) = self.lookup_entity(entity);
        let items = self.compile_expr(items, None);
        let element = match &items.ty {
            ValueType::Array { element } => (**element).clone(),
            ValueType::Scalar {
                ty: SemanticType::Json,
            }
            | ValueType::Dynamic
            | ValueType::Null => ValueType::json(),
            other => {
                self.report(
                    DiagnosticCode::TypeMismatch,
                    format!("batch items must be a json array, got {}", other),
                );
                ValueType::Dynamic
            }
        };

        let depth = self.scopes.depth();
        self.scopes.push();
        let iterator = self.declare(
            iterator,
            element,
            BindingMode::readonly(SymbolKind::Iterator),
        );
        let ctx = spec.map(entity_context);
        let compiled = match operation {
            BatchKind::Insert => {
                let compiled = self.compile_field_values(spec, values, None);
                if let Some(spec) = spec {
                    self.check_required(spec, values);
                }
                compiled
            }
            BatchKind::Update => self.compile_field_values(spec, values, ctx.as_ref()),
            BatchKind::Delete => {
                if !values.is_empty() {
                    self.report(
                        DiagnosticCode::InvalidFieldReference,
                        "batch delete does not take field values",
                    );
                }
                Vec::new()
            }
        };
        let filter = match (operation, filter) {
            (BatchKind::Insert, Some(_)) => {
                self.report(
                    DiagnosticCode::TypeMismatch,
                    "batch insert does not take a filter",
                );
                None
            }
            (_, Some(f)) => Some(self.compile_condition(f, ctx.as_ref(), "batch filter")),
            (BatchKind::Insert, None) => None,
            (_, None) => {
                self.report(
                    DiagnosticCode::UnfilteredMutation,
                    format!(
                        "batch mutation of '{}' has no filter and affects every row per item",
                        target.name
                    ),
                );
                None
            }
        };
        self.scopes.truncate(depth);

        CompiledStep::BatchOperation {
            entity: target,
            operation,
            items,
            iterator,
            values: compiled,
            filter,
        }
    }

    // ──────────────────────────────────────────────
    // Value building
    // ──────────────────────────────────────────────

    pub(crate) fn compile_json_build(&mut self, into: &str, entries: &[Entry]) -> CompiledStep {
        let entries = self.compile_entries(entries, None);
        let into = self.declare(into, ValueType::json(), BindingMode::local(true));
        CompiledStep::JsonBuild { into, entries }
    }

    pub(crate) fn compile_array_build(&mut self, into: &str, elements: &[Expr]) -> CompiledStep {
        let elements: Vec<TypedExpr> = elements
            .iter()
            .map(|e| self.compile_expr(e, None))
            .collect();
        let mut element = ValueType::Null;
        for e in &elements {
            match element.unify(&e.ty) {
                Some(t) => element = t,
                None => {
                    self.report(
                        DiagnosticCode::TypeMismatch,
                        format!("array elements mix {} and {}", element, e.ty),
                    );
                    element = ValueType::Dynamic;
                    break;
                }
            }
        }
        if element == ValueType::Null {
            element = ValueType::Dynamic;
        }
        let into = self.declare(into, ValueType::array(element), BindingMode::local(true));
        CompiledStep::ArrayBuild { into, elements }
    }

    // ──────────────────────────────────────────────
    // External calls
    // ──────────────────────────────────────────────

    pub(crate) fn compile_call_function(
        &mut self,
        function: &str,
        args: &[Entry],
        into: Option<&str>,
    ) -> CompiledStep {
        let args = self.compile_entries(args, None);
        let ty = match self.lookup_function(function) {
            None => ValueType::Dynamic,
            Some(sig) => {
                let mut seen = BTreeSet::new();
                for arg in &args {
                    if !seen.insert(arg.key.as_str()) {
                        self.report(
                            DiagnosticCode::TypeMismatch,
                            format!("argument '{}' is passed twice", arg.key),
                        );
                    }
                    match sig.param(&arg.key) {
                        Some(param) => {
                            self.check_param(&sig, &param.name, param.ty.as_ref(), &arg.value.ty)
                        }
                        None => self.report(
                            DiagnosticCode::TypeMismatch,
                            format!("function '{}' has no parameter '{}'", sig.name, arg.key),
                        ),
                    }
                }
                for param in sig.params.iter().filter(|p| p.required) {
                    if !args.iter().any(|a| a.key == param.name) {
                        self.report(
                            DiagnosticCode::TypeMismatch,
                            format!(
                                "function '{}' requires argument '{}'",
                                sig.name, param.name
                            ),
                        );
                    }
                }
                return_type(&sig)
            }
        };
        let into = into.map(|name| self.declare(name, ty, BindingMode::local(true)));
        CompiledStep::CallFunction {
            function: function.to_owned(),
            args,
            into,
        }
    }

    pub(crate) fn compile_notify(&mut self, channel: &str, payload: &[Entry]) -> CompiledStep {
        let payload = self.compile_entries(payload, None);
        CompiledStep::Notify {
            channel: channel.to_owned(),
            payload,
        }
    }

    /// Service calls are queued as jobs; `into` receives the job id.
    pub(crate) fn compile_call_service(
        &mut self,
        service: &str,
        operation: &str,
        input: &[Entry],
        into: Option<&str>,
    ) -> CompiledStep {
        let input = self.compile_entries(input, None);
        let into = into.map(|name| {
            self.declare(name, ValueType::uuid(), binding(SymbolKind::QueryBinding, false))
        });
        CompiledStep::CallService {
            service: service.to_owned(),
            operation: operation.to_owned(),
            input,
            into,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::catalog::{FunctionParam, FunctionSignature, StaticCatalog};
    use crate::compiled::{CompiledStep, MutationFilter};
    use crate::compiler::tests::{
        bin, col, compile_steps, compile_with, error_codes, int, text, var, warning_codes,
    };
    use crate::compiler::CompileOptions;
    use crate::ast::SemanticType;
    use crate::diagnostic::DiagnosticCode;
    use crate::types::ValueType;
    use serde_json::json;

    fn scoring_catalog() -> StaticCatalog {
        vec![FunctionSignature {
            name: "crm.score_lead".into(),
            params: vec![FunctionParam {
                name: "email".into(),
                ty: Some(SemanticType::Text),
                required: true,
            }],
            returns: Some(SemanticType::Integer),
        }]
        .into_iter()
        .collect()
    }

    #[test]
    fn insert_checks_fields_and_required() {
        let result = compile_steps(json!([
            {"kind": "insert", "entity": "Contact", "values": [{"field": "score", "value": int(1)}]}
        ]));
        assert_eq!(error_codes(&result), vec![DiagnosticCode::TypeMismatch]);

        let result = compile_steps(json!([
            {"kind": "insert", "entity": "Contact", "values": [
                {"field": "email", "value": text("x@y.z")},
                {"field": "nickname", "value": text("x")}
            ]}
        ]));
        assert_eq!(error_codes(&result), vec![DiagnosticCode::InvalidFieldReference]);

        let result = compile_steps(json!([
            {"kind": "insert", "entity": "Ghost", "values": []}
        ]));
        assert_eq!(error_codes(&result), vec![DiagnosticCode::InvalidFieldReference]);
    }

    #[test]
    fn insert_binds_new_id() {
        let compiled = compile_steps(json!([
            {"kind": "insert", "entity": "Company", "into": "company_id",
             "values": [{"field": "name", "value": text("Acme")}]},
            {"kind": "return", "payload": {"fields": [{"key": "id", "value": var("company_id")}]}}
        ]))
        .unwrap();
        assert_eq!(compiled.return_shape.fields[0].ty, ValueType::uuid());
    }

    #[test]
    fn unfiltered_mutations() {
        let compiled = compile_steps(json!([
            {"kind": "update", "entity": "Contact", "set": [{"field": "score", "value": var("new_score")}]},
            {"kind": "delete", "entity": "Company"}
        ]))
        .unwrap();
        assert!(compiled.uses_current_record);
        assert!(matches!(
            &compiled.body[0],
            CompiledStep::Update { filter: MutationFilter::CurrentRecord, .. }
        ));
        assert!(matches!(
            &compiled.body[1],
            CompiledStep::Delete { filter: MutationFilter::All, .. }
        ));
        assert_eq!(warning_codes(&compiled), vec![DiagnosticCode::UnfilteredMutation]);
    }

    #[test]
    fn update_set_may_read_columns() {
        let compiled = compile_steps(json!([
            {"kind": "update", "entity": "Company",
             "set": [{"field": "contact_count", "value": bin("add", col("contact_count"), int(1))}],
             "filter": bin("eq", col("name"), text("Acme"))}
        ]))
        .unwrap();
        assert!(compiled.diagnostics.is_empty());
    }

    #[test]
    fn upsert_conflict_fields_must_exist() {
        let result = compile_steps(json!([
            {"kind": "upsert", "entity": "Company", "conflict": ["domain"],
             "values": [{"field": "name", "value": text("Acme")}]}
        ]));
        assert_eq!(error_codes(&result), vec![DiagnosticCode::InvalidFieldReference]);
    }

    #[test]
    fn unknown_function_severity() {
        let steps = json!([{"kind": "call_function", "function": "crm.unknown"}]);
        let strict = CompileOptions {
            strict: true,
            warnings_as_errors: false,
        };

        // empty catalog: always a warning
        let compiled = compile_with(steps.clone(), &StaticCatalog::new(), &strict).unwrap();
        assert_eq!(warning_codes(&compiled), vec![DiagnosticCode::UnknownFunctionWarning]);

        let compiled =
            compile_with(steps.clone(), &scoring_catalog(), &CompileOptions::default()).unwrap();
        assert_eq!(warning_codes(&compiled), vec![DiagnosticCode::UnknownFunctionWarning]);

        let result = compile_with(steps, &scoring_catalog(), &strict);
        assert_eq!(error_codes(&result), vec![DiagnosticCode::UnknownFunctionWarning]);
    }

    #[test]
    fn known_function_checks_arguments() {
        let compiled = compile_with(
            json!([
                {"kind": "call_function", "function": "crm.score_lead", "into": "s",
                 "args": [{"key": "email", "value": text("a@b.c")}]},
                {"kind": "return", "payload": {"fields": [{"key": "s", "value": var("s")}]}}
            ]),
            &scoring_catalog(),
            &CompileOptions::default(),
        )
        .unwrap();
        assert_eq!(compiled.return_shape.fields[0].ty, ValueType::integer());

        let result = compile_with(
            json!([{"kind": "call_function", "function": "crm.score_lead",
                    "args": [{"key": "email", "value": int(1)}, {"key": "extra", "value": int(2)}]}]),
            &scoring_catalog(),
            &CompileOptions::default(),
        );
        assert_eq!(
            error_codes(&result),
            vec![DiagnosticCode::TypeMismatch, DiagnosticCode::TypeMismatch]
        );
    }

    #[test]
    fn untyped_declaration_is_refined_by_assignment() {
        let compiled = compile_steps(json!([
            {"kind": "declare", "name": "label"},
            {"kind": "assign", "target": "label", "value": text("hot")},
            {"kind": "return", "payload": {"fields": [{"key": "label", "value": var("label")}]}}
        ]))
        .unwrap();
        assert_eq!(compiled.return_shape.fields[0].ty, ValueType::text());
    }

    #[test]
    fn batch_insert_over_json_items() {
        let compiled = compile_steps(json!([
            {"kind": "declare", "name": "items", "type": {"base": "json"}},
            {"kind": "batch_operation", "entity": "Company", "operation": "insert",
             "items": var("items"), "iterator": "item",
             "values": [{"field": "name", "value": {"expr": "member", "base": var("item"), "member": "name"}}]}
        ]))
        .unwrap();
        assert!(compiled.diagnostics.is_empty());

        let result = compile_steps(json!([
            {"kind": "batch_operation", "entity": "Company", "operation": "insert",
             "items": int(3), "iterator": "item", "values": []}
        ]));
        assert_eq!(
            error_codes(&result),
            vec![DiagnosticCode::TypeMismatch, DiagnosticCode::TypeMismatch]
        );
    }

    #[test]
    fn array_elements_must_unify() {
        let result = compile_steps(json!([
            {"kind": "array_build", "into": "xs", "elements": [int(1), text("a")]}
        ]));
        assert_eq!(error_codes(&result), vec![DiagnosticCode::TypeMismatch]);
    }
}
