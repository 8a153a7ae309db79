//! Cross-module emission behaviour: determinism, batch isolation, profile
//! capabilities and the legacy fallbacks.

use pretty_assertions::assert_eq;
use serde_json::json;
use specql_codegen::{
    emitter_for, generate, Dialect, EmissionError, PlPgSqlEmitter, TargetEmitter, TargetProfile,
    TypeScriptEmitter,
};
use specql_core::diagnostic::{Diagnostic, DiagnosticCode, Location};
use specql_core::{compile_batch, CompileOptions, CompiledAction, EntitySpec, StaticCatalog};

fn crm() -> Vec<EntitySpec> {
    serde_json::from_value(json!([
        {"name": "Contact", "schema": "crm", "fields": [
            {"name": "email", "type": {"base": "email"}, "required": true},
            {"name": "status", "type": {"base": "enum", "values": ["lead", "qualified", "lost"]}},
            {"name": "score", "type": {"base": "integer"}}
        ], "actions": [{
            "name": "qualify_lead",
            "inputs": [{"name": "threshold", "type": {"base": "integer"}, "required": true}],
            "steps": [
                {"kind": "validate",
                 "condition": {"expr": "binary", "op": "ge",
                     "left": {"expr": "var", "name": "score"},
                     "right": {"expr": "var", "name": "threshold"}},
                 "failure_code": "score_too_low", "message": "score below threshold"},
                {"kind": "switch", "subject": {"expr": "var", "name": "status"}, "cases": [
                    {"values": [{"type": "text", "value": "qualified"}],
                     "steps": [{"kind": "return_early", "payload": {"status": "noop"}}]},
                    {"values": [{"type": "text", "value": "lost"}],
                     "steps": [{"kind": "return_early", "payload": {"status": "failed:lost"}}]}
                ]},
                {"kind": "update", "entity": "Contact", "set": [
                    {"field": "status", "value": {"expr": "literal", "value": {"type": "text", "value": "qualified"}}}
                ]},
                {"kind": "return", "payload": {"fields": [
                    {"key": "status", "value": {"expr": "literal", "value": {"type": "text", "value": "qualified"}}}
                ]}}
            ]
        }]},
        {"name": "Company", "schema": "crm", "fields": [
            {"name": "name", "type": {"base": "text"}, "required": true}
        ], "actions": [{"name": "rename", "inputs": [
            {"name": "name", "type": {"base": "text"}, "required": true}
        ], "steps": [
            {"kind": "update", "entity": "Company", "set": [
                {"field": "name", "value": {"expr": "var", "name": "name"}}
            ]}
        ]}]}
    ]))
    .unwrap()
}

fn compiled_actions(entities: &[EntitySpec]) -> Vec<CompiledAction> {
    let out = compile_batch(entities, &StaticCatalog::new(), &CompileOptions::default());
    assert!(!out.has_errors(), "{:?}", out.all_diagnostics());
    out.compiled().cloned().collect()
}

#[test]
fn emission_is_deterministic() {
    let entities = crm();
    for profile in [
        TargetProfile::postgres(),
        TargetProfile::postgres_legacy(),
        TargetProfile::typescript(),
    ] {
        let emitter = emitter_for(profile.dialect);
        let first: Vec<_> = compiled_actions(&entities)
            .iter()
            .map(|c| emitter.emit(c, &profile).unwrap())
            .collect();
        let second: Vec<_> = compiled_actions(&entities)
            .iter()
            .map(|c| emitter.emit(c, &profile).unwrap())
            .collect();
        assert_eq!(first, second);
    }
}

#[test]
fn compiling_alone_or_together_gives_identical_artifacts() {
    let entities = crm();
    let profile = TargetProfile::postgres();
    let alone = compiled_actions(&entities[..1]);
    let together = compiled_actions(&entities);
    assert_eq!(
        PlPgSqlEmitter.emit(&alone[0], &profile).unwrap(),
        PlPgSqlEmitter.emit(&together[0], &profile).unwrap()
    );
}

#[test]
fn legacy_profile_lowers_switch_and_early_return() {
    let entities = crm();
    let compiled = compiled_actions(&entities);
    let native = PlPgSqlEmitter
        .emit(&compiled[0], &TargetProfile::postgres())
        .unwrap()
        .content;
    let legacy = PlPgSqlEmitter
        .emit(&compiled[0], &TargetProfile::postgres_legacy())
        .unwrap()
        .content;

    assert!(native.contains("CASE ("));
    assert!(native.contains("END CASE;"));
    assert!(native.matches("RETURN v_result;").count() > 1);

    assert!(!legacy.contains("CASE"));
    assert!(legacy.contains("v_switch_1 TEXT;"));
    assert!(legacy.contains("v_done BOOLEAN := FALSE;"));
    assert_eq!(legacy.matches("RETURN v_result;").count(), 1);
    assert!(legacy.contains("IF NOT v_done THEN"));
}

#[test]
fn missing_capability_is_reported() {
    let entities: Vec<EntitySpec> = serde_json::from_value(json!([
        {"name": "Contact", "fields": [{"name": "email", "type": {"base": "email"}}],
         "actions": [{"name": "guarded", "steps": [
            {"kind": "try_catch", "body": [], "catches": [{"on": "default", "steps": []}]}
         ]}]}
    ]))
    .unwrap();
    let compiled = compiled_actions(&entities);
    let mut profile = TargetProfile::postgres();
    profile.capabilities.native_try_catch = false;
    let err = PlPgSqlEmitter.emit(&compiled[0], &profile).unwrap_err();
    assert_eq!(
        err,
        EmissionError::TargetCapabilityMissing {
            profile: "postgres".into(),
            construct: "try/catch",
            entity: "Contact".into(),
            action: "guarded".into(),
        }
    );
}

#[test]
fn actions_with_errors_are_rejected() {
    let entities = crm();
    let mut compiled = compiled_actions(&entities).remove(1);
    let diagnostic = Diagnostic::new(
        DiagnosticCode::TypeMismatch,
        Location {
            entity: "Company".into(),
            action: Some("rename".into()),
            step: Default::default(),
        },
        "forced",
    );
    compiled.diagnostics.push(diagnostic);
    for emitter in [&PlPgSqlEmitter as &dyn TargetEmitter, &TypeScriptEmitter] {
        let profile = match emitter.dialect() {
            Dialect::Postgres => TargetProfile::postgres(),
            Dialect::TypeScript => TargetProfile::typescript(),
        };
        assert!(matches!(
            emitter.emit(&compiled, &profile),
            Err(EmissionError::InvalidCompiledAction { .. })
        ));
    }
}

#[test]
fn generate_isolates_failing_entities() {
    let mut entities = crm();
    let broken: EntitySpec = serde_json::from_value(json!({
        "name": "Deal", "schema": "crm", "fields": [
            {"name": "owner", "type": {"base": "reference", "entity": "Nobody"}}
        ]
    }))
    .unwrap();
    entities.push(broken);
    let batch = compile_batch(&entities, &StaticCatalog::new(), &CompileOptions::default());
    let generated = generate(&batch, &entities, &TargetProfile::postgres());

    let paths: Vec<&str> = generated.artifacts.iter().map(|a| a.path.as_str()).collect();
    assert_eq!(
        paths,
        vec![
            "app/mutation_result.sql",
            "app/tables/tb_job_run.sql",
            "crm/tables/tb_contact.sql",
            "crm/tables/tb_company.sql",
            "crm/functions/qualify_lead.sql",
            "crm/functions/rename.sql",
        ]
    );
    assert_eq!(generated.failures.len(), 1);
    assert_eq!(generated.failures[0].entity, "Deal");
    assert!(matches!(
        generated.failures[0].source,
        Some(EmissionError::UnresolvedReference { .. })
    ));
}

#[test]
fn typescript_generation_layout() {
    let entities = crm();
    let batch = compile_batch(&entities, &StaticCatalog::new(), &CompileOptions::default());
    let generated = generate(&batch, &entities, &TargetProfile::typescript());
    assert!(generated.is_clean());
    let paths: Vec<&str> = generated.artifacts.iter().map(|a| a.path.as_str()).collect();
    assert_eq!(
        paths,
        vec![
            "runtime.ts",
            "crm/contact/types.ts",
            "crm/company/types.ts",
            "crm/contact/qualify_lead.ts",
            "crm/company/rename.ts",
        ]
    );
    let qualify = &generated.artifacts[3].content;
    assert!(qualify.contains("switch ((await db.value<\"lead\" | \"qualified\" | \"lost\">("));
    assert!(qualify.contains("case \"qualified\":"));
    assert!(qualify.contains("status: \"failed:lost\""));
}
