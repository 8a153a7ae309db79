//! Bundle-level compilation: loading, catalog use, option handling and
//! per-action isolation.

use specql_core::compiled::{CompiledStep, MutationFilter};
use specql_core::{compile_batch, Bundle, CompileOptions, DiagnosticCode, SymbolKind};

const BUNDLE: &str = r#"{
  "entities": [
    {"name": "Contact", "schema": "crm", "fields": [
      {"name": "email", "type": {"base": "email"}, "required": true},
      {"name": "score", "type": {"base": "integer"}},
      {"name": "company", "type": {"base": "reference", "entity": "Company"}}
    ], "actions": [
      {"name": "rescore", "inputs": [{"name": "bonus", "type": {"base": "integer"}}],
       "steps": [
        {"kind": "call_function", "function": "crm.score_lead",
         "args": [{"key": "email", "value": {"expr": "var", "name": "email"}}],
         "into": "base"},
        {"kind": "update", "entity": "Contact", "set": [
          {"field": "score", "value": {"expr": "binary", "op": "add",
            "left": {"expr": "var", "name": "base"},
            "right": {"expr": "call", "function": "coalesce",
              "args": [{"expr": "var", "name": "bonus"},
                       {"expr": "literal", "value": {"type": "integer", "value": 0}}]}}}
        ]},
        {"kind": "return", "payload": {"fields": [
          {"key": "score", "value": {"expr": "var", "name": "base"}}
        ]}}
      ]},
      {"name": "purge", "steps": [
        {"kind": "delete", "entity": "Company"},
        {"kind": "call_function", "function": "crm.missing"}
      ]}
    ]},
    {"name": "Company", "schema": "crm", "fields": [
      {"name": "name", "type": {"base": "text"}, "required": true}
    ], "actions": [
      {"name": "bad", "steps": [
        {"kind": "assign", "target": "name", "value": {"expr": "var", "name": "ghost"}}
      ]}
    ]}
  ],
  "functions": [
    {"name": "crm.score_lead",
     "params": [{"name": "email", "type": {"base": "email"}, "required": true}],
     "returns": {"base": "integer"}}
  ]
}"#;

#[test]
fn bundle_compiles_with_catalog_types() {
    let bundle = Bundle::from_json_str(BUNDLE).unwrap();
    let out = compile_batch(
        &bundle.entities,
        &bundle.function_catalog(),
        &CompileOptions::default(),
    );

    let rescore = out.actions[0].result.as_ref().unwrap();
    assert_eq!(rescore.return_shape.field_names(), vec!["score"]);
    assert!(rescore.uses_current_record);
    let base = rescore
        .locals()
        .find(|s| s.name == "base")
        .expect("call target local");
    assert_eq!(base.kind, SymbolKind::Local);
    assert_eq!(base.ty.as_scalar().map(|t| t.key()), Some("integer"));
    assert!(matches!(
        &rescore.body[1],
        CompiledStep::Update { filter: MutationFilter::CurrentRecord, .. }
    ));
}

#[test]
fn failures_and_warnings_stay_with_their_action() {
    let bundle = Bundle::from_json_str(BUNDLE).unwrap();
    let out = compile_batch(
        &bundle.entities,
        &bundle.function_catalog(),
        &CompileOptions::default(),
    );

    let purge = out.actions[1].result.as_ref().unwrap();
    let codes: Vec<DiagnosticCode> = purge.diagnostics.iter().map(|d| d.code).collect();
    assert_eq!(
        codes,
        vec![
            DiagnosticCode::UnfilteredMutation,
            DiagnosticCode::UnknownFunctionWarning
        ]
    );

    let bad = out.actions[2].result.as_ref().unwrap_err();
    assert!(bad.contains_code(DiagnosticCode::UnknownVariable));
    assert!(out.actions[0].diagnostics().iter().next().is_none());
}

#[test]
fn strict_and_escalated_options() {
    let bundle = Bundle::from_json_str(BUNDLE).unwrap();
    let catalog = bundle.function_catalog();

    let strict = compile_batch(
        &bundle.entities,
        &catalog,
        &CompileOptions {
            strict: true,
            warnings_as_errors: false,
        },
    );
    let purge = strict.actions[1].result.as_ref().unwrap_err();
    assert!(purge.contains_code(DiagnosticCode::UnknownFunctionWarning));
    assert!(strict.actions[0].result.is_ok());

    let escalated = compile_batch(
        &bundle.entities,
        &catalog,
        &CompileOptions {
            strict: false,
            warnings_as_errors: true,
        },
    );
    let purge = escalated.actions[1].result.as_ref().unwrap_err();
    assert!(purge.contains_code(DiagnosticCode::UnfilteredMutation));
    assert!(escalated.actions[0].result.is_ok());
}

#[test]
fn compiling_a_subset_gives_the_same_result() {
    let full = Bundle::from_json_str(BUNDLE).unwrap();
    let mut subset = full.clone();
    subset.entities[0].actions.truncate(1);

    let options = CompileOptions::default();
    let a = compile_batch(&full.entities, &full.function_catalog(), &options);
    let b = compile_batch(&subset.entities, &subset.function_catalog(), &options);
    assert_eq!(
        format!("{:?}", a.actions[0].result),
        format!("{:?}", b.actions[0].result)
    );
}
