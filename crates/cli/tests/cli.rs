//! End-to-end tests for the `specql` binary.
//!
//! Every test runs inside its own temporary directory so the default
//! `specql.toml` lookup and the default output directory stay isolated.

use assert_cmd::cargo::cargo_bin_cmd;
use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::json;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn specql(dir: &Path) -> Command {
    let mut cmd = cargo_bin_cmd!("specql");
    cmd.current_dir(dir);
    cmd.env_remove("SPECQL_LOG").env_remove("RUST_LOG");
    cmd
}

fn contact(steps: serde_json::Value) -> serde_json::Value {
    json!({
        "entities": [{
            "name": "Contact", "schema": "crm",
            "fields": [
                {"name": "email", "type": {"base": "email"}, "required": true},
                {"name": "score", "type": {"base": "integer"}}
            ],
            "actions": [{
                "name": "bump_score",
                "inputs": [{"name": "amount", "type": {"base": "integer"}, "required": true}],
                "steps": steps
            }]
        }]
    })
}

fn valid_bundle() -> serde_json::Value {
    contact(json!([
        {"kind": "update", "entity": "Contact", "set": [
            {"field": "score", "value": {"expr": "binary", "op": "add",
                "left": {"expr": "var", "name": "score"},
                "right": {"expr": "var", "name": "amount"}}}
        ]}
    ]))
}

fn broken_bundle() -> serde_json::Value {
    contact(json!([
        {"kind": "update", "entity": "Contact", "set": [
            {"field": "score", "value": {"expr": "var", "name": "ghost"}}
        ]}
    ]))
}

fn write_bundle(dir: &TempDir, bundle: &serde_json::Value) -> String {
    let path = dir.path().join("bundle.json");
    fs::write(&path, serde_json::to_string_pretty(bundle).unwrap()).unwrap();
    "bundle.json".to_owned()
}

// ──────────────────────────────────────────────
// 1. Help
// ──────────────────────────────────────────────

#[test]
fn help_lists_subcommands() {
    let tmp = TempDir::new().unwrap();
    specql(tmp.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("SpecQL action compiler"))
        .stdout(predicate::str::contains("check"))
        .stdout(predicate::str::contains("compile"));
}

// ──────────────────────────────────────────────
// 2. check
// ──────────────────────────────────────────────

#[test]
fn check_valid_bundle_exits_0() {
    let tmp = TempDir::new().unwrap();
    let bundle = write_bundle(&tmp, &valid_bundle());
    specql(tmp.path())
        .args(["check", &bundle])
        .assert()
        .success()
        .stdout(predicate::str::contains("checked 1 actions: 0 failed"));
}

#[test]
fn check_reports_unknown_variable() {
    let tmp = TempDir::new().unwrap();
    let bundle = write_bundle(&tmp, &broken_bundle());
    specql(tmp.path())
        .args(["check", &bundle])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("UnknownVariable"))
        .stderr(predicate::str::contains("Contact.bump_score"))
        .stderr(predicate::str::contains("ghost"));
}

#[test]
fn check_json_output_parses() {
    let tmp = TempDir::new().unwrap();
    let bundle = write_bundle(&tmp, &broken_bundle());
    let output = specql(tmp.path())
        .args(["--output", "json", "check", &bundle])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["ok"], false);
    assert_eq!(report["failed"], 1);
    let codes: Vec<&str> = report["diagnostics"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|d| d["code"].as_str())
        .collect();
    assert!(codes.contains(&"UnknownVariable"), "{:?}", codes);
}

#[test]
fn warnings_as_errors_fails_unfiltered_update() {
    let tmp = TempDir::new().unwrap();
    let bundle = write_bundle(&tmp, &valid_bundle());
    specql(tmp.path())
        .args(["check", &bundle])
        .assert()
        .success()
        .stderr(predicate::str::contains("warning[UnfilteredMutation]"));
    specql(tmp.path())
        .args(["check", &bundle, "--warnings-as-errors"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("error[UnfilteredMutation]"));
}

#[test]
fn missing_bundle_exits_1() {
    let tmp = TempDir::new().unwrap();
    specql(tmp.path())
        .args(["check", "nope.json"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("nope.json"));
}

// ──────────────────────────────────────────────
// 3. compile
// ──────────────────────────────────────────────

#[test]
fn compile_writes_plpgsql_functions_and_tables() {
    let tmp = TempDir::new().unwrap();
    let bundle = write_bundle(&tmp, &valid_bundle());
    specql(tmp.path())
        .args(["compile", &bundle, "--out", "sql"])
        .assert()
        .success()
        .stdout(predicate::str::contains("profile 'postgres'"));

    let function = fs::read_to_string(tmp.path().join("sql/crm/functions/bump_score.sql")).unwrap();
    assert!(function.contains("CREATE OR REPLACE FUNCTION crm.bump_score("));
    assert!(tmp.path().join("sql/crm/tables/tb_contact.sql").exists());
    assert!(tmp.path().join("sql/app/mutation_result.sql").exists());
}

#[test]
fn compile_uses_profile_and_dir_from_config() {
    let tmp = TempDir::new().unwrap();
    let bundle = write_bundle(&tmp, &valid_bundle());
    fs::write(
        tmp.path().join("specql.toml"),
        "[target]\nprofile = \"typescript\"\n\n[output]\ndir = \"ts\"\n",
    )
    .unwrap();
    specql(tmp.path())
        .args(["compile", &bundle])
        .assert()
        .success();

    assert!(tmp.path().join("ts/runtime.ts").exists());
    assert!(tmp.path().join("ts/crm/contact/types.ts").exists());
    assert!(tmp.path().join("ts/crm/contact/bump_score.ts").exists());
}

#[test]
fn compile_skips_failed_actions_but_exits_1() {
    let tmp = TempDir::new().unwrap();
    let bundle = write_bundle(&tmp, &broken_bundle());
    specql(tmp.path())
        .args(["compile", &bundle])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("UnknownVariable"));

    assert!(!tmp.path().join("generated/crm/functions/bump_score.sql").exists());
    assert!(tmp.path().join("generated/crm/tables/tb_contact.sql").exists());
}

#[test]
fn unknown_profile_is_an_error() {
    let tmp = TempDir::new().unwrap();
    let bundle = write_bundle(&tmp, &valid_bundle());
    specql(tmp.path())
        .args(["compile", &bundle, "--profile", "oracle"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("unknown target profile 'oracle'"));
}

#[test]
fn invalid_config_is_an_error() {
    let tmp = TempDir::new().unwrap();
    let bundle = write_bundle(&tmp, &valid_bundle());
    fs::write(tmp.path().join("custom.toml"), "[linter]\nlevel = 3\n").unwrap();
    specql(tmp.path())
        .args(["--config", "custom.toml", "check", &bundle])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("could not parse 'custom.toml'"));
}

#[test]
fn compile_json_output_lists_written_files() {
    let tmp = TempDir::new().unwrap();
    let bundle = write_bundle(&tmp, &valid_bundle());
    let output = specql(tmp.path())
        .args(["--output", "json", "compile", &bundle, "--profile", "postgres-legacy"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["ok"], true);
    assert_eq!(report["profile"], "postgres-legacy");
    let written: Vec<&str> = report["written"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|p| p.as_str())
        .collect();
    assert!(written.contains(&"crm/functions/bump_score.sql"));
}
