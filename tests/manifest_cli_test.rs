//! Manifest-driven commands, exercised through their `run` entry points.

mod common;

use std::fs;
use std::path::{Path, PathBuf};

use clap::Parser;
use serde_json::json;
use statetrait::cli::commands::{config, converge, ir, plan};
use statetrait::cli::output::CommandOutput;
use statetrait::cli::{Cli, Commands};
use statetrait::domain::models::{ConfigScope, ConvergeMode, DecisionReason, PatchReason};

const MANIFEST: &str = r"
module_id: checkout
schema:
  subtotal: 0
  shipping: 0
  items: []
traits:
  total:
    kind: computed
    deps: [subtotal, shipping]
    derive: sum
  label:
    kind: link
    from: total
  errors:
    kind: list-check
    list: items
    key: sku
";

fn write_manifest(dir: &Path) -> PathBuf {
    let path = dir.join("checkout.yaml");
    fs::write(&path, MANIFEST).unwrap();
    path
}

fn converge_args(dir: &Path, state: &str) -> converge::ConvergeArgs {
    converge::ConvergeArgs {
        manifest: write_manifest(dir),
        state: state.to_string(),
        dirty: Vec::new(),
        mode: None,
        txn_seq: 1,
        config_root: dir.to_path_buf(),
    }
}

#[test]
fn test_plan_lists_steps_in_dependency_order() {
    let dir = common::temp_dir();
    let output = plan::run(&plan::PlanArgs {
        manifest: write_manifest(dir.path()),
    })
    .unwrap();

    assert_eq!(output.module_id, "checkout");
    let order: Vec<&str> = output.steps.iter().map(|s| s.field_path.as_str()).collect();
    let total = order.iter().position(|p| *p == "total").unwrap();
    let label = order.iter().position(|p| *p == "label").unwrap();
    assert!(total < label);
    assert!(output.schema_mismatches.contains(&"label".to_string()));
    assert!(output.to_human().contains("Digest:"));
}

#[test]
fn test_ir_is_stable_across_runs() {
    let dir = common::temp_dir();
    let args = ir::IrArgs {
        manifest: write_manifest(dir.path()),
    };
    let first = ir::run(&args).unwrap();
    let second = ir::run(&args).unwrap();

    assert_eq!(first.0, second.0);
    assert_eq!(first.0.nodes.len(), 3);
    let json = first.to_json();
    assert_eq!(json["module_id"], json!("checkout"));
    assert!(json["digest"].as_str().unwrap().starts_with("ir1:"));
}

#[test]
fn test_converge_cold_start_derives_everything() {
    let dir = common::temp_dir();
    let args = converge_args(dir.path(), r#"{"subtotal": 10, "shipping": 5, "items": []}"#);

    let report = converge::run(&args).unwrap();

    assert!(report.outcome.summary().has_reason(DecisionReason::ColdStart));
    assert_eq!(report.state["total"], json!(15));
    assert_eq!(report.state["label"], json!(15));
    assert_eq!(report.state["errors"], json!([]));
    assert!(report
        .patches
        .iter()
        .any(|p| p.path == "label" && p.reason == PatchReason::Link));
}

#[test]
fn test_converge_dirty_pass_from_state_file() {
    let dir = common::temp_dir();
    let state_file = dir.path().join("state.json");
    fs::write(
        &state_file,
        r#"{"subtotal": 10, "shipping": 7, "items": [], "total": 15, "label": 15, "errors": []}"#,
    )
    .unwrap();
    let mut args = converge_args(dir.path(), state_file.to_str().unwrap());
    args.dirty = vec!["shipping".to_string()];
    args.mode = Some(ConvergeMode::Dirty);
    args.txn_seq = 2;

    let report = converge::run(&args).unwrap();
    let summary = report.outcome.summary();

    assert_eq!(summary.config_scope, ConfigScope::Provider);
    assert_eq!(summary.step_stats.executed, 2);
    assert_eq!(report.state["label"], json!(17));
    assert_eq!(report.patches.len(), 2);
}

#[test]
fn test_converge_rejects_invalid_state() {
    let dir = common::temp_dir();
    let args = converge_args(dir.path(), "{not json");

    let err = converge::run(&args).unwrap_err();
    assert!(format!("{err:#}").contains("--state"));
}

#[test]
fn test_config_reports_module_overrides() {
    let dir = common::temp_dir();
    let config_dir = dir.path().join(".statetrait");
    fs::create_dir_all(&config_dir).unwrap();
    fs::write(
        config_dir.join("config.yaml"),
        "converge:\n  trait_converge_overrides_by_module_id:\n    checkout:\n      trait_converge_mode: full\n",
    )
    .unwrap();

    let output = config::run(&config::ConfigArgs {
        module_id: "checkout".to_string(),
        config_root: dir.path().to_path_buf(),
    })
    .unwrap();

    assert_eq!(output.resolved.mode, ConvergeMode::Full);
    assert_eq!(output.resolved.config_scope, ConfigScope::RuntimeModule);
    assert_eq!(output.overridden_modules, vec!["checkout".to_string()]);
    assert!(output.to_human().contains("runtime_module"));
}

#[test]
fn test_cli_parses_converge_flags() {
    let cli = Cli::try_parse_from([
        "statetrait",
        "--json",
        "converge",
        "checkout.yaml",
        "--state",
        "{}",
        "-d",
        "a",
        "-d",
        "b.c",
        "--mode",
        "dirty",
    ])
    .unwrap();

    assert!(cli.json);
    let Commands::Converge(args) = cli.command else {
        panic!("expected the converge command");
    };
    assert_eq!(args.dirty, vec!["a", "b.c"]);
    assert_eq!(args.mode, Some(ConvergeMode::Dirty));
    assert_eq!(args.txn_seq, 2);
}

#[test]
fn test_cli_rejects_unknown_mode() {
    let result = Cli::try_parse_from(["statetrait", "converge", "m.yaml", "-s", "{}", "-m", "fast"]);
    assert!(result.is_err());
}
