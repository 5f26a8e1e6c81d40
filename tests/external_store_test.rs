//! External-store traits: seeding, write-back and ownership.

mod common;

use std::sync::Arc;

use serde_json::{json, Value};
use statetrait::domain::models::{
    DiagnosticLevel, PatchReason, SamplingConfig, StateSchema, TraitEntry, TraitSpec,
};
use statetrait::services::external_store::EXTERNAL_STORE_MISSING;
use statetrait::services::{
    build, DiagnosticsHub, MemorySink, RuntimeOptions, StoreRegistry, TraitRuntime,
};
use statetrait::DomainError;
use tokio::sync::watch;

/// `rate` comes from the `fx` store; `converted = amount * rate`.
fn spec() -> TraitSpec {
    TraitSpec::new()
        .with(TraitEntry::external_store("rate", "fx"))
        .with(TraitEntry::computed("converted", ["amount", "rate"], |d| {
            Ok(json!(d.as_f64(0).unwrap_or(0.0) * d.as_f64(1).unwrap_or(0.0)))
        }))
}

fn fx(initial: Value) -> (Arc<watch::Sender<Value>>, RuntimeOptions) {
    let sender = Arc::new(watch::channel(initial).0);
    let stores = StoreRegistry::new().with("fx", sender.clone());
    (sender, RuntimeOptions::new().with_stores(Arc::new(stores)))
}

#[tokio::test]
async fn test_store_value_seeds_the_field() {
    let (_sender, options) = fx(json!(2));
    let (rt, _clock, log) = common::manual_runtime(&spec(), json!({"amount": 10}), options);

    assert_eq!(rt.state()["rate"], json!(2));
    assert_eq!(rt.followed_stores(), 1);

    rt.transaction(|_| Ok(())).await.unwrap();
    assert_eq!(rt.state()["converted"], json!(20.0));
    assert!(log.with_reason(PatchReason::ExternalStore).is_empty());
}

#[tokio::test]
async fn test_store_changes_are_written_back_and_converged() {
    let (sender, options) = fx(json!(2));
    let (rt, _clock, log) = common::manual_runtime(&spec(), json!({"amount": 10}), options);
    rt.transaction(|_| Ok(())).await.unwrap();

    sender.send_replace(json!(3));
    let converged = common::wait_for(|| rt.state()["converted"] == json!(30.0), 2_000).await;
    assert!(converged, "store change converged into dependents");

    let writes = log.with_reason(PatchReason::ExternalStore);
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].path, "rate");
    assert_eq!(writes[0].from, json!(2));
    assert_eq!(writes[0].to, json!(3));
    assert_eq!(writes[0].trait_node_id.as_deref(), Some("rate"));
    assert_eq!(writes[0].txn_seq, 2);

    for rate in 4..8 {
        sender.send_replace(json!(rate));
    }
    let latest = common::wait_for(|| rt.state()["converted"] == json!(70.0), 2_000).await;
    assert!(latest, "latest store value wins");
}

#[tokio::test]
async fn test_host_cannot_write_the_store_field() {
    let (_sender, options) = fx(json!(2));
    let (rt, _clock, _log) = common::manual_runtime(&spec(), json!({"amount": 10}), options);

    let err = rt.transaction(|tx| tx.set("rate", json!(5))).await.unwrap_err();
    assert!(matches!(err, DomainError::TraitOwnedWrite { .. }));
    assert_eq!(rt.state()["rate"], json!(2));
}

#[tokio::test]
async fn test_explicit_store_write_runs_its_own_transaction() {
    let (_sender, options) = fx(json!(2));
    let (rt, _clock, _log) = common::manual_runtime(&spec(), json!({"amount": 10}), options);

    let outcome = rt.apply_external_store("rate", json!(1.5)).await.unwrap();
    assert!(outcome.expect("value changed").is_converged());
    assert_eq!(rt.txn_seq(), 1);
    assert_eq!(rt.state()["converted"], json!(15.0));

    assert!(rt.apply_external_store("rate", json!(1.5)).await.unwrap().is_none());
    assert_eq!(rt.txn_seq(), 1);

    let err = rt.apply_external_store("amount", json!(1)).await.unwrap_err();
    assert!(matches!(err, DomainError::NotExternalStore { .. }));
}

#[tokio::test]
async fn test_unregistered_store_is_reported() {
    let sink = Arc::new(MemorySink::new());
    let program = Arc::new(build(&StateSchema::new(), &spec()).unwrap());
    let options = RuntimeOptions::new().with_diagnostics(
        DiagnosticsHub::new(DiagnosticLevel::Light, SamplingConfig::default()).with_sink(sink.clone()),
    );
    let rt = TraitRuntime::new("fx-less", program, json!({"amount": 10}), options);

    assert!(rt.state().get("rate").is_none());
    assert_eq!(rt.followed_stores(), 0);
    let warnings = sink.with_code(EXTERNAL_STORE_MISSING);
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].data["stores"], json!(["fx"]));
}
