//! Deferred steps, flush windows and lane slicing through the runtime.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use statetrait::domain::models::{
    ConvergePatch, SchedulingScope, StateSchema, TimeSlicingPatch, TraitEntry,
    TraitSpec, TxnLanesPatch,
};
use statetrait::infrastructure::patch_log::PatchLog;
use statetrait::services::diagnostics::DiagnosticsHub;
use statetrait::services::{build, RuntimeHandle, RuntimeOptions, TraitRuntime};

const FAR: f64 = 1.0e9;

/// `fast = n * 2` plus `deferred` steps `slow{i} = n + i`.
fn sliced_spec(deferred: usize) -> TraitSpec {
    let mut spec = TraitSpec::new()
        .with(TraitEntry::computed("fast", ["n"], |d| {
            Ok(json!(d.as_f64(0).unwrap_or(0.0) * 2.0))
        }))
        .with(TraitEntry::link("mirror", "other"));
    for i in 0..deferred {
        let offset = i as f64;
        spec.push(
            TraitEntry::computed(format!("slow{i}"), ["n"], move |d| {
                Ok(json!(d.as_f64(0).unwrap_or(0.0) + offset))
            })
            .deferred(),
        );
    }
    spec
}

/// Time slicing on, with windows so wide that only `flush_now` flushes.
fn manual_flush_handle(lanes: bool) -> RuntimeHandle {
    let handle = RuntimeHandle::new();
    handle.set_default(ConvergePatch {
        trait_converge_time_slicing: Some(TimeSlicingPatch {
            enabled: Some(true),
            debounce_ms: Some(FAR),
            max_lag_ms: Some(FAR),
        }),
        txn_lanes: Some(TxnLanesPatch {
            enabled: Some(lanes),
            debounce_ms: Some(FAR),
            max_lag_ms: Some(FAR),
            ..TxnLanesPatch::default()
        }),
        ..ConvergePatch::default()
    });
    handle
}

fn state() -> Value {
    json!({"n": 1, "other": "a"})
}

#[tokio::test]
async fn test_deferred_steps_wait_for_flush() {
    let options = RuntimeOptions::new().with_handle(manual_flush_handle(true));
    let (rt, _clock, _log) = common::manual_runtime(&sliced_spec(3), state(), options);

    let outcome = rt.transaction(|tx| tx.set("n", json!(5))).await.unwrap();
    let slicing = outcome.summary().time_slicing.expect("time slicing summary");
    assert_eq!(slicing.scope, SchedulingScope::Immediate);
    assert_eq!(slicing.deferred_step_count, 3);

    let current = rt.state();
    assert_eq!(current["fast"], json!(10.0));
    assert!(current.get("slow0").is_none());
    assert!(rt.pending_deferred().is_some());

    let outcomes = rt.flush_now().await;
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].summary().scheduling_scope, SchedulingScope::Deferred);

    let current = rt.state();
    assert_eq!(current["slow0"], json!(5.0));
    assert_eq!(current["slow2"], json!(7.0));
    assert!(rt.pending_deferred().is_none());
}

#[tokio::test]
async fn test_lane_flush_runs_in_slices() {
    let options = RuntimeOptions::new().with_handle(manual_flush_handle(true));
    let (rt, _clock, _log) = common::manual_runtime(&sliced_spec(70), state(), options);

    rt.transaction(|tx| tx.set("n", json!(2))).await.unwrap();
    let outcomes = rt.flush_now().await;

    assert_eq!(outcomes.len(), 3);
    assert!(outcomes.iter().all(|o| o.degrade_reason().is_none()));
    let current = rt.state();
    assert_eq!(current["slow0"], json!(2.0));
    assert_eq!(current["slow69"], json!(71.0));
}

#[tokio::test]
async fn test_without_lanes_the_flush_is_one_pass() {
    let options = RuntimeOptions::new().with_handle(manual_flush_handle(false));
    let (rt, _clock, _log) = common::manual_runtime(&sliced_spec(70), state(), options);

    rt.transaction(|tx| tx.set("n", json!(2))).await.unwrap();
    let outcomes = rt.flush_now().await;

    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].summary().step_stats.changed, 70);
    assert_eq!(rt.state()["slow69"], json!(71.0));
}

#[tokio::test]
async fn test_unrelated_writes_schedule_nothing() {
    let options = RuntimeOptions::new().with_handle(manual_flush_handle(true));
    let (rt, _clock, log) = common::manual_runtime(&sliced_spec(2), state(), options);

    rt.transaction(|tx| tx.set("n", json!(3))).await.unwrap();
    rt.flush_now().await;
    assert!(rt.pending_deferred().is_none());

    rt.transaction(|tx| tx.set("other", json!("b"))).await.unwrap();
    assert!(rt.pending_deferred().is_none());
    assert_eq!(rt.state()["mirror"], json!("b"));
    assert!(rt.flush_now().await.is_empty());

    let txn = rt.txn_seq();
    let slow_writes = log
        .for_txn(txn)
        .into_iter()
        .filter(|p| p.path.starts_with("slow"))
        .count();
    assert_eq!(slow_writes, 0);
}

#[tokio::test]
async fn test_deferred_dirty_pass_after_second_write() {
    let options = RuntimeOptions::new().with_handle(manual_flush_handle(true));
    let (rt, _clock, _log) = common::manual_runtime(&sliced_spec(4), state(), options);

    rt.transaction(|tx| tx.set("n", json!(1))).await.unwrap();
    rt.flush_now().await;

    rt.transaction(|tx| tx.set("n", json!(10))).await.unwrap();
    let pending = rt.pending_deferred().expect("n feeds deferred steps");
    assert!(pending.roots.contains(&"n".to_string()));
    assert!(pending.dirty_all.is_none());

    let outcomes = rt.flush_now().await;
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].summary().step_stats.changed, 4);
    assert_eq!(rt.state()["slow3"], json!(13.0));
}

#[tokio::test]
async fn test_scheduler_flushes_after_the_window() {
    let rt = scheduled_runtime(&sliced_spec(2), 5.0, 20.0);

    rt.transaction(|tx| tx.set("n", json!(4))).await.unwrap();
    let flushed = common::wait_for(|| rt.state().get("slow1") == Some(&json!(5.0)), 2_000).await;

    assert!(flushed, "deferred steps flushed by the scheduler");
    assert!(rt.pending_deferred().is_none());
}

/// `fast = n * 2` plus one deferred `slow = n + 1` that blocks until `release` is set.
fn gated_spec(started: Arc<AtomicBool>, release: Arc<AtomicBool>) -> TraitSpec {
    TraitSpec::new()
        .with(TraitEntry::computed("fast", ["n"], |d| {
            Ok(json!(d.as_f64(0).unwrap_or(0.0) * 2.0))
        }))
        .with(
            TraitEntry::computed("slow", ["n"], move |d| {
                started.store(true, Ordering::SeqCst);
                while !release.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(1));
                }
                Ok(json!(d.as_f64(0).unwrap_or(0.0) + 1.0))
            })
            .deferred(),
        )
}

fn scheduled_runtime(spec: &TraitSpec, debounce_ms: f64, max_lag_ms: f64) -> TraitRuntime {
    let handle = RuntimeHandle::new();
    handle.set_default(ConvergePatch {
        trait_converge_time_slicing: Some(TimeSlicingPatch {
            enabled: Some(true),
            debounce_ms: Some(debounce_ms),
            max_lag_ms: Some(max_lag_ms),
        }),
        ..ConvergePatch::default()
    });
    let program = Arc::new(build(&StateSchema::new(), spec).unwrap());
    let options = RuntimeOptions::new()
        .with_handle(handle)
        .with_recorder(Arc::new(PatchLog::new()))
        .with_diagnostics(DiagnosticsHub::off());
    TraitRuntime::new("scheduled", program, state(), options)
}

#[tokio::test]
async fn test_urgent_transaction_runs_during_deferred_flush() {
    let started = Arc::new(AtomicBool::new(false));
    let release = Arc::new(AtomicBool::new(false));
    let spec = gated_spec(Arc::clone(&started), Arc::clone(&release));
    let options = RuntimeOptions::new().with_handle(manual_flush_handle(true));
    let (rt, _clock, _log) = common::manual_runtime(&spec, state(), options);

    rt.transaction(|tx| tx.set("n", json!(5))).await.unwrap();
    assert!(rt.state().get("slow").is_none());

    let urgent = async {
        assert!(common::wait_for(|| started.load(Ordering::SeqCst), 2_000).await);
        let outcome = tokio::time::timeout(
            Duration::from_secs(2),
            rt.transaction(|tx| tx.set("n", json!(6))),
        )
        .await;
        let during = rt.state();
        release.store(true, Ordering::SeqCst);
        (outcome, during)
    };
    let (flushed, (outcome, during)) = tokio::join!(rt.flush_now(), urgent);

    let outcome = outcome.expect("urgent transaction does not wait for the deferred lane");
    assert!(outcome.unwrap().is_converged());
    assert_eq!(during["fast"], json!(12.0));
    assert!(during.get("slow").is_none());

    assert_eq!(flushed.len(), 1);
    assert_eq!(rt.state()["fast"], json!(12.0));
    assert!(rt.state().get("slow").is_some());
    assert!(rt.pending_deferred().is_some());
}

#[tokio::test]
async fn test_max_lag_forces_flush_under_continuous_writes() {
    let rt = scheduled_runtime(&sliced_spec(1), 10_000.0, 10.0);
    let begun = Instant::now();

    let mut n = 0;
    while rt.state().get("slow0").is_none() && begun.elapsed() < Duration::from_secs(3) {
        n += 1;
        rt.transaction(|tx| tx.set("n", json!(n))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    assert!(rt.state().get("slow0").is_some(), "flushed before the debounce window closed");
    assert!(begun.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn test_deferred_output_lags_the_triggering_transaction() {
    let rt = scheduled_runtime(&sliced_spec(1), 20.0, 100.0);

    rt.transaction(|tx| tx.set("n", json!(3))).await.unwrap();
    assert_eq!(rt.state()["fast"], json!(6.0));
    assert!(rt.state().get("slow0").is_none());
    assert!(rt.pending_deferred().is_some());

    assert!(common::wait_for(|| rt.state().get("slow0") == Some(&json!(3.0)), 2_000).await);

    rt.transaction(|tx| tx.set("n", json!(8))).await.unwrap();
    assert_eq!(rt.state()["fast"], json!(16.0));
    assert_eq!(rt.state()["slow0"], json!(3.0));

    assert!(common::wait_for(|| rt.state().get("slow0") == Some(&json!(8.0)), 2_000).await);
    assert!(rt.pending_deferred().is_none());
}
