//! Integration tests for single convergence passes.

mod common;

use std::sync::Arc;

use serde_json::{json, Value};
use statetrait::domain::models::{
    ConvergeMode, ConvergeOutcome, DecisionReason, DegradeReason, DirtyAllReason, DirtyInput,
    ExecutedMode, PatchReason, StateSchema, TraitEntry, TraitSpec,
};
use statetrait::domain::ports::Clock;
use statetrait::infrastructure::clock::ManualClock;
use statetrait::infrastructure::patch_log::PatchLog;
use statetrait::services::diagnostics::DiagnosticsHub;
use statetrait::services::{build, converge_in_transaction, ConvergeContext, InstanceCaches};
use statetrait::Program;

struct Harness {
    program: Program,
    state: Arc<Value>,
    caches: InstanceCaches,
    log: PatchLog,
    hub: DiagnosticsHub,
}

impl Harness {
    fn new(spec: &TraitSpec, state: Value) -> Self {
        Self {
            program: build(&StateSchema::new(), spec).unwrap(),
            state: Arc::new(state),
            caches: InstanceCaches::new(),
            log: PatchLog::new(),
            hub: DiagnosticsHub::off(),
        }
    }

    fn pass(
        &mut self,
        clock: &dyn Clock,
        txn_seq: u64,
        mode: ConvergeMode,
        dirty: DirtyInput,
        budget_ms: f64,
    ) -> ConvergeOutcome {
        let mut ctx = ConvergeContext::new(
            "engine",
            &mut self.state,
            &mut self.caches,
            &self.log,
            clock,
            &self.hub,
        )
        .with_txn_seq(txn_seq)
        .with_mode(mode)
        .with_budget_ms(budget_ms)
        .with_dirty(dirty);
        converge_in_transaction(&self.program, &mut ctx)
    }

    fn write(&mut self, path: &str, value: Value) {
        Arc::make_mut(&mut self.state)[path] = value;
    }
}

#[test]
fn test_budget_overrun_commits_nothing() {
    let n = 40;
    let mut h = Harness::new(&common::fan_spec(n), common::fan_state(n));
    let before = Arc::clone(&h.state);
    let clock = ManualClock::with_auto_tick(0.02);

    let outcome = h.pass(
        &clock,
        1,
        ConvergeMode::Auto,
        DirtyInput::all(DirtyAllReason::UnknownWrite),
        0.5,
    );

    assert_eq!(outcome.degrade_reason(), Some(DegradeReason::BudgetExceeded));
    assert!(outcome.summary().has_reason(DecisionReason::BudgetCutoff));
    assert!(Arc::ptr_eq(&h.state, &before), "state must be untouched");
    assert!(h.log.is_empty(), "no patch of an aborted pass is recorded");
    assert!(outcome.summary().step_stats.executed < n);
}

#[test]
fn test_dirty_pass_touches_only_affected_steps() {
    let n = 10;
    let mut h = Harness::new(&common::fan_spec(n), common::fan_state(n));
    let clock = ManualClock::new();

    let cold = h.pass(&clock, 1, ConvergeMode::Auto, DirtyInput::empty(), 200.0);
    assert!(cold.summary().has_reason(DecisionReason::ColdStart));
    assert_eq!(cold.patch_count(), n);

    h.write("in3", json!(5));
    let outcome = h.pass(&clock, 2, ConvergeMode::Auto, DirtyInput::paths(["in3"]), 200.0);

    let summary = outcome.summary();
    assert_eq!(summary.executed_mode, ExecutedMode::Dirty);
    assert_eq!(summary.step_stats.executed, 1);
    assert_eq!(h.state["out3"], json!(6.0));

    let second: Vec<_> = h.log.for_txn(2);
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].path, "out3");
    assert_eq!(second[0].reason, PatchReason::Computed);
    assert_eq!(second[0].from, json!(1.0));
}

#[test]
fn test_unchanged_inputs_are_a_noop() {
    let mut h = Harness::new(&common::fan_spec(3), common::fan_state(3));
    let clock = ManualClock::new();
    h.pass(&clock, 1, ConvergeMode::Auto, DirtyInput::empty(), 200.0);

    let outcome = h.pass(&clock, 2, ConvergeMode::Full, DirtyInput::paths(["in0"]), 200.0);
    assert!(outcome.is_noop());
    assert!(outcome.summary().has_reason(DecisionReason::ExplicitMode));
    assert_eq!(h.log.for_txn(2).len(), 0);
}

#[test]
fn test_chain_propagates_within_one_pass() {
    let spec = TraitSpec::new()
        .with(TraitEntry::link("c", "b"))
        .with(TraitEntry::computed("b", ["a"], |d| {
            Ok(json!(d.as_f64(0).unwrap_or(0.0) * 10.0))
        }))
        .with(TraitEntry::computed("unrelated", ["z"], |_| Ok(json!("z"))));
    let mut h = Harness::new(&spec, json!({"a": 1, "z": 0}));
    let clock = ManualClock::new();
    h.pass(&clock, 1, ConvergeMode::Auto, DirtyInput::empty(), 200.0);
    assert_eq!(h.state["c"], json!(10.0));

    h.write("a", json!(2));
    let outcome = h.pass(&clock, 2, ConvergeMode::Dirty, DirtyInput::paths(["a"]), 200.0);

    assert_eq!(outcome.summary().step_stats.executed, 2);
    assert_eq!(h.state["b"], json!(20.0));
    assert_eq!(h.state["c"], json!(20.0));
    let paths: Vec<String> = h.log.for_txn(2).into_iter().map(|p| p.path).collect();
    assert_eq!(paths, vec!["b", "c"]);
}

#[test]
fn test_failure_after_writes_rolls_back_everything() {
    let spec = TraitSpec::new()
        .with(TraitEntry::computed("first", ["a"], |d| Ok(d.get(0).clone())))
        .with(TraitEntry::computed("second", ["first"], |d| {
            if d.get(0) == &json!(13) {
                panic!("unlucky");
            }
            Ok(d.get(0).clone())
        }));
    let mut h = Harness::new(&spec, json!({"a": 1}));
    let clock = ManualClock::new();
    h.pass(&clock, 1, ConvergeMode::Auto, DirtyInput::empty(), 200.0);

    h.write("a", json!(13));
    let before = Arc::clone(&h.state);
    let outcome = h.pass(&clock, 2, ConvergeMode::Auto, DirtyInput::paths(["a"]), 200.0);

    match &outcome {
        ConvergeOutcome::Degraded { reason, error, .. } => {
            assert_eq!(*reason, DegradeReason::RuntimeError);
            assert!(error.as_deref().unwrap_or_default().contains("unlucky"));
        }
        other => panic!("expected degraded pass, got {other:?}"),
    }
    assert!(Arc::ptr_eq(&h.state, &before));
    assert_eq!(h.state["first"], json!(1));
    assert!(h.log.for_txn(2).is_empty());
}
