//! Full versus dirty selection under a decision budget.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::domain::models::converge::{
    CacheEvidence, ConvergeMode, DecisionReason, DirtyAllReason, DirtySet, ExecutedMode,
};
use crate::domain::models::program::{Program, SchedulingScope, StepId};
use crate::domain::ports::Clock;
use crate::services::dirty_set::compute_plan;
use crate::services::plan_cache::DirtyPlanCache;

/// Plans selecting at least this share of the scope run as full passes.
const NEAR_FULL_PLAN_RATIO: f64 = 0.9;

/// Dirty samples required before history can override the decision.
const HISTORY_MIN_DIRTY_SAMPLES: usize = 4;

/// Dirty passes must cost this much more than full passes to be abandoned.
const HISTORY_FULL_PREFERENCE: f64 = 1.05;

/// Samples kept per mode for the moving averages.
const HISTORY_WINDOW: usize = 16;

/// Consecutive full passes after which dirty samples are considered stale.
pub const HISTORY_STALE_FULL_PASSES: usize = 8;

/// Root ratio at which a dirty pass is considered as expensive as a full one.
pub fn near_full_threshold(scope_steps: usize) -> f64 {
    match scope_steps {
        n if n >= 1536 => 0.65,
        n if n >= 1024 => 0.7,
        n if n >= 512 => 0.75,
        _ => 0.9,
    }
}

/// Moving averages of pass execution cost per executed mode.
#[derive(Debug, Clone, Default)]
pub struct ConvergeStats {
    full: VecDeque<f64>,
    dirty: VecDeque<f64>,
    full_streak: usize,
}

impl ConvergeStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one committed pass.
    ///
    /// A run of full passes drops the dirty samples, so a workload that has
    /// become sparse again gets a fresh dirty estimate.
    pub fn record(&mut self, mode: ExecutedMode, duration_ms: f64) {
        let samples = match mode {
            ExecutedMode::Full => {
                self.full_streak += 1;
                if self.full_streak >= HISTORY_STALE_FULL_PASSES {
                    self.dirty.clear();
                    self.full_streak = 0;
                }
                &mut self.full
            }
            ExecutedMode::Dirty => {
                self.full_streak = 0;
                &mut self.dirty
            }
        };
        if samples.len() == HISTORY_WINDOW {
            samples.pop_front();
        }
        samples.push_back(duration_ms);
    }

    pub fn full_average(&self) -> Option<f64> {
        average(&self.full)
    }

    pub fn dirty_average(&self) -> Option<f64> {
        average(&self.dirty)
    }

    pub fn dirty_samples(&self) -> usize {
        self.dirty.len()
    }

    /// True once enough dirty passes cost more than full passes.
    pub fn prefers_full(&self) -> bool {
        if self.dirty.len() < HISTORY_MIN_DIRTY_SAMPLES {
            return false;
        }
        match (self.dirty_average(), self.full_average()) {
            (Some(dirty), Some(full)) => dirty >= full * HISTORY_FULL_PREFERENCE,
            _ => false,
        }
    }
}

fn average(samples: &VecDeque<f64>) -> Option<f64> {
    if samples.is_empty() {
        None
    } else {
        Some(samples.iter().sum::<f64>() / samples.len() as f64)
    }
}

/// Inputs of one decision.
pub struct DecisionInput<'a> {
    pub program: &'a Program,
    pub requested: ConvergeMode,
    pub txn_seq: u64,
    pub scope: SchedulingScope,
    pub dirty: &'a DirtySet,
    pub decision_budget_ms: f64,
    pub clock: &'a dyn Clock,
}

/// Outcome of the mode decision.
#[derive(Debug, Clone)]
pub struct Decision {
    pub executed: ExecutedMode,
    pub reasons: Vec<DecisionReason>,
    /// Statically selected steps of a dirty pass, when computed.
    pub plan: Option<Arc<[StepId]>>,
    pub cache: Option<CacheEvidence>,
    pub duration_ms: f64,
}

/// Decide how to run a pass.
pub fn decide(input: &DecisionInput<'_>, stats: &ConvergeStats, cache: &mut DirtyPlanCache) -> Decision {
    let started = input.clock.now_ms();
    let mut decision = Decision {
        executed: ExecutedMode::Full,
        reasons: Vec::new(),
        plan: None,
        cache: None,
        duration_ms: 0.0,
    };

    decide_inner(input, stats, cache, started, &mut decision);

    decision.duration_ms = (input.clock.now_ms() - started).max(0.0);
    decision
}

fn dirty_all_reasons(reason: DirtyAllReason, reasons: &mut Vec<DecisionReason>) {
    reasons.push(DecisionReason::DirtyAll);
    if reason == DirtyAllReason::UnknownWrite {
        reasons.push(DecisionReason::UnknownWrite);
    }
}

fn decide_inner(
    input: &DecisionInput<'_>,
    stats: &ConvergeStats,
    cache: &mut DirtyPlanCache,
    started: f64,
    decision: &mut Decision,
) {
    let reasons = &mut decision.reasons;

    if input.txn_seq <= 1 {
        reasons.push(DecisionReason::ColdStart);
        return;
    }

    match input.requested {
        ConvergeMode::Full => {
            reasons.push(DecisionReason::ExplicitMode);
            return;
        }
        ConvergeMode::Dirty => {
            reasons.push(DecisionReason::ExplicitMode);
            if let Some(reason) = input.dirty.reason() {
                dirty_all_reasons(reason, reasons);
            }
            decision.executed = ExecutedMode::Dirty;
            return;
        }
        ConvergeMode::Auto => {}
    }

    let roots = match input.dirty {
        DirtySet::All { reason } => {
            dirty_all_reasons(*reason, reasons);
            return;
        }
        DirtySet::Roots { roots, .. } => roots,
    };

    let scope_steps = input.program.plan.scope_steps(input.scope).len();
    if scope_steps > 0 && roots.len() as f64 / scope_steps as f64 >= near_full_threshold(scope_steps) {
        reasons.push(DecisionReason::NearFull);
        return;
    }

    let budget = input.decision_budget_ms;
    let clock = input.clock;
    let exhausted = || clock.now_ms() - started >= budget;
    if exhausted() {
        reasons.push(DecisionReason::BudgetCutoff);
        return;
    }

    if stats.prefers_full() {
        reasons.push(DecisionReason::HistoryPrefersFull);
        return;
    }

    cache.sync_generation(input.program.generation);
    let cacheable = DirtyPlanCache::is_cacheable(roots.len(), scope_steps);
    let cached = if cacheable {
        cache.lookup(input.scope, roots)
    } else {
        None
    };

    let plan: Arc<[StepId]> = if let Some(plan) = cached {
        reasons.push(DecisionReason::CacheHit);
        decision.cache = Some(cache.evidence(true));
        plan
    } else {
        if cacheable {
            reasons.push(DecisionReason::CacheMiss);
        }
        let mut over_budget = exhausted;
        let computed = compute_plan(input.program, roots, input.scope, Some(&mut over_budget));
        let Some(steps) = computed else {
            reasons.push(DecisionReason::BudgetCutoff);
            decision.cache = cacheable.then(|| cache.evidence(false));
            return;
        };
        let steps: Arc<[StepId]> = steps.into();
        if cacheable {
            cache.store(input.scope, roots, Arc::clone(&steps));
            decision.cache = Some(cache.evidence(false));
        }
        steps
    };

    if scope_steps > 0 && plan.len() as f64 / scope_steps as f64 >= NEAR_FULL_PLAN_RATIO {
        reasons.push(DecisionReason::NearFull);
        return;
    }

    decision.executed = ExecutedMode::Dirty;
    decision.plan = Some(plan);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::converge::DirtyInput;
    use crate::domain::models::field_path::StateSchema;
    use crate::domain::models::trait_spec::{TraitEntry, TraitSpec};
    use crate::infrastructure::clock::ManualClock;
    use crate::services::dirty_set::resolve;
    use crate::services::program_builder::build;
    use serde_json::json;

    /// `n` independent steps `f{i} <- in{i}`.
    fn wide(n: usize) -> Program {
        let mut spec = TraitSpec::new();
        for i in 0..n {
            spec.push(TraitEntry::computed(format!("f{i}"), [format!("in{i}")], |_| Ok(json!(0))));
        }
        build(&StateSchema::new(), &spec).unwrap()
    }

    fn run(
        program: &Program,
        requested: ConvergeMode,
        txn_seq: u64,
        dirty: &DirtySet,
        clock: &dyn Clock,
        stats: &ConvergeStats,
        cache: &mut DirtyPlanCache,
    ) -> Decision {
        let input = DecisionInput {
            program,
            requested,
            txn_seq,
            scope: SchedulingScope::All,
            dirty,
            decision_budget_ms: 0.5,
            clock,
        };
        decide(&input, stats, cache)
    }

    #[test]
    fn test_cold_start_wins_over_explicit_dirty() {
        let program = wide(4);
        let dirty = resolve(&program.registry, &DirtyInput::paths(["in0"]));
        let clock = ManualClock::new();
        let d = run(&program, ConvergeMode::Dirty, 1, &dirty, &clock, &ConvergeStats::new(), &mut DirtyPlanCache::new());
        assert_eq!(d.executed, ExecutedMode::Full);
        assert_eq!(d.reasons, vec![DecisionReason::ColdStart]);
    }

    #[test]
    fn test_auto_selects_dirty_for_small_root_set() {
        let program = wide(10);
        let dirty = resolve(&program.registry, &DirtyInput::paths(["in3"]));
        let clock = ManualClock::new();
        let mut cache = DirtyPlanCache::new();
        let stats = ConvergeStats::new();

        let first = run(&program, ConvergeMode::Auto, 2, &dirty, &clock, &stats, &mut cache);
        assert_eq!(first.executed, ExecutedMode::Dirty);
        assert_eq!(first.reasons, vec![DecisionReason::CacheMiss]);
        assert_eq!(first.plan.as_deref().map(<[StepId]>::len), Some(1));

        let second = run(&program, ConvergeMode::Auto, 3, &dirty, &clock, &stats, &mut cache);
        assert_eq!(second.reasons, vec![DecisionReason::CacheHit]);
        assert_eq!(second.cache.as_ref().map(|c| c.hits), Some(1));
    }

    #[test]
    fn test_dirty_all_and_near_full() {
        let program = wide(4);
        let clock = ManualClock::new();
        let stats = ConvergeStats::new();
        let mut cache = DirtyPlanCache::new();

        let all = resolve(&program.registry, &DirtyInput::paths(["*"]));
        let d = run(&program, ConvergeMode::Auto, 2, &all, &clock, &stats, &mut cache);
        assert_eq!(d.executed, ExecutedMode::Full);
        assert_eq!(d.reasons, vec![DecisionReason::DirtyAll, DecisionReason::UnknownWrite]);

        let most = resolve(&program.registry, &DirtyInput::paths(["in0", "in1", "in2", "in3"]));
        let d = run(&program, ConvergeMode::Auto, 2, &most, &clock, &stats, &mut cache);
        assert_eq!(d.reasons, vec![DecisionReason::NearFull]);
    }

    #[test]
    fn test_budget_cutoff_with_ticking_clock() {
        let program = wide(200);
        let dirty = resolve(&program.registry, &DirtyInput::paths(["in0"]));
        // Every clock read advances 0.2 ms; the plan budget check trips the 0.5 ms budget.
        let clock = ManualClock::with_auto_tick(0.2);
        let d = run(&program, ConvergeMode::Auto, 2, &dirty, &clock, &ConvergeStats::new(), &mut DirtyPlanCache::new());
        assert_eq!(d.executed, ExecutedMode::Full);
        assert!(d.reasons.contains(&DecisionReason::BudgetCutoff));
    }

    #[test]
    fn test_history_prefers_full() {
        let program = wide(10);
        let dirty = resolve(&program.registry, &DirtyInput::paths(["in0"]));
        let clock = ManualClock::new();
        let mut stats = ConvergeStats::new();
        stats.record(ExecutedMode::Full, 1.0);
        for _ in 0..3 {
            stats.record(ExecutedMode::Dirty, 2.0);
        }
        assert!(!stats.prefers_full());
        stats.record(ExecutedMode::Dirty, 2.0);
        assert!(stats.prefers_full());

        let d = run(&program, ConvergeMode::Auto, 5, &dirty, &clock, &stats, &mut DirtyPlanCache::new());
        assert_eq!(d.reasons, vec![DecisionReason::HistoryPrefersFull]);
    }

    #[test]
    fn test_stale_history_returns_to_dirty() {
        let program = wide(10);
        let dirty = resolve(&program.registry, &DirtyInput::paths(["in0"]));
        let clock = ManualClock::new();
        let mut cache = DirtyPlanCache::new();
        let mut stats = ConvergeStats::new();
        stats.record(ExecutedMode::Full, 0.0);
        for _ in 0..HISTORY_WINDOW {
            stats.record(ExecutedMode::Dirty, 2.0);
        }
        assert!(stats.prefers_full());

        // Feed decisions back into the history the way the engine does.
        let mut executed = Vec::new();
        for txn_seq in 2..40 {
            let d = run(&program, ConvergeMode::Auto, txn_seq, &dirty, &clock, &stats, &mut cache);
            let cost = match d.executed {
                ExecutedMode::Full => 1.0,
                ExecutedMode::Dirty => 0.1,
            };
            stats.record(d.executed, cost);
            executed.push(d.executed);
        }

        let first_dirty = executed.iter().position(|m| *m == ExecutedMode::Dirty);
        assert_eq!(first_dirty, Some(HISTORY_STALE_FULL_PASSES));
        assert!(executed.iter().rev().take(10).all(|m| *m == ExecutedMode::Dirty));
        assert!(!stats.prefers_full());
    }

    #[test]
    fn test_near_full_thresholds() {
        assert!((near_full_threshold(10) - 0.9).abs() < f64::EPSILON);
        assert!((near_full_threshold(512) - 0.75).abs() < f64::EPSILON);
        assert!((near_full_threshold(1024) - 0.7).abs() < f64::EPSILON);
        assert!((near_full_threshold(2000) - 0.65).abs() < f64::EPSILON);
    }
}
