//! One convergence pass inside a transaction.
//!
//! A pass resolves the dirty set, decides the mode, executes the selected
//! steps against a copy-on-write draft and either commits everything or
//! nothing. Budget overruns and failing derivations roll the draft back and
//! degrade the pass; no patch, load request or row state of an aborted pass
//! ever becomes visible.

use std::any::Any;
use std::ops::Range;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info_span, warn};

use crate::domain::errors::TraitError;
use crate::domain::models::converge::{
    ConfigScope, ConvergeMode, ConvergeOutcome, DecisionReason, DecisionSummary, DegradeReason,
    DirtyInput, DirtySet, DirtySummary, ExecutedMode, StepStats, TimeSlicingSummary,
};
use crate::domain::models::diagnostics::Hotspot;
use crate::domain::models::field_path::FieldPathId;
use crate::domain::models::patch::{PatchReason, PatchRecord};
use crate::domain::models::program::{NormalizedBody, NormalizedEntry, Program, SchedulingScope, Step, StepId};
use crate::domain::models::source::{LoadRequest, SourceSnapshot};
use crate::domain::models::trait_spec::{Deps, TraitKind};
use crate::domain::ports::{Clock, PatchRecorder};
use crate::services::diagnostics::{DiagnosticsHub, HotspotTracker};
use crate::services::dirty_set::{resolve, DirtyMarks};
use crate::services::draft::CowDraft;
use crate::services::list_scope::ListScope;
use crate::services::mode_decision::{decide, ConvergeStats, DecisionInput};
use crate::services::plan_cache::DirtyPlanCache;
use crate::services::row_identity::{ListRows, RowIdStore};
use crate::services::source_refresh::key_hash;

/// Per-instance state carried between passes of one lane.
#[derive(Debug, Clone, Default)]
pub struct InstanceCaches {
    pub stats: ConvergeStats,
    pub plan_cache: DirtyPlanCache,
    pub rows: RowIdStore,
}

impl InstanceCaches {
    pub fn new() -> Self {
        Self::default()
    }
}

/// What a committed pass produced besides the new state.
#[derive(Debug, Clone, Default)]
pub struct PassEffects {
    /// Loads to dispatch once the pass is visible.
    pub load_requests: Vec<LoadRequest>,
    /// Outputs whose value changed, in execution order.
    pub changed: Vec<FieldPathId>,
    pub patches: Vec<PatchRecord>,
}

impl PassEffects {
    pub fn is_empty(&self) -> bool {
        self.load_requests.is_empty() && self.changed.is_empty() && self.patches.is_empty()
    }

    /// Changed outputs as path strings, for feeding the next pass's dirty input.
    pub fn changed_paths(&self, program: &Program) -> Vec<String> {
        self.changed
            .iter()
            .map(|id| program.registry.path(*id).to_string())
            .collect()
    }
}

/// Everything one pass reads and writes.
pub struct ConvergeContext<'a> {
    pub module_id: &'a str,
    pub txn_seq: u64,
    pub requested_mode: ConvergeMode,
    pub config_scope: ConfigScope,
    pub budget_ms: f64,
    pub decision_budget_ms: f64,
    pub dirty: DirtyInput,
    pub scope: SchedulingScope,
    /// Restricts execution to a range of the scope's step list.
    pub slice: Option<Range<usize>>,
    pub time_slicing: Option<TimeSlicingSummary>,
    /// Committed state; replaced only when the pass commits.
    pub state: &'a mut Arc<Value>,
    pub caches: &'a mut InstanceCaches,
    pub recorder: &'a dyn PatchRecorder,
    pub clock: &'a dyn Clock,
    pub diagnostics: &'a DiagnosticsHub,
    pub effects: PassEffects,
}

impl<'a> ConvergeContext<'a> {
    pub fn new(
        module_id: &'a str,
        state: &'a mut Arc<Value>,
        caches: &'a mut InstanceCaches,
        recorder: &'a dyn PatchRecorder,
        clock: &'a dyn Clock,
        diagnostics: &'a DiagnosticsHub,
    ) -> Self {
        Self {
            module_id,
            txn_seq: 1,
            requested_mode: ConvergeMode::Auto,
            config_scope: ConfigScope::Builtin,
            budget_ms: 200.0,
            decision_budget_ms: 0.5,
            dirty: DirtyInput::empty(),
            scope: SchedulingScope::All,
            slice: None,
            time_slicing: None,
            state,
            caches,
            recorder,
            clock,
            diagnostics,
            effects: PassEffects::default(),
        }
    }

    #[must_use]
    pub const fn with_txn_seq(mut self, txn_seq: u64) -> Self {
        self.txn_seq = txn_seq;
        self
    }

    #[must_use]
    pub const fn with_mode(mut self, mode: ConvergeMode) -> Self {
        self.requested_mode = mode;
        self
    }

    #[must_use]
    pub const fn with_config_scope(mut self, scope: ConfigScope) -> Self {
        self.config_scope = scope;
        self
    }

    #[must_use]
    pub const fn with_budget_ms(mut self, budget_ms: f64) -> Self {
        self.budget_ms = budget_ms;
        self
    }

    #[must_use]
    pub const fn with_decision_budget_ms(mut self, decision_budget_ms: f64) -> Self {
        self.decision_budget_ms = decision_budget_ms;
        self
    }

    #[must_use]
    pub fn with_dirty(mut self, dirty: DirtyInput) -> Self {
        self.dirty = dirty;
        self
    }

    #[must_use]
    pub const fn with_scope(mut self, scope: SchedulingScope) -> Self {
        self.scope = scope;
        self
    }

    #[must_use]
    pub fn with_slice(mut self, slice: Range<usize>) -> Self {
        self.slice = Some(slice);
        self
    }

    #[must_use]
    pub const fn with_time_slicing(mut self, summary: TimeSlicingSummary) -> Self {
        self.time_slicing = Some(summary);
        self
    }
}

// ============================================================================
// Step evaluation
// ============================================================================

/// Result of evaluating one step against the draft.
#[derive(Default)]
struct Evaluated {
    /// `(from, to)` when the output changes.
    write: Option<(Value, Value)>,
    load: Option<LoadRequest>,
    rows: Option<ListRows>,
}

const fn patch_reason(kind: TraitKind) -> PatchReason {
    match kind {
        TraitKind::Computed => PatchReason::Computed,
        TraitKind::Link => PatchReason::Link,
        TraitKind::Source => PatchReason::Source,
        TraitKind::ListCheck => PatchReason::ListCheck,
        TraitKind::ExternalStore => PatchReason::ExternalStore,
    }
}

fn evaluate(
    step: &Step,
    entry: &NormalizedEntry,
    state: &Value,
    rows: &RowIdStore,
    full: bool,
) -> Result<Evaluated, TraitError> {
    let current = entry.field_path.get(state).cloned().unwrap_or(Value::Null);
    let mut out = Evaluated::default();

    let next = match &entry.body {
        NormalizedBody::Computed { derive, equals } => {
            let next = derive(&Deps::new(&entry.deps, state))?;
            (!equals.equals(&current, &next)).then_some(next)
        }
        NormalizedBody::Link { from } => {
            let next = from.get(state).cloned().unwrap_or(Value::Null);
            (next != current).then_some(next)
        }
        NormalizedBody::Source {
            resource_id,
            key,
            concurrency,
        } => match key(&Deps::new(&entry.deps, state))? {
            None => {
                let idle = SourceSnapshot::idle().to_value();
                (idle != current).then_some(idle)
            }
            Some(key) => {
                let hash = key_hash(&key);
                if SourceSnapshot::key_hash_of(&current) == Some(hash.as_str()) {
                    None
                } else {
                    out.load = Some(LoadRequest {
                        resource_id: resource_id.clone(),
                        field_path: entry.field_path.clone(),
                        key,
                        key_hash: hash.clone(),
                        concurrency: *concurrency,
                        step_id: step.step_id.0,
                    });
                    Some(SourceSnapshot::loading(hash).to_value())
                }
            }
        },
        NormalizedBody::ListCheck {
            list,
            key,
            track_by,
            rule,
        } => {
            let list_value = list.get(state).unwrap_or(&Value::Null);
            let report = ListScope {
                key,
                track_by: track_by.as_ref(),
                rule: *rule,
            }
            .run(list_value, rows.get(entry.decl_index), full);
            out.rows = Some(report.rows);
            (report.output != current).then_some(report.output)
        }
        // Values arrive through the runtime's store writeback, never from a pass.
        NormalizedBody::ExternalStore { .. } => None,
    };

    out.write = next.map(|to| (current, to));
    Ok(out)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

fn scoped_steps<'p>(program: &'p Program, scope: SchedulingScope, slice: Option<&Range<usize>>) -> &'p [StepId] {
    let steps = program.plan.scope_steps(scope);
    match slice {
        Some(range) => {
            let end = range.end.min(steps.len());
            let start = range.start.min(end);
            &steps[start..end]
        }
        None => steps,
    }
}

// ============================================================================
// Pass
// ============================================================================

struct Failure {
    reason: DegradeReason,
    error: Option<String>,
    step: Option<StepId>,
}

/// Run one pass of `program` against `ctx.state`.
///
/// On success the new state replaces `ctx.state`, patches go to the recorder
/// in execution order and `ctx.effects` collects load requests and changed
/// outputs. On failure nothing is written anywhere except diagnostics.
pub fn converge_in_transaction(program: &Program, ctx: &mut ConvergeContext<'_>) -> ConvergeOutcome {
    let span = info_span!(
        "converge",
        module_id = %ctx.module_id,
        txn_seq = ctx.txn_seq,
        scope = ?ctx.scope,
    );
    let _entered = span.enter();

    let clock = ctx.clock;
    let hub = ctx.diagnostics;
    let module_id = ctx.module_id;
    let txn_seq = ctx.txn_seq;

    let dirty = resolve(&program.registry, &ctx.dirty);
    let decision = decide(
        &DecisionInput {
            program,
            requested: ctx.requested_mode,
            txn_seq,
            scope: ctx.scope,
            dirty: &dirty,
            decision_budget_ms: ctx.decision_budget_ms,
            clock,
        },
        &ctx.caches.stats,
        &mut ctx.caches.plan_cache,
    );

    let scope_all = program.plan.scope_steps(ctx.scope);
    let scope_steps = scoped_steps(program, ctx.scope, ctx.slice.as_ref());
    let candidates: Vec<StepId> = match (&decision.plan, decision.executed) {
        (Some(plan), ExecutedMode::Dirty) => plan
            .iter()
            .copied()
            .filter(|id| scope_steps.binary_search(id).is_ok())
            .collect(),
        _ => scope_steps.to_vec(),
    };

    // Live re-check: a dirty pass only runs steps whose inputs changed,
    // including outputs written earlier in this pass.
    let mut marks = match (decision.executed, &dirty) {
        (ExecutedMode::Dirty, DirtySet::Roots { roots, .. }) => {
            Some(DirtyMarks::from_roots(&program.registry, roots))
        }
        _ => None,
    };

    let timing = hub.times_steps(txn_seq);
    let mut hotspots = HotspotTracker::new(if timing { hub.sampling().top_k } else { 0 });
    let mut step_stats = StepStats {
        total: scope_steps.len(),
        affected: candidates.len(),
        ..StepStats::default()
    };

    let full = decision.executed == ExecutedMode::Full;
    let rows = &ctx.caches.rows;
    let mut draft = CowDraft::new(&*ctx.state);
    let mut patches: Vec<PatchRecord> = Vec::new();
    let mut loads: Vec<LoadRequest> = Vec::new();
    let mut changed: Vec<FieldPathId> = Vec::new();
    let mut staged_rows: Vec<(usize, ListRows)> = Vec::new();
    let mut failure: Option<Failure> = None;

    let exec_start = clock.now_ms();
    for &step_id in &candidates {
        let step = program.step(step_id);
        if let Some(marks) = &marks {
            if !marks.triggers(&program.registry, step) {
                continue;
            }
        }

        if clock.now_ms() - exec_start > ctx.budget_ms {
            failure = Some(Failure {
                reason: DegradeReason::BudgetExceeded,
                error: None,
                step: Some(step_id),
            });
            break;
        }

        let entry = program.entry(step);
        let step_start = timing.then(|| clock.now_ms());
        let result = catch_unwind(AssertUnwindSafe(|| {
            evaluate(step, entry, draft.current(), rows, full)
        }));
        let evaluated = match result {
            Ok(Ok(evaluated)) => evaluated,
            Ok(Err(err)) => {
                failure = Some(Failure {
                    reason: DegradeReason::RuntimeError,
                    error: Some(format!("{}: {err}", entry.field_path)),
                    step: Some(step_id),
                });
                break;
            }
            Err(payload) => {
                failure = Some(Failure {
                    reason: DegradeReason::RuntimeError,
                    error: Some(format!(
                        "{}: {}",
                        entry.field_path,
                        TraitError::Panicked(panic_message(payload.as_ref()))
                    )),
                    step: Some(step_id),
                });
                break;
            }
        };
        step_stats.executed += 1;

        if let Some(start) = step_start {
            hotspots.offer(Hotspot {
                step_id: step_id.0,
                decl_index: step.decl_index,
                field_path: entry.field_path.to_string(),
                kind: step.kind.as_str().to_string(),
                duration_ms: (clock.now_ms() - start).max(0.0),
            });
        }

        if let Some((from, to)) = evaluated.write {
            if let Err(err) = draft.set(&entry.field_path, to.clone()) {
                failure = Some(Failure {
                    reason: DegradeReason::RuntimeError,
                    error: Some(err.to_string()),
                    step: Some(step_id),
                });
                break;
            }
            patches.push(PatchRecord {
                path: entry.field_path.to_string(),
                reason: patch_reason(step.kind),
                from,
                to,
                trait_node_id: Some(entry.field_path.to_string()),
                step_id: Some(step_id.0),
                txn_seq,
            });
            changed.push(step.out_field_path_id);
            step_stats.changed += 1;
            if let Some(marks) = marks.as_mut() {
                marks.mark(&program.registry, step.out_field_path_id);
            }
        }
        loads.extend(evaluated.load);
        if let Some(list_rows) = evaluated.rows {
            staged_rows.push((entry.decl_index, list_rows));
        }
    }
    let execution_ms = (clock.now_ms() - exec_start).max(0.0);
    step_stats.skipped = step_stats.total.saturating_sub(step_stats.executed);

    let mut reasons = decision.reasons;
    let over_budget = failure
        .as_ref()
        .is_some_and(|f| f.reason == DegradeReason::BudgetExceeded);
    if over_budget && !reasons.contains(&DecisionReason::BudgetCutoff) {
        reasons.push(DecisionReason::BudgetCutoff);
    }
    match ctx.config_scope {
        ConfigScope::RuntimeModule => reasons.push(DecisionReason::ModuleOverride),
        ConfigScope::Provider => reasons.push(DecisionReason::ProviderOverride),
        ConfigScope::Builtin | ConfigScope::RuntimeDefault => {}
    }

    let summary = DecisionSummary {
        requested_mode: ctx.requested_mode,
        executed_mode: decision.executed,
        config_scope: ctx.config_scope,
        reasons,
        step_stats,
        dirty: DirtySummary::from_set(&dirty),
        decision_duration_ms: decision.duration_ms,
        execution_duration_ms: execution_ms,
        cache: decision.cache,
        program_digest: program.digest.clone(),
        generation: program.generation,
        txn_seq,
        scheduling_scope: ctx.scope,
        time_slicing: ctx.time_slicing,
        sampling: hub.sampling_summary(txn_seq),
        hotspots: hotspots.into_vec(),
    };

    if let Some(failure) = failure {
        drop(draft);
        let step = failure.step.map(|id| program.out_path(program.step(id)).to_string());
        let message = match failure.reason {
            DegradeReason::BudgetExceeded => format!(
                "pass exceeded its {} ms budget after {:.3} ms",
                ctx.budget_ms, execution_ms
            ),
            DegradeReason::RuntimeError => failure
                .error
                .clone()
                .unwrap_or_else(|| "derivation failed".to_string()),
        };
        warn!(
            reason = failure.reason.as_str(),
            step = ?step,
            executed = summary.step_stats.executed,
            "pass degraded, rolled back"
        );
        hub.warning(
            failure.reason.diagnostic_code(),
            module_id,
            Some(txn_seq),
            &message,
            json!({
                "budget_ms": ctx.budget_ms,
                "execution_ms": execution_ms,
                "step": step,
                "executed_steps": summary.step_stats.executed,
            }),
        );
        let outcome = ConvergeOutcome::Degraded {
            reason: failure.reason,
            error: failure.error,
            summary,
        };
        hub.pass_summary(module_id, outcome.label(), outcome.summary());
        return outcome;
    }

    if let Some(written) = draft.into_written() {
        *ctx.state = Arc::new(written);
    }
    for (decl_index, list_rows) in staged_rows {
        ctx.caches.rows.commit(decl_index, list_rows);
    }
    for patch in &patches {
        ctx.recorder.record(patch.clone());
    }
    ctx.caches.stats.record(decision.executed, execution_ms);

    debug!(
        executed_mode = decision.executed.as_str(),
        executed = summary.step_stats.executed,
        changed = summary.step_stats.changed,
        scope_steps = scope_all.len(),
        loads = loads.len(),
        "pass committed"
    );

    let patch_count = patches.len();
    ctx.effects.patches.extend(patches);
    ctx.effects.load_requests.extend(loads);
    ctx.effects.changed.extend(changed);

    let outcome = if patch_count > 0 {
        ConvergeOutcome::Converged {
            patch_count,
            summary,
        }
    } else {
        ConvergeOutcome::Noop { summary }
    };
    hub.pass_summary(module_id, outcome.label(), outcome.summary());
    outcome
}
