//! Per-instance runtime: host transactions, urgent and deferred lanes.
//!
//! Each instance owns one urgent lane and one deferred lane, both FIFO
//! `tokio::sync::Mutex`es guarding the lane's caches. A transaction runs the
//! host callback, then one synchronous convergence pass on the urgent lane.
//! With time slicing enabled, deferred steps are left to a scheduler task
//! that flushes them after the debounce window, optionally in slices on a
//! separate lane.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::FutureExt;
use serde_json::{json, Value};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::domain::errors::{BuildError, DomainError, DomainResult};
use crate::domain::models::config::ConvergePatch;
use crate::domain::models::converge::{
    ConvergeOutcome, DirtyAllReason, DirtyInput, TimeSlicingSummary,
};
use crate::domain::models::field_path::{FieldPath, StateSchema};
use crate::domain::models::patch::{PatchReason, PatchRecord};
use crate::domain::models::program::{BuildOptions, NormalizedBody, Program, SchedulingScope};
use crate::domain::models::source::{LoadRequest, SourceSnapshot};
use crate::domain::models::trait_spec::TraitSpec;
use crate::domain::ports::{Clock, PatchRecorder};
use crate::infrastructure::clock::SystemClock;
use crate::infrastructure::patch_log::PatchLog;
use crate::services::config_resolver::{ResolvedConvergeConfig, RuntimeHandle};
use crate::services::converge_engine::{converge_in_transaction, ConvergeContext, InstanceCaches, PassEffects};
use crate::services::diagnostics::{log_hub, DiagnosticsHub, TracingSink, SCHEMA_MISMATCH};
use crate::services::dirty_set::resolve;
use crate::services::external_store::{StoreRegistry, StoreSync, StoreWriteback, EXTERNAL_STORE_MISSING};
use crate::services::plan_cache::ProgramCache;
use crate::services::source_refresh::{ResourceRegistry, SourceRefresher, Writeback};
use crate::services::time_slicing::{
    deferred_affected, slice_ranges, FlushWindow, PendingDeferred, LANE_SLICE_STEPS,
};

/// Host-side collaborators of a runtime.
#[derive(Clone)]
pub struct RuntimeOptions {
    pub handle: RuntimeHandle,
    pub clock: Arc<dyn Clock>,
    pub recorder: Arc<dyn PatchRecorder>,
    pub diagnostics: DiagnosticsHub,
    pub resources: Arc<ResourceRegistry>,
    pub stores: Arc<StoreRegistry>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            handle: RuntimeHandle::new(),
            clock: Arc::new(SystemClock::new()),
            recorder: Arc::new(PatchLog::new()),
            diagnostics: DiagnosticsHub::default().with_sink(Arc::new(TracingSink)),
            resources: Arc::new(ResourceRegistry::new()),
            stores: Arc::new(StoreRegistry::new()),
        }
    }
}

impl RuntimeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_handle(mut self, handle: RuntimeHandle) -> Self {
        self.handle = handle;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_recorder(mut self, recorder: Arc<dyn PatchRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    #[must_use]
    pub fn with_diagnostics(mut self, diagnostics: DiagnosticsHub) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    #[must_use]
    pub fn with_resources(mut self, resources: Arc<ResourceRegistry>) -> Self {
        self.resources = resources;
        self
    }

    #[must_use]
    pub fn with_stores(mut self, stores: Arc<StoreRegistry>) -> Self {
        self.stores = stores;
        self
    }
}

// ============================================================================
// Host writes
// ============================================================================

/// Write access handed to the host callback of a transaction.
///
/// Writes to trait-owned paths fail fast. Every effective write becomes a
/// `host` patch and a dirty path of the transaction.
pub struct TxnWriter<'a> {
    program: &'a Program,
    base: Arc<Value>,
    working: Option<Value>,
    dirty: DirtyInput,
    patches: Vec<PatchRecord>,
    custom_mutation: bool,
    txn_seq: u64,
}

struct HostPhase {
    state: Arc<Value>,
    dirty: DirtyInput,
    patches: Vec<PatchRecord>,
    custom_mutation: bool,
}

impl<'a> TxnWriter<'a> {
    fn new(program: &'a Program, base: Arc<Value>, txn_seq: u64) -> Self {
        Self {
            program,
            base,
            working: None,
            dirty: DirtyInput::default(),
            patches: Vec::new(),
            custom_mutation: false,
            txn_seq,
        }
    }

    pub const fn txn_seq(&self) -> u64 {
        self.txn_seq
    }

    /// State as seen by this transaction so far.
    pub fn state(&self) -> &Value {
        self.working.as_ref().unwrap_or(&*self.base)
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        FieldPath::parse(path).ok()?.get(self.state())
    }

    /// Write `value` at `path`.
    pub fn set(&mut self, path: &str, value: Value) -> DomainResult<()> {
        let field = FieldPath::parse(path).map_err(|source| DomainError::InvalidPath {
            path: path.to_string(),
            source,
        })?;
        if let Some(owner) = self.program.owner_of(&field) {
            return Err(DomainError::TraitOwnedWrite {
                path: path.to_string(),
                owner: owner.to_string(),
            });
        }
        self.write(&field, value, PatchReason::Host);
        Ok(())
    }

    /// Mutate the whole state through an opaque callback.
    ///
    /// The change cannot be attributed to paths, so the next pass treats
    /// everything as dirty.
    pub fn mutate<F>(&mut self, f: F)
    where
        F: FnOnce(&mut Value),
    {
        let base = &self.base;
        f(self.working.get_or_insert_with(|| (**base).clone()));
        self.custom_mutation = true;
        self.dirty.dirty_all_reason = Some(DirtyAllReason::CustomMutation);
    }

    /// Report a change the host made without going through [`TxnWriter::set`].
    pub fn mark_dirty(&mut self, path: impl Into<String>) {
        let path = path.into();
        if !self.dirty.paths.contains(&path) {
            self.dirty.paths.push(path);
        }
    }

    /// Report a change that cannot be attributed to any path.
    pub fn mark_unknown_write(&mut self) {
        if self.dirty.dirty_all_reason.is_none() {
            self.dirty.dirty_all_reason = Some(DirtyAllReason::UnknownWrite);
        }
    }

    fn write(&mut self, field: &FieldPath, value: Value, reason: PatchReason) -> bool {
        let from = field.get(self.state()).cloned().unwrap_or(Value::Null);
        if from == value {
            return false;
        }
        let base = &self.base;
        let working = self.working.get_or_insert_with(|| (**base).clone());
        if let Err(err) = field.set(working, value.clone()) {
            warn!(path = %field, error = %err, "host write skipped");
            return false;
        }
        let path = field.to_string();
        self.patches.push(PatchRecord {
            path: path.clone(),
            reason,
            from,
            to: value,
            trait_node_id: matches!(reason, PatchReason::SourceRefresh | PatchReason::ExternalStore)
                .then(|| path.clone()),
            step_id: None,
            txn_seq: self.txn_seq,
        });
        self.mark_dirty(path);
        true
    }

    fn finish(self) -> HostPhase {
        HostPhase {
            state: self.working.map_or(self.base, Arc::new),
            dirty: self.dirty,
            patches: self.patches,
            custom_mutation: self.custom_mutation,
        }
    }
}

// ============================================================================
// Runtime
// ============================================================================

#[derive(Debug)]
struct Committed {
    state: Arc<Value>,
    version: u64,
    txn_seq: u64,
    /// Dirty input of a degraded urgent pass, retried by the next one.
    carry: DirtyInput,
    /// Dirty input of a degraded deferred flush, folded into the next pending work.
    deferred_carry: Option<PendingDeferred>,
    pending: Option<PendingDeferred>,
}

struct Inner {
    module_id: String,
    /// Distinguishes instances of the same module in logs.
    instance_id: Uuid,
    program: Arc<Program>,
    handle: RuntimeHandle,
    clock: Arc<dyn Clock>,
    recorder: Arc<dyn PatchRecorder>,
    diagnostics: DiagnosticsHub,
    refresher: SourceRefresher,
    stores: StoreSync,
    urgent: tokio::sync::Mutex<InstanceCaches>,
    deferred: tokio::sync::Mutex<InstanceCaches>,
    committed: Mutex<Committed>,
    notify: Arc<Notify>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
    this: Weak<Inner>,
}

/// A live module instance converging its state after every transaction.
pub struct TraitRuntime {
    inner: Arc<Inner>,
}

fn replay(state: &Value, patches: &[PatchRecord]) -> Value {
    let mut next = state.clone();
    for patch in patches {
        match FieldPath::parse(&patch.path) {
            Ok(field) => {
                if let Err(err) = field.set(&mut next, patch.to.clone()) {
                    warn!(path = %patch.path, error = %err, "rebase write skipped");
                }
            }
            Err(err) => warn!(path = %patch.path, error = %err, "rebase path skipped"),
        }
    }
    next
}

fn source_writeback(inner: Weak<Inner>) -> Writeback {
    Arc::new(move |request: LoadRequest, snapshot: SourceSnapshot| {
        let inner = inner.clone();
        async move {
            if let Some(inner) = inner.upgrade() {
                inner.apply_source_result(request, snapshot).await;
            }
        }
        .boxed()
    })
}

fn store_writeback(inner: Weak<Inner>) -> StoreWriteback {
    Arc::new(move |field: FieldPath, value: Value| {
        let inner = inner.clone();
        async move {
            if let Some(inner) = inner.upgrade() {
                inner.apply_store_value(&field, value).await;
            }
        }
        .boxed()
    })
}

impl TraitRuntime {
    pub fn new(module_id: impl Into<String>, program: Arc<Program>, initial_state: Value, options: RuntimeOptions) -> Self {
        let module_id = module_id.into();
        let inner = Arc::new_cyclic(|this: &Weak<Inner>| Inner {
            refresher: SourceRefresher::new(Arc::clone(&options.resources), source_writeback(this.clone())),
            stores: StoreSync::new(),
            module_id,
            instance_id: Uuid::new_v4(),
            program,
            handle: options.handle,
            clock: options.clock,
            recorder: options.recorder,
            diagnostics: options.diagnostics,
            urgent: tokio::sync::Mutex::new(InstanceCaches::new()),
            deferred: tokio::sync::Mutex::new(InstanceCaches::new()),
            committed: Mutex::new(Committed {
                state: Arc::new(initial_state),
                version: 0,
                txn_seq: 0,
                carry: DirtyInput::default(),
                deferred_carry: None,
                pending: None,
            }),
            notify: Arc::new(Notify::new()),
            scheduler: Mutex::new(None),
            this: this.clone(),
        });

        inner.attach_stores(&options.stores);
        log_hub(&inner.module_id, &inner.diagnostics);
        if !inner.program.schema_mismatches.is_empty() {
            inner.diagnostics.warning(
                SCHEMA_MISMATCH,
                &inner.module_id,
                None,
                "trait paths missing from the state schema",
                json!({ "paths": inner.program.schema_mismatches }),
            );
        }
        info!(
            module_id = %inner.module_id,
            instance_id = %inner.instance_id,
            steps = inner.program.plan.len(),
            deferred = inner.program.plan.deferred.len(),
            digest = %inner.program.digest,
            "runtime started"
        );
        Self { inner }
    }

    /// Build (or reuse) the program for `spec` through `programs`, then start
    /// a runtime over it. Instances of the same module share one program.
    pub fn from_spec(
        module_id: impl Into<String>,
        programs: &ProgramCache,
        schema: &StateSchema,
        spec: &TraitSpec,
        initial_state: Value,
        options: RuntimeOptions,
    ) -> Result<Self, BuildError> {
        let program = programs.get_or_build(schema, spec, &BuildOptions::default())?;
        Ok(Self::new(module_id, program, initial_state, options))
    }

    pub fn module_id(&self) -> &str {
        &self.inner.module_id
    }

    pub fn instance_id(&self) -> Uuid {
        self.inner.instance_id
    }

    pub fn program(&self) -> &Arc<Program> {
        &self.inner.program
    }

    pub fn handle(&self) -> &RuntimeHandle {
        &self.inner.handle
    }

    /// Latest committed state.
    pub fn state(&self) -> Arc<Value> {
        Arc::clone(&self.inner.committed().state)
    }

    /// Sequence number of the last committed transaction.
    pub fn txn_seq(&self) -> u64 {
        self.inner.committed().txn_seq
    }

    pub fn pending_deferred(&self) -> Option<PendingDeferred> {
        self.inner.committed().pending.clone()
    }

    /// Settings the next transaction of this module would use.
    pub fn resolved_config(&self, provider: Option<&ConvergePatch>) -> ResolvedConvergeConfig {
        self.inner.handle.resolve(&self.inner.module_id, provider)
    }

    /// Run `f` as a host transaction followed by a convergence pass.
    ///
    /// An error from `f` aborts the transaction before anything is committed.
    pub async fn transaction<F>(&self, f: F) -> DomainResult<ConvergeOutcome>
    where
        F: FnOnce(&mut TxnWriter<'_>) -> DomainResult<()>,
    {
        self.transaction_with(None, f).await
    }

    /// Like [`TraitRuntime::transaction`], with a per-call configuration override.
    pub async fn transaction_with<F>(&self, provider: Option<&ConvergePatch>, f: F) -> DomainResult<ConvergeOutcome>
    where
        F: FnOnce(&mut TxnWriter<'_>) -> DomainResult<()>,
    {
        let inner = &self.inner;
        let mut caches = inner.urgent.lock().await;
        let (base, version, txn_seq) = inner.snapshot();
        let mut writer = TxnWriter::new(&inner.program, base, txn_seq + 1);
        f(&mut writer)?;
        let host = writer.finish();
        Ok(inner.converge_urgent(&mut caches, host, version, txn_seq + 1, provider))
    }

    /// Flush pending deferred work immediately, bypassing the window.
    pub async fn flush_now(&self) -> Vec<ConvergeOutcome> {
        self.inner.flush_deferred().await
    }

    /// Write `value` into the external-store field at `path` as its own transaction.
    ///
    /// Returns `None` when the field already holds `value`.
    pub async fn apply_external_store(&self, path: &str, value: Value) -> DomainResult<Option<ConvergeOutcome>> {
        let field = FieldPath::parse(path).map_err(|source| DomainError::InvalidPath {
            path: path.to_string(),
            source,
        })?;
        let owned = self.inner.program.entries.iter().any(|entry| {
            matches!(entry.body, NormalizedBody::ExternalStore { .. }) && entry.field_path == field
        });
        if !owned {
            return Err(DomainError::NotExternalStore {
                path: path.to_string(),
            });
        }
        Ok(self.inner.apply_store_value(&field, value).await)
    }

    /// Number of external stores this instance still follows.
    pub fn followed_stores(&self) -> usize {
        self.inner.stores.active()
    }

    /// Wait until every in-flight source load has been written back.
    pub async fn wait_for_sources(&self) {
        self.inner.refresher.wait_idle().await;
    }
}

impl Drop for TraitRuntime {
    fn drop(&mut self) {
        if let Some(handle) = self
            .inner
            .scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        self.inner.refresher.abort_all();
        self.inner.stores.abort_all();
        debug!(
            module_id = %self.inner.module_id,
            instance_id = %self.inner.instance_id,
            "runtime dropped"
        );
    }
}

impl Inner {
    fn committed(&self) -> MutexGuard<'_, Committed> {
        self.committed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> (Arc<Value>, u64, u64) {
        let committed = self.committed();
        (Arc::clone(&committed.state), committed.version, committed.txn_seq)
    }

    fn hub_for(&self, config: &ResolvedConvergeConfig) -> DiagnosticsHub {
        self.diagnostics
            .reconfigured(config.diagnostics_level, config.sampling)
    }

    fn time_slicing(&self, config: &ResolvedConvergeConfig) -> bool {
        config.time_slicing.enabled && self.program.has_deferred()
    }

    /// Converge after a host phase and commit the result. Runs under the urgent lane.
    fn converge_urgent(
        &self,
        caches: &mut InstanceCaches,
        host: HostPhase,
        base_version: u64,
        txn_seq: u64,
        provider: Option<&ConvergePatch>,
    ) -> ConvergeOutcome {
        let config = self.handle.resolve(&self.module_id, provider);
        let slicing = self.time_slicing(&config);
        let scope = if slicing {
            SchedulingScope::Immediate
        } else {
            SchedulingScope::All
        };

        let mut dirty = host.dirty;
        let carry = std::mem::take(&mut self.committed().carry);
        if !carry.is_empty() {
            dirty.merge(&carry);
        }
        for patch in &host.patches {
            self.recorder.record(patch.clone());
        }

        let hub = self.hub_for(&config);
        let mut state = host.state;
        let (outcome, effects) = {
            let mut ctx = ConvergeContext::new(
                &self.module_id,
                &mut state,
                caches,
                self.recorder.as_ref(),
                self.clock.as_ref(),
                &hub,
            )
            .with_txn_seq(txn_seq)
            .with_mode(config.mode)
            .with_config_scope(config.config_scope)
            .with_budget_ms(config.budget_ms)
            .with_decision_budget_ms(config.decision_budget_ms)
            .with_dirty(dirty.clone())
            .with_scope(scope);
            if slicing {
                ctx = ctx.with_time_slicing(TimeSlicingSummary {
                    enabled: true,
                    scope,
                    deferred_step_count: self.program.plan.deferred.len(),
                });
            }
            let outcome = converge_in_transaction(&self.program, &mut ctx);
            (outcome, std::mem::take(&mut ctx.effects))
        };

        let resolved = resolve(&self.program.registry, &dirty);
        let now = self.clock.now_ms();
        let schedule = {
            let mut committed = self.committed();
            let moved = committed.version != base_version;
            if !moved {
                committed.state = state;
            } else if host.custom_mutation {
                // Opaque host changes cannot be replayed; deferred outputs are recomputed.
                committed.state = state;
                if self.program.has_deferred() {
                    committed
                        .pending
                        .get_or_insert_with(|| PendingDeferred::new(now))
                        .touch(&DirtyInput::all(DirtyAllReason::CustomMutation), now);
                }
            } else {
                let mut patches = host.patches;
                patches.extend(effects.patches.iter().cloned());
                committed.state = Arc::new(replay(&committed.state, &patches));
            }
            committed.version += 1;
            committed.txn_seq = txn_seq;

            if outcome.degrade_reason().is_some() {
                committed.carry.merge(&dirty);
            }

            // Deferred steps have never run before the first flush.
            let cold = txn_seq <= 1;
            if slicing && (cold || deferred_affected(&self.program, &resolved, &effects.changed)) {
                let mut input = dirty.clone();
                input.merge(&DirtyInput::paths(effects.changed_paths(&self.program)));
                if input.dirty_all_reason.is_none() {
                    input.dirty_all_reason = resolved
                        .reason()
                        .or_else(|| cold.then_some(DirtyAllReason::UnknownWrite));
                }
                let pending = committed
                    .pending
                    .get_or_insert_with(|| PendingDeferred::new(now));
                pending.touch(&input, now);
                if let Some(carried) = committed.deferred_carry.take() {
                    if let Some(pending) = committed.pending.as_mut() {
                        pending.merge(&carried);
                    }
                }
            }
            committed.pending.is_some()
        };

        if schedule {
            self.ensure_scheduler();
            self.notify.notify_one();
        }
        self.dispatch_loads(effects);
        outcome
    }

    fn dispatch_loads(&self, effects: PassEffects) {
        for request in effects.load_requests {
            debug!(
                resource_id = %request.resource_id,
                field = %request.field_path,
                key_hash = %request.key_hash,
                "dispatching load"
            );
            self.refresher.dispatch(request);
        }
    }

    async fn apply_source_result(&self, request: LoadRequest, snapshot: SourceSnapshot) {
        let mut caches = self.urgent.lock().await;
        let (base, version, txn_seq) = self.snapshot();

        // Stale results are dropped: the stored snapshot must still wait for this key.
        let stored = request.field_path.get(&base).and_then(SourceSnapshot::key_hash_of);
        if stored != Some(request.key_hash.as_str()) {
            debug!(field = %request.field_path, key_hash = %request.key_hash, "stale load result dropped");
            return;
        }

        let mut writer = TxnWriter::new(&self.program, base, txn_seq + 1);
        if !writer.write(&request.field_path, snapshot.to_value(), PatchReason::SourceRefresh) {
            return;
        }
        let outcome = self.converge_urgent(&mut caches, writer.finish(), version, txn_seq + 1, None);
        debug!(field = %request.field_path, outcome = outcome.label(), "source result applied");
    }

    /// Seed every external-store field with its store's current value.
    ///
    /// Runs before the instance is shared, so the seed is part of the initial state.
    fn attach_stores(&self, registry: &StoreRegistry) {
        let mut missing = Vec::new();
        let mut seeds = Vec::new();
        for entry in &self.program.entries {
            let NormalizedBody::ExternalStore { store_id } = &entry.body else {
                continue;
            };
            let Some(store) = registry.get(store_id) else {
                missing.push(store_id.clone());
                continue;
            };
            let value = self.stores.attach(
                entry.field_path.clone(),
                store.as_ref(),
                store_writeback(self.this.clone()),
            );
            seeds.push((&entry.field_path, value));
        }

        if !seeds.is_empty() {
            let mut committed = self.committed();
            let mut state = (*committed.state).clone();
            for (field, value) in seeds {
                if let Err(err) = field.set(&mut state, value) {
                    warn!(field = %field, error = %err, "external store seed skipped");
                }
            }
            committed.state = Arc::new(state);
        }

        if !missing.is_empty() {
            missing.sort();
            missing.dedup();
            self.diagnostics.warning(
                EXTERNAL_STORE_MISSING,
                &self.module_id,
                None,
                "external stores are not registered",
                json!({ "stores": missing }),
            );
        }
    }

    async fn apply_store_value(&self, field: &FieldPath, value: Value) -> Option<ConvergeOutcome> {
        let mut caches = self.urgent.lock().await;
        let (base, version, txn_seq) = self.snapshot();

        let mut writer = TxnWriter::new(&self.program, base, txn_seq + 1);
        if !writer.write(field, value, PatchReason::ExternalStore) {
            return None;
        }
        let outcome = self.converge_urgent(&mut caches, writer.finish(), version, txn_seq + 1, None);
        debug!(field = %field, outcome = outcome.label(), "external store value applied");
        Some(outcome)
    }

    // ------------------------------------------------------------------------
    // Deferred lane
    // ------------------------------------------------------------------------

    fn ensure_scheduler(&self) {
        let mut scheduler = self.scheduler.lock().unwrap_or_else(PoisonError::into_inner);
        if scheduler.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(module_id = %self.module_id, "no tokio runtime, deferred work waits for flush_now");
            return;
        };
        let weak = self.this.clone();
        let notify = Arc::clone(&self.notify);
        let clock = Arc::clone(&self.clock);
        *scheduler = Some(runtime.spawn(scheduler_loop(weak, notify, clock)));
    }

    /// Deadline of the pending deferred work, if any.
    fn next_deadline(&self) -> Option<f64> {
        let config = self.handle.resolve(&self.module_id, None);
        let window = FlushWindow::effective(&config.time_slicing, &config.txn_lanes);
        self.committed()
            .pending
            .as_ref()
            .map(|pending| window.deadline(pending))
    }

    async fn flush_deferred(&self) -> Vec<ConvergeOutcome> {
        let mut caches = self.deferred.lock().await;
        let config = self.handle.resolve(&self.module_id, None);
        let lanes = config.txn_lanes;
        // Without a separate lane the flush is serialized with urgent transactions.
        let _urgent = if lanes.enabled {
            None
        } else {
            Some(self.urgent.lock().await)
        };

        let Some(pending) = self.committed().pending.take() else {
            return Vec::new();
        };
        let Some(this) = self.this.upgrade() else {
            return Vec::new();
        };

        let step_count = self.program.plan.deferred.len();
        let ranges = if lanes.enabled {
            slice_ranges(step_count, LANE_SLICE_STEPS)
        } else {
            vec![0..step_count]
        };
        let window = FlushWindow::effective(&config.time_slicing, &config.txn_lanes);
        let hub = self.hub_for(&config);

        debug!(
            module_id = %self.module_id,
            slices = ranges.len(),
            roots = pending.roots.len(),
            "flushing deferred work"
        );

        let mut dirty = pending.to_dirty_input();
        let mut outcomes = Vec::with_capacity(ranges.len());
        let mut lane_start = self.clock.now_ms();

        for (index, range) in ranges.iter().enumerate() {
            if index > 0 && lanes.enabled {
                let now = self.clock.now_ms();
                if lanes.allow_coalesce && now < pending.first_at + window.max_lag_ms {
                    let mut committed = self.committed();
                    if let Some(newer) = committed.pending.as_mut() {
                        // Remaining slices run with the merged work in the next flush.
                        let mut rest = PendingDeferred::new(pending.first_at);
                        rest.touch(&dirty, now);
                        newer.merge(&rest);
                        debug!(module_id = %self.module_id, done = index, "deferred flush coalesced");
                        return outcomes;
                    }
                }
                if now - lane_start >= lanes.budget_ms {
                    tokio::task::yield_now().await;
                    lane_start = self.clock.now_ms();
                }
            }

            let (base, version, txn_seq) = self.snapshot();
            let owned = std::mem::take(&mut *caches);
            let pass = {
                let this = Arc::clone(&this);
                let hub = hub.clone();
                let dirty = dirty.clone();
                let range = range.clone();
                tokio::task::spawn_blocking(move || {
                    this.run_deferred_slice(owned, base, &hub, &config, dirty, range, txn_seq.max(1))
                })
            };
            let (returned, state, outcome, effects) = match pass.await {
                Ok(result) => result,
                Err(err) => {
                    error!(module_id = %self.module_id, error = %err, "deferred slice task failed");
                    self.committed().deferred_carry = Some(pending.clone());
                    return outcomes;
                }
            };
            *caches = returned;

            if outcome.degrade_reason().is_some() {
                let mut carried = PendingDeferred::new(pending.first_at);
                carried.touch(&dirty, self.clock.now_ms());
                self.committed().deferred_carry = Some(carried);
                outcomes.push(outcome);
                return outcomes;
            }

            {
                let mut committed = self.committed();
                if committed.version == version {
                    committed.state = state;
                } else {
                    committed.state = Arc::new(replay(&committed.state, &effects.patches));
                }
                committed.version += 1;
            }
            dirty.merge(&DirtyInput::paths(effects.changed_paths(&self.program)));
            self.dispatch_loads(effects);
            outcomes.push(outcome);
        }
        outcomes
    }

    #[allow(clippy::too_many_arguments)]
    fn run_deferred_slice(
        &self,
        mut caches: InstanceCaches,
        base: Arc<Value>,
        hub: &DiagnosticsHub,
        config: &ResolvedConvergeConfig,
        dirty: DirtyInput,
        range: std::ops::Range<usize>,
        txn_seq: u64,
    ) -> (InstanceCaches, Arc<Value>, ConvergeOutcome, PassEffects) {
        let mut state = base;
        let (outcome, effects) = {
            let mut ctx = ConvergeContext::new(
                &self.module_id,
                &mut state,
                &mut caches,
                self.recorder.as_ref(),
                self.clock.as_ref(),
                hub,
            )
            .with_txn_seq(txn_seq)
            .with_mode(config.mode)
            .with_config_scope(config.config_scope)
            .with_budget_ms(config.budget_ms)
            .with_decision_budget_ms(config.decision_budget_ms)
            .with_dirty(dirty)
            .with_scope(SchedulingScope::Deferred)
            .with_slice(range)
            .with_time_slicing(TimeSlicingSummary {
                enabled: true,
                scope: SchedulingScope::Deferred,
                deferred_step_count: self.program.plan.deferred.len(),
            });
            let outcome = converge_in_transaction(&self.program, &mut ctx);
            (outcome, std::mem::take(&mut ctx.effects))
        };
        (caches, state, outcome, effects)
    }
}

async fn scheduler_loop(weak: Weak<Inner>, notify: Arc<Notify>, clock: Arc<dyn Clock>) {
    loop {
        let deadline = match weak.upgrade() {
            Some(inner) => inner.next_deadline(),
            None => return,
        };
        let Some(deadline) = deadline else {
            notify.notified().await;
            continue;
        };

        let delay = deadline - clock.now_ms();
        if delay > 0.0 {
            tokio::select! {
                () = notify.notified() => continue,
                () = tokio::time::sleep(Duration::from_secs_f64(delay / 1000.0)) => {}
            }
        }

        let Some(inner) = weak.upgrade() else {
            return;
        };
        let outcomes = inner.flush_deferred().await;
        debug!(module_id = %inner.module_id, passes = outcomes.len(), "scheduled deferred flush done");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::converge::{ConvergeMode, DecisionReason, ExecutedMode};
    use crate::domain::models::field_path::StateSchema;
    use crate::domain::models::trait_spec::{TraitEntry, TraitSpec};
    use crate::services::program_builder::build;

    fn runtime(spec: &TraitSpec, state: Value) -> (TraitRuntime, Arc<PatchLog>) {
        let log = Arc::new(PatchLog::new());
        let program = Arc::new(build(&StateSchema::new(), spec).unwrap());
        let options = RuntimeOptions::new()
            .with_recorder(log.clone())
            .with_diagnostics(DiagnosticsHub::off());
        (TraitRuntime::new("test", program, state, options), log)
    }

    fn doubled() -> TraitSpec {
        TraitSpec::new().with(TraitEntry::computed("double", ["n"], |d| {
            Ok(json!(d.as_f64(0).unwrap_or(0.0) * 2.0))
        }))
    }

    #[tokio::test]
    async fn test_transaction_commits_host_and_derived_writes() {
        let (rt, log) = runtime(&doubled(), json!({"n": 1}));
        let outcome = rt.transaction(|tx| tx.set("n", json!(4))).await.unwrap();

        assert!(outcome.is_converged());
        assert_eq!(rt.state()["double"], json!(8.0));
        assert_eq!(rt.txn_seq(), 1);
        let reasons: Vec<PatchReason> = log.records().iter().map(|p| p.reason).collect();
        assert_eq!(reasons, vec![PatchReason::Host, PatchReason::Computed]);
    }

    #[test]
    fn test_instances_get_distinct_ids() {
        let (a, _) = runtime(&doubled(), json!({"n": 1}));
        let (b, _) = runtime(&doubled(), json!({"n": 1}));
        assert_ne!(a.instance_id(), b.instance_id());
        assert_eq!(a.module_id(), b.module_id());
    }

    #[test]
    fn test_instances_share_cached_program() {
        let programs = ProgramCache::new();
        let schema = StateSchema::new();
        let a = TraitRuntime::from_spec("m", &programs, &schema, &doubled(), json!({"n": 1}), RuntimeOptions::new())
            .unwrap();
        let b = TraitRuntime::from_spec("m", &programs, &schema, &doubled(), json!({"n": 2}), RuntimeOptions::new())
            .unwrap();

        assert!(Arc::ptr_eq(a.program(), b.program()));
        assert_eq!(programs.misses(), 1);
        assert_eq!(programs.hits(), 1);
        assert_ne!(a.instance_id(), b.instance_id());

        let cyclic = TraitSpec::new().with(TraitEntry::computed("x", ["x"], |_| Ok(json!(0))));
        let err = TraitRuntime::from_spec("m", &programs, &schema, &cyclic, json!({}), RuntimeOptions::new());
        assert!(err.is_err());
    }

    #[test]
    fn test_schema_mismatch_warned_once_at_start() {
        use crate::domain::models::config::SamplingConfig;
        use crate::domain::models::diagnostics::DiagnosticLevel;
        use crate::services::diagnostics::MemorySink;

        let sink = Arc::new(MemorySink::new());
        let schema = StateSchema::from_paths(["n"]).unwrap();
        let program = Arc::new(build(&schema, &doubled()).unwrap());
        let options = RuntimeOptions::new().with_diagnostics(
            DiagnosticsHub::new(DiagnosticLevel::Light, SamplingConfig::default()).with_sink(sink.clone()),
        );
        let _rt = TraitRuntime::new("checkout", program, json!({"n": 1}), options);

        let warnings = sink.with_code(SCHEMA_MISMATCH);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].data["paths"], json!(["double"]));
    }

    #[tokio::test]
    async fn test_trait_owned_write_is_rejected() {
        let (rt, log) = runtime(&doubled(), json!({"n": 1}));
        let err = rt
            .transaction(|tx| {
                tx.set("n", json!(2))?;
                tx.set("double", json!(99))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, DomainError::TraitOwnedWrite { .. }));
        assert_eq!(rt.txn_seq(), 0);
        assert_eq!(*rt.state(), json!({"n": 1}));
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn test_second_transaction_runs_dirty() {
        let (rt, _log) = runtime(&doubled().with(TraitEntry::link("copy", "other")), json!({"n": 1, "other": 0}));
        rt.transaction(|tx| tx.set("n", json!(2))).await.unwrap();
        let outcome = rt
            .transaction_with(Some(&ConvergePatch::mode(ConvergeMode::Dirty)), |tx| tx.set("n", json!(3)))
            .await
            .unwrap();

        let summary = outcome.summary();
        assert_eq!(summary.executed_mode, ExecutedMode::Dirty);
        assert!(summary.has_reason(DecisionReason::ProviderOverride));
        assert_eq!(summary.step_stats.executed, 1);
        assert_eq!(rt.state()["double"], json!(6.0));
    }

    #[tokio::test]
    async fn test_custom_mutation_marks_everything_dirty() {
        let (rt, _log) = runtime(&doubled(), json!({"n": 1}));
        rt.transaction(|_| Ok(())).await.unwrap();
        let outcome = rt
            .transaction(|tx| {
                tx.mutate(|state| state["n"] = json!(10));
                Ok(())
            })
            .await
            .unwrap();

        assert!(outcome.summary().has_reason(DecisionReason::DirtyAll));
        assert_eq!(rt.state()["double"], json!(20.0));
    }

    #[tokio::test]
    async fn test_degraded_pass_keeps_host_write_and_retries() {
        let spec = TraitSpec::new().with(TraitEntry::computed("checked", ["n"], |d| {
            match d.as_f64(0) {
                Some(n) if n < 0.0 => Err(crate::domain::errors::TraitError::failed("negative")),
                other => Ok(json!(other)),
            }
        }));
        let (rt, _log) = runtime(&spec, json!({"n": 1}));
        rt.transaction(|_| Ok(())).await.unwrap();

        let outcome = rt.transaction(|tx| tx.set("n", json!(-1))).await.unwrap();
        assert!(outcome.degrade_reason().is_some());
        assert_eq!(rt.state()["n"], json!(-1));
        assert_eq!(rt.state()["checked"], json!(1.0));

        let outcome = rt
            .transaction_with(Some(&ConvergePatch::mode(ConvergeMode::Dirty)), |tx| tx.set("n", json!(5)))
            .await
            .unwrap();
        assert!(outcome.is_converged());
        assert_eq!(rt.state()["checked"], json!(5.0));
    }
}
