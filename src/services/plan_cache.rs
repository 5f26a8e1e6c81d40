//! Program cache shared across instances and the per-instance dirty-plan cache.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use moka::sync::Cache;
use tracing::debug;

use crate::domain::errors::BuildError;
use crate::domain::models::converge::CacheEvidence;
use crate::domain::models::field_path::{FieldPathId, StateSchema};
use crate::domain::models::program::{BuildOptions, Program, SchedulingScope, StepId};
use crate::domain::models::trait_spec::TraitSpec;
use crate::services::program_builder::build_with_options;
use crate::services::spec_normalizer::normalize;

/// Maximum number of compiled programs kept in a [`ProgramCache`].
const PROGRAM_CACHE_MAX_CAPACITY: u64 = 256;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ProgramKey {
    digest: String,
    schema_fingerprint: String,
    generation: u64,
}

/// Immutable programs keyed by `(digest, schema, generation)`.
///
/// The digest covers declaration structure only. Two specs with the same
/// structure but different derivation closures share an entry, so hosts that
/// swap closures must bump the generation.
pub struct ProgramCache {
    programs: Cache<ProgramKey, Arc<Program>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ProgramCache {
    pub fn new() -> Self {
        Self::with_capacity(PROGRAM_CACHE_MAX_CAPACITY)
    }

    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            programs: Cache::builder().max_capacity(capacity).build(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Return the cached program for `spec`, building it on a miss.
    pub fn get_or_build(
        &self,
        schema: &StateSchema,
        spec: &TraitSpec,
        options: &BuildOptions,
    ) -> Result<Arc<Program>, BuildError> {
        let key = ProgramKey {
            digest: normalize(spec)?.digest,
            schema_fingerprint: schema.fingerprint(),
            generation: options.generation,
        };

        if let Some(program) = self.programs.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(program);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let program = Arc::new(build_with_options(schema, spec, options)?);
        debug!(digest = %key.digest, generation = key.generation, "program cached");
        self.programs.insert(key, Arc::clone(&program));
        Ok(program)
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn invalidate_all(&self) {
        self.programs.invalidate_all();
    }
}

impl Default for ProgramCache {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Dirty-plan cache
// ============================================================================

/// Default number of cached dirty plans per instance.
pub const DIRTY_PLAN_CACHE_CAPACITY: usize = 128;

/// Root sets larger than this are never cached.
const MAX_CACHEABLE_ROOTS: usize = 128;

/// Root sets covering more than this share of the scope are never cached.
const MAX_CACHEABLE_ROOT_RATIO: f64 = 0.5;

/// Lookups observed before the hit rate is judged.
const LOW_HIT_RATE_MIN_LOOKUPS: u64 = 64;

const LOW_HIT_RATE_THRESHOLD: f64 = 0.05;

/// Program generation changes tolerated before the cache gives up.
const MAX_GENERATION_CHANGES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisableReason {
    LowHitRate,
    GenerationThrash,
}

impl DisableReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LowHitRate => "low_hit_rate_protection",
            Self::GenerationThrash => "generation_thrash",
        }
    }
}

type PlanKey = (SchedulingScope, Vec<FieldPathId>);

/// Per-instance cache of `(scope, roots) -> steps` with FIFO eviction.
#[derive(Debug, Clone)]
pub struct DirtyPlanCache {
    entries: HashMap<PlanKey, Arc<[StepId]>>,
    order: VecDeque<PlanKey>,
    capacity: usize,
    hits: u64,
    misses: u64,
    evicts: u64,
    generation: Option<u64>,
    generation_changes: u32,
    disabled: Option<DisableReason>,
}

impl DirtyPlanCache {
    pub fn new() -> Self {
        Self::with_capacity(DIRTY_PLAN_CACHE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
            hits: 0,
            misses: 0,
            evicts: 0,
            generation: None,
            generation_changes: 0,
            disabled: None,
        }
    }

    /// Whether a root set of this size may be cached for a scope of `scope_steps` steps.
    pub fn is_cacheable(root_count: usize, scope_steps: usize) -> bool {
        if root_count == 0 || root_count > MAX_CACHEABLE_ROOTS || scope_steps == 0 {
            return false;
        }
        root_count as f64 / scope_steps as f64 <= MAX_CACHEABLE_ROOT_RATIO
    }

    /// Drop every cached plan when the program generation moves.
    pub fn sync_generation(&mut self, generation: u64) {
        match self.generation {
            Some(current) if current == generation => {}
            Some(_) => {
                self.generation = Some(generation);
                self.generation_changes += 1;
                self.clear_entries();
                if self.generation_changes >= MAX_GENERATION_CHANGES {
                    self.disable(DisableReason::GenerationThrash);
                }
            }
            None => self.generation = Some(generation),
        }
    }

    pub fn lookup(&mut self, scope: SchedulingScope, roots: &[FieldPathId]) -> Option<Arc<[StepId]>> {
        if self.disabled.is_some() {
            return None;
        }

        let key = (scope, roots.to_vec());
        let found = self.entries.get(&key).cloned();
        if found.is_some() {
            self.hits += 1;
        } else {
            self.misses += 1;
        }

        let lookups = self.hits + self.misses;
        if lookups >= LOW_HIT_RATE_MIN_LOOKUPS
            && (self.hits as f64 / lookups as f64) < LOW_HIT_RATE_THRESHOLD
        {
            self.disable(DisableReason::LowHitRate);
        }
        found
    }

    pub fn store(&mut self, scope: SchedulingScope, roots: &[FieldPathId], steps: Arc<[StepId]>) {
        if self.disabled.is_some() {
            return;
        }
        let key = (scope, roots.to_vec());
        if self.entries.contains_key(&key) {
            return;
        }
        while self.entries.len() >= self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if self.entries.remove(&oldest).is_some() {
                self.evicts += 1;
            }
        }
        self.order.push_back(key.clone());
        self.entries.insert(key, steps);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub const fn disabled(&self) -> Option<DisableReason> {
        self.disabled
    }

    /// Counters as reported in a decision summary.
    pub fn evidence(&self, hit: bool) -> CacheEvidence {
        CacheEvidence {
            hits: self.hits,
            misses: self.misses,
            evicts: self.evicts,
            size: self.entries.len(),
            capacity: self.capacity,
            hit,
            disabled: self.disabled.is_some(),
            disable_reason: self.disabled.map(|r| r.as_str().to_string()),
        }
    }

    fn disable(&mut self, reason: DisableReason) {
        if self.disabled.is_none() {
            debug!(reason = reason.as_str(), "dirty plan cache disabled");
            self.disabled = Some(reason);
            self.clear_entries();
        }
    }

    fn clear_entries(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

impl Default for DirtyPlanCache {
    fn default() -> Self {
        Self::new()
    }
}
