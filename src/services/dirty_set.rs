//! Dirty-set resolution and incremental plan selection.
//!
//! Host writes arrive as raw path strings. They resolve to a prefix-free set
//! of registered root ids, or to dirty-all with a stable reason whenever a
//! write cannot be attributed precisely. A step is triggered when its output
//! or any dependency overlaps a dirty root.

use crate::domain::models::bitset::DenseBitSet;
use crate::domain::models::converge::{DirtyAllReason, DirtyInput, DirtySet};
use crate::domain::models::field_path::{FieldPath, FieldPathId, FieldPathRegistry};
use crate::domain::models::program::{Program, SchedulingScope, Step, StepId};

/// Steps between two decision-budget checks while computing a plan.
pub const BUDGET_CHECK_INTERVAL: usize = 32;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Resolve host-reported dirty paths against the registry.
///
/// An explicit host reason wins. Otherwise every path is inspected and the
/// reasons apply in a fixed order: any unparsable path
/// (`nonTrackablePatch`), then any unregistered path (`fallbackPolicy`), then
/// any `*` wildcard or an input without a single root (`unknownWrite`).
pub fn resolve(registry: &FieldPathRegistry, input: &DirtyInput) -> DirtySet {
    if let Some(reason) = input.dirty_all_reason {
        return DirtySet::All { reason };
    }

    let mut ids = Vec::with_capacity(input.paths.len());
    let mut invalid = false;
    let mut missing = false;
    let mut saw_star = false;
    for raw in &input.paths {
        if raw.contains('*') {
            saw_star = true;
            continue;
        }
        match FieldPath::parse(raw) {
            Ok(path) => match registry.lookup(&path) {
                Some(id) => ids.push(id),
                None => missing = true,
            },
            Err(_) => invalid = true,
        }
    }

    let reason = if invalid {
        Some(DirtyAllReason::NonTrackablePatch)
    } else if missing {
        Some(DirtyAllReason::FallbackPolicy)
    } else if saw_star || ids.is_empty() {
        Some(DirtyAllReason::UnknownWrite)
    } else {
        None
    };
    if let Some(reason) = reason {
        return DirtySet::All { reason };
    }

    let roots = prefix_free(registry, ids);
    let key_hash = key_hash(&roots);
    DirtySet::Roots { roots, key_hash }
}

/// Sort, dedupe and drop every root that has an ancestor in the set.
fn prefix_free(registry: &FieldPathRegistry, mut ids: Vec<FieldPathId>) -> Vec<FieldPathId> {
    ids.sort_unstable();
    ids.dedup();
    let present: std::collections::HashSet<FieldPathId> = ids.iter().copied().collect();
    ids.retain(|id| !registry.ancestors(*id).iter().any(|a| present.contains(a)));
    ids
}

/// FNV-1a over the raw root ids.
pub fn key_hash(roots: &[FieldPathId]) -> u64 {
    let mut hash = FNV_OFFSET;
    for root in roots {
        for byte in root.raw().to_le_bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
    }
    hash
}

// ============================================================================
// Dirty marks
// ============================================================================

/// Dense marks of dirty roots and their strict ancestors.
#[derive(Debug, Clone)]
pub struct DirtyMarks {
    roots: DenseBitSet,
    ancestors: DenseBitSet,
}

impl DirtyMarks {
    pub fn new(registry: &FieldPathRegistry) -> Self {
        Self {
            roots: DenseBitSet::with_capacity(registry.len()),
            ancestors: DenseBitSet::with_capacity(registry.len()),
        }
    }

    pub fn from_roots(registry: &FieldPathRegistry, roots: &[FieldPathId]) -> Self {
        let mut marks = Self::new(registry);
        for root in roots {
            marks.mark(registry, *root);
        }
        marks
    }

    pub fn mark(&mut self, registry: &FieldPathRegistry, id: FieldPathId) {
        if self.roots.insert(id.index()) {
            for ancestor in registry.ancestors(id) {
                self.ancestors.insert(ancestor.index());
            }
        }
    }

    /// True when `id` overlaps any marked root.
    pub fn overlaps(&self, registry: &FieldPathRegistry, id: FieldPathId) -> bool {
        self.roots.contains(id.index())
            || self.ancestors.contains(id.index())
            || registry
                .ancestors(id)
                .iter()
                .any(|a| self.roots.contains(a.index()))
    }

    /// True when the step's output or any dependency overlaps a marked root.
    pub fn triggers(&self, registry: &FieldPathRegistry, step: &Step) -> bool {
        self.overlaps(registry, step.out_field_path_id)
            || step
                .dep_field_path_ids
                .iter()
                .any(|dep| self.overlaps(registry, *dep))
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

/// Static closure of the steps reachable from `roots` within `scope`, in topo order.
///
/// `over_budget` is polled every [`BUDGET_CHECK_INTERVAL`] steps; returning `true` aborts
/// the computation and yields `None`.
pub fn compute_plan(
    program: &Program,
    roots: &[FieldPathId],
    scope: SchedulingScope,
    mut over_budget: Option<&mut dyn FnMut() -> bool>,
) -> Option<Vec<StepId>> {
    let registry = &program.registry;
    let mut marks = DirtyMarks::from_roots(registry, roots);
    let mut selected = Vec::new();

    for (visited, step_id) in program.plan.scope_steps(scope).iter().enumerate() {
        if visited > 0 && visited % BUDGET_CHECK_INTERVAL == 0 {
            if let Some(over_budget) = over_budget.as_deref_mut() {
                if over_budget() {
                    return None;
                }
            }
        }

        let step = program.step(*step_id);
        if marks.triggers(registry, step) {
            selected.push(*step_id);
            marks.mark(registry, step.out_field_path_id);
        }
    }

    Some(selected)
}
