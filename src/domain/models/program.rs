//! Compiled program: normalized entries, dependency graph and execution plan.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::models::bitset::DenseBitSet;
use crate::domain::models::field_path::{FieldPath, FieldPathId, FieldPathRegistry};
use crate::domain::models::trait_spec::{
    DeriveFn, EqualsPolicy, KeyFn, ListRule, Scheduling, SourceConcurrency, TraitKind,
};

/// A trait declaration after path parsing and canonicalization.
#[derive(Debug, Clone)]
pub struct NormalizedEntry {
    /// Position in the original declaration list.
    pub decl_index: usize,
    pub kind: TraitKind,
    pub field_path: FieldPath,
    /// Dependencies in declaration order, duplicates removed.
    pub deps: Vec<FieldPath>,
    pub scheduling: Scheduling,
    pub body: NormalizedBody,
}

/// Kind payload with parsed paths.
#[derive(Clone)]
pub enum NormalizedBody {
    Computed {
        derive: DeriveFn,
        equals: EqualsPolicy,
    },
    Link {
        from: FieldPath,
    },
    Source {
        resource_id: String,
        key: KeyFn,
        concurrency: SourceConcurrency,
    },
    ListCheck {
        list: FieldPath,
        key: FieldPath,
        track_by: Option<FieldPath>,
        rule: ListRule,
    },
    ExternalStore {
        store_id: String,
    },
}

impl fmt::Debug for NormalizedBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Computed { equals, .. } => f
                .debug_struct("Computed")
                .field("equals", equals)
                .finish_non_exhaustive(),
            Self::Link { from } => f.debug_struct("Link").field("from", from).finish(),
            Self::Source {
                resource_id,
                concurrency,
                ..
            } => f
                .debug_struct("Source")
                .field("resource_id", resource_id)
                .field("concurrency", concurrency)
                .finish_non_exhaustive(),
            Self::ListCheck {
                list,
                key,
                track_by,
                rule,
            } => f
                .debug_struct("ListCheck")
                .field("list", list)
                .field("key", key)
                .field("track_by", track_by)
                .field("rule", rule)
                .finish(),
            Self::ExternalStore { store_id } => f
                .debug_struct("ExternalStore")
                .field("store_id", store_id)
                .finish(),
        }
    }
}

/// Position of a step in topological order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepId(pub u32);

impl StepId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Dependency graph over trait entries, indexed by declaration position.
#[derive(Debug, Clone, Default)]
pub struct TraitGraph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

#[derive(Debug, Clone)]
pub struct GraphNode {
    pub decl_index: usize,
    pub out: FieldPathId,
    pub deps: Vec<FieldPathId>,
}

/// `from` writes a path that `to` reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct GraphEdge {
    pub from: usize,
    pub to: usize,
}

impl TraitGraph {
    /// Downstream adjacency (`from -> [to]`), sorted and deduplicated.
    pub fn adjacency(&self) -> Vec<Vec<usize>> {
        let mut adj = vec![Vec::new(); self.nodes.len()];
        for edge in &self.edges {
            adj[edge.from].push(edge.to);
        }
        for list in &mut adj {
            list.sort_unstable();
            list.dedup();
        }
        adj
    }
}

/// One executable unit of the plan.
#[derive(Debug, Clone)]
pub struct Step {
    pub step_id: StepId,
    pub decl_index: usize,
    pub kind: TraitKind,
    pub out_field_path_id: FieldPathId,
    pub dep_field_path_ids: Vec<FieldPathId>,
    pub scheduling: Scheduling,
    /// Steps whose output overlaps one of this step's dependencies.
    pub upstream: Vec<StepId>,
}

/// Which part of the plan a pass may execute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingScope {
    #[default]
    All,
    Immediate,
    Deferred,
}

/// Topologically ordered steps plus their lane sub-orders.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub steps: Vec<Step>,
    pub all: Vec<StepId>,
    pub immediate: Vec<StepId>,
    pub deferred: Vec<StepId>,
    pub digest: String,
}

impl Plan {
    pub fn step(&self, id: StepId) -> &Step {
        &self.steps[id.index()]
    }

    pub fn scope_steps(&self, scope: SchedulingScope) -> &[StepId] {
        match scope {
            SchedulingScope::All => &self.all,
            SchedulingScope::Immediate => &self.immediate,
            SchedulingScope::Deferred => &self.deferred,
        }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Build-time options that are not part of the trait spec itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildOptions {
    /// Bumped whenever build-time-only configuration changes.
    pub generation: u64,
}

/// Immutable compiled program, shared across instances behind an `Arc`.
#[derive(Debug, Clone)]
pub struct Program {
    pub registry: FieldPathRegistry,
    pub entries: Vec<NormalizedEntry>,
    pub graph: TraitGraph,
    pub plan: Plan,
    pub digest: String,
    pub generation: u64,
    pub schema_fingerprint: String,
    /// Trait paths that the declared state schema does not contain.
    pub schema_mismatches: Vec<String>,
    pub(crate) owned: DenseBitSet,
    pub(crate) owned_ancestors: DenseBitSet,
}

impl Program {
    pub fn step(&self, id: StepId) -> &Step {
        self.plan.step(id)
    }

    pub fn entry(&self, step: &Step) -> &NormalizedEntry {
        &self.entries[step.decl_index]
    }

    /// Output path of a step, as written.
    pub fn out_path(&self, step: &Step) -> &FieldPath {
        &self.entries[step.decl_index].field_path
    }

    pub fn has_deferred(&self) -> bool {
        !self.plan.deferred.is_empty()
    }

    /// The trait output a host write to `path` would clobber, if any.
    pub fn owner_of(&self, path: &FieldPath) -> Option<&FieldPath> {
        let canonical = path.canonical();
        for prefix in canonical.prefixes() {
            if let Some(id) = self.registry.lookup(&prefix) {
                if self.owned.contains(id.index()) {
                    return self.owner_by_id(id);
                }
            }
        }

        let id = self.registry.lookup(&canonical)?;
        if !self.owned_ancestors.contains(id.index()) {
            return None;
        }
        self.entries
            .iter()
            .map(|e| &e.field_path)
            .find(|out| out.starts_with(&canonical))
    }

    fn owner_by_id(&self, id: FieldPathId) -> Option<&FieldPath> {
        self.plan
            .steps
            .iter()
            .find(|s| s.out_field_path_id == id)
            .map(|s| self.out_path(s))
    }
}
