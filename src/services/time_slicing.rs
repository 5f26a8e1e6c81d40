//! Deferred-step bookkeeping: pending work, flush windows and lane slices.

use std::ops::Range;

use serde::Serialize;

use crate::domain::models::config::{TimeSlicingConfig, TxnLanesConfig};
use crate::domain::models::converge::{DirtyAllReason, DirtyInput, DirtySet};
use crate::domain::models::field_path::FieldPathId;
use crate::domain::models::program::Program;
use crate::services::dirty_set::DirtyMarks;

/// Steps per slice of a lane flush.
pub const LANE_SLICE_STEPS: usize = 32;

/// Deferred work recorded by urgent passes and not yet flushed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingDeferred {
    /// Dirty paths, in arrival order without duplicates.
    pub roots: Vec<String>,
    pub dirty_all: Option<DirtyAllReason>,
    pub first_at: f64,
    pub last_at: f64,
}

impl PendingDeferred {
    pub const fn new(now_ms: f64) -> Self {
        Self {
            roots: Vec::new(),
            dirty_all: None,
            first_at: now_ms,
            last_at: now_ms,
        }
    }

    /// Record more dirty input arriving at `now_ms`.
    pub fn touch(&mut self, input: &DirtyInput, now_ms: f64) {
        if self.dirty_all.is_none() {
            self.dirty_all = input.dirty_all_reason;
        }
        for path in &input.paths {
            if !self.roots.contains(path) {
                self.roots.push(path.clone());
            }
        }
        self.last_at = self.last_at.max(now_ms);
    }

    /// Fold another pending descriptor into this one, keeping the oldest start.
    pub fn merge(&mut self, other: &Self) {
        self.touch(&other.to_dirty_input(), other.last_at);
        self.first_at = self.first_at.min(other.first_at);
    }

    pub fn to_dirty_input(&self) -> DirtyInput {
        DirtyInput {
            paths: self.roots.clone(),
            dirty_all_reason: self.dirty_all,
        }
    }
}

/// Debounce and max-lag of the deferred flush.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FlushWindow {
    pub debounce_ms: f64,
    pub max_lag_ms: f64,
}

impl FlushWindow {
    /// Effective window. With lanes enabled the larger debounce and the
    /// smaller max lag of the two configurations apply.
    pub fn effective(slicing: &TimeSlicingConfig, lanes: &TxnLanesConfig) -> Self {
        if lanes.enabled {
            Self {
                debounce_ms: slicing.debounce_ms.max(lanes.debounce_ms),
                max_lag_ms: slicing.max_lag_ms.min(lanes.max_lag_ms),
            }
        } else {
            Self {
                debounce_ms: slicing.debounce_ms,
                max_lag_ms: slicing.max_lag_ms,
            }
        }
    }

    /// When the pending work must be flushed.
    pub fn deadline(&self, pending: &PendingDeferred) -> f64 {
        (pending.last_at + self.debounce_ms).min(pending.first_at + self.max_lag_ms)
    }
}

/// Whether a change touches any deferred step.
pub fn deferred_affected(program: &Program, dirty: &DirtySet, changed: &[FieldPathId]) -> bool {
    if !program.has_deferred() {
        return false;
    }
    let roots = match dirty {
        DirtySet::All { .. } => return true,
        DirtySet::Roots { roots, .. } => roots,
    };
    let mut marks = DirtyMarks::from_roots(&program.registry, roots);
    for id in changed {
        marks.mark(&program.registry, *id);
    }
    program
        .plan
        .deferred
        .iter()
        .any(|id| marks.triggers(&program.registry, program.step(*id)))
}

/// Split `len` steps into consecutive ranges of at most `size`.
pub fn slice_ranges(len: usize, size: usize) -> Vec<Range<usize>> {
    let size = size.max(1);
    (0..len)
        .step_by(size)
        .map(|start| start..(start + size).min(len))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::field_path::StateSchema;
    use crate::domain::models::trait_spec::{TraitEntry, TraitSpec};
    use crate::services::dirty_set::resolve;
    use crate::services::program_builder::build;

    #[test]
    fn test_deadline_is_debounced_and_capped() {
        let window = FlushWindow {
            debounce_ms: 10.0,
            max_lag_ms: 25.0,
        };
        let mut pending = PendingDeferred::new(0.0);
        assert!((window.deadline(&pending) - 10.0).abs() < f64::EPSILON);

        pending.touch(&DirtyInput::paths(["a"]), 8.0);
        assert!((window.deadline(&pending) - 18.0).abs() < f64::EPSILON);

        pending.touch(&DirtyInput::paths(["a"]), 20.0);
        assert!((window.deadline(&pending) - 25.0).abs() < f64::EPSILON);
        assert_eq!(pending.roots, vec!["a"]);
    }

    #[test]
    fn test_lane_windows_combine() {
        let slicing = TimeSlicingConfig {
            enabled: true,
            debounce_ms: 16.0,
            max_lag_ms: 200.0,
        };
        let lanes = TxnLanesConfig {
            debounce_ms: 30.0,
            ..TxnLanesConfig::default()
        };
        let window = FlushWindow::effective(&slicing, &lanes);
        assert!((window.debounce_ms - 30.0).abs() < f64::EPSILON);
        assert!((window.max_lag_ms - 50.0).abs() < f64::EPSILON);

        let off = TxnLanesConfig {
            enabled: false,
            ..lanes
        };
        let window = FlushWindow::effective(&slicing, &off);
        assert!((window.max_lag_ms - 200.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_deferred_affected_follows_immediate_outputs() {
        let spec = TraitSpec::new()
            .with(TraitEntry::computed("fast", ["a"], |d| Ok(d.get(0).clone())))
            .with(TraitEntry::computed("slow", ["fast"], |d| Ok(d.get(0).clone())).deferred())
            .with(TraitEntry::computed("other", ["b"], |d| Ok(d.get(0).clone())));
        let program = build(&StateSchema::new(), &spec).unwrap();
        let fast = program.registry.lookup(&"fast".parse().unwrap()).unwrap();

        let dirty_b = resolve(&program.registry, &DirtyInput::paths(["b"]));
        assert!(!deferred_affected(&program, &dirty_b, &[]));

        let dirty_a = resolve(&program.registry, &DirtyInput::paths(["a"]));
        assert!(deferred_affected(&program, &dirty_a, &[fast]));
        assert!(deferred_affected(
            &program,
            &resolve(&program.registry, &DirtyInput::all(DirtyAllReason::CustomMutation)),
            &[]
        ));
    }

    #[test]
    fn test_slice_ranges() {
        assert_eq!(slice_ranges(70, 32), vec![0..32, 32..64, 64..70]);
        assert!(slice_ranges(0, 32).is_empty());
    }

    #[test]
    fn test_merge_keeps_oldest_start() {
        let mut a = PendingDeferred::new(5.0);
        a.touch(&DirtyInput::paths(["x"]), 6.0);
        let mut b = PendingDeferred::new(2.0);
        b.touch(&DirtyInput::all(DirtyAllReason::UnknownWrite), 9.0);
        a.merge(&b);
        assert!((a.first_at - 2.0).abs() < f64::EPSILON);
        assert!((a.last_at - 9.0).abs() < f64::EPSILON);
        assert_eq!(a.dirty_all, Some(DirtyAllReason::UnknownWrite));
    }
}
