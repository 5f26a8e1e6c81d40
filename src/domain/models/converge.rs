//! Per-pass convergence types: modes, dirty sets, outcomes and decision summaries.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::domain::models::diagnostics::Hotspot;
use crate::domain::models::field_path::FieldPathId;
use crate::domain::models::program::SchedulingScope;

/// Requested convergence strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergeMode {
    Full,
    Dirty,
    #[default]
    Auto,
}

impl ConvergeMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Dirty => "dirty",
            Self::Auto => "auto",
        }
    }
}

impl FromStr for ConvergeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "dirty" => Ok(Self::Dirty),
            "auto" => Ok(Self::Auto),
            other => Err(format!("unknown converge mode '{other}' (expected full, dirty or auto)")),
        }
    }
}

impl fmt::Display for ConvergeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strategy a pass actually executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutedMode {
    Full,
    Dirty,
}

impl ExecutedMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Dirty => "dirty",
        }
    }
}

/// Stable reason codes for the conservative dirty-all fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DirtyAllReason {
    /// A write that cannot be attributed to any path (`*`, or no paths at all).
    UnknownWrite,
    /// The host mutated state through an opaque callback.
    CustomMutation,
    /// A dirty path could not be parsed.
    NonTrackablePatch,
    /// A dirty path is not part of the registered path table.
    FallbackPolicy,
}

impl DirtyAllReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UnknownWrite => "unknownWrite",
            Self::CustomMutation => "customMutation",
            Self::NonTrackablePatch => "nonTrackablePatch",
            Self::FallbackPolicy => "fallbackPolicy",
        }
    }
}

/// What the host reports as changed since the last pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirtyInput {
    pub paths: Vec<String>,
    pub dirty_all_reason: Option<DirtyAllReason>,
}

impl DirtyInput {
    /// No changes reported. Resolves to dirty-all (`unknownWrite`), matching
    /// a pass whose cause cannot be attributed.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
            dirty_all_reason: None,
        }
    }

    pub const fn all(reason: DirtyAllReason) -> Self {
        Self {
            paths: Vec::new(),
            dirty_all_reason: Some(reason),
        }
    }

    /// Fold another input into this one; an explicit reason wins.
    pub fn merge(&mut self, other: &Self) {
        if self.dirty_all_reason.is_none() {
            self.dirty_all_reason = other.dirty_all_reason;
        }
        for path in &other.paths {
            if !self.paths.contains(path) {
                self.paths.push(path.clone());
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty() && self.dirty_all_reason.is_none()
    }
}

/// Resolved dirty set: prefix-free sorted roots, or everything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirtySet {
    Roots {
        roots: Vec<FieldPathId>,
        key_hash: u64,
    },
    All {
        reason: DirtyAllReason,
    },
}

impl DirtySet {
    pub const fn is_all(&self) -> bool {
        matches!(self, Self::All { .. })
    }

    pub fn roots(&self) -> &[FieldPathId] {
        match self {
            Self::Roots { roots, .. } => roots,
            Self::All { .. } => &[],
        }
    }

    pub const fn reason(&self) -> Option<DirtyAllReason> {
        match self {
            Self::Roots { .. } => None,
            Self::All { reason } => Some(*reason),
        }
    }
}

/// Why a decision came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    ColdStart,
    ExplicitMode,
    DirtyAll,
    UnknownWrite,
    NearFull,
    BudgetCutoff,
    HistoryPrefersFull,
    CacheHit,
    CacheMiss,
    ModuleOverride,
    ProviderOverride,
}

impl DecisionReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ColdStart => "cold_start",
            Self::ExplicitMode => "explicit_mode",
            Self::DirtyAll => "dirty_all",
            Self::UnknownWrite => "unknown_write",
            Self::NearFull => "near_full",
            Self::BudgetCutoff => "budget_cutoff",
            Self::HistoryPrefersFull => "history_prefers_full",
            Self::CacheHit => "cache_hit",
            Self::CacheMiss => "cache_miss",
            Self::ModuleOverride => "module_override",
            Self::ProviderOverride => "provider_override",
        }
    }
}

/// Configuration layer that supplied the effective convergence settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigScope {
    #[default]
    Builtin,
    RuntimeDefault,
    RuntimeModule,
    Provider,
}

impl ConfigScope {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Builtin => "builtin",
            Self::RuntimeDefault => "runtime_default",
            Self::RuntimeModule => "runtime_module",
            Self::Provider => "provider",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepStats {
    /// Steps in the pass's scheduling scope.
    pub total: usize,
    pub executed: usize,
    pub skipped: usize,
    /// Steps whose output changed.
    pub changed: usize,
    /// Steps selected by the plan before live dirty checks.
    pub affected: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirtySummary {
    pub dirty_all: bool,
    pub reason: Option<DirtyAllReason>,
    pub root_count: usize,
    /// First few root ids, for audit only.
    pub root_ids: Vec<u32>,
    pub truncated: bool,
}

impl DirtySummary {
    const ROOT_ID_SAMPLE: usize = 3;

    pub fn from_set(set: &DirtySet) -> Self {
        match set {
            DirtySet::All { reason } => Self {
                dirty_all: true,
                reason: Some(*reason),
                ..Self::default()
            },
            DirtySet::Roots { roots, .. } => Self {
                dirty_all: false,
                reason: None,
                root_count: roots.len(),
                root_ids: roots
                    .iter()
                    .take(Self::ROOT_ID_SAMPLE)
                    .map(|r| r.raw())
                    .collect(),
                truncated: roots.len() > Self::ROOT_ID_SAMPLE,
            },
        }
    }
}

/// Dirty-plan cache counters at decision time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEvidence {
    pub hits: u64,
    pub misses: u64,
    pub evicts: u64,
    pub size: usize,
    pub capacity: usize,
    pub hit: bool,
    pub disabled: bool,
    pub disable_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeSlicingSummary {
    pub enabled: bool,
    pub scope: SchedulingScope,
    pub deferred_step_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplingSummary {
    pub sample_every_n: u64,
    pub top_k: usize,
    pub sampled: bool,
}

/// Audit record of one pass: what was asked, what ran, and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionSummary {
    pub requested_mode: ConvergeMode,
    pub executed_mode: ExecutedMode,
    pub config_scope: ConfigScope,
    pub reasons: Vec<DecisionReason>,
    pub step_stats: StepStats,
    pub dirty: DirtySummary,
    pub decision_duration_ms: f64,
    pub execution_duration_ms: f64,
    pub cache: Option<CacheEvidence>,
    pub program_digest: String,
    pub generation: u64,
    pub txn_seq: u64,
    pub scheduling_scope: SchedulingScope,
    pub time_slicing: Option<TimeSlicingSummary>,
    pub sampling: Option<SamplingSummary>,
    pub hotspots: Vec<Hotspot>,
}

impl DecisionSummary {
    pub fn has_reason(&self, reason: DecisionReason) -> bool {
        self.reasons.contains(&reason)
    }
}

/// Why a pass was aborted and rolled back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradeReason {
    BudgetExceeded,
    RuntimeError,
}

impl DegradeReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BudgetExceeded => "budget_exceeded",
            Self::RuntimeError => "runtime_error",
        }
    }

    /// Diagnostic code of the warning emitted for this reason.
    pub const fn diagnostic_code(self) -> &'static str {
        match self {
            Self::BudgetExceeded => "trait::budget_exceeded",
            Self::RuntimeError => "trait::runtime_error",
        }
    }
}

/// Result of one convergence pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ConvergeOutcome {
    Converged {
        patch_count: usize,
        summary: DecisionSummary,
    },
    Noop {
        summary: DecisionSummary,
    },
    Degraded {
        reason: DegradeReason,
        error: Option<String>,
        summary: DecisionSummary,
    },
}

impl ConvergeOutcome {
    pub const fn summary(&self) -> &DecisionSummary {
        match self {
            Self::Converged { summary, .. }
            | Self::Noop { summary }
            | Self::Degraded { summary, .. } => summary,
        }
    }

    pub const fn is_converged(&self) -> bool {
        matches!(self, Self::Converged { .. })
    }

    pub const fn is_noop(&self) -> bool {
        matches!(self, Self::Noop { .. })
    }

    pub const fn degrade_reason(&self) -> Option<DegradeReason> {
        match self {
            Self::Degraded { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    pub const fn patch_count(&self) -> usize {
        match self {
            Self::Converged { patch_count, .. } => *patch_count,
            _ => 0,
        }
    }

    pub const fn label(&self) -> &'static str {
        match self {
            Self::Converged { .. } => "converged",
            Self::Noop { .. } => "noop",
            Self::Degraded { .. } => "degraded",
        }
    }
}
