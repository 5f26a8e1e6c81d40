//! Domain models for trait declarations, compiled programs and convergence passes.

pub mod bitset;
pub mod config;
pub mod converge;
pub mod diagnostics;
pub mod field_path;
pub mod patch;
pub mod program;
pub mod source;
pub mod trait_spec;

pub use bitset::DenseBitSet;
pub use config::{
    Config, ConvergeConfig, ConvergePatch, LoggingConfig, SamplingConfig, SamplingPatch,
    TimeSlicingConfig, TimeSlicingPatch, TxnLanesConfig, TxnLanesPatch,
};
pub use converge::{
    CacheEvidence, ConfigScope, ConvergeMode, ConvergeOutcome, DecisionReason, DecisionSummary,
    DegradeReason, DirtyAllReason, DirtyInput, DirtySet, DirtySummary, ExecutedMode,
    SamplingSummary, StepStats, TimeSlicingSummary,
};
pub use diagnostics::{DiagnosticLevel, DiagnosticRecord, Hotspot, Severity};
pub use field_path::{FieldPath, FieldPathId, FieldPathRegistry, Segment, StateSchema};
pub use patch::{PatchReason, PatchRecord};
pub use program::{
    BuildOptions, GraphEdge, GraphNode, NormalizedBody, NormalizedEntry, Plan, Program,
    SchedulingScope, Step, StepId, TraitGraph,
};
pub use source::{LoadRequest, SourceSnapshot, SourceStatus};
pub use trait_spec::{
    Deps, DeriveFn, EqualsFn, EqualsPolicy, KeyFn, ListRule, Scheduling, SourceConcurrency,
    TraitBody, TraitEntry, TraitKind, TraitSpec,
};
