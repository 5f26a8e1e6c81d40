use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::models::converge::ConvergeMode;
use crate::domain::models::diagnostics::DiagnosticLevel;

/// Main configuration structure for statetrait
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Runtime-default convergence configuration
    #[serde(default)]
    pub converge: ConvergeConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Directory for rolling log files (stderr only when unset)
    #[serde(default)]
    pub log_dir: Option<String>,

    /// Log retention in days
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

const fn default_retention_days() -> u32 {
    30
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            log_dir: None,
            retention_days: default_retention_days(),
        }
    }
}

/// Convergence configuration surface.
///
/// Keys are snake_case; the camelCase spellings used by other hosts are
/// accepted as aliases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ConvergeConfig {
    #[serde(default, alias = "traitConvergeMode")]
    pub trait_converge_mode: ConvergeMode,

    /// Execution budget of one pass
    #[serde(default = "default_budget_ms", alias = "traitConvergeBudgetMs")]
    pub trait_converge_budget_ms: f64,

    /// Budget of the auto-mode decision itself
    #[serde(
        default = "default_decision_budget_ms",
        alias = "traitConvergeDecisionBudgetMs"
    )]
    pub trait_converge_decision_budget_ms: f64,

    #[serde(default, alias = "traitConvergeTimeSlicing")]
    pub trait_converge_time_slicing: TimeSlicingConfig,

    #[serde(default, alias = "txnLanes")]
    pub txn_lanes: TxnLanesConfig,

    #[serde(default, alias = "traitConvergeDiagnosticsSampling")]
    pub trait_converge_diagnostics_sampling: SamplingConfig,

    #[serde(default, alias = "diagnosticsLevel")]
    pub diagnostics_level: DiagnosticLevel,

    /// Per-module overrides, keyed by module id
    #[serde(default, alias = "traitConvergeOverridesByModuleId")]
    pub trait_converge_overrides_by_module_id: BTreeMap<String, ConvergePatch>,
}

const fn default_budget_ms() -> f64 {
    200.0
}

const fn default_decision_budget_ms() -> f64 {
    0.5
}

impl Default for ConvergeConfig {
    fn default() -> Self {
        Self {
            trait_converge_mode: ConvergeMode::Auto,
            trait_converge_budget_ms: default_budget_ms(),
            trait_converge_decision_budget_ms: default_decision_budget_ms(),
            trait_converge_time_slicing: TimeSlicingConfig::default(),
            txn_lanes: TxnLanesConfig::default(),
            trait_converge_diagnostics_sampling: SamplingConfig::default(),
            diagnostics_level: DiagnosticLevel::default(),
            trait_converge_overrides_by_module_id: BTreeMap::new(),
        }
    }
}

/// Deferred-step scheduling windows
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TimeSlicingConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_slicing_debounce_ms", alias = "debounceMs")]
    pub debounce_ms: f64,

    #[serde(default = "default_slicing_max_lag_ms", alias = "maxLagMs")]
    pub max_lag_ms: f64,
}

const fn default_slicing_debounce_ms() -> f64 {
    16.0
}

const fn default_slicing_max_lag_ms() -> f64 {
    200.0
}

impl Default for TimeSlicingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            debounce_ms: default_slicing_debounce_ms(),
            max_lag_ms: default_slicing_max_lag_ms(),
        }
    }
}

/// Separate transaction lane for deferred flushes
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TxnLanesConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Work slice budget after which the deferred lane yields
    #[serde(default = "default_lane_budget_ms", alias = "budgetMs")]
    pub budget_ms: f64,

    #[serde(default, alias = "debounceMs")]
    pub debounce_ms: f64,

    #[serde(default = "default_lane_max_lag_ms", alias = "maxLagMs")]
    pub max_lag_ms: f64,

    #[serde(default = "default_true", alias = "allowCoalesce")]
    pub allow_coalesce: bool,
}

const fn default_true() -> bool {
    true
}

const fn default_lane_budget_ms() -> f64 {
    1.0
}

const fn default_lane_max_lag_ms() -> f64 {
    50.0
}

impl Default for TxnLanesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            budget_ms: default_lane_budget_ms(),
            debounce_ms: 0.0,
            max_lag_ms: default_lane_max_lag_ms(),
            allow_coalesce: true,
        }
    }
}

/// Slow-step sampling under `sampled` diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SamplingConfig {
    #[serde(default = "default_sample_every_n", alias = "sampleEveryN")]
    pub sample_every_n: u64,

    #[serde(default = "default_top_k", alias = "topK")]
    pub top_k: usize,
}

const fn default_sample_every_n() -> u64 {
    32
}

const fn default_top_k() -> usize {
    3
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            sample_every_n: default_sample_every_n(),
            top_k: default_top_k(),
        }
    }
}

// ============================================================================
// Partial overrides
// ============================================================================

/// Partial convergence settings contributed by one configuration scope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct ConvergePatch {
    #[serde(alias = "traitConvergeMode")]
    pub trait_converge_mode: Option<ConvergeMode>,

    #[serde(alias = "traitConvergeBudgetMs")]
    pub trait_converge_budget_ms: Option<f64>,

    #[serde(alias = "traitConvergeDecisionBudgetMs")]
    pub trait_converge_decision_budget_ms: Option<f64>,

    #[serde(alias = "traitConvergeTimeSlicing")]
    pub trait_converge_time_slicing: Option<TimeSlicingPatch>,

    #[serde(alias = "txnLanes")]
    pub txn_lanes: Option<TxnLanesPatch>,

    #[serde(alias = "traitConvergeDiagnosticsSampling")]
    pub trait_converge_diagnostics_sampling: Option<SamplingPatch>,

    #[serde(alias = "diagnosticsLevel")]
    pub diagnostics_level: Option<DiagnosticLevel>,
}

impl ConvergePatch {
    /// Patch setting only the mode.
    pub fn mode(mode: ConvergeMode) -> Self {
        Self {
            trait_converge_mode: Some(mode),
            ..Self::default()
        }
    }

    /// Patch carrying every value of a full configuration.
    pub fn from_config(config: &ConvergeConfig) -> Self {
        Self {
            trait_converge_mode: Some(config.trait_converge_mode),
            trait_converge_budget_ms: Some(config.trait_converge_budget_ms),
            trait_converge_decision_budget_ms: Some(config.trait_converge_decision_budget_ms),
            trait_converge_time_slicing: Some(TimeSlicingPatch::from(
                config.trait_converge_time_slicing,
            )),
            txn_lanes: Some(TxnLanesPatch::from(config.txn_lanes)),
            trait_converge_diagnostics_sampling: Some(SamplingPatch::from(
                config.trait_converge_diagnostics_sampling,
            )),
            diagnostics_level: Some(config.diagnostics_level),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct TimeSlicingPatch {
    pub enabled: Option<bool>,
    #[serde(alias = "debounceMs")]
    pub debounce_ms: Option<f64>,
    #[serde(alias = "maxLagMs")]
    pub max_lag_ms: Option<f64>,
}

impl From<TimeSlicingConfig> for TimeSlicingPatch {
    fn from(c: TimeSlicingConfig) -> Self {
        Self {
            enabled: Some(c.enabled),
            debounce_ms: Some(c.debounce_ms),
            max_lag_ms: Some(c.max_lag_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct TxnLanesPatch {
    pub enabled: Option<bool>,
    #[serde(alias = "budgetMs")]
    pub budget_ms: Option<f64>,
    #[serde(alias = "debounceMs")]
    pub debounce_ms: Option<f64>,
    #[serde(alias = "maxLagMs")]
    pub max_lag_ms: Option<f64>,
    #[serde(alias = "allowCoalesce")]
    pub allow_coalesce: Option<bool>,
}

impl From<TxnLanesConfig> for TxnLanesPatch {
    fn from(c: TxnLanesConfig) -> Self {
        Self {
            enabled: Some(c.enabled),
            budget_ms: Some(c.budget_ms),
            debounce_ms: Some(c.debounce_ms),
            max_lag_ms: Some(c.max_lag_ms),
            allow_coalesce: Some(c.allow_coalesce),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct SamplingPatch {
    #[serde(alias = "sampleEveryN")]
    pub sample_every_n: Option<u64>,
    #[serde(alias = "topK")]
    pub top_k: Option<usize>,
}

impl From<SamplingConfig> for SamplingPatch {
    fn from(c: SamplingConfig) -> Self {
        Self {
            sample_every_n: Some(c.sample_every_n),
            top_k: Some(c.top_k),
        }
    }
}
