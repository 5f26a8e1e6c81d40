//! Layered resolution of convergence settings.
//!
//! Layers, lowest first: builtin defaults, the runtime default, the
//! per-module override and the per-call provider override. The effective
//! scope is the highest layer that supplied any value, even one equal to the
//! value below it.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use tracing::{debug, info};

use crate::domain::models::config::{
    ConvergeConfig, ConvergePatch, SamplingConfig, TimeSlicingConfig, TxnLanesConfig,
};
use crate::domain::models::converge::{ConfigScope, ConvergeMode};
use crate::domain::models::diagnostics::DiagnosticLevel;

/// Convergence settings in effect for one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ResolvedConvergeConfig {
    pub mode: ConvergeMode,
    pub budget_ms: f64,
    pub decision_budget_ms: f64,
    pub time_slicing: TimeSlicingConfig,
    pub txn_lanes: TxnLanesConfig,
    pub sampling: SamplingConfig,
    pub diagnostics_level: DiagnosticLevel,
    pub config_scope: ConfigScope,
}

impl Default for ResolvedConvergeConfig {
    fn default() -> Self {
        let builtin = ConvergeConfig::default();
        Self {
            mode: builtin.trait_converge_mode,
            budget_ms: builtin.trait_converge_budget_ms,
            decision_budget_ms: builtin.trait_converge_decision_budget_ms,
            time_slicing: builtin.trait_converge_time_slicing,
            txn_lanes: builtin.txn_lanes,
            sampling: builtin.trait_converge_diagnostics_sampling,
            diagnostics_level: builtin.diagnostics_level,
            config_scope: ConfigScope::Builtin,
        }
    }
}

fn set<T: Copy>(slot: &mut T, value: Option<T>) -> bool {
    match value {
        Some(v) => {
            *slot = v;
            true
        }
        None => false,
    }
}

impl ResolvedConvergeConfig {
    /// Apply one layer; records `scope` when the layer supplies any value.
    pub fn apply(&mut self, patch: &ConvergePatch, scope: ConfigScope) {
        let mut changed = false;
        changed |= set(&mut self.mode, patch.trait_converge_mode);
        changed |= set(&mut self.budget_ms, patch.trait_converge_budget_ms);
        changed |= set(&mut self.decision_budget_ms, patch.trait_converge_decision_budget_ms);
        changed |= set(&mut self.diagnostics_level, patch.diagnostics_level);

        if let Some(ts) = patch.trait_converge_time_slicing {
            changed |= set(&mut self.time_slicing.enabled, ts.enabled);
            changed |= set(&mut self.time_slicing.debounce_ms, ts.debounce_ms);
            changed |= set(&mut self.time_slicing.max_lag_ms, ts.max_lag_ms);
        }
        if let Some(lanes) = patch.txn_lanes {
            changed |= set(&mut self.txn_lanes.enabled, lanes.enabled);
            changed |= set(&mut self.txn_lanes.budget_ms, lanes.budget_ms);
            changed |= set(&mut self.txn_lanes.debounce_ms, lanes.debounce_ms);
            changed |= set(&mut self.txn_lanes.max_lag_ms, lanes.max_lag_ms);
            changed |= set(&mut self.txn_lanes.allow_coalesce, lanes.allow_coalesce);
        }
        if let Some(sampling) = patch.trait_converge_diagnostics_sampling {
            changed |= set(&mut self.sampling.sample_every_n, sampling.sample_every_n);
            changed |= set(&mut self.sampling.top_k, sampling.top_k);
        }

        if changed && scope > self.config_scope {
            self.config_scope = scope;
        }
    }
}

#[derive(Debug, Clone, Default)]
struct RuntimeOverrides {
    default: ConvergePatch,
    by_module: HashMap<String, ConvergePatch>,
}

/// Shared, hot-swappable runtime configuration.
///
/// Every transaction resolves its settings through the handle, so a change
/// applies from the next transaction on.
#[derive(Debug, Clone, Default)]
pub struct RuntimeHandle {
    inner: Arc<RwLock<RuntimeOverrides>>,
}

impl RuntimeHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle seeded from a loaded configuration file.
    pub fn from_config(config: &ConvergeConfig) -> Self {
        let overrides = RuntimeOverrides {
            default: ConvergePatch::from_config(config),
            by_module: config
                .trait_converge_overrides_by_module_id
                .iter()
                .map(|(id, patch)| (id.clone(), patch.clone()))
                .collect(),
        };
        Self {
            inner: Arc::new(RwLock::new(overrides)),
        }
    }

    pub fn set_default(&self, patch: ConvergePatch) {
        self.write().default = patch;
        info!("runtime default convergence config replaced");
    }

    pub fn set_module_override(&self, module_id: impl Into<String>, patch: ConvergePatch) {
        let module_id = module_id.into();
        info!(module_id = %module_id, "module convergence override set");
        self.write().by_module.insert(module_id, patch);
    }

    /// Remove a module override; returns whether one existed.
    pub fn remove_module_override(&self, module_id: &str) -> bool {
        let removed = self.write().by_module.remove(module_id).is_some();
        if removed {
            info!(module_id, "module convergence override removed");
        }
        removed
    }

    pub fn module_override(&self, module_id: &str) -> Option<ConvergePatch> {
        self.read().by_module.get(module_id).cloned()
    }

    /// Effective settings for `module_id`, with an optional per-call override.
    pub fn resolve(&self, module_id: &str, provider: Option<&ConvergePatch>) -> ResolvedConvergeConfig {
        let mut resolved = ResolvedConvergeConfig::default();
        {
            let overrides = self.read();
            resolved.apply(&overrides.default, ConfigScope::RuntimeDefault);
            if let Some(patch) = overrides.by_module.get(module_id) {
                resolved.apply(patch, ConfigScope::RuntimeModule);
            }
        }
        if let Some(patch) = provider {
            resolved.apply(patch, ConfigScope::Provider);
        }
        debug!(
            module_id,
            mode = resolved.mode.as_str(),
            scope = resolved.config_scope.as_str(),
            "resolved convergence config"
        );
        resolved
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RuntimeOverrides> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RuntimeOverrides> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::config::TxnLanesPatch;

    #[test]
    fn test_builtin_without_layers() {
        let resolved = RuntimeHandle::new().resolve("m", None);
        assert_eq!(resolved.config_scope, ConfigScope::Builtin);
        assert_eq!(resolved, ResolvedConvergeConfig::default());
    }

    #[test]
    fn test_loaded_defaults_count_as_runtime_default() {
        let handle = RuntimeHandle::from_config(&ConvergeConfig::default());
        let resolved = handle.resolve("m", None);
        assert_eq!(resolved.config_scope, ConfigScope::RuntimeDefault);
        assert_eq!(resolved.mode, ResolvedConvergeConfig::default().mode);
        assert_eq!(resolved.txn_lanes, ResolvedConvergeConfig::default().txn_lanes);
    }

    #[test]
    fn test_highest_changing_scope_wins() {
        let handle = RuntimeHandle::new();
        handle.set_default(ConvergePatch {
            trait_converge_budget_ms: Some(50.0),
            ..ConvergePatch::default()
        });
        assert_eq!(handle.resolve("m", None).config_scope, ConfigScope::RuntimeDefault);

        handle.set_module_override("m", ConvergePatch::mode(ConvergeMode::Full));
        let resolved = handle.resolve("m", None);
        assert_eq!(resolved.config_scope, ConfigScope::RuntimeModule);
        assert_eq!(resolved.mode, ConvergeMode::Full);
        assert!((resolved.budget_ms - 50.0).abs() < f64::EPSILON);

        // Restating the module value still attributes the setting to the provider.
        let same = ConvergePatch::mode(ConvergeMode::Full);
        assert_eq!(handle.resolve("m", Some(&same)).config_scope, ConfigScope::Provider);

        let provider = ConvergePatch::mode(ConvergeMode::Dirty);
        let resolved = handle.resolve("m", Some(&provider));
        assert_eq!(resolved.config_scope, ConfigScope::Provider);
        assert_eq!(resolved.mode, ConvergeMode::Dirty);
    }

    #[test]
    fn test_removing_override_hot_switches() {
        let handle = RuntimeHandle::new();
        handle.set_module_override("m", ConvergePatch::mode(ConvergeMode::Dirty));
        let clone = handle.clone();
        assert_eq!(clone.resolve("m", None).mode, ConvergeMode::Dirty);
        assert_eq!(clone.resolve("other", None).mode, ConvergeMode::Auto);

        assert!(handle.remove_module_override("m"));
        assert!(!handle.remove_module_override("m"));
        assert_eq!(clone.resolve("m", None).mode, ConvergeMode::Auto);
    }

    #[test]
    fn test_nested_patches_merge_field_by_field() {
        let handle = RuntimeHandle::new();
        handle.set_module_override(
            "m",
            ConvergePatch {
                txn_lanes: Some(TxnLanesPatch {
                    allow_coalesce: Some(false),
                    ..TxnLanesPatch::default()
                }),
                ..ConvergePatch::default()
            },
        );
        let lanes = handle.resolve("m", None).txn_lanes;
        assert!(!lanes.allow_coalesce);
        assert!(lanes.enabled);
        assert!((lanes.max_lag_ms - 50.0).abs() < f64::EPSILON);
    }
}
