use std::path::Path;

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use thiserror::Error;

use crate::domain::models::config::{Config, ConvergePatch};

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Invalid {field}: {value}. Must be positive")]
    NonPositiveBudget { field: String, value: f64 },

    #[error("Invalid sample_every_n: {0}. Must be at least 1")]
    InvalidSampleEveryN(u64),

    #[error("Invalid top_k: {0}. Must be at least 1")]
    InvalidTopK(usize),

    #[error(
        "Invalid time slicing window: max_lag_ms ({max_lag_ms}) must not be below debounce_ms ({debounce_ms})"
    )]
    InvalidWindow { debounce_ms: f64, max_lag_ms: f64 },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Environment variable prefix; `__` separates nested keys.
pub const ENV_PREFIX: &str = "STATETRAIT_";

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging
    ///
    /// Precedence (lowest to highest):
    /// 1. Serde defaults of [`Config`]
    /// 2. .statetrait/config.yaml (project config)
    /// 3. .statetrait/local.yaml (project local overrides, optional)
    /// 4. Environment variables (STATETRAIT_* prefix, highest priority)
    pub fn load() -> Result<Config> {
        Self::load_from(Path::new("."))
    }

    /// Same as [`ConfigLoader::load`], rooted at `base_dir` instead of the working directory.
    pub fn load_from(base_dir: &Path) -> Result<Config> {
        let dir = base_dir.join(".statetrait");
        // Defaults come from serde rather than a serialized provider, so that
        // camelCase aliases in files never collide with snake_case defaults.
        let config: Config = Figment::new()
            .merge(Yaml::file(dir.join("config.yaml")))
            .merge(Yaml::file(dir.join("local.yaml")))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .context(format!(
                "Failed to load config from {}",
                path.as_ref().display()
            ))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }

        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        // The runtime default is validated as the patch it becomes.
        Self::validate_patch(&ConvergePatch::from_config(&config.converge))?;
        for (module_id, patch) in &config.converge.trait_converge_overrides_by_module_id {
            Self::validate_patch(patch).map_err(|err| {
                ConfigError::ValidationFailed(format!("override for module '{module_id}': {err}"))
            })?;
        }

        let slicing = config.converge.trait_converge_time_slicing;
        if slicing.enabled && slicing.max_lag_ms < slicing.debounce_ms {
            return Err(ConfigError::InvalidWindow {
                debounce_ms: slicing.debounce_ms,
                max_lag_ms: slicing.max_lag_ms,
            });
        }

        Ok(())
    }

    fn validate_patch(patch: &ConvergePatch) -> Result<(), ConfigError> {
        let budgets = [
            ("trait_converge_budget_ms", patch.trait_converge_budget_ms),
            (
                "trait_converge_decision_budget_ms",
                patch.trait_converge_decision_budget_ms,
            ),
            (
                "txn_lanes.budget_ms",
                patch.txn_lanes.and_then(|lanes| lanes.budget_ms),
            ),
        ];
        for (field, value) in budgets {
            if let Some(value) = value {
                if value <= 0.0 || value.is_nan() {
                    return Err(ConfigError::NonPositiveBudget {
                        field: field.to_string(),
                        value,
                    });
                }
            }
        }

        if let Some(sampling) = patch.trait_converge_diagnostics_sampling {
            if let Some(n) = sampling.sample_every_n.filter(|n| *n == 0) {
                return Err(ConfigError::InvalidSampleEveryN(n));
            }
            if let Some(k) = sampling.top_k.filter(|k| *k == 0) {
                return Err(ConfigError::InvalidTopK(k));
            }
        }
        Ok(())
    }
}
