//! Configuration loading
//!
//! Layered configuration using figment:
//! - `.statetrait/config.yaml` and `.statetrait/local.yaml`
//! - `STATETRAIT_*` environment overrides
//! - Validation of budgets, windows and logging settings

pub mod loader;

pub use loader::{ConfigError, ConfigLoader, ENV_PREFIX};
