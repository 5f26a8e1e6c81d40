//! `statetrait config`: effective convergence settings for a module.

use anyhow::Result;
use clap::Args;
use std::path::PathBuf;

use crate::cli::output::{output, CommandOutput, TableFormatter};
use crate::infrastructure::config::ConfigLoader;
use crate::services::config_resolver::{ResolvedConvergeConfig, RuntimeHandle};

#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Module whose overrides apply
    #[arg(long, default_value = "default")]
    pub module_id: String,

    /// Directory holding `.statetrait/`
    #[arg(long, default_value = ".")]
    pub config_root: PathBuf,
}

#[derive(Debug, serde::Serialize)]
pub struct ConfigOutput {
    pub module_id: String,
    pub resolved: ResolvedConvergeConfig,
    /// Modules with an override in the loaded configuration.
    pub overridden_modules: Vec<String>,
}

impl CommandOutput for ConfigOutput {
    fn to_human(&self) -> String {
        let r = &self.resolved;
        let pairs = vec![
            ("module_id".to_string(), self.module_id.clone()),
            ("config_scope".to_string(), r.config_scope.as_str().to_string()),
            ("mode".to_string(), r.mode.as_str().to_string()),
            ("budget_ms".to_string(), r.budget_ms.to_string()),
            ("decision_budget_ms".to_string(), r.decision_budget_ms.to_string()),
            (
                "time_slicing".to_string(),
                format!(
                    "enabled={} debounce_ms={} max_lag_ms={}",
                    r.time_slicing.enabled, r.time_slicing.debounce_ms, r.time_slicing.max_lag_ms
                ),
            ),
            (
                "txn_lanes".to_string(),
                format!(
                    "enabled={} budget_ms={} debounce_ms={} max_lag_ms={} allow_coalesce={}",
                    r.txn_lanes.enabled,
                    r.txn_lanes.budget_ms,
                    r.txn_lanes.debounce_ms,
                    r.txn_lanes.max_lag_ms,
                    r.txn_lanes.allow_coalesce
                ),
            ),
            (
                "sampling".to_string(),
                format!(
                    "sample_every_n={} top_k={}",
                    r.sampling.sample_every_n, r.sampling.top_k
                ),
            ),
            ("diagnostics_level".to_string(), format!("{:?}", r.diagnostics_level).to_lowercase()),
        ];
        TableFormatter::new().format_pairs(&pairs)
    }
}

pub fn run(args: &ConfigArgs) -> Result<ConfigOutput> {
    let config = ConfigLoader::load_from(&args.config_root)?;
    let resolved = RuntimeHandle::from_config(&config.converge).resolve(&args.module_id, None);
    Ok(ConfigOutput {
        module_id: args.module_id.clone(),
        resolved,
        overridden_modules: config
            .converge
            .trait_converge_overrides_by_module_id
            .keys()
            .cloned()
            .collect(),
    })
}

pub async fn execute(args: ConfigArgs, json_mode: bool) -> Result<()> {
    output(&run(&args)?, json_mode);
    Ok(())
}
