//! `statetrait converge`: one pass over a supplied state.

use anyhow::{Context, Result};
use clap::Args;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cli::output::{output, CommandOutput, TableFormatter};
use crate::domain::models::config::ConvergePatch;
use crate::domain::models::converge::{ConvergeMode, ConvergeOutcome, DirtyAllReason, DirtyInput};
use crate::domain::models::patch::PatchRecord;
use crate::domain::models::source::LoadRequest;
use crate::infrastructure::clock::SystemClock;
use crate::infrastructure::config::ConfigLoader;
use crate::infrastructure::manifest::TraitManifest;
use crate::infrastructure::patch_log::PatchLog;
use crate::services::config_resolver::RuntimeHandle;
use crate::services::converge_engine::{converge_in_transaction, ConvergeContext, InstanceCaches};
use crate::services::diagnostics::{DiagnosticsHub, TracingSink};

#[derive(Args, Debug)]
pub struct ConvergeArgs {
    /// Path to the YAML trait manifest
    pub manifest: PathBuf,

    /// State as inline JSON or a path to a JSON file
    #[arg(short, long)]
    pub state: String,

    /// Dirty path written before the pass (repeatable); none means unknown write
    #[arg(short, long)]
    pub dirty: Vec<String>,

    /// Convergence mode for this pass (full, dirty, auto)
    #[arg(short, long)]
    pub mode: Option<ConvergeMode>,

    /// Transaction sequence number; 1 or lower is a cold start
    #[arg(long, default_value = "2")]
    pub txn_seq: u64,

    /// Directory holding `.statetrait/`
    #[arg(long, default_value = ".")]
    pub config_root: PathBuf,
}

#[derive(Debug, serde::Serialize)]
pub struct ConvergeReport {
    pub module_id: String,
    pub outcome: ConvergeOutcome,
    pub state: Value,
    pub patches: Vec<PatchRecord>,
    pub load_requests: Vec<LoadRequest>,
}

impl CommandOutput for ConvergeReport {
    fn to_human(&self) -> String {
        let formatter = TableFormatter::new();
        let mut lines = vec![
            format!("Module: {}", self.module_id),
            formatter.format_outcome(&self.outcome),
        ];
        if !self.patches.is_empty() {
            lines.push(format!("\nPatches ({}):", self.patches.len()));
            lines.push(formatter.format_patches(&self.patches));
        }
        if !self.load_requests.is_empty() {
            lines.push(format!("\nLoad requests ({}):", self.load_requests.len()));
            for request in &self.load_requests {
                lines.push(format!(
                    "  - {} <- {} key={}",
                    request.field_path, request.resource_id, request.key
                ));
            }
        }
        lines.push("\nState:".to_string());
        lines.push(serde_json::to_string_pretty(&self.state).unwrap_or_default());
        lines.join("\n")
    }
}

fn read_state(raw: &str) -> Result<Value> {
    let path = Path::new(raw);
    if path.is_file() {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read state file {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("State file {} is not valid JSON", path.display()))
    } else {
        serde_json::from_str(raw).context("--state is neither a file nor valid JSON")
    }
}

pub fn run(args: &ConvergeArgs) -> Result<ConvergeReport> {
    let manifest = TraitManifest::load(&args.manifest)?;
    let program = manifest
        .build_program()
        .with_context(|| format!("Failed to build program for module '{}'", manifest.module_id))?;
    let config = ConfigLoader::load_from(&args.config_root)?;

    // A mode given on the command line is a per-call override.
    let provider = args.mode.map(|mode| ConvergePatch {
        trait_converge_mode: Some(mode),
        ..ConvergePatch::default()
    });
    let resolved = RuntimeHandle::from_config(&config.converge)
        .resolve(&manifest.module_id, provider.as_ref());

    let dirty = if args.dirty.is_empty() {
        DirtyInput::all(DirtyAllReason::UnknownWrite)
    } else {
        DirtyInput::paths(args.dirty.iter().cloned())
    };

    let hub = DiagnosticsHub::new(resolved.diagnostics_level, resolved.sampling)
        .with_sink(Arc::new(TracingSink));
    let log = PatchLog::new();
    let clock = SystemClock::new();
    let mut caches = InstanceCaches::new();
    let mut state = Arc::new(read_state(&args.state)?);

    let (outcome, load_requests) = {
        let mut ctx = ConvergeContext::new(
            &manifest.module_id,
            &mut state,
            &mut caches,
            &log,
            &clock,
            &hub,
        )
        .with_txn_seq(args.txn_seq)
        .with_mode(resolved.mode)
        .with_config_scope(resolved.config_scope)
        .with_budget_ms(resolved.budget_ms)
        .with_decision_budget_ms(resolved.decision_budget_ms)
        .with_dirty(dirty);

        let outcome = converge_in_transaction(&program, &mut ctx);
        (outcome, std::mem::take(&mut ctx.effects.load_requests))
    };

    Ok(ConvergeReport {
        module_id: manifest.module_id.clone(),
        outcome,
        state: Value::clone(&state),
        patches: log.records(),
        load_requests,
    })
}

pub async fn execute(args: ConvergeArgs, json_mode: bool) -> Result<()> {
    output(&run(&args)?, json_mode);
    Ok(())
}
