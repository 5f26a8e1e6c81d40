//! `statetrait plan`: compiled plan listing.

use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;

use crate::cli::output::{output, CommandOutput, TableFormatter};
use crate::domain::models::program::Program;
use crate::infrastructure::manifest::TraitManifest;

#[derive(Args, Debug)]
pub struct PlanArgs {
    /// Path to the YAML trait manifest
    pub manifest: PathBuf,
}

#[derive(Debug, serde::Serialize)]
pub struct PlanStepOutput {
    pub step_id: u32,
    pub field_path: String,
    pub kind: String,
    pub scheduling: String,
    pub deps: Vec<String>,
}

#[derive(Debug, serde::Serialize)]
pub struct PlanOutput {
    pub module_id: String,
    pub program_digest: String,
    pub schema_mismatches: Vec<String>,
    pub steps: Vec<PlanStepOutput>,
    #[serde(skip)]
    program: Program,
}

impl PlanOutput {
    pub fn new(module_id: String, program: Program) -> Self {
        let steps = program
            .plan
            .steps
            .iter()
            .map(|step| {
                let entry = program.entry(step);
                PlanStepOutput {
                    step_id: step.step_id.0,
                    field_path: entry.field_path.to_string(),
                    kind: step.kind.as_str().to_string(),
                    scheduling: step.scheduling.as_str().to_string(),
                    deps: entry.deps.iter().map(ToString::to_string).collect(),
                }
            })
            .collect();
        Self {
            module_id,
            program_digest: program.digest.clone(),
            schema_mismatches: program.schema_mismatches.clone(),
            steps,
            program,
        }
    }
}

impl CommandOutput for PlanOutput {
    fn to_human(&self) -> String {
        let mut lines = vec![
            format!("Module: {}", self.module_id),
            format!("Digest: {}", self.program_digest),
            format!("Steps: {}", self.steps.len()),
        ];
        if !self.schema_mismatches.is_empty() {
            lines.push(format!(
                "Paths missing from schema: {}",
                self.schema_mismatches.join(", ")
            ));
        }
        lines.push(TableFormatter::new().format_plan(&self.program));
        lines.join("\n")
    }
}

pub fn run(args: &PlanArgs) -> Result<PlanOutput> {
    let manifest = TraitManifest::load(&args.manifest)?;
    let program = manifest
        .build_program()
        .with_context(|| format!("Failed to build program for module '{}'", manifest.module_id))?;
    Ok(PlanOutput::new(manifest.module_id, program))
}

pub async fn execute(args: PlanArgs, json_mode: bool) -> Result<()> {
    output(&run(&args)?, json_mode);
    Ok(())
}
