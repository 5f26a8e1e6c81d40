//! `statetrait ir`: static IR export.

use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;

use crate::cli::output::{output, CommandOutput};
use crate::infrastructure::manifest::TraitManifest;
use crate::services::static_ir::{export_static_ir, StaticIr};

#[derive(Args, Debug)]
pub struct IrArgs {
    /// Path to the YAML trait manifest
    pub manifest: PathBuf,
}

#[derive(Debug, serde::Serialize)]
#[serde(transparent)]
pub struct IrOutput(pub StaticIr);

impl CommandOutput for IrOutput {
    /// The IR is JSON in both modes.
    fn to_human(&self) -> String {
        serde_json::to_string_pretty(&self.0).unwrap_or_default()
    }
}

pub fn run(args: &IrArgs) -> Result<IrOutput> {
    let manifest = TraitManifest::load(&args.manifest)?;
    let program = manifest
        .build_program()
        .with_context(|| format!("Failed to build program for module '{}'", manifest.module_id))?;
    Ok(IrOutput(export_static_ir(&program, &manifest.module_id)))
}

pub async fn execute(args: IrArgs, json_mode: bool) -> Result<()> {
    output(&run(&args)?, json_mode);
    Ok(())
}
