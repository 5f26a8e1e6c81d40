//! CLI type definitions
//!
//! This module contains clap command structures that define the CLI interface.

use clap::{Parser, Subcommand};

use crate::cli::commands::{config::ConfigArgs, converge::ConvergeArgs, ir::IrArgs, plan::PlanArgs};

#[derive(Parser, Debug)]
#[command(name = "statetrait")]
#[command(about = "Statetrait - convergence engine for derived state fields", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output in JSON format
    #[arg(short, long, global = true)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the static IR of a manifest as JSON
    Ir(IrArgs),

    /// Print the compiled plan of a manifest
    Plan(PlanArgs),

    /// Run one convergence pass over a state
    Converge(ConvergeArgs),

    /// Print the resolved convergence configuration
    Config(ConfigArgs),
}
