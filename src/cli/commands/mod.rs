//! CLI command implementations.

pub mod config;
pub mod converge;
pub mod ir;
pub mod plan;
