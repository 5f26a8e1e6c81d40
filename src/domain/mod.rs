//! Domain layer for the statetrait convergence engine
//!
//! This module contains the core types (field paths, trait declarations,
//! compiled programs, pass outcomes) and the ports the engine consumes.

pub mod errors;
pub mod models;
pub mod ports;

// Re-export error types for convenient access
pub use errors::{BuildError, DomainError, DomainResult, FieldPathError, TraitError};
