//! Statetrait - convergence engine for derived state fields
//!
//! Modules declare derived fields ("traits") over a JSON state: computed
//! values, links, externally loaded sources, cross-row list checks and
//! fields mirrored from external stores. A
//! declaration set compiles once into a [`Program`]; every host transaction
//! then runs a convergence pass that re-derives only what the transaction
//! dirtied, within a time budget, committing all derived writes atomically
//! or none of them.
//!
//! # Architecture
//!
//! - **Domain Layer** (`domain`): field paths, trait declarations, compiled
//!   programs, pass outcomes and the ports the engine consumes
//! - **Service Layer** (`services`): normalization, graph and plan
//!   compilation, dirty-set resolution, mode decision, the execution
//!   engine, deferred lanes and the module runtime
//! - **Infrastructure Layer** (`infrastructure`): clocks, configuration,
//!   logging, YAML manifests and the patch log
//! - **CLI Layer** (`cli`): command-line interface
//!
//! # Example
//!
//! ```ignore
//! use statetrait::{build, RuntimeOptions, StateSchema, TraitEntry, TraitRuntime, TraitSpec};
//!
//! let spec = TraitSpec::new()
//!     .with(TraitEntry::computed("total", ["price", "qty"], |d| {
//!         Ok(serde_json::json!(d.as_f64(0).unwrap_or(0.0) * d.as_f64(1).unwrap_or(0.0)))
//!     }));
//! let program = std::sync::Arc::new(build(&StateSchema::new(), &spec)?);
//! let runtime = TraitRuntime::new("cart", program, serde_json::json!({"price": 2, "qty": 3}), RuntimeOptions::default());
//! runtime.transaction(|txn| txn.set("qty", serde_json::json!(4))).await?;
//! ```

pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export commonly used types for convenience
pub use domain::models::{
    Config, ConvergeMode, ConvergeOutcome, DecisionReason, DirtyInput, FieldPath, PatchRecord,
    Program, StateSchema, TraitEntry, TraitSpec,
};
pub use domain::{BuildError, DomainError, DomainResult, TraitError};
pub use infrastructure::config::{ConfigError, ConfigLoader};
pub use infrastructure::manifest::TraitManifest;
pub use services::{
    build, converge_in_transaction, export_static_ir, RuntimeHandle, RuntimeOptions, TraitRuntime,
};
