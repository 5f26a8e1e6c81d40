//! Infrastructure layer module
//!
//! Adapters around the engine:
//! - Clocks (system and manual)
//! - Configuration loading with figment
//! - Logging with tracing-subscriber
//! - YAML trait manifests
//! - In-memory patch log

pub mod clock;
pub mod config;
pub mod logging;
pub mod manifest;
pub mod patch_log;

pub use clock::{ManualClock, SystemClock};
pub use manifest::{ManifestError, TraitManifest};
pub use patch_log::PatchLog;
