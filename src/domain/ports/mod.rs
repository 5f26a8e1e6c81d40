//! Port trait definitions (Hexagonal Architecture)
//!
//! Interfaces the engine consumes from its host:
//! - Clock: injectable time source for budgets and sampling
//! - PatchRecorder: ordered log of every field write
//! - DiagnosticSink: consumer of structured diagnostic records
//! - ResourceLoader: external loader behind a source trait
//! - ExternalStore: externally owned value behind an external-store trait

pub mod clock;
pub mod diagnostic_sink;
pub mod external_store;
pub mod patch_recorder;
pub mod resource_loader;

pub use clock::Clock;
pub use diagnostic_sink::DiagnosticSink;
pub use external_store::ExternalStore;
pub use patch_recorder::PatchRecorder;
pub use resource_loader::ResourceLoader;
