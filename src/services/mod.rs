//! Service layer: program compilation, convergence passes and runtime lanes.

pub mod config_resolver;
pub mod converge_engine;
pub mod diagnostics;
pub mod dirty_set;
pub mod draft;
pub mod external_store;
pub mod graph_builder;
pub mod list_scope;
pub mod mode_decision;
pub mod module_runtime;
pub mod plan_cache;
pub mod plan_compiler;
pub mod program_builder;
pub mod row_identity;
pub mod source_refresh;
pub mod spec_normalizer;
pub mod static_ir;
pub mod time_slicing;

pub use config_resolver::{ResolvedConvergeConfig, RuntimeHandle};
pub use converge_engine::{converge_in_transaction, ConvergeContext, InstanceCaches, PassEffects};
pub use diagnostics::{DiagnosticsHub, MemorySink, TracingSink};
pub use external_store::{StoreRegistry, StoreSync};
pub use module_runtime::{RuntimeOptions, TraitRuntime, TxnWriter};
pub use plan_cache::{DirtyPlanCache, ProgramCache};
pub use program_builder::{build, build_with_options};
pub use source_refresh::{ResourceRegistry, SourceRefresher};
pub use static_ir::{export_static_ir, StaticIr};
pub use time_slicing::PendingDeferred;
