//! Patch records: the ordered log of every field write.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What caused a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PatchReason {
    /// A host write inside a transaction.
    Host,
    Computed,
    Link,
    /// A source snapshot moved to `idle` or `loading`.
    Source,
    /// A loader result written back after completion.
    SourceRefresh,
    ListCheck,
    /// A value pushed by an external store.
    ExternalStore,
}

impl PatchReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Computed => "computed",
            Self::Link => "link",
            Self::Source => "source",
            Self::SourceRefresh => "source-refresh",
            Self::ListCheck => "list-check",
            Self::ExternalStore => "external-store",
        }
    }
}

/// One recorded field write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchRecord {
    pub path: String,
    pub reason: PatchReason,
    pub from: Value,
    pub to: Value,
    /// Output path of the trait that produced the write.
    pub trait_node_id: Option<String>,
    pub step_id: Option<u32>,
    pub txn_seq: u64,
}
