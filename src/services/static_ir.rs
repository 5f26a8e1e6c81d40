//! Deterministic, serializable projection of a compiled program.

use serde::{Deserialize, Serialize};

use crate::domain::models::program::{NormalizedBody, Program};
use crate::domain::models::trait_spec::{Scheduling, TraitKind};

pub const STATIC_IR_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticIrNode {
    pub node_id: String,
    pub kind: TraitKind,
    pub reads: Vec<String>,
    pub writes: Vec<String>,
    pub scheduling: Scheduling,
    pub step_id: u32,
    pub resource_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StaticIrEdgeKind {
    Computed,
    Link,
    SourceDep,
    CheckDep,
    ExternalStore,
}

impl From<TraitKind> for StaticIrEdgeKind {
    fn from(kind: TraitKind) -> Self {
        match kind {
            TraitKind::Computed => Self::Computed,
            TraitKind::Link => Self::Link,
            TraitKind::Source => Self::SourceDep,
            TraitKind::ListCheck => Self::CheckDep,
            TraitKind::ExternalStore => Self::ExternalStore,
        }
    }
}

/// `from` is a read path, `to` the node reading it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticIrEdge {
    pub edge_id: String,
    pub from: String,
    pub to: String,
    pub kind: StaticIrEdgeKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticIr {
    pub version: u32,
    pub module_id: String,
    pub program_digest: String,
    /// Hash of everything above plus nodes and edges.
    pub digest: String,
    pub nodes: Vec<StaticIrNode>,
    pub edges: Vec<StaticIrEdge>,
}

#[derive(Serialize)]
struct DigestInput<'a> {
    version: u32,
    module_id: &'a str,
    program_digest: &'a str,
    nodes: &'a [StaticIrNode],
    edges: &'a [StaticIrEdge],
}

/// Export nodes in plan order and one edge per declared read.
///
/// External-store nodes also get an edge from their `store:<id>` origin.
pub fn export_static_ir(program: &Program, module_id: &str) -> StaticIr {
    let mut nodes = Vec::with_capacity(program.plan.len());
    let mut edges = Vec::new();

    for step in &program.plan.steps {
        let entry = program.entry(step);
        let node_id = entry.field_path.to_string();
        let reads: Vec<String> = entry.deps.iter().map(ToString::to_string).collect();
        let resource_id = match &entry.body {
            NormalizedBody::Source { resource_id, .. } => Some(resource_id.clone()),
            NormalizedBody::ExternalStore { store_id } => Some(store_id.clone()),
            _ => None,
        };

        if let NormalizedBody::ExternalStore { store_id } = &entry.body {
            edges.push(StaticIrEdge {
                edge_id: format!("e{}", edges.len()),
                from: format!("store:{store_id}"),
                to: node_id.clone(),
                kind: StaticIrEdgeKind::ExternalStore,
            });
        }
        for read in &reads {
            edges.push(StaticIrEdge {
                edge_id: format!("e{}", edges.len()),
                from: read.clone(),
                to: node_id.clone(),
                kind: entry.kind.into(),
            });
        }
        nodes.push(StaticIrNode {
            writes: vec![node_id.clone()],
            node_id,
            kind: entry.kind,
            reads,
            scheduling: entry.scheduling,
            step_id: step.step_id.0,
            resource_id,
        });
    }

    let input = DigestInput {
        version: STATIC_IR_VERSION,
        module_id,
        program_digest: &program.digest,
        nodes: &nodes,
        edges: &edges,
    };
    // Serializing plain strings and enums cannot fail.
    let bytes = serde_json::to_vec(&input).unwrap_or_default();
    let digest = format!("ir1:{}", blake3::hash(&bytes).to_hex());

    StaticIr {
        version: STATIC_IR_VERSION,
        module_id: module_id.to_string(),
        program_digest: program.digest.clone(),
        digest,
        nodes,
        edges,
    }
}
