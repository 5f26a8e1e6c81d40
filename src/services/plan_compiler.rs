use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::domain::errors::BuildError;
use crate::domain::models::program::{NormalizedEntry, Plan, Step, StepId, TraitGraph};
use crate::domain::models::trait_spec::Scheduling;

/// Compile an acyclic graph into a topologically ordered plan.
///
/// Kahn's algorithm with a min-heap on declaration index, so independent
/// entries keep their declaration order. A step is deferred when declared
/// deferred or when any upstream step is deferred; an immediate step never
/// reads a deferred output.
pub fn compile_plan(
    graph: &TraitGraph,
    entries: &[NormalizedEntry],
    digest: &str,
) -> Result<Plan, BuildError> {
    let node_count = graph.nodes.len();
    let adjacency = graph.adjacency();
    let mut upstream_nodes: Vec<Vec<usize>> = vec![Vec::new(); node_count];
    let mut in_degree = vec![0usize; node_count];
    for (from, targets) in adjacency.iter().enumerate() {
        for &to in targets {
            upstream_nodes[to].push(from);
            in_degree[to] += 1;
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|&(_, &degree)| degree == 0)
        .map(|(idx, _)| Reverse(idx))
        .collect();

    let mut order = Vec::with_capacity(node_count);
    while let Some(Reverse(node)) = ready.pop() {
        order.push(node);
        for &next in &adjacency[node] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push(Reverse(next));
            }
        }
    }

    if order.len() != node_count {
        let mut paths: Vec<String> = (0..node_count)
            .filter(|idx| in_degree[*idx] > 0)
            .map(|idx| entries[graph.nodes[idx].decl_index].field_path.to_string())
            .collect();
        paths.sort();
        return Err(BuildError::CycleDetected {
            first_cycle: paths.clone(),
            paths,
        });
    }

    let mut position = vec![0usize; node_count];
    for (pos, &node) in order.iter().enumerate() {
        position[node] = pos;
    }

    let mut steps: Vec<Step> = Vec::with_capacity(node_count);
    for (pos, &node) in order.iter().enumerate() {
        let graph_node = &graph.nodes[node];
        let entry = &entries[graph_node.decl_index];

        let mut upstream: Vec<StepId> = upstream_nodes[node]
            .iter()
            .map(|&n| StepId(position[n] as u32))
            .collect();
        upstream.sort_unstable();

        let inherits_deferred = upstream
            .iter()
            .any(|id| steps[id.index()].scheduling == Scheduling::Deferred);
        let scheduling = if inherits_deferred {
            Scheduling::Deferred
        } else {
            entry.scheduling
        };

        steps.push(Step {
            step_id: StepId(pos as u32),
            decl_index: graph_node.decl_index,
            kind: entry.kind,
            out_field_path_id: graph_node.out,
            dep_field_path_ids: graph_node.deps.clone(),
            scheduling,
            upstream,
        });
    }

    let all: Vec<StepId> = steps.iter().map(|s| s.step_id).collect();
    let (deferred, immediate): (Vec<StepId>, Vec<StepId>) = all
        .iter()
        .copied()
        .partition(|id| steps[id.index()].scheduling == Scheduling::Deferred);

    Ok(Plan {
        steps,
        all,
        immediate,
        deferred,
        digest: digest.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::field_path::FieldPathRegistry;
    use crate::domain::models::trait_spec::{TraitEntry, TraitSpec};
    use crate::services::graph_builder::build_graph;
    use crate::services::spec_normalizer::normalize;
    use serde_json::json;

    fn plan_of(entries: Vec<TraitEntry>) -> (Plan, Vec<NormalizedEntry>) {
        let normalized = normalize(&TraitSpec::from_entries(entries)).unwrap();
        let mut registry = FieldPathRegistry::new();
        let graph = build_graph(&normalized.entries, &mut registry).unwrap();
        let plan = compile_plan(&graph, &normalized.entries, &normalized.digest).unwrap();
        (plan, normalized.entries)
    }

    fn constant(path: &str, deps: &[&str]) -> TraitEntry {
        TraitEntry::computed(path, deps.to_vec(), |_| Ok(json!(0)))
    }

    fn names(plan: &Plan, entries: &[NormalizedEntry]) -> Vec<String> {
        plan.steps
            .iter()
            .map(|s| entries[s.decl_index].field_path.to_string())
            .collect()
    }

    #[test]
    fn test_dependencies_precede_dependents() {
        let (plan, entries) = plan_of(vec![
            constant("c", &["b"]),
            constant("b", &["a"]),
            constant("a", &["input"]),
        ]);
        assert_eq!(names(&plan, &entries), vec!["a", "b", "c"]);
        assert_eq!(plan.step(StepId(2)).upstream, vec![StepId(1)]);
    }

    #[test]
    fn test_ties_follow_declaration_order() {
        let (plan, entries) = plan_of(vec![
            constant("z", &["input"]),
            constant("y", &["input"]),
            constant("x", &["z", "y"]),
            constant("w", &["input"]),
        ]);
        assert_eq!(names(&plan, &entries), vec!["z", "y", "x", "w"]);
    }

    #[test]
    fn test_deferred_taint_propagates_downstream() {
        let (plan, entries) = plan_of(vec![
            constant("slow", &["input"]).deferred(),
            constant("uses_slow", &["slow"]),
            constant("fast", &["input"]),
        ]);
        let by_name = |name: &str| {
            plan.steps
                .iter()
                .find(|s| entries[s.decl_index].field_path.to_string() == name)
                .unwrap()
                .scheduling
        };
        assert_eq!(by_name("slow"), Scheduling::Deferred);
        assert_eq!(by_name("uses_slow"), Scheduling::Deferred);
        assert_eq!(by_name("fast"), Scheduling::Immediate);
        assert_eq!(plan.immediate.len(), 1);
        assert_eq!(plan.deferred.len(), 2);
    }
}
