use std::collections::{BTreeSet, HashMap, VecDeque};

use crate::domain::errors::BuildError;
use crate::domain::models::field_path::{FieldPathId, FieldPathRegistry};
use crate::domain::models::program::{GraphEdge, GraphNode, NormalizedEntry, TraitGraph};

const UNVISITED: usize = usize::MAX;

/// Iterative Tarjan bookkeeping; no recursion, so long chains are safe.
struct Scc<'g> {
    adjacency: &'g [Vec<usize>],
    index: Vec<usize>,
    low: Vec<usize>,
    on_stack: Vec<bool>,
    stack: Vec<usize>,
    next: usize,
    components: Vec<Vec<usize>>,
}

impl<'g> Scc<'g> {
    fn new(adjacency: &'g [Vec<usize>]) -> Self {
        let n = adjacency.len();
        Self {
            adjacency,
            index: vec![UNVISITED; n],
            low: vec![0; n],
            on_stack: vec![false; n],
            stack: Vec::new(),
            next: 0,
            components: Vec::new(),
        }
    }

    fn open(&mut self, node: usize, work: &mut Vec<(usize, usize)>) {
        self.index[node] = self.next;
        self.low[node] = self.next;
        self.next += 1;
        self.stack.push(node);
        self.on_stack[node] = true;
        work.push((node, 0));
    }

    fn run(mut self) -> Vec<Vec<usize>> {
        let mut work: Vec<(usize, usize)> = Vec::new();
        for root in 0..self.adjacency.len() {
            if self.index[root] != UNVISITED {
                continue;
            }
            self.open(root, &mut work);

            while let Some(frame) = work.last_mut() {
                let node = frame.0;
                if let Some(&neighbor) = self.adjacency[node].get(frame.1) {
                    frame.1 += 1;
                    if self.index[neighbor] == UNVISITED {
                        self.open(neighbor, &mut work);
                    } else if self.on_stack[neighbor] {
                        self.low[node] = self.low[node].min(self.index[neighbor]);
                    }
                    continue;
                }

                work.pop();
                if let Some(&(parent, _)) = work.last() {
                    self.low[parent] = self.low[parent].min(self.low[node]);
                }
                if self.low[node] == self.index[node] {
                    let mut component = Vec::new();
                    while let Some(member) = self.stack.pop() {
                        self.on_stack[member] = false;
                        component.push(member);
                        if member == node {
                            break;
                        }
                    }
                    component.sort_unstable();
                    self.components.push(component);
                }
            }
        }
        self.components
    }
}

/// Shortest cycle through `start` inside its component, in traversal order.
fn cycle_through(start: usize, component: &[usize], adjacency: &[Vec<usize>]) -> Vec<usize> {
    let mut parent: HashMap<usize, usize> = HashMap::new();
    let mut queue = VecDeque::from([start]);
    while let Some(node) = queue.pop_front() {
        for &next in &adjacency[node] {
            if next == start {
                let mut cycle = vec![node];
                let mut cur = node;
                while cur != start {
                    cur = parent[&cur];
                    cycle.push(cur);
                }
                cycle.reverse();
                return cycle;
            }
            if component.binary_search(&next).is_ok() && !parent.contains_key(&next) && next != start {
                parent.insert(next, node);
                queue.push_back(next);
            }
        }
    }
    vec![start]
}

/// Build the dependency graph of normalized entries.
///
/// Registers every output and dependency path in `registry`, then links a
/// writer node to each node whose dependency overlaps its output. Fails with
/// `MULTIPLE_WRITERS` when outputs overlap and `CYCLE_DETECTED` when the
/// graph is not acyclic.
pub fn build_graph(
    entries: &[NormalizedEntry],
    registry: &mut FieldPathRegistry,
) -> Result<TraitGraph, BuildError> {
    let mut nodes = Vec::with_capacity(entries.len());
    for entry in entries {
        let out = intern(registry, &entry.field_path)?;
        let deps = entry
            .deps
            .iter()
            .map(|dep| intern(registry, dep))
            .collect::<Result<Vec<_>, _>>()?;
        nodes.push(GraphNode {
            decl_index: entry.decl_index,
            out,
            deps,
        });
    }

    check_single_writer(&nodes, registry)?;

    // Output index: exact writers and writers below each ancestor path.
    let mut writer_of: HashMap<FieldPathId, usize> = HashMap::new();
    let mut writers_below: HashMap<FieldPathId, Vec<usize>> = HashMap::new();
    for (idx, node) in nodes.iter().enumerate() {
        writer_of.insert(node.out, idx);
        for ancestor in registry.ancestors(node.out) {
            writers_below.entry(*ancestor).or_default().push(idx);
        }
    }

    let mut edges = BTreeSet::new();
    for (to, node) in nodes.iter().enumerate() {
        for dep in &node.deps {
            let exact_or_above = std::iter::once(dep)
                .chain(registry.ancestors(*dep))
                .filter_map(|p| writer_of.get(p).copied());
            let below = writers_below.get(dep).into_iter().flatten().copied();
            for from in exact_or_above.chain(below) {
                edges.insert(GraphEdge { from, to });
            }
        }
    }

    let graph = TraitGraph {
        nodes,
        edges: edges.into_iter().collect(),
    };

    if let Some(err) = detect_cycles(&graph, entries) {
        return Err(err);
    }

    Ok(graph)
}

fn intern(
    registry: &mut FieldPathRegistry,
    path: &crate::domain::models::field_path::FieldPath,
) -> Result<FieldPathId, BuildError> {
    registry
        .intern(path)
        .ok_or_else(|| BuildError::InvalidFieldPath {
            paths: vec![format!("{path} (no key segments)")],
        })
}

/// Every path may have at most one writer; overlapping outputs also conflict.
fn check_single_writer(nodes: &[GraphNode], registry: &FieldPathRegistry) -> Result<(), BuildError> {
    let mut writers: HashMap<FieldPathId, Vec<usize>> = HashMap::new();
    for (idx, node) in nodes.iter().enumerate() {
        writers.entry(node.out).or_default().push(idx);
    }

    let mut conflicting: BTreeSet<String> = BTreeSet::new();
    for node in nodes {
        let same = writers.get(&node.out).map_or(0, Vec::len);
        if same > 1 {
            conflicting.insert(registry.path(node.out).to_string());
        }
        for ancestor in registry.ancestors(node.out) {
            if writers.contains_key(ancestor) {
                conflicting.insert(registry.path(*ancestor).to_string());
                conflicting.insert(registry.path(node.out).to_string());
            }
        }
    }

    if conflicting.is_empty() {
        Ok(())
    } else {
        Err(BuildError::MultipleWriters {
            paths: conflicting.into_iter().collect(),
        })
    }
}

fn detect_cycles(graph: &TraitGraph, entries: &[NormalizedEntry]) -> Option<BuildError> {
    let adjacency = graph.adjacency();
    let mut cyclic: Vec<Vec<usize>> = Scc::new(&adjacency)
        .run()
        .into_iter()
        .filter(|c| c.len() > 1 || adjacency[c[0]].contains(&c[0]))
        .collect();
    if cyclic.is_empty() {
        return None;
    }
    cyclic.sort_unstable_by_key(|c| c[0]);

    let name = |idx: usize| entries[graph.nodes[idx].decl_index].field_path.to_string();
    let members: BTreeSet<String> = cyclic.iter().flatten().map(|&idx| name(idx)).collect();
    let first = &cyclic[0];
    let first_cycle = cycle_through(first[0], first, &adjacency)
        .into_iter()
        .map(name)
        .collect();

    Some(BuildError::CycleDetected {
        paths: members.into_iter().collect(),
        first_cycle,
    })
}
