//! Program construction: normalize → graph → plan, once per module definition.

use tracing::{debug, warn};

use crate::domain::errors::BuildError;
use crate::domain::models::bitset::DenseBitSet;
use crate::domain::models::field_path::{FieldPathRegistry, StateSchema};
use crate::domain::models::program::{BuildOptions, Program};
use crate::domain::models::trait_spec::TraitSpec;
use crate::services::graph_builder::build_graph;
use crate::services::plan_compiler::compile_plan;
use crate::services::spec_normalizer::normalize;

/// Build a program with default build options.
pub fn build(schema: &StateSchema, spec: &TraitSpec) -> Result<Program, BuildError> {
    build_with_options(schema, spec, &BuildOptions::default())
}

/// Build a program.
///
/// The registry holds every schema path plus every trait path, so host writes
/// to any known field can be attributed to a root instead of forcing dirty-all.
pub fn build_with_options(
    schema: &StateSchema,
    spec: &TraitSpec,
    options: &BuildOptions,
) -> Result<Program, BuildError> {
    let normalized = normalize(spec)?;

    let mut registry = FieldPathRegistry::new();
    for path in schema.paths() {
        registry.intern(path);
    }

    let graph = build_graph(&normalized.entries, &mut registry)?;
    let plan = compile_plan(&graph, &normalized.entries, &normalized.digest)?;

    let mut schema_mismatches: Vec<String> = Vec::new();
    if !schema.is_empty() {
        for entry in &normalized.entries {
            let paths = std::iter::once(&entry.field_path).chain(entry.deps.iter());
            for path in paths {
                if !schema.contains(path) {
                    schema_mismatches.push(path.canonical().to_string());
                }
            }
        }
        schema_mismatches.sort();
        schema_mismatches.dedup();
    }
    if !schema_mismatches.is_empty() {
        warn!(
            digest = %normalized.digest,
            paths = ?schema_mismatches,
            "trait paths missing from state schema"
        );
    }

    let mut owned = DenseBitSet::with_capacity(registry.len());
    let mut owned_ancestors = DenseBitSet::with_capacity(registry.len());
    for step in &plan.steps {
        owned.insert(step.out_field_path_id.index());
        for ancestor in registry.ancestors(step.out_field_path_id) {
            owned_ancestors.insert(ancestor.index());
        }
    }

    debug!(
        digest = %normalized.digest,
        generation = options.generation,
        steps = plan.len(),
        deferred = plan.deferred.len(),
        paths = registry.len(),
        "program built"
    );

    Ok(Program {
        registry,
        digest: normalized.digest,
        entries: normalized.entries,
        graph,
        plan,
        generation: options.generation,
        schema_fingerprint: schema.fingerprint(),
        schema_mismatches,
        owned,
        owned_ancestors,
    })
}
