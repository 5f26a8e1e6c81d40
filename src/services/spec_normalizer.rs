//! Canonicalization of trait declarations and the program digest.
//!
//! The digest is a blake3 hash over canonical `(path, kind, deps, scheduling)`
//! tuples, sorted, so two structurally identical specs yield the same digest
//! regardless of declaration order. It identifies programs for caching and
//! cross-run diagnostic comparison; it is not a security boundary.

use crate::domain::errors::BuildError;
use crate::domain::models::field_path::FieldPath;
use crate::domain::models::program::{NormalizedBody, NormalizedEntry};
use crate::domain::models::trait_spec::{TraitBody, TraitSpec};

/// Prefix of program digests, bumped if the canonical tuple format changes.
pub const DIGEST_PREFIX: &str = "stp1";

/// Normalized spec plus its digest.
#[derive(Debug, Clone)]
pub struct NormalizedSpec {
    pub entries: Vec<NormalizedEntry>,
    pub digest: String,
}

/// Parse and validate every path in `spec`.
///
/// Collects all invalid paths before failing so the error lists each of them.
pub fn normalize(spec: &TraitSpec) -> Result<NormalizedSpec, BuildError> {
    let mut invalid: Vec<String> = Vec::new();
    let mut rejected: Vec<String> = Vec::new();
    let mut entries = Vec::with_capacity(spec.entries.len());

    for (decl_index, entry) in spec.entries.iter().enumerate() {
        let field_path = parse_path(&entry.field_path, &mut invalid);
        let mut deps: Vec<FieldPath> = Vec::with_capacity(entry.deps.len());
        for raw in &entry.deps {
            if let Some(dep) = parse_path(raw, &mut invalid) {
                if !deps.contains(&dep) {
                    deps.push(dep);
                }
            }
        }

        let body = match &entry.body {
            TraitBody::Computed { derive, equals } => Some(NormalizedBody::Computed {
                derive: derive.clone(),
                equals: equals.clone(),
            }),
            TraitBody::Link { from } => {
                parse_path(from, &mut invalid).map(|from| NormalizedBody::Link { from })
            }
            TraitBody::Source {
                resource_id,
                key,
                concurrency,
            } => Some(NormalizedBody::Source {
                resource_id: resource_id.clone(),
                key: key.clone(),
                concurrency: *concurrency,
            }),
            TraitBody::ListCheck {
                list,
                key,
                track_by,
                rule,
            } => {
                let list = parse_path(list, &mut invalid);
                let key = parse_path(key, &mut invalid);
                let track_by = match track_by {
                    Some(raw) => parse_path(raw, &mut invalid).map(Some),
                    None => Some(None),
                };
                match (list, key, track_by) {
                    (Some(list), Some(key), Some(track_by)) => Some(NormalizedBody::ListCheck {
                        list,
                        key,
                        track_by,
                        rule: *rule,
                    }),
                    _ => None,
                }
            }
            TraitBody::ExternalStore { store_id } => Some(NormalizedBody::ExternalStore {
                store_id: store_id.clone(),
            }),
        };

        let (Some(field_path), Some(body)) = (field_path, body) else {
            continue;
        };

        if let Err(reason) = validate_entry(&field_path, &deps, &body) {
            rejected.push(format!("{field_path} ({reason})"));
            continue;
        }

        entries.push(NormalizedEntry {
            decl_index,
            kind: entry.kind(),
            field_path,
            deps,
            scheduling: entry.scheduling,
            body,
        });
    }

    if !invalid.is_empty() {
        invalid.sort();
        invalid.dedup();
        return Err(BuildError::InvalidFieldPath { paths: invalid });
    }
    if !rejected.is_empty() {
        rejected.sort();
        return Err(BuildError::InvalidTrait { paths: rejected });
    }

    let digest = compute_digest(&entries);
    Ok(NormalizedSpec { entries, digest })
}

fn parse_path(raw: &str, invalid: &mut Vec<String>) -> Option<FieldPath> {
    match FieldPath::parse(raw) {
        Ok(path) => Some(path),
        Err(err) => {
            invalid.push(format!("{raw} ({err})"));
            None
        }
    }
}

/// Reason an otherwise parseable entry is rejected, if any.
fn validate_entry(
    field_path: &FieldPath,
    deps: &[FieldPath],
    body: &NormalizedBody,
) -> Result<(), &'static str> {
    if !field_path.is_canonical() {
        return Err("output path must not contain list indices");
    }

    match body {
        NormalizedBody::Link { from } if !deps.contains(from) => {
            Err("link source must be a declared dependency")
        }
        NormalizedBody::Source { resource_id, .. } if resource_id.trim().is_empty() => {
            Err("source resource id is empty")
        }
        NormalizedBody::ListCheck { list, .. } if !deps.contains(list) => {
            Err("list path must be a declared dependency")
        }
        NormalizedBody::ListCheck { list, .. } if !list.is_canonical() => {
            Err("list path must not contain list indices")
        }
        NormalizedBody::ExternalStore { store_id } if store_id.trim().is_empty() => {
            Err("external store id is empty")
        }
        NormalizedBody::ExternalStore { .. } if !deps.is_empty() => {
            Err("external store trait takes no dependencies")
        }
        _ => Ok(()),
    }
}

/// Canonical tuple of one entry, as hashed into the digest.
fn canonical_tuple(entry: &NormalizedEntry) -> String {
    let mut deps: Vec<String> = entry.deps.iter().map(ToString::to_string).collect();
    deps.sort();

    let extra = match &entry.body {
        NormalizedBody::Computed { .. } => String::new(),
        NormalizedBody::Link { from } => format!("from={from}"),
        NormalizedBody::Source {
            resource_id,
            concurrency,
            ..
        } => format!("resource={resource_id};concurrency={}", concurrency.as_str()),
        NormalizedBody::ListCheck {
            list,
            key,
            track_by,
            rule,
        } => format!(
            "list={list};key={key};track_by={};rule={}",
            track_by.as_ref().map(ToString::to_string).unwrap_or_default(),
            rule.as_str()
        ),
        NormalizedBody::ExternalStore { store_id } => format!("store={store_id}"),
    };

    format!(
        "{}|{}|{}|{}|{}",
        entry.field_path,
        entry.kind.as_str(),
        deps.join(","),
        entry.scheduling.as_str(),
        extra
    )
}

/// Digest over the sorted canonical tuples of `entries`.
pub fn compute_digest(entries: &[NormalizedEntry]) -> String {
    let mut tuples: Vec<String> = entries.iter().map(canonical_tuple).collect();
    tuples.sort();

    let mut hasher = blake3::Hasher::new();
    for tuple in &tuples {
        hasher.update(tuple.as_bytes());
        hasher.update(b"\n");
    }
    format!("{DIGEST_PREFIX}:{}", hex::encode(&hasher.finalize().as_bytes()[..12]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::trait_spec::TraitEntry;
    use serde_json::json;

    fn sum_spec(reversed: bool) -> TraitSpec {
        let mut entries = vec![
            TraitEntry::computed("total", ["b", "a"], |_| Ok(json!(0))),
            TraitEntry::link("mirror", "name"),
        ];
        if reversed {
            entries.reverse();
        }
        TraitSpec::from_entries(entries)
    }

    #[test]
    fn test_digest_ignores_declaration_order() {
        let a = normalize(&sum_spec(false)).unwrap();
        let b = normalize(&sum_spec(true)).unwrap();
        assert_eq!(a.digest, b.digest);
        assert!(a.digest.starts_with("stp1:"));
    }

    #[test]
    fn test_digest_changes_with_scheduling() {
        let a = normalize(&sum_spec(false)).unwrap();
        let mut spec = sum_spec(false);
        spec.entries[0] = spec.entries[0].clone().deferred();
        let b = normalize(&spec).unwrap();
        assert_ne!(a.digest, b.digest);
    }

    #[test]
    fn test_duplicate_deps_are_removed() {
        let spec = TraitSpec::new().with(TraitEntry::computed("x", ["a", "a", "b"], |_| Ok(json!(1))));
        let normalized = normalize(&spec).unwrap();
        assert_eq!(normalized.entries[0].deps.len(), 2);
    }

    #[test]
    fn test_invalid_paths_are_all_reported() {
        let spec = TraitSpec::new()
            .with(TraitEntry::computed("a..b", ["x"], |_| Ok(json!(1))))
            .with(TraitEntry::computed("ok", ["y.*"], |_| Ok(json!(1))));
        let err = normalize(&spec).unwrap_err();
        assert_eq!(err.code(), "INVALID_FIELD_PATH");
        assert_eq!(err.paths().len(), 2);
    }

    #[test]
    fn test_indexed_output_is_rejected() {
        let spec = TraitSpec::new().with(TraitEntry::computed("items.0.total", ["x"], |_| Ok(json!(1))));
        let err = normalize(&spec).unwrap_err();
        assert_eq!(err.code(), "INVALID_TRAIT");
    }

    #[test]
    fn test_every_rejected_trait_is_reported() {
        let spec = TraitSpec::new()
            .with(TraitEntry::computed("items.0.total", ["x"], |_| Ok(json!(1))))
            .with(TraitEntry::source("profile", " ", ["user_id"], |_| Ok(None)))
            .with(TraitEntry::computed("fine", ["x"], |_| Ok(json!(1))));
        let err = normalize(&spec).unwrap_err();

        assert_eq!(err.code(), "INVALID_TRAIT");
        let paths = err.paths();
        assert_eq!(paths.len(), 2);
        assert!(paths[0].starts_with("items.0.total"));
        assert!(paths[1].starts_with("profile"));
        assert!(err.to_string().contains("source resource id is empty"));
    }

    #[test]
    fn test_external_store_declarations_are_checked() {
        let mut with_deps = TraitEntry::external_store("rate", "fx");
        with_deps.deps.push("base".to_string());
        let spec = TraitSpec::new()
            .with(TraitEntry::external_store("empty", ""))
            .with(with_deps);
        let err = normalize(&spec).unwrap_err();

        assert_eq!(err.code(), "INVALID_TRAIT");
        let message = err.to_string();
        assert!(message.contains("external store id is empty"));
        assert!(message.contains("external store trait takes no dependencies"));

        let a = normalize(&TraitSpec::new().with(TraitEntry::external_store("rate", "fx"))).unwrap();
        let b = normalize(&TraitSpec::new().with(TraitEntry::external_store("rate", "eur"))).unwrap();
        assert_ne!(a.digest, b.digest);
    }
}
