//! YAML trait manifests.
//!
//! A manifest declares one module's derived fields without Rust closures:
//! computed traits name a built-in derivation and source traits name a key
//! selector.
//!
//! ```yaml
//! module_id: checkout
//! schema:
//!   items: []
//!   user_id: null
//! traits:
//!   total:
//!     kind: computed
//!     deps: [subtotal, shipping]
//!     derive: sum
//!   profile:
//!     kind: source
//!     resource: users
//!     deps: [user_id]
//!     key: first
//!   errors:
//!     kind: list-check
//!     list: items
//!     key: sku
//!     scheduling: deferred
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use thiserror::Error;
use tracing::debug;

use crate::domain::errors::{BuildError, TraitError};
use crate::domain::models::field_path::StateSchema;
use crate::domain::models::program::Program;
use crate::domain::models::trait_spec::{
    Deps, Scheduling, SourceConcurrency, TraitEntry, TraitSpec,
};
use crate::services::program_builder::build;

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("failed to read manifest {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse manifest: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error(transparent)]
    Build(#[from] BuildError),
}

/// Built-in derivations available to computed traits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Builtin {
    Sum,
    Product,
    Concat,
    Count,
    First,
    Not,
    All,
    Any,
    Min,
    Max,
    Len,
    Identity,
}

/// How a source trait turns its deps into a resource key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeySelector {
    /// The first dep; no key while it is null.
    #[default]
    First,
    /// All deps as an array; no key while any of them is null.
    Tuple,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ManifestTrait {
    Computed {
        deps: Vec<String>,
        derive: Builtin,
        #[serde(default)]
        scheduling: Scheduling,
    },
    Link {
        from: String,
        #[serde(default)]
        scheduling: Scheduling,
    },
    Source {
        resource: String,
        deps: Vec<String>,
        #[serde(default)]
        key: KeySelector,
        #[serde(default)]
        concurrency: SourceConcurrency,
        #[serde(default)]
        scheduling: Scheduling,
    },
    ListCheck {
        list: String,
        key: String,
        #[serde(default)]
        track_by: Option<String>,
        #[serde(default)]
        scheduling: Scheduling,
    },
    ExternalStore {
        store: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraitManifest {
    pub module_id: String,
    /// Sample state; its leaf paths become the declared schema.
    #[serde(default)]
    pub schema: Option<Value>,
    /// Traits keyed by output path.
    pub traits: BTreeMap<String, ManifestTrait>,
}

impl TraitManifest {
    pub fn from_yaml_str(raw: &str) -> Result<Self, ManifestError> {
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let manifest = Self::from_yaml_str(&raw)?;
        debug!(
            module_id = %manifest.module_id,
            traits = manifest.traits.len(),
            path = %path.display(),
            "loaded trait manifest"
        );
        Ok(manifest)
    }

    pub fn state_schema(&self) -> StateSchema {
        self.schema
            .as_ref()
            .map_or_else(StateSchema::new, StateSchema::from_sample)
    }

    pub fn to_trait_spec(&self) -> TraitSpec {
        TraitSpec::from_entries(
            self.traits
                .iter()
                .map(|(path, decl)| to_entry(path, decl))
                .collect(),
        )
    }

    pub fn build_program(&self) -> Result<Program, ManifestError> {
        Ok(build(&self.state_schema(), &self.to_trait_spec())?)
    }
}

fn to_entry(path: &str, decl: &ManifestTrait) -> TraitEntry {
    match decl {
        ManifestTrait::Computed {
            deps,
            derive,
            scheduling,
        } => {
            let builtin = *derive;
            TraitEntry::computed(path, deps.iter().cloned(), move |d| builtin.apply(d))
                .with_scheduling(*scheduling)
        }
        ManifestTrait::Link { from, scheduling } => {
            TraitEntry::link(path, from.clone()).with_scheduling(*scheduling)
        }
        ManifestTrait::Source {
            resource,
            deps,
            key,
            concurrency,
            scheduling,
        } => {
            let selector = *key;
            TraitEntry::source(path, resource.clone(), deps.iter().cloned(), move |d| {
                Ok(selector.select(d))
            })
            .with_concurrency(*concurrency)
            .with_scheduling(*scheduling)
        }
        ManifestTrait::ListCheck {
            list,
            key,
            track_by,
            scheduling,
        } => {
            let entry = TraitEntry::list_check(path, list.clone(), key.clone())
                .with_scheduling(*scheduling);
            match track_by {
                Some(track_by) => entry.track_by(track_by.clone()),
                None => entry,
            }
        }
        ManifestTrait::ExternalStore { store } => TraitEntry::external_store(path, store.clone()),
    }
}

impl KeySelector {
    pub fn select(self, deps: &Deps<'_>) -> Option<Value> {
        match self {
            Self::First => Some(deps.get(0)).filter(|v| !v.is_null()).cloned(),
            Self::Tuple => {
                if deps.is_empty() || deps.iter().any(Value::is_null) {
                    None
                } else {
                    Some(Value::Array(deps.iter().cloned().collect()))
                }
            }
        }
    }
}

impl Builtin {
    /// Array deps are flattened one level for the aggregating builtins.
    pub fn apply(self, deps: &Deps<'_>) -> Result<Value, TraitError> {
        match self {
            Self::Sum => Ok(number(numbers(deps)?.iter().sum())),
            Self::Product => Ok(number(numbers(deps)?.iter().product())),
            Self::Min => Ok(numbers(deps)?
                .into_iter()
                .reduce(f64::min)
                .map_or(Value::Null, number)),
            Self::Max => Ok(numbers(deps)?
                .into_iter()
                .reduce(f64::max)
                .map_or(Value::Null, number)),
            Self::Count => Ok(Value::from(flatten(deps).filter(|v| !v.is_null()).count())),
            Self::Concat => Ok(Value::String(
                flatten(deps)
                    .filter(|v| !v.is_null())
                    .map(|v| match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect(),
            )),
            Self::First => Ok(deps
                .iter()
                .find(|v| !v.is_null())
                .cloned()
                .unwrap_or(Value::Null)),
            Self::Not => Ok(Value::Bool(!truthy(deps.get(0)))),
            Self::All => Ok(Value::Bool(flatten(deps).all(truthy))),
            Self::Any => Ok(Value::Bool(flatten(deps).any(truthy))),
            Self::Len => Ok(Value::from(match deps.get(0) {
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                Value::String(s) => s.chars().count(),
                _ => 0,
            })),
            Self::Identity => Ok(deps.get(0).clone()),
        }
    }
}

fn flatten<'a>(deps: &'a Deps<'a>) -> impl Iterator<Item = &'a Value> + 'a {
    deps.iter().flat_map(|v| match v {
        Value::Array(items) => items.iter().collect::<Vec<_>>(),
        other => vec![other],
    })
}

/// Numeric operands; null counts as absent.
fn numbers(deps: &Deps<'_>) -> Result<Vec<f64>, TraitError> {
    flatten(deps)
        .filter(|v| !v.is_null())
        .map(|v| {
            v.as_f64().ok_or_else(|| TraitError::UnexpectedValue {
                path: String::new(),
                reason: format!("expected a number, got {v}"),
            })
        })
        .collect()
}

/// Whole results come back as integers.
fn number(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < 9.0e15 {
        Value::from(value as i64)
    } else {
        Number::from_f64(value).map_or(Value::Null, Value::Number)
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
