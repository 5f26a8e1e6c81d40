//! Trait declarations: the user-facing description of derived fields.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::errors::TraitError;
use crate::domain::models::field_path::FieldPath;

/// Kind of derived-field behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TraitKind {
    Computed,
    Link,
    Source,
    ListCheck,
    ExternalStore,
}

impl TraitKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Computed => "computed",
            Self::Link => "link",
            Self::Source => "source",
            Self::ListCheck => "list-check",
            Self::ExternalStore => "external-store",
        }
    }
}

impl fmt::Display for TraitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lane a trait runs in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scheduling {
    #[default]
    Immediate,
    Deferred,
}

impl Scheduling {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Immediate => "immediate",
            Self::Deferred => "deferred",
        }
    }
}

/// How a source trait handles a new key while a load is in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceConcurrency {
    /// Abort the superseded load and start the new one.
    #[default]
    Switch,
    /// Let the current load finish, then run only the latest pending key.
    ExhaustTrailing,
}

impl SourceConcurrency {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Switch => "switch",
            Self::ExhaustTrailing => "exhaust-trailing",
        }
    }
}

/// Cross-row rule checked by a list-check trait.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListRule {
    /// Each non-null row key must appear once.
    #[default]
    Unique,
}

impl ListRule {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unique => "unique",
        }
    }
}

// ============================================================================
// Dependency access
// ============================================================================

static NULL: Value = Value::Null;

/// Values of a trait's declared dependencies, in declaration order.
///
/// Derivations only ever see this view; missing paths read as `null`.
pub struct Deps<'a> {
    paths: &'a [FieldPath],
    values: Vec<&'a Value>,
}

impl<'a> Deps<'a> {
    pub fn new(paths: &'a [FieldPath], state: &'a Value) -> Self {
        let values = paths
            .iter()
            .map(|p| p.get(state).unwrap_or(&NULL))
            .collect();
        Self { paths, values }
    }

    /// Value of the `index`-th declared dependency (`null` when out of range).
    pub fn get(&self, index: usize) -> &'a Value {
        self.values.get(index).copied().unwrap_or(&NULL)
    }

    /// Value of the dependency declared as `path`.
    pub fn by_path(&self, path: &str) -> Option<&'a Value> {
        self.paths
            .iter()
            .position(|p| p.to_string() == path)
            .map(|i| self.values[i])
    }

    pub fn as_f64(&self, index: usize) -> Option<f64> {
        self.get(index).as_f64()
    }

    pub fn as_str(&self, index: usize) -> Option<&'a str> {
        self.get(index).as_str()
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a Value> + '_ {
        self.values.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Pure derivation of a computed value.
pub type DeriveFn = Arc<dyn Fn(&Deps<'_>) -> Result<Value, TraitError> + Send + Sync>;

/// Custom equality used to suppress no-op writes.
pub type EqualsFn = Arc<dyn Fn(&Value, &Value) -> bool + Send + Sync>;

/// Key derivation of a source trait. `None` means "no key": the source goes idle.
pub type KeyFn = Arc<dyn Fn(&Deps<'_>) -> Result<Option<Value>, TraitError> + Send + Sync>;

/// Equality policy of a computed trait.
#[derive(Clone, Default)]
pub enum EqualsPolicy {
    #[default]
    Structural,
    Custom(EqualsFn),
}

impl EqualsPolicy {
    pub fn equals(&self, a: &Value, b: &Value) -> bool {
        match self {
            Self::Structural => a == b,
            Self::Custom(f) => f(a, b),
        }
    }
}

impl fmt::Debug for EqualsPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Structural => f.write_str("Structural"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Kind-specific payload of a trait entry. Paths stay raw until normalization.
#[derive(Clone)]
pub enum TraitBody {
    Computed {
        derive: DeriveFn,
        equals: EqualsPolicy,
    },
    Link {
        from: String,
    },
    Source {
        resource_id: String,
        key: KeyFn,
        concurrency: SourceConcurrency,
    },
    ListCheck {
        list: String,
        key: String,
        track_by: Option<String>,
        rule: ListRule,
    },
    /// Written only by the store registered under `store_id`.
    ExternalStore {
        store_id: String,
    },
}

impl TraitBody {
    pub const fn kind(&self) -> TraitKind {
        match self {
            Self::Computed { .. } => TraitKind::Computed,
            Self::Link { .. } => TraitKind::Link,
            Self::Source { .. } => TraitKind::Source,
            Self::ListCheck { .. } => TraitKind::ListCheck,
            Self::ExternalStore { .. } => TraitKind::ExternalStore,
        }
    }
}

impl fmt::Debug for TraitBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Computed { equals, .. } => f
                .debug_struct("Computed")
                .field("equals", equals)
                .finish_non_exhaustive(),
            Self::Link { from } => f.debug_struct("Link").field("from", from).finish(),
            Self::Source {
                resource_id,
                concurrency,
                ..
            } => f
                .debug_struct("Source")
                .field("resource_id", resource_id)
                .field("concurrency", concurrency)
                .finish_non_exhaustive(),
            Self::ListCheck {
                list,
                key,
                track_by,
                rule,
            } => f
                .debug_struct("ListCheck")
                .field("list", list)
                .field("key", key)
                .field("track_by", track_by)
                .field("rule", rule)
                .finish(),
            Self::ExternalStore { store_id } => f
                .debug_struct("ExternalStore")
                .field("store_id", store_id)
                .finish(),
        }
    }
}

// ============================================================================
// Entries
// ============================================================================

/// One declared derived field.
#[derive(Debug, Clone)]
pub struct TraitEntry {
    /// Output path written by this trait.
    pub field_path: String,
    /// Explicit dependency paths, never inferred.
    pub deps: Vec<String>,
    pub scheduling: Scheduling,
    pub body: TraitBody,
}

impl TraitEntry {
    /// A computed field derived from `deps`.
    pub fn computed<I, S, F>(field_path: impl Into<String>, deps: I, derive: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&Deps<'_>) -> Result<Value, TraitError> + Send + Sync + 'static,
    {
        Self {
            field_path: field_path.into(),
            deps: deps.into_iter().map(Into::into).collect(),
            scheduling: Scheduling::Immediate,
            body: TraitBody::Computed {
                derive: Arc::new(derive),
                equals: EqualsPolicy::Structural,
            },
        }
    }

    /// A field mirroring the value at `from`.
    pub fn link(field_path: impl Into<String>, from: impl Into<String>) -> Self {
        let from = from.into();
        Self {
            field_path: field_path.into(),
            deps: vec![from.clone()],
            scheduling: Scheduling::Immediate,
            body: TraitBody::Link { from },
        }
    }

    /// A field loaded from `resource_id` under a key derived from `deps`.
    pub fn source<I, S, F>(
        field_path: impl Into<String>,
        resource_id: impl Into<String>,
        deps: I,
        key: F,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&Deps<'_>) -> Result<Option<Value>, TraitError> + Send + Sync + 'static,
    {
        Self {
            field_path: field_path.into(),
            deps: deps.into_iter().map(Into::into).collect(),
            scheduling: Scheduling::Immediate,
            body: TraitBody::Source {
                resource_id: resource_id.into(),
                key: Arc::new(key),
                concurrency: SourceConcurrency::Switch,
            },
        }
    }

    /// A uniqueness check over the rows of `list`, keyed by the row-relative `key` path.
    pub fn list_check(
        field_path: impl Into<String>,
        list: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        let list = list.into();
        Self {
            field_path: field_path.into(),
            deps: vec![list.clone()],
            scheduling: Scheduling::Immediate,
            body: TraitBody::ListCheck {
                list,
                key: key.into(),
                track_by: None,
                rule: ListRule::Unique,
            },
        }
    }

    /// A field mirrored from the external store registered as `store_id`.
    ///
    /// Host transactions and other traits cannot write it.
    pub fn external_store(field_path: impl Into<String>, store_id: impl Into<String>) -> Self {
        Self {
            field_path: field_path.into(),
            deps: Vec::new(),
            scheduling: Scheduling::Immediate,
            body: TraitBody::ExternalStore {
                store_id: store_id.into(),
            },
        }
    }

    #[must_use]
    pub fn deferred(mut self) -> Self {
        self.scheduling = Scheduling::Deferred;
        self
    }

    #[must_use]
    pub fn with_scheduling(mut self, scheduling: Scheduling) -> Self {
        self.scheduling = scheduling;
        self
    }

    /// Use a custom equality check for a computed trait. Ignored for other kinds.
    #[must_use]
    pub fn with_equals<F>(mut self, equals: F) -> Self
    where
        F: Fn(&Value, &Value) -> bool + Send + Sync + 'static,
    {
        if let TraitBody::Computed { equals: slot, .. } = &mut self.body {
            *slot = EqualsPolicy::Custom(Arc::new(equals));
        }
        self
    }

    /// Set the loader concurrency of a source trait. Ignored for other kinds.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: SourceConcurrency) -> Self {
        if let TraitBody::Source {
            concurrency: slot, ..
        } = &mut self.body
        {
            *slot = concurrency;
        }
        self
    }

    /// Track list rows by a row-relative identity path. Ignored for other kinds.
    #[must_use]
    pub fn track_by(mut self, path: impl Into<String>) -> Self {
        if let TraitBody::ListCheck { track_by, .. } = &mut self.body {
            *track_by = Some(path.into());
        }
        self
    }

    pub const fn kind(&self) -> TraitKind {
        self.body.kind()
    }
}

/// The full set of trait declarations for one module.
#[derive(Debug, Clone, Default)]
pub struct TraitSpec {
    pub entries: Vec<TraitEntry>,
}

impl TraitSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<TraitEntry>) -> Self {
        Self { entries }
    }

    #[must_use]
    pub fn with(mut self, entry: TraitEntry) -> Self {
        self.entries.push(entry);
        self
    }

    pub fn push(&mut self, entry: TraitEntry) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
