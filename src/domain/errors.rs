//! Domain errors for the statetrait convergence engine.

use thiserror::Error;

/// Format a cycle path as a human-readable string: `a -> b -> c -> a`.
fn format_cycle_path(path: &[String]) -> String {
    let mut parts: Vec<&str> = path.iter().map(String::as_str).collect();
    if let Some(first) = path.first() {
        parts.push(first);
    }
    parts.join(" -> ")
}

fn format_paths(paths: &[String]) -> String {
    paths.join(", ")
}

/// Errors raised while building a program from a trait spec.
///
/// These are definition-time configuration errors: they are never retried and
/// never surface from a convergence pass.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("CYCLE_DETECTED: dependency cycle among [{}] ({})", format_paths(.paths), format_cycle_path(.first_cycle))]
    CycleDetected {
        /// Every field path that takes part in at least one cycle, sorted.
        paths: Vec<String>,
        /// The first cycle found, in traversal order.
        first_cycle: Vec<String>,
    },

    #[error("MULTIPLE_WRITERS: overlapping trait outputs [{}]", format_paths(.paths))]
    MultipleWriters {
        /// Every output path written by more than one trait, sorted.
        paths: Vec<String>,
    },

    #[error("INVALID_FIELD_PATH: [{}]", format_paths(.paths))]
    InvalidFieldPath {
        /// Each offending path with the parse failure reason.
        paths: Vec<String>,
    },

    #[error("INVALID_TRAIT: [{}]", format_paths(.paths))]
    InvalidTrait {
        /// Each offending output path with the reason it was rejected.
        paths: Vec<String>,
    },
}

impl BuildError {
    /// Stable machine-readable code for the error.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::CycleDetected { .. } => "CYCLE_DETECTED",
            Self::MultipleWriters { .. } => "MULTIPLE_WRITERS",
            Self::InvalidFieldPath { .. } => "INVALID_FIELD_PATH",
            Self::InvalidTrait { .. } => "INVALID_TRAIT",
        }
    }

    /// Paths implicated by the error.
    pub fn paths(&self) -> Vec<String> {
        match self {
            Self::CycleDetected { paths, .. }
            | Self::MultipleWriters { paths }
            | Self::InvalidFieldPath { paths }
            | Self::InvalidTrait { paths } => paths.clone(),
        }
    }
}

/// Failure returned by a user derivation or key function.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TraitError {
    #[error("derivation failed: {0}")]
    Failed(String),

    #[error("derivation panicked: {0}")]
    Panicked(String),

    #[error("unexpected value at {path}: {reason}")]
    UnexpectedValue { path: String, reason: String },
}

impl TraitError {
    /// Convenience constructor for a plain failure message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Errors that can occur while parsing a field path.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FieldPathError {
    #[error("field path is empty")]
    Empty,

    #[error("empty segment in '{0}'")]
    EmptySegment(String),

    #[error("field path '{0}' must start with a key")]
    LeadingIndex(String),

    #[error("malformed index in '{0}'")]
    MalformedIndex(String),

    #[error("wildcard is not allowed in '{0}'")]
    Wildcard(String),
}

/// Runtime errors surfaced to the host transaction.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("write to trait-owned field '{path}' (owned by '{owner}')")]
    TraitOwnedWrite { path: String, owner: String },

    #[error("invalid field path '{path}': {source}")]
    InvalidPath {
        path: String,
        #[source]
        source: FieldPathError,
    },

    #[error("cannot write '{path}': {reason}")]
    PathWrite { path: String, reason: String },

    #[error("'{path}' is not written by an external store")]
    NotExternalStore { path: String },
}

pub type DomainResult<T> = Result<T, DomainError>;
