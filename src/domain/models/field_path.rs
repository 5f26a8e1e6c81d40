//! Field paths and the interned path registry.
//!
//! A [`FieldPath`] addresses a location inside the JSON state tree
//! (`items.3.sku` or `items[3].sku`). Its canonical form drops index
//! segments so that every row of a list maps onto the same registry entry.
//! The [`FieldPathRegistry`] interns canonical paths into dense
//! [`FieldPathId`]s so hot paths compare integers instead of strings.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::errors::{DomainError, DomainResult, FieldPathError};

/// One segment of a field path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Segment {
    Key(String),
    Index(usize),
}

/// Dotted location in the state tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldPath {
    segments: Vec<Segment>,
}

impl FieldPath {
    /// Parse a dotted path. Bracketed indices (`items[2]`) and bare numeric
    /// segments (`items.2`) both produce [`Segment::Index`].
    pub fn parse(raw: &str) -> Result<Self, FieldPathError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(FieldPathError::Empty);
        }
        if trimmed.contains('*') {
            return Err(FieldPathError::Wildcard(raw.to_string()));
        }

        let mut segments = Vec::new();
        for part in trimmed.split('.') {
            if part.is_empty() {
                return Err(FieldPathError::EmptySegment(raw.to_string()));
            }
            parse_part(part, raw, &mut segments)?;
        }

        if !matches!(segments.first(), Some(Segment::Key(_))) {
            return Err(FieldPathError::LeadingIndex(raw.to_string()));
        }

        Ok(Self { segments })
    }

    /// Build a path from key segments only.
    pub fn from_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: keys.into_iter().map(|k| Segment::Key(k.into())).collect(),
        }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// The path with all index segments removed.
    pub fn canonical(&self) -> Self {
        Self {
            segments: self
                .segments
                .iter()
                .filter(|s| matches!(s, Segment::Key(_)))
                .cloned()
                .collect(),
        }
    }

    pub fn is_canonical(&self) -> bool {
        self.segments.iter().all(|s| matches!(s, Segment::Key(_)))
    }

    /// True when `prefix` is equal to or an ancestor of `self`.
    pub fn starts_with(&self, prefix: &Self) -> bool {
        self.segments.starts_with(&prefix.segments)
    }

    /// True when one path is equal to, an ancestor of, or a descendant of the other.
    pub fn overlaps(&self, other: &Self) -> bool {
        self.starts_with(other) || other.starts_with(self)
    }

    /// Every non-empty prefix, shortest first, including the path itself.
    pub fn prefixes(&self) -> impl Iterator<Item = FieldPath> + '_ {
        (1..=self.segments.len()).map(|n| FieldPath {
            segments: self.segments[..n].to_vec(),
        })
    }

    /// Append a path relative to this one.
    pub fn join(&self, relative: &Self) -> Self {
        let mut segments = self.segments.clone();
        segments.extend(relative.segments.iter().cloned());
        Self { segments }
    }

    /// Read the value at this path.
    pub fn get<'v>(&self, root: &'v Value) -> Option<&'v Value> {
        let mut current = root;
        for segment in &self.segments {
            current = match (segment, current) {
                (Segment::Key(key), Value::Object(map)) => map.get(key)?,
                (Segment::Index(idx), Value::Array(items)) => items.get(*idx)?,
                (Segment::Index(idx), Value::Object(map)) => map.get(&idx.to_string())?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Write `value` at this path, creating intermediate objects for missing keys.
    pub fn set(&self, root: &mut Value, value: Value) -> DomainResult<()> {
        let mut current = root;
        for segment in &self.segments {
            current = match segment {
                Segment::Key(key) => {
                    if !current.is_object() {
                        *current = Value::Object(Map::new());
                    }
                    match current {
                        Value::Object(map) => map.entry(key.clone()).or_insert(Value::Null),
                        _ => return Err(self.write_error("expected object")),
                    }
                }
                Segment::Index(idx) => match current {
                    Value::Array(items) => items
                        .get_mut(*idx)
                        .ok_or_else(|| self.write_error(&format!("index {idx} out of range")))?,
                    _ => return Err(self.write_error("expected array")),
                },
            };
        }
        *current = value;
        Ok(())
    }

    fn write_error(&self, reason: &str) -> DomainError {
        DomainError::PathWrite {
            path: self.to_string(),
            reason: reason.to_string(),
        }
    }
}

fn parse_part(part: &str, raw: &str, segments: &mut Vec<Segment>) -> Result<(), FieldPathError> {
    let (head, mut rest) = match part.find('[') {
        Some(pos) => (&part[..pos], &part[pos..]),
        None => (part, ""),
    };

    if !head.is_empty() {
        if head.contains(']') {
            return Err(FieldPathError::MalformedIndex(raw.to_string()));
        }
        match head.parse::<usize>() {
            Ok(idx) if head.bytes().all(|b| b.is_ascii_digit()) => {
                segments.push(Segment::Index(idx));
            }
            _ => segments.push(Segment::Key(head.to_string())),
        }
    } else if rest.is_empty() {
        return Err(FieldPathError::EmptySegment(raw.to_string()));
    }

    while !rest.is_empty() {
        let close = rest
            .find(']')
            .ok_or_else(|| FieldPathError::MalformedIndex(raw.to_string()))?;
        let idx = rest[1..close]
            .parse::<usize>()
            .map_err(|_| FieldPathError::MalformedIndex(raw.to_string()))?;
        segments.push(Segment::Index(idx));
        rest = &rest[close + 1..];
        if !rest.is_empty() && !rest.starts_with('[') {
            return Err(FieldPathError::MalformedIndex(raw.to_string()));
        }
    }

    Ok(())
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            match segment {
                Segment::Key(key) => f.write_str(key)?,
                Segment::Index(idx) => write!(f, "{idx}")?,
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for FieldPath {
    type Err = FieldPathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for FieldPath {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FieldPath {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Dense id of a canonical path in a [`FieldPathRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldPathId(u32);

impl FieldPathId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    pub const fn raw(self) -> u32 {
        self.0
    }
}

/// Arena of canonical paths with an index for lookups.
///
/// Interning a path also interns all of its prefixes, so every registered
/// path can answer "who are my ancestors" without string work.
#[derive(Debug, Clone, Default)]
pub struct FieldPathRegistry {
    paths: Vec<FieldPath>,
    index: HashMap<FieldPath, FieldPathId>,
    ancestors: Vec<Vec<FieldPathId>>,
}

impl FieldPathRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern the canonical form of `path` and every prefix of it.
    ///
    /// Returns `None` for a path whose canonical form is empty.
    pub fn intern(&mut self, path: &FieldPath) -> Option<FieldPathId> {
        let canonical = path.canonical();
        if canonical.is_empty() {
            return None;
        }

        let mut chain: Vec<FieldPathId> = Vec::with_capacity(canonical.len());
        for prefix in canonical.prefixes() {
            let id = match self.index.get(&prefix) {
                Some(id) => *id,
                None => {
                    let id = FieldPathId(self.paths.len() as u32);
                    self.paths.push(prefix.clone());
                    self.ancestors.push(chain.clone());
                    self.index.insert(prefix, id);
                    id
                }
            };
            chain.push(id);
        }
        chain.last().copied()
    }

    /// Look up the canonical form of `path`.
    pub fn lookup(&self, path: &FieldPath) -> Option<FieldPathId> {
        if path.is_canonical() {
            self.index.get(path).copied()
        } else {
            self.index.get(&path.canonical()).copied()
        }
    }

    pub fn path(&self, id: FieldPathId) -> &FieldPath {
        &self.paths[id.index()]
    }

    /// Strict ancestors of `id`, root-most first.
    pub fn ancestors(&self, id: FieldPathId) -> &[FieldPathId] {
        &self.ancestors[id.index()]
    }

    /// True when `ancestor` is equal to or an ancestor of `id`.
    pub fn is_ancestor_or_equal(&self, ancestor: FieldPathId, id: FieldPathId) -> bool {
        ancestor == id || self.ancestors(id).contains(&ancestor)
    }

    pub fn overlaps(&self, a: FieldPathId, b: FieldPathId) -> bool {
        self.is_ancestor_or_equal(a, b) || self.is_ancestor_or_equal(b, a)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (FieldPathId, &FieldPath)> {
        self.paths
            .iter()
            .enumerate()
            .map(|(i, p)| (FieldPathId(i as u32), p))
    }
}

// ============================================================================
// State schema
// ============================================================================

/// The set of canonical paths a module's state is known to contain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateSchema {
    paths: BTreeSet<FieldPath>,
}

impl StateSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive a schema from a sample state value. Array rows contribute the
    /// union of their keys under the canonical (index-free) path.
    pub fn from_sample(sample: &Value) -> Self {
        let mut schema = Self::default();
        collect_paths(sample, &FieldPath::from_keys(Vec::<String>::new()), &mut schema.paths);
        schema
    }

    pub fn from_paths<I, S>(paths: I) -> Result<Self, FieldPathError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut schema = Self::default();
        for raw in paths {
            let path = FieldPath::parse(raw.as_ref())?.canonical();
            for prefix in path.prefixes() {
                schema.paths.insert(prefix);
            }
        }
        Ok(schema)
    }

    pub fn contains(&self, path: &FieldPath) -> bool {
        self.paths.contains(&path.canonical())
    }

    pub fn paths(&self) -> impl Iterator<Item = &FieldPath> {
        self.paths.iter()
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Stable fingerprint of the schema, used as part of program cache keys.
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for path in &self.paths {
            hasher.update(path.to_string().as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(&hasher.finalize().as_bytes()[..8])
    }
}

fn collect_paths(value: &Value, prefix: &FieldPath, out: &mut BTreeSet<FieldPath>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let path = prefix.join(&FieldPath::from_keys([key.as_str()]));
                collect_paths(child, &path, out);
                out.insert(path);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_paths(item, prefix, out);
            }
        }
        _ => {}
    }
}
