//! Cross-row rules over array state with incremental re-validation.

use std::collections::{HashMap, HashSet};

use serde_json::{json, Value};

use crate::domain::models::field_path::FieldPath;
use crate::domain::models::trait_spec::ListRule;
use crate::services::row_identity::{reconcile, ListRows};

/// One list-check evaluation.
#[derive(Debug, Clone)]
pub struct ListCheckReport {
    /// Array aligned with the current rows: `null` or an error object.
    pub output: Value,
    /// Row state to commit with the pass.
    pub rows: ListRows,
    /// Rows whose rule result was recomputed rather than reused.
    pub revalidated: usize,
}

/// Declared shape of a list check.
#[derive(Debug, Clone, Copy)]
pub struct ListScope<'a> {
    pub key: &'a FieldPath,
    pub track_by: Option<&'a FieldPath>,
    pub rule: ListRule,
}

fn key_string(key: &Value) -> Option<String> {
    if key.is_null() {
        None
    } else {
        Some(key.to_string())
    }
}

impl ListScope<'_> {
    /// Validate `list` against the rows of the previous committed pass.
    ///
    /// With `full` every row is re-validated. Otherwise only new rows, rows
    /// whose key changed, and rows sharing a key with a changed or removed row
    /// are recomputed.
    pub fn run(&self, list: &Value, previous: Option<&ListRows>, full: bool) -> ListCheckReport {
        let items: &[Value] = list.as_array().map_or(&[], Vec::as_slice);
        let (ids, next_id) = reconcile(previous, items, self.track_by);
        let keys: Vec<Value> = items
            .iter()
            .map(|item| self.key.get(item).cloned().unwrap_or(Value::Null))
            .collect();

        let mut counts: HashMap<String, usize> = HashMap::new();
        for key in keys.iter().filter_map(key_string) {
            *counts.entry(key).or_default() += 1;
        }

        // Old row state by id.
        let old: HashMap<&str, (&Value, &Value)> = previous
            .map(|prev| {
                prev.ids
                    .iter()
                    .zip(prev.keys.iter().zip(&prev.results))
                    .map(|(id, (key, result))| (id.as_str(), (key, result)))
                    .collect()
            })
            .unwrap_or_default();

        let mut changed = vec![false; items.len()];
        let mut touched_keys: HashSet<String> = HashSet::new();
        for (pos, id) in ids.iter().enumerate() {
            match old.get(id.as_str()) {
                Some((old_key, _)) if **old_key == keys[pos] => {}
                Some((old_key, _)) => {
                    changed[pos] = true;
                    touched_keys.extend(key_string(old_key));
                    touched_keys.extend(key_string(&keys[pos]));
                }
                None => {
                    changed[pos] = true;
                    touched_keys.extend(key_string(&keys[pos]));
                }
            }
        }
        if let Some(prev) = previous {
            let current: HashSet<&str> = ids.iter().map(String::as_str).collect();
            for (id, key) in prev.ids.iter().zip(&prev.keys) {
                if !current.contains(id.as_str()) {
                    touched_keys.extend(key_string(key));
                }
            }
        }

        let mut revalidated = 0;
        let results: Vec<Value> = (0..items.len())
            .map(|pos| {
                let key = key_string(&keys[pos]);
                let reuse = !full
                    && !changed[pos]
                    && key.as_ref().map_or(true, |k| !touched_keys.contains(k));
                if reuse {
                    if let Some((_, result)) = old.get(ids[pos].as_str()) {
                        return (*result).clone();
                    }
                }
                revalidated += 1;
                self.evaluate(&keys[pos], key.and_then(|k| counts.get(&k).copied()))
            })
            .collect();

        ListCheckReport {
            output: Value::Array(results.clone()),
            rows: ListRows {
                ids,
                items: items.to_vec(),
                keys,
                results,
                next_id,
            },
            revalidated,
        }
    }

    fn evaluate(&self, key: &Value, count: Option<usize>) -> Value {
        match self.rule {
            ListRule::Unique => match count {
                Some(count) if count > 1 => json!({
                    "code": "duplicate",
                    "key": key,
                    "count": count,
                }),
                _ => Value::Null,
            },
        }
    }
}
