//! Stable row identity for list-scope checks.
//!
//! Rows keep their id across passes when the list is unchanged, when their
//! `track_by` value is stable, or when an equal item existed before. Other
//! rows receive fresh `r{n}` ids from a per-list counter.

use std::collections::{HashMap, VecDeque};

use serde_json::Value;

use crate::domain::models::field_path::FieldPath;

/// Per-list row state kept between passes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListRows {
    pub ids: Vec<String>,
    pub items: Vec<Value>,
    /// Row key of each row (`null` when missing).
    pub keys: Vec<Value>,
    /// Last rule result of each row.
    pub results: Vec<Value>,
    pub next_id: u64,
}

impl ListRows {
    /// Position of a row id.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.ids.iter().position(|existing| existing == id)
    }
}

/// Row state of every list-check step of one instance, keyed by declaration index.
#[derive(Debug, Clone, Default)]
pub struct RowIdStore {
    lists: HashMap<usize, ListRows>,
}

impl RowIdStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, decl_index: usize) -> Option<&ListRows> {
        self.lists.get(&decl_index)
    }

    /// Replace the rows of one list; called only when a pass commits.
    pub fn commit(&mut self, decl_index: usize, rows: ListRows) {
        self.lists.insert(decl_index, rows);
    }

    pub fn len(&self) -> usize {
        self.lists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }
}

fn identity_key(value: &Value) -> String {
    value.to_string()
}

/// Assign ids to `items`, reusing ids from `previous` where possible.
///
/// Returns the ids and the next value of the id counter.
pub fn reconcile(
    previous: Option<&ListRows>,
    items: &[Value],
    track_by: Option<&FieldPath>,
) -> (Vec<String>, u64) {
    let Some(prev) = previous else {
        let ids = (0..items.len()).map(|n| format!("r{n}")).collect();
        return (ids, items.len() as u64);
    };

    if prev.items.as_slice() == items {
        return (prev.ids.clone(), prev.next_id);
    }

    let mut next_id = prev.next_id;
    let mut taken = vec![false; prev.ids.len()];
    let mut ids: Vec<Option<String>> = vec![None; items.len()];

    if let Some(track) = track_by {
        let mut by_track: HashMap<String, usize> = HashMap::new();
        for (pos, item) in prev.items.iter().enumerate() {
            if let Some(key) = track.get(item).filter(|v| !v.is_null()) {
                by_track.entry(identity_key(key)).or_insert(pos);
            }
        }
        for (slot, item) in ids.iter_mut().zip(items) {
            let Some(key) = track.get(item).filter(|v| !v.is_null()) else {
                continue;
            };
            if let Some(&pos) = by_track.get(&identity_key(key)) {
                if !taken[pos] {
                    taken[pos] = true;
                    *slot = Some(prev.ids[pos].clone());
                }
            }
        }
    }

    let mut by_item: HashMap<String, VecDeque<usize>> = HashMap::new();
    for (pos, item) in prev.items.iter().enumerate() {
        if !taken[pos] {
            by_item.entry(identity_key(item)).or_default().push_back(pos);
        }
    }
    for (slot, item) in ids.iter_mut().zip(items) {
        if slot.is_some() {
            continue;
        }
        if let Some(queue) = by_item.get_mut(&identity_key(item)) {
            while let Some(pos) = queue.pop_front() {
                if !taken[pos] {
                    taken[pos] = true;
                    *slot = Some(prev.ids[pos].clone());
                    break;
                }
            }
        }
    }

    let ids = ids
        .into_iter()
        .map(|slot| {
            slot.unwrap_or_else(|| {
                let id = format!("r{next_id}");
                next_id += 1;
                id
            })
        })
        .collect();
    (ids, next_id)
}
