//! Copy-on-first-write view over an immutable state snapshot.

use std::sync::Arc;

use serde_json::Value;

use crate::domain::errors::DomainResult;
use crate::domain::models::field_path::FieldPath;

/// Working copy of a pass.
///
/// Reads go to the base snapshot until the first write clones it. Dropping
/// the draft discards every write while the base handle stays untouched.
#[derive(Debug)]
pub struct CowDraft<'a> {
    base: &'a Arc<Value>,
    working: Option<Value>,
}

impl<'a> CowDraft<'a> {
    pub const fn new(base: &'a Arc<Value>) -> Self {
        Self {
            base,
            working: None,
        }
    }

    /// Current state, including writes made so far.
    pub fn current(&self) -> &Value {
        self.working.as_ref().unwrap_or(&**self.base)
    }

    pub fn get(&self, path: &FieldPath) -> Option<&Value> {
        path.get(self.current())
    }

    pub fn set(&mut self, path: &FieldPath, value: Value) -> DomainResult<()> {
        let base = self.base;
        let working = self.working.get_or_insert_with(|| (**base).clone());
        path.set(working, value)
    }

    /// True once the base has been copied.
    pub const fn is_written(&self) -> bool {
        self.working.is_some()
    }

    /// The written state, or `None` when nothing was written.
    pub fn into_written(self) -> Option<Value> {
        self.working
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reads_base_until_first_write() {
        let base = Arc::new(json!({"a": 1}));
        let mut draft = CowDraft::new(&base);
        let a = FieldPath::parse("a").unwrap();

        assert_eq!(draft.get(&a), Some(&json!(1)));
        assert!(!draft.is_written());

        draft.set(&a, json!(2)).unwrap();
        assert_eq!(draft.get(&a), Some(&json!(2)));
        assert_eq!(base["a"], json!(1));
        assert_eq!(draft.into_written(), Some(json!({"a": 2})));
    }

    #[test]
    fn test_drop_discards_writes() {
        let base = Arc::new(json!({"a": 1}));
        {
            let mut draft = CowDraft::new(&base);
            draft.set(&FieldPath::parse("b").unwrap(), json!(true)).unwrap();
        }
        assert_eq!(*base, json!({"a": 1}));
    }
}
