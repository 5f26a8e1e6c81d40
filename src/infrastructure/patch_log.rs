//! In-memory patch recorder.

use std::sync::{Mutex, PoisonError};

use crate::domain::models::patch::{PatchReason, PatchRecord};
use crate::domain::ports::PatchRecorder;

/// Ordered, append-only log of committed writes.
#[derive(Debug, Default)]
pub struct PatchLog {
    records: Mutex<Vec<PatchRecord>>,
}

impl PatchLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<PatchRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Records with the given reason, in commit order.
    pub fn with_reason(&self, reason: PatchReason) -> Vec<PatchRecord> {
        self.records()
            .into_iter()
            .filter(|p| p.reason == reason)
            .collect()
    }

    /// Records of one transaction.
    pub fn for_txn(&self, txn_seq: u64) -> Vec<PatchRecord> {
        self.records()
            .into_iter()
            .filter(|p| p.txn_seq == txn_seq)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl PatchRecorder for PatchLog {
    fn record(&self, patch: PatchRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(patch);
    }
}
