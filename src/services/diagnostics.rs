//! Diagnostic fan-out, sampling decisions and hotspot tracking.

use std::sync::{Arc, Mutex, PoisonError};

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::domain::models::config::SamplingConfig;
use crate::domain::models::converge::{DecisionSummary, SamplingSummary};
use crate::domain::models::diagnostics::{DiagnosticLevel, DiagnosticRecord, Hotspot, Severity};
use crate::domain::ports::DiagnosticSink;

/// Code of the per-pass summary record.
pub const CONVERGE_SUMMARY: &str = "trait::converge_summary";

/// Code of the build-time schema mismatch warning.
pub const SCHEMA_MISMATCH: &str = "state_trait::schema_mismatch";

/// Routes diagnostic records to every registered sink according to the level.
#[derive(Clone)]
pub struct DiagnosticsHub {
    level: DiagnosticLevel,
    sampling: SamplingConfig,
    sinks: Vec<Arc<dyn DiagnosticSink>>,
}

impl DiagnosticsHub {
    pub fn new(level: DiagnosticLevel, sampling: SamplingConfig) -> Self {
        Self {
            level,
            sampling,
            sinks: Vec::new(),
        }
    }

    /// A hub that emits nothing.
    pub fn off() -> Self {
        Self::new(DiagnosticLevel::Off, SamplingConfig::default())
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn add_sink(&mut self, sink: Arc<dyn DiagnosticSink>) {
        self.sinks.push(sink);
    }

    /// Same sinks under a different level and sampling configuration.
    #[must_use]
    pub fn reconfigured(&self, level: DiagnosticLevel, sampling: SamplingConfig) -> Self {
        Self {
            level,
            sampling,
            sinks: self.sinks.clone(),
        }
    }

    pub const fn level(&self) -> DiagnosticLevel {
        self.level
    }

    pub const fn sampling(&self) -> SamplingConfig {
        self.sampling
    }

    /// Whether a `sampled`-level pass with this sequence number is sampled.
    pub fn is_sampled(&self, txn_seq: u64) -> bool {
        let every = self.sampling.sample_every_n.max(1);
        txn_seq.saturating_sub(1) % every == 0
    }

    /// Whether step timings are collected for this pass.
    pub fn times_steps(&self, txn_seq: u64) -> bool {
        match self.level {
            DiagnosticLevel::Off | DiagnosticLevel::Light => false,
            DiagnosticLevel::Sampled => self.is_sampled(txn_seq),
            DiagnosticLevel::Full => true,
        }
    }

    /// Sampling block of a decision summary.
    pub fn sampling_summary(&self, txn_seq: u64) -> Option<SamplingSummary> {
        match self.level {
            DiagnosticLevel::Sampled | DiagnosticLevel::Full => Some(SamplingSummary {
                sample_every_n: self.sampling.sample_every_n,
                top_k: self.sampling.top_k,
                sampled: self.times_steps(txn_seq),
            }),
            DiagnosticLevel::Off | DiagnosticLevel::Light => None,
        }
    }

    pub fn emit(&self, record: &DiagnosticRecord) {
        if self.level == DiagnosticLevel::Off {
            return;
        }
        for sink in &self.sinks {
            sink.emit(record);
        }
    }

    pub fn warning(&self, code: &str, module_id: &str, txn_seq: Option<u64>, message: &str, data: Value) {
        let mut record = DiagnosticRecord::new(code, Severity::Warning, module_id, message).with_data(data);
        record.txn_seq = txn_seq;
        self.emit(&record);
    }

    /// Emit the summary record of a committed or degraded pass.
    pub fn pass_summary(&self, module_id: &str, outcome_label: &str, summary: &DecisionSummary) {
        if self.level == DiagnosticLevel::Off || self.sinks.is_empty() {
            return;
        }
        let data = match serde_json::to_value(summary) {
            Ok(Value::Object(mut map)) => {
                map.insert("outcome".to_string(), json!(outcome_label));
                Value::Object(map)
            }
            Ok(other) => other,
            Err(err) => json!({ "outcome": outcome_label, "error": err.to_string() }),
        };
        let record = DiagnosticRecord::new(
            CONVERGE_SUMMARY,
            Severity::Info,
            module_id,
            format!("{} pass: {}", summary.executed_mode.as_str(), outcome_label),
        )
        .with_txn_seq(summary.txn_seq)
        .with_data(data);
        self.emit(&record);
    }
}

impl Default for DiagnosticsHub {
    fn default() -> Self {
        Self::new(DiagnosticLevel::default(), SamplingConfig::default())
    }
}

// ============================================================================
// Hotspots
// ============================================================================

/// Keeps the `top_k` slowest steps, ordered by duration descending and then
/// by declaration index.
#[derive(Debug, Clone)]
pub struct HotspotTracker {
    top_k: usize,
    items: Vec<Hotspot>,
}

impl HotspotTracker {
    pub const fn new(top_k: usize) -> Self {
        Self {
            top_k,
            items: Vec::new(),
        }
    }

    pub fn offer(&mut self, hotspot: Hotspot) {
        if self.top_k == 0 {
            return;
        }
        let pos = self
            .items
            .iter()
            .position(|h| {
                hotspot.duration_ms > h.duration_ms
                    || (hotspot.duration_ms == h.duration_ms && hotspot.decl_index < h.decl_index)
            })
            .unwrap_or(self.items.len());
        if pos < self.top_k {
            self.items.insert(pos, hotspot);
            self.items.truncate(self.top_k);
        }
    }

    pub fn into_vec(self) -> Vec<Hotspot> {
        self.items
    }
}

// ============================================================================
// Sinks
// ============================================================================

/// Forwards records to `tracing` at the record's severity.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn emit(&self, record: &DiagnosticRecord) {
        match record.severity {
            Severity::Info => debug!(
                code = %record.code,
                module_id = %record.module_id,
                txn_seq = ?record.txn_seq,
                data = %record.data,
                "{}", record.message
            ),
            Severity::Warning => warn!(
                code = %record.code,
                module_id = %record.module_id,
                txn_seq = ?record.txn_seq,
                data = %record.data,
                "{}", record.message
            ),
            Severity::Error => tracing::error!(
                code = %record.code,
                module_id = %record.module_id,
                txn_seq = ?record.txn_seq,
                data = %record.data,
                "{}", record.message
            ),
        }
    }
}

/// Buffers records in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<DiagnosticRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<DiagnosticRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Records carrying `code`.
    pub fn with_code(&self, code: &str) -> Vec<DiagnosticRecord> {
        self.records().into_iter().filter(|r| r.code == code).collect()
    }

    pub fn clear(&self) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl DiagnosticSink for MemorySink {
    fn emit(&self, record: &DiagnosticRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
    }
}

/// Log the effective diagnostics configuration of a runtime.
pub(crate) fn log_hub(module_id: &str, hub: &DiagnosticsHub) {
    info!(
        module_id,
        level = ?hub.level(),
        sample_every_n = hub.sampling().sample_every_n,
        sinks = hub.sinks.len(),
        "diagnostics configured"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hotspot(decl_index: usize, duration_ms: f64) -> Hotspot {
        Hotspot {
            step_id: decl_index as u32,
            decl_index,
            field_path: format!("f{decl_index}"),
            kind: "computed".to_string(),
            duration_ms,
        }
    }

    #[test]
    fn test_sampling_is_deterministic() {
        let hub = DiagnosticsHub::new(
            DiagnosticLevel::Sampled,
            SamplingConfig {
                sample_every_n: 2,
                top_k: 3,
            },
        );
        let sampled: Vec<bool> = (1..=5).map(|seq| hub.times_steps(seq)).collect();
        assert_eq!(sampled, vec![true, false, true, false, true]);

        let light = DiagnosticsHub::default();
        assert!(!light.times_steps(1));
        assert!(light.sampling_summary(1).is_none());
    }

    #[test]
    fn test_hotspots_keep_top_k_with_declaration_ties() {
        let mut tracker = HotspotTracker::new(3);
        for (idx, ms) in [(0, 1.0), (1, 5.0), (2, 3.0), (3, 5.0), (4, 0.5)] {
            tracker.offer(hotspot(idx, ms));
        }
        let order: Vec<usize> = tracker.into_vec().iter().map(|h| h.decl_index).collect();
        assert_eq!(order, vec![1, 3, 2]);
    }

    #[test]
    fn test_off_level_emits_nothing() {
        let sink = Arc::new(MemorySink::new());
        let hub = DiagnosticsHub::off().with_sink(sink.clone());
        hub.warning("trait::budget_exceeded", "m", Some(2), "over budget", Value::Null);
        assert!(sink.records().is_empty());

        let light = DiagnosticsHub::default().with_sink(sink.clone());
        light.warning("trait::budget_exceeded", "m", Some(2), "over budget", Value::Null);
        assert_eq!(sink.with_code("trait::budget_exceeded").len(), 1);
    }
}
