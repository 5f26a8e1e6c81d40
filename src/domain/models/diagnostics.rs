//! Structured diagnostic records emitted by the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How much diagnostic detail a runtime produces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticLevel {
    /// Nothing is emitted.
    Off,
    /// Warnings and per-pass summaries without step timings.
    #[default]
    Light,
    /// Like `light`, plus step timings on 1-in-N passes.
    Sampled,
    /// Step timings on every pass.
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// One diagnostic event, consumable by any sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticRecord {
    /// Stable code, e.g. `trait::budget_exceeded`.
    pub code: String,
    pub severity: Severity,
    pub module_id: String,
    pub txn_seq: Option<u64>,
    pub message: String,
    pub data: Value,
    pub emitted_at: DateTime<Utc>,
}

impl DiagnosticRecord {
    pub fn new(
        code: impl Into<String>,
        severity: Severity,
        module_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            severity,
            module_id: module_id.into(),
            txn_seq: None,
            message: message.into(),
            data: Value::Null,
            emitted_at: Utc::now(),
        }
    }

    #[must_use]
    pub const fn with_txn_seq(mut self, txn_seq: u64) -> Self {
        self.txn_seq = Some(txn_seq);
        self
    }

    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

/// A slow step in a sampled pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hotspot {
    pub step_id: u32,
    pub decl_index: usize,
    pub field_path: String,
    pub kind: String,
    pub duration_ms: f64,
}
