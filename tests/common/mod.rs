//! Common test utilities for integration tests
//!
//! Shared fixtures for building programs and runtimes.

use std::sync::Arc;

use serde_json::{json, Value};
use statetrait::domain::models::{StateSchema, TraitEntry, TraitSpec};
use statetrait::infrastructure::clock::ManualClock;
use statetrait::infrastructure::patch_log::PatchLog;
use statetrait::services::diagnostics::DiagnosticsHub;
use statetrait::services::{build, RuntimeOptions, TraitRuntime};
use tempfile::TempDir;

/// Create a temporary directory for test isolation
#[allow(dead_code)]
pub fn temp_dir() -> TempDir {
    tempfile::tempdir().expect("Failed to create temp dir")
}

/// Setup test logging
///
/// Initializes tracing subscriber for test output.
#[allow(dead_code)]
pub fn setup_test_logging() {
    use tracing_subscriber::fmt;

    let _ = fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// `n` independent computed fields `out{i} = in{i} + 1`.
#[allow(dead_code)]
pub fn fan_spec(n: usize) -> TraitSpec {
    let mut spec = TraitSpec::new();
    for i in 0..n {
        spec.push(TraitEntry::computed(format!("out{i}"), [format!("in{i}")], |d| {
            Ok(json!(d.as_f64(0).unwrap_or(0.0) + 1.0))
        }));
    }
    spec
}

/// State with `in0..in{n}` set to zero.
#[allow(dead_code)]
pub fn fan_state(n: usize) -> Value {
    let mut state = serde_json::Map::new();
    for i in 0..n {
        state.insert(format!("in{i}"), json!(0));
    }
    Value::Object(state)
}

/// Runtime over `spec` with a manual clock and an in-memory patch log.
#[allow(dead_code)]
pub fn manual_runtime(
    spec: &TraitSpec,
    state: Value,
    options: RuntimeOptions,
) -> (TraitRuntime, Arc<ManualClock>, Arc<PatchLog>) {
    let clock = Arc::new(ManualClock::new());
    let log = Arc::new(PatchLog::new());
    let program = Arc::new(build(&StateSchema::new(), spec).expect("program builds"));
    let options = options
        .with_clock(clock.clone())
        .with_recorder(log.clone())
        .with_diagnostics(DiagnosticsHub::off());
    (TraitRuntime::new("test", program, state, options), clock, log)
}

/// Wait for a condition to be true with timeout
///
/// Polls the predicate every 5ms until it returns true or timeout is reached.
#[allow(dead_code)]
pub async fn wait_for<F>(mut predicate: F, timeout_ms: u64) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    let timeout = std::time::Duration::from_millis(timeout_ms);

    while start.elapsed() < timeout {
        if predicate() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    predicate()
}
