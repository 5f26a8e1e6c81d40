use crate::domain::models::diagnostics::DiagnosticRecord;

/// Consumer of structured diagnostic records (logs, test buffers, UIs).
pub trait DiagnosticSink: Send + Sync {
    fn emit(&self, record: &DiagnosticRecord);
}
