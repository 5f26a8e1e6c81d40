/// Monotonic time source, in fractional milliseconds.
///
/// Budgets, decision cutoffs, flush windows and step timings all read time
/// through this port so tests can drive them deterministically.
pub trait Clock: Send + Sync {
    /// Milliseconds since an arbitrary fixed origin.
    fn now_ms(&self) -> f64;
}
