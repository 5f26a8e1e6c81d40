//! Clock implementations.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::domain::ports::Clock;

/// Wall-clock time measured from construction.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> f64 {
        self.origin.elapsed().as_secs_f64() * 1000.0
    }
}

/// Deterministic clock for tests.
///
/// Time only moves through [`ManualClock::advance`], plus an optional fixed
/// tick applied after every read.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
    tick: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// A clock that advances by `tick_ms` after every read.
    pub fn with_auto_tick(tick_ms: f64) -> Self {
        Self {
            now: AtomicU64::new(0f64.to_bits()),
            tick: AtomicU64::new(tick_ms.to_bits()),
        }
    }

    pub fn set_auto_tick(&self, tick_ms: f64) {
        self.tick.store(tick_ms.to_bits(), Ordering::SeqCst);
    }

    pub fn advance(&self, ms: f64) {
        self.add(ms);
    }

    fn add(&self, ms: f64) -> f64 {
        let mut previous = self.now.load(Ordering::SeqCst);
        loop {
            let next = (f64::from_bits(previous) + ms).to_bits();
            match self
                .now
                .compare_exchange_weak(previous, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return f64::from_bits(previous),
                Err(actual) => previous = actual,
            }
        }
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> f64 {
        let tick = f64::from_bits(self.tick.load(Ordering::SeqCst));
        self.add(tick)
    }
}
