//! Tool change telemetry
//!
//! Counts tool changes and accumulates their duration for average
//! reporting. Timing uses monotonic `Instant`s, so system clock changes
//! cannot skew a measurement. Callers serialize tool changes by contract,
//! so one running timer at a time is sufficient.

use std::time::{Duration, Instant};

/// Tool change counters
#[derive(Debug, Default)]
pub struct ToolChangeStats {
    count: u32,
    total: Duration,
    started: Option<Instant>,
}

impl ToolChangeStats {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin timing a tool change and count it.
    pub fn start_timer(&mut self) {
        self.count += 1;
        self.started = Some(Instant::now());
    }

    /// Finish timing, add the elapsed time to the running total, and
    /// return it. Returns zero if no timer was running.
    pub fn stop_timer(&mut self) -> Duration {
        let elapsed = match self.started.take() {
            Some(start) => start.elapsed(),
            None => Duration::ZERO,
        };
        self.total += elapsed;
        elapsed
    }

    /// Number of tool changes since the last reset.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Total time spent in tool changes since the last reset.
    pub fn total(&self) -> Duration {
        self.total
    }

    /// Average tool change duration, zero before the first change.
    pub fn average(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.total / self.count
        }
    }

    /// Zero both counters.
    pub fn reset(&mut self) {
        self.count = 0;
        self.total = Duration::ZERO;
        self.started = None;
    }
}
