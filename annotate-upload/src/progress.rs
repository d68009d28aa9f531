//! Aggregate progress per project
//!
//! ```text
//! base  = done / max(total, done + in_flight + pending + failed_retry + staged) * 100
//! value = base + in_flight_progress / 100 * share
//! ```
//!
//! The reported value is clamped to 0..=100 and never drops below the last
//! value reported for the project.

use std::collections::HashMap;

/// Inputs for one progress computation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressInputs {
    pub total_files: usize,
    /// Completed plus permanently failed
    pub done: usize,
    pub in_flight: usize,
    pub pending: usize,
    pub failed_retry: usize,
    pub staged: usize,
    /// Progress of the task in flight, if any
    pub in_flight_progress: Option<u8>,
}

impl ProgressInputs {
    /// Raw percentage, not yet clamped against history
    pub fn percent(&self) -> u8 {
        let outstanding =
            self.done + self.in_flight + self.pending + self.failed_retry + self.staged;
        let denominator = self.total_files.max(outstanding);
        if denominator == 0 {
            return 0;
        }

        let share = 100.0 / denominator as f64;
        let base = self.done as f64 * share;
        let partial = self
            .in_flight_progress
            .map_or(0.0, |p| f64::from(p.min(100)) / 100.0 * share);

        (base + partial).floor().clamp(0.0, 100.0) as u8
    }
}

#[derive(Debug, Default)]
pub struct ProgressAggregator {
    last: HashMap<String, u8>,
}

impl ProgressAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute and remember the project's progress
    pub fn report(&mut self, project_id: &str, inputs: ProgressInputs) -> u8 {
        let last = self.last.entry(project_id.to_string()).or_insert(0);
        *last = inputs.percent().max(*last);
        *last
    }

    pub fn last(&self, project_id: &str) -> u8 {
        self.last.get(project_id).copied().unwrap_or(0)
    }

    /// Forget history when a new batch starts
    pub fn reset(&mut self, project_id: &str) {
        self.last.remove(project_id);
    }
}
