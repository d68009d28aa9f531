//! Admission gate
//!
//! Combines the global rate limiter (minimum spacing between dispatch starts),
//! the global concurrency cap and the one-upload-per-project rule. The gate
//! only answers questions; the caller records dispatches and releases slots.

use crate::config::GateConfig;
use crate::task::TaskKey;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Answer to an admission request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Dispatch now
    Granted,
    /// Too soon after the previous dispatch; ask again after the wait
    Defer(Duration),
    /// Global concurrency cap reached; ask again after the wait
    AtCapacity(Duration),
    /// The project already has an upload in flight
    ProjectBusy,
}

impl Admission {
    pub fn is_granted(&self) -> bool {
        matches!(self, Admission::Granted)
    }
}

/// Rate limiter and concurrency gate shared by all projects
#[derive(Debug)]
pub struct ConcurrencyGate {
    config: GateConfig,
    /// Start of the most recent dispatch
    last_dispatch: Option<Instant>,
    /// project_id -> task currently holding the project's slot
    in_flight: HashMap<String, TaskKey>,
}

impl ConcurrencyGate {
    pub fn new(config: GateConfig) -> Self {
        Self {
            config,
            last_dispatch: None,
            in_flight: HashMap::new(),
        }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Decide whether `project_id` may dispatch at `now`
    pub fn admit(&self, project_id: &str, now: Instant) -> Admission {
        if self.in_flight.contains_key(project_id) {
            return Admission::ProjectBusy;
        }

        if self.in_flight.len() >= self.config.max_concurrent_uploads {
            return Admission::AtCapacity(self.config.capacity_retry_delay());
        }

        if let Some(last) = self.last_dispatch {
            let elapsed = now.saturating_duration_since(last);
            let spacing = self.config.min_dispatch_interval();
            if elapsed < spacing {
                return Admission::Defer(spacing - elapsed);
            }
        }

        Admission::Granted
    }

    /// Record that `key` was dispatched for `project_id` at `now`
    pub fn record_dispatch(&mut self, project_id: &str, key: TaskKey, now: Instant) {
        self.last_dispatch = Some(now);
        self.occupy(project_id, key);
    }

    /// Take a project's slot without counting as a dispatch (restored tasks)
    pub fn occupy(&mut self, project_id: &str, key: TaskKey) {
        self.in_flight.insert(project_id.to_string(), key);
        debug!(
            "Slot taken by {} for project {} ({}/{} in flight)",
            key,
            project_id,
            self.in_flight.len(),
            self.config.max_concurrent_uploads
        );
    }

    /// Release the project's slot if `key` holds it
    pub fn release(&mut self, project_id: &str, key: TaskKey) -> bool {
        match self.in_flight.get(project_id) {
            Some(holder) if *holder == key => {
                self.in_flight.remove(project_id);
                debug!(
                    "Slot released by {} for project {} ({} in flight)",
                    key,
                    project_id,
                    self.in_flight.len()
                );
                true
            }
            _ => false,
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn holder(&self, project_id: &str) -> Option<TaskKey> {
        self.in_flight.get(project_id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(max: usize) -> ConcurrencyGate {
        ConcurrencyGate::new(GateConfig {
            min_dispatch_interval_ms: 300,
            max_concurrent_uploads: max,
            capacity_retry_delay_ms: 1000,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_spacing() {
        let mut gate = gate(3);
        let start = Instant::now();

        assert!(gate.admit("a", start).is_granted());
        gate.record_dispatch("a", TaskKey::new(1), start);

        let soon = start + Duration::from_millis(100);
        assert_eq!(gate.admit("b", soon), Admission::Defer(Duration::from_millis(200)));

        let later = start + Duration::from_millis(300);
        assert!(gate.admit("b", later).is_granted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_project_serialization() {
        let mut gate = gate(3);
        let now = Instant::now();
        gate.record_dispatch("a", TaskKey::new(1), now);

        let later = now + Duration::from_secs(1);
        assert_eq!(gate.admit("a", later), Admission::ProjectBusy);
        assert!(gate.admit("b", later).is_granted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_capacity() {
        let mut gate = gate(2);
        let mut now = Instant::now();
        for (i, project) in ["a", "b"].iter().enumerate() {
            assert!(gate.admit(project, now).is_granted());
            gate.record_dispatch(project, TaskKey::new(i as u64), now);
            now += Duration::from_secs(1);
        }

        assert_eq!(
            gate.admit("c", now),
            Admission::AtCapacity(Duration::from_secs(1))
        );

        assert!(gate.release("a", TaskKey::new(0)));
        assert!(gate.admit("c", now).is_granted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_requires_holder() {
        let mut gate = gate(3);
        gate.record_dispatch("a", TaskKey::new(7), Instant::now());

        assert!(!gate.release("a", TaskKey::new(8)));
        assert_eq!(gate.holder("a"), Some(TaskKey::new(7)));
        assert!(gate.release("a", TaskKey::new(7)));
        assert_eq!(gate.in_flight_count(), 0);
    }
}
