//! Status tracking timers
//!
//! Keeps per-task stall deadlines and the status poll schedule. The tracker
//! only decides *when* something is due; applying push and poll results to
//! tasks happens in the pipeline through a single transition function.
//!
//! Stall deadlines are absolute from the start of a phase:
//! - `upload_timeout` from dispatch until the server issues a task id
//! - `processing_timeout` from acceptance until a terminal status
//!
//! Polling runs only while the push channel is down. When the channel comes
//! back every tracked server task is polled once right away.

use crate::backoff::Backoff;
use crate::config::TrackerConfig;
use crate::task::TaskKey;
use std::collections::HashMap;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Which stall timer is armed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Transfer running, no server task id yet
    Upload,
    /// Server owns the task
    Processing,
}

/// Something the tracker wants done
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerDue {
    /// No terminal status before the phase deadline
    Stalled(TaskKey),
    /// Time to ask the server for the task's status
    Poll(TaskKey),
}

/// Outcome of a failed poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollFailure {
    /// Poll again at the given time
    Retry(Instant),
    /// Too many consecutive failures, treat the task as stalled
    Exhausted,
}

#[derive(Debug)]
struct Tracked {
    phase: Phase,
    stall_at: Instant,
    next_poll: Option<Instant>,
    poll_in_flight: bool,
    backoff: Backoff,
}

#[derive(Debug)]
pub struct StatusTracker {
    config: TrackerConfig,
    push_connected: bool,
    tracked: HashMap<TaskKey, Tracked>,
}

impl StatusTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            push_connected: false,
            tracked: HashMap::new(),
        }
    }

    fn new_backoff(&self) -> Backoff {
        Backoff::new(
            self.config.poll_backoff_base(),
            self.config.poll_backoff_max(),
            Some(self.config.max_poll_failures.saturating_sub(1)),
        )
    }

    /// Start the upload-phase stall timer
    pub fn arm_upload(&mut self, key: TaskKey, now: Instant) {
        let tracked = Tracked {
            phase: Phase::Upload,
            stall_at: now + self.config.upload_timeout(),
            next_poll: None,
            poll_in_flight: false,
            backoff: self.new_backoff(),
        };
        self.tracked.insert(key, tracked);
    }

    /// Replace the upload timer with the processing timer. `poll_now`
    /// schedules an immediate status poll regardless of the push channel.
    pub fn arm_processing(&mut self, key: TaskKey, now: Instant, poll_now: bool) {
        let next_poll = if poll_now {
            Some(now)
        } else if self.push_connected {
            None
        } else {
            Some(now + self.config.poll_interval())
        };

        let tracked = Tracked {
            phase: Phase::Processing,
            stall_at: now + self.config.processing_timeout(),
            next_poll,
            poll_in_flight: false,
            backoff: self.new_backoff(),
        };
        self.tracked.insert(key, tracked);
    }

    /// Stop tracking a task that reached a terminal state
    pub fn clear(&mut self, key: TaskKey) {
        self.tracked.remove(&key);
    }

    pub fn phase(&self, key: TaskKey) -> Option<Phase> {
        self.tracked.get(&key).map(|t| t.phase)
    }

    /// Push channel came up or went down. On reconnect returns the tasks
    /// that were scheduled for an immediate re-poll.
    pub fn set_push_connected(&mut self, connected: bool, now: Instant) -> Vec<TaskKey> {
        if self.push_connected == connected {
            return Vec::new();
        }
        self.push_connected = connected;

        let interval = self.config.poll_interval();
        let mut repoll = Vec::new();
        for (key, tracked) in self.tracked.iter_mut() {
            if tracked.phase != Phase::Processing || tracked.poll_in_flight {
                continue;
            }
            if connected {
                tracked.next_poll = Some(now);
                repoll.push(*key);
            } else {
                tracked.next_poll = Some(now + interval);
            }
        }

        if connected {
            info!(
                "Push channel connected, re-polling {} tasks",
                repoll.len()
            );
        } else {
            warn!(
                "Push channel lost, polling {} tasks every {:?}",
                self.tracked
                    .values()
                    .filter(|t| t.phase == Phase::Processing)
                    .count(),
                interval
            );
        }
        repoll.sort();
        repoll
    }

    /// Earliest moment something is due
    pub fn next_deadline(&self) -> Option<Instant> {
        self.tracked
            .values()
            .flat_map(|t| {
                let poll = if t.poll_in_flight { None } else { t.next_poll };
                std::iter::once(t.stall_at).chain(poll)
            })
            .min()
    }

    /// Everything due at `now`. Stalled tasks are not reported as polls, and
    /// returned polls are marked in flight until their result comes back.
    pub fn due(&mut self, now: Instant) -> Vec<TrackerDue> {
        let mut due = Vec::new();
        for (key, tracked) in self.tracked.iter_mut() {
            if tracked.stall_at <= now {
                due.push(TrackerDue::Stalled(*key));
                continue;
            }
            if tracked.poll_in_flight {
                continue;
            }
            if let Some(at) = tracked.next_poll {
                if at <= now {
                    tracked.poll_in_flight = true;
                    tracked.next_poll = None;
                    due.push(TrackerDue::Poll(*key));
                }
            }
        }
        due.sort_by_key(|d| match d {
            TrackerDue::Stalled(key) | TrackerDue::Poll(key) => *key,
        });
        due
    }

    /// A poll answered with a non-terminal status
    pub fn poll_succeeded(&mut self, key: TaskKey, now: Instant) {
        let push_connected = self.push_connected;
        let interval = self.config.poll_interval();
        if let Some(tracked) = self.tracked.get_mut(&key) {
            tracked.poll_in_flight = false;
            tracked.backoff.reset();
            tracked.next_poll = if push_connected {
                None
            } else {
                Some(now + interval)
            };
        }
    }

    /// A poll failed; back off or give up
    pub fn poll_failed(&mut self, key: TaskKey, now: Instant) -> PollFailure {
        let Some(tracked) = self.tracked.get_mut(&key) else {
            return PollFailure::Exhausted;
        };
        tracked.poll_in_flight = false;

        match tracked.backoff.next_delay() {
            Some(delay) => {
                debug!("Poll for {} failed, {}", key, tracked.backoff.status());
                let at = now + delay;
                tracked.next_poll = Some(at);
                PollFailure::Retry(at)
            }
            None => {
                tracked.next_poll = None;
                PollFailure::Exhausted
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn tracker() -> StatusTracker {
        StatusTracker::new(TrackerConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_then_processing_timer() {
        let mut tracker = tracker();
        let key = TaskKey::new(1);
        let start = Instant::now();

        tracker.arm_upload(key, start);
        assert_eq!(tracker.next_deadline(), Some(start + Duration::from_secs(30)));

        let accepted = start + Duration::from_secs(2);
        tracker.arm_processing(key, accepted, false);
        assert_eq!(tracker.phase(key), Some(Phase::Processing));

        // push channel down: polling every second
        assert_eq!(tracker.next_deadline(), Some(accepted + Duration::from_secs(1)));
        let due = tracker.due(accepted + Duration::from_secs(1));
        assert_eq!(due, vec![TrackerDue::Poll(key)]);

        // the poll is in flight, only the stall deadline is left
        assert_eq!(
            tracker.next_deadline(),
            Some(accepted + Duration::from_secs(120))
        );
        assert_eq!(
            tracker.due(accepted + Duration::from_secs(120)),
            vec![TrackerDue::Stalled(key)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_polling_while_push_connected() {
        let mut tracker = tracker();
        let now = Instant::now();
        tracker.set_push_connected(true, now);

        let key = TaskKey::new(1);
        tracker.arm_upload(key, now);
        tracker.arm_processing(key, now, false);
        assert_eq!(tracker.next_deadline(), Some(now + Duration::from_secs(120)));
        assert!(tracker.due(now + Duration::from_secs(60)).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_repolls_server_tasks() {
        let mut tracker = tracker();
        let now = Instant::now();
        tracker.set_push_connected(true, now);

        let uploading = TaskKey::new(1);
        let processing = TaskKey::new(2);
        tracker.arm_upload(uploading, now);
        tracker.arm_upload(processing, now);
        tracker.arm_processing(processing, now, false);

        tracker.set_push_connected(false, now);
        let later = now + Duration::from_millis(500);
        let repoll = tracker.set_push_connected(true, later);
        assert_eq!(repoll, vec![processing]);
        assert_eq!(tracker.due(later), vec![TrackerDue::Poll(processing)]);

        tracker.poll_succeeded(processing, later);
        assert_eq!(tracker.next_deadline(), Some(now + Duration::from_secs(30)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_backoff_then_exhausted() {
        let mut tracker = tracker();
        let key = TaskKey::new(1);
        let mut now = Instant::now();
        tracker.arm_upload(key, now);
        tracker.arm_processing(key, now, true);

        let mut delays = Vec::new();
        loop {
            assert_eq!(tracker.due(now), vec![TrackerDue::Poll(key)]);
            match tracker.poll_failed(key, now) {
                PollFailure::Retry(at) => {
                    delays.push(at - now);
                    now = at;
                }
                PollFailure::Exhausted => break,
            }
        }

        assert_eq!(
            delays,
            vec![
                Duration::from_secs(5),
                Duration::from_secs(10),
                Duration::from_secs(20),
                Duration::from_secs(30),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_poll_resets_backoff() {
        let mut tracker = tracker();
        let key = TaskKey::new(1);
        let now = Instant::now();
        tracker.arm_upload(key, now);
        tracker.arm_processing(key, now, true);

        tracker.due(now);
        tracker.poll_failed(key, now);
        let retry_at = now + Duration::from_secs(5);
        tracker.due(retry_at);
        tracker.poll_succeeded(key, retry_at);

        let next = retry_at + Duration::from_secs(1);
        tracker.due(next);
        assert_eq!(
            tracker.poll_failed(key, next),
            PollFailure::Retry(next + Duration::from_secs(5))
        );
    }
}
