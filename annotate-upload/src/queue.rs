//! Per-project upload queue
//!
//! Files land in an ingest buffer first and move into `pending` in small
//! sub-batches. Admission always prefers `pending` over `failed_retry`, and a
//! batch only finishes once every list is empty and nothing is in flight.

use crate::task::{FilePayload, TaskKey};
use std::collections::VecDeque;
use tracing::debug;

/// Where the next task to admit comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueSource {
    Pending,
    FailedRetry,
}

/// Batch counters of one project
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchCounters {
    pub total_files: usize,
    pub completed: usize,
    pub failed: usize,
}

impl BatchCounters {
    /// Completed plus permanently failed
    pub fn done(&self) -> usize {
        self.completed + self.failed
    }
}

/// Queue state of one project
#[derive(Debug)]
pub struct ProjectUploadQueue {
    project_id: String,
    staged: VecDeque<FilePayload>,
    pending: VecDeque<TaskKey>,
    failed_retry: VecDeque<TaskKey>,
    in_flight: Option<TaskKey>,
    counters: BatchCounters,
    batch_active: bool,
}

impl ProjectUploadQueue {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            staged: VecDeque::new(),
            pending: VecDeque::new(),
            failed_retry: VecDeque::new(),
            in_flight: None,
            counters: BatchCounters::default(),
            batch_active: false,
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Stage files for ingestion. Starts a new batch when the previous one
    /// has finished, resetting the counters.
    pub fn enqueue(&mut self, files: Vec<FilePayload>) -> usize {
        if !self.batch_active && self.is_idle() {
            self.counters = BatchCounters::default();
        }

        let count = files.len();
        self.counters.total_files += count;
        self.staged.extend(files);
        self.batch_active = self.batch_active || count > 0;

        debug!(
            "Staged {} files for project {} ({} in batch)",
            count, self.project_id, self.counters.total_files
        );
        count
    }

    /// Take up to `batch_size` staged files for ingestion
    pub fn take_ingest_batch(&mut self, batch_size: usize) -> Vec<FilePayload> {
        let count = batch_size.min(self.staged.len());
        self.staged.drain(..count).collect()
    }

    pub fn push_pending(&mut self, key: TaskKey) {
        self.pending.push_back(key);
    }

    pub fn push_retry(&mut self, key: TaskKey) {
        self.failed_retry.push_back(key);
    }

    /// Next task to admit, without removing it
    pub fn peek_next(&self) -> Option<(TaskKey, QueueSource)> {
        if self.in_flight.is_some() {
            return None;
        }
        self.pending
            .front()
            .map(|key| (*key, QueueSource::Pending))
            .or_else(|| {
                self.failed_retry
                    .front()
                    .map(|key| (*key, QueueSource::FailedRetry))
            })
    }

    /// Remove the next task and mark it in flight
    pub fn start_next(&mut self) -> Option<(TaskKey, QueueSource)> {
        let next = self.peek_next()?;
        match next.1 {
            QueueSource::Pending => self.pending.pop_front(),
            QueueSource::FailedRetry => self.failed_retry.pop_front(),
        };
        self.in_flight = Some(next.0);
        Some(next)
    }

    /// Mark a task in flight without it having been queued (restored tasks)
    pub fn adopt_in_flight(&mut self, key: TaskKey) {
        self.in_flight = Some(key);
        self.batch_active = true;
    }

    /// Clear the in-flight marker if `key` holds it
    pub fn finish(&mut self, key: TaskKey) -> bool {
        if self.in_flight == Some(key) {
            self.in_flight = None;
            true
        } else {
            false
        }
    }

    pub fn in_flight(&self) -> Option<TaskKey> {
        self.in_flight
    }

    pub fn record_completed(&mut self) {
        self.counters.completed += 1;
    }

    pub fn record_failed(&mut self) {
        self.counters.failed += 1;
    }

    /// Replace the counters, used when rebuilding from persisted state
    pub fn restore_counters(&mut self, counters: BatchCounters) {
        self.counters = counters;
        if counters.done() < counters.total_files {
            self.batch_active = true;
        }
    }

    pub fn counters(&self) -> BatchCounters {
        self.counters
    }

    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn failed_retry_len(&self) -> usize {
        self.failed_retry.len()
    }

    pub fn has_staged(&self) -> bool {
        !self.staged.is_empty()
    }

    /// Nothing staged, queued or in flight
    pub fn is_idle(&self) -> bool {
        self.staged.is_empty()
            && self.pending.is_empty()
            && self.failed_retry.is_empty()
            && self.in_flight.is_none()
    }

    pub fn is_batch_active(&self) -> bool {
        self.batch_active
    }

    /// Close the batch if it just finished. Returns true exactly once per batch.
    pub fn try_finish_batch(&mut self) -> bool {
        if self.batch_active && self.is_idle() {
            self.batch_active = false;
            true
        } else {
            false
        }
    }

    /// "Uploaded X/Y files"
    pub fn status_line(&self) -> String {
        format!(
            "Uploaded {}/{} files",
            self.counters.completed, self.counters.total_files
        )
    }

    /// "Queued N files for upload" while files are still being ingested
    pub fn queued_line(&self) -> Option<String> {
        if self.staged.is_empty() {
            None
        } else {
            Some(format!("Queued {} files for upload", self.staged.len()))
        }
    }
}
