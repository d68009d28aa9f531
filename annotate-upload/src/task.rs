//! Upload tasks and their state machine
//!
//! A task is one file on its way to a project. It moves through
//!
//! ```text
//! pending ──► uploading ──► queued/processing ──► completed
//!                 │                 │
//!                 └────────┬────────┘
//!                          ▼
//!                       failed ──(retry)──► uploading
//! ```
//!
//! `pending` is the wait for admission. `queued` and `processing` only differ
//! in what the server reports. A task keeps its raw payload until it either
//! completes or fails for good; after that only [`FileMeta`] remains.

use crate::{Result, UploadError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Stable surrogate key for a task.
///
/// Client and server ids are aliases that resolve to this key, so timers and
/// queue entries never need to be migrated when the server issues its id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskKey(u64);

impl TaskKey {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting for admission
    Pending,
    /// Transfer started, no server task id yet
    Uploading,
    /// Accepted by the server, waiting for a worker
    Queued,
    /// Server-side processing in progress
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Holds the project's in-flight slot
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            TaskStatus::Uploading | TaskStatus::Queued | TaskStatus::Processing
        )
    }

    /// Known to the server and still running there
    pub fn is_server_side(&self) -> bool {
        matches!(self, TaskStatus::Queued | TaskStatus::Processing)
    }

    /// Parse a status string as reported by the backend
    pub fn from_wire(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(TaskStatus::Pending),
            "uploading" => Some(TaskStatus::Uploading),
            "queued" => Some(TaskStatus::Queued),
            "processing" => Some(TaskStatus::Processing),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Uploading => "uploading",
            TaskStatus::Queued => "queued",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lightweight description of a file, kept after the payload is dropped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMeta {
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
}

impl FileMeta {
    pub fn new(name: impl Into<String>, size: u64, mime_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size,
            mime_type: mime_type.into(),
            modified: None,
        }
    }
}

/// Where a payload's bytes come from
#[derive(Debug, Clone)]
enum FileSource {
    Bytes(Arc<[u8]>),
    /// Read from disk when the upload is sent
    Path(PathBuf),
}

/// File contents plus metadata
#[derive(Debug, Clone)]
pub struct FilePayload {
    pub meta: FileMeta,
    source: FileSource,
}

impl FilePayload {
    /// Payload whose bytes are already in memory
    pub fn new(meta: FileMeta, data: Vec<u8>) -> Self {
        Self {
            meta,
            source: FileSource::Bytes(data.into()),
        }
    }

    /// Payload backed by a file on disk; nothing is read until [`Self::read`]
    pub fn from_path(meta: FileMeta, path: impl Into<PathBuf>) -> Self {
        Self {
            meta,
            source: FileSource::Path(path.into()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.source {
            FileSource::Path(path) => Some(path),
            FileSource::Bytes(_) => None,
        }
    }

    /// The file's bytes, read from disk for path-backed payloads
    pub async fn read(&self) -> Result<Arc<[u8]>> {
        match &self.source {
            FileSource::Bytes(data) => Ok(data.clone()),
            FileSource::Path(path) => Ok(tokio::fs::read(path).await?.into()),
        }
    }
}

/// What a task still holds of its file
#[derive(Debug, Clone)]
pub enum FileRef {
    Payload(FilePayload),
    MetadataOnly(FileMeta),
}

impl FileRef {
    pub fn meta(&self) -> &FileMeta {
        match self {
            FileRef::Payload(payload) => &payload.meta,
            FileRef::MetadataOnly(meta) => meta,
        }
    }

    pub fn payload(&self) -> Option<&FilePayload> {
        match self {
            FileRef::Payload(payload) => Some(payload),
            FileRef::MetadataOnly(_) => None,
        }
    }

    pub fn has_payload(&self) -> bool {
        matches!(self, FileRef::Payload(_))
    }

    /// Drop the bytes, keep the metadata
    pub fn release(&mut self) {
        if let FileRef::Payload(payload) = self {
            *self = FileRef::MetadataOnly(payload.meta.clone());
        }
    }
}

/// Result of feeding a status observation to a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// Status or progress changed
    Changed,
    /// Nothing new, or the task is already terminal
    Ignored,
}

/// One file being uploaded to one project
#[derive(Debug, Clone)]
pub struct UploadTask {
    key: TaskKey,
    client_id: String,
    server_id: Option<String>,
    project_id: String,
    file: FileRef,
    status: TaskStatus,
    progress: u8,
    retry_count: u32,
    error: Option<String>,
    created_at: DateTime<Utc>,
    attempt: u32,
}

impl UploadTask {
    /// Create a task for a freshly accepted file
    pub fn new(key: TaskKey, project_id: impl Into<String>, payload: FilePayload) -> Self {
        Self {
            key,
            client_id: new_client_id(),
            server_id: None,
            project_id: project_id.into(),
            file: FileRef::Payload(payload),
            status: TaskStatus::Pending,
            progress: 0,
            retry_count: 0,
            error: None,
            created_at: Utc::now(),
            attempt: 0,
        }
    }

    /// Rebuild a task from persisted state; the payload is never persisted
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn restore(
        key: TaskKey,
        client_id: String,
        server_id: Option<String>,
        project_id: String,
        meta: FileMeta,
        status: TaskStatus,
        progress: u8,
        retry_count: u32,
        error: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            key,
            client_id,
            server_id,
            project_id,
            file: FileRef::MetadataOnly(meta),
            status,
            progress: progress.min(100),
            retry_count,
            error,
            created_at,
            attempt: 1,
        }
    }

    pub fn key(&self) -> TaskKey {
        self.key
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn server_id(&self) -> Option<&str> {
        self.server_id.as_deref()
    }

    /// The id the outside world knows this task by
    pub fn external_id(&self) -> &str {
        self.server_id.as_deref().unwrap_or(&self.client_id)
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn file(&self) -> &FileRef {
        &self.file
    }

    pub fn filename(&self) -> &str {
        &self.file.meta().name
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Dispatch attempt number; results from older attempts are stale
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Start a new transfer. Valid from `pending`, or from `failed` when the
    /// payload is still held.
    pub fn begin_attempt(&mut self) -> Result<u32> {
        match self.status {
            TaskStatus::Pending => {}
            TaskStatus::Failed if self.file.has_payload() => {}
            other => {
                return Err(UploadError::invalid_state(format!(
                    "task {} cannot start an upload from {}",
                    self.key, other
                )))
            }
        }

        self.status = TaskStatus::Uploading;
        self.progress = 0;
        self.error = None;
        self.server_id = None;
        self.attempt += 1;
        Ok(self.attempt)
    }

    /// The server accepted the transfer and issued a task id
    pub fn accept(&mut self, server_id: impl Into<String>, status: TaskStatus) -> Result<()> {
        if self.status != TaskStatus::Uploading {
            return Err(UploadError::invalid_state(format!(
                "task {} accepted while {}",
                self.key, self.status
            )));
        }

        self.server_id = Some(server_id.into());
        self.status = if status == TaskStatus::Processing {
            TaskStatus::Processing
        } else {
            TaskStatus::Queued
        };
        Ok(())
    }

    /// Apply a non-terminal status report. Progress never moves backwards.
    pub fn observe(&mut self, status: TaskStatus, progress: u8) -> Observation {
        if !self.status.is_server_side() || !status.is_server_side() {
            return Observation::Ignored;
        }

        let progress = progress.min(100).max(self.progress);
        if progress == self.progress && status == self.status {
            return Observation::Ignored;
        }

        self.status = status;
        self.progress = progress;
        Observation::Changed
    }

    pub fn complete(&mut self) -> Result<()> {
        if !self.status.is_in_flight() {
            return Err(UploadError::invalid_state(format!(
                "task {} completed while {}",
                self.key, self.status
            )));
        }

        self.status = TaskStatus::Completed;
        self.progress = 100;
        self.error = None;
        self.file.release();
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>) -> Result<()> {
        if !self.status.is_in_flight() {
            return Err(UploadError::invalid_state(format!(
                "task {} failed while {}",
                self.key, self.status
            )));
        }

        self.status = TaskStatus::Failed;
        self.error = Some(error.into());
        Ok(())
    }

    /// Whether a failed task may go back to the retry queue
    pub fn can_retry(&self, max_retry_attempts: u32) -> bool {
        self.status == TaskStatus::Failed
            && self.retry_count < max_retry_attempts
            && self.file.has_payload()
    }

    /// Count one more retry; caller has checked [`Self::can_retry`]
    pub(crate) fn mark_for_retry(&mut self) {
        self.retry_count += 1;
    }

    /// Drop the raw bytes once the task can no longer be retried
    pub(crate) fn release_payload(&mut self) {
        self.file.release();
    }
}

pub(crate) fn new_client_id() -> String {
    format!("client-{}", uuid::Uuid::new_v4())
}

/// Client ids are generated locally and carry a fixed prefix
pub fn is_client_id(id: &str) -> bool {
    id.starts_with("client-")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(name: &str) -> FilePayload {
        FilePayload::new(FileMeta::new(name, 3, "image/png"), vec![1, 2, 3])
    }

    fn task() -> UploadTask {
        UploadTask::new(TaskKey::new(1), "project-a", payload("cat.png"))
    }

    #[test]
    fn test_happy_path() {
        let mut task = task();
        assert_eq!(task.status(), TaskStatus::Pending);
        assert!(is_client_id(task.external_id()));

        assert_eq!(task.begin_attempt().unwrap(), 1);
        assert_eq!(task.status(), TaskStatus::Uploading);

        task.accept("srv-1", TaskStatus::Queued).unwrap();
        assert_eq!(task.external_id(), "srv-1");
        assert_eq!(task.status(), TaskStatus::Queued);

        assert_eq!(task.observe(TaskStatus::Processing, 50), Observation::Changed);
        task.complete().unwrap();
        assert_eq!(task.status(), TaskStatus::Completed);
        assert_eq!(task.progress(), 100);
        assert!(!task.file().has_payload());
        assert_eq!(task.filename(), "cat.png");
    }

    #[test]
    fn test_progress_is_monotonic() {
        let mut task = task();
        task.begin_attempt().unwrap();
        task.accept("srv-1", TaskStatus::Queued).unwrap();

        task.observe(TaskStatus::Processing, 80);
        assert_eq!(task.observe(TaskStatus::Processing, 10), Observation::Ignored);
        assert_eq!(task.progress(), 80);

        task.observe(TaskStatus::Processing, 250);
        assert_eq!(task.progress(), 100);
    }

    #[test]
    fn test_terminal_tasks_ignore_updates() {
        let mut task = task();
        task.begin_attempt().unwrap();
        task.accept("srv-1", TaskStatus::Queued).unwrap();
        task.complete().unwrap();

        assert_eq!(task.observe(TaskStatus::Processing, 10), Observation::Ignored);
        assert!(task.fail("late failure").is_err());
        assert_eq!(task.status(), TaskStatus::Completed);
    }

    #[test]
    fn test_retry_requires_payload_and_budget() {
        let mut task = task();
        task.begin_attempt().unwrap();
        task.fail("connection reset").unwrap();
        assert!(task.can_retry(3));

        task.mark_for_retry();
        assert_eq!(task.begin_attempt().unwrap(), 2);
        assert!(task.server_id().is_none());
        task.fail("connection reset").unwrap();

        task.mark_for_retry();
        task.mark_for_retry();
        assert_eq!(task.retry_count(), 3);
        assert!(!task.can_retry(3));

        let mut other = UploadTask::new(TaskKey::new(2), "p", payload("dog.png"));
        other.begin_attempt().unwrap();
        other.fail("boom").unwrap();
        other.release_payload();
        assert!(!other.can_retry(3));
        assert!(other.begin_attempt().is_err());
    }

    #[test]
    fn test_accept_requires_uploading() {
        let mut task = task();
        assert!(task.accept("srv-1", TaskStatus::Queued).is_err());
    }

    #[tokio::test]
    async fn test_path_payload_reads_at_send_time() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("late.png");
        std::fs::write(&path, b"v1").unwrap();

        let payload = FilePayload::from_path(FileMeta::new("late.png", 2, "image/png"), &path);
        assert_eq!(payload.path(), Some(path.as_path()));

        std::fs::write(&path, b"v2!").unwrap();
        assert_eq!(&*payload.read().await.unwrap(), b"v2!");

        std::fs::remove_file(&path).unwrap();
        assert!(matches!(payload.read().await, Err(UploadError::Io(_))));
        assert_eq!(&*self::payload("cat.png").read().await.unwrap(), &[1, 2, 3]);
    }

    #[test]
    fn test_status_wire_parsing() {
        assert_eq!(TaskStatus::from_wire("Processing"), Some(TaskStatus::Processing));
        assert_eq!(TaskStatus::from_wire(" completed "), Some(TaskStatus::Completed));
        assert_eq!(TaskStatus::from_wire("exploded"), None);
    }
}
