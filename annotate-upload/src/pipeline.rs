//! Upload pipeline core
//!
//! [`UploadPipeline`] holds all queue state and makes every decision, but
//! performs no I/O. Callers feed it [`Input`]s together with the current
//! time and run the returned [`Action`]s; results come back later as new
//! inputs. Between inputs, [`UploadPipeline::next_deadline`] says when
//! [`UploadPipeline::tick`] has to run for timers (ingest ticks, stall
//! detection, polls, admission retries, sweeping).
//!
//! Push notifications and poll responses both end up in the same status
//! transition, so the two sources can never disagree about a task.

use crate::api::{PendingUpload, ProjectCounts, StatusReport, UploadAccepted};
use crate::config::PipelineConfig;
use crate::files::is_image;
use crate::gate::{Admission, ConcurrencyGate};
use crate::progress::{ProgressAggregator, ProgressInputs};
use crate::push::{PushEvent, PushMessage};
use crate::queue::{BatchCounters, ProjectUploadQueue};
use crate::reconciler::CountsSource;
use crate::registry::UploadRegistry;
use crate::store::{keep_newest, PersistedUpload, PersistedUploads, PersistentStore, SaveOutcome};
use crate::task::{
    is_client_id, new_client_id, FileMeta, FilePayload, Observation, TaskKey, TaskStatus,
    UploadTask,
};
use crate::tracker::{Phase, PollFailure, StatusTracker, TrackerDue};
use crate::{Result, UploadError};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Push events for ids that are not known yet, kept until the upload
/// response for that id arrives
const MAX_UNMATCHED_EVENTS: usize = 64;

const RESTART_INTERRUPTED: &str = "Upload interrupted by restart";

/// Something that happened outside the pipeline
#[derive(Debug)]
pub enum Input {
    /// Add files to a project's queue
    Enqueue {
        project_id: String,
        files: Vec<FilePayload>,
    },
    /// Rebuild a project's state from persistence and the server's pending list
    Restore {
        project_id: String,
        server_pending: Vec<PendingUpload>,
    },
    /// The upload request of `attempt` finished
    DispatchResult {
        key: TaskKey,
        attempt: u32,
        result: Result<UploadAccepted>,
    },
    /// The status poll issued during `attempt` finished
    PollResult {
        key: TaskKey,
        attempt: u32,
        result: Result<StatusReport>,
    },
    Push(PushMessage),
}

/// I/O the caller has to perform
#[derive(Debug, Clone)]
pub enum Action {
    /// Upload the file; answer with [`Input::DispatchResult`]
    Dispatch {
        key: TaskKey,
        attempt: u32,
        project_id: String,
        file: FilePayload,
    },
    /// Fetch the task's status; answer with [`Input::PollResult`]
    PollStatus {
        key: TaskKey,
        attempt: u32,
        project_id: String,
        task_id: String,
    },
    /// Ask the count reconciler for fresh counts
    RefreshCounts {
        project_id: String,
        local: ProjectCounts,
    },
}

/// Notifications for observers
#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    TaskQueued {
        project_id: String,
        task_id: String,
        filename: String,
    },
    TaskStatusChanged {
        project_id: String,
        task_id: String,
        status: TaskStatus,
        progress: u8,
    },
    TaskCompleted {
        project_id: String,
        task_id: String,
        filename: String,
        image_info: Option<serde_json::Value>,
    },
    TaskFailed {
        project_id: String,
        task_id: String,
        filename: String,
        error: String,
        will_retry: bool,
    },
    Progress {
        project_id: String,
        percent: u8,
        counters: BatchCounters,
        status_line: String,
        queued_line: Option<String>,
    },
    BatchFinished {
        project_id: String,
        counters: BatchCounters,
    },
    CountsUpdated {
        project_id: String,
        counts: ProjectCounts,
        source: CountsSource,
    },
}

/// Output of one pipeline step
#[derive(Debug, Default)]
pub struct Step {
    pub actions: Vec<Action>,
    pub events: Vec<UploadEvent>,
}

impl Step {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty() && self.events.is_empty()
    }
}

/// A status report from either push or poll
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: TaskStatus,
    pub progress: u8,
    pub error: Option<String>,
    pub image_info: Option<serde_json::Value>,
}

impl From<StatusReport> for StatusUpdate {
    fn from(report: StatusReport) -> Self {
        Self {
            status: report.status,
            progress: report.progress,
            error: report.error,
            image_info: report.image_info,
        }
    }
}

impl From<PushEvent> for StatusUpdate {
    fn from(event: PushEvent) -> Self {
        match event {
            PushEvent::Progress {
                status, progress, ..
            } => Self {
                status,
                progress,
                error: None,
                image_info: None,
            },
            PushEvent::Completed { image_info, .. } => Self {
                status: TaskStatus::Completed,
                progress: 100,
                error: None,
                image_info,
            },
            PushEvent::Failed { error, .. } => Self {
                status: TaskStatus::Failed,
                progress: 0,
                error: Some(error),
                image_info: None,
            },
        }
    }
}

/// One task as shown to users
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub filename: String,
    pub status: TaskStatus,
    pub progress: u8,
    pub retry_count: u32,
    pub error: Option<String>,
}

impl From<&UploadTask> for TaskSnapshot {
    fn from(task: &UploadTask) -> Self {
        Self {
            task_id: task.external_id().to_string(),
            filename: task.filename().to_string(),
            status: task.status(),
            progress: task.progress(),
            retry_count: task.retry_count(),
            error: task.error().map(str::to_string),
        }
    }
}

/// Queue state of one project
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectSnapshot {
    pub project_id: String,
    pub counters: BatchCounters,
    pub percent: u8,
    pub status_line: String,
    pub queued_line: Option<String>,
    pub batch_active: bool,
    pub tasks: Vec<TaskSnapshot>,
}

pub struct UploadPipeline {
    config: PipelineConfig,
    registry: UploadRegistry,
    gate: ConcurrencyGate,
    tracker: StatusTracker,
    progress: ProgressAggregator,
    store: PersistentStore,
    /// Last persisted records per project, including swept tasks
    persisted: HashMap<String, PersistedUploads>,
    /// Tasks at or below this key belong to an earlier batch and are no
    /// longer persisted
    batch_floor: HashMap<String, TaskKey>,
    queues: HashMap<String, ProjectUploadQueue>,
    /// Projects waiting for admission, first come first served
    admission_order: VecDeque<String>,
    next_admission: Option<Instant>,
    next_ingest: HashMap<String, Instant>,
    next_refresh: HashMap<String, Instant>,
    unmatched: VecDeque<PushEvent>,
    step: Step,
}

impl UploadPipeline {
    pub fn new(config: PipelineConfig, store: PersistentStore) -> Self {
        Self {
            registry: UploadRegistry::new(),
            gate: ConcurrencyGate::new(config.gate.clone()),
            tracker: StatusTracker::new(config.tracker.clone()),
            progress: ProgressAggregator::new(),
            store,
            persisted: HashMap::new(),
            batch_floor: HashMap::new(),
            queues: HashMap::new(),
            admission_order: VecDeque::new(),
            next_admission: None,
            next_ingest: HashMap::new(),
            next_refresh: HashMap::new(),
            unmatched: VecDeque::new(),
            step: Step::default(),
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Apply one input, then run whatever became due
    pub fn handle(&mut self, input: Input, now: Instant) -> Step {
        match input {
            Input::Enqueue { project_id, files } => self.enqueue(&project_id, files, now),
            Input::Restore {
                project_id,
                server_pending,
            } => self.restore(&project_id, server_pending, now),
            Input::DispatchResult {
                key,
                attempt,
                result,
            } => self.on_dispatch_result(key, attempt, result, now),
            Input::PollResult {
                key,
                attempt,
                result,
            } => self.on_poll_result(key, attempt, result, now),
            Input::Push(message) => self.on_push(message, now),
        }
        self.run_due(now);
        std::mem::take(&mut self.step)
    }

    /// Run timers that are due at `now`
    pub fn tick(&mut self, now: Instant) -> Step {
        self.run_due(now);
        std::mem::take(&mut self.step)
    }

    /// When [`Self::tick`] has to run next
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.next_admission,
            self.registry.next_removal(),
            self.tracker.next_deadline(),
            self.next_ingest.values().min().copied(),
            self.next_refresh.values().min().copied(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Uploads holding a slot, across all projects
    pub fn in_flight_count(&self) -> usize {
        self.gate.in_flight_count()
    }

    /// Any project with unfinished work
    pub fn has_active_batches(&self) -> bool {
        self.queues.values().any(|q| q.is_batch_active())
    }

    pub fn projects(&self) -> Vec<String> {
        let mut projects: Vec<String> = self.queues.keys().cloned().collect();
        projects.sort();
        projects
    }

    pub fn snapshot(&self, project_id: &str) -> Option<ProjectSnapshot> {
        let queue = self.queues.get(project_id)?;
        Some(ProjectSnapshot {
            project_id: project_id.to_string(),
            counters: queue.counters(),
            percent: self.progress.last(project_id),
            status_line: queue.status_line(),
            queued_line: queue.queued_line(),
            batch_active: queue.is_batch_active(),
            tasks: self
                .registry
                .project_tasks(project_id)
                .into_iter()
                .map(TaskSnapshot::from)
                .collect(),
        })
    }

    /// Look up a task by client or server id
    pub fn task(&self, id: &str) -> Option<&UploadTask> {
        self.registry.resolve(id).and_then(|key| self.registry.get(key))
    }

    fn run_due(&mut self, now: Instant) {
        for task in self.registry.sweep(now) {
            debug!("Removed {} ({}) from memory", task.external_id(), task.status());
        }

        let mut ingest: Vec<String> = self
            .next_ingest
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(project, _)| project.clone())
            .collect();
        ingest.sort();
        for project in ingest {
            self.ingest(&project, now);
        }

        for due in self.tracker.due(now) {
            match due {
                TrackerDue::Stalled(key) => self.stall(key, now),
                TrackerDue::Poll(key) => self.request_poll(key, now),
            }
        }

        let mut refresh: Vec<String> = self
            .next_refresh
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(project, _)| project.clone())
            .collect();
        refresh.sort();
        for project in refresh {
            self.request_counts(&project);
            let active = self
                .queues
                .get(&project)
                .map_or(false, |q| q.is_batch_active());
            if active {
                let next = now + self.config.reconciler.periodic_interval();
                self.next_refresh.insert(project, next);
            } else {
                self.next_refresh.remove(&project);
            }
        }

        if self.next_admission.map_or(false, |at| at <= now) {
            self.pump(now);
        }
    }

    fn enqueue(&mut self, project_id: &str, files: Vec<FilePayload>, now: Instant) {
        let (files, skipped): (Vec<FilePayload>, Vec<FilePayload>) =
            files.into_iter().partition(|file| is_image(&file.meta));
        for file in &skipped {
            warn!(
                "Skipping {} ({}) for project {}: not an image",
                file.meta.name, file.meta.mime_type, project_id
            );
        }

        let queue = self
            .queues
            .entry(project_id.to_string())
            .or_insert_with(|| ProjectUploadQueue::new(project_id));
        let new_batch = !queue.is_batch_active() && queue.is_idle();
        let count = queue.enqueue(files);
        if count == 0 {
            return;
        }

        if new_batch {
            self.start_batch(project_id);
            let next = now + self.config.reconciler.periodic_interval();
            self.next_refresh.insert(project_id.to_string(), next);
        }

        info!("Queued {} files for upload to project {}", count, project_id);
        self.next_ingest.entry(project_id.to_string()).or_insert(now);
        self.emit_progress(project_id);
    }

    /// Forget the finished batch, so a restart only restores the new one
    fn start_batch(&mut self, project_id: &str) {
        self.progress.reset(project_id);
        self.batch_floor
            .insert(project_id.to_string(), self.registry.last_key());

        let store = &self.store;
        let records = self
            .persisted
            .entry(project_id.to_string())
            .or_insert_with(|| store.load(project_id));
        let before = records.len();
        records.retain(|_, record| !record.status.is_terminal());
        if records.len() < before {
            debug!(
                "Dropped {} finished upload(s) of the previous batch for {}",
                before - records.len(),
                project_id
            );
        }
    }

    /// Move one sub-batch of staged files into the pending queue
    fn ingest(&mut self, project_id: &str, now: Instant) {
        let Some(queue) = self.queues.get_mut(project_id) else {
            self.next_ingest.remove(project_id);
            return;
        };

        let batch = queue.take_ingest_batch(self.config.queue.ingest_batch_size);
        for payload in batch {
            let filename = payload.meta.name.clone();
            let key = self.registry.create(project_id, payload);
            queue.push_pending(key);

            let task_id = self
                .registry
                .get(key)
                .map(|t| t.external_id().to_string())
                .unwrap_or_default();
            self.step.events.push(UploadEvent::TaskQueued {
                project_id: project_id.to_string(),
                task_id,
                filename,
            });
        }

        if queue.has_staged() {
            let next = now + self.config.queue.ingest_interval();
            self.next_ingest.insert(project_id.to_string(), next);
        } else {
            self.next_ingest.remove(project_id);
        }

        self.mark_waiting(project_id);
        self.persist(project_id);
        self.emit_progress(project_id);
        self.pump(now);
    }

    fn mark_waiting(&mut self, project_id: &str) {
        if !self.admission_order.iter().any(|p| p == project_id) {
            self.admission_order.push_back(project_id.to_string());
        }
    }

    /// Admit as many tasks as the gate allows
    fn pump(&mut self, now: Instant) {
        self.next_admission = None;

        let mut index = 0;
        while index < self.admission_order.len() {
            let project = self.admission_order[index].clone();
            let (waiting, ready) = match self.queues.get(&project) {
                Some(queue) => (
                    queue.pending_len() + queue.failed_retry_len() > 0,
                    queue.peek_next().is_some(),
                ),
                None => (false, false),
            };

            if !waiting {
                self.admission_order.remove(index);
                continue;
            }
            if !ready {
                index += 1;
                continue;
            }

            match self.gate.admit(&project, now) {
                Admission::Granted => {
                    self.admission_order.remove(index);
                    self.dispatch(&project, now);
                    let still_waiting = self
                        .queues
                        .get(&project)
                        .map_or(false, |q| q.pending_len() + q.failed_retry_len() > 0);
                    if still_waiting {
                        self.admission_order.push_back(project);
                    }
                    index = 0;
                }
                Admission::ProjectBusy => index += 1,
                Admission::Defer(wait) | Admission::AtCapacity(wait) => {
                    self.next_admission = Some(now + wait);
                    return;
                }
            }
        }
    }

    fn dispatch(&mut self, project_id: &str, now: Instant) {
        let Some(queue) = self.queues.get_mut(project_id) else {
            return;
        };
        let Some((key, source)) = queue.start_next() else {
            return;
        };

        let previous_id = self
            .registry
            .get(key)
            .and_then(|t| t.server_id().map(str::to_string));
        let attempt = match self.registry.begin_attempt(key) {
            Ok(attempt) => attempt,
            Err(e) => {
                error!("Cannot dispatch {}: {}", key, e);
                queue.finish(key);
                queue.record_failed();
                return;
            }
        };
        if let Some(previous_id) = previous_id {
            self.forget_persisted(project_id, &previous_id);
        }

        self.gate.record_dispatch(project_id, key, now);
        self.tracker.arm_upload(key, now);

        let Some(task) = self.registry.get(key) else {
            return;
        };
        let Some(file) = task.file().payload().cloned() else {
            self.fail_task(key, "File contents no longer available".to_string(), now);
            return;
        };

        info!(
            "Uploading {} to project {} (attempt {}, from {:?})",
            task.filename(),
            project_id,
            attempt,
            source
        );
        self.step.events.push(UploadEvent::TaskStatusChanged {
            project_id: project_id.to_string(),
            task_id: task.external_id().to_string(),
            status: TaskStatus::Uploading,
            progress: 0,
        });
        self.step.actions.push(Action::Dispatch {
            key,
            attempt,
            project_id: project_id.to_string(),
            file,
        });

        self.persist(project_id);
        self.emit_progress(project_id);
    }

    fn on_dispatch_result(
        &mut self,
        key: TaskKey,
        attempt: u32,
        result: Result<UploadAccepted>,
        now: Instant,
    ) {
        let Some(task) = self.registry.get(key) else {
            debug!("Upload result for unknown task {}", key);
            return;
        };
        if task.attempt() != attempt || task.status() != TaskStatus::Uploading {
            debug!(
                "Discarding stale upload result for {} (attempt {}, now {} in attempt {})",
                key,
                attempt,
                task.status(),
                task.attempt()
            );
            return;
        }

        let project_id = task.project_id().to_string();
        let filename = task.filename().to_string();

        match result {
            Ok(accepted) => {
                if let Err(e) = self.registry.accept(key, &accepted.task_id, accepted.status) {
                    warn!("Could not record server id for {}: {}", key, e);
                    return;
                }
                self.tracker.arm_processing(key, now, false);
                info!(
                    "Server accepted {} for project {} as task {}",
                    filename, project_id, accepted.task_id
                );

                let (status, progress) = self
                    .registry
                    .get(key)
                    .map_or((accepted.status, 0), |t| (t.status(), t.progress()));
                self.step.events.push(UploadEvent::TaskStatusChanged {
                    project_id: project_id.clone(),
                    task_id: accepted.task_id.clone(),
                    status,
                    progress,
                });
                self.persist(&project_id);
                self.emit_progress(&project_id);
                self.replay_unmatched(&accepted.task_id, now);
            }
            Err(e) => {
                warn!("Upload of {} to project {} failed: {}", filename, project_id, e);
                self.fail_task(key, e.user_message(), now);
            }
        }
    }

    fn request_poll(&mut self, key: TaskKey, now: Instant) {
        let Some(task) = self.registry.get(key) else {
            self.tracker.clear(key);
            return;
        };
        let Some(server_id) = task.server_id() else {
            self.tracker.poll_succeeded(key, now);
            return;
        };

        self.step.actions.push(Action::PollStatus {
            key,
            attempt: task.attempt(),
            project_id: task.project_id().to_string(),
            task_id: server_id.to_string(),
        });
    }

    fn on_poll_result(
        &mut self,
        key: TaskKey,
        attempt: u32,
        result: Result<StatusReport>,
        now: Instant,
    ) {
        let current = self
            .registry
            .get(key)
            .map_or(false, |t| t.attempt() == attempt && t.status().is_server_side());
        if !current {
            debug!("Discarding stale poll result for {}", key);
            return;
        }

        match result {
            Ok(report) => {
                if !report.status.is_terminal() {
                    self.tracker.poll_succeeded(key, now);
                }
                self.apply_status(key, report.into(), now);
            }
            Err(e) => match self.tracker.poll_failed(key, now) {
                PollFailure::Retry(at) => {
                    debug!("Status poll for {} failed ({}), next poll in {:?}", key, e, at - now);
                }
                PollFailure::Exhausted => {
                    warn!("Status polls for {} keep failing: {}", key, e);
                    self.tracker.clear(key);
                    let message = UploadError::Stalled(format!(
                        "status unavailable after {} polls",
                        self.config.tracker.max_poll_failures
                    ))
                    .user_message();
                    self.fail_task(key, message, now);
                }
            },
        }
    }

    fn on_push(&mut self, message: PushMessage, now: Instant) {
        match message {
            PushMessage::Connected => {
                let repoll = self.tracker.set_push_connected(true, now);
                debug!("Re-polling {} tasks after reconnect", repoll.len());
                let mut projects: Vec<String> = self
                    .queues
                    .iter()
                    .filter(|(_, q)| q.is_batch_active())
                    .map(|(p, _)| p.clone())
                    .collect();
                projects.sort();
                for project in projects {
                    self.request_counts(&project);
                }
            }
            PushMessage::Disconnected => {
                self.tracker.set_push_connected(false, now);
            }
            PushMessage::Event(event) => match self.registry.resolve(event.task_id()) {
                Some(key) => self.apply_status(key, event.into(), now),
                None => {
                    debug!("Holding push event for unknown task {}", event.task_id());
                    if self.unmatched.len() >= MAX_UNMATCHED_EVENTS {
                        self.unmatched.pop_front();
                    }
                    self.unmatched.push_back(event);
                }
            },
        }
    }

    fn replay_unmatched(&mut self, task_id: &str, now: Instant) {
        let (matched, rest): (VecDeque<PushEvent>, VecDeque<PushEvent>) = self
            .unmatched
            .drain(..)
            .partition(|event| event.task_id() == task_id);
        self.unmatched = rest;

        for event in matched {
            if let Some(key) = self.registry.resolve(task_id) {
                self.apply_status(key, event.into(), now);
            }
        }
    }

    /// The single status transition shared by push and poll
    fn apply_status(&mut self, key: TaskKey, update: StatusUpdate, now: Instant) {
        let Some(task) = self.registry.get_mut(key) else {
            return;
        };
        if !task.status().is_in_flight() {
            debug!(
                "Ignoring {} report for {} task {}",
                update.status,
                task.status(),
                key
            );
            return;
        }

        match update.status {
            TaskStatus::Completed => self.complete_task(key, update.image_info, now),
            TaskStatus::Failed => {
                let error = update
                    .error
                    .unwrap_or_else(|| "Processing failed on the server".to_string());
                self.fail_task(key, error, now);
            }
            TaskStatus::Queued | TaskStatus::Processing => {
                if task.observe(update.status, update.progress) == Observation::Changed {
                    let project_id = task.project_id().to_string();
                    self.step.events.push(UploadEvent::TaskStatusChanged {
                        project_id: project_id.clone(),
                        task_id: task.external_id().to_string(),
                        status: task.status(),
                        progress: task.progress(),
                    });
                    self.persist(&project_id);
                    self.emit_progress(&project_id);
                }
            }
            TaskStatus::Pending | TaskStatus::Uploading => {}
        }
    }

    fn stall(&mut self, key: TaskKey, now: Instant) {
        let timeout = match self.tracker.phase(key) {
            Some(Phase::Upload) => self.config.tracker.upload_timeout(),
            _ => self.config.tracker.processing_timeout(),
        };
        self.tracker.clear(key);

        let error = UploadError::Stalled(format!("no response within {}s", timeout.as_secs()));
        if let Some(task) = self.registry.get(key) {
            warn!("{} for project {} stalled", task.filename(), task.project_id());
        }
        self.fail_task(key, error.user_message(), now);
    }

    fn complete_task(&mut self, key: TaskKey, image_info: Option<serde_json::Value>, now: Instant) {
        let Some(task) = self.registry.get_mut(key) else {
            return;
        };
        if let Err(e) = task.complete() {
            debug!("{}", e);
            return;
        }

        let project_id = task.project_id().to_string();
        info!("{} uploaded to project {}", task.filename(), project_id);
        self.step.events.push(UploadEvent::TaskCompleted {
            project_id: project_id.clone(),
            task_id: task.external_id().to_string(),
            filename: task.filename().to_string(),
            image_info,
        });

        self.tracker.clear(key);
        self.gate.release(&project_id, key);
        if let Some(queue) = self.queues.get_mut(&project_id) {
            queue.finish(key);
            queue.record_completed();
        }
        self.registry
            .schedule_removal(key, now + self.config.queue.removal_delay());
        self.finish_transition(&project_id, now);
    }

    /// Fail an in-flight task, sending it to the retry queue when allowed
    fn fail_task(&mut self, key: TaskKey, error: String, now: Instant) {
        let max_retries = self.config.queue.max_retry_attempts;
        let Some(task) = self.registry.get_mut(key) else {
            return;
        };
        if let Err(e) = task.fail(error.clone()) {
            debug!("{}", e);
            return;
        }

        let will_retry = task.can_retry(max_retries);
        if will_retry {
            task.mark_for_retry();
        } else {
            task.release_payload();
        }

        let project_id = task.project_id().to_string();
        warn!(
            "{} for project {} failed (retry {}/{}): {}",
            task.filename(),
            project_id,
            task.retry_count(),
            max_retries,
            error
        );
        self.step.events.push(UploadEvent::TaskFailed {
            project_id: project_id.clone(),
            task_id: task.external_id().to_string(),
            filename: task.filename().to_string(),
            error,
            will_retry,
        });

        self.tracker.clear(key);
        self.gate.release(&project_id, key);
        if let Some(queue) = self.queues.get_mut(&project_id) {
            queue.finish(key);
            if will_retry {
                queue.push_retry(key);
            } else {
                queue.record_failed();
            }
        }

        if will_retry {
            self.mark_waiting(&project_id);
        } else {
            self.registry
                .schedule_removal(key, now + self.config.queue.removal_delay());
        }
        self.finish_transition(&project_id, now);
    }

    /// Common tail of terminal transitions
    fn finish_transition(&mut self, project_id: &str, now: Instant) {
        self.persist(project_id);
        self.emit_progress(project_id);

        let finished = self
            .queues
            .get_mut(project_id)
            .map_or(false, |q| q.try_finish_batch());
        if finished {
            let counters = self
                .queues
                .get(project_id)
                .map(|q| q.counters())
                .unwrap_or_default();
            info!(
                "Upload batch for project {} finished: {} completed, {} failed of {}",
                project_id, counters.completed, counters.failed, counters.total_files
            );
            self.step.events.push(UploadEvent::BatchFinished {
                project_id: project_id.to_string(),
                counters,
            });
            self.next_refresh.remove(project_id);
            self.request_counts(project_id);
        }

        self.pump(now);
    }

    fn request_counts(&mut self, project_id: &str) {
        let completed = self
            .queues
            .get(project_id)
            .map_or(0, |q| q.counters().completed);
        self.step.actions.push(Action::RefreshCounts {
            project_id: project_id.to_string(),
            local: ProjectCounts::local(completed as u64),
        });
    }

    fn emit_progress(&mut self, project_id: &str) {
        let Some(queue) = self.queues.get(project_id) else {
            return;
        };

        let counters = queue.counters();
        let in_flight = queue.in_flight();
        let inputs = ProgressInputs {
            total_files: counters.total_files,
            done: counters.done(),
            in_flight: usize::from(in_flight.is_some()),
            pending: queue.pending_len(),
            failed_retry: queue.failed_retry_len(),
            staged: queue.staged_len(),
            in_flight_progress: in_flight
                .and_then(|key| self.registry.get(key))
                .map(|task| task.progress()),
        };
        let percent = self.progress.report(project_id, inputs);

        self.step.events.push(UploadEvent::Progress {
            project_id: project_id.to_string(),
            percent,
            counters,
            status_line: queue.status_line(),
            queued_line: queue.queued_line(),
        });
    }

    /// Write the project's live tasks on top of what was persisted before
    fn persist(&mut self, project_id: &str) {
        let store = &self.store;
        let records = self
            .persisted
            .entry(project_id.to_string())
            .or_insert_with(|| store.load(project_id));

        let floor = self.batch_floor.get(project_id).copied();
        for task in self.registry.project_tasks(project_id) {
            if floor.map_or(false, |floor| task.key() <= floor) {
                continue;
            }
            if task.server_id().is_some() {
                records.remove(task.client_id());
            }
            records.insert(task.external_id().to_string(), PersistedUpload::from(task));
        }

        let capped = keep_newest(std::mem::take(records), self.config.store.max_stored_tasks);
        *records = capped.clone();

        match self.store.save(project_id, capped) {
            SaveOutcome::Truncated { .. } => {
                let reloaded = self.store.load(project_id);
                self.persisted.insert(project_id.to_string(), reloaded);
            }
            _ => {}
        }
    }

    fn forget_persisted(&mut self, project_id: &str, id: &str) {
        if let Some(records) = self.persisted.get_mut(project_id) {
            records.remove(id);
        }
    }

    /// Rebuild a project after a restart
    ///
    /// Tasks the server already accepted are tracked again (one per project,
    /// the rest of the batch is lost with its payloads). Tasks that never got
    /// a server id failed with the restart.
    fn restore(&mut self, project_id: &str, server_pending: Vec<PendingUpload>, now: Instant) {
        let idle = self.queues.get(project_id).map_or(true, |q| q.is_idle());
        if !idle {
            warn!("Project {} already has uploads queued, not restoring", project_id);
            return;
        }

        let mut records = self.store.load(project_id);
        let mut ordered: Vec<(String, PersistedUpload)> =
            records.iter().map(|(id, r)| (id.clone(), r.clone())).collect();
        ordered.sort_by(|a, b| a.1.created.cmp(&b.1.created).then_with(|| a.0.cmp(&b.0)));

        let server_progress: HashMap<&str, u8> = server_pending
            .iter()
            .map(|p| (p.task_id.as_str(), p.progress))
            .collect();

        let mut counters = BatchCounters::default();
        let mut adopted = 0usize;

        for (id, record) in ordered {
            counters.total_files += 1;
            match record.status {
                TaskStatus::Completed => {
                    counters.completed += 1;
                    continue;
                }
                TaskStatus::Failed => {
                    counters.failed += 1;
                    continue;
                }
                _ => {}
            }

            let can_adopt = record.status.is_server_side()
                && !is_client_id(&id)
                && !self.project_in_flight(project_id);
            if can_adopt {
                let progress = server_progress
                    .get(id.as_str())
                    .map_or(record.progress, |p| (*p).max(record.progress));
                let meta = record
                    .file
                    .clone()
                    .unwrap_or_else(|| FileMeta::new(record.filename.clone(), 0, ""));
                self.adopt(
                    project_id,
                    id,
                    meta,
                    record.status,
                    progress,
                    record.retry_count,
                    record.created,
                    now,
                );
                adopted += 1;
            } else {
                warn!(
                    "{} for project {} was interrupted by the restart",
                    record.filename, project_id
                );
                counters.failed += 1;
                records.insert(
                    id,
                    PersistedUpload {
                        status: TaskStatus::Failed,
                        error: Some(RESTART_INTERRUPTED.to_string()),
                        file: None,
                        ..record
                    },
                );
            }
        }

        for pending in &server_pending {
            if records.contains_key(&pending.task_id) {
                continue;
            }
            let Some(status) = pending.server_status() else {
                continue;
            };
            if self.project_in_flight(project_id) {
                warn!(
                    "Server task {} for project {} left untracked, project already busy",
                    pending.task_id, project_id
                );
                continue;
            }

            let filename = pending
                .filename
                .clone()
                .unwrap_or_else(|| pending.task_id.clone());
            counters.total_files += 1;
            self.adopt(
                project_id,
                pending.task_id.clone(),
                FileMeta::new(filename, 0, ""),
                status,
                pending.progress,
                0,
                chrono::Utc::now(),
                now,
            );
            adopted += 1;
        }

        self.persisted.insert(project_id.to_string(), records);
        if adopted > 0 {
            info!(
                "Restored project {}: tracking {} server task(s), {}",
                project_id,
                adopted,
                format_counters(&counters)
            );
            if let Some(queue) = self.queues.get_mut(project_id) {
                queue.restore_counters(counters);
            }
            self.next_refresh.insert(
                project_id.to_string(),
                now + self.config.reconciler.periodic_interval(),
            );
        }

        self.persist(project_id);
        self.emit_progress(project_id);
        self.request_counts(project_id);
    }

    fn project_in_flight(&self, project_id: &str) -> bool {
        self.queues
            .get(project_id)
            .map_or(false, |q| q.in_flight().is_some())
    }

    #[allow(clippy::too_many_arguments)]
    fn adopt(
        &mut self,
        project_id: &str,
        server_id: String,
        meta: FileMeta,
        status: TaskStatus,
        progress: u8,
        retry_count: u32,
        created: chrono::DateTime<chrono::Utc>,
        now: Instant,
    ) {
        let key = self.registry.create_with(|key| {
            UploadTask::restore(
                key,
                new_client_id(),
                Some(server_id),
                project_id.to_string(),
                meta,
                status,
                progress,
                retry_count,
                None,
                created,
            )
        });

        // Tracked either way; past the cap it just runs without a slot
        if self.gate.in_flight_count() < self.config.gate.max_concurrent_uploads {
            self.gate.occupy(project_id, key);
        } else {
            warn!(
                "Restored task {} for project {} tracked without a slot, {} uploads in flight",
                key,
                project_id,
                self.gate.in_flight_count()
            );
        }
        self.queues
            .entry(project_id.to_string())
            .or_insert_with(|| ProjectUploadQueue::new(project_id))
            .adopt_in_flight(key);
        self.tracker.arm_processing(key, now, true);
    }
}

fn format_counters(counters: &BatchCounters) -> String {
    format!(
        "{} completed, {} failed of {}",
        counters.completed, counters.failed, counters.total_files
    )
}
