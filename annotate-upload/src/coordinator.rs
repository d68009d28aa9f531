//! Upload coordinator
//!
//! Runs an [`UploadPipeline`] inside a single tokio task. Commands from
//! [`CoordinatorHandle`]s, results of spawned network calls and push channel
//! messages are all applied one at a time by that task, and the pipeline's
//! next deadline drives its timers.

use crate::api::{ProjectCounts, UploadApi};
use crate::config::PipelineConfig;
use crate::pipeline::{Action, Input, ProjectSnapshot, Step, UploadEvent, UploadPipeline};
use crate::push::PushMessage;
use crate::reconciler::{CountReconciler, CountsSource};
use crate::store::PersistentStore;
use crate::task::FilePayload;
use crate::{Result, UploadError};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

const COMMAND_CHANNEL_SIZE: usize = 64;
const RESULT_CHANNEL_SIZE: usize = 256;
const EVENT_CHANNEL_SIZE: usize = 1024;

/// Coordinator-wide state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorStatus {
    /// Uploads holding a slot
    pub in_flight: usize,
    /// Some project still has unfinished work
    pub active_batches: bool,
    pub projects: Vec<String>,
}

enum Command {
    Enqueue {
        project_id: String,
        files: Vec<FilePayload>,
    },
    Restore {
        project_id: String,
    },
    Snapshot {
        project_id: String,
        reply: oneshot::Sender<Option<ProjectSnapshot>>,
    },
    Status {
        reply: oneshot::Sender<CoordinatorStatus>,
    },
    Shutdown,
}

/// Cloneable access to a running coordinator
#[derive(Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<UploadEvent>,
    reconciler: Arc<CountReconciler>,
}

impl CoordinatorHandle {
    async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| UploadError::Stopped)
    }

    /// Queue files for a project
    pub async fn enqueue(&self, project_id: impl Into<String>, files: Vec<FilePayload>) -> Result<()> {
        self.send(Command::Enqueue {
            project_id: project_id.into(),
            files,
        })
        .await
    }

    /// Resume a project's uploads from persisted state
    pub async fn restore(&self, project_id: impl Into<String>) -> Result<()> {
        self.send(Command::Restore {
            project_id: project_id.into(),
        })
        .await
    }

    pub async fn snapshot(&self, project_id: impl Into<String>) -> Result<Option<ProjectSnapshot>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot {
            project_id: project_id.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| UploadError::Stopped)
    }

    pub async fn status(&self) -> Result<CoordinatorStatus> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status { reply }).await?;
        rx.await.map_err(|_| UploadError::Stopped)
    }

    /// Last counts published for a project
    pub async fn counts(&self, project_id: &str) -> Option<(ProjectCounts, CountsSource)> {
        self.reconciler.counts(project_id).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.events.subscribe()
    }

    /// Stop the coordinator task. In-flight requests are abandoned.
    pub async fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown).await
    }
}

/// Owner of the pipeline task
pub struct UploadCoordinator {
    pipeline: UploadPipeline,
    api: Arc<dyn UploadApi>,
    reconciler: Arc<CountReconciler>,
    events: broadcast::Sender<UploadEvent>,
    results: mpsc::Sender<Input>,
}

impl UploadCoordinator {
    /// Start the coordinator. `push` carries messages from a push listener;
    /// without one, every accepted task is polled.
    pub fn spawn(
        config: PipelineConfig,
        store: PersistentStore,
        api: Arc<dyn UploadApi>,
        push: Option<mpsc::Receiver<PushMessage>>,
    ) -> (CoordinatorHandle, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (results_tx, results_rx) = mpsc::channel(RESULT_CHANNEL_SIZE);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);

        let reconciler = Arc::new(CountReconciler::new(
            api.clone(),
            config.reconciler.clone(),
            events.clone(),
        ));

        let coordinator = Self {
            pipeline: UploadPipeline::new(config, store),
            api,
            reconciler: reconciler.clone(),
            events: events.clone(),
            results: results_tx,
        };

        let task = tokio::spawn(coordinator.run(commands_rx, results_rx, push));
        let handle = CoordinatorHandle {
            commands: commands_tx,
            events,
            reconciler,
        };
        (handle, task)
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut results: mpsc::Receiver<Input>,
        mut push: Option<mpsc::Receiver<PushMessage>>,
    ) {
        info!("Upload coordinator started");

        loop {
            let deadline = self.pipeline.next_deadline();

            let wake = tokio::select! {
                command = commands.recv() => Wake::Command(command),
                Some(input) = results.recv() => Wake::Input(input),
                message = next_push(&mut push) => Wake::Push(message),
                _ = sleep_until_deadline(deadline) => Wake::Deadline,
            };

            match wake {
                Wake::Command(None) | Wake::Command(Some(Command::Shutdown)) => break,
                Wake::Command(Some(command)) => self.on_command(command).await,
                Wake::Input(input) => self.apply(input).await,
                Wake::Push(Some(message)) => self.apply(Input::Push(message)).await,
                Wake::Push(None) => {
                    warn!("Push listener went away, falling back to polling");
                    push = None;
                    self.apply(Input::Push(PushMessage::Disconnected)).await;
                }
                Wake::Deadline => {
                    let step = self.pipeline.tick(Instant::now());
                    self.execute(step).await;
                }
            }
        }

        info!(
            "Upload coordinator stopped with {} uploads in flight",
            self.pipeline.in_flight_count()
        );
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Enqueue { project_id, files } => {
                self.apply(Input::Enqueue { project_id, files }).await;
            }
            Command::Restore { project_id } => {
                let api = self.api.clone();
                let results = self.results.clone();
                tokio::spawn(async move {
                    let server_pending = match api.pending_uploads(&project_id).await {
                        Ok(pending) => pending,
                        Err(e) => {
                            warn!("Could not list pending uploads for {}: {}", project_id, e);
                            Vec::new()
                        }
                    };
                    let _ = results
                        .send(Input::Restore {
                            project_id,
                            server_pending,
                        })
                        .await;
                });
            }
            Command::Snapshot { project_id, reply } => {
                let _ = reply.send(self.pipeline.snapshot(&project_id));
            }
            Command::Status { reply } => {
                let _ = reply.send(CoordinatorStatus {
                    in_flight: self.pipeline.in_flight_count(),
                    active_batches: self.pipeline.has_active_batches(),
                    projects: self.pipeline.projects(),
                });
            }
            Command::Shutdown => {}
        }
    }

    async fn apply(&mut self, input: Input) {
        let step = self.pipeline.handle(input, Instant::now());
        self.execute(step).await;
    }

    async fn execute(&mut self, step: Step) {
        for event in step.events {
            let _ = self.events.send(event);
        }

        for action in step.actions {
            match action {
                Action::Dispatch {
                    key,
                    attempt,
                    project_id,
                    file,
                } => {
                    let api = self.api.clone();
                    let results = self.results.clone();
                    tokio::spawn(async move {
                        let result = api.upload(&project_id, &file).await;
                        let _ = results
                            .send(Input::DispatchResult {
                                key,
                                attempt,
                                result,
                            })
                            .await;
                    });
                }
                Action::PollStatus {
                    key,
                    attempt,
                    project_id,
                    task_id,
                } => {
                    let api = self.api.clone();
                    let results = self.results.clone();
                    tokio::spawn(async move {
                        let result = api.status(&project_id, &task_id).await;
                        let _ = results
                            .send(Input::PollResult {
                                key,
                                attempt,
                                result,
                            })
                            .await;
                    });
                }
                Action::RefreshCounts { project_id, local } => {
                    let request = self.reconciler.refresh(&project_id, local).await;
                    debug!("Count refresh for {}: {:?}", project_id, request);
                }
            }
        }
    }
}

enum Wake {
    Command(Option<Command>),
    Input(Input),
    Push(Option<PushMessage>),
    Deadline,
}

async fn next_push(push: &mut Option<mpsc::Receiver<PushMessage>>) -> Option<PushMessage> {
    match push.as_mut() {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
