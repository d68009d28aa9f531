//! Annotation Client Upload Pipeline
//!
//! Moves image files from the local machine into annotation projects. Uploads
//! go through a global rate limit and concurrency cap, run one at a time per
//! project, are tracked through server-side processing over a push channel
//! with polling as fallback, and survive restarts through a small persisted
//! record per project.
//!
//! [`UploadPipeline`] holds all state and decisions and does no I/O.
//! [`UploadCoordinator`] runs it on a tokio task against an [`UploadApi`].

pub mod api;
pub mod backoff;
pub mod config;
pub mod coordinator;
pub mod files;
pub mod gate;
pub mod http;
pub mod pipeline;
pub mod progress;
pub mod push;
pub mod queue;
pub mod reconciler;
pub mod registry;
pub mod store;
pub mod task;
pub mod tracker;

mod error;

pub use api::{PendingUpload, ProjectCounts, StatusReport, UploadAccepted, UploadApi};
pub use backoff::Backoff;
pub use config::{
    GateConfig, PipelineConfig, QueueConfig, ReconcilerConfig, StoreConfig, TrackerConfig,
};
pub use coordinator::{CoordinatorHandle, CoordinatorStatus, UploadCoordinator};
pub use error::{RejectionKind, Result, UploadError};
pub use gate::{Admission, ConcurrencyGate};
pub use http::HttpUploadApi;
pub use pipeline::{
    Action, Input, ProjectSnapshot, Step, TaskSnapshot, UploadEvent, UploadPipeline,
};
pub use progress::{ProgressAggregator, ProgressInputs};
pub use push::{PushEvent, PushListener, PushMessage};
pub use queue::{BatchCounters, ProjectUploadQueue, QueueSource};
pub use reconciler::{CountReconciler, CountsSource, RefreshRequest};
pub use registry::UploadRegistry;
pub use store::{
    FileBackend, KvBackend, MemoryBackend, PersistedUpload, PersistedUploads, PersistentStore,
    SaveOutcome, STORAGE_KEY_PREFIX,
};
pub use task::{FileMeta, FilePayload, FileRef, TaskKey, TaskStatus, UploadTask};
pub use tracker::{Phase, StatusTracker};
