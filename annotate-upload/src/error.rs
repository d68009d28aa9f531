//! Error handling for the upload pipeline
//!
//! Every failure in a task's lifecycle is eventually turned into a state
//! transition, so these errors rarely escape the coordinator. They still carry
//! enough classification to pick a user-facing message and to decide whether
//! the failure is worth retrying.
//!
//! ## Error Categories
//!
//! ### Transport
//! Network failures while talking to the backend (`Http`, `Network`,
//! `Timeout`). All of these are recoverable.
//!
//! ### Rejected uploads
//! The server answered but refused the file (`Rejected`). The HTTP status is
//! kept for messaging only; the retry policy does not depend on it.
//!
//! ### Lifecycle
//! `Stalled` is produced by the stall timers, `InvalidState` by transitions
//! that the state machine refuses.
//!
//! ### Storage
//! `Storage` and `CapacityExceeded` come from persistence backends and are
//! absorbed by the store's fallback policy.

use thiserror::Error;

/// Result type for upload pipeline operations
pub type Result<T> = std::result::Result<T, UploadError>;

/// How the server rejected an upload, derived from the HTTP status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionKind {
    /// 413
    TooLarge,
    /// 429
    RateLimited,
    /// 5xx
    ServerError,
    /// Any other non-success status, or a 2xx body with `success: false`
    Other,
}

impl RejectionKind {
    /// Classify an HTTP status code
    pub fn from_status(status: u16) -> Self {
        match status {
            413 => RejectionKind::TooLarge,
            429 => RejectionKind::RateLimited,
            500..=599 => RejectionKind::ServerError,
            _ => RejectionKind::Other,
        }
    }
}

/// Errors that can occur while uploading and tracking files
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Upload rejected ({status:?}): {message}")]
    Rejected {
        status: Option<u16>,
        kind: RejectionKind,
        message: String,
    },

    #[error("Upload stalled: {0}")]
    Stalled(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Invalid status response: {0}")]
    InvalidResponse(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Storage capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Unsupported file: {0}")]
    UnsupportedFile(String),

    #[error("Pipeline stopped")]
    Stopped,
}

impl UploadError {
    /// Build a rejection from an HTTP status and server-provided message
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        UploadError::Rejected {
            status: Some(status),
            kind: RejectionKind::from_status(status),
            message: message.into(),
        }
    }

    /// A 2xx response whose body said `success: false`
    pub fn rejected_by_body(message: impl Into<String>) -> Self {
        UploadError::Rejected {
            status: None,
            kind: RejectionKind::Other,
            message: message.into(),
        }
    }

    /// Whether a retry may succeed without user intervention
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            UploadError::Http(_)
                | UploadError::Network(_)
                | UploadError::Rejected { .. }
                | UploadError::Stalled(_)
                | UploadError::TaskNotFound(_)
                | UploadError::Io(_)
        )
    }

    /// Short message suitable for the task's `error` field
    pub fn user_message(&self) -> String {
        match self {
            UploadError::Rejected { kind, message, .. } => match kind {
                RejectionKind::TooLarge => format!("File too large: {}", message),
                RejectionKind::RateLimited => {
                    format!("Server is rate limiting uploads: {}", message)
                }
                RejectionKind::ServerError => format!("Server error: {}", message),
                RejectionKind::Other => format!("Upload rejected: {}", message),
            },
            UploadError::Http(e) if e.is_timeout() => "Request timed out".to_string(),
            UploadError::Http(e) if e.is_connect() => {
                "Could not connect to the server".to_string()
            }
            UploadError::Http(_) | UploadError::Network(_) => "Network error".to_string(),
            UploadError::Stalled(msg) => format!("Upload stalled: {}", msg),
            UploadError::TaskNotFound(id) => format!("Server lost track of task {}", id),
            UploadError::InvalidResponse(msg) => format!("Unexpected server response: {}", msg),
            UploadError::UnsupportedFile(name) => format!("Not an image file: {}", name),
            other => other.to_string(),
        }
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        UploadError::InvalidState(msg.into())
    }
}
