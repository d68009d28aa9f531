//! Backend API seam
//!
//! The pipeline talks to the server only through [`UploadApi`]. The wire
//! types here mirror the backend's JSON and convert into the pipeline's own
//! types, which is where malformed responses are rejected.

use crate::task::{FilePayload, TaskStatus};
use crate::{Result, UploadError};
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// Backend operations used by the upload pipeline
#[async_trait]
pub trait UploadApi: Send + Sync {
    /// `POST /projects/{id}/upload`
    async fn upload(&self, project_id: &str, file: &FilePayload) -> Result<UploadAccepted>;

    /// `GET /projects/{id}/upload/status/{task_id}`
    async fn status(&self, project_id: &str, task_id: &str) -> Result<StatusReport>;

    /// `GET /projects/{id}/counts`
    async fn counts(&self, project_id: &str) -> Result<ProjectCounts>;

    /// `GET /projects/{id}/uploads/pending`
    async fn pending_uploads(&self, project_id: &str) -> Result<Vec<PendingUpload>>;
}

/// Server accepted a file and queued it for processing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadAccepted {
    pub task_id: String,
    pub status: TaskStatus,
}

/// Body of the upload endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct UploadResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, alias = "message")]
    pub error: Option<String>,
}

impl UploadResponse {
    pub fn into_accepted(self) -> Result<UploadAccepted> {
        if !self.success {
            return Err(UploadError::rejected_by_body(
                self.error.unwrap_or_else(|| "server reported failure".to_string()),
            ));
        }

        let task_id = self
            .task_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| UploadError::InvalidResponse("upload response without task_id".into()))?;
        let status = self
            .status
            .as_deref()
            .and_then(TaskStatus::from_wire)
            .unwrap_or(TaskStatus::Queued);

        Ok(UploadAccepted { task_id, status })
    }
}

/// Current state of a server task
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub status: TaskStatus,
    pub progress: u8,
    pub error: Option<String>,
    pub image_info: Option<serde_json::Value>,
}

/// Body of the status endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct StatusResponse {
    pub status: String,
    #[serde(default, deserialize_with = "lenient_progress")]
    pub progress: u8,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub image_info: Option<serde_json::Value>,
}

impl StatusResponse {
    pub fn into_report(self) -> Result<StatusReport> {
        let status = TaskStatus::from_wire(&self.status).ok_or_else(|| {
            UploadError::InvalidResponse(format!("unknown task status '{}'", self.status))
        })?;

        Ok(StatusReport {
            status,
            progress: self.progress,
            error: self.error,
            image_info: self.image_info,
        })
    }
}

/// Authoritative per-project counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectCounts {
    #[serde(rename = "imageCount", default)]
    pub image_count: u64,
    #[serde(rename = "annotationsCount", default)]
    pub annotations_count: BTreeMap<String, u64>,
}

impl ProjectCounts {
    /// Counts known locally, without any annotation breakdown
    pub fn local(image_count: u64) -> Self {
        Self {
            image_count,
            annotations_count: BTreeMap::new(),
        }
    }

    pub fn total_annotations(&self) -> u64 {
        self.annotations_count.values().sum()
    }
}

/// Entry of the pending uploads listing
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PendingUpload {
    pub task_id: String,
    #[serde(default)]
    pub filename: Option<String>,
    pub status: String,
    #[serde(default, deserialize_with = "lenient_progress")]
    pub progress: u8,
    #[serde(default)]
    pub created: Option<String>,
}

impl PendingUpload {
    /// Parsed status if it is one the server still owns
    pub fn server_status(&self) -> Option<TaskStatus> {
        TaskStatus::from_wire(&self.status).filter(|status| status.is_server_side())
    }
}

/// Accept progress as an integer, a float or a numeric string
pub(crate) fn lenient_progress<'de, D>(deserializer: D) -> std::result::Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
        Missing,
    }

    let value = match Raw::deserialize(deserializer)? {
        Raw::Number(n) => n,
        Raw::Text(s) => s.trim().parse::<f64>().unwrap_or(0.0),
        Raw::Missing => 0.0,
    };

    if value.is_nan() {
        return Ok(0);
    }
    Ok(value.clamp(0.0, 100.0).round() as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_response_accepted() {
        let response: UploadResponse =
            serde_json::from_str(r#"{"success": true, "task_id": "abc", "status": "queued"}"#)
                .unwrap();
        let accepted = response.into_accepted().unwrap();
        assert_eq!(accepted.task_id, "abc");
        assert_eq!(accepted.status, TaskStatus::Queued);
    }

    #[test]
    fn test_upload_response_rejected() {
        let response: UploadResponse =
            serde_json::from_str(r#"{"success": false, "error": "Invalid file type"}"#).unwrap();
        let error = response.into_accepted().unwrap_err();
        assert!(matches!(error, UploadError::Rejected { status: None, .. }));
        assert!(error.user_message().contains("Invalid file type"));

        let response: UploadResponse = serde_json::from_str(r#"{"success": true}"#).unwrap();
        assert!(matches!(
            response.into_accepted(),
            Err(UploadError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_status_progress_as_string_or_number() {
        let report = serde_json::from_str::<StatusResponse>(
            r#"{"task_id": "abc", "status": "processing", "progress": "50"}"#,
        )
        .unwrap()
        .into_report()
        .unwrap();
        assert_eq!(report.status, TaskStatus::Processing);
        assert_eq!(report.progress, 50);

        let report = serde_json::from_str::<StatusResponse>(r#"{"status": "queued", "progress": 12.6}"#)
            .unwrap()
            .into_report()
            .unwrap();
        assert_eq!(report.progress, 13);

        let report = serde_json::from_str::<StatusResponse>(r#"{"status": "queued"}"#)
            .unwrap()
            .into_report()
            .unwrap();
        assert_eq!(report.progress, 0);

        let report = serde_json::from_str::<StatusResponse>(r#"{"status": "queued", "progress": null}"#)
            .unwrap()
            .into_report()
            .unwrap();
        assert_eq!(report.progress, 0);
    }

    #[test]
    fn test_status_completed_with_image_info() {
        let report = serde_json::from_str::<StatusResponse>(
            r#"{"status": "completed", "progress": "100", "image_info": {"name": "a.png", "width": 640}}"#,
        )
        .unwrap()
        .into_report()
        .unwrap();
        assert_eq!(report.status, TaskStatus::Completed);
        assert_eq!(report.image_info.unwrap()["width"], 640);
    }

    #[test]
    fn test_unknown_status_is_invalid() {
        let result = serde_json::from_str::<StatusResponse>(r#"{"status": "exploded"}"#)
            .unwrap()
            .into_report();
        assert!(matches!(result, Err(UploadError::InvalidResponse(_))));
    }

    #[test]
    fn test_counts_wire_format() {
        let counts: ProjectCounts = serde_json::from_str(
            r#"{"imageCount": 12, "annotationsCount": {"cat": 3, "dog": 4}}"#,
        )
        .unwrap();
        assert_eq!(counts.image_count, 12);
        assert_eq!(counts.total_annotations(), 7);
    }

    #[test]
    fn test_pending_upload_listing() {
        let pending: Vec<PendingUpload> = serde_json::from_str(
            r#"[{"task_id": "t1", "project_id": "p", "filename": "a.png", "status": "processing", "progress": "10", "created": "2024-01-01T00:00:00"}]"#,
        )
        .unwrap();
        assert_eq!(pending[0].server_status(), Some(TaskStatus::Processing));
        assert_eq!(pending[0].progress, 10);
    }
}
