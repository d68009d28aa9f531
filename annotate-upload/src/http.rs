//! reqwest implementation of [`UploadApi`]

use crate::api::{
    PendingUpload, ProjectCounts, StatusReport, StatusResponse, UploadAccepted, UploadApi,
    UploadResponse,
};
use crate::task::FilePayload;
use crate::{Result, UploadError};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, info};

/// HTTP client for the annotation backend
#[derive(Debug, Clone)]
pub struct HttpUploadApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpUploadApi {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(UploadError::Configuration(format!(
                "server url must start with http:// or https://, got '{}'",
                base_url
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;

        info!("Upload API at {} (timeout {:?})", base_url, request_timeout);
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path);
        debug!("GET {}", url);
        let response = self.client.get(&url).send().await?;
        let response = check_status(response).await?;
        Ok(response.json::<T>().await?)
    }
}

/// Turn a non-success status into a rejection carrying the server's message
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or_else(|| {
            if body.is_empty() {
                status.to_string()
            } else {
                body
            }
        });

    Err(UploadError::from_status(status.as_u16(), message))
}

#[async_trait]
impl UploadApi for HttpUploadApi {
    async fn upload(&self, project_id: &str, file: &FilePayload) -> Result<UploadAccepted> {
        let url = self.url(&format!("/projects/{}/upload", project_id));
        let data = file.read().await?;
        debug!("POST {} ({}, {} bytes)", url, file.meta.name, data.len());

        let part = reqwest::multipart::Part::bytes(data.to_vec())
            .file_name(file.meta.name.clone())
            .mime_str(&file.meta.mime_type)?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self.client.post(&url).multipart(form).send().await?;
        let response = check_status(response).await?;
        response.json::<UploadResponse>().await?.into_accepted()
    }

    async fn status(&self, project_id: &str, task_id: &str) -> Result<StatusReport> {
        let path = format!("/projects/{}/upload/status/{}", project_id, task_id);
        match self.get_json::<StatusResponse>(&path).await {
            Err(UploadError::Rejected {
                status: Some(404), ..
            }) => Err(UploadError::TaskNotFound(task_id.to_string())),
            other => other?.into_report(),
        }
    }

    async fn counts(&self, project_id: &str) -> Result<ProjectCounts> {
        self.get_json(&format!("/projects/{}/counts", project_id))
            .await
    }

    async fn pending_uploads(&self, project_id: &str) -> Result<Vec<PendingUpload>> {
        self.get_json(&format!("/projects/{}/uploads/pending", project_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_non_http_url() {
        let result = HttpUploadApi::new("ftp://example.com", Duration::from_secs(5));
        assert!(matches!(result, Err(UploadError::Configuration(_))));
    }

    #[test]
    fn test_trailing_slash_trimmed() {
        let api = HttpUploadApi::new("http://localhost:5000/", Duration::from_secs(5)).unwrap();
        assert_eq!(api.base_url(), "http://localhost:5000");
        assert_eq!(
            api.url("/projects/p/counts"),
            "http://localhost:5000/projects/p/counts"
        );
    }
}
