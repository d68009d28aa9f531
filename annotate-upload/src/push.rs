//! Push notifications
//!
//! The backend publishes task updates as WebSocket text frames of the form
//! `{"event": "upload_progress", "data": {...}}`. [`PushListener`] keeps the
//! connection alive, reconnecting with exponential backoff, and forwards
//! every parsed event plus connect and disconnect notices to the coordinator.

use crate::api::lenient_progress;
use crate::backoff::Backoff;
use crate::task::TaskStatus;
use crate::{Result, UploadError};
use futures::StreamExt;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

const RECONNECT_INITIAL_DELAY: Duration = Duration::from_secs(1);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

/// A task update pushed by the server
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    Progress {
        task_id: String,
        project_id: String,
        status: TaskStatus,
        progress: u8,
    },
    Completed {
        task_id: String,
        project_id: String,
        image_info: Option<serde_json::Value>,
    },
    Failed {
        task_id: String,
        project_id: String,
        error: String,
    },
}

impl PushEvent {
    pub fn task_id(&self) -> &str {
        match self {
            PushEvent::Progress { task_id, .. }
            | PushEvent::Completed { task_id, .. }
            | PushEvent::Failed { task_id, .. } => task_id,
        }
    }

    pub fn project_id(&self) -> &str {
        match self {
            PushEvent::Progress { project_id, .. }
            | PushEvent::Completed { project_id, .. }
            | PushEvent::Failed { project_id, .. } => project_id,
        }
    }

    /// Parse a text frame. Events that are not upload related yield `None`.
    pub fn parse(text: &str) -> Result<Option<Self>> {
        let frame: Frame = serde_json::from_str(text)?;
        let event = match frame.event.as_str() {
            "upload_progress" => {
                let data: ProgressData = serde_json::from_value(frame.data)?;
                let status = TaskStatus::from_wire(&data.status).ok_or_else(|| {
                    UploadError::InvalidResponse(format!("unknown task status '{}'", data.status))
                })?;
                PushEvent::Progress {
                    task_id: data.task_id,
                    project_id: data.project_id,
                    status,
                    progress: data.progress,
                }
            }
            "upload_completed" => {
                let data: CompletedData = serde_json::from_value(frame.data)?;
                PushEvent::Completed {
                    task_id: data.task_id,
                    project_id: data.project_id,
                    image_info: data.image_info,
                }
            }
            "upload_failed" => {
                let data: FailedData = serde_json::from_value(frame.data)?;
                PushEvent::Failed {
                    task_id: data.task_id,
                    project_id: data.project_id,
                    error: data.error.unwrap_or_else(|| "processing failed".to_string()),
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}

#[derive(Deserialize)]
struct Frame {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Deserialize)]
struct ProgressData {
    task_id: String,
    #[serde(default)]
    project_id: String,
    status: String,
    #[serde(default, deserialize_with = "lenient_progress")]
    progress: u8,
}

#[derive(Deserialize)]
struct CompletedData {
    task_id: String,
    #[serde(default)]
    project_id: String,
    #[serde(default)]
    image_info: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct FailedData {
    task_id: String,
    #[serde(default)]
    project_id: String,
    #[serde(default)]
    error: Option<String>,
}

/// What the listener reports to the coordinator
#[derive(Debug, Clone, PartialEq)]
pub enum PushMessage {
    Connected,
    Disconnected,
    Event(PushEvent),
}

/// WebSocket client for the push channel
pub struct PushListener {
    url: String,
    reconnect: Backoff,
}

impl PushListener {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect: Backoff::new(RECONNECT_INITIAL_DELAY, RECONNECT_MAX_DELAY, None),
        }
    }

    /// Run until the receiving side is dropped
    pub async fn run(mut self, tx: mpsc::Sender<PushMessage>) {
        info!("Push listener starting for {}", self.url);

        loop {
            match connect_async(self.url.as_str()).await {
                Ok((stream, _)) => {
                    self.reconnect.reset();
                    if tx.send(PushMessage::Connected).await.is_err() {
                        break;
                    }

                    let (_, mut receiver) = stream.split();
                    if !forward_frames(&mut receiver, &tx).await {
                        break;
                    }

                    if tx.send(PushMessage::Disconnected).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Push channel connect to {} failed: {}", self.url, e);
                }
            }

            let delay = self.reconnect.next_delay().unwrap_or(RECONNECT_MAX_DELAY);
            debug!("Reconnecting push channel, {}", self.reconnect.status());
            tokio::time::sleep(delay).await;

            if tx.is_closed() {
                break;
            }
        }

        info!("Push listener stopped");
    }
}

/// Forward frames until the connection ends. Returns false once the
/// coordinator is gone.
async fn forward_frames<S>(receiver: &mut S, tx: &mpsc::Sender<PushMessage>) -> bool
where
    S: futures::Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
{
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => match PushEvent::parse(&text) {
                Ok(Some(event)) => {
                    if tx.send(PushMessage::Event(event)).await.is_err() {
                        return false;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("Ignoring malformed push frame: {}", e),
            },
            Ok(Message::Close(_)) => {
                info!("Push channel closed by server");
                break;
            }
            Err(e) => {
                error!("Push channel error: {}", e);
                break;
            }
            _ => {}
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_progress() {
        let event = PushEvent::parse(
            r#"{"event": "upload_progress", "data": {"task_id": "t1", "project_id": "p", "status": "processing", "progress": "80"}}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(
            event,
            PushEvent::Progress {
                task_id: "t1".to_string(),
                project_id: "p".to_string(),
                status: TaskStatus::Processing,
                progress: 80,
            }
        );
    }

    #[test]
    fn test_parse_completed_and_failed() {
        let event = PushEvent::parse(
            r#"{"event": "upload_completed", "data": {"task_id": "t1", "project_id": "p", "image_info": {"name": "a.png"}}}"#,
        )
        .unwrap()
        .unwrap();
        assert!(matches!(event, PushEvent::Completed { image_info: Some(_), .. }));

        let event = PushEvent::parse(
            r#"{"event": "upload_failed", "data": {"task_id": "t2", "project_id": "p", "error": "corrupt image"}}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(event.task_id(), "t2");
        assert!(matches!(event, PushEvent::Failed { ref error, .. } if error == "corrupt image"));
    }

    #[test]
    fn test_unrelated_events_are_skipped() {
        assert_eq!(
            PushEvent::parse(r#"{"event": "project_renamed", "data": {}}"#).unwrap(),
            None
        );
        assert!(PushEvent::parse("not json").is_err());
        assert!(PushEvent::parse(r#"{"event": "upload_failed", "data": {}}"#).is_err());
    }
}
