//! Count reconciliation
//!
//! Fetches authoritative image and annotation counts from the server. Every
//! caller (batch end, periodic refresh, push reconnect) goes through
//! [`CountReconciler::refresh`], which runs at most one fetch per project at
//! a time and no more than one per throttle window. Requests that arrive while
//! a fetch is running are folded into a single follow-up fetch.

use crate::api::{ProjectCounts, UploadApi};
use crate::backoff::Backoff;
use crate::config::ReconcilerConfig;
use crate::pipeline::UploadEvent;
use crate::Result;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Upper bound for a single retry delay
const RETRY_MAX_DELAY: Duration = Duration::from_secs(30);

/// Where displayed counts came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CountsSource {
    Server,
    /// Server unreachable, locally tracked counters
    Local,
}

/// What happened to a refresh request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshRequest {
    /// Fetch started right away
    Started,
    /// Fetch will start once the throttle window has passed
    Scheduled(Duration),
    /// Folded into a fetch that is already running or scheduled
    Coalesced,
}

#[derive(Debug, Default)]
struct Schedule {
    last_fetch: Option<Instant>,
    fetching: bool,
    scheduled: bool,
    rerun: bool,
    local: ProjectCounts,
}

/// Throttled, retrying count fetcher
pub struct CountReconciler {
    api: Arc<dyn UploadApi>,
    config: ReconcilerConfig,
    schedules: Arc<RwLock<HashMap<String, Schedule>>>,
    latest: Arc<RwLock<HashMap<String, (ProjectCounts, CountsSource)>>>,
    events: broadcast::Sender<UploadEvent>,
}

impl CountReconciler {
    pub fn new(
        api: Arc<dyn UploadApi>,
        config: ReconcilerConfig,
        events: broadcast::Sender<UploadEvent>,
    ) -> Self {
        Self {
            api,
            config,
            schedules: Arc::new(RwLock::new(HashMap::new())),
            latest: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    /// Request fresh counts for a project. `local` is published if the
    /// server cannot be reached.
    pub async fn refresh(self: &Arc<Self>, project_id: &str, local: ProjectCounts) -> RefreshRequest {
        let mut schedules = self.schedules.write().await;
        let schedule = schedules.entry(project_id.to_string()).or_default();
        schedule.local = local;

        if schedule.fetching {
            schedule.rerun = true;
            return RefreshRequest::Coalesced;
        }
        if schedule.scheduled {
            return RefreshRequest::Coalesced;
        }

        let wait = self.throttle_wait(schedule.last_fetch);
        schedule.scheduled = true;
        drop(schedules);

        debug!("Count refresh for {} in {:?}", project_id, wait);
        tokio::spawn(self.clone().run(project_id.to_string(), wait));

        if wait.is_zero() {
            RefreshRequest::Started
        } else {
            RefreshRequest::Scheduled(wait)
        }
    }

    /// Last published counts
    pub async fn counts(&self, project_id: &str) -> Option<(ProjectCounts, CountsSource)> {
        self.latest.read().await.get(project_id).cloned()
    }

    fn throttle_wait(&self, last_fetch: Option<Instant>) -> Duration {
        last_fetch.map_or(Duration::ZERO, |last| {
            (last + self.config.throttle()).saturating_duration_since(Instant::now())
        })
    }

    async fn run(self: Arc<Self>, project_id: String, mut wait: Duration) {
        loop {
            if !wait.is_zero() {
                sleep(wait).await;
            }

            {
                let mut schedules = self.schedules.write().await;
                let schedule = schedules.entry(project_id.clone()).or_default();
                schedule.scheduled = false;
                schedule.fetching = true;
                schedule.last_fetch = Some(Instant::now());
            }

            let result = self.fetch_with_retry(&project_id).await;

            let (counts, source, rerun, last_fetch) = {
                let mut schedules = self.schedules.write().await;
                let schedule = schedules.entry(project_id.clone()).or_default();
                schedule.fetching = false;
                let rerun = std::mem::take(&mut schedule.rerun);
                if rerun {
                    schedule.scheduled = true;
                }

                match result {
                    Ok(counts) => (counts, CountsSource::Server, rerun, schedule.last_fetch),
                    Err(e) => {
                        warn!(
                            "Giving up on counts for project {}: {}, using local counters",
                            project_id, e
                        );
                        (schedule.local.clone(), CountsSource::Local, rerun, schedule.last_fetch)
                    }
                }
            };

            self.publish(&project_id, counts, source).await;

            if !rerun {
                break;
            }
            wait = self.throttle_wait(last_fetch);
        }
    }

    async fn fetch_with_retry(&self, project_id: &str) -> Result<ProjectCounts> {
        let mut backoff = Backoff::new(
            self.config.retry_base(),
            RETRY_MAX_DELAY,
            Some(self.config.max_attempts.saturating_sub(1)),
        );

        loop {
            match self.api.counts(project_id).await {
                Ok(counts) => return Ok(counts),
                Err(e) if !e.is_recoverable() => return Err(e),
                Err(e) => match backoff.next_delay() {
                    Some(delay) => {
                        debug!(
                            "Count fetch for {} failed ({}), {}",
                            project_id,
                            e,
                            backoff.status()
                        );
                        sleep(delay).await;
                    }
                    None => return Err(e),
                },
            }
        }
    }

    async fn publish(&self, project_id: &str, counts: ProjectCounts, source: CountsSource) {
        info!(
            "Project {}: {} images, {} annotations ({:?})",
            project_id,
            counts.image_count,
            counts.total_annotations(),
            source
        );
        self.latest
            .write()
            .await
            .insert(project_id.to_string(), (counts.clone(), source));

        // No subscribers is fine
        let _ = self.events.send(UploadEvent::CountsUpdated {
            project_id: project_id.to_string(),
            counts,
            source,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{PendingUpload, StatusReport, UploadAccepted};
    use crate::task::FilePayload;
    use crate::UploadError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountsApi {
        calls: AtomicU32,
        failures: u32,
        malformed: bool,
    }

    impl CountsApi {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                failures,
                malformed: false,
            })
        }

        /// Every response is an unreadable body
        fn malformed() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                failures: u32::MAX,
                malformed: true,
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl UploadApi for CountsApi {
        async fn upload(&self, _: &str, _: &FilePayload) -> Result<UploadAccepted> {
            Err(UploadError::Network("not used".into()))
        }

        async fn status(&self, _: &str, _: &str) -> Result<StatusReport> {
            Err(UploadError::Network("not used".into()))
        }

        async fn counts(&self, _: &str) -> Result<ProjectCounts> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.malformed {
                return Err(UploadError::InvalidResponse("counts missing".into()));
            }
            if call < self.failures {
                return Err(UploadError::from_status(503, "busy"));
            }
            Ok(ProjectCounts {
                image_count: 42,
                ..Default::default()
            })
        }

        async fn pending_uploads(&self, _: &str) -> Result<Vec<PendingUpload>> {
            Ok(Vec::new())
        }
    }

    fn reconciler(api: Arc<CountsApi>) -> (Arc<CountReconciler>, broadcast::Receiver<UploadEvent>) {
        let (tx, rx) = broadcast::channel(16);
        let reconciler = Arc::new(CountReconciler::new(api, ReconcilerConfig::default(), tx));
        (reconciler, rx)
    }

    async fn next_counts(rx: &mut broadcast::Receiver<UploadEvent>) -> (ProjectCounts, CountsSource) {
        loop {
            if let UploadEvent::CountsUpdated { counts, source, .. } = rx.recv().await.unwrap() {
                return (counts, source);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttled_per_project() {
        let api = CountsApi::new(0);
        let (reconciler, mut rx) = reconciler(api.clone());

        assert_eq!(
            reconciler.refresh("p", ProjectCounts::local(1)).await,
            RefreshRequest::Started
        );
        assert_eq!(next_counts(&mut rx).await.1, CountsSource::Server);

        sleep(Duration::from_secs(4)).await;
        assert_eq!(
            reconciler.refresh("p", ProjectCounts::local(1)).await,
            RefreshRequest::Scheduled(Duration::from_secs(6))
        );
        assert_eq!(
            reconciler.refresh("p", ProjectCounts::local(1)).await,
            RefreshRequest::Coalesced
        );
        assert_eq!(api.calls(), 1);

        // another project is not affected by p's window
        assert_eq!(
            reconciler.refresh("q", ProjectCounts::local(0)).await,
            RefreshRequest::Started
        );

        next_counts(&mut rx).await;
        next_counts(&mut rx).await;
        assert_eq!(api.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_succeeds() {
        let api = CountsApi::new(2);
        let (reconciler, mut rx) = reconciler(api.clone());

        reconciler.refresh("p", ProjectCounts::local(1)).await;
        let (counts, source) = next_counts(&mut rx).await;
        assert_eq!(source, CountsSource::Server);
        assert_eq!(counts.image_count, 42);
        assert_eq!(api.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_falls_back_to_local() {
        let api = CountsApi::new(u32::MAX);
        let (reconciler, mut rx) = reconciler(api.clone());

        reconciler.refresh("p", ProjectCounts::local(7)).await;
        let (counts, source) = next_counts(&mut rx).await;
        assert_eq!(source, CountsSource::Local);
        assert_eq!(counts.image_count, 7);
        assert_eq!(api.calls(), 3);
        assert_eq!(
            reconciler.counts("p").await,
            Some((ProjectCounts::local(7), CountsSource::Local))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreadable_counts_are_not_retried() {
        let api = CountsApi::malformed();
        let (reconciler, mut rx) = reconciler(api.clone());

        reconciler.refresh("p", ProjectCounts::local(5)).await;
        let (counts, source) = next_counts(&mut rx).await;
        assert_eq!(source, CountsSource::Local);
        assert_eq!(counts.image_count, 5);
        assert_eq!(api.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_during_fetch_reruns_once() {
        let api = CountsApi::new(1);
        let (reconciler, mut rx) = reconciler(api.clone());

        reconciler.refresh("p", ProjectCounts::local(1)).await;
        // first attempt has failed, the fetch sits in its 1s retry delay
        sleep(Duration::from_millis(500)).await;
        assert_eq!(
            reconciler.refresh("p", ProjectCounts::local(2)).await,
            RefreshRequest::Coalesced
        );
        assert_eq!(
            reconciler.refresh("p", ProjectCounts::local(3)).await,
            RefreshRequest::Coalesced
        );

        next_counts(&mut rx).await;
        next_counts(&mut rx).await;
        // one failed attempt, one success, one follow-up fetch
        assert_eq!(api.calls(), 3);
    }
}
