//! Persistent upload state
//!
//! Each project's tasks are stored as one JSON document, a map from the
//! task's external id to a [`PersistedUpload`]. The store sits on top of a
//! [`KvBackend`]; when no primary backend is available an in-memory one is
//! used instead, and when the primary backend rejects a write the document is
//! shrunk step by step:
//!
//! 1. strip file metadata from every entry
//! 2. keep only the newest `overflow_keep_tasks` entries
//! 3. remove the entry from the primary and keep the newest
//!    `max_stored_tasks` entries in memory
//!
//! Neither `save` nor `load` ever return an error to the caller.

use crate::config::StoreConfig;
use crate::task::{FileMeta, TaskStatus, UploadTask};
use crate::{Result, UploadError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Key prefix for project documents
pub const STORAGE_KEY_PREFIX: &str = "pendingUploads_";

/// One persisted task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedUpload {
    pub filename: String,
    pub status: TaskStatus,
    pub progress: u8,
    pub project_id: String,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Only kept while the task is not terminal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileMeta>,
}

impl From<&UploadTask> for PersistedUpload {
    fn from(task: &UploadTask) -> Self {
        let file = if task.status().is_terminal() {
            None
        } else {
            Some(task.file().meta().clone())
        };

        Self {
            filename: task.filename().to_string(),
            status: task.status(),
            progress: task.progress(),
            project_id: task.project_id().to_string(),
            created: task.created_at(),
            retry_count: task.retry_count(),
            error: task.error().map(str::to_string),
            file,
        }
    }
}

/// Persisted tasks of one project, keyed by external task id
pub type PersistedUploads = BTreeMap<String, PersistedUpload>;

/// How a save ended up being stored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Written to the primary backend as is
    Stored { entries: usize },
    /// Written after dropping file metadata
    Stripped { entries: usize },
    /// Written after dropping the oldest entries
    Truncated { entries: usize },
    /// Kept in memory, because there is no primary backend or it refused
    /// every write
    Fallback { entries: usize },
}

/// Minimal string key-value storage
pub trait KvBackend: Send {
    /// Backend name for logs
    fn name(&self) -> &str;

    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&mut self, key: &str, value: &str) -> Result<()>;

    fn remove(&mut self, key: &str) -> Result<()>;
}

/// In-memory backend, optionally with a byte quota per entry
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: HashMap<String, String>,
    max_entry_bytes: Option<usize>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject values larger than `max_entry_bytes`
    pub fn with_quota(max_entry_bytes: usize) -> Self {
        Self {
            entries: HashMap::new(),
            max_entry_bytes: Some(max_entry_bytes),
        }
    }
}

impl KvBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        if let Some(max) = self.max_entry_bytes {
            if value.len() > max {
                return Err(UploadError::CapacityExceeded(format!(
                    "{} bytes for {} (quota {} bytes)",
                    value.len(),
                    key,
                    max
                )));
            }
        }
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

/// One JSON file per key inside a directory
#[derive(Debug)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    /// Open (and create) the storage directory
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        debug!("Upload state directory: {}", dir.display());
        Ok(Self { dir })
    }

    /// Percent-encode everything but `[A-Za-z0-9_-]`, so distinct keys never
    /// share a file
    fn path_for(&self, key: &str) -> PathBuf {
        let mut encoded = String::with_capacity(key.len());
        for byte in key.bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
                encoded.push(char::from(byte));
            } else {
                encoded.push_str(&format!("%{:02X}", byte));
            }
        }
        self.dir.join(format!("{}.json", encoded))
    }
}

impl KvBackend for FileBackend {
    fn name(&self) -> &str {
        "file"
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key);
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(UploadError::Storage(format!(
                "reading {}: {}",
                path.display(),
                e
            ))),
        }
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value)
            .and_then(|_| fs::rename(&tmp, &path))
            .map_err(|e| UploadError::Storage(format!("writing {}: {}", path.display(), e)))
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(UploadError::Storage(format!(
                "removing {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

/// Per-project persistence with a degrading overflow policy
pub struct PersistentStore {
    primary: Option<Box<dyn KvBackend>>,
    fallback: MemoryBackend,
    config: StoreConfig,
}

impl PersistentStore {
    pub fn new(primary: Option<Box<dyn KvBackend>>, config: StoreConfig) -> Self {
        match &primary {
            Some(backend) => info!("Persisting upload state with {} backend", backend.name()),
            None => warn!("No persistent backend available, upload state kept in memory only"),
        }

        Self {
            primary,
            fallback: MemoryBackend::new(),
            config,
        }
    }

    /// Store without a primary backend
    pub fn in_memory(config: StoreConfig) -> Self {
        Self::new(None, config)
    }

    fn storage_key(project_id: &str) -> String {
        format!("{}{}", STORAGE_KEY_PREFIX, project_id)
    }

    /// Persist a project's records
    pub fn save(&mut self, project_id: &str, records: PersistedUploads) -> SaveOutcome {
        let key = Self::storage_key(project_id);
        let records = keep_newest(records, self.config.max_stored_tasks);

        let Some(primary) = self.primary.as_mut() else {
            let entries = records.len();
            if let Err(e) = write_records(&mut self.fallback, &key, &records) {
                warn!("In-memory upload state rejected for {}: {}", project_id, e);
            }
            return SaveOutcome::Fallback { entries };
        };

        let entries = records.len();
        match write_records(primary.as_mut(), &key, &records) {
            Ok(()) => {
                let _ = self.fallback.remove(&key);
                return SaveOutcome::Stored { entries };
            }
            Err(e) => warn!(
                "Saving {} uploads for {} failed ({}), dropping file metadata",
                entries, project_id, e
            ),
        }

        let stripped: PersistedUploads = records
            .iter()
            .map(|(id, record)| {
                let mut record = record.clone();
                record.file = None;
                (id.clone(), record)
            })
            .collect();
        match write_records(primary.as_mut(), &key, &stripped) {
            Ok(()) => {
                let _ = self.fallback.remove(&key);
                return SaveOutcome::Stripped { entries };
            }
            Err(e) => warn!(
                "Saving stripped uploads for {} failed ({}), keeping newest {}",
                project_id, e, self.config.overflow_keep_tasks
            ),
        }

        let truncated = keep_newest(stripped, self.config.overflow_keep_tasks);
        match write_records(primary.as_mut(), &key, &truncated) {
            Ok(()) => {
                let _ = self.fallback.remove(&key);
                return SaveOutcome::Truncated {
                    entries: truncated.len(),
                };
            }
            Err(e) => warn!(
                "Saving truncated uploads for {} failed ({}), keeping state in memory",
                project_id, e
            ),
        }

        if let Err(e) = primary.remove(&key) {
            warn!("Failed to clear upload state for {}: {}", project_id, e);
        }
        if let Err(e) = write_records(&mut self.fallback, &key, &records) {
            warn!("In-memory upload state rejected for {}: {}", project_id, e);
        }
        SaveOutcome::Fallback { entries }
    }

    /// Load a project's records, from the primary backend or else from
    /// memory; any failure yields an empty set
    pub fn load(&self, project_id: &str) -> PersistedUploads {
        let key = Self::storage_key(project_id);

        let primary = match &self.primary {
            Some(primary) => match primary.get(&key) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!("Failed to load upload state for {}: {}", project_id, e);
                    None
                }
            },
            None => None,
        };
        let raw = primary.or_else(|| self.fallback.get(&key).unwrap_or(None));

        let Some(raw) = raw else {
            return PersistedUploads::new();
        };

        match serde_json::from_str::<PersistedUploads>(&raw) {
            Ok(records) => {
                debug!("Loaded {} uploads for {}", records.len(), project_id);
                records
            }
            Err(e) => {
                warn!("Discarding unreadable upload state for {}: {}", project_id, e);
                PersistedUploads::new()
            }
        }
    }

    /// Remove a project's records
    pub fn clear(&mut self, project_id: &str) {
        let key = Self::storage_key(project_id);
        let _ = self.fallback.remove(&key);
        let result = match self.primary.as_mut() {
            Some(primary) => primary.remove(&key),
            None => Ok(()),
        };
        if let Err(e) = result {
            warn!("Failed to clear upload state for {}: {}", project_id, e);
        }
    }
}

fn write_records(backend: &mut dyn KvBackend, key: &str, records: &PersistedUploads) -> Result<()> {
    let json = serde_json::to_string(records)?;
    backend.set(key, &json)
}

/// Keep the `limit` most recently created records
pub(crate) fn keep_newest(records: PersistedUploads, limit: usize) -> PersistedUploads {
    if records.len() <= limit {
        return records;
    }

    let mut ordered: Vec<(String, PersistedUpload)> = records.into_iter().collect();
    ordered.sort_by(|a, b| b.1.created.cmp(&a.1.created).then_with(|| a.0.cmp(&b.0)));
    ordered.truncate(limit);
    ordered.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn record(index: i64, status: TaskStatus) -> PersistedUpload {
        PersistedUpload {
            filename: format!("img-{:03}.png", index),
            status,
            progress: if status == TaskStatus::Completed { 100 } else { 0 },
            project_id: "p".to_string(),
            created: DateTime::<Utc>::UNIX_EPOCH + Duration::seconds(index),
            retry_count: 0,
            error: None,
            file: Some(FileMeta::new(format!("img-{:03}.png", index), 1024, "image/png")),
        }
    }

    fn records(count: i64) -> PersistedUploads {
        (0..count)
            .map(|i| (format!("task-{:03}", i), record(i, TaskStatus::Completed)))
            .collect()
    }

    #[test]
    fn test_round_trip_in_memory() {
        let mut store = PersistentStore::in_memory(StoreConfig::default());
        let outcome = store.save("p", records(5));
        assert_eq!(outcome, SaveOutcome::Fallback { entries: 5 });

        let loaded = store.load("p");
        assert_eq!(loaded.len(), 5);
        assert_eq!(loaded["task-003"].filename, "img-003.png");
        assert_eq!(loaded["task-003"].status, TaskStatus::Completed);

        store.clear("p");
        assert!(store.load("p").is_empty());
    }

    #[test]
    fn test_cap_evicts_oldest() {
        let mut store = PersistentStore::new(
            Some(Box::new(MemoryBackend::new())),
            StoreConfig::default(),
        );
        assert_eq!(store.save("p", records(120)), SaveOutcome::Stored { entries: 100 });

        let loaded = store.load("p");
        assert!(!loaded.contains_key("task-019"));
        assert!(loaded.contains_key("task-020"));
        assert!(loaded.contains_key("task-119"));
    }

    #[test]
    fn test_overflow_strips_then_truncates() {
        let full = serde_json::to_string(&keep_newest(records(100), 100)).unwrap();
        let quota = full.len() - 1;
        let mut store = PersistentStore::new(
            Some(Box::new(MemoryBackend::with_quota(quota))),
            StoreConfig::default(),
        );

        let outcome = store.save("p", records(100));
        assert_eq!(outcome, SaveOutcome::Stripped { entries: 100 });
        assert!(store.load("p").values().all(|r| r.file.is_none()));

        let stripped_half: PersistedUploads = keep_newest(records(100), 50)
            .into_iter()
            .map(|(id, mut record)| {
                record.file = None;
                (id, record)
            })
            .collect();
        let quota = serde_json::to_string(&stripped_half).unwrap().len();
        let mut store = PersistentStore::new(
            Some(Box::new(MemoryBackend::with_quota(quota))),
            StoreConfig::default(),
        );
        assert_eq!(store.save("p", records(100)), SaveOutcome::Truncated { entries: 50 });
        let loaded = store.load("p");
        assert!(loaded.contains_key("task-099"));
        assert!(!loaded.contains_key("task-049"));
    }

    #[test]
    fn test_refused_writes_fall_back_to_memory() {
        let mut store = PersistentStore::new(
            Some(Box::new(MemoryBackend::with_quota(10))),
            StoreConfig::default(),
        );
        assert_eq!(store.save("p", records(3)), SaveOutcome::Fallback { entries: 3 });

        let loaded = store.load("p");
        assert_eq!(loaded.len(), 3);
        assert!(loaded.values().all(|r| r.file.is_some()));

        store.clear("p");
        assert!(store.load("p").is_empty());
    }

    #[test]
    fn test_primary_write_replaces_memory_copy() {
        let quota = serde_json::to_string(&records(2)).unwrap().len();
        let mut store = PersistentStore::new(
            Some(Box::new(MemoryBackend::with_quota(quota))),
            StoreConfig::default(),
        );
        assert_eq!(store.save("p", records(30)), SaveOutcome::Fallback { entries: 30 });
        assert_eq!(store.load("p").len(), 30);

        assert_eq!(store.save("p", records(2)), SaveOutcome::Stored { entries: 2 });
        assert_eq!(store.load("p").len(), 2);
    }

    #[test]
    fn test_file_names_keep_keys_apart() {
        let temp_dir = TempDir::new().unwrap();
        let backend = FileBackend::open(temp_dir.path()).unwrap();
        let mut store = PersistentStore::new(Some(Box::new(backend)), StoreConfig::default());

        store.save("a/b", records(1));
        store.save("a_b", records(2));
        store.save("a%2Fb", records(3));

        assert_eq!(store.load("a/b").len(), 1);
        assert_eq!(store.load("a_b").len(), 2);
        assert_eq!(store.load("a%2Fb").len(), 3);
        assert!(temp_dir.path().join("pendingUploads_a%2Fb.json").exists());
    }

    #[test]
    fn test_file_backend_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        {
            let backend = FileBackend::open(temp_dir.path()).unwrap();
            let mut store = PersistentStore::new(Some(Box::new(backend)), StoreConfig::default());
            store.save("project/with spaces", records(3));
        }

        let backend = FileBackend::open(temp_dir.path()).unwrap();
        let store = PersistentStore::new(Some(Box::new(backend)), StoreConfig::default());
        let loaded = store.load("project/with spaces");
        assert_eq!(loaded.len(), 3);
        assert!(store.load("other").is_empty());
    }

    #[test]
    fn test_corrupt_document_loads_empty() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("pendingUploads_p.json"), "{not json").unwrap();

        let backend = FileBackend::open(temp_dir.path()).unwrap();
        let store = PersistentStore::new(Some(Box::new(backend)), StoreConfig::default());
        assert!(store.load("p").is_empty());
    }

    #[test]
    fn test_terminal_tasks_drop_file_metadata() {
        use crate::task::{FilePayload, TaskKey};

        let payload = FilePayload::new(FileMeta::new("a.png", 3, "image/png"), vec![0; 3]);
        let mut task = UploadTask::new(TaskKey::new(1), "p", payload);
        assert!(PersistedUpload::from(&task).file.is_some());

        task.begin_attempt().unwrap();
        task.accept("srv-1", TaskStatus::Queued).unwrap();
        task.complete().unwrap();

        let record = PersistedUpload::from(&task);
        assert!(record.file.is_none());
        assert_eq!(record.status, TaskStatus::Completed);
    }
}
