//! Persistence under a failing or undersized primary backend

use annotate_upload::{
    FileMeta, KvBackend, MemoryBackend, PersistedUpload, PersistedUploads, PersistentStore,
    SaveOutcome, StoreConfig, TaskStatus, UploadError,
};
use chrono::{DateTime, Duration, Utc};

/// Primary backend that rejects every write
struct FullBackend;

impl KvBackend for FullBackend {
    fn name(&self) -> &str {
        "full"
    }

    fn get(&self, _key: &str) -> annotate_upload::Result<Option<String>> {
        Ok(None)
    }

    fn set(&mut self, key: &str, _value: &str) -> annotate_upload::Result<()> {
        Err(UploadError::CapacityExceeded(key.to_string()))
    }

    fn remove(&mut self, _key: &str) -> annotate_upload::Result<()> {
        Ok(())
    }
}

fn uploads(count: i64) -> PersistedUploads {
    (0..count)
        .map(|i| {
            let name = format!("img-{:03}.png", i);
            let record = PersistedUpload {
                filename: name.clone(),
                status: TaskStatus::Queued,
                progress: 0,
                project_id: "p".to_string(),
                created: DateTime::<Utc>::UNIX_EPOCH + Duration::seconds(i),
                retry_count: 0,
                error: None,
                file: Some(FileMeta::new(name, 2_000_000, "image/png")),
            };
            (format!("task-{:03}", i), record)
        })
        .collect()
}

fn stripped_size(records: &PersistedUploads) -> usize {
    let stripped: PersistedUploads = records
        .iter()
        .map(|(id, r)| {
            let mut r = r.clone();
            r.file = None;
            (id.clone(), r)
        })
        .collect();
    serde_json::to_string(&stripped).unwrap().len()
}

#[test]
fn test_150_tasks_with_throwing_primary() {
    let mut store = PersistentStore::new(Some(Box::new(FullBackend)), StoreConfig::default());

    // Never panics or errors, the newest 100 stay in memory instead
    assert_eq!(store.save("p", uploads(150)), SaveOutcome::Fallback { entries: 100 });

    let loaded = store.load("p");
    assert_eq!(loaded.len(), 100);
    assert!(!loaded.contains_key("task-049"));
    assert!(loaded.contains_key("task-050"));
    assert!(loaded.contains_key("task-149"));
    assert!(loaded.values().all(|r| r.file.is_some()));
}

#[test]
fn test_150_tasks_strip_keeps_newest_100() {
    let all = uploads(150);
    let newest: PersistedUploads = all
        .iter()
        .filter(|(_, r)| r.created >= DateTime::<Utc>::UNIX_EPOCH + Duration::seconds(50))
        .map(|(id, r)| (id.clone(), r.clone()))
        .collect();
    let quota = stripped_size(&newest);

    let mut store = PersistentStore::new(
        Some(Box::new(MemoryBackend::with_quota(quota))),
        StoreConfig::default(),
    );
    assert_eq!(store.save("p", all), SaveOutcome::Stripped { entries: 100 });

    let loaded = store.load("p");
    assert_eq!(loaded.len(), 100);
    assert!(!loaded.contains_key("task-049"));
    assert!(loaded.contains_key("task-050"));
    assert!(loaded.contains_key("task-149"));
    assert!(loaded.values().all(|r| r.file.is_none()));
}

#[test]
fn test_150_tasks_truncate_to_newest_50() {
    let all = uploads(150);
    let newest: PersistedUploads = all
        .iter()
        .filter(|(_, r)| r.created >= DateTime::<Utc>::UNIX_EPOCH + Duration::seconds(100))
        .map(|(id, r)| (id.clone(), r.clone()))
        .collect();
    let quota = stripped_size(&newest);

    let mut store = PersistentStore::new(
        Some(Box::new(MemoryBackend::with_quota(quota))),
        StoreConfig::default(),
    );
    assert_eq!(store.save("p", all), SaveOutcome::Truncated { entries: 50 });

    let loaded = store.load("p");
    assert_eq!(loaded.len(), 50);
    let oldest = loaded.values().map(|r| r.created).min().unwrap();
    assert_eq!(oldest, DateTime::<Utc>::UNIX_EPOCH + Duration::seconds(100));
}

#[test]
fn test_without_primary_round_trips_in_memory() {
    let mut store = PersistentStore::in_memory(StoreConfig::default());
    assert_eq!(
        store.save("p", uploads(150)),
        SaveOutcome::Fallback { entries: 100 }
    );

    let loaded = store.load("p");
    assert_eq!(loaded.len(), 100);
    assert_eq!(loaded["task-149"].file.as_ref().unwrap().size, 2_000_000);

    store.clear("p");
    assert!(store.load("p").is_empty());
}
