//! Task registry
//!
//! Owns every live [`UploadTask`] by its [`TaskKey`] and resolves client and
//! server ids to keys. Terminal tasks are swept out after a delay.

use crate::task::{FilePayload, TaskKey, TaskStatus, UploadTask};
use crate::{Result, UploadError};
use std::collections::{HashMap, VecDeque};
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Default)]
pub struct UploadRegistry {
    next_key: u64,
    tasks: HashMap<TaskKey, UploadTask>,
    aliases: HashMap<String, TaskKey>,
    removals: VecDeque<(Instant, TaskKey)>,
}

impl UploadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_key(&mut self) -> TaskKey {
        self.next_key += 1;
        TaskKey::new(self.next_key)
    }

    /// Most recently allocated key; tasks created later compare greater
    pub fn last_key(&self) -> TaskKey {
        TaskKey::new(self.next_key)
    }

    /// Create a task for a new file
    pub fn create(&mut self, project_id: &str, payload: FilePayload) -> TaskKey {
        let key = self.allocate_key();
        let task = UploadTask::new(key, project_id, payload);
        self.insert(task);
        key
    }

    /// Insert a task built from persisted state
    pub fn create_with(&mut self, build: impl FnOnce(TaskKey) -> UploadTask) -> TaskKey {
        let key = self.allocate_key();
        let task = build(key);
        self.insert(task);
        key
    }

    fn insert(&mut self, task: UploadTask) {
        let key = task.key();
        self.aliases.insert(task.client_id().to_string(), key);
        if let Some(server_id) = task.server_id() {
            self.aliases.insert(server_id.to_string(), key);
        }
        self.tasks.insert(key, task);
    }

    pub fn get(&self, key: TaskKey) -> Option<&UploadTask> {
        self.tasks.get(&key)
    }

    pub fn get_mut(&mut self, key: TaskKey) -> Option<&mut UploadTask> {
        self.tasks.get_mut(&key)
    }

    fn task_mut(&mut self, key: TaskKey) -> Result<&mut UploadTask> {
        self.tasks
            .get_mut(&key)
            .ok_or_else(|| UploadError::TaskNotFound(key.to_string()))
    }

    /// Resolve a client or server id
    pub fn resolve(&self, id: &str) -> Option<TaskKey> {
        self.aliases.get(id).copied()
    }

    /// Start a transfer, dropping the alias of any previous server id
    pub fn begin_attempt(&mut self, key: TaskKey) -> Result<u32> {
        let task = self.task_mut(key)?;
        let previous = task.server_id().map(str::to_string);
        let attempt = task.begin_attempt()?;
        if let Some(previous) = previous {
            self.aliases.remove(&previous);
        }
        Ok(attempt)
    }

    /// Record the server's task id for `key`
    pub fn accept(&mut self, key: TaskKey, server_id: &str, status: TaskStatus) -> Result<()> {
        self.task_mut(key)?.accept(server_id, status)?;
        self.aliases.insert(server_id.to_string(), key);
        debug!("Task {} is known to the server as {}", key, server_id);
        Ok(())
    }

    /// Sweep `key` out at `at`
    pub fn schedule_removal(&mut self, key: TaskKey, at: Instant) {
        self.removals.push_back((at, key));
    }

    pub fn next_removal(&self) -> Option<Instant> {
        self.removals.front().map(|(at, _)| *at)
    }

    /// Remove every task whose removal time has passed
    pub fn sweep(&mut self, now: Instant) -> Vec<UploadTask> {
        let mut removed = Vec::new();
        while let Some((at, key)) = self.removals.front().copied() {
            if at > now {
                break;
            }
            self.removals.pop_front();

            // A retried task may have left the terminal state again
            let terminal = self
                .tasks
                .get(&key)
                .map_or(false, |task| task.status().is_terminal());
            if !terminal {
                continue;
            }
            if let Some(task) = self.tasks.remove(&key) {
                self.aliases.remove(task.client_id());
                if let Some(server_id) = task.server_id() {
                    self.aliases.remove(server_id);
                }
                removed.push(task);
            }
        }

        if !removed.is_empty() {
            debug!("Swept {} finished tasks", removed.len());
        }
        removed
    }

    /// Tasks of one project, oldest first
    pub fn project_tasks<'a>(&'a self, project_id: &'a str) -> Vec<&'a UploadTask> {
        let mut tasks: Vec<&UploadTask> = self
            .tasks
            .values()
            .filter(|task| task.project_id() == project_id)
            .collect();
        tasks.sort_by_key(|task| task.key());
        tasks
    }

    pub fn iter(&self) -> impl Iterator<Item = &UploadTask> {
        self.tasks.values()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
