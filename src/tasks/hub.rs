use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Local;
use shipwright_common::{Command, Task, TaskStatus};
use tokio::sync::Mutex;

/// Registry of one project's asynchronous tasks.
///
/// Ids start at 1 and are never reused. Tasks are kept for the life of the
/// process.
pub struct TaskHub {
    project: String,
    next_id: AtomicU64,
    tasks: Mutex<HashMap<u64, Arc<Mutex<Task>>>>,
}

impl TaskHub {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            next_id: AtomicU64::new(0),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    /// Register a new Waiting task and return its id.
    pub async fn create(&self, command: Command) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let task = Task {
            id,
            status: TaskStatus::Waiting,
            messages: vec![stamp(&format!("created {}", command.kind))],
            command,
        };
        self.tasks.lock().await.insert(id, Arc::new(Mutex::new(task)));
        tracing::debug!(project = %self.project, task_id = id, "task created");
        id
    }

    /// Move a task forward. Returns false (and changes nothing) for unknown
    /// ids and for transitions that would go backwards.
    pub async fn change_status(&self, id: u64, status: TaskStatus) -> bool {
        let Some(entry) = self.entry(id).await else {
            return false;
        };
        let mut task = entry.lock().await;
        if !task.status.can_advance_to(status) {
            tracing::warn!(
                project = %self.project,
                task_id = id,
                from = %task.status,
                to = %status,
                "rejected task status change"
            );
            return false;
        }
        task.status = status;
        task.messages.push(stamp(&format!("change status: {}", status)));
        true
    }

    pub async fn append_message(&self, id: u64, message: &str) {
        if let Some(entry) = self.entry(id).await {
            entry.lock().await.messages.push(stamp(message));
        }
    }

    /// Record `message` and mark the task Error.
    pub async fn fail(&self, id: u64, message: &str) {
        self.append_message(id, message).await;
        self.change_status(id, TaskStatus::Error).await;
    }

    pub async fn get(&self, id: u64) -> Option<Task> {
        let entry = self.entry(id).await?;
        let task = entry.lock().await.clone();
        Some(task)
    }

    /// Point-in-time copy of every task, ordered by id.
    pub async fn all(&self) -> BTreeMap<u64, Task> {
        let entries: Vec<(u64, Arc<Mutex<Task>>)> = self
            .tasks
            .lock()
            .await
            .iter()
            .map(|(id, entry)| (*id, Arc::clone(entry)))
            .collect();

        let mut snapshot = BTreeMap::new();
        for (id, entry) in entries {
            snapshot.insert(id, entry.lock().await.clone());
        }
        snapshot
    }

    async fn entry(&self, id: u64) -> Option<Arc<Mutex<Task>>> {
        self.tasks.lock().await.get(&id).cloned()
    }
}

fn stamp(message: &str) -> String {
    format!("[{}] {}", Local::now().format("%Y-%m-%d %H:%M:%S"), message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipwright_common::CommandKind;

    fn command() -> Command {
        Command::new("helix", "dev", CommandKind::GitGenerate)
    }

    #[tokio::test]
    async fn ids_are_monotonic_from_one() {
        let hub = TaskHub::new("helix");
        let a = hub.create(command()).await;
        let b = hub.create(command()).await;
        let c = hub.create(command()).await;
        assert_eq!((a, b, c), (1, 2, 3));
    }

    #[tokio::test]
    async fn concurrent_creates_never_share_an_id() {
        let hub = Arc::new(TaskHub::new("helix"));
        let mut handles = Vec::new();
        for _ in 0..32 {
            let hub = Arc::clone(&hub);
            handles.push(tokio::spawn(async move { hub.create(command()).await }));
        }
        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap());
        }
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 32);
        assert_eq!(hub.all().await.len(), 32);
    }

    #[tokio::test]
    async fn status_only_moves_forward() {
        let hub = TaskHub::new("helix");
        let id = hub.create(command()).await;

        assert!(hub.change_status(id, TaskStatus::Processing).await);
        assert!(!hub.change_status(id, TaskStatus::Waiting).await);
        assert!(hub.change_status(id, TaskStatus::Completed).await);
        assert!(!hub.change_status(id, TaskStatus::Error).await);

        let task = hub.get(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.messages.len(), 3);
        assert!(task.messages[1].ends_with("change status: processing"));
        assert!(task.messages[2].ends_with("change status: completed"));
    }

    #[tokio::test]
    async fn fail_records_message_then_error() {
        let hub = TaskHub::new("helix");
        let id = hub.create(command()).await;
        hub.fail(id, "queue full").await;

        let task = hub.get(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Error);
        assert!(task.messages.iter().any(|m| m.ends_with("queue full")));
    }

    #[tokio::test]
    async fn unknown_ids_are_ignored() {
        let hub = TaskHub::new("helix");
        assert!(!hub.change_status(42, TaskStatus::Processing).await);
        hub.append_message(42, "nothing").await;
        assert!(hub.get(42).await.is_none());
    }

    #[tokio::test]
    async fn snapshot_is_detached_from_later_changes() {
        let hub = TaskHub::new("helix");
        let id = hub.create(command()).await;
        let snapshot = hub.all().await;
        hub.change_status(id, TaskStatus::Processing).await;

        assert_eq!(snapshot[&id].status, TaskStatus::Waiting);
        assert_eq!(hub.get(id).await.unwrap().status, TaskStatus::Processing);
    }
}
