use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use shipwright_common::{Command, TaskStatus};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::errors::{CoordinatorError, WorkerError};

use super::hub::TaskHub;

/// Executes the command behind a task. Implemented by the coordinator.
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    async fn dispatch(&self, task_id: u64, command: &Command) -> Result<(), CoordinatorError>;
}

/// Bounded, de-duplicating queue of task ids for one project.
///
/// Every task is attempted at most once: a failure is recorded on the task
/// and never retried.
pub struct Worker {
    project: String,
    hub: Arc<TaskHub>,
    tx: mpsc::Sender<u64>,
    rx: Mutex<Option<mpsc::Receiver<u64>>>,
    queued: Mutex<HashSet<u64>>,
}

impl Worker {
    pub fn new(project: impl Into<String>, hub: Arc<TaskHub>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            project: project.into(),
            hub,
            tx,
            rx: Mutex::new(Some(rx)),
            queued: Mutex::new(HashSet::new()),
        }
    }

    /// Queue a task. Returns `Ok(false)` when it is already queued.
    ///
    /// A task that cannot be queued is marked Error before returning.
    pub async fn add(&self, task_id: u64) -> Result<bool, WorkerError> {
        let mut queued = self.queued.lock().await;
        if queued.contains(&task_id) {
            return Ok(false);
        }

        match self.tx.try_send(task_id) {
            Ok(()) => {
                queued.insert(task_id);
                tracing::debug!(project = %self.project, task_id, "task queued");
                Ok(true)
            }
            Err(TrySendError::Full(_)) => {
                drop(queued);
                self.hub.fail(task_id, "task queue full").await;
                Err(WorkerError::QueueFull {
                    project: self.project.clone(),
                    task_id,
                })
            }
            Err(TrySendError::Closed(_)) => {
                drop(queued);
                self.hub.fail(task_id, "worker stopped").await;
                Err(WorkerError::Stopped {
                    project: self.project.clone(),
                })
            }
        }
    }

    pub async fn queued(&self) -> usize {
        self.queued.lock().await.len()
    }

    /// Spawn the processing loop. Returns `None` if it was already started.
    pub async fn start(
        self: &Arc<Self>,
        dispatcher: Arc<dyn TaskDispatcher>,
        cancel: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        let rx = self.rx.lock().await.take()?;
        let worker = Arc::clone(self);
        Some(tokio::spawn(async move {
            worker.run(rx, dispatcher, cancel).await
        }))
    }

    async fn run(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<u64>,
        dispatcher: Arc<dyn TaskDispatcher>,
        cancel: CancellationToken,
    ) {
        tracing::info!(project = %self.project, "worker started");

        loop {
            let task_id = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Some(id) => id,
                    None => break,
                },
            };

            self.queued.lock().await.remove(&task_id);
            self.process(task_id, dispatcher.as_ref()).await;
        }

        rx.close();
        let mut discarded = 0usize;
        while let Ok(task_id) = rx.try_recv() {
            self.queued.lock().await.remove(&task_id);
            self.hub.fail(task_id, "discarded at shutdown").await;
            discarded += 1;
        }
        tracing::info!(project = %self.project, discarded, "worker stopped");
    }

    async fn process(&self, task_id: u64, dispatcher: &dyn TaskDispatcher) {
        let Some(task) = self.hub.get(task_id).await else {
            tracing::warn!(project = %self.project, task_id, "queued task vanished");
            return;
        };
        if !self.hub.change_status(task_id, TaskStatus::Processing).await {
            return;
        }

        tracing::info!(project = %self.project, task_id, command = %task.command.kind, "task started");
        match dispatcher.dispatch(task_id, &task.command).await {
            Ok(()) => {
                self.hub.change_status(task_id, TaskStatus::Completed).await;
                tracing::info!(project = %self.project, task_id, "task completed");
            }
            Err(e) => {
                self.hub.fail(task_id, &format!("error: {}", e)).await;
                tracing::error!(project = %self.project, task_id, error = %e, "task failed");
            }
        }
    }
}
