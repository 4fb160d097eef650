use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use common::error::AppError;
use common::storage::types::ingestion_task::{
    IngestionPayload, IngestionTask, TaskStatus, TaskStatusView,
};
use common::utils::config::AppConfig;

use crate::pipeline::IngestionPipeline;

/// How long shutdown waits for a worker to finish its current task.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(30);

/// Work a queue worker knows how to run. The production implementation is
/// [`IngestionPipeline`]; the seam exists so worker behavior (panics,
/// deadlines) is testable without real embedding calls.
#[async_trait]
pub trait TaskProcessor: Send + Sync {
    async fn process(&self, task: &IngestionTask) -> Result<Vec<String>, AppError>;
}

#[async_trait]
impl TaskProcessor for IngestionPipeline {
    async fn process(&self, task: &IngestionTask) -> Result<Vec<String>, AppError> {
        IngestionPipeline::process(self, task).await
    }
}

/// In-memory task-status registry. One mutex guards both the map and the
/// eviction queue, so transitions and eviction serialize and a terminal
/// state can never regress.
pub struct TaskStatusMap {
    inner: Mutex<StatusInner>,
    retention: usize,
}

struct StatusInner {
    entries: HashMap<String, TaskStatusView>,
    terminal_order: VecDeque<String>,
}

impl TaskStatusMap {
    pub fn new(retention: usize) -> Self {
        Self {
            inner: Mutex::new(StatusInner {
                entries: HashMap::new(),
                terminal_order: VecDeque::new(),
            }),
            retention: retention.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StatusInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert_pending(&self, task: &IngestionTask) {
        let mut inner = self.lock();
        inner
            .entries
            .insert(task.id.clone(), TaskStatusView::pending(task));
    }

    /// Drops a never-enqueued entry (submission bounced on a full queue).
    fn forget(&self, task_id: &str) {
        let mut inner = self.lock();
        inner.entries.remove(task_id);
    }

    pub fn mark_running(&self, task_id: &str) {
        let mut inner = self.lock();
        if let Some(view) = inner.entries.get_mut(task_id) {
            if !view.status.is_terminal() {
                view.status = TaskStatus::Running;
            }
        }
    }

    /// Applies a terminal status. A task already terminal keeps its first
    /// outcome; eviction trims the oldest terminal entries past retention.
    pub fn finish(&self, task_id: &str, status: TaskStatus) {
        debug_assert!(status.is_terminal());
        let mut inner = self.lock();
        let Some(view) = inner.entries.get_mut(task_id) else {
            return;
        };
        if view.status.is_terminal() {
            return;
        }
        view.status = status;
        view.finished_at = Some(Utc::now());
        inner.terminal_order.push_back(task_id.to_string());

        while inner.entries.len() > self.retention {
            let Some(oldest) = inner.terminal_order.pop_front() else {
                break;
            };
            inner.entries.remove(&oldest);
        }
    }

    pub fn get(&self, task_id: &str) -> Option<TaskStatusView> {
        self.lock().entries.get(task_id).cloned()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    pub max_workers: usize,
    pub queue_capacity: usize,
    pub status_retention: usize,
    pub task_deadline: Duration,
}

impl From<&AppConfig> for QueueConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_workers: config.max_workers,
            queue_capacity: config.queue_capacity,
            status_retention: config.status_retention,
            task_deadline: Duration::from_secs(config.task_deadline_secs),
        }
    }
}

/// Bounded ingestion queue with a fixed worker pool. Submissions never
/// block; overflow fails fast with `QueueFull` and the caller decides
/// whether to retry.
pub struct TaskQueue {
    tx: mpsc::Sender<IngestionTask>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<IngestionTask>>>,
    status: Arc<TaskStatusMap>,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskQueue {
    pub fn start(processor: Arc<dyn TaskProcessor>, config: QueueConfig) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let status = Arc::new(TaskStatusMap::new(config.status_retention));
        let cancel = CancellationToken::new();

        let queue = Arc::new(Self {
            tx,
            rx: Arc::clone(&rx),
            status: Arc::clone(&status),
            cancel: cancel.clone(),
            workers: Mutex::new(Vec::new()),
        });

        let mut handles = Vec::with_capacity(config.max_workers.max(1));
        for worker_id in 0..config.max_workers.max(1) {
            handles.push(tokio::spawn(worker_loop(
                worker_id,
                Arc::clone(&processor),
                Arc::clone(&rx),
                Arc::clone(&status),
                cancel.clone(),
                config.task_deadline,
            )));
        }
        *queue.workers.lock().unwrap_or_else(|e| e.into_inner()) = handles;

        queue
    }

    /// Enqueues a task and returns its id immediately.
    pub fn submit(
        &self,
        payload: IngestionPayload,
        submitted_by: String,
    ) -> Result<String, AppError> {
        let task = IngestionTask::new(payload, submitted_by);
        let task_id = task.id.clone();
        self.status.insert_pending(&task);

        match self.tx.try_send(task) {
            Ok(()) => Ok(task_id),
            Err(TrySendError::Full(_)) => {
                self.status.forget(&task_id);
                warn!("ingestion queue full, rejecting submission");
                Err(AppError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => {
                self.status.forget(&task_id);
                Err(AppError::Internal("ingestion queue stopped".to_string()))
            }
        }
    }

    pub fn get_status(&self, task_id: &str) -> Result<TaskStatusView, AppError> {
        self.status
            .get(task_id)
            .ok_or_else(|| AppError::NotFound(format!("task {task_id}")))
    }

    /// Stops the pool: workers finish their current task within the drain
    /// deadline, then still-queued tasks are failed with `shutdown`.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let handles = {
            let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *workers)
        };
        for handle in handles {
            let abort = handle.abort_handle();
            if timeout(SHUTDOWN_DRAIN, handle).await.is_err() {
                warn!("worker exceeded shutdown drain, aborting");
                abort.abort();
            }
        }

        let mut receiver = self.rx.lock().await;
        while let Ok(task) = receiver.try_recv() {
            self.status.finish(
                &task.id,
                TaskStatus::Failed {
                    error: "shutdown".to_string(),
                },
            );
        }
        info!("ingestion queue stopped");
    }
}

async fn worker_loop(
    worker_id: usize,
    processor: Arc<dyn TaskProcessor>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<IngestionTask>>>,
    status: Arc<TaskStatusMap>,
    cancel: CancellationToken,
    task_deadline: Duration,
) {
    info!(worker_id, "ingestion worker started");
    loop {
        let task = {
            let mut receiver = rx.lock().await;
            tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                received = receiver.recv() => received,
            }
        };
        let Some(task) = task else {
            break;
        };

        let task_id = task.id.clone();
        status.mark_running(&task_id);

        // The pipeline runs in its own task so a panic surfaces as a
        // JoinError instead of killing the worker.
        let processor_for_task = Arc::clone(&processor);
        let join = tokio::spawn(async move { processor_for_task.process(&task).await });
        let abort = join.abort_handle();

        let outcome = match timeout(task_deadline, join).await {
            Err(_) => {
                abort.abort();
                warn!(worker_id, %task_id, "ingestion task exceeded deadline");
                TaskStatus::Failed {
                    error: format!("deadline of {task_deadline:?} exceeded"),
                }
            }
            Ok(Err(join_err)) if join_err.is_panic() => {
                error!(worker_id, %task_id, "ingestion task panicked");
                TaskStatus::Failed {
                    error: "ingestion task panicked".to_string(),
                }
            }
            Ok(Err(join_err)) => {
                error!(worker_id, %task_id, error = %join_err, "ingestion task aborted");
                TaskStatus::Failed {
                    error: "ingestion task aborted".to_string(),
                }
            }
            Ok(Ok(Ok(passage_ids))) => TaskStatus::Completed { passage_ids },
            Ok(Ok(Err(err))) => {
                warn!(worker_id, %task_id, error = %err, "ingestion task failed");
                TaskStatus::Failed {
                    error: err.to_string(),
                }
            }
        };
        status.finish(&task_id, outcome);
    }
    info!(worker_id, "ingestion worker stopped");
}
