use std::sync::Arc;

use draftwork_config::PoolConfig;
use draftwork_domain::{
    PoolStatus, ProgressEvent, Task, TaskError, TaskId, TaskOutput, TaskRequest, TaskStatus,
    WorkerInfo,
};
use draftwork_errors::{RuntimeError, RuntimeResult};
use draftwork_worker::ExecutorRegistry;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::coordinator::Coordinator;

pub type TaskResult = Result<TaskOutput, TaskError>;

/// Messages from [`WorkerPool`] handles to the coordinator.
pub(crate) enum PoolCommand {
    Submit {
        task: Task,
        progress: mpsc::UnboundedSender<ProgressEvent>,
        result: oneshot::Sender<TaskResult>,
    },
    Cancel {
        task_id: TaskId,
        reply: oneshot::Sender<bool>,
    },
    Status {
        task_id: TaskId,
        reply: oneshot::Sender<Option<TaskStatus>>,
    },
    PoolStatus {
        reply: oneshot::Sender<PoolStatus>,
    },
    Workers {
        reply: oneshot::Sender<Vec<WorkerInfo>>,
    },
    Maintain {
        reply: oneshot::Sender<usize>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Caller's end of a submitted task.
#[derive(Debug)]
pub struct TaskHandle {
    pub id: TaskId,
    /// Progress updates until the task finishes
    pub progress: mpsc::UnboundedReceiver<ProgressEvent>,
    /// Resolves exactly once
    pub result: oneshot::Receiver<TaskResult>,
}

impl TaskHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Waits for the outcome. A pool torn down without answering reads as
    /// unavailable.
    pub async fn wait(self) -> TaskResult {
        self.result
            .await
            .unwrap_or_else(|_| Err(TaskError::unavailable("worker pool stopped")))
    }
}

/// Cloneable handle to a running pool. All state lives in the coordinator
/// task; the handle only sends it messages.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    commands: mpsc::UnboundedSender<PoolCommand>,
    config: Arc<PoolConfig>,
}

impl WorkerPool {
    /// Starts the coordinator on the current runtime. Workers are spawned on
    /// demand.
    pub fn new(config: PoolConfig, registry: Arc<ExecutorRegistry>) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        info!(
            "Starting worker pool: document workers <= {}, text workers <= {}",
            config.max_document_workers, config.max_text_workers
        );
        let config = Arc::new(config);
        tokio::spawn(Coordinator::new((*config).clone(), registry).run(receiver));
        Self { commands, config }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Validates and enqueues the request. Never waits on execution.
    pub fn submit(&self, request: TaskRequest) -> RuntimeResult<TaskHandle> {
        request.validate()?;

        let task = Task::from_request(request, 0);
        let id = task.id.clone();
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = oneshot::channel();

        debug!("Submitting task {} ({}, {:?})", id, task.task_type, task.priority);
        self.commands
            .send(PoolCommand::Submit {
                task,
                progress: progress_tx,
                result: result_tx,
            })
            .map_err(|_| RuntimeError::WorkerUnavailable("worker pool is shut down".to_string()))?;

        Ok(TaskHandle {
            id,
            progress: progress_rx,
            result: result_rx,
        })
    }

    /// `false` for unknown or already finished tasks.
    pub async fn cancel(&self, task_id: &str) -> bool {
        self.request(|reply| PoolCommand::Cancel {
            task_id: task_id.to_string(),
            reply,
        })
        .await
        .unwrap_or(false)
    }

    pub async fn status(&self, task_id: &str) -> Option<TaskStatus> {
        self.request(|reply| PoolCommand::Status {
            task_id: task_id.to_string(),
            reply,
        })
        .await
        .flatten()
    }

    pub async fn pool_status(&self) -> PoolStatus {
        self.request(|reply| PoolCommand::PoolStatus { reply })
            .await
            .unwrap_or_default()
    }

    pub async fn worker_snapshot(&self) -> Vec<WorkerInfo> {
        self.request(|reply| PoolCommand::Workers { reply })
            .await
            .unwrap_or_default()
    }

    /// Reaps idle workers now instead of waiting for the next tick. Returns
    /// how many were removed.
    pub async fn run_maintenance(&self) -> usize {
        self.request(|reply| PoolCommand::Maintain { reply })
            .await
            .unwrap_or(0)
    }

    /// Cancels everything, terminates all workers and stops the coordinator.
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        if self
            .request(|reply| PoolCommand::Shutdown { reply })
            .await
            .is_none()
        {
            debug!("Worker pool already stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> PoolCommand,
    ) -> Option<T> {
        let (reply, response) = oneshot::channel();
        self.commands.send(command(reply)).ok()?;
        response.await.ok()
    }
}
