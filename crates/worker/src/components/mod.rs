pub mod task_execution;
pub mod worker_lifecycle;

use draftwork_domain::{TaskError, TaskId, TaskOutput, TaskPayload, TaskType};

pub use task_execution::execute_assignment;
pub use worker_lifecycle::{spawn_worker, WorkerHandle};

/// A task handed to a worker. The payload moves with it.
#[derive(Debug)]
pub struct Assignment {
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub payload: TaskPayload,
}

#[derive(Debug)]
pub enum WorkerCommand {
    Run(Assignment),
    /// Drops the execution of `task_id` if it is still the current one
    Abort(TaskId),
    Terminate,
}

/// Everything a worker tells the pool.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Progress {
        worker_id: String,
        task_id: TaskId,
        percent: u8,
        stage: Option<String>,
    },
    Completed {
        worker_id: String,
        task_id: TaskId,
        output: TaskOutput,
    },
    Failed {
        worker_id: String,
        task_id: TaskId,
        error: TaskError,
    },
}

impl WorkerEvent {
    pub fn worker_id(&self) -> &str {
        match self {
            WorkerEvent::Progress { worker_id, .. }
            | WorkerEvent::Completed { worker_id, .. }
            | WorkerEvent::Failed { worker_id, .. } => worker_id,
        }
    }

    pub fn task_id(&self) -> &str {
        match self {
            WorkerEvent::Progress { task_id, .. }
            | WorkerEvent::Completed { task_id, .. }
            | WorkerEvent::Failed { task_id, .. } => task_id,
        }
    }
}
