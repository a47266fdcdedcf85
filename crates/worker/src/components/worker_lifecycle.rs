use std::sync::Arc;

use draftwork_domain::{TaskError, TaskId, TaskOutput, WorkerClass};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

use super::{execute_assignment, Assignment, WorkerCommand, WorkerEvent};
use crate::executor_registry::ExecutorRegistry;
use crate::progress::ProgressReporter;

type Finished = (TaskId, Result<Result<TaskOutput, TaskError>, JoinError>);

/// Pool-side end of a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    id: String,
    class: WorkerClass,
    commands: mpsc::UnboundedSender<WorkerCommand>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn class(&self) -> WorkerClass {
        self.class
    }

    /// Hands the assignment back if the worker has exited.
    pub fn run(&self, assignment: Assignment) -> Result<(), Assignment> {
        if let Err(mpsc::error::SendError(WorkerCommand::Run(assignment))) =
            self.commands.send(WorkerCommand::Run(assignment))
        {
            return Err(assignment);
        }
        Ok(())
    }

    pub fn abort(&self, task_id: &str) -> bool {
        self.commands
            .send(WorkerCommand::Abort(task_id.to_string()))
            .is_ok()
    }

    /// Stops the worker, dropping whatever it is running.
    pub fn terminate(&self) {
        if self.commands.send(WorkerCommand::Terminate).is_err() {
            // loop already gone, make sure the task is too
            self.join.abort();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Terminates and waits for the worker loop to exit.
    pub async fn join(self) {
        self.terminate();
        if let Err(e) = self.join.await {
            if e.is_panic() {
                error!("Worker {} loop panicked", self.id);
            }
        }
    }
}

/// Starts a worker loop on the runtime. The worker runs one assignment at a
/// time; each execution is its own tokio task so an abort or a panic only
/// takes that execution down.
pub fn spawn_worker(
    id: String,
    class: WorkerClass,
    registry: Arc<ExecutorRegistry>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) -> WorkerHandle {
    let (commands, receiver) = mpsc::unbounded_channel();
    let join = tokio::spawn(worker_loop(id.clone(), registry, receiver, events));
    info!("Worker {} ({}) started", id, class);
    WorkerHandle {
        id,
        class,
        commands,
        join,
    }
}

async fn worker_loop(
    worker_id: String,
    registry: Arc<ExecutorRegistry>,
    mut commands: mpsc::UnboundedReceiver<WorkerCommand>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    let (finished_tx, mut finished_rx) = mpsc::unbounded_channel::<Finished>();
    let mut current: Option<(TaskId, AbortHandle)> = None;

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(WorkerCommand::Run(assignment)) => {
                    if let Some((busy_with, _)) = &current {
                        warn!(
                            "Worker {} busy with {}, rejecting {}",
                            worker_id, busy_with, assignment.task_id
                        );
                        let _ = events.send(WorkerEvent::Failed {
                            worker_id: worker_id.clone(),
                            task_id: assignment.task_id,
                            error: TaskError::unavailable(format!("worker {worker_id} 正忙")),
                        });
                        continue;
                    }
                    current = Some(start_execution(
                        &worker_id,
                        &registry,
                        assignment,
                        &events,
                        &finished_tx,
                    ));
                }
                Some(WorkerCommand::Abort(task_id)) => {
                    match current.take() {
                        Some((running, handle)) if running == task_id => {
                            handle.abort();
                            info!("Worker {} aborted task {}", worker_id, task_id);
                        }
                        other => {
                            debug!("Worker {} ignoring abort for {}", worker_id, task_id);
                            current = other;
                        }
                    }
                }
                Some(WorkerCommand::Terminate) | None => {
                    if let Some((task_id, handle)) = current.take() {
                        handle.abort();
                        debug!("Worker {} dropped task {} on terminate", worker_id, task_id);
                    }
                    break;
                }
            },
            Some((task_id, joined)) = finished_rx.recv() => {
                let owns = current.as_ref().is_some_and(|(running, _)| *running == task_id);
                if !owns {
                    // already aborted; the pool has moved on
                    continue;
                }
                current = None;

                let event = match joined {
                    Ok(Ok(output)) => WorkerEvent::Completed {
                        worker_id: worker_id.clone(),
                        task_id,
                        output,
                    },
                    Ok(Err(error)) => WorkerEvent::Failed {
                        worker_id: worker_id.clone(),
                        task_id,
                        error,
                    },
                    Err(e) if e.is_cancelled() => continue,
                    Err(e) => {
                        error!("Worker {} execution of {} panicked: {}", worker_id, task_id, e);
                        WorkerEvent::Failed {
                            worker_id: worker_id.clone(),
                            task_id,
                            error: TaskError::execution("任务执行过程中发生panic"),
                        }
                    }
                };
                if events.send(event).is_err() {
                    debug!("Worker {} event receiver gone, stopping", worker_id);
                    break;
                }
            }
        }
    }

    info!("Worker {} stopped", worker_id);
}

fn start_execution(
    worker_id: &str,
    registry: &Arc<ExecutorRegistry>,
    assignment: Assignment,
    events: &mpsc::UnboundedSender<WorkerEvent>,
    finished: &mpsc::UnboundedSender<Finished>,
) -> (TaskId, AbortHandle) {
    let task_id = assignment.task_id.clone();
    let reporter = ProgressReporter::new(worker_id.to_string(), task_id.clone(), events.clone());
    let registry = Arc::clone(registry);

    let execution =
        tokio::spawn(async move { execute_assignment(&registry, assignment, &reporter).await });
    let abort = execution.abort_handle();

    let finished = finished.clone();
    let id = task_id.clone();
    tokio::spawn(async move {
        let _ = finished.send((id, execution.await));
    });

    (task_id, abort)
}
