use draftwork_domain::TaskId;
use tokio::sync::mpsc;

use crate::components::WorkerEvent;

/// Handed to executors so they can report how far along they are.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    worker_id: String,
    task_id: TaskId,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

impl ProgressReporter {
    pub fn new(
        worker_id: String,
        task_id: TaskId,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Self {
        Self {
            worker_id,
            task_id,
            events,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// `percent` is clamped to 100.
    pub fn report(&self, percent: u8, stage: Option<&str>) {
        let _ = self.events.send(WorkerEvent::Progress {
            worker_id: self.worker_id.clone(),
            task_id: self.task_id.clone(),
            percent: percent.min(100),
            stage: stage.map(str::to_string),
        });
    }

    /// Progress for step `done` of `total`.
    pub fn report_step(&self, done: usize, total: usize, stage: Option<&str>) {
        let percent = if total == 0 {
            100
        } else {
            ((done.min(total) * 100) / total) as u8
        };
        self.report(percent, stage);
    }

    /// Reporter whose events go nowhere, for running an executor directly.
    pub fn detached(task_id: impl Into<TaskId>) -> Self {
        let (events, _) = mpsc::unbounded_channel();
        Self::new("detached".to_string(), task_id.into(), events)
    }
}
