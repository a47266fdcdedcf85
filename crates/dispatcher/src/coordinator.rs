use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use draftwork_config::PoolConfig;
use draftwork_domain::{
    ClassStatus, PoolStatus, ProgressEvent, Task, TaskError, TaskId, TaskStatus, WorkerClass,
    WorkerInfo,
};
use draftwork_worker::{spawn_worker, Assignment, ExecutorRegistry, WorkerEvent, WorkerHandle};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::pool::{PoolCommand, TaskResult};

/// A submitted task together with the channels back to its submitter.
struct TaskEntry {
    task: Task,
    progress: mpsc::UnboundedSender<ProgressEvent>,
    result: oneshot::Sender<TaskResult>,
}

struct RunningTask {
    entry: TaskEntry,
    worker_id: String,
    deadline_timer: Option<JoinHandle<()>>,
}

struct WorkerSlot {
    handle: WorkerHandle,
    info: WorkerInfo,
}

/// Owns every piece of pool state. Runs as a single task; handles, workers
/// and deadline timers reach it only through channels.
pub(crate) struct Coordinator {
    config: PoolConfig,
    registry: Arc<ExecutorRegistry>,
    /// Sorted by (priority, sequence)
    queue: Vec<TaskEntry>,
    running: HashMap<TaskId, RunningTask>,
    /// In creation order
    workers: Vec<WorkerSlot>,
    finished: HashMap<TaskId, TaskStatus>,
    finished_order: VecDeque<TaskId>,
    next_sequence: u64,
    next_document_worker: u64,
    next_text_worker: u64,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<WorkerEvent>>,
    deadlines_tx: mpsc::UnboundedSender<TaskId>,
    deadlines_rx: Option<mpsc::UnboundedReceiver<TaskId>>,
}

impl Coordinator {
    pub(crate) fn new(config: PoolConfig, registry: Arc<ExecutorRegistry>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (deadlines_tx, deadlines_rx) = mpsc::unbounded_channel();
        Self {
            config,
            registry,
            queue: Vec::new(),
            running: HashMap::new(),
            workers: Vec::new(),
            finished: HashMap::new(),
            finished_order: VecDeque::new(),
            next_sequence: 0,
            next_document_worker: 0,
            next_text_worker: 0,
            events_tx,
            events_rx: Some(events_rx),
            deadlines_tx,
            deadlines_rx: Some(deadlines_rx),
        }
    }

    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<PoolCommand>) {
        let (Some(mut events), Some(mut deadlines)) =
            (self.events_rx.take(), self.deadlines_rx.take())
        else {
            error!("Worker pool coordinator started twice");
            return;
        };

        let period = self.config.maintenance_interval.max(Duration::from_millis(1));
        let mut maintenance = interval_at(Instant::now() + period, period);
        maintenance.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(PoolCommand::Shutdown { reply }) => {
                        commands.close();
                        self.shutdown().await;
                        drain_closed(&mut commands);
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("All worker pool handles dropped");
                        self.shutdown().await;
                        break;
                    }
                },
                Some(event) = events.recv() => self.handle_worker_event(event),
                Some(task_id) = deadlines.recv() => self.handle_deadline(task_id),
                _ = maintenance.tick() => {
                    self.run_maintenance();
                }
            }
        }

        info!("Worker pool coordinator stopped");
    }

    fn handle_command(&mut self, command: PoolCommand) {
        match command {
            PoolCommand::Submit {
                task,
                progress,
                result,
            } => {
                self.enqueue(TaskEntry {
                    task,
                    progress,
                    result,
                });
                self.dispatch();
            }
            PoolCommand::Cancel { task_id, reply } => {
                let cancelled = self.cancel(&task_id);
                let _ = reply.send(cancelled);
            }
            PoolCommand::Status { task_id, reply } => {
                let _ = reply.send(self.status(&task_id));
            }
            PoolCommand::PoolStatus { reply } => {
                let _ = reply.send(self.pool_status());
            }
            PoolCommand::Workers { reply } => {
                let _ = reply.send(self.workers.iter().map(|w| w.info.clone()).collect());
            }
            PoolCommand::Maintain { reply } => {
                let _ = reply.send(self.run_maintenance());
            }
            // handled by the loop
            PoolCommand::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn enqueue(&mut self, mut entry: TaskEntry) {
        entry.task.sequence = self.next_sequence;
        self.next_sequence += 1;

        let key = (entry.task.priority, entry.task.sequence);
        let position = self
            .queue
            .partition_point(|queued| (queued.task.priority, queued.task.sequence) <= key);
        debug!(
            "Task {} queued at position {} ({:?})",
            entry.task.id, position, entry.task.priority
        );
        self.queue.insert(position, entry);
    }

    /// Makes sure each class with queued work has workers for it, then hands
    /// queued tasks to idle workers in priority order.
    fn dispatch(&mut self) {
        for class in WorkerClass::ALL {
            let queued = self
                .queue
                .iter()
                .filter(|entry| entry.task.worker_class == class)
                .count();
            if queued == 0 {
                continue;
            }

            let cap = self.class_cap(class);
            while self.idle_count(class) < queued && self.class_count(class) < cap {
                self.spawn_worker(class);
            }
        }

        let mut still_queued = Vec::with_capacity(self.queue.len());
        for entry in std::mem::take(&mut self.queue) {
            match self.idle_worker(entry.task.worker_class) {
                Some(index) => {
                    if let Some(entry) = self.assign(entry, index) {
                        still_queued.push(entry);
                    }
                }
                None => still_queued.push(entry),
            }
        }
        self.queue = still_queued;
    }

    /// Hands `entry` to the worker at `index`. Gives the entry back if the
    /// worker turned out to be gone.
    fn assign(&mut self, mut entry: TaskEntry, index: usize) -> Option<TaskEntry> {
        let Some(payload) = entry.task.payload.take() else {
            error!("Task {} has no payload left to run", entry.task.id);
            self.finish(
                entry,
                TaskStatus::Failed,
                Err(TaskError::execution("任务载荷丢失")),
            );
            return None;
        };

        let assignment = Assignment {
            task_id: entry.task.id.clone(),
            task_type: entry.task.task_type,
            payload,
        };
        if let Err(assignment) = self.workers[index].handle.run(assignment) {
            let slot = self.workers.remove(index);
            warn!("Worker {} exited unexpectedly, requeueing {}", slot.info.id, entry.task.id);
            entry.task.payload = Some(assignment.payload);
            return Some(entry);
        }

        let slot = &mut self.workers[index];
        slot.info.current_task = Some(entry.task.id.clone());
        slot.info.task_count += 1;
        slot.info.last_active_at = Utc::now();
        let worker_id = slot.info.id.clone();

        entry.task.mark_running();
        info!(
            "Task {} ({}) assigned to {}",
            entry.task.id, entry.task.task_type, worker_id
        );

        let deadline_timer = entry
            .task
            .deadline
            .or(self.config.default_task_timeout)
            .map(|deadline| self.arm_deadline(entry.task.id.clone(), deadline));

        self.running.insert(
            entry.task.id.clone(),
            RunningTask {
                entry,
                worker_id,
                deadline_timer,
            },
        );
        None
    }

    fn arm_deadline(&self, task_id: TaskId, deadline: Duration) -> JoinHandle<()> {
        let deadlines = self.deadlines_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            let _ = deadlines.send(task_id);
        })
    }

    fn handle_worker_event(&mut self, event: WorkerEvent) {
        let owned = self
            .running
            .get(event.task_id())
            .is_some_and(|running| running.worker_id == event.worker_id());
        if !owned {
            debug!(
                "Discarding event for task {} from {}: no longer owned",
                event.task_id(),
                event.worker_id()
            );
            return;
        }

        match event {
            WorkerEvent::Progress {
                task_id,
                percent,
                stage,
                ..
            } => {
                if let Some(running) = self.running.get_mut(&task_id) {
                    running.entry.task.set_progress(percent);
                    let _ = running.entry.progress.send(ProgressEvent {
                        task_id,
                        percent: running.entry.task.progress,
                        stage,
                    });
                }
            }
            WorkerEvent::Completed {
                worker_id,
                task_id,
                output,
            } => {
                if let Some(running) = self.take_running(&task_id) {
                    self.release_worker(&worker_id, true);
                    self.finish(running.entry, TaskStatus::Completed, Ok(output));
                }
                self.dispatch();
            }
            WorkerEvent::Failed {
                worker_id,
                task_id,
                error,
            } => {
                if let Some(running) = self.take_running(&task_id) {
                    self.release_worker(&worker_id, false);
                    self.finish(running.entry, TaskStatus::Failed, Err(error));
                }
                self.dispatch();
            }
        }
    }

    fn handle_deadline(&mut self, task_id: TaskId) {
        let Some(running) = self.take_running(&task_id) else {
            return;
        };
        let deadline = running
            .entry
            .task
            .deadline
            .or(self.config.default_task_timeout)
            .unwrap_or_default();
        warn!("任务执行超时: {} after {:?}", task_id, deadline);

        if let Some(slot) = self.worker_mut(&running.worker_id) {
            slot.handle.abort(&task_id);
        }
        self.release_worker(&running.worker_id, false);
        self.finish(
            running.entry,
            TaskStatus::Failed,
            Err(TaskError::timeout(format!(
                "task {task_id} exceeded its deadline of {}ms",
                deadline.as_millis()
            ))),
        );
        self.dispatch();
    }

    fn cancel(&mut self, task_id: &str) -> bool {
        if let Some(position) = self.queue.iter().position(|e| e.task.id == task_id) {
            let entry = self.queue.remove(position);
            info!("Cancelled queued task {}", task_id);
            self.finish(
                entry,
                TaskStatus::Cancelled,
                Err(TaskError::cancelled("任务已被取消")),
            );
            return true;
        }

        let Some(running) = self.take_running(task_id) else {
            return false;
        };
        if let Some(slot) = self.worker_mut(&running.worker_id) {
            slot.handle.abort(task_id);
        }
        // a cancellation is not the worker's fault
        self.release_worker(&running.worker_id, true);
        info!("Cancelled running task {} on {}", task_id, running.worker_id);
        self.finish(
            running.entry,
            TaskStatus::Cancelled,
            Err(TaskError::cancelled("任务已被取消")),
        );
        self.dispatch();
        true
    }

    fn take_running(&mut self, task_id: &str) -> Option<RunningTask> {
        let running = self.running.remove(task_id)?;
        if let Some(timer) = &running.deadline_timer {
            timer.abort();
        }
        Some(running)
    }

    /// Frees the worker. Failures count towards retirement; at the ceiling
    /// the worker is terminated and a fresh one takes its place.
    fn release_worker(&mut self, worker_id: &str, succeeded: bool) {
        let max_errors = self.config.max_errors_per_worker;
        let Some(index) = self.workers.iter().position(|w| w.info.id == worker_id) else {
            return;
        };

        let slot = &mut self.workers[index];
        slot.info.current_task = None;
        slot.info.last_active_at = Utc::now();
        if succeeded {
            slot.info.consecutive_errors = 0;
            return;
        }

        slot.info.consecutive_errors += 1;
        if slot.info.consecutive_errors < max_errors {
            return;
        }

        let retired = self.workers.remove(index);
        warn!(
            "Worker {} 连续失败 {} 次，已退役",
            retired.info.id, retired.info.consecutive_errors
        );
        retired.handle.terminate();
        self.spawn_worker(retired.info.class);
    }

    fn finish(&mut self, mut entry: TaskEntry, status: TaskStatus, outcome: TaskResult) {
        entry.task.finish(status);
        let task_id = entry.task.id.clone();
        match &outcome {
            Ok(_) => info!("Task {} completed", task_id),
            Err(e) => info!("Task {} ended as {:?}: {}", task_id, status, e),
        }
        if entry.result.send(outcome).is_err() {
            debug!("Submitter of task {} stopped waiting", task_id);
        }
        self.remember(task_id, status);
    }

    fn remember(&mut self, task_id: TaskId, status: TaskStatus) {
        let capacity = self.config.finished_history;
        if capacity == 0 {
            return;
        }
        while self.finished_order.len() >= capacity {
            if let Some(oldest) = self.finished_order.pop_front() {
                self.finished.remove(&oldest);
            }
        }
        self.finished_order.push_back(task_id.clone());
        self.finished.insert(task_id, status);
    }

    fn status(&self, task_id: &str) -> Option<TaskStatus> {
        if let Some(running) = self.running.get(task_id) {
            return Some(running.entry.task.status);
        }
        if let Some(entry) = self.queue.iter().find(|e| e.task.id == task_id) {
            return Some(entry.task.status);
        }
        self.finished.get(task_id).copied()
    }

    fn pool_status(&self) -> PoolStatus {
        let mut status = PoolStatus {
            queue_depth: self.queue.len(),
            running_count: self.running.len(),
            ..Default::default()
        };
        for slot in &self.workers {
            let class: &mut ClassStatus = status.class_mut(slot.info.class);
            class.total += 1;
            if slot.info.is_busy() {
                class.busy += 1;
            }
        }
        status
    }

    /// Terminates idle workers past the idle timeout and forgets workers
    /// whose loop has already exited.
    fn run_maintenance(&mut self) -> usize {
        let now = Utc::now();
        let idle_timeout = self.config.idle_timeout;
        let before = self.workers.len();

        self.workers.retain(|slot| {
            if slot.handle.is_finished() && !slot.info.is_busy() {
                warn!("Removing exited worker {}", slot.info.id);
                return false;
            }
            if slot.info.is_idle_longer_than(idle_timeout, now) {
                info!("Reaping idle worker {}", slot.info.id);
                slot.handle.terminate();
                return false;
            }
            true
        });

        let reaped = before - self.workers.len();
        if reaped > 0 {
            debug!("Maintenance removed {} workers, {} left", reaped, self.workers.len());
        }
        reaped
    }

    async fn shutdown(&mut self) {
        info!(
            "Shutting down worker pool: {} queued, {} running, {} workers",
            self.queue.len(),
            self.running.len(),
            self.workers.len()
        );

        for entry in std::mem::take(&mut self.queue) {
            self.finish(
                entry,
                TaskStatus::Cancelled,
                Err(TaskError::cancelled("worker pool shutting down")),
            );
        }

        let running: Vec<TaskId> = self.running.keys().cloned().collect();
        for task_id in running {
            if let Some(running) = self.take_running(&task_id) {
                self.finish(
                    running.entry,
                    TaskStatus::Cancelled,
                    Err(TaskError::cancelled("worker pool shutting down")),
                );
            }
        }

        for slot in std::mem::take(&mut self.workers) {
            slot.handle.join().await;
        }
    }

    fn spawn_worker(&mut self, class: WorkerClass) {
        let id = match class {
            WorkerClass::Document => {
                self.next_document_worker += 1;
                format!("doc-worker-{}", self.next_document_worker)
            }
            WorkerClass::Text => {
                self.next_text_worker += 1;
                format!("text-worker-{}", self.next_text_worker)
            }
        };
        let handle = spawn_worker(
            id.clone(),
            class,
            Arc::clone(&self.registry),
            self.events_tx.clone(),
        );
        self.workers.push(WorkerSlot {
            handle,
            info: WorkerInfo::new(id, class),
        });
    }

    fn worker_mut(&mut self, worker_id: &str) -> Option<&mut WorkerSlot> {
        self.workers.iter_mut().find(|w| w.info.id == worker_id)
    }

    fn idle_worker(&self, class: WorkerClass) -> Option<usize> {
        self.workers
            .iter()
            .position(|w| w.info.class == class && !w.info.is_busy())
    }

    fn idle_count(&self, class: WorkerClass) -> usize {
        self.workers
            .iter()
            .filter(|w| w.info.class == class && !w.info.is_busy())
            .count()
    }

    fn class_count(&self, class: WorkerClass) -> usize {
        self.workers.iter().filter(|w| w.info.class == class).count()
    }

    fn class_cap(&self, class: WorkerClass) -> usize {
        match class {
            WorkerClass::Document => self.config.max_document_workers,
            WorkerClass::Text => self.config.max_text_workers,
        }
    }
}

/// Answers whatever was still buffered when the command channel closed.
fn drain_closed(commands: &mut mpsc::UnboundedReceiver<PoolCommand>) {
    while let Ok(command) = commands.try_recv() {
        match command {
            PoolCommand::Submit { task, result, .. } => {
                debug!("Rejecting task {} submitted during shutdown", task.id);
                let _ = result.send(Err(TaskError::unavailable("worker pool is shut down")));
            }
            PoolCommand::Cancel { reply, .. } => {
                let _ = reply.send(false);
            }
            PoolCommand::Shutdown { reply } => {
                let _ = reply.send(());
            }
            // dropping the reply reads as an empty answer
            _ => {}
        }
    }
}
