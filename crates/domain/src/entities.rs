use std::time::Duration;

use chrono::{DateTime, Utc};
use draftwork_errors::{RuntimeError, RuntimeResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type TaskId = String;

/// Result value produced by a worker; adapters deserialize it into their
/// typed result.
pub type TaskOutput = serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskType {
    #[serde(rename = "parse-text")]
    ParseText,
    #[serde(rename = "parse-pdf")]
    ParsePdf,
    #[serde(rename = "parse-docx")]
    ParseDocx,
    #[serde(rename = "process-text")]
    ProcessText,
    #[serde(rename = "enhance-text")]
    EnhanceText,
}

impl TaskType {
    pub const ALL: [TaskType; 5] = [
        TaskType::ParseText,
        TaskType::ParsePdf,
        TaskType::ParseDocx,
        TaskType::ProcessText,
        TaskType::EnhanceText,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::ParseText => "parse-text",
            TaskType::ParsePdf => "parse-pdf",
            TaskType::ParseDocx => "parse-docx",
            TaskType::ProcessText => "process-text",
            TaskType::EnhanceText => "enhance-text",
        }
    }

    /// The sub-pool allowed to run this type.
    pub fn worker_class(&self) -> WorkerClass {
        match self {
            TaskType::ParseText | TaskType::ParsePdf | TaskType::ParseDocx => WorkerClass::Document,
            TaskType::ProcessText | TaskType::EnhanceText => WorkerClass::Text,
        }
    }
}

impl std::str::FromStr for TaskType {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| RuntimeError::validation(format!("unknown task type: {s}")))
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lower value is served first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    #[serde(rename = "HIGH")]
    High = 0,
    #[default]
    #[serde(rename = "NORMAL")]
    Normal = 1,
    #[serde(rename = "LOW")]
    Low = 2,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    #[serde(rename = "QUEUED")]
    Queued,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "CANCELLED")]
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WorkerClass {
    #[serde(rename = "document")]
    Document,
    #[serde(rename = "text")]
    Text,
}

impl WorkerClass {
    pub const ALL: [WorkerClass; 2] = [WorkerClass::Document, WorkerClass::Text];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerClass::Document => "document",
            WorkerClass::Text => "text",
        }
    }
}

impl std::fmt::Display for WorkerClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Work handed to a worker. Moved, never shared, across the worker boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskPayload {
    Document {
        bytes: Vec<u8>,
        file_name: String,
        mime_type: Option<String>,
    },
    Text {
        text: String,
        #[serde(default)]
        options: serde_json::Value,
    },
}

impl TaskPayload {
    pub fn text<S: Into<String>>(text: S) -> Self {
        TaskPayload::Text {
            text: text.into(),
            options: serde_json::Value::Null,
        }
    }

    pub fn size_bytes(&self) -> usize {
        match self {
            TaskPayload::Document { bytes, .. } => bytes.len(),
            TaskPayload::Text { text, .. } => text.len(),
        }
    }
}

/// What a caller hands to `submit`.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub task_type: TaskType,
    pub payload: TaskPayload,
    pub priority: Priority,
    /// Defaults to the type's natural class.
    pub worker_class: Option<WorkerClass>,
    pub deadline: Option<Duration>,
}

impl TaskRequest {
    pub fn new(task_type: TaskType, payload: TaskPayload) -> Self {
        Self {
            task_type,
            payload,
            priority: Priority::Normal,
            worker_class: None,
            deadline: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_worker_class(mut self, worker_class: WorkerClass) -> Self {
        self.worker_class = Some(worker_class);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn resolved_class(&self) -> WorkerClass {
        self.worker_class
            .unwrap_or_else(|| self.task_type.worker_class())
    }

    /// Rejects class/type mismatches and payloads of the wrong kind.
    pub fn validate(&self) -> RuntimeResult<()> {
        let natural = self.task_type.worker_class();
        if let Some(requested) = self.worker_class {
            if requested != natural {
                return Err(RuntimeError::validation(format!(
                    "task type {} runs on {} workers, not {}",
                    self.task_type, natural, requested
                )));
            }
        }

        match (natural, &self.payload) {
            (WorkerClass::Document, TaskPayload::Document { file_name, .. }) => {
                if file_name.trim().is_empty() {
                    return Err(RuntimeError::validation("document payload needs a file name"));
                }
            }
            (WorkerClass::Text, TaskPayload::Text { .. }) => {}
            (WorkerClass::Document, TaskPayload::Text { .. }) => {
                return Err(RuntimeError::validation(format!(
                    "{} expects a document payload",
                    self.task_type
                )));
            }
            (WorkerClass::Text, TaskPayload::Document { .. }) => {
                return Err(RuntimeError::validation(format!(
                    "{} expects a text payload",
                    self.task_type
                )));
            }
        }

        if let Some(deadline) = self.deadline {
            if deadline.is_zero() {
                return Err(RuntimeError::validation("deadline must be greater than 0"));
            }
        }
        Ok(())
    }
}

/// Scheduler-side record of a submitted task.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub task_type: TaskType,
    pub priority: Priority,
    pub status: TaskStatus,
    pub progress: u8,
    /// Taken when the task is handed to a worker.
    pub payload: Option<TaskPayload>,
    pub worker_class: WorkerClass,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub deadline: Option<Duration>,
    /// Submission sequence number, the FIFO tie-break inside a priority band.
    pub sequence: u64,
}

impl Task {
    pub fn from_request(request: TaskRequest, sequence: u64) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), request, sequence)
    }

    pub fn with_id(id: TaskId, request: TaskRequest, sequence: u64) -> Self {
        let worker_class = request.resolved_class();
        Self {
            id,
            task_type: request.task_type,
            priority: request.priority,
            status: TaskStatus::Queued,
            progress: 0,
            payload: Some(request.payload),
            worker_class,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            deadline: request.deadline,
            sequence,
        }
    }

    pub fn mark_running(&mut self) {
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn finish(&mut self, status: TaskStatus) {
        debug_assert!(status.is_terminal());
        self.status = status;
        if status == TaskStatus::Completed {
            self.progress = 100;
        }
        self.completed_at = Some(Utc::now());
    }

    pub fn set_progress(&mut self, percent: u8) {
        self.progress = percent.min(100);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskErrorKind {
    Execution,
    Timeout,
    Cancelled,
    Unavailable,
}

/// Terminal failure delivered once to the submitter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct TaskError {
    pub kind: TaskErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn execution<S: Into<String>>(message: S) -> Self {
        Self {
            kind: TaskErrorKind::Execution,
            message: message.into(),
        }
    }

    pub fn timeout<S: Into<String>>(message: S) -> Self {
        Self {
            kind: TaskErrorKind::Timeout,
            message: message.into(),
        }
    }

    pub fn cancelled<S: Into<String>>(message: S) -> Self {
        Self {
            kind: TaskErrorKind::Cancelled,
            message: message.into(),
        }
    }

    pub fn unavailable<S: Into<String>>(message: S) -> Self {
        Self {
            kind: TaskErrorKind::Unavailable,
            message: message.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == TaskErrorKind::Cancelled
    }
}

impl From<TaskError> for RuntimeError {
    fn from(err: TaskError) -> Self {
        match err.kind {
            TaskErrorKind::Execution => RuntimeError::Execution(err.message),
            TaskErrorKind::Timeout => RuntimeError::Timeout(err.message),
            TaskErrorKind::Cancelled => RuntimeError::Cancelled(err.message),
            TaskErrorKind::Unavailable => RuntimeError::WorkerUnavailable(err.message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub task_id: TaskId,
    pub percent: u8,
    pub stage: Option<String>,
}

/// Pool-side view of a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: String,
    pub class: WorkerClass,
    pub current_task: Option<TaskId>,
    pub task_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub consecutive_errors: u32,
}

impl WorkerInfo {
    pub fn new(id: String, class: WorkerClass) -> Self {
        let now = Utc::now();
        Self {
            id,
            class,
            current_task: None,
            task_count: 0,
            created_at: now,
            last_active_at: now,
            consecutive_errors: 0,
        }
    }

    /// Busy exactly when a task is assigned.
    pub fn is_busy(&self) -> bool {
        self.current_task.is_some()
    }

    pub fn is_idle_longer_than(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        if self.is_busy() {
            return false;
        }
        let idle = now.signed_duration_since(self.last_active_at);
        idle.to_std().map(|d| d > threshold).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassStatus {
    pub total: usize,
    pub busy: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub document: ClassStatus,
    pub text: ClassStatus,
    pub queue_depth: usize,
    pub running_count: usize,
}

impl PoolStatus {
    pub fn class(&self, class: WorkerClass) -> ClassStatus {
        match class {
            WorkerClass::Document => self.document,
            WorkerClass::Text => self.text,
        }
    }

    pub fn class_mut(&mut self, class: WorkerClass) -> &mut ClassStatus {
        match class {
            WorkerClass::Document => &mut self.document,
            WorkerClass::Text => &mut self.text,
        }
    }
}
