//! Typed front ends for the built-in task types. Each adapter builds a
//! [`TaskRequest`] and decodes the worker's output into its result type.

use std::marker::PhantomData;
use std::path::Path;
use std::time::Duration;

use draftwork_domain::{
    EnhancedText, ParsedDocument, Priority, ProcessedText, ProgressEvent, TaskPayload,
    TaskRequest, TaskType,
};
use draftwork_errors::{RuntimeError, RuntimeResult};
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::sync::mpsc;

use crate::pool::{TaskHandle, WorkerPool};

const MIME_PDF: &str = "application/pdf";
const MIME_DOCX: &str = "application/vnd.openxmlformats-officedocument.wordprocessingml.document";

pub trait TaskAdapter: Sized {
    type Output: DeserializeOwned;

    fn into_request(self) -> RuntimeResult<TaskRequest>;

    fn submit(self, pool: &WorkerPool) -> RuntimeResult<TypedTask<Self::Output>> {
        let handle = pool.submit(self.into_request()?)?;
        Ok(TypedTask::new(handle))
    }
}

/// A submitted task whose output decodes into `T`.
#[derive(Debug)]
pub struct TypedTask<T> {
    handle: TaskHandle,
    _output: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> TypedTask<T> {
    pub fn new(handle: TaskHandle) -> Self {
        Self {
            handle,
            _output: PhantomData,
        }
    }

    pub fn id(&self) -> &str {
        self.handle.id()
    }

    pub fn progress(&mut self) -> &mut mpsc::UnboundedReceiver<ProgressEvent> {
        &mut self.handle.progress
    }

    pub async fn wait(self) -> RuntimeResult<T> {
        let output = self.handle.wait().await?;
        Ok(serde_json::from_value(output)?)
    }

    pub fn into_handle(self) -> TaskHandle {
        self.handle
    }
}

/// Scheduling knobs shared by every adapter.
#[derive(Debug, Clone, Copy, Default)]
struct Scheduling {
    priority: Priority,
    deadline: Option<Duration>,
}

impl Scheduling {
    fn apply(self, mut request: TaskRequest) -> TaskRequest {
        request = request.with_priority(self.priority);
        if let Some(deadline) = self.deadline {
            request = request.with_deadline(deadline);
        }
        request
    }
}

macro_rules! scheduling_setters {
    ($ty:ty) => {
        impl $ty {
            pub fn with_priority(mut self, priority: Priority) -> Self {
                self.scheduling.priority = priority;
                self
            }

            pub fn with_deadline(mut self, deadline: Duration) -> Self {
                self.scheduling.deadline = Some(deadline);
                self
            }
        }
    };
}

/// Parse an uploaded file. The parser is picked from the MIME type when it
/// is known, otherwise from the file extension.
#[derive(Debug, Clone)]
pub struct DocumentParseTask {
    pub bytes: Vec<u8>,
    pub file_name: String,
    pub mime_type: Option<String>,
    scheduling: Scheduling,
}

impl DocumentParseTask {
    pub fn new(bytes: Vec<u8>, file_name: impl Into<String>) -> Self {
        Self {
            bytes,
            file_name: file_name.into(),
            mime_type: None,
            scheduling: Scheduling::default(),
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn task_type(&self) -> RuntimeResult<TaskType> {
        if let Some(task_type) = self.mime_type.as_deref().and_then(task_type_for_mime) {
            return Ok(task_type);
        }

        let extension = Path::new(&self.file_name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        match extension.as_deref() {
            Some("pdf") => Ok(TaskType::ParsePdf),
            Some("docx") => Ok(TaskType::ParseDocx),
            Some("txt" | "text" | "md") => Ok(TaskType::ParseText),
            _ => Err(RuntimeError::validation(format!(
                "不支持的文件类型: {}",
                self.file_name
            ))),
        }
    }
}

fn task_type_for_mime(mime: &str) -> Option<TaskType> {
    let mime = mime.split(';').next().unwrap_or(mime).trim();
    match mime {
        MIME_PDF => Some(TaskType::ParsePdf),
        MIME_DOCX => Some(TaskType::ParseDocx),
        m if m.starts_with("text/") => Some(TaskType::ParseText),
        _ => None,
    }
}

scheduling_setters!(DocumentParseTask);

impl TaskAdapter for DocumentParseTask {
    type Output = ParsedDocument;

    fn into_request(self) -> RuntimeResult<TaskRequest> {
        let task_type = self.task_type()?;
        let payload = TaskPayload::Document {
            bytes: self.bytes,
            file_name: self.file_name,
            mime_type: self.mime_type,
        };
        Ok(self.scheduling.apply(TaskRequest::new(task_type, payload)))
    }
}

/// Split text into chunks.
#[derive(Debug, Clone)]
pub struct TextProcessTask {
    pub text: String,
    pub chunk_size: Option<usize>,
    scheduling: Scheduling,
}

impl TextProcessTask {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            chunk_size: None,
            scheduling: Scheduling::default(),
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }
}

scheduling_setters!(TextProcessTask);

impl TaskAdapter for TextProcessTask {
    type Output = ProcessedText;

    fn into_request(self) -> RuntimeResult<TaskRequest> {
        if self.chunk_size == Some(0) {
            return Err(RuntimeError::validation("chunk_size must be greater than 0"));
        }
        let options = match self.chunk_size {
            Some(size) => json!({ "chunk_size": size }),
            None => json!({}),
        };
        let payload = TaskPayload::Text {
            text: self.text,
            options,
        };
        Ok(self
            .scheduling
            .apply(TaskRequest::new(TaskType::ProcessText, payload)))
    }
}

/// Whitespace and punctuation cleanup of generated text.
#[derive(Debug, Clone)]
pub struct TextEnhanceTask {
    pub text: String,
    scheduling: Scheduling,
}

impl TextEnhanceTask {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            scheduling: Scheduling::default(),
        }
    }
}

scheduling_setters!(TextEnhanceTask);

impl TaskAdapter for TextEnhanceTask {
    type Output = EnhancedText;

    fn into_request(self) -> RuntimeResult<TaskRequest> {
        Ok(self.scheduling.apply(TaskRequest::new(
            TaskType::EnhanceText,
            TaskPayload::text(self.text),
        )))
    }
}
