//! Built-in executors, one per task type.

mod document;
mod text;

use async_trait::async_trait;
use draftwork_domain::{TaskOutput, TaskPayload, TaskType};
use draftwork_errors::{RuntimeError, RuntimeResult};

use crate::progress::ProgressReporter;

pub use document::{extract_docx_text, ParseDocxExecutor, ParsePdfExecutor, ParseTextExecutor};
pub use text::{chunk_text, normalize_text, EnhanceTextExecutor, ProcessTextExecutor};

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    fn name(&self) -> &str;

    fn task_type(&self) -> TaskType;

    async fn execute(
        &self,
        payload: TaskPayload,
        progress: &ProgressReporter,
    ) -> RuntimeResult<TaskOutput>;
}

pub(crate) struct DocumentInput {
    pub bytes: Vec<u8>,
    pub file_name: String,
}

pub(crate) fn expect_document(task_type: TaskType, payload: TaskPayload) -> RuntimeResult<DocumentInput> {
    match payload {
        TaskPayload::Document {
            bytes, file_name, ..
        } => Ok(DocumentInput { bytes, file_name }),
        TaskPayload::Text { .. } => Err(RuntimeError::execution(format!(
            "{task_type} 需要文档类型的载荷"
        ))),
    }
}

pub(crate) fn expect_text(
    task_type: TaskType,
    payload: TaskPayload,
) -> RuntimeResult<(String, serde_json::Value)> {
    match payload {
        TaskPayload::Text { text, options } => Ok((text, options)),
        TaskPayload::Document { .. } => Err(RuntimeError::execution(format!(
            "{task_type} 需要文本类型的载荷"
        ))),
    }
}
