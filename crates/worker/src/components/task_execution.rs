use draftwork_domain::{TaskError, TaskOutput};
use draftwork_errors::RuntimeError;
use tracing::{debug, error, info};

use super::Assignment;
use crate::executor_registry::ExecutorRegistry;
use crate::progress::ProgressReporter;

/// Runs one assignment to completion on the executor registered for its
/// type. Executor errors are folded into a [`TaskError`].
pub async fn execute_assignment(
    registry: &ExecutorRegistry,
    assignment: Assignment,
    progress: &ProgressReporter,
) -> Result<TaskOutput, TaskError> {
    let Assignment {
        task_id,
        task_type,
        payload,
    } = assignment;

    let executor = registry.get(task_type).ok_or_else(|| {
        error!("No executor found for task type '{}'", task_type);
        TaskError::execution(format!("不支持的任务类型: {task_type}"))
    })?;

    info!(
        "Executing task {} ({}) with '{}', payload {} bytes",
        task_id,
        task_type,
        executor.name(),
        payload.size_bytes()
    );
    progress.report(0, Some("started"));

    match executor.execute(payload, progress).await {
        Ok(output) => {
            debug!("Task {} finished", task_id);
            progress.report(100, Some("done"));
            Ok(output)
        }
        Err(err) => {
            error!("任务执行失败: task_id={}, error={}", task_id, err);
            Err(into_task_error(err))
        }
    }
}

fn into_task_error(err: RuntimeError) -> TaskError {
    match err {
        RuntimeError::Timeout(message) => TaskError::timeout(message),
        RuntimeError::Cancelled(message) => TaskError::cancelled(message),
        RuntimeError::WorkerUnavailable(message) => TaskError::unavailable(message),
        other => TaskError::execution(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use draftwork_domain::{TaskErrorKind, TaskPayload, TaskType};

    fn assignment(task_type: TaskType, payload: TaskPayload) -> Assignment {
        Assignment {
            task_id: "task-1".to_string(),
            task_type,
            payload,
        }
    }

    #[tokio::test]
    async fn test_missing_executor_is_execution_error() {
        let registry = ExecutorRegistry::new();
        let err = execute_assignment(
            &registry,
            assignment(TaskType::EnhanceText, TaskPayload::text("x")),
            &ProgressReporter::detached("task-1"),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, TaskErrorKind::Execution);
        assert!(err.message.contains("enhance-text"));
    }

    #[tokio::test]
    async fn test_executor_error_is_folded() {
        let registry = ExecutorRegistry::with_defaults();
        let err = execute_assignment(
            &registry,
            assignment(TaskType::ParseText, TaskPayload::text("not a document")),
            &ProgressReporter::detached("task-1"),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, TaskErrorKind::Execution);
    }

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(
            into_task_error(RuntimeError::timeout("slow")).kind,
            TaskErrorKind::Timeout
        );
        assert_eq!(
            into_task_error(RuntimeError::Cancelled("stop".into())).kind,
            TaskErrorKind::Cancelled
        );
        assert_eq!(
            into_task_error(RuntimeError::storage("disk")).kind,
            TaskErrorKind::Execution
        );
    }
}
