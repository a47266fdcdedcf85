use std::collections::HashMap;
use std::sync::Arc;

use draftwork_domain::TaskType;
use tracing::info;

use crate::executors::{
    EnhanceTextExecutor, ParseDocxExecutor, ParsePdfExecutor, ParseTextExecutor,
    ProcessTextExecutor, TaskExecutor,
};

/// Maps each task type to the executor that runs it. Built once, then
/// shared read-only by every worker.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<TaskType, Arc<dyn TaskExecutor>>,
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self
            .executors
            .iter()
            .map(|(task_type, executor)| format!("{task_type}={}", executor.name()))
            .collect();
        names.sort();
        f.debug_struct("ExecutorRegistry")
            .field("executors", &names)
            .finish()
    }
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// All built-in executors.
    pub fn with_defaults() -> Self {
        Self::new()
            .with_executor(Arc::new(ParseTextExecutor))
            .with_executor(Arc::new(ParseDocxExecutor))
            .with_executor(Arc::new(ParsePdfExecutor::default()))
            .with_executor(Arc::new(ProcessTextExecutor))
            .with_executor(Arc::new(EnhanceTextExecutor))
    }

    /// Registers `executor` for its task type, replacing any previous one.
    pub fn with_executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.register(executor);
        self
    }

    pub fn register(&mut self, executor: Arc<dyn TaskExecutor>) {
        let task_type = executor.task_type();
        info!("Registering executor '{}' for {}", executor.name(), task_type);
        self.executors.insert(task_type, executor);
    }

    pub fn get(&self, task_type: TaskType) -> Option<Arc<dyn TaskExecutor>> {
        self.executors.get(&task_type).cloned()
    }

    pub fn contains(&self, task_type: TaskType) -> bool {
        self.executors.contains_key(&task_type)
    }

    pub fn task_types(&self) -> Vec<TaskType> {
        let mut types: Vec<_> = self.executors.keys().copied().collect();
        types.sort_by_key(|t| t.as_str());
        types
    }
}
