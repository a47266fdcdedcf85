//! Worker side of the pool: the worker loop, the executors it runs and the
//! progress handle executors report through.

pub mod components;
pub mod executor_registry;
pub mod executors;
pub mod progress;

pub use components::{spawn_worker, Assignment, WorkerCommand, WorkerEvent, WorkerHandle};
pub use executor_registry::ExecutorRegistry;
pub use executors::{
    chunk_text, extract_docx_text, normalize_text, EnhanceTextExecutor, ParseDocxExecutor,
    ParsePdfExecutor, ParseTextExecutor, ProcessTextExecutor, TaskExecutor,
};
pub use progress::ProgressReporter;
