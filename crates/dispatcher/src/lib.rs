//! Priority worker pool and the typed task adapters built on it.

pub mod adapters;
mod coordinator;
pub mod pool;

pub use adapters::{DocumentParseTask, TaskAdapter, TextEnhanceTask, TextProcessTask, TypedTask};
pub use pool::{TaskHandle, TaskResult, WorkerPool};
