pub mod app;

pub use app::Application;
pub use draftwork_config::AppConfig;
pub use draftwork_dispatcher::{
    DocumentParseTask, TaskAdapter, TaskHandle, TextEnhanceTask, TextProcessTask, TypedTask,
    WorkerPool,
};
pub use draftwork_errors::{RuntimeError, RuntimeResult};
pub use draftwork_infrastructure::{CallContext, CallPriority, PutOptions, TieredStorage};
