pub mod app_config;
pub mod logging;
pub mod pool;
pub mod resilience;
pub mod storage;

pub use app_config::*;
pub use logging::*;
pub use pool::*;
pub use resilience::*;
pub use storage::*;
