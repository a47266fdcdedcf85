pub mod circuit_breaker;
pub mod circuit_registry;
pub mod compression;
pub mod storage;

pub use circuit_breaker::{
    CallContext, CallPriority, CircuitBreaker, CircuitBreakerListener, CircuitBreakerStats,
    CircuitMetrics,
};
pub use circuit_registry::{with_circuit_breaker, CircuitBreakerRegistry, CircuitCallOptions};
pub use compression::CompressionPolicy;
pub use storage::{
    CacheOptions, MemoryCache, PutOptions, SessionBackend, SqliteBackend, StorageBackend,
    StorageMetrics, TieredStorage,
};
