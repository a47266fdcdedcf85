use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),
    #[error("数据验证失败: {0}")]
    Validation(String),
    #[error("任务执行错误: {0}")]
    Execution(String),
    #[error("操作超时: {0}")]
    Timeout(String),
    #[error("熔断器已打开，拒绝调用: {service}")]
    CircuitOpen { service: String },
    #[error("存储错误: {0}")]
    Storage(String),
    #[error("压缩错误: {0}")]
    Compression(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("Worker不可用: {0}")]
    WorkerUnavailable(String),
    #[error("任务已取消: {0}")]
    Cancelled(String),
    #[error("IO错误: {0}")]
    Io(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

impl RuntimeError {
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }
    pub fn execution<S: Into<String>>(msg: S) -> Self {
        Self::Execution(msg.into())
    }
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Self::Timeout(msg.into())
    }
    pub fn circuit_open<S: Into<String>>(service: S) -> Self {
        Self::CircuitOpen {
            service: service.into(),
        }
    }
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    /// "Didn't even try" as opposed to "tried and failed".
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, RuntimeError::CircuitOpen { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RuntimeError::Timeout(_))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RuntimeError::Database(_)
                | RuntimeError::Execution(_)
                | RuntimeError::Timeout(_)
                | RuntimeError::Storage(_)
                | RuntimeError::Io(_)
                | RuntimeError::Internal(_)
        )
    }

    pub fn user_message(&self) -> &str {
        match self {
            RuntimeError::Validation(_) => "输入数据验证失败",
            RuntimeError::Timeout(_) => "操作超时，请稍后重试",
            RuntimeError::CircuitOpen { .. } => "服务暂时不可用，请稍后重试",
            RuntimeError::WorkerUnavailable(_) => "后台处理不可用",
            RuntimeError::Cancelled(_) => "任务已取消",
            _ => "系统繁忙，请稍后重试",
        }
    }
}

impl From<serde_json::Error> for RuntimeError {
    fn from(err: serde_json::Error) -> Self {
        RuntimeError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for RuntimeError {
    fn from(err: std::io::Error) -> Self {
        RuntimeError::Io(err.to_string())
    }
}

impl From<anyhow::Error> for RuntimeError {
    fn from(err: anyhow::Error) -> Self {
        RuntimeError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests;
