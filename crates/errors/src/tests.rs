use crate::*;

#[test]
fn test_runtime_error_display() {
    let validation = RuntimeError::validation("unknown task type: parse-xls");
    assert_eq!(
        validation.to_string(),
        "数据验证失败: unknown task type: parse-xls"
    );

    let open = RuntimeError::circuit_open("ai.endpoint");
    assert_eq!(open.to_string(), "熔断器已打开，拒绝调用: ai.endpoint");

    let timeout = RuntimeError::timeout("task exceeded 5s");
    assert_eq!(timeout.to_string(), "操作超时: task exceeded 5s");

    let unavailable = RuntimeError::WorkerUnavailable("pool shut down".to_string());
    assert_eq!(unavailable.to_string(), "Worker不可用: pool shut down");
}

#[test]
fn test_circuit_open_is_distinct_from_failure() {
    assert!(RuntimeError::circuit_open("storage.durable").is_circuit_open());
    assert!(!RuntimeError::execution("boom").is_circuit_open());
    assert!(!RuntimeError::timeout("slow").is_circuit_open());
}

#[test]
fn test_retryable_classification() {
    assert!(RuntimeError::execution("transient").is_retryable());
    assert!(RuntimeError::timeout("slow").is_retryable());
    assert!(RuntimeError::storage("quota exceeded").is_retryable());

    assert!(!RuntimeError::validation("bad payload").is_retryable());
    assert!(!RuntimeError::circuit_open("x").is_retryable());
    assert!(!RuntimeError::Cancelled("t-1".to_string()).is_retryable());
    assert!(!RuntimeError::config_error("bad").is_retryable());
}

#[test]
fn test_user_messages() {
    assert_eq!(
        RuntimeError::circuit_open("ai").user_message(),
        "服务暂时不可用，请稍后重试"
    );
    assert_eq!(
        RuntimeError::Internal("x".to_string()).user_message(),
        "系统繁忙，请稍后重试"
    );
}

#[test]
fn test_conversions() {
    let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
    let err: RuntimeError = json_err.into();
    assert!(matches!(err, RuntimeError::Serialization(_)));

    let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "pdftotext");
    let err: RuntimeError = io_err.into();
    assert!(matches!(err, RuntimeError::Io(_)));

    let err: RuntimeError = anyhow::anyhow!("wrapped").into();
    assert!(matches!(err, RuntimeError::Internal(ref m) if m == "wrapped"));
}
