use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use draftwork_config::PoolConfig;
use draftwork_dispatcher::WorkerPool;
use draftwork_domain::{
    Priority, TaskErrorKind, TaskOutput, TaskPayload, TaskRequest, TaskStatus, TaskType,
    WorkerClass,
};
use draftwork_errors::{RuntimeError, RuntimeResult};
use draftwork_worker::{ExecutorRegistry, ProgressReporter, TaskExecutor};
use serde_json::json;
use tokio::sync::Semaphore;

/// Records the order tasks start in, then waits for a permit before
/// finishing. Payloads whose label starts with "fail" return an error.
struct GatedExecutor {
    task_type: TaskType,
    gate: Arc<Semaphore>,
    started: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl TaskExecutor for GatedExecutor {
    fn name(&self) -> &str {
        "gated"
    }

    fn task_type(&self) -> TaskType {
        self.task_type
    }

    async fn execute(
        &self,
        payload: TaskPayload,
        _progress: &ProgressReporter,
    ) -> RuntimeResult<TaskOutput> {
        let label = match payload {
            TaskPayload::Text { text, .. } => text,
            TaskPayload::Document { file_name, .. } => file_name,
        };
        self.started.lock().unwrap().push(label.clone());

        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| RuntimeError::Internal("gate closed".to_string()))?;
        permit.forget();

        if label.starts_with("fail") {
            return Err(RuntimeError::execution(format!("{label} failed")));
        }
        Ok(json!({ "label": label }))
    }
}

struct Harness {
    pool: WorkerPool,
    text_gate: Arc<Semaphore>,
    document_gate: Arc<Semaphore>,
    started: Arc<Mutex<Vec<String>>>,
}

impl Harness {
    fn new(config: PoolConfig) -> Self {
        let text_gate = Arc::new(Semaphore::new(0));
        let document_gate = Arc::new(Semaphore::new(0));
        let started = Arc::new(Mutex::new(Vec::new()));
        let registry = ExecutorRegistry::new()
            .with_executor(Arc::new(GatedExecutor {
                task_type: TaskType::ProcessText,
                gate: text_gate.clone(),
                started: started.clone(),
            }))
            .with_executor(Arc::new(GatedExecutor {
                task_type: TaskType::ParseText,
                gate: document_gate.clone(),
                started: started.clone(),
            }));
        Self {
            pool: WorkerPool::new(config, Arc::new(registry)),
            text_gate,
            document_gate,
            started,
        }
    }

    fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }
}

fn text_task(label: &str) -> TaskRequest {
    TaskRequest::new(TaskType::ProcessText, TaskPayload::text(label))
}

fn document_task(file_name: &str) -> TaskRequest {
    TaskRequest::new(
        TaskType::ParseText,
        TaskPayload::Document {
            bytes: b"hello".to_vec(),
            file_name: file_name.to_string(),
            mime_type: None,
        },
    )
}

fn single_text_worker() -> PoolConfig {
    PoolConfig {
        max_text_workers: 1,
        max_document_workers: 1,
        ..Default::default()
    }
}

#[tokio::test]
async fn higher_priority_tasks_run_first() {
    let harness = Harness::new(single_text_worker());
    let pool = &harness.pool;

    let mut handles = vec![pool.submit(text_task("blocker")).unwrap()];
    handles.push(pool.submit(text_task("low").with_priority(Priority::Low)).unwrap());
    handles.push(pool.submit(text_task("normal-1")).unwrap());
    handles.push(pool.submit(text_task("high").with_priority(Priority::High)).unwrap());
    handles.push(pool.submit(text_task("normal-2")).unwrap());

    harness.text_gate.add_permits(handles.len());
    for handle in handles {
        assert!(handle.wait().await.is_ok());
    }

    assert_eq!(
        harness.started(),
        vec!["blocker", "high", "normal-1", "normal-2", "low"]
    );
    pool.shutdown().await;
}

#[tokio::test]
async fn classes_do_not_block_each_other() {
    let harness = Harness::new(single_text_worker());
    let pool = &harness.pool;

    let document = pool.submit(document_task("cv.txt")).unwrap();
    let text = pool.submit(text_task("summary")).unwrap();

    // only the text class is released
    harness.text_gate.add_permits(1);
    let output = tokio::time::timeout(Duration::from_secs(5), text.wait())
        .await
        .expect("text task must not wait on the document worker")
        .unwrap();
    assert_eq!(output["label"], "summary");

    let status = pool.pool_status().await;
    assert_eq!(status.class(WorkerClass::Document).busy, 1);
    assert_eq!(status.class(WorkerClass::Text).busy, 0);
    assert_eq!(pool.status(document.id()).await, Some(TaskStatus::Running));

    harness.document_gate.add_permits(1);
    assert!(document.wait().await.is_ok());
    pool.shutdown().await;
}

#[tokio::test]
async fn queued_and_running_sets_are_disjoint() {
    let harness = Harness::new(PoolConfig {
        max_text_workers: 2,
        ..Default::default()
    });
    let pool = &harness.pool;

    let handles: Vec<_> = (0..5)
        .map(|i| pool.submit(text_task(&format!("chunk-{i}"))).unwrap())
        .collect();

    let status = pool.pool_status().await;
    assert_eq!(status.running_count, 2);
    assert_eq!(status.queue_depth, 3);
    assert_eq!(status.text.total, 2);
    assert_eq!(status.text.busy, 2);
    assert_eq!(status.document.total, 0);

    let mut running = 0;
    let mut queued = 0;
    for handle in &handles {
        match pool.status(handle.id()).await {
            Some(TaskStatus::Running) => running += 1,
            Some(TaskStatus::Queued) => queued += 1,
            other => panic!("unexpected status {other:?}"),
        }
    }
    assert_eq!((running, queued), (2, 3));

    harness.text_gate.add_permits(5);
    let ids: Vec<String> = handles.iter().map(|h| h.id().to_string()).collect();
    for handle in handles {
        assert!(handle.wait().await.is_ok());
    }
    for id in &ids {
        assert_eq!(pool.status(id).await, Some(TaskStatus::Completed));
    }

    let status = pool.pool_status().await;
    assert_eq!((status.running_count, status.queue_depth), (0, 0));
    assert_eq!(harness.started().len(), 5);
    pool.shutdown().await;
}

#[tokio::test]
async fn failing_worker_is_retired_and_replaced() {
    let harness = Harness::new(PoolConfig {
        max_text_workers: 1,
        max_errors_per_worker: 2,
        ..Default::default()
    });
    let pool = &harness.pool;
    harness.text_gate.add_permits(10);

    let err = pool.submit(text_task("fail-1")).unwrap().wait().await.unwrap_err();
    assert_eq!(err.kind, TaskErrorKind::Execution);

    let workers = pool.worker_snapshot().await;
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0].id, "text-worker-1");
    assert_eq!(workers[0].consecutive_errors, 1);

    assert!(pool.submit(text_task("fail-2")).unwrap().wait().await.is_err());

    let workers = pool.worker_snapshot().await;
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0].id, "text-worker-2");
    assert_eq!(workers[0].consecutive_errors, 0);

    // the replacement takes new work
    assert!(pool.submit(text_task("ok")).unwrap().wait().await.is_ok());
    assert_eq!(pool.worker_snapshot().await[0].task_count, 1);
    pool.shutdown().await;
}

#[tokio::test]
async fn retirement_leaves_other_workers_untouched() {
    let harness = Harness::new(PoolConfig {
        max_text_workers: 2,
        max_document_workers: 1,
        max_errors_per_worker: 2,
        ..Default::default()
    });
    let pool = &harness.pool;

    let document = pool.submit(document_task("cv.txt")).unwrap();
    harness.document_gate.add_permits(1);
    assert!(document.wait().await.is_ok());

    // both text workers busy at once, one task each
    let first = pool.submit(text_task("ok-a")).unwrap();
    let second = pool.submit(text_task("ok-b")).unwrap();
    harness.text_gate.add_permits(2);
    assert!(first.wait().await.is_ok());
    assert!(second.wait().await.is_ok());

    let find = |workers: &[draftwork_domain::WorkerInfo], id: &str| {
        workers
            .iter()
            .find(|w| w.id == id)
            .cloned()
            .unwrap_or_else(|| panic!("{id} missing"))
    };

    // lone tasks go to the first idle worker, text-worker-1
    harness.text_gate.add_permits(1);
    assert!(pool.submit(text_task("fail-1")).unwrap().wait().await.is_err());
    let workers = pool.worker_snapshot().await;
    assert_eq!(find(&workers, "text-worker-1").consecutive_errors, 1);
    assert_eq!(find(&workers, "text-worker-2").consecutive_errors, 0);

    harness.text_gate.add_permits(1);
    assert!(pool.submit(text_task("fail-2")).unwrap().wait().await.is_err());

    let workers = pool.worker_snapshot().await;
    let mut ids: Vec<&str> = workers.iter().map(|w| w.id.as_str()).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec!["doc-worker-1", "text-worker-2", "text-worker-3"]);

    let survivor = find(&workers, "text-worker-2");
    assert_eq!((survivor.task_count, survivor.consecutive_errors), (1, 0));
    let document_worker = find(&workers, "doc-worker-1");
    assert_eq!(
        (document_worker.task_count, document_worker.consecutive_errors),
        (1, 0)
    );
    let replacement = find(&workers, "text-worker-3");
    assert_eq!(
        (replacement.task_count, replacement.consecutive_errors),
        (0, 0)
    );

    let status = pool.pool_status().await;
    assert_eq!(status.class(WorkerClass::Text).total, 2);
    assert_eq!(status.class(WorkerClass::Document).total, 1);
    pool.shutdown().await;
}

#[tokio::test]
async fn success_resets_consecutive_errors() {
    let harness = Harness::new(PoolConfig {
        max_text_workers: 1,
        max_errors_per_worker: 2,
        ..Default::default()
    });
    let pool = &harness.pool;
    harness.text_gate.add_permits(10);

    for label in ["fail-a", "ok", "fail-b"] {
        let _ = pool.submit(text_task(label)).unwrap().wait().await;
    }

    let workers = pool.worker_snapshot().await;
    assert_eq!(workers[0].id, "text-worker-1");
    assert_eq!(workers[0].consecutive_errors, 1);
    assert_eq!(workers[0].task_count, 3);
    pool.shutdown().await;
}

#[tokio::test]
async fn cancel_queued_and_running_tasks() {
    let harness = Harness::new(single_text_worker());
    let pool = &harness.pool;

    let running = pool.submit(text_task("running")).unwrap();
    let queued = pool.submit(text_task("queued")).unwrap();
    let running_id = running.id().to_string();

    assert!(pool.cancel(queued.id()).await);
    assert!(queued.wait().await.unwrap_err().is_cancelled());

    assert!(pool.cancel(&running_id).await);
    assert!(running.wait().await.unwrap_err().is_cancelled());
    assert_eq!(pool.status(&running_id).await, Some(TaskStatus::Cancelled));

    assert!(!pool.cancel(&running_id).await);
    assert!(!pool.cancel("no-such-task").await);

    // the freed worker picks up new work; a cancellation is not an error
    let next = pool.submit(text_task("next")).unwrap();
    harness.text_gate.add_permits(1);
    assert!(next.wait().await.is_ok());

    let workers = pool.worker_snapshot().await;
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0].consecutive_errors, 0);
    assert_eq!(harness.started().last().map(String::as_str), Some("next"));
    pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn deadline_fails_task_with_timeout() {
    let harness = Harness::new(PoolConfig {
        max_text_workers: 1,
        max_errors_per_worker: 5,
        ..Default::default()
    });
    let pool = &harness.pool;

    let handle = pool
        .submit(text_task("stuck").with_deadline(Duration::from_millis(100)))
        .unwrap();
    let id = handle.id().to_string();

    let err = handle.wait().await.unwrap_err();
    assert_eq!(err.kind, TaskErrorKind::Timeout);
    assert_eq!(pool.status(&id).await, Some(TaskStatus::Failed));

    let workers = pool.worker_snapshot().await;
    assert_eq!(workers[0].consecutive_errors, 1);
    assert!(workers[0].current_task.is_none());
    pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn default_task_timeout_applies() {
    let harness = Harness::new(PoolConfig {
        max_document_workers: 1,
        default_task_timeout: Some(Duration::from_secs(2)),
        ..Default::default()
    });

    let err = harness
        .pool
        .submit(document_task("huge.txt"))
        .unwrap()
        .wait()
        .await
        .unwrap_err();
    assert_eq!(err.kind, TaskErrorKind::Timeout);
    harness.pool.shutdown().await;
}

#[tokio::test]
async fn shutdown_cancels_everything_and_rejects_new_work() {
    let harness = Harness::new(single_text_worker());
    let pool = harness.pool.clone();

    let running = pool.submit(text_task("running")).unwrap();
    let queued = pool.submit(text_task("queued")).unwrap();

    pool.shutdown().await;
    assert!(running.wait().await.unwrap_err().is_cancelled());
    assert!(queued.wait().await.unwrap_err().is_cancelled());

    assert!(!pool.is_running());
    assert!(matches!(
        pool.submit(text_task("late")),
        Err(RuntimeError::WorkerUnavailable(_))
    ));
    assert_eq!(pool.pool_status().await, Default::default());
    assert!(!pool.cancel("anything").await);

    // idempotent
    pool.shutdown().await;
}

#[tokio::test]
async fn maintenance_reaps_idle_workers_only() {
    let harness = Harness::new(PoolConfig {
        max_text_workers: 2,
        idle_timeout: Duration::from_millis(20),
        ..Default::default()
    });
    let pool = &harness.pool;

    harness.text_gate.add_permits(2);
    let a = pool.submit(text_task("a")).unwrap();
    let b = pool.submit(text_task("b")).unwrap();
    assert!(a.wait().await.is_ok());
    assert!(b.wait().await.is_ok());
    assert_eq!(pool.pool_status().await.text.total, 2);

    // lands on the first idle worker and keeps it busy
    let busy = pool.submit(text_task("busy")).unwrap();

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(pool.run_maintenance().await, 1);

    let status = pool.pool_status().await;
    assert_eq!(status.text.total, 1);
    assert_eq!(status.text.busy, 1);

    harness.text_gate.add_permits(1);
    assert!(busy.wait().await.is_ok());
    pool.shutdown().await;
}

#[tokio::test]
async fn invalid_requests_are_rejected_synchronously() {
    let harness = Harness::new(PoolConfig::default());
    let pool = &harness.pool;

    let wrong_class = text_task("x").with_worker_class(WorkerClass::Document);
    assert!(matches!(
        pool.submit(wrong_class),
        Err(RuntimeError::Validation(_))
    ));

    let wrong_payload = TaskRequest::new(TaskType::ParsePdf, TaskPayload::text("not bytes"));
    assert!(matches!(
        pool.submit(wrong_payload),
        Err(RuntimeError::Validation(_))
    ));

    assert_eq!(pool.pool_status().await.queue_depth, 0);
    pool.shutdown().await;
}
