//! End-to-end scenarios through the full runtime: coordinator, in-process
//! transport, in-memory ledger, dedup, workers.

mod common;

use common::{counting_echo_handlers, slow_handlers, test_config};
use drover::prelude::*;
use drover::{FnHandler, TaskFilter};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[tokio::test]
async fn happy_path_records_full_lifecycle() {
    let (handlers, invocations) = counting_echo_handlers();
    let runtime = Runtime::builder(test_config()).handlers(handlers).build().await.unwrap();

    let result = runtime
        .coordinator()
        .execute(TaskRequest::new("echo").id("t1").capability("echo").input("msg", json!("hi")))
        .await
        .unwrap();
    assert_eq!(result, json!({"out": "hi"}));
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    // Ledger shows the terminal row with the result attached.
    let task = runtime.ledger().get_task("t1").await.unwrap().unwrap();
    assert_eq!(task.status, TaskState::Completed);
    assert_eq!(task.result, Some(json!({"out": "hi"})));
    assert!(task.started_at.is_some());
    assert!(task.completed_at.is_some());

    // Audit log walks Pending -> Assigned -> Running -> Completed.
    let progress = runtime.ledger().progress("t1").await.unwrap();
    let states: Vec<TaskState> = progress.iter().map(|entry| entry.state).collect();
    let order = [
        TaskState::Pending,
        TaskState::Assigned,
        TaskState::Running,
        TaskState::Completed,
    ];
    let mut cursor = 0;
    for state in &states {
        if cursor < order.len() && *state == order[cursor] {
            cursor += 1;
        }
    }
    assert_eq!(cursor, order.len(), "progress {states:?} missing lifecycle steps");

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn deadline_miss_fails_and_frees_the_worker() {
    let mut config = test_config();
    config.resilience.default_task_deadline = Some(Duration::from_millis(200));
    let runtime = Runtime::builder(config)
        .handlers(slow_handlers(Duration::from_secs(2)))
        .build()
        .await
        .unwrap();

    let started = Instant::now();
    let err = runtime
        .coordinator()
        .execute(TaskRequest::new("slow").id("t-slow").capability("slow"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);

    let task = runtime.ledger().get_task("t-slow").await.unwrap().unwrap();
    assert_eq!(task.status, TaskState::Failed);
    assert_eq!(task.error.as_ref().unwrap().kind, ErrorKind::Timeout);

    // The worker's slot frees promptly; the next task is routable.
    let deadline = started + Duration::from_millis(700);
    loop {
        let stats = runtime.pool().stats();
        if stats.idle >= 1 {
            break;
        }
        assert!(Instant::now() < deadline, "worker not freed in time");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn duplicate_submissions_run_the_handler_once() {
    let (handlers, invocations) = counting_echo_handlers();
    let runtime = Runtime::builder(test_config()).handlers(handlers).build().await.unwrap();

    // Two concurrent submissions with the same id: one wins the dedup race,
    // the other joins its outcome.
    let request = || TaskRequest::new("echo").id("dup-1").capability("echo").input("msg", json!("x"));
    let coordinator = runtime.coordinator().clone();
    let first = {
        let coordinator = coordinator.clone();
        let request = request();
        tokio::spawn(async move { coordinator.execute(request).await })
    };
    let second = {
        let coordinator = coordinator.clone();
        let request = request();
        tokio::spawn(async move { coordinator.execute(request).await })
    };

    let a = first.await.unwrap().unwrap();
    let b = second.await.unwrap().unwrap();
    assert_eq!(a, b);
    assert_eq!(invocations.load(Ordering::SeqCst), 1, "handler must run exactly once");

    // A later resubmission short-circuits to the stored result.
    let again = coordinator.execute(request()).await.unwrap();
    assert_eq!(again, a);
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn workflow_dependency_failure_cancels_descendants() {
    let handlers = HandlerRegistry::new()
        .with(
            "boom",
            Arc::new(FnHandler::new("boom", &["boom"], |_task: Task| async {
                Err(drover::Error::internal("injected failure").permanent())
            })) as Arc<dyn TaskHandler>,
        )
        .with(
            "echo",
            Arc::new(FnHandler::new("echo", &["echo"], |_task: Task| async {
                Ok(json!("fine"))
            })) as Arc<dyn TaskHandler>,
        );
    let runtime = Runtime::builder(test_config()).handlers(handlers).build().await.unwrap();

    let requests = vec![
        TaskRequest::new("boom").id("wf-t1").capability("boom"),
        TaskRequest::new("echo").id("wf-t2").capability("echo").depends_on("wf-t1"),
        // An independent branch: unrelated to the failure, must not be
        // dragged down with it.
        TaskRequest::new("echo").id("wf-t3").capability("echo"),
    ];
    let err = runtime
        .coordinator()
        .execute_workflow(requests, WorkflowMode::FailFast)
        .await
        .unwrap_err();
    assert!(err.has_kind(ErrorKind::DependencyFailed));

    // t2 never ran: it ends Cancelled without ever being Assigned.
    let t2 = runtime.ledger().get_task("wf-t2").await.unwrap().unwrap();
    assert_eq!(t2.status, TaskState::Cancelled);
    let t2_progress = runtime.ledger().progress("wf-t2").await.unwrap();
    assert!(
        t2_progress.iter().all(|entry| entry.state != TaskState::Assigned),
        "dependent task must never be assigned"
    );
    assert!(t2_progress
        .iter()
        .any(|entry| entry.state == TaskState::Cancelled && entry.note.contains("dependency")));

    // The cascade only reaches descendants: the independent branch completed.
    let t3 = runtime.ledger().get_task("wf-t3").await.unwrap().unwrap();
    assert_eq!(t3.status, TaskState::Completed);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn resilient_workflow_reports_partial_success() {
    let handlers = HandlerRegistry::new()
        .with(
            "boom",
            Arc::new(FnHandler::new("boom", &["boom"], |_task: Task| async {
                Err(drover::Error::internal("injected failure").permanent())
            })) as Arc<dyn TaskHandler>,
        )
        .with(
            "echo",
            Arc::new(FnHandler::new("echo", &["echo"], |_task: Task| async {
                Ok(json!("fine"))
            })) as Arc<dyn TaskHandler>,
        );
    let runtime = Runtime::builder(test_config()).handlers(handlers).build().await.unwrap();

    // Independent branches: the failure of one leaves the other untouched.
    let requests = vec![
        TaskRequest::new("boom").id("r-t1").capability("boom"),
        TaskRequest::new("echo").id("r-t2").capability("echo"),
    ];
    let report = runtime
        .coordinator()
        .execute_workflow(requests, WorkflowMode::Resilient)
        .await
        .unwrap();
    assert_eq!(report.completed.get("r-t2"), Some(&json!("fine")));
    assert!(report.failed.contains_key("r-t1"));

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn workflow_chain_executes_in_dependency_order() {
    let (handlers, _) = counting_echo_handlers();
    let runtime = Runtime::builder(test_config()).handlers(handlers).build().await.unwrap();

    let requests = vec![
        TaskRequest::new("echo").id("c1").capability("echo").input("msg", json!(1)),
        TaskRequest::new("echo").id("c2").capability("echo").input("msg", json!(2)).depends_on("c1"),
        TaskRequest::new("echo").id("c3").capability("echo").input("msg", json!(3)).depends_on("c2"),
    ];
    let report = runtime
        .coordinator()
        .execute_workflow(requests, WorkflowMode::FailFast)
        .await
        .unwrap();
    assert_eq!(report.completed.len(), 3);

    // c2 started only after c1 completed.
    let c1 = runtime.ledger().get_task("c1").await.unwrap().unwrap();
    let c2 = runtime.ledger().get_task("c2").await.unwrap().unwrap();
    assert!(c1.completed_at.unwrap() <= c2.started_at.unwrap());

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn cancel_marks_task_and_frees_worker() {
    let runtime = Runtime::builder(test_config())
        .handlers(slow_handlers(Duration::from_secs(30)))
        .build()
        .await
        .unwrap();

    let coordinator = runtime.coordinator().clone();
    let submission = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            coordinator
                .execute(TaskRequest::new("slow").id("t-cancel").capability("slow"))
                .await
        })
    };

    // Wait until the task is running.
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        match runtime.ledger().get_task("t-cancel").await.unwrap() {
            Some(task) if task.status == TaskState::Running => break,
            _ => {
                assert!(Instant::now() < deadline, "task never started");
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
    }

    assert!(coordinator.cancel("t-cancel").await.unwrap());
    let err = submission.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);

    let task = runtime.ledger().get_task("t-cancel").await.unwrap().unwrap();
    assert_eq!(task.status, TaskState::Cancelled);

    // The worker slot frees once the abort lands.
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if runtime.pool().stats().idle >= 1 {
            break;
        }
        assert!(Instant::now() < deadline, "worker not freed after cancel");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn no_eligible_worker_times_out_dispatch() {
    let mut config = test_config();
    config.dispatch_retry_timeout = Duration::from_millis(300);
    let (handlers, _) = counting_echo_handlers();
    let runtime = Runtime::builder(config).handlers(handlers).build().await.unwrap();

    let err = runtime
        .coordinator()
        .execute(TaskRequest::new("gpu-job").id("t-gpu").capability("gpu"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoEligibleWorker);

    let task = runtime.ledger().get_task("t-gpu").await.unwrap().unwrap();
    assert_eq!(task.status, TaskState::Failed);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn ledger_filter_pages_submitted_tasks() {
    let (handlers, _) = counting_echo_handlers();
    let runtime = Runtime::builder(test_config()).handlers(handlers).build().await.unwrap();

    for n in 0..5 {
        runtime
            .coordinator()
            .execute(
                TaskRequest::new("echo")
                    .id(format!("page-{n}"))
                    .capability("echo")
                    .input("msg", json!(n)),
            )
            .await
            .unwrap();
    }

    let completed = runtime
        .ledger()
        .list_tasks(&TaskFilter { status: Some(TaskState::Completed), ..TaskFilter::default() })
        .await
        .unwrap();
    assert_eq!(completed.len(), 5);

    let stats = runtime.ledger().stats().await.unwrap();
    assert_eq!(stats.completed, 5);
    assert_eq!(stats.total, 5);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_twice_returns_the_same_outcome() {
    let (handlers, _) = counting_echo_handlers();
    let runtime = Runtime::builder(test_config()).handlers(handlers).build().await.unwrap();
    runtime.shutdown().await.unwrap();
    runtime.shutdown().await.unwrap();
    assert!(runtime.health().await.is_err());
}
