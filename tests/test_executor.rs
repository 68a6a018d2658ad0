//! Integration tests for the workflow executor.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use mongodb::bson::oid::ObjectId;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use nsa::actions::{Action, ActionContext, ActionRegistry, TaskContext};
use nsa::catalog::InstanceStore;
use nsa::catalog::memory::MemoryInstanceStore;
use nsa::datasource::DataSourceManager;
use nsa::engine::executor::Executor;
use nsa::engine::types::*;
use nsa::error::{Error, Result};

// --- Helpers ---

fn executor() -> (Executor, Arc<MemoryInstanceStore>) {
    executor_with(ActionRegistry::with_builtins())
}

fn executor_with(registry: ActionRegistry) -> (Executor, Arc<MemoryInstanceStore>) {
    let store = Arc::new(MemoryInstanceStore::new());
    let executor = Executor::new(
        Arc::new(registry),
        store.clone(),
        Arc::new(DataSourceManager::new()),
    );
    (executor, store)
}

fn workflow(tasks: Vec<TaskConfig>) -> WorkflowConfig {
    WorkflowConfig {
        id: ObjectId::new(),
        name: "test".to_string(),
        description: String::new(),
        topic: "t".to_string(),
        channel: "c".to_string(),
        enabled: true,
        dag: DagConfig {
            tasks,
            ..Default::default()
        },
        created_at: None,
        updated_at: None,
    }
}

fn task(id: &str, action_name: &str, params: Value) -> TaskConfig {
    TaskConfig {
        id: id.to_string(),
        name: String::new(),
        action_name: action_name.to_string(),
        depend_on: Vec::new(),
        params: params.as_object().cloned().unwrap_or_default(),
        retry: RetryConfig::default(),
        timeout: 0,
    }
}

fn script_task(id: &str, code: &str) -> TaskConfig {
    task(id, "script", json!({"code": code}))
}

fn with_retry(mut t: TaskConfig, max_times: u32) -> TaskConfig {
    t.retry = RetryConfig {
        enabled: true,
        max_times,
        interval_seconds: 0,
    };
    t
}

fn message(body: &str) -> BusMessage {
    BusMessage::decode("t", "c", "m1", body.as_bytes(), chrono::Utc::now(), 1)
}

/// Dispatch, wait for the detached run to finish, and return the instance.
async fn run_and_wait(
    executor: &Executor,
    store: &MemoryInstanceStore,
    wf: &WorkflowConfig,
    msg: BusMessage,
) -> WorkflowInstance {
    let id = executor
        .execute(wf, msg, CancellationToken::new())
        .await
        .unwrap();
    executor.shutdown().await;
    store.get_instance(&id).await.unwrap()
}

/// Fails until `succeed_after` calls have happened.
struct FlakyAction {
    calls: Arc<AtomicU32>,
    succeed_after: u32,
}

#[async_trait]
impl Action for FlakyAction {
    fn name(&self) -> &str {
        "flaky"
    }

    fn description(&self) -> &str {
        "Fails a configured number of times, then succeeds"
    }

    async fn run(&self, _ctx: &ActionContext<'_>, _task: &TaskContext<'_>) -> Result<Value> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.succeed_after {
            Err(Error::Remote("flaky failure".to_string()))
        } else {
            Ok(json!({"ok": true}))
        }
    }
}

struct SlowAction {
    delay: Duration,
}

#[async_trait]
impl Action for SlowAction {
    fn name(&self) -> &str {
        "slow"
    }

    fn description(&self) -> &str {
        "Sleeps, then succeeds"
    }

    async fn run(&self, _ctx: &ActionContext<'_>, _task: &TaskContext<'_>) -> Result<Value> {
        tokio::time::sleep(self.delay).await;
        Ok(json!({"done": true}))
    }
}

struct PanicAction;

#[async_trait]
impl Action for PanicAction {
    fn name(&self) -> &str {
        "panicky"
    }

    fn description(&self) -> &str {
        "Panics"
    }

    async fn run(&self, _ctx: &ActionContext<'_>, _task: &TaskContext<'_>) -> Result<Value> {
        panic!("boom");
    }
}

// --- Happy path ---

#[tokio::test]
async fn two_script_tasks_propagate_outputs() {
    let (executor, store) = executor();
    let wf = workflow(vec![
        script_task("a", "return { x = nsq_message.data.n * 2 }"),
        script_task("b", "return { y = previous_output.x + 1 }"),
    ]);

    let instance = run_and_wait(&executor, &store, &wf, message(r#"{"n": 3}"#)).await;

    assert_eq!(instance.status, InstanceStatus::Completed);
    assert_eq!(instance.results.get("a").unwrap(), &json!({"x": 6}));
    assert_eq!(instance.results.get("b").unwrap(), &json!({"y": 7}));
    assert!(instance.end_time.is_some());
    assert!(instance.error.is_none());
}

#[tokio::test]
async fn empty_task_list_completes() {
    let (executor, store) = executor();
    let wf = workflow(Vec::new());

    let instance = run_and_wait(&executor, &store, &wf, message("{}")).await;

    assert_eq!(instance.status, InstanceStatus::Completed);
    assert!(instance.results.is_empty());
}

#[tokio::test]
async fn vars_seed_from_defaults_and_message_overlay() {
    let (executor, store) = executor();
    let mut wf = workflow(vec![script_task(
        "a",
        "return { g = workflow_vars.greeting, n = nsq_message.data.n }",
    )]);
    wf.dag.vars = vec![DagVar {
        name: "greeting".to_string(),
        description: String::new(),
        default_value: json!("hello"),
        kind: "string".to_string(),
    }];

    let instance = run_and_wait(&executor, &store, &wf, message(r#"{"n": 9}"#)).await;

    assert_eq!(instance.status, InstanceStatus::Completed);
    assert_eq!(
        instance.results.get("a").unwrap(),
        &json!({"g": "hello", "n": 9})
    );
    assert_eq!(instance.vars.get("greeting").unwrap(), &json!("hello"));
    assert!(instance.vars.contains_key("nsq_message"));
}

// --- Retry discipline ---

#[tokio::test]
async fn retry_then_succeed() {
    let calls = Arc::new(AtomicU32::new(0));
    let mut registry = ActionRegistry::new();
    registry.register(Arc::new(FlakyAction {
        calls: calls.clone(),
        succeed_after: 2,
    }));
    let (executor, store) = executor_with(registry);

    let wf = workflow(vec![with_retry(task("a", "flaky", json!({})), 2)]);
    let instance = run_and_wait(&executor, &store, &wf, message("{}")).await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(instance.status, InstanceStatus::Completed);
    assert_eq!(instance.results.get("a").unwrap(), &json!({"ok": true}));
}

#[tokio::test]
async fn retry_exhaustion_fails_instance() {
    let calls = Arc::new(AtomicU32::new(0));
    let mut registry = ActionRegistry::new();
    registry.register(Arc::new(FlakyAction {
        calls: calls.clone(),
        succeed_after: u32::MAX,
    }));
    let (executor, store) = executor_with(registry);

    let wf = workflow(vec![with_retry(task("a", "flaky", json!({})), 2)]);
    let instance = run_and_wait(&executor, &store, &wf, message("{}")).await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(instance.status, InstanceStatus::Failed);
    assert!(!instance.results.contains_key("a"));
    assert!(instance.error.is_some());
}

#[tokio::test]
async fn no_retry_means_single_attempt() {
    let calls = Arc::new(AtomicU32::new(0));
    let mut registry = ActionRegistry::new();
    registry.register(Arc::new(FlakyAction {
        calls: calls.clone(),
        succeed_after: u32::MAX,
    }));
    let (executor, store) = executor_with(registry);

    let wf = workflow(vec![task("a", "flaky", json!({}))]);
    let instance = run_and_wait(&executor, &store, &wf, message("{}")).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(instance.status, InstanceStatus::Failed);
}

#[tokio::test]
async fn failure_stops_later_tasks() {
    let calls = Arc::new(AtomicU32::new(0));
    let mut registry = ActionRegistry::with_builtins();
    registry.register(Arc::new(FlakyAction {
        calls,
        succeed_after: u32::MAX,
    }));
    let (executor, store) = executor_with(registry);

    let wf = workflow(vec![
        task("bad", "flaky", json!({})),
        script_task("after", "return { ran = true }"),
    ]);
    let instance = run_and_wait(&executor, &store, &wf, message("{}")).await;

    assert_eq!(instance.status, InstanceStatus::Failed);
    assert!(!instance.results.contains_key("after"));
}

// --- Unknown action ---

#[tokio::test]
async fn unknown_action_fails_instance() {
    let (executor, store) = executor();
    let wf = workflow(vec![task("a", "does_not_exist", json!({}))]);

    let instance = run_and_wait(&executor, &store, &wf, message("{}")).await;

    assert_eq!(instance.status, InstanceStatus::Failed);
    assert!(instance.error.unwrap().contains("not found"));
}

// --- Timeouts ---

#[tokio::test]
async fn task_timeout_fails_attempt() {
    let mut registry = ActionRegistry::new();
    registry.register(Arc::new(SlowAction {
        delay: Duration::from_secs(10),
    }));
    let (executor, store) = executor_with(registry);

    let mut t = task("slow", "slow", json!({}));
    t.timeout = 1;
    let wf = workflow(vec![t]);

    let instance = run_and_wait(&executor, &store, &wf, message("{}")).await;

    assert_eq!(instance.status, InstanceStatus::Failed);
    assert!(instance.error.unwrap().contains("timed out"));
}

#[tokio::test]
async fn timeout_zero_means_no_deadline() {
    let mut registry = ActionRegistry::new();
    registry.register(Arc::new(SlowAction {
        delay: Duration::from_millis(100),
    }));
    let (executor, store) = executor_with(registry);

    let wf = workflow(vec![task("slow", "slow", json!({}))]);
    let instance = run_and_wait(&executor, &store, &wf, message("{}")).await;

    assert_eq!(instance.status, InstanceStatus::Completed);
}

// --- depend_on validation ---

#[tokio::test]
async fn dependency_declared_after_dependent_is_rejected() {
    let (executor, store) = executor();
    let mut first = script_task("b", "return {}");
    first.depend_on = vec!["a".to_string()];
    let wf = workflow(vec![first, script_task("a", "return {}")]);

    let result = executor
        .execute(&wf, message("{}"), CancellationToken::new())
        .await;

    assert!(matches!(result, Err(Error::Config(_))));
    // Rejected before any instance was created
    assert!(store.list().is_empty());
}

#[tokio::test]
async fn dependency_on_missing_task_is_rejected() {
    let (executor, _store) = executor();
    let mut t = script_task("a", "return {}");
    t.depend_on = vec!["ghost".to_string()];
    let wf = workflow(vec![t]);

    let result = executor
        .execute(&wf, message("{}"), CancellationToken::new())
        .await;

    assert!(matches!(result, Err(Error::Config(_))));
}

#[tokio::test]
async fn dependencies_in_catalog_order_are_accepted() {
    let (executor, store) = executor();
    let mut second = script_task("b", "return { done = true }");
    second.depend_on = vec!["a".to_string()];
    let wf = workflow(vec![script_task("a", "return {}"), second]);

    let instance = run_and_wait(&executor, &store, &wf, message("{}")).await;

    assert_eq!(instance.status, InstanceStatus::Completed);
}

// --- Panic recovery ---

#[tokio::test]
async fn panic_in_action_fails_instance() {
    let mut registry = ActionRegistry::new();
    registry.register(Arc::new(PanicAction));
    let (executor, store) = executor_with(registry);

    let wf = workflow(vec![task("a", "panicky", json!({}))]);
    let instance = run_and_wait(&executor, &store, &wf, message("{}")).await;

    assert_eq!(instance.status, InstanceStatus::Failed);
    assert!(instance.error.unwrap().contains("panic"));
}

// --- Cancellation ---

#[tokio::test]
async fn cancellation_aborts_running_instance() {
    let mut registry = ActionRegistry::new();
    registry.register(Arc::new(SlowAction {
        delay: Duration::from_secs(10),
    }));
    let (executor, store) = executor_with(registry);

    let wf = workflow(vec![task("slow", "slow", json!({}))]);
    let cancel = CancellationToken::new();
    let id = executor
        .execute(&wf, message("{}"), cancel.clone())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();
    executor.shutdown().await;

    let instance = store.get_instance(&id).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Failed);
    assert!(instance.error.unwrap().contains("cancelled"));
}

// --- Persistence ---

#[tokio::test]
async fn instance_upsert_is_idempotent() {
    let store = MemoryInstanceStore::new();
    let instance = WorkflowInstance {
        id: "fixed".to_string(),
        workflow_id: ObjectId::new().to_hex(),
        status: InstanceStatus::Running,
        vars: Default::default(),
        results: Default::default(),
        error: None,
        start_time: chrono::Utc::now(),
        end_time: None,
    };

    store.upsert_instance(&instance).await.unwrap();
    store.upsert_instance(&instance).await.unwrap();

    assert_eq!(store.list().len(), 1);
}

#[tokio::test]
async fn terminal_status_is_written_exactly_once() {
    let (executor, store) = executor();
    let wf = workflow(vec![script_task("a", "return { ok = true }")]);

    let instance = run_and_wait(&executor, &store, &wf, message("{}")).await;

    // One document, one terminal state
    assert_eq!(store.list().len(), 1);
    assert_eq!(instance.status, InstanceStatus::Completed);
    assert!(instance.end_time.is_some());
}
