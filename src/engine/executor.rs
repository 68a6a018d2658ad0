use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::actions::{Action, ActionContext, ActionRegistry, TaskContext};
use crate::catalog::InstanceStore;
use crate::datasource::DataSourceManager;
use crate::engine::types::*;
use crate::error::{Error, Result};

/// Runtime record for one task, derived from its catalog config.
#[derive(Debug, Clone)]
struct ExecTask {
    id: String,
    action_name: String,
    params: JsonMap,
    retry: Option<RetryPlan>,
    timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
struct RetryPlan {
    max_times: u32,
    interval: Duration,
}

/// The workflow executor. Builds a persisted instance for every message and
/// runs the workflow's tasks in catalog order on a detached tokio task.
pub struct Executor {
    registry: Arc<ActionRegistry>,
    store: Arc<dyn InstanceStore>,
    datasources: Arc<DataSourceManager>,
    tracker: TaskTracker,
}

impl Executor {
    pub fn new(
        registry: Arc<ActionRegistry>,
        store: Arc<dyn InstanceStore>,
        datasources: Arc<DataSourceManager>,
    ) -> Self {
        Self {
            registry,
            store,
            datasources,
            tracker: TaskTracker::new(),
        }
    }

    /// Dispatch one message against a workflow. Returns the fresh instance
    /// id once the instance is persisted `running` and the run is spawned;
    /// the tasks themselves execute detached, so the bus acknowledges the
    /// message before the workflow completes.
    pub async fn execute(
        &self,
        workflow: &WorkflowConfig,
        message: BusMessage,
        cancel: CancellationToken,
    ) -> Result<String> {
        let tasks = build_tasks(&workflow.dag)?;

        let instance = WorkflowInstance {
            id: Uuid::new_v4().to_string(),
            workflow_id: workflow.id.to_hex(),
            status: InstanceStatus::Running,
            vars: build_vars(workflow, &message),
            results: JsonMap::new(),
            error: None,
            start_time: Utc::now(),
            end_time: None,
        };
        self.store.upsert_instance(&instance).await?;

        info!(instance = %instance.id, workflow = %workflow.name, "Workflow instance started");

        let instance_id = instance.id.clone();
        self.tracker.spawn(run_instance(
            self.registry.clone(),
            self.store.clone(),
            self.datasources.clone(),
            instance,
            tasks,
            message,
            cancel,
        ));

        Ok(instance_id)
    }

    /// Wait for every in-flight instance to reach a terminal state. Part of
    /// the ordered teardown: consumers stop first, then the executor drains.
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

/// Seed instance vars from the DAG defaults, then overlay the message.
fn build_vars(workflow: &WorkflowConfig, message: &BusMessage) -> JsonMap {
    let mut vars = JsonMap::new();
    for var in &workflow.dag.vars {
        vars.insert(var.name.clone(), var.default_value.clone());
    }
    match serde_json::to_value(message) {
        Ok(value) => {
            vars.insert("nsq_message".to_string(), value);
        }
        Err(e) => warn!(error = %e, "Failed to serialize message into vars"),
    }
    vars
}

fn build_tasks(dag: &DagConfig) -> Result<Vec<ExecTask>> {
    validate_task_order(&dag.tasks)?;

    Ok(dag
        .tasks
        .iter()
        .map(|task| ExecTask {
            id: task.id.clone(),
            action_name: task.action_name.clone(),
            params: task.params.clone(),
            retry: task.retry.enabled.then(|| RetryPlan {
                max_times: task.retry.max_times,
                interval: Duration::from_secs(task.retry.interval_seconds),
            }),
            timeout: (task.timeout > 0).then(|| Duration::from_secs(task.timeout)),
        })
        .collect())
}

/// Tasks run in catalog order, so that order must already be a topological
/// order of `depend_on`: every referenced task exists and precedes its
/// dependent.
fn validate_task_order(tasks: &[TaskConfig]) -> Result<()> {
    let ids: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
    let mut seen: HashSet<&str> = HashSet::new();

    for task in tasks {
        for dep in &task.depend_on {
            if !ids.contains(dep.as_str()) {
                return Err(Error::Config(format!(
                    "task '{}' depends on '{}', which does not exist",
                    task.id, dep
                )));
            }
            if !seen.contains(dep.as_str()) {
                return Err(Error::Config(format!(
                    "task '{}' depends on '{}', which is declared after it",
                    task.id, dep
                )));
            }
        }
        if !seen.insert(task.id.as_str()) {
            return Err(Error::Config(format!("duplicate task id '{}'", task.id)));
        }
    }

    Ok(())
}

/// Run the task sequence and write the terminal status exactly once. A
/// panic anywhere in a task lands in the `failed` arm.
async fn run_instance(
    registry: Arc<ActionRegistry>,
    store: Arc<dyn InstanceStore>,
    datasources: Arc<DataSourceManager>,
    mut instance: WorkflowInstance,
    tasks: Vec<ExecTask>,
    message: BusMessage,
    cancel: CancellationToken,
) {
    let outcome = std::panic::AssertUnwindSafe(run_tasks(
        &registry,
        &datasources,
        &mut instance,
        &tasks,
        &message,
        &cancel,
    ))
    .catch_unwind()
    .await;

    match outcome {
        Ok(Ok(())) => {
            instance.status = InstanceStatus::Completed;
            info!(instance = %instance.id, "Workflow completed");
        }
        Ok(Err(e)) => {
            warn!(instance = %instance.id, error = %e, "Workflow failed");
            instance.status = InstanceStatus::Failed;
            instance.error = Some(e.to_string());
        }
        Err(panic) => {
            let msg = panic_message(panic.as_ref());
            error!(instance = %instance.id, panic = %msg, "Workflow panicked");
            instance.status = InstanceStatus::Failed;
            instance.error = Some(format!("panic: {}", msg));
        }
    }

    instance.end_time = Some(Utc::now());
    if let Err(e) = store.upsert_instance(&instance).await {
        error!(instance = %instance.id, error = %e, "Failed to persist terminal instance state");
    }
}

async fn run_tasks(
    registry: &ActionRegistry,
    datasources: &DataSourceManager,
    instance: &mut WorkflowInstance,
    tasks: &[ExecTask],
    message: &BusMessage,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut previous_output = Value::Null;

    for task in tasks {
        let action = registry
            .get(&task.action_name)
            .ok_or_else(|| Error::Config(format!("action '{}' not found", task.action_name)))?;

        info!(instance = %instance.id, task = %task.id, action = %task.action_name, "Executing task");

        let output = run_with_retry(
            action.as_ref(),
            task,
            datasources,
            message,
            &instance.vars,
            &previous_output,
            cancel,
        )
        .await?;

        instance.results.insert(task.id.clone(), output.clone());
        previous_output = output;
    }

    Ok(())
}

async fn run_with_retry(
    action: &dyn Action,
    task: &ExecTask,
    datasources: &DataSourceManager,
    message: &BusMessage,
    vars: &JsonMap,
    previous_output: &Value,
    cancel: &CancellationToken,
) -> Result<Value> {
    let max_attempts = task.retry.as_ref().map(|r| r.max_times + 1).unwrap_or(1);
    let mut last_error = None;

    for attempt in 1..=max_attempts {
        let ctx = ActionContext {
            datasources,
            message,
            vars,
            previous_output,
        };
        let task_ctx = TaskContext::new(&task.params);

        let attempt_result = tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = bounded(action.run(&ctx, &task_ctx), task.timeout) => result,
        };

        match attempt_result {
            Ok(output) => {
                if attempt > 1 {
                    info!(task = %task.id, attempt, "Task succeeded after retry");
                }
                return Ok(output);
            }
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                warn!(task = %task.id, attempt, max_attempts, error = %e, "Task attempt failed");
                last_error = Some(e);

                if attempt < max_attempts {
                    let interval = task.retry.as_ref().map(|r| r.interval).unwrap_or_default();
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| Error::Internal(format!("task '{}' made no attempts", task.id))))
}

/// Apply the task-level deadline to a single attempt; `None` means only
/// ambient cancellation applies.
async fn bounded(
    fut: impl Future<Output = Result<Value>>,
    timeout: Option<Duration>,
) -> Result<Value> {
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(limit)),
        },
        None => fut.await,
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
