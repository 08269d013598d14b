//! Where the run-and-wait unit of an execution runs.
//!
//! The protocol itself is written once in [`run_and_wait`]; a [`Scheduler`]
//! only decides whether it runs on the caller's task or on a bounded pool.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use graft_graph::{GraphError, NodeId, Workflow};
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::ExecutionError;

/// A unit of work handed to a [`Scheduler`].
pub type Job = BoxFuture<'static, Result<(), ExecutionError>>;

/// Runs jobs to completion.
#[async_trait]
pub trait Scheduler: Send + Sync {
  async fn run(&self, job: Job) -> Result<(), ExecutionError>;
}

/// Runs jobs on the caller's task.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineScheduler;

#[async_trait]
impl Scheduler for InlineScheduler {
  async fn run(&self, job: Job) -> Result<(), ExecutionError> {
    job.await
  }
}

/// Runs each job as a task on a runtime, at most `permits` at a time.
#[derive(Debug, Clone)]
pub struct PooledScheduler {
  handle: Handle,
  permits: Arc<Semaphore>,
}

impl PooledScheduler {
  pub fn new(handle: Handle, max_concurrent: usize) -> Self {
    Self {
      handle,
      permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
    }
  }

  /// A pool on the runtime the caller is running on.
  pub fn current(max_concurrent: usize) -> Result<Self, ExecutionError> {
    let handle = Handle::try_current().map_err(|_| GraphError::NoRuntime)?;
    Ok(Self::new(handle, max_concurrent))
  }
}

/// Aborts the pooled task when the waiting caller goes away.
struct AbortOnDrop(tokio::task::AbortHandle);

impl Drop for AbortOnDrop {
  fn drop(&mut self) {
    self.0.abort();
  }
}

#[async_trait]
impl Scheduler for PooledScheduler {
  async fn run(&self, job: Job) -> Result<(), ExecutionError> {
    let _permit = self
      .permits
      .acquire()
      .await
      .map_err(|_| ExecutionError::IllegalState {
        message: "scheduler has been shut down".to_string(),
      })?;
    let task = self.handle.spawn(job);
    let _abort = AbortOnDrop(task.abort_handle());
    match task.await {
      Ok(result) => result,
      Err(e) if e.is_cancelled() => Err(ExecutionError::Cancelled),
      Err(e) => Err(ExecutionError::IllegalState {
        message: format!("execution task failed: {}", e),
      }),
    }
  }
}

/// What to trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunTarget {
  /// Only what the node depends on, the node included.
  UpTo(NodeId),
  All,
}

/// Cancels the container unless the wait completed normally.
struct CancelOnDrop {
  workflow: Option<Workflow>,
}

impl CancelOnDrop {
  fn disarm(&mut self) {
    self.workflow = None;
  }
}

impl Drop for CancelOnDrop {
  fn drop(&mut self) {
    if let Some(workflow) = self.workflow.take() {
      debug!(workflow_id = %workflow.id(), "interrupted_wait_cancels_workflow");
      workflow.cancel_all();
    }
  }
}

/// Trigger execution and poll until the container settles.
///
/// A cancelled `cancel` token, or dropping the returned future before the run
/// settled, cancels the container.
pub fn run_and_wait(
  workflow: Workflow,
  target: RunTarget,
  poll_interval: Duration,
  cancel: CancellationToken,
) -> Job {
  Box::pin(async move {
    let mut guard = CancelOnDrop {
      workflow: Some(workflow.clone()),
    };
    match &target {
      RunTarget::UpTo(node) => workflow.execute_up_to(node)?,
      RunTarget::All => workflow.execute_all()?,
    }
    info!(workflow_id = %workflow.id(), target = ?target, "execution_started");

    while workflow.is_in_progress() {
      tokio::select! {
        _ = cancel.cancelled() => {
          warn!(workflow_id = %workflow.id(), "execution_cancel_requested");
          return Err(ExecutionError::Cancelled);
        }
        _ = tokio::time::sleep(poll_interval) => {}
      }
    }
    guard.disarm();
    info!(workflow_id = %workflow.id(), "execution_settled");
    Ok(())
  })
}

/// Cancel a running container and wait up to `timeout` for it to settle.
/// Returns immediately if nothing runs.
#[instrument(name = "cancel_and_wait", skip(workflow), fields(workflow_id = %workflow.id()))]
pub async fn cancel_and_wait(workflow: &Workflow, timeout: Duration) {
  if !workflow.is_in_progress() {
    return;
  }
  workflow.cancel_all();
  let settle = async {
    while workflow.is_in_progress() {
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
  };
  if tokio::time::timeout(timeout, settle).await.is_err() {
    warn!(timeout_ms = timeout.as_millis() as u64, "cancel_timeout");
  } else {
    debug!("execution_cancelled");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use graft_graph::SandboxRegistry;
  use graft_graph::builtin::{self, parameter_settings};
  use serde_json::json;

  fn sleeper(registry: &SandboxRegistry, millis: u64) -> (Workflow, NodeId) {
    let project = registry.create_project("sleepy", None, None);
    let node = {
      let lock = project.lock();
      let param = lock
        .add_node("Value", builtin::PARAMETER, parameter_settings("x", json!(1)))
        .unwrap();
      let sleep = lock
        .add_node("Sleep", builtin::SLEEP, json!({ "millis": millis }))
        .unwrap();
      lock.connect(&param, 0, &sleep, 0).unwrap();
      sleep
    };
    (project, node)
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn test_inline_run_and_wait_completes() {
    let registry = SandboxRegistry::new();
    let (project, node) = sleeper(&registry, 20);

    let job = run_and_wait(
      project.clone(),
      RunTarget::UpTo(node),
      Duration::from_millis(5),
      CancellationToken::new(),
    );
    InlineScheduler.run(job).await.unwrap();
    assert!(project.is_fully_executed());
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn test_pooled_run_and_wait_completes() {
    let registry = SandboxRegistry::new();
    let (project, _) = sleeper(&registry, 20);
    let scheduler = PooledScheduler::current(2).unwrap();

    let job = run_and_wait(
      project.clone(),
      RunTarget::All,
      Duration::from_millis(5),
      CancellationToken::new(),
    );
    scheduler.run(job).await.unwrap();
    assert!(project.is_fully_executed());
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn test_cancelled_token_cancels_workflow() {
    let registry = SandboxRegistry::new();
    let (project, _) = sleeper(&registry, 10_000);
    let cancel = CancellationToken::new();

    let job = run_and_wait(
      project.clone(),
      RunTarget::All,
      Duration::from_millis(5),
      cancel.clone(),
    );
    let canceller = async {
      tokio::time::sleep(Duration::from_millis(50)).await;
      cancel.cancel();
    };
    let (result, _) = tokio::join!(InlineScheduler.run(job), canceller);
    assert!(matches!(result, Err(ExecutionError::Cancelled)));

    cancel_and_wait(&project, Duration::from_secs(5)).await;
    assert!(!project.is_in_progress());
    assert!(!project.is_fully_executed());
  }

  #[tokio::test(flavor = "multi_thread")]
  async fn test_dropped_wait_cancels_workflow() {
    let registry = SandboxRegistry::new();
    let (project, _) = sleeper(&registry, 10_000);

    let job = run_and_wait(
      project.clone(),
      RunTarget::All,
      Duration::from_millis(5),
      CancellationToken::new(),
    );
    let timed_out = tokio::time::timeout(Duration::from_millis(50), job).await;
    assert!(timed_out.is_err());

    for _ in 0..500 {
      if !project.is_in_progress() {
        break;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!project.is_in_progress());
  }

  #[tokio::test]
  async fn test_cancel_and_wait_on_idle_workflow_returns() {
    let registry = SandboxRegistry::new();
    let project = registry.create_project("idle", None, None);
    cancel_and_wait(&project, Duration::from_millis(10)).await;
  }
}
