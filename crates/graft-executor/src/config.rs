//! Executor configuration.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use graft_graph::{Capability, NodeId, ScopeContext, Workflow};
use serde::{Deserialize, Serialize};

use crate::error::ExecutionError;

/// Interval at which a waiting caller checks whether a run has settled.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How long a cancellation may take to settle before the caller moves on.
pub const DEFAULT_CANCEL_TIMEOUT: Duration = Duration::from_secs(5);

/// Where the sandbox container of an execution lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
  /// Visible container next to the host node, named `Debug: <name>`.
  Debug,
  /// Hidden container next to the host node.
  #[default]
  Default,
  /// A standalone project with a lifecycle of its own.
  Detached,
}

/// Receives non-fatal warnings, e.g. from loading a fragment.
pub type WarningConsumer = Arc<dyn Fn(String) + Send + Sync>;

/// Immutable executor settings, validated once when an executor is built.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
  pub mode: ExecutionMode,
  /// Name of the sandbox container.
  pub workflow_name: String,
  /// Collect node messages for successful runs too. Failed runs always
  /// collect them.
  pub collect_messages: bool,
  /// Run every node instead of only what the outputs depend on.
  pub execute_all: bool,
  pub poll_interval: Duration,
  pub cancel_timeout: Duration,
}

impl Default for ExecutorConfig {
  fn default() -> Self {
    Self {
      mode: ExecutionMode::Default,
      workflow_name: "Sandbox".to_string(),
      collect_messages: false,
      execute_all: false,
      poll_interval: DEFAULT_POLL_INTERVAL,
      cancel_timeout: DEFAULT_CANCEL_TIMEOUT,
    }
  }
}

impl ExecutorConfig {
  pub fn validate(&self, host: Option<&HostNode>) -> Result<(), ExecutionError> {
    self.validate_settings()?;
    if self.mode != ExecutionMode::Detached && host.is_none() {
      return Err(ExecutionError::InvalidConfig {
        message: "debug and default mode need a host node".to_string(),
      });
    }
    Ok(())
  }

  /// Checks that do not depend on where the sandbox is created.
  pub(crate) fn validate_settings(&self) -> Result<(), ExecutionError> {
    let invalid = |message: &str| ExecutionError::InvalidConfig {
      message: message.to_string(),
    };
    if self.workflow_name.trim().is_empty() {
      return Err(invalid("workflow name must not be empty"));
    }
    if self.poll_interval.is_zero() {
      return Err(invalid("poll interval must be positive"));
    }
    if self.cancel_timeout.is_zero() {
      return Err(invalid("cancel timeout must be positive"));
    }
    Ok(())
  }

  /// Name of the sandbox container for the configured mode.
  pub fn container_name(&self) -> String {
    match self.mode {
      ExecutionMode::Debug => format!("Debug: {}", self.workflow_name),
      _ => self.workflow_name.clone(),
    }
  }
}

/// The node on whose behalf fragments are executed.
#[derive(Debug, Clone)]
pub struct HostNode {
  /// The container the host node lives in.
  pub workflow: Workflow,
  pub node: NodeId,
}

impl HostNode {
  pub fn new(workflow: Workflow, node: NodeId) -> Self {
    Self { workflow, node }
  }
}

/// Per-call inputs besides the data itself.
#[derive(Debug, Clone, Default)]
pub struct ExecutionRequest {
  /// Values for top-level configuration nodes, by parameter name.
  pub parameters: BTreeMap<String, serde_json::Value>,
  pub data_area: Option<PathBuf>,
  pub restrictions: HashSet<Capability>,
}

impl ExecutionRequest {
  pub(crate) fn scope(&self, host_identity: String) -> ScopeContext {
    let mut scope = ScopeContext::new(host_identity);
    if let Some(data_area) = &self.data_area {
      scope = scope.with_data_area(data_area.clone());
    }
    for capability in &self.restrictions {
      scope = scope.restrict(*capability);
    }
    scope
  }
}
