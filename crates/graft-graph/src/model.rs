//! Node model trait and the factory table models are created from.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use graft_address::NodeId;
use tokio_util::sync::CancellationToken;

use crate::error::GraphError;
use crate::registry::SandboxRegistry;
use crate::scope::ScopeContext;
use crate::value::{FlowVariable, PortValue, merge_variables};
use crate::workflow::Workflow;

/// A node's execution failed. The message becomes the node's error status.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct NodeFailure {
  pub message: String,
}

impl NodeFailure {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
    }
  }
}

impl From<GraphError> for NodeFailure {
  fn from(e: GraphError) -> Self {
    NodeFailure::new(e.to_string())
  }
}

/// Behaviour of a leaf node, rebuilt from its settings whenever they change.
#[async_trait]
pub trait NodeModel: Send + Sync {
  fn factory_id(&self) -> &str;

  fn input_count(&self) -> usize;

  fn output_count(&self) -> usize;

  /// Name under which callers may override this node's configuration.
  fn parameter_name(&self) -> Option<&str> {
    None
  }

  /// `settings` with the configured value replaced by `value`. Only nodes
  /// with a [`parameter_name`](NodeModel::parameter_name) support this.
  fn with_parameter(
    &self,
    _settings: &serde_json::Value,
    _value: serde_json::Value,
  ) -> Option<serde_json::Value> {
    None
  }

  async fn execute(
    &self,
    inputs: Vec<Option<PortValue>>,
    ctx: &mut NodeContext,
  ) -> Result<Vec<PortValue>, NodeFailure>;
}

/// Everything a running node may see besides its input values.
pub struct NodeContext {
  node: NodeId,
  workflow: Workflow,
  variables: Vec<FlowVariable>,
  pushed: Vec<FlowVariable>,
  warning: Option<String>,
  cancel: CancellationToken,
}

impl NodeContext {
  pub(crate) fn new(
    node: NodeId,
    workflow: Workflow,
    variables: Vec<FlowVariable>,
    cancel: CancellationToken,
  ) -> Self {
    Self {
      node,
      workflow,
      variables,
      pushed: Vec::new(),
      warning: None,
      cancel,
    }
  }

  pub fn node(&self) -> &NodeId {
    &self.node
  }

  /// Variables arriving over the node's input connections.
  pub fn variables(&self) -> &[FlowVariable] {
    &self.variables
  }

  pub fn variable(&self, name: &str) -> Option<&FlowVariable> {
    self
      .pushed
      .iter()
      .rev()
      .chain(self.variables.iter().rev())
      .find(|v| v.name == name)
  }

  pub fn push_variable(&mut self, variable: FlowVariable) {
    merge_variables(&mut self.pushed, [variable]);
  }

  pub fn set_warning(&mut self, text: impl Into<String>) {
    self.warning = Some(text.into());
  }

  /// Scope of the closest enclosing container that has one.
  pub fn scope(&self) -> Option<ScopeContext> {
    self.workflow.scope()
  }

  pub fn project_dir(&self) -> Option<PathBuf> {
    self.workflow.project_dir()
  }

  pub fn registry(&self) -> Result<SandboxRegistry, GraphError> {
    self.workflow.registry()
  }

  pub fn cancellation(&self) -> &CancellationToken {
    &self.cancel
  }

  /// Outgoing variables and the warning, if any.
  pub(crate) fn finish(self) -> (Vec<FlowVariable>, Option<String>) {
    let mut out = self.variables;
    merge_variables(&mut out, self.pushed);
    (out, self.warning)
  }
}

/// Creates a model from a factory id's settings.
pub type NodeFactory = fn(&serde_json::Value) -> Result<Arc<dyn NodeModel>, GraphError>;

/// Table of node factories, keyed by factory id.
#[derive(Clone, Default)]
pub struct NodeFactoryRegistry {
  factories: HashMap<String, NodeFactory>,
}

impl NodeFactoryRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// A table holding every built-in `graft.*` model.
  pub fn with_builtins() -> Self {
    let mut registry = Self::new();
    crate::builtin::register_all(&mut registry);
    registry
  }

  pub fn register(&mut self, factory_id: impl Into<String>, factory: NodeFactory) {
    self.factories.insert(factory_id.into(), factory);
  }

  pub fn contains(&self, factory_id: &str) -> bool {
    self.factories.contains_key(factory_id)
  }

  pub fn create(
    &self,
    factory_id: &str,
    settings: &serde_json::Value,
  ) -> Result<Arc<dyn NodeModel>, GraphError> {
    let factory = self
      .factories
      .get(factory_id)
      .ok_or_else(|| GraphError::UnknownFactory {
        factory_id: factory_id.to_string(),
      })?;
    factory(settings)
  }
}

impl std::fmt::Debug for NodeFactoryRegistry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let mut ids: Vec<&String> = self.factories.keys().collect();
    ids.sort();
    f.debug_struct("NodeFactoryRegistry")
      .field("factories", &ids)
      .finish()
  }
}

/// Stand-in for a node whose factory is not installed. Keeps the node's ports
/// so connections survive, fails when executed.
pub(crate) struct MissingNode {
  pub factory_id: String,
  pub inputs: usize,
  pub outputs: usize,
}

#[async_trait]
impl NodeModel for MissingNode {
  fn factory_id(&self) -> &str {
    &self.factory_id
  }

  fn input_count(&self) -> usize {
    self.inputs
  }

  fn output_count(&self) -> usize {
    self.outputs
  }

  async fn execute(
    &self,
    _inputs: Vec<Option<PortValue>>,
    _ctx: &mut NodeContext,
  ) -> Result<Vec<PortValue>, NodeFailure> {
    Err(NodeFailure::new(format!(
      "node implementation '{}' is not installed",
      self.factory_id
    )))
  }
}
