//! The graph container.
//!
//! A [`Workflow`] is a cheap, cloneable handle to a container of nodes and the
//! connections between them. Projects are top-level workflows owned by a
//! [`SandboxRegistry`]; container nodes hold a nested workflow whose id equals
//! the node's id. Structural changes go through [`Workflow::lock`], execution
//! lives in `execution.rs` and persistence in `persist.rs`.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use graft_address::NodeId;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::edit::WorkflowLock;
use crate::error::GraphError;
use crate::model::{NodeFactoryRegistry, NodeModel};
use crate::node::{
  Connection, MessageStatus, NodeInfo, NodeKind, NodeState, NodeUi, StatusMessage,
};
use crate::registry::{RegistryInner, SandboxRegistry};
use crate::scope::ScopeContext;
use crate::value::{FlowVariable, PortValue};

/// Handle to a graph container.
#[derive(Clone)]
pub struct Workflow {
  pub(crate) inner: Arc<Inner>,
}

pub(crate) struct Inner {
  pub(crate) id: NodeId,
  pub(crate) name: String,
  pub(crate) location: Option<PathBuf>,
  pub(crate) parent: Weak<Inner>,
  pub(crate) registry: Weak<RegistryInner>,
  pub(crate) factories: Arc<NodeFactoryRegistry>,
  pub(crate) state: RwLock<GraphState>,
  pub(crate) edit: Mutex<()>,
  pub(crate) scope: Mutex<Option<ScopeContext>>,
  pub(crate) read_only: AtomicBool,
}

pub(crate) struct GraphState {
  pub(crate) input_ports: usize,
  pub(crate) output_ports: usize,
  pub(crate) nodes: BTreeMap<u32, NodeEntry>,
  pub(crate) connections: Vec<Connection>,
  pub(crate) next_index: u32,
  /// Values arriving at the container's input ports during a nested run.
  pub(crate) boundary_inputs: Vec<Option<PortValue>>,
  pub(crate) boundary_variables: Vec<FlowVariable>,
  pub(crate) running: bool,
  pub(crate) cancel: CancellationToken,
}

pub(crate) struct NodeEntry {
  pub(crate) id: NodeId,
  pub(crate) name: String,
  pub(crate) ui: NodeUi,
  pub(crate) body: NodeBody,
  pub(crate) state: NodeState,
  pub(crate) message: StatusMessage,
  pub(crate) outputs: Vec<Option<PortValue>>,
  pub(crate) variables: Vec<FlowVariable>,
}

pub(crate) enum NodeBody {
  Leaf {
    factory_id: String,
    settings: serde_json::Value,
    model: Arc<dyn NodeModel>,
  },
  Container(Workflow),
}

impl NodeEntry {
  pub(crate) fn new(id: NodeId, name: String, body: NodeBody) -> Self {
    Self {
      id,
      name,
      ui: NodeUi::default(),
      body,
      state: NodeState::Idle,
      message: StatusMessage::ok(),
      outputs: Vec::new(),
      variables: Vec::new(),
    }
  }

  pub(crate) fn input_count(&self) -> usize {
    match &self.body {
      NodeBody::Leaf { model, .. } => model.input_count(),
      NodeBody::Container(child) => child.input_port_count(),
    }
  }

  pub(crate) fn output_count(&self) -> usize {
    match &self.body {
      NodeBody::Leaf { model, .. } => model.output_count(),
      NodeBody::Container(child) => child.output_port_count(),
    }
  }

  pub(crate) fn container(&self) -> Option<&Workflow> {
    match &self.body {
      NodeBody::Container(child) => Some(child),
      NodeBody::Leaf { .. } => None,
    }
  }

  /// Forget results. Containers forget the results of all their nodes.
  pub(crate) fn reset(&mut self) {
    if matches!(self.state, NodeState::Executed | NodeState::Failed) {
      self.message = StatusMessage::reset();
    }
    self.state = NodeState::Idle;
    self.outputs.clear();
    self.variables.clear();
    if let NodeBody::Container(child) = &self.body {
      child.reset_nodes();
    }
  }

  pub(crate) fn info(&self) -> NodeInfo {
    let kind = match &self.body {
      NodeBody::Leaf {
        factory_id,
        settings,
        ..
      } => NodeKind::Leaf {
        factory_id: factory_id.clone(),
        settings: settings.clone(),
      },
      NodeBody::Container(child) => NodeKind::Container(child.clone()),
    };
    NodeInfo {
      id: self.id.clone(),
      name: self.name.clone(),
      kind,
      state: self.state,
      message: self.message.clone(),
      ui: self.ui,
      input_count: self.input_count(),
      output_count: self.output_count(),
    }
  }
}

impl GraphState {
  pub(crate) fn new(input_ports: usize, output_ports: usize) -> Self {
    Self {
      input_ports,
      output_ports,
      nodes: BTreeMap::new(),
      connections: Vec::new(),
      next_index: 0,
      boundary_inputs: Vec::new(),
      boundary_variables: Vec::new(),
      running: false,
      cancel: CancellationToken::new(),
    }
  }

  /// Index of a direct child of the container `own`.
  pub(crate) fn index_of(&self, own: &NodeId, node: &NodeId) -> Option<u32> {
    if node.parent().as_ref() != Some(own) {
      return None;
    }
    let index = node.index();
    self.nodes.contains_key(&index).then_some(index)
  }

  pub(crate) fn entry(&self, own: &NodeId, node: &NodeId) -> Result<&NodeEntry, GraphError> {
    self
      .index_of(own, node)
      .and_then(|index| self.nodes.get(&index))
      .ok_or_else(|| GraphError::NodeNotFound { node: node.clone() })
  }

  pub(crate) fn entry_mut(
    &mut self,
    own: &NodeId,
    node: &NodeId,
  ) -> Result<&mut NodeEntry, GraphError> {
    let index = self
      .index_of(own, node)
      .ok_or_else(|| GraphError::NodeNotFound { node: node.clone() })?;
    self
      .nodes
      .get_mut(&index)
      .ok_or_else(|| GraphError::NodeNotFound { node: node.clone() })
  }

  /// Incoming connections of `node`, ordered by destination port.
  pub(crate) fn incoming(&self, node: &NodeId) -> Vec<Connection> {
    let mut incoming: Vec<Connection> = self
      .connections
      .iter()
      .filter(|c| &c.dest == node)
      .cloned()
      .collect();
    incoming.sort_by_key(|c| c.dest_port);
    incoming
  }

  /// `start` and every node reachable from it, excluding the boundary.
  pub(crate) fn downstream(&self, own: &NodeId, start: &NodeId) -> HashSet<NodeId> {
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([start.clone()]);
    while let Some(node) = queue.pop_front() {
      if &node == own || !seen.insert(node.clone()) {
        continue;
      }
      for connection in self.connections.iter().filter(|c| c.source == node) {
        queue.push_back(connection.dest.clone());
      }
    }
    seen
  }

  /// `start` and every node it depends on, excluding the boundary.
  pub(crate) fn upstream(&self, own: &NodeId, start: &NodeId) -> HashSet<NodeId> {
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([start.clone()]);
    while let Some(node) = queue.pop_front() {
      if &node == own || !seen.insert(node.clone()) {
        continue;
      }
      for connection in self.connections.iter().filter(|c| c.dest == node) {
        queue.push_back(connection.source.clone());
      }
    }
    seen
  }

  pub(crate) fn reset_downstream(&mut self, own: &NodeId, start: &NodeId) {
    for node in self.downstream(own, start) {
      let Some(index) = self.index_of(own, &node) else {
        continue;
      };
      if let Some(entry) = self.nodes.get_mut(&index) {
        entry.reset();
      }
    }
  }

  pub(crate) fn allocate_index(&mut self) -> u32 {
    let index = self.next_index;
    self.next_index += 1;
    index
  }
}

impl Workflow {
  pub(crate) fn new_root(
    id: NodeId,
    name: impl Into<String>,
    location: Option<PathBuf>,
    registry: Weak<RegistryInner>,
    factories: Arc<NodeFactoryRegistry>,
  ) -> Self {
    Self {
      inner: Arc::new(Inner {
        id,
        name: name.into(),
        location,
        parent: Weak::new(),
        registry,
        factories,
        state: RwLock::new(GraphState::new(0, 0)),
        edit: Mutex::new(()),
        scope: Mutex::new(None),
        read_only: AtomicBool::new(false),
      }),
    }
  }

  /// A nested workflow to be stored as the container node `index` of `self`.
  pub(crate) fn new_child(
    &self,
    index: u32,
    name: impl Into<String>,
    input_ports: usize,
    output_ports: usize,
  ) -> Workflow {
    Self {
      inner: Arc::new(Inner {
        id: self.inner.id.child(index),
        name: name.into(),
        location: None,
        parent: Arc::downgrade(&self.inner),
        registry: self.inner.registry.clone(),
        factories: self.inner.factories.clone(),
        state: RwLock::new(GraphState::new(input_ports, output_ports)),
        edit: Mutex::new(()),
        scope: Mutex::new(None),
        read_only: AtomicBool::new(false),
      }),
    }
  }

  pub fn id(&self) -> &NodeId {
    &self.inner.id
  }

  pub fn name(&self) -> &str {
    &self.inner.name
  }

  /// Directory the project was created in or loaded from. Nested workflows
  /// have none, see [`Workflow::project_dir`].
  pub fn location(&self) -> Option<&Path> {
    self.inner.location.as_deref()
  }

  pub fn parent(&self) -> Option<Workflow> {
    self.inner.parent.upgrade().map(|inner| Workflow { inner })
  }

  pub fn is_project(&self) -> bool {
    self.inner.id.parent().is_none()
  }

  /// The top-level workflow this one is nested in (or itself).
  pub fn project(&self) -> Workflow {
    let mut current = self.clone();
    while let Some(parent) = current.parent() {
      current = parent;
    }
    current
  }

  /// Location of the owning project.
  pub fn project_dir(&self) -> Option<PathBuf> {
    self.project().inner.location.clone()
  }

  pub fn registry(&self) -> Result<SandboxRegistry, GraphError> {
    self
      .inner
      .registry
      .upgrade()
      .map(SandboxRegistry::from_inner)
      .ok_or(GraphError::Disposed)
  }

  pub fn factories(&self) -> &NodeFactoryRegistry {
    &self.inner.factories
  }

  /// Scope of this workflow or its closest ancestor that has one.
  pub fn scope(&self) -> Option<ScopeContext> {
    if let Some(scope) = self.inner.scope.lock().clone() {
      return Some(scope);
    }
    self.parent().and_then(|parent| parent.scope())
  }

  pub fn can_modify_structure(&self) -> bool {
    if self.inner.read_only.load(Ordering::SeqCst) {
      return false;
    }
    self
      .parent()
      .is_none_or(|parent| parent.can_modify_structure())
  }

  /// Refuse (or allow again) structural changes to this workflow and
  /// everything nested in it.
  pub fn set_read_only(&self, read_only: bool) {
    self.inner.read_only.store(read_only, Ordering::SeqCst);
  }

  /// Acquire the structural lock. All structural mutation goes through the
  /// returned guard; the lock is released when it is dropped.
  pub fn lock(&self) -> WorkflowLock<'_> {
    WorkflowLock::new(self, self.inner.edit.lock())
  }

  pub fn input_port_count(&self) -> usize {
    self.inner.state.read().input_ports
  }

  pub fn output_port_count(&self) -> usize {
    self.inner.state.read().output_ports
  }

  pub fn node_ids(&self) -> Vec<NodeId> {
    self
      .inner
      .state
      .read()
      .nodes
      .values()
      .map(|entry| entry.id.clone())
      .collect()
  }

  pub fn nodes(&self) -> Vec<NodeInfo> {
    self
      .inner
      .state
      .read()
      .nodes
      .values()
      .map(NodeEntry::info)
      .collect()
  }

  pub fn node(&self, id: &NodeId) -> Result<NodeInfo, GraphError> {
    let state = self.inner.state.read();
    state.entry(&self.inner.id, id).map(NodeEntry::info)
  }

  pub fn contains(&self, id: &NodeId) -> bool {
    self.inner.state.read().index_of(&self.inner.id, id).is_some()
  }

  pub fn node_state(&self, id: &NodeId) -> Result<NodeState, GraphError> {
    let state = self.inner.state.read();
    state.entry(&self.inner.id, id).map(|entry| entry.state)
  }

  /// Nested workflow of a container node.
  pub fn container(&self, id: &NodeId) -> Option<Workflow> {
    let state = self.inner.state.read();
    state
      .entry(&self.inner.id, id)
      .ok()
      .and_then(|entry| entry.container().cloned())
  }

  pub fn connections(&self) -> Vec<Connection> {
    self.inner.state.read().connections.clone()
  }

  /// Connections into `id`, ordered by destination port.
  pub fn incoming(&self, id: &NodeId) -> Vec<Connection> {
    self.inner.state.read().incoming(id)
  }

  pub fn outgoing(&self, id: &NodeId) -> Vec<Connection> {
    self
      .inner
      .state
      .read()
      .connections
      .iter()
      .filter(|c| &c.source == id)
      .cloned()
      .collect()
  }

  /// Value at an output port, if the node produced one.
  pub fn output_value(&self, id: &NodeId, port: usize) -> Option<PortValue> {
    let state = self.inner.state.read();
    state
      .entry(&self.inner.id, id)
      .ok()
      .and_then(|entry| entry.outputs.get(port).cloned().flatten())
  }

  /// Flow variables a node passes downstream.
  pub fn output_variables(&self, id: &NodeId) -> Vec<FlowVariable> {
    let state = self.inner.state.read();
    state
      .entry(&self.inner.id, id)
      .map(|entry| entry.variables.clone())
      .unwrap_or_default()
  }

  /// Find the workflow directly containing `node`, searching nested containers.
  pub fn find_container_of(&self, node: &NodeId) -> Option<Workflow> {
    if !node.is_descendant_of(self.id()) {
      return None;
    }
    if node.parent().as_ref() == Some(self.id()) {
      return self.contains(node).then(|| self.clone());
    }
    let index = *node.segments().get(self.id().depth())?;
    self
      .container(&self.id().child(index))?
      .find_container_of(node)
  }

  /// Whether every node has executed successfully.
  pub fn is_fully_executed(&self) -> bool {
    self
      .inner
      .state
      .read()
      .nodes
      .values()
      .all(|entry| entry.state == NodeState::Executed)
  }

  /// Whether any node holds a result or a failure, or is busy.
  pub fn has_execution_state(&self) -> bool {
    self.inner.state.read().nodes.values().any(|entry| {
      entry.state != NodeState::Idle
        || entry
          .container()
          .is_some_and(|child| child.has_execution_state())
    })
  }

  /// Messages of all nodes that are not plain OK, for diagnostics.
  pub fn messages(&self) -> Vec<(NodeId, StatusMessage)> {
    self
      .inner
      .state
      .read()
      .nodes
      .values()
      .filter(|entry| entry.message.status != MessageStatus::Ok)
      .map(|entry| (entry.id.clone(), entry.message.clone()))
      .collect()
  }

  pub(crate) fn reset_nodes(&self) {
    let mut state = self.inner.state.write();
    for entry in state.nodes.values_mut() {
      if entry.state != NodeState::Executing {
        entry.reset();
      }
    }
  }
}

impl std::fmt::Debug for Workflow {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Workflow")
      .field("id", &self.inner.id)
      .field("name", &self.inner.name)
      .finish()
  }
}

impl PartialEq for Workflow {
  fn eq(&self, other: &Self) -> bool {
    Arc::ptr_eq(&self.inner, &other.inner)
  }
}
