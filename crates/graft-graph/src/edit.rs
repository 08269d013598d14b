//! Structural editing under the workflow lock.

use std::collections::{BTreeMap, HashMap, HashSet};

use graft_address::{NodeId, PasteMapping, RelativeAddress};
use parking_lot::MutexGuard;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::GraphError;
use crate::node::{Connection, NodeState, NodeUi};
use crate::persist::{ConnectionSnapshot, NodeSnapshot};
use crate::scope::ScopeContext;
use crate::workflow::{GraphState, NodeBody, NodeEntry, Workflow};

/// A transferable copy of a set of nodes and the connections among them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clipboard {
  pub nodes: Vec<NodeSnapshot>,
  pub connections: Vec<ConnectionSnapshot>,
}

/// Outcome of collapsing nodes into a new container node.
#[derive(Debug, Clone)]
pub struct CollapseResult {
  /// Id of the new container node.
  pub node: NodeId,
  pub workflow: Workflow,
  /// Former index of each collapsed node mapped to its id inside the container.
  pub mapping: PasteMapping,
}

impl Workflow {
  /// Copy a set of direct children and the connections between them.
  pub fn copy(&self, ids: &[NodeId]) -> Result<Clipboard, GraphError> {
    let state = self.inner.state.read();
    let own = self.id();
    let mut nodes = Vec::with_capacity(ids.len());
    let mut selected = HashSet::new();
    for id in ids {
      nodes.push(NodeSnapshot::of(state.entry(own, id)?));
      selected.insert(id.clone());
    }
    let connections = state
      .connections
      .iter()
      .filter(|c| selected.contains(&c.source) && selected.contains(&c.dest))
      .map(|c| ConnectionSnapshot::of(own, c))
      .collect();
    Ok(Clipboard { nodes, connections })
  }
}

/// Guard over a workflow's structural lock.
pub struct WorkflowLock<'a> {
  workflow: &'a Workflow,
  _guard: MutexGuard<'a, ()>,
}

impl<'a> WorkflowLock<'a> {
  pub(crate) fn new(workflow: &'a Workflow, guard: MutexGuard<'a, ()>) -> Self {
    Self {
      workflow,
      _guard: guard,
    }
  }

  pub fn workflow(&self) -> &Workflow {
    self.workflow
  }

  fn own(&self) -> &NodeId {
    self.workflow.id()
  }

  fn ensure_modifiable(&self) -> Result<(), GraphError> {
    if self.workflow.can_modify_structure() {
      Ok(())
    } else {
      Err(GraphError::ReadOnly {
        workflow: self.own().clone(),
      })
    }
  }

  /// Add a leaf node built by the factory `factory_id`.
  pub fn add_node(
    &self,
    name: &str,
    factory_id: &str,
    settings: serde_json::Value,
  ) -> Result<NodeId, GraphError> {
    self.ensure_modifiable()?;
    let model = self.workflow.factories().create(factory_id, &settings)?;
    let mut state = self.workflow.inner.state.write();
    let id = self.own().child(state.allocate_index());
    let entry = NodeEntry::new(
      id.clone(),
      name.to_string(),
      NodeBody::Leaf {
        factory_id: factory_id.to_string(),
        settings,
        model,
      },
    );
    state.nodes.insert(id.index(), entry);
    debug!(workflow_id = %self.own(), node_id = %id, factory_id = %factory_id, "node_added");
    Ok(id)
  }

  /// Add an empty container node with the given boundary port counts.
  pub fn add_container(
    &self,
    name: &str,
    input_ports: usize,
    output_ports: usize,
  ) -> Result<Workflow, GraphError> {
    self.ensure_modifiable()?;
    let mut state = self.workflow.inner.state.write();
    let index = state.allocate_index();
    let child = self.workflow.new_child(index, name, input_ports, output_ports);
    let entry = NodeEntry::new(
      child.id().clone(),
      name.to_string(),
      NodeBody::Container(child.clone()),
    );
    state.nodes.insert(index, entry);
    debug!(workflow_id = %self.own(), node_id = %child.id(), "container_added");
    Ok(child)
  }

  /// Remove a node together with all of its connections.
  pub fn remove_node(&self, id: &NodeId) -> Result<(), GraphError> {
    self.ensure_modifiable()?;
    let own = self.own().clone();
    let removed = {
      let mut state = self.workflow.inner.state.write();
      let entry = state.entry(&own, id)?;
      if matches!(entry.state, NodeState::Executing | NodeState::Queued) {
        return Err(GraphError::NodeBusy { node: id.clone() });
      }
      let targets: Vec<NodeId> = state
        .connections
        .iter()
        .filter(|c| &c.source == id && c.dest != own)
        .map(|c| c.dest.clone())
        .collect();
      for target in &targets {
        state.reset_downstream(&own, target);
      }
      state.connections.retain(|c| &c.source != id && &c.dest != id);
      state.nodes.remove(&id.index())
    };
    if let Some(child) = removed.as_ref().and_then(NodeEntry::container) {
      child.cancel_all();
    }
    debug!(workflow_id = %own, node_id = %id, "node_removed");
    Ok(())
  }

  /// Connect an output port to an input port. An endpoint equal to this
  /// workflow's id addresses its boundary. Resets the destination and
  /// everything downstream of it.
  pub fn connect(
    &self,
    source: &NodeId,
    source_port: usize,
    dest: &NodeId,
    dest_port: usize,
  ) -> Result<(), GraphError> {
    self.ensure_modifiable()?;
    let own = self.own().clone();
    let mut state = self.workflow.inner.state.write();
    validate_connection(&state, &own, source, source_port, dest, dest_port)?;
    state.connections.push(Connection {
      source: source.clone(),
      source_port,
      dest: dest.clone(),
      dest_port,
    });
    if dest != &own {
      state.reset_downstream(&own, dest);
    }
    Ok(())
  }

  /// Remove the connection feeding `dest_port` of `dest`, if any.
  pub fn disconnect(
    &self,
    dest: &NodeId,
    dest_port: usize,
  ) -> Result<Option<Connection>, GraphError> {
    self.ensure_modifiable()?;
    let own = self.own().clone();
    let mut state = self.workflow.inner.state.write();
    if dest != &own && state.entry(&own, dest)?.state == NodeState::Executing {
      return Err(GraphError::NodeBusy { node: dest.clone() });
    }
    let position = state
      .connections
      .iter()
      .position(|c| &c.dest == dest && c.dest_port == dest_port);
    let removed = position.map(|p| state.connections.remove(p));
    if removed.is_some() && dest != &own {
      state.reset_downstream(&own, dest);
    }
    Ok(removed)
  }

  /// Paste a clipboard. Every node gets a fresh index; the returned mapping
  /// translates the nodes' former indices into their new ids.
  pub fn paste(&self, clipboard: &Clipboard) -> Result<PasteMapping, GraphError> {
    self.ensure_modifiable()?;
    let own = self.own().clone();
    let indices: Vec<u32> = {
      let mut state = self.workflow.inner.state.write();
      clipboard.nodes.iter().map(|_| state.allocate_index()).collect()
    };

    let mut mapping = PasteMapping::new();
    let mut warnings = Vec::new();
    let mut entries = Vec::with_capacity(indices.len());
    for (node, index) in clipboard.nodes.iter().zip(&indices) {
      let entry = self.workflow.build_entry(*index, node, &mut warnings)?;
      mapping.insert(RelativeAddress::from(node.index), entry.id.clone());
      entries.push(entry);
    }
    for warning in warnings {
      warn!(workflow_id = %own, warning = %warning, "paste_warning");
    }

    let mut connections = Vec::with_capacity(clipboard.connections.len());
    for c in &clipboard.connections {
      let (Some(source), Some(dest)) = (c.source, c.dest) else {
        continue;
      };
      connections.push(Connection {
        source: mapping.remap(&RelativeAddress::from(source))?,
        source_port: c.source_port,
        dest: mapping.remap(&RelativeAddress::from(dest))?,
        dest_port: c.dest_port,
      });
    }

    let mut state = self.workflow.inner.state.write();
    for entry in entries {
      state.nodes.insert(entry.id.index(), entry);
    }
    state.connections.extend(connections);
    debug!(workflow_id = %own, nodes = mapping.len(), "nodes_pasted");
    Ok(mapping)
  }

  /// Move a set of direct children into a new container node. Connections
  /// crossing the set's border are routed through the container's boundary
  /// ports: one input per distinct outside source port, one output per
  /// distinct inside source port.
  pub fn collapse(&self, ids: &[NodeId], name: &str) -> Result<CollapseResult, GraphError> {
    self.ensure_modifiable()?;
    if ids.is_empty() {
      return Err(GraphError::InvalidConnection {
        message: "cannot collapse an empty node set".to_string(),
      });
    }
    let own = self.own().clone();
    let selected: HashSet<NodeId> = ids.iter().cloned().collect();

    let (clipboard, incoming, outgoing, ui) = {
      let state = self.workflow.inner.state.read();
      let mut x = 0i64;
      let mut y = 0i64;
      for id in ids {
        let entry = state.entry(&own, id)?;
        if matches!(entry.state, NodeState::Executing | NodeState::Queued) {
          return Err(GraphError::NodeBusy { node: id.clone() });
        }
        x += i64::from(entry.ui.x);
        y += i64::from(entry.ui.y);
      }
      let count = ids.len() as i64;
      let ui = NodeUi {
        x: (x / count) as i32,
        y: (y / count) as i32,
        hidden: false,
      };
      let incoming: Vec<Connection> = state
        .connections
        .iter()
        .filter(|c| selected.contains(&c.dest) && !selected.contains(&c.source))
        .cloned()
        .collect();
      let outgoing: Vec<Connection> = state
        .connections
        .iter()
        .filter(|c| selected.contains(&c.source) && !selected.contains(&c.dest))
        .cloned()
        .collect();
      drop(state);
      (self.workflow.copy(ids)?, incoming, outgoing, ui)
    };

    let mut input_ports: Vec<(NodeId, usize)> = Vec::new();
    for c in &incoming {
      let key = (c.source.clone(), c.source_port);
      if !input_ports.contains(&key) {
        input_ports.push(key);
      }
    }
    let mut output_ports: Vec<(NodeId, usize)> = Vec::new();
    for c in &outgoing {
      let key = (c.source.clone(), c.source_port);
      if !output_ports.contains(&key) {
        output_ports.push(key);
      }
    }

    let child = {
      let mut state = self.workflow.inner.state.write();
      let index = state.allocate_index();
      self
        .workflow
        .new_child(index, name, input_ports.len(), output_ports.len())
    };
    let mapping = child.lock().paste(&clipboard)?;
    let remap = |node: &NodeId| mapping.remap(&RelativeAddress::from(node.index()));

    {
      let inner_id = child.id().clone();
      let mut child_state = child.inner.state.write();
      for c in &incoming {
        let port = input_ports
          .iter()
          .position(|k| k.0 == c.source && k.1 == c.source_port)
          .unwrap_or_default();
        child_state.connections.push(Connection {
          source: inner_id.clone(),
          source_port: port,
          dest: remap(&c.dest)?,
          dest_port: c.dest_port,
        });
      }
      for (port, (source, source_port)) in output_ports.iter().enumerate() {
        child_state.connections.push(Connection {
          source: remap(source)?,
          source_port: *source_port,
          dest: inner_id.clone(),
          dest_port: port,
        });
      }
    }

    let container_id = child.id().clone();
    let mut state = self.workflow.inner.state.write();
    for c in &outgoing {
      if c.dest != own {
        state.reset_downstream(&own, &c.dest);
      }
    }
    state
      .connections
      .retain(|c| !selected.contains(&c.source) && !selected.contains(&c.dest));
    for id in ids {
      state.nodes.remove(&id.index());
    }
    let mut entry = NodeEntry::new(
      container_id.clone(),
      name.to_string(),
      NodeBody::Container(child.clone()),
    );
    entry.ui = ui;
    state.nodes.insert(container_id.index(), entry);

    for (port, (source, source_port)) in input_ports.iter().enumerate() {
      state.connections.push(Connection {
        source: source.clone(),
        source_port: *source_port,
        dest: container_id.clone(),
        dest_port: port,
      });
    }
    for c in &outgoing {
      let port = output_ports
        .iter()
        .position(|k| k.0 == c.source && k.1 == c.source_port)
        .unwrap_or_default();
      state.connections.push(Connection {
        source: container_id.clone(),
        source_port: port,
        dest: c.dest.clone(),
        dest_port: c.dest_port,
      });
    }
    debug!(
      workflow_id = %own,
      container_id = %container_id,
      nodes = ids.len(),
      "nodes_collapsed"
    );

    Ok(CollapseResult {
      node: container_id,
      workflow: child,
      mapping,
    })
  }

  /// Replace a leaf node's settings and rebuild its model. Resets the node
  /// and everything downstream; connections to ports that no longer exist
  /// are dropped.
  pub fn set_settings(&self, id: &NodeId, settings: serde_json::Value) -> Result<(), GraphError> {
    self.ensure_modifiable()?;
    let own = self.own().clone();
    let mut state = self.workflow.inner.state.write();
    let entry = state.entry_mut(&own, id)?;
    if entry.state == NodeState::Executing {
      return Err(GraphError::NodeBusy { node: id.clone() });
    }
    let NodeBody::Leaf { factory_id, .. } = &entry.body else {
      return Err(GraphError::InvalidSettings {
        factory_id: String::new(),
        message: format!("{} is a container node", id),
      });
    };
    let factory_id = factory_id.clone();
    let model = self.workflow.factories().create(&factory_id, &settings)?;
    let (inputs, outputs) = (model.input_count(), model.output_count());
    entry.body = NodeBody::Leaf {
      factory_id,
      settings,
      model,
    };
    state.reset_downstream(&own, id);
    state.connections.retain(|c| {
      !((&c.dest == id && c.dest_port >= inputs) || (&c.source == id && c.source_port >= outputs))
    });
    Ok(())
  }

  /// Override the configuration of every top-level node whose parameter
  /// name is a key of `parameters`. Returns the number of nodes changed.
  pub fn apply_parameters(
    &self,
    parameters: &BTreeMap<String, serde_json::Value>,
  ) -> Result<usize, GraphError> {
    if parameters.is_empty() {
      return Ok(0);
    }
    let updates: Vec<(NodeId, serde_json::Value)> = {
      let state = self.workflow.inner.state.read();
      state
        .nodes
        .values()
        .filter_map(|entry| {
          let NodeBody::Leaf {
            settings, model, ..
          } = &entry.body
          else {
            return None;
          };
          let value = parameters.get(model.parameter_name()?)?;
          model
            .with_parameter(settings, value.clone())
            .map(|settings| (entry.id.clone(), settings))
        })
        .collect()
    };
    let count = updates.len();
    for (id, settings) in updates {
      self.set_settings(&id, settings)?;
    }
    debug!(workflow_id = %self.own(), nodes = count, "parameters_applied");
    Ok(count)
  }

  pub fn set_ui(&self, id: &NodeId, ui: NodeUi) -> Result<(), GraphError> {
    let own = self.own().clone();
    let mut state = self.workflow.inner.state.write();
    state.entry_mut(&own, id)?.ui = ui;
    Ok(())
  }

  pub fn set_name(&self, id: &NodeId, name: &str) -> Result<(), GraphError> {
    let own = self.own().clone();
    let mut state = self.workflow.inner.state.write();
    state.entry_mut(&own, id)?.name = name.to_string();
    Ok(())
  }

  /// Attach (or clear) the scope nodes of this workflow run under.
  pub fn set_scope(&self, scope: Option<ScopeContext>) {
    *self.workflow.inner.scope.lock() = scope;
  }

  /// Place every node by its topological depth: column `depth * spacing`,
  /// row by position within the column.
  pub fn layout_by_depth(&self, spacing: i32) {
    let own = self.own().clone();
    let mut state = self.workflow.inner.state.write();

    let mut depth: HashMap<NodeId, usize> = HashMap::new();
    let order = topological_order(&state, &own);
    for id in &order {
      let d = state
        .incoming(id)
        .iter()
        .filter(|c| c.source != own)
        .filter_map(|c| depth.get(&c.source).map(|d| d + 1))
        .max()
        .unwrap_or(0);
      depth.insert(id.clone(), d);
    }

    let mut columns: BTreeMap<usize, Vec<NodeId>> = BTreeMap::new();
    for id in order {
      let d = depth.get(&id).copied().unwrap_or(0);
      columns.entry(d).or_default().push(id);
    }
    for (d, mut column) in columns {
      column.sort();
      for (row, id) in column.iter().enumerate() {
        if let Some(entry) = state.nodes.get_mut(&id.index()) {
          entry.ui.x = d as i32 * spacing;
          entry.ui.y = row as i32 * spacing;
        }
      }
    }
  }
}

/// Nodes ordered so that every node comes after its sources.
pub(crate) fn topological_order(state: &GraphState, own: &NodeId) -> Vec<NodeId> {
  let mut remaining: HashMap<NodeId, usize> = state
    .nodes
    .values()
    .map(|entry| {
      let count = state
        .connections
        .iter()
        .filter(|c| c.dest == entry.id && &c.source != own)
        .count();
      (entry.id.clone(), count)
    })
    .collect();
  let mut ready: Vec<NodeId> = remaining
    .iter()
    .filter(|(_, count)| **count == 0)
    .map(|(id, _)| id.clone())
    .collect();
  ready.sort();
  let mut order = Vec::with_capacity(remaining.len());
  while let Some(id) = ready.pop() {
    for c in state.connections.iter().filter(|c| c.source == id && &c.dest != own) {
      if let Some(count) = remaining.get_mut(&c.dest) {
        *count -= 1;
        if *count == 0 {
          ready.push(c.dest.clone());
        }
      }
    }
    order.push(id);
  }
  order
}

fn validate_connection(
  state: &GraphState,
  own: &NodeId,
  source: &NodeId,
  source_port: usize,
  dest: &NodeId,
  dest_port: usize,
) -> Result<(), GraphError> {
  let invalid = |message: String| GraphError::InvalidConnection { message };

  let source_ports = if source == own {
    state.input_ports
  } else {
    state.entry(own, source)?.output_count()
  };
  if source_port >= source_ports {
    return Err(invalid(format!("{} has no output port {}", source, source_port)));
  }

  if dest == own {
    if dest_port >= state.output_ports {
      return Err(invalid(format!("{} has no output port {}", own, dest_port)));
    }
  } else {
    let entry = state.entry(own, dest)?;
    if dest_port >= entry.input_count() {
      return Err(invalid(format!("{} has no input port {}", dest, dest_port)));
    }
    if entry.state == NodeState::Executing {
      return Err(GraphError::NodeBusy { node: dest.clone() });
    }
  }

  if state
    .connections
    .iter()
    .any(|c| &c.dest == dest && c.dest_port == dest_port)
  {
    return Err(invalid(format!("port {} of {} is already connected", dest_port, dest)));
  }

  if source != own && dest != own && state.downstream(own, dest).contains(source) {
    return Err(invalid(format!("connecting {} to {} creates a cycle", source, dest)));
  }
  Ok(())
}
