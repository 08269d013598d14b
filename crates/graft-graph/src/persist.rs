//! Graph snapshots and the binary workflow dump.
//!
//! Snapshots describe structure only: nodes, settings, placement and
//! connections. Execution results are never persisted, a loaded workflow starts
//! out idle. Settings are stored as JSON text since the binary encoding cannot
//! carry self-describing values.

use std::path::Path;
use std::sync::Arc;

use graft_address::NodeId;
use serde::{Deserialize, Serialize};

use crate::error::GraphError;
use crate::model::MissingNode;
use crate::node::{Connection, NodeUi};
use crate::workflow::{NodeBody, NodeEntry, Workflow};

/// Version of the dump layout written by this build.
pub const FORMAT_VERSION: u32 = 1;

/// File holding the dump inside a project directory.
pub const GRAPH_FILE: &str = "graph.bin";

/// Release that writes dumps.
pub const CREATED_BY: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
  pub input_ports: usize,
  pub output_ports: usize,
  pub nodes: Vec<NodeSnapshot>,
  pub connections: Vec<ConnectionSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
  /// Index of the node in the container it was taken from.
  pub index: u32,
  pub name: String,
  pub ui: NodeUi,
  pub body: NodeBodySnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeBodySnapshot {
  Leaf {
    factory_id: String,
    settings: String,
    input_count: usize,
    output_count: usize,
  },
  Container(GraphSnapshot),
}

/// A connection by node index; `None` is the container boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
  pub source: Option<u32>,
  pub source_port: usize,
  pub dest: Option<u32>,
  pub dest_port: usize,
}

impl ConnectionSnapshot {
  pub(crate) fn of(own: &NodeId, connection: &Connection) -> Self {
    let index = |node: &NodeId| (node != own).then(|| node.index());
    Self {
      source: index(&connection.source),
      source_port: connection.source_port,
      dest: index(&connection.dest),
      dest_port: connection.dest_port,
    }
  }
}

/// Persisted form of a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDump {
  pub format_version: u32,
  pub created_by: String,
  pub name: String,
  pub graph: GraphSnapshot,
}

impl WorkflowDump {
  pub fn write_to(&self, dir: &Path) -> Result<(), GraphError> {
    std::fs::create_dir_all(dir).map_err(|e| GraphError::io(dir, e))?;
    let path = dir.join(GRAPH_FILE);
    let bytes = bincode::serialize(self).map_err(|e| GraphError::io(&path, std::io::Error::other(e)))?;
    std::fs::write(&path, bytes).map_err(|e| GraphError::io(&path, e))
  }

  pub fn read_from(dir: &Path) -> Result<Self, GraphError> {
    let path = dir.join(GRAPH_FILE);
    let bytes = std::fs::read(&path).map_err(|e| GraphError::Load {
      message: format!("unable to read {}: {}", path.display(), e),
    })?;
    bincode::deserialize(&bytes).map_err(|e| GraphError::Load {
      message: format!("corrupt workflow file {}: {}", path.display(), e),
    })
  }

  /// Reject dumps this build cannot read; report version skew as a warning.
  pub(crate) fn check(&self, warnings: &mut Vec<String>) -> Result<(), GraphError> {
    if self.format_version > FORMAT_VERSION {
      return Err(GraphError::Load {
        message: format!(
          "unsupported workflow format version {} (this release reads up to {})",
          self.format_version, FORMAT_VERSION
        ),
      });
    }
    if is_newer(&self.created_by, CREATED_BY) {
      warnings.push(format!(
        "The loaded workflow was created by a newer release ({}). This may lead to an improperly \
         loaded workflow (e.g. missing nodes or connections, or incorrect node configurations).",
        self.created_by
      ));
    }
    Ok(())
  }
}

fn version_key(version: &str) -> Vec<u64> {
  version
    .split(['-', '+'])
    .next()
    .unwrap_or_default()
    .split('.')
    .map(|part| part.parse().unwrap_or(0))
    .collect()
}

/// Whether `candidate` is a later release than `current`. Pre-release tags are ignored.
pub(crate) fn is_newer(candidate: &str, current: &str) -> bool {
  version_key(candidate) > version_key(current)
}

impl Workflow {
  pub fn snapshot(&self) -> GraphSnapshot {
    let state = self.inner.state.read();
    GraphSnapshot {
      input_ports: state.input_ports,
      output_ports: state.output_ports,
      nodes: state.nodes.values().map(NodeSnapshot::of).collect(),
      connections: state
        .connections
        .iter()
        .map(|c| ConnectionSnapshot::of(self.id(), c))
        .collect(),
    }
  }

  /// Write the workflow's dump into `dir`.
  pub fn save_to_dir(&self, dir: &Path) -> Result<(), GraphError> {
    let dump = WorkflowDump {
      format_version: FORMAT_VERSION,
      created_by: CREATED_BY.to_string(),
      name: self.name().to_string(),
      graph: self.snapshot(),
    };
    dump.write_to(dir)?;
    tracing::debug!(workflow_id = %self.id(), dir = %dir.display(), "workflow_saved");
    Ok(())
  }

  /// Build a node from its snapshot as child `index` of `self`. Unknown
  /// factories produce a placeholder node and a warning.
  pub(crate) fn build_entry(
    &self,
    index: u32,
    node: &NodeSnapshot,
    warnings: &mut Vec<String>,
  ) -> Result<NodeEntry, GraphError> {
    let id = self.id().child(index);
    let body = match &node.body {
      NodeBodySnapshot::Leaf {
        factory_id,
        settings,
        input_count,
        output_count,
      } => {
        let settings: serde_json::Value =
          serde_json::from_str(settings).map_err(|e| GraphError::Load {
            message: format!("settings of node '{}' are corrupt: {}", node.name, e),
          })?;
        let model = match self.inner.factories.create(factory_id, &settings) {
          Ok(model) => model,
          Err(e) => {
            warnings.push(format!(
              "Node '{}' ({}) could not be loaded: {}",
              node.name, id, e
            ));
            Arc::new(MissingNode {
              factory_id: factory_id.clone(),
              inputs: *input_count,
              outputs: *output_count,
            })
          }
        };
        NodeBody::Leaf {
          factory_id: factory_id.clone(),
          settings,
          model,
        }
      }
      NodeBodySnapshot::Container(graph) => {
        let child = self.new_child(index, node.name.clone(), graph.input_ports, graph.output_ports);
        child.populate(graph, warnings)?;
        NodeBody::Container(child)
      }
    };
    let mut entry = NodeEntry::new(id, node.name.clone(), body);
    entry.ui = node.ui;
    Ok(entry)
  }

  /// Fill an empty workflow from a snapshot, keeping node indices.
  pub(crate) fn populate(
    &self,
    graph: &GraphSnapshot,
    warnings: &mut Vec<String>,
  ) -> Result<(), GraphError> {
    let entries = graph
      .nodes
      .iter()
      .map(|node| self.build_entry(node.index, node, warnings))
      .collect::<Result<Vec<_>, _>>()?;

    let own = self.id().clone();
    let endpoint = |index: Option<u32>| index.map(|i| own.child(i)).unwrap_or_else(|| own.clone());

    let mut state = self.inner.state.write();
    state.input_ports = graph.input_ports;
    state.output_ports = graph.output_ports;
    for entry in entries {
      let index = entry.id.index();
      state.next_index = state.next_index.max(index + 1);
      state.nodes.insert(index, entry);
    }
    for connection in &graph.connections {
      state.connections.push(Connection {
        source: endpoint(connection.source),
        source_port: connection.source_port,
        dest: endpoint(connection.dest),
        dest_port: connection.dest_port,
      });
    }
    Ok(())
  }
}

impl NodeSnapshot {
  pub(crate) fn of(entry: &NodeEntry) -> Self {
    let body = match &entry.body {
      NodeBody::Leaf {
        factory_id,
        settings,
        model,
      } => NodeBodySnapshot::Leaf {
        factory_id: factory_id.clone(),
        settings: settings.to_string(),
        input_count: model.input_count(),
        output_count: model.output_count(),
      },
      NodeBody::Container(child) => NodeBodySnapshot::Container(child.snapshot()),
    };
    Self {
      index: entry.id.index(),
      name: entry.name.clone(),
      ui: entry.ui,
      body,
    }
  }
}
