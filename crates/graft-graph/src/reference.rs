//! Data references held by reference-reader nodes.

use graft_address::NodeId;
use serde::{Deserialize, Serialize};

/// Where a reference-reader node gets its value from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DataReference {
  /// An output port of a live node somewhere in the registry.
  Node { node: NodeId, port: usize },
  /// A JSON-encoded value file, relative to the owning project directory.
  File { path: String },
  /// A value registered in the process-wide repository.
  Repository { id: String },
}

impl DataReference {
  pub fn kind(&self) -> &'static str {
    match self {
      DataReference::Node { .. } => "node",
      DataReference::File { .. } => "file",
      DataReference::Repository { .. } => "repository",
    }
  }
}
