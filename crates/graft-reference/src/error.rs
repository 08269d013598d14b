//! Reference materialization error types.

use std::path::PathBuf;

use graft_address::{AddressError, NodeId};
use graft_fragment::FragmentError;
use graft_graph::GraphError;

/// Errors that can occur while materializing reference data.
#[derive(Debug, thiserror::Error)]
pub enum ReferenceError {
  /// A path resolved outside of the directory it belongs to.
  #[error("security violation: {path} resolves outside of {root}")]
  Security { path: PathBuf, root: PathBuf },

  /// The workflow has no project directory to read from or write into.
  #[error("workflow {workflow} has no project directory")]
  NoProjectDir { workflow: NodeId },

  /// The addressed node does not hold a data reference.
  #[error("node {node} is not a reference reader")]
  NotReference { node: NodeId },

  #[error("failed to write {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to encode value of {node}: {source}")]
  Encode {
    node: NodeId,
    #[source]
    source: serde_json::Error,
  },

  #[error(transparent)]
  Graph(GraphError),

  #[error(transparent)]
  Fragment(#[from] FragmentError),

  #[error(transparent)]
  Address(#[from] AddressError),
}

impl From<GraphError> for ReferenceError {
  fn from(e: GraphError) -> Self {
    match e {
      GraphError::PathEscape { path, root } => ReferenceError::Security { path, root },
      other => ReferenceError::Graph(other),
    }
  }
}
