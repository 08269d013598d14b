//! Graph container error types.

use std::path::PathBuf;

use graft_address::{AddressError, NodeId};

/// Errors raised by the graph container.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
  /// No node with this id exists in the addressed container.
  #[error("node {node} not found")]
  NodeNotFound { node: NodeId },

  /// No factory is registered under this id.
  #[error("unknown node factory '{factory_id}'")]
  UnknownFactory { factory_id: String },

  /// Node settings could not be turned into a model.
  #[error("invalid settings for '{factory_id}': {message}")]
  InvalidSettings { factory_id: String, message: String },

  /// A connection violates port bounds, duplicates an input or forms a cycle.
  #[error("invalid connection: {message}")]
  InvalidConnection { message: String },

  /// The container does not accept structural changes.
  #[error("workflow {workflow} cannot be modified")]
  ReadOnly { workflow: NodeId },

  /// The node is executing and cannot be changed or removed.
  #[error("node {node} is currently executing")]
  NodeBusy { node: NodeId },

  /// Execution was requested outside of a tokio runtime.
  #[error("no async runtime available to execute workflow")]
  NoRuntime,

  /// The owning registry is gone.
  #[error("sandbox registry has been dropped")]
  Disposed,

  /// Filesystem access failed.
  #[error("i/o error on {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  /// A persisted graph could not be loaded.
  #[error("failed to load workflow: {message}")]
  Load { message: String },

  /// A path resolved outside of the directory it must stay in.
  #[error("path {path} escapes {root}")]
  PathEscape { path: PathBuf, root: PathBuf },

  /// A data reference could not be resolved.
  #[error("unresolvable data reference: {message}")]
  Reference { message: String },

  #[error(transparent)]
  Address(#[from] AddressError),
}

impl GraphError {
  pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
    GraphError::Io {
      path: path.into(),
      source,
    }
  }
}
