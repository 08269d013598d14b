//! Executor error types.

use graft_address::{AddressError, NodeId};
use graft_fragment::FragmentError;
use graft_graph::GraphError;
use graft_reference::ReferenceError;

use crate::aggregate::NodeMessage;

/// Errors that can occur while preparing or running a fragment.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
  /// The executor configuration is inconsistent.
  #[error("invalid executor configuration: {message}")]
  InvalidConfig { message: String },

  /// The host container refuses structural changes in the requested mode.
  #[error("workflow {workflow} cannot be modified, use detached execution")]
  StructuralLock { workflow: NodeId },

  /// Reference data resolved outside of its project directory.
  #[error("security violation: {message}")]
  Security { message: String },

  /// One or more nodes failed. `summary` is the compiled single message.
  #[error("{summary}")]
  ExecutionFailure {
    summary: String,
    messages: Vec<NodeMessage>,
  },

  /// The run was cancelled by the caller.
  #[error("execution was cancelled")]
  Cancelled,

  /// The executor is not in a state that allows the operation.
  #[error("illegal state: {message}")]
  IllegalState { message: String },

  /// Wiring the fragment into its container failed.
  #[error("failed to prepare execution: {message}")]
  Preparation { message: String },

  #[error(transparent)]
  Fragment(#[from] FragmentError),

  #[error(transparent)]
  Graph(#[from] GraphError),

  #[error(transparent)]
  Reference(ReferenceError),

  #[error(transparent)]
  Address(#[from] AddressError),
}

impl From<ReferenceError> for ExecutionError {
  fn from(e: ReferenceError) -> Self {
    match e {
      ReferenceError::Security { .. } => ExecutionError::Security {
        message: e.to_string(),
      },
      other => ExecutionError::Reference(other),
    }
  }
}
