//! Fragment error types.

use graft_address::AddressError;
use graft_graph::GraphError;

/// Errors that can occur while capturing, loading or archiving a fragment.
#[derive(Debug, thiserror::Error)]
pub enum FragmentError {
  /// The source workflow cannot be captured in its current state.
  #[error("capture failed: {message}")]
  Capture { message: String },

  /// The archived graph could not be restored.
  #[error("failed to load fragment: {message}")]
  Load { message: String },

  /// The archive does not have the expected layout.
  #[error("invalid fragment archive: {message}")]
  Format { message: String },

  /// The operation is not possible in the fragment's current state.
  #[error("illegal state: {message}")]
  IllegalState { message: String },

  #[error("i/o error: {source}")]
  Io {
    #[from]
    source: std::io::Error,
  },

  #[error(transparent)]
  Graph(#[from] GraphError),

  #[error(transparent)]
  Address(#[from] AddressError),
}
