use thiserror::Error;

use crate::id::{NodeId, RelativeAddress};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
  /// The address was not part of the pasted node set.
  #[error("address {address} was not part of the pasted node set")]
  Unresolved { address: RelativeAddress },

  #[error("node {node} is not contained in {root}")]
  NotContained { root: NodeId, node: NodeId },

  #[error("invalid address '{input}': {message}")]
  Parse { input: String, message: String },
}
