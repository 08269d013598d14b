use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::AddressError;
use crate::id::{NodeId, RelativeAddress};

/// A port of a node inside a fragment, addressed relative to the fragment root.
///
/// Two port references are equal iff both the address and the index match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortRef {
  pub address: RelativeAddress,
  pub port_index: usize,
}

impl PortRef {
  pub fn new(address: impl Into<RelativeAddress>, port_index: usize) -> Self {
    Self {
      address: address.into(),
      port_index,
    }
  }

  /// Resolve against the container the fragment currently lives in.
  pub fn resolve(&self, root: &NodeId) -> ConcretePort {
    ConcretePort {
      node: self.address.resolve(root),
      port: self.port_index,
    }
  }
}

impl fmt::Display for PortRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Node #{} | Port #{}", self.address, self.port_index)
  }
}

/// A port on a concrete, currently hosted node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConcretePort {
  pub node: NodeId,
  pub port: usize,
}

impl ConcretePort {
  pub fn new(node: NodeId, port: usize) -> Self {
    Self { node, port }
  }

  /// Express this port relative to `root`, the inverse of [`PortRef::resolve`].
  pub fn relative_to(&self, root: &NodeId) -> Result<PortRef, AddressError> {
    Ok(PortRef {
      address: RelativeAddress::of(root, &self.node)?,
      port_index: self.port,
    })
  }
}

impl fmt::Display for ConcretePort {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}[{}]", self.node, self.port)
  }
}
