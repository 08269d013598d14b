use std::collections::HashMap;

use crate::error::AddressError;
use crate::id::{NodeId, RelativeAddress};
use crate::port::{ConcretePort, PortRef};

/// Translation table produced by a paste: the address each pasted node had in
/// the copied unit, mapped to the concrete id it received in the target.
///
/// Only the top-level pasted nodes need an entry. Addresses pointing into a
/// pasted container are resolved through the longest matching prefix, since a
/// container's children keep their indices when the container moves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PasteMapping {
  entries: HashMap<RelativeAddress, NodeId>,
}

impl PasteMapping {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn insert(&mut self, source: RelativeAddress, target: NodeId) {
    self.entries.insert(source, target);
  }

  pub fn get(&self, source: &RelativeAddress) -> Option<&NodeId> {
    self.entries.get(source)
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Concrete ids of every pasted top-level node, sorted.
  pub fn targets(&self) -> Vec<NodeId> {
    let mut targets: Vec<NodeId> = self.entries.values().cloned().collect();
    targets.sort();
    targets
  }

  pub fn iter(&self) -> impl Iterator<Item = (&RelativeAddress, &NodeId)> {
    self.entries.iter()
  }

  /// Translate a fragment address into the concrete id it has after the paste.
  pub fn remap(&self, address: &RelativeAddress) -> Result<NodeId, AddressError> {
    if let Some(target) = self.entries.get(address) {
      return Ok(target.clone());
    }

    let segments = address.segments();
    for split in (1..segments.len()).rev() {
      let Ok(prefix) = RelativeAddress::new(segments[..split].to_vec()) else {
        continue;
      };
      if let Some(target) = self.entries.get(&prefix) {
        let mut node = target.clone();
        for index in &segments[split..] {
          node = node.child(*index);
        }
        return Ok(node);
      }
    }

    Err(AddressError::Unresolved {
      address: address.clone(),
    })
  }

  pub fn remap_port(&self, port: &PortRef) -> Result<ConcretePort, AddressError> {
    Ok(ConcretePort {
      node: self.remap(&port.address)?,
      port: port.port_index,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn mapping() -> PasteMapping {
    let target = NodeId::root(1);
    let mut mapping = PasteMapping::new();
    mapping.insert(RelativeAddress::from(3), target.child(10));
    mapping.insert(RelativeAddress::from(4), target.child(11));
    mapping
  }

  #[test]
  fn test_remap_top_level() {
    let remapped = mapping().remap(&RelativeAddress::from(4)).unwrap();
    assert_eq!(remapped.to_string(), "1:11");
  }

  #[test]
  fn test_remap_nested_keeps_tail() {
    let address: RelativeAddress = "3:2:7".parse().unwrap();
    let remapped = mapping().remap(&address).unwrap();
    assert_eq!(remapped.to_string(), "1:10:2:7");
  }

  #[test]
  fn test_remap_unknown_address_fails() {
    let err = mapping().remap(&RelativeAddress::from(8)).unwrap_err();
    assert!(matches!(err, AddressError::Unresolved { .. }));
  }

  #[test]
  fn test_remap_port() {
    let port = PortRef::new(3, 2);
    let concrete = mapping().remap_port(&port).unwrap();
    assert_eq!(concrete, ConcretePort::new(NodeId::root(1).child(10), 2));
  }

  #[test]
  fn test_targets_sorted() {
    let targets: Vec<String> = mapping().targets().iter().map(|t| t.to_string()).collect();
    assert_eq!(targets, vec!["1:10", "1:11"]);
  }
}
