use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::AddressError;

/// Concrete, host-assigned node address such as `0:3:5`.
///
/// The first segment identifies the project inside its registry, every further
/// segment the node's index within the enclosing container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(Vec<u32>);

impl NodeId {
  /// Address of a top-level project.
  pub fn root(index: u32) -> Self {
    Self(vec![index])
  }

  /// Address of the node with `index` inside this container.
  pub fn child(&self, index: u32) -> Self {
    let mut segments = self.0.clone();
    segments.push(index);
    Self(segments)
  }

  /// The enclosing container, `None` for projects.
  pub fn parent(&self) -> Option<NodeId> {
    if self.0.len() <= 1 {
      return None;
    }
    Some(Self(self.0[..self.0.len() - 1].to_vec()))
  }

  /// Index of this node within its parent container.
  pub fn index(&self) -> u32 {
    self.0.last().copied().unwrap_or_default()
  }

  pub fn segments(&self) -> &[u32] {
    &self.0
  }

  pub fn depth(&self) -> usize {
    self.0.len()
  }

  /// Whether `self` lives (transitively) inside `ancestor`.
  pub fn is_descendant_of(&self, ancestor: &NodeId) -> bool {
    self.0.len() > ancestor.0.len() && self.0.starts_with(&ancestor.0)
  }
}

impl fmt::Display for NodeId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write_segments(f, &self.0)
  }
}

impl FromStr for NodeId {
  type Err = AddressError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    parse_segments(s).map(Self)
  }
}

/// A node address relative to the root container of a fragment, e.g. `3:5`.
///
/// Relative addresses are stable across copy/paste and serialization, whereas
/// the concrete [`NodeId`] of a node depends on where it is currently hosted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelativeAddress(Vec<u32>);

impl RelativeAddress {
  /// Create a relative address from its segments. At least one is required.
  pub fn new(segments: Vec<u32>) -> Result<Self, AddressError> {
    if segments.is_empty() {
      return Err(AddressError::Parse {
        input: String::new(),
        message: "relative address must have at least one segment".to_string(),
      });
    }
    Ok(Self(segments))
  }

  /// Express `node` relative to the container `root`.
  pub fn of(root: &NodeId, node: &NodeId) -> Result<Self, AddressError> {
    if !node.is_descendant_of(root) {
      return Err(AddressError::NotContained {
        root: root.clone(),
        node: node.clone(),
      });
    }
    Ok(Self(node.segments()[root.depth()..].to_vec()))
  }

  /// Turn the address back into a concrete id below `root`.
  pub fn resolve(&self, root: &NodeId) -> NodeId {
    let mut segments = root.segments().to_vec();
    segments.extend_from_slice(&self.0);
    NodeId(segments)
  }

  /// Index of the top-level node this address points into.
  pub fn head(&self) -> u32 {
    self.0[0]
  }

  /// Segments below the top-level node (empty for top-level nodes).
  pub fn tail(&self) -> &[u32] {
    &self.0[1..]
  }

  /// Whether this addresses a node directly inside the root container.
  pub fn is_top_level(&self) -> bool {
    self.0.len() == 1
  }

  /// Address of the same node seen from one container further out.
  pub fn prepend(&self, index: u32) -> RelativeAddress {
    let mut segments = Vec::with_capacity(self.0.len() + 1);
    segments.push(index);
    segments.extend_from_slice(&self.0);
    Self(segments)
  }

  pub fn segments(&self) -> &[u32] {
    &self.0
  }
}

impl From<u32> for RelativeAddress {
  fn from(index: u32) -> Self {
    Self(vec![index])
  }
}

impl fmt::Display for RelativeAddress {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write_segments(f, &self.0)
  }
}

impl FromStr for RelativeAddress {
  type Err = AddressError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    parse_segments(s).map(Self)
  }
}

fn write_segments(f: &mut fmt::Formatter<'_>, segments: &[u32]) -> fmt::Result {
  for (i, segment) in segments.iter().enumerate() {
    if i > 0 {
      f.write_str(":")?;
    }
    write!(f, "{}", segment)?;
  }
  Ok(())
}

fn parse_segments(input: &str) -> Result<Vec<u32>, AddressError> {
  if input.trim().is_empty() {
    return Err(AddressError::Parse {
      input: input.to_string(),
      message: "empty address".to_string(),
    });
  }
  input
    .split(':')
    .map(|part| {
      part.trim().parse::<u32>().map_err(|e| AddressError::Parse {
        input: input.to_string(),
        message: e.to_string(),
      })
    })
    .collect()
}

macro_rules! string_serde {
  ($ty:ty) => {
    impl Serialize for $ty {
      fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
      }
    }

    impl<'de> Deserialize<'de> for $ty {
      fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
      }
    }
  };
}

string_serde!(NodeId);
string_serde!(RelativeAddress);
