//! Boundary slots of a fragment.

use std::collections::BTreeSet;

use graft_address::{ConcretePort, PortRef};
use graft_graph::{PortTypeDescriptor, TableSpec};
use serde::{Deserialize, Serialize};

/// A declared entry point of a fragment. It may feed several interior ports.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InputSlot {
  #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
  pub port_type: Option<PortTypeDescriptor>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub table_spec: Option<TableSpec>,
  pub connected_ports: BTreeSet<PortRef>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub external_id: Option<String>,
}

impl InputSlot {
  pub fn is_connected(&self) -> bool {
    !self.connected_ports.is_empty()
  }
}

/// A declared exit point of a fragment, fed by at most one interior port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSlot {
  #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
  pub port_type: Option<PortTypeDescriptor>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub table_spec: Option<TableSpec>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub connected_port: Option<PortRef>,
  pub external_id: String,
}

impl OutputSlot {
  pub fn is_connected(&self) -> bool {
    self.connected_port.is_some()
  }
}

/// An input as declared at capture time, in the source workflow's ids.
#[derive(Debug, Clone, Default)]
pub struct BoundaryInput {
  pub port_type: Option<PortTypeDescriptor>,
  pub table_spec: Option<TableSpec>,
  /// Interior input ports fed by this slot. Empty for an unconnected slot.
  pub ports: Vec<ConcretePort>,
  pub external_id: Option<String>,
}

/// An output as declared at capture time, in the source workflow's ids.
#[derive(Debug, Clone, Default)]
pub struct BoundaryOutput {
  pub port_type: Option<PortTypeDescriptor>,
  pub table_spec: Option<TableSpec>,
  /// Interior output port feeding this slot.
  pub port: Option<ConcretePort>,
  /// Defaults to `output-<index>`.
  pub external_id: Option<String>,
}
