//! Node-level types shared by the container and its callers.

use graft_address::NodeId;
use serde::{Deserialize, Serialize};

use crate::workflow::Workflow;

/// Standard prefix of the status message of a node whose execution failed.
pub const EXECUTE_FAILED_PREFIX: &str = "Execute failed: ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
  Idle,
  Queued,
  Executing,
  Executed,
  Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
  Ok,
  Warning,
  Error,
  Reset,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
  pub status: MessageStatus,
  pub text: String,
}

impl StatusMessage {
  pub fn ok() -> Self {
    Self {
      status: MessageStatus::Ok,
      text: String::new(),
    }
  }

  pub fn warning(text: impl Into<String>) -> Self {
    Self {
      status: MessageStatus::Warning,
      text: text.into(),
    }
  }

  pub fn error(text: impl Into<String>) -> Self {
    Self {
      status: MessageStatus::Error,
      text: text.into(),
    }
  }

  pub fn reset() -> Self {
    Self {
      status: MessageStatus::Reset,
      text: String::new(),
    }
  }
}

impl Default for StatusMessage {
  fn default() -> Self {
    Self::ok()
  }
}

/// Editor placement of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeUi {
  pub x: i32,
  pub y: i32,
  pub hidden: bool,
}

/// A connection between two ports of one container.
///
/// An endpoint equal to the container's own id is one of the container's
/// boundary ports: as source it delivers the container's input, as destination
/// it produces the container's output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Connection {
  pub source: NodeId,
  pub source_port: usize,
  pub dest: NodeId,
  pub dest_port: usize,
}

/// What a node is.
#[derive(Debug, Clone)]
pub enum NodeKind {
  Leaf {
    factory_id: String,
    settings: serde_json::Value,
  },
  Container(Workflow),
}

/// Point-in-time view of a node.
#[derive(Debug, Clone)]
pub struct NodeInfo {
  pub id: NodeId,
  pub name: String,
  pub kind: NodeKind,
  pub state: NodeState,
  pub message: StatusMessage,
  pub ui: NodeUi,
  pub input_count: usize,
  pub output_count: usize,
}

impl NodeInfo {
  pub fn factory_id(&self) -> Option<&str> {
    match &self.kind {
      NodeKind::Leaf { factory_id, .. } => Some(factory_id),
      NodeKind::Container(_) => None,
    }
  }

  pub fn container(&self) -> Option<&Workflow> {
    match &self.kind {
      NodeKind::Leaf { .. } => None,
      NodeKind::Container(workflow) => Some(workflow),
    }
  }
}
