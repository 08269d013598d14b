//! Results handed back to callers.

use graft_address::{NodeId, PortRef};
use graft_graph::{FlowVariable, PortValue};

use crate::aggregate::{NodeMessage, compile_single_error_message};
use crate::error::ExecutionError;

/// Outcome of one fragment execution.
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
  /// `None` iff the run did not execute fully.
  pub outputs: Option<Vec<PortValue>>,
  pub flow_variables: Vec<FlowVariable>,
  pub node_messages: Vec<NodeMessage>,
}

impl ExecutionResult {
  pub fn is_success(&self) -> bool {
    self.outputs.is_some()
  }

  /// The result itself if the run succeeded, otherwise an
  /// [`ExecutionError::ExecutionFailure`] carrying the message tree and its
  /// one-message summary.
  pub fn into_success(self) -> Result<ExecutionResult, ExecutionError> {
    if self.is_success() {
      return Ok(self);
    }
    Err(ExecutionError::ExecutionFailure {
      summary: compile_single_error_message(&self.node_messages),
      messages: self.node_messages,
    })
  }
}

/// Outcome of a combined execution, with what is needed to chain the next.
#[derive(Debug, Clone)]
pub struct CombinedResult {
  pub result: ExecutionResult,
  /// Ports holding the tracked outputs, in output order. Pass them as inputs
  /// of the next execution.
  pub output_refs: Vec<PortRef>,
  /// The container node the fragment's nodes were collapsed into.
  pub unit: NodeId,
}

#[cfg(test)]
mod tests {
  use super::*;
  use graft_graph::MessageStatus;

  #[test]
  fn test_failed_result_turns_into_execution_failure() {
    let result = ExecutionResult {
      outputs: None,
      flow_variables: vec![],
      node_messages: vec![NodeMessage {
        name: "Boom".to_string(),
        address: "4".parse().unwrap(),
        status: MessageStatus::Error,
        text: "Execute failed: kaputt".to_string(),
        children: vec![],
      }],
    };
    match result.into_success() {
      Err(ExecutionError::ExecutionFailure { summary, messages }) => {
        assert!(summary.starts_with("Graph contains one node with execution failure:"));
        assert!(summary.ends_with("Boom #4: kaputt"));
        assert_eq!(messages.len(), 1);
      }
      other => panic!("unexpected {:?}", other),
    }
  }

  #[test]
  fn test_successful_result_passes_through() {
    let result = ExecutionResult {
      outputs: Some(vec![PortValue::Json(serde_json::json!(1))]),
      ..Default::default()
    };
    assert!(result.into_success().is_ok());
  }
}
