//! Collection of flow variables and node messages after a run.

use graft_address::RelativeAddress;
use graft_graph::{
  EXECUTE_FAILED_PREFIX, FlowVariable, MessageStatus, NodeId, NodeKind, VariableScope, Workflow,
};
use serde::Serialize;

/// First input port that carries data. Ports below are reserved.
const FIRST_DATA_PORT: usize = 2;

/// A node's status message, with the messages of nested nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeMessage {
  pub name: String,
  pub address: RelativeAddress,
  pub status: MessageStatus,
  pub text: String,
  pub children: Vec<NodeMessage>,
}

/// Variables `node` passes downstream that belong to the executing flow.
pub fn collect_flow_variables(workflow: &Workflow, node: &NodeId) -> Vec<FlowVariable> {
  workflow
    .output_variables(node)
    .into_iter()
    .filter(|variable| variable.scope == VariableScope::Flow)
    .collect()
}

/// Variables flowing into `node` through its data ports.
///
/// Each contributing producer's variables are appended in reverse, so that
/// pushing the result onto a last-write-wins stack gives nearer producers
/// precedence.
pub fn collect_upstream_flow_variables(workflow: &Workflow, node: &NodeId) -> Vec<FlowVariable> {
  let mut variables = Vec::new();
  for connection in workflow.incoming(node) {
    if connection.dest_port < FIRST_DATA_PORT {
      continue;
    }
    let Some((producer_workflow, producer)) =
      resolve_producer(workflow, &connection.source, connection.source_port)
    else {
      continue;
    };
    let mut produced = producer_workflow.output_variables(&producer);
    produced.reverse();
    variables.extend(produced);
  }
  variables
}

/// Follow `source`/`port` through container boundaries to the leaf node that
/// produces the data.
fn resolve_producer(
  workflow: &Workflow,
  source: &NodeId,
  port: usize,
) -> Option<(Workflow, NodeId)> {
  if source == workflow.id() {
    let parent = workflow.parent()?;
    let feeding = parent
      .incoming(workflow.id())
      .into_iter()
      .find(|c| c.dest_port == port)?;
    return resolve_producer(&parent, &feeding.source, feeding.source_port);
  }
  if let Some(child) = workflow.container(source) {
    let feeding = child
      .connections()
      .into_iter()
      .find(|c| &c.dest == child.id() && c.dest_port == port)?;
    return resolve_producer(&child, &feeding.source, feeding.source_port);
  }
  Some((workflow.clone(), source.clone()))
}

/// Messages of every node in `container` that warned or failed, and of every
/// container node with such nodes inside. Addresses are relative to
/// `container`.
pub fn recursively_extract_messages(container: &Workflow) -> Vec<NodeMessage> {
  extract(container, container)
}

fn extract(root: &Workflow, container: &Workflow) -> Vec<NodeMessage> {
  let mut messages = Vec::new();
  for node in container.nodes() {
    let children = match &node.kind {
      NodeKind::Container(child) => extract(root, child),
      NodeKind::Leaf { .. } => Vec::new(),
    };
    let notable = matches!(
      node.message.status,
      MessageStatus::Warning | MessageStatus::Error
    );
    if children.is_empty() && !notable {
      continue;
    }
    let Ok(address) = RelativeAddress::of(root.id(), &node.id) else {
      continue;
    };
    messages.push(NodeMessage {
      name: node.name,
      address,
      status: node.message.status,
      text: node.message.text,
      children,
    });
  }
  messages
}

/// One message summarizing every failed leaf node, with its container path.
pub fn compile_single_error_message(messages: &[NodeMessage]) -> String {
  let mut lines = Vec::new();
  let mut path = Vec::new();
  collect_failures(messages, &mut path, &mut lines);

  let count = match lines.len() {
    1 => "one node".to_string(),
    n => format!("{} nodes", n),
  };
  let mut summary = format!("Graph contains {} with execution failure:", count);
  for line in lines {
    summary.push('\n');
    summary.push_str(&line);
  }
  summary
}

fn collect_failures(messages: &[NodeMessage], path: &mut Vec<String>, lines: &mut Vec<String>) {
  for message in messages {
    let label = format!("{} #{}", message.name, message.address);
    if !message.children.is_empty() {
      path.push(label);
      collect_failures(&message.children, path, lines);
      path.pop();
    } else if message.status == MessageStatus::Error {
      let text = message
        .text
        .strip_prefix(EXECUTE_FAILED_PREFIX)
        .unwrap_or(&message.text);
      let mut line = path.join(" > ");
      if !line.is_empty() {
        line.push_str(" > ");
      }
      line.push_str(&format!("{}: {}", label, text));
      lines.push(line);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn message(address: &str, status: MessageStatus, text: &str) -> NodeMessage {
    NodeMessage {
      name: format!("Node {}", address),
      address: address.parse().unwrap(),
      status,
      text: text.to_string(),
      children: vec![],
    }
  }

  #[test]
  fn test_single_failure_summary() {
    let messages = vec![
      message("1", MessageStatus::Warning, "careful"),
      message("2", MessageStatus::Error, "Execute failed: kaputt"),
    ];
    assert_eq!(
      compile_single_error_message(&messages),
      "Graph contains one node with execution failure:\nNode 2 #2: kaputt"
    );
  }

  #[test]
  fn test_nested_failures_render_path() {
    let mut container = message("3", MessageStatus::Error, "Execute failed: inner failure");
    container.children = vec![
      message("3:1", MessageStatus::Error, "Execute failed: first"),
      message("3:2", MessageStatus::Reset, ""),
      message("3:4", MessageStatus::Error, "second"),
    ];
    let summary = compile_single_error_message(&[container]);
    let lines: Vec<&str> = summary.lines().collect();
    assert_eq!(lines[0], "Graph contains 2 nodes with execution failure:");
    assert_eq!(lines[1], "Node 3 #3 > Node 3:1 #3:1: first");
    assert_eq!(lines[2], "Node 3 #3 > Node 3:4 #3:4: second");
  }
}
