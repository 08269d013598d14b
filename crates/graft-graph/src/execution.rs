//! Workflow execution.
//!
//! Execution is non-blocking: [`Workflow::execute_all`] and
//! [`Workflow::execute_up_to`] queue nodes and spawn a driver task when none is
//! running. The driver repeatedly picks the queued nodes whose sources have all
//! executed, runs that batch concurrently and records the results, until no
//! queued node can make progress. Container nodes run their nested workflow
//! with the same driver, inline in the node's task.

use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use graft_address::NodeId;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::GraphError;
use crate::model::{NodeContext, NodeFailure, NodeModel};
use crate::node::{EXECUTE_FAILED_PREFIX, NodeState, StatusMessage};
use crate::value::{FlowVariable, PortValue, merge_variables};
use crate::workflow::{GraphState, NodeBody, Workflow};

/// Results of one successfully executed node.
struct Executed {
  outputs: Vec<PortValue>,
  variables: Vec<FlowVariable>,
  warning: Option<String>,
}

enum JobKind {
  Leaf(Arc<dyn NodeModel>),
  Container(Workflow),
}

/// A node taken off the queue, together with its inputs.
struct NodeJob {
  node: NodeId,
  kind: JobKind,
  inputs: Vec<Option<PortValue>>,
  variables: Vec<FlowVariable>,
  workflow: Workflow,
}

impl NodeJob {
  async fn run(self, cancel: CancellationToken) -> Result<Executed, NodeFailure> {
    match self.kind {
      JobKind::Leaf(model) => {
        let expected = model.output_count();
        let mut ctx = NodeContext::new(self.node, self.workflow, self.variables, cancel);
        let outputs = model.execute(self.inputs, &mut ctx).await?;
        if outputs.len() != expected {
          return Err(NodeFailure::new(format!(
            "node produced {} outputs, expected {}",
            outputs.len(),
            expected
          )));
        }
        let (variables, warning) = ctx.finish();
        Ok(Executed {
          outputs,
          variables,
          warning,
        })
      }
      JobKind::Container(child) => child.run_nested(self.inputs, self.variables, cancel).await,
    }
  }
}

impl Workflow {
  /// Whether a run is active or any node is queued or executing.
  pub fn is_in_progress(&self) -> bool {
    let state = self.inner.state.read();
    state.running
      || state
        .nodes
        .values()
        .any(|entry| matches!(entry.state, NodeState::Queued | NodeState::Executing))
  }

  /// Queue every node that has not executed yet and start running.
  pub fn execute_all(&self) -> Result<(), GraphError> {
    let pending: Vec<NodeId> = {
      let state = self.inner.state.read();
      state
        .nodes
        .values()
        .filter(|entry| matches!(entry.state, NodeState::Idle | NodeState::Failed))
        .map(|entry| entry.id.clone())
        .collect()
    };
    self.queue_and_start(pending)
  }

  /// Queue `node` and everything it depends on, then start running.
  pub fn execute_up_to(&self, node: &NodeId) -> Result<(), GraphError> {
    let pending: Vec<NodeId> = {
      let state = self.inner.state.read();
      state.entry(self.id(), node)?;
      state
        .upstream(self.id(), node)
        .into_iter()
        .filter(|id| {
          state
            .entry(self.id(), id)
            .is_ok_and(|entry| matches!(entry.state, NodeState::Idle | NodeState::Failed))
        })
        .collect()
    };
    self.queue_and_start(pending)
  }

  /// Request cancellation of the current run, including nested containers.
  /// Returns immediately; use [`Workflow::is_in_progress`] to observe settlement.
  pub fn cancel_all(&self) {
    let (token, children) = {
      let mut state = self.inner.state.write();
      for entry in state.nodes.values_mut() {
        if entry.state == NodeState::Queued {
          entry.state = NodeState::Idle;
        }
      }
      let children: Vec<Workflow> = state
        .nodes
        .values()
        .filter_map(|entry| entry.container().cloned())
        .collect();
      (state.cancel.clone(), children)
    };
    token.cancel();
    for child in children {
      child.cancel_all();
    }
    debug!(workflow_id = %self.id(), "workflow_cancel_requested");
  }

  fn queue_and_start(&self, pending: Vec<NodeId>) -> Result<(), GraphError> {
    let handle = tokio::runtime::Handle::try_current().map_err(|_| GraphError::NoRuntime)?;
    let start = {
      let mut state = self.inner.state.write();
      for id in &pending {
        if let Ok(entry) = state.entry_mut(self.id(), id) {
          entry.state = NodeState::Queued;
        }
      }
      if state.running {
        None
      } else {
        state.running = true;
        state.cancel = CancellationToken::new();
        Some(state.cancel.clone())
      }
    };
    if let Some(cancel) = start {
      info!(workflow_id = %self.id(), queued = pending.len(), "workflow_execution_started");
      handle.spawn(self.clone().drive(cancel));
    }
    Ok(())
  }

  fn drive(self, cancel: CancellationToken) -> BoxFuture<'static, ()> {
    async move {
      loop {
        if cancel.is_cancelled() {
          self.settle_cancelled();
          break;
        }
        let Some(jobs) = self.take_ready() else {
          break;
        };

        let ids: Vec<NodeId> = jobs.iter().map(|job| job.node.clone()).collect();
        let handles: Vec<_> = jobs
          .into_iter()
          .map(|job| tokio::spawn(job.run(cancel.child_token())))
          .collect();
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

        let results = tokio::select! {
          biased;
          _ = cancel.cancelled() => {
            for abort in aborts {
              abort.abort();
            }
            warn!(workflow_id = %self.id(), "workflow_execution_cancelled");
            self.settle_cancelled();
            break;
          }
          results = futures::future::join_all(handles) => results,
        };

        for (id, result) in ids.into_iter().zip(results) {
          let outcome = result
            .unwrap_or_else(|e| Err(NodeFailure::new(format!("node task failed: {}", e))));
          self.apply(&id, outcome);
        }
      }
      info!(workflow_id = %self.id(), "workflow_execution_finished");
    }
    .boxed()
  }

  /// Take the next batch of runnable nodes off the queue. Queued nodes whose
  /// sources can no longer execute are unqueued. When nothing is runnable the
  /// run ends and `None` is returned.
  fn take_ready(&self) -> Option<Vec<NodeJob>> {
    let own = self.id().clone();
    let mut state = self.inner.state.write();

    loop {
      let mut stuck = Vec::new();
      for entry in state.nodes.values().filter(|e| e.state == NodeState::Queued) {
        let blocked = state.incoming(&entry.id).iter().any(|c| {
          matches!(
            source_state(&state, &own, &c.source),
            None | Some(NodeState::Idle) | Some(NodeState::Failed)
          )
        });
        if blocked {
          stuck.push(entry.id.index());
        }
      }
      if stuck.is_empty() {
        break;
      }
      for index in stuck {
        if let Some(entry) = state.nodes.get_mut(&index) {
          entry.state = NodeState::Idle;
        }
      }
    }

    let ready: Vec<u32> = state
      .nodes
      .values()
      .filter(|entry| entry.state == NodeState::Queued)
      .filter(|entry| {
        state
          .incoming(&entry.id)
          .iter()
          .all(|c| source_state(&state, &own, &c.source) == Some(NodeState::Executed))
      })
      .map(|entry| entry.id.index())
      .collect();

    if ready.is_empty() {
      state.running = false;
      return None;
    }

    let mut jobs = Vec::with_capacity(ready.len());
    for index in ready {
      let Some(entry) = state.nodes.get(&index) else {
        continue;
      };
      let mut inputs = vec![None; entry.input_count()];
      let mut variables = Vec::new();
      for connection in state.incoming(&entry.id) {
        let (value, source_variables) = if connection.source == own {
          (
            state
              .boundary_inputs
              .get(connection.source_port)
              .cloned()
              .flatten(),
            state.boundary_variables.clone(),
          )
        } else {
          match state.entry(&own, &connection.source) {
            Ok(source) => (
              source.outputs.get(connection.source_port).cloned().flatten(),
              source.variables.clone(),
            ),
            Err(_) => (None, Vec::new()),
          }
        };
        if let Some(slot) = inputs.get_mut(connection.dest_port) {
          *slot = value;
        }
        merge_variables(&mut variables, source_variables);
      }
      let kind = match &entry.body {
        NodeBody::Leaf { model, .. } => JobKind::Leaf(model.clone()),
        NodeBody::Container(child) => JobKind::Container(child.clone()),
      };
      jobs.push(NodeJob {
        node: entry.id.clone(),
        kind,
        inputs,
        variables,
        workflow: self.clone(),
      });
    }
    for job in &jobs {
      if let Some(entry) = state.nodes.get_mut(&job.node.index()) {
        entry.state = NodeState::Executing;
      }
    }
    Some(jobs)
  }

  fn apply(&self, id: &NodeId, outcome: Result<Executed, NodeFailure>) {
    let mut state = self.inner.state.write();
    let Ok(entry) = state.entry_mut(self.id(), id) else {
      return;
    };
    match outcome {
      Ok(executed) => {
        entry.outputs = executed.outputs.into_iter().map(Some).collect();
        entry.variables = executed.variables;
        entry.state = NodeState::Executed;
        entry.message = match executed.warning {
          Some(text) => StatusMessage::warning(text),
          None => StatusMessage::ok(),
        };
        debug!(node_id = %id, "node_executed");
      }
      Err(failure) => {
        entry.outputs.clear();
        entry.variables.clear();
        entry.state = NodeState::Failed;
        entry.message = StatusMessage::error(format!("{}{}", EXECUTE_FAILED_PREFIX, failure.message));
        warn!(node_id = %id, error = %failure.message, "node_failed");
      }
    }
  }

  /// Mark everything still busy as idle after a cancelled run.
  fn settle_cancelled(&self) {
    let children = {
      let mut state = self.inner.state.write();
      let mut children = Vec::new();
      for entry in state.nodes.values_mut() {
        match entry.state {
          NodeState::Executing => {
            entry.state = NodeState::Idle;
            entry.message = StatusMessage::warning("Execution canceled");
            if let Some(child) = entry.container() {
              children.push(child.clone());
            }
          }
          NodeState::Queued => entry.state = NodeState::Idle,
          _ => {}
        }
      }
      state.running = false;
      children
    };
    for child in children {
      child.settle_cancelled();
    }
  }

  /// Run this container as a node of its parent: deliver `inputs` at the
  /// boundary, execute everything, collect the boundary outputs.
  async fn run_nested(
    &self,
    inputs: Vec<Option<PortValue>>,
    variables: Vec<FlowVariable>,
    cancel: CancellationToken,
  ) -> Result<Executed, NodeFailure> {
    {
      let mut state = self.inner.state.write();
      state.boundary_inputs = inputs;
      state.boundary_variables = variables;
      for entry in state.nodes.values_mut() {
        if entry.state != NodeState::Executed {
          entry.state = NodeState::Queued;
        }
      }
      state.running = true;
      state.cancel = cancel.clone();
    }

    self.clone().drive(cancel.clone()).await;
    if cancel.is_cancelled() {
      return Err(NodeFailure::new("execution canceled"));
    }

    let own = self.id().clone();
    let state = self.inner.state.read();
    let unfinished = state
      .nodes
      .values()
      .filter(|entry| entry.state != NodeState::Executed)
      .count();
    if unfinished > 0 {
      return Err(NodeFailure::new(format!(
        "{} contained node(s) did not execute successfully",
        unfinished
      )));
    }

    let mut outputs = Vec::with_capacity(state.output_ports);
    let mut out_variables = Vec::new();
    for port in 0..state.output_ports {
      let connection = state
        .connections
        .iter()
        .find(|c| c.dest == own && c.dest_port == port)
        .ok_or_else(|| NodeFailure::new(format!("output port {} is not connected", port)))?;
      let (value, source_variables) = if connection.source == own {
        (
          state
            .boundary_inputs
            .get(connection.source_port)
            .cloned()
            .flatten(),
          state.boundary_variables.clone(),
        )
      } else {
        let source = state.entry(&own, &connection.source)?;
        (
          source.outputs.get(connection.source_port).cloned().flatten(),
          source.variables.clone(),
        )
      };
      outputs.push(value.ok_or_else(|| NodeFailure::new(format!("output port {} has no data", port)))?);
      merge_variables(&mut out_variables, source_variables);
    }
    if state.output_ports == 0 {
      out_variables = state.boundary_variables.clone();
    }

    Ok(Executed {
      outputs,
      variables: out_variables,
      warning: None,
    })
  }
}

/// State of a connection source; the container boundary always counts as executed.
fn source_state(state: &GraphState, own: &NodeId, source: &NodeId) -> Option<NodeState> {
  if source == own {
    Some(NodeState::Executed)
  } else {
    state.entry(own, source).ok().map(|entry| entry.state)
  }
}
