//! Execution of a fragment in a container of its own.

use std::sync::Arc;

use graft_address::{ConcretePort, NodeId};
use graft_fragment::Fragment;
use graft_graph::builtin::{self, value_sink_settings, value_source_settings};
use graft_graph::{NodeState, PortValue, SandboxRegistry, Workflow};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::aggregate::{
  collect_flow_variables, collect_upstream_flow_variables, recursively_extract_messages,
};
use crate::config::{ExecutorConfig, ExecutionRequest, HostNode, WarningConsumer};
use crate::error::ExecutionError;
use crate::result::ExecutionResult;
use crate::sandbox::{Sandbox, fragment_clipboard, output_ports, paste_fragment, wire_inputs};
use crate::scheduler::{InlineScheduler, RunTarget, Scheduler, cancel_and_wait, run_and_wait};

/// Lifecycle of an [`IsolatedExecutor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
  Idle,
  Preparing,
  Running,
  Completed,
  Failed,
  Cancelled,
  Disposed,
}

/// The single execution slot of an executor.
#[derive(Debug)]
struct Slot {
  state: ExecutorState,
  sandbox: Option<Sandbox>,
  /// Repository entries backing the input adapter and the pasted file
  /// references.
  values: Vec<String>,
  cancel: Option<CancellationToken>,
}

/// A sandbox container ready to run.
struct Prepared {
  sandbox: Sandbox,
  sink: NodeId,
  outputs: usize,
}

/// Runs fragments one at a time, each in a fresh container.
///
/// The container of the last run stays around until the next run or
/// [`IsolatedExecutor::dispose`], so it can be inspected.
pub struct IsolatedExecutor {
  registry: SandboxRegistry,
  config: ExecutorConfig,
  host: Option<HostNode>,
  scheduler: Arc<dyn Scheduler>,
  on_warning: WarningConsumer,
  slot: Mutex<Slot>,
}

impl IsolatedExecutor {
  pub fn new(
    registry: SandboxRegistry,
    config: ExecutorConfig,
    host: Option<HostNode>,
  ) -> Result<Self, ExecutionError> {
    config.validate(host.as_ref())?;
    Ok(Self {
      registry,
      config,
      host,
      scheduler: Arc::new(InlineScheduler),
      on_warning: Arc::new(|warning| warn!(warning = %warning, "fragment_warning")),
      slot: Mutex::new(Slot {
        state: ExecutorState::Idle,
        sandbox: None,
        values: Vec::new(),
        cancel: None,
      }),
    })
  }

  pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
    self.scheduler = scheduler;
    self
  }

  pub fn with_warning_consumer(mut self, on_warning: WarningConsumer) -> Self {
    self.on_warning = on_warning;
    self
  }

  pub fn config(&self) -> &ExecutorConfig {
    &self.config
  }

  pub fn state(&self) -> ExecutorState {
    self.slot.lock().state
  }

  /// The container of the current or last run.
  pub fn workflow(&self) -> Option<Workflow> {
    self
      .slot
      .lock()
      .sandbox
      .as_ref()
      .map(|sandbox| sandbox.workflow().clone())
  }

  /// Run `fragment` with `inputs` feeding its connected inputs in order.
  ///
  /// Preparation errors are returned before anything runs and leave no
  /// container behind. Node failures are not errors: the result then has no
  /// outputs and carries the message tree.
  #[instrument(
    name = "isolated_execute",
    skip(self, fragment, inputs, request, cancel),
    fields(fragment = %fragment.name(), mode = ?self.config.mode, inputs = inputs.len())
  )]
  pub async fn execute(
    &self,
    fragment: &mut Fragment,
    inputs: Vec<PortValue>,
    request: ExecutionRequest,
    cancel: CancellationToken,
  ) -> Result<ExecutionResult, ExecutionError> {
    let previous = self.begin()?;
    if let Some((sandbox, values)) = previous {
      cancel_and_wait(sandbox.workflow(), self.config.cancel_timeout).await;
      self.release(&sandbox, &values);
    }

    let mut values = Vec::new();
    let prepared = match self.prepare(fragment, inputs, &request, &mut values) {
      Ok(prepared) => prepared,
      Err(e) => {
        self.forget_values(&values);
        self.slot.lock().state = ExecutorState::Failed;
        warn!(error = %e, "execution_preparation_failed");
        return Err(e);
      }
    };

    let workflow = prepared.sandbox.workflow().clone();
    let token = cancel.child_token();
    {
      let mut slot = self.slot.lock();
      slot.state = ExecutorState::Running;
      slot.sandbox = Some(prepared.sandbox.clone());
      slot.values = values;
      slot.cancel = Some(token.clone());
    }

    let target = if self.config.execute_all {
      RunTarget::All
    } else {
      RunTarget::UpTo(prepared.sink.clone())
    };
    let job = run_and_wait(workflow.clone(), target, self.config.poll_interval, token);
    if let Err(e) = self.scheduler.run(job).await {
      let state = match e {
        ExecutionError::Cancelled => ExecutorState::Cancelled,
        _ => ExecutorState::Failed,
      };
      self.settle(state);
      return Err(e);
    }

    let result = self.collect(&workflow, &prepared)?;
    if result.is_success() {
      info!(outputs = prepared.outputs, "execution_completed");
      self.settle(ExecutorState::Completed);
    } else {
      warn!(messages = result.node_messages.len(), "execution_failed");
      self.settle(ExecutorState::Failed);
    }
    Ok(result)
  }

  /// Cancel the current run and wait (bounded) for it to settle.
  #[instrument(name = "isolated_cancel", skip(self))]
  pub async fn cancel(&self) {
    let (token, workflow) = {
      let slot = self.slot.lock();
      (
        slot.cancel.clone(),
        slot.sandbox.as_ref().map(|sandbox| sandbox.workflow().clone()),
      )
    };
    if let Some(token) = token {
      token.cancel();
    }
    if let Some(workflow) = workflow {
      cancel_and_wait(&workflow, self.config.cancel_timeout).await;
    }
  }

  /// Cancel, then remove the container and the input values. Fails if the
  /// executor never ran; later calls do nothing.
  #[instrument(name = "isolated_dispose", skip(self))]
  pub async fn dispose(&self) -> Result<(), ExecutionError> {
    let (sandbox, values) = {
      let mut slot = self.slot.lock();
      match slot.state {
        ExecutorState::Idle => {
          return Err(ExecutionError::IllegalState {
            message: "nothing to dispose, the executor has not run".to_string(),
          });
        }
        ExecutorState::Disposed => return Ok(()),
        _ => {}
      }
      slot.state = ExecutorState::Disposed;
      if let Some(token) = slot.cancel.take() {
        token.cancel();
      }
      (slot.sandbox.take(), std::mem::take(&mut slot.values))
    };
    if let Some(sandbox) = sandbox {
      cancel_and_wait(sandbox.workflow(), self.config.cancel_timeout).await;
      sandbox.remove()?;
    }
    self.forget_values(&values);
    info!("executor_disposed");
    Ok(())
  }

  /// Claim the execution slot, handing back what the previous run left.
  fn begin(&self) -> Result<Option<(Sandbox, Vec<String>)>, ExecutionError> {
    let mut slot = self.slot.lock();
    match slot.state {
      ExecutorState::Preparing | ExecutorState::Running => {
        return Err(ExecutionError::IllegalState {
          message: "the executor is already running".to_string(),
        });
      }
      ExecutorState::Disposed => {
        return Err(ExecutionError::IllegalState {
          message: "the executor has been disposed".to_string(),
        });
      }
      _ => {}
    }
    slot.state = ExecutorState::Preparing;
    slot.cancel = None;
    let values = std::mem::take(&mut slot.values);
    Ok(slot.sandbox.take().map(|sandbox| (sandbox, values)))
  }

  fn settle(&self, state: ExecutorState) {
    let mut slot = self.slot.lock();
    if slot.state != ExecutorState::Disposed {
      slot.state = state;
    }
    slot.cancel = None;
  }

  fn release(&self, sandbox: &Sandbox, values: &[String]) {
    if let Err(e) = sandbox.remove() {
      warn!(error = %e, "previous_sandbox_not_removed");
    }
    self.forget_values(values);
  }

  fn forget_values(&self, values: &[String]) {
    let repository = self.registry.repository();
    for id in values {
      repository.remove(id);
    }
  }

  fn host_identity(&self) -> String {
    self
      .host
      .as_ref()
      .map(|host| host.node.to_string())
      .unwrap_or_else(|| self.config.workflow_name.clone())
  }

  /// Create the container and wire the fragment into it. On error the
  /// container is removed again.
  fn prepare(
    &self,
    fragment: &mut Fragment,
    inputs: Vec<PortValue>,
    request: &ExecutionRequest,
    values: &mut Vec<String>,
  ) -> Result<Prepared, ExecutionError> {
    let sandbox = Sandbox::create(&self.registry, &self.config, self.host.as_ref())?;
    match self.wire(&sandbox, fragment, inputs, request, values) {
      Ok((sink, outputs)) => Ok(Prepared {
        sandbox,
        sink,
        outputs,
      }),
      Err(e) => {
        if let Err(cleanup) = sandbox.remove() {
          warn!(error = %cleanup, "sandbox_cleanup_failed");
        }
        Err(e)
      }
    }
  }

  fn wire(
    &self,
    sandbox: &Sandbox,
    fragment: &mut Fragment,
    inputs: Vec<PortValue>,
    request: &ExecutionRequest,
    values: &mut Vec<String>,
  ) -> Result<(NodeId, usize), ExecutionError> {
    let (source, clipboard) = fragment_clipboard(fragment, &self.registry, &self.on_warning)?;
    let workflow = sandbox.workflow();
    let mut pasted = Vec::new();
    let mapping = paste_fragment(
      workflow,
      &source,
      &clipboard,
      &self.registry,
      &mut pasted,
      values,
    )?;
    let lock = workflow.lock();

    let repository = self.registry.repository();
    let ids: Vec<String> = inputs
      .into_iter()
      .map(|value| repository.register(value))
      .collect();
    values.extend(ids.iter().cloned());
    let variables = self
      .host
      .as_ref()
      .map(|host| collect_upstream_flow_variables(&host.workflow, &host.node))
      .unwrap_or_default();
    let source = lock.add_node(
      "Fragment Input",
      builtin::VALUE_SOURCE,
      value_source_settings(&ids, &variables),
    )?;
    let sources: Vec<ConcretePort> = (0..ids.len())
      .map(|port| ConcretePort::new(source.clone(), port))
      .collect();
    wire_inputs(&lock, fragment, &mapping, &sources)?;

    let outputs = output_ports(fragment, &mapping)?;
    let sink = lock.add_node(
      "Fragment Output",
      builtin::VALUE_SINK,
      value_sink_settings(outputs.len()),
    )?;
    for (index, port) in outputs.iter().enumerate() {
      lock.connect(&port.node, port.port, &sink, index)?;
    }

    lock.apply_parameters(&request.parameters)?;
    lock.set_scope(Some(request.scope(self.host_identity())));
    lock.layout_by_depth(crate::LAYOUT_SPACING);
    Ok((sink, outputs.len()))
  }

  fn collect(
    &self,
    workflow: &Workflow,
    prepared: &Prepared,
  ) -> Result<ExecutionResult, ExecutionError> {
    let complete = if self.config.execute_all {
      workflow.is_fully_executed()
    } else {
      workflow.node_state(&prepared.sink)? == NodeState::Executed
    };
    let outputs = if complete {
      (0..prepared.outputs)
        .map(|port| workflow.output_value(&prepared.sink, port))
        .collect::<Option<Vec<_>>>()
    } else {
      None
    };
    let flow_variables = if outputs.is_some() {
      collect_flow_variables(workflow, &prepared.sink)
    } else {
      Vec::new()
    };
    let node_messages = if outputs.is_none() || self.config.collect_messages {
      recursively_extract_messages(workflow)
    } else {
      Vec::new()
    };
    Ok(ExecutionResult {
      outputs,
      flow_variables,
      node_messages,
    })
  }
}

impl std::fmt::Debug for IsolatedExecutor {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("IsolatedExecutor")
      .field("config", &self.config)
      .field("host", &self.host)
      .field("state", &self.state())
      .finish()
  }
}
