//! Execution of a chain of fragments in one shared container.
//!
//! Every fragment is pasted next to the previous ones and collapsed into a
//! container node of its own. A single output sink tracks the outputs of all
//! fragments executed so far, so later fragments can consume earlier results
//! through the [`PortRef`]s handed back in [`CombinedResult::output_refs`].

use std::sync::Arc;

use graft_address::{ConcretePort, NodeId, PasteMapping, PortRef};
use graft_fragment::Fragment;
use graft_graph::builtin::{self, value_sink_settings, value_source_settings};
use graft_graph::{GraphError, PortValue, SandboxRegistry, Workflow, WorkflowLock};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::aggregate::{
  collect_flow_variables, collect_upstream_flow_variables, recursively_extract_messages,
};
use crate::config::{ExecutionRequest, ExecutorConfig, HostNode, WarningConsumer};
use crate::error::ExecutionError;
use crate::result::{CombinedResult, ExecutionResult};
use crate::sandbox::{Sandbox, fragment_clipboard, output_ports, paste_fragment, wire_inputs};
use crate::scheduler::{InlineScheduler, RunTarget, Scheduler, cancel_and_wait, run_and_wait};

const OUTPUT_NAME: &str = "Combined Output";
const INPUT_NAME: &str = "Combined Input";

#[derive(Debug, Default)]
struct CombinedSlot {
  sink: Option<NodeId>,
  /// Repository entries backing the input node and pasted file references.
  values: Vec<String>,
  running: bool,
  disposed: bool,
  cancel: Option<CancellationToken>,
}

/// Runs fragments one after another in the same container, keeping the
/// results of earlier runs available to later ones.
pub struct CombinedExecutor {
  registry: SandboxRegistry,
  config: ExecutorConfig,
  host: Option<HostNode>,
  sandbox: Sandbox,
  source_ports: Vec<PortRef>,
  scheduler: Arc<dyn Scheduler>,
  on_warning: WarningConsumer,
  slot: Mutex<CombinedSlot>,
}

impl CombinedExecutor {
  /// Create the container and an input node serving `values`. The ports of
  /// that node are available from [`CombinedExecutor::source_ports`].
  #[instrument(name = "combined_create", skip(registry, config, host, values), fields(values = values.len()))]
  pub fn with_inputs(
    registry: SandboxRegistry,
    config: ExecutorConfig,
    host: Option<HostNode>,
    values: Vec<PortValue>,
  ) -> Result<Self, ExecutionError> {
    config.validate(host.as_ref())?;
    let sandbox = Sandbox::create(&registry, &config, host.as_ref())?;

    let repository = registry.repository();
    let ids: Vec<String> = values
      .into_iter()
      .map(|value| repository.register(value))
      .collect();
    let variables = host
      .as_ref()
      .map(|host| collect_upstream_flow_variables(&host.workflow, &host.node))
      .unwrap_or_default();

    let container = sandbox.workflow().clone();
    let created = container
      .lock()
      .add_node(
        INPUT_NAME,
        builtin::VALUE_SOURCE,
        value_source_settings(&ids, &variables),
      )
      .map_err(ExecutionError::from)
      .and_then(|source| {
        (0..ids.len())
          .map(|port| {
            ConcretePort::new(source.clone(), port)
              .relative_to(container.id())
              .map_err(ExecutionError::from)
          })
          .collect::<Result<Vec<_>, _>>()
      });
    let source_ports = match created {
      Ok(ports) => ports,
      Err(e) => {
        if let Err(cleanup) = sandbox.remove() {
          warn!(error = %cleanup, "sandbox_cleanup_failed");
        }
        for id in &ids {
          repository.remove(id);
        }
        return Err(e);
      }
    };

    Ok(Self {
      registry,
      config,
      host,
      sandbox,
      source_ports,
      scheduler: Arc::new(InlineScheduler),
      on_warning: Arc::new(|warning| warn!(warning = %warning, "fragment_warning")),
      slot: Mutex::new(CombinedSlot {
        values: ids,
        ..Default::default()
      }),
    })
  }

  /// Continue in a container built by an earlier executor. The output sink
  /// found there keeps tracking the earlier outputs.
  pub fn reuse(
    registry: SandboxRegistry,
    config: ExecutorConfig,
    container: Workflow,
  ) -> Result<Self, ExecutionError> {
    config.validate_settings()?;
    if !container.can_modify_structure() {
      return Err(ExecutionError::StructuralLock {
        workflow: container.id().clone(),
      });
    }
    let sink = container
      .nodes()
      .into_iter()
      .rev()
      .find(|node| node.factory_id() == Some(builtin::VALUE_SINK))
      .map(|node| node.id);
    let source_ports = container
      .nodes()
      .into_iter()
      .find(|node| node.factory_id() == Some(builtin::VALUE_SOURCE))
      .map(|node| {
        (0..node.output_count)
          .map(|port| PortRef::new(node.id.index(), port))
          .collect()
      })
      .unwrap_or_default();
    let sandbox = Sandbox::existing(&registry, container);
    Ok(Self {
      registry,
      config,
      host: None,
      sandbox,
      source_ports,
      scheduler: Arc::new(InlineScheduler),
      on_warning: Arc::new(|warning| warn!(warning = %warning, "fragment_warning")),
      slot: Mutex::new(CombinedSlot {
        sink,
        ..Default::default()
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

  /// Ports of the input node, relative to the container.
  pub fn source_ports(&self) -> &[PortRef] {
    &self.source_ports
  }

  pub fn workflow(&self) -> &Workflow {
    self.sandbox.workflow()
  }

  /// Paste `fragment`, feed its connected inputs from `inputs` and run the
  /// container. `inputs` are relative to the container, as returned by
  /// [`CombinedExecutor::source_ports`] or an earlier result.
  #[instrument(
    name = "combined_execute",
    skip(self, fragment, inputs, request, cancel),
    fields(fragment = %fragment.name(), workflow_id = %self.workflow().id())
  )]
  pub async fn execute(
    &self,
    fragment: &mut Fragment,
    inputs: &[PortRef],
    request: ExecutionRequest,
    cancel: CancellationToken,
  ) -> Result<CombinedResult, ExecutionError> {
    let previous_sink = {
      let mut slot = self.slot.lock();
      if slot.disposed {
        return Err(ExecutionError::IllegalState {
          message: "the executor has been disposed".to_string(),
        });
      }
      if slot.running {
        return Err(ExecutionError::IllegalState {
          message: "the executor is already running".to_string(),
        });
      }
      slot.running = true;
      slot.sink.clone()
    };

    let mut registered = Vec::new();
    let prepared = self.prepare(
      fragment,
      inputs,
      previous_sink.as_ref(),
      &request,
      &mut registered,
    );
    let (unit, sink, tracked) = match prepared {
      Ok(prepared) => prepared,
      Err(e) => {
        let repository = self.registry.repository();
        for id in &registered {
          repository.remove(id);
        }
        self.slot.lock().running = false;
        warn!(error = %e, "execution_preparation_failed");
        return Err(e);
      }
    };

    let container = self.sandbox.workflow().clone();
    let token = cancel.child_token();
    {
      let mut slot = self.slot.lock();
      slot.sink = Some(sink.clone());
      slot.values.extend(registered);
      slot.cancel = Some(token.clone());
    }

    let job = run_and_wait(
      container.clone(),
      RunTarget::All,
      self.config.poll_interval,
      token,
    );
    let outcome = self.scheduler.run(job).await;
    {
      let mut slot = self.slot.lock();
      slot.running = false;
      slot.cancel = None;
    }
    outcome?;

    let outputs = if container.is_fully_executed() {
      (0..tracked.len())
        .map(|port| container.output_value(&sink, port))
        .collect::<Option<Vec<_>>>()
    } else {
      None
    };
    let flow_variables = if outputs.is_some() {
      collect_flow_variables(&container, &sink)
    } else {
      Vec::new()
    };
    let node_messages = if outputs.is_none() || self.config.collect_messages {
      recursively_extract_messages(&container)
    } else {
      Vec::new()
    };
    let output_refs = tracked
      .iter()
      .map(|port| port.relative_to(container.id()))
      .collect::<Result<Vec<_>, _>>()?;

    let result = ExecutionResult {
      outputs,
      flow_variables,
      node_messages,
    };
    if result.is_success() {
      info!(unit_id = %unit, tracked = output_refs.len(), "combined_execution_completed");
    } else {
      warn!(unit_id = %unit, messages = result.node_messages.len(), "combined_execution_failed");
    }
    Ok(CombinedResult {
      result,
      output_refs,
      unit,
    })
  }

  /// Cancel the current run and wait (bounded) for it to settle.
  #[instrument(name = "combined_cancel", skip(self))]
  pub async fn cancel(&self) {
    let token = self.slot.lock().cancel.clone();
    if let Some(token) = token {
      token.cancel();
    }
    cancel_and_wait(self.sandbox.workflow(), self.config.cancel_timeout).await;
  }

  /// Cancel, then remove the container unless `keep` is set. Later calls
  /// do nothing.
  #[instrument(name = "combined_dispose", skip(self))]
  pub async fn dispose(&self, keep: bool) -> Result<(), ExecutionError> {
    let (token, values) = {
      let mut slot = self.slot.lock();
      if slot.disposed {
        return Ok(());
      }
      slot.disposed = true;
      (slot.cancel.take(), std::mem::take(&mut slot.values))
    };
    if let Some(token) = token {
      token.cancel();
    }
    cancel_and_wait(self.sandbox.workflow(), self.config.cancel_timeout).await;
    if keep {
      info!(workflow_id = %self.workflow().id(), "combined_container_kept");
      return Ok(());
    }
    self.sandbox.remove()?;
    let repository = self.registry.repository();
    for id in &values {
      repository.remove(id);
    }
    info!("executor_disposed");
    Ok(())
  }

  fn prepare(
    &self,
    fragment: &mut Fragment,
    inputs: &[PortRef],
    previous_sink: Option<&NodeId>,
    request: &ExecutionRequest,
    registered: &mut Vec<String>,
  ) -> Result<(NodeId, NodeId, Vec<ConcretePort>), ExecutionError> {
    let (source, clipboard) = fragment_clipboard(fragment, &self.registry, &self.on_warning)?;
    let container = self.sandbox.workflow();
    let mut created = Vec::new();
    let mapping = match paste_fragment(
      container,
      &source,
      &clipboard,
      &self.registry,
      &mut created,
      registered,
    ) {
      Ok(mapping) => mapping,
      Err(e) => {
        discard(&container.lock(), &created);
        return Err(e);
      }
    };
    let lock = container.lock();
    let outcome = self.wire(
      &lock,
      fragment,
      &mapping,
      inputs,
      previous_sink,
      request,
      &mut created,
    );
    if outcome.is_err() {
      discard(&lock, &created);
    }
    outcome
  }

  /// Wire one pasted fragment. Returns the collapsed unit, the new sink and
  /// the tracked ports in sink order. Nodes created so far are pushed to
  /// `created` so a failure can take them out again.
  #[allow(clippy::too_many_arguments)]
  fn wire(
    &self,
    lock: &WorkflowLock<'_>,
    fragment: &Fragment,
    mapping: &PasteMapping,
    inputs: &[PortRef],
    previous_sink: Option<&NodeId>,
    request: &ExecutionRequest,
    created: &mut Vec<NodeId>,
  ) -> Result<(NodeId, NodeId, Vec<ConcretePort>), ExecutionError> {
    let container = lock.workflow();

    let sources: Vec<ConcretePort> = inputs
      .iter()
      .map(|port| port.resolve(container.id()))
      .collect();
    wire_inputs(lock, fragment, mapping, &sources)?;

    let mut tracked: Vec<ConcretePort> = previous_sink
      .map(|sink| {
        container
          .incoming(sink)
          .into_iter()
          .map(|c| ConcretePort::new(c.source, c.source_port))
          .collect()
      })
      .unwrap_or_default();
    for port in output_ports(fragment, mapping)? {
      if !tracked.contains(&port) {
        tracked.push(port);
      }
    }

    let sink = lock.add_node(OUTPUT_NAME, builtin::VALUE_SINK, value_sink_settings(tracked.len()))?;
    created.push(sink.clone());
    for (index, port) in tracked.iter().enumerate() {
      lock.connect(&port.node, port.port, &sink, index)?;
    }

    let collapsed = lock.collapse(&mapping.targets(), fragment.display_name())?;
    created.retain(|id| container.contains(id));
    created.push(collapsed.node.clone());

    collapsed
      .workflow
      .lock()
      .apply_parameters(&request.parameters)?;
    lock.set_scope(Some(request.scope(self.host_identity())));

    if let Some(previous) = previous_sink {
      match lock.remove_node(previous) {
        Ok(()) | Err(GraphError::NodeNotFound { .. }) => {}
        Err(e) => return Err(e.into()),
      }
    }
    lock.layout_by_depth(crate::LAYOUT_SPACING);

    let tracked = container
      .incoming(&sink)
      .into_iter()
      .map(|c| ConcretePort::new(c.source, c.source_port))
      .collect();
    Ok((collapsed.node, sink, tracked))
  }

  fn host_identity(&self) -> String {
    self
      .host
      .as_ref()
      .map(|host| host.node.to_string())
      .unwrap_or_else(|| self.config.workflow_name.clone())
  }
}

/// Remove what a failed preparation left in the container.
fn discard(lock: &WorkflowLock<'_>, created: &[NodeId]) {
  for id in created {
    match lock.remove_node(id) {
      Ok(()) | Err(GraphError::NodeNotFound { .. }) => {}
      Err(e) => warn!(node_id = %id, error = %e, "discard_failed"),
    }
  }
}

impl std::fmt::Debug for CombinedExecutor {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CombinedExecutor")
      .field("config", &self.config)
      .field("workflow_id", self.workflow().id())
      .field("source_ports", &self.source_ports)
      .finish()
  }
}
