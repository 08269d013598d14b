//! Creation, wiring and removal of sandbox containers.

use graft_address::{ConcretePort, NodeId, PasteMapping};
use graft_fragment::Fragment;
use graft_graph::{Clipboard, GraphError, NodeUi, SandboxRegistry, Workflow, WorkflowLock};
use graft_reference::copy_pasted_reference_data;
use tracing::{debug, info};

use crate::config::{ExecutionMode, ExecutorConfig, HostNode, WarningConsumer};
use crate::error::ExecutionError;

/// A container fragments are pasted into, and how it has to be removed.
#[derive(Debug, Clone)]
pub(crate) enum Sandbox {
  /// A standalone project.
  Project {
    registry: SandboxRegistry,
    workflow: Workflow,
  },
  /// A container node inside `parent`.
  Nested { parent: Workflow, workflow: Workflow },
}

impl Sandbox {
  /// Create the container the configured mode asks for.
  pub(crate) fn create(
    registry: &SandboxRegistry,
    config: &ExecutorConfig,
    host: Option<&HostNode>,
  ) -> Result<Sandbox, ExecutionError> {
    let name = config.container_name();
    let host = match (config.mode, host) {
      (ExecutionMode::Detached, host) => {
        let location = host.and_then(|h| h.workflow.project_dir());
        let workflow = registry.create_project(&name, location, None);
        info!(workflow_id = %workflow.id(), "sandbox_project_created");
        return Ok(Sandbox::Project {
          registry: registry.clone(),
          workflow,
        });
      }
      (_, Some(host)) => host,
      (_, None) => {
        return Err(ExecutionError::InvalidConfig {
          message: "debug and default mode need a host node".to_string(),
        });
      }
    };

    let parent = host.workflow.clone();
    if !parent.can_modify_structure() {
      return Err(ExecutionError::StructuralLock {
        workflow: parent.id().clone(),
      });
    }
    let workflow = {
      let lock = parent.lock();
      let workflow = lock.add_container(&name, 0, 0)?;
      let host_ui = parent.node(&host.node).map(|n| n.ui).unwrap_or_default();
      lock.set_ui(
        workflow.id(),
        NodeUi {
          x: host_ui.x,
          y: host_ui.y + 100,
          hidden: config.mode != ExecutionMode::Debug,
        },
      )?;
      workflow
    };
    info!(workflow_id = %workflow.id(), host_id = %host.node, "sandbox_container_created");
    Ok(Sandbox::Nested { parent, workflow })
  }

  /// Wrap a container created elsewhere.
  pub(crate) fn existing(registry: &SandboxRegistry, workflow: Workflow) -> Sandbox {
    match workflow.parent() {
      Some(parent) => Sandbox::Nested { parent, workflow },
      None => Sandbox::Project {
        registry: registry.clone(),
        workflow,
      },
    }
  }

  pub(crate) fn workflow(&self) -> &Workflow {
    match self {
      Sandbox::Project { workflow, .. } | Sandbox::Nested { workflow, .. } => workflow,
    }
  }

  /// Remove the container. Removing it twice is not an error.
  pub(crate) fn remove(&self) -> Result<(), ExecutionError> {
    match self {
      Sandbox::Project { registry, workflow } => {
        registry.remove_project(workflow.id());
      }
      Sandbox::Nested { parent, workflow } => {
        workflow.cancel_all();
        match parent.lock().remove_node(workflow.id()) {
          Ok(()) | Err(GraphError::NodeNotFound { .. }) => {}
          Err(e) => return Err(e.into()),
        }
      }
    }
    debug!(workflow_id = %self.workflow().id(), "sandbox_removed");
    Ok(())
  }
}

/// Load the fragment and copy all of its nodes. The loaded workflow is
/// returned with the copy, since file references resolve against it.
pub(crate) fn fragment_clipboard(
  fragment: &mut Fragment,
  registry: &SandboxRegistry,
  on_warning: &WarningConsumer,
) -> Result<(Workflow, Clipboard), ExecutionError> {
  let workflow = fragment.load(registry, &mut |warning| on_warning(warning))?;
  let clipboard = workflow.copy(&workflow.node_ids())?;
  Ok((workflow, clipboard))
}

/// Paste a fragment's nodes into `target` and move the file references of
/// the pasted copies into the repository. The fragment keeps its files.
///
/// Pasted node ids are pushed to `created` and registered value ids to
/// `registered` as soon as they exist, so a failure can undo both.
pub(crate) fn paste_fragment(
  target: &Workflow,
  source: &Workflow,
  clipboard: &Clipboard,
  registry: &SandboxRegistry,
  created: &mut Vec<NodeId>,
  registered: &mut Vec<String>,
) -> Result<PasteMapping, ExecutionError> {
  let mapping = target.lock().paste(clipboard)?;
  let pasted = mapping.targets();
  created.extend(pasted.iter().cloned());
  copy_pasted_reference_data(
    source,
    target,
    &pasted,
    &registry.repository(),
    registered,
  )?;
  Ok(mapping)
}

/// Connect `sources[i]` to every port of the fragment's i-th connected input.
pub(crate) fn wire_inputs(
  lock: &WorkflowLock<'_>,
  fragment: &Fragment,
  mapping: &PasteMapping,
  sources: &[ConcretePort],
) -> Result<(), ExecutionError> {
  let inputs = fragment.connected_inputs();
  if inputs.len() != sources.len() {
    return Err(ExecutionError::Preparation {
      message: format!(
        "fragment '{}' has {} connected inputs, got {}",
        fragment.name(),
        inputs.len(),
        sources.len()
      ),
    });
  }
  for (slot, source) in inputs.into_iter().zip(sources) {
    for port in &slot.connected_ports {
      let target = mapping.remap_port(port)?;
      lock.connect(&source.node, source.port, &target.node, target.port)?;
    }
  }
  Ok(())
}

/// Where the fragment's connected outputs ended up after pasting.
pub(crate) fn output_ports(
  fragment: &Fragment,
  mapping: &PasteMapping,
) -> Result<Vec<ConcretePort>, ExecutionError> {
  fragment
    .connected_outputs()
    .into_iter()
    .filter_map(|slot| slot.connected_port.as_ref())
    .map(|port| mapping.remap_port(port).map_err(ExecutionError::from))
    .collect()
}
