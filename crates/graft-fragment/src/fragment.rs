//! Capture, load and archive of fragments.

use std::collections::BTreeSet;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use graft_address::{ConcretePort, NodeId, PortRef, RelativeAddress};
use graft_graph::{NodeState, SandboxRegistry, Workflow};
use tracing::{debug, info, instrument, warn};

use crate::archive::{self, Metadata};
use crate::error::FragmentError;
use crate::slot::{BoundaryInput, BoundaryOutput, InputSlot, OutputSlot};

const ILLEGAL_NAME_CHARS: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|'];

/// What to capture from a container.
#[derive(Debug, Clone, Default)]
pub struct CaptureRequest {
  /// Direct children of the container to copy.
  pub nodes: Vec<NodeId>,
  pub inputs: Vec<BoundaryInput>,
  pub outputs: Vec<BoundaryOutput>,
  /// Nodes that only reference data stored elsewhere.
  pub reference_nodes: Vec<NodeId>,
  /// Defaults to `Capture-<container id>`.
  pub name: Option<String>,
}

/// A live container holding the fragment's graph.
#[derive(Debug, Clone)]
struct LiveHandle {
  workflow: Workflow,
  registry: SandboxRegistry,
}

impl LiveHandle {
  fn dispose(self) {
    self.registry.remove_project(self.workflow.id());
  }
}

#[derive(Debug)]
enum FragmentState {
  /// Captured from a container and never serialized.
  Captured(LiveHandle),
  /// Backed by an archived graph, possibly loaded.
  Serialized {
    blob: Vec<u8>,
    loaded: Option<LiveHandle>,
  },
  /// Captured, then disposed without being serialized.
  Disposed,
}

/// A portable subgraph with declared boundary ports.
///
/// Boundary ports are stored as [`PortRef`]s relative to the fragment's own
/// root container, so they stay valid wherever the graph is loaded or pasted.
#[derive(Debug)]
pub struct Fragment {
  name: String,
  custom_name: Option<String>,
  inputs: Vec<InputSlot>,
  outputs: Vec<OutputSlot>,
  reference_nodes: BTreeSet<RelativeAddress>,
  state: FragmentState,
}

impl Fragment {
  /// Copy `request.nodes` out of `container` into a new project of
  /// `registry`. Fails if anything in the container has executed or is
  /// executing.
  #[instrument(name = "fragment_capture", skip(registry, container, request), fields(container_id = %container.id(), nodes = request.nodes.len()))]
  pub fn capture(
    registry: &SandboxRegistry,
    container: &Workflow,
    request: CaptureRequest,
  ) -> Result<Fragment, FragmentError> {
    if request.nodes.is_empty() {
      return Err(FragmentError::Capture {
        message: "no nodes selected".to_string(),
      });
    }
    ensure_capturable(container)?;

    let name = sanitize_name(
      request
        .name
        .as_deref()
        .unwrap_or(&format!("Capture-{}", container.id())),
    );
    let temp = tempfile::Builder::new().prefix("graft-capture-").tempdir()?;
    let location = temp.path().join(&name);
    fs::create_dir_all(&location)?;
    let project = registry.create_project(&name, Some(location), Some(Box::new(move || drop(temp))));

    let boundary = capture_into(&project, container, &request);
    let (inputs, outputs, reference_nodes) = match boundary {
      Ok(boundary) => boundary,
      Err(e) => {
        warn!(project_id = %project.id(), error = %e, "fragment_capture_failed");
        registry.remove_project(project.id());
        return Err(e);
      }
    };

    info!(
      fragment = %name,
      project_id = %project.id(),
      inputs = inputs.len(),
      outputs = outputs.len(),
      "fragment_captured"
    );
    Ok(Fragment {
      name,
      custom_name: None,
      inputs,
      outputs,
      reference_nodes,
      state: FragmentState::Captured(LiveHandle {
        workflow: project,
        registry: registry.clone(),
      }),
    })
  }

  /// Read a fragment written by [`Fragment::save`]. The graph stays packed
  /// until [`Fragment::load`] is called.
  pub fn read<R: Read>(reader: R) -> Result<Fragment, FragmentError> {
    let (metadata, blob) = archive::read_archive(reader)?;
    Ok(Fragment {
      name: metadata.name,
      custom_name: metadata.custom_workflow_name,
      inputs: metadata.input_ports,
      outputs: metadata.output_ports,
      reference_nodes: metadata.ref_node_ids.into_iter().collect(),
      state: FragmentState::Serialized { blob, loaded: None },
    })
  }

  /// Write the archive: metadata first, then the packed graph.
  pub fn save<W: Write>(&self, writer: W) -> Result<(), FragmentError> {
    let packed;
    let blob = match &self.state {
      FragmentState::Captured(handle) => {
        packed = pack(&handle.workflow)?;
        &packed
      }
      FragmentState::Serialized { blob, .. } => blob,
      FragmentState::Disposed => {
        return Err(FragmentError::IllegalState {
          message: format!("fragment '{}' was disposed before it was serialized", self.name),
        });
      }
    };
    archive::write_archive(writer, &self.metadata(), blob)?;
    debug!(fragment = %self.name, bytes = blob.len(), "fragment_saved");
    Ok(())
  }

  /// Save into memory.
  pub fn to_bytes(&self) -> Result<Vec<u8>, FragmentError> {
    let mut buffer = Vec::new();
    self.save(&mut buffer)?;
    Ok(buffer)
  }

  /// The live container of this fragment, unpacking and loading it into
  /// `registry` on first use. Load warnings go to `on_warning`. Loading an
  /// already live fragment returns the same container.
  #[instrument(name = "fragment_load", skip(self, registry, on_warning), fields(fragment = %self.name))]
  pub fn load(
    &mut self,
    registry: &SandboxRegistry,
    on_warning: &mut dyn FnMut(String),
  ) -> Result<Workflow, FragmentError> {
    let dir_name = sanitize_name(&self.name);
    let (blob, loaded) = match &mut self.state {
      FragmentState::Captured(handle) => return Ok(handle.workflow.clone()),
      FragmentState::Serialized {
        loaded: Some(handle),
        ..
      } => return Ok(handle.workflow.clone()),
      FragmentState::Serialized { blob, loaded } => (blob, loaded),
      FragmentState::Disposed => {
        return Err(FragmentError::IllegalState {
          message: format!("fragment '{}' has been disposed", self.name),
        });
      }
    };

    let temp = tempfile::Builder::new().prefix("graft-fragment-").tempdir()?;
    let dir = temp.path().join(dir_name);
    fs::create_dir_all(&dir)?;
    archive::unpack_dir(blob, &dir).map_err(|e| FragmentError::Load {
      message: format!("failed to unpack archive: {}", e),
    })?;

    let workflow = registry
      .load_project(&dir, Some(Box::new(move || drop(temp))), on_warning)
      .map_err(|e| FragmentError::Load {
        message: e.to_string(),
      })?;
    info!(project_id = %workflow.id(), "fragment_loaded");
    *loaded = Some(LiveHandle {
      workflow: workflow.clone(),
      registry: registry.clone(),
    });
    Ok(workflow)
  }

  /// Remove the live container, if any. Safe to call repeatedly.
  pub fn dispose(&mut self) {
    match &mut self.state {
      FragmentState::Captured(_) => {
        if let FragmentState::Captured(handle) =
          std::mem::replace(&mut self.state, FragmentState::Disposed)
        {
          handle.dispose();
        }
      }
      FragmentState::Serialized { loaded, .. } => {
        if let Some(handle) = loaded.take() {
          handle.dispose();
        }
      }
      FragmentState::Disposed => return,
    }
    debug!(fragment = %self.name, "fragment_disposed");
  }

  /// Pack a captured graph into its archived form and release the live
  /// container. A fragment that already is serialized is only disposed.
  #[instrument(name = "fragment_serialize", skip(self), fields(fragment = %self.name))]
  pub fn serialize_and_dispose(&mut self) -> Result<(), FragmentError> {
    match &self.state {
      FragmentState::Captured(handle) => {
        let blob = pack(&handle.workflow)?;
        if let FragmentState::Captured(handle) = std::mem::replace(
          &mut self.state,
          FragmentState::Serialized { blob, loaded: None },
        ) {
          handle.dispose();
        }
        Ok(())
      }
      FragmentState::Serialized { .. } => {
        self.dispose();
        Ok(())
      }
      FragmentState::Disposed => Err(FragmentError::IllegalState {
        message: format!("fragment '{}' has been disposed", self.name),
      }),
    }
  }

  /// Re-pack the loaded graph so that changes made to the live container
  /// (e.g. rewritten references) end up in the archived form.
  ///
  /// A captured fragment has no archived form yet and is packed from its
  /// live container on every save, so there is nothing to do for it.
  pub fn refresh(&mut self) -> Result<(), FragmentError> {
    match &mut self.state {
      FragmentState::Serialized {
        blob,
        loaded: Some(handle),
      } => {
        *blob = pack(&handle.workflow)?;
        Ok(())
      }
      FragmentState::Captured(_) => Ok(()),
      _ => Err(FragmentError::IllegalState {
        message: format!("fragment '{}' is not loaded", self.name),
      }),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// The custom name if one was set, the fragment name otherwise.
  pub fn display_name(&self) -> &str {
    self.custom_name.as_deref().unwrap_or(&self.name)
  }

  pub fn custom_name(&self) -> Option<&str> {
    self.custom_name.as_deref()
  }

  pub fn set_custom_name(&mut self, name: Option<String>) {
    self.custom_name = name;
  }

  pub fn inputs(&self) -> &[InputSlot] {
    &self.inputs
  }

  pub fn outputs(&self) -> &[OutputSlot] {
    &self.outputs
  }

  pub fn reference_nodes(&self) -> &BTreeSet<RelativeAddress> {
    &self.reference_nodes
  }

  /// Inputs that feed at least one interior port, in declaration order.
  pub fn connected_inputs(&self) -> Vec<&InputSlot> {
    self.inputs.iter().filter(|slot| slot.is_connected()).collect()
  }

  /// Outputs fed by an interior port, in declaration order.
  pub fn connected_outputs(&self) -> Vec<&OutputSlot> {
    self.outputs.iter().filter(|slot| slot.is_connected()).collect()
  }

  pub fn is_live(&self) -> bool {
    self.workflow().is_some()
  }

  /// The live container, if the fragment is currently loaded.
  pub fn workflow(&self) -> Option<&Workflow> {
    match &self.state {
      FragmentState::Captured(handle) => Some(&handle.workflow),
      FragmentState::Serialized {
        loaded: Some(handle),
        ..
      } => Some(&handle.workflow),
      _ => None,
    }
  }

  /// Directory backing the live container.
  pub fn location(&self) -> Option<PathBuf> {
    self.workflow().and_then(|w| w.location().map(Path::to_path_buf))
  }

  fn metadata(&self) -> Metadata {
    Metadata {
      name: self.name.clone(),
      ref_node_ids: self.reference_nodes.iter().cloned().collect(),
      input_ports: self.inputs.clone(),
      output_ports: self.outputs.clone(),
      custom_workflow_name: self.custom_name.clone(),
    }
  }
}

impl Drop for Fragment {
  fn drop(&mut self) {
    self.dispose();
  }
}

type Boundary = (Vec<InputSlot>, Vec<OutputSlot>, BTreeSet<RelativeAddress>);

fn capture_into(
  project: &Workflow,
  container: &Workflow,
  request: &CaptureRequest,
) -> Result<Boundary, FragmentError> {
  let clipboard = container.copy(&request.nodes)?;
  let mapping = project.lock().paste(&clipboard)?;

  let translate_node = |node: &NodeId| -> Result<NodeId, FragmentError> {
    let relative = RelativeAddress::of(container.id(), node)?;
    Ok(mapping.remap(&relative)?)
  };
  let translate = |port: &ConcretePort| -> Result<PortRef, FragmentError> {
    let node = translate_node(&port.node)?;
    Ok(ConcretePort::new(node, port.port).relative_to(project.id())?)
  };

  let mut inputs = Vec::with_capacity(request.inputs.len());
  for input in &request.inputs {
    let connected_ports = input
      .ports
      .iter()
      .map(translate)
      .collect::<Result<BTreeSet<_>, _>>()?;
    inputs.push(InputSlot {
      port_type: input.port_type.clone(),
      table_spec: input.table_spec.clone(),
      connected_ports,
      external_id: input.external_id.clone(),
    });
  }

  let mut outputs = Vec::with_capacity(request.outputs.len());
  for (index, output) in request.outputs.iter().enumerate() {
    outputs.push(OutputSlot {
      port_type: output.port_type.clone(),
      table_spec: output.table_spec.clone(),
      connected_port: output.port.as_ref().map(translate).transpose()?,
      external_id: output
        .external_id
        .clone()
        .unwrap_or_else(|| format!("output-{}", index)),
    });
  }

  let mut reference_nodes = BTreeSet::new();
  for node in &request.reference_nodes {
    let target = translate_node(node)?;
    if project.find_container_of(&target).is_none() {
      return Err(FragmentError::Capture {
        message: format!("reference node {} is not part of the captured nodes", node),
      });
    }
    reference_nodes.insert(RelativeAddress::of(project.id(), &target)?);
  }

  Ok((inputs, outputs, reference_nodes))
}

/// Fails if the container runs or any node in it (nested ones included)
/// holds an execution result.
fn ensure_capturable(container: &Workflow) -> Result<(), FragmentError> {
  if container.is_in_progress() {
    return Err(FragmentError::Capture {
      message: format!("workflow {} is currently executing", container.id()),
    });
  }
  for node in container.nodes() {
    if matches!(
      node.state,
      NodeState::Executed | NodeState::Executing | NodeState::Queued
    ) {
      return Err(FragmentError::Capture {
        message: format!(
          "node '{}' ({}) is executed or executing; reset the workflow before capturing",
          node.name, node.id
        ),
      });
    }
    if let Some(child) = node.container() {
      ensure_capturable(child)?;
    }
  }
  Ok(())
}

/// Replace characters that are not allowed in file names.
pub fn sanitize_name(name: &str) -> String {
  let sanitized: String = name
    .chars()
    .map(|c| {
      if ILLEGAL_NAME_CHARS.contains(&c) || c.is_control() {
        '_'
      } else {
        c
      }
    })
    .collect();
  let trimmed = sanitized.trim();
  if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
    "fragment".to_string()
  } else {
    trimmed.to_string()
  }
}

fn pack(workflow: &Workflow) -> Result<Vec<u8>, FragmentError> {
  let dir = workflow
    .location()
    .ok_or_else(|| FragmentError::IllegalState {
      message: format!("workflow {} has no location to pack", workflow.id()),
    })?;
  workflow.save_to_dir(dir)?;
  archive::pack_dir(dir)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_sanitize_name() {
    assert_eq!(sanitize_name("Capture-0:1"), "Capture-0_1");
    assert_eq!(sanitize_name("a/b\\c*d?e\"f<g>h|i"), "a_b_c_d_e_f_g_h_i");
    assert_eq!(sanitize_name("tab\there"), "tab_here");
    assert_eq!(sanitize_name(".."), "fragment");
    assert_eq!(sanitize_name("  "), "fragment");
  }

  #[test]
  fn test_capture_requires_nodes() {
    let registry = SandboxRegistry::new();
    let host = registry.create_project("host", None, None);
    let err = Fragment::capture(&registry, &host, CaptureRequest::default()).unwrap_err();
    assert!(matches!(err, FragmentError::Capture { .. }));
    assert_eq!(registry.projects().len(), 1);
  }
}
