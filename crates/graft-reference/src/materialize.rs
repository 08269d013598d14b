use std::collections::BTreeSet;
use std::fs;
use std::path::{Component, Path, PathBuf};

use graft_address::{NodeId, RelativeAddress};
use graft_fragment::Fragment;
use graft_graph::builtin::{self, decode_value, reference_of, reference_reader_settings};
use graft_graph::{
  DataReference, GraphError, NodeInfo, NodeKind, PortValue, SandboxRegistry, ValueRepository, Workflow,
  resolve_within,
};
use tracing::{debug, info, instrument, warn};

use crate::error::ReferenceError;

/// Directory, relative to a project, that nested fragments write their
/// reference data into.
pub const REFERENCE_DATA_DIR: &str = "data";

struct ReaderNode {
  container: Workflow,
  id: NodeId,
  reference: DataReference,
}

fn reader_at(workflow: &Workflow, address: &RelativeAddress) -> Result<ReaderNode, ReferenceError> {
  let id = address.resolve(workflow.id());
  let container = workflow
    .find_container_of(&id)
    .ok_or_else(|| GraphError::NodeNotFound { node: id.clone() })?;
  let info = container.node(&id)?;
  match &info.kind {
    NodeKind::Leaf {
      factory_id,
      settings,
    } if factory_id == builtin::REFERENCE_READER => Ok(ReaderNode {
      reference: reference_of(settings)?,
      container,
      id,
    }),
    _ => Err(ReferenceError::NotReference { node: id }),
  }
}

/// Write the current value of every reference node into `target_dir`
/// (relative to the workflow's project directory) and point the nodes at the
/// written files.
///
/// All values are fetched before anything is written, so a reference that
/// cannot be resolved, including one escaping the project directory, leaves
/// the filesystem untouched. Values that are themselves fragments get their
/// own reference data written into them first.
#[instrument(name = "reference_write", skip_all, fields(workflow_id = %workflow.id(), references = references.len()))]
pub fn write_reference_data(
  workflow: &Workflow,
  references: &BTreeSet<RelativeAddress>,
  target_dir: &Path,
  progress: &mut dyn FnMut(usize, usize),
) -> Result<(), ReferenceError> {
  let project_dir = workflow
    .project_dir()
    .ok_or_else(|| ReferenceError::NoProjectDir {
      workflow: workflow.id().clone(),
    })?;
  let target = resolve_within(&project_dir, target_dir)?;
  let registry = workflow.registry()?;

  let mut pending = Vec::with_capacity(references.len());
  for address in references {
    let reader = reader_at(workflow, address)?;
    let value = match registry.resolve_reference(&reader.reference, Some(&project_dir))? {
      PortValue::Fragment(bytes) => PortValue::Fragment(materialize_nested(&registry, &bytes)?),
      other => other,
    };
    let file_name = format!(
      "{}_{}.json",
      address.to_string().replace(':', "_"),
      value.identity()
    );
    let encoded = serde_json::to_vec(&value).map_err(|source| ReferenceError::Encode {
      node: reader.id.clone(),
      source,
    })?;
    pending.push((reader, file_name, encoded));
  }

  if pending.is_empty() {
    return Ok(());
  }
  fs::create_dir_all(&target).map_err(|source| ReferenceError::Io {
    path: target.clone(),
    source,
  })?;

  let total = pending.len();
  for (done, (reader, file_name, encoded)) in pending.into_iter().enumerate() {
    let path = target.join(&file_name);
    fs::write(&path, encoded).map_err(|source| ReferenceError::Io {
      path: path.clone(),
      source,
    })?;
    let reference = DataReference::File {
      path: relative_path(&project_dir, &path),
    };
    reader
      .container
      .lock()
      .set_settings(&reader.id, reference_reader_settings(&reference))?;
    debug!(node_id = %reader.id, file = %file_name, "reference_written");
    progress(done + 1, total);
  }
  info!(written = total, "reference_data_written");
  Ok(())
}

/// Load an archived fragment, write its reference data into its own project
/// and return the re-archived bytes.
fn materialize_nested(registry: &SandboxRegistry, bytes: &[u8]) -> Result<Vec<u8>, ReferenceError> {
  let mut fragment = Fragment::read(bytes)?;
  let workflow = fragment.load(registry, &mut |warning| {
    warn!(warning = %warning, "nested_fragment_warning");
  })?;
  write_reference_data(
    &workflow,
    fragment.reference_nodes(),
    Path::new(REFERENCE_DATA_DIR),
    &mut |_, _| {},
  )?;
  fragment.refresh()?;
  let bytes = fragment.to_bytes()?;
  fragment.dispose();
  Ok(bytes)
}

/// Load a fragment and write its reference data into it, so that its archive
/// no longer depends on data stored elsewhere.
pub fn make_portable(
  fragment: &mut Fragment,
  registry: &SandboxRegistry,
  on_warning: &mut dyn FnMut(String),
) -> Result<(), ReferenceError> {
  let workflow = fragment.load(registry, on_warning)?;
  let references = fragment.reference_nodes().clone();
  write_reference_data(
    &workflow,
    &references,
    Path::new(REFERENCE_DATA_DIR),
    &mut |_, _| {},
  )?;
  fragment.refresh()?;
  Ok(())
}

/// Move the values of all file references in `workflow` (nested containers
/// included) into `repository` and point the nodes at the registered values.
/// Returns the addresses of the rewritten nodes.
#[instrument(name = "reference_copy", skip_all, fields(workflow_id = %workflow.id()))]
pub fn copy_reference_data(
  workflow: &Workflow,
  repository: &ValueRepository,
) -> Result<BTreeSet<RelativeAddress>, ReferenceError> {
  let mut copied = BTreeSet::new();
  let mut registered = Vec::new();
  let outcome = copy_into(
    workflow,
    workflow,
    None,
    workflow.nodes(),
    repository,
    &mut copied,
    &mut registered,
  );
  if let Err(e) = outcome {
    for id in &registered {
      repository.remove(id);
    }
    return Err(e);
  }
  if !copied.is_empty() {
    info!(copied = copied.len(), "reference_data_copied");
  }
  Ok(copied)
}

/// Like [`copy_reference_data`], but only for the `pasted` nodes of `target`
/// that were copied out of `source`. File paths resolve against the project
/// directory of `source`, which itself is left untouched.
///
/// The ids of registered values are appended to `registered` as they are
/// created, also when a later reference fails, so the caller can forget them.
#[instrument(
  name = "reference_copy_pasted",
  skip_all,
  fields(source_id = %source.id(), workflow_id = %target.id(), pasted = pasted.len())
)]
pub fn copy_pasted_reference_data(
  source: &Workflow,
  target: &Workflow,
  pasted: &[NodeId],
  repository: &ValueRepository,
  registered: &mut Vec<String>,
) -> Result<BTreeSet<RelativeAddress>, ReferenceError> {
  let nodes = pasted
    .iter()
    .map(|id| target.node(id))
    .collect::<Result<Vec<_>, _>>()?;
  let mut copied = BTreeSet::new();
  copy_into(
    target,
    target,
    Some(source),
    nodes,
    repository,
    &mut copied,
    registered,
  )?;
  if !copied.is_empty() {
    info!(copied = copied.len(), "reference_data_copied");
  }
  Ok(copied)
}

/// Rewrite the file references among `nodes` of `container`. Paths resolve
/// against the project of `base`, or of `container` when there is none.
fn copy_into(
  root: &Workflow,
  container: &Workflow,
  base: Option<&Workflow>,
  nodes: Vec<NodeInfo>,
  repository: &ValueRepository,
  copied: &mut BTreeSet<RelativeAddress>,
  registered: &mut Vec<String>,
) -> Result<(), ReferenceError> {
  for node in nodes {
    let settings = match &node.kind {
      NodeKind::Container(child) => {
        copy_into(root, child, base, child.nodes(), repository, copied, registered)?;
        continue;
      }
      NodeKind::Leaf {
        factory_id,
        settings,
      } if factory_id == builtin::REFERENCE_READER => settings,
      NodeKind::Leaf { .. } => continue,
    };
    let DataReference::File { path } = reference_of(settings)? else {
      continue;
    };

    let owner = base.unwrap_or(container);
    let project_dir = owner
      .project_dir()
      .ok_or_else(|| ReferenceError::NoProjectDir {
        workflow: owner.id().clone(),
      })?;
    let resolved = resolve_within(&project_dir, Path::new(&path))?;
    let contents = fs::read(&resolved).map_err(|source| ReferenceError::Io {
      path: resolved.clone(),
      source,
    })?;
    let value = decode_value(&contents).map_err(|message| GraphError::Reference { message })?;

    let id = repository.register(value);
    registered.push(id.clone());
    container.lock().set_settings(
      &node.id,
      reference_reader_settings(&DataReference::Repository { id }),
    )?;
    debug!(node_id = %node.id, file = %path, "reference_copied");
    copied.insert(RelativeAddress::of(root.id(), &node.id)?);
  }
  Ok(())
}

/// `path` relative to `root`, `/` separated.
fn relative_path(root: &Path, path: &Path) -> String {
  let relative: PathBuf = path.strip_prefix(root).unwrap_or(path).to_path_buf();
  relative
    .components()
    .filter_map(|c| match c {
      Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
      _ => None,
    })
    .collect::<Vec<_>>()
    .join("/")
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_relative_path_uses_forward_slashes() {
    let root = Path::new("/tmp/project");
    let path = root.join("data").join("1_2_abc.json");
    assert_eq!(relative_path(root, &path), "data/1_2_abc.json");
  }

  #[test]
  fn test_escaping_target_dir_is_a_security_error() {
    let dir = tempfile::tempdir().unwrap();
    let registry = SandboxRegistry::new();
    let project = registry.create_project("p", Some(dir.path().to_path_buf()), None);

    let err = write_reference_data(
      &project,
      &BTreeSet::new(),
      Path::new("../outside"),
      &mut |_, _| {},
    )
    .unwrap_err();
    assert!(matches!(err, ReferenceError::Security { .. }));
  }

  #[test]
  fn test_non_reader_node_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let registry = SandboxRegistry::new();
    let project = registry.create_project("p", Some(dir.path().to_path_buf()), None);
    let node = project
      .lock()
      .add_node("Pass", builtin::IDENTITY, serde_json::json!({}))
      .unwrap();

    let references = BTreeSet::from([RelativeAddress::of(project.id(), &node).unwrap()]);
    let err = write_reference_data(&project, &references, Path::new("data"), &mut |_, _| {})
      .unwrap_err();
    assert!(matches!(err, ReferenceError::NotReference { .. }));
  }
}
