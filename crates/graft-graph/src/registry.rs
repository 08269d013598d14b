//! Registry of live projects.
//!
//! Every temporary or standalone project lives in a [`SandboxRegistry`] that is
//! passed explicitly to whoever creates projects. Removing a project from the
//! registry invokes the callback attached when the project was created, which
//! is where backing storage such as temporary directories gets released.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use graft_address::NodeId;
use parking_lot::RwLock;
use tracing::{info, instrument};

use crate::builtin::decode_value;
use crate::error::GraphError;
use crate::model::NodeFactoryRegistry;
use crate::persist::WorkflowDump;
use crate::reference::DataReference;
use crate::repository::ValueRepository;
use crate::scope::resolve_within;
use crate::value::PortValue;
use crate::workflow::Workflow;

/// Invoked once when the project it is attached to is removed.
pub type OnDispose = Box<dyn FnOnce() + Send + Sync>;

struct ProjectEntry {
  workflow: Workflow,
  on_dispose: Option<OnDispose>,
}

pub(crate) struct RegistryInner {
  factories: Arc<NodeFactoryRegistry>,
  repository: ValueRepository,
  projects: RwLock<BTreeMap<u32, ProjectEntry>>,
  next_index: AtomicU32,
}

/// Owner of all projects created through it.
#[derive(Clone)]
pub struct SandboxRegistry {
  inner: Arc<RegistryInner>,
}

impl SandboxRegistry {
  /// A registry with the built-in node models.
  pub fn new() -> Self {
    Self::with_factories(NodeFactoryRegistry::with_builtins())
  }

  pub fn with_factories(factories: NodeFactoryRegistry) -> Self {
    Self {
      inner: Arc::new(RegistryInner {
        factories: Arc::new(factories),
        repository: ValueRepository::new(),
        projects: RwLock::new(BTreeMap::new()),
        next_index: AtomicU32::new(0),
      }),
    }
  }

  pub(crate) fn from_inner(inner: Arc<RegistryInner>) -> Self {
    Self { inner }
  }

  pub fn factories(&self) -> &NodeFactoryRegistry {
    &self.inner.factories
  }

  pub fn repository(&self) -> ValueRepository {
    self.inner.repository.clone()
  }

  /// Create an empty project. `location` is the directory relative resources
  /// resolve against and where the project is saved.
  pub fn create_project(
    &self,
    name: &str,
    location: Option<PathBuf>,
    on_dispose: Option<OnDispose>,
  ) -> Workflow {
    let id = NodeId::root(self.inner.next_index.fetch_add(1, Ordering::SeqCst));
    let workflow = Workflow::new_root(
      id.clone(),
      name,
      location,
      Arc::downgrade(&self.inner),
      self.inner.factories.clone(),
    );
    self.inner.projects.write().insert(
      id.index(),
      ProjectEntry {
        workflow: workflow.clone(),
        on_dispose,
      },
    );
    info!(project_id = %id, name = %name, "project_created");
    workflow
  }

  /// Load a project saved with [`Workflow::save_to_dir`]. Non-fatal problems
  /// are reported through `on_warning`. On error nothing is registered and
  /// `on_dispose` is dropped without being invoked.
  #[instrument(name = "registry_load_project", skip(self, on_dispose, on_warning), fields(dir = %dir.display()))]
  pub fn load_project(
    &self,
    dir: &Path,
    on_dispose: Option<OnDispose>,
    on_warning: &mut dyn FnMut(String),
  ) -> Result<Workflow, GraphError> {
    let dump = WorkflowDump::read_from(dir)?;
    let mut warnings = Vec::new();
    dump.check(&mut warnings)?;

    let id = NodeId::root(self.inner.next_index.fetch_add(1, Ordering::SeqCst));
    let workflow = Workflow::new_root(
      id.clone(),
      dump.name.clone(),
      Some(dir.to_path_buf()),
      Arc::downgrade(&self.inner),
      self.inner.factories.clone(),
    );
    workflow.populate(&dump.graph, &mut warnings)?;

    self.inner.projects.write().insert(
      id.index(),
      ProjectEntry {
        workflow: workflow.clone(),
        on_dispose,
      },
    );
    info!(project_id = %id, warnings = warnings.len(), "project_loaded");
    for warning in warnings {
      on_warning(warning);
    }
    Ok(workflow)
  }

  /// Cancel and remove a project, then run its dispose callback. Returns
  /// whether the project existed.
  pub fn remove_project(&self, id: &NodeId) -> bool {
    if id.parent().is_some() {
      return false;
    }
    let Some(entry) = self.inner.projects.write().remove(&id.index()) else {
      return false;
    };
    entry.workflow.cancel_all();
    if let Some(on_dispose) = entry.on_dispose {
      on_dispose();
    }
    info!(project_id = %id, "project_removed");
    true
  }

  pub fn project(&self, id: &NodeId) -> Option<Workflow> {
    if id.parent().is_some() {
      return None;
    }
    self
      .inner
      .projects
      .read()
      .get(&id.index())
      .map(|entry| entry.workflow.clone())
  }

  pub fn projects(&self) -> Vec<Workflow> {
    self
      .inner
      .projects
      .read()
      .values()
      .map(|entry| entry.workflow.clone())
      .collect()
  }

  /// The workflow directly containing `node`, wherever it is nested.
  pub fn find_container_of(&self, node: &NodeId) -> Option<Workflow> {
    let project = self.project(&NodeId::root(*node.segments().first()?))?;
    project.find_container_of(node)
  }

  /// Fetch the value a reference points at. File references resolve against
  /// `base_dir` and must stay inside it.
  pub fn resolve_reference(
    &self,
    reference: &DataReference,
    base_dir: Option<&Path>,
  ) -> Result<PortValue, GraphError> {
    match reference {
      DataReference::Node { node, port } => {
        let container = self
          .find_container_of(node)
          .ok_or_else(|| GraphError::NodeNotFound { node: node.clone() })?;
        container
          .output_value(node, *port)
          .ok_or_else(|| GraphError::Reference {
            message: format!("node {} holds no data at port {}", node, port),
          })
      }
      DataReference::File { path } => {
        let base = base_dir.ok_or_else(|| GraphError::Reference {
          message: format!("no base directory to resolve '{}'", path),
        })?;
        let resolved = resolve_within(base, Path::new(path))?;
        let contents = std::fs::read(&resolved).map_err(|e| GraphError::io(&resolved, e))?;
        decode_value(&contents).map_err(|message| GraphError::Reference { message })
      }
      DataReference::Repository { id } => {
        self
          .inner
          .repository
          .get(id)
          .ok_or_else(|| GraphError::Reference {
            message: format!("no value registered under '{}'", id),
          })
      }
    }
  }
}

impl Default for SandboxRegistry {
  fn default() -> Self {
    Self::new()
  }
}

impl std::fmt::Debug for SandboxRegistry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SandboxRegistry")
      .field("projects", &self.inner.projects.read().len())
      .finish()
  }
}
