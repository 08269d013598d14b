//! Execution scope attached to a container for the duration of a run.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::GraphError;

/// Operations a scope may take away from the nodes running inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
  /// Resolving paths relative to the owning project directory.
  RelativeResourceAccess,
  /// Reading from the scope's data area.
  DataAreaAccess,
}

/// Identity, data area and restrictions of a running fragment.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScopeContext {
  pub host_identity: String,
  pub data_area: Option<PathBuf>,
  pub restrictions: HashSet<Capability>,
}

impl ScopeContext {
  pub fn new(host_identity: impl Into<String>) -> Self {
    Self {
      host_identity: host_identity.into(),
      ..Default::default()
    }
  }

  pub fn with_data_area(mut self, path: impl Into<PathBuf>) -> Self {
    self.data_area = Some(path.into());
    self
  }

  pub fn restrict(mut self, capability: Capability) -> Self {
    self.restrictions.insert(capability);
    self
  }

  pub fn allows(&self, capability: Capability) -> bool {
    !self.restrictions.contains(&capability)
  }
}

/// Join `relative` onto `root` and reject results that leave `root`.
///
/// Resolution is lexical so it also works for paths that do not exist yet.
pub fn resolve_within(root: &Path, relative: &Path) -> Result<PathBuf, GraphError> {
  let escape = || GraphError::PathEscape {
    path: relative.to_path_buf(),
    root: root.to_path_buf(),
  };

  let mut depth = 0usize;
  let mut resolved = root.to_path_buf();
  for component in relative.components() {
    match component {
      Component::Normal(part) => {
        resolved.push(part);
        depth += 1;
      }
      Component::CurDir => {}
      Component::ParentDir => {
        if depth == 0 {
          return Err(escape());
        }
        resolved.pop();
        depth -= 1;
      }
      Component::RootDir | Component::Prefix(_) => return Err(escape()),
    }
  }
  Ok(resolved)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_resolve_within_accepts_nested_paths() {
    let root = Path::new("/projects/a");
    let resolved = resolve_within(root, Path::new("data/../data/x.json")).unwrap();
    assert_eq!(resolved, PathBuf::from("/projects/a/data/x.json"));
  }

  #[test]
  fn test_resolve_within_rejects_escape() {
    let root = Path::new("/projects/a");
    assert!(matches!(
      resolve_within(root, Path::new("../b/x.json")),
      Err(GraphError::PathEscape { .. })
    ));
    assert!(resolve_within(root, Path::new("/etc/passwd")).is_err());
  }

  #[test]
  fn test_restrictions() {
    let scope = ScopeContext::new("host").restrict(Capability::DataAreaAccess);
    assert!(!scope.allows(Capability::DataAreaAccess));
    assert!(scope.allows(Capability::RelativeResourceAccess));
  }
}
