//! Process-wide store of values addressed by random identifiers.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::value::PortValue;

/// Holds values that reference-reader nodes point at by id.
#[derive(Debug, Clone, Default)]
pub struct ValueRepository {
  values: Arc<RwLock<HashMap<String, PortValue>>>,
}

impl ValueRepository {
  pub fn new() -> Self {
    Self::default()
  }

  /// Store a value under a fresh random id and return the id.
  pub fn register(&self, value: PortValue) -> String {
    let id = uuid::Uuid::new_v4().to_string();
    self.values.write().insert(id.clone(), value);
    id
  }

  pub fn get(&self, id: &str) -> Option<PortValue> {
    self.values.read().get(id).cloned()
  }

  pub fn remove(&self, id: &str) -> Option<PortValue> {
    self.values.write().remove(id)
  }

  pub fn len(&self) -> usize {
    self.values.read().len()
  }

  pub fn is_empty(&self) -> bool {
    self.values.read().is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_register_and_remove() {
    let repository = ValueRepository::new();
    let id = repository.register(PortValue::Json(json!(42)));

    assert_eq!(repository.get(&id), Some(PortValue::Json(json!(42))));
    assert!(repository.remove(&id).is_some());
    assert!(repository.is_empty());
  }
}
