//! Port values and flow variables.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Names the kind of data a port carries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortTypeDescriptor {
  pub name: String,
}

impl PortTypeDescriptor {
  pub fn new(name: impl Into<String>) -> Self {
    Self { name: name.into() }
  }

  pub fn table() -> Self {
    Self::new("table")
  }

  pub fn json() -> Self {
    Self::new("json")
  }

  pub fn fragment() -> Self {
    Self::new("fragment")
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnSpec {
  pub name: String,
  pub data_type: String,
}

/// Structure of a table, known without the table's rows.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableSpec {
  pub name: String,
  pub columns: Vec<ColumnSpec>,
}

impl TableSpec {
  pub fn new(name: impl Into<String>, columns: &[(&str, &str)]) -> Self {
    Self {
      name: name.into(),
      columns: columns
        .iter()
        .map(|(name, data_type)| ColumnSpec {
          name: name.to_string(),
          data_type: data_type.to_string(),
        })
        .collect(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
  pub spec: TableSpec,
  pub rows: Vec<Vec<serde_json::Value>>,
}

/// A value produced at an output port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum PortValue {
  Table(Table),
  Json(serde_json::Value),
  /// A serialized fragment archive carried as data.
  Fragment(Vec<u8>),
}

impl PortValue {
  pub fn port_type(&self) -> PortTypeDescriptor {
    match self {
      PortValue::Table(_) => PortTypeDescriptor::table(),
      PortValue::Json(_) => PortTypeDescriptor::json(),
      PortValue::Fragment(_) => PortTypeDescriptor::fragment(),
    }
  }

  pub fn table_spec(&self) -> Option<&TableSpec> {
    match self {
      PortValue::Table(table) => Some(&table.spec),
      _ => None,
    }
  }

  /// Content identity: the first 16 hex digits of the SHA-256 of the JSON encoding.
  pub fn identity(&self) -> String {
    let encoded = serde_json::to_vec(self).unwrap_or_default();
    let digest = Sha256::digest(&encoded);
    digest
      .iter()
      .take(8)
      .map(|byte| format!("{:02x}", byte))
      .collect()
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VariableScope {
  /// Visible along the flow of the executing graph.
  #[default]
  Flow,
  /// Process-wide constants, never reported as flow output.
  Global,
  /// Internal to a single node.
  Local,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowVariable {
  pub name: String,
  pub value: serde_json::Value,
  #[serde(default)]
  pub scope: VariableScope,
}

impl FlowVariable {
  pub fn new(name: impl Into<String>, value: serde_json::Value) -> Self {
    Self {
      name: name.into(),
      value,
      scope: VariableScope::Flow,
    }
  }

  pub fn with_scope(mut self, scope: VariableScope) -> Self {
    self.scope = scope;
    self
  }
}

/// Push `incoming` onto a variable stack. Later entries override earlier ones
/// with the same name.
pub fn merge_variables(
  target: &mut Vec<FlowVariable>,
  incoming: impl IntoIterator<Item = FlowVariable>,
) {
  for variable in incoming {
    target.retain(|existing| existing.name != variable.name);
    target.push(variable);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_identity_depends_on_content() {
    let a = PortValue::Json(json!({"a": 1}));
    let b = PortValue::Json(json!({"a": 2}));
    assert_eq!(a.identity(), a.clone().identity());
    assert_ne!(a.identity(), b.identity());
    assert_eq!(a.identity().len(), 16);
  }

  #[test]
  fn test_merge_variables_last_write_wins() {
    let mut stack = vec![FlowVariable::new("x", json!(1)), FlowVariable::new("y", json!(2))];
    merge_variables(&mut stack, vec![FlowVariable::new("x", json!(3))]);

    let names: Vec<&str> = stack.iter().map(|v| v.name.as_str()).collect();
    assert_eq!(names, vec!["y", "x"]);
    assert_eq!(stack[1].value, json!(3));
  }

  #[test]
  fn test_table_spec_only_for_tables() {
    let table = PortValue::Table(Table {
      spec: TableSpec::new("t", &[("a", "int")]),
      rows: vec![vec![json!(1)]],
    });
    assert_eq!(table.table_spec().map(|s| s.name.as_str()), Some("t"));
    assert!(PortValue::Json(json!(null)).table_spec().is_none());
    assert_eq!(table.port_type(), PortTypeDescriptor::table());
  }
}
