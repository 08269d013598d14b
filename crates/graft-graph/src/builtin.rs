//! Built-in node models.
//!
//! The value source and value sink are the adapter nodes executors inject at a
//! fragment's boundary. The reference reader holds a pointer to data kept
//! elsewhere. The remaining models are general purpose nodes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::error::GraphError;
use crate::model::{NodeContext, NodeFactoryRegistry, NodeFailure, NodeModel};
use crate::reference::DataReference;
use crate::scope::{Capability, resolve_within};
use crate::value::{FlowVariable, PortValue, Table, VariableScope};

pub const VALUE_SOURCE: &str = "graft.value_source";
pub const VALUE_SINK: &str = "graft.value_sink";
pub const REFERENCE_READER: &str = "graft.reference_reader";
pub const PARAMETER: &str = "graft.parameter";
pub const IDENTITY: &str = "graft.identity";
pub const CONCATENATE: &str = "graft.concatenate";
pub const SET_VARIABLE: &str = "graft.set_variable";
pub const WARN: &str = "graft.warn";
pub const FAIL: &str = "graft.fail";
pub const SLEEP: &str = "graft.sleep";
pub const READ_FILE: &str = "graft.read_file";

/// Prefix selecting the scope's data area in a `graft.read_file` path.
pub const DATA_AREA_PREFIX: &str = "data://";

pub(crate) fn register_all(registry: &mut NodeFactoryRegistry) {
  registry.register(VALUE_SOURCE, ValueSource::create);
  registry.register(VALUE_SINK, ValueSink::create);
  registry.register(REFERENCE_READER, ReferenceReader::create);
  registry.register(PARAMETER, Parameter::create);
  registry.register(IDENTITY, |_| Ok(Arc::new(Identity)));
  registry.register(CONCATENATE, |_| Ok(Arc::new(Concatenate)));
  registry.register(SET_VARIABLE, SetVariable::create);
  registry.register(WARN, Warn::create);
  registry.register(FAIL, Fail::create);
  registry.register(SLEEP, Sleep::create);
  registry.register(READ_FILE, ReadFile::create);
}

/// Settings of a value source exposing the repository values `values`.
pub fn value_source_settings(values: &[String], variables: &[FlowVariable]) -> serde_json::Value {
  json!({ "values": values, "variables": variables })
}

pub fn value_sink_settings(inputs: usize) -> serde_json::Value {
  json!({ "inputs": inputs })
}

pub fn reference_reader_settings(reference: &DataReference) -> serde_json::Value {
  json!({ "reference": reference })
}

/// Read the reference out of a reference reader's settings.
pub fn reference_of(settings: &serde_json::Value) -> Result<DataReference, GraphError> {
  parse::<ReferenceReaderSettings>(REFERENCE_READER, settings).map(|s| s.reference)
}

pub fn parameter_settings(name: &str, value: serde_json::Value) -> serde_json::Value {
  json!({ "name": name, "value": value })
}

fn parse<T: DeserializeOwned>(
  factory_id: &str,
  settings: &serde_json::Value,
) -> Result<T, GraphError> {
  serde_json::from_value(settings.clone()).map_err(|e| GraphError::InvalidSettings {
    factory_id: factory_id.to_string(),
    message: e.to_string(),
  })
}

fn single(inputs: Vec<Option<PortValue>>) -> Result<PortValue, NodeFailure> {
  inputs
    .into_iter()
    .next()
    .flatten()
    .ok_or_else(|| NodeFailure::new("no input data available"))
}

#[derive(Deserialize)]
struct ValueSourceSettings {
  values: Vec<String>,
  #[serde(default)]
  variables: Vec<FlowVariable>,
}

/// Input adapter: serves values stored in the repository.
struct ValueSource {
  settings: ValueSourceSettings,
}

impl ValueSource {
  fn create(settings: &serde_json::Value) -> Result<Arc<dyn NodeModel>, GraphError> {
    Ok(Arc::new(Self {
      settings: parse(VALUE_SOURCE, settings)?,
    }))
  }
}

#[async_trait]
impl NodeModel for ValueSource {
  fn factory_id(&self) -> &str {
    VALUE_SOURCE
  }

  fn input_count(&self) -> usize {
    0
  }

  fn output_count(&self) -> usize {
    self.settings.values.len()
  }

  async fn execute(
    &self,
    _inputs: Vec<Option<PortValue>>,
    ctx: &mut NodeContext,
  ) -> Result<Vec<PortValue>, NodeFailure> {
    let repository = ctx.registry()?.repository();
    let values = self
      .settings
      .values
      .iter()
      .map(|id| {
        repository
          .get(id)
          .ok_or_else(|| NodeFailure::new(format!("input value '{}' is not available", id)))
      })
      .collect::<Result<Vec<_>, _>>()?;
    for variable in &self.settings.variables {
      ctx.push_variable(variable.clone());
    }
    Ok(values)
  }
}

#[derive(Deserialize)]
struct ValueSinkSettings {
  inputs: usize,
}

/// Output adapter: passes every input through so callers can read it back.
struct ValueSink {
  inputs: usize,
}

impl ValueSink {
  fn create(settings: &serde_json::Value) -> Result<Arc<dyn NodeModel>, GraphError> {
    let settings: ValueSinkSettings = parse(VALUE_SINK, settings)?;
    Ok(Arc::new(Self {
      inputs: settings.inputs,
    }))
  }
}

#[async_trait]
impl NodeModel for ValueSink {
  fn factory_id(&self) -> &str {
    VALUE_SINK
  }

  fn input_count(&self) -> usize {
    self.inputs
  }

  fn output_count(&self) -> usize {
    self.inputs
  }

  async fn execute(
    &self,
    inputs: Vec<Option<PortValue>>,
    _ctx: &mut NodeContext,
  ) -> Result<Vec<PortValue>, NodeFailure> {
    inputs
      .into_iter()
      .enumerate()
      .map(|(i, value)| value.ok_or_else(|| NodeFailure::new(format!("output port {} is not connected", i))))
      .collect()
  }
}

#[derive(Deserialize)]
struct ReferenceReaderSettings {
  reference: DataReference,
}

/// Holds no data itself, only a pointer to a value kept elsewhere.
struct ReferenceReader {
  reference: DataReference,
}

impl ReferenceReader {
  fn create(settings: &serde_json::Value) -> Result<Arc<dyn NodeModel>, GraphError> {
    Ok(Arc::new(Self {
      reference: reference_of(settings)?,
    }))
  }
}

#[async_trait]
impl NodeModel for ReferenceReader {
  fn factory_id(&self) -> &str {
    REFERENCE_READER
  }

  fn input_count(&self) -> usize {
    0
  }

  fn output_count(&self) -> usize {
    1
  }

  async fn execute(
    &self,
    _inputs: Vec<Option<PortValue>>,
    ctx: &mut NodeContext,
  ) -> Result<Vec<PortValue>, NodeFailure> {
    let registry = ctx.registry()?;
    let project_dir = ctx.project_dir();
    let value = registry.resolve_reference(&self.reference, project_dir.as_deref())?;
    Ok(vec![value])
  }
}

#[derive(Deserialize)]
struct ParameterSettings {
  name: String,
  value: serde_json::Value,
}

/// Configuration-capable node: emits its value and exports it as a variable.
struct Parameter {
  settings: ParameterSettings,
}

impl Parameter {
  fn create(settings: &serde_json::Value) -> Result<Arc<dyn NodeModel>, GraphError> {
    Ok(Arc::new(Self {
      settings: parse(PARAMETER, settings)?,
    }))
  }
}

#[async_trait]
impl NodeModel for Parameter {
  fn factory_id(&self) -> &str {
    PARAMETER
  }

  fn input_count(&self) -> usize {
    0
  }

  fn output_count(&self) -> usize {
    1
  }

  fn parameter_name(&self) -> Option<&str> {
    Some(&self.settings.name)
  }

  fn with_parameter(
    &self,
    _settings: &serde_json::Value,
    value: serde_json::Value,
  ) -> Option<serde_json::Value> {
    Some(parameter_settings(&self.settings.name, value))
  }

  async fn execute(
    &self,
    _inputs: Vec<Option<PortValue>>,
    ctx: &mut NodeContext,
  ) -> Result<Vec<PortValue>, NodeFailure> {
    ctx.push_variable(FlowVariable::new(
      self.settings.name.clone(),
      self.settings.value.clone(),
    ));
    Ok(vec![PortValue::Json(self.settings.value.clone())])
  }
}

struct Identity;

#[async_trait]
impl NodeModel for Identity {
  fn factory_id(&self) -> &str {
    IDENTITY
  }

  fn input_count(&self) -> usize {
    1
  }

  fn output_count(&self) -> usize {
    1
  }

  async fn execute(
    &self,
    inputs: Vec<Option<PortValue>>,
    _ctx: &mut NodeContext,
  ) -> Result<Vec<PortValue>, NodeFailure> {
    Ok(vec![single(inputs)?])
  }
}

/// Appends the second input to the first: table rows or JSON arrays.
struct Concatenate;

#[async_trait]
impl NodeModel for Concatenate {
  fn factory_id(&self) -> &str {
    CONCATENATE
  }

  fn input_count(&self) -> usize {
    2
  }

  fn output_count(&self) -> usize {
    1
  }

  async fn execute(
    &self,
    inputs: Vec<Option<PortValue>>,
    _ctx: &mut NodeContext,
  ) -> Result<Vec<PortValue>, NodeFailure> {
    let mut inputs = inputs.into_iter();
    let (Some(Some(first)), Some(Some(second))) = (inputs.next(), inputs.next()) else {
      return Err(NodeFailure::new("both inputs must be connected"));
    };
    let joined = match (first, second) {
      (PortValue::Table(a), PortValue::Table(b)) => {
        if a.spec.columns != b.spec.columns {
          return Err(NodeFailure::new("table columns do not match"));
        }
        let mut rows = a.rows;
        rows.extend(b.rows);
        PortValue::Table(Table { spec: a.spec, rows })
      }
      (PortValue::Json(serde_json::Value::Array(mut a)), PortValue::Json(serde_json::Value::Array(b))) => {
        a.extend(b);
        PortValue::Json(serde_json::Value::Array(a))
      }
      (a, b) => {
        return Err(NodeFailure::new(format!(
          "cannot concatenate {} and {}",
          a.port_type().name,
          b.port_type().name
        )));
      }
    };
    Ok(vec![joined])
  }
}

#[derive(Deserialize)]
struct SetVariableSettings {
  name: String,
  value: serde_json::Value,
  #[serde(default)]
  scope: VariableScope,
}

/// Passes its input through and pushes one flow variable.
struct SetVariable {
  settings: SetVariableSettings,
}

impl SetVariable {
  fn create(settings: &serde_json::Value) -> Result<Arc<dyn NodeModel>, GraphError> {
    Ok(Arc::new(Self {
      settings: parse(SET_VARIABLE, settings)?,
    }))
  }
}

#[async_trait]
impl NodeModel for SetVariable {
  fn factory_id(&self) -> &str {
    SET_VARIABLE
  }

  fn input_count(&self) -> usize {
    1
  }

  fn output_count(&self) -> usize {
    1
  }

  async fn execute(
    &self,
    inputs: Vec<Option<PortValue>>,
    ctx: &mut NodeContext,
  ) -> Result<Vec<PortValue>, NodeFailure> {
    let value = single(inputs)?;
    ctx.push_variable(
      FlowVariable::new(self.settings.name.clone(), self.settings.value.clone())
        .with_scope(self.settings.scope),
    );
    Ok(vec![value])
  }
}

#[derive(Deserialize)]
struct MessageSettings {
  message: String,
  #[serde(default = "default_inputs")]
  inputs: usize,
}

fn default_inputs() -> usize {
  1
}

/// Passes its input through and reports a warning.
struct Warn {
  message: String,
}

impl Warn {
  fn create(settings: &serde_json::Value) -> Result<Arc<dyn NodeModel>, GraphError> {
    let settings: MessageSettings = parse(WARN, settings)?;
    Ok(Arc::new(Self {
      message: settings.message,
    }))
  }
}

#[async_trait]
impl NodeModel for Warn {
  fn factory_id(&self) -> &str {
    WARN
  }

  fn input_count(&self) -> usize {
    1
  }

  fn output_count(&self) -> usize {
    1
  }

  async fn execute(
    &self,
    inputs: Vec<Option<PortValue>>,
    ctx: &mut NodeContext,
  ) -> Result<Vec<PortValue>, NodeFailure> {
    let value = single(inputs)?;
    ctx.set_warning(self.message.clone());
    Ok(vec![value])
  }
}

/// Always fails with the configured message.
struct Fail {
  message: String,
  inputs: usize,
}

impl Fail {
  fn create(settings: &serde_json::Value) -> Result<Arc<dyn NodeModel>, GraphError> {
    let settings: MessageSettings = parse(FAIL, settings)?;
    Ok(Arc::new(Self {
      message: settings.message,
      inputs: settings.inputs,
    }))
  }
}

#[async_trait]
impl NodeModel for Fail {
  fn factory_id(&self) -> &str {
    FAIL
  }

  fn input_count(&self) -> usize {
    self.inputs
  }

  fn output_count(&self) -> usize {
    1
  }

  async fn execute(
    &self,
    _inputs: Vec<Option<PortValue>>,
    _ctx: &mut NodeContext,
  ) -> Result<Vec<PortValue>, NodeFailure> {
    Err(NodeFailure::new(self.message.clone()))
  }
}

#[derive(Deserialize)]
struct SleepSettings {
  millis: u64,
}

/// Waits, then passes its input through. Honours cancellation.
struct Sleep {
  duration: Duration,
}

impl Sleep {
  fn create(settings: &serde_json::Value) -> Result<Arc<dyn NodeModel>, GraphError> {
    let settings: SleepSettings = parse(SLEEP, settings)?;
    Ok(Arc::new(Self {
      duration: Duration::from_millis(settings.millis),
    }))
  }
}

#[async_trait]
impl NodeModel for Sleep {
  fn factory_id(&self) -> &str {
    SLEEP
  }

  fn input_count(&self) -> usize {
    1
  }

  fn output_count(&self) -> usize {
    1
  }

  async fn execute(
    &self,
    inputs: Vec<Option<PortValue>>,
    ctx: &mut NodeContext,
  ) -> Result<Vec<PortValue>, NodeFailure> {
    let value = single(inputs)?;
    tokio::select! {
      _ = tokio::time::sleep(self.duration) => Ok(vec![value]),
      _ = ctx.cancellation().cancelled() => Err(NodeFailure::new("execution canceled")),
    }
  }
}

#[derive(Deserialize)]
struct ReadFileSettings {
  path: String,
}

/// Reads a JSON value file. Relative paths resolve against the project
/// directory, `data://` paths against the scope's data area.
struct ReadFile {
  path: String,
}

impl ReadFile {
  fn create(settings: &serde_json::Value) -> Result<Arc<dyn NodeModel>, GraphError> {
    let settings: ReadFileSettings = parse(READ_FILE, settings)?;
    Ok(Arc::new(Self {
      path: settings.path,
    }))
  }

  fn resolve(&self, ctx: &NodeContext) -> Result<PathBuf, NodeFailure> {
    let scope = ctx.scope();
    let allows = |capability| scope.as_ref().is_none_or(|s| s.allows(capability));

    if let Some(relative) = self.path.strip_prefix(DATA_AREA_PREFIX) {
      if !allows(Capability::DataAreaAccess) {
        return Err(NodeFailure::new("access to the data area is restricted"));
      }
      let data_area = scope
        .as_ref()
        .and_then(|s| s.data_area.clone())
        .ok_or_else(|| NodeFailure::new("no data area available"))?;
      return Ok(resolve_within(&data_area, Path::new(relative))?);
    }

    let path = Path::new(&self.path);
    if path.is_absolute() {
      return Ok(path.to_path_buf());
    }
    if !allows(Capability::RelativeResourceAccess) {
      return Err(NodeFailure::new("relative resource access is restricted"));
    }
    let root = ctx
      .project_dir()
      .ok_or_else(|| NodeFailure::new("workflow has no location to resolve relative paths"))?;
    Ok(resolve_within(&root, path)?)
  }
}

#[async_trait]
impl NodeModel for ReadFile {
  fn factory_id(&self) -> &str {
    READ_FILE
  }

  fn input_count(&self) -> usize {
    0
  }

  fn output_count(&self) -> usize {
    1
  }

  async fn execute(
    &self,
    _inputs: Vec<Option<PortValue>>,
    ctx: &mut NodeContext,
  ) -> Result<Vec<PortValue>, NodeFailure> {
    let path = self.resolve(ctx)?;
    let contents = tokio::fs::read(&path)
      .await
      .map_err(|e| NodeFailure::new(format!("failed to read {}: {}", path.display(), e)))?;
    Ok(vec![decode_value(&contents).map_err(NodeFailure::new)?])
  }
}

/// Decode a value file: a tagged [`PortValue`], or any other JSON document.
pub fn decode_value(contents: &[u8]) -> Result<PortValue, String> {
  let raw: serde_json::Value =
    serde_json::from_slice(contents).map_err(|e| format!("invalid value file: {}", e))?;
  Ok(serde_json::from_value::<PortValue>(raw.clone()).unwrap_or(PortValue::Json(raw)))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_builtins_registered() {
    let registry = NodeFactoryRegistry::with_builtins();
    for id in [
      VALUE_SOURCE,
      VALUE_SINK,
      REFERENCE_READER,
      PARAMETER,
      IDENTITY,
      CONCATENATE,
      SET_VARIABLE,
      WARN,
      FAIL,
      SLEEP,
      READ_FILE,
    ] {
      assert!(registry.contains(id), "{} missing", id);
    }
  }

  #[test]
  fn test_port_counts_follow_settings() {
    let registry = NodeFactoryRegistry::with_builtins();
    let sink = registry.create(VALUE_SINK, &value_sink_settings(3)).unwrap();
    assert_eq!((sink.input_count(), sink.output_count()), (3, 3));

    let source = registry
      .create(VALUE_SOURCE, &value_source_settings(&["a".into(), "b".into()], &[]))
      .unwrap();
    assert_eq!((source.input_count(), source.output_count()), (0, 2));
  }

  #[test]
  fn test_invalid_settings_rejected() {
    let registry = NodeFactoryRegistry::with_builtins();
    let err = registry.create(PARAMETER, &json!({"value": 1})).err().unwrap();
    assert!(matches!(err, GraphError::InvalidSettings { .. }));
  }

  #[test]
  fn test_reference_settings_round_trip() {
    let reference = DataReference::File {
      path: "data/1_abc.json".to_string(),
    };
    let settings = reference_reader_settings(&reference);
    assert_eq!(settings["reference"]["type"], "file");
    assert_eq!(reference_of(&settings).unwrap(), reference);
  }

  #[test]
  fn test_decode_value_accepts_plain_json() {
    assert_eq!(decode_value(b"[1, 2]").unwrap(), PortValue::Json(json!([1, 2])));
    let tagged = serde_json::to_vec(&PortValue::Json(json!("x"))).unwrap();
    assert_eq!(decode_value(&tagged).unwrap(), PortValue::Json(json!("x")));
  }
}
