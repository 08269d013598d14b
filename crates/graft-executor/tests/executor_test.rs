//! Integration tests for the isolated and combined executors.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use graft_address::{ConcretePort, NodeId};
use graft_executor::{
  CombinedExecutor, ExecutionError, ExecutionMode, ExecutionRequest, ExecutorConfig,
  ExecutorState, HostNode, IsolatedExecutor, PooledScheduler,
};
use graft_fragment::{BoundaryInput, BoundaryOutput, CaptureRequest, Fragment};
use graft_graph::builtin::{
  self, parameter_settings, reference_of, reference_reader_settings, value_sink_settings,
};
use graft_graph::{DataReference, NodeKind, PortTypeDescriptor, PortValue, SandboxRegistry, Workflow};
use graft_reference::make_portable;
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn config(mode: ExecutionMode) -> ExecutorConfig {
  ExecutorConfig {
    mode,
    poll_interval: Duration::from_millis(10),
    ..Default::default()
  }
}

fn json_port() -> Option<PortTypeDescriptor> {
  Some(PortTypeDescriptor::json())
}

fn capture(
  registry: &SandboxRegistry,
  origin: &Workflow,
  nodes: &[&NodeId],
  inputs: &[ConcretePort],
  output: ConcretePort,
  name: &str,
) -> Fragment {
  let request = CaptureRequest {
    nodes: nodes.iter().map(|node| (*node).clone()).collect(),
    inputs: inputs
      .iter()
      .map(|port| BoundaryInput {
        port_type: json_port(),
        ports: vec![port.clone()],
        ..Default::default()
      })
      .collect(),
    outputs: vec![BoundaryOutput {
      port_type: json_port(),
      port: Some(output),
      ..Default::default()
    }],
    reference_nodes: vec![],
    name: Some(name.to_string()),
  };
  Fragment::capture(registry, origin, request).unwrap()
}

/// a, b -> concat -> identity, captured without the parameters.
fn concat_fragment(registry: &SandboxRegistry) -> Fragment {
  let origin = registry.create_project("origin", None, None);
  let (concat, identity) = {
    let lock = origin.lock();
    let a = lock
      .add_node("A", builtin::PARAMETER, parameter_settings("a", json!([0])))
      .unwrap();
    let b = lock
      .add_node("B", builtin::PARAMETER, parameter_settings("b", json!([0])))
      .unwrap();
    let concat = lock.add_node("Concat", builtin::CONCATENATE, json!({})).unwrap();
    let identity = lock.add_node("Pass", builtin::IDENTITY, json!({})).unwrap();
    lock.connect(&a, 0, &concat, 0).unwrap();
    lock.connect(&b, 0, &concat, 1).unwrap();
    lock.connect(&concat, 0, &identity, 0).unwrap();
    (concat, identity)
  };
  capture(
    registry,
    &origin,
    &[&concat, &identity],
    &[
      ConcretePort::new(concat.clone(), 0),
      ConcretePort::new(concat.clone(), 1),
    ],
    ConcretePort::new(identity.clone(), 0),
    "Concat",
  )
}

/// x -> middle -> identity, captured without the parameter.
fn single_input_fragment(
  registry: &SandboxRegistry,
  factory_id: &str,
  settings: serde_json::Value,
) -> Fragment {
  let origin = registry.create_project("origin", None, None);
  let (middle, identity) = {
    let lock = origin.lock();
    let x = lock
      .add_node("X", builtin::PARAMETER, parameter_settings("x", json!(0)))
      .unwrap();
    let middle = lock.add_node("Middle", factory_id, settings).unwrap();
    let identity = lock.add_node("Pass", builtin::IDENTITY, json!({})).unwrap();
    lock.connect(&x, 0, &middle, 0).unwrap();
    lock.connect(&middle, 0, &identity, 0).unwrap();
    (middle, identity)
  };
  capture(
    registry,
    &origin,
    &[&middle, &identity],
    &[ConcretePort::new(middle.clone(), 0)],
    ConcretePort::new(identity.clone(), 0),
    "Single",
  )
}

#[tokio::test(flavor = "multi_thread")]
async fn test_detached_run_returns_outputs() {
  let registry = SandboxRegistry::new();
  let mut fragment = concat_fragment(&registry);
  let executor = IsolatedExecutor::new(registry.clone(), config(ExecutionMode::Detached), None)
    .unwrap()
    .with_scheduler(Arc::new(PooledScheduler::current(2).unwrap()));

  let result = executor
    .execute(
      &mut fragment,
      vec![PortValue::Json(json!([1])), PortValue::Json(json!([2, 3]))],
      ExecutionRequest::default(),
      CancellationToken::new(),
    )
    .await
    .unwrap();

  assert!(result.is_success());
  assert_eq!(result.outputs, Some(vec![PortValue::Json(json!([1, 2, 3]))]));
  assert!(result.node_messages.is_empty());
  assert_eq!(executor.state(), ExecutorState::Completed);

  let sandbox = executor.workflow().unwrap();
  assert!(sandbox.is_project());
  assert_eq!(sandbox.name(), "Sandbox");

  executor.dispose().await.unwrap();
  assert!(registry.project(sandbox.id()).is_none());
  assert!(registry.repository().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_node_failure_yields_messages_without_outputs() {
  let registry = SandboxRegistry::new();
  let mut fragment =
    single_input_fragment(&registry, builtin::FAIL, json!({ "message": "kaputt" }));
  let executor =
    IsolatedExecutor::new(registry.clone(), config(ExecutionMode::Detached), None).unwrap();

  let result = executor
    .execute(
      &mut fragment,
      vec![PortValue::Json(json!(1))],
      ExecutionRequest::default(),
      CancellationToken::new(),
    )
    .await
    .unwrap();

  assert!(result.outputs.is_none());
  assert_eq!(executor.state(), ExecutorState::Failed);
  let failed: Vec<_> = result
    .node_messages
    .iter()
    .filter(|message| message.name == "Middle")
    .collect();
  assert_eq!(failed.len(), 1);
  assert_eq!(failed[0].text, "Execute failed: kaputt");

  match result.into_success() {
    Err(ExecutionError::ExecutionFailure { summary, .. }) => {
      assert!(summary.starts_with("Graph contains one node with execution failure:"));
      assert!(summary.ends_with(": kaputt"));
    }
    other => panic!("unexpected {:?}", other),
  }
  executor.dispose().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_stops_long_running_fragment() {
  let registry = SandboxRegistry::new();
  let mut fragment = single_input_fragment(&registry, builtin::SLEEP, json!({ "millis": 10_000 }));
  let executor =
    IsolatedExecutor::new(registry.clone(), config(ExecutionMode::Detached), None).unwrap();
  let cancel = CancellationToken::new();

  let canceller = async {
    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();
  };
  let (result, _) = tokio::join!(
    executor.execute(
      &mut fragment,
      vec![PortValue::Json(json!(1))],
      ExecutionRequest::default(),
      cancel.clone(),
    ),
    canceller
  );

  assert!(matches!(result, Err(ExecutionError::Cancelled)));
  assert_eq!(executor.state(), ExecutorState::Cancelled);
  let sandbox = executor.workflow().unwrap();

  executor.dispose().await.unwrap();
  assert_eq!(executor.state(), ExecutorState::Disposed);
  assert!(!sandbox.is_in_progress());
  assert!(registry.project(sandbox.id()).is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_executor_cancel_returns_once_settled() {
  let registry = SandboxRegistry::new();
  let mut fragment = single_input_fragment(&registry, builtin::SLEEP, json!({ "millis": 10_000 }));
  let executor =
    IsolatedExecutor::new(registry.clone(), config(ExecutionMode::Detached), None).unwrap();

  let canceller = async {
    tokio::time::sleep(Duration::from_millis(100)).await;
    executor.cancel().await;
    executor.workflow().unwrap()
  };
  let (result, sandbox) = tokio::join!(
    executor.execute(
      &mut fragment,
      vec![PortValue::Json(json!(1))],
      ExecutionRequest::default(),
      CancellationToken::new(),
    ),
    canceller
  );

  assert!(matches!(result, Err(ExecutionError::Cancelled)));
  assert!(!sandbox.is_in_progress());
  executor.dispose().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dispose_before_execute_is_illegal_and_later_dispose_is_noop() {
  let registry = SandboxRegistry::new();
  let mut fragment = single_input_fragment(&registry, builtin::IDENTITY, json!({}));
  let executor =
    IsolatedExecutor::new(registry.clone(), config(ExecutionMode::Detached), None).unwrap();

  assert!(matches!(
    executor.dispose().await,
    Err(ExecutionError::IllegalState { .. })
  ));

  executor
    .execute(
      &mut fragment,
      vec![PortValue::Json(json!("x"))],
      ExecutionRequest::default(),
      CancellationToken::new(),
    )
    .await
    .unwrap();
  executor.dispose().await.unwrap();
  executor.dispose().await.unwrap();

  let again = executor
    .execute(
      &mut fragment,
      vec![PortValue::Json(json!("x"))],
      ExecutionRequest::default(),
      CancellationToken::new(),
    )
    .await;
  assert!(matches!(again, Err(ExecutionError::IllegalState { .. })));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_input_count_mismatch_leaves_nothing_behind() {
  let registry = SandboxRegistry::new();
  let mut fragment = concat_fragment(&registry);
  let projects = registry.projects().len();
  let executor =
    IsolatedExecutor::new(registry.clone(), config(ExecutionMode::Detached), None).unwrap();

  let err = executor
    .execute(
      &mut fragment,
      vec![PortValue::Json(json!([1]))],
      ExecutionRequest::default(),
      CancellationToken::new(),
    )
    .await
    .unwrap_err();

  assert!(matches!(err, ExecutionError::Preparation { .. }));
  assert_eq!(registry.projects().len(), projects);
  assert!(registry.repository().is_empty());
  assert!(executor.workflow().is_none());
}

/// reader -> identity, with the reader's value written into the fragment.
fn portable_reader_fragment(registry: &SandboxRegistry) -> Fragment {
  let id = registry
    .repository()
    .register(PortValue::Json(json!({"rows": 3})));
  let origin = registry.create_project("origin", None, None);
  let (reader, identity) = {
    let lock = origin.lock();
    let reader = lock
      .add_node(
        "Reader",
        builtin::REFERENCE_READER,
        reference_reader_settings(&DataReference::Repository { id: id.clone() }),
      )
      .unwrap();
    let identity = lock.add_node("Pass", builtin::IDENTITY, json!({})).unwrap();
    lock.connect(&reader, 0, &identity, 0).unwrap();
    (reader, identity)
  };
  let mut fragment = Fragment::capture(
    registry,
    &origin,
    CaptureRequest {
      nodes: vec![reader.clone(), identity.clone()],
      outputs: vec![BoundaryOutput {
        port_type: json_port(),
        port: Some(ConcretePort::new(identity, 0)),
        ..Default::default()
      }],
      reference_nodes: vec![reader],
      name: Some("Portable".to_string()),
      ..Default::default()
    },
  )
  .unwrap();
  make_portable(&mut fragment, registry, &mut |_| {}).unwrap();
  registry.repository().remove(&id);
  fragment
}

fn reader_reference(fragment: &mut Fragment, registry: &SandboxRegistry) -> DataReference {
  let workflow = fragment.load(registry, &mut |_| {}).unwrap();
  let address = fragment.reference_nodes().iter().next().unwrap().clone();
  let node = address.resolve(workflow.id());
  match workflow.node(&node).unwrap().kind {
    NodeKind::Leaf { settings, .. } => reference_of(&settings).unwrap(),
    NodeKind::Container(_) => panic!("{} is a container", node),
  }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_run_keeps_fragment_portable() {
  let registry = SandboxRegistry::new();
  let mut fragment = portable_reader_fragment(&registry);
  assert!(registry.repository().is_empty());

  let executor =
    IsolatedExecutor::new(registry.clone(), config(ExecutionMode::Detached), None).unwrap();
  let result = executor
    .execute(
      &mut fragment,
      vec![],
      ExecutionRequest::default(),
      CancellationToken::new(),
    )
    .await
    .unwrap();
  assert_eq!(result.outputs, Some(vec![PortValue::Json(json!({"rows": 3}))]));
  assert_eq!(registry.repository().len(), 1);

  executor.dispose().await.unwrap();
  assert!(registry.repository().is_empty());
  assert!(matches!(
    reader_reference(&mut fragment, &registry),
    DataReference::File { .. }
  ));

  // a registry in another process would not know any repository id
  let bytes = fragment.to_bytes().unwrap();
  let elsewhere = SandboxRegistry::new();
  let mut shipped = Fragment::read(bytes.as_slice()).unwrap();
  let executor =
    IsolatedExecutor::new(elsewhere.clone(), config(ExecutionMode::Detached), None).unwrap();
  let result = executor
    .execute(
      &mut shipped,
      vec![],
      ExecutionRequest::default(),
      CancellationToken::new(),
    )
    .await
    .unwrap();
  assert_eq!(result.outputs, Some(vec![PortValue::Json(json!({"rows": 3}))]));
  executor.dispose().await.unwrap();
  assert!(elsewhere.repository().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_parameters_override_configuration_nodes() {
  let registry = SandboxRegistry::new();
  let origin = registry.create_project("origin", None, None);
  let (factor, identity) = {
    let lock = origin.lock();
    let factor = lock
      .add_node("Factor", builtin::PARAMETER, parameter_settings("factor", json!(1)))
      .unwrap();
    let identity = lock.add_node("Pass", builtin::IDENTITY, json!({})).unwrap();
    lock.connect(&factor, 0, &identity, 0).unwrap();
    (factor, identity)
  };
  let mut fragment = capture(
    &registry,
    &origin,
    &[&factor, &identity],
    &[],
    ConcretePort::new(identity.clone(), 0),
    "Parameterized",
  );
  let executor =
    IsolatedExecutor::new(registry.clone(), config(ExecutionMode::Detached), None).unwrap();

  let request = ExecutionRequest {
    parameters: BTreeMap::from([("factor".to_string(), json!(7))]),
    ..Default::default()
  };
  let result = executor
    .execute(&mut fragment, vec![], request, CancellationToken::new())
    .await
    .unwrap();

  assert_eq!(result.outputs, Some(vec![PortValue::Json(json!(7))]));
  let factor = result
    .flow_variables
    .iter()
    .find(|variable| variable.name == "factor")
    .unwrap();
  assert_eq!(factor.value, json!(7));
  executor.dispose().await.unwrap();
}

/// zero, one, two -> host (three inputs), fully executed.
async fn executed_host(registry: &SandboxRegistry) -> HostNode {
  let project = registry.create_project("host", None, None);
  let host = {
    let lock = project.lock();
    let host = lock
      .add_node("Host", builtin::VALUE_SINK, value_sink_settings(3))
      .unwrap();
    for (port, name) in ["zero", "one", "two"].into_iter().enumerate() {
      let param = lock
        .add_node(name, builtin::PARAMETER, parameter_settings(name, json!(port)))
        .unwrap();
      lock.connect(&param, 0, &host, port).unwrap();
    }
    host
  };
  project.execute_all().unwrap();
  for _ in 0..500 {
    if !project.is_in_progress() {
      break;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  assert!(project.is_fully_executed());
  HostNode::new(project, host)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_default_mode_uses_hidden_container_and_data_port_variables() {
  let registry = SandboxRegistry::new();
  let host = executed_host(&registry).await;
  let mut fragment = single_input_fragment(&registry, builtin::IDENTITY, json!({}));
  let executor = IsolatedExecutor::new(
    registry.clone(),
    config(ExecutionMode::Default),
    Some(host.clone()),
  )
  .unwrap();

  let result = executor
    .execute(
      &mut fragment,
      vec![PortValue::Json(json!("in"))],
      ExecutionRequest::default(),
      CancellationToken::new(),
    )
    .await
    .unwrap();
  assert_eq!(result.outputs, Some(vec![PortValue::Json(json!("in"))]));

  let names: Vec<&str> = result
    .flow_variables
    .iter()
    .map(|variable| variable.name.as_str())
    .collect();
  assert!(names.contains(&"two"));
  assert!(!names.contains(&"zero"));
  assert!(!names.contains(&"one"));

  let sandbox = executor.workflow().unwrap();
  assert_eq!(sandbox.parent().unwrap().id(), host.workflow.id());
  let info = host.workflow.node(sandbox.id()).unwrap();
  assert_eq!(info.name, "Sandbox");
  assert!(info.ui.hidden);

  executor.dispose().await.unwrap();
  assert!(!host.workflow.contains(sandbox.id()));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_debug_mode_shows_named_container() {
  let registry = SandboxRegistry::new();
  let host = executed_host(&registry).await;
  let mut fragment = single_input_fragment(&registry, builtin::IDENTITY, json!({}));
  let executor = IsolatedExecutor::new(
    registry.clone(),
    config(ExecutionMode::Debug),
    Some(host.clone()),
  )
  .unwrap();

  executor
    .execute(
      &mut fragment,
      vec![PortValue::Json(json!(1))],
      ExecutionRequest::default(),
      CancellationToken::new(),
    )
    .await
    .unwrap();

  let sandbox = executor.workflow().unwrap();
  let info = host.workflow.node(sandbox.id()).unwrap();
  assert_eq!(info.name, "Debug: Sandbox");
  assert!(!info.ui.hidden);
  executor.dispose().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_read_only_host_refuses_sandbox() {
  let registry = SandboxRegistry::new();
  let host = executed_host(&registry).await;
  host.workflow.set_read_only(true);
  let mut fragment = single_input_fragment(&registry, builtin::IDENTITY, json!({}));
  let executor = IsolatedExecutor::new(
    registry.clone(),
    config(ExecutionMode::Default),
    Some(host.clone()),
  )
  .unwrap();

  let err = executor
    .execute(
      &mut fragment,
      vec![PortValue::Json(json!(1))],
      ExecutionRequest::default(),
      CancellationToken::new(),
    )
    .await
    .unwrap_err();
  assert!(matches!(err, ExecutionError::StructuralLock { .. }));
  assert_eq!(host.workflow.nodes().len(), 4);
}

#[test]
fn test_default_mode_without_host_is_invalid() {
  let registry = SandboxRegistry::new();
  let err = IsolatedExecutor::new(registry, config(ExecutionMode::Default), None).unwrap_err();
  assert!(matches!(err, ExecutionError::InvalidConfig { .. }));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_combined_runs_chain_and_track_all_outputs() {
  let registry = SandboxRegistry::new();
  let mut first = concat_fragment(&registry);
  let mut second = concat_fragment(&registry);
  second.set_custom_name(Some("Second".to_string()));

  let executor = CombinedExecutor::with_inputs(
    registry.clone(),
    config(ExecutionMode::Detached),
    None,
    vec![PortValue::Json(json!([1])), PortValue::Json(json!([2]))],
  )
  .unwrap();
  let sources = executor.source_ports().to_vec();
  assert_eq!(sources.len(), 2);

  let one = executor
    .execute(
      &mut first,
      &sources,
      ExecutionRequest::default(),
      CancellationToken::new(),
    )
    .await
    .unwrap();
  assert_eq!(one.result.outputs, Some(vec![PortValue::Json(json!([1, 2]))]));
  assert_eq!(one.output_refs.len(), 1);

  let two = executor
    .execute(
      &mut second,
      &[one.output_refs[0].clone(), sources[0].clone()],
      ExecutionRequest::default(),
      CancellationToken::new(),
    )
    .await
    .unwrap();
  assert_eq!(
    two.result.outputs,
    Some(vec![
      PortValue::Json(json!([1, 2])),
      PortValue::Json(json!([1, 2, 1])),
    ])
  );
  assert_eq!(two.output_refs.len(), 2);
  assert_eq!(two.output_refs[0], one.output_refs[0]);
  assert_ne!(two.unit, one.unit);

  let container = executor.workflow().clone();
  assert_eq!(container.node(&two.unit).unwrap().name, "Second");
  let sinks = container
    .nodes()
    .into_iter()
    .filter(|node| node.factory_id() == Some(builtin::VALUE_SINK))
    .count();
  assert_eq!(sinks, 1);

  executor.dispose(false).await.unwrap();
  executor.dispose(false).await.unwrap();
  assert!(registry.project(container.id()).is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_combined_container_can_be_kept_and_reused() {
  let registry = SandboxRegistry::new();
  let mut first = concat_fragment(&registry);
  let mut second = concat_fragment(&registry);

  let executor = CombinedExecutor::with_inputs(
    registry.clone(),
    config(ExecutionMode::Detached),
    None,
    vec![PortValue::Json(json!(["a"])), PortValue::Json(json!(["b"]))],
  )
  .unwrap();
  let sources = executor.source_ports().to_vec();
  let one = executor
    .execute(
      &mut first,
      &sources,
      ExecutionRequest::default(),
      CancellationToken::new(),
    )
    .await
    .unwrap();
  executor.dispose(true).await.unwrap();
  let container = executor.workflow().clone();
  assert!(registry.project(container.id()).is_some());

  let reused =
    CombinedExecutor::reuse(registry.clone(), config(ExecutionMode::Detached), container).unwrap();
  assert_eq!(reused.source_ports(), sources.as_slice());
  let two = reused
    .execute(
      &mut second,
      &[sources[1].clone(), one.output_refs[0].clone()],
      ExecutionRequest::default(),
      CancellationToken::new(),
    )
    .await
    .unwrap();
  assert_eq!(
    two.result.outputs,
    Some(vec![
      PortValue::Json(json!(["a", "b"])),
      PortValue::Json(json!(["b", "a", "b"])),
    ])
  );
  reused.dispose(false).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_combined_preparation_failure_rolls_back() {
  let registry = SandboxRegistry::new();
  let mut first = concat_fragment(&registry);
  let mut second = concat_fragment(&registry);

  let executor = CombinedExecutor::with_inputs(
    registry.clone(),
    config(ExecutionMode::Detached),
    None,
    vec![PortValue::Json(json!([1])), PortValue::Json(json!([2]))],
  )
  .unwrap();
  let sources = executor.source_ports().to_vec();
  let one = executor
    .execute(
      &mut first,
      &sources,
      ExecutionRequest::default(),
      CancellationToken::new(),
    )
    .await
    .unwrap();
  let container = executor.workflow().clone();
  let before = container.node_ids();

  let err = executor
    .execute(
      &mut second,
      &[sources[0].clone()],
      ExecutionRequest::default(),
      CancellationToken::new(),
    )
    .await
    .unwrap_err();
  assert!(matches!(err, ExecutionError::Preparation { .. }));
  assert_eq!(container.node_ids(), before);

  let two = executor
    .execute(
      &mut second,
      &[one.output_refs[0].clone(), sources[1].clone()],
      ExecutionRequest::default(),
      CancellationToken::new(),
    )
    .await
    .unwrap();
  assert_eq!(two.output_refs.len(), 2);
  assert_eq!(
    two.result.outputs,
    Some(vec![
      PortValue::Json(json!([1, 2])),
      PortValue::Json(json!([1, 2, 2])),
    ])
  );
  executor.dispose(false).await.unwrap();
  assert!(registry.repository().is_empty());
}
