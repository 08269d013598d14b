//! Integration tests for the graph container: structure, execution and persistence.

use std::time::Duration;

use graft_graph::builtin::{self, parameter_settings, value_sink_settings};
use graft_graph::{
  CREATED_BY, ConnectionSnapshot, FORMAT_VERSION, GraphError, GraphSnapshot, MessageStatus,
  NodeBodySnapshot, NodeId, NodeKind, NodeSnapshot, NodeState, NodeUi, PortValue,
  SandboxRegistry, Workflow, WorkflowDump,
};
use serde_json::json;

async fn wait_settled(workflow: &Workflow) {
  for _ in 0..500 {
    if !workflow.is_in_progress() {
      return;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  panic!("workflow {} did not settle", workflow.id());
}

/// parameter -> identity -> sink
fn linear(registry: &SandboxRegistry) -> (Workflow, NodeId, NodeId, NodeId) {
  let project = registry.create_project("linear", None, None);
  let (param, identity, sink) = {
    let lock = project.lock();
    let param = lock
      .add_node("Value", builtin::PARAMETER, parameter_settings("answer", json!(42)))
      .unwrap();
    let identity = lock.add_node("Pass", builtin::IDENTITY, json!({})).unwrap();
    let sink = lock
      .add_node("Out", builtin::VALUE_SINK, value_sink_settings(1))
      .unwrap();
    lock.connect(&param, 0, &identity, 0).unwrap();
    lock.connect(&identity, 0, &sink, 0).unwrap();
    (param, identity, sink)
  };
  (project, param, identity, sink)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_execute_all_runs_every_node() {
  let registry = SandboxRegistry::new();
  let (project, _, _, sink) = linear(&registry);

  project.execute_all().unwrap();
  assert!(project.is_in_progress());
  wait_settled(&project).await;

  assert!(project.is_fully_executed());
  assert_eq!(project.output_value(&sink, 0), Some(PortValue::Json(json!(42))));

  let variables = project.output_variables(&sink);
  assert_eq!(variables.len(), 1);
  assert_eq!(variables[0].name, "answer");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_execute_up_to_leaves_downstream_idle() {
  let registry = SandboxRegistry::new();
  let (project, param, identity, sink) = linear(&registry);

  project.execute_up_to(&identity).unwrap();
  wait_settled(&project).await;

  assert_eq!(project.node_state(&param).unwrap(), NodeState::Executed);
  assert_eq!(project.node_state(&identity).unwrap(), NodeState::Executed);
  assert_eq!(project.node_state(&sink).unwrap(), NodeState::Idle);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failure_sets_error_message_and_blocks_downstream() {
  let registry = SandboxRegistry::new();
  let project = registry.create_project("failing", None, None);
  let (fail, sink) = {
    let lock = project.lock();
    let param = lock
      .add_node("Value", builtin::PARAMETER, parameter_settings("x", json!(1)))
      .unwrap();
    let fail = lock
      .add_node("Boom", builtin::FAIL, json!({"message": "kaputt"}))
      .unwrap();
    let sink = lock
      .add_node("Out", builtin::VALUE_SINK, value_sink_settings(1))
      .unwrap();
    lock.connect(&param, 0, &fail, 0).unwrap();
    lock.connect(&fail, 0, &sink, 0).unwrap();
    (fail, sink)
  };

  project.execute_all().unwrap();
  wait_settled(&project).await;

  let info = project.node(&fail).unwrap();
  assert_eq!(info.state, NodeState::Failed);
  assert_eq!(info.message.status, MessageStatus::Error);
  assert_eq!(info.message.text, "Execute failed: kaputt");
  assert_eq!(project.node_state(&sink).unwrap(), NodeState::Idle);
  assert!(!project.is_in_progress());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_connecting_into_executed_node_resets_downstream() {
  let registry = SandboxRegistry::new();
  let project = registry.create_project("reset", None, None);
  let (a, b, concat, sink) = {
    let lock = project.lock();
    let a = lock
      .add_node("A", builtin::PARAMETER, parameter_settings("a", json!([1])))
      .unwrap();
    let b = lock
      .add_node("B", builtin::PARAMETER, parameter_settings("b", json!([2])))
      .unwrap();
    let concat = lock.add_node("Concat", builtin::CONCATENATE, json!({})).unwrap();
    let sink = lock
      .add_node("Out", builtin::VALUE_SINK, value_sink_settings(1))
      .unwrap();
    lock.connect(&a, 0, &concat, 0).unwrap();
    lock.connect(&concat, 0, &sink, 0).unwrap();
    (a, b, concat, sink)
  };

  project.execute_up_to(&a).unwrap();
  wait_settled(&project).await;
  project.execute_up_to(&b).unwrap();
  wait_settled(&project).await;
  assert_eq!(project.node_state(&a).unwrap(), NodeState::Executed);

  project.lock().connect(&b, 0, &concat, 1).unwrap();
  assert_eq!(project.node_state(&b).unwrap(), NodeState::Executed);
  project.execute_all().unwrap();
  wait_settled(&project).await;
  assert_eq!(project.output_value(&sink, 0), Some(PortValue::Json(json!([1, 2]))));

  project.lock().disconnect(&concat, 1).unwrap();
  assert_eq!(project.node_state(&concat).unwrap(), NodeState::Idle);
  assert_eq!(project.node(&sink).unwrap().message.status, MessageStatus::Reset);
}

#[test]
fn test_connection_validation() {
  let registry = SandboxRegistry::new();
  let (project, param, identity, sink) = linear(&registry);
  let lock = project.lock();

  // input already taken
  assert!(matches!(
    lock.connect(&param, 0, &identity, 0),
    Err(GraphError::InvalidConnection { .. })
  ));
  // no such port
  assert!(lock.connect(&param, 3, &sink, 0).is_err());
  // cycle
  let second = lock.add_node("Again", builtin::IDENTITY, json!({})).unwrap();
  lock.connect(&sink, 0, &second, 0).unwrap();
  lock.disconnect(&identity, 0).unwrap();
  assert!(matches!(
    lock.connect(&second, 0, &identity, 0),
    Err(GraphError::InvalidConnection { .. })
  ));
}

#[test]
fn test_read_only_workflow_refuses_changes() {
  let registry = SandboxRegistry::new();
  let (project, _, identity, _) = linear(&registry);
  project.set_read_only(true);

  assert!(!project.can_modify_structure());
  assert!(matches!(
    project.lock().remove_node(&identity),
    Err(GraphError::ReadOnly { .. })
  ));
  let nested = project.lock().add_container("Nested", 0, 0);
  assert!(nested.is_err());
}

#[test]
fn test_copy_paste_keeps_internal_connections() {
  let registry = SandboxRegistry::new();
  let (source, param, identity, _) = linear(&registry);
  let target = registry.create_project("target", None, None);
  target
    .lock()
    .add_node("Existing", builtin::IDENTITY, json!({}))
    .unwrap();

  let clipboard = source.copy(&[param.clone(), identity.clone()]).unwrap();
  assert_eq!(clipboard.connections.len(), 1);

  let mapping = target.lock().paste(&clipboard).unwrap();
  assert_eq!(mapping.len(), 2);
  let new_param = mapping.get(&param.index().into()).unwrap().clone();
  let new_identity = mapping.get(&identity.index().into()).unwrap().clone();
  assert_eq!(new_param.parent().as_ref(), Some(target.id()));
  assert_eq!(target.incoming(&new_identity)[0].source, new_param);
  assert_eq!(target.nodes().len(), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_collapse_routes_through_boundary_and_executes() {
  let registry = SandboxRegistry::new();
  let (project, param, identity, sink) = linear(&registry);

  let collapsed = project.lock().collapse(&[identity.clone()], "Unit").unwrap();
  assert!(!project.contains(&identity));
  assert_eq!(collapsed.workflow.input_port_count(), 1);
  assert_eq!(collapsed.workflow.output_port_count(), 1);
  assert_eq!(project.incoming(&collapsed.node)[0].source, param);
  assert_eq!(project.incoming(&sink)[0].source, collapsed.node);

  let inner = collapsed.mapping.get(&identity.index().into()).unwrap().clone();
  assert_eq!(collapsed.workflow.incoming(&inner)[0].source, collapsed.node);

  project.execute_all().unwrap();
  wait_settled(&project).await;
  assert_eq!(project.node_state(&collapsed.node).unwrap(), NodeState::Executed);
  assert_eq!(collapsed.workflow.node_state(&inner).unwrap(), NodeState::Executed);
  assert_eq!(project.output_value(&sink, 0), Some(PortValue::Json(json!(42))));

  let info = project.node(&collapsed.node).unwrap();
  assert!(matches!(info.kind, NodeKind::Container(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_all_settles_long_running_node() {
  let registry = SandboxRegistry::new();
  let project = registry.create_project("slow", None, None);
  let sleep = {
    let lock = project.lock();
    let param = lock
      .add_node("Value", builtin::PARAMETER, parameter_settings("x", json!(1)))
      .unwrap();
    let sleep = lock
      .add_node("Wait", builtin::SLEEP, json!({"millis": 60_000}))
      .unwrap();
    lock.connect(&param, 0, &sleep, 0).unwrap();
    sleep
  };

  project.execute_all().unwrap();
  for _ in 0..200 {
    if project.node_state(&sleep).unwrap() == NodeState::Executing {
      break;
    }
    tokio::time::sleep(Duration::from_millis(5)).await;
  }
  project.cancel_all();
  wait_settled(&project).await;

  let info = project.node(&sleep).unwrap();
  assert_eq!(info.state, NodeState::Idle);
  assert_eq!(info.message.status, MessageStatus::Warning);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_save_and_load_round_trip() {
  let registry = SandboxRegistry::new();
  let (project, _, _, _) = linear(&registry);
  let dir = tempfile::tempdir().unwrap();
  project.save_to_dir(dir.path()).unwrap();

  let mut warnings = Vec::new();
  let loaded = registry
    .load_project(dir.path(), None, &mut |w| warnings.push(w))
    .unwrap();
  assert!(warnings.is_empty());
  assert_ne!(loaded.id(), project.id());
  assert_eq!(loaded.snapshot(), project.snapshot());
  assert_eq!(loaded.location(), Some(dir.path()));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_load_unknown_factory_yields_placeholder_and_warning() {
  let dir = tempfile::tempdir().unwrap();
  let dump = WorkflowDump {
    format_version: FORMAT_VERSION,
    created_by: CREATED_BY.to_string(),
    name: "legacy".to_string(),
    graph: GraphSnapshot {
      input_ports: 0,
      output_ports: 0,
      nodes: vec![NodeSnapshot {
        index: 0,
        name: "Vendor Node".to_string(),
        ui: NodeUi::default(),
        body: NodeBodySnapshot::Leaf {
          factory_id: "vendor.unknown".to_string(),
          settings: "{}".to_string(),
          input_count: 0,
          output_count: 1,
        },
      }],
      connections: Vec::<ConnectionSnapshot>::new(),
    },
  };
  dump.write_to(dir.path()).unwrap();

  let registry = SandboxRegistry::new();
  let mut warnings = Vec::new();
  let loaded = registry
    .load_project(dir.path(), None, &mut |w| warnings.push(w))
    .unwrap();
  assert_eq!(warnings.len(), 1);
  assert!(warnings[0].contains("Vendor Node"));

  let node = loaded.node_ids()[0].clone();
  assert_eq!(loaded.node(&node).unwrap().output_count, 1);
  loaded.execute_all().unwrap();
  wait_settled(&loaded).await;
  assert_eq!(loaded.node_state(&node).unwrap(), NodeState::Failed);
}

#[test]
fn test_load_corrupt_dump_fails() {
  let dir = tempfile::tempdir().unwrap();
  std::fs::write(dir.path().join(graft_graph::GRAPH_FILE), b"not a dump").unwrap();
  let registry = SandboxRegistry::new();
  let err = registry.load_project(dir.path(), None, &mut |_| {}).unwrap_err();
  assert!(matches!(err, GraphError::Load { .. }));
  assert!(registry.projects().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_read_file_honours_scope_restrictions() {
  use graft_graph::{Capability, ScopeContext};

  let dir = tempfile::tempdir().unwrap();
  std::fs::write(dir.path().join("value.json"), br#"{"hello": "world"}"#).unwrap();
  let registry = SandboxRegistry::new();
  let project = registry.create_project("files", Some(dir.path().to_path_buf()), None);
  let reader = project
    .lock()
    .add_node("Read", builtin::READ_FILE, json!({"path": "value.json"}))
    .unwrap();

  project.execute_all().unwrap();
  wait_settled(&project).await;
  assert_eq!(
    project.output_value(&reader, 0),
    Some(PortValue::Json(json!({"hello": "world"})))
  );

  let lock = project.lock();
  lock.set_scope(Some(
    ScopeContext::new("host").restrict(Capability::RelativeResourceAccess),
  ));
  lock.set_settings(&reader, json!({"path": "value.json"})).unwrap();
  drop(lock);
  project.execute_all().unwrap();
  wait_settled(&project).await;
  let info = project.node(&reader).unwrap();
  assert_eq!(info.state, NodeState::Failed);
  assert!(info.message.text.contains("restricted"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_apply_parameters_overrides_matching_nodes() {
  let registry = SandboxRegistry::new();
  let (project, param, _, sink) = linear(&registry);

  let parameters = std::collections::BTreeMap::from([
    ("answer".to_string(), json!(7)),
    ("unused".to_string(), json!(0)),
  ]);
  assert_eq!(project.lock().apply_parameters(&parameters).unwrap(), 1);
  let NodeKind::Leaf { settings, .. } = project.node(&param).unwrap().kind else {
    panic!("parameter node is a leaf");
  };
  assert_eq!(settings["value"], json!(7));

  project.execute_all().unwrap();
  wait_settled(&project).await;
  assert_eq!(project.output_value(&sink, 0), Some(PortValue::Json(json!(7))));
}
