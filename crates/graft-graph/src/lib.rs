//! Graft Graph
//!
//! An in-process dataflow graph container: the host that fragments are
//! captured from, pasted into and executed in.
//!
//! # Architecture
//!
//! ```text
//! SandboxRegistry
//! ├── create_project(name, location, on_dispose) -> Workflow
//! ├── load_project(dir, on_dispose, on_warning) -> Workflow
//! └── remove_project(id) - cancels, removes, runs on_dispose
//!
//! Workflow (cheap Clone handle)
//! ├── lock() -> WorkflowLock - add/remove/connect/paste/collapse/settings/scope
//! ├── copy(ids) -> Clipboard
//! ├── execute_all() / execute_up_to(node) - non-blocking
//! ├── is_in_progress() / cancel_all()
//! └── save_to_dir(dir)
//! ```
//!
//! Nodes are either leaves driven by a [`NodeModel`] built from a factory id
//! and JSON settings, or containers holding a nested [`Workflow`].

pub mod builtin;
mod edit;
mod error;
mod execution;
mod model;
mod node;
mod persist;
mod reference;
mod registry;
mod repository;
mod scope;
mod value;
mod workflow;

pub use edit::{Clipboard, CollapseResult, WorkflowLock};
pub use error::GraphError;
pub use model::{NodeContext, NodeFactory, NodeFactoryRegistry, NodeFailure, NodeModel};
pub use node::{
  Connection, EXECUTE_FAILED_PREFIX, MessageStatus, NodeInfo, NodeKind, NodeState, NodeUi,
  StatusMessage,
};
pub use persist::{
  CREATED_BY, ConnectionSnapshot, FORMAT_VERSION, GRAPH_FILE, GraphSnapshot, NodeBodySnapshot,
  NodeSnapshot, WorkflowDump,
};
pub use reference::DataReference;
pub use registry::{OnDispose, SandboxRegistry};
pub use repository::ValueRepository;
pub use scope::{Capability, ScopeContext, resolve_within};
pub use value::{
  ColumnSpec, FlowVariable, PortTypeDescriptor, PortValue, Table, TableSpec, VariableScope,
  merge_variables,
};
pub use workflow::Workflow;

pub use graft_address::NodeId;
